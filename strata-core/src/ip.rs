//! The IP-like network layer: a 9-byte checksummed header, datagram
//! fragmentation on the send path, and single-slot reassembly on the receive
//! path.

pub mod header;
pub mod reassembly;

pub use header::{HeaderBuildError, PacketHeader, PacketHeaderBuilder, HEADER_OCTETS};
pub use reassembly::{Reassembly, ReassemblyError, REASSEMBLY_TIMEOUT};

use crate::link::MAX_INFO_OCTETS;

/// The data-link protocol number carried by frames holding network packets.
pub const LINK_PROTOCOL: u16 = 0x0800;

/// The upper-layer protocol number for the datagram transport.
pub const UDP_PROTOCOL: u8 = 17;

/// The largest payload one fragment may carry: the frame information budget
/// minus the packet header, rounded down to a whole number of 8-byte offset
/// units.
pub const MAX_FRAGMENT_PAYLOAD: usize = (MAX_INFO_OCTETS - HEADER_OCTETS) & !7;

// The offset-unit rounding must leave room for payload in every fragment.
const _: () = assert!(MAX_FRAGMENT_PAYLOAD > 0 && MAX_FRAGMENT_PAYLOAD % 8 == 0);

/// Splits a transport datagram into serialized fragments, each a packet
/// header followed by a slice of the datagram.
///
/// Fragments carry strictly increasing offsets in 8-byte units and the
/// more-fragments flag on every fragment but the last. A zero-length
/// datagram produces exactly one fragment with no payload.
pub fn fragment_datagram(
    datagram: &[u8],
    identification: u16,
    protocol: u8,
) -> Result<Vec<Vec<u8>>, HeaderBuildError> {
    let mut fragments = Vec::with_capacity(datagram.len() / MAX_FRAGMENT_PAYLOAD + 1);
    let mut sent = 0;
    let mut offset_units = 0u16;
    loop {
        let slice_len = (datagram.len() - sent).min(MAX_FRAGMENT_PAYLOAD);
        let slice = &datagram[sent..sent + slice_len];
        let last = sent + slice_len == datagram.len();

        let header = PacketHeaderBuilder::new(identification, protocol, slice_len as u16)
            .fragment_offset(offset_units)
            .more_fragments(!last)
            .build()?;

        let mut fragment = Vec::with_capacity(HEADER_OCTETS + slice_len);
        fragment.extend_from_slice(&header);
        fragment.extend_from_slice(slice);
        fragments.push(fragment);

        sent += slice_len;
        offset_units += (slice_len / 8) as u16;
        if sent >= datagram.len() {
            break;
        }
    }
    Ok(fragments)
}
