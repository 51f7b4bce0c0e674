use crate::checksum::Checksum;
use thiserror::Error as ThisError;

/// The number of bytes in a serialized packet header.
pub const HEADER_OCTETS: usize = 9;

/// Set when further fragments of the datagram follow.
pub const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
/// Set when the datagram must not be fragmented.
#[allow(dead_code)]
pub const FLAG_DONT_FRAGMENT: u16 = 0x4000;
/// Bitwise anded with the flags and fragment offset field to extract the
/// offset part, counted in units of 8 bytes.
pub const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

/// The header prefixed to every fragment by the network layer.
///
/// Multi-byte fields are serialized big-endian so the header round-trips
/// byte-identically between instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHeader {
    /// The length of the fragment in bytes, header included.
    pub total_length: u16,
    /// Assigned by the sender to group the fragments of one datagram.
    pub identification: u16,
    /// Control flags and the fragment offset in units of 8 bytes.
    pub flags_fragment_offset: u16,
    /// The next-level protocol carried in the fragment payload.
    pub protocol: u8,
    /// The header checksum.
    pub checksum: u16,
}

impl PacketHeader {
    /// Parses a header from a byte iterator, verifying the stored checksum
    /// against one recomputed with the checksum field zeroed.
    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        let mut next = || -> Result<u8, ParseError> { bytes.next().ok_or(ParseError::HeaderTooShort) };

        let mut checksum = Checksum::new();

        let total_length = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(total_length);

        let identification = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(identification);

        let flags_fragment_offset = u16::from_be_bytes([next()?, next()?]);
        checksum.add_u16(flags_fragment_offset);

        let protocol = next()?;
        checksum.add_u8(protocol, 0);

        let expected_checksum = u16::from_be_bytes([next()?, next()?]);

        let actual_checksum = checksum.finish();
        if actual_checksum != expected_checksum {
            Err(ParseError::Checksum {
                expected: expected_checksum,
                actual: actual_checksum,
            })?
        }

        Ok(Self {
            total_length,
            identification,
            flags_fragment_offset,
            protocol,
            checksum: expected_checksum,
        })
    }

    /// The fragment offset in bytes.
    pub fn fragment_offset_bytes(&self) -> usize {
        (self.flags_fragment_offset & FRAGMENT_OFFSET_MASK) as usize * 8
    }

    /// Whether further fragments of this datagram follow.
    pub fn more_fragments(&self) -> bool {
        self.flags_fragment_offset & FLAG_MORE_FRAGMENTS != 0
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("the packet header is incomplete")]
    HeaderTooShort,
    #[error(
        "the header checksum {expected:#06x} does not match the calculated checksum {actual:#06x}"
    )]
    Checksum { expected: u16, actual: u16 },
}

/// A builder for serialized packet headers.
pub struct PacketHeaderBuilder {
    payload_length: u16,
    identification: u16,
    fragment_offset: u16,
    more_fragments: bool,
    protocol: u8,
}

impl PacketHeaderBuilder {
    /// Creates a new builder for a fragment carrying `payload_length` bytes.
    pub fn new(identification: u16, protocol: u8, payload_length: u16) -> Self {
        Self {
            payload_length,
            identification,
            fragment_offset: 0,
            more_fragments: false,
            protocol,
        }
    }

    /// Sets the fragment offset, in units of 8 bytes.
    pub fn fragment_offset(mut self, fragment_offset: u16) -> Self {
        self.fragment_offset = fragment_offset;
        self
    }

    /// Sets the more-fragments flag.
    pub fn more_fragments(mut self, more_fragments: bool) -> Self {
        self.more_fragments = more_fragments;
        self
    }

    /// Creates a serialized header from the configuration provided.
    pub fn build(self) -> Result<Vec<u8>, HeaderBuildError> {
        let total_length = self
            .payload_length
            .checked_add(HEADER_OCTETS as u16)
            .ok_or(HeaderBuildError::OverlyLongPayload)?;

        if self.fragment_offset > FRAGMENT_OFFSET_MASK {
            Err(HeaderBuildError::OverlyLongFragmentOffset)?
        }
        let mut flags_fragment_offset = self.fragment_offset & FRAGMENT_OFFSET_MASK;
        if self.more_fragments {
            flags_fragment_offset |= FLAG_MORE_FRAGMENTS;
        }

        let mut checksum = Checksum::new();
        checksum.add_u16(total_length);
        checksum.add_u16(self.identification);
        checksum.add_u16(flags_fragment_offset);
        checksum.add_u8(self.protocol, 0);

        let mut out = Vec::with_capacity(HEADER_OCTETS);
        out.extend_from_slice(&total_length.to_be_bytes());
        out.extend_from_slice(&self.identification.to_be_bytes());
        out.extend_from_slice(&flags_fragment_offset.to_be_bytes());
        out.push(self.protocol);
        out.extend_from_slice(&checksum.finish().to_be_bytes());
        Ok(out)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBuildError {
    #[error("the payload is longer than the total length field can hold")]
    OverlyLongPayload,
    #[error("the fragment offset does not fit in the offset field")]
    OverlyLongFragmentOffset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let serial = PacketHeaderBuilder::new(42, 17, 100)
            .fragment_offset(3)
            .more_fragments(true)
            .build()
            .unwrap();
        assert_eq!(serial.len(), HEADER_OCTETS);

        let parsed = PacketHeader::from_bytes(serial.iter().cloned()).unwrap();
        assert_eq!(parsed.total_length, 109);
        assert_eq!(parsed.identification, 42);
        assert_eq!(parsed.fragment_offset_bytes(), 24);
        assert!(parsed.more_fragments());
        assert_eq!(parsed.protocol, 17);
    }

    #[test]
    fn checksum_survives_reverification() {
        // Zeroing the checksum field and recomputing yields the stored value.
        let serial = PacketHeaderBuilder::new(7, 17, 50).build().unwrap();
        let stored = u16::from_be_bytes([serial[7], serial[8]]);

        let mut reverify = Checksum::new();
        let mut zeroed = serial.clone();
        zeroed[7] = 0;
        zeroed[8] = 0;
        reverify.accumulate(&zeroed);
        assert_eq!(reverify.finish(), stored);
    }

    #[test]
    fn rejects_mutated_header() {
        let mut serial = PacketHeaderBuilder::new(9, 17, 25).build().unwrap();
        serial[1] ^= 0x40;
        assert!(matches!(
            PacketHeader::from_bytes(serial.iter().cloned()),
            Err(ParseError::Checksum { .. })
        ));
    }

    #[test]
    fn rejects_short_header() {
        let serial = PacketHeaderBuilder::new(1, 17, 10).build().unwrap();
        assert_eq!(
            PacketHeader::from_bytes(serial[..HEADER_OCTETS - 1].iter().cloned()),
            Err(ParseError::HeaderTooShort)
        );
    }

    #[test]
    fn rejects_out_of_range_offset() {
        let result = PacketHeaderBuilder::new(1, 17, 10)
            .fragment_offset(FRAGMENT_OFFSET_MASK + 1)
            .build();
        assert_eq!(result, Err(HeaderBuildError::OverlyLongFragmentOffset));
    }
}
