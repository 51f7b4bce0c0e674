use super::header::{PacketHeader, HEADER_OCTETS};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;

/// How long a reassembly may sit without a new fragment before it is
/// discarded.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Datagrams claiming more payload than this are rejected as implausible.
const MAX_DATAGRAM_OCTETS: usize = 66000;

/// Accumulates the fragments of the single in-flight datagram.
///
/// The slot holds at most one assembly at a time. A first fragment always
/// claims the slot, evicting whatever was there, and an assembly that has
/// not seen a fragment within [`REASSEMBLY_TIMEOUT`] is discarded before the
/// next fragment is considered.
#[derive(Debug, Default)]
pub struct Reassembly {
    current: Option<Pending>,
}

/// An in-progress assembly.
#[derive(Debug)]
struct Pending {
    /// Identification of the datagram being assembled.
    id: u16,
    /// Upper-layer protocol of the datagram.
    #[allow(dead_code)]
    protocol: u8,
    /// The full payload size announced by the first fragment.
    total_payload_size: usize,
    /// How many payload bytes have arrived so far.
    received_size: usize,
    /// The payload bytes, `total_payload_size` long. Empty for a zero-size
    /// datagram.
    buffer: Vec<u8>,
    /// When the most recent fragment was accepted.
    last_fragment: Instant,
}

impl Reassembly {
    /// Creates a new, idle reassembly slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits a received fragment. Returns the complete datagram payload
    /// once the assembly finishes; the payload is empty for a zero-size
    /// datagram.
    pub fn receive(
        &mut self,
        header: &PacketHeader,
        fragment: &[u8],
    ) -> Result<Option<Vec<u8>>, ReassemblyError> {
        self.receive_at(header, fragment, Instant::now())
    }

    /// [`Reassembly::receive`] with the clock supplied by the caller.
    pub fn receive_at(
        &mut self,
        header: &PacketHeader,
        fragment: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, ReassemblyError> {
        if let Some(pending) = &self.current {
            if now.duration_since(pending.last_fragment) > REASSEMBLY_TIMEOUT {
                tracing::debug!(id = pending.id, "reassembly timed out, discarding");
                self.current = None;
            }
        }

        if header.fragment_offset_bytes() != 0 {
            return Err(ReassemblyError::UnsupportedOffset(
                header.fragment_offset_bytes(),
            ));
        }

        if let Some(pending) = self.current.take() {
            if pending.id == header.identification {
                tracing::warn!(id = pending.id, "duplicate first fragment, restarting assembly");
            } else {
                tracing::debug!(
                    old = pending.id,
                    new = header.identification,
                    "first fragment for a new datagram, discarding the old assembly"
                );
            }
        }

        if header.more_fragments() {
            return Err(ReassemblyError::FragmentedDatagram(header.identification));
        }

        let total_payload_size = (header.total_length as usize)
            .checked_sub(HEADER_OCTETS)
            .ok_or(ReassemblyError::BadTotalLength(header.total_length))?;
        if total_payload_size > MAX_DATAGRAM_OCTETS {
            return Err(ReassemblyError::ImplausibleLength(total_payload_size));
        }
        if fragment.len() != total_payload_size {
            return Err(ReassemblyError::LengthMismatch {
                announced: total_payload_size,
                actual: fragment.len(),
            });
        }

        let mut pending = Pending {
            id: header.identification,
            protocol: header.protocol,
            total_payload_size,
            received_size: 0,
            buffer: vec![0; total_payload_size],
            last_fragment: now,
        };
        pending.buffer[..fragment.len()].copy_from_slice(fragment);
        pending.received_size = fragment.len();

        if !header.more_fragments() && pending.received_size >= pending.total_payload_size {
            return Ok(Some(pending.buffer));
        }
        self.current = Some(pending);
        Ok(None)
    }

    /// The identification of the datagram currently assembling, if any.
    pub fn assembling(&self) -> Option<u16> {
        self.current.as_ref().map(|pending| pending.id)
    }

    /// Installs an in-progress assembly so eviction and timeout handling can
    /// be exercised without a fragmented sender.
    #[cfg(test)]
    fn install(&mut self, id: u16, total_payload_size: usize, last_fragment: Instant) {
        self.current = Some(Pending {
            id,
            protocol: 17,
            total_payload_size,
            received_size: 0,
            buffer: vec![0; total_payload_size],
            last_fragment,
        });
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("fragment offset {0} is unsupported, only whole datagrams are accepted")]
    UnsupportedOffset(usize),
    #[error("datagram {0} arrived fragmented, which this stack refuses")]
    FragmentedDatagram(u16),
    #[error("total length {0} is shorter than the header")]
    BadTotalLength(u16),
    #[error("announced payload size {0} is implausible")]
    ImplausibleLength(usize),
    #[error("fragment carries {actual} payload bytes but announces {announced}")]
    LengthMismatch { announced: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::header::PacketHeaderBuilder;

    fn first_fragment(id: u16, payload: &[u8], more_fragments: bool) -> PacketHeader {
        let serial = PacketHeaderBuilder::new(id, 17, payload.len() as u16)
            .more_fragments(more_fragments)
            .build()
            .unwrap();
        PacketHeader::from_bytes(serial.iter().cloned()).unwrap()
    }

    #[test]
    fn whole_datagram_completes_immediately() {
        let payload = b"assembled in one piece";
        let header = first_fragment(5, payload, false);
        let mut reassembly = Reassembly::new();
        let complete = reassembly.receive(&header, payload).unwrap();
        assert_eq!(complete.as_deref(), Some(payload.as_slice()));
        assert_eq!(reassembly.assembling(), None);
    }

    #[test]
    fn zero_size_datagram_is_delivered_empty() {
        let header = first_fragment(6, &[], false);
        let mut reassembly = Reassembly::new();
        let complete = reassembly.receive(&header, &[]).unwrap();
        assert_eq!(complete, Some(Vec::new()));
    }

    #[test]
    fn nonzero_offset_is_refused() {
        let serial = PacketHeaderBuilder::new(7, 17, 8)
            .fragment_offset(1)
            .build()
            .unwrap();
        let header = PacketHeader::from_bytes(serial.iter().cloned()).unwrap();
        let mut reassembly = Reassembly::new();
        assert_eq!(
            reassembly.receive(&header, &[0; 8]),
            Err(ReassemblyError::UnsupportedOffset(8))
        );
    }

    #[test]
    fn fragmented_first_fragment_is_refused() {
        let payload = [0u8; 16];
        let header = first_fragment(8, &payload, true);
        let mut reassembly = Reassembly::new();
        assert_eq!(
            reassembly.receive(&header, &payload),
            Err(ReassemblyError::FragmentedDatagram(8))
        );
        assert_eq!(reassembly.assembling(), None);
    }

    #[test]
    fn new_first_fragment_evicts_the_old_assembly() {
        let mut reassembly = Reassembly::new();
        reassembly.install(100, 512, Instant::now());
        assert_eq!(reassembly.assembling(), Some(100));

        // Datagram 200 arrives while 100 is assembling; 200 is the one that
        // completes.
        let payload = b"the newcomer wins";
        let header = first_fragment(200, payload, false);
        let complete = reassembly.receive(&header, payload).unwrap();
        assert_eq!(complete.as_deref(), Some(payload.as_slice()));
        assert_eq!(reassembly.assembling(), None);
    }

    #[test]
    fn stale_assembly_is_discarded_before_processing() {
        let mut reassembly = Reassembly::new();
        let start = Instant::now();
        reassembly.install(100, 512, start);

        let payload = b"after the timeout";
        let header = first_fragment(300, payload, false);
        let later = start + REASSEMBLY_TIMEOUT + Duration::from_secs(1);
        let complete = reassembly.receive_at(&header, payload, later).unwrap();
        assert_eq!(complete.as_deref(), Some(payload.as_slice()));
        assert_eq!(reassembly.assembling(), None);
    }

    #[test]
    fn assembly_within_the_timeout_is_kept() {
        let mut reassembly = Reassembly::new();
        let start = Instant::now();
        reassembly.install(100, 512, start);

        // A refused fragment arriving before the deadline does not disturb
        // the timeout bookkeeping for rejection reasons other than eviction.
        let serial = PacketHeaderBuilder::new(400, 17, 8)
            .fragment_offset(2)
            .build()
            .unwrap();
        let header = PacketHeader::from_bytes(serial.iter().cloned()).unwrap();
        let before_deadline = start + REASSEMBLY_TIMEOUT - Duration::from_secs(1);
        assert!(reassembly
            .receive_at(&header, &[0; 8], before_deadline)
            .is_err());
        assert_eq!(reassembly.assembling(), Some(100));
    }

    #[test]
    fn undersized_total_length_is_rejected() {
        let header = PacketHeader {
            total_length: HEADER_OCTETS as u16 - 1,
            identification: 9,
            flags_fragment_offset: 0,
            protocol: 17,
            checksum: 0,
        };
        let mut reassembly = Reassembly::new();
        assert_eq!(
            reassembly.receive(&header, &[]),
            Err(ReassemblyError::BadTotalLength(HEADER_OCTETS as u16 - 1))
        );
    }

    #[test]
    fn announced_and_actual_lengths_must_agree() {
        let header = first_fragment(10, &[0u8; 16], false);
        let mut reassembly = Reassembly::new();
        assert_eq!(
            reassembly.receive(&header, &[0u8; 12]),
            Err(ReassemblyError::LengthMismatch {
                announced: 16,
                actual: 12
            })
        );
    }
}
