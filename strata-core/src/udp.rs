//! The datagram transport: a fixed 8-byte header carrying ports and a
//! length, prepended on the way down and stripped on the way up.

use thiserror::Error as ThisError;

/// The number of bytes in a segment header.
pub const HEADER_OCTETS: usize = 8;

/// A transport segment header, either parsed or about to be serialized.
///
/// The checksum field is carried for wire-format fidelity but is written as
/// zero and never validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// The source port.
    pub src_port: u16,
    /// The destination port.
    pub dest_port: u16,
    /// The length of the segment in bytes, header included.
    pub length: u16,
    /// The segment checksum. Present but unused.
    #[allow(dead_code)]
    pub checksum: u16,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    #[error("too few bytes to constitute a segment header")]
    HeaderTooShort,
    #[error("the length field {0} is shorter than the header")]
    BadLengthField(u16),
    #[error("the length field {length} exceeds the {actual} bytes received")]
    TruncatedSegment { length: u16, actual: usize },
    #[error("the payload is longer than the length field can hold")]
    OverlyLongPayload,
}

/// Serializes a segment wrapping `payload` with the given ports.
pub fn build_segment(
    payload: &[u8],
    src_port: u16,
    dest_port: u16,
) -> Result<Vec<u8>, SegmentError> {
    let length: u16 = (HEADER_OCTETS + payload.len())
        .try_into()
        .map_err(|_| SegmentError::OverlyLongPayload)?;

    let mut segment = Vec::with_capacity(HEADER_OCTETS + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dest_port.to_be_bytes());
    segment.extend_from_slice(&length.to_be_bytes());
    segment.extend_from_slice(&0u16.to_be_bytes());
    segment.extend_from_slice(payload);
    Ok(segment)
}

/// Parses a segment, returning the header and the payload bytes it frames.
///
/// The payload is the `length - 8` bytes after the header; trailing bytes
/// beyond the length field are ignored.
pub fn parse_segment(segment: &[u8]) -> Result<(SegmentHeader, &[u8]), SegmentError> {
    if segment.len() < HEADER_OCTETS {
        return Err(SegmentError::HeaderTooShort);
    }
    let header = SegmentHeader {
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dest_port: u16::from_be_bytes([segment[2], segment[3]]),
        length: u16::from_be_bytes([segment[4], segment[5]]),
        checksum: u16::from_be_bytes([segment[6], segment[7]]),
    };
    let length = header.length as usize;
    if length < HEADER_OCTETS {
        return Err(SegmentError::BadLengthField(header.length));
    }
    if length > segment.len() {
        return Err(SegmentError::TruncatedSegment {
            length: header.length,
            actual: segment.len(),
        });
    }
    Ok((header, &segment[HEADER_OCTETS..length]))
}
