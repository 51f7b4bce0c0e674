//! Byte-stuffed framing for the data-link layer.
//!
//! A frame on the wire is `FLAG, stuffed(content), FLAG` where the content is
//! the upper-layer protocol number in big-endian, the information bytes, and
//! a single additive checksum byte. Stuffing replaces any `FLAG` or `ESC`
//! occurring inside the content with `ESC` followed by the byte XORed with
//! [`XOR`].

use thiserror::Error as ThisError;

/// Delimits a frame on the wire.
pub const FLAG: u8 = 0x7e;
/// Introduces a stuffed byte inside a frame.
pub const ESC: u8 = 0x7d;
/// XORed onto a stuffed byte to take it out of the reserved range.
pub const XOR: u8 = 0x20;

/// The maximum number of information bytes a frame may carry.
pub const MAX_INFO_OCTETS: usize = 1500;
/// The number of bytes in the protocol field.
const PROTOCOL_OCTETS: usize = 2;
/// The number of bytes in the frame checksum.
const CHECKSUM_OCTETS: usize = 1;
/// The maximum number of content bytes between the flags, before stuffing.
pub const MAX_CONTENT_OCTETS: usize = PROTOCOL_OCTETS + MAX_INFO_OCTETS + CHECKSUM_OCTETS;
/// The maximum size of a stuffed frame including both flags.
const MAX_STUFFED_OCTETS: usize = MAX_CONTENT_OCTETS * 2 + 2;

/// The additive checksum over the frame content before the checksum byte.
fn content_checksum(content: &[u8]) -> u8 {
    content.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_INFO_OCTETS} byte frame limit")]
    OversizedPayload(usize),
    #[error("stuffed frame would exceed {MAX_STUFFED_OCTETS} bytes")]
    OversizedFrame,
}

/// Builds the stuffed wire form of a frame carrying `payload` for the given
/// upper-layer protocol.
pub fn build_frame(protocol: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_INFO_OCTETS {
        return Err(FrameError::OversizedPayload(payload.len()));
    }

    let mut content = Vec::with_capacity(PROTOCOL_OCTETS + payload.len() + CHECKSUM_OCTETS);
    content.extend_from_slice(&protocol.to_be_bytes());
    content.extend_from_slice(payload);
    content.push(content_checksum(&content));

    let mut frame = Vec::with_capacity(content.len() + 2);
    frame.push(FLAG);
    for byte in content {
        if byte == FLAG || byte == ESC {
            frame.push(ESC);
            frame.push(byte ^ XOR);
        } else {
            frame.push(byte);
        }
    }
    frame.push(FLAG);

    // Unreachable for a legal payload, but the arithmetic above is checked
    // rather than assumed.
    if frame.len() > MAX_STUFFED_OCTETS {
        return Err(FrameError::OversizedFrame);
    }
    Ok(frame)
}

/// Where the destuffer is in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between frames. Bytes other than a flag are ignored, which covers the
    /// unused tail of a mailbox block.
    Outside,
    /// Inside a frame, accumulating content bytes.
    Inside,
    /// Inside a frame, immediately after an escape byte.
    Escaped,
}

/// Extracts the network PDUs from one raw wire block.
///
/// Each well-formed frame found in the block yields its content minus the
/// trailing checksum byte, which is the protocol field followed by the
/// information bytes. Frames with a bad escape sequence, overlong content, a
/// checksum mismatch, or too little content to hold a protocol field and
/// checksum are discarded. A frame still open at the end of the block is
/// dropped; frames do not span blocks.
pub fn extract_frames(block: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut state = State::Outside;
    let mut content: Vec<u8> = Vec::new();

    for &byte in block {
        match state {
            State::Outside => {
                if byte == FLAG {
                    content.clear();
                    state = State::Inside;
                }
            }
            State::Inside => match byte {
                FLAG => {
                    if let Some(pdu) = close_frame(&content) {
                        frames.push(pdu);
                    }
                    state = State::Outside;
                }
                ESC => state = State::Escaped,
                _ => {
                    if content.len() >= MAX_CONTENT_OCTETS {
                        tracing::debug!("frame content overflow, discarding frame");
                        state = State::Outside;
                    } else {
                        content.push(byte);
                    }
                }
            },
            State::Escaped => {
                let unescaped = match byte {
                    b if b == ESC ^ XOR => Some(ESC),
                    b if b == FLAG ^ XOR => Some(FLAG),
                    _ => None,
                };
                match unescaped {
                    Some(raw) if content.len() < MAX_CONTENT_OCTETS => {
                        content.push(raw);
                        state = State::Inside;
                    }
                    Some(_) => {
                        tracing::debug!("frame content overflow, discarding frame");
                        state = State::Outside;
                    }
                    None => {
                        tracing::debug!(byte, "invalid byte after escape, discarding frame");
                        state = State::Outside;
                    }
                }
            }
        }
    }

    if state != State::Outside {
        tracing::debug!("block ended inside a frame, dropping partial frame");
    }
    frames
}

/// Validates a completed frame's content and returns the network PDU.
fn close_frame(content: &[u8]) -> Option<Vec<u8>> {
    if content.len() < PROTOCOL_OCTETS + CHECKSUM_OCTETS {
        tracing::debug!(len = content.len(), "frame content too short, discarding");
        return None;
    }
    let (body, stored) = content.split_at(content.len() - CHECKSUM_OCTETS);
    let computed = content_checksum(body);
    if stored[0] != computed {
        tracing::debug!(stored = stored[0], computed, "frame checksum mismatch, discarding");
        return None;
    }
    Some(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = b"hello";
        let frame = build_frame(0x0800, payload).unwrap();
        assert_eq!(*frame.first().unwrap(), FLAG);
        assert_eq!(*frame.last().unwrap(), FLAG);

        let frames = extract_frames(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..2], &[0x08, 0x00]);
        assert_eq!(&frames[0][2..], payload);
    }

    #[test]
    fn reserved_bytes_are_stuffed_and_recovered() {
        let payload = [FLAG, ESC, FLAG];
        let frame = build_frame(0x0800, &payload).unwrap();
        // No unescaped flag or escape byte may appear between the delimiters.
        assert!(!frame[1..frame.len() - 1]
            .iter()
            .any(|&b| b == FLAG));
        let frames = extract_frames(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][2..], &payload);
    }

    #[test]
    fn content_length_accounting() {
        // Content is protocol + payload + checksum.
        let frame = build_frame(17, b"hello").unwrap();
        let frames = extract_frames(&frame);
        assert_eq!(frames[0].len(), 2 + 5);
    }

    #[test]
    fn rejects_oversized_payload() {
        let payload = vec![0u8; MAX_INFO_OCTETS + 1];
        assert_eq!(
            build_frame(0x0800, &payload),
            Err(FrameError::OversizedPayload(MAX_INFO_OCTETS + 1))
        );
        assert!(build_frame(0x0800, &vec![0u8; MAX_INFO_OCTETS]).is_ok());
    }

    #[test]
    fn corrupted_byte_is_dropped() {
        let mut frame = build_frame(0x0800, b"hello").unwrap();
        // Flip a bit in the info region, avoiding the delimiters.
        frame[4] ^= 0x01;
        assert!(extract_frames(&frame).is_empty());
    }

    #[test]
    fn short_frame_is_dropped() {
        // Flag, two content bytes, flag: too short for protocol + checksum.
        assert!(extract_frames(&[FLAG, 0x01, 0x02, FLAG]).is_empty());
        assert!(extract_frames(&[FLAG, FLAG]).is_empty());
    }

    #[test]
    fn invalid_escape_discards_frame() {
        let block = [FLAG, 0x08, 0x00, ESC, 0x42, FLAG];
        assert!(extract_frames(&block).is_empty());
    }

    #[test]
    fn bytes_outside_frames_are_ignored() {
        let frame = build_frame(0x0800, b"hi").unwrap();
        let mut block = vec![0xaa, 0xbb, 0x00];
        block.extend_from_slice(&frame);
        block.extend_from_slice(&[0x00, 0x00, 0xcc]);
        let frames = extract_frames(&block);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][2..], b"hi");
    }

    #[test]
    fn partial_frame_at_end_of_block_is_dropped() {
        let mut block = vec![FLAG, 0x08, 0x00, b'x'];
        assert!(extract_frames(&block).is_empty());
        // The next block does not resume the frame.
        block.clear();
        block.extend_from_slice(&[b'y', 0x00, FLAG]);
        assert!(extract_frames(&block).is_empty());
    }

    #[test]
    fn multiple_frames_in_one_block() {
        let mut block = build_frame(0x0800, b"one").unwrap();
        block.extend_from_slice(&build_frame(0x0800, b"two").unwrap());
        let frames = extract_frames(&block);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][2..], b"one");
        assert_eq!(&frames[1][2..], b"two");
    }

    #[test]
    fn empty_payload_frame_round_trips() {
        let frame = build_frame(0x0800, &[]).unwrap();
        let frames = extract_frames(&frame);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![0x08, 0x00]);
    }
}
