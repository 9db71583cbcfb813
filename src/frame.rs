//! Wire framing for the sniffer serial protocol.
//!
//! Every unit exchanged with the device, in either direction, uses the same
//! layout:
//!
//! | Field      | Size | Description |
//! |------------|------|-------------|
//! | `start`    | 1    | Must be [`MESSAGE_START`]. |
//! | `len`      | 1    | `2 + payload length` (covers `cmd` + `payload`). |
//! | `cmd`      | 1    | A [command opcode](cmds). |
//! | `payload`  | n    | Command-specific bytes. |
//! | `checksum` | 1    | Additive checksum over `len` .. end of `payload`. |

use thiserror::Error;

/// Start marker opening every frame on the wire.
pub const MESSAGE_START: u8 = 0x2A;

/// A frame needs at least a start marker, length, opcode, and checksum.
const MIN_FRAME_LEN: usize = 4;

/// Largest payload the one-byte length field can describe.
const MAX_PAYLOAD_LEN: usize = u8::MAX as usize - 2;

/// Command and reply opcodes understood by the sniffer firmware.
///
/// Replies carry the command opcode plus one. `DATA_CAPTURED` is unsolicited.
pub mod cmds {
    pub const RESET_DEVICE: u8 = 0x01;
    pub const REPLY_RESET_DEVICE: u8 = 0x02;
    pub const AQUIRE_STATUS: u8 = 0x05;
    pub const REPLY_AQUIRE_STATUS: u8 = 0x06;
    pub const SET_CHANNEL_CHANNELPAGE: u8 = 0x09;
    pub const REPLY_SET_CHANNEL_CHANNELPAGE: u8 = 0x0A;
    pub const ENABLE_CAPTURE: u8 = 0x0B;
    pub const REPLY_ENABLE_CAPTURE: u8 = 0x0C;
    pub const DISABLE_CAPTURE: u8 = 0x0D;
    pub const REPLY_DISABLE_CAPTURE: u8 = 0x0E;
    pub const SEND_MESSAGE: u8 = 0x11;
    pub const REPLY_SEND_MESSAGE: u8 = 0x12;
    pub const DATA_CAPTURED: u8 = 0x50;
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("payload of {0} bytes does not fit the one-byte length field")]
    PayloadTooLong(usize),
}

/// One validated frame, stripped of framing bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

/// Additive checksum over the covered region of a frame, which runs from the
/// length byte through the last payload byte.
pub fn checksum(covered: &[u8]) -> u8 {
    covered.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Builds an outgoing frame for `command` around `payload`.
pub fn prepare(command: u8, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLong(payload.len()));
    }

    let mut frame = Vec::with_capacity(payload.len() + MIN_FRAME_LEN);
    frame.push(MESSAGE_START);
    frame.push((payload.len() + 2) as u8);
    frame.push(command);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame[1..]));
    Ok(frame)
}

/// Incremental demultiplexer for the raw serial byte stream.
///
/// Serial delivery is arbitrarily chunked: one read may carry a partial
/// frame, exactly one frame, or several coalesced frames. The splitter
/// accumulates bytes across [`push`](Self::push) calls and carves out every
/// complete frame whose checksum validates. Frames failing validation are
/// dropped without notice, as malformed bytes on a live line are expected.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    pending: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes and returns every frame completed by
    /// them, in wire order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.pending.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            if self.pending.len() < MIN_FRAME_LEN {
                break;
            }
            if self.pending[0] != MESSAGE_START {
                // Out of sync; discard and pick up again on the next delivery.
                self.pending.clear();
                break;
            }
            let declared = self.pending[1] as usize;
            if declared < 2 {
                // A length that cannot even cover the opcode is garbage.
                self.pending.clear();
                break;
            }
            let total = declared + 2;
            if self.pending.len() < total {
                // Frame split across deliveries; keep the bytes and wait.
                break;
            }

            let raw: Vec<u8> = self.pending.drain(..total).collect();
            if checksum(&raw[1..total - 1]) == raw[total - 1] {
                frames.push(Frame {
                    command: raw[2],
                    payload: raw[3..total - 1].to_vec(),
                });
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_empty_payload() {
        let encoded = prepare(cmds::AQUIRE_STATUS, &[]).unwrap();
        assert_eq!(encoded, vec![0x2A, 0x02, 0x05, 0x07]);

        let frames = FrameSplitter::new().push(&encoded);
        assert_eq!(
            frames,
            vec![Frame {
                command: cmds::AQUIRE_STATUS,
                payload: vec![],
            }]
        );
    }

    #[test]
    fn round_trip_with_payload() {
        let payload = [0x0F, 0x00];
        let encoded = prepare(cmds::SET_CHANNEL_CHANNELPAGE, &payload).unwrap();

        let frames = FrameSplitter::new().push(&encoded);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, cmds::SET_CHANNEL_CHANNELPAGE);
        assert_eq!(frames[0].payload, payload);
    }

    #[test]
    fn payload_too_long_rejected() {
        assert!(prepare(cmds::SEND_MESSAGE, &[0u8; 254]).is_err());
        assert!(prepare(cmds::SEND_MESSAGE, &[0u8; 253]).is_ok());
    }

    #[test]
    fn coalesced_frames_split_in_order() {
        let mut joined = Vec::new();
        joined.extend(prepare(cmds::RESET_DEVICE, &[]).unwrap());
        joined.extend(prepare(cmds::REPLY_AQUIRE_STATUS, &[0x01]).unwrap());
        joined.extend(prepare(cmds::DATA_CAPTURED, &[0xAA, 0xBB, 0xCC]).unwrap());

        let frames = FrameSplitter::new().push(&joined);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].command, cmds::RESET_DEVICE);
        assert_eq!(frames[1].command, cmds::REPLY_AQUIRE_STATUS);
        assert_eq!(frames[1].payload, vec![0x01]);
        assert_eq!(frames[2].command, cmds::DATA_CAPTURED);
        assert_eq!(frames[2].payload, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn single_bit_flips_yield_no_frame() {
        for encoded in [
            prepare(cmds::AQUIRE_STATUS, &[]).unwrap(),
            prepare(cmds::SET_CHANNEL_CHANNELPAGE, &[0x0F, 0x00]).unwrap(),
        ] {
            // Every bit past the start marker.
            for index in 1..encoded.len() {
                for bit in 0..8 {
                    let mut corrupt = encoded.clone();
                    corrupt[index] ^= 1 << bit;
                    assert!(
                        FrameSplitter::new().push(&corrupt).is_empty(),
                        "bit {bit} of byte {index} produced a frame",
                    );
                }
            }
        }
    }

    #[test]
    fn partial_frame_buffered_until_complete() {
        let encoded = prepare(cmds::REPLY_ENABLE_CAPTURE, &[0x01]).unwrap();
        let (head, tail) = encoded.split_at(2);

        let mut splitter = FrameSplitter::new();
        assert!(splitter.push(head).is_empty());
        let frames = splitter.push(tail);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, cmds::REPLY_ENABLE_CAPTURE);
    }

    #[test]
    fn truncated_buffer_never_yields() {
        // Declared length far beyond the bytes on hand.
        let mut splitter = FrameSplitter::new();
        assert!(splitter.push(&[0x2A, 0xFF, 0x05, 0x00]).is_empty());
    }

    #[test]
    fn garbage_start_resynchronizes_on_next_delivery() {
        let mut splitter = FrameSplitter::new();
        assert!(splitter.push(&[0x00, 0x11, 0x22, 0x33]).is_empty());

        let encoded = prepare(cmds::AQUIRE_STATUS, &[]).unwrap();
        assert_eq!(splitter.push(&encoded).len(), 1);
    }

    #[test]
    fn undersized_length_dropped() {
        let mut splitter = FrameSplitter::new();
        assert!(splitter.push(&[0x2A, 0x00, 0x05, 0x05]).is_empty());
        assert!(splitter.push(&[0x2A, 0x01, 0x05, 0x06]).is_empty());
    }

    #[test]
    fn checksum_wraps_modulo_256() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0x00);
    }
}
