//! Frame parser for the scooter serial protocol
//!
//! Frames arrive split across BLE notifications (typically 20 bytes each),
//! so the parser buffers input and emits every complete frame it can find.
//!
//! # Frame layouts
//!
//! ```text
//! Ninebot: 5A A5 | len | src | dst | cmd | arg | payload[len]   | ck_lo ck_hi
//! Xiaomi:  55 AA | len | dst | cmd | arg | payload[len - 2]     | ck_lo ck_hi
//! ```
//!
//! The checksum is the one's complement of the 16-bit sum of every byte
//! between the header and the checksum, little-endian. A frame with a bad
//! checksum is skipped by resynchronising on the next header.

use bytes::Bytes;
use tracing::trace;

use crate::error::{Result, SessionError};
use crate::model::ProtocolVariant;

/// Ninebot frame header
pub const NINEBOT_HEADER: [u8; 2] = [0x5A, 0xA5];

/// Xiaomi frame header
pub const XIAOMI_HEADER: [u8; 2] = [0x55, 0xAA];

/// Largest payload a Ninebot frame can carry
pub const MAX_NINEBOT_PAYLOAD: usize = u8::MAX as usize;

/// Largest payload a Xiaomi frame can carry
pub const MAX_XIAOMI_PAYLOAD: usize = u8::MAX as usize - 2;

/// One decoded protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScooterFrame {
    /// Sender address (Ninebot framing only)
    pub source: Option<u8>,
    /// Receiver address
    pub destination: u8,
    /// Command byte
    pub command: u8,
    /// Argument / register byte
    pub argument: u8,
    /// Payload
    pub payload: Bytes,
}

impl ScooterFrame {
    /// Create a Ninebot-framed message
    pub fn ninebot(source: u8, destination: u8, command: u8, argument: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            source: Some(source),
            destination,
            command,
            argument,
            payload: payload.into(),
        }
    }

    /// Create a Xiaomi-framed message
    pub fn xiaomi(destination: u8, command: u8, argument: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            source: None,
            destination,
            command,
            argument,
            payload: payload.into(),
        }
    }

    /// Encode with the framing of `variant`
    ///
    /// Ninebot framing needs a source address; frames built with
    /// [`ScooterFrame::xiaomi`] use `0x3E` (the app address) when encoded
    /// for Ninebot.
    pub fn encode(&self, variant: ProtocolVariant) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.payload.len() + 9);
        if variant.is_ninebot() {
            if self.payload.len() > MAX_NINEBOT_PAYLOAD {
                return Err(SessionError::FrameTooLarge {
                    size: self.payload.len(),
                    max: MAX_NINEBOT_PAYLOAD,
                });
            }
            out.extend_from_slice(&NINEBOT_HEADER);
            out.push(self.payload.len() as u8);
            out.push(self.source.unwrap_or(0x3E));
        } else {
            if self.payload.len() > MAX_XIAOMI_PAYLOAD {
                return Err(SessionError::FrameTooLarge {
                    size: self.payload.len(),
                    max: MAX_XIAOMI_PAYLOAD,
                });
            }
            out.extend_from_slice(&XIAOMI_HEADER);
            out.push(self.payload.len() as u8 + 2);
        }
        out.push(self.destination);
        out.push(self.command);
        out.push(self.argument);
        out.extend_from_slice(&self.payload);

        let ck = checksum(&out[2..]);
        out.extend_from_slice(&ck.to_le_bytes());
        Ok(out)
    }
}

fn checksum(body: &[u8]) -> u16 {
    let sum = body.iter().fold(0u32, |acc, b| acc + u32::from(*b));
    (sum as u16) ^ 0xFFFF
}

/// Decodes authenticated, decrypted byte chunks into frames
pub trait MessageParser: Send {
    /// Feed one chunk; returns every frame completed by it
    fn parse(&mut self, data: &[u8]) -> Vec<ScooterFrame>;
}

/// Parser for both Ninebot and Xiaomi framing
#[derive(Debug)]
pub struct NinebotFrameParser {
    ninebot: bool,
    buffer: Vec<u8>,
    /// Frames dropped for a bad checksum
    rejected: u64,
}

impl NinebotFrameParser {
    /// Create a parser for the framing of `variant`
    pub fn for_variant(variant: ProtocolVariant) -> Self {
        Self {
            ninebot: variant.is_ninebot(),
            buffer: Vec::new(),
            rejected: 0,
        }
    }

    /// Number of frames dropped for a bad checksum
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Bytes buffered waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn header(&self) -> [u8; 2] {
        if self.ninebot {
            NINEBOT_HEADER
        } else {
            XIAOMI_HEADER
        }
    }

    fn frame_len(&self, len_field: u8) -> Option<usize> {
        let len = len_field as usize;
        if self.ninebot {
            Some(len + 9)
        } else if len >= 2 {
            Some(len + 6)
        } else {
            None
        }
    }

    fn decode(&self, frame: &[u8]) -> ScooterFrame {
        // frame includes header and checksum
        let body = &frame[..frame.len() - 2];
        if self.ninebot {
            ScooterFrame {
                source: Some(body[3]),
                destination: body[4],
                command: body[5],
                argument: body[6],
                payload: Bytes::copy_from_slice(&body[7..]),
            }
        } else {
            ScooterFrame {
                source: None,
                destination: body[3],
                command: body[4],
                argument: body[5],
                payload: Bytes::copy_from_slice(&body[6..]),
            }
        }
    }
}

impl MessageParser for NinebotFrameParser {
    fn parse(&mut self, data: &[u8]) -> Vec<ScooterFrame> {
        self.buffer.extend_from_slice(data);
        let header = self.header();
        let mut frames = Vec::new();

        loop {
            let Some(start) = self.buffer.windows(2).position(|w| w == header) else {
                // Keep a trailing first header byte; the second may be next
                let keep = self.buffer.last() == Some(&header[0]);
                self.buffer.clear();
                if keep {
                    self.buffer.push(header[0]);
                }
                break;
            };
            if start > 0 {
                trace!(skipped = start, "Skipping bytes before frame header");
                self.buffer.drain(..start);
            }
            if self.buffer.len() < 3 {
                break;
            }

            let Some(total) = self.frame_len(self.buffer[2]) else {
                self.rejected += 1;
                self.buffer.drain(..1);
                continue;
            };
            if self.buffer.len() < total {
                break;
            }

            let expected = checksum(&self.buffer[2..total - 2]);
            let actual = u16::from_le_bytes([self.buffer[total - 2], self.buffer[total - 1]]);
            if expected != actual {
                trace!(expected, actual, "Frame checksum mismatch, resyncing");
                self.rejected += 1;
                self.buffer.drain(..1);
                continue;
            }

            frames.push(self.decode(&self.buffer[..total]));
            self.buffer.drain(..total);
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NINEBOT: ProtocolVariant = ProtocolVariant::Ninebot { encrypted: false };
    const XIAOMI: ProtocolVariant = ProtocolVariant::Xiaomi { encrypted: false };

    #[test]
    fn test_known_ninebot_frame() {
        // Read serial number: 5A A5 01 3E 20 01 10 0E + checksum
        let frame = ScooterFrame::ninebot(0x3E, 0x20, 0x01, 0x10, vec![0x0E]);
        let encoded = frame.encode(NINEBOT).unwrap();
        assert_eq!(&encoded[..8], &[0x5A, 0xA5, 0x01, 0x3E, 0x20, 0x01, 0x10, 0x0E]);
        // sum = 0x01+0x3E+0x20+0x01+0x10+0x0E = 0x7E
        assert_eq!(&encoded[8..], &[0x81, 0xFF]);
    }

    #[test]
    fn test_known_xiaomi_frame() {
        // 55 AA 03 20 01 10 0E + checksum
        let frame = ScooterFrame::xiaomi(0x20, 0x01, 0x10, vec![0x0E]);
        let encoded = frame.encode(XIAOMI).unwrap();
        assert_eq!(&encoded[..7], &[0x55, 0xAA, 0x03, 0x20, 0x01, 0x10, 0x0E]);
        // sum = 0x03+0x20+0x01+0x10+0x0E = 0x42
        assert_eq!(&encoded[7..], &[0xBD, 0xFF]);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let frame = ScooterFrame::ninebot(0x23, 0x3E, 0x04, 0xB0, vec![0u8; 24]);
        let encoded = frame.encode(NINEBOT).unwrap();

        let mut parser = NinebotFrameParser::for_variant(NINEBOT);
        let mut frames = Vec::new();
        for chunk in encoded.chunks(20) {
            frames.extend(parser.parse(chunk));
        }
        assert_eq!(frames, vec![frame]);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_two_frames_in_one_chunk_with_noise() {
        let a = ScooterFrame::xiaomi(0x23, 0x01, 0x1A, vec![0x10, 0x01]);
        let b = ScooterFrame::xiaomi(0x23, 0x01, 0x22, vec![]);
        let mut data = vec![0x00, 0x13];
        data.extend(a.encode(XIAOMI).unwrap());
        data.extend(b.encode(XIAOMI).unwrap());

        let mut parser = NinebotFrameParser::for_variant(XIAOMI);
        assert_eq!(parser.parse(&data), vec![a, b]);
    }

    #[test]
    fn test_bad_checksum_is_skipped() {
        let good = ScooterFrame::ninebot(0x23, 0x3E, 0x04, 0x10, vec![1, 2, 3]);
        let mut corrupt = good.encode(NINEBOT).unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        let mut data = corrupt;
        data.extend(good.encode(NINEBOT).unwrap());

        let mut parser = NinebotFrameParser::for_variant(NINEBOT);
        assert_eq!(parser.parse(&data), vec![good]);
        assert_eq!(parser.rejected(), 1);
    }

    #[test]
    fn test_split_header_byte_is_kept() {
        let frame = ScooterFrame::ninebot(0x23, 0x3E, 0x04, 0x10, vec![9]);
        let encoded = frame.encode(NINEBOT).unwrap();

        let mut parser = NinebotFrameParser::for_variant(NINEBOT);
        assert!(parser.parse(&[0x77, encoded[0]]).is_empty());
        assert_eq!(parser.parse(&encoded[1..]), vec![frame]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = ScooterFrame::xiaomi(0x20, 0x03, 0x00, vec![0u8; 254]);
        let err = frame.encode(XIAOMI).unwrap_err();
        assert!(err.is_protocol_error());
        assert!(frame.encode(NINEBOT).is_ok());
    }
}
