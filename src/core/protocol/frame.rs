//! Frame construction and parsing for the GM3 protocol.
//!
//! Wire layout:
//!
//! ```text
//! [BEGIN][LEN_L][LEN_H][DA_L][DA_H][SA_L][SA_H][CMD][DATA...][CRC_H][CRC_L][END]
//! ```
//!
//! `LEN` is the total frame length minus 6. Source addresses are 16-bit
//! little-endian, confirmed by hardware capture (older firmware documentation
//! shows an 8-bit SA plus a reserved byte; that reading is wrong). The CRC
//! covers everything between the BEGIN marker and the CRC itself and is
//! stored big-endian.

use thiserror::Error;

use super::constants::{
    BEGIN_FRAME, Command, END_FRAME, FRAME_BASE_LEN, FRAME_MIN_LEN,
};
use super::crc::calculate_crc16;

/// Frame-level decode errors. Local to the parser: the transport discards
/// the offending bytes and resumes sync.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes")]
    FrameTooShort { len: usize },

    #[error("bad frame marker")]
    BadMarker,

    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    BadCrc { expected: u16, actual: u16 },
}

/// A parsed GM3 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination address (16-bit)
    pub destination: u16,
    /// Source address (16-bit)
    pub source: u16,
    /// Command byte
    pub command: u8,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(destination: u16, source: u16, command: u8, payload: Vec<u8>) -> Self {
        Self {
            destination,
            source,
            command,
            payload,
        }
    }

    /// Serialise the frame for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let length = FRAME_BASE_LEN + self.payload.len() as u16;
        let mut out = Vec::with_capacity(usize::from(length) + 6);

        out.push(BEGIN_FRAME);
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&self.destination.to_le_bytes());
        out.extend_from_slice(&self.source.to_le_bytes());
        out.push(self.command);
        out.extend_from_slice(&self.payload);

        // CRC over LEN through last payload byte, stored big-endian.
        let crc = calculate_crc16(&out[1..]);
        out.extend_from_slice(&crc.to_be_bytes());
        out.push(END_FRAME);

        out
    }

    /// Parse a frame from a complete byte string.
    pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
        if data.len() < FRAME_MIN_LEN {
            return Err(FrameError::FrameTooShort { len: data.len() });
        }

        if data[0] != BEGIN_FRAME || data[data.len() - 1] != END_FRAME {
            return Err(FrameError::BadMarker);
        }

        let declared = usize::from(u16::from_le_bytes([data[1], data[2]]));
        if declared < usize::from(FRAME_BASE_LEN) || declared + 6 != data.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: data.len().saturating_sub(6),
            });
        }

        let crc_end = data.len() - 3;
        let expected = u16::from_be_bytes([data[crc_end], data[crc_end + 1]]);
        let actual = calculate_crc16(&data[1..crc_end]);
        if expected != actual {
            return Err(FrameError::BadCrc { expected, actual });
        }

        Ok(Frame {
            destination: u16::from_le_bytes([data[3], data[4]]),
            source: u16::from_le_bytes([data[5], data[6]]),
            command: data[7],
            payload: data[8..crc_end].to_vec(),
        })
    }

    /// For SERVICE frames, the 16-bit LE sub-function at payload offset 0.
    pub fn service_function(&self) -> Option<u16> {
        if self.command != Command::Service.code() || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_le_bytes([self.payload[0], self.payload[1]]))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Frame(dst={}, src={}, cmd=0x{:02X}, len={})",
            self.destination,
            self.source,
            self.command,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::constants::ServiceFunction;

    #[test]
    fn encode_known_frame() {
        // GET_PARAMS for one parameter starting at wire index 100.
        let frame = Frame::new(0x0001, 0x0083, 0x40, vec![0x64, 0x00, 0x01, 0x00]);
        let bytes = frame.encode();
        assert_eq!(
            bytes,
            [
                0x68, 0x09, 0x00, 0x01, 0x00, 0x83, 0x00, 0x40, 0x64, 0x00, 0x01, 0x00, 0x53,
                0xE5, 0x16
            ]
        );
    }

    #[test]
    fn decode_known_frame() {
        let bytes = [
            0x68, 0x09, 0x00, 0x01, 0x00, 0x83, 0x00, 0x40, 0x64, 0x00, 0x01, 0x00, 0x53, 0xE5,
            0x16,
        ];
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.destination, 0x0001);
        assert_eq!(frame.source, 0x0083);
        assert_eq!(frame.command, 0x40);
        assert_eq!(frame.payload, vec![0x64, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn round_trip_various_payloads() {
        let cases = [
            (0x0001u16, 0x0084u16, 0x02u8, vec![0x64u8, 0x00, 0x00]),
            (100, 132, 0x89, super::super::constants::IDENTIFY_RESPONSE_DATA.to_vec()),
            (0xFFFF, 0x0083, 0x00, vec![]),
            (237, 131, 0x29, vec![0x67, 0x00, 0x2F]),
        ];
        for (dst, src, cmd, payload) in cases {
            let frame = Frame::new(dst, src, cmd, payload);
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn decode_too_short() {
        let err = Frame::decode(&[0x68, 0x05, 0x00]).unwrap_err();
        assert_eq!(err, FrameError::FrameTooShort { len: 3 });
    }

    #[test]
    fn decode_bad_markers() {
        let mut bytes = Frame::new(1, 131, 0x00, vec![]).encode();
        bytes[0] = 0x67;
        assert_eq!(Frame::decode(&bytes).unwrap_err(), FrameError::BadMarker);

        let mut bytes = Frame::new(1, 131, 0x00, vec![]).encode();
        let last = bytes.len() - 1;
        bytes[last] = 0x17;
        assert_eq!(Frame::decode(&bytes).unwrap_err(), FrameError::BadMarker);
    }

    #[test]
    fn decode_length_mismatch() {
        let mut bytes = Frame::new(1, 131, 0x40, vec![0x00, 0x00, 0x01, 0x00]).encode();
        bytes[1] = bytes[1].wrapping_add(1);
        assert!(matches!(
            Frame::decode(&bytes).unwrap_err(),
            FrameError::LengthMismatch { .. }
        ));
    }

    #[test]
    fn decode_bad_crc() {
        let mut bytes = Frame::new(1, 131, 0x40, vec![0x00, 0x00, 0x01, 0x00]).encode();
        let crc_pos = bytes.len() - 3;
        bytes[crc_pos] ^= 0xFF;
        assert!(matches!(
            Frame::decode(&bytes).unwrap_err(),
            FrameError::BadCrc { .. }
        ));
    }

    #[test]
    fn corrupt_payload_byte_fails_crc() {
        let mut bytes = Frame::new(1, 131, 0x40, vec![0x64, 0x00, 0x01, 0x00]).encode();
        bytes[9] ^= 0x10;
        assert!(matches!(
            Frame::decode(&bytes).unwrap_err(),
            FrameError::BadCrc { .. }
        ));
    }

    #[test]
    fn service_function_extraction() {
        let grant = Frame::new(131, 100, 0x68, vec![0x01, 0x08, 0x00, 0x00]);
        assert_eq!(grant.service_function(), Some(ServiceFunction::TokenGrant.code()));

        let ret = Frame::new(100, 131, 0x68, vec![0x00, 0x08, 0x00, 0x00]);
        assert_eq!(ret.service_function(), Some(ServiceFunction::TokenReturn.code()));

        // Not a SERVICE frame
        let other = Frame::new(131, 100, 0x40, vec![0x01, 0x08]);
        assert_eq!(other.service_function(), None);

        // SERVICE with truncated payload
        let short = Frame::new(131, 100, 0x68, vec![0x01]);
        assert_eq!(short.service_function(), None);
    }
}
