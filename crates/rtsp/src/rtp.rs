//! RTP fixed header validation.

use crate::{Result, RtspError};

const FIXED_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Offset of the payload within the packet.
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl RtpHeader {
    /// Parse and validate an RTP version 2 packet.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < FIXED_HEADER_LEN {
            return Err(RtspError::InvalidRtp(format!(
                "{} bytes is shorter than the fixed header",
                packet.len()
            )));
        }
        let version = packet[0] >> 6;
        if version != 2 {
            return Err(RtspError::InvalidRtp(format!("version {version}")));
        }
        let padding = packet[0] & 0x20 != 0;
        let extension = packet[0] & 0x10 != 0;
        let csrc_count = (packet[0] & 0x0F) as usize;

        let mut offset = FIXED_HEADER_LEN + csrc_count * 4;
        if extension {
            if packet.len() < offset + 4 {
                return Err(RtspError::InvalidRtp("truncated extension header".to_string()));
            }
            let words = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }
        if packet.len() < offset {
            return Err(RtspError::InvalidRtp("truncated header".to_string()));
        }

        let mut end = packet.len();
        if padding {
            let pad = packet[end - 1] as usize;
            if pad == 0 || pad > end - offset {
                return Err(RtspError::InvalidRtp(format!("bad padding length {pad}")));
            }
            end -= pad;
        }

        Ok(Self {
            payload_type: packet[1] & 0x7F,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
            payload_offset: offset,
            payload_len: end - offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(first: u8, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![first, 96, 0x00, 0x01, 0, 0, 0, 10, 0xde, 0xad, 0xbe, 0xef];
        p.extend_from_slice(payload);
        p
    }

    #[test]
    fn test_parse_minimal() {
        let h = RtpHeader::parse(&packet(0x80, &[0x65, 0x88])).unwrap();
        assert_eq!(h.payload_type, 96);
        assert_eq!(h.sequence, 1);
        assert_eq!(h.timestamp, 10);
        assert_eq!(h.ssrc, 0xdeadbeef);
        assert_eq!(h.payload_offset, 12);
        assert_eq!(h.payload_len, 2);
    }

    #[test]
    fn test_parse_with_extension() {
        let mut body = vec![0xBE, 0xDE, 0x00, 0x01, 1, 2, 3, 4];
        body.extend_from_slice(&[0x41]);
        let h = RtpHeader::parse(&packet(0x90, &body)).unwrap();
        assert_eq!(h.payload_offset, 20);
        assert_eq!(h.payload_len, 1);
    }

    #[test]
    fn test_rejects_bad_packets() {
        assert!(RtpHeader::parse(&[0x80, 96]).is_err());
        assert!(RtpHeader::parse(&packet(0x40, &[1])).is_err());
        // padding length larger than the payload
        assert!(RtpHeader::parse(&packet(0xA0, &[9])).is_err());
    }
}
