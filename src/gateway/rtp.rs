use byteorder::{BigEndian, ByteOrder};

use crate::gateway::constants::{
    RTP_CSRC_SIZE, RTP_EXTENSION_PREAMBLE_SIZE, RTP_HEADER_SIZE, RTP_OPUS_PAYLOAD_TYPE,
    RTP_VERSION,
};

/// Fixed RTP header (RFC 3550 §5.1) as carried in every media datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Header for an outbound Opus frame.
    pub fn outbound(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: RTP_OPUS_PAYLOAD_TYPE,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < RTP_HEADER_SIZE {
            return None;
        }
        let header = Self {
            version: buf[0] >> 6,
            padding: buf[0] & 0x20 != 0,
            extension: buf[0] & 0x10 != 0,
            csrc_count: buf[0] & 0x0F,
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7F,
            sequence: BigEndian::read_u16(&buf[2..4]),
            timestamp: BigEndian::read_u32(&buf[4..8]),
            ssrc: BigEndian::read_u32(&buf[8..12]),
        };
        if header.version != RTP_VERSION || buf.len() < header.len() {
            return None;
        }
        Some(header)
    }

    pub fn to_bytes(&self) -> [u8; RTP_HEADER_SIZE] {
        let mut out = [0u8; RTP_HEADER_SIZE];
        out[0] = (self.version << 6)
            | (u8::from(self.padding) << 5)
            | (u8::from(self.extension) << 4)
            | (self.csrc_count & 0x0F);
        out[1] = (u8::from(self.marker) << 7) | (self.payload_type & 0x7F);
        BigEndian::write_u16(&mut out[2..4], self.sequence);
        BigEndian::write_u32(&mut out[4..8], self.timestamp);
        BigEndian::write_u32(&mut out[8..12], self.ssrc);
        out
    }

    /// Header length on the wire, including the CSRC list.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        RTP_HEADER_SIZE + self.csrc_count as usize * RTP_CSRC_SIZE
    }
}

/// Drops a leading RFC 3550 header extension from a decrypted payload.
/// Returns the payload untouched if the extension is truncated.
pub fn strip_extension(payload: &[u8]) -> &[u8] {
    if payload.len() < RTP_EXTENSION_PREAMBLE_SIZE {
        return payload;
    }
    let words = BigEndian::read_u16(&payload[2..4]) as usize;
    let skip = RTP_EXTENSION_PREAMBLE_SIZE + words * 4;
    payload.get(skip..).unwrap_or(payload)
}
