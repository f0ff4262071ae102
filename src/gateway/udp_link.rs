use std::{net::SocketAddr, sync::Arc};

use tokio::net::UdpSocket;

use crate::{
    common::errors::GatewayResult,
    gateway::{
        buffer::{BufferPool, packet_pool},
        encryption::MediaCipher,
        rtp::RtpHeader,
    },
};

/// RTP sequencing for one outbound stream.
///
/// Sequence and timestamp only advance on [`Packetizer::commit`], so a frame
/// that fails to go out leaves no gap in the sequence.
#[derive(Debug, Clone)]
pub struct Packetizer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    frame_samples: u32,
}

impl Packetizer {
    pub fn new(ssrc: u32, frame_samples: u32) -> Self {
        Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
            frame_samples,
        }
    }

    pub fn next_header(&self) -> RtpHeader {
        RtpHeader::outbound(self.sequence, self.timestamp, self.ssrc)
    }

    /// Writes `header || encrypt(payload) || tag || nonce` into `out`.
    pub fn packetize(
        &self,
        cipher: &MediaCipher,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> GatewayResult<RtpHeader> {
        let header = self.next_header();
        let raw = header.to_bytes();

        out.clear();
        out.extend_from_slice(&raw);
        out.extend_from_slice(payload);
        cipher.seal_packet(out, raw.len())?;
        Ok(header)
    }

    pub fn commit(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.frame_samples);
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

/// Outbound half of the media socket.
pub struct UdpBackend {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    packetizer: Packetizer,
    pool: Arc<BufferPool>,
}

impl UdpBackend {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr, ssrc: u32, frame_samples: u32) -> Self {
        Self {
            socket,
            remote,
            packetizer: Packetizer::new(ssrc, frame_samples),
            pool: packet_pool(),
        }
    }

    /// Encrypts and sends one encoded frame.
    pub async fn send_frame(
        &mut self,
        cipher: &MediaCipher,
        payload: &[u8],
    ) -> GatewayResult<RtpHeader> {
        let mut packet = self.pool.acquire();
        let header = self.packetizer.packetize(cipher, payload, &mut packet)?;
        self.socket.send_to(&packet, self.remote).await?;
        self.packetizer.commit();
        Ok(header)
    }

    pub fn packetizer(&self) -> &Packetizer {
        &self.packetizer
    }
}
