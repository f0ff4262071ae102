//! One-shot IP discovery over the media socket.
//!
//! Request: 70 bytes, SSRC big-endian in bytes 0..4, the rest zero.
//! Reply: NUL-terminated ASCII address in bytes 4..68, little-endian port in
//! bytes 68..70.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::gateway::constants::{
    DISCOVERY_ADDRESS_RANGE, DISCOVERY_PACKET_SIZE, DISCOVERY_PORT_OFFSET, UDP_RECV_BUF_SIZE,
};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("reply was {0} bytes, expected 70")]
    ShortReply(usize),
    #[error("reply carried an invalid address")]
    InvalidAddress,
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Externally visible endpoint of our media socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ip: IpAddr,
    pub port: u16,
}

pub fn build_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    BigEndian::write_u32(&mut packet[0..4], ssrc);
    packet
}

pub fn parse_response(buf: &[u8]) -> Result<DiscoveredAddress, DiscoveryError> {
    if buf.len() < DISCOVERY_PACKET_SIZE {
        return Err(DiscoveryError::ShortReply(buf.len()));
    }

    let raw = &buf[DISCOVERY_ADDRESS_RANGE];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let ip = std::str::from_utf8(&raw[..end])
        .ok()
        .and_then(|s| s.parse::<IpAddr>().ok())
        .ok_or(DiscoveryError::InvalidAddress)?;
    let port = LittleEndian::read_u16(&buf[DISCOVERY_PORT_OFFSET..DISCOVERY_PORT_OFFSET + 2]);

    Ok(DiscoveredAddress { ip, port })
}

/// Runs exactly one discovery exchange against `remote`. Datagrams from any
/// other peer are ignored until the deadline.
pub async fn discover_ip(
    socket: &UdpSocket,
    remote: SocketAddr,
    ssrc: u32,
    limit: Duration,
) -> Result<DiscoveredAddress, DiscoveryError> {
    socket.send_to(&build_request(ssrc), remote).await?;

    let exchange = async {
        let mut buf = [0u8; UDP_RECV_BUF_SIZE];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if from != remote {
                debug!("Ignoring {} byte datagram from {} during discovery", n, from);
                continue;
            }
            return parse_response(&buf[..n]);
        }
    };

    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| DiscoveryError::TimedOut(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(ip: &str, port: u16) -> [u8; DISCOVERY_PACKET_SIZE] {
        let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
        buf[4..4 + ip.len()].copy_from_slice(ip.as_bytes());
        buf[68..70].copy_from_slice(&port.to_le_bytes());
        buf
    }

    #[test]
    fn request_carries_ssrc_then_zeroes() {
        let req = build_request(0xDEAD_BEEF);
        assert_eq!(&req[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(req[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn parses_address_and_little_endian_port() {
        let addr = parse_response(&reply("203.0.113.7", 50_004)).unwrap();
        assert_eq!(addr.ip, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port, 50_004);
    }

    #[test]
    fn rejects_short_and_garbage_replies() {
        assert!(matches!(
            parse_response(&[0u8; 40]),
            Err(DiscoveryError::ShortReply(40))
        ));
        assert!(matches!(
            parse_response(&reply("not an ip", 1)),
            Err(DiscoveryError::InvalidAddress)
        ));
    }

    #[tokio::test]
    async fn exchange_against_local_peer() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, DISCOVERY_PACKET_SIZE);
            assert_eq!(&buf[..4], &7u32.to_be_bytes());
            server
                .send_to(&reply(&from.ip().to_string(), from.port()), from)
                .await
                .unwrap();
        });

        let found = discover_ip(&client, server_addr, 7, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(found.port, client.local_addr().unwrap().port());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = discover_ip(
            &client,
            server.local_addr().unwrap(),
            1,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DiscoveryError::TimedOut(_)));
    }
}
