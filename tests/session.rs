//! Drives full sessions against an in-process voice server: a WebSocket
//! listener for the control channel and a UDP socket for media.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::broadcast,
    task::JoinHandle,
};
use tokio_tungstenite::{
    WebSocketStream, accept_async,
    tungstenite::{
        Message, Utf8Bytes,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use voicelink::{
    VoiceManager,
    common::{
        errors::GatewayResult,
        types::{ChannelId, GuildId, SessionId, UserId},
    },
    configs::GatewayConfig,
    gateway::{
        ConnectionState, InboundFrame, MediaCipher, SessionCredentials, StaticCredentials,
        VoiceConnection, VoiceEvent, rtp::RtpHeader,
    },
};

type Ws = WebSocketStream<TcpStream>;

const KEY: [u8; 32] = [0x42; 32];
const SSRC: u32 = 4242;
const GUILD: GuildId = GuildId(41771983423143937);
const STEP: Duration = Duration::from_secs(5);

struct FakeServer {
    listener: TcpListener,
    udp: UdpSocket,
}

impl FakeServer {
    async fn start() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            udp: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn endpoint(&self) -> String {
        format!("ws://{}", self.listener.local_addr().unwrap())
    }

    async fn accept(&self) -> Ws {
        let (stream, _) = tokio::time::timeout(STEP, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        accept_async(stream).await.unwrap()
    }

    /// Plays the server side of Hello → Identify → Ready → discovery →
    /// SelectProtocol → SessionDescription. Returns the client's media
    /// address.
    async fn handshake(&self, ws: &mut Ws) -> SocketAddr {
        send(ws, json!({"op": 8, "d": {"heartbeat_interval": 45000.0}})).await;
        let identify = expect_op(ws, 0).await;
        assert_eq!(identify["server_id"], GUILD.to_string());
        assert_eq!(identify["token"], "tok");

        send_ready(ws, self.udp.local_addr().unwrap().port()).await;

        let client = self.answer_discovery().await;

        let select = expect_op(ws, 1).await;
        assert_eq!(select["protocol"], "udp");
        assert_eq!(select["data"]["mode"], "aead_aes256_gcm");
        assert_eq!(select["data"]["port"], client.port());

        send(
            ws,
            json!({"op": 4, "d": {"mode": "aead_aes256_gcm", "secret_key": KEY.to_vec()}}),
        )
        .await;

        let speaking = expect_op(ws, 5).await;
        assert_eq!(speaking["ssrc"], SSRC);
        client
    }

    async fn answer_discovery(&self) -> SocketAddr {
        let mut buf = [0u8; 2048];
        loop {
            let (n, from) = tokio::time::timeout(STEP, self.udp.recv_from(&mut buf))
                .await
                .expect("no discovery request")
                .unwrap();
            // Leftovers from a previous data plane.
            if n != 70 {
                continue;
            }
            assert_eq!(&buf[..4], &SSRC.to_be_bytes());

            let mut reply = [0u8; 70];
            let ip = from.ip().to_string();
            reply[4..4 + ip.len()].copy_from_slice(ip.as_bytes());
            reply[68..70].copy_from_slice(&from.port().to_le_bytes());
            self.udp.send_to(&reply, from).await.unwrap();
            return from;
        }
    }

    /// Next datagram of exactly `len` bytes, or any media packet when `len`
    /// is `None`.
    async fn recv_udp(&self, len: Option<usize>) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 2048];
        loop {
            let (n, from) = tokio::time::timeout(STEP, self.udp.recv_from(&mut buf))
                .await
                .expect("no datagram")
                .unwrap();
            let wanted = match len {
                Some(l) => n == l,
                None => n >= 13,
            };
            if wanted {
                return (buf[..n].to_vec(), from);
            }
        }
    }
}

async fn send_ready(ws: &mut Ws, port: u16) {
    send(
        ws,
        json!({"op": 2, "d": {
            "ssrc": SSRC,
            "ip": "127.0.0.1",
            "port": port,
            "modes": ["aead_aes256_gcm"],
        }}),
    )
    .await;
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next non-heartbeat control message, asserted to carry `op`.
async fn expect_op(ws: &mut Ws, op: u64) -> Value {
    loop {
        let msg = tokio::time::timeout(STEP, ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for op {}", op))
            .expect("client hung up")
            .unwrap();
        let Message::Text(text) = msg else {
            continue;
        };
        let v: Value = serde_json::from_str(text.as_str()).unwrap();
        if v["op"] == 3 {
            continue;
        }
        assert_eq!(v["op"], op, "unexpected message {}", v);
        return v["d"].clone();
    }
}

/// Waits for the client to give up on `ws`.
async fn expect_hangup(ws: &mut Ws) {
    tokio::time::timeout(STEP, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("client kept the connection open");
}

async fn close_with(ws: &mut Ws, code: u16) {
    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: Utf8Bytes::from_static("test"),
    })))
    .await
    .unwrap();
}

async fn wait_for_event<F>(rx: &mut broadcast::Receiver<VoiceEvent>, mut pred: F) -> VoiceEvent
where
    F: FnMut(&VoiceEvent) -> bool,
{
    tokio::time::timeout(STEP, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event never arrived")
}

fn manager(endpoint: String) -> Arc<VoiceManager> {
    manager_with(endpoint, |_| {})
}

fn manager_with(endpoint: String, tweak: impl FnOnce(&mut GatewayConfig)) -> Arc<VoiceManager> {
    let creds = SessionCredentials {
        guild_id: GUILD,
        user_id: UserId(104694319306248192),
        session_id: SessionId::from("sess"),
        token: "tok".into(),
        endpoint,
    };
    let mut config = GatewayConfig {
        frame_duration_ms: 0,
        keepalive_interval_ms: 60_000,
        ready_timeout_ms: 5_000,
        ..Default::default()
    };
    tweak(&mut config);
    Arc::new(VoiceManager::new(
        Arc::new(StaticCredentials::new(creds)),
        config,
    ))
}

fn start_connect(
    manager: &Arc<VoiceManager>,
    frames: flume::Sender<InboundFrame>,
) -> JoinHandle<GatewayResult<Arc<VoiceConnection>>> {
    let manager = manager.clone();
    tokio::spawn(async move {
        manager
            .connect(
                GUILD,
                ChannelId(127121515262115840),
                Arc::new(move |f: InboundFrame| {
                    let _ = frames.send(f);
                }),
            )
            .await
    })
}

async fn connect(
    server: &FakeServer,
    manager: &Arc<VoiceManager>,
    frames: flume::Sender<InboundFrame>,
) -> (Arc<VoiceConnection>, Ws, SocketAddr) {
    let connecting = start_connect(manager, frames);

    let mut ws = server.accept().await;
    let client = server.handshake(&mut ws).await;
    let connection = connecting.await.unwrap().expect("session never became ready");
    (connection, ws, client)
}

#[tokio::test]
async fn handshake_then_frames_are_sequenced_and_encrypted() {
    let server = FakeServer::start().await;
    let manager = manager(server.endpoint());
    let (frames_tx, _frames_rx) = flume::unbounded();
    let (connection, _ws, _client) = connect(&server, &manager, frames_tx).await;
    assert_eq!(connection.state(), ConnectionState::Ready);

    for i in 0u8..5 {
        connection.enqueue(vec![0xF8, 0xFF, 0xFE, i]).await.unwrap();
    }

    let cipher = MediaCipher::new(&KEY);
    let mut plain = Vec::new();
    for i in 0u8..5 {
        let (packet, _) = server.recv_udp(None).await;
        let header = RtpHeader::parse(&packet).unwrap();
        assert_eq!(header.payload_type, 120);
        assert_eq!(header.ssrc, SSRC);
        assert_eq!(header.sequence, u16::from(i));
        assert_eq!(header.timestamp, u32::from(i) * 960);
        cipher.open_packet(&packet, header.len(), &mut plain).unwrap();
        assert_eq!(plain, vec![0xF8, 0xFF, 0xFE, i]);
    }
    assert_eq!(connection.stats().frames_sent, 5);

    manager.shutdown().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(connection.enqueue(vec![1u8]).await.is_err());
}

#[tokio::test]
async fn keepalive_echo_and_inbound_media_reach_the_client() {
    let server = FakeServer::start().await;
    let manager = manager(server.endpoint());
    let (frames_tx, frames_rx) = flume::unbounded();
    let (connection, mut ws, client) = connect(&server, &manager, frames_tx).await;
    let mut events = connection.subscribe();

    let (keepalive, from) = server.recv_udp(Some(8)).await;
    server.udp.send_to(&keepalive, from).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, VoiceEvent::UdpPing { .. })).await;
    assert!(connection.udp_ping().is_some());

    send(
        &mut ws,
        json!({"op": 5, "d": {"user_id": "99", "ssrc": 777, "speaking": 1}}),
    )
    .await;
    wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Speaking { .. })).await;

    let mut packet = RtpHeader::outbound(11, 22, 777).to_bytes().to_vec();
    packet.extend_from_slice(b"remote opus");
    MediaCipher::new(&KEY).seal_packet(&mut packet, 12).unwrap();
    server.udp.send_to(&packet, client).await.unwrap();

    let frame = tokio::time::timeout(STEP, frames_rx.recv_async())
        .await
        .expect("frame never delivered")
        .unwrap();
    assert_eq!(frame.ssrc, 777);
    assert_eq!(frame.user_id, Some(UserId(99)));
    assert_eq!(frame.sequence, 11);
    assert_eq!(&frame.payload[..], b"remote opus");

    // Garbage under the right ssrc is dropped, not delivered.
    let mut forged = RtpHeader::outbound(12, 23, 777).to_bytes().to_vec();
    forged.extend_from_slice(&[0u8; 40]);
    server.udp.send_to(&forged, client).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(frames_rx.try_recv().is_err());
    assert_eq!(connection.stats().decrypt_failures, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn session_invalid_close_identifies_fresh() {
    let server = FakeServer::start().await;
    let manager = manager(server.endpoint());
    let (frames_tx, _frames_rx) = flume::unbounded();
    let (connection, mut ws, _) = connect(&server, &manager, frames_tx).await;
    let mut events = connection.subscribe();

    close_with(&mut ws, 4006).await;
    let event = wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Reconnecting { .. })).await;
    assert!(matches!(event, VoiceEvent::Reconnecting { resume: false, .. }));

    let mut ws = server.accept().await;
    // Full handshake again, starting with op 0.
    server.handshake(&mut ws).await;
    wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Ready { .. })).await;
    assert_eq!(connection.state(), ConnectionState::Ready);

    manager.shutdown().await;
}

#[tokio::test]
async fn transient_close_resumes_the_session() {
    let server = FakeServer::start().await;
    let manager = manager(server.endpoint());
    let (frames_tx, _frames_rx) = flume::unbounded();
    let (connection, mut ws, _) = connect(&server, &manager, frames_tx).await;
    let mut events = connection.subscribe();

    close_with(&mut ws, 4015).await;
    let event = wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Reconnecting { .. })).await;
    assert!(matches!(event, VoiceEvent::Reconnecting { resume: true, .. }));

    let mut ws = server.accept().await;
    send(&mut ws, json!({"op": 8, "d": {"heartbeat_interval": 45000}})).await;
    let resume = expect_op(&mut ws, 7).await;
    assert_eq!(resume["session_id"], "sess");
    assert_eq!(resume["token"], "tok");

    send(&mut ws, json!({"op": 9, "d": null})).await;
    wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Resumed)).await;
    assert_eq!(connection.state(), ConnectionState::Ready);

    // The data plane survived: sequence numbers carry on.
    connection.enqueue(vec![1u8, 2, 3]).await.unwrap();
    let (packet, _) = server.recv_udp(None).await;
    assert_eq!(RtpHeader::parse(&packet).unwrap().sequence, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn authentication_failure_is_terminal() {
    let server = FakeServer::start().await;
    let manager = manager(server.endpoint());
    let (frames_tx, _frames_rx) = flume::unbounded();
    let (connection, mut ws, _) = connect(&server, &manager, frames_tx).await;
    let mut events = connection.subscribe();

    close_with(&mut ws, 4004).await;
    let event =
        wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Disconnected { .. })).await;
    assert!(matches!(
        event,
        VoiceEvent::Disconnected {
            reason: voicelink::gateway::DisconnectReason::Rejected { code: 4004, .. }
        }
    ));
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn stalled_handshake_starts_over_with_identify() {
    let server = FakeServer::start().await;
    let manager = manager_with(server.endpoint(), |c| c.session_description_timeout_ms = 300);
    let (frames_tx, _frames_rx) = flume::unbounded();
    let connecting = start_connect(&manager, frames_tx);

    // No Hello at all.
    let mut silent = server.accept().await;
    expect_hangup(&mut silent).await;

    // Hello and Ready, but no SessionDescription after SelectProtocol.
    let mut ws = server.accept().await;
    send(&mut ws, json!({"op": 8, "d": {"heartbeat_interval": 45000}})).await;
    expect_op(&mut ws, 0).await;
    send_ready(&mut ws, server.udp.local_addr().unwrap().port()).await;
    server.answer_discovery().await;
    expect_op(&mut ws, 1).await;
    expect_hangup(&mut ws).await;

    let mut ws = server.accept().await;
    server.handshake(&mut ws).await;
    let connection = connecting.await.unwrap().expect("session never became ready");
    assert_eq!(connection.state(), ConnectionState::Ready);

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_discovery_starts_over_with_identify() {
    let server = FakeServer::start().await;
    let manager = manager_with(server.endpoint(), |c| c.discovery_timeout_ms = 300);
    let (frames_tx, _frames_rx) = flume::unbounded();
    let connecting = start_connect(&manager, frames_tx);

    // Media server that never answers.
    let silent_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut ws = server.accept().await;
    send(&mut ws, json!({"op": 8, "d": {"heartbeat_interval": 45000}})).await;
    expect_op(&mut ws, 0).await;
    send_ready(&mut ws, silent_udp.local_addr().unwrap().port()).await;
    expect_hangup(&mut ws).await;

    // Media server that answers with an unreadable address.
    let mut ws = server.accept().await;
    send(&mut ws, json!({"op": 8, "d": {"heartbeat_interval": 45000}})).await;
    expect_op(&mut ws, 0).await;
    send_ready(&mut ws, server.udp.local_addr().unwrap().port()).await;
    let (_, from) = server.recv_udp(Some(70)).await;
    server.udp.send_to(&[0xFF; 70], from).await.unwrap();
    expect_hangup(&mut ws).await;

    let mut ws = server.accept().await;
    server.handshake(&mut ws).await;
    let connection = connecting.await.unwrap().expect("session never became ready");
    assert_eq!(connection.state(), ConnectionState::Ready);

    manager.shutdown().await;
}

#[tokio::test]
async fn unusable_media_socket_starts_over_with_identify() {
    let server = FakeServer::start().await;
    let manager = manager_with(server.endpoint(), |c| c.max_consecutive_send_failures = 3);
    let (frames_tx, _frames_rx) = flume::unbounded();
    let (connection, mut ws, _) = connect(&server, &manager, frames_tx).await;
    let mut events = connection.subscribe();

    // Too large for a UDP datagram, so every send fails.
    for _ in 0..3 {
        connection.enqueue(vec![0u8; 70_000]).await.unwrap();
    }
    let event = wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Reconnecting { .. })).await;
    assert!(matches!(event, VoiceEvent::Reconnecting { resume: false, .. }));
    assert_eq!(connection.stats().send_failures, 3);
    expect_hangup(&mut ws).await;

    let mut ws = server.accept().await;
    server.handshake(&mut ws).await;
    wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Ready { .. })).await;

    // The old link's fault must not tear down the new one.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connection.state(), ConnectionState::Ready);
    connection.enqueue(vec![1u8, 2, 3]).await.unwrap();
    let (packet, _) = server.recv_udp(None).await;
    assert_eq!(RtpHeader::parse(&packet).unwrap().sequence, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn out_of_order_and_malformed_messages_are_ignored() {
    let server = FakeServer::start().await;
    let manager = manager(server.endpoint());
    let (frames_tx, _frames_rx) = flume::unbounded();
    let connecting = start_connect(&manager, frames_tx);
    let port = server.udp.local_addr().unwrap().port();

    let mut ws = server.accept().await;
    send(&mut ws, json!({"op": 8, "d": {"heartbeat_interval": 45000}})).await;
    expect_op(&mut ws, 0).await;

    // SessionDescription before SelectProtocol, then garbage.
    send(
        &mut ws,
        json!({"op": 4, "d": {"mode": "aead_aes256_gcm", "secret_key": KEY.to_vec()}}),
    )
    .await;
    ws.send(Message::Text("not json".to_string().into())).await.unwrap();
    send(&mut ws, json!({"op": 8, "d": {"heartbeat_interval": 1e300}})).await;
    send(&mut ws, json!({"op": 2, "d": {"ssrc": "nope"}})).await;

    send_ready(&mut ws, port).await;
    let client = server.answer_discovery().await;
    expect_op(&mut ws, 1).await;
    send(
        &mut ws,
        json!({"op": 4, "d": {"mode": "aead_aes256_gcm", "secret_key": KEY.to_vec()}}),
    )
    .await;
    expect_op(&mut ws, 5).await;
    let connection = connecting.await.unwrap().expect("session never became ready");
    let mut events = connection.subscribe();

    // Still processing messages after the noise.
    send(&mut ws, json!({"op": 42, "d": {}})).await;
    send(
        &mut ws,
        json!({"op": 5, "d": {"user_id": "99", "ssrc": 777, "speaking": 1}}),
    )
    .await;
    wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Speaking { .. })).await;
    assert_eq!(connection.state(), ConnectionState::Ready);

    // Ready while resuming is ignored: no second discovery.
    close_with(&mut ws, 4015).await;
    let mut ws = server.accept().await;
    send(&mut ws, json!({"op": 8, "d": {"heartbeat_interval": 45000}})).await;
    expect_op(&mut ws, 7).await;
    send_ready(&mut ws, port).await;
    send(&mut ws, json!({"op": 9, "d": null})).await;
    wait_for_event(&mut events, |e| matches!(e, VoiceEvent::Resumed)).await;
    assert_eq!(connection.state(), ConnectionState::Ready);

    let mut buf = [0u8; 2048];
    while let Ok(Ok((n, from))) =
        tokio::time::timeout(Duration::from_millis(200), server.udp.recv_from(&mut buf)).await
    {
        assert_eq!(from, client);
        assert_ne!(n, 70, "unexpected discovery request while resuming");
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn identify_goes_out_before_the_first_heartbeat() {
    let server = FakeServer::start().await;
    let manager = manager(server.endpoint());
    let (frames_tx, _frames_rx) = flume::unbounded();
    let connecting = start_connect(&manager, frames_tx);

    let mut ws = server.accept().await;
    send(&mut ws, json!({"op": 8, "d": {"heartbeat_interval": 10}})).await;

    let mut ops = Vec::new();
    while ops.len() < 2 {
        let msg = tokio::time::timeout(STEP, ws.next())
            .await
            .expect("client went quiet")
            .expect("client hung up")
            .unwrap();
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(text.as_str()).unwrap();
            ops.push(v["op"].as_u64().unwrap());
        }
    }
    assert_eq!(ops, vec![0, 3]);

    manager.shutdown().await;
    assert!(connecting.await.unwrap().is_err());
}
