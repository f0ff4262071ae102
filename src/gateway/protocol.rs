//! Voice control-channel messages.
//!
//! Every frame is a JSON envelope `{"op": <int>, "d": <payload>}`. Inbound
//! envelopes are decoded into [`VoiceOp`] before anything acts on them, so
//! the session handler never touches untyped JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    common::{
        errors::{GatewayError, GatewayResult},
        types::UserId,
    },
    gateway::{
        SessionCredentials,
        constants::{
            MAX_HEARTBEAT_INTERVAL, MIN_HEARTBEAT_INTERVAL, RTP_OPUS_PAYLOAD_TYPE, SECRET_KEY_SIZE,
        },
        discovery::DiscoveredAddress,
        encryption::SecretKey,
    },
};

pub mod op {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENT_CONNECT: u8 = 12;
    pub const CLIENT_DISCONNECT: u8 = 13;
}

#[derive(Serialize, Deserialize, Debug)]
pub struct VoiceGatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

impl VoiceGatewayMessage {
    pub fn to_json(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn identify(creds: &SessionCredentials) -> Self {
        Self {
            op: op::IDENTIFY,
            d: json!({
                "server_id": creds.guild_id,
                "user_id": creds.user_id,
                "session_id": creds.session_id,
                "token": creds.token,
            }),
        }
    }

    pub fn resume(creds: &SessionCredentials) -> Self {
        Self {
            op: op::RESUME,
            d: json!({
                "server_id": creds.guild_id,
                "session_id": creds.session_id,
                "token": creds.token,
            }),
        }
    }

    pub fn select_protocol(addr: &DiscoveredAddress, mode: &str) -> Self {
        Self {
            op: op::SELECT_PROTOCOL,
            d: json!({
                "protocol": "udp",
                "data": {
                    "address": addr.ip.to_string(),
                    "port": addr.port,
                    "mode": mode,
                },
                "codecs": [{
                    "name": "opus",
                    "type": "audio",
                    "priority": 1000,
                    "payload_type": RTP_OPUS_PAYLOAD_TYPE,
                }],
            }),
        }
    }

    pub fn heartbeat(nonce: u64) -> Self {
        Self {
            op: op::HEARTBEAT,
            d: json!(nonce),
        }
    }

    pub fn speaking(ssrc: u32, speaking: bool) -> Self {
        Self {
            op: op::SPEAKING,
            d: json!({
                "speaking": u8::from(speaking),
                "delay": 0,
                "ssrc": ssrc,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HelloPayload {
    // Some server versions send this as a float.
    heartbeat_interval: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SessionDescriptionPayload {
    mode: String,
    secret_key: Vec<u8>,
    #[serde(default)]
    audio_codec: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: SecretKey,
    pub audio_codec: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeakingPayload {
    pub user_id: UserId,
    pub ssrc: u32,
    #[serde(default)]
    pub speaking: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConnect {
    pub user_id: UserId,
    #[serde(default)]
    pub audio_ssrc: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: UserId,
}

/// Converts the server's interval (ms, possibly fractional) into a
/// `Duration`, rejecting values a ticker cannot run on.
fn heartbeat_interval(ms: f64) -> GatewayResult<Duration> {
    let interval = Duration::try_from_secs_f64(ms / 1000.0).map_err(|_| {
        GatewayError::protocol(format!("heartbeat interval {} is not a duration", ms))
    })?;
    if interval < MIN_HEARTBEAT_INTERVAL || interval > MAX_HEARTBEAT_INTERVAL {
        return Err(GatewayError::protocol(format!(
            "heartbeat interval {:?} outside {:?}..={:?}",
            interval, MIN_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL
        )));
    }
    Ok(interval)
}

/// A decoded inbound control message.
#[derive(Debug, Clone)]
pub enum VoiceOp {
    Hello { heartbeat_interval: Duration },
    Ready(ReadyPayload),
    SessionDescription(SessionDescription),
    Speaking(SpeakingPayload),
    HeartbeatAck,
    Resumed,
    ClientConnect(ClientConnect),
    ClientDisconnect(ClientDisconnect),
    Unknown { op: u8, d: Value },
}

impl VoiceOp {
    pub fn decode(text: &str) -> GatewayResult<Self> {
        let msg: VoiceGatewayMessage = serde_json::from_str(text)?;
        Self::from_message(msg)
    }

    pub fn from_message(msg: VoiceGatewayMessage) -> GatewayResult<Self> {
        let VoiceGatewayMessage { op, d } = msg;
        let decoded = match op {
            op::HELLO => {
                let hello: HelloPayload = serde_json::from_value(d)?;
                Self::Hello {
                    heartbeat_interval: heartbeat_interval(hello.heartbeat_interval)?,
                }
            }
            op::READY => Self::Ready(serde_json::from_value(d)?),
            op::SESSION_DESCRIPTION => {
                let raw: SessionDescriptionPayload = serde_json::from_value(d)?;
                let secret_key: SecretKey = raw.secret_key.as_slice().try_into().map_err(|_| {
                    GatewayError::protocol(format!(
                        "secret key is {} bytes, expected {}",
                        raw.secret_key.len(),
                        SECRET_KEY_SIZE
                    ))
                })?;
                Self::SessionDescription(SessionDescription {
                    mode: raw.mode,
                    secret_key,
                    audio_codec: raw.audio_codec,
                })
            }
            op::SPEAKING => Self::Speaking(serde_json::from_value(d)?),
            op::HEARTBEAT_ACK => Self::HeartbeatAck,
            op::RESUMED => Self::Resumed,
            op::CLIENT_CONNECT => Self::ClientConnect(serde_json::from_value(d)?),
            op::CLIENT_DISCONNECT => Self::ClientDisconnect(serde_json::from_value(d)?),
            _ => Self::Unknown { op, d },
        };
        Ok(decoded)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Ready(_) => "Ready",
            Self::SessionDescription(_) => "SessionDescription",
            Self::Speaking(_) => "Speaking",
            Self::HeartbeatAck => "HeartbeatAck",
            Self::Resumed => "Resumed",
            Self::ClientConnect(_) => "ClientConnect",
            Self::ClientDisconnect(_) => "ClientDisconnect",
            Self::Unknown { .. } => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{GuildId, SessionId};

    #[test]
    fn decodes_hello_with_float_interval() {
        let op = VoiceOp::decode(r#"{"op":8,"d":{"heartbeat_interval":13750.0}}"#).unwrap();
        match op {
            VoiceOp::Hello { heartbeat_interval } => {
                assert_eq!(heartbeat_interval, Duration::from_millis(13_750))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hello_interval_out_of_range_is_a_protocol_error() {
        for interval in ["1e300", "1e-9", "0", "-5", "0.5"] {
            let text = format!(r#"{{"op":8,"d":{{"heartbeat_interval":{}}}}}"#, interval);
            assert!(
                matches!(VoiceOp::decode(&text), Err(GatewayError::Protocol(_))),
                "interval {} should be rejected",
                interval
            );
        }
        assert!(matches!(
            VoiceOp::decode(r#"{"op":8,"d":{"heartbeat_interval":1}}"#).unwrap(),
            VoiceOp::Hello { heartbeat_interval } if heartbeat_interval == Duration::from_millis(1)
        ));
    }

    #[test]
    fn decodes_ready() {
        let op = VoiceOp::decode(
            r#"{"op":2,"d":{"ssrc":1,"ip":"127.0.0.1","port":1234,"modes":["aead_aes256_gcm"],"heartbeat_interval":1}}"#,
        )
        .unwrap();
        let VoiceOp::Ready(ready) = op else {
            panic!("expected Ready");
        };
        assert_eq!(ready.ssrc, 1);
        assert_eq!(ready.port, 1234);
        assert_eq!(ready.modes, vec!["aead_aes256_gcm".to_string()]);
    }

    #[test]
    fn session_description_requires_full_key() {
        let short = r#"{"op":4,"d":{"mode":"aead_aes256_gcm","secret_key":[1,2,3]}}"#;
        assert!(matches!(
            VoiceOp::decode(short),
            Err(GatewayError::Protocol(_))
        ));

        let key: Vec<u8> = (0..32).collect();
        let full = format!(
            r#"{{"op":4,"d":{{"mode":"aead_aes256_gcm","secret_key":{:?},"audio_codec":"opus"}}}}"#,
            key
        );
        let VoiceOp::SessionDescription(sd) = VoiceOp::decode(&full).unwrap() else {
            panic!("expected SessionDescription");
        };
        assert_eq!(sd.secret_key[31], 31);
        assert_eq!(sd.audio_codec.as_deref(), Some("opus"));
    }

    #[test]
    fn peer_events_accept_string_ids() {
        let join = VoiceOp::decode(
            r#"{"op":12,"d":{"user_id":"80351110224678912","audio_ssrc":77}}"#,
        )
        .unwrap();
        let VoiceOp::ClientConnect(c) = join else {
            panic!("expected ClientConnect");
        };
        assert_eq!(c.user_id, UserId(80351110224678912));
        assert_eq!(c.audio_ssrc, Some(77));

        assert!(matches!(
            VoiceOp::decode(r#"{"op":13,"d":{"user_id":"1"}}"#).unwrap(),
            VoiceOp::ClientDisconnect(_)
        ));
    }

    #[test]
    fn unknown_ops_are_preserved_and_malformed_payloads_error() {
        assert!(matches!(
            VoiceOp::decode(r#"{"op":99,"d":{"x":1}}"#).unwrap(),
            VoiceOp::Unknown { op: 99, .. }
        ));
        assert!(VoiceOp::decode(r#"{"op":2,"d":{"ssrc":"nope"}}"#).is_err());
        assert!(VoiceOp::decode("not json").is_err());
        assert!(matches!(
            VoiceOp::decode(r#"{"op":6}"#).unwrap(),
            VoiceOp::HeartbeatAck
        ));
    }

    #[test]
    fn identify_and_resume_shapes() {
        let creds = SessionCredentials {
            guild_id: GuildId(41771983423143937),
            user_id: UserId(104694319306248192),
            session_id: SessionId::from("my_session_id"),
            token: "my_token".into(),
            endpoint: "example.invalid".into(),
        };

        let identify: Value =
            serde_json::from_str(&VoiceGatewayMessage::identify(&creds).to_json().unwrap()).unwrap();
        assert_eq!(identify["op"], 0);
        assert_eq!(identify["d"]["server_id"], "41771983423143937");
        assert_eq!(identify["d"]["user_id"], "104694319306248192");
        assert_eq!(identify["d"]["token"], "my_token");

        let resume: Value =
            serde_json::from_str(&VoiceGatewayMessage::resume(&creds).to_json().unwrap()).unwrap();
        assert_eq!(resume["op"], 7);
        assert_eq!(resume["d"]["session_id"], "my_session_id");
        assert!(resume["d"].get("user_id").is_none());
    }

    #[test]
    fn select_protocol_declares_codec_and_address() {
        let addr = DiscoveredAddress {
            ip: "198.51.100.4".parse().unwrap(),
            port: 40_000,
        };
        let msg = VoiceGatewayMessage::select_protocol(&addr, "aead_aes256_gcm");
        assert_eq!(msg.op, op::SELECT_PROTOCOL);
        assert_eq!(msg.d["data"]["address"], "198.51.100.4");
        assert_eq!(msg.d["data"]["port"], 40_000);
        assert_eq!(msg.d["codecs"][0]["payload_type"], 120);
    }
}
