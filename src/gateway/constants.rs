/// Voice gateway version requested in the WebSocket URL.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// The only encryption mode this client negotiates: AES-256-GCM with a random
/// 12-byte nonce appended to every packet.
pub const ENCRYPTION_MODE: &str = "aead_aes256_gcm";

/// Base delay (ms) for the exponential backoff on reconnect.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Backoff stops doubling after this many attempts (1 s → 8 s).
pub const BACKOFF_MAX_EXPONENT: u32 = 3;

/// Hello intervals outside this range are treated as malformed.
pub const MIN_HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1);
pub const MAX_HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3_600);

/// Fixed delay (ms) before a fresh Identify after a session-invalid close.
pub const RECONNECT_DELAY_FRESH_MS: u64 = 500;

/// Timeout (ms) allowed for the WS write task to shut down gracefully.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;

/// Timeout (ms) allowed for a session task to stop after `disconnect`.
pub const SESSION_SHUTDOWN_MS: u64 = 2_000;

// ── RTP ──────────────────────────────────────────────────────────────────────

/// Version 2, no padding, no extension, zero CSRCs.
pub const RTP_VERSION_BYTE: u8 = 0x80;

pub const RTP_VERSION: u8 = 2;

/// Dynamic payload type registered for Opus in SelectProtocol.
pub const RTP_OPUS_PAYLOAD_TYPE: u8 = 120;

pub const RTP_HEADER_SIZE: usize = 12;

/// Size of one CSRC entry following the fixed header.
pub const RTP_CSRC_SIZE: usize = 4;

/// Profile-defined extension preamble: 16-bit profile + 16-bit word count.
pub const RTP_EXTENSION_PREAMBLE_SIZE: usize = 4;

// ── Crypto ───────────────────────────────────────────────────────────────────

pub const SECRET_KEY_SIZE: usize = 32;

pub const NONCE_SIZE: usize = 12;

pub const TAG_SIZE: usize = 16;

// ── UDP datagrams ────────────────────────────────────────────────────────────

pub const DISCOVERY_PACKET_SIZE: usize = 70;

/// Bytes 4..68 of the discovery reply hold the NUL-terminated address.
pub const DISCOVERY_ADDRESS_RANGE: std::ops::Range<usize> = 4..68;

pub const DISCOVERY_PORT_OFFSET: usize = 68;

pub const KEEPALIVE_PACKET_SIZE: usize = 8;

/// Anything shorter cannot be a media packet and is dropped on arrival.
pub const MIN_MEDIA_PACKET_SIZE: usize = 13;

/// Capacity of pooled packet buffers; covers any Opus frame plus overhead.
pub const UDP_PACKET_BUF_CAPACITY: usize = 1_460;

/// Receive buffer; larger than any voice datagram the server emits.
pub const UDP_RECV_BUF_SIZE: usize = 2_048;

/// Idle packet buffers kept around per pool.
pub const MAX_POOLED_BUFFERS: usize = 64;

/// Three-byte Opus frame that decodes to 20 ms of silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];
