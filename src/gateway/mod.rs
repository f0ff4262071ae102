pub mod buffer;
pub mod connection;
pub mod constants;
pub mod credentials;
pub mod discovery;
pub mod encryption;
pub mod events;
pub mod protocol;
pub mod queue;
pub mod rtp;
pub mod session;
pub mod state;
pub mod udp_link;

pub use connection::VoiceConnection;
pub use credentials::{CredentialsProvider, SessionCredentials, StaticCredentials};
pub use encryption::MediaCipher;
pub use events::{DisconnectReason, FrameHandler, InboundFrame, VoiceEvent};
pub use queue::FrameSink;
pub use session::{VoiceGateway, shared::ConnectionStats};
pub use state::ConnectionState;
pub use udp_link::UdpBackend;
