use crate::gateway::events::DisconnectReason;

/// Outcome of a single WS connection; tells the outer loop what to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Transient loss: reconnect with Op 7 Resume.
    Resume,
    /// Session invalid: start over with a fresh Op 0 Identify.
    Identify,
    /// Stop entirely.
    Shutdown(DisconnectReason),
}

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const SESSION_NO_LONGER_VALID: u16 = 4006;
    pub const SESSION_TIMEOUT: u16 = 4009;
    pub const DISCONNECTED: u16 = 4014;
    pub const VOICE_SERVER_CRASHED: u16 = 4015;
}

/// What a server close code asks of us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    Resume,
    Identify,
    Fatal,
}

/// - `4004`: authentication failed
/// - `4014`: channel deleted or we were kicked
/// - `4006`, `4009`: the server forgot the session
///
/// Everything else, including `1006` and codes we have never seen, is
/// treated as transient.
pub fn classify_close(code: u16) -> CloseAction {
    match code {
        close_code::AUTHENTICATION_FAILED | close_code::DISCONNECTED => CloseAction::Fatal,
        close_code::SESSION_NO_LONGER_VALID | close_code::SESSION_TIMEOUT => CloseAction::Identify,
        _ => CloseAction::Resume,
    }
}
