//! Session state for the single logical connection to the remote process.

use serde::Serialize;

/// State of the remote session. Exactly one at a time; every transition is
/// made while holding the session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No transport is open.
    Disconnected,
    /// A connect attempt (including its verification probe) is under way.
    Connecting,
    /// Transport open and the last exchange or probe succeeded.
    Connected,
    /// Transport nominally open but a recent probe or exchange failed.
    Degraded,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Degraded => "degraded",
        }
    }

    /// Whether a transport is open in this state.
    #[must_use]
    pub fn has_transport(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Degraded)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
