//! Terminal errors: the fatal, state-transitioning failures of §7, as
//! opposed to the recoverable per-operation `success=false` results the
//! pool and SSH adapter produce.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TerminalError {
    #[error("the daemon connection is closed")]
    NoDaemon,
    #[error("the SSH session was dropped: {0}")]
    NoSsh(String),
    #[error("daemon error: {0}")]
    DaemonError(String),
    #[error("SSH error: {}", .error.as_deref().unwrap_or("unknown"))]
    SshError { code: Option<i32>, signal: Option<String>, error: Option<String> },
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("challenge handler failed: {0}")]
    ChallengeError(String),
    #[error("client is closed")]
    Closed,
}

/// The error raised once the stashed-error policy (§4.6) has already
/// surfaced the original once.
#[derive(Debug, Error)]
#[error("client is closed (previously: {previous})")]
pub struct AlreadyClosed {
    pub previous: TerminalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_error_display_falls_back_when_no_message() {
        let err = TerminalError::SshError { code: Some(1), signal: None, error: None };
        assert_eq!(err.to_string(), "SSH error: unknown");
    }
}
