//! The error taxonomy an SSH session maps every underlying transport/auth
//! failure into. Reason strings are produced verbatim so callers further up
//! the stack (the pool, the daemon-side handler) can surface them without
//! reformatting.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SshAdapterError {
    #[error("host fingerprint has changed (expected {expected}, received {received})")]
    FingerprintMismatch { expected: String, received: String },
    #[error("SSH handshake failed ({0})")]
    Handshake(String),
    #[error("connection error ({0})")]
    ClientSocket(String),
    #[error("connection timed out")]
    ClientTimeout,
    #[error("authentication denied")]
    ClientAuthentication,
    #[error("DNS lookup failed ({0})")]
    ClientDns(String),
    #[error("unexpected error ({0})")]
    Other(String),
}

impl SshAdapterError {
    /// The exact reason string to attach to an `unconnected`/`disconnected`
    /// event or a `result.error` field.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn from_connect_io(err: &std::io::Error) -> SshAdapterError {
        match err.kind() {
            std::io::ErrorKind::TimedOut => SshAdapterError::ClientTimeout,
            std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidInput => {
                SshAdapterError::ClientDns(err.to_string())
            }
            _ => SshAdapterError::ClientSocket(err.to_string()),
        }
    }

    pub fn from_connect_timeout() -> SshAdapterError {
        SshAdapterError::ClientTimeout
    }

    pub fn from_russh(err: russh::Error) -> SshAdapterError {
        match err {
            russh::Error::IO(io) => SshAdapterError::from_connect_io(&io),
            other => SshAdapterError::Handshake(other.to_string()),
        }
    }

    pub fn authentication_denied() -> SshAdapterError {
        SshAdapterError::ClientAuthentication
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_mismatch_message_has_expected_prefix() {
        let err = SshAdapterError::FingerprintMismatch {
            expected: "aaaa".to_string(),
            received: "bbbb".to_string(),
        };
        assert!(err.reason().starts_with("host fingerprint has changed"));
    }

    #[test]
    fn timeout_reason_is_fixed_text() {
        assert_eq!(SshAdapterError::ClientTimeout.reason(), "connection timed out");
    }

    #[test]
    fn authentication_reason_is_fixed_text() {
        assert_eq!(SshAdapterError::authentication_denied().reason(), "authentication denied");
    }

    #[test]
    fn socket_error_wraps_detail() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = SshAdapterError::from_connect_io(&io_err);
        assert!(matches!(err, SshAdapterError::ClientSocket(_)));
        assert!(err.reason().starts_with("connection error ("));
    }

    #[test]
    fn timed_out_io_error_classifies_as_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert_eq!(SshAdapterError::from_connect_io(&io_err), SshAdapterError::ClientTimeout);
    }
}
