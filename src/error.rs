//! Error types for run validation, device sessions and exports.
//!
//! Errors come in two strata. [`NetqueryError`] covers configuration mistakes
//! (bad inventory, unknown group, unsupported device type, malformed regex)
//! that abort a run before any device is contacted. [`SessionError`] covers
//! operational failures of a single device; the engine never lets those
//! escape and folds them into the device's [`Outcome`](crate::outcome::Outcome).

use std::io;

use thiserror::Error;

/// Errors that abort a whole run or a caller-level operation.
#[derive(Error, Debug)]
pub enum NetqueryError {
    /// An inventory source could not be read or parsed.
    #[error("invalid inventory source '{source_name}': {reason}")]
    InvalidInventory { source_name: String, reason: String },

    /// One or more explicitly requested groups exist in no inventory source.
    #[error("groups {missing:?} are not present in any inventory source (available: {available:?})")]
    UnknownGroup {
        missing: Vec<String>,
        available: Vec<String>,
    },

    /// The device type is not part of the supported platform catalog.
    #[error("unsupported device type '{0}'")]
    UnsupportedDeviceType(String),

    /// The output filter or an expected-prompt pattern is not a valid regex.
    #[error("invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// A structured template was requested but no template parser is configured.
    #[error("structured template requested but no template parser is configured")]
    TemplateParserMissing,

    /// A stream id was never registered, already consumed or expired.
    #[error("stream '{0}' not found")]
    StreamNotFound(String),

    /// Writing or reading an export failed.
    #[error("export error: {0}")]
    Export(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Failures raised by a session collaborator for one device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The device rejected the supplied credentials.
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// The device could not be reached, or did not answer in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The channel was closed by the remote side while waiting for output.
    #[error("channel disconnected while waiting for prompt")]
    ChannelDisconnected,

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl From<async_ssh2_tokio::Error> for SessionError {
    fn from(err: async_ssh2_tokio::Error) -> Self {
        match err {
            async_ssh2_tokio::Error::PasswordWrong | async_ssh2_tokio::Error::KeyAuthFailed => {
                SessionError::Unauthorized(err.to_string())
            }
            async_ssh2_tokio::Error::AddressInvalid(ref io_err) => {
                SessionError::Timeout(io_err.to_string())
            }
            other => classify_by_source(&other),
        }
    }
}

impl From<russh::Error> for SessionError {
    fn from(err: russh::Error) -> Self {
        classify_by_source(&err)
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        if is_unreachable(&err) {
            SessionError::Timeout(err.to_string())
        } else {
            SessionError::Failed(err.to_string())
        }
    }
}

/// Walks the source chain looking for a network-level I/O failure.
fn classify_by_source(err: &(dyn std::error::Error + 'static)) -> SessionError {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>()
            && is_unreachable(io_err)
        {
            return SessionError::Timeout(err.to_string());
        }
        current = e.source();
    }
    SessionError::Failed(err.to_string())
}

fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable
    )
}

/// Failures of the structured-template collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The template matched nothing in the raw output.
    #[error("template produced no records")]
    Empty,

    #[error("template parse error: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connection_is_classified_as_timeout() {
        let err = SessionError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(matches!(err, SessionError::Timeout(_)));
    }

    #[test]
    fn other_io_errors_are_generic_failures() {
        let err = SessionError::from(io::Error::other("broken pipe in handshake"));
        assert!(matches!(err, SessionError::Failed(_)));
    }

    #[test]
    fn unknown_group_message_lists_missing_and_available() {
        let err = NetqueryError::UnknownGroup {
            missing: vec!["edge".to_string()],
            available: vec!["core".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("edge"));
        assert!(message.contains("core"));
    }
}
