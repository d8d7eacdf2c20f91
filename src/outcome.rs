//! Per-device results.
//!
//! Every device visited by a run yields exactly one [`ResultEnvelope`], whose
//! [`Outcome`] is one of seven closed kinds. Consumers match on the enum
//! exhaustively; there is no "impossible" outcome.

use std::borrow::Cow;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// The tagged result of querying one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /// Command output, filtered and/or parsed as requested.
    Success(String),
    /// A session was opened and no command was requested.
    ConnectivityOnly,
    /// The device rejected the credentials.
    Unauthorized,
    /// The device could not be reached or did not answer in time.
    TimedOut,
    /// Autodetection could not name the device type.
    UnknownDeviceType,
    /// The output filter matched nothing; carries the unfiltered output.
    NoMatches(String),
    /// Anything else, with a short diagnostic.
    OtherFailure(String),
}

impl Outcome {
    /// Stable snake_case name of the kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::ConnectivityOnly => "connectivity_only",
            Outcome::Unauthorized => "unauthorized",
            Outcome::TimedOut => "timed_out",
            Outcome::UnknownDeviceType => "unknown_device_type",
            Outcome::NoMatches(_) => "no_matches",
            Outcome::OtherFailure(_) => "other_failure",
        }
    }

    /// Text shown in the result column and used as the primary sort key.
    ///
    /// Non-output kinds are parenthesised so they sort ahead of command
    /// output and group together.
    pub fn label(&self) -> Cow<'_, str> {
        match self {
            Outcome::Success(text) => Cow::Borrowed(text.as_str()),
            Outcome::ConnectivityOnly => Cow::Borrowed("(accessible)"),
            Outcome::Unauthorized => Cow::Borrowed("(unauthorized)"),
            Outcome::TimedOut => Cow::Borrowed("(timeout)"),
            Outcome::UnknownDeviceType => Cow::Borrowed("(unknown device type)"),
            Outcome::NoMatches(_) => Cow::Borrowed("(no matches)"),
            Outcome::OtherFailure(detail) => Cow::Owned(format!("(error) {detail}")),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_) | Outcome::ConnectivityOnly)
    }

    /// Raw output kept by the outcome, if any.
    pub fn raw(&self) -> Option<&str> {
        match self {
            Outcome::NoMatches(raw) => Some(raw),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl From<SessionError> for Outcome {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unauthorized(_) => Outcome::Unauthorized,
            SessionError::Timeout(_) => Outcome::TimedOut,
            SessionError::ChannelDisconnected => {
                Outcome::OtherFailure("channel disconnected while waiting for prompt".to_string())
            }
            SessionError::Failed(detail) => Outcome::OtherFailure(detail),
        }
    }
}

/// Everything known about one visited device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResultEnvelope {
    pub source: String,
    pub group: String,
    pub label: String,
    pub hostname: String,
    pub ip: String,
    /// Device type after merging defaults and autodetection; `None` when
    /// detection found nothing.
    pub device_type: Option<String>,
    pub outcome: Outcome,
    /// Raw session transcript, possibly empty.
    pub transcript: String,
}

/// Position of an envelope in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed as f64 / self.total as f64
    }
}

/// An envelope as emitted by the engine, with its progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Emitted {
    pub envelope: ResultEnvelope,
    pub progress: Progress,
}

/// JSON schema of [`ResultEnvelope`], for transports that publish it.
pub fn envelope_schema_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&schemars::schema_for!(ResultEnvelope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_designated_outcomes() {
        assert_eq!(
            Outcome::from(SessionError::Unauthorized("bad password".into())),
            Outcome::Unauthorized
        );
        assert_eq!(
            Outcome::from(SessionError::Timeout("no route".into())),
            Outcome::TimedOut
        );
        assert_eq!(
            Outcome::from(SessionError::Failed("boom".into())),
            Outcome::OtherFailure("boom".into())
        );
        assert!(matches!(
            Outcome::from(SessionError::ChannelDisconnected),
            Outcome::OtherFailure(_)
        ));
    }

    #[test]
    fn failure_labels_sort_before_output() {
        let output = Outcome::Success("IOS 15.2".into());
        for failure in [
            Outcome::ConnectivityOnly,
            Outcome::Unauthorized,
            Outcome::TimedOut,
            Outcome::UnknownDeviceType,
            Outcome::NoMatches("x".into()),
            Outcome::OtherFailure("x".into()),
        ] {
            assert!(failure.label() < output.label(), "{failure} should sort first");
        }
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let json = serde_json::to_value(Outcome::NoMatches("OK: link up".into())).expect("json");
        assert_eq!(json["kind"], "no_matches");
        assert_eq!(json["detail"], "OK: link up");

        let json = serde_json::to_value(Outcome::TimedOut).expect("json");
        assert_eq!(json["kind"], "timed_out");
    }

    #[test]
    fn progress_fraction_handles_empty_runs() {
        assert_eq!(Progress { completed: 1, total: 4 }.fraction(), 0.25);
        assert_eq!(Progress { completed: 0, total: 0 }.fraction(), 1.0);
    }

    #[test]
    fn envelope_schema_is_valid_json() {
        let schema = envelope_schema_json().expect("schema");
        let value: serde_json::Value = serde_json::from_str(&schema).expect("parse schema");
        assert!(value["properties"]["outcome"].is_object());
    }
}
