//! Query parameters and their validation.
//!
//! [`QueryParams`] is what a transport collects from the operator. It is
//! turned into a [`Query`] by [`QueryParams::validate`], which raises every
//! configuration mistake up front, before any device is contacted.

use std::fmt;

use log::debug;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::NetqueryError;
use crate::inventory::{self, ALL_GROUPS, Inventory};
use crate::platform::AUTODETECT;

/// Run-wide login credentials.
#[derive(Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Enable password used when a device does not set its own.
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            secret: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// What to do when the output filter matches nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchPolicy {
    /// Report [`Outcome::NoMatches`](crate::outcome::Outcome::NoMatches) with the raw output.
    #[default]
    Flag,
    /// Keep the unfiltered output as a success and log a warning.
    KeepOutput,
}

/// Parameters of a run as supplied by the operator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct QueryParams {
    pub credentials: Credentials,
    /// Device type for devices that do not name one.
    pub default_device_type: String,
    /// Group names, or `["all"]`.
    pub groups: Vec<String>,
    /// Commands to run; empty probes connectivity only.
    pub commands: Vec<String>,
    /// Expected prompt per command; ignored unless aligned with `commands`.
    pub prompt_patterns: Vec<String>,
    /// Structured-output template handed to the template parser.
    pub structured_template: Option<String>,
    /// Regex narrowing each result to its first match.
    pub output_filter: Option<String>,
    pub no_match_policy: NoMatchPolicy,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            default_device_type: AUTODETECT.to_string(),
            groups: vec![ALL_GROUPS.to_string()],
            commands: Vec::new(),
            prompt_patterns: Vec::new(),
            structured_template: None,
            output_filter: None,
            no_match_policy: NoMatchPolicy::Flag,
        }
    }
}

/// One command of a run with its optional expected prompt.
#[derive(Debug, Clone)]
pub struct Step {
    pub command: String,
    pub expect: Option<Regex>,
}

/// A validated query, shared read-only by every device task.
#[derive(Debug, Clone)]
pub struct Query {
    pub credentials: Credentials,
    pub default_device_type: String,
    /// Expanded group names in caller order.
    pub groups: Vec<String>,
    /// Commands as given; empty for a connectivity probe.
    pub commands: Vec<String>,
    pub steps: Vec<Step>,
    pub structured_template: Option<String>,
    pub output_filter: Option<Regex>,
    pub no_match_policy: NoMatchPolicy,
}

impl Query {
    /// True when no command was requested.
    pub fn is_probe(&self) -> bool {
        self.steps.is_empty()
    }
}

impl QueryParams {
    /// Validates the parameters against an inventory.
    ///
    /// Fails on an unknown group, an unsupported default device type or a
    /// malformed regex. A lone empty command means "probe only", and prompt
    /// patterns that do not line up with the commands are dropped.
    pub fn validate(self, inventory: &Inventory) -> Result<Query, NetqueryError> {
        let groups = inventory::expand_groups(inventory, &self.groups)?;
        let default_device_type = inventory::validate_device_type(&self.default_device_type)?;
        inventory::warn_if_autodetect_heavy(&default_device_type, inventory.device_count(&groups));

        let commands = if self.commands.iter().all(|c| c.is_empty()) {
            Vec::new()
        } else {
            self.commands
        };

        let aligned = !self.prompt_patterns.is_empty()
            && self.prompt_patterns.len() == commands.len();
        if !self.prompt_patterns.is_empty() && !aligned {
            debug!(
                "Ignoring {} prompt patterns for {} commands",
                self.prompt_patterns.len(),
                commands.len()
            );
        }

        let mut steps = Vec::with_capacity(commands.len());
        for (i, command) in commands.iter().enumerate() {
            let expect = match self.prompt_patterns.get(i) {
                Some(pattern) if aligned && !pattern.is_empty() => Some(Regex::new(pattern)?),
                _ => None,
            };
            steps.push(Step {
                command: command.clone(),
                expect,
            });
        }

        let output_filter = match self.output_filter.as_deref() {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern)?),
            _ => None,
        };

        let structured_template = self.structured_template.filter(|t| !t.is_empty());

        Ok(Query {
            credentials: self.credentials,
            default_device_type,
            groups,
            commands,
            steps,
            structured_template,
            output_filter,
            no_match_policy: self.no_match_policy,
        })
    }
}
