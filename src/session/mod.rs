//! SSH sessions to network devices.
//!
//! [`SshConnector`] is the production [`Connector`]: it opens an interactive
//! shell over SSH, waits for the device prompt, turns paging off and then
//! drives commands line by line through the platform's [`DeviceHandler`].
//! Every byte received is appended to the device's [`Transcript`].
//!
//! # Main Components
//!
//! - [`SshConnector`] - opens sessions and probes device types
//! - [`SshSession`] - one open shell, implementing [`Session`]
//! - [`ConnectionSecurityOptions`] - SSH algorithm policy and host key checking

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use async_trait::async_trait;
use log::{debug, trace};
use regex::Regex;
use russh::{ChannelMsg, Preferred};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

use crate::config;
use crate::device::{ANSI_ESCAPE, DeviceHandler, IGNORE_START_LINE, LineKind};
use crate::engine::{ConnectParams, Connector, Session, Transcript};
use crate::error::SessionError;
use crate::platform;
use crate::query::Step;

pub use security::{ConnectionSecurityOptions, SecurityLevel};

/// An interactive shell on one device.
pub struct ShellClient {
    client: Arc<Client>,
    sender: Sender<String>,
    recv: Receiver<String>,
    handler: DeviceHandler,
    address: String,
    io_task: JoinHandle<()>,
    closed: bool,
}

/// SSH implementation of [`Connector`].
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    security: ConnectionSecurityOptions,
}

impl SshConnector {
    pub fn new(security: ConnectionSecurityOptions) -> Self {
        Self { security }
    }

    pub fn security(&self) -> &ConnectionSecurityOptions {
        &self.security
    }
}

/// An open SSH shell, implementing [`Session`].
pub struct SshSession {
    shell: ShellClient,
    command_timeout: Duration,
}

fn handler_error(err: crate::error::NetqueryError) -> SessionError {
    SessionError::Failed(err.to_string())
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(
        &self,
        params: &ConnectParams,
        transcript: Transcript,
    ) -> Result<Box<dyn Session>, SessionError> {
        let platform = platform::by_name(&params.device_type).map_err(handler_error)?;
        let handler = platform
            .handler(params.secret.as_deref())
            .map_err(handler_error)?;

        debug!("{} speaks {} {}", params.host, platform.vendor, platform.family);
        let mut shell = ShellClient::connect(params, handler, &self.security, transcript).await?;
        if let Some(command) = platform.disable_paging
            && let Err(e) = shell.write(command, None, params.command_timeout).await
        {
            shell.close().await;
            return Err(e);
        }

        Ok(Box::new(SshSession {
            shell,
            command_timeout: params.command_timeout,
        }))
    }

    async fn detect(
        &self,
        params: &ConnectParams,
        transcript: Transcript,
    ) -> Result<Option<String>, SessionError> {
        let handler = platform::generic_handler().map_err(handler_error)?;
        let mut shell = ShellClient::connect(params, handler, &self.security, transcript).await?;
        let probe = shell
            .write(platform::DETECTION_PROBE, None, params.command_timeout)
            .await;
        shell.close().await;

        let detected = platform::detect(&probe?);
        debug!("{} probe matched {:?}", params.host, detected);
        Ok(detected.map(str::to_string))
    }
}

#[async_trait]
impl Session for SshSession {
    async fn send(&mut self, command: &str, expect: Option<&Regex>) -> Result<String, SessionError> {
        self.shell.write(command, expect, self.command_timeout).await
    }

    async fn send_sequence(&mut self, steps: &[Step]) -> Result<String, SessionError> {
        let mut outputs = Vec::with_capacity(steps.len());
        for step in steps {
            let output = self
                .shell
                .write(&step.command, step.expect.as_ref(), self.command_timeout)
                .await?;
            outputs.push(output);
        }
        Ok(outputs.join("\n"))
    }

    async fn close(&mut self) {
        self.shell.close().await;
    }
}

mod client;
mod security;
