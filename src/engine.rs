//! Multi-device execution engine.
//!
//! The engine turns an [`Inventory`] and a validated [`Query`] into a lazy,
//! ordered stream of [`Emitted`] envelopes, one per (source, group, label).
//! Devices are enumerated source by source, then by group in query order,
//! then by label in insertion order. Up to [`EngineConfig::workers`] devices
//! are in flight at once, but envelopes always come out in enumeration order.
//!
//! The engine talks to devices only through the [`Connector`] and [`Session`]
//! traits; [`crate::session::SshConnector`] is the SSH implementation.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::stream::{self, BoxStream, StreamExt};
use indexmap::IndexMap;
use log::{debug, error, warn};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{NetqueryError, ParseError, SessionError};
use crate::inventory::{DeviceDescriptor, Inventory};
use crate::outcome::{Emitted, Outcome, Progress, ResultEnvelope};
use crate::platform::AUTODETECT;
use crate::query::{NoMatchPolicy, Query, Step};

/// In-memory session transcript owned by one device task.
///
/// The session appends everything it receives; the engine snapshots it into
/// the envelope once the device is finished.
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<String>>);

impl Transcript {
    pub fn append(&self, data: &str) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        guard.push_str(data);
    }

    pub fn snapshot(&self) -> String {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Connection parameters of one device after merging run-wide defaults.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub secret: Option<String>,
    pub device_type: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Descriptor keys the engine does not interpret, for custom connectors.
    pub extra: IndexMap<String, serde_json::Value>,
}

/// Descriptor key overriding the connect timeout, in seconds.
pub const CONNECT_TIMEOUT_KEY: &str = "conn_timeout";
/// Descriptor key overriding the per-command timeout, in seconds.
pub const COMMAND_TIMEOUT_KEY: &str = "read_timeout_override";

/// Reads a timeout in seconds from a descriptor's extra keys.
fn timeout_override(device: &DeviceDescriptor, key: &str) -> Option<Duration> {
    let value = device.extra.get(key)?;
    match value.as_f64().and_then(|secs| Duration::try_from_secs_f64(secs).ok()) {
        Some(timeout) => Some(timeout),
        None => {
            warn!("Ignoring invalid '{}' for {}: {}", key, device.host, value);
            None
        }
    }
}

impl ConnectParams {
    /// Merges a descriptor over the run-wide credentials, default type and
    /// timeouts; the descriptor wins on every field it sets.
    pub fn merge(device: &DeviceDescriptor, query: &Query, config: &EngineConfig) -> Self {
        let mut extra = device.extra.clone();
        extra.shift_remove(CONNECT_TIMEOUT_KEY);
        extra.shift_remove(COMMAND_TIMEOUT_KEY);

        Self {
            host: device.host.clone(),
            port: device.port.unwrap_or(22),
            username: device
                .username
                .clone()
                .unwrap_or_else(|| query.credentials.username.clone()),
            password: device
                .password
                .clone()
                .unwrap_or_else(|| query.credentials.password.clone()),
            secret: device
                .secret
                .clone()
                .or_else(|| query.credentials.secret.clone()),
            device_type: device
                .device_type
                .clone()
                .unwrap_or_else(|| query.default_device_type.clone()),
            connect_timeout: timeout_override(device, CONNECT_TIMEOUT_KEY)
                .unwrap_or_else(|| config.connect_timeout()),
            command_timeout: timeout_override(device, COMMAND_TIMEOUT_KEY)
                .unwrap_or_else(|| config.command_timeout()),
            extra,
        }
    }
}

/// An open interactive session with one device.
#[async_trait]
pub trait Session: Send {
    /// Sends one command and returns its output, waiting for `expect` when
    /// given or for the device prompt otherwise.
    async fn send(
        &mut self,
        command: &str,
        expect: Option<&regex::Regex>,
    ) -> Result<String, SessionError>;

    /// Sends commands in order, each waiting for its own expectation, and
    /// returns the combined output.
    async fn send_sequence(&mut self, steps: &[Step]) -> Result<String, SessionError>;

    /// Tears the session down. Must be safe to call on a broken session.
    async fn close(&mut self);
}

/// Opens sessions and probes device types.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a session, recording everything received into `transcript`.
    async fn open(
        &self,
        params: &ConnectParams,
        transcript: Transcript,
    ) -> Result<Box<dyn Session>, SessionError>;

    /// Probes the device and names its type, or `None` if it is not recognised.
    async fn detect(
        &self,
        params: &ConnectParams,
        transcript: Transcript,
    ) -> Result<Option<String>, SessionError>;
}

/// Turns raw command output into a structured value.
pub trait TemplateParser: Send + Sync {
    fn parse(&self, raw: &str, template: &str) -> Result<serde_json::Value, ParseError>;
}

/// Reverse lookup of a device address.
#[async_trait]
pub trait HostnameResolver: Send + Sync {
    /// Returns a hostname for `ip`, or `ip` itself when none is known.
    async fn resolve(&self, ip: &str) -> String;
}

/// Resolver that performs no lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLookup;

#[async_trait]
impl HostnameResolver for NoLookup {
    async fn resolve(&self, ip: &str) -> String {
        ip.to_string()
    }
}

/// Ordered stream of envelopes produced by [`Engine::execute`].
pub type EnvelopeStream = BoxStream<'static, Emitted>;

/// One device scheduled by a run.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub source: String,
    pub group: String,
    pub label: String,
    pub device: DeviceDescriptor,
}

/// Enumerates the devices a query reaches: source, then group in query
/// order, then label in insertion order.
pub fn plan(inventory: &Inventory, query: &Query) -> Vec<WorkItem> {
    let mut work = Vec::new();
    for (source, groups) in inventory.sources() {
        for group in &query.groups {
            let Some(devices) = groups.get(group) else {
                continue;
            };
            for (label, device) in devices {
                work.push(WorkItem {
                    source: source.to_string(),
                    group: group.clone(),
                    label: label.clone(),
                    device: device.clone(),
                });
            }
        }
    }
    work
}

/// Runs queries against devices through a [`Connector`].
#[derive(Clone)]
pub struct Engine {
    connector: Arc<dyn Connector>,
    parser: Option<Arc<dyn TemplateParser>>,
    resolver: Arc<dyn HostnameResolver>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            parser: None,
            resolver: Arc::new(NoLookup),
            config: EngineConfig::default(),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn TemplateParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostnameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a run and returns its envelopes as a stream.
    ///
    /// Nothing is contacted until the stream is polled. Once `cancel` fires
    /// no further device is started; dropping the stream abandons devices in
    /// flight and tears their sessions down.
    pub fn execute(
        &self,
        inventory: &Inventory,
        query: Arc<Query>,
        cancel: CancellationToken,
    ) -> Result<EnvelopeStream, NetqueryError> {
        if query.structured_template.is_some() && self.parser.is_none() {
            return Err(NetqueryError::TemplateParserMissing);
        }

        let work = plan(inventory, &query);
        let total = work.len();
        let workers = self.config.workers();
        debug!("Planned {} devices with {} workers", total, workers);

        let engine = self.clone();
        let stream = stream::iter(work.into_iter().enumerate())
            .take_while(move |_| futures::future::ready(!cancel.is_cancelled()))
            .map(move |(index, item)| {
                let engine = engine.clone();
                let query = query.clone();
                async move {
                    let envelope = engine.query_device(item, &query).await;
                    Emitted {
                        envelope,
                        progress: Progress {
                            completed: index + 1,
                            total,
                        },
                    }
                }
            })
            .buffered(workers);

        Ok(stream.boxed())
    }

    /// Runs to completion and returns every envelope in enumeration order.
    pub async fn run_batch(
        &self,
        inventory: &Inventory,
        query: Arc<Query>,
    ) -> Result<Vec<ResultEnvelope>, NetqueryError> {
        let stream = self.execute(inventory, query, CancellationToken::new())?;
        Ok(stream.map(|emitted| emitted.envelope).collect().await)
    }

    /// Queries one device. Never fails: every error, panics in collaborators
    /// included, becomes an outcome.
    pub async fn query_device(&self, item: WorkItem, query: &Query) -> ResultEnvelope {
        let transcript = Transcript::default();
        let mut params = ConnectParams::merge(&item.device, query, &self.config);
        let hostname = match AssertUnwindSafe(self.resolver.resolve(&params.host))
            .catch_unwind()
            .await
        {
            Ok(hostname) => hostname,
            Err(panic) => {
                let cause = panic_message(&*panic);
                warn!("Hostname lookup of {} panicked: {}", params.host, cause);
                params.host.clone()
            }
        };
        debug!("Querying '{}' ({}) in {}/{}", item.label, hostname, item.source, item.group);

        let attempt = AssertUnwindSafe(self.attempt(&mut params, query, &transcript));
        let outcome = match attempt.catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => Outcome::from(err),
            Err(panic) => panicked(&*panic),
        };
        let transcript = transcript.snapshot();

        match &outcome {
            Outcome::Success(_) | Outcome::ConnectivityOnly => {
                debug!("Task complete for '{}' ({})", item.label, hostname)
            }
            Outcome::Unauthorized => {
                warn!("Authentication failure at '{}' ({})", item.label, hostname)
            }
            Outcome::TimedOut => warn!("Failed to connect to '{}' ({})", item.label, hostname),
            Outcome::UnknownDeviceType => {
                warn!("Unknown device type at '{}' ({})", item.label, hostname)
            }
            Outcome::NoMatches(_) => {
                warn!("Output filter found no matches for '{}' ({})", item.label, hostname)
            }
            Outcome::OtherFailure(detail) => error!(
                "Unexpected error from '{}' ({}): {}\n{}",
                item.label, hostname, detail, transcript
            ),
        }

        let device_type = match outcome {
            Outcome::UnknownDeviceType => None,
            _ => Some(params.device_type),
        };

        ResultEnvelope {
            source: item.source,
            group: item.group,
            label: item.label,
            hostname,
            ip: item.device.host,
            device_type,
            outcome,
            transcript,
        }
    }

    async fn attempt(
        &self,
        params: &mut ConnectParams,
        query: &Query,
        transcript: &Transcript,
    ) -> Result<Outcome, SessionError> {
        if params.device_type == AUTODETECT {
            let detected = guard(
                params.connect_timeout.saturating_add(params.command_timeout),
                self.connector.detect(params, transcript.clone()),
            )
            .await?;
            match detected {
                Some(device_type) => {
                    debug!("Detected '{}' as {}", params.host, device_type);
                    params.device_type = device_type;
                }
                None => return Ok(Outcome::UnknownDeviceType),
            }
        }

        let mut session = guard(
            params.connect_timeout,
            self.connector.open(params, transcript.clone()),
        )
        .await?;
        let result = AssertUnwindSafe(self.dispatch(session.as_mut(), params, query))
            .catch_unwind()
            .await;
        session.close().await;
        result.unwrap_or_else(|panic| Ok(panicked(&*panic)))
    }

    async fn dispatch(
        &self,
        session: &mut dyn Session,
        params: &ConnectParams,
        query: &Query,
    ) -> Result<Outcome, SessionError> {
        let raw = match query.steps.as_slice() {
            [] => return Ok(Outcome::ConnectivityOnly),
            [step] => {
                guard(
                    params.command_timeout,
                    session.send(&step.command, step.expect.as_ref()),
                )
                .await?
            }
            steps => {
                guard(
                    params
                        .command_timeout
                        .saturating_mul(u32::try_from(steps.len()).unwrap_or(u32::MAX)),
                    session.send_sequence(steps),
                )
                .await?
            }
        };

        let text = match (&query.structured_template, &self.parser) {
            (Some(template), Some(parser)) => match parser.parse(&raw, template) {
                Ok(value) => canonical_text(&value),
                Err(err) => return Ok(Outcome::OtherFailure(err.to_string())),
            },
            _ => raw,
        };

        Ok(apply_filter(text, query))
    }
}

/// Bounds a collaborator call; elapsing counts as a timeout.
async fn guard<T, F>(limit: Duration, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(format!(
            "no answer within {}s",
            limit.as_secs()
        ))),
    }
}

fn panicked(payload: &(dyn Any + Send)) -> Outcome {
    Outcome::OtherFailure(format!("panicked: {}", panic_message(payload)))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Canonical text of a structured result: strings as-is, anything else as JSON.
pub fn canonical_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Narrows output to the first match of the query's filter.
pub fn apply_filter(text: String, query: &Query) -> Outcome {
    let Some(filter) = &query.output_filter else {
        return Outcome::Success(text);
    };
    if let Some(found) = filter.find(&text) {
        return Outcome::Success(found.as_str().to_string());
    }
    match query.no_match_policy {
        NoMatchPolicy::Flag => Outcome::NoMatches(text),
        NoMatchPolicy::KeepOutput => {
            warn!("'{}' found no matches; keeping unfiltered output", filter);
            Outcome::Success(text)
        }
    }
}
