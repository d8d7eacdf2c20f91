#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use netquery::engine::{ConnectParams, Connector, Session, Transcript};
use netquery::error::SessionError;
use netquery::inventory::{Inventory, InventorySource};
use netquery::query::Step;
use regex::Regex;

pub const LAB_JSON: &str = include_str!("../fixtures/lab.json");
pub const HOSTS_TXT: &str = include_str!("../fixtures/hosts.txt");

pub fn lab() -> Inventory {
    Inventory::from_sources([InventorySource::new("lab.json", LAB_JSON)]).expect("lab inventory")
}

pub fn lab_and_hosts() -> Inventory {
    Inventory::from_sources([
        InventorySource::new("lab.json", LAB_JSON),
        InventorySource::new("hosts.txt", HOSTS_TXT),
    ])
    .expect("lab and hosts inventory")
}

/// Canned behaviour of one host.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub reply: String,
    pub open_error: Option<SessionError>,
    pub send_error: Option<SessionError>,
    /// `Some(None)` makes detection find nothing.
    pub detect: Option<Option<String>>,
    pub open_delay: Option<Duration>,
    pub send_delay: Option<Duration>,
    /// Message of a panic raised while opening.
    pub panic: Option<String>,
}

impl Script {
    pub fn reply(text: &str) -> Self {
        Self {
            reply: text.to_string(),
            ..Self::default()
        }
    }

    pub fn failing_open(err: SessionError) -> Self {
        Self {
            open_error: Some(err),
            ..Self::default()
        }
    }

    pub fn failing_send(err: SessionError) -> Self {
        Self {
            send_error: Some(err),
            ..Self::default()
        }
    }

    pub fn panicking(message: &str) -> Self {
        Self {
            panic: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn detects(mut self, device_type: Option<&str>) -> Self {
        self.detect = Some(device_type.map(str::to_string));
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn stalled(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub sends: AtomicUsize,
    pub detects: AtomicUsize,
    pub closes: AtomicUsize,
    /// Sessions dropped, closed or not.
    pub released: AtomicUsize,
}

/// Commands with the expectation they were sent with, one entry per call.
pub type Dialog = Vec<(String, Option<String>)>;

/// A connector answering from per-host scripts; unknown hosts echo `ok`.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    scripts: HashMap<String, Script>,
    fallback: Script,
    pub counters: Arc<Counters>,
    pub opened_types: Mutex<Vec<(String, String)>>,
    pub sequences: Arc<Mutex<Vec<Dialog>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            fallback: Script::reply("ok"),
            ..Self::default()
        }
    }

    pub fn with(mut self, host: &str, script: Script) -> Self {
        self.scripts.insert(host.to_string(), script);
        self
    }

    pub fn with_fallback(mut self, script: Script) -> Self {
        self.fallback = script;
        self
    }

    fn script(&self, host: &str) -> &Script {
        self.scripts.get(host).unwrap_or(&self.fallback)
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.counters.sends.load(Ordering::SeqCst)
    }

    pub fn detects(&self) -> usize {
        self.counters.detects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    pub fn sequences(&self) -> Vec<Dialog> {
        self.sequences.lock().expect("sequences").clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(
        &self,
        params: &ConnectParams,
        transcript: Transcript,
    ) -> Result<Box<dyn Session>, SessionError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let script = self.script(&params.host).clone();
        if let Some(delay) = script.open_delay {
            tokio::time::sleep(delay).await;
        }
        transcript.append(&format!("connected to {}\n", params.host));
        if let Some(message) = &script.panic {
            panic!("{message}");
        }
        if let Some(err) = script.open_error {
            return Err(err);
        }
        self.opened_types
            .lock()
            .expect("opened types")
            .push((params.host.clone(), params.device_type.clone()));

        Ok(Box::new(ScriptedSession {
            host: params.host.clone(),
            script,
            transcript,
            counters: self.counters.clone(),
            sequences: self.sequences.clone(),
        }))
    }

    async fn detect(
        &self,
        params: &ConnectParams,
        _transcript: Transcript,
    ) -> Result<Option<String>, SessionError> {
        self.counters.detects.fetch_add(1, Ordering::SeqCst);
        let script = self.script(&params.host);
        if let Some(err) = &script.open_error {
            return Err(err.clone());
        }
        Ok(script.detect.clone().flatten())
    }
}

struct ScriptedSession {
    host: String,
    script: Script,
    transcript: Transcript,
    counters: Arc<Counters>,
    sequences: Arc<Mutex<Vec<Dialog>>>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn send(&mut self, command: &str, _expect: Option<&Regex>) -> Result<String, SessionError> {
        self.counters.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.script.send_delay {
            tokio::time::sleep(delay).await;
        }
        self.transcript
            .append(&format!("{}#{}\n{}\n", self.host, command, self.script.reply));
        match &self.script.send_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.script.reply.clone()),
        }
    }

    async fn send_sequence(&mut self, steps: &[Step]) -> Result<String, SessionError> {
        let dialog = steps
            .iter()
            .map(|step| {
                let expect = step.expect.as_ref().map(|e| e.as_str().to_string());
                (step.command.clone(), expect)
            })
            .collect();
        self.sequences.lock().expect("sequences").push(dialog);

        let mut outputs = Vec::new();
        for step in steps {
            outputs.push(self.send(&step.command, step.expect.as_ref()).await?);
        }
        Ok(outputs.join("\n"))
    }

    async fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}
