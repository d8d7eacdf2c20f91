//! # netquery - Run commands across fleets of network devices
//!
//! `netquery` loads device inventories, runs a list of commands (or a plain
//! connectivity probe) against every device of the selected groups over SSH,
//! and aggregates one result per device into a deterministic table. Results
//! can be collected as a batch, streamed live with cancellation, and exported
//! to CSV, JSON lines, HTML or text.
//!
//! ## Features
//!
//! - **Inventories**: JSON `{group: {label: {host, ...}}}` or plain host lists, merged across files
//! - **Bounded Concurrency**: devices are queried by a worker pool, results keep inventory order
//! - **Closed Outcomes**: every device yields exactly one of seven outcome kinds, never an error
//! - **Autodetection**: unknown platforms are probed and matched against a signature catalog
//! - **Live Streams**: server-sent events with per-stream cancellation and a bounded TTL store
//! - **Exports**: sorted, unmasked rows that can be read back into an inventory
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use netquery::engine::Engine;
//! use netquery::inventory::Inventory;
//! use netquery::query::{Credentials, QueryParams};
//! use netquery::render::{self, RenderContext};
//! use netquery::session::SshConnector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let inventory = Inventory::load_files(&["devices.json"])?;
//!     let query = QueryParams {
//!         credentials: Credentials::new("admin", "password"),
//!         default_device_type: "cisco_ios".to_string(),
//!         commands: vec!["show version".to_string()],
//!         output_filter: Some(r"Version \S+".to_string()),
//!         ..QueryParams::default()
//!     }
//!     .validate(&inventory)?;
//!
//!     let context = RenderContext::for_query(&inventory, &query);
//!     let engine = Engine::new(Arc::new(SshConnector::default()));
//!     let envelopes = engine.run_batch(&inventory, Arc::new(query.clone())).await?;
//!
//!     println!("{}", render::title(&query.commands));
//!     println!("{}", render::render(&envelopes, &context));
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`inventory::Inventory`] - Device sources, groups and group expansion
//! - [`query::QueryParams`] - Operator input, validated into a [`query::Query`]
//! - [`engine::Engine`] - Concurrent execution producing [`outcome::ResultEnvelope`]s
//! - [`render`] / [`export`] - Display tables and export files
//! - [`stream::StreamStore`] - Live streams for event-stream transports
//! - [`session::SshConnector`] - SSH implementation of [`engine::Connector`]

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod export;
pub mod inventory;
pub mod outcome;
pub mod platform;
pub mod query;
pub mod render;
pub mod session;
pub mod stream;
