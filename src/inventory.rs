//! Device inventories.
//!
//! An [`Inventory`] maps a source name (usually the file it was loaded from)
//! to groups, each group to device labels, and each label to a
//! [`DeviceDescriptor`]. Insertion order is preserved at every level so that
//! enumeration, and therefore progress reporting, is reproducible.

use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::AUTODETECT_WARN_THRESHOLD;
use crate::error::NetqueryError;
use crate::export::{ExportField, ExportRow};
use crate::platform::{self, AUTODETECT};

/// Group name used for plain-text inventories.
pub const DEFAULT_GROUP: &str = "default";

/// Selector that expands to every group of every source.
pub const ALL_GROUPS: &str = "all";

/// Connection parameters of one device.
///
/// Only `host` is mandatory. Anything set here overrides the run-wide
/// credentials and default device type. `conn_timeout` and
/// `read_timeout_override` (seconds) override the run's timeouts; other keys
/// are kept in `extra` and handed to the connector untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Enable (privileged mode) password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl DeviceDescriptor {
    /// A descriptor with only a host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            device_type: None,
            port: None,
            username: None,
            password: None,
            secret: None,
            extra: IndexMap::new(),
        }
    }

    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }
}

/// Devices of one group, keyed by label.
pub type Group = IndexMap<String, DeviceDescriptor>;

/// Groups of one source, keyed by group name.
pub type Groups = IndexMap<String, Group>;

/// Raw contents of one inventory source.
#[derive(Debug, Clone)]
pub struct InventorySource {
    pub name: String,
    pub contents: String,
}

impl InventorySource {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// All devices known to a run, immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    sources: IndexMap<String, Groups>,
}

impl Inventory {
    /// Parses every source by its name's extension.
    pub fn from_sources<I>(sources: I) -> Result<Self, NetqueryError>
    where
        I: IntoIterator<Item = InventorySource>,
    {
        let mut inventory = Self::default();
        for source in sources {
            let groups = parse_source(&source.name, &source.contents)?;
            debug!(
                "Loaded inventory source '{}' with {} groups",
                source.name,
                groups.len()
            );
            inventory.sources.insert(source.name, groups);
        }
        Ok(inventory)
    }

    /// Reads and parses inventory files; the path becomes the source name.
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, NetqueryError> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let name = path.display().to_string();
            let contents =
                std::fs::read_to_string(path).map_err(|e| NetqueryError::InvalidInventory {
                    source_name: name.clone(),
                    reason: e.to_string(),
                })?;
            sources.push(InventorySource { name, contents });
        }
        Self::from_sources(sources)
    }

    /// Adds (or replaces) a source built in memory.
    pub fn insert_source(&mut self, name: impl Into<String>, groups: Groups) {
        self.sources.insert(name.into(), groups);
    }

    pub fn sources(&self) -> impl Iterator<Item = (&str, &Groups)> {
        self.sources.iter().map(|(name, groups)| (name.as_str(), groups))
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Union of group names across sources, in first-seen order.
    pub fn group_names(&self) -> Vec<String> {
        let mut names = IndexSet::new();
        for groups in self.sources.values() {
            for group in groups.keys() {
                names.insert(group.clone());
            }
        }
        names.into_iter().collect()
    }

    /// Number of (source, group, label) triples reachable through `groups`.
    pub fn device_count(&self, groups: &[String]) -> usize {
        self.sources
            .values()
            .flat_map(|source| groups.iter().filter_map(|g| source.get(g)))
            .map(|group| group.len())
            .sum()
    }
}

/// Parses one source: `.json` documents map groups to labels to descriptors;
/// anything else is a list of hosts, one per line, in the `default` group.
pub fn parse_source(name: &str, contents: &str) -> Result<Groups, NetqueryError> {
    if name.to_ascii_lowercase().ends_with(".json") {
        let groups: Groups =
            serde_json::from_str(contents).map_err(|e| NetqueryError::InvalidInventory {
                source_name: name.to_string(),
                reason: e.to_string(),
            })?;
        for (group, devices) in &groups {
            for (label, device) in devices {
                if device.host.trim().is_empty() {
                    return Err(NetqueryError::InvalidInventory {
                        source_name: name.to_string(),
                        reason: format!("device '{label}' in group '{group}' has an empty host"),
                    });
                }
            }
        }
        return Ok(groups);
    }

    let mut group = Group::new();
    for line in contents.lines() {
        let host = line.trim();
        if host.is_empty() {
            continue;
        }
        group.insert(host.to_string(), DeviceDescriptor::new(host));
    }
    let mut groups = Groups::new();
    groups.insert(DEFAULT_GROUP.to_string(), group);
    Ok(groups)
}

/// Resolves a group selector against an inventory.
///
/// `["all"]` expands to the union of every source's groups. Otherwise every
/// named group must exist in at least one source; duplicates are collapsed
/// and the caller's order is kept.
pub fn expand_groups(
    inventory: &Inventory,
    requested: &[String],
) -> Result<Vec<String>, NetqueryError> {
    let available = inventory.group_names();

    if requested.is_empty() || (requested.len() == 1 && requested[0] == ALL_GROUPS) {
        return Ok(available);
    }

    let mut groups = IndexSet::new();
    let mut missing = Vec::new();
    for group in requested {
        if available.contains(group) {
            groups.insert(group.clone());
        } else if !missing.contains(group) {
            missing.push(group.clone());
        }
    }

    if !missing.is_empty() {
        return Err(NetqueryError::UnknownGroup { missing, available });
    }
    Ok(groups.into_iter().collect())
}

/// Checks a device type against the supported platform catalog.
pub fn validate_device_type(name: &str) -> Result<String, NetqueryError> {
    if !platform::is_supported(name) {
        return Err(NetqueryError::UnsupportedDeviceType(name.to_string()));
    }
    Ok(name.to_string())
}

/// Logs a warning when `autodetect` is the default for a large batch.
///
/// Detection costs an extra login per device, so it is discouraged for
/// large inventories but never refused.
pub fn warn_if_autodetect_heavy(default_device_type: &str, device_count: usize) -> bool {
    if default_device_type == AUTODETECT && device_count > AUTODETECT_WARN_THRESHOLD {
        warn!(
            "'{}' is the default device type for {} devices; detection adds a login per device",
            AUTODETECT, device_count
        );
        return true;
    }
    false
}

/// Rebuilds an inventory from exported rows.
///
/// Devices are grouped by `group_by` and labelled by `label_by`; the host
/// comes from the IP column and the device type is kept.
pub fn from_export(rows: &[ExportRow], group_by: ExportField, label_by: ExportField) -> Groups {
    let mut groups = Groups::new();
    for row in rows {
        let mut device = DeviceDescriptor::new(row.ip.clone());
        if !row.device_type.is_empty() {
            device.device_type = Some(row.device_type.clone());
        }
        groups
            .entry(row.field(group_by).to_string())
            .or_default()
            .insert(row.field(label_by).to_string(), device);
    }
    groups
}

/// Serializes groups as a JSON inventory document.
pub fn to_json(groups: &Groups) -> Result<String, NetqueryError> {
    Ok(serde_json::to_string_pretty(groups)?)
}
