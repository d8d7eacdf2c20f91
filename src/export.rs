//! Result exports.
//!
//! A run is exported as one row per device with the columns of [`COLUMNS`],
//! sorted like the display table but never masked. The format follows the
//! target file's extension. CSV exports can be read back, and
//! [`inventory::from_export`](crate::inventory::from_export) turns them into
//! an inventory for a follow-up run.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use comfy_table::{Table, presets};
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::NetqueryError;
use crate::outcome::ResultEnvelope;
use crate::render;

/// Export column headers, in order.
pub const COLUMNS: [&str; 8] = [
    "Result",
    "File",
    "Group",
    "Label",
    "Hostname",
    "IP",
    "Device Type",
    "Log",
];

/// One exported device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExportRow {
    #[serde(rename = "Result")]
    pub result: String,
    #[serde(rename = "File")]
    pub file: String,
    #[serde(rename = "Group")]
    pub group: String,
    #[serde(rename = "Label")]
    pub label: String,
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Device Type")]
    pub device_type: String,
    #[serde(rename = "Log")]
    pub log: String,
}

impl From<&ResultEnvelope> for ExportRow {
    fn from(envelope: &ResultEnvelope) -> Self {
        Self {
            result: envelope.outcome.label().into_owned(),
            file: envelope.source.clone(),
            group: envelope.group.clone(),
            label: envelope.label.clone(),
            hostname: envelope.hostname.clone(),
            ip: envelope.ip.clone(),
            device_type: envelope.device_type.clone().unwrap_or_default(),
            log: envelope.transcript.clone(),
        }
    }
}

/// A column usable as group or label key when rebuilding an inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ExportField {
    File,
    Group,
    Label,
    Hostname,
    #[serde(rename = "IP")]
    Ip,
    #[serde(rename = "Device Type")]
    DeviceType,
    Result,
    Log,
}

impl ExportField {
    /// Default grouping when rebuilding an inventory from an export.
    pub const DEFAULT_GROUP_BY: ExportField = ExportField::DeviceType;
    /// Default device label when rebuilding an inventory from an export.
    pub const DEFAULT_LABEL_BY: ExportField = ExportField::Hostname;
}

impl ExportRow {
    pub fn field(&self, field: ExportField) -> &str {
        match field {
            ExportField::File => &self.file,
            ExportField::Group => &self.group,
            ExportField::Label => &self.label,
            ExportField::Hostname => &self.hostname,
            ExportField::Ip => &self.ip,
            ExportField::DeviceType => &self.device_type,
            ExportField::Result => &self.result,
            ExportField::Log => &self.log,
        }
    }

    fn cells(&self) -> [&str; 8] {
        [
            &self.result,
            &self.file,
            &self.group,
            &self.label,
            &self.hostname,
            &self.ip,
            &self.device_type,
            &self.log,
        ]
    }
}

/// Sorted, unmasked export rows of a run.
pub fn rows(envelopes: &[ResultEnvelope]) -> Vec<ExportRow> {
    render::sorted(envelopes)
        .into_iter()
        .map(ExportRow::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    /// One JSON object per line.
    Json,
    Html,
    Text,
}

impl ExportFormat {
    /// Format implied by a path's extension; unknown extensions export as text.
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("csv") => Self::Csv,
            Some("json") => Self::Json,
            Some("html") => Self::Html,
            Some("txt") => Self::Text,
            _ => {
                warn!(
                    "Unknown export extension for '{}', writing text",
                    path.display()
                );
                Self::Text
            }
        }
    }

    pub fn render(self, rows: &[ExportRow]) -> Result<String, NetqueryError> {
        match self {
            Self::Csv => to_csv(rows),
            Self::Json => to_json_lines(rows),
            Self::Html => Ok(to_html(rows)),
            Self::Text => Ok(to_text(rows)),
        }
    }
}

pub fn to_csv(rows: &[ExportRow]) -> Result<String, NetqueryError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if rows.is_empty() {
        writer.write_record(COLUMNS)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| NetqueryError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| NetqueryError::Export(e.to_string()))
}

pub fn to_json_lines(rows: &[ExportRow]) -> Result<String, NetqueryError> {
    let mut out = String::new();
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    Ok(out)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '\n' => escaped.push_str("<br>"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn to_html(rows: &[ExportRow]) -> String {
    let mut out = String::from("<table border=\"1\" class=\"dataframe\">\n  <thead>\n    <tr>\n");
    for column in COLUMNS {
        out.push_str(&format!("      <th>{}</th>\n", escape_html(column)));
    }
    out.push_str("    </tr>\n  </thead>\n  <tbody>\n");
    for row in rows {
        out.push_str("    <tr>\n");
        for cell in row.cells() {
            out.push_str(&format!("      <td>{}</td>\n", escape_html(cell)));
        }
        out.push_str("    </tr>\n");
    }
    out.push_str("  </tbody>\n</table>\n");
    out
}

/// Borderless, left-aligned text table; embedded newlines are written as `\n`.
pub fn to_text(rows: &[ExportRow]) -> String {
    let flatten = |cell: &str| cell.replace('\r', "").replace('\n', "\\n");

    let mut table = Table::new();
    table.load_preset(presets::NOTHING);
    table.set_header(COLUMNS);
    for row in rows {
        table.add_row(row.cells().map(flatten));
    }
    for column in table.column_iter_mut() {
        column.set_padding((0, 2));
    }

    let mut out = String::new();
    for line in table.to_string().lines() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Writes rows to `path` in the format its extension implies.
pub fn write(path: &Path, rows: &[ExportRow]) -> Result<ExportFormat, NetqueryError> {
    let format = ExportFormat::from_path(path);
    let contents = format.render(rows)?;
    fs::write(path, contents)?;
    info!("Output written to '{}'", path.display());
    Ok(format)
}

/// Reads rows back from a CSV export.
pub fn read_csv(path: &Path) -> Result<Vec<ExportRow>, NetqueryError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Default export name: the joined commands (or `accessible` for a probe)
/// followed by a UTC timestamp.
pub fn default_filename(commands: &[String], now: DateTime<Utc>) -> String {
    let stem = if commands.is_empty() {
        "accessible".to_string()
    } else {
        commands.join("+").replace(' ', "_")
    };
    format!("{stem}__{}.csv", now.format("%Y-%m-%d_%H-%M-%S_UTC"))
}
