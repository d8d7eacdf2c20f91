//! Display tables.
//!
//! Rows are sorted by `(result, source, group, label, hostname, ip, device
//! type)` so identical outcomes cluster together regardless of the order in
//! which devices finished. Repeated values in the leading result, source and
//! group columns are then masked for readability. Masking is cosmetic only:
//! exports are built from the unmasked rows.

use std::cmp::Ordering;
use std::fmt;

use comfy_table::{CellAlignment, Table, modifiers, presets};

use crate::config::MASK_PLACEHOLDER;
use crate::inventory::Inventory;
use crate::outcome::ResultEnvelope;
use crate::query::Query;

/// Headers of a full display row, before any column is dropped.
pub const DISPLAY_COLUMNS: [&str; 7] = [
    "Result",
    "File",
    "Group",
    "Label",
    "Hostname",
    "IP",
    "Device Type",
];

/// Number of leading columns subject to masking.
const MASKED_PREFIX: usize = 3;

const SOURCE_COLUMN: usize = 1;
const GROUP_COLUMN: usize = 2;

/// How many sources and groups a run covered; decides dropped columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderContext {
    pub sources: usize,
    pub groups: usize,
}

impl RenderContext {
    pub fn for_query(inventory: &Inventory, query: &Query) -> Self {
        Self {
            sources: inventory.source_count(),
            groups: query.groups.len(),
        }
    }
}

/// A table ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Full, unmasked display row of an envelope.
pub fn display_row(envelope: &ResultEnvelope) -> [String; 7] {
    [
        envelope.outcome.label().into_owned(),
        envelope.source.clone(),
        envelope.group.clone(),
        envelope.label.clone(),
        envelope.hostname.clone(),
        envelope.ip.clone(),
        envelope.device_type.clone().unwrap_or_default(),
    ]
}

fn compare(a: &ResultEnvelope, b: &ResultEnvelope) -> Ordering {
    a.outcome
        .label()
        .cmp(&b.outcome.label())
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.group.cmp(&b.group))
        .then_with(|| a.label.cmp(&b.label))
        .then_with(|| a.hostname.cmp(&b.hostname))
        .then_with(|| a.ip.cmp(&b.ip))
        .then_with(|| a.device_type.cmp(&b.device_type))
}

/// Sorts envelopes by the display key. The sort is stable.
pub fn sorted(envelopes: &[ResultEnvelope]) -> Vec<&ResultEnvelope> {
    let mut refs: Vec<&ResultEnvelope> = envelopes.iter().collect();
    refs.sort_by(|a, b| compare(a, b));
    refs
}

/// Masks leading cells that repeat the previous row.
///
/// Column `j < prefix` is masked when columns `0..=j` all equal the
/// preceding row's unmasked values.
pub fn mask_repeats(rows: &mut [Vec<String>], prefix: usize, placeholder: &str) {
    let mut previous: Option<Vec<String>> = None;
    for row in rows.iter_mut() {
        let original = row.clone();
        if let Some(prev) = &previous {
            for j in 0..prefix.min(row.len()) {
                if original[..=j] != prev[..=j] {
                    break;
                }
                row[j] = placeholder.to_string();
            }
        }
        previous = Some(original);
    }
}

/// Builds the display table of a run.
pub fn render(envelopes: &[ResultEnvelope], context: &RenderContext) -> DisplayTable {
    let mut rows: Vec<Vec<String>> = sorted(envelopes)
        .into_iter()
        .map(|e| display_row(e).to_vec())
        .collect();
    mask_repeats(&mut rows, MASKED_PREFIX, MASK_PLACEHOLDER);

    let mut dropped = Vec::new();
    if context.sources == 1 {
        dropped.push(SOURCE_COLUMN);
    }
    if context.groups == 1 {
        dropped.push(GROUP_COLUMN);
    }

    let keep = |index: &usize| !dropped.contains(index);
    let headers = (0..DISPLAY_COLUMNS.len())
        .filter(keep)
        .map(|i| DISPLAY_COLUMNS[i].to_string())
        .collect();
    let rows = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .enumerate()
                .filter(|(i, _)| keep(i))
                .map(|(_, cell)| cell)
                .collect()
        })
        .collect();

    DisplayTable { headers, rows }
}

/// Title line printed above a table.
pub fn title(commands: &[String]) -> String {
    if commands.is_empty() {
        "Result of 'accessing the devices'".to_string()
    } else {
        format!("Result of '{}'", commands.join("+"))
    }
}

impl DisplayTable {
    /// Rounded box grid with a leading, right-aligned row index.
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .apply_modifier(modifiers::UTF8_ROUND_CORNERS);

        table.set_header(std::iter::once(String::new()).chain(self.headers.iter().cloned()));
        for (index, row) in self.rows.iter().enumerate() {
            table.add_row(std::iter::once(index.to_string()).chain(row.iter().cloned()));
        }
        if let Some(column) = table.column_mut(0) {
            column.set_cell_alignment(CellAlignment::Right);
        }
        table
    }
}

impl fmt::Display for DisplayTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_table())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;

    fn envelope(source: &str, group: &str, label: &str, outcome: Outcome) -> ResultEnvelope {
        ResultEnvelope {
            source: source.to_string(),
            group: group.to_string(),
            label: label.to_string(),
            hostname: label.to_string(),
            ip: format!("10.0.0.{}", label.len()),
            device_type: Some("cisco_ios".to_string()),
            outcome,
            transcript: String::new(),
        }
    }

    #[test]
    fn failures_sort_first_and_single_source_group_columns_drop() {
        let envelopes = vec![
            envelope("f1", "core", "r1", Outcome::Success("IOS 15.2".into())),
            envelope("f1", "core", "r2", Outcome::TimedOut),
        ];
        let table = render(&envelopes, &RenderContext { sources: 1, groups: 1 });

        assert_eq!(
            table.headers,
            vec!["Result", "Label", "Hostname", "IP", "Device Type"]
        );
        assert_eq!(table.rows[0][0], "(timeout)");
        assert_eq!(table.rows[0][1], "r2");
        assert_eq!(table.rows[1][0], "IOS 15.2");
    }

    #[test]
    fn masking_follows_the_column_prefix() {
        let mut rows = vec![
            vec!["ok".to_string(), "f1".to_string(), "core".to_string(), "r1".to_string()],
            vec!["ok".to_string(), "f1".to_string(), "core".to_string(), "r2".to_string()],
            vec!["ok".to_string(), "f2".to_string(), "core".to_string(), "r3".to_string()],
            vec!["no".to_string(), "f2".to_string(), "core".to_string(), "r4".to_string()],
        ];
        mask_repeats(&mut rows, 3, "''");

        assert_eq!(rows[0], vec!["ok", "f1", "core", "r1"]);
        assert_eq!(rows[1], vec!["''", "''", "''", "r2"]);
        assert_eq!(rows[2], vec!["''", "f2", "core", "r3"]);
        assert_eq!(rows[3], vec!["no", "f2", "core", "r4"]);
    }

    #[test]
    fn multi_source_multi_group_keeps_all_columns() {
        let envelopes = vec![
            envelope("f2", "edge", "e1", Outcome::Unauthorized),
            envelope("f1", "core", "r1", Outcome::Unauthorized),
            envelope("f1", "edge", "e2", Outcome::Unauthorized),
        ];
        let table = render(&envelopes, &RenderContext { sources: 2, groups: 2 });
        assert_eq!(table.headers.len(), DISPLAY_COLUMNS.len());
        assert_eq!(table.rows[0][..3], ["(unauthorized)", "f1", "core"]);
        assert_eq!(table.rows[1][..3], ["''", "''", "edge"]);
        assert_eq!(table.rows[2][..3], ["''", "f2", "edge"]);
    }

    #[test]
    fn rendering_is_idempotent_and_order_independent() {
        let a = envelope("f1", "core", "r1", Outcome::Success("x".into()));
        let b = envelope("f1", "core", "r2", Outcome::ConnectivityOnly);
        let context = RenderContext { sources: 1, groups: 1 };

        let first = render(&[a.clone(), b.clone()], &context).to_string();
        let second = render(&[b, a], &context).to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn grid_output_has_rounded_corners_and_index() {
        let envelopes = vec![envelope(
            "f1",
            "core",
            "r1",
            Outcome::Success("line one\nline two".into()),
        )];
        let text = render(&envelopes, &RenderContext { sources: 1, groups: 1 }).to_string();
        assert!(text.starts_with('╭'));
        assert!(text.trim_end().ends_with('╯'));
        assert!(
            text.lines()
                .any(|line| line.starts_with("│ 0 ") && line.contains("line one"))
        );
        assert!(text.lines().any(|line| line.contains("line two")));
    }

    #[test]
    fn title_names_commands_or_probe() {
        assert_eq!(title(&[]), "Result of 'accessing the devices'");
        assert_eq!(
            title(&["show clock".to_string(), "show version".to_string()]),
            "Result of 'show clock+show version'"
        );
    }
}
