//! Calibration Store
//!
//! Per-(source, channel) correction polynomials loaded from a sectioned
//! key-value file:
//!
//! ```text
//! [Modbus]
//! Channel_0=0.0, 0.0, 1.0, 0.0 |2024-01-01 12:00:00|
//! [DAQ]
//! Channel_0=1.2e-3, -0.4, 2.0, 0.1
//! ```
//!
//! Parsing is tolerant: a malformed entry is logged and resolves to the
//! identity transform, and loading continues with the next line.
//!
//! The active table lives behind an [`ArcSwap`]; `reload` replaces it in one
//! atomic pointer swap, so a reader holding [`CalibrationStore::table`] sees
//! either the old table or the new one, never a mix.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, warn};

use super::CalibrationError;
use crate::types::CalibrationParams;

/// Timestamp format of the `|...|` save annotation.
pub const SAVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[allow(clippy::unwrap_used)] // literal pattern
fn channel_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^channel_(\d+)$").unwrap())
}

// ============================================================================
// Table
// ============================================================================

/// One channel's coefficients plus the time they were last saved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationEntry {
    pub params: CalibrationParams,
    pub saved_at: Option<NaiveDateTime>,
}

impl CalibrationEntry {
    pub fn new(params: CalibrationParams) -> Self {
        Self {
            params,
            saved_at: None,
        }
    }
}

/// A problem found while parsing one line of a calibration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    /// 1-based line number
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Nested mapping: source section name → channel index → entry.
///
/// Lookups of unknown sections or channels resolve to the identity transform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    sections: BTreeMap<String, BTreeMap<usize, CalibrationEntry>>,
}

impl CalibrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coefficients for `(source, channel)`, identity if unconfigured.
    pub fn params(&self, source: &str, channel: usize) -> CalibrationParams {
        self.sections
            .get(source)
            .and_then(|channels| channels.get(&channel))
            .map_or(CalibrationParams::IDENTITY, |e| e.params)
    }

    pub fn entry(&self, source: &str, channel: usize) -> Option<&CalibrationEntry> {
        self.sections.get(source).and_then(|c| c.get(&channel))
    }

    /// Evaluate the correction polynomial for `(source, channel)` at `raw`.
    pub fn apply(&self, source: &str, channel: usize, raw: f64) -> f64 {
        self.params(source, channel).apply(raw)
    }

    pub fn insert(&mut self, source: &str, channel: usize, entry: CalibrationEntry) {
        self.sections
            .entry(source.to_string())
            .or_default()
            .insert(channel, entry);
    }

    pub fn set(&mut self, source: &str, channel: usize, params: CalibrationParams) {
        self.insert(source, channel, CalibrationEntry::new(params));
    }

    /// Number of (source, channel) entries.
    pub fn len(&self) -> usize {
        self.sections.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Parse file contents. Never fails: problems are returned alongside
    /// the table and the affected channel resolves to identity.
    pub fn parse(contents: &str) -> (Self, Vec<ParseIssue>) {
        let mut table = Self::new();
        let mut issues = Vec::new();
        let mut section: Option<String> = None;

        for (idx, raw_line) in contents.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                match rest.strip_suffix(']') {
                    Some(name) if !name.trim().is_empty() => {
                        section = Some(name.trim().to_string());
                    }
                    _ => {
                        issues.push(ParseIssue {
                            line: line_no,
                            message: format!("malformed section header '{line}'"),
                        });
                        section = None;
                    }
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                issues.push(ParseIssue {
                    line: line_no,
                    message: format!("expected 'key=value', got '{line}'"),
                });
                continue;
            };

            let Some(source) = section.as_deref() else {
                issues.push(ParseIssue {
                    line: line_no,
                    message: "entry outside of any [section]".to_string(),
                });
                continue;
            };

            let key = key.trim();
            let Some(channel) = channel_key_regex()
                .captures(key)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<usize>().ok())
            else {
                issues.push(ParseIssue {
                    line: line_no,
                    message: format!("unrecognised key '{key}' in [{source}]"),
                });
                continue;
            };

            match parse_value(value) {
                Ok(entry) => table.insert(source, channel, entry),
                Err(message) => {
                    issues.push(ParseIssue {
                        line: line_no,
                        message: format!("[{source}] {key}: {message}, using identity"),
                    });
                    table.insert(source, channel, CalibrationEntry::new(CalibrationParams::IDENTITY));
                }
            }
        }

        (table, issues)
    }

    /// Read and parse a calibration file, logging every parse issue.
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CalibrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let (table, issues) = Self::parse(&contents);
        for issue in &issues {
            warn!(path = %path.display(), "Calibration entry ignored: {}", issue);
        }
        debug!(
            path = %path.display(),
            entries = table.len(),
            issues = issues.len(),
            "Calibration file parsed"
        );
        Ok(table)
    }

    /// Render the table in file syntax. Entries without a save time are
    /// written without an annotation.
    pub fn to_file_string(&self) -> String {
        let mut out = String::new();
        for (source, channels) in &self.sections {
            out.push('[');
            out.push_str(source);
            out.push_str("]\n");
            for (channel, entry) in channels {
                let p = entry.params;
                out.push_str(&format!(
                    "Channel_{channel}={:?}, {:?}, {:?}, {:?}",
                    p.a, p.b, p.c, p.d
                ));
                if let Some(ts) = entry.saved_at {
                    out.push_str(&format!(" |{}|", ts.format(SAVE_TIMESTAMP_FORMAT)));
                }
                out.push('\n');
            }
        }
        out
    }

    /// Write the table atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        let io_err = |source: std::io::Error| CalibrationError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, self.to_file_string()).map_err(io_err)?;
        std::fs::rename(&tmp_path, path).map_err(io_err)?;
        Ok(())
    }
}

/// Parse `a, b, c, d [|timestamp|] [; comment]`.
fn parse_value(value: &str) -> Result<CalibrationEntry, String> {
    let (coeffs, annotation) = match value.split_once('|') {
        Some((c, rest)) => (c, Some(rest)),
        None => (value, None),
    };
    let coeffs = coeffs
        .split([';', '#'])
        .next()
        .unwrap_or_default()
        .trim();

    let parts: Vec<&str> = coeffs.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(format!("expected 4 coefficients, got {}", parts.len()));
    }

    let mut c = [0.0; 4];
    for (slot, part) in c.iter_mut().zip(&parts) {
        let v: f64 = part
            .parse()
            .map_err(|_| format!("'{part}' is not a number"))?;
        if !v.is_finite() {
            return Err(format!("'{part}' is not finite"));
        }
        *slot = v;
    }

    // The annotation is informational; an unreadable one is dropped silently.
    let saved_at = annotation
        .and_then(|a| a.split('|').next())
        .and_then(|ts| NaiveDateTime::parse_from_str(ts.trim(), SAVE_TIMESTAMP_FORMAT).ok());

    Ok(CalibrationEntry {
        params: CalibrationParams::from(c),
        saved_at,
    })
}

// ============================================================================
// Store
// ============================================================================

/// Shared, hot-swappable calibration table.
///
/// Many readers (`apply`, aggregator ticks) and one writer role (reload /
/// commit). Writers are serialised by an internal lock; readers never block.
#[derive(Debug)]
pub struct CalibrationStore {
    table: ArcSwap<CalibrationTable>,
    writer: Mutex<()>,
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new(CalibrationTable::new())
    }
}

impl CalibrationStore {
    pub fn new(table: CalibrationTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            writer: Mutex::new(()),
        }
    }

    /// Load the store from `path`. A missing or unreadable file yields an
    /// empty (all-identity) table with a warning rather than an error.
    pub fn open(path: &Path) -> Self {
        match CalibrationTable::load(path) {
            Ok(table) => {
                info!(path = %path.display(), entries = table.len(), "Calibration loaded");
                Self::new(table)
            }
            Err(e) => {
                warn!(error = %e, "No usable calibration file, all channels use identity");
                Self::default()
            }
        }
    }

    /// The current table. Hold on to the returned `Arc` to get a consistent
    /// view across many lookups.
    pub fn table(&self) -> Arc<CalibrationTable> {
        self.table.load_full()
    }

    pub fn apply(&self, source: &str, channel: usize, raw: f64) -> f64 {
        self.table.load().apply(source, channel, raw)
    }

    pub fn params(&self, source: &str, channel: usize) -> CalibrationParams {
        self.table.load().params(source, channel)
    }

    /// Replace the whole table.
    pub fn replace(&self, table: CalibrationTable) {
        let _guard = self.writer.lock();
        self.table.store(Arc::new(table));
    }

    /// Re-read `path` and atomically swap it in. On I/O failure the
    /// previous table stays active.
    pub fn reload(&self, path: &Path) -> Result<usize, CalibrationError> {
        let _guard = self.writer.lock();
        let table = CalibrationTable::load(path)?;
        let entries = table.len();
        self.table.store(Arc::new(table));
        info!(path = %path.display(), entries, "Calibration table reloaded");
        Ok(entries)
    }

    /// Save the current table to `path`.
    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        let _guard = self.writer.lock();
        self.table.load().save(path)
    }

    /// Merge `params` for `source` into the current table, write it to
    /// `path`, then reload from disk.
    ///
    /// Nothing changes in memory unless the write succeeds.
    pub fn commit(
        &self,
        path: &Path,
        source: &str,
        params: &BTreeMap<usize, CalibrationParams>,
    ) -> Result<usize, CalibrationError> {
        {
            let _guard = self.writer.lock();
            let now = Local::now().naive_local();
            let mut merged = CalibrationTable::clone(&self.table.load());
            for (&channel, &p) in params {
                merged.insert(
                    source,
                    channel,
                    CalibrationEntry {
                        params: p,
                        saved_at: Some(now),
                    },
                );
            }
            merged.save(path)?;
            info!(
                path = %path.display(),
                source,
                channels = params.len(),
                "Calibration committed"
            );
        }
        self.reload(path)
    }
}
