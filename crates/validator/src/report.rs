//! Report files consumed by monitoring.
//!
//! `validation_report.txt` holds one `KEY:name:value;name:value` line per
//! metric, durations in whole seconds. `discovery.json` lists every
//! configured cluster in low-level-discovery shape.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use xbval_core::cluster::ClusterMetrics;

use crate::orchestrator::RunReport;

pub const REPORT_FILE: &str = "validation_report.txt";
pub const DISCOVERY_FILE: &str = "discovery.json";

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to write report file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize discovery document: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Discovery<'a> {
    data: Vec<DiscoveryEntry<'a>>,
}

#[derive(Serialize)]
struct DiscoveryEntry<'a> {
    #[serde(rename = "{#CLUSTER_NAME}")]
    cluster_name: &'a str,
}

/// Paths of the files written by [`ReportAggregator::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFiles {
    pub report: PathBuf,
    pub discovery: PathBuf,
}

pub struct ReportAggregator {
    stats_dir: PathBuf,
}

impl ReportAggregator {
    pub fn new(stats_dir: impl Into<PathBuf>) -> Self {
        Self {
            stats_dir: stats_dir.into(),
        }
    }

    /// Write both files atomically, creating the stats directory if needed.
    pub fn write(&self, report: &RunReport) -> Result<ReportFiles, ReportError> {
        std::fs::create_dir_all(&self.stats_dir).map_err(|source| ReportError::Write {
            path: self.stats_dir.clone(),
            source,
        })?;

        let files = ReportFiles {
            report: self.stats_dir.join(REPORT_FILE),
            discovery: self.stats_dir.join(DISCOVERY_FILE),
        };
        write_atomic(&files.report, &render_report(report, Utc::now()))?;
        write_atomic(&files.discovery, &render_discovery(&report.clusters)?)?;

        tracing::info!(
            report = %files.report.display(),
            discovery = %files.discovery.display(),
            clusters = report.metrics.len(),
            "Validation report written",
        );
        Ok(files)
    }
}

pub fn render_report(report: &RunReport, generated_at: DateTime<Utc>) -> String {
    let line = |key: &str, value: fn(&ClusterMetrics) -> u64| {
        let entries: Vec<String> = report
            .metrics
            .iter()
            .map(|(name, m)| format!("{name}:{}", value(m)))
            .collect();
        format!("{key}:{}\n", entries.join(";"))
    };

    let mut out = String::new();
    out.push_str(&line("EXIT_CODES", |m| m.exit_code as u64));
    out.push_str(&line("RESTORE_DURATIONS", |m| m.restore_duration.as_secs()));
    out.push_str(&line("SIZES", |m| m.size));
    out.push_str(&line("VAL_DURATIONS", |m| m.duration.as_secs()));
    out.push_str(&format!(
        "GENERATED_AT:{}\n",
        generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    out
}

pub fn render_discovery(clusters: &[String]) -> Result<String, serde_json::Error> {
    let doc = Discovery {
        data: clusters
            .iter()
            .map(|name| DiscoveryEntry { cluster_name: name })
            .collect(),
    };
    serde_json::to_string_pretty(&doc)
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, content: &str) -> Result<(), ReportError> {
    let write_err = |source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&tmp, content).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
