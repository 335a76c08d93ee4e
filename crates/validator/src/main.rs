//! `xbval` -- restores the latest backup of each configured cluster into a
//! scratch data directory, verifies it with dumps and writes a report.
//!
//! # Usage
//!
//! `xbval [CONFIG_FILE]`
//!
//! The config path is the first argument, else `XBVAL_CONFIG`, else
//! `/etc/xbval/xbval.conf`. See `xbval_core::config` for the keys.
//!
//! Exits `0` only when every cluster validated cleanly.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xbval_core::config::ValidationConfig;
use xbval_validator::orchestrator::{AbortedRun, Orchestrator};
use xbval_validator::report::ReportAggregator;

const DEFAULT_CONFIG_PATH: &str = "/etc/xbval/xbval.conf";

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xbval_validator=info,xbval_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("XBVAL_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into();

    let config = match ValidationConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %config_path.display(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        config = %config_path.display(),
        clusters = ?config.cluster_names,
        data_dir = %config.mysql_data_dir.display(),
        backup_dir = %config.backup_dir.display(),
        "Starting backup validation",
    );

    let runner = Arc::new(config.runner());
    let orchestrator = match Orchestrator::from_config(runner, &config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!(error = %e, "Cannot set up service control");
            return ExitCode::FAILURE;
        }
    };

    let (report, aborted) = match orchestrator.run(&config.clusters()).await {
        Ok(report) => (report, false),
        Err(AbortedRun { report, error }) => {
            tracing::error!(error = %error, "Validation run aborted");
            (report, true)
        }
    };

    if let Err(e) = ReportAggregator::new(&config.stats_dir).write(&report) {
        tracing::error!(error = %e, "Failed to write validation report");
        return ExitCode::FAILURE;
    }

    if aborted || report.exit_code() != 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
