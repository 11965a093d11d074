//! `mrsmd` — the long-running daemon that hosts a [`Supervisor`] for
//! this host's `executor: local` jobs (spec §4.7). Reads job
//! definitions from the merged config document's `jobs` array at
//! startup and keeps them running until a shutdown signal arrives.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use mrsm_core::config::Config;
use mrsm_core::telemetry::init_tracing;
use mrsm_scheduler::{Executor, Job, RestartPolicy, Supervisor};
use tracing::Level;

/// One entry of the config document's `jobs` array, e.g.:
/// `{"name": "nightly sync", "command": ["mrsm", "sync", "pipes"],
/// "schedule": "daily", "restart": "always"}`.
#[derive(serde::Deserialize)]
struct JobSpec {
    name: String,
    command: Vec<String>,
    schedule: Option<String>,
    #[serde(default)]
    restart: RestartSpec,
}

#[derive(serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum RestartSpec {
    #[default]
    Never,
    Always,
}

#[tokio::main]
async fn main() -> Result<()> {
    let verbose = std::env::var("MRSM_VERBOSE").is_ok();
    init_tracing(false, if verbose { Level::DEBUG } else { Level::INFO });

    let config = Config::load().context("loading configuration")?;
    let logs_dir = logs_dir(&config);
    std::fs::create_dir_all(&logs_dir).with_context(|| format!("creating {}", logs_dir.display()))?;

    let supervisor = Supervisor::new(logs_dir);
    let job_specs = load_job_specs(&config);
    tracing::info!(count = job_specs.len(), "starting configured jobs");

    for spec in job_specs {
        let mut job = Job::new(spec.name.clone(), spec.command, Executor::Local);
        job = match &spec.schedule {
            Some(expr) => match job.with_schedule(expr) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!(job = %spec.name, error = %e, "invalid schedule expression; skipping job");
                    continue;
                }
            },
            None => job.with_restart(match spec.restart {
                RestartSpec::Never => RestartPolicy::Never,
                RestartSpec::Always => RestartPolicy::Always,
            }),
        };

        match supervisor.start(job).await {
            Ok(tuple) => tracing::info!(job = %spec.name, message = %tuple.message, "job started"),
            Err(e) => tracing::error!(job = %spec.name, error = %e, "failed to start job"),
        }
    }

    tracing::info!("mrsmd ready; awaiting shutdown signal");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested; stopping jobs");

    for name in supervisor.job_names().await {
        if let Err(e) = supervisor.stop(&name, Duration::from_secs(10)).await {
            tracing::warn!(job = %name, error = %e, "error stopping job during shutdown");
        }
    }

    Ok(())
}

fn logs_dir(config: &Config) -> PathBuf {
    config
        .get("jobs_logs_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| config.root_dir.join("jobs"))
}

fn load_job_specs(config: &Config) -> Vec<JobSpec> {
    let Some(jobs) = config.get("jobs").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    jobs.iter()
        .filter_map(|j| match serde_json::from_value::<JobSpec>(j.clone()) {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed job entry in config");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_dir_falls_back_to_root_dir_jobs() {
        let config = Config {
            document: serde_json::json!({}),
            root_dir: PathBuf::from("/tmp/mrsm-test-root"),
        };
        assert_eq!(logs_dir(&config), PathBuf::from("/tmp/mrsm-test-root/jobs"));
    }

    #[test]
    fn logs_dir_honors_explicit_override() {
        let config = Config {
            document: serde_json::json!({"jobs_logs_dir": "/var/log/mrsm"}),
            root_dir: PathBuf::from("/tmp/mrsm-test-root"),
        };
        assert_eq!(logs_dir(&config), PathBuf::from("/var/log/mrsm"));
    }

    #[test]
    fn load_job_specs_parses_valid_entries_and_skips_malformed_ones() {
        let config = Config {
            document: serde_json::json!({
                "jobs": [
                    {"name": "nightly sync", "command": ["mrsm", "sync", "pipes"], "schedule": "daily"},
                    {"name": "bad entry"},
                ]
            }),
            root_dir: PathBuf::from("/tmp/mrsm-test-root"),
        };
        let specs = load_job_specs(&config);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "nightly sync");
    }
}
