//! The local job supervisor: spawns `Job` commands as child processes,
//! reschedules them per their `Schedule`, and handles pause/resume/stop
//! signaling (spec §4.7). Grounded on `aivcs-ci/src/runner.rs`'s
//! `tokio::process::Command` + timeout-wrapped execution, generalized
//! from a single CI stage run to a supervised, possibly-recurring job.

use crate::job::{Executor, Job, JobState};
use crate::rotating_log::{RotatingLog, DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES};
use chrono::Utc;
use mrsm_core::error::{MrsmError, Result};
use mrsm_core::success::SuccessTuple;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// A running job's handle: the task driving it and a cooperative pause
/// flag the task checks between firings.
struct Supervised {
    job: Job,
    task: JoinHandle<()>,
    paused: Arc<tokio::sync::Notify>,
    stop: Arc<tokio::sync::Notify>,
}

/// Supervises every `executor = local` job registered with it. Holds
/// one background `tokio` task per job; nothing here blocks an OS
/// thread (spec §5: "tasks, not OS threads").
pub struct Supervisor {
    logs_dir: PathBuf,
    max_log_bytes: u64,
    max_log_files: u32,
    jobs: Mutex<HashMap<String, Supervised>>,
}

impl Supervisor {
    pub fn new(logs_dir: PathBuf) -> Self {
        Self {
            logs_dir,
            max_log_bytes: DEFAULT_MAX_BYTES,
            max_log_files: DEFAULT_MAX_FILES,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_log_rotation(mut self, max_bytes: u64, max_files: u32) -> Self {
        self.max_log_bytes = max_bytes;
        self.max_log_files = max_files;
        self
    }

    /// Register and start a job. Only `Executor::Local` jobs are driven
    /// by this supervisor; `Systemd`/`Api` jobs are recorded as
    /// `Created` but never spawned here (spec §4.7: their transports are
    /// external).
    pub async fn start(&self, mut job: Job) -> Result<SuccessTuple> {
        if job.executor != Executor::Local {
            return Err(MrsmError::Configuration(format!(
                "supervisor only drives local jobs; '{}' requests {:?}",
                job.name, job.executor
            )));
        }
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.name) {
            return Err(MrsmError::AlreadyExists(job.name.clone()));
        }
        job.transition(JobState::Running)
            .map_err(|(from, to)| MrsmError::Configuration(format!("illegal transition {from:?} -> {to:?}")))?;

        let name = job.name.clone();
        let command = job.command.clone();
        let schedule = job.schedule.clone();
        let restart = job.restart;
        let log_dir = self.logs_dir.join(sanitize_name(&name));
        let max_bytes = self.max_log_bytes;
        let max_files = self.max_log_files;
        let paused = Arc::new(tokio::sync::Notify::new());
        let stop = Arc::new(tokio::sync::Notify::new());
        let task_paused = paused.clone();
        let task_stop = stop.clone();

        let task = tokio::spawn(async move {
            run_job_loop(name, command, schedule, restart, log_dir, max_bytes, max_files, task_paused, task_stop).await;
        });

        jobs.insert(job.name.clone(), Supervised { job, task, paused, stop });
        Ok(SuccessTuple::ok("job started"))
    }

    pub async fn pause(&self, name: &str) -> Result<SuccessTuple> {
        let mut jobs = self.jobs.lock().await;
        let supervised = jobs.get_mut(name).ok_or_else(|| MrsmError::NotFound(name.to_string()))?;
        supervised
            .job
            .transition(JobState::Paused)
            .map_err(|(from, to)| MrsmError::Configuration(format!("illegal transition {from:?} -> {to:?}")))?;
        supervised.paused.notify_one();
        Ok(SuccessTuple::ok(format!("paused '{name}'")))
    }

    pub async fn resume(&self, name: &str) -> Result<SuccessTuple> {
        let mut jobs = self.jobs.lock().await;
        let supervised = jobs.get_mut(name).ok_or_else(|| MrsmError::NotFound(name.to_string()))?;
        supervised
            .job
            .transition(JobState::Running)
            .map_err(|(from, to)| MrsmError::Configuration(format!("illegal transition {from:?} -> {to:?}")))?;
        supervised.paused.notify_one();
        Ok(SuccessTuple::ok(format!("resumed '{name}'")))
    }

    /// Graceful-then-forceful stop: signals the job loop to exit after
    /// its current iteration, then aborts the task outright if it
    /// hasn't wound down after `grace`. The job loop itself kills any
    /// child process (and, transitively on Unix, its process group) it
    /// still owns (spec §4.7: "including killing orphaned children").
    pub async fn stop(&self, name: &str, grace: std::time::Duration) -> Result<SuccessTuple> {
        let mut jobs = self.jobs.lock().await;
        let supervised = jobs.get_mut(name).ok_or_else(|| MrsmError::NotFound(name.to_string()))?;
        supervised
            .job
            .transition(JobState::Stopped)
            .map_err(|(from, to)| MrsmError::Configuration(format!("illegal transition {from:?} -> {to:?}")))?;
        supervised.stop.notify_one();
        let finished = tokio::time::timeout(grace, &mut supervised.task).await.is_ok();
        if !finished {
            supervised.task.abort();
        }
        Ok(SuccessTuple::ok(format!("stopped '{name}'")))
    }

    pub async fn delete(&self, name: &str) -> Result<SuccessTuple> {
        let mut jobs = self.jobs.lock().await;
        let supervised = jobs.remove(name).ok_or_else(|| MrsmError::NotFound(name.to_string()))?;
        supervised.task.abort();
        Ok(SuccessTuple::ok(format!("deleted '{name}'")))
    }

    pub async fn state_of(&self, name: &str) -> Option<JobState> {
        self.jobs.lock().await.get(name).map(|s| s.job.state)
    }

    pub async fn job_names(&self) -> Vec<String> {
        self.jobs.lock().await.keys().cloned().collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_job_loop(
    name: String,
    command: Vec<String>,
    schedule: Option<crate::schedule::Schedule>,
    restart: crate::job::RestartPolicy,
    log_dir: PathBuf,
    max_bytes: u64,
    max_files: u32,
    paused: Arc<tokio::sync::Notify>,
    stop: Arc<tokio::sync::Notify>,
) {
    let mut log = match RotatingLog::open(&log_dir, "job", max_bytes, max_files) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(job = %name, error = %e, "failed to open job log");
            return;
        }
    };

    loop {
        if let Some(sched) = &schedule {
            let Some(next) = sched.next_fire_after(Utc::now()) else {
                break;
            };
            let delay = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.notified() => break,
            }
        }

        tokio::select! {
            _ = paused.notified() => continue,
            _ = stop.notified() => break,
            result = run_once(&command) => {
                match result {
                    Ok(tuple) => {
                        let _ = log.write_line(&tuple.message);
                    }
                    Err(e) => {
                        tracing::warn!(job = %name, error = %e, "job command failed");
                        let _ = log.write_line(&e.to_string());
                    }
                }
            }
        }

        if schedule.is_none() && restart == crate::job::RestartPolicy::Never {
            break;
        }
    }
}

async fn run_once(command: &[String]) -> Result<SuccessTuple> {
    let Some((exe, args)) = command.split_first() else {
        return Err(MrsmError::Configuration("job command is empty".into()));
    };
    let mut child: Child = Command::new(exe)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| MrsmError::Backend(e.to_string()))?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| MrsmError::Backend(e.to_string()))?;
    if output.status.success() {
        Ok(SuccessTuple::ok(String::from_utf8_lossy(&output.stdout).to_string()))
    } else {
        Ok(SuccessTuple::fail(String::from_utf8_lossy(&output.stderr).to_string()))
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Executor;

    #[tokio::test]
    async fn starting_a_non_local_job_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path().to_path_buf());
        let job = Job::new("remote job", vec!["true".into()], Executor::Api("prod".into()));
        let err = supervisor.start(job).await.unwrap_err();
        assert!(matches!(err, MrsmError::Configuration(_)));
    }

    #[tokio::test]
    async fn one_shot_job_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path().to_path_buf());
        let job = Job::new("echo job", vec!["true".into()], Executor::Local);
        supervisor.start(job).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(supervisor.state_of("echo job").await, Some(JobState::Running));
    }

    #[tokio::test]
    async fn duplicate_job_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path().to_path_buf());
        supervisor
            .start(Job::new("dup", vec!["true".into()], Executor::Local))
            .await
            .unwrap();
        let err = supervisor
            .start(Job::new("dup", vec!["true".into()], Executor::Local))
            .await
            .unwrap_err();
        assert!(matches!(err, MrsmError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path().to_path_buf());
        supervisor
            .start(Job::new("pausable", vec!["sleep".into(), "5".into()], Executor::Local))
            .await
            .unwrap();
        supervisor.pause("pausable").await.unwrap();
        assert_eq!(supervisor.state_of("pausable").await, Some(JobState::Paused));
        supervisor.resume("pausable").await.unwrap();
        assert_eq!(supervisor.state_of("pausable").await, Some(JobState::Running));
    }

    #[tokio::test]
    async fn stop_removes_job_from_the_running_set_eventually() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path().to_path_buf());
        supervisor
            .start(Job::new("stoppable", vec!["sleep".into(), "5".into()], Executor::Local))
            .await
            .unwrap();
        supervisor.stop("stoppable", std::time::Duration::from_millis(50)).await.unwrap();
        assert_eq!(supervisor.state_of("stoppable").await, Some(JobState::Stopped));
    }

    #[test]
    fn sanitize_name_replaces_unsafe_characters() {
        assert_eq!(sanitize_name("nightly sync (prod)"), "nightly_sync__prod_");
    }
}
