//! A `Job`: a named, scheduled, long-running command and the state
//! machine that tracks it (spec §4.7). Grounded on the teacher's
//! `StageConfig` builder (`aivcs-ci/src/stage.rs`) for the
//! config-struct-with-toggle-methods shape, generalized from a single
//! CI stage to a standalone scheduled job.

use crate::schedule::Schedule;
use serde::{Deserialize, Serialize};

/// Restart policy: whether a finished command should be re-run (spec
/// §4.7: `never` | `always`, implied by `--loop`/`--schedule`/`--restart`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    Never,
    Always,
}

/// Where a job actually runs (spec §4.7, GLOSSARY "Executor").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Executor {
    /// Runs under this process's own `Supervisor`.
    Local,
    /// Runs as a user-level systemd service. Transport is external to
    /// this crate; constructing a job with this executor is accepted,
    /// but `Supervisor` only drives `Local` jobs directly.
    Systemd,
    /// Runs on a remote API instance identified by connector keys, e.g.
    /// `api:prod`. The wire protocol (command + env posted, stdout/
    /// stderr/exit frames streamed back) lives outside this crate.
    Api(String),
}

/// Job lifecycle state (spec §4.7: `created -> running -> (paused <->
/// running) -> stopped -> deleted`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Running,
    Paused,
    Stopped,
    Deleted,
}

impl JobState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Stopped, Running)
                | (_, Deleted)
        )
    }
}

/// A scheduled (or one-shot) job definition plus its current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// May contain spaces/parens; unique per executor (spec §4.7).
    pub name: String,
    /// Full action line, raw tokens preserved (e.g. `["sync", "pipes",
    /// "-c", "sql:main"]`).
    pub command: Vec<String>,
    #[serde(skip)]
    pub schedule: Option<Schedule>,
    /// The unparsed schedule expression, kept for display and so it can
    /// be re-parsed after a restart ([`Schedule`] doesn't round-trip
    /// through serde: its `cron-like` clauses hold a parsed `cron::Schedule`).
    pub schedule_expr: Option<String>,
    pub restart: RestartPolicy,
    pub executor: Executor,
    pub state: JobState,
}

impl Job {
    pub fn new(name: impl Into<String>, command: Vec<String>, executor: Executor) -> Self {
        Self {
            name: name.into(),
            command,
            schedule: None,
            schedule_expr: None,
            restart: RestartPolicy::Never,
            executor,
            state: JobState::Created,
        }
    }

    pub fn with_schedule(mut self, expr: &str) -> mrsm_core::Result<Self> {
        let schedule = Schedule::parse(expr)?;
        self.schedule_expr = Some(expr.to_string());
        self.schedule = Some(schedule);
        self.restart = RestartPolicy::Always;
        Ok(self)
    }

    pub fn with_restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Attempt a state transition, returning the offending pair on an
    /// illegal one rather than panicking — callers (the CLI, the
    /// supervisor) decide how to report that to the user.
    pub fn transition(&mut self, next: JobState) -> Result<(), (JobState, JobState)> {
        if self.state.can_transition_to(next) {
            self.state = next;
            Ok(())
        } else {
            Err((self.state, next))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_can_only_start_running_or_be_deleted() {
        assert!(JobState::Created.can_transition_to(JobState::Running));
        assert!(JobState::Created.can_transition_to(JobState::Deleted));
        assert!(!JobState::Created.can_transition_to(JobState::Paused));
    }

    #[test]
    fn paused_and_running_cycle_freely() {
        assert!(JobState::Running.can_transition_to(JobState::Paused));
        assert!(JobState::Paused.can_transition_to(JobState::Running));
    }

    #[test]
    fn stopped_can_restart() {
        assert!(JobState::Stopped.can_transition_to(JobState::Running));
    }

    #[test]
    fn job_transition_rejects_illegal_move() {
        let mut job = Job::new("nightly sync", vec!["sync".into(), "pipes".into()], Executor::Local);
        let err = job.transition(JobState::Paused).unwrap_err();
        assert_eq!(err, (JobState::Created, JobState::Paused));
    }

    #[test]
    fn with_schedule_defaults_restart_to_always() {
        let job = Job::new("nightly", vec!["sync".into()], Executor::Local)
            .with_schedule("daily")
            .unwrap();
        assert_eq!(job.restart, RestartPolicy::Always);
        assert!(job.schedule.is_some());
    }

    #[test]
    fn name_may_contain_spaces_and_parens() {
        let job = Job::new("nightly sync (prod)", vec!["sync".into()], Executor::Local);
        assert_eq!(job.name, "nightly sync (prod)");
    }
}
