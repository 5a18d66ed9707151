//! Lifecycle of one simulation run: submit, observe, finish.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{RunId, SimulationApi, SubmitOutcome};
use crate::error::{Error, Result};
use crate::generation::GenerationLog;
use crate::poll::{PollEvent, PollEventKind};

pub const MSG_CONFIG_INVALID: &str = "configuration invalid: fix validation errors";
pub const MSG_SUBMIT_FAILED: &str = "failed to run simulation";

/// Status reported by the service for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        })
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(Error::msg(format!("unknown run status '{other}'"))),
        }
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Client-side phase of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Submitting,
    Running,
    Rejected(String),
    Completed,
    Failed(String),
}

impl RunPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, RunPhase::Running)
    }

    pub fn accepts_submit(&self) -> bool {
        !matches!(self, RunPhase::Submitting)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Submitting => "submitting",
            RunPhase::Running => "running",
            RunPhase::Rejected(_) => "rejected",
            RunPhase::Completed => "completed",
            RunPhase::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub generations: GenerationLog,
}

/// Owns the active run. Each submit opens a new epoch; events from any
/// other epoch are ignored, which is how superseded pollers are fenced off.
#[derive(Debug)]
pub struct RunController {
    phase: RunPhase,
    run: Option<Run>,
    epoch: u64,
}

impl Default for RunController {
    fn default() -> Self {
        Self::new()
    }
}

impl RunController {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
            run: None,
            epoch: 0,
        }
    }

    pub fn phase(&self) -> &RunPhase {
        &self.phase
    }

    pub fn run(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn generations(&self) -> GenerationLog {
        self.run
            .as_ref()
            .map(|r| Arc::clone(&r.generations))
            .unwrap_or_default()
    }

    /// Enter SUBMITTING, dropping the previous run. Returns the new epoch.
    pub fn begin_submit(&mut self) -> Result<u64> {
        if !self.phase.accepts_submit() {
            return Err(Error::msg("a submission is already in flight"));
        }
        self.epoch += 1;
        self.run = None;
        self.phase = RunPhase::Submitting;
        debug!(epoch = self.epoch, "run submission started");
        Ok(self.epoch)
    }

    /// Resolve a submission started by `begin_submit`. Stale epochs are ignored.
    pub fn finish_submit(&mut self, epoch: u64, outcome: Result<SubmitOutcome>) -> &RunPhase {
        if epoch != self.epoch || self.phase != RunPhase::Submitting {
            debug!(epoch, current = self.epoch, "dropping stale submission result");
            return &self.phase;
        }
        self.phase = match outcome {
            Ok(SubmitOutcome::Started(id)) => {
                info!(run = %id, epoch, "run started");
                self.run = Some(Run {
                    id,
                    status: RunStatus::Pending,
                    generations: Arc::new(Vec::new()),
                });
                RunPhase::Running
            }
            Ok(SubmitOutcome::Invalid) => {
                warn!("run rejected: configuration invalid");
                RunPhase::Rejected(MSG_CONFIG_INVALID.into())
            }
            Ok(SubmitOutcome::Failed(reason)) => {
                warn!(%reason, "run submission failed");
                RunPhase::Rejected(MSG_SUBMIT_FAILED.into())
            }
            Err(e) => {
                warn!(error = %e, "run submission failed");
                RunPhase::Rejected(MSG_SUBMIT_FAILED.into())
            }
        };
        &self.phase
    }

    pub fn submit(&mut self, api: &dyn SimulationApi, config: Option<&Value>) -> Result<&RunPhase> {
        let epoch = self.begin_submit()?;
        let outcome = api.start_run(config);
        Ok(self.finish_submit(epoch, outcome))
    }

    /// Fold a poller event into the run. Returns false when the event was
    /// dropped (stale epoch, or the run is no longer RUNNING).
    pub fn apply(&mut self, ev: &PollEvent) -> bool {
        if ev.epoch != self.epoch || !self.phase.is_running() {
            debug!(epoch = ev.epoch, current = self.epoch, "dropping poll event");
            return false;
        }
        let Some(run) = self.run.as_mut() else {
            return false;
        };
        match &ev.kind {
            PollEventKind::Progress {
                status,
                generations,
                ..
            } => {
                if generations.len() < run.generations.len() {
                    warn!(
                        held = run.generations.len(),
                        got = generations.len(),
                        "ignoring shrinking generation snapshot"
                    );
                    return false;
                }
                run.status = *status;
                run.generations = Arc::clone(generations);
                match status {
                    RunStatus::Completed => {
                        info!(run = %run.id, generations = run.generations.len(), "run completed");
                        self.phase = RunPhase::Completed;
                    }
                    RunStatus::Failed => {
                        warn!(run = %run.id, "service reported run failure");
                        self.phase = RunPhase::Failed("simulation failed".into());
                    }
                    RunStatus::Pending | RunStatus::Running => {}
                }
            }
            PollEventKind::TickFailed { error, .. } => {
                debug!(run = %run.id, %error, "poll tick failed");
            }
            PollEventKind::Stopped { error } => {
                warn!(run = %run.id, %error, "polling gave up");
                self.phase = RunPhase::Failed(error.clone());
            }
        }
        true
    }

    /// Leave RUNNING without a terminal status (teardown).
    pub fn abandon(&mut self) {
        if self.phase.is_running() || self.phase == RunPhase::Submitting {
            self.epoch += 1;
            self.phase = RunPhase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Generation;

    fn progress(epoch: u64, status: RunStatus, n: usize) -> PollEvent {
        PollEvent {
            epoch,
            kind: PollEventKind::Progress {
                status,
                appended: n,
                generations: Arc::new(vec![Arc::new(Generation::default()); n]),
            },
        }
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("completed".parse::<RunStatus>().unwrap(), RunStatus::Completed);
        let s: RunStatus = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(s, RunStatus::Running);
        assert!("DONE".parse::<RunStatus>().is_err());
    }

    #[test]
    fn submit_outcomes_map_to_phases() {
        let mut rc = RunController::new();
        let e = rc.begin_submit().unwrap();
        assert_eq!(
            rc.finish_submit(e, Ok(SubmitOutcome::Invalid)),
            &RunPhase::Rejected(MSG_CONFIG_INVALID.into())
        );
        let e = rc.begin_submit().unwrap();
        assert_eq!(
            rc.finish_submit(e, Err(Error::msg("connection refused"))),
            &RunPhase::Rejected(MSG_SUBMIT_FAILED.into())
        );
        let e = rc.begin_submit().unwrap();
        rc.finish_submit(e, Ok(SubmitOutcome::Started(RunId::from("r1"))));
        assert!(rc.phase().is_running());
        assert_eq!(rc.run().unwrap().id, RunId::from("r1"));
    }

    #[test]
    fn cannot_submit_while_submitting() {
        let mut rc = RunController::new();
        rc.begin_submit().unwrap();
        assert!(rc.begin_submit().is_err());
    }

    #[test]
    fn new_run_resets_generations_and_fences_old_epoch() {
        let mut rc = RunController::new();
        let e1 = rc.begin_submit().unwrap();
        rc.finish_submit(e1, Ok(SubmitOutcome::Started(RunId::from("a"))));
        assert!(rc.apply(&progress(e1, RunStatus::Running, 3)));
        assert_eq!(rc.generations().len(), 3);

        let e2 = rc.begin_submit().unwrap();
        rc.finish_submit(e2, Ok(SubmitOutcome::Started(RunId::from("b"))));
        assert!(rc.generations().is_empty());
        assert!(!rc.apply(&progress(e1, RunStatus::Running, 5)));
        assert!(rc.generations().is_empty());
    }

    #[test]
    fn completion_stops_accepting_progress() {
        let mut rc = RunController::new();
        let e = rc.begin_submit().unwrap();
        rc.finish_submit(e, Ok(SubmitOutcome::Started(RunId::from("a"))));
        assert!(rc.apply(&progress(e, RunStatus::Completed, 2)));
        assert_eq!(rc.phase(), &RunPhase::Completed);
        assert!(!rc.apply(&progress(e, RunStatus::Running, 4)));
        assert_eq!(rc.generations().len(), 2);
    }

    #[test]
    fn stopped_poller_fails_the_run() {
        let mut rc = RunController::new();
        let e = rc.begin_submit().unwrap();
        rc.finish_submit(e, Ok(SubmitOutcome::Started(RunId::from("a"))));
        rc.apply(&PollEvent {
            epoch: e,
            kind: PollEventKind::Stopped {
                error: "too many failures".into(),
            },
        });
        assert_eq!(rc.phase(), &RunPhase::Failed("too many failures".into()));
    }

    #[test]
    fn stale_submit_result_is_ignored() {
        let mut rc = RunController::new();
        let e1 = rc.begin_submit().unwrap();
        rc.abandon();
        rc.finish_submit(e1, Ok(SubmitOutcome::Started(RunId::from("late"))));
        assert_eq!(rc.phase(), &RunPhase::Idle);
        assert!(rc.run().is_none());
    }
}
