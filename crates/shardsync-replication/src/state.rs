//! Replication attempt state
//!
//! ```text
//! Idle -> CheckpointReceived -> GettingCheckpointInfo -> FileDiff
//!      -> GettingFiles -> Finalizing -> Done
//!                 (FileDiff -> Finalizing when nothing is missing)
//!
//! any non-terminal stage -> Cancelled | Failed
//! ```

use serde::Serialize;
use shardsync_common::{Error, Result};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStage {
    Idle,
    CheckpointReceived,
    GettingCheckpointInfo,
    FileDiff,
    GettingFiles,
    Finalizing,
    Done,
    Cancelled,
    Failed,
}

impl ReplicationStage {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }

    /// Stages during which a newer checkpoint cancels the attempt
    pub const fn is_cancellable(self) -> bool {
        !self.is_terminal() && !matches!(self, Self::Finalizing)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckpointReceived => "checkpoint_received",
            Self::GettingCheckpointInfo => "getting_checkpoint_info",
            Self::FileDiff => "file_diff",
            Self::GettingFiles => "getting_files",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    fn can_transition_to(self, next: Self) -> bool {
        use ReplicationStage::{
            Cancelled, CheckpointReceived, Done, Failed, FileDiff, Finalizing,
            GettingCheckpointInfo, GettingFiles, Idle,
        };
        match (self, next) {
            (from, Cancelled | Failed) => !from.is_terminal(),
            (Idle, CheckpointReceived)
            | (CheckpointReceived, GettingCheckpointInfo)
            | (GettingCheckpointInfo, FileDiff)
            | (FileDiff, GettingFiles | Finalizing)
            | (GettingFiles, Finalizing)
            | (Finalizing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ReplicationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage and per-stage timings of one replication attempt
#[derive(Debug, Clone)]
pub struct ReplicationState {
    stage: ReplicationStage,
    started: Instant,
    stage_started: Instant,
    timings: Vec<(ReplicationStage, Duration)>,
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationState {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            stage: ReplicationStage::Idle,
            started: now,
            stage_started: now,
            timings: Vec::new(),
        }
    }

    pub fn stage(&self) -> ReplicationStage {
        self.stage
    }

    /// Move to `next`, recording the time spent in the current stage
    pub fn transition(&mut self, next: ReplicationStage) -> Result<()> {
        if !self.stage.can_transition_to(next) {
            return Err(Error::internal(format!(
                "illegal replication transition {} -> {}",
                self.stage, next
            )));
        }
        let now = Instant::now();
        self.timings
            .push((self.stage, now.duration_since(self.stage_started)));
        self.stage = next;
        self.stage_started = now;
        Ok(())
    }

    /// Completed stages in order with the time spent in each
    pub fn timings(&self) -> &[(ReplicationStage, Duration)] {
        &self.timings
    }

    pub fn time_in(&self, stage: ReplicationStage) -> Duration {
        self.timings
            .iter()
            .filter(|(s, _)| *s == stage)
            .map(|(_, d)| *d)
            .sum()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReplicationStage::*;

    #[test]
    fn test_full_path() {
        let mut state = ReplicationState::new();
        for next in [
            CheckpointReceived,
            GettingCheckpointInfo,
            FileDiff,
            GettingFiles,
            Finalizing,
            Done,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state.stage(), Done);
        assert_eq!(state.timings().len(), 6);
        assert_eq!(state.timings()[0].0, Idle);
    }

    #[test]
    fn test_nothing_to_fetch_skips_getting_files() {
        let mut state = ReplicationState::new();
        state.transition(CheckpointReceived).unwrap();
        state.transition(GettingCheckpointInfo).unwrap();
        state.transition(FileDiff).unwrap();
        state.transition(Finalizing).unwrap();
        state.transition(Done).unwrap();
        assert_eq!(state.time_in(GettingFiles), Duration::ZERO);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut state = ReplicationState::new();
        assert!(state.transition(GettingFiles).is_err());
        state.transition(CheckpointReceived).unwrap();
        assert!(state.transition(Done).is_err());
        assert_eq!(state.stage(), CheckpointReceived);
    }

    #[test]
    fn test_terminal_stages_are_final() {
        let mut state = ReplicationState::new();
        state.transition(CheckpointReceived).unwrap();
        state.transition(GettingCheckpointInfo).unwrap();
        state.transition(Cancelled).unwrap();
        assert!(state.transition(Failed).is_err());
        assert!(state.transition(Cancelled).is_err());
    }

    #[test]
    fn test_cancellable_stages() {
        assert!(GettingCheckpointInfo.is_cancellable());
        assert!(GettingFiles.is_cancellable());
        assert!(!Finalizing.is_cancellable());
        assert!(!Done.is_cancellable());
    }
}
