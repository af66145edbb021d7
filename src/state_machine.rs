//! Job lifecycle: Pending → Running → Completed / Aborted / Uncomplete.
//! A pending job can be aborted before it starts. Terminal states are final.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::batch::JobOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Aborted,
    Uncomplete,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "Pending"),
            JobState::Running => write!(f, "Running"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Aborted => write!(f, "Aborted"),
            JobState::Uncomplete => write!(f, "Uncomplete"),
        }
    }
}

impl From<JobOutcome> for JobState {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Completed => JobState::Completed,
            JobOutcome::Aborted => JobState::Aborted,
            JobOutcome::Uncomplete => JobState::Uncomplete,
        }
    }
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Aborted | JobState::Uncomplete)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Aborted) // cancelled before start
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Aborted)
                | (JobState::Running, JobState::Uncomplete)
        )
    }
}

/// Thread-safe job state with a watch channel for subscribers.
pub struct JobStateMachine {
    state: RwLock<JobState>,
    state_tx: watch::Sender<JobState>,
    state_rx: watch::Receiver<JobState>,
}

impl Default for JobStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStateMachine {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(JobState::Pending);
        Self {
            state: RwLock::new(JobState::Pending),
            state_tx,
            state_rx,
        }
    }

    pub fn current(&self) -> JobState {
        *self.state.read()
    }

    /// Attempt a transition. Returns the new state or the rejection reason.
    pub fn transition(&self, next: JobState) -> Result<JobState, String> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(next) {
            let msg = format!("invalid transition: {} -> {}", current, next);
            warn!("{}", msg);
            return Err(msg);
        }
        *state = next;
        let _ = self.state_tx.send(next);
        info!(from = %current, to = %next, "job_state_transition");
        Ok(next)
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_and_terminal_lock() {
        let sm = JobStateMachine::new();
        assert_eq!(sm.transition(JobState::Running), Ok(JobState::Running));
        assert_eq!(sm.transition(JobOutcome::Completed.into()), Ok(JobState::Completed));
        assert!(sm.current().is_terminal());
        assert!(sm.transition(JobState::Running).is_err());
        assert!(sm.transition(JobState::Aborted).is_err());
    }

    #[test]
    fn pending_job_can_only_start_or_abort() {
        assert!(JobState::Pending.can_transition_to(JobState::Aborted));
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
        assert!(!JobState::Pending.can_transition_to(JobState::Uncomplete));
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let sm = JobStateMachine::new();
        let mut rx = sm.subscribe();
        sm.transition(JobState::Running).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), JobState::Running);
    }
}
