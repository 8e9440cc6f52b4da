use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorInfo, ErrorKind, ScraperError, ScraperResult};
use crate::storage::RunStatus;

use super::events::{EventBus, EventEnvelope, ExecutionEvent};

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum RunResult {
    Success,
    Error { error: ErrorInfo },
}

impl RunResult {
    pub fn error(error: ErrorInfo) -> Self {
        Self::Error { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Self::Success => RunStatus::Succeeded,
            Self::Error { error } if error.kind == ErrorKind::Cancelled => RunStatus::Cancelled,
            Self::Error { .. } => RunStatus::Failed,
        }
    }
}

/// Lifecycle of a run: `Pending → Idle → Executing → Exited`
///
/// `Executing` is re-entered at the start of every iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum RunState {
    Pending,
    Idle,
    Executing,
    Exited { result: RunResult },
}

impl RunState {
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::Exited { .. })
    }

    fn can_enter(&self, next: &RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Idle) | (Pending, Exited { .. }) | (Idle, Executing) | (Idle, Exited { .. })
                | (Executing, Executing) | (Executing, Exited { .. })
        )
    }
}

/// Caller choices for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Abort the remaining iterations after the first failed one
    pub stop_on_error: bool,
    /// Suppress notifications; system actions are still logged
    pub silent: bool,
}

/// One entry of a run's append-only event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: ExecutionEvent,
}

/// State, event log and cancellation of one run
///
/// Only the run's own task mutates state; everyone else reads.
pub struct RunStateMachine {
    run_id: Uuid,
    scraper_id: String,
    state: watch::Sender<RunState>,
    log: Mutex<Vec<RecordedEvent>>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl RunStateMachine {
    pub fn new(run_id: Uuid, scraper_id: impl Into<String>, bus: EventBus) -> Self {
        bus.open(run_id);
        let (state, _) = watch::channel(RunState::Pending);
        let initial = RecordedEvent {
            seq: 0,
            at: Utc::now(),
            event: ExecutionEvent::StateChange {
                state: RunState::Pending,
            },
        };

        Self {
            run_id,
            scraper_id: scraper_id.into(),
            state,
            log: Mutex::new(vec![initial]),
            bus,
            cancel: CancellationToken::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn scraper_id(&self) -> &str {
        &self.scraper_id
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Asks the run to stop at its next instruction boundary
    ///
    /// Returns `true` when the run had already exited.
    pub fn request_cancel(&self) -> bool {
        let finished = self.state.borrow().is_exited();
        if !finished {
            debug!("Cancellation requested for run {}", self.run_id);
            self.cancel.cancel();
        }
        finished
    }

    /// Records the event and pushes it to live subscribers
    pub async fn emit(&self, event: ExecutionEvent) {
        let mut log = self.log.lock().await;
        let seq = log.len() as u64;
        log.push(RecordedEvent {
            seq,
            at: Utc::now(),
            event: event.clone(),
        });
        drop(log);

        self.bus.publish(EventEnvelope {
            scraper_id: self.scraper_id.clone(),
            run_id: self.run_id,
            event,
        });
    }

    pub async fn transition(&self, next: RunState) -> ScraperResult<()> {
        let current = self.state();
        if !current.can_enter(&next) {
            warn!("Run {} rejected transition {:?} -> {:?}", self.run_id, current, next);
            return Err(ScraperError::internal(format!(
                "invalid run state transition {:?} -> {:?}",
                current, next
            )));
        }

        self.state.send_replace(next.clone());
        self.emit(ExecutionEvent::StateChange { state: next }).await;
        Ok(())
    }

    /// Moves to `Exited` and closes the live channel
    pub async fn exit(&self, result: RunResult) -> ScraperResult<()> {
        let outcome = self.transition(RunState::Exited { result }).await;
        self.bus.close(self.run_id);
        outcome
    }

    /// Snapshot of the event log
    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.log.lock().await.clone()
    }

    /// Resolves once the run has exited
    pub async fn wait(&self) -> RunResult {
        let mut receiver = self.state.subscribe();
        loop {
            if let RunState::Exited { result } = &*receiver.borrow_and_update() {
                return result.clone();
            }
            if receiver.changed().await.is_err() {
                return RunResult::error(ErrorInfo::new(&ScraperError::internal("run state dropped")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_forward_only() {
        let machine = RunStateMachine::new(Uuid::new_v4(), "s1", EventBus::new(16));
        assert_eq!(machine.state(), RunState::Pending);

        assert!(machine.transition(RunState::Executing).await.is_err());
        machine.transition(RunState::Idle).await.unwrap();
        machine.transition(RunState::Executing).await.unwrap();
        machine.transition(RunState::Executing).await.unwrap();
        assert!(machine.transition(RunState::Idle).await.is_err());

        machine.exit(RunResult::Success).await.unwrap();
        assert!(machine.exit(RunResult::Success).await.is_err());
        assert!(machine.request_cancel());
        assert_eq!(machine.wait().await, RunResult::Success);

        let log = machine.events().await;
        let seqs: Vec<u64> = log.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(log.last().unwrap().event.exit_result(), Some(&RunResult::Success));
    }

    #[tokio::test]
    async fn test_cancel_before_exit() {
        let machine = RunStateMachine::new(Uuid::new_v4(), "s1", EventBus::new(16));
        assert!(!machine.request_cancel());
        assert!(machine.is_cancelled());

        let result = RunResult::error(ErrorInfo::new(&ScraperError::Cancelled));
        assert_eq!(result.status(), RunStatus::Cancelled);
        machine.exit(result.clone()).await.unwrap();
        assert_eq!(machine.wait().await, result);
    }
}
