use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::ErrorInfo;

use super::run::{RunResult, RunState};

/// Store operation reported around data writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataOperation {
    Set,
    SetMany,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPhase {
    Started,
    Completed,
}

/// Detail item of an `ExecutionUpdate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ScraperInstructionsExecutionInfo {
    /// Emitted at every instruction boundary, before the instruction runs
    Instruction {
        index: usize,
        instruction: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ExternalDataOperation {
        index: usize,
        operation: DataOperation,
        phase: OperationPhase,
        store: String,
        /// Row written, or rows deleted once completed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        affected: Option<i64>,
    },
    PageOpened {
        page_index: usize,
    },
    /// The iteration reached the end of the program
    Success {
        steps: usize,
    },
    Error {
        error: ErrorInfo,
    },
}

/// Everything a run reports; never mutated after emission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    StateChange {
        state: RunState,
    },
    ExecutionStarted {
        iteration: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_id: Option<i64>,
    },
    ExecutionUpdate {
        iteration: usize,
        info: ScraperInstructionsExecutionInfo,
    },
    ExecutionFinished {
        iteration: usize,
        steps: usize,
        duration_ms: u64,
    },
    ExecutionError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<usize>,
        error: ErrorInfo,
    },
    AllExecutionsFinished {
        iterations: usize,
        failed_iterations: usize,
    },
}

impl ExecutionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChange { .. } => "StateChange",
            Self::ExecutionStarted { .. } => "ExecutionStarted",
            Self::ExecutionUpdate { .. } => "ExecutionUpdate",
            Self::ExecutionFinished { .. } => "ExecutionFinished",
            Self::ExecutionError { .. } => "ExecutionError",
            Self::AllExecutionsFinished { .. } => "AllExecutionsFinished",
        }
    }

    /// The run result if this event moves the run to `Exited`
    pub fn exit_result(&self) -> Option<&RunResult> {
        match self {
            Self::StateChange {
                state: RunState::Exited { result },
            } => Some(result),
            _ => None,
        }
    }
}

/// Message pushed to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "ScraperEvent", rename_all = "camelCase")]
pub struct EventEnvelope {
    pub scraper_id: String,
    pub run_id: Uuid,
    pub event: ExecutionEvent,
}

/// Fan-out of run events to live subscribers, keyed by run id
///
/// Delivery never blocks the run: a subscriber that falls more than
/// `capacity` events behind loses the oldest ones.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<DashMap<Uuid, broadcast::Sender<EventEnvelope>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn open(&self, run_id: Uuid) {
        self.channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Receives events published from now on; `None` once the run is closed
    pub fn subscribe(&self, run_id: Uuid) -> Option<broadcast::Receiver<EventEnvelope>> {
        self.channels.get(&run_id).map(|sender| sender.subscribe())
    }

    pub fn publish(&self, envelope: EventEnvelope) {
        if let Some(sender) = self.channels.get(&envelope.run_id) {
            // No receivers is not an error
            let _ = sender.send(envelope);
        }
    }

    /// Drops the channel; subscribers see the stream end
    pub fn close(&self, run_id: Uuid) {
        if self.channels.remove(&run_id).is_some() {
            debug!("Closed event channel for run {}", run_id);
        }
    }
}
