use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{ErrorInfo, ScraperError, ScraperResult};
use crate::page::PageActionExecutor;
use crate::program::{Program, ScraperInstruction};
use crate::store::{DataStore, WriteTarget};
use crate::values::ResolveContext;

use super::events::{DataOperation, ExecutionEvent, OperationPhase, ScraperInstructionsExecutionInfo};
use super::iterator::IterationContext;
use super::run::RunStateMachine;
use super::system::SystemActions;

/// A failed iteration and where it stopped
#[derive(Debug, Clone)]
pub struct InstructionFailure {
    pub index: Option<usize>,
    pub error: ScraperError,
}

impl InstructionFailure {
    pub fn info(&self, iteration: usize) -> ErrorInfo {
        let info = ErrorInfo::new(&self.error).in_iteration(iteration);
        match self.index {
            Some(index) => info.at_instruction(index),
            None => info,
        }
    }
}

/// Walks a program once for one iteration context
///
/// Instructions run in index order; `Jump` and `Condition` with `jumpTo`
/// move to their marker. Cancellation is honored before every instruction
/// and after every page action, never in the middle of one.
pub struct Interpreter<'a> {
    pub program: &'a Program,
    pub store: &'a dyn DataStore,
    pub pages: &'a PageActionExecutor,
    pub system: &'a SystemActions,
    pub machine: &'a RunStateMachine,
    pub max_steps: usize,
    pub silent: bool,
}

/// Rows this iteration writes to, per store
///
/// Seeded with the bound record; the first write to any other store inserts
/// a row that later writes in the same iteration update.
struct WorkingRows(HashMap<String, i64>);

impl WorkingRows {
    fn target(&self, store: &str) -> WriteTarget {
        self.0
            .get(store)
            .map(|id| WriteTarget::Update(*id))
            .unwrap_or(WriteTarget::Insert)
    }
}

impl<'a> Interpreter<'a> {
    async fn update(&self, iteration: usize, info: ScraperInstructionsExecutionInfo) {
        self.machine
            .emit(ExecutionEvent::ExecutionUpdate { iteration, info })
            .await;
    }

    fn marker(&self, name: &str) -> ScraperResult<usize> {
        self.program
            .marker_index(name)
            .ok_or_else(|| ScraperError::internal(format!("marker '{}' is not in the program", name)))
    }

    pub async fn run(&self, context: &IterationContext) -> Result<usize, InstructionFailure> {
        let iteration = context.index;
        let mut rows = WorkingRows(
            context
                .record
                .iter()
                .map(|bound| (bound.store.clone(), bound.record.id))
                .collect(),
        );

        let mut pc = 0;
        let mut steps = 0;

        while let Some(instruction) = self.program.get(pc) {
            let outcome = if self.machine.is_cancelled() {
                Err(ScraperError::Cancelled)
            } else if steps >= self.max_steps {
                Err(ScraperError::StepLimitExceeded { limit: self.max_steps })
            } else {
                steps += 1;
                self.update(
                    iteration,
                    ScraperInstructionsExecutionInfo::Instruction {
                        index: pc,
                        instruction: instruction.type_name().to_string(),
                        detail: instruction.detail(),
                    },
                )
                .await;
                self.step(pc, instruction, context, &mut rows).await
            };

            match outcome {
                Ok(next) => pc = next,
                Err(error) => {
                    let failure = InstructionFailure { index: Some(pc), error };
                    self.update(
                        iteration,
                        ScraperInstructionsExecutionInfo::Error {
                            error: failure.info(iteration),
                        },
                    )
                    .await;
                    return Err(failure);
                }
            }
        }

        self.update(iteration, ScraperInstructionsExecutionInfo::Success { steps })
            .await;
        Ok(steps)
    }

    async fn step(
        &self,
        pc: usize,
        instruction: &ScraperInstruction,
        context: &IterationContext,
        rows: &mut WorkingRows,
    ) -> ScraperResult<usize> {
        let iteration = context.index;
        let resolver = ResolveContext::new(self.store, self.pages, context.record.as_ref());

        match instruction {
            ScraperInstruction::PageAction { page_index, action } => {
                let outcome = self.pages.execute(*page_index, action, &resolver).await?;
                if let Some(page_index) = outcome.opened_page {
                    self.update(iteration, ScraperInstructionsExecutionInfo::PageOpened { page_index })
                        .await;
                }
                if let Some(result) = outcome.result {
                    debug!("Instruction {} evaluated to {}", pc, result);
                }
                if self.machine.is_cancelled() {
                    return Err(ScraperError::Cancelled);
                }
            }
            ScraperInstruction::Condition { condition, jump_to } => {
                let holds = resolver.evaluate(condition).await?;
                debug!("Condition at {} is {}", pc, holds);
                if let (true, Some(marker)) = (holds, jump_to) {
                    return self.marker(marker);
                }
            }
            ScraperInstruction::Jump { marker, condition } => {
                let taken = match condition {
                    Some(condition) => resolver.evaluate(condition).await?,
                    None => true,
                };
                if taken {
                    return self.marker(marker);
                }
            }
            ScraperInstruction::Marker { .. } => {}
            ScraperInstruction::SaveData { store, column, value } => {
                let value = resolver.resolve(value).await?;
                let mut values = Map::new();
                values.insert(column.clone(), value);
                self.write(pc, iteration, store, DataOperation::Set, values, rows)
                    .await?;
            }
            ScraperInstruction::SaveDataBatch { store, items } => {
                let mut values = Map::new();
                for item in items {
                    values.insert(item.column.clone(), resolver.resolve(&item.value).await?);
                }
                self.write(pc, iteration, store, DataOperation::SetMany, values, rows)
                    .await?;
            }
            ScraperInstruction::DeleteData { store, filters } => {
                self.data_event(pc, iteration, store, DataOperation::Delete, OperationPhase::Started, None)
                    .await;
                let deleted = if filters.is_empty() {
                    let id = rows.0.get(store).copied().ok_or_else(|| {
                        ScraperError::write_failed(store.as_str(), "no filters and no record of this store in scope")
                    })?;
                    rows.0.remove(store);
                    usize::from(self.store.delete_row(store, id).await?)
                } else {
                    self.store.delete(store, filters).await?
                };
                self.data_event(
                    pc,
                    iteration,
                    store,
                    DataOperation::Delete,
                    OperationPhase::Completed,
                    Some(deleted as i64),
                )
                .await;
            }
            ScraperInstruction::DeleteCookies { page_index } => {
                self.pages.delete_cookies(*page_index).await?;
            }
            ScraperInstruction::SystemAction { action } => {
                self.system.perform(action, &resolver, self.silent).await?;
            }
        }

        Ok(pc + 1)
    }

    async fn write(
        &self,
        pc: usize,
        iteration: usize,
        store: &str,
        operation: DataOperation,
        values: Map<String, Value>,
        rows: &mut WorkingRows,
    ) -> ScraperResult<()> {
        self.data_event(pc, iteration, store, operation, OperationPhase::Started, None)
            .await;
        let id = self.store.set_many(store, rows.target(store), values).await?;
        rows.0.insert(store.to_string(), id);
        self.data_event(pc, iteration, store, operation, OperationPhase::Completed, Some(id))
            .await;
        Ok(())
    }

    async fn data_event(
        &self,
        index: usize,
        iteration: usize,
        store: &str,
        operation: DataOperation,
        phase: OperationPhase,
        affected: Option<i64>,
    ) {
        self.update(
            iteration,
            ScraperInstructionsExecutionInfo::ExternalDataOperation {
                index,
                operation,
                phase,
                store: store.to_string(),
                affected,
            },
        )
        .await;
    }
}
