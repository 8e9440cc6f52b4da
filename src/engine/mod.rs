use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ErrorInfo, ScraperError, ScraperResult};
use crate::logging::{LogContext, PerformanceLogger};
use crate::page::{launch_browser, BrowserDriver, ElementLocator, KeywordLocator, PageActionExecutor};
use crate::program::Program;
use crate::storage::{RunRecord, RunStatus, RunSummary, StorageManager};
use crate::store::{DataStore, SqliteDataStore};
use crate::{log_error, log_info, log_warn};

pub mod events;
pub mod interpreter;
pub mod iterator;
pub mod run;
pub mod system;

pub use events::{EventBus, EventEnvelope, ExecutionEvent, ScraperInstructionsExecutionInfo};
pub use interpreter::{InstructionFailure, Interpreter};
pub use iterator::{ExecutionIterator, ExecutionIteratorConfig, IterationContext};
pub use run::{RecordedEvent, RunOptions, RunResult, RunState, RunStateMachine};
pub use system::{LogNotifier, Notifier, SystemActions};

/// Request to run a saved scraper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub scraper_id: String,
    #[serde(default)]
    pub iterator_config: Option<ExecutionIteratorConfig>,
    /// Overrides `execution.stop_on_error` for this run
    #[serde(default)]
    pub stop_on_error: Option<bool>,
    #[serde(default)]
    pub silent: bool,
}

impl ExecutionRequest {
    pub fn new(scraper_id: impl Into<String>) -> Self {
        Self {
            scraper_id: scraper_id.into(),
            iterator_config: None,
            stop_on_error: None,
            silent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationAck {
    pub run_id: Uuid,
    pub already_finished: bool,
}

/// Starts, tracks and cancels runs
///
/// Each run gets its own task and page pool; at most
/// `execution.max_concurrent_runs` execute at once, the rest wait as
/// `Pending`. The last `execution.retained_runs` finished runs keep their
/// state machine and event log; older ones are answered from run records.
#[derive(Clone)]
pub struct RunManager {
    config: AppConfig,
    storage: StorageManager,
    store: Arc<dyn DataStore>,
    browser: Arc<dyn BrowserDriver>,
    locator: Option<Arc<dyn ElementLocator>>,
    notifier: Arc<dyn Notifier>,
    bus: EventBus,
    runs: Arc<DashMap<Uuid, Arc<RunStateMachine>>>,
    /// Exited runs still in `runs`, oldest first
    finished: Arc<Mutex<VecDeque<Uuid>>>,
    permits: Arc<Semaphore>,
}

struct IterationTotals {
    result: RunResult,
    iterations: usize,
    failed: usize,
}

impl RunManager {
    pub fn new(
        config: AppConfig,
        storage: StorageManager,
        store: Arc<dyn DataStore>,
        browser: Arc<dyn BrowserDriver>,
    ) -> Self {
        let locator = KeywordLocator::from_config(&config.ai).map(|l| Arc::new(l) as Arc<dyn ElementLocator>);

        Self {
            bus: EventBus::new(config.execution.event_channel_capacity),
            permits: Arc::new(Semaphore::new(config.execution.max_concurrent_runs.max(1))),
            config,
            storage,
            store,
            browser,
            locator,
            notifier: Arc::new(LogNotifier),
            runs: Arc::new(DashMap::new()),
            finished: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Opens metadata storage, the data store database and the configured driver
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let storage = StorageManager::new(&config.database).await?;
        let store = SqliteDataStore::open(&config.database.data_store_path).await?;
        let browser = launch_browser(&config.browser).await?;
        Ok(Self::new(config.clone(), storage, Arc::new(store), browser))
    }

    pub fn with_locator(mut self, locator: Option<Arc<dyn ElementLocator>>) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Runs a saved scraper and returns the new run id
    pub async fn execute(&self, request: ExecutionRequest) -> ScraperResult<Uuid> {
        self.execute_with_events(request).await.map(|(run_id, _)| run_id)
    }

    /// Like [`execute`](Self::execute), subscribed before the first event
    pub async fn execute_with_events(
        &self,
        request: ExecutionRequest,
    ) -> ScraperResult<(Uuid, broadcast::Receiver<EventEnvelope>)> {
        let scraper = self
            .storage
            .get_scraper(&request.scraper_id)
            .await?
            .ok_or_else(|| ScraperError::ScraperNotFound {
                scraper_id: request.scraper_id.clone(),
            })?;

        let options = RunOptions {
            stop_on_error: request.stop_on_error.unwrap_or(self.config.execution.stop_on_error),
            silent: request.silent,
        };
        self.start(&scraper.id, scraper.program, request.iterator_config, options)
            .await
    }

    /// Runs a program that is not saved; `scraper_id` only labels the run
    pub async fn execute_program(
        &self,
        scraper_id: &str,
        program: Program,
        iterator: Option<ExecutionIteratorConfig>,
        options: RunOptions,
    ) -> ScraperResult<Uuid> {
        self.start(scraper_id, program, iterator, options)
            .await
            .map(|(run_id, _)| run_id)
    }

    async fn start(
        &self,
        scraper_id: &str,
        program: Program,
        iterator: Option<ExecutionIteratorConfig>,
        options: RunOptions,
    ) -> ScraperResult<(Uuid, broadcast::Receiver<EventEnvelope>)> {
        if let Some(config) = &iterator {
            config.validate()?;
        }

        let run_id = Uuid::new_v4();
        let machine = Arc::new(RunStateMachine::new(run_id, scraper_id, self.bus.clone()));
        let receiver = self
            .bus
            .subscribe(run_id)
            .ok_or_else(|| ScraperError::internal("event channel closed before start"))?;

        self.storage
            .create_run(&RunRecord {
                id: run_id,
                scraper_id: scraper_id.to_string(),
                status: RunStatus::Running,
                iterator: iterator.clone(),
                started_at: Utc::now(),
                finished_at: None,
                iterations: 0,
                failed_iterations: 0,
                error: None,
            })
            .await?;
        self.runs.insert(run_id, machine.clone());

        info!("Starting run {} of scraper {}", run_id, scraper_id);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.drive(machine, program, iterator, options).await;
        });

        Ok((run_id, receiver))
    }

    async fn drive(
        &self,
        machine: Arc<RunStateMachine>,
        program: Program,
        iterator: Option<ExecutionIteratorConfig>,
        options: RunOptions,
    ) {
        let timer = PerformanceLogger::new(
            LogContext::new("engine", "run")
                .with_run_id(machine.run_id())
                .with_scraper_id(machine.scraper_id()),
        );

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = machine.cancel_token().cancelled() => None,
        };

        let totals = match permit {
            Some(_permit) => self.run_iterations(&machine, &program, iterator.as_ref(), options).await,
            None => {
                let info = ErrorInfo::new(&ScraperError::Cancelled);
                machine
                    .emit(ExecutionEvent::ExecutionError {
                        iteration: None,
                        error: info.clone(),
                    })
                    .await;
                IterationTotals {
                    result: RunResult::error(info),
                    iterations: 0,
                    failed: 0,
                }
            }
        };

        let summary = RunSummary {
            status: totals.result.status(),
            iterations: totals.iterations,
            failed_iterations: totals.failed,
            error: match &totals.result {
                RunResult::Error { error } => Some(error.clone()),
                RunResult::Success => None,
            },
        };
        let context = LogContext::new("engine", "finish").with_run_id(machine.run_id());
        if let Err(e) = self.storage.finish_run(machine.run_id(), &summary).await {
            log_error!(context, e, "Failed to record run finish");
        }

        if let Err(e) = machine.exit(totals.result).await {
            log_error!(context, e, "Run could not exit cleanly");
        }
        self.retire(machine.run_id()).await;
        timer.finish_with_status(
            &format!(
                "Run finished after {} iterations ({} failed)",
                summary.iterations, summary.failed_iterations
            ),
            summary.status.to_string(),
        );
    }

    async fn run_iterations(
        &self,
        machine: &RunStateMachine,
        program: &Program,
        iterator: Option<&ExecutionIteratorConfig>,
        options: RunOptions,
    ) -> IterationTotals {
        let store = self.store.as_ref();
        let mut totals = IterationTotals {
            result: RunResult::Success,
            iterations: 0,
            failed: 0,
        };

        if let Err(e) = machine.transition(RunState::Idle).await {
            totals.result = RunResult::error(ErrorInfo::new(&e));
            return totals;
        }

        let mut pages = PageActionExecutor::new(self.browser.clone(), &self.config.browser);
        if let Some(locator) = &self.locator {
            pages = pages.with_locator(locator.clone(), self.config.ai.snapshot_max_bytes);
        }
        let system = SystemActions::new(self.notifier.clone(), &self.config.system);
        let interpreter = Interpreter {
            program,
            store,
            pages: &pages,
            system: &system,
            machine,
            max_steps: self.config.execution.max_steps_per_iteration,
            silent: options.silent,
        };

        let mut first_failure: Option<ErrorInfo> = None;
        let fatal = match ExecutionIterator::new(iterator, store).await {
            Err(e) => Some(ErrorInfo::new(&e)),
            Ok(mut contexts) => loop {
                if machine.is_cancelled() {
                    break Some(ErrorInfo::new(&ScraperError::Cancelled));
                }
                let context = match contexts.next(store).await {
                    None => break None,
                    Some(Ok(context)) => context,
                    Some(Err(e)) => break Some(ErrorInfo::new(&e)),
                };

                if let Err(e) = machine.transition(RunState::Executing).await {
                    break Some(ErrorInfo::new(&e));
                }
                machine
                    .emit(ExecutionEvent::ExecutionStarted {
                        iteration: context.index,
                        value: context.value,
                        record_id: context.record.as_ref().map(|bound| bound.record.id),
                    })
                    .await;
                totals.iterations += 1;

                let started = Instant::now();
                match interpreter.run(&context).await {
                    Ok(steps) => {
                        machine
                            .emit(ExecutionEvent::ExecutionFinished {
                                iteration: context.index,
                                steps,
                                duration_ms: started.elapsed().as_millis() as u64,
                            })
                            .await;
                    }
                    Err(failure) => {
                        totals.failed += 1;
                        let info = failure.info(context.index);
                        let log_context = LogContext::new("engine", "iteration")
                            .with_run_id(machine.run_id())
                            .with_iteration(context.index)
                            .with_error_category(failure.error.category());
                        let log_context = match failure.index {
                            Some(index) => log_context.with_instruction(index),
                            None => log_context,
                        };
                        log_warn!(log_context, format!("Iteration failed: {}", failure.error));

                        machine
                            .emit(ExecutionEvent::ExecutionError {
                                iteration: Some(context.index),
                                error: info.clone(),
                            })
                            .await;

                        if matches!(failure.error, ScraperError::Cancelled) || options.stop_on_error {
                            // Already reported above
                            totals.result = RunResult::error(info);
                            pages.close_all().await;
                            return totals;
                        }
                        first_failure.get_or_insert(info);
                    }
                }
            },
        };

        pages.close_all().await;

        match fatal {
            Some(info) => {
                machine
                    .emit(ExecutionEvent::ExecutionError {
                        iteration: None,
                        error: info.clone(),
                    })
                    .await;
                totals.result = RunResult::error(info);
            }
            None => {
                machine
                    .emit(ExecutionEvent::AllExecutionsFinished {
                        iterations: totals.iterations,
                        failed_iterations: totals.failed,
                    })
                    .await;
                if let Some(info) = first_failure {
                    totals.result = RunResult::error(info);
                }
                let context = LogContext::new("engine", "run")
                    .with_run_id(machine.run_id())
                    .with_field("iterations", serde_json::json!(totals.iterations));
                log_info!(context, "All iterations finished");
            }
        }

        totals
    }

    /// Drops the oldest finished runs beyond the retention limit
    async fn retire(&self, run_id: Uuid) {
        let mut finished = self.finished.lock().await;
        finished.push_back(run_id);
        while finished.len() > self.config.execution.retained_runs.max(1) {
            if let Some(evicted) = finished.pop_front() {
                self.runs.remove(&evicted);
                debug!("Evicted finished run {} from memory", evicted);
            }
        }
    }

    /// Result of a finished run no longer held in memory
    async fn persisted_result(&self, run_id: Uuid) -> ScraperResult<RunResult> {
        match self.storage.get_run(run_id).await? {
            Some(record) if record.status != RunStatus::Running => Ok(match record.error {
                Some(error) => RunResult::error(error),
                None => RunResult::Success,
            }),
            _ => Err(ScraperError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    fn machine(&self, run_id: Uuid) -> ScraperResult<Arc<RunStateMachine>> {
        self.runs
            .get(&run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ScraperError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Requests cancellation; repeated or late calls are acknowledged
    pub async fn terminate(&self, run_id: Uuid) -> ScraperResult<TerminationAck> {
        let already_finished = match self.machine(run_id) {
            Ok(machine) => machine.request_cancel(),
            Err(e) => match self.storage.get_run(run_id).await? {
                Some(record) if record.status != RunStatus::Running => true,
                _ => return Err(e),
            },
        };

        info!("Termination of run {} acknowledged (finished: {})", run_id, already_finished);
        Ok(TerminationAck {
            run_id,
            already_finished,
        })
    }

    pub async fn state(&self, run_id: Uuid) -> ScraperResult<RunState> {
        match self.machine(run_id) {
            Ok(machine) => Ok(machine.state()),
            Err(_) => Ok(RunState::Exited {
                result: self.persisted_result(run_id).await?,
            }),
        }
    }

    /// Waits for the run to exit
    pub async fn wait(&self, run_id: Uuid) -> ScraperResult<RunResult> {
        match self.machine(run_id) {
            Ok(machine) => Ok(machine.wait().await),
            Err(_) => self.persisted_result(run_id).await,
        }
    }

    /// The run's event log so far; only kept for retained runs
    pub async fn events(&self, run_id: Uuid) -> ScraperResult<Vec<RecordedEvent>> {
        Ok(self.machine(run_id)?.events().await)
    }

    /// Live events from now on; `None` once the run has exited
    pub async fn subscribe(&self, run_id: Uuid) -> ScraperResult<Option<broadcast::Receiver<EventEnvelope>>> {
        if self.machine(run_id).is_err() {
            self.persisted_result(run_id).await?;
            return Ok(None);
        }
        Ok(self.bus.subscribe(run_id))
    }

    pub async fn run_record(&self, run_id: Uuid) -> ScraperResult<Option<RunRecord>> {
        Ok(self.storage.get_run(run_id).await?)
    }

    /// Runs that have not exited yet
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs
            .iter()
            .filter(|entry| !entry.value().state().is_exited())
            .map(|entry| *entry.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::system::tests::RecordingNotifier;
    use crate::error::ErrorKind;
    use crate::page::{FixturePageSource, StaticBrowser};
    use crate::program::{
        Condition, PageActionType, ScraperInstruction, ScraperValue, SqliteConditionType, SystemActionType,
    };
    use crate::store::{ColumnDef, ColumnType, MemoryDataStore, WriteTarget};
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.browser.element_timeout_ms = 50;
        config.browser.poll_interval_ms = 10;
        config
    }

    struct Setup {
        manager: RunManager,
        browser: Arc<StaticBrowser>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<MemoryDataStore>,
    }

    fn setup(source: FixturePageSource) -> Setup {
        let browser = Arc::new(StaticBrowser::new(Arc::new(source)));
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(MemoryDataStore::new());
        let manager = RunManager::new(
            test_config(),
            StorageManager::in_memory().unwrap(),
            store.clone(),
            browser.clone(),
        )
        .with_notifier(notifier.clone());
        Setup {
            manager,
            browser,
            notifier,
            store,
        }
    }

    fn navigate(url: &str) -> ScraperInstruction {
        ScraperInstruction::PageAction {
            page_index: 0,
            action: PageActionType::Navigate {
                url: ScraperValue::literal(url),
                new_page: false,
                timeout_ms: None,
            },
        }
    }

    fn notify(message: &str) -> ScraperInstruction {
        ScraperInstruction::SystemAction {
            action: SystemActionType::ShowNotification {
                title: None,
                message: ScraperValue::literal(message),
            },
        }
    }

    fn retry_program() -> Program {
        Program::new(vec![
            navigate("https://x.test/"),
            ScraperInstruction::Condition {
                condition: Condition::new(
                    ScraperValue::text_of("h1"),
                    SqliteConditionType::Equals,
                    vec![ScraperValue::literal("OK")],
                ),
                jump_to: Some("M".into()),
            },
            ScraperInstruction::PageAction {
                page_index: 0,
                action: PageActionType::Click {
                    selector: ".retry".into(),
                    smart_fallback: None,
                    timeout_ms: None,
                },
            },
            ScraperInstruction::Marker { name: "M".into() },
            notify("done"),
        ])
        .unwrap()
    }

    fn count(events: &[RecordedEvent], name: &str) -> usize {
        events.iter().filter(|e| e.event.name() == name).count()
    }

    #[tokio::test]
    async fn test_condition_skips_click_when_heading_is_ok() {
        let setup = setup(FixturePageSource::new().with_page(
            "https://x.test/",
            "<html><body><h1>OK</h1><button class=\"retry\">Retry</button></body></html>",
        ));
        let saved = setup
            .manager
            .storage()
            .save_scraper("retry", &retry_program())
            .await
            .unwrap();

        let run_id = setup.manager.execute(ExecutionRequest::new(saved.id.clone())).await.unwrap();
        assert_eq!(setup.manager.wait(run_id).await.unwrap(), RunResult::Success);

        assert_eq!(
            setup.browser.history().await,
            vec!["page1 navigate https://x.test/".to_string(), "page1 close".to_string()]
        );
        assert_eq!(*setup.notifier.0.lock().await, vec!["Scraper: done".to_string()]);

        let record = setup.manager.run_record(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(record.scraper_id, saved.id);
        assert_eq!(record.iterations, 1);
    }

    #[tokio::test]
    async fn test_condition_falls_through_to_click() {
        let setup = setup(FixturePageSource::new().with_page(
            "https://x.test/",
            "<html><body><h1>Busy</h1><button class=\"retry\">Retry</button></body></html>",
        ));

        let run_id = setup
            .manager
            .execute_program("adhoc", retry_program(), None, RunOptions::default())
            .await
            .unwrap();
        assert!(setup.manager.wait(run_id).await.unwrap().is_success());

        assert_eq!(
            setup.browser.history().await,
            vec![
                "page1 navigate https://x.test/".to_string(),
                "page1 click .retry".to_string(),
                "page1 close".to_string(),
            ]
        );
        assert_eq!(*setup.notifier.0.lock().await, vec!["Scraper: done".to_string()]);
    }

    #[tokio::test]
    async fn test_range_emits_one_pair_per_iteration() {
        let setup = setup(FixturePageSource::new());
        let program = Program::new(vec![notify("tick")]).unwrap();
        let range = ExecutionIteratorConfig::Range { start: 0, end: 3, step: 1 };

        let run_id = setup
            .manager
            .execute_program("ticker", program, Some(range), RunOptions::default())
            .await
            .unwrap();
        setup.manager.wait(run_id).await.unwrap();

        let events = setup.manager.events(run_id).await.unwrap();
        assert_eq!(count(&events, "ExecutionStarted"), 3);
        assert_eq!(count(&events, "ExecutionFinished"), 3);
        assert_eq!(count(&events, "AllExecutionsFinished"), 1);

        let started: Vec<Option<i64>> = events
            .iter()
            .filter_map(|e| match &e.event {
                ExecutionEvent::ExecutionStarted { value, .. } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![Some(0), Some(1), Some(2)]);

        let all = events
            .iter()
            .position(|e| e.event.name() == "AllExecutionsFinished")
            .unwrap();
        let last_finished = events
            .iter()
            .rposition(|e| e.event.name() == "ExecutionFinished")
            .unwrap();
        assert!(all > last_finished);
        assert_eq!(events.last().unwrap().event.exit_result(), Some(&RunResult::Success));
    }

    #[tokio::test]
    async fn test_terminate_during_page_action() {
        let setup = setup(
            FixturePageSource::new()
                .with_page("https://slow.test/", "<html><body><h1>Slow</h1></body></html>")
                .with_latency(Duration::from_millis(300)),
        );
        let program = Program::new(vec![navigate("https://slow.test/"), notify("after")]).unwrap();

        let (run_id, mut live) = setup
            .manager
            .start("slow", program, None, RunOptions::default())
            .await
            .unwrap();

        // Wait until the navigation is in flight
        loop {
            let envelope = live.recv().await.unwrap();
            if let ExecutionEvent::ExecutionUpdate {
                info: ScraperInstructionsExecutionInfo::Instruction { index: 0, .. },
                ..
            } = envelope.event
            {
                break;
            }
        }

        let ack = setup.manager.terminate(run_id).await.unwrap();
        assert!(!ack.already_finished);

        match setup.manager.wait(run_id).await.unwrap() {
            RunResult::Error { error } => {
                assert_eq!(error.kind, ErrorKind::Cancelled);
                assert_eq!(error.instruction_index, Some(0));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(setup.notifier.0.lock().await.is_empty());

        let events = setup.manager.events(run_id).await.unwrap();
        assert_eq!(count(&events, "ExecutionError"), 1);
        assert_eq!(count(&events, "AllExecutionsFinished"), 0);

        let again = setup.manager.terminate(run_id).await.unwrap();
        assert!(again.already_finished);
        let record = setup.manager.run_record(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failed_iterations_continue_unless_stopping() {
        let setup = setup(FixturePageSource::new());
        setup
            .store
            .create_store("rows", &[ColumnDef::new("n", ColumnType::Integer)])
            .await
            .unwrap();
        for n in [1, 0, 2] {
            setup.store.set("rows", WriteTarget::Insert, "n", json!(n)).await.unwrap();
        }

        // Fails on rows where n = 0
        let program = Program::new(vec![
            ScraperInstruction::Jump {
                marker: "ok".into(),
                condition: Some(Condition::new(
                    ScraperValue::external("rows", "n"),
                    SqliteConditionType::GreaterThan,
                    vec![ScraperValue::literal(0)],
                )),
            },
            ScraperInstruction::SaveData {
                store: "missing".into(),
                column: "n".into(),
                value: ScraperValue::Null,
            },
            ScraperInstruction::Marker { name: "ok".into() },
        ])
        .unwrap();
        let set = ExecutionIteratorConfig::EntireSet { store: "rows".into() };

        let run_id = setup
            .manager
            .execute_program("rows", program.clone(), Some(set.clone()), RunOptions::default())
            .await
            .unwrap();
        let result = setup.manager.wait(run_id).await.unwrap();
        let events = setup.manager.events(run_id).await.unwrap();
        assert_eq!(count(&events, "ExecutionStarted"), 3);
        assert_eq!(count(&events, "ExecutionError"), 1);
        assert_eq!(count(&events, "AllExecutionsFinished"), 1);
        match result {
            RunResult::Error { error } => {
                assert_eq!(error.iteration_index, Some(1));
                assert_eq!(error.instruction_index, Some(1));
            }
            other => panic!("unexpected result {:?}", other),
        }

        let options = RunOptions {
            stop_on_error: true,
            silent: false,
        };
        let run_id = setup
            .manager
            .execute_program("rows", program, Some(set), options)
            .await
            .unwrap();
        setup.manager.wait(run_id).await.unwrap();
        let events = setup.manager.events(run_id).await.unwrap();
        assert_eq!(count(&events, "ExecutionStarted"), 2);
        assert_eq!(count(&events, "AllExecutionsFinished"), 0);
    }

    #[tokio::test]
    async fn test_empty_set_never_executes() {
        let setup = setup(FixturePageSource::new());
        setup
            .store
            .create_store("empty", &[ColumnDef::new("n", ColumnType::Integer)])
            .await
            .unwrap();

        let run_id = setup
            .manager
            .execute_program(
                "empty",
                Program::new(vec![notify("never")]).unwrap(),
                Some(ExecutionIteratorConfig::EntireSet { store: "empty".into() }),
                RunOptions::default(),
            )
            .await
            .unwrap();
        assert!(setup.manager.wait(run_id).await.unwrap().is_success());

        let events = setup.manager.events(run_id).await.unwrap();
        assert!(!events.iter().any(|e| matches!(
            e.event,
            ExecutionEvent::StateChange {
                state: RunState::Executing
            }
        )));
        assert_eq!(count(&events, "AllExecutionsFinished"), 1);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let setup = setup(FixturePageSource::new());
        let err = setup
            .manager
            .execute(ExecutionRequest::new("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScraperNotFound);

        let err = setup.manager.terminate(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RunNotFound);

        let bad = ExecutionIteratorConfig::Range { start: 0, end: 1, step: 0 };
        let err = setup
            .manager
            .execute_program("x", Program::new(Vec::new()).unwrap(), Some(bad), RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidIterator);
    }

    #[tokio::test]
    async fn test_finished_runs_are_evicted() {
        let mut config = test_config();
        config.execution.retained_runs = 1;
        let browser = Arc::new(StaticBrowser::new(Arc::new(FixturePageSource::new())));
        let manager = RunManager::new(
            config,
            StorageManager::in_memory().unwrap(),
            Arc::new(MemoryDataStore::new()),
            browser,
        );
        let program = Program::new(vec![ScraperInstruction::Marker { name: "start".into() }]).unwrap();

        let first = manager
            .execute_program("first", program.clone(), None, RunOptions::default())
            .await
            .unwrap();
        assert!(manager.wait(first).await.unwrap().is_success());
        let second = manager
            .execute_program("second", program, None, RunOptions::default())
            .await
            .unwrap();
        assert!(manager.wait(second).await.unwrap().is_success());

        // Retirement happens right after exit, so give the second run a moment
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.runs.contains_key(&first) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(manager.runs.contains_key(&second));
        assert_eq!(manager.events(first).await.unwrap_err().kind(), ErrorKind::RunNotFound);

        let record = manager.run_record(first).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
        assert_eq!(
            manager.state(first).await.unwrap(),
            RunState::Exited {
                result: RunResult::Success
            }
        );
        assert!(manager.wait(first).await.unwrap().is_success());
        assert!(manager.subscribe(first).await.unwrap().is_none());

        let ack = manager.terminate(first).await.unwrap();
        assert!(ack.already_finished);
        assert!(manager.active_runs().is_empty());

        let err = manager.state(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RunNotFound);
    }
}
