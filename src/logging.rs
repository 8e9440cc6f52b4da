use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};


/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
    pub console_enabled: bool,
    pub json_format: bool,
    pub max_files: usize,
    pub log_directory: PathBuf,
    pub include_spans: bool,
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            console_enabled: true,
            json_format: false,
            max_files: 5,
            log_directory: PathBuf::from("logs"),
            include_spans: false,
            include_targets: true,
        }
    }
}

/// Initialize logging system
///
/// Console output goes to stderr; stdout is reserved for command output
/// such as streamed run events.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let span_events = if config.include_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let mut layers = Vec::new();

    if config.console_enabled {
        let console_layer = fmt::layer()
            .with_target(config.include_targets)
            .with_span_events(span_events.clone())
            .with_writer(std::io::stderr)
            .boxed();

        layers.push(console_layer);
    }

    if config.file_enabled {
        std::fs::create_dir_all(&config.log_directory)?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("scrapeflow")
            .filename_suffix("log")
            .max_log_files(config.max_files)
            .build(&config.log_directory)?;

        let file_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_thread_ids(true)
                .with_target(config.include_targets)
                .with_span_events(span_events)
                .with_writer(file_appender)
                .boxed()
        } else {
            fmt::layer()
                .with_ansi(false)
                .with_target(config.include_targets)
                .with_span_events(span_events)
                .with_writer(file_appender)
                .boxed()
        };

        layers.push(file_layer);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_enabled {
        info!("Log directory: {}", config.log_directory.display());
    }

    Ok(())
}

/// Structured logging context
#[derive(Debug, Clone, Serialize)]
pub struct LogContext {
    pub component: String,
    pub operation: String,
    pub run_id: Option<String>,
    pub scraper_id: Option<String>,
    pub iteration: Option<usize>,
    pub instruction_index: Option<usize>,
    pub duration_ms: Option<u64>,
    pub status: Option<String>,
    pub error_category: Option<String>,
    pub additional_fields: HashMap<String, serde_json::Value>,
}

impl LogContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            run_id: None,
            scraper_id: None,
            iteration: None,
            instruction_index: None,
            duration_ms: None,
            status: None,
            error_category: None,
            additional_fields: HashMap::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl ToString) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn with_scraper_id(mut self, scraper_id: impl Into<String>) -> Self {
        self.scraper_id = Some(scraper_id.into());
        self
    }

    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_instruction(mut self, index: usize) -> Self {
        self.instruction_index = Some(index);
        self
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_error_category(mut self, category: impl Into<String>) -> Self {
        self.error_category = Some(category.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.additional_fields.insert(key.into(), value);
        self
    }

    pub fn with_string_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_fields
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }
}

/// Structured logging macros
#[macro_export]
macro_rules! log_info {
    ($context:expr, $message:expr) => {
        tracing::info!(
            component = %$context.component,
            operation = %$context.operation,
            run_id = ?$context.run_id,
            scraper_id = ?$context.scraper_id,
            iteration = ?$context.iteration,
            instruction_index = ?$context.instruction_index,
            duration_ms = ?$context.duration_ms,
            status = ?$context.status,
            additional_fields = ?$context.additional_fields,
            "{}", $message
        );
    };
}

#[macro_export]
macro_rules! log_warn {
    ($context:expr, $message:expr) => {
        tracing::warn!(
            component = %$context.component,
            operation = %$context.operation,
            run_id = ?$context.run_id,
            scraper_id = ?$context.scraper_id,
            iteration = ?$context.iteration,
            instruction_index = ?$context.instruction_index,
            status = ?$context.status,
            error_category = ?$context.error_category,
            additional_fields = ?$context.additional_fields,
            "{}", $message
        );
    };
}

#[macro_export]
macro_rules! log_error {
    ($context:expr, $error:expr, $message:expr) => {
        tracing::error!(
            component = %$context.component,
            operation = %$context.operation,
            run_id = ?$context.run_id,
            scraper_id = ?$context.scraper_id,
            iteration = ?$context.iteration,
            instruction_index = ?$context.instruction_index,
            status = ?$context.status,
            error_category = ?$context.error_category,
            additional_fields = ?$context.additional_fields,
            error = %$error,
            "{}", $message
        );
    };
}

#[macro_export]
macro_rules! log_debug {
    ($context:expr, $message:expr) => {
        tracing::debug!(
            component = %$context.component,
            operation = %$context.operation,
            run_id = ?$context.run_id,
            instruction_index = ?$context.instruction_index,
            additional_fields = ?$context.additional_fields,
            "{}", $message
        );
    };
}

/// Times an operation and logs it with its context when finished
pub struct PerformanceLogger {
    context: LogContext,
    start_time: std::time::Instant,
}

impl PerformanceLogger {
    pub fn new(context: LogContext) -> Self {
        Self {
            context,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn finish_with_status(self, message: &str, status: impl Into<String>) {
        let context = self
            .context
            .with_duration(self.start_time.elapsed())
            .with_status(status);
        log_info!(context, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_context_creation() {
        let context = LogContext::new("engine", "iteration")
            .with_run_id("run-1")
            .with_scraper_id("scraper-1")
            .with_iteration(2)
            .with_instruction(7)
            .with_string_field("custom", "value");

        assert_eq!(context.component, "engine");
        assert_eq!(context.operation, "iteration");
        assert_eq!(context.run_id.as_deref(), Some("run-1"));
        assert_eq!(context.scraper_id.as_deref(), Some("scraper-1"));
        assert_eq!(context.iteration, Some(2));
        assert_eq!(context.instruction_index, Some(7));
        assert!(context.additional_fields.contains_key("custom"));
    }

    #[test]
    fn test_duration_and_status_fields() {
        let context = LogContext::new("engine", "run")
            .with_duration(std::time::Duration::from_millis(1500))
            .with_status("succeeded")
            .with_error_category("browser");

        assert_eq!(context.duration_ms, Some(1500));
        assert_eq!(context.status.as_deref(), Some("succeeded"));
        assert_eq!(context.error_category.as_deref(), Some("browser"));

        PerformanceLogger::new(context).finish_with_status("done", "succeeded");
    }
}
