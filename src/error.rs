use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error taxonomy for program loading and execution
#[derive(Error, Debug, Clone)]
pub enum ScraperError {
    // Page errors
    #[error("Element not found: {selector} on page {page_index}")]
    ElementNotFound { selector: String, page_index: usize },

    #[error("Page index {page_index} out of range ({open_pages} open)")]
    PageIndexOutOfRange { page_index: usize, open_pages: usize },

    #[error("Invalid selector: {selector}")]
    InvalidSelector { selector: String },

    #[error("Navigation to {url} timed out after {timeout_ms}ms")]
    NavigationTimeout { url: String, timeout_ms: u64 },

    #[error("{action} timed out after {timeout_ms}ms")]
    ActionTimeout { action: String, timeout_ms: u64 },

    #[error("Browser error: {message}")]
    Browser { message: String },

    #[error("Feature unavailable: {feature}")]
    FeatureUnavailable { feature: String },

    // Data store errors
    #[error("No data for {store}.{column} and no default declared")]
    DataNotFound { store: String, column: String },

    #[error("Write to store {store} failed: {reason}")]
    StoreWriteFailed { store: String, reason: String },

    #[error("Read from store {store} failed: {reason}")]
    StoreReadFailed { store: String, reason: String },

    // Program errors
    #[error("Invalid condition: {reason}")]
    InvalidCondition { reason: String },

    #[error("Invalid program: {}", .issues.join("; "))]
    InvalidProgram { issues: Vec<String> },

    #[error("Invalid iterator configuration: {reason}")]
    InvalidIterator { reason: String },

    #[error("Step limit of {limit} instructions exceeded")]
    StepLimitExceeded { limit: usize },

    #[error("System command failed: {command}: {reason}")]
    SystemCommandFailed { command: String, reason: String },

    // Run management errors
    #[error("Scraper not found: {scraper_id}")]
    ScraperNotFound { scraper_id: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Serializable discriminant of [`ScraperError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ElementNotFound,
    PageIndexOutOfRange,
    InvalidSelector,
    NavigationTimeout,
    ActionTimeout,
    Browser,
    FeatureUnavailable,
    DataNotFound,
    StoreWriteFailed,
    StoreReadFailed,
    InvalidCondition,
    InvalidProgram,
    InvalidIterator,
    StepLimitExceeded,
    SystemCommandFailed,
    ScraperNotFound,
    RunNotFound,
    Configuration,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ScraperError {
    pub fn browser(message: impl Into<String>) -> Self {
        Self::Browser { message: message.into() }
    }

    pub fn unavailable(feature: impl Into<String>) -> Self {
        Self::FeatureUnavailable { feature: feature.into() }
    }

    pub fn invalid_condition(reason: impl Into<String>) -> Self {
        Self::InvalidCondition { reason: reason.into() }
    }

    pub fn write_failed(store: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::StoreWriteFailed { store: store.into(), reason: reason.to_string() }
    }

    pub fn read_failed(store: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::StoreReadFailed { store: store.into(), reason: reason.to_string() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ElementNotFound { .. } => ErrorKind::ElementNotFound,
            Self::PageIndexOutOfRange { .. } => ErrorKind::PageIndexOutOfRange,
            Self::InvalidSelector { .. } => ErrorKind::InvalidSelector,
            Self::NavigationTimeout { .. } => ErrorKind::NavigationTimeout,
            Self::ActionTimeout { .. } => ErrorKind::ActionTimeout,
            Self::Browser { .. } => ErrorKind::Browser,
            Self::FeatureUnavailable { .. } => ErrorKind::FeatureUnavailable,
            Self::DataNotFound { .. } => ErrorKind::DataNotFound,
            Self::StoreWriteFailed { .. } => ErrorKind::StoreWriteFailed,
            Self::StoreReadFailed { .. } => ErrorKind::StoreReadFailed,
            Self::InvalidCondition { .. } => ErrorKind::InvalidCondition,
            Self::InvalidProgram { .. } => ErrorKind::InvalidProgram,
            Self::InvalidIterator { .. } => ErrorKind::InvalidIterator,
            Self::StepLimitExceeded { .. } => ErrorKind::StepLimitExceeded,
            Self::SystemCommandFailed { .. } => ErrorKind::SystemCommandFailed,
            Self::ScraperNotFound { .. } => ErrorKind::ScraperNotFound,
            Self::RunNotFound { .. } => ErrorKind::RunNotFound,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::ElementNotFound { .. }
            | Self::PageIndexOutOfRange { .. }
            | Self::InvalidSelector { .. }
            | Self::NavigationTimeout { .. }
            | Self::ActionTimeout { .. }
            | Self::Browser { .. } => "page",
            Self::FeatureUnavailable { .. } => "capability",
            Self::DataNotFound { .. } | Self::StoreWriteFailed { .. } | Self::StoreReadFailed { .. } => "store",
            Self::InvalidCondition { .. }
            | Self::InvalidProgram { .. }
            | Self::InvalidIterator { .. }
            | Self::StepLimitExceeded { .. } => "program",
            Self::SystemCommandFailed { .. } => "system",
            Self::ScraperNotFound { .. } | Self::RunNotFound { .. } => "run",
            Self::Configuration { .. } => "configuration",
            Self::Cancelled | Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for the execution core
pub type ScraperResult<T> = std::result::Result<T, ScraperError>;

/// Structured error detail carried by execution events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_index: Option<usize>,
}

impl ErrorInfo {
    pub fn new(error: &ScraperError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            instruction_index: None,
            iteration_index: None,
        }
    }

    pub fn at_instruction(mut self, index: usize) -> Self {
        self.instruction_index = Some(index);
        self
    }

    pub fn in_iteration(mut self, index: usize) -> Self {
        self.iteration_index = Some(index);
        self
    }
}

impl From<&ScraperError> for ErrorInfo {
    fn from(error: &ScraperError) -> Self {
        Self::new(error)
    }
}

impl From<rusqlite::Error> for ScraperError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal { message: format!("sqlite: {}", err) }
    }
}

impl From<anyhow::Error> for ScraperError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_and_category() {
        let error = ScraperError::ElementNotFound { selector: "h1".into(), page_index: 0 };
        assert_eq!(error.kind(), ErrorKind::ElementNotFound);
        assert_eq!(error.category(), "page");

        let error = ScraperError::Cancelled;
        assert_eq!(error.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_error_info_serialization() {
        let error = ScraperError::StepLimitExceeded { limit: 5 };
        let info = ErrorInfo::new(&error).at_instruction(3).in_iteration(1);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["kind"], "StepLimitExceeded");
        assert_eq!(json["instructionIndex"], 3);
        assert_eq!(json["iterationIndex"], 1);
        assert!(json["message"].as_str().unwrap().contains("5"));
    }

    #[test]
    fn test_invalid_program_lists_issues() {
        let error = ScraperError::InvalidProgram {
            issues: vec!["first".into(), "second".into()],
        };
        assert_eq!(error.to_string(), "Invalid program: first; second");
    }
}
