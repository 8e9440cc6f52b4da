//! ScrapeFlow - instruction-driven web automation runtime
//!
//! This library provides:
//! - A validated program model of scraper instructions with markers and jumps
//! - An interpreter running programs once or per iteration over ranges and stored rows
//! - Page drivers (static HTML and Playwright) behind one executor
//! - Typed external data stores (SQLite and in-memory)
//! - Run lifecycle management with live execution events

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod page;
pub mod program;
pub mod storage;
pub mod store;
pub mod values;

#[cfg(feature = "api")]
pub mod api;

// Re-export main types for convenience
pub use crate::config::AppConfig;
pub use crate::engine::{ExecutionIteratorConfig, ExecutionRequest, RunManager, RunResult, RunState};
pub use crate::error::{ErrorInfo, ScraperError, ScraperResult};
pub use crate::program::Program;
