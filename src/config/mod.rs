use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::logging::LoggingConfig;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub execution: ExecutionConfig,
    pub browser: BrowserConfig,
    pub ai: AiConfig,
    pub system: SystemConfig,
    #[cfg(feature = "api")]
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Scraper programs and run records
    pub path: PathBuf,
    /// User-defined data stores
    pub data_store_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_steps_per_iteration: usize,
    pub stop_on_error: bool,
    pub max_concurrent_runs: usize,
    pub event_channel_capacity: usize,
    /// Finished runs kept in memory with their event logs; older ones are
    /// answered from run records only
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

fn default_retained_runs() -> usize {
    64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Fetches pages over HTTP and works on the parsed markup
    Static,
    /// Drives a real Chromium instance (feature `browser`)
    Playwright,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub driver: DriverKind,
    pub headless: bool,
    pub user_agent: String,
    pub request_timeout_seconds: u64,
    pub max_retries: usize,
    pub retry_delay_seconds: u64,
    pub element_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
    pub action_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub enabled: bool,
    pub model_path: PathBuf,
    pub snapshot_max_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub allow_system_commands: bool,
    pub command_timeout_seconds: u64,
}

#[cfg(feature = "api")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_steps_per_iteration: 10_000,
            stop_on_error: false,
            max_concurrent_runs: 4,
            event_channel_capacity: 256,
            retained_runs: default_retained_runs(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Static,
            headless: true,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            request_timeout_seconds: 30,
            max_retries: 3,
            retry_delay_seconds: 2,
            element_timeout_ms: 5_000,
            navigation_timeout_ms: 30_000,
            action_timeout_ms: 15_000,
            poll_interval_ms: 100,
            max_wait_ms: 60_000,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            allow_system_commands: false,
            command_timeout_seconds: 30,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = get_data_directory();

        Self {
            database: DatabaseConfig {
                path: data_dir.join("scrapeflow.db"),
                data_store_path: data_dir.join("stores.db"),
            },
            execution: ExecutionConfig::default(),
            browser: BrowserConfig::default(),
            ai: AiConfig {
                enabled: false,
                model_path: data_dir.join("models").join("locator.gguf"),
                snapshot_max_bytes: crate::page::simplifier::DEFAULT_MAX_BYTES,
            },
            system: SystemConfig::default(),
            #[cfg(feature = "api")]
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            logging: LoggingConfig {
                log_directory: data_dir.join("logs"),
                ..LoggingConfig::default()
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from default locations
    pub async fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            Self::load_from_file(&config_path).await
        } else {
            info!("No configuration file found, using defaults");
            let mut config = Self::default();
            ConfigOverrides::apply(&mut config);
            Ok(config)
        }
    }

    /// Load configuration from specific file
    pub async fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: AppConfig = toml::from_str(&content)?;
        ConfigOverrides::apply(&mut config);

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to default location
    pub async fn save(&self) -> Result<()> {
        let config_path = get_config_path();

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&config_path, content).await?;

        info!("Configuration saved to: {}", config_path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_steps_per_iteration == 0 {
            return Err(anyhow::anyhow!("Execution max_steps_per_iteration must be > 0"));
        }

        if self.execution.max_concurrent_runs == 0 {
            return Err(anyhow::anyhow!("Execution max_concurrent_runs must be > 0"));
        }

        if self.execution.event_channel_capacity == 0 {
            return Err(anyhow::anyhow!("Execution event_channel_capacity must be > 0"));
        }

        if self.execution.retained_runs == 0 {
            return Err(anyhow::anyhow!("Execution retained_runs must be > 0"));
        }

        let timeouts = [
            ("element_timeout_ms", self.browser.element_timeout_ms),
            ("navigation_timeout_ms", self.browser.navigation_timeout_ms),
            ("action_timeout_ms", self.browser.action_timeout_ms),
            ("poll_interval_ms", self.browser.poll_interval_ms),
            ("max_wait_ms", self.browser.max_wait_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(anyhow::anyhow!("Browser {} must be > 0", name));
            }
        }

        if self.ai.snapshot_max_bytes == 0 {
            return Err(anyhow::anyhow!("AI snapshot_max_bytes must be > 0"));
        }

        if self.system.command_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("System command_timeout_seconds must be > 0"));
        }

        #[cfg(feature = "api")]
        {
            if self.api.port == 0 {
                return Err(anyhow::anyhow!("API port must be > 0"));
            }
        }

        info!("Configuration validation passed");
        Ok(())
    }

    /// Ensure all required directories exist
    pub async fn ensure_directories(&self) -> Result<()> {
        let dirs_to_create = [
            self.database.path.parent(),
            self.database.data_store_path.parent(),
        ];

        for dir in dirs_to_create.into_iter().flatten() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tokio::fs::create_dir_all(dir).await?;
                info!("Created directory: {}", dir.display());
            }
        }

        Ok(())
    }
}

impl BrowserConfig {
    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Get the default data directory
fn get_data_directory() -> PathBuf {
    directories::ProjectDirs::from("com", "scrapeflow", "scrapeflow")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("data"))
}

/// Get the configuration file path
fn get_config_path() -> PathBuf {
    directories::ProjectDirs::from("com", "scrapeflow", "scrapeflow")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("config.toml"))
}

/// Environment-based configuration overrides
pub struct ConfigOverrides;

impl ConfigOverrides {
    /// Apply environment variable overrides to configuration
    pub fn apply(config: &mut AppConfig) {
        if let Ok(db_path) = std::env::var("SCRAPEFLOW_DB_PATH") {
            config.database.path = PathBuf::from(db_path);
        }

        if let Ok(store_path) = std::env::var("SCRAPEFLOW_STORE_PATH") {
            config.database.data_store_path = PathBuf::from(store_path);
        }

        if let Ok(steps) = std::env::var("SCRAPEFLOW_MAX_STEPS") {
            if let Ok(steps) = steps.parse::<usize>() {
                config.execution.max_steps_per_iteration = steps;
            }
        }

        if let Ok(stop) = std::env::var("SCRAPEFLOW_STOP_ON_ERROR") {
            config.execution.stop_on_error = stop.to_lowercase() == "true";
        }

        if let Ok(ai) = std::env::var("SCRAPEFLOW_AI_ENABLED") {
            config.ai.enabled = ai.to_lowercase() == "true";
        }

        if let Ok(model_path) = std::env::var("SCRAPEFLOW_AI_MODEL_PATH") {
            config.ai.model_path = PathBuf::from(model_path);
        }

        if let Ok(allow) = std::env::var("SCRAPEFLOW_ALLOW_SYSTEM_COMMANDS") {
            config.system.allow_system_commands = allow.to_lowercase() == "true";
        }

        #[cfg(feature = "api")]
        {
            if let Ok(api_host) = std::env::var("SCRAPEFLOW_API_HOST") {
                config.api.host = api_host;
            }

            if let Ok(api_port_str) = std::env::var("SCRAPEFLOW_API_PORT") {
                if let Ok(api_port) = api_port_str.parse::<u16>() {
                    config.api.port = api_port;
                }
            }
        }

        if let Ok(log_level) = std::env::var("SCRAPEFLOW_LOG_LEVEL") {
            config.logging.level = log_level;
        }
    }
}
