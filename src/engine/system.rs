use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SystemConfig;
use crate::error::{ScraperError, ScraperResult};
use crate::program::SystemActionType;
use crate::values::condition::as_text;
use crate::values::ResolveContext;

/// Displays notifications to the user
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str) -> ScraperResult<()>;
}

/// Writes notifications to the log; the default for headless use
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, message: &str) -> ScraperResult<()> {
        info!(target: "scrapeflow::notification", title, "{}", message);
        Ok(())
    }
}

const DEFAULT_TITLE: &str = "Scraper";

/// Runs `SystemAction` instructions
pub struct SystemActions {
    notifier: Arc<dyn Notifier>,
    config: SystemConfig,
}

impl SystemActions {
    pub fn new(notifier: Arc<dyn Notifier>, config: &SystemConfig) -> Self {
        Self {
            notifier,
            config: config.clone(),
        }
    }

    /// Performs the action; it is logged even when `silent` suppresses display
    pub async fn perform(
        &self,
        action: &SystemActionType,
        resolver: &ResolveContext<'_>,
        silent: bool,
    ) -> ScraperResult<()> {
        match action {
            SystemActionType::ShowNotification { title, message } => {
                let resolved = resolver.resolve(message).await?;
                let message = as_text(&resolved).unwrap_or_else(|| match resolved {
                    Value::Null => String::new(),
                    other => other.to_string(),
                });
                let title = title.as_deref().unwrap_or(DEFAULT_TITLE);

                info!("ShowNotification [{}]: {}", title, message);
                if !silent {
                    self.notifier.notify(title, &message).await?;
                }
                Ok(())
            }
            SystemActionType::ExecuteSystemCommand { command, args } => {
                info!("ExecuteSystemCommand: {} {:?}", command, args);
                self.run_command(command, args).await
            }
        }
    }

    async fn run_command(&self, command: &str, args: &[String]) -> ScraperResult<()> {
        if !self.config.allow_system_commands {
            return Err(ScraperError::unavailable(
                "system commands are disabled (system.allow_system_commands)",
            ));
        }

        let failed = |reason: String| ScraperError::SystemCommandFailed {
            command: command.to_string(),
            reason,
        };

        let child = tokio::process::Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(e.to_string()))?;

        let limit = Duration::from_secs(self.config.command_timeout_seconds);
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| failed(format!("timed out after {}s", limit.as_secs())))?
            .map_err(|e| failed(e.to_string()))?;

        if output.status.success() {
            info!(
                "Command {} finished: {}",
                command,
                String::from_utf8_lossy(&output.stdout).trim()
            );
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("Command {} exited with {}", command, output.status);
            Err(failed(format!("{}: {}", output.status, stderr)))
        }
    }
}
