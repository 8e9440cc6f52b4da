use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub mod migrations;

use crate::config::DatabaseConfig;
use crate::engine::iterator::ExecutionIteratorConfig;
use crate::error::ErrorInfo;
use crate::program::Program;

/// Metadata storage: saved scraper programs and run records
#[derive(Clone)]
pub struct StorageManager {
    connection: Arc<Mutex<Connection>>,
}

/// A saved scraper program
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperRecord {
    pub id: String,
    pub name: String,
    pub program: Program,
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Run status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid run status: {}", s)),
        }
    }
}

/// Persisted outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: Uuid,
    pub scraper_id: String,
    pub status: RunStatus,
    pub iterator: Option<ExecutionIteratorConfig>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub iterations: usize,
    pub failed_iterations: usize,
    pub error: Option<ErrorInfo>,
}

/// Final figures written when a run exits
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub status: RunStatus,
    pub iterations: usize,
    pub failed_iterations: usize,
    pub error: Option<ErrorInfo>,
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn scraper_from_row(row: &Row<'_>) -> rusqlite::Result<ScraperRecord> {
    let program: Program = json_column(row, 2)?.ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(2, "program_json".to_string(), rusqlite::types::Type::Null)
    })?;
    Ok(ScraperRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        program,
        digest: row.get(3)?,
        created_at: timestamp(row.get(4)?),
        updated_at: timestamp(row.get(5)?),
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let id: String = row.get(0)?;
    Ok(RunRecord {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        scraper_id: row.get(1)?,
        status: row.get::<_, String>(2)?.parse().unwrap_or(RunStatus::Failed),
        iterator: json_column(row, 3)?,
        started_at: timestamp(row.get(4)?),
        finished_at: row.get::<_, Option<i64>>(5)?.map(timestamp),
        iterations: row.get::<_, i64>(6)? as usize,
        failed_iterations: row.get::<_, i64>(7)? as usize,
        error: json_column(row, 8)?,
    })
}

const RUN_COLUMNS: &str =
    "id, scraper_id, status, iterator_json, started_at, finished_at, iterations, failed_iterations, error_json";

impl StorageManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Initializing storage manager with database: {}", config.path.display());

        if let Some(parent) = config.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let connection = Connection::open(&config.path)?;
        connection.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        Self::with_connection(connection)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        migrations::run_migrations(&connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Saves a new scraper program under a fresh id
    pub async fn save_scraper(&self, name: &str, program: &Program) -> Result<ScraperRecord> {
        let now = Utc::now();
        let record = ScraperRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            program: program.clone(),
            digest: program.digest()?,
            created_at: now,
            updated_at: now,
        };

        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO scrapers (id, name, program_json, digest, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.name,
                program.to_json()?,
                record.digest,
                now.timestamp(),
                now.timestamp()
            ],
        )?;

        info!("Saved scraper {} ({})", record.name, record.id);
        Ok(record)
    }

    /// Replaces the program of an existing scraper
    pub async fn update_scraper(&self, scraper_id: &str, program: &Program) -> Result<()> {
        let conn = self.connection.lock().await;
        let updated = conn.execute(
            "UPDATE scrapers SET program_json = ?1, digest = ?2, updated_at = ?3 WHERE id = ?4",
            params![program.to_json()?, program.digest()?, Utc::now().timestamp(), scraper_id],
        )?;

        if updated == 0 {
            return Err(anyhow::anyhow!("Scraper not found: {}", scraper_id));
        }
        debug!("Updated program of scraper {}", scraper_id);
        Ok(())
    }

    pub async fn get_scraper(&self, scraper_id: &str) -> Result<Option<ScraperRecord>> {
        let conn = self.connection.lock().await;
        let record = conn
            .query_row(
                "SELECT id, name, program_json, digest, created_at, updated_at FROM scrapers WHERE id = ?1",
                params![scraper_id],
                scraper_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All saved scrapers, most recently updated first
    pub async fn list_scrapers(&self) -> Result<Vec<ScraperRecord>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, program_json, digest, created_at, updated_at
             FROM scrapers ORDER BY updated_at DESC, name",
        )?;
        let scrapers = stmt
            .query_map([], scraper_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scrapers)
    }

    pub async fn delete_scraper(&self, scraper_id: &str) -> Result<bool> {
        let conn = self.connection.lock().await;
        let deleted = conn.execute("DELETE FROM scrapers WHERE id = ?1", params![scraper_id])?;
        Ok(deleted > 0)
    }

    pub async fn create_run(&self, run: &RunRecord) -> Result<()> {
        let iterator = run.iterator.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO runs (id, scraper_id, status, iterator_json, started_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.id.to_string(),
                run.scraper_id,
                run.status.to_string(),
                iterator,
                run.started_at.timestamp()
            ],
        )?;
        debug!("Recorded start of run {}", run.id);
        Ok(())
    }

    pub async fn finish_run(&self, run_id: Uuid, summary: &RunSummary) -> Result<()> {
        let error = summary.error.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.connection.lock().await;
        let updated = conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, iterations = ?3, failed_iterations = ?4, error_json = ?5
             WHERE id = ?6",
            params![
                summary.status.to_string(),
                Utc::now().timestamp(),
                summary.iterations as i64,
                summary.failed_iterations as i64,
                error,
                run_id.to_string()
            ],
        )?;

        if updated == 0 {
            return Err(anyhow::anyhow!("Run not found: {}", run_id));
        }
        debug!("Recorded finish of run {} as {}", run_id, summary.status);
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let conn = self.connection.lock().await;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id.to_string()],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Recent runs of a scraper, newest first
    pub async fn list_runs(&self, scraper_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE scraper_id = ?1 ORDER BY started_at DESC LIMIT ?2",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![scraper_id, limit as i64], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}
