use anyhow::Result;
use rusqlite::{params, Connection};
use tracing::info;

/// Database schema version
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Run all necessary database migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    info!("Running database migrations");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current_version = get_schema_version(conn)?;
    info!("Current schema version: {}", current_version);

    for version in (current_version + 1)..=CURRENT_SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        let tx = conn.unchecked_transaction()?;
        apply_migration(&tx, version)?;
        update_schema_version(&tx, version)?;
        tx.commit()?;
    }

    info!("Database migrations completed");
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })?;
    Ok(version)
}

fn update_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![version, chrono::Utc::now().timestamp()],
    )?;
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => apply_migration_v1(conn),
        _ => Err(anyhow::anyhow!("Unknown migration version: {}", version)),
    }
}

/// Migration v1: scraper programs and run records
fn apply_migration_v1(conn: &Connection) -> Result<()> {
    info!("Applying migration v1: Initial schema");

    conn.execute(
        "CREATE TABLE scrapers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            program_json TEXT NOT NULL,
            digest TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    // Ad-hoc programs run without a saved scraper, so no foreign key
    conn.execute(
        "CREATE TABLE runs (
            id TEXT PRIMARY KEY,
            scraper_id TEXT NOT NULL,
            status TEXT NOT NULL,
            iterator_json TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            iterations INTEGER NOT NULL DEFAULT 0,
            failed_iterations INTEGER NOT NULL DEFAULT 0,
            error_json TEXT
        )",
        [],
    )?;

    conn.execute("CREATE INDEX idx_scrapers_name ON scrapers (name)", [])?;
    conn.execute("CREATE INDEX idx_runs_scraper_id ON runs (scraper_id)", [])?;
    conn.execute("CREATE INDEX idx_runs_started_at ON runs (started_at)", [])?;

    info!("Migration v1 completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('scrapers', 'runs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
