use async_trait::async_trait;
use base64::Engine as _;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ColumnDef, ColumnType, DataStore, Record, RowSelector, WriteTarget};
use crate::error::{ScraperError, ScraperResult};
use crate::program::validator::is_identifier;
use crate::program::{DataFilter, SqliteConditionType};

/// Data store backed by one SQLite table per store
///
/// Every table carries an `id INTEGER PRIMARY KEY AUTOINCREMENT` column that
/// orders rows and identifies iteration bindings.
pub struct SqliteDataStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteDataStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("Opening data store database: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connection = Connection::open(path)?;
        Self::configure(&connection)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let connection = Connection::open_in_memory()?;
        Self::configure(&connection)?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn configure(connection: &Connection) -> rusqlite::Result<()> {
        connection.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;

        // Built-in lower() and LIKE only fold ASCII
        connection.create_scalar_function(
            "unicode_lower",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                Ok(match ctx.get_raw(0) {
                    ValueRef::Text(text) => SqlValue::Text(String::from_utf8_lossy(text).to_lowercase()),
                    other => SqlValue::from(other),
                })
            },
        )
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

fn check_identifier(store: &str, what: &str, name: &str) -> ScraperResult<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(ScraperError::write_failed(store, format!("invalid {} name '{}'", what, name)))
    }
}

fn table_columns(conn: &Connection, store: &str) -> rusqlite::Result<Vec<ColumnDef>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(store)))?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(1)?;
        let declared: String = row.get(2)?;
        let not_null: bool = row.get(3)?;
        let pk: i64 = row.get(5)?;
        Ok((name, declared, not_null, pk))
    })?;

    let mut columns = Vec::new();
    for row in rows {
        let (name, declared, not_null, pk) = row?;
        if pk > 0 {
            continue;
        }
        columns.push(ColumnDef {
            name,
            column_type: ColumnType::from_sql_name(&declared).unwrap_or(ColumnType::Text),
            nullable: !not_null,
        });
    }
    Ok(columns)
}

/// Loads the schema of an existing store, failing when it does not exist
fn schema(conn: &Connection, store: &str) -> Result<Vec<ColumnDef>, String> {
    if !is_identifier(store) {
        return Err(format!("invalid store name '{}'", store));
    }
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [store],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?;
    if exists.is_none() {
        return Err(format!("store '{}' does not exist", store));
    }
    table_columns(conn, store).map_err(|e| e.to_string())
}

fn column_type(columns: &[ColumnDef], column: &str) -> Result<ColumnType, String> {
    columns
        .iter()
        .find(|c| c.name == column)
        .map(|c| c.column_type)
        .ok_or_else(|| format!("unknown column '{}'", column))
}

fn to_sql(column_type: ColumnType, value: &Value) -> Result<SqlValue, String> {
    let value = column_type.coerce(value)?;
    Ok(match (column_type, value) {
        (_, Value::Null) => SqlValue::Null,
        (ColumnType::Boolean, Value::Bool(b)) => SqlValue::Integer(b as i64),
        (ColumnType::Integer | ColumnType::Timestamp, Value::Number(n)) => {
            SqlValue::Integer(n.as_i64().unwrap_or_default())
        }
        (ColumnType::Real, Value::Number(n)) => SqlValue::Real(n.as_f64().unwrap_or_default()),
        (ColumnType::Blob, Value::String(s)) => SqlValue::Blob(
            base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(|e| e.to_string())?,
        ),
        (_, Value::String(s)) => SqlValue::Text(s),
        (_, other) => SqlValue::Text(other.to_string()),
    })
}

/// Filter operand: coerced to the column type when possible, raw otherwise
fn filter_operand(column_type: ColumnType, value: &Value) -> SqlValue {
    if let Ok(sql) = to_sql(column_type, value) {
        return sql;
    }
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(column_type: ColumnType, value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) if column_type == ColumnType::Boolean => Value::Bool(i != 0),
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    }
}

/// Translates a LIKE pattern into a case-sensitive GLOB pattern
pub fn like_to_glob(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => glob.push('*'),
            '_' => glob.push('?'),
            '*' => glob.push_str("[*]"),
            '?' => glob.push_str("[?]"),
            '[' => glob.push_str("[[]"),
            other => glob.push(other),
        }
    }
    glob
}

/// Builds a conjunctive WHERE clause for `filters`
fn where_clause(columns: &[ColumnDef], filters: &[DataFilter]) -> Result<(String, Vec<SqlValue>), String> {
    use SqliteConditionType::*;

    if filters.is_empty() {
        return Ok(("1 = 1".to_string(), Vec::new()));
    }

    let mut clauses = Vec::with_capacity(filters.len());
    let mut params = Vec::new();

    for filter in filters {
        let ty = column_type(columns, &filter.column)?;
        filter
            .condition_type
            .check_arity(filter.values.len())?;
        let col = quote(&filter.column);

        let clause = match filter.condition_type {
            IsNull => format!("{} IS NULL", col),
            IsNotNull => format!("{} IS NOT NULL", col),
            Equals | NotEquals | GreaterThan | GreaterThanOrEqual | LessThan | LessThanOrEqual => {
                let op = match filter.condition_type {
                    Equals => "IS",
                    NotEquals => "IS NOT",
                    GreaterThan => ">",
                    GreaterThanOrEqual => ">=",
                    LessThan => "<",
                    _ => "<=",
                };
                params.push(filter_operand(ty, &filter.values[0]));
                format!("{} {} ?", col, op)
            }
            Like | NotLike | ILike | NotILike => {
                let pattern = crate::values::condition::as_text(&filter.values[0])
                    .ok_or_else(|| format!("LIKE pattern must be text, got {}", filter.values[0]))?;
                let (subject, op, pattern) = match filter.condition_type {
                    Like => (col, "GLOB", like_to_glob(&pattern)),
                    NotLike => (col, "NOT GLOB", like_to_glob(&pattern)),
                    ILike => (format!("unicode_lower({})", col), "LIKE", pattern.to_lowercase()),
                    _ => (format!("unicode_lower({})", col), "NOT LIKE", pattern.to_lowercase()),
                };
                params.push(SqlValue::Text(pattern));
                format!("{} {} ?", subject, op)
            }
            In | NotIn => {
                let mut placeholders = Vec::new();
                for value in &filter.values {
                    match value {
                        Value::Array(items) => {
                            for item in items {
                                params.push(filter_operand(ty, item));
                                placeholders.push("?");
                            }
                        }
                        other => {
                            params.push(filter_operand(ty, other));
                            placeholders.push("?");
                        }
                    }
                }
                let op = if filter.condition_type == In { "IN" } else { "NOT IN" };
                if placeholders.is_empty() {
                    // An empty array: nothing is in it
                    if filter.condition_type == In { "0 = 1".to_string() } else { "1 = 1".to_string() }
                } else {
                    format!("{} {} ({})", col, op, placeholders.join(", "))
                }
            }
            Between | NotBetween => {
                params.push(filter_operand(ty, &filter.values[0]));
                params.push(filter_operand(ty, &filter.values[1]));
                let op = if filter.condition_type == Between { "BETWEEN" } else { "NOT BETWEEN" };
                format!("{} {} ? AND ?", col, op)
            }
        };
        clauses.push(clause);
    }

    Ok((clauses.join(" AND "), params))
}

fn read_row(conn: &Connection, store: &str, columns: &[ColumnDef], id: i64) -> rusqlite::Result<Option<Record>> {
    let names: Vec<String> = columns.iter().map(|c| quote(&c.name)).collect();
    let select = if names.is_empty() {
        "id".to_string()
    } else {
        format!("id, {}", names.join(", "))
    };
    let sql = format!("SELECT {} FROM {} WHERE id = ?1", select, quote(store));

    conn.query_row(&sql, [id], |row| {
        let mut values = Map::new();
        for (i, column) in columns.iter().enumerate() {
            values.insert(column.name.clone(), from_sql(column.column_type, row.get_ref(i + 1)?));
        }
        Ok(Record { id, values })
    })
    .optional()
}

#[async_trait]
impl DataStore for SqliteDataStore {
    async fn create_store(&self, name: &str, columns: &[ColumnDef]) -> ScraperResult<()> {
        check_identifier(name, "store", name)?;

        let mut definitions = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
        for column in columns {
            check_identifier(name, "column", &column.name)?;
            if column.name.eq_ignore_ascii_case("id") {
                return Err(ScraperError::write_failed(name, "column name 'id' is reserved"));
            }
            definitions.push(format!(
                "{} {}{}",
                quote(&column.name),
                column.column_type.sql_name(),
                if column.nullable { "" } else { " NOT NULL" }
            ));
        }

        let sql = format!("CREATE TABLE {} ({})", quote(name), definitions.join(", "));
        let conn = self.connection.lock().await;
        conn.execute(&sql, [])
            .map_err(|e| ScraperError::write_failed(name, e))?;

        debug!("Created store {} with {} columns", name, columns.len());
        Ok(())
    }

    async fn columns(&self, store: &str) -> ScraperResult<Vec<ColumnDef>> {
        let conn = self.connection.lock().await;
        schema(&conn, store).map_err(|e| ScraperError::read_failed(store, e))
    }

    async fn get(&self, store: &str, column: &str, selector: RowSelector<'_>) -> ScraperResult<Option<Value>> {
        let conn = self.connection.lock().await;
        let columns = schema(&conn, store).map_err(|e| ScraperError::read_failed(store, e))?;
        let ty = column_type(&columns, column).map_err(|e| ScraperError::read_failed(store, e))?;

        let (clause, params) = match selector {
            RowSelector::Row(id) => ("id = ?".to_string(), vec![SqlValue::Integer(id)]),
            RowSelector::Filtered(filters) => {
                where_clause(&columns, filters).map_err(|e| ScraperError::read_failed(store, e))?
            }
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY id LIMIT 1",
            quote(column),
            quote(store),
            clause
        );

        conn.query_row(&sql, params_from_iter(params.iter()), |row| {
            Ok(from_sql(ty, row.get_ref(0)?))
        })
        .optional()
        .map_err(|e| ScraperError::read_failed(store, e))
    }

    async fn set_many(&self, store: &str, target: WriteTarget, values: Map<String, Value>) -> ScraperResult<i64> {
        let mut conn = self.connection.lock().await;
        let columns = schema(&conn, store).map_err(|e| ScraperError::write_failed(store, e))?;

        let mut names = Vec::with_capacity(values.len());
        let mut params = Vec::with_capacity(values.len() + 1);
        for (column, value) in &values {
            let ty = column_type(&columns, column).map_err(|e| ScraperError::write_failed(store, e))?;
            let sql_value = to_sql(ty, value).map_err(|e| ScraperError::write_failed(store, format!("{}: {}", column, e)))?;
            names.push(quote(column));
            params.push(sql_value);
        }

        let tx = conn
            .transaction()
            .map_err(|e| ScraperError::write_failed(store, e))?;

        let id = match target {
            WriteTarget::Insert => {
                let sql = if names.is_empty() {
                    format!("INSERT INTO {} DEFAULT VALUES", quote(store))
                } else {
                    let placeholders = vec!["?"; names.len()].join(", ");
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        quote(store),
                        names.join(", "),
                        placeholders
                    )
                };
                tx.execute(&sql, params_from_iter(params.iter()))
                    .map_err(|e| ScraperError::write_failed(store, e))?;
                tx.last_insert_rowid()
            }
            WriteTarget::Update(id) => {
                let changed = if names.is_empty() {
                    tx.query_row(
                        &format!("SELECT COUNT(*) FROM {} WHERE id = ?1", quote(store)),
                        [id],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(|e| ScraperError::write_failed(store, e))? as usize
                } else {
                    let assignments: Vec<String> = names.iter().map(|n| format!("{} = ?", n)).collect();
                    let sql = format!("UPDATE {} SET {} WHERE id = ?", quote(store), assignments.join(", "));
                    params.push(SqlValue::Integer(id));
                    tx.execute(&sql, params_from_iter(params.iter()))
                        .map_err(|e| ScraperError::write_failed(store, e))?
                };
                if changed == 0 {
                    return Err(ScraperError::write_failed(store, format!("row {} does not exist", id)));
                }
                id
            }
        };

        tx.commit().map_err(|e| ScraperError::write_failed(store, e))?;
        Ok(id)
    }

    async fn delete(&self, store: &str, filters: &[DataFilter]) -> ScraperResult<usize> {
        let conn = self.connection.lock().await;
        let columns = schema(&conn, store).map_err(|e| ScraperError::write_failed(store, e))?;
        let (clause, params) = where_clause(&columns, filters).map_err(|e| ScraperError::write_failed(store, e))?;

        let sql = format!("DELETE FROM {} WHERE {}", quote(store), clause);
        conn.execute(&sql, params_from_iter(params.iter()))
            .map_err(|e| ScraperError::write_failed(store, e))
    }

    async fn delete_row(&self, store: &str, id: i64) -> ScraperResult<bool> {
        let conn = self.connection.lock().await;
        schema(&conn, store).map_err(|e| ScraperError::write_failed(store, e))?;

        let sql = format!("DELETE FROM {} WHERE id = ?1", quote(store));
        let removed = conn
            .execute(&sql, [id])
            .map_err(|e| ScraperError::write_failed(store, e))?;
        Ok(removed > 0)
    }

    async fn row_ids(&self, store: &str, filters: &[DataFilter]) -> ScraperResult<Vec<i64>> {
        let conn = self.connection.lock().await;
        let columns = schema(&conn, store).map_err(|e| ScraperError::read_failed(store, e))?;
        let (clause, params) = where_clause(&columns, filters).map_err(|e| ScraperError::read_failed(store, e))?;

        let sql = format!("SELECT id FROM {} WHERE {} ORDER BY id", quote(store), clause);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| ScraperError::read_failed(store, e))?;
        let ids = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| ScraperError::read_failed(store, e))?;
        Ok(ids)
    }

    async fn row(&self, store: &str, id: i64) -> ScraperResult<Option<Record>> {
        let conn = self.connection.lock().await;
        let columns = schema(&conn, store).map_err(|e| ScraperError::read_failed(store, e))?;
        read_row(&conn, store, &columns, id).map_err(|e| ScraperError::read_failed(store, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn listings() -> SqliteDataStore {
        let store = SqliteDataStore::in_memory().unwrap();
        store
            .create_store(
                "listings",
                &[
                    ColumnDef::new("title", ColumnType::Text).required(),
                    ColumnDef::new("price", ColumnType::Real),
                    ColumnDef::new("sold", ColumnType::Boolean),
                    ColumnDef::new("thumb", ColumnType::Blob),
                ],
            )
            .await
            .unwrap();
        store
    }

    fn values(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let store = listings().await;
        let id = store
            .set_many(
                "listings",
                WriteTarget::Insert,
                values(&[
                    ("title", json!("Desk")),
                    ("price", json!("120.5")),
                    ("sold", json!(true)),
                    ("thumb", json!("aGVsbG8=")),
                ]),
            )
            .await
            .unwrap();

        let record = store.row("listings", id).await.unwrap().unwrap();
        assert_eq!(record.values["price"], json!(120.5));
        assert_eq!(record.values["sold"], json!(true));
        assert_eq!(record.values["thumb"], json!("aGVsbG8="));

        let columns = store.columns("listings").await.unwrap();
        assert_eq!(columns.len(), 4);
        assert!(!columns[0].nullable);
    }

    #[tokio::test]
    async fn test_like_is_case_sensitive_ilike_is_not() {
        let store = listings().await;
        for title in ["Blue Chair", "blue lamp", "Red Chair"] {
            store
                .set("listings", WriteTarget::Insert, "title", json!(title))
                .await
                .unwrap();
        }

        let like = [DataFilter::new("title", SqliteConditionType::Like, vec![json!("Blue%")])];
        assert_eq!(store.row_ids("listings", &like).await.unwrap(), vec![1]);

        let ilike = [DataFilter::new("title", SqliteConditionType::ILike, vec![json!("blue%")])];
        assert_eq!(store.row_ids("listings", &ilike).await.unwrap(), vec![1, 2]);

        let chairs = [DataFilter::new("title", SqliteConditionType::Like, vec![json!("%Chair")])];
        let first = store
            .get("listings", "title", RowSelector::Filtered(&chairs))
            .await
            .unwrap();
        assert_eq!(first, Some(json!("Blue Chair")));
    }

    #[tokio::test]
    async fn test_ilike_folds_non_ascii_case() {
        let store = listings().await;
        for title in ["École Chair", "école lamp", "Ecole desk"] {
            store
                .set("listings", WriteTarget::Insert, "title", json!(title))
                .await
                .unwrap();
        }

        let ilike = [DataFilter::new("title", SqliteConditionType::ILike, vec![json!("ÉCOLE%")])];
        assert_eq!(store.row_ids("listings", &ilike).await.unwrap(), vec![1, 2]);

        let not_ilike = [DataFilter::new("title", SqliteConditionType::NotILike, vec![json!("école%")])];
        assert_eq!(store.row_ids("listings", &not_ilike).await.unwrap(), vec![3]);

        let memory = crate::store::MemoryDataStore::new();
        memory
            .create_store("listings", &[ColumnDef::new("title", ColumnType::Text)])
            .await
            .unwrap();
        for title in ["École Chair", "école lamp", "Ecole desk"] {
            memory
                .set("listings", WriteTarget::Insert, "title", json!(title))
                .await
                .unwrap();
        }
        assert_eq!(memory.row_ids("listings", &ilike).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_row_untouched() {
        let store = listings().await;
        let id = store
            .set("listings", WriteTarget::Insert, "title", json!("Sofa"))
            .await
            .unwrap();

        let err = store
            .set_many(
                "listings",
                WriteTarget::Update(id),
                values(&[("title", Value::Null), ("price", json!(10))]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StoreWriteFailed);

        let price = store.get("listings", "price", RowSelector::Row(id)).await.unwrap();
        assert_eq!(price, Some(Value::Null));

        let err = store
            .set("listings", WriteTarget::Update(99), "title", json!("ghost"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("row 99 does not exist"));
    }

    #[tokio::test]
    async fn test_in_between_and_delete() {
        let store = listings().await;
        for (title, price) in [("a", 5), ("b", 15), ("c", 25)] {
            store
                .set_many(
                    "listings",
                    WriteTarget::Insert,
                    values(&[("title", json!(title)), ("price", json!(price))]),
                )
                .await
                .unwrap();
        }

        let between = [DataFilter::new(
            "price",
            SqliteConditionType::Between,
            vec![json!(10), json!("25")],
        )];
        assert_eq!(store.row_ids("listings", &between).await.unwrap(), vec![2, 3]);

        let in_set = [DataFilter::new("title", SqliteConditionType::In, vec![json!(["a", "c"])])];
        assert_eq!(store.delete("listings", &in_set).await.unwrap(), 2);
        assert_eq!(store.row_ids("listings", &[]).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_on_disk_store_and_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDataStore::open(dir.path().join("stores.db")).await.unwrap();

        let err = store
            .create_store("bad name", &[ColumnDef::new("x", ColumnType::Text)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StoreWriteFailed);

        let err = store.row_ids("missing", &[]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StoreReadFailed);
    }

    #[test]
    fn test_like_to_glob() {
        assert_eq!(like_to_glob("a%b_c"), "a*b?c");
        assert_eq!(like_to_glob("5*[x]?"), "5[*][[]x][?]");
    }
}
