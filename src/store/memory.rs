use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use super::{ColumnDef, DataStore, Record, RowSelector, WriteTarget};
use crate::error::{ScraperError, ScraperResult};
use crate::program::DataFilter;
use crate::values::compare;

#[derive(Debug, Default)]
struct Table {
    columns: Vec<ColumnDef>,
    rows: BTreeMap<i64, Map<String, Value>>,
    next_id: i64,
}

impl Table {
    fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn matches(&self, row: &Map<String, Value>, filters: &[DataFilter]) -> ScraperResult<bool> {
        for filter in filters {
            if self.column(&filter.column).is_none() {
                return Err(ScraperError::invalid_condition(format!("unknown column '{}'", filter.column)));
            }
            let value = row.get(&filter.column).unwrap_or(&Value::Null);
            if !compare(filter.condition_type, value, &filter.values)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn matching_ids(&self, filters: &[DataFilter]) -> ScraperResult<Vec<i64>> {
        let mut ids = Vec::new();
        for (id, row) in &self.rows {
            if self.matches(row, filters)? {
                ids.push(*id);
            }
        }
        Ok(ids)
    }
}

/// In-process data store with the same semantics as the SQLite store
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(store: &str) -> String {
    format!("store '{}' does not exist", store)
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn create_store(&self, name: &str, columns: &[ColumnDef]) -> ScraperResult<()> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(name) {
            return Err(ScraperError::write_failed(name, "store already exists"));
        }
        tables.insert(
            name.to_string(),
            Table {
                columns: columns.to_vec(),
                rows: BTreeMap::new(),
                next_id: 1,
            },
        );
        debug!("Created in-memory store {}", name);
        Ok(())
    }

    async fn columns(&self, store: &str) -> ScraperResult<Vec<ColumnDef>> {
        let tables = self.tables.read().await;
        tables
            .get(store)
            .map(|t| t.columns.clone())
            .ok_or_else(|| ScraperError::read_failed(store, missing(store)))
    }

    async fn get(&self, store: &str, column: &str, selector: RowSelector<'_>) -> ScraperResult<Option<Value>> {
        let tables = self.tables.read().await;
        let table = tables
            .get(store)
            .ok_or_else(|| ScraperError::read_failed(store, missing(store)))?;

        if table.column(column).is_none() {
            return Err(ScraperError::read_failed(store, format!("unknown column '{}'", column)));
        }

        let row = match selector {
            RowSelector::Row(id) => table.rows.get(&id),
            RowSelector::Filtered(filters) => {
                let first = table
                    .matching_ids(filters)
                    .map_err(|e| ScraperError::read_failed(store, e))?
                    .into_iter()
                    .next();
                first.and_then(|id| table.rows.get(&id))
            }
        };

        Ok(row.map(|r| r.get(column).cloned().unwrap_or(Value::Null)))
    }

    async fn set_many(&self, store: &str, target: WriteTarget, values: Map<String, Value>) -> ScraperResult<i64> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(store)
            .ok_or_else(|| ScraperError::write_failed(store, missing(store)))?;

        // Validate everything before touching the row so the batch is all-or-nothing
        let mut coerced = Map::new();
        for (column, value) in values {
            let def = table
                .column(&column)
                .ok_or_else(|| ScraperError::write_failed(store, format!("unknown column '{}'", column)))?;
            let value = def
                .column_type
                .coerce(&value)
                .map_err(|e| ScraperError::write_failed(store, format!("{}: {}", column, e)))?;
            if value.is_null() && !def.nullable {
                return Err(ScraperError::write_failed(store, format!("{} cannot be NULL", column)));
            }
            coerced.insert(column, value);
        }

        match target {
            WriteTarget::Insert => {
                for def in table.columns.iter().filter(|c| !c.nullable) {
                    if !coerced.contains_key(&def.name) {
                        return Err(ScraperError::write_failed(store, format!("{} cannot be NULL", def.name)));
                    }
                }
                let id = table.next_id;
                table.next_id += 1;
                table.rows.insert(id, coerced);
                Ok(id)
            }
            WriteTarget::Update(id) => {
                let row = table
                    .rows
                    .get_mut(&id)
                    .ok_or_else(|| ScraperError::write_failed(store, format!("row {} does not exist", id)))?;
                row.extend(coerced);
                Ok(id)
            }
        }
    }

    async fn delete(&self, store: &str, filters: &[DataFilter]) -> ScraperResult<usize> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(store)
            .ok_or_else(|| ScraperError::write_failed(store, missing(store)))?;

        let ids = table
            .matching_ids(filters)
            .map_err(|e| ScraperError::write_failed(store, e))?;
        for id in &ids {
            table.rows.remove(id);
        }
        Ok(ids.len())
    }

    async fn delete_row(&self, store: &str, id: i64) -> ScraperResult<bool> {
        let mut tables = self.tables.write().await;
        let table = tables
            .get_mut(store)
            .ok_or_else(|| ScraperError::write_failed(store, missing(store)))?;
        Ok(table.rows.remove(&id).is_some())
    }

    async fn row_ids(&self, store: &str, filters: &[DataFilter]) -> ScraperResult<Vec<i64>> {
        let tables = self.tables.read().await;
        let table = tables
            .get(store)
            .ok_or_else(|| ScraperError::read_failed(store, missing(store)))?;
        table
            .matching_ids(filters)
            .map_err(|e| ScraperError::read_failed(store, e))
    }

    async fn row(&self, store: &str, id: i64) -> ScraperResult<Option<Record>> {
        let tables = self.tables.read().await;
        let table = tables
            .get(store)
            .ok_or_else(|| ScraperError::read_failed(store, missing(store)))?;

        Ok(table.rows.get(&id).map(|values| {
            let mut full = Map::new();
            for def in &table.columns {
                full.insert(def.name.clone(), values.get(&def.name).cloned().unwrap_or(Value::Null));
            }
            Record { id, values: full }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::SqliteConditionType;
    use crate::store::ColumnType;
    use serde_json::json;

    async fn products() -> MemoryDataStore {
        let store = MemoryDataStore::new();
        store
            .create_store(
                "products",
                &[
                    ColumnDef::new("title", ColumnType::Text).required(),
                    ColumnDef::new("price", ColumnType::Integer),
                ],
            )
            .await
            .unwrap();
        store
    }

    fn row(title: &str, price: i64) -> Map<String, Value> {
        let mut values = Map::new();
        values.insert("title".into(), json!(title));
        values.insert("price".into(), json!(price));
        values
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = products().await;
        let id = store.set_many("products", WriteTarget::Insert, row("lamp", 10)).await.unwrap();

        let mut bad = Map::new();
        bad.insert("title".into(), json!("renamed"));
        bad.insert("price".into(), json!("not a number"));
        let err = store.set_many("products", WriteTarget::Update(id), bad).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StoreWriteFailed);

        let record = store.row("products", id).await.unwrap().unwrap();
        assert_eq!(record.values["title"], json!("lamp"));
    }

    #[tokio::test]
    async fn test_required_column_enforced() {
        let store = products().await;
        let err = store
            .set("products", WriteTarget::Insert, "price", json!(3))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("title cannot be NULL"));
    }

    #[tokio::test]
    async fn test_filtered_ids_and_delete() {
        let store = products().await;
        for (title, price) in [("a", 5), ("b", 15), ("c", 25)] {
            store.set_many("products", WriteTarget::Insert, row(title, price)).await.unwrap();
        }

        let cheap = [DataFilter::new("price", SqliteConditionType::LessThan, vec![json!(20)])];
        assert_eq!(store.row_ids("products", &cheap).await.unwrap(), vec![1, 2]);

        assert_eq!(store.delete("products", &cheap).await.unwrap(), 2);
        assert_eq!(store.row_ids("products", &[]).await.unwrap(), vec![3]);
        assert!(!store.delete_row("products", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_store() {
        let store = MemoryDataStore::new();
        let err = store.row_ids("nope", &[]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StoreReadFailed);
    }
}
