use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ScraperError, ScraperResult};
use crate::program::{Condition, ScraperValue};
use crate::store::{BoundRecord, DataStore, RowSelector};

pub mod condition;

pub use condition::compare;

/// Read access to elements on the open pages of a run
#[async_trait]
pub trait ElementReader: Send + Sync {
    /// Text content of the first match, waiting a bounded time for it to appear
    async fn read_text(&self, page_index: usize, selector: &str) -> ScraperResult<String>;

    /// `None` when the element exists but lacks the attribute
    async fn read_attribute(&self, page_index: usize, selector: &str, attribute: &str) -> ScraperResult<Option<String>>;
}

/// Everything a value may be resolved against
pub struct ResolveContext<'a> {
    pub store: &'a dyn DataStore,
    pub pages: &'a dyn ElementReader,
    pub record: Option<&'a BoundRecord>,
}

impl<'a> ResolveContext<'a> {
    pub fn new(store: &'a dyn DataStore, pages: &'a dyn ElementReader, record: Option<&'a BoundRecord>) -> Self {
        Self { store, pages, record }
    }

    pub async fn resolve(&self, value: &ScraperValue) -> ScraperResult<Value> {
        match value {
            ScraperValue::Literal { value } => Ok(value.clone()),
            ScraperValue::Null => Ok(Value::Null),
            ScraperValue::CurrentTimestamp => Ok(Value::from(chrono::Utc::now().timestamp_millis())),
            ScraperValue::ExternalData {
                store,
                column,
                filters,
                default,
            } => {
                let selector = match self.record {
                    Some(bound) if filters.is_empty() && bound.store == *store => RowSelector::Row(bound.record.id),
                    _ => RowSelector::Filtered(filters),
                };

                match self.store.get(store, column, selector).await? {
                    Some(found) => Ok(found),
                    None => default.clone().ok_or_else(|| ScraperError::DataNotFound {
                        store: store.clone(),
                        column: column.clone(),
                    }),
                }
            }
            ScraperValue::ElementTextContent { selector, page_index } => {
                let text = self.pages.read_text(*page_index, selector).await?;
                Ok(Value::String(text))
            }
            ScraperValue::ElementAttribute {
                selector,
                attribute,
                page_index,
            } => {
                let attr = self.pages.read_attribute(*page_index, selector, attribute).await?;
                Ok(attr.map(Value::String).unwrap_or(Value::Null))
            }
        }
    }

    /// Resolves both sides of a condition and compares them
    pub async fn evaluate(&self, condition: &Condition) -> ScraperResult<bool> {
        let left = self.resolve(&condition.left).await?;

        let mut right = Vec::with_capacity(condition.right.len());
        for operand in &condition.right {
            right.push(self.resolve(operand).await?);
        }

        compare(condition.condition_type, &left, &right)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::program::{DataFilter, SqliteConditionType};
    use crate::store::{ColumnDef, ColumnType, MemoryDataStore, Record, WriteTarget};
    use serde_json::json;
    use std::collections::HashMap;

    /// Pages backed by a selector map
    pub(crate) struct StaticElements(pub HashMap<String, String>);

    #[async_trait]
    impl ElementReader for StaticElements {
        async fn read_text(&self, page_index: usize, selector: &str) -> ScraperResult<String> {
            self.0
                .get(selector)
                .cloned()
                .ok_or_else(|| ScraperError::ElementNotFound {
                    selector: selector.to_string(),
                    page_index,
                })
        }

        async fn read_attribute(&self, page_index: usize, selector: &str, _attribute: &str) -> ScraperResult<Option<String>> {
            self.read_text(page_index, selector).await.map(Some)
        }
    }

    async fn items_store() -> MemoryDataStore {
        let store = MemoryDataStore::new();
        store
            .create_store(
                "items",
                &[
                    ColumnDef::new("name", ColumnType::Text),
                    ColumnDef::new("price", ColumnType::Real),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_external_data_default_and_missing() {
        let store = items_store().await;
        let pages = StaticElements(HashMap::new());
        let ctx = ResolveContext::new(&store, &pages, None);

        let with_default = ScraperValue::ExternalData {
            store: "items".into(),
            column: "price".into(),
            filters: Vec::new(),
            default: Some(json!("n/a")),
        };
        assert_eq!(ctx.resolve(&with_default).await.unwrap(), json!("n/a"));

        let without_default = ScraperValue::external("items", "price");
        let err = ctx.resolve(&without_default).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DataNotFound);

        store
            .set("items", WriteTarget::Insert, "price", json!(9.5))
            .await
            .unwrap();
        assert_eq!(ctx.resolve(&with_default).await.unwrap(), json!(9.5));
    }

    #[tokio::test]
    async fn test_external_data_prefers_bound_record() {
        let store = items_store().await;
        let mut values = serde_json::Map::new();
        values.insert("name".into(), json!("first"));
        store.set_many("items", WriteTarget::Insert, values.clone()).await.unwrap();
        values.insert("name".into(), json!("second"));
        let second = store.set_many("items", WriteTarget::Insert, values.clone()).await.unwrap();

        let bound = BoundRecord {
            store: "items".into(),
            record: Record { id: second, values },
        };
        let pages = StaticElements(HashMap::new());
        let ctx = ResolveContext::new(&store, &pages, Some(&bound));

        let name = ScraperValue::external("items", "name");
        assert_eq!(ctx.resolve(&name).await.unwrap(), json!("second"));

        let filtered = ScraperValue::ExternalData {
            store: "items".into(),
            column: "name".into(),
            filters: vec![DataFilter::new("name", SqliteConditionType::Like, vec![json!("f%")])],
            default: None,
        };
        assert_eq!(ctx.resolve(&filtered).await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_evaluate_condition_against_page() {
        let store = MemoryDataStore::new();
        let pages = StaticElements(HashMap::from([("h1".to_string(), "OK".to_string())]));
        let ctx = ResolveContext::new(&store, &pages, None);

        let condition = Condition::new(
            ScraperValue::text_of("h1"),
            SqliteConditionType::Equals,
            vec![ScraperValue::literal("OK")],
        );
        assert!(ctx.evaluate(&condition).await.unwrap());

        let missing = Condition::new(
            ScraperValue::text_of("h2"),
            SqliteConditionType::IsNull,
            Vec::new(),
        );
        let err = ctx.evaluate(&missing).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ElementNotFound);
    }
}
