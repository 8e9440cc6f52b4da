use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{ScraperError, ScraperResult};
use crate::program::DataFilter;
use crate::store::{BoundRecord, DataStore};

/// How many times a program runs, and against what
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionIteratorConfig {
    /// `start`, `start + step`, ... while short of `end`
    Range { start: i64, end: i64, step: i64 },
    /// One iteration per row of `store`
    EntireSet { store: String },
    /// One iteration per row of `store` matching every filter
    FilteredSet {
        store: String,
        #[serde(default)]
        filters: Vec<DataFilter>,
    },
}

impl ExecutionIteratorConfig {
    pub fn validate(&self) -> ScraperResult<()> {
        match self {
            Self::Range { step: 0, .. } => Err(ScraperError::InvalidIterator {
                reason: "range step must not be zero".to_string(),
            }),
            Self::EntireSet { store } | Self::FilteredSet { store, .. }
                if !crate::program::validator::is_identifier(store) =>
            {
                Err(ScraperError::InvalidIterator {
                    reason: format!("'{}' is not a valid store name", store),
                })
            }
            _ => Ok(()),
        }
    }
}

/// `ceil((end - start) / step)`, zero when the step points away from `end`
pub fn range_len(start: i64, end: i64, step: i64) -> usize {
    if step == 0 {
        return 0;
    }
    let span = end as i128 - start as i128;
    let step = step as i128;
    if span == 0 || span.signum() != step.signum() {
        return 0;
    }
    let (span, step) = (span.abs(), step.abs());
    ((span + step - 1) / step) as usize
}

/// Binding under which one pass of the program executes
#[derive(Debug, Clone, PartialEq)]
pub struct IterationContext {
    pub index: usize,
    /// Current value of a `Range`
    pub value: Option<i64>,
    pub record: Option<BoundRecord>,
}

impl IterationContext {
    pub fn standalone() -> Self {
        Self {
            index: 0,
            value: None,
            record: None,
        }
    }
}

enum Source {
    Once { done: bool },
    Range { start: i64, step: i64, len: usize },
    Set { store: String, ids: VecDeque<i64> },
}

/// Lazily yields iteration contexts
///
/// Set iterators capture the matching row ids when created, in primary-key
/// order, and load each row only when it is reached; rows deleted in the
/// meantime are skipped. Not restartable: create a new one to re-derive.
pub struct ExecutionIterator {
    source: Source,
    next_index: usize,
}

impl ExecutionIterator {
    pub async fn new(config: Option<&ExecutionIteratorConfig>, store: &dyn DataStore) -> ScraperResult<Self> {
        let source = match config {
            None => Source::Once { done: false },
            Some(config) => {
                config.validate()?;
                match config {
                    ExecutionIteratorConfig::Range { start, end, step } => Source::Range {
                        start: *start,
                        step: *step,
                        len: range_len(*start, *end, *step),
                    },
                    ExecutionIteratorConfig::EntireSet { store: name } => Source::Set {
                        ids: store.row_ids(name, &[]).await?.into(),
                        store: name.clone(),
                    },
                    ExecutionIteratorConfig::FilteredSet { store: name, filters } => Source::Set {
                        ids: store.row_ids(name, filters).await?.into(),
                        store: name.clone(),
                    },
                }
            }
        };

        Ok(Self { source, next_index: 0 })
    }

    pub async fn next(&mut self, store: &dyn DataStore) -> Option<ScraperResult<IterationContext>> {
        let index = self.next_index;
        let context = match &mut self.source {
            Source::Once { done } => {
                if *done {
                    return None;
                }
                *done = true;
                IterationContext::standalone()
            }
            Source::Range { start, step, len } => {
                if index >= *len {
                    return None;
                }
                IterationContext {
                    index,
                    value: Some((*start as i128 + *step as i128 * index as i128) as i64),
                    record: None,
                }
            }
            Source::Set { store: name, ids } => loop {
                let id = ids.pop_front()?;
                match store.row(name, id).await {
                    Ok(Some(record)) => {
                        break IterationContext {
                            index,
                            value: None,
                            record: Some(BoundRecord {
                                store: name.clone(),
                                record,
                            }),
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                }
            },
        };

        self.next_index += 1;
        Some(Ok(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::SqliteConditionType;
    use crate::store::{ColumnDef, ColumnType, MemoryDataStore, WriteTarget};
    use serde_json::json;

    async fn collect(config: Option<&ExecutionIteratorConfig>, store: &MemoryDataStore) -> Vec<IterationContext> {
        let mut iterator = ExecutionIterator::new(config, store).await.unwrap();
        let mut contexts = Vec::new();
        while let Some(context) = iterator.next(store).await {
            contexts.push(context.unwrap());
        }
        contexts
    }

    #[test]
    fn test_range_len() {
        assert_eq!(range_len(0, 3, 1), 3);
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(5, 5, 1), 0);
        assert_eq!(range_len(0, 3, -1), 0);
        assert_eq!(range_len(3, 0, -2), 2);
        assert_eq!(range_len(i64::MIN, i64::MAX, i64::MAX), 3);
    }

    #[tokio::test]
    async fn test_range_and_standalone() {
        let store = MemoryDataStore::new();

        let range = ExecutionIteratorConfig::Range { start: 0, end: 3, step: 1 };
        let values: Vec<_> = collect(Some(&range), &store).await.iter().map(|c| c.value).collect();
        assert_eq!(values, vec![Some(0), Some(1), Some(2)]);

        let once = collect(None, &store).await;
        assert_eq!(once, vec![IterationContext::standalone()]);

        let zero = ExecutionIteratorConfig::Range { start: 0, end: 3, step: 0 };
        let err = ExecutionIterator::new(Some(&zero), &store).await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidIterator);
    }

    #[tokio::test]
    async fn test_sets_are_stable_and_skip_deleted_rows() {
        let store = MemoryDataStore::new();
        store
            .create_store("urls", &[ColumnDef::new("done", ColumnType::Boolean)])
            .await
            .unwrap();
        for done in [false, true, false, false] {
            store.set("urls", WriteTarget::Insert, "done", json!(done)).await.unwrap();
        }

        let all = ExecutionIteratorConfig::EntireSet { store: "urls".into() };
        let first = collect(Some(&all), &store).await;
        let second = collect(Some(&all), &store).await;
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
        let ids: Vec<i64> = first.iter().map(|c| c.record.as_ref().unwrap().record.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids, sorted);

        let pending = ExecutionIteratorConfig::FilteredSet {
            store: "urls".into(),
            filters: vec![DataFilter::new("done", SqliteConditionType::Equals, vec![json!(false)])],
        };
        let mut iterator = ExecutionIterator::new(Some(&pending), &store).await.unwrap();

        let first = iterator.next(&store).await.unwrap().unwrap();
        let doomed = ids[2];
        store.delete_row("urls", doomed).await.unwrap();

        let mut rest = Vec::new();
        while let Some(context) = iterator.next(&store).await {
            rest.push(context.unwrap());
        }
        assert_eq!(first.index, 0);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].index, 1);
        assert_eq!(rest[0].record.as_ref().unwrap().record.id, ids[3]);
    }
}
