use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::correlator::{EpochSeconds, NewReading, Reading};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("almacenamiento: {0}")]
    Backend(String),
    #[error("el almacenamiento no respondio a tiempo")]
    Timeout,
}

/// Filter and paging for reading queries. Timestamp bounds apply to the
/// second (completion) timestamp; `hasta` is exclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadingQuery {
    pub skip: usize,
    pub limit: Option<usize>,
    pub solo_completas: bool,
    pub desde: Option<EpochSeconds>,
    pub hasta: Option<EpochSeconds>,
}

impl ReadingQuery {
    pub fn completed() -> Self {
        ReadingQuery {
            solo_completas: true,
            ..ReadingQuery::default()
        }
    }

    pub fn matches(&self, reading: &Reading) -> bool {
        if self.solo_completas && !reading.is_complete {
            return false;
        }
        if let Some(desde) = self.desde {
            if reading.second_timestamp < desde {
                return false;
            }
        }
        if let Some(hasta) = self.hasta {
            if reading.second_timestamp >= hasta {
                return false;
            }
        }
        true
    }
}

/// Newest-first by completion timestamp, id as tie-breaker.
pub fn newest_first(a: &Reading, b: &Reading) -> CmpOrdering {
    b.second_timestamp
        .partial_cmp(&a.second_timestamp)
        .unwrap_or(CmpOrdering::Equal)
        .then(b.id.cmp(&a.id))
}

/// The persistence collaborator. The store owns id assignment: `save` takes
/// an id-less reading and returns the persisted record.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn save(&self, reading: NewReading) -> Result<Reading, StorageError>;
    async fn list(&self, query: ReadingQuery) -> Result<Vec<Reading>, StorageError>;
    async fn get(&self, id: u64) -> Result<Option<Reading>, StorageError>;
}

/// In-process store for tests and single-board deployments without AWS.
pub struct MemoryReadingStore {
    readings: Mutex<Vec<Reading>>,
    next_id: AtomicU64,
}

impl MemoryReadingStore {
    pub fn new() -> Self {
        MemoryReadingStore {
            readings: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryReadingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingStore for MemoryReadingStore {
    async fn save(&self, reading: NewReading) -> Result<Reading, StorageError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let reading = reading.into_reading(id);
        self.readings.lock().unwrap().push(reading.clone());
        Ok(reading)
    }

    async fn list(&self, query: ReadingQuery) -> Result<Vec<Reading>, StorageError> {
        let mut matched: Vec<Reading> = self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matched.sort_by(newest_first);
        let page = matched.into_iter().skip(query.skip);
        Ok(match query.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        })
    }

    async fn get(&self, id: u64) -> Result<Option<Reading>, StorageError> {
        Ok(self
            .readings
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading_at(second_timestamp: f64) -> NewReading {
        let elapsed = 2.0;
        NewReading {
            first_timestamp: second_timestamp - elapsed,
            second_timestamp,
            elapsed_seconds: elapsed,
            distance_meters: 100.0,
            speed_mps: 50.0,
            speed_kmh: 180.0,
        }
    }

    #[tokio::test]
    async fn save_assigns_monotonic_ids() {
        let store = MemoryReadingStore::new();
        let a = store.save(reading_at(10.0)).await.unwrap();
        let b = store.save(reading_at(20.0)).await.unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(store.get(2).await.unwrap().unwrap().second_timestamp, 20.0);
        assert_eq!(store.get(99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_pages() {
        let store = MemoryReadingStore::new();
        for ts in [10.0, 30.0, 20.0] {
            store.save(reading_at(ts)).await.unwrap();
        }

        let all = store.list(ReadingQuery::default()).await.unwrap();
        let timestamps: Vec<f64> = all.iter().map(|r| r.second_timestamp).collect();
        assert_eq!(timestamps, vec![30.0, 20.0, 10.0]);

        let page = store
            .list(ReadingQuery {
                skip: 1,
                limit: Some(1),
                ..ReadingQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].second_timestamp, 20.0);
    }

    #[tokio::test]
    async fn list_applies_timestamp_bounds() {
        let store = MemoryReadingStore::new();
        for ts in [10.0, 20.0, 30.0] {
            store.save(reading_at(ts)).await.unwrap();
        }

        let bounded = store
            .list(ReadingQuery {
                desde: Some(15.0),
                hasta: Some(30.0),
                ..ReadingQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].second_timestamp, 20.0);
    }

    #[test]
    fn sub_second_elapsed_survives_the_reading() {
        let reading = reading_at(10.123_456).into_reading(1);
        assert!((reading.second_timestamp - 10.123_456).abs() < 1e-9);
    }
}
