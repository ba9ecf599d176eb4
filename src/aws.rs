use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use aws_sdk_dynamodb::{
    model::AttributeValue,
    model::AttributeValue::{Bool, N},
    Client as DynamoClient,
};
use log::info;

use crate::correlator::{NewReading, Reading};
use crate::storage::{newest_first, ReadingQuery, ReadingStore, StorageError};

/// DynamoDB-backed reading store. Table name comes from
/// `AWS_DYNAMO_TABLE_MEDICIONES`; items are keyed by the numeric `id`.
pub struct DynamoReadingStore {
    table: String,
    next_id: AtomicU64,
}

impl DynamoReadingStore {
    pub async fn from_env() -> Result<Self, StorageError> {
        let table = env::var("AWS_DYNAMO_TABLE_MEDICIONES").map_err(|_| {
            StorageError::Backend("AWS_DYNAMO_TABLE_MEDICIONES no definida".to_string())
        })?;
        let store = DynamoReadingStore {
            table,
            next_id: AtomicU64::new(0),
        };
        // seed the id counter from what the table already holds
        let last_id = store
            .scan_readings()
            .await?
            .iter()
            .map(|r| r.id)
            .max()
            .unwrap_or(0);
        store.next_id.store(last_id, Ordering::SeqCst);
        info!("dynamo listo: tabla {}, ultimo id {}", store.table, last_id);
        Ok(store)
    }

    async fn client() -> DynamoClient {
        let shared_config = aws_config::load_from_env().await;
        DynamoClient::new(&shared_config)
    }

    // one scan page is enough: a two-beam radar produces a handful of
    // readings per day, and filtering happens in-process either way
    async fn scan_readings(&self) -> Result<Vec<Reading>, StorageError> {
        let client = Self::client().await;
        let output = client
            .scan()
            .table_name(&self.table)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("error leyendo mediciones: {}", e)))?;
        let items = output.items().unwrap_or_default();
        Ok(items.iter().filter_map(reading_from_item).collect())
    }
}

#[async_trait]
impl ReadingStore for DynamoReadingStore {
    async fn save(&self, reading: NewReading) -> Result<Reading, StorageError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let reading = reading.into_reading(id);

        let client = Self::client().await;
        let mut req = client.put_item().table_name(&self.table);
        for (k, v) in reading.attributes() {
            req = req.item(k, v);
        }
        req.send()
            .await
            .map_err(|e| StorageError::Backend(format!("error guardando medicion {}: {}", id, e)))?;
        Ok(reading)
    }

    async fn list(&self, query: ReadingQuery) -> Result<Vec<Reading>, StorageError> {
        let mut matched: Vec<Reading> = self
            .scan_readings()
            .await?
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();
        matched.sort_by(newest_first);
        let page = matched.into_iter().skip(query.skip);
        Ok(match query.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        })
    }

    async fn get(&self, id: u64) -> Result<Option<Reading>, StorageError> {
        let client = Self::client().await;
        let output = client
            .get_item()
            .table_name(&self.table)
            .key("id", N(id.to_string()))
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("error leyendo medicion {}: {}", id, e)))?;
        Ok(output.item().and_then(reading_from_item))
    }
}

impl Reading {
    fn attributes(&self) -> HashMap<&str, AttributeValue> {
        HashMap::from([
            ("id", N(self.id.to_string())),
            ("timestamp", N(self.second_timestamp.to_string())),
            ("timestampInicial", N(self.first_timestamp.to_string())),
            ("velocidadMs", N(self.speed_mps.to_string())),
            ("velocidadKmh", N(self.speed_kmh.to_string())),
            ("distancia", N(self.distance_meters.to_string())),
            ("tiempoRecorrido", N(self.elapsed_seconds.to_string())),
            ("medicionCompleta", Bool(self.is_complete)),
        ])
    }
}

fn reading_from_item(item: &HashMap<String, AttributeValue>) -> Option<Reading> {
    Some(Reading {
        id: integer(item, "id")?,
        second_timestamp: number(item, "timestamp")?,
        first_timestamp: number(item, "timestampInicial")?,
        speed_mps: number(item, "velocidadMs")?,
        speed_kmh: number(item, "velocidadKmh")?,
        distance_meters: number(item, "distancia")?,
        elapsed_seconds: number(item, "tiempoRecorrido")?,
        is_complete: flag(item, "medicionCompleta")?,
    })
}

fn number(item: &HashMap<String, AttributeValue>, key: &str) -> Option<f64> {
    match item.get(key)? {
        N(raw) => raw.parse().ok(),
        _ => None,
    }
}

fn integer(item: &HashMap<String, AttributeValue>, key: &str) -> Option<u64> {
    match item.get(key)? {
        N(raw) => raw.parse().ok(),
        _ => None,
    }
}

fn flag(item: &HashMap<String, AttributeValue>, key: &str) -> Option<bool> {
    match item.get(key)? {
        Bool(b) => Some(*b),
        _ => None,
    }
}
