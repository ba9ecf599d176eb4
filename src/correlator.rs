use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::SettingsCache;
use crate::constants::{MPS_TO_KMH, STORAGE_SAVE_TIMEOUT_MS};
use crate::storage::{ReadingStore, StorageError};

pub type EpochSeconds = f64; // unix timestamp, sub-second precision

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorSource {
    #[serde(rename = "detector1")]
    Detector1,
    #[serde(rename = "detector2")]
    Detector2,
}

/// A single sensor firing, either device-stamped or stamped on arrival.
#[derive(Debug, Clone, Copy)]
pub struct DetectionEvent {
    pub timestamp: EpochSeconds,
    pub source_hint: Option<SensorSource>,
}

impl DetectionEvent {
    pub fn at(timestamp: EpochSeconds, source_hint: Option<SensorSource>) -> Self {
        DetectionEvent {
            timestamp,
            source_hint,
        }
    }

    /// Event stamped with the server clock, for boards that send no timestamp.
    pub fn now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("bad time")
            .as_secs_f64();
        DetectionEvent::at(timestamp, None)
    }
}

// The unmatched first detection. Lives only inside the correlator's slot,
// never persisted. `registered_at` is arrival wall-clock, not the event
// timestamp: expiry must work even when boards send skewed clocks.
#[derive(Debug)]
struct PendingMeasurement {
    first_timestamp: EpochSeconds,
    source_hint: Option<SensorSource>,
    registered_at: Instant,
}

/// A completed measurement, as persisted and as serialized to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: u64,
    #[serde(rename = "timestamp")]
    pub second_timestamp: EpochSeconds,
    #[serde(rename = "timestamp_inicial")]
    pub first_timestamp: EpochSeconds,
    #[serde(rename = "velocidad_ms")]
    pub speed_mps: f64,
    #[serde(rename = "velocidad_kmh")]
    pub speed_kmh: f64,
    #[serde(rename = "distancia")]
    pub distance_meters: f64,
    #[serde(rename = "tiempo_recorrido")]
    pub elapsed_seconds: f64,
    #[serde(rename = "medicion_completa")]
    pub is_complete: bool,
}

/// A reading the store has not assigned an id to yet. All derived fields are
/// final before this value leaves the correlator's critical section.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub first_timestamp: EpochSeconds,
    pub second_timestamp: EpochSeconds,
    pub elapsed_seconds: f64,
    pub distance_meters: f64,
    pub speed_mps: f64,
    pub speed_kmh: f64,
}

impl NewReading {
    pub fn into_reading(self, id: u64) -> Reading {
        Reading {
            id,
            second_timestamp: self.second_timestamp,
            first_timestamp: self.first_timestamp,
            speed_mps: self.speed_mps,
            speed_kmh: self.speed_kmh,
            distance_meters: self.distance_meters,
            elapsed_seconds: self.elapsed_seconds,
            is_complete: true,
        }
    }
}

#[derive(Debug)]
pub enum RegisterOutcome {
    /// First beam registered, the slot is now occupied.
    AwaitingSecond { first_timestamp: EpochSeconds },
    /// Second beam arrived, the pair was completed and persisted.
    Completed(Reading),
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(
        "intervalo invalido: la segunda deteccion ({second}) no es posterior a la primera ({first})"
    )]
    InvalidInterval {
        first: EpochSeconds,
        second: EpochSeconds,
    },
    #[error("no se pudo guardar la medicion: {0}")]
    Storage(#[from] StorageError),
}

/// Pairs detection events into speed readings.
///
/// The pending slot is the only shared mutable state in the core. One mutex
/// guards the whole check-then-act sequence, including the save: two
/// near-simultaneous detections must serialize, or both would observe an
/// empty slot and a measurement would be silently lost.
pub struct Correlator {
    pending: Mutex<Option<PendingMeasurement>>,
    store: Arc<dyn ReadingStore>,
    settings: Arc<SettingsCache>,
}

impl Correlator {
    pub fn new(store: Arc<dyn ReadingStore>, settings: Arc<SettingsCache>) -> Self {
        Correlator {
            pending: Mutex::new(None),
            store,
            settings,
        }
    }

    pub async fn register_detection(
        &self,
        event: DetectionEvent,
    ) -> Result<RegisterOutcome, RegisterError> {
        let mut slot = self.pending.lock().await;

        // A first detection whose partner never arrived (sensor fault,
        // vehicle turned back) must not block the radar forever.
        if let Some(pending) = slot.as_ref() {
            let age = pending.registered_at.elapsed();
            let max_age = Duration::from_secs_f64(self.settings.pending_timeout());
            if age > max_age {
                warn!(
                    "deteccion pendiente ({:.3}) abandonada tras {:.1}s sin pareja",
                    pending.first_timestamp,
                    age.as_secs_f64()
                );
                *slot = None;
            }
        }

        let first = match slot.take() {
            None => {
                *slot = Some(PendingMeasurement {
                    first_timestamp: event.timestamp,
                    source_hint: event.source_hint,
                    registered_at: Instant::now(),
                });
                info!(
                    "primera deteccion en {:.3}, esperando segundo sensor",
                    event.timestamp
                );
                return Ok(RegisterOutcome::AwaitingSecond {
                    first_timestamp: event.timestamp,
                });
            }
            Some(pending) => pending,
        };

        // Slot is already cleared here: a corrupted pair (clock skew,
        // duplicate event) must not wedge the machine, and a retry after a
        // storage failure must start a fresh pair instead of double-pairing.
        let elapsed = event.timestamp - first.first_timestamp;
        if elapsed <= 0.0 {
            // the source hints say which detector's clock to distrust
            warn!(
                "intervalo invalido descartado: primera {:.3} ({:?}), segunda {:.3} ({:?})",
                first.first_timestamp, first.source_hint, event.timestamp, event.source_hint
            );
            return Err(RegisterError::InvalidInterval {
                first: first.first_timestamp,
                second: event.timestamp,
            });
        }

        // Distance is read now, at completion time. A configuration edit
        // between the two beams applies to this reading; past readings keep
        // the value they were computed with.
        let distance_meters = self.settings.sensor_distance();
        let speed_mps = distance_meters / elapsed;
        let reading = NewReading {
            first_timestamp: first.first_timestamp,
            second_timestamp: event.timestamp,
            elapsed_seconds: elapsed,
            distance_meters,
            speed_mps,
            speed_kmh: speed_mps * MPS_TO_KMH,
        };

        let save = timeout(
            Duration::from_millis(STORAGE_SAVE_TIMEOUT_MS),
            self.store.save(reading),
        );
        let saved = match save.await {
            Ok(result) => result?,
            Err(_) => return Err(RegisterError::Storage(StorageError::Timeout)),
        };
        info!(
            "medicion {} completada: {:.2} km/h en {:.3}s",
            saved.id, saved.speed_kmh, saved.elapsed_seconds
        );
        Ok(RegisterOutcome::Completed(saved))
    }

    /// First timestamp of the pending measurement, if one exists. Read-only.
    pub async fn pending_status(&self) -> Option<EpochSeconds> {
        self.pending
            .lock()
            .await
            .as_ref()
            .map(|p| p.first_timestamp)
    }

    /// Operator recovery: drop the pending measurement unconditionally.
    /// Returns whether there was one to drop. Idempotent.
    pub async fn reset_pending(&self) -> bool {
        self.pending.lock().await.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigEntry, MemoryConfigStore, KEY_DISTANCIA_SENSORES, KEY_TIMEOUT_PENDIENTE};
    use crate::storage::{MemoryReadingStore, MockReadingStore, ReadingQuery};

    fn settings_with(config: Arc<MemoryConfigStore>) -> Arc<SettingsCache> {
        Arc::new(SettingsCache::new(config))
    }

    fn correlator() -> (Arc<MemoryReadingStore>, Correlator) {
        let store = Arc::new(MemoryReadingStore::new());
        let settings = settings_with(Arc::new(MemoryConfigStore::with_defaults()));
        let correlator = Correlator::new(store.clone(), settings);
        (store, correlator)
    }

    fn set_config(config: &MemoryConfigStore, clave: &str, valor: &str) {
        config
            .put_entry(ConfigEntry {
                clave: clave.to_string(),
                valor: valor.to_string(),
                descripcion: None,
            });
    }

    #[tokio::test]
    async fn first_detection_occupies_the_slot() {
        let (store, correlator) = correlator();

        let outcome = correlator
            .register_detection(DetectionEvent::at(1_000.0, None))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            RegisterOutcome::AwaitingSecond { first_timestamp } if first_timestamp == 1_000.0
        ));
        assert_eq!(correlator.pending_status().await, Some(1_000.0));
        assert!(store.list(ReadingQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pairing_computes_speed_from_distance_and_elapsed() {
        let (store, correlator) = correlator();

        correlator
            .register_detection(DetectionEvent::at(1_000.0, None))
            .await
            .unwrap();
        let outcome = correlator
            .register_detection(DetectionEvent::at(1_007.2, None))
            .await
            .unwrap();

        let reading = match outcome {
            RegisterOutcome::Completed(r) => r,
            other => panic!("expected completed reading, got {:?}", other),
        };
        // default distance 100 m over 7.2 s is exactly 50 km/h
        assert!((reading.elapsed_seconds - 7.2).abs() < 1e-9);
        assert!((reading.speed_mps - 100.0 / 7.2).abs() < 1e-9);
        assert!((reading.speed_kmh - 50.0).abs() < 1e-9);
        assert_eq!(reading.distance_meters, 100.0);
        assert!(reading.is_complete);
        assert_eq!(correlator.pending_status().await, None);
        assert_eq!(store.list(ReadingQuery::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn equal_timestamps_are_an_invalid_interval_and_clear_the_slot() {
        let (store, correlator) = correlator();

        correlator
            .register_detection(DetectionEvent::at(500.0, None))
            .await
            .unwrap();
        let err = correlator
            .register_detection(DetectionEvent::at(500.0, None))
            .await
            .unwrap_err();

        assert!(matches!(err, RegisterError::InvalidInterval { .. }));
        assert_eq!(correlator.pending_status().await, None);
        assert!(store.list(ReadingQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_second_detection_is_rejected() {
        let (_, correlator) = correlator();

        correlator
            .register_detection(DetectionEvent::at(500.0, None))
            .await
            .unwrap();
        let err = correlator
            .register_detection(DetectionEvent::at(490.0, None))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RegisterError::InvalidInterval { first, second } if first == 500.0 && second == 490.0
        ));
        // the next detection starts a fresh pair
        let outcome = correlator
            .register_detection(DetectionEvent::at(600.0, None))
            .await
            .unwrap();
        assert!(matches!(outcome, RegisterOutcome::AwaitingSecond { .. }));
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let (_, correlator) = correlator();

        correlator
            .register_detection(DetectionEvent::at(1.0, None))
            .await
            .unwrap();

        assert!(correlator.reset_pending().await);
        assert_eq!(correlator.pending_status().await, None);
        assert!(!correlator.reset_pending().await);
        assert_eq!(correlator.pending_status().await, None);
    }

    #[tokio::test]
    async fn distance_is_frozen_at_completion_time() {
        let config = Arc::new(MemoryConfigStore::with_defaults());
        let store = Arc::new(MemoryReadingStore::new());
        let correlator = Correlator::new(store.clone(), settings_with(config.clone()));

        correlator
            .register_detection(DetectionEvent::at(100.0, None))
            .await
            .unwrap();
        set_config(&config, KEY_DISTANCIA_SENSORES, "80");
        let outcome = correlator
            .register_detection(DetectionEvent::at(104.0, None))
            .await
            .unwrap();

        let reading = match outcome {
            RegisterOutcome::Completed(r) => r,
            other => panic!("expected completed reading, got {:?}", other),
        };
        assert_eq!(reading.distance_meters, 80.0);
        assert!((reading.speed_mps - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn expired_pending_detection_is_abandoned() {
        let config = Arc::new(MemoryConfigStore::with_defaults());
        set_config(&config, KEY_TIMEOUT_PENDIENTE, "0.05");
        let store = Arc::new(MemoryReadingStore::new());
        let correlator = Correlator::new(store.clone(), settings_with(config));

        correlator
            .register_detection(DetectionEvent::at(100.0, None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // would have completed a pair; instead the stale first is dropped
        let outcome = correlator
            .register_detection(DetectionEvent::at(104.0, None))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RegisterOutcome::AwaitingSecond { first_timestamp } if first_timestamp == 104.0
        ));
        assert!(store.list(ReadingQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_clears_the_slot_for_a_clean_retry() {
        let mut store = MockReadingStore::new();
        store
            .expect_save()
            .times(1)
            .returning(|_| Err(StorageError::Backend("dynamo caido".to_string())));
        let correlator = Correlator::new(
            Arc::new(store),
            settings_with(Arc::new(MemoryConfigStore::with_defaults())),
        );

        correlator
            .register_detection(DetectionEvent::at(10.0, None))
            .await
            .unwrap();
        let err = correlator
            .register_detection(DetectionEvent::at(12.0, None))
            .await
            .unwrap_err();

        assert!(matches!(err, RegisterError::Storage(_)));
        // firmware retries become a fresh first detection, never a double pair
        assert_eq!(correlator.pending_status().await, None);
        let outcome = correlator
            .register_detection(DetectionEvent::at(14.0, None))
            .await
            .unwrap();
        assert!(matches!(outcome, RegisterOutcome::AwaitingSecond { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_detections_never_lose_events() {
        let store = Arc::new(MemoryReadingStore::new());
        let correlator = Arc::new(Correlator::new(
            store.clone(),
            settings_with(Arc::new(MemoryConfigStore::with_defaults())),
        ));

        let mut tasks = Vec::new();
        for i in 0..20u32 {
            let correlator = correlator.clone();
            tasks.push(tokio::spawn(async move {
                correlator
                    .register_detection(DetectionEvent::at(1_000.0 + f64::from(i), None))
                    .await
            }));
        }

        let mut esperando: i64 = 0;
        let mut completas: i64 = 0;
        let mut invalidas: i64 = 0;
        for task in tasks {
            match task.await.expect("task panicked") {
                Ok(RegisterOutcome::AwaitingSecond { .. }) => esperando += 1,
                Ok(RegisterOutcome::Completed(_)) => completas += 1,
                Err(RegisterError::InvalidInterval { .. }) => invalidas += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        // every detection either occupied the slot, completed a pair, or was
        // rejected for ordering; a naive read-then-write slot would break the
        // balance below by overwriting a pending first
        let pendiente: i64 = i64::from(correlator.pending_status().await.is_some());
        assert_eq!(esperando + completas + invalidas, 20);
        assert_eq!(esperando - completas - invalidas, pendiente);
        assert_eq!(
            store.list(ReadingQuery::default()).await.unwrap().len() as i64,
            completas
        );
    }

    #[tokio::test]
    async fn sequential_pairs_yield_one_reading_each() {
        let (store, correlator) = correlator();

        for pair in 0..5u32 {
            let base = 1_000.0 + f64::from(pair) * 100.0;
            correlator
                .register_detection(DetectionEvent::at(base, None))
                .await
                .unwrap();
            correlator
                .register_detection(DetectionEvent::at(base + 2.5, None))
                .await
                .unwrap();
        }

        assert_eq!(store.list(ReadingQuery::default()).await.unwrap().len(), 5);
        assert_eq!(correlator.pending_status().await, None);
    }
}
