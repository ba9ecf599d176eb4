use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::warn;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{self, CacheError};
use crate::constants::{
    DEFAULT_DISTANCIA_SENSORES, DEFAULT_LIMITE_VELOCIDAD, DEFAULT_TIMEOUT_PENDIENTE,
};

pub const KEY_DISTANCIA_SENSORES: &str = "distancia_sensores";
pub const KEY_LIMITE_VELOCIDAD: &str = "limite_velocidad";
pub const KEY_TIMEOUT_PENDIENTE: &str = "timeout_pendiente";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("entrada de configuracion corrupta para '{clave}': {message}")]
    Corrupt { clave: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub clave: String,
    pub valor: String,
    pub descripcion: Option<String>,
}

lazy_static! {
    static ref SEEDED: Vec<ConfigEntry> = vec![
        ConfigEntry {
            clave: KEY_DISTANCIA_SENSORES.to_string(),
            valor: "100".to_string(),
            descripcion: Some("Distancia en metros entre los dos sensores".to_string()),
        },
        ConfigEntry {
            clave: KEY_LIMITE_VELOCIDAD.to_string(),
            valor: "50".to_string(),
            descripcion: Some("Limite de velocidad en km/h".to_string()),
        },
        ConfigEntry {
            clave: KEY_TIMEOUT_PENDIENTE.to_string(),
            valor: "45".to_string(),
            descripcion: Some(
                "Segundos antes de descartar una deteccion sin pareja".to_string()
            ),
        },
    ];
}

/// The configuration collaborator: a plain key/value store.
#[cfg_attr(test, automock)]
pub trait ConfigStore: Send + Sync {
    fn get(&self, clave: &str) -> Result<Option<ConfigEntry>, ConfigError>;
    fn put(&self, entry: ConfigEntry) -> Result<(), ConfigError>;
    fn all(&self) -> Result<Vec<ConfigEntry>, ConfigError>;
}

/// Inserts the known keys that are missing, keeping existing values.
pub fn seed_defaults(store: &dyn ConfigStore) -> Result<(), ConfigError> {
    for entry in SEEDED.iter() {
        if store.get(&entry.clave)?.is_none() {
            store.put(entry.clone())?;
        }
    }
    Ok(())
}

/// Redis-backed store. Entries live under `config-{clave}` as JSON.
pub struct RedisConfigStore;

fn storage_key(clave: &str) -> String {
    format!("{}-{}", "config", clave)
}

impl ConfigStore for RedisConfigStore {
    fn get(&self, clave: &str) -> Result<Option<ConfigEntry>, ConfigError> {
        match cache::get(storage_key(clave))? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ConfigError::Corrupt {
                    clave: clave.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn put(&self, entry: ConfigEntry) -> Result<(), ConfigError> {
        let raw = serde_json::to_string(&entry).map_err(|e| ConfigError::Corrupt {
            clave: entry.clave.clone(),
            message: e.to_string(),
        })?;
        cache::set(storage_key(&entry.clave), raw)?;
        Ok(())
    }

    fn all(&self) -> Result<Vec<ConfigEntry>, ConfigError> {
        let mut entries = Vec::new();
        for key in cache::scan_keys("config-*")? {
            if let Some(raw) = cache::get(key.clone())? {
                match serde_json::from_str(&raw) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        return Err(ConfigError::Corrupt {
                            clave: key,
                            message: e.to_string(),
                        })
                    }
                }
            }
        }
        entries.sort_by(|a: &ConfigEntry, b: &ConfigEntry| a.clave.cmp(&b.clave));
        Ok(entries)
    }
}

/// In-process store for tests and deployments without Redis.
#[derive(Default)]
pub struct MemoryConfigStore {
    entries: Mutex<HashMap<String, ConfigEntry>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        MemoryConfigStore::default()
    }

    pub fn with_defaults() -> Self {
        let store = MemoryConfigStore::new();
        for entry in SEEDED.iter() {
            store.put_entry(entry.clone());
        }
        store
    }

    pub fn put_entry(&self, entry: ConfigEntry) {
        self.entries
            .lock()
            .unwrap()
            .insert(entry.clave.clone(), entry);
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, clave: &str) -> Result<Option<ConfigEntry>, ConfigError> {
        Ok(self.entries.lock().unwrap().get(clave).cloned())
    }

    fn put(&self, entry: ConfigEntry) -> Result<(), ConfigError> {
        self.put_entry(entry);
        Ok(())
    }

    fn all(&self) -> Result<Vec<ConfigEntry>, ConfigError> {
        let mut entries: Vec<ConfigEntry> =
            self.entries.lock().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| a.clave.cmp(&b.clave));
        Ok(entries)
    }
}

/// Typed configuration reads with a last-known-value fallback: a config
/// backend outage degrades to the most recent value seen, then to the
/// documented default. It never blocks or fails a measurement.
pub struct SettingsCache {
    store: Arc<dyn ConfigStore>,
    last_known: Mutex<HashMap<String, f64>>,
}

impl SettingsCache {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        SettingsCache {
            store,
            last_known: Mutex::new(HashMap::new()),
        }
    }

    pub fn sensor_distance(&self) -> f64 {
        self.numeric(KEY_DISTANCIA_SENSORES, DEFAULT_DISTANCIA_SENSORES)
    }

    pub fn speed_limit(&self) -> f64 {
        self.numeric(KEY_LIMITE_VELOCIDAD, DEFAULT_LIMITE_VELOCIDAD)
    }

    pub fn pending_timeout(&self) -> f64 {
        self.numeric(KEY_TIMEOUT_PENDIENTE, DEFAULT_TIMEOUT_PENDIENTE)
    }

    fn numeric(&self, clave: &str, default: f64) -> f64 {
        match self.store.get(clave) {
            // every known key is a finite, positive quantity; anything else
            // in the backend is treated as corruption, not as a value
            Ok(Some(entry)) => match entry.valor.trim().parse::<f64>() {
                Ok(valor) if valor.is_finite() && valor > 0.0 => {
                    self.last_known
                        .lock()
                        .unwrap()
                        .insert(clave.to_string(), valor);
                    valor
                }
                _ => {
                    warn!(
                        "valor invalido para '{}': '{}', usando respaldo",
                        clave, entry.valor
                    );
                    self.fallback(clave, default)
                }
            },
            Ok(None) => self.fallback(clave, default),
            Err(e) => {
                warn!(
                    "configuracion no disponible para '{}' ({}), usando respaldo",
                    clave, e
                );
                self.fallback(clave, default)
            }
        }
    }

    fn fallback(&self, clave: &str, default: f64) -> f64 {
        self.last_known
            .lock()
            .unwrap()
            .get(clave)
            .copied()
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_fills_missing_keys_only() {
        let store = MemoryConfigStore::new();
        store.put_entry(ConfigEntry {
            clave: KEY_DISTANCIA_SENSORES.to_string(),
            valor: "250".to_string(),
            descripcion: None,
        });

        seed_defaults(&store).unwrap();

        let entries = store.all().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            store.get(KEY_DISTANCIA_SENSORES).unwrap().unwrap().valor,
            "250"
        );
        assert_eq!(store.get(KEY_LIMITE_VELOCIDAD).unwrap().unwrap().valor, "50");
    }

    #[test]
    fn settings_fall_back_to_defaults_when_unseeded() {
        let settings = SettingsCache::new(Arc::new(MemoryConfigStore::new()));
        assert_eq!(settings.sensor_distance(), DEFAULT_DISTANCIA_SENSORES);
        assert_eq!(settings.speed_limit(), DEFAULT_LIMITE_VELOCIDAD);
        assert_eq!(settings.pending_timeout(), DEFAULT_TIMEOUT_PENDIENTE);
    }

    #[test]
    fn settings_fall_back_to_last_known_value_on_outage() {
        let mut store = MockConfigStore::new();
        let mut healthy = true;
        store.expect_get().returning(move |clave| {
            if healthy {
                healthy = false;
                Ok(Some(ConfigEntry {
                    clave: clave.to_string(),
                    valor: "120".to_string(),
                    descripcion: None,
                }))
            } else {
                Err(ConfigError::Cache(CacheError {
                    msg: "connection refused".to_string(),
                }))
            }
        });

        let settings = SettingsCache::new(Arc::new(store));
        assert_eq!(settings.sensor_distance(), 120.0);
        // backend is now down: the cached 120 wins over the default 100
        assert_eq!(settings.sensor_distance(), 120.0);
    }

    #[test]
    fn non_numeric_value_degrades_to_default() {
        let store = MemoryConfigStore::new();
        store.put_entry(ConfigEntry {
            clave: KEY_LIMITE_VELOCIDAD.to_string(),
            valor: "rapido".to_string(),
            descripcion: None,
        });
        let settings = SettingsCache::new(Arc::new(store));
        assert_eq!(settings.speed_limit(), DEFAULT_LIMITE_VELOCIDAD);
    }

    #[test]
    fn non_positive_value_degrades_to_default() {
        let store = MemoryConfigStore::new();
        store.put_entry(ConfigEntry {
            clave: KEY_TIMEOUT_PENDIENTE.to_string(),
            valor: "-30".to_string(),
            descripcion: None,
        });
        let settings = SettingsCache::new(Arc::new(store));
        assert_eq!(settings.pending_timeout(), DEFAULT_TIMEOUT_PENDIENTE);
    }
}
