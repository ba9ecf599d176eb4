
mod aws;
mod cache;
mod config;
mod constants;
mod correlator;
mod routes;
mod storage;

use std::env;
use std::sync::Arc;

use dotenv::dotenv;
use log::{error, info, warn};
use rocket::{Build, Rocket};

use crate::config::{ConfigStore, MemoryConfigStore, RedisConfigStore, SettingsCache};
use crate::correlator::Correlator;
use crate::storage::{MemoryReadingStore, ReadingStore};

#[macro_use]
extern crate rocket;
extern crate redis;

#[get("/")]
fn index() -> String {
    format!("hola, soy el radar de velocidad")
}

async fn reading_store_from_env() -> Arc<dyn ReadingStore> {
    match env::var("RADAR_STORAGE").as_deref() {
        Ok("dynamo") => match aws::DynamoReadingStore::from_env().await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("dynamo no disponible ({}), usando memoria", e);
                Arc::new(MemoryReadingStore::new())
            }
        },
        _ => {
            info!("mediciones en memoria (RADAR_STORAGE=dynamo para DynamoDB)");
            Arc::new(MemoryReadingStore::new())
        }
    }
}

fn config_store_from_env() -> Arc<dyn ConfigStore> {
    match env::var("RADAR_CONFIG_STORE").as_deref() {
        Ok("redis") => Arc::new(RedisConfigStore),
        _ => Arc::new(MemoryConfigStore::new()),
    }
}

fn radar(store: Arc<dyn ReadingStore>, config_store: Arc<dyn ConfigStore>) -> Rocket<Build> {
    let settings = Arc::new(SettingsCache::new(config_store.clone()));
    let correlator = Correlator::new(store.clone(), settings.clone());
    rocket::build()
        .manage(store)
        .manage(config_store)
        .manage(settings)
        .manage(correlator)
        .mount(
            "/",
            routes![
                index,
                routes::mediciones::registrar_medicion,
                routes::mediciones::detectar,
                routes::mediciones::registrar_legacy,
                routes::mediciones::listar_mediciones,
                routes::mediciones::obtener_medicion,
                routes::estado::estado,
                routes::estado::reset,
                routes::configuracion::listar_configuracion,
                routes::configuracion::obtener_configuracion,
                routes::configuracion::actualizar_configuracion,
                routes::estadisticas::obtener_estadisticas,
            ],
        )
}

#[launch]
async fn rocket() -> _ {
    dotenv().ok();
    let store = reading_store_from_env().await;
    let config_store = config_store_from_env();
    if let Err(e) = config::seed_defaults(config_store.as_ref()) {
        warn!("no se pudo sembrar la configuracion inicial: {}", e);
    }
    radar(store, config_store)
}
