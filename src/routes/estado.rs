use std::sync::Arc;

use log::info;
use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;

use crate::config::SettingsCache;
use crate::correlator::Correlator;
use crate::routes::Mensaje;

#[derive(Debug, Serialize)]
pub struct Estado {
    pub esperando_sensor2: bool,
    pub distancia_sensores: f64,
    pub limite_velocidad: f64,
}

#[get("/estado")]
pub async fn estado(
    correlator: &State<Correlator>,
    settings: &State<Arc<SettingsCache>>,
) -> Json<Estado> {
    Json(Estado {
        esperando_sensor2: correlator.pending_status().await.is_some(),
        distancia_sensores: settings.sensor_distance(),
        limite_velocidad: settings.speed_limit(),
    })
}

#[delete("/reset")]
pub async fn reset(correlator: &State<Correlator>) -> Json<Mensaje> {
    if correlator.reset_pending().await {
        info!("medicion pendiente descartada por reset del operador");
    }
    Json(Mensaje::new("reset"))
}
