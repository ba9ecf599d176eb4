use std::sync::Arc;

use chrono::Utc;
use log::error;
use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;

use crate::config::SettingsCache;
use crate::routes::Mensaje;
use crate::storage::{ReadingQuery, ReadingStore};

#[derive(Debug, Serialize)]
pub struct Estadisticas {
    pub total_mediciones: usize,
    pub velocidad_promedio_kmh: Option<f64>,
    pub velocidad_maxima_kmh: Option<f64>,
    pub velocidad_minima_kmh: Option<f64>,
    pub mediciones_hoy: usize,
    pub excesos_velocidad: usize,
}

#[derive(Responder)]
pub enum EstadisticasResponse {
    #[response(status = 200)]
    Ok(Json<Estadisticas>),
    #[response(status = 500)]
    Error(Json<Mensaje>),
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[get("/estadisticas")]
pub async fn obtener_estadisticas(
    store: &State<Arc<dyn ReadingStore>>,
    settings: &State<Arc<SettingsCache>>,
) -> EstadisticasResponse {
    let completas = match store.list(ReadingQuery::completed()).await {
        Ok(mediciones) => mediciones,
        Err(e) => {
            error!("estadisticas fallidas: {}", e);
            return EstadisticasResponse::Error(Json(Mensaje::new(format!(
                "error consultando mediciones: {}",
                e
            ))));
        }
    };

    let limite = settings.speed_limit();
    let inicio_hoy = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp() as f64)
        .unwrap_or(0.0);
    let fin_hoy = inicio_hoy + 86_400.0;

    let total_mediciones = completas.len();
    let suma: f64 = completas.iter().map(|m| m.speed_kmh).sum();
    let velocidad_promedio_kmh = (total_mediciones > 0)
        .then(|| round2(suma / total_mediciones as f64));
    let velocidad_maxima_kmh = completas
        .iter()
        .map(|m| m.speed_kmh)
        .reduce(f64::max)
        .map(round2);
    let velocidad_minima_kmh = completas
        .iter()
        .map(|m| m.speed_kmh)
        .reduce(f64::min)
        .map(round2);
    let mediciones_hoy = completas
        .iter()
        .filter(|m| m.second_timestamp >= inicio_hoy && m.second_timestamp < fin_hoy)
        .count();
    // exceedance is strictly greater-than: exactly at the limit is legal
    let excesos_velocidad = completas.iter().filter(|m| m.speed_kmh > limite).count();

    EstadisticasResponse::Ok(Json(Estadisticas {
        total_mediciones,
        velocidad_promedio_kmh,
        velocidad_maxima_kmh,
        velocidad_minima_kmh,
        mediciones_hoy,
        excesos_velocidad,
    }))
}
