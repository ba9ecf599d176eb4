use std::sync::Arc;

use chrono::{Days, NaiveDate};
use log::error;
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};

use crate::config::SettingsCache;
use crate::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::correlator::{
    Correlator, DetectionEvent, Reading, RegisterError, RegisterOutcome, SensorSource,
};
use crate::routes::Mensaje;
use crate::storage::{ReadingQuery, ReadingStore};

/// Detection body. The boards send either `{"timestamp": <epoch seconds>}`
/// or the bare-firmware shape `{"detector1"|"detector2": <epoch millis>}`;
/// an empty or absent body means "stamp it on arrival".
#[derive(Debug, Default, Deserialize)]
pub struct MedicionCreate {
    pub timestamp: Option<f64>,
    pub detector1: Option<u64>,
    pub detector2: Option<u64>,
}

impl MedicionCreate {
    fn into_event(self) -> DetectionEvent {
        if let Some(timestamp) = self.timestamp {
            DetectionEvent::at(timestamp, None)
        } else if let Some(millis) = self.detector1 {
            DetectionEvent::at(millis as f64 / 1_000.0, Some(SensorSource::Detector1))
        } else if let Some(millis) = self.detector2 {
            DetectionEvent::at(millis as f64 / 1_000.0, Some(SensorSource::Detector2))
        } else {
            DetectionEvent::now()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PrimeraDeteccion {
    pub mensaje: String,
    pub esperando_sensor2: bool,
    pub timestamp: f64,
}

/// A completed reading plus its read-time annotations. The exceedance flag
/// is computed against the limit in effect right now and is never persisted.
#[derive(Debug, Serialize)]
pub struct MedicionCompleta {
    #[serde(flatten)]
    pub medicion: Reading,
    pub exceso_velocidad: bool,
    pub limite_velocidad: f64,
}

#[derive(Responder)]
pub enum MedicionResponse {
    #[response(status = 200)]
    Esperando(Json<PrimeraDeteccion>),
    #[response(status = 200)]
    Completa(Json<MedicionCompleta>),
    #[response(status = 422)]
    IntervaloInvalido(Json<Mensaje>),
    #[response(status = 500)]
    Error(Json<Mensaje>),
}

async fn registrar(
    correlator: &Correlator,
    settings: &SettingsCache,
    body: Option<Json<MedicionCreate>>,
) -> MedicionResponse {
    let event = body.map(Json::into_inner).unwrap_or_default().into_event();
    match correlator.register_detection(event).await {
        Ok(RegisterOutcome::AwaitingSecond { first_timestamp }) => {
            MedicionResponse::Esperando(Json(PrimeraDeteccion {
                mensaje: "Primera deteccion registrada, esperando segundo sensor".to_string(),
                esperando_sensor2: true,
                timestamp: first_timestamp,
            }))
        }
        Ok(RegisterOutcome::Completed(medicion)) => {
            let limite_velocidad = settings.speed_limit();
            MedicionResponse::Completa(Json(MedicionCompleta {
                exceso_velocidad: medicion.speed_kmh > limite_velocidad,
                limite_velocidad,
                medicion,
            }))
        }
        Err(e @ RegisterError::InvalidInterval { .. }) => {
            MedicionResponse::IntervaloInvalido(Json(Mensaje::new(e.to_string())))
        }
        Err(e @ RegisterError::Storage(_)) => {
            error!("registro fallido: {}", e);
            MedicionResponse::Error(Json(Mensaje::new(e.to_string())))
        }
    }
}

#[post("/mediciones", data = "<body>")]
pub async fn registrar_medicion(
    correlator: &State<Correlator>,
    settings: &State<Arc<SettingsCache>>,
    body: Option<Json<MedicionCreate>>,
) -> MedicionResponse {
    registrar(correlator, settings, body).await
}

#[post("/detectar", data = "<body>")]
pub async fn detectar(
    correlator: &State<Correlator>,
    settings: &State<Arc<SettingsCache>>,
    body: Option<Json<MedicionCreate>>,
) -> MedicionResponse {
    registrar(correlator, settings, body).await
}

// the first board revisions only knew how to POST to the root
#[post("/", data = "<body>")]
pub async fn registrar_legacy(
    correlator: &State<Correlator>,
    settings: &State<Arc<SettingsCache>>,
    body: Option<Json<MedicionCreate>>,
) -> MedicionResponse {
    registrar(correlator, settings, body).await
}

#[derive(Responder)]
pub enum ListarResponse {
    #[response(status = 200)]
    Ok(Json<Vec<Reading>>),
    #[response(status = 422)]
    ParametrosInvalidos(Json<Mensaje>),
    #[response(status = 500)]
    Error(Json<Mensaje>),
}

/// UTC midnight of `fecha` as epoch seconds; with `end_exclusive`, midnight
/// of the following day, so a date range covers its last day entirely.
fn day_bound(fecha: &str, end_exclusive: bool) -> Result<f64, Mensaje> {
    let invalid = || Mensaje::new(format!("fecha invalida: {}", fecha));
    let mut date = NaiveDate::parse_from_str(fecha, "%Y-%m-%d").map_err(|_| invalid())?;
    if end_exclusive {
        date = date.checked_add_days(Days::new(1)).ok_or_else(invalid)?;
    }
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
    Ok(midnight.and_utc().timestamp() as f64)
}

#[get("/mediciones?<skip>&<limit>&<solo_completas>&<fecha_inicio>&<fecha_fin>")]
pub async fn listar_mediciones(
    store: &State<Arc<dyn ReadingStore>>,
    skip: Option<usize>,
    limit: Option<usize>,
    solo_completas: Option<bool>,
    fecha_inicio: Option<&str>,
    fecha_fin: Option<&str>,
) -> ListarResponse {
    let desde = match fecha_inicio.map(|f| day_bound(f, false)).transpose() {
        Ok(v) => v,
        Err(mensaje) => return ListarResponse::ParametrosInvalidos(Json(mensaje)),
    };
    let hasta = match fecha_fin.map(|f| day_bound(f, true)).transpose() {
        Ok(v) => v,
        Err(mensaje) => return ListarResponse::ParametrosInvalidos(Json(mensaje)),
    };

    let query = ReadingQuery {
        skip: skip.unwrap_or(0),
        limit: Some(limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)),
        solo_completas: solo_completas.unwrap_or(true),
        desde,
        hasta,
    };
    match store.list(query).await {
        Ok(mediciones) => ListarResponse::Ok(Json(mediciones)),
        Err(e) => {
            error!("listado fallido: {}", e);
            ListarResponse::Error(Json(Mensaje::new(format!(
                "error consultando mediciones: {}",
                e
            ))))
        }
    }
}

#[derive(Responder)]
pub enum ObtenerResponse {
    #[response(status = 200)]
    Ok(Json<Reading>),
    #[response(status = 404)]
    NoEncontrada(Json<Mensaje>),
    #[response(status = 500)]
    Error(Json<Mensaje>),
}

#[get("/mediciones/<id>")]
pub async fn obtener_medicion(store: &State<Arc<dyn ReadingStore>>, id: u64) -> ObtenerResponse {
    match store.get(id).await {
        Ok(Some(medicion)) => ObtenerResponse::Ok(Json(medicion)),
        Ok(None) => ObtenerResponse::NoEncontrada(Json(Mensaje::new("Medicion no encontrada"))),
        Err(e) => {
            error!("consulta fallida para la medicion {}: {}", id, e);
            ObtenerResponse::Error(Json(Mensaje::new(format!(
                "error consultando la medicion: {}",
                e
            ))))
        }
    }
}
