use std::sync::Arc;

use log::{error, info};
use rocket::serde::json::Json;
use rocket::State;
use serde::Deserialize;

use crate::config::{ConfigEntry, ConfigStore};
use crate::routes::Mensaje;

#[derive(Responder)]
pub enum ConfiguracionListResponse {
    #[response(status = 200)]
    Ok(Json<Vec<ConfigEntry>>),
    #[response(status = 500)]
    Error(Json<Mensaje>),
}

#[get("/configuracion")]
pub async fn listar_configuracion(
    config: &State<Arc<dyn ConfigStore>>,
) -> ConfiguracionListResponse {
    match config.all() {
        Ok(entries) => ConfiguracionListResponse::Ok(Json(entries)),
        Err(e) => {
            error!("listado de configuracion fallido: {}", e);
            ConfiguracionListResponse::Error(Json(Mensaje::new(format!(
                "error consultando la configuracion: {}",
                e
            ))))
        }
    }
}

#[derive(Responder)]
pub enum ConfiguracionResponse {
    #[response(status = 200)]
    Ok(Json<ConfigEntry>),
    #[response(status = 404)]
    NoEncontrada(Json<Mensaje>),
    #[response(status = 422)]
    ValorInvalido(Json<Mensaje>),
    #[response(status = 500)]
    Error(Json<Mensaje>),
}

#[get("/configuracion/<clave>")]
pub async fn obtener_configuracion(
    config: &State<Arc<dyn ConfigStore>>,
    clave: &str,
) -> ConfiguracionResponse {
    match config.get(clave) {
        Ok(Some(entry)) => ConfiguracionResponse::Ok(Json(entry)),
        Ok(None) => {
            ConfiguracionResponse::NoEncontrada(Json(Mensaje::new("Configuracion no encontrada")))
        }
        Err(e) => {
            error!("consulta de configuracion fallida para '{}': {}", clave, e);
            ConfiguracionResponse::Error(Json(Mensaje::new(format!(
                "error consultando la configuracion: {}",
                e
            ))))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfiguracionUpdate {
    pub valor: String,
}

#[put("/configuracion/<clave>", data = "<body>")]
pub async fn actualizar_configuracion(
    config: &State<Arc<dyn ConfigStore>>,
    clave: &str,
    body: Json<ConfiguracionUpdate>,
) -> ConfiguracionResponse {
    // every known key is numeric and physically positive; reject before
    // touching the store so a bad update never mutates anything
    let valor = body.valor.trim();
    let numeric = match valor.parse::<f64>() {
        Ok(v) => v,
        Err(_) => {
            return ConfiguracionResponse::ValorInvalido(Json(Mensaje::new(format!(
                "el valor debe ser numerico, se recibio '{}'",
                valor
            ))))
        }
    };
    if !numeric.is_finite() || numeric <= 0.0 {
        return ConfiguracionResponse::ValorInvalido(Json(Mensaje::new(
            "el valor debe ser mayor que cero",
        )));
    }

    let mut entry = match config.get(clave) {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return ConfiguracionResponse::NoEncontrada(Json(Mensaje::new(
                "Configuracion no encontrada",
            )))
        }
        Err(e) => {
            error!("consulta de configuracion fallida para '{}': {}", clave, e);
            return ConfiguracionResponse::Error(Json(Mensaje::new(format!(
                "error consultando la configuracion: {}",
                e
            ))));
        }
    };

    entry.valor = valor.to_string();
    match config.put(entry.clone()) {
        Ok(()) => {
            info!("configuracion '{}' actualizada a '{}'", clave, entry.valor);
            ConfiguracionResponse::Ok(Json(entry))
        }
        Err(e) => {
            error!("actualizacion de configuracion fallida para '{}': {}", clave, e);
            ConfiguracionResponse::Error(Json(Mensaje::new(format!(
                "error guardando la configuracion: {}",
                e
            ))))
        }
    }
}
