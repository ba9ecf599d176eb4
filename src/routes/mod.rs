pub mod configuracion;
pub mod estadisticas;
pub mod estado;
pub mod mediciones;

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Mensaje {
    pub mensaje: String,
}

impl Mensaje {
    pub fn new(mensaje: impl Into<String>) -> Self {
        Mensaje {
            mensaje: mensaje.into(),
        }
    }
}
