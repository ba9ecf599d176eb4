// physical constants
pub const MPS_TO_KMH: f64 = 3.6;

// configuration defaults
pub const DEFAULT_DISTANCIA_SENSORES: f64 = 100.0; // meters between the two beams
pub const DEFAULT_LIMITE_VELOCIDAD: f64 = 50.0; // km/h
pub const DEFAULT_TIMEOUT_PENDIENTE: f64 = 45.0; // seconds before a lone detection is abandoned

// request handling
pub const STORAGE_SAVE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;
