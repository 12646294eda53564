//! Support routes served behind the gate.

mod fallback;
mod health;

pub use fallback::not_found;
pub use health::{HealthResponse, health_check, readiness_check};
