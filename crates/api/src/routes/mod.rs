//! Operational HTTP endpoints.

pub mod health;
pub mod metrics;
