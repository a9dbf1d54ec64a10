//! # Sistema de Estadísticas
//! src/metrics/mod.rs
//!
//! - Contadores de vida (total/completed/failed/cancelled)
//! - Uso de CPU y memoria del proceso, muestreado como mucho una vez por segundo
//! - Snapshot de estado del servidor

pub mod collector;

pub use collector::{LifetimeCounters, ProcessUsage, ServerStatus, StatsCollector};
