//! # Collector de Estadísticas
//! src/metrics/collector.rs
//!
//! Contadores de vida del planificador, muestreo de uso de recursos del
//! proceso y el snapshot `ServerStatus` que devuelve `get_server_status`.
//!
//! Los contadores viven en su propio mutex, separado de la tabla de tareas.

use crate::tasks::cancel::lock;
use crate::tasks::types::TaskId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Intervalo mínimo entre dos muestras del proceso
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Contadores acumulados desde que arrancó el planificador
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifetimeCounters {
    /// Tareas admitidas en la cola
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Uso de recursos del proceso en una muestra
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub memory_mb: u64,
    pub sampled_at: DateTime<Utc>,
}

struct SamplerState {
    system: System,
    last: Option<(Instant, Option<ProcessUsage>)>,
}

/// Muestreador de uso del proceso, cacheado
///
/// Como mucho una lectura de `sysinfo` por `SAMPLE_INTERVAL`; entre medias
/// devuelve la última muestra.
pub struct ProcessSampler {
    pid: Option<Pid>,
    interval: Duration,
    state: Mutex<SamplerState>,
}

impl ProcessSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            interval,
            state: Mutex::new(SamplerState {
                system: System::new(),
                last: None,
            }),
        }
    }

    pub fn sample(&self) -> Option<ProcessUsage> {
        let pid = self.pid?;
        let mut state = lock(&self.state);

        if let Some((at, usage)) = &state.last {
            if at.elapsed() < self.interval {
                return usage.clone();
            }
        }

        state
            .system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let usage = state.system.process(pid).map(|proc| {
            let memory_bytes = proc.memory();
            ProcessUsage {
                pid: pid.as_u32(),
                cpu_percent: proc.cpu_usage(),
                memory_bytes,
                memory_mb: memory_bytes / 1024 / 1024,
                sampled_at: Utc::now(),
            }
        });

        state.last = Some((Instant::now(), usage.clone()));
        usage
    }
}

/// Estadísticas del planificador (thread-safe)
pub struct StatsCollector {
    counters: Mutex<LifetimeCounters>,
    sampler: ProcessSampler,
    start_time: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(LifetimeCounters::default()),
            sampler: ProcessSampler::new(SAMPLE_INTERVAL),
            start_time: Instant::now(),
        }
    }

    pub fn record_admitted(&self) {
        lock(&self.counters).total += 1;
    }

    pub fn record_completed(&self) {
        lock(&self.counters).completed += 1;
    }

    pub fn record_failed(&self) {
        lock(&self.counters).failed += 1;
    }

    pub fn record_cancelled(&self) {
        lock(&self.counters).cancelled += 1;
    }

    pub fn lifetime(&self) -> LifetimeCounters {
        *lock(&self.counters)
    }

    pub fn process_usage(&self) -> Option<ProcessUsage> {
        self.sampler.sample()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot del estado del servidor
///
/// Los conteos por estado salen de escanear la tabla en el momento de la
/// llamada, nunca de contadores.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub queued: usize,
    pub processing: usize,
    pub queued_ids: Vec<TaskId>,
    pub processing_ids: Vec<TaskId>,
    pub completed_ids: Vec<TaskId>,
    pub failed_ids: Vec<TaskId>,
    pub cancelled_ids: Vec<TaskId>,
    pub queue_capacity: usize,
    pub max_workers: usize,
    /// Hay hueco en la cola de admisión
    pub can_accept: bool,
    pub lifetime: LifetimeCounters,
    pub process: Option<ProcessUsage>,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = StatsCollector::new();
        stats.record_admitted();
        stats.record_admitted();
        stats.record_completed();
        stats.record_cancelled();

        assert_eq!(
            stats.lifetime(),
            LifetimeCounters {
                total: 2,
                completed: 1,
                failed: 0,
                cancelled: 1,
            }
        );
    }

    #[test]
    fn test_sample_is_cached() {
        let sampler = ProcessSampler::new(Duration::from_secs(60));
        let first = sampler.sample();
        let second = sampler.sample();

        // Dentro del intervalo es la misma muestra, incluida la fecha
        assert_eq!(first, second);
        if let Some(usage) = first {
            assert_eq!(usage.pid, std::process::id());
            assert!(usage.memory_bytes > 0);
        }
    }

    #[test]
    fn test_server_status_serializes() {
        let status = ServerStatus {
            queued: 1,
            processing: 0,
            queued_ids: vec![TaskId::from("a")],
            processing_ids: vec![],
            completed_ids: vec![],
            failed_ids: vec![],
            cancelled_ids: vec![],
            queue_capacity: 10,
            max_workers: 5,
            can_accept: true,
            lifetime: LifetimeCounters::default(),
            process: None,
            uptime_secs: 3,
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["queued_ids"][0], "a");
        assert_eq!(json["lifetime"]["total"], 0);
        assert_eq!(json["can_accept"], true);
    }
}
