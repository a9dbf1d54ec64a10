//! # Sweeper de Retención
//! src/tasks/sweeper.rs
//!
//! Segundo loop de fondo. Cada `sweep_interval`:
//! 1. Calcula las sesiones protegidas (tareas vivas o con ejecución en vuelo).
//! 2. Guarda un snapshot y después desaloja de la tabla las tareas terminadas
//!    más viejas que la retención.
//! 3. Borra directorios de entrada, extracción y salida viejos, calculando la
//!    edad por el timestamp del ID de sesión o, si no se puede, por mtime.

use crate::logging::LogLevel;
use crate::pipeline::parse_session_timestamp;
use crate::pipeline::sessions::remove_path;
use crate::tasks::manager::SchedulerInner;
use crate::tasks::types::TaskId;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Resultado de un ciclo
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Tareas desalojadas de la tabla viva
    pub evicted: Vec<TaskId>,
    /// Registros que solo estaban en disco y expiraron
    pub expired: Vec<TaskId>,
    /// Rutas borradas del disco
    pub removed_paths: usize,
}

pub(crate) fn run(inner: Arc<SchedulerInner>) {
    inner.logger.system(
        LogLevel::Info,
        &format!("sweeper started (every {:?})", inner.config.sweep_interval),
    );

    while !inner.shutdown.sleep(inner.config.sweep_interval) {
        let report = sweep_once(&inner, Utc::now());
        inner.logger.system(
            LogLevel::Info,
            &format!(
                "sweep: {} tasks evicted, {} stored records expired, {} paths removed",
                report.evicted.len(),
                report.expired.len(),
                report.removed_paths
            ),
        );
    }

    inner.logger.system(LogLevel::Info, "sweeper stopped");
}

/// Un ciclo completo de limpieza tomando `now` como referencia
pub(crate) fn sweep_once(inner: &SchedulerInner, now: DateTime<Utc>) -> SweepReport {
    let task_cutoff = cutoff(now, inner.config.task_retention);

    let (protected, before) = {
        let state = inner.table.lock();
        (state.protected_sessions(), state.snapshot())
    };
    inner.persist(before);

    let (evicted, after) = {
        let mut state = inner.table.lock();

        let evicted: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|e| e.record.is_terminal() && !e.has_running_execution())
            .filter(|e| e.record.finished_or_created_at() < task_cutoff)
            .map(|e| e.record.id.clone())
            .collect();

        for id in &evicted {
            state.tasks.remove(id);
        }
        if !evicted.is_empty() {
            state.touch();
        }
        (evicted, state.snapshot())
    };

    inner.store.forget(&evicted);
    let expired = inner.store.expire_dormant(task_cutoff);
    if !evicted.is_empty() || !expired.is_empty() {
        inner.persist(after);
    }

    let sessions = &inner.sessions;
    let input_cutoff = cutoff(now, inner.config.input_max_age);
    let output_cutoff = cutoff(now, inner.config.output_max_age);

    let removed_paths = [
        (sessions.input_root.as_path(), input_cutoff),
        (sessions.extract_root.as_path(), input_cutoff),
        (sessions.output_root.as_path(), output_cutoff),
    ]
    .into_iter()
    .map(|(root, cutoff)| sweep_root(inner, root, cutoff, &protected))
    .sum::<usize>();

    SweepReport {
        evicted,
        expired,
        removed_paths,
    }
}

/// Borra las entradas de `root` nacidas antes de `cutoff`
fn sweep_root(
    inner: &SchedulerInner,
    root: &Path,
    cutoff: DateTime<Utc>,
    protected: &HashSet<String>,
) -> usize {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            inner.logger.system(
                LogLevel::Warn,
                &format!("sweep: cannot read {}: {}", root.display(), e),
            );
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let session = name.strip_suffix(".zip").unwrap_or(&name);
        if protected.contains(session) {
            continue;
        }

        let born = parse_session_timestamp(&name).or_else(|| {
            entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        });

        match born {
            Some(born) if born < cutoff => {
                if remove_path(&entry.path(), inner.logger.as_ref()) {
                    removed += 1;
                }
            }
            _ => {}
        }
    }

    removed
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
