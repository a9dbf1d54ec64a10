//! # Logging de Tareas
//! src/logging.rs
//!
//! Capacidad de logging que se inyecta en cada componente como
//! `Arc<dyn TaskLogger>`. No hay logger global: los tests pasan un
//! `NoopLogger` o un `MemoryLogger` y el binario usa `TracingLogger`.

use crate::tasks::cancel::lock;
use crate::tasks::types::{TaskId, TaskStatus};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Severidad de un mensaje de sistema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Capacidad de logging usada por el planificador
pub trait TaskLogger: Send + Sync {
    /// Cambio de estado o progreso de una tarea
    fn task_status(&self, task_id: &TaskId, status: TaskStatus, progress: u8, stage: &str);

    /// Error asociado a una tarea
    fn task_error(&self, task_id: &TaskId, error: &str);

    /// Borrado (o intento de borrado) de artefactos en disco
    fn cleanup(&self, path: &Path, outcome: &str);

    /// Mensaje general del sistema
    fn system(&self, level: LogLevel, message: &str);
}

/// Logger por defecto: eventos estructurados de `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl TaskLogger for TracingLogger {
    fn task_status(&self, task_id: &TaskId, status: TaskStatus, progress: u8, stage: &str) {
        tracing::info!(
            task_id = %task_id,
            status = %status,
            progress,
            stage,
            "task status"
        );
    }

    fn task_error(&self, task_id: &TaskId, error: &str) {
        tracing::error!(task_id = %task_id, error, "task error");
    }

    fn cleanup(&self, path: &Path, outcome: &str) {
        tracing::info!(path = %path.display(), outcome, "cleanup");
    }

    fn system(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
    }
}

/// Descarta todo
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl TaskLogger for NoopLogger {
    fn task_status(&self, _: &TaskId, _: TaskStatus, _: u8, _: &str) {}
    fn task_error(&self, _: &TaskId, _: &str) {}
    fn cleanup(&self, _: &Path, _: &str) {}
    fn system(&self, _: LogLevel, _: &str) {}
}

/// Evento registrado por `MemoryLogger`
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Status {
        task_id: TaskId,
        status: TaskStatus,
        progress: u8,
        stage: String,
    },
    Error {
        task_id: TaskId,
        error: String,
    },
    Cleanup {
        path: PathBuf,
        outcome: String,
    },
    System {
        level: LogLevel,
        message: String,
    },
}

/// Logger que guarda los eventos en memoria
#[derive(Debug, Default)]
pub struct MemoryLogger {
    events: Mutex<Vec<LogEvent>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        lock(&self.events).clone()
    }

    /// Estados registrados para una tarea, en orden
    pub fn statuses_for(&self, task_id: &TaskId) -> Vec<TaskStatus> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                LogEvent::Status {
                    task_id: id,
                    status,
                    ..
                } if id == task_id => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn system_messages(&self, level: LogLevel) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                LogEvent::System { level: l, message } if *l == level => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: LogEvent) {
        lock(&self.events).push(event);
    }
}

impl TaskLogger for MemoryLogger {
    fn task_status(&self, task_id: &TaskId, status: TaskStatus, progress: u8, stage: &str) {
        self.push(LogEvent::Status {
            task_id: task_id.clone(),
            status,
            progress,
            stage: stage.to_string(),
        });
    }

    fn task_error(&self, task_id: &TaskId, error: &str) {
        self.push(LogEvent::Error {
            task_id: task_id.clone(),
            error: error.to_string(),
        });
    }

    fn cleanup(&self, path: &Path, outcome: &str) {
        self.push(LogEvent::Cleanup {
            path: path.to_path_buf(),
            outcome: outcome.to_string(),
        });
    }

    fn system(&self, level: LogLevel, message: &str) {
        self.push(LogEvent::System {
            level,
            message: message.to_string(),
        });
    }
}

/// Instala el subscriber de `tracing` del proceso.
///
/// `RUST_LOG` tiene prioridad sobre `level`. Si ya había un subscriber
/// instalado no hace nada.
pub fn init_tracing(level: &str, json: bool) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: log level '{}' is not a valid tracing filter ({}); using 'info'",
                    level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    let result = if json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };

    if let Err(e) = result {
        eprintln!("WARN: tracing subscriber already installed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_logger_records_in_order() {
        let logger = MemoryLogger::new();
        let id = TaskId::from("t1");

        logger.task_status(&id, TaskStatus::Queued, 0, "Queued");
        logger.task_status(&TaskId::from("other"), TaskStatus::Queued, 0, "Queued");
        logger.task_status(&id, TaskStatus::Processing, 2, "Initializing");
        logger.system(LogLevel::Warn, "disk almost full");

        assert_eq!(
            logger.statuses_for(&id),
            vec![TaskStatus::Queued, TaskStatus::Processing]
        );
        assert_eq!(logger.system_messages(LogLevel::Warn), vec!["disk almost full"]);
        assert_eq!(logger.events().len(), 4);
    }

    #[test]
    fn test_noop_logger_is_silent() {
        let logger: Box<dyn TaskLogger> = Box::new(NoopLogger);
        logger.task_error(&TaskId::from("x"), "ignored");
        logger.cleanup(Path::new("/tmp/x"), "removed");
    }
}
