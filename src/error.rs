//! # Errores del Planificador
//! src/error.rs
//!
//! Taxonomía de errores expuesta por el sistema de tareas.
//! Los errores del pipeline externo viven en `pipeline::ExecutionError`.

use crate::tasks::types::{TaskId, TaskStatus};
use std::path::PathBuf;
use thiserror::Error;

/// Errores devueltos por las operaciones del `TaskScheduler`
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// La cola de admisión está llena; el cliente debe reintentar más tarde
    #[error("admission queue is full (capacity {capacity}), retry later")]
    Admission { capacity: usize },

    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Cancelación pedida sobre una tarea ya terminal
    #[error("task {id} cannot be cancelled in status {status}")]
    Cancellation { id: TaskId, status: TaskStatus },

    #[error("task {0} was already queued")]
    AlreadyQueued(TaskId),

    #[error("task {id} is {status} and cannot be queued")]
    InvalidState { id: TaskId, status: TaskStatus },

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("session setup failed: {0}")]
    Session(#[source] std::io::Error),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Fallos al leer o escribir el snapshot.
///
/// Nunca llegan al llamador: se registran y el sistema sigue en memoria.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
