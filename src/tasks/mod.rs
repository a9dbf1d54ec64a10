//! # Sistema de Tareas
//! src/tasks/mod.rs
//!
//! Admisión acotada, dispatch FIFO a un pool fijo de workers, cancelación
//! cooperativa, retención y persistencia de las tareas de detección.
//!
//! ## Operaciones
//!
//! - `add_task(session)` - Registrar tarea
//! - `queue_task(descriptor)` - Admitir en la cola (falla si está llena)
//! - `get_task_status(id)` - Consultar estado
//! - `cancel_task(id)` - Cancelar
//! - `get_server_status()` - Estado del servidor
//! - `shutdown()` - Apagado ordenado

pub mod cancel;
mod dispatcher;
pub mod manager;
pub mod pool;
pub mod queue;
pub mod storage;
pub mod sweeper;
pub mod table;
pub mod types;
mod worker;

pub use cancel::{CancellationToken, ExecutionHandle};
pub use manager::{SchedulerConfig, TaskScheduler};
pub use sweeper::SweepReport;
pub use types::{
    InputType, ModelVariant, OutputFormat, QueueDescriptor, TaskId, TaskParams, TaskRecord,
    TaskStatus, TaskView,
};
