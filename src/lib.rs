//! # Detect Queue
//! src/lib.rs
//!
//! Planificador de trabajos de detección sobre imágenes georreferenciadas.
//! Cada trabajo corre un pipeline externo (extracción, segmentación en
//! tiles, detección) que puede tardar minutos.
//!
//! ## Arquitectura
//!
//! - `tasks`: cola de admisión, dispatcher, pool de workers, cancelación,
//!   sweeper de retención y snapshot en disco
//! - `pipeline`: puerto del pipeline externo, checkpoints y sesiones en disco
//! - `metrics`: contadores de vida y uso de recursos del proceso
//! - `logging`: capacidad de logging inyectable
//! - `config`: configuración por CLI y variables de entorno
//!
//! ## Ejemplo de uso
//!
//! ```ignore
//! use detect_queue::logging::TracingLogger;
//! use detect_queue::pipeline::{CommandPipeline, SessionLayout};
//! use detect_queue::tasks::{SchedulerConfig, TaskParams, TaskScheduler};
//! use std::sync::Arc;
//!
//! let logger = Arc::new(TracingLogger);
//! let pipeline = Arc::new(CommandPipeline::new("python3", vec!["main.py".into()], logger.clone()));
//! let layout = SessionLayout::new("input", "run/extract", "run/output");
//! let scheduler = TaskScheduler::new(SchedulerConfig::default(), pipeline, layout, logger)?;
//! scheduler.start()?;
//!
//! let session = scheduler.create_session()?;
//! let id = scheduler.submit(&session, TaskParams::default())?;
//! println!("{:?}", scheduler.get_task_status(&id));
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod tasks;

pub use error::{PersistenceError, SchedulerError};
pub use tasks::{TaskId, TaskScheduler, TaskStatus};
