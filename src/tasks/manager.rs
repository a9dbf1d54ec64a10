//! # Planificador Central de Tareas
//! src/tasks/manager.rs
//!
//! Fachada pública del sistema: admisión, consulta, cancelación, estado del
//! servidor y apagado. Coordina la tabla, la cola de admisión, el pool de
//! workers, el dispatcher, el sweeper y el snapshot en disco.
//!
//! Orden de locks: tabla → cola, tabla → store. El snapshot se escribe
//! siempre fuera del lock de la tabla.

use crate::config::Config;
use crate::error::{Result, SchedulerError};
use crate::logging::{LogLevel, TaskLogger};
use crate::metrics::{ServerStatus, StatsCollector};
use crate::pipeline::{Pipeline, Session, SessionLayout};
use crate::tasks::cancel::{lock, ShutdownSignal};
use crate::tasks::queue::AdmissionQueue;
use crate::tasks::storage::SnapshotStore;
use crate::tasks::dispatcher;
use crate::tasks::pool::WorkerPool;
use crate::tasks::sweeper::{self, SweepReport};
use crate::tasks::table::{TableSnapshot, TaskEntry, TaskTable};
use crate::tasks::types::{QueueDescriptor, TaskId, TaskParams, TaskRecord, TaskStatus, TaskView};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuración del planificador
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Máximo de tareas en `Processing` a la vez
    pub max_workers: usize,

    /// Máximo de tareas admitidas esperando worker
    pub queue_capacity: usize,

    /// Ruta del snapshot JSON
    pub snapshot_path: PathBuf,

    /// Cuánto se conserva una tarea terminada en la tabla
    pub task_retention: Duration,

    /// Edad máxima de los directorios de entrada y extracción
    pub input_max_age: Duration,

    /// Edad máxima de los directorios y zips de salida
    pub output_max_age: Duration,

    pub sweep_interval: Duration,

    /// Espera acotada sobre la ejecución al cancelar
    pub cancel_grace: Duration,

    /// Timeout del pop de la cola en el dispatcher
    pub dispatch_poll: Duration,

    /// Timeout de cada espera de slot libre
    pub slot_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            queue_capacity: 10,
            snapshot_path: PathBuf::from("run/tasks.json"),
            task_retention: Duration::from_secs(2 * 3600),
            input_max_age: Duration::from_secs(2 * 3600),
            output_max_age: Duration::from_secs(4 * 3600),
            sweep_interval: Duration::from_secs(30 * 60),
            cancel_grace: Duration::from_millis(1000),
            dispatch_poll: Duration::from_secs(1),
            slot_wait: Duration::from_millis(500),
        }
    }
}

impl SchedulerConfig {
    /// Crea una configuración desde el Config principal
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.max_workers,
            queue_capacity: config.queue_capacity,
            snapshot_path: PathBuf::from(&config.snapshot_path),
            task_retention: Duration::from_secs(config.task_retention_secs),
            input_max_age: Duration::from_secs(config.input_max_age_secs),
            output_max_age: Duration::from_secs(config.output_max_age_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
            ..Self::default()
        }
    }
}

/// Estado compartido por la fachada, el dispatcher, los workers y el sweeper
pub(crate) struct SchedulerInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) table: TaskTable,
    pub(crate) queue: AdmissionQueue,
    pub(crate) store: SnapshotStore,
    pub(crate) pool: WorkerPool,
    pub(crate) pipeline: Arc<dyn Pipeline>,
    pub(crate) sessions: SessionLayout,
    pub(crate) stats: StatsCollector,
    pub(crate) logger: Arc<dyn TaskLogger>,
    pub(crate) shutdown: ShutdownSignal,
}

impl SchedulerInner {
    /// Escribe un snapshot; los fallos solo se registran
    pub(crate) fn persist(&self, snapshot: TableSnapshot) {
        if let Err(e) = self.store.save(&snapshot) {
            self.logger.system(
                LogLevel::Error,
                &format!("snapshot write failed, continuing in memory: {}", e),
            );
        }
    }

    /// Borra los directorios de una sesión
    pub(crate) fn remove_session(&self, session_id: Option<&str>) {
        if let Some(session_id) = session_id {
            self.sessions.remove(session_id, self.logger.as_ref());
        }
    }
}

/// Planificador de tareas de detección
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl TaskScheduler {
    /// Crea el planificador, carga el snapshot y arranca el pool.
    ///
    /// El dispatcher y el sweeper no corren hasta llamar a `start`.
    pub fn new(
        config: SchedulerConfig,
        pipeline: Arc<dyn Pipeline>,
        sessions: SessionLayout,
        logger: Arc<dyn TaskLogger>,
    ) -> Result<Self> {
        let store = SnapshotStore::open(&config.snapshot_path, Arc::clone(&logger));

        let interrupted = store.interrupt_unfinished();
        if !interrupted.is_empty() {
            logger.system(
                LogLevel::Warn,
                &format!(
                    "{} tasks were unfinished at last shutdown and are now failed",
                    interrupted.len()
                ),
            );
            if let Err(e) = store.save(&TableSnapshot {
                revision: 0,
                records: Vec::new(),
            }) {
                logger.system(LogLevel::Error, &format!("snapshot write failed: {}", e));
            }
        }

        let pool = WorkerPool::new(config.max_workers, Arc::clone(&logger))?;
        let queue = AdmissionQueue::new(config.queue_capacity);

        logger.system(
            LogLevel::Info,
            &format!(
                "scheduler ready: {} workers, queue capacity {}, snapshot {}",
                config.max_workers,
                config.queue_capacity,
                config.snapshot_path.display()
            ),
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                table: TaskTable::new(),
                queue,
                store,
                pool,
                pipeline,
                sessions,
                stats: StatsCollector::new(),
                logger,
                shutdown: ShutdownSignal::new(),
            }),
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Arranca el dispatcher y el sweeper
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let dispatcher_inner = Arc::clone(&self.inner);
        let dispatcher = spawn_loop("detect-dispatcher", move || {
            dispatcher::run(dispatcher_inner)
        })?;

        let sweeper_inner = Arc::clone(&self.inner);
        let sweeper = spawn_loop("detect-sweeper", move || sweeper::run(sweeper_inner))?;

        lock(&self.loops).extend([dispatcher, sweeper]);
        Ok(())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &SessionLayout {
        &self.inner.sessions
    }

    /// Crea los directorios de una sesión nueva
    pub fn create_session(&self) -> Result<Session> {
        self.inner
            .sessions
            .create()
            .map_err(SchedulerError::Session)
    }

    /// Registra una tarea `Created` para una sesión ya creada
    ///
    /// La tarea no cuenta como encolada, no tiene posición y no se ejecuta
    /// hasta pasar por `queue_task`.
    pub fn add_task(&self, session: &Session) -> Result<TaskId> {
        if self.inner.shutdown.is_triggered() {
            return Err(SchedulerError::ShuttingDown);
        }

        let id = TaskId::generate();
        let record = TaskRecord::new(id.clone(), session.id.clone(), session.input_dir.clone());

        let snapshot = {
            let mut state = self.inner.table.lock();
            state.tasks.insert(id.clone(), TaskEntry::new(record));
            state.touch();
            state.snapshot()
        };
        self.inner.persist(snapshot);

        Ok(id)
    }

    /// Admite una tarea en la cola
    ///
    /// Si la cola está llena devuelve `Admission` y descarta el registro
    /// provisional creado por `add_task`.
    pub fn queue_task(&self, descriptor: QueueDescriptor) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.is_triggered() {
            return Err(SchedulerError::ShuttingDown);
        }

        let id = descriptor.task_id.clone();
        let capacity = inner.queue.max_capacity();

        let admitted = {
            let mut state = inner.table.lock();

            let entry = state
                .tasks
                .get(&id)
                .ok_or_else(|| SchedulerError::NotFound(id.clone()))?;
            if entry.record.status == TaskStatus::Queued {
                return Err(SchedulerError::AlreadyQueued(id));
            }
            if !entry.record.status.can_transition_to(TaskStatus::Queued) {
                return Err(SchedulerError::InvalidState {
                    id,
                    status: entry.record.status,
                });
            }

            let full = state.count_status(TaskStatus::Queued) >= capacity;
            if full || inner.queue.push(descriptor).is_err() {
                state.tasks.remove(&id);
                state.touch();
                Err(state.snapshot())
            } else {
                let seq = state.next_admission_seq();
                if let Some(entry) = state.tasks.get_mut(&id) {
                    if entry.record.mark_queued() {
                        entry.admitted_seq = Some(seq);
                    }
                }
                state.touch();
                inner.stats.record_admitted();
                Ok((state.queue_position(&id).unwrap_or(0), state.snapshot()))
            }
        };

        match admitted {
            Ok((position, snapshot)) => {
                inner.persist(snapshot);
                inner.logger.task_status(
                    &id,
                    TaskStatus::Queued,
                    0,
                    &format!("Queued (position {})", position),
                );
                Ok(())
            }
            Err(snapshot) => {
                inner.persist(snapshot);
                inner.logger.system(
                    LogLevel::Warn,
                    &format!("task {} rejected: admission queue full ({})", id, capacity),
                );
                Err(SchedulerError::Admission { capacity })
            }
        }
    }

    /// `add_task` + `queue_task` para una sesión
    ///
    /// Si la admisión falla por cola llena se borran los directorios de la
    /// sesión.
    pub fn submit(&self, session: &Session, params: TaskParams) -> Result<TaskId> {
        let id = self.add_task(session)?;
        let descriptor = QueueDescriptor {
            task_id: id.clone(),
            input_path: session.input_dir.clone(),
            params,
        };

        match self.queue_task(descriptor) {
            Ok(()) => Ok(id),
            Err(e @ SchedulerError::Admission { .. }) => {
                self.inner.remove_session(Some(&session.id));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Estado de una tarea, o `None` si el ID es desconocido
    ///
    /// Mira primero la tabla viva y después el snapshot. Una tarea terminada
    /// con resultados recuperables vuelve a la tabla viva al consultarla.
    pub fn get_task_status(&self, id: &TaskId) -> Option<TaskView> {
        let inner = &self.inner;

        if let Some(view) = inner.table.lock().view(id) {
            return Some(view);
        }

        let record = inner.store.dormant(id)?;
        if !(record.is_terminal() && record.has_output_refs()) {
            return Some(TaskView {
                record,
                queue_position: None,
            });
        }

        let (view, snapshot) = {
            let mut state = inner.table.lock();
            if let Some(view) = state.view(id) {
                return Some(view);
            }

            match inner.store.take_dormant(id) {
                Some(record) => {
                    state.tasks.insert(id.clone(), TaskEntry::new(record));
                    state.touch();
                    (state.view(id), Some(state.snapshot()))
                }
                None => (None, None),
            }
        };

        if let Some(snapshot) = snapshot {
            inner.persist(snapshot);
            inner
                .logger
                .system(LogLevel::Debug, &format!("task {} restored from snapshot", id));
        }
        view
    }

    /// Cancela una tarea `Queued` o `Processing`
    ///
    /// El estado final es `Cancelled` aunque el pipeline no coopere: se espera
    /// a la ejecución como mucho `cancel_grace` y después se borran los
    /// directorios de la sesión.
    pub fn cancel_task(&self, id: &TaskId) -> Result<()> {
        let inner = &self.inner;

        let (execution, session_id, snapshot) = {
            let mut state = inner.table.lock();

            let entry = match state.tasks.get_mut(id) {
                Some(entry) => entry,
                None => {
                    return match inner.store.dormant(id) {
                        Some(record) => Err(SchedulerError::Cancellation {
                            id: id.clone(),
                            status: record.status,
                        }),
                        None => Err(SchedulerError::NotFound(id.clone())),
                    };
                }
            };

            let was_queued = entry.record.status == TaskStatus::Queued;
            if !entry.record.mark_cancelled() {
                return Err(SchedulerError::Cancellation {
                    id: id.clone(),
                    status: entry.record.status,
                });
            }
            entry.cancel.cancel();
            let execution = entry.execution.clone();
            let session_id = entry.record.session_id.clone();

            if was_queued {
                inner.queue.remove(id);
            }
            state.touch();
            inner.stats.record_cancelled();
            (execution, session_id, state.snapshot())
        };

        // Despierta al dispatcher si esta tarea esperaba slot
        inner.table.notify_slot();
        inner.persist(snapshot);
        inner
            .logger
            .task_status(id, TaskStatus::Cancelled, 100, "Cancelled by user");

        if let Some(execution) = execution {
            if !execution.wait_timeout(inner.config.cancel_grace) {
                inner.logger.system(
                    LogLevel::Warn,
                    &format!(
                        "task {}: pipeline still running after {:?}; its result will be discarded",
                        id, inner.config.cancel_grace
                    ),
                );
            }
        }

        inner.remove_session(session_id.as_deref());
        Ok(())
    }

    /// Snapshot del estado del servidor
    pub fn get_server_status(&self) -> ServerStatus {
        let inner = &self.inner;
        let capacity = inner.config.queue_capacity;

        let mut status = {
            let state = inner.table.lock();
            ServerStatus {
                queued: state.count_status(TaskStatus::Queued),
                processing: state.count_status(TaskStatus::Processing),
                queued_ids: state.ids_with_status(TaskStatus::Queued),
                processing_ids: state.ids_with_status(TaskStatus::Processing),
                completed_ids: state.ids_with_status(TaskStatus::Completed),
                failed_ids: state.ids_with_status(TaskStatus::Failed),
                cancelled_ids: state.ids_with_status(TaskStatus::Cancelled),
                queue_capacity: capacity,
                max_workers: inner.config.max_workers,
                can_accept: state.count_status(TaskStatus::Queued) < capacity,
                lifetime: Default::default(),
                process: None,
                uptime_secs: 0,
            }
        };

        status.can_accept &= !inner.shutdown.is_triggered();
        status.lifetime = inner.stats.lifetime();
        status.process = inner.stats.process_usage();
        status.uptime_secs = inner.stats.uptime().as_secs();
        status
    }

    /// Corre un ciclo del sweeper ahora mismo
    pub fn sweep_now(&self) -> SweepReport {
        sweeper::sweep_once(&self.inner, Utc::now())
    }

    /// Detiene los loops, drena el pool y escribe el snapshot final.
    ///
    /// Bloquea hasta que no queda ningún thread del planificador vivo.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = &self.inner;
        inner.logger.system(LogLevel::Info, "scheduler shutting down");

        inner.shutdown.trigger();
        inner.queue.push_shutdown();
        inner.table.notify_slot();

        let loops: Vec<JoinHandle<()>> = lock(&self.loops).drain(..).collect();
        for handle in loops {
            if handle.join().is_err() {
                inner
                    .logger
                    .system(LogLevel::Error, "background loop panicked before shutdown");
            }
        }

        inner.pool.shutdown();

        let snapshot = inner.table.lock().snapshot();
        inner.persist(snapshot);
        inner.logger.system(LogLevel::Info, "scheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_loop<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| SchedulerError::Spawn {
            name: name.to_string(),
            source,
        })
}
