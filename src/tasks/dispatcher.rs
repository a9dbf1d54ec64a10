//! # Dispatcher
//! src/tasks/dispatcher.rs
//!
//! Único loop que saca descriptores de la cola de admisión, espera un slot
//! libre y entrega la tarea al pool. El pop tiene timeout para poder ver el
//! apagado aunque nadie encole nada.

use crate::logging::LogLevel;
use crate::tasks::manager::SchedulerInner;
use crate::tasks::queue::QueueItem;
use crate::tasks::types::{QueueDescriptor, TaskStatus};
use crate::tasks::worker;
use std::sync::Arc;

pub(crate) fn run(inner: Arc<SchedulerInner>) {
    inner.logger.system(LogLevel::Info, "dispatcher started");

    loop {
        match inner.queue.pop_timeout(inner.config.dispatch_poll) {
            Some(QueueItem::Shutdown) => break,
            Some(QueueItem::Task(descriptor)) => dispatch(&inner, descriptor),
            None => {
                if inner.shutdown.is_triggered() {
                    break;
                }
            }
        }
    }

    inner.logger.system(LogLevel::Info, "dispatcher stopped");
}

/// Pasa una tarea de `Queued` a `Processing` cuando hay slot
fn dispatch(inner: &Arc<SchedulerInner>, descriptor: QueueDescriptor) {
    let id = descriptor.task_id.clone();
    let mut state = inner.table.lock();

    // Esperar slot; la espera se corta si la tarea se cancela o si llega
    // el apagado (la tarea queda Queued y se marca como interrumpida al
    // volver a arrancar)
    loop {
        let waiting = match state.tasks.get(&id) {
            Some(entry) => entry.record.status == TaskStatus::Queued && !entry.cancel.is_cancelled(),
            None => false,
        };
        if !waiting {
            inner.logger.system(
                LogLevel::Debug,
                &format!("task {} no longer queued, dispatch skipped", id),
            );
            return;
        }
        if inner.shutdown.is_triggered() {
            return;
        }
        if state.active.len() < inner.config.max_workers {
            break;
        }
        state = inner.table.wait_for_slot(state, inner.config.slot_wait);
    }

    let Some(entry) = state.tasks.get_mut(&id) else {
        return;
    };
    let session_id = entry
        .record
        .session_id
        .clone()
        .unwrap_or_else(|| id.to_string());
    if !entry
        .record
        .mark_processing(inner.sessions.output_dir(&session_id))
    {
        return;
    }
    let token = entry.cancel.clone();

    let job_inner = Arc::clone(inner);
    let submitted = inner
        .pool
        .submit(move || worker::execute(&job_inner, descriptor, token));

    let status = match submitted {
        Ok(handle) => {
            entry.execution = Some(handle);
            TaskStatus::Processing
        }
        Err(e) => {
            if entry.record.mark_failed(e.to_string()) {
                inner.stats.record_failed();
            }
            TaskStatus::Failed
        }
    };
    let stage = entry.record.stage.clone();
    if status == TaskStatus::Processing {
        state.active.insert(id.clone());
    }

    state.touch();
    let snapshot = state.snapshot();
    drop(state);

    inner.persist(snapshot);
    inner.logger.task_status(&id, status, 0, &stage);
}
