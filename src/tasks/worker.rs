//! # Ejecución de una Tarea
//! src/tasks/worker.rs
//!
//! Lo que corre dentro de un slot del pool: arma la petición, llama al
//! pipeline con un checkpoint de cancelación y registra el resultado.
//! Si la tarea se canceló mientras tanto el resultado se descarta.

use crate::logging::LogLevel;
use crate::pipeline::{Checkpoint, ExecutionError, PipelineOutput, PipelineRequest};
use crate::tasks::cancel::CancellationToken;
use crate::tasks::manager::SchedulerInner;
use crate::tasks::types::{QueueDescriptor, TaskId, TaskStatus};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub(crate) fn execute(inner: &Arc<SchedulerInner>, descriptor: QueueDescriptor, token: CancellationToken) {
    let id = descriptor.task_id.clone();

    let session_id = {
        let state = inner.table.lock();
        state
            .tasks
            .get(&id)
            .filter(|entry| entry.record.status == TaskStatus::Processing && !token.is_cancelled())
            .map(|entry| entry.record.session_id.clone().unwrap_or_else(|| id.to_string()))
    };
    let Some(session_id) = session_id else {
        // Cancelada entre el dispatch y el arranque del worker
        finish(inner, &id, None, Err(ExecutionError::Failed("not runnable".to_string())));
        return;
    };

    let params = descriptor.params;
    let request = PipelineRequest {
        task_id: id.clone(),
        session_id: session_id.clone(),
        input_dir: descriptor.input_path,
        extract_dir: inner.sessions.extract_dir(&session_id),
        output_dir: inner.sessions.output_dir(&session_id),
        params: params.clone(),
    };

    inner.logger.system(
        LogLevel::Info,
        &format!(
            "task {}: input_type={} classification_threshold={} prediction_threshold={} \
             save_labeled_image={} output_type={} model={}",
            id,
            params.input_type.code(),
            params.classification_threshold,
            params.prediction_threshold,
            params.save_labeled_image,
            params.output_format.code(),
            params.model.as_str()
        ),
    );

    let checkpoint = Checkpoint::new(token, progress_sink(inner, &id));
    checkpoint.report(2, "Initializing processing environment");

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
        inner.pipeline.run(&request, &checkpoint)
    })) {
        Ok(result) => result,
        Err(payload) => Err(ExecutionError::Panicked(panic_message(payload.as_ref()))),
    };

    let outcome = outcome.and_then(|output| {
        if output.output_dir.is_dir() {
            Ok(output)
        } else {
            Err(ExecutionError::MissingOutput(output.output_dir))
        }
    });

    finish(inner, &id, Some(&session_id), outcome);
}

/// Actualiza progreso y etapa mientras la tarea sigue en `Processing`
fn progress_sink(inner: &Arc<SchedulerInner>, id: &TaskId) -> Arc<dyn Fn(u8, &str) + Send + Sync> {
    let inner = Arc::clone(inner);
    let id = id.clone();

    Arc::new(move |progress: u8, stage: &str| {
        let updated = {
            let mut state = inner.table.lock();
            match state.tasks.get_mut(&id) {
                Some(entry) if entry.record.status == TaskStatus::Processing => {
                    entry.record.update_progress(progress, stage);
                    true
                }
                _ => false,
            }
        };
        if updated {
            inner
                .logger
                .task_status(&id, TaskStatus::Processing, progress, stage);
        }
    })
}

/// Libera el slot y registra el resultado
///
/// `session_id` es `None` cuando la tarea ni siquiera llegó al pipeline.
fn finish(
    inner: &SchedulerInner,
    id: &TaskId,
    session_id: Option<&str>,
    outcome: Result<PipelineOutput, ExecutionError>,
) {
    let recorded = {
        let mut state = inner.table.lock();
        state.active.remove(id);

        let live = match state.tasks.get_mut(id) {
            Some(entry) if entry.record.status == TaskStatus::Processing && !entry.cancel.is_cancelled() => {
                Some(entry)
            }
            _ => None,
        };

        match live {
            None => None,
            Some(entry) => {
                let marked = match &outcome {
                    Ok(output) => entry.record.mark_completed(
                        output.output_dir.clone(),
                        output.archive_path.clone(),
                        output.detection_count,
                    ),
                    Err(e) => entry.record.mark_failed(e.to_string()),
                };
                let status = entry.record.status;
                let stage = entry.record.stage.clone();

                // Los contadores cambian junto con el estado, bajo el mismo lock
                match status {
                    TaskStatus::Completed if marked => inner.stats.record_completed(),
                    TaskStatus::Failed if marked => inner.stats.record_failed(),
                    _ => {}
                }
                state.touch();
                Some((status, stage, state.snapshot()))
            }
        }
    };
    inner.table.notify_slot();

    let Some((status, stage, snapshot)) = recorded else {
        // Cancelada mientras corría: el resultado no cuenta
        if let Some(session_id) = session_id {
            inner.logger.system(
                LogLevel::Info,
                &format!("task {}: result discarded after cancellation", id),
            );
            inner.remove_session(Some(session_id));
        }
        return;
    };

    inner.persist(snapshot);
    inner.logger.task_status(id, status, 100, &stage);

    if let Err(e) = outcome {
        inner.logger.task_error(id, &e.to_string());
        inner.remove_session(session_id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
