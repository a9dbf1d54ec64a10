//! # Detect Queue - Entry Point
//! src/main.rs
//!
//! Corre un lote de entradas a través del planificador: crea una sesión por
//! entrada, copia los archivos, admite la tarea y espera a que todas
//! terminen. Al final imprime el estado de cada tarea y del servidor en JSON.
//!
//! Si la cola está llena se reintenta la admisión hasta que se libere lugar.

use detect_queue::config::Config;
use detect_queue::logging::{init_tracing, TaskLogger, TracingLogger};
use detect_queue::pipeline::{CommandPipeline, SessionLayout};
use detect_queue::tasks::{SchedulerConfig, TaskId, TaskParams, TaskScheduler, TaskView};
use detect_queue::SchedulerError;
use std::error::Error;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const ADMISSION_RETRY: Duration = Duration::from_secs(1);

fn main() {
    let config = Config::new();
    init_tracing(&config.log_level, config.log_json);

    if let Err(e) = config.validate() {
        eprintln!("❌ Configuración inválida: {}", e);
        std::process::exit(2);
    }

    if let Err(e) = run(config) {
        eprintln!("💥 Error fatal: {}", e);
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn Error>> {
    config.print_summary();
    let params = config.task_params()?;

    let logger: Arc<dyn TaskLogger> = Arc::new(TracingLogger);
    let pipeline = Arc::new(CommandPipeline::new(
        config.pipeline_program.clone(),
        config.pipeline_args.clone(),
        Arc::clone(&logger),
    ));
    let layout = SessionLayout::new(&config.input_dir, &config.extract_dir, &config.output_dir);

    let scheduler = TaskScheduler::new(
        SchedulerConfig::from_config(&config),
        pipeline,
        layout,
        logger,
    )?;
    scheduler.start()?;

    if config.inputs.is_empty() {
        warn!("no inputs given, nothing to do");
    }

    let mut ids = Vec::with_capacity(config.inputs.len());
    for input in &config.inputs {
        let id = submit_input(&scheduler, input, &params)?;
        info!(task_id = %id, input = %input.display(), "task admitted");
        ids.push(id);
    }

    wait_for_all(&scheduler, &ids);

    let views: Vec<TaskView> = ids
        .iter()
        .filter_map(|id| scheduler.get_task_status(id))
        .collect();
    println!("{}", serde_json::to_string_pretty(&views)?);
    println!("{}", serde_json::to_string_pretty(&scheduler.get_server_status())?);

    scheduler.shutdown();
    Ok(())
}

/// Crea la sesión, copia la entrada y la admite, reintentando con cola llena
fn submit_input(
    scheduler: &TaskScheduler,
    input: &Path,
    params: &TaskParams,
) -> Result<TaskId, Box<dyn Error>> {
    loop {
        let session = scheduler.create_session()?;
        if let Err(e) = stage_input(input, &session.input_dir) {
            scheduler
                .sessions()
                .remove(&session.id, &TracingLogger);
            return Err(format!("cannot stage {}: {}", input.display(), e).into());
        }

        match scheduler.submit(&session, params.clone()) {
            Ok(id) => return Ok(id),
            Err(SchedulerError::Admission { capacity }) => {
                warn!(capacity, input = %input.display(), "queue full, retrying");
                thread::sleep(ADMISSION_RETRY);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Copia un archivo o un directorio completo dentro de `dest`
fn stage_input(src: &Path, dest: &Path) -> io::Result<()> {
    if src.is_dir() {
        copy_dir(src, dest)
    } else {
        let name = src.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "input has no file name")
        })?;
        fs::copy(src, dest.join(name)).map(|_| ())
    }
}

fn copy_dir(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn wait_for_all(scheduler: &TaskScheduler, ids: &[TaskId]) {
    loop {
        let pending = ids
            .iter()
            .filter(|id| {
                scheduler
                    .get_task_status(id)
                    .is_some_and(|view| !view.record.is_terminal())
            })
            .count();

        if pending == 0 {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
}
