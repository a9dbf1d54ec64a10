//! # Pipeline como Proceso Externo
//! src/pipeline/command.rs
//!
//! Corre el detector como un proceso hijo. Los parámetros van como flags y
//! el hijo informa por stdout, una línea JSON por evento:
//!
//! ```text
//! {"progress": 40, "stage": "Running detection"}
//! {"checkpoint": "after_segmentation"}
//! {"detections": 12, "output_dir": "run/output/...", "archive": "run/output/....zip"}
//! ```
//!
//! Las líneas que no son JSON se ignoran. Entre lecturas se consulta el
//! checkpoint y, si la tarea fue cancelada, se mata al hijo.

use crate::logging::{LogLevel, TaskLogger};
use crate::pipeline::{
    Checkpoint, CheckpointStage, ExecutionError, Pipeline, PipelineOutput, PipelineRequest,
};
use serde::Deserialize;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cuántos bytes finales de stderr se copian al mensaje de error
const STDERR_TAIL: usize = 2048;

/// Evento emitido por el detector en stdout
#[derive(Debug, Default, Deserialize)]
struct PipelineEvent {
    #[serde(default)]
    progress: Option<u8>,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    checkpoint: Option<CheckpointStage>,
    #[serde(default)]
    detections: Option<u64>,
    #[serde(default)]
    output_dir: Option<PathBuf>,
    #[serde(default)]
    archive: Option<PathBuf>,
}

/// Lo acumulado a partir de los eventos
#[derive(Debug)]
struct RunSummary {
    last_checkpoint: CheckpointStage,
    detections: Option<u64>,
    output_dir: Option<PathBuf>,
    archive: Option<PathBuf>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            last_checkpoint: CheckpointStage::BeforeExtraction,
            detections: None,
            output_dir: None,
            archive: None,
        }
    }
}

impl RunSummary {
    fn apply(&mut self, event: PipelineEvent, checkpoint: &Checkpoint) {
        if let Some(stage) = event.checkpoint {
            self.last_checkpoint = stage;
        }
        if let Some(progress) = event.progress {
            let stage = event.stage.as_deref().unwrap_or("Processing");
            checkpoint.report(progress, stage);
        }
        if event.detections.is_some() {
            self.detections = event.detections;
        }
        if event.output_dir.is_some() {
            self.output_dir = event.output_dir;
        }
        if event.archive.is_some() {
            self.archive = event.archive;
        }
    }
}

/// Pipeline que lanza un programa externo por tarea
pub struct CommandPipeline {
    program: String,
    args: Vec<String>,
    poll_interval: Duration,
    logger: Arc<dyn TaskLogger>,
}

impl CommandPipeline {
    pub fn new(program: impl Into<String>, args: Vec<String>, logger: Arc<dyn TaskLogger>) -> Self {
        Self {
            program: program.into(),
            args,
            poll_interval: Duration::from_millis(250),
            logger,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn build_command(&self, request: &PipelineRequest) -> Command {
        let params = &request.params;
        let mut cmd = Command::new(&self.program);

        cmd.args(&self.args)
            .arg("--input-dir")
            .arg(&request.input_dir)
            .arg("--extract-dir")
            .arg(&request.extract_dir)
            .arg("--output-dir")
            .arg(&request.output_dir)
            .arg("--input-type")
            .arg(params.input_type.code().to_string())
            .arg("--classification-threshold")
            .arg(params.classification_threshold.to_string())
            .arg("--prediction-threshold")
            .arg(params.prediction_threshold.to_string())
            .arg("--output-type")
            .arg(params.output_format.code().to_string())
            .arg("--model")
            .arg(params.model.as_str());

        if params.save_labeled_image {
            cmd.arg("--save-labeled-image");
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Espera al hijo drenando eventos; lo mata si la tarea se cancela
    fn supervise(
        &self,
        child: &mut Child,
        events: &Receiver<PipelineEvent>,
        summary: &mut RunSummary,
        checkpoint: &Checkpoint,
    ) -> Result<ExitStatus, ExecutionError> {
        loop {
            while let Ok(event) = events.try_recv() {
                summary.apply(event, checkpoint);
            }

            if checkpoint.is_cancelled() {
                if let Err(e) = child.kill() {
                    self.logger.system(
                        LogLevel::Warn,
                        &format!("could not kill detector process: {}", e),
                    );
                }
                let _ = child.wait();
                return Err(ExecutionError::Cancelled {
                    checkpoint: summary.last_checkpoint,
                });
            }

            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }

            thread::sleep(self.poll_interval);
        }
    }
}

impl Pipeline for CommandPipeline {
    fn run(
        &self,
        request: &PipelineRequest,
        checkpoint: &Checkpoint,
    ) -> Result<PipelineOutput, ExecutionError> {
        checkpoint.check(CheckpointStage::BeforeExtraction)?;

        fs::create_dir_all(&request.extract_dir)?;
        fs::create_dir_all(&request.output_dir)?;

        let mut child = self.build_command(request).spawn()?;
        self.logger.system(
            LogLevel::Debug,
            &format!("task {}: detector started (pid {})", request.task_id, child.id()),
        );

        let (tx, rx) = mpsc::channel();
        let stdout_reader: Option<JoinHandle<()>> = child.stdout.take().map(|stdout| {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    if let Ok(event) = serde_json::from_str::<PipelineEvent>(line.trim()) {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
            })
        });
        let stderr_reader: Option<JoinHandle<String>> = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                // El detector puede escribir bytes que no son UTF-8
                let mut bytes = Vec::new();
                let _ = stderr.read_to_end(&mut bytes);
                String::from_utf8_lossy(&bytes).into_owned()
            })
        });

        let mut summary = RunSummary::default();
        // Con cancelación los lectores no se esperan: algún nieto del
        // detector puede seguir con los pipes abiertos
        let status = self.supervise(&mut child, &rx, &mut summary, checkpoint)?;

        if let Some(handle) = stdout_reader {
            let _ = handle.join();
        }
        let stderr_text = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        while let Ok(event) = rx.try_recv() {
            summary.apply(event, checkpoint);
        }

        if !status.success() {
            return Err(ExecutionError::Failed(format!(
                "detector exited with {}: {}",
                status,
                stderr_tail(&stderr_text)
            )));
        }

        checkpoint.check(CheckpointStage::AfterDetection)?;

        Ok(PipelineOutput {
            output_dir: summary.output_dir.unwrap_or_else(|| request.output_dir.clone()),
            archive_path: summary.archive,
            detection_count: summary.detections,
        })
    }
}

/// Últimos `STDERR_TAIL` bytes, cortados en un límite de carácter
fn stderr_tail(text: &str) -> &str {
    let mut start = text.len().saturating_sub(STDERR_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].trim()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::logging::NoopLogger;
    use crate::tasks::cancel::CancellationToken;
    use crate::tasks::types::{TaskId, TaskParams};
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::tempdir;

    fn request(root: &std::path::Path) -> PipelineRequest {
        PipelineRequest {
            task_id: TaskId::from("t"),
            session_id: "s".to_string(),
            input_dir: root.join("input"),
            extract_dir: root.join("extract"),
            output_dir: root.join("output"),
            params: TaskParams::default(),
        }
    }

    fn shell(script: &str) -> CommandPipeline {
        CommandPipeline::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "detector".to_string()],
            Arc::new(NoopLogger),
        )
        .with_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_reads_progress_and_detections() {
        let dir = tempdir().unwrap();
        let pipeline = shell(
            r#"echo '{"progress": 40, "stage": "Running detection"}'; echo 'plain text'; echo '{"detections": 7}'"#,
        );

        let seen: Arc<Mutex<Vec<(u8, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let checkpoint = Checkpoint::new(
            CancellationToken::new(),
            Arc::new(move |p: u8, s: &str| sink.lock().unwrap().push((p, s.to_string()))),
        );

        let req = request(dir.path());
        let output = pipeline.run(&req, &checkpoint).unwrap();

        assert_eq!(output.detection_count, Some(7));
        assert_eq!(output.output_dir, req.output_dir);
        assert!(req.output_dir.is_dir());
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&(40, "Running detection".to_string())));
        // El 2% inicial lo informa el worker, no el pipeline
        assert!(seen.iter().all(|(_, stage)| stage != "Initializing processing environment"));
    }

    #[test]
    fn test_nonzero_exit_fails() {
        let dir = tempdir().unwrap();
        let pipeline = shell("echo 'model weights missing' >&2; exit 3");

        let err = pipeline
            .run(&request(dir.path()), &Checkpoint::detached(CancellationToken::new()))
            .unwrap_err();
        match err {
            ExecutionError::Failed(msg) => assert!(msg.contains("model weights missing")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_non_utf8_stderr_keeps_message() {
        let dir = tempdir().unwrap();
        let pipeline = shell(r"printf '\377\376 boom' >&2; exit 3");

        let err = pipeline
            .run(&request(dir.path()), &Checkpoint::detached(CancellationToken::new()))
            .unwrap_err();
        match err {
            ExecutionError::Failed(msg) => assert!(msg.contains("boom"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_stderr_tail_respects_char_boundaries() {
        // 'é' ocupa dos bytes; el corte cae en medio de uno
        let text = format!("{}!", "é".repeat(STDERR_TAIL));
        let tail = stderr_tail(&text);
        assert_eq!(tail.len(), STDERR_TAIL - 1);
        assert!(tail.ends_with('!'));
        assert!(tail.starts_with('é'));

        let short = "  model crashed\n";
        assert_eq!(stderr_tail(short), "model crashed");
    }

    #[test]
    fn test_cancel_kills_child() {
        let dir = tempdir().unwrap();
        let pipeline = shell(r#"echo '{"checkpoint": "after_extraction"}'; exec sleep 30"#);
        let token = CancellationToken::new();
        let cancel = token.clone();

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        });

        let start = Instant::now();
        let err = pipeline
            .run(&request(dir.path()), &Checkpoint::detached(token))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
        t.join().unwrap();
    }

    #[test]
    fn test_already_cancelled_never_spawns() {
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = shell("exit 0")
            .run(&request(dir.path()), &Checkpoint::detached(token))
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Cancelled {
                checkpoint: CheckpointStage::BeforeExtraction
            }
        ));
        assert!(!dir.path().join("output").exists());
    }
}
