//! # Puerto del Pipeline de Detección
//! src/pipeline/mod.rs
//!
//! El pipeline es el colaborador externo que procesa una sesión: extrae la
//! entrada, la segmenta en tiles, corre el modelo y deja los resultados en
//! un directorio de salida. Puede tardar minutos.
//!
//! La cancelación es cooperativa: el pipeline recibe un `Checkpoint` y lo
//! consulta en sus puntos de control. El planificador nunca interrumpe el
//! thread del worker.

pub mod command;
pub mod sessions;

pub use command::CommandPipeline;
pub use sessions::{parse_session_timestamp, Session, SessionLayout};

use crate::tasks::cancel::CancellationToken;
use crate::tasks::types::{TaskId, TaskParams};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Puntos de control en los que el pipeline consulta la cancelación
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStage {
    BeforeExtraction,
    AfterExtraction,
    AfterSegmentation,
    AfterDetection,
}

impl CheckpointStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStage::BeforeExtraction => "before_extraction",
            CheckpointStage::AfterExtraction => "after_extraction",
            CheckpointStage::AfterSegmentation => "after_segmentation",
            CheckpointStage::AfterDetection => "after_detection",
        }
    }
}

impl fmt::Display for CheckpointStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error de ejecución del pipeline; se registra en la tarea como `Failed`
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// El pipeline abortó porque su tarea fue cancelada
    #[error("cancelled at checkpoint {checkpoint}")]
    Cancelled { checkpoint: CheckpointStage },

    #[error("{0}")]
    Failed(String),

    #[error("Output folder not found or not returned by model execution: {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("pipeline panicked: {0}")]
    Panicked(String),

    #[error("pipeline io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lo que recibe el pipeline para una tarea
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub task_id: TaskId,
    pub session_id: String,
    pub input_dir: PathBuf,
    /// Directorio intermedio para la extracción y los tiles
    pub extract_dir: PathBuf,
    /// Directorio de salida sugerido para la sesión
    pub output_dir: PathBuf,
    pub params: TaskParams,
}

/// Resultado de una ejecución exitosa
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub output_dir: PathBuf,
    pub archive_path: Option<PathBuf>,
    pub detection_count: Option<u64>,
}

type ProgressSink = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// Contexto de cancelación y progreso que se pasa al pipeline
#[derive(Clone)]
pub struct Checkpoint {
    token: CancellationToken,
    sink: ProgressSink,
}

impl Checkpoint {
    pub fn new(token: CancellationToken, sink: ProgressSink) -> Self {
        Self { token, sink }
    }

    /// Checkpoint sin reporte de progreso
    pub fn detached(token: CancellationToken) -> Self {
        Self::new(token, Arc::new(|_: u8, _: &str| {}))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Falla con `Cancelled` si la tarea fue cancelada
    pub fn check(&self, stage: CheckpointStage) -> Result<(), ExecutionError> {
        if self.token.is_cancelled() {
            return Err(ExecutionError::Cancelled { checkpoint: stage });
        }
        Ok(())
    }

    /// Reporta progreso grueso (0-100) y la etapa actual
    pub fn report(&self, progress: u8, stage: &str) {
        (self.sink)(progress.min(100), stage);
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Operación de pipeline bloqueante
pub trait Pipeline: Send + Sync {
    fn run(
        &self,
        request: &PipelineRequest,
        checkpoint: &Checkpoint,
    ) -> Result<PipelineOutput, ExecutionError>;
}

impl<F> Pipeline for F
where
    F: Fn(&PipelineRequest, &Checkpoint) -> Result<PipelineOutput, ExecutionError> + Send + Sync,
{
    fn run(
        &self,
        request: &PipelineRequest,
        checkpoint: &Checkpoint,
    ) -> Result<PipelineOutput, ExecutionError> {
        self(request, checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_checkpoint_reports_and_checks() {
        let token = CancellationToken::new();
        let seen: Arc<Mutex<Vec<(u8, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let checkpoint = Checkpoint::new(
            token.clone(),
            Arc::new(move |p: u8, s: &str| sink_seen.lock().unwrap().push((p, s.to_string()))),
        );

        checkpoint.report(150, "Creating final ZIP archive");
        assert!(checkpoint.check(CheckpointStage::AfterExtraction).is_ok());

        token.cancel();
        let err = checkpoint.check(CheckpointStage::AfterDetection).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Cancelled {
                checkpoint: CheckpointStage::AfterDetection
            }
        ));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(100, "Creating final ZIP archive".to_string())]
        );
    }

    #[test]
    fn test_closure_is_pipeline() {
        let pipeline = |req: &PipelineRequest,
                        cp: &Checkpoint|
         -> Result<PipelineOutput, ExecutionError> {
            cp.check(CheckpointStage::BeforeExtraction)?;
            Ok(PipelineOutput {
                output_dir: req.output_dir.clone(),
                archive_path: None,
                detection_count: Some(0),
            })
        };

        let request = PipelineRequest {
            task_id: TaskId::from("t"),
            session_id: "s".to_string(),
            input_dir: PathBuf::from("in"),
            extract_dir: PathBuf::from("ex"),
            output_dir: PathBuf::from("out"),
            params: TaskParams::default(),
        };
        let output = pipeline
            .run(&request, &Checkpoint::detached(CancellationToken::new()))
            .unwrap();
        assert_eq!(output.output_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_missing_output_message() {
        let err = ExecutionError::MissingOutput(PathBuf::from("run/output/x"));
        assert!(err.to_string().starts_with("Output folder not found"));
    }
}
