//! # Tipos y Estructuras para el Sistema de Tareas
//! src/tasks/types.rs
//!
//! Define el registro persistido de cada tarea, su máquina de estados,
//! los parámetros del pipeline y el descriptor que viaja por la cola.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Identificador opaco e inmutable de una tarea
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Genera un ID nuevo (UUID v4)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Estado de una tarea
///
/// `Created → Queued → Processing → {Completed | Failed | Cancelled}`, más
/// las aristas directas `Queued → Cancelled` y `Processing → Cancelled`. Los
/// tres estados terminales son absorbentes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Registrada pero todavía no admitida en la cola
    Created,

    /// Admitida, esperando un slot de worker
    Queued,

    /// En ejecución dentro del pipeline
    Processing,

    Completed,

    Failed,

    /// Cancelada por el usuario
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Verifica si la transición `self → next` es legal
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tipo de entrada que recibe el pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// jpg/png con su world file (.jgw), o un zip que los contenga
    #[default]
    ImageWithWorldFile,

    /// GeoTIFF, o un zip que los contenga
    GeoTiff,
}

impl InputType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(InputType::ImageWithWorldFile),
            1 => Some(InputType::GeoTiff),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            InputType::ImageWithWorldFile => 0,
            InputType::GeoTiff => 1,
        }
    }
}

/// Formato de salida de las detecciones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Txt,
}

impl OutputFormat {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(OutputFormat::Json),
            1 => Some(OutputFormat::Txt),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            OutputFormat::Json => 0,
            OutputFormat::Txt => 1,
        }
    }
}

/// Variante del modelo de detección orientada
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    #[default]
    N,
    S,
    M,
    L,
}

impl ModelVariant {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "n" => Some(ModelVariant::N),
            "s" => Some(ModelVariant::S),
            "m" => Some(ModelVariant::M),
            "l" => Some(ModelVariant::L),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::N => "n",
            ModelVariant::S => "s",
            ModelVariant::M => "m",
            ModelVariant::L => "l",
        }
    }
}

/// Parámetros con los que se invoca el pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParams {
    pub input_type: InputType,
    pub classification_threshold: f32,
    pub prediction_threshold: f32,
    pub save_labeled_image: bool,
    pub output_format: OutputFormat,
    pub model: ModelVariant,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            input_type: InputType::default(),
            classification_threshold: 0.35,
            prediction_threshold: 0.5,
            save_labeled_image: false,
            output_format: OutputFormat::default(),
            model: ModelVariant::default(),
        }
    }
}

/// Descriptor mínimo que viaja por la cola de admisión
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDescriptor {
    pub task_id: TaskId,
    pub input_path: PathBuf,
    pub params: TaskParams,
}

/// Registro persistido de una tarea
///
/// Solo contiene campos durables. El token de cancelación y el handle de
/// ejecución viven en la tabla, nunca en disco. Todos los campos opcionales
/// toleran ausencia al cargar y los campos desconocidos se ignoran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,

    pub status: TaskStatus,

    /// Progreso grueso (0-100), no necesariamente monótono
    #[serde(default)]
    pub progress: u8,

    #[serde(default)]
    pub stage: String,

    /// Sesión de directorios; embebe el timestamp de creación
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub input_path: Option<PathBuf>,

    #[serde(default)]
    pub output_path: Option<PathBuf>,

    #[serde(default)]
    pub result_archive_path: Option<PathBuf>,

    #[serde(default)]
    pub has_detections: Option<bool>,

    #[serde(default)]
    pub detection_count: Option<u64>,

    /// Mensaje de error (Failed o Cancelled)
    #[serde(default)]
    pub error: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Se pone una sola vez y nunca vuelve a false
    #[serde(default)]
    pub cancel_requested: bool,
}

impl TaskRecord {
    /// Crea un registro nuevo en estado `Created`
    pub fn new(id: TaskId, session_id: String, input_path: PathBuf) -> Self {
        Self {
            id,
            status: TaskStatus::Created,
            progress: 0,
            stage: "Created".to_string(),
            session_id: Some(session_id),
            input_path: Some(input_path),
            output_path: None,
            result_archive_path: None,
            has_detections: None,
            detection_count: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            cancel_requested: false,
        }
    }

    /// Avanza el estado si la arista es legal; si no, el registro queda intacto
    fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Marca la tarea como admitida en la cola
    #[must_use]
    pub fn mark_queued(&mut self) -> bool {
        if !self.advance(TaskStatus::Queued) {
            return false;
        }
        self.stage = "Queued".to_string();
        true
    }

    /// Marca la tarea como en ejecución
    #[must_use]
    pub fn mark_processing(&mut self, output_path: PathBuf) -> bool {
        if !self.advance(TaskStatus::Processing) {
            return false;
        }
        self.progress = 0;
        self.stage = "Starting task initialization".to_string();
        self.output_path = Some(output_path);
        true
    }

    /// Marca la tarea como completada con su resumen de resultados
    #[must_use]
    pub fn mark_completed(
        &mut self,
        output_path: PathBuf,
        archive_path: Option<PathBuf>,
        detection_count: Option<u64>,
    ) -> bool {
        if !self.advance(TaskStatus::Completed) {
            return false;
        }
        self.progress = 100;
        self.stage = "Task completed successfully".to_string();
        self.output_path = Some(output_path);
        self.result_archive_path = archive_path;
        self.detection_count = detection_count;
        self.has_detections = detection_count.map(|n| n > 0);
        self.completed_at = Some(Utc::now());
        true
    }

    /// Marca la tarea como fallida
    #[must_use]
    pub fn mark_failed(&mut self, error: String) -> bool {
        if !self.advance(TaskStatus::Failed) {
            return false;
        }
        self.fail_with(error);
        true
    }

    /// Falla cualquier tarea no terminal que un reinicio dejó a medias
    ///
    /// Es la única salida hacia `Failed` que no pasa por `Processing`.
    #[must_use]
    pub fn mark_interrupted(&mut self, error: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.fail_with(error);
        true
    }

    fn fail_with(&mut self, error: String) {
        self.stage = format!("Processing failed: {}", error);
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    /// Marca la tarea como cancelada
    #[must_use]
    pub fn mark_cancelled(&mut self) -> bool {
        if !self.advance(TaskStatus::Cancelled) {
            return false;
        }
        self.cancel_requested = true;
        self.progress = 100;
        self.stage = "Cancelled by user".to_string();
        self.error = Some("Cancelled by user".to_string());
        self.completed_at = Some(Utc::now());
        true
    }

    /// Actualiza progreso y etapa
    pub fn update_progress(&mut self, progress: u8, stage: &str) {
        self.progress = progress.min(100);
        self.stage = stage.to_string();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Tiene referencias a resultados que todavía se pueden recuperar
    pub fn has_output_refs(&self) -> bool {
        self.output_path.is_some() || self.result_archive_path.is_some()
    }

    /// Momento a partir del cual corre la retención
    pub fn finished_or_created_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }
}

/// Vista de lectura de una tarea: registro + posición en cola
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub record: TaskRecord,

    /// Definida solo mientras la tarea está `Queued` (1 = siguiente)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from("t-1"),
            "20240101_120000_abcd1234".to_string(),
            PathBuf::from("input/20240101_120000_abcd1234"),
        )
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_state_machine_edges() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Queued));
        assert!(Created.can_transition_to(Queued));
        assert!(!Created.can_transition_to(Processing));
        assert!(!Created.can_transition_to(Cancelled));

        for terminal in [Completed, Failed, Cancelled] {
            for next in [Created, Queued, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_record_lifecycle() {
        let mut task = record();
        assert_eq!(task.status, TaskStatus::Created);
        assert!(!task.status.can_transition_to(TaskStatus::Cancelled));

        assert!(task.mark_queued());
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.status.can_transition_to(TaskStatus::Cancelled));
        assert!(!task.has_output_refs());

        assert!(task.mark_processing(PathBuf::from("run/output/s")));
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.has_output_refs());

        assert!(task.mark_completed(PathBuf::from("run/output/s"), None, Some(3)));
        assert!(task.is_terminal());
        assert_eq!(task.progress, 100);
        assert_eq!(task.has_detections, Some(true));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_cancel_sets_flag() {
        let mut task = record();
        assert!(task.mark_queued());
        assert!(task.mark_cancelled());
        assert!(task.cancel_requested);
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.error.is_some());
    }

    #[test]
    fn test_illegal_marks_leave_record_untouched() {
        let mut task = record();
        assert!(!task.mark_processing(PathBuf::from("run/output/s")));
        assert!(!task.mark_cancelled());
        assert_eq!(task.status, TaskStatus::Created);
        assert!(task.output_path.is_none());
        assert!(!task.cancel_requested);

        assert!(task.mark_queued());
        assert!(!task.mark_queued());
        assert!(!task.mark_completed(PathBuf::from("run/output/s"), None, Some(1)));
        assert!(!task.mark_failed("boom".to_string()));
        assert_eq!(task.status, TaskStatus::Queued);

        assert!(task.mark_processing(PathBuf::from("run/output/s")));
        assert!(task.mark_failed("boom".to_string()));
        let failed = task.clone();

        // terminal es absorbente
        assert!(!task.mark_cancelled());
        assert!(!task.mark_completed(PathBuf::from("run/output/s"), None, Some(1)));
        assert!(!task.mark_interrupted("restart".to_string()));
        assert_eq!(task, failed);
    }

    #[test]
    fn test_interrupt_skips_processing() {
        let mut created = record();
        assert!(created.mark_interrupted("restart".to_string()));
        assert_eq!(created.status, TaskStatus::Failed);
        assert_eq!(created.error.as_deref(), Some("restart"));

        let mut queued = record();
        assert!(queued.mark_queued());
        assert!(queued.mark_interrupted("restart".to_string()));
        assert!(queued.completed_at.is_some());
    }

    #[test]
    fn test_record_tolerates_missing_and_unknown_fields() {
        let json = r#"{
            "id": "abc",
            "status": "completed",
            "output_path": "run/output/x",
            "some_future_field": {"nested": true}
        }"#;
        let task: TaskRecord = serde_json::from_str(json).unwrap();
        assert_eq!(task.id.as_str(), "abc");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 0);
        assert!(task.error.is_none());
        assert!(!task.cancel_requested);
    }

    #[test]
    fn test_param_codes() {
        assert_eq!(InputType::from_code(1), Some(InputType::GeoTiff));
        assert_eq!(InputType::from_code(7), None);
        assert_eq!(OutputFormat::from_code(1).map(|f| f.code()), Some(1));
        assert_eq!(ModelVariant::parse("M"), Some(ModelVariant::M));
        assert_eq!(TaskParams::default().classification_threshold, 0.35);
    }
}
