//! # Configuración del Planificador
//! src/config.rs
//!
//! Configuración por argumentos CLI con fallback a variables de entorno.
//!
//! ## Ejemplos de uso
//!
//! ### CLI
//! ```bash
//! ./detect_queue --max-workers 4 \
//!   --queue-capacity 20 \
//!   --pipeline-program python3 --pipeline-arg main.py \
//!   --input-type 1 --model s \
//!   ortho_a.tif ortho_b.tif
//! ```
//!
//! ### Variables de entorno
//! ```bash
//! DETECT_MAX_WORKERS=2 DETECT_LOG_LEVEL=debug ./detect_queue image.zip
//! ```

use crate::tasks::types::{InputType, ModelVariant, OutputFormat, TaskParams};
use clap::Parser;
use std::path::PathBuf;

/// Configuración del planificador de detección
#[derive(Debug, Clone, Parser)]
#[command(name = "detect_queue")]
#[command(about = "Planificador de trabajos de detección con admisión acotada y cancelación cooperativa")]
#[command(version = "0.1.0")]
pub struct Config {
    // === Workers y Cola ===

    /// Máximo de tareas procesándose a la vez
    #[arg(long = "max-workers", default_value = "5", env = "DETECT_MAX_WORKERS")]
    pub max_workers: usize,

    /// Máximo de tareas admitidas esperando worker
    #[arg(long = "queue-capacity", default_value = "10", env = "DETECT_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    // === Directorios ===

    /// Raíz de los directorios de entrada por sesión
    #[arg(long = "input-dir", default_value = "input", env = "DETECT_INPUT_DIR")]
    pub input_dir: String,

    /// Raíz de los directorios intermedios (extracción, tiles)
    #[arg(long = "extract-dir", default_value = "run/extract", env = "DETECT_EXTRACT_DIR")]
    pub extract_dir: String,

    /// Raíz de los directorios de salida
    #[arg(long = "output-dir", default_value = "run/output", env = "DETECT_OUTPUT_DIR")]
    pub output_dir: String,

    /// Ruta del snapshot de tareas
    #[arg(long = "snapshot-path", default_value = "run/tasks.json", env = "DETECT_SNAPSHOT_PATH")]
    pub snapshot_path: String,

    // === Retención ===

    /// Segundos que se conserva una tarea terminada
    #[arg(long = "task-retention-secs", default_value = "7200", env = "DETECT_TASK_RETENTION_SECS")]
    pub task_retention_secs: u64,

    /// Edad máxima (segundos) de entradas y extracciones
    #[arg(long = "input-max-age-secs", default_value = "7200", env = "DETECT_INPUT_MAX_AGE_SECS")]
    pub input_max_age_secs: u64,

    /// Edad máxima (segundos) de salidas y zips
    #[arg(long = "output-max-age-secs", default_value = "14400", env = "DETECT_OUTPUT_MAX_AGE_SECS")]
    pub output_max_age_secs: u64,

    /// Intervalo (segundos) entre ciclos del sweeper
    #[arg(long = "sweep-interval-secs", default_value = "1800", env = "DETECT_SWEEP_INTERVAL_SECS")]
    pub sweep_interval_secs: u64,

    /// Espera (ms) sobre la ejecución al cancelar una tarea en proceso
    #[arg(long = "cancel-grace-ms", default_value = "1000", env = "DETECT_CANCEL_GRACE_MS")]
    pub cancel_grace_ms: u64,

    // === Pipeline ===

    /// Programa que ejecuta el detector
    #[arg(long = "pipeline-program", default_value = "python3", env = "DETECT_PIPELINE_PROGRAM")]
    pub pipeline_program: String,

    /// Argumentos previos a los flags de la tarea (repetible)
    #[arg(long = "pipeline-arg", default_value = "main.py", allow_hyphen_values = true)]
    pub pipeline_args: Vec<String>,

    // === Parámetros por defecto de las tareas ===

    /// 0 = imagen + world file, 1 = GeoTIFF
    #[arg(long = "input-type", default_value = "0", env = "DETECT_INPUT_TYPE")]
    pub input_type: u8,

    #[arg(long = "classification-threshold", default_value = "0.35", env = "DETECT_CLASSIFICATION_THRESHOLD")]
    pub classification_threshold: f32,

    #[arg(long = "prediction-threshold", default_value = "0.5", env = "DETECT_PREDICTION_THRESHOLD")]
    pub prediction_threshold: f32,

    /// Guardar la imagen con las detecciones dibujadas
    #[arg(long = "save-labeled-image", env = "DETECT_SAVE_LABELED_IMAGE")]
    pub save_labeled_image: bool,

    /// 0 = JSON, 1 = TXT
    #[arg(long = "output-type", default_value = "0", env = "DETECT_OUTPUT_TYPE")]
    pub output_type: u8,

    /// Variante del modelo: n, s, m, l
    #[arg(long = "model", default_value = "n", env = "DETECT_MODEL")]
    pub model: String,

    // === Logging ===

    /// Filtro de tracing; RUST_LOG tiene prioridad
    #[arg(long = "log-level", default_value = "info", env = "DETECT_LOG_LEVEL")]
    pub log_level: String,

    /// Logs en formato JSON
    #[arg(long = "log-json", env = "DETECT_LOG_JSON")]
    pub log_json: bool,

    /// Archivos o directorios a procesar, uno por tarea
    pub inputs: Vec<PathBuf>,
}

impl Config {
    /// Crea una nueva configuración parseando argumentos CLI
    pub fn new() -> Self {
        Config::parse()
    }

    /// Valida la configuración
    ///
    /// Retorna errores si hay valores inválidos
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("Max workers must be >= 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("Queue capacity must be >= 1".to_string());
        }

        if self.sweep_interval_secs == 0 {
            return Err("Sweep interval must be > 0".to_string());
        }
        if self.task_retention_secs == 0 {
            return Err("Task retention must be > 0".to_string());
        }

        for (name, value) in [
            ("Classification threshold", self.classification_threshold),
            ("Prediction threshold", self.prediction_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be between 0 and 1", name));
            }
        }

        self.task_params().map(|_| ())
    }

    /// Parámetros por defecto para las tareas de esta ejecución
    pub fn task_params(&self) -> Result<TaskParams, String> {
        Ok(TaskParams {
            input_type: InputType::from_code(self.input_type)
                .ok_or_else(|| format!("Input type must be 0 or 1, got {}", self.input_type))?,
            classification_threshold: self.classification_threshold,
            prediction_threshold: self.prediction_threshold,
            save_labeled_image: self.save_labeled_image,
            output_format: OutputFormat::from_code(self.output_type)
                .ok_or_else(|| format!("Output type must be 0 or 1, got {}", self.output_type))?,
            model: ModelVariant::parse(&self.model)
                .ok_or_else(|| format!("Model must be one of n, s, m, l, got '{}'", self.model))?,
        })
    }

    /// Imprime un resumen de la configuración
    pub fn print_summary(&self) {
        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║              Detect Queue Configuration                      ║");
        println!("╚══════════════════════════════════════════════════════════════╝");
        println!();
        println!("👷 Workers & Queue:");
        println!("   Max workers:    {}", self.max_workers);
        println!("   Queue capacity: {}", self.queue_capacity);
        println!("   Cancel grace:   {} ms", self.cancel_grace_ms);
        println!();
        println!("📁 Directories:");
        println!("   Input:          {}", self.input_dir);
        println!("   Extract:        {}", self.extract_dir);
        println!("   Output:         {}", self.output_dir);
        println!("   Snapshot:       {}", self.snapshot_path);
        println!();
        println!("🔬 Pipeline:");
        println!("   Command:        {} {}", self.pipeline_program, self.pipeline_args.join(" "));
        println!(
            "   Params:         input_type={} cls={} pred={} labeled={} output_type={} model={}",
            self.input_type,
            self.classification_threshold,
            self.prediction_threshold,
            self.save_labeled_image,
            self.output_type,
            self.model
        );
        println!();
        println!("🧹 Maintenance:");
        println!(
            "   Task retention: {} seconds ({:.1} hours)",
            self.task_retention_secs,
            self.task_retention_secs as f64 / 3600.0
        );
        println!(
            "   Input age:      {:.1} h, output age: {:.1} h, sweep every {} s",
            self.input_max_age_secs as f64 / 3600.0,
            self.output_max_age_secs as f64 / 3600.0,
            self.sweep_interval_secs
        );
        println!();
        println!("═══════════════════════════════════════════════════════════════");
        println!();
    }
}

impl Default for Config {
    /// Configuración por defecto
    fn default() -> Self {
        Self {
            max_workers: 5,
            queue_capacity: 10,
            input_dir: "input".to_string(),
            extract_dir: "run/extract".to_string(),
            output_dir: "run/output".to_string(),
            snapshot_path: "run/tasks.json".to_string(),
            task_retention_secs: 7200,
            input_max_age_secs: 7200,
            output_max_age_secs: 14_400,
            sweep_interval_secs: 1800,
            cancel_grace_ms: 1000,
            pipeline_program: "python3".to_string(),
            pipeline_args: vec!["main.py".to_string()],
            input_type: 0,
            classification_threshold: 0.35,
            prediction_threshold: 0.5,
            save_labeled_image: false,
            output_type: 0,
            model: "n".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            inputs: Vec::new(),
        }
    }
}
