//! # Persistencia del Snapshot de Tareas
//! src/tasks/storage.rs
//!
//! Cada mutación de la tabla escribe el documento completo (id → registro)
//! a un archivo JSON. La escritura va a un temporal y luego se renombra.
//!
//! Al arrancar el documento se carga entero. Los registros que no están en
//! la tabla viva quedan "dormidos" aquí hasta que alguien los consulta, los
//! expira el sweeper o se descartan.

use crate::error::PersistenceError;
use crate::logging::{LogLevel, TaskLogger};
use crate::tasks::cancel::lock;
use crate::tasks::table::TableSnapshot;
use crate::tasks::types::{TaskId, TaskRecord};
use chrono::{DateTime, Local, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Mensaje con el que se cierran las tareas cortadas por un reinicio
pub const INTERRUPTED_BY_RESTART: &str = "Interrupted by server restart";

#[derive(Debug, Default)]
struct StoreState {
    /// Registros que solo existen en disco
    dormant: HashMap<TaskId, TaskRecord>,

    /// Revisión de la tabla del último snapshot escrito
    last_revision: Option<u64>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError {
    let path = path.to_path_buf();
    move |source| PersistenceError::Io { path, source }
}

/// Store del snapshot en disco
pub struct SnapshotStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    logger: Arc<dyn TaskLogger>,
}

impl SnapshotStore {
    /// Abre el store y carga el snapshot existente.
    ///
    /// Un documento ilegible se renombra a `<path>.corrupt-<timestamp>` y
    /// se arranca con la tabla vacía.
    pub fn open(path: impl Into<PathBuf>, logger: Arc<dyn TaskLogger>) -> Self {
        let path = path.into();
        let dormant = Self::load(&path, logger.as_ref());

        Self {
            path,
            state: Mutex::new(StoreState {
                dormant,
                last_revision: None,
            }),
            logger,
        }
    }

    fn load(path: &Path, logger: &dyn TaskLogger) -> HashMap<TaskId, TaskRecord> {
        if !path.exists() {
            return HashMap::new();
        }

        let document = File::open(path)
            .map_err(|e| e.to_string())
            .and_then(|file| {
                serde_json::from_reader::<_, Value>(BufReader::new(file)).map_err(|e| e.to_string())
            });

        let entries = match document {
            Ok(Value::Object(entries)) => entries,
            Ok(_) => {
                Self::quarantine(path, "top-level value is not an object", logger);
                return HashMap::new();
            }
            Err(e) => {
                Self::quarantine(path, &e, logger);
                return HashMap::new();
            }
        };

        let mut records = HashMap::with_capacity(entries.len());
        for (key, value) in entries {
            // Registro por registro: uno malo no tira el resto
            match serde_json::from_value::<TaskRecord>(value) {
                Ok(record) => {
                    records.insert(record.id.clone(), record);
                }
                Err(e) => logger.system(
                    LogLevel::Warn,
                    &format!("skipping malformed snapshot record {}: {}", key, e),
                ),
            }
        }

        logger.system(
            LogLevel::Info,
            &format!("loaded {} task records from {}", records.len(), path.display()),
        );
        records
    }

    /// Aparta un snapshot corrupto
    fn quarantine(path: &Path, reason: &str, logger: &dyn TaskLogger) {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let mut aside = path.as_os_str().to_owned();
        aside.push(format!(".corrupt-{}", stamp));
        let aside = PathBuf::from(aside);

        match fs::rename(path, &aside) {
            Ok(()) => logger.system(
                LogLevel::Warn,
                &format!(
                    "snapshot {} is corrupt ({}); moved to {}, starting empty",
                    path.display(),
                    reason,
                    aside.display()
                ),
            ),
            Err(e) => logger.system(
                LogLevel::Error,
                &format!(
                    "snapshot {} is corrupt ({}) and could not be moved aside: {}",
                    path.display(),
                    reason,
                    e
                ),
            ),
        }
    }

    /// Cierra como `Failed` las tareas que estaban a medias en disco.
    ///
    /// Devuelve los IDs afectados; el llamador decide cuándo persistir.
    pub fn interrupt_unfinished(&self) -> Vec<TaskId> {
        let mut state = lock(&self.state);
        let mut interrupted = Vec::new();

        for record in state.dormant.values_mut() {
            if record.mark_interrupted(INTERRUPTED_BY_RESTART.to_string()) {
                interrupted.push(record.id.clone());
            }
        }

        interrupted
    }

    /// Escribe el documento completo: registros dormidos más la tabla viva.
    ///
    /// Un snapshot con revisión anterior a la ya escrita se descarta.
    pub fn save(&self, snapshot: &TableSnapshot) -> Result<(), PersistenceError> {
        let mut state = lock(&self.state);

        if let Some(last) = state.last_revision {
            if snapshot.revision < last {
                return Ok(());
            }
        }

        let mut document: BTreeMap<&TaskId, &TaskRecord> = state.dormant.iter().collect();
        for record in &snapshot.records {
            document.insert(&record.id, record);
        }

        self.write_atomic(&document)?;
        let written = document.len();
        state.last_revision = Some(snapshot.revision);

        self.logger.system(
            LogLevel::Debug,
            &format!("snapshot rev {} written ({} records)", snapshot.revision, written),
        );

        Ok(())
    }

    fn write_atomic(&self, document: &BTreeMap<&TaskId, &TaskRecord>) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }

        // Crear archivo temporal primero (atomic write)
        let mut temp_path = self.path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let file = File::create(&temp_path).map_err(io_err(&temp_path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, document)?;
        writer.flush().map_err(io_err(&temp_path))?;

        // Renombrar (atómico en sistemas Unix)
        fs::rename(&temp_path, &self.path).map_err(io_err(&self.path))?;

        Ok(())
    }

    /// Registro dormido por ID (sin sacarlo)
    pub fn dormant(&self, id: &TaskId) -> Option<TaskRecord> {
        lock(&self.state).dormant.get(id).cloned()
    }

    /// Saca un registro dormido para reintroducirlo en la tabla
    pub fn take_dormant(&self, id: &TaskId) -> Option<TaskRecord> {
        lock(&self.state).dormant.remove(id)
    }

    pub fn dormant_count(&self) -> usize {
        lock(&self.state).dormant.len()
    }

    /// Olvida registros desalojados por el sweeper
    pub fn forget(&self, ids: &[TaskId]) {
        let mut state = lock(&self.state);
        for id in ids {
            state.dormant.remove(id);
        }
    }

    /// Expira registros dormidos terminados antes de `cutoff`
    pub fn expire_dormant(&self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        let mut state = lock(&self.state);

        let expired: Vec<TaskId> = state
            .dormant
            .values()
            .filter(|r| r.is_terminal() && r.finished_or_created_at() < cutoff)
            .map(|r| r.id.clone())
            .collect();

        for id in &expired {
            state.dormant.remove(id);
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{MemoryLogger, NoopLogger};
    use crate::tasks::types::TaskStatus;
    use chrono::Duration;
    use tempfile::tempdir;

    fn created(id: &str) -> TaskRecord {
        TaskRecord::new(
            TaskId::from(id),
            format!("20240101_120000_{}", id),
            PathBuf::from(format!("input/{}", id)),
        )
    }

    fn record(id: &str) -> TaskRecord {
        let mut record = created(id);
        assert!(record.mark_queued());
        record
    }

    fn failed(id: &str, error: &str) -> TaskRecord {
        let mut record = record(id);
        assert!(record.mark_processing(PathBuf::from(format!("output/{}", id))));
        assert!(record.mark_failed(error.to_string()));
        record
    }

    fn snapshot(revision: u64, records: Vec<TaskRecord>) -> TableSnapshot {
        TableSnapshot { revision, records }
    }

    // ===== Round-trip =====

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let mut done = record("done");
        assert!(done.mark_processing(PathBuf::from("output/done")));
        assert!(done.mark_completed(
            PathBuf::from("output/done"),
            Some(PathBuf::from("output/done.zip")),
            Some(4)
        ));

        let failed = failed("failed", "model crashed");

        let queued = record("queued");

        let store = SnapshotStore::open(&path, Arc::new(NoopLogger));
        store
            .save(&snapshot(1, vec![done.clone(), failed.clone(), queued.clone()]))
            .unwrap();

        let reopened = SnapshotStore::open(&path, Arc::new(NoopLogger));
        assert_eq!(reopened.dormant(&done.id), Some(done));
        assert_eq!(reopened.dormant(&failed.id), Some(failed));
        assert_eq!(reopened.dormant(&queued.id), Some(queued));
        assert!(reopened.dormant(&TaskId::from("nope")).is_none());
    }

    #[test]
    fn test_dormant_records_survive_saves() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let old = failed("old", "x");
        SnapshotStore::open(&path, Arc::new(NoopLogger))
            .save(&snapshot(1, vec![old.clone()]))
            .unwrap();

        let store = SnapshotStore::open(&path, Arc::new(NoopLogger));
        store.save(&snapshot(1, vec![record("new")])).unwrap();

        let reopened = SnapshotStore::open(&path, Arc::new(NoopLogger));
        assert_eq!(reopened.dormant_count(), 2);
        assert!(reopened.dormant(&old.id).is_some());
    }

    #[test]
    fn test_stale_revision_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let store = SnapshotStore::open(&path, Arc::new(NoopLogger));

        let mut newer = record("a");
        assert!(newer.mark_cancelled());
        store.save(&snapshot(5, vec![newer])).unwrap();
        store.save(&snapshot(3, vec![record("a")])).unwrap();

        let reopened = SnapshotStore::open(&path, Arc::new(NoopLogger));
        let loaded = reopened.dormant(&TaskId::from("a")).unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
    }

    // ===== Tolerancia =====

    #[test]
    fn test_corrupt_snapshot_is_moved_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, "{ not json").unwrap();

        let logger = Arc::new(MemoryLogger::new());
        let store = SnapshotStore::open(&path, logger.clone());

        assert_eq!(store.dormant_count(), 0);
        assert!(!path.exists());

        let moved: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tasks.json.corrupt-"))
            .collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(logger.system_messages(LogLevel::Warn).len(), 1);
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(
            &path,
            r#"{
                "good": {"id": "good", "status": "completed", "extra": 1},
                "bad": {"id": "bad", "status": "exploded"}
            }"#,
        )
        .unwrap();

        let store = SnapshotStore::open(&path, Arc::new(NoopLogger));
        assert_eq!(store.dormant_count(), 1);
        assert!(store.dormant(&TaskId::from("good")).is_some());
        assert!(path.exists());
    }

    // ===== Reinicio y expiración =====

    #[test]
    fn test_interrupt_unfinished() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let mut running = record("running");
        assert!(running.mark_processing(PathBuf::from("output/running")));
        let mut done = record("done");
        assert!(done.mark_cancelled());
        SnapshotStore::open(&path, Arc::new(NoopLogger))
            .save(&snapshot(
                1,
                vec![running, done, record("queued"), created("created")],
            ))
            .unwrap();

        let store = SnapshotStore::open(&path, Arc::new(NoopLogger));
        let mut interrupted = store.interrupt_unfinished();
        interrupted.sort();
        assert_eq!(
            interrupted,
            vec![
                TaskId::from("created"),
                TaskId::from("queued"),
                TaskId::from("running")
            ]
        );
        assert_eq!(
            store.dormant(&TaskId::from("queued")).unwrap().status,
            TaskStatus::Failed
        );

        let running = store.dormant(&TaskId::from("running")).unwrap();
        assert_eq!(running.status, TaskStatus::Failed);
        assert_eq!(running.error.as_deref(), Some(INTERRUPTED_BY_RESTART));
        assert_eq!(
            store.dormant(&TaskId::from("done")).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn test_expire_and_forget() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let mut old = failed("old", "x");
        old.completed_at = Some(Utc::now() - Duration::hours(5));
        let fresh = failed("fresh", "y");
        SnapshotStore::open(&path, Arc::new(NoopLogger))
            .save(&snapshot(1, vec![old, fresh, record("other")]))
            .unwrap();

        let store = SnapshotStore::open(&path, Arc::new(NoopLogger));
        let expired = store.expire_dormant(Utc::now() - Duration::hours(2));
        assert_eq!(expired, vec![TaskId::from("old")]);

        store.forget(&[TaskId::from("fresh")]);
        assert_eq!(store.dormant_count(), 1);
        assert!(store.take_dormant(&TaskId::from("other")).is_some());
        assert_eq!(store.dormant_count(), 0);
    }

    #[test]
    fn test_save_creates_parent_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("run").join("tasks.json");

        let store = SnapshotStore::open(&path, Arc::new(NoopLogger));
        store.save(&snapshot(0, vec![record("a")])).unwrap();
        assert!(path.exists());
    }
}
