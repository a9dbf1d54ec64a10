//! # Sesiones de Trabajo en Disco
//! src/pipeline/sessions.rs
//!
//! Cada tarea trabaja en su propia sesión: `<input_root>/<id>`,
//! `<extract_root>/<id>`, `<output_root>/<id>` y el archivo
//! `<output_root>/<id>.zip`. El ID empieza por `YYYYmmdd_HHMMSS` para que
//! el sweeper pueda calcular la edad sin mirar el disco.

use crate::logging::TaskLogger;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Formato del prefijo temporal del ID de sesión
const SESSION_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Sesión recién creada
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Raíces de los directorios de sesión
#[derive(Debug, Clone)]
pub struct SessionLayout {
    pub input_root: PathBuf,
    pub extract_root: PathBuf,
    pub output_root: PathBuf,
}

impl SessionLayout {
    pub fn new(
        input_root: impl Into<PathBuf>,
        extract_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input_root: input_root.into(),
            extract_root: extract_root.into(),
            output_root: output_root.into(),
        }
    }

    /// Crea un par de directorios (entrada, salida) con un ID nuevo
    pub fn create(&self) -> io::Result<Session> {
        let uuid = Uuid::new_v4().simple().to_string();
        let id = format!("{}_{}", Local::now().format(SESSION_TS_FORMAT), &uuid[..8]);

        let input_dir = self.input_dir(&id);
        let output_dir = self.output_dir(&id);
        fs::create_dir_all(&input_dir)?;
        fs::create_dir_all(&output_dir)?;

        Ok(Session {
            id,
            input_dir,
            output_dir,
        })
    }

    pub fn input_dir(&self, session_id: &str) -> PathBuf {
        self.input_root.join(session_id)
    }

    pub fn extract_dir(&self, session_id: &str) -> PathBuf {
        self.extract_root.join(session_id)
    }

    pub fn output_dir(&self, session_id: &str) -> PathBuf {
        self.output_root.join(session_id)
    }

    pub fn archive_path(&self, session_id: &str) -> PathBuf {
        self.output_root.join(format!("{}.zip", session_id))
    }

    /// Todas las rutas que pertenecen a una sesión
    pub fn session_paths(&self, session_id: &str) -> [PathBuf; 4] {
        [
            self.input_dir(session_id),
            self.extract_dir(session_id),
            self.output_dir(session_id),
            self.archive_path(session_id),
        ]
    }

    /// Borra todo lo que pertenece a una sesión.
    ///
    /// Los errores se registran y no se propagan. Devuelve cuántas rutas
    /// se borraron.
    pub fn remove(&self, session_id: &str, logger: &dyn TaskLogger) -> usize {
        self.session_paths(session_id)
            .iter()
            .filter(|path| remove_path(path, logger))
            .count()
    }
}

/// Borra un archivo o directorio si existe; `true` si lo borró
pub fn remove_path(path: &Path, logger: &dyn TaskLogger) -> bool {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            logger.cleanup(path, "removed");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            logger.cleanup(path, &format!("failed: {}", e));
            false
        }
    }
}

/// Extrae el timestamp embebido en un ID de sesión (o nombre de archivo).
///
/// `20240131_235959_ab12cd34` y `20240131_235959_ab12cd34.zip` dan la misma
/// fecha; cualquier otro formato da `None`.
pub fn parse_session_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let mut parts = name.split('_');
    let date = parts.next()?;
    let time = parts.next()?;
    let time = time.split('.').next()?;

    let naive = NaiveDateTime::parse_from_str(&format!("{}_{}", date, time), SESSION_TS_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{MemoryLogger, NoopLogger};
    use tempfile::tempdir;

    fn layout(root: &Path) -> SessionLayout {
        SessionLayout::new(root.join("input"), root.join("extract"), root.join("output"))
    }

    #[test]
    fn test_create_session() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());

        let session = layout.create().unwrap();
        assert!(session.input_dir.is_dir());
        assert!(session.output_dir.is_dir());
        assert!(parse_session_timestamp(&session.id).is_some());

        let other = layout.create().unwrap();
        assert_ne!(session.id, other.id);
    }

    #[test]
    fn test_remove_session() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        let session = layout.create().unwrap();

        fs::create_dir_all(layout.extract_dir(&session.id)).unwrap();
        fs::write(session.input_dir.join("image.jpg"), b"jpg").unwrap();
        fs::write(layout.archive_path(&session.id), b"zip").unwrap();

        let logger = MemoryLogger::new();
        assert_eq!(layout.remove(&session.id, &logger), 4);
        for path in layout.session_paths(&session.id) {
            assert!(!path.exists());
        }
        assert_eq!(logger.events().len(), 4);

        // Segunda vez no hay nada que borrar
        assert_eq!(layout.remove(&session.id, &NoopLogger), 0);
    }

    #[test]
    fn test_parse_session_timestamp() {
        let ts = parse_session_timestamp("20240131_235959_ab12cd34").unwrap();
        let local = ts.with_timezone(&Local);
        assert_eq!(local.format("%Y%m%d_%H%M%S").to_string(), "20240131_235959");

        assert_eq!(
            parse_session_timestamp("20240131_235959_ab12cd34.zip"),
            Some(ts)
        );
        assert!(parse_session_timestamp("random-folder").is_none());
        assert!(parse_session_timestamp("2024_notatime_x").is_none());
    }
}
