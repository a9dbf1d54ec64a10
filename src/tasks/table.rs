//! # Tabla de Tareas
//! src/tasks/table.rs
//!
//! Estado vivo de todas las tareas detrás de un único mutex. Cada entrada
//! guarda el registro persistible más los handles que nunca van a disco.
//!
//! La posición en cola se calcula al leer a partir del número de admisión,
//! así que encolar o sacar una tarea no obliga a renumerar las demás.

use crate::tasks::cancel::{lock, CancellationToken, ExecutionHandle};
use crate::tasks::types::{TaskId, TaskRecord, TaskStatus, TaskView};
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Entrada viva de una tarea
#[derive(Debug)]
pub struct TaskEntry {
    pub record: TaskRecord,

    /// Handle de cancelación (solo en memoria)
    pub cancel: CancellationToken,

    /// Ejecución en vuelo, si la tarea llegó a un worker
    pub execution: Option<ExecutionHandle>,

    /// Número de orden de admisión; `None` hasta que pasa por la cola
    pub admitted_seq: Option<u64>,
}

impl TaskEntry {
    pub fn new(record: TaskRecord) -> Self {
        Self {
            record,
            cancel: CancellationToken::new(),
            execution: None,
            admitted_seq: None,
        }
    }

    /// Hay un worker que todavía referencia la tarea
    pub fn has_running_execution(&self) -> bool {
        self.execution
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

/// Copia de los registros persistibles con la revisión de la tabla
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub revision: u64,
    pub records: Vec<TaskRecord>,
}

/// Contenido protegido por el mutex de la tabla
#[derive(Debug, Default)]
pub struct TableState {
    pub tasks: HashMap<TaskId, TaskEntry>,

    /// Tareas que ocupan un slot del pool
    pub active: HashSet<TaskId>,

    next_seq: u64,
    revision: u64,
}

impl TableState {
    /// Registra una mutación; cada snapshot lleva la revisión en que se tomó
    pub fn touch(&mut self) {
        self.revision += 1;
    }

    pub fn next_admission_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Cuenta por estado escaneando los registros
    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .values()
            .filter(|e| e.record.status == status)
            .count()
    }

    /// IDs en un estado, en orden FIFO para `Queued`
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        let mut entries: Vec<&TaskEntry> = self
            .tasks
            .values()
            .filter(|e| e.record.status == status)
            .collect();
        entries.sort_by_key(|e| (e.admitted_seq.unwrap_or(u64::MAX), e.record.created_at));
        entries.into_iter().map(|e| e.record.id.clone()).collect()
    }

    /// Posición 1-based en la cola; `None` si la tarea no está `Queued`
    pub fn queue_position(&self, id: &TaskId) -> Option<usize> {
        let entry = self.tasks.get(id)?;
        if entry.record.status != TaskStatus::Queued {
            return None;
        }
        let seq = entry.admitted_seq?;

        let ahead = self
            .tasks
            .values()
            .filter(|e| e.record.status == TaskStatus::Queued)
            .filter_map(|e| e.admitted_seq)
            .filter(|other| *other < seq)
            .count();

        Some(ahead + 1)
    }

    pub fn view(&self, id: &TaskId) -> Option<TaskView> {
        self.tasks.get(id).map(|entry| TaskView {
            record: entry.record.clone(),
            queue_position: self.queue_position(id),
        })
    }

    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            revision: self.revision,
            records: self.tasks.values().map(|e| e.record.clone()).collect(),
        }
    }

    /// Sesiones que pertenecen a tareas vivas o con ejecución pendiente
    pub fn protected_sessions(&self) -> HashSet<String> {
        self.tasks
            .values()
            .filter(|e| !e.record.is_terminal() || e.has_running_execution())
            .filter_map(|e| e.record.session_id.clone())
            .collect()
    }
}

/// Tabla de tareas compartida
#[derive(Debug, Default)]
pub struct TaskTable {
    state: Mutex<TableState>,

    /// Se notifica cuando se libera un slot o cambia una tarea en espera
    slot_freed: Condvar,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, TableState> {
        lock(&self.state)
    }

    /// Espera un aviso de slot libre, como mucho `timeout`
    pub fn wait_for_slot<'a>(
        &self,
        guard: MutexGuard<'a, TableState>,
        timeout: Duration,
    ) -> MutexGuard<'a, TableState> {
        match self.slot_freed.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub fn notify_slot(&self) {
        self.slot_freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(id: &str, seq: Option<u64>) -> TaskEntry {
        let mut entry = TaskEntry::new(TaskRecord::new(
            TaskId::from(id),
            format!("20240101_120000_{}", id),
            PathBuf::from(id),
        ));
        if seq.is_some() {
            assert!(entry.record.mark_queued());
        }
        entry.admitted_seq = seq;
        entry
    }

    fn state_with(entries: Vec<TaskEntry>) -> TableState {
        let mut state = TableState::default();
        for e in entries {
            state.tasks.insert(e.record.id.clone(), e);
        }
        state
    }

    #[test]
    fn test_queue_positions_follow_admission_order() {
        let state = state_with(vec![entry("c", Some(3)), entry("a", Some(1)), entry("b", Some(2))]);

        assert_eq!(state.queue_position(&TaskId::from("a")), Some(1));
        assert_eq!(state.queue_position(&TaskId::from("b")), Some(2));
        assert_eq!(state.queue_position(&TaskId::from("c")), Some(3));
        assert_eq!(
            state.ids_with_status(TaskStatus::Queued),
            vec![TaskId::from("a"), TaskId::from("b"), TaskId::from("c")]
        );
    }

    #[test]
    fn test_position_shifts_when_head_leaves() {
        let mut state = state_with(vec![entry("a", Some(1)), entry("b", Some(2))]);
        if let Some(head) = state.tasks.get_mut(&TaskId::from("a")) {
            assert!(head.record.mark_processing(PathBuf::from("out/a")));
        }

        assert_eq!(state.queue_position(&TaskId::from("a")), None);
        assert_eq!(state.queue_position(&TaskId::from("b")), Some(1));
    }

    #[test]
    fn test_unadmitted_task_has_no_position() {
        let state = state_with(vec![entry("a", None), entry("b", Some(1))]);
        assert_eq!(state.queue_position(&TaskId::from("a")), None);
        assert_eq!(state.queue_position(&TaskId::from("b")), Some(1));
        assert_eq!(state.count_status(TaskStatus::Created), 1);
        assert_eq!(state.count_status(TaskStatus::Queued), 1);
        assert_eq!(state.ids_with_status(TaskStatus::Queued), vec![TaskId::from("b")]);
    }

    #[test]
    fn test_snapshot_carries_revision() {
        let mut state = state_with(vec![entry("a", Some(1))]);
        state.touch();
        state.touch();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.revision, 2);
        assert_eq!(snapshot.records.len(), 1);
    }

    #[test]
    fn test_protected_sessions_include_running_cancelled() {
        let mut done = entry("done", Some(2));
        assert!(done.record.mark_processing(PathBuf::from("out/done")));
        assert!(done.record.mark_cancelled());
        done.execution = Some(ExecutionHandle::new());

        let mut finished = entry("old", Some(3));
        assert!(finished.record.mark_processing(PathBuf::from("out/old")));
        assert!(finished.record.mark_failed("boom".to_string()));

        let state = state_with(vec![done, finished, entry("q", Some(1))]);
        let protected = state.protected_sessions();

        assert!(protected.contains("20240101_120000_done"));
        assert!(protected.contains("20240101_120000_q"));
        assert!(!protected.contains("20240101_120000_old"));
    }
}
