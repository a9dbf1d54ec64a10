//! # Cola de Admisión
//! src/tasks/queue.rs
//!
//! Cola FIFO acotada y thread-safe. Es el único canal entre quienes
//! encolan tareas y el dispatcher.

use crate::error::SchedulerError;
use crate::tasks::cancel::lock;
use crate::tasks::types::{QueueDescriptor, TaskId};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Elemento de la cola
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    Task(QueueDescriptor),

    /// Centinela de apagado para el dispatcher
    Shutdown,
}

/// Cola FIFO acotada
#[derive(Clone)]
pub struct AdmissionQueue {
    items: Arc<Mutex<VecDeque<QueueItem>>>,

    /// Condvar para despertar al dispatcher
    condvar: Arc<Condvar>,

    /// Capacidad máxima de la cola
    max_capacity: usize,
}

impl AdmissionQueue {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            items: Arc::new(Mutex::new(VecDeque::with_capacity(max_capacity))),
            condvar: Arc::new(Condvar::new()),
            max_capacity,
        }
    }

    /// Encola un descriptor
    ///
    /// Falla con `Admission` si la cola ya tiene `max_capacity` tareas
    pub fn push(&self, descriptor: QueueDescriptor) -> Result<(), SchedulerError> {
        let mut items = lock(&self.items);

        if Self::task_count(&items) >= self.max_capacity {
            return Err(SchedulerError::Admission {
                capacity: self.max_capacity,
            });
        }

        items.push_back(QueueItem::Task(descriptor));
        self.condvar.notify_one();

        Ok(())
    }

    /// Encola el centinela de apagado; no cuenta contra la capacidad
    pub fn push_shutdown(&self) {
        let mut items = lock(&self.items);
        items.push_back(QueueItem::Shutdown);
        self.condvar.notify_all();
    }

    /// Desencola el elemento más antiguo
    ///
    /// Bloquea como mucho `timeout`; `None` si no llegó nada
    pub fn pop_timeout(&self, timeout: Duration) -> Option<QueueItem> {
        let deadline = Instant::now() + timeout;
        let mut items = lock(&self.items);

        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            items = match self.condvar.wait_timeout(items, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Quita el descriptor de una tarea (cancelación antes del dispatch)
    pub fn remove(&self, task_id: &TaskId) -> Option<QueueDescriptor> {
        let mut items = lock(&self.items);

        let idx = items.iter().position(|item| match item {
            QueueItem::Task(desc) => &desc.task_id == task_id,
            QueueItem::Shutdown => false,
        })?;

        match items.remove(idx) {
            Some(QueueItem::Task(desc)) => Some(desc),
            _ => None,
        }
    }

    /// Número de descriptores de tarea en la cola
    #[cfg(test)]
    fn len(&self) -> usize {
        Self::task_count(&lock(&self.items))
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    fn task_count(items: &VecDeque<QueueItem>) -> usize {
        items
            .iter()
            .filter(|item| matches!(item, QueueItem::Task(_)))
            .count()
    }
}
