//! # Pool de Workers
//! src/tasks/pool.rs
//!
//! Número fijo de threads que comparten un canal de trabajos. Cada trabajo
//! devuelve un `ExecutionHandle` que se completa al terminar, haya ido bien,
//! mal o con panic. Un panic no mata al worker.

use crate::error::SchedulerError;
use crate::logging::{LogLevel, TaskLogger};
use crate::tasks::cancel::{lock, ExecutionHandle};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkItem {
    job: Job,
    handle: ExecutionHandle,
}

/// Pool de tamaño fijo
pub struct WorkerPool {
    sender: Mutex<Option<Sender<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Arranca `size` workers
    pub fn new(size: usize, logger: Arc<dyn TaskLogger>) -> Result<Self, SchedulerError> {
        let (tx, rx) = mpsc::channel::<WorkItem>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let name = format!("detect-worker-{}", i);
            let rx = Arc::clone(&rx);
            let logger = Arc::clone(&logger);
            let worker_name = name.clone();

            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(worker_name, rx, logger))
                .map_err(|source| SchedulerError::Spawn { name, source })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Entrega un trabajo al pool
    pub fn submit<F>(&self, job: F) -> Result<ExecutionHandle, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = ExecutionHandle::new();
        let sender = lock(&self.sender);
        let tx = sender.as_ref().ok_or(SchedulerError::ShuttingDown)?;

        tx.send(WorkItem {
            job: Box::new(job),
            handle: handle.clone(),
        })
        .map_err(|_| SchedulerError::ShuttingDown)?;

        Ok(handle)
    }

    /// Cierra el canal y espera a que los workers terminen lo que tienen
    pub fn shutdown(&self) {
        lock(&self.sender).take();

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(name: String, rx: Arc<Mutex<Receiver<WorkItem>>>, logger: Arc<dyn TaskLogger>) {
    logger.system(LogLevel::Debug, &format!("{} started", name));

    loop {
        // El lock se suelta antes de ejecutar el trabajo
        let item = {
            let receiver = lock(&rx);
            receiver.recv()
        };

        let WorkItem { job, handle } = match item {
            Ok(item) => item,
            Err(_) => break,
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            logger.system(LogLevel::Error, &format!("{}: job panicked", name));
        }
        handle.complete();
    }

    logger.system(LogLevel::Debug, &format!("{} stopped", name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{MemoryLogger, NoopLogger};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_runs_jobs_and_completes_handles() {
        let pool = WorkerPool::new(2, Arc::new(NoopLogger)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        for handle in &handles {
            assert!(handle.wait_timeout(Duration::from_secs(5)));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        pool.shutdown();
    }

    #[test]
    fn test_panic_keeps_worker_alive() {
        let logger = Arc::new(MemoryLogger::new());
        let pool = WorkerPool::new(1, logger.clone()).unwrap();

        let bad = pool.submit(|| panic!("boom")).unwrap();
        assert!(bad.wait_timeout(Duration::from_secs(5)));

        let good = pool.submit(|| {}).unwrap();
        assert!(good.wait_timeout(Duration::from_secs(5)));
        assert_eq!(logger.system_messages(LogLevel::Error).len(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = WorkerPool::new(1, Arc::new(NoopLogger)).unwrap();
        pool.shutdown();

        let result = pool.submit(|| {});
        assert!(matches!(result, Err(SchedulerError::ShuttingDown)));
    }
}
