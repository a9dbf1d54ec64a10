//! # Primitivas de Cancelación y Apagado
//! src/tasks/cancel.rs
//!
//! - `CancellationToken`: bandera compartida entre la tabla y el worker.
//! - `ExecutionHandle`: latch que se completa cuando el worker suelta la tarea.
//! - `ShutdownSignal`: aviso de apagado con sleep interrumpible.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Tamaño máximo de cada tramo de sleep del sweeper
pub const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(60);

/// Adquiere un lock recuperándose de un mutex envenenado.
///
/// Ninguna sección crítica deja el estado a medias, así que el contenido
/// sigue siendo válido aunque otro thread haya hecho panic con el lock.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Token de cancelación cooperativa
///
/// Es la única fuente de verdad de la cancelación en tiempo de ejecución.
/// Una vez cancelado no vuelve atrás.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marca el token. Devuelve `true` solo en la primera llamada.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Handle de una ejecución en vuelo
#[derive(Debug, Clone, Default)]
pub struct ExecutionHandle {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl ExecutionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lo llama el worker al terminar, con éxito, error o panic
    pub fn complete(&self) {
        let (done, cvar) = &*self.state;
        *lock(done) = true;
        cvar.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        *lock(&self.state.0)
    }

    /// Espera a que la ejecución termine, como mucho `timeout`.
    ///
    /// Devuelve `true` si terminó dentro del plazo.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (done, cvar) = &*self.state;
        let deadline = Instant::now() + timeout;
        let mut finished = lock(done);

        while !*finished {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            finished = match cvar.wait_timeout(finished, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

/// Señal de apagado compartida por los loops de fondo
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    cvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *lock(&self.triggered) = true;
        self.cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *lock(&self.triggered)
    }

    /// Duerme `duration` en tramos de como mucho un minuto.
    ///
    /// Se despierta antes si llega el apagado; devuelve `true` en ese caso.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut triggered = lock(&self.triggered);

        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let chunk = (deadline - now).min(MAX_SLEEP_CHUNK);
            triggered = match self.cvar.wait_timeout(triggered, chunk) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
