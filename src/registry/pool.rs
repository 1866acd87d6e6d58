//! Worker pool draining the registry queues
//!
//! Each worker owns one bounded queue. A worker applies commands one at a time,
//! catches panics into [`RegistryError::WorkerPanic`] and, after any fatal
//! error, exits so its supervisor can start a fresh task on the same queue.

use super::command::Request;
use super::state::RegistryState;
use crate::core::RegistryError;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum WorkerExit {
    /// Queue closed; the registry is gone
    Closed,
    /// A fatal error; restart on the returned queue
    Fatal(mpsc::Receiver<Request>),
}

/// Aborts the running worker when its supervisor goes away
struct WorkerGuard(JoinHandle<WorkerExit>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Stable worker index for a client id
pub fn route(client_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    client_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Spawn `workers` supervised workers sharing `state`
pub fn spawn(
    workers: usize,
    buffer: usize,
    state: Arc<Mutex<RegistryState>>,
) -> (Vec<mpsc::Sender<Request>>, Vec<JoinHandle<()>>) {
    let mut queues = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);

    for id in 0..workers {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        queues.push(tx);
        handles.push(tokio::spawn(supervise(id, rx, state.clone())));
    }

    (queues, handles)
}

async fn supervise(id: usize, mut rx: mpsc::Receiver<Request>, state: Arc<Mutex<RegistryState>>) {
    let mut restarts = 0u64;
    loop {
        let mut worker = WorkerGuard(tokio::spawn(run(id, rx, state.clone())));
        match (&mut worker.0).await {
            Ok(WorkerExit::Closed) => {
                tracing::debug!(worker = id, "registry worker stopped");
                return;
            }
            Ok(WorkerExit::Fatal(queue)) => {
                restarts += 1;
                tracing::error!(worker = id, restarts, "restarting registry worker");
                rx = queue;
            }
            Err(e) => {
                tracing::error!(worker = id, error = %e, "registry worker aborted");
                return;
            }
        }
    }
}

async fn run(
    id: usize,
    mut rx: mpsc::Receiver<Request>,
    state: Arc<Mutex<RegistryState>>,
) -> WorkerExit {
    while let Some(request) = rx.recv().await {
        let name = request.command.name();
        let client_id = request.client_id;
        let result = execute(&state, request.command);

        let fatal = match &result {
            Err(e) if e.is_fatal() => Some(e.clone()),
            _ => None,
        };

        // the requester may have timed out and gone away
        let _ = request.reply.send(result);

        if let Some(e) = fatal {
            tracing::error!(
                worker = id,
                command = name,
                client_id = ?client_id,
                error = %e,
                "fatal registry error"
            );
            return WorkerExit::Fatal(rx);
        }
    }
    WorkerExit::Closed
}

fn execute(
    state: &Mutex<RegistryState>,
    command: super::command::Command,
) -> Result<super::command::Response, RegistryError> {
    let name = command.name();
    // a previous panic may have poisoned the lock; the tables are still usable
    let mut guard = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    match catch_unwind(AssertUnwindSafe(|| guard.apply(command))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(RegistryError::WorkerPanic {
                command: name,
                message,
            })
        }
    }
}
