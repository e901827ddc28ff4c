//! Named background workers with joined teardown.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{debug, error};

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Spawns named workers and joins them all on teardown.
///
/// Workers run until completion, which in practice means until their input
/// mailboxes disconnect.  Teardown is the caller's two-step dance:
/// disconnect the inputs first, then `join_all`.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<Vec<Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry::default()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(worker = name, "spawning worker");
        let handle = tokio::spawn(task);
        self.workers.lock().unwrap().push(Worker { name, handle });
    }

    /// Await every spawned worker, in spawn order.
    pub async fn join_all(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            match worker.handle.await {
                Ok(()) => debug!(worker = worker.name, "worker finished"),
                Err(err) => error!(worker = worker.name, %err, "worker aborted"),
            }
        }
    }
}
