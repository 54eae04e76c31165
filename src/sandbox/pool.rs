//! Bounded pool of pre-warmed sandboxes.
//!
//! A single producer task keeps the buffer full: it waits for a free slot,
//! creates a sandbox, gates it on the SSH readiness probe, and only then
//! publishes the handle. Consumers take ready handles with [`acquire`]
//! (blocking while the buffer is empty). Release is deliberately
//! asymmetric: sandboxes are single-use, so a finished session stops its
//! sandbox through the runtime instead of returning it to the buffer.
//!
//! [`acquire`]: SandboxPool::acquire

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::sandbox::runtime::{wait_until_ready, SandboxRuntime};

/// How long the producer waits for a fresh sandbox to become healthy
/// before giving up on it and trying again.
const READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Backoff after a failed creation attempt.
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct SandboxPool {
    runtime: Arc<dyn SandboxRuntime>,
    ready: Mutex<mpsc::Receiver<String>>,
    shutdown: watch::Receiver<bool>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxPool {
    /// Starts the producer and returns the pool. `capacity` may be 1.
    pub fn start(
        runtime: Arc<dyn SandboxRuntime>,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let producer = tokio::spawn(produce(runtime.clone(), tx, shutdown.clone()));
        Self {
            runtime,
            ready: Mutex::new(rx),
            shutdown,
            producer: Mutex::new(Some(producer)),
        }
    }

    /// Takes the next ready handle, waiting while the buffer is empty.
    ///
    /// Returns `None` when the pool is shutting down, so a blocked
    /// admission aborts cleanly instead of hanging.
    pub async fn acquire(&self) -> Option<String> {
        if *self.shutdown.borrow() {
            return None;
        }
        let mut ready = self.ready.lock().await;
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            handle = ready.recv() => handle,
            _ = shutdown.changed() => None,
        }
    }

    /// Stops every ready handle left in the buffer and waits for the
    /// producer to wind down. Called once, after the shutdown flag flips.
    pub async fn drain(&self) {
        let mut ready = self.ready.lock().await;
        ready.close();
        while let Some(id) = ready.recv().await {
            info!("draining warm sandbox {}", id);
            self.runtime.stop(&id).await;
        }
        drop(ready);

        if let Some(producer) = self.producer.lock().await.take() {
            let _ = producer.await;
        }
        info!("sandbox pool drained");
    }
}

async fn produce(
    runtime: Arc<dyn SandboxRuntime>,
    tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        // Wait for a free slot before creating anything, so the warm set
        // never exceeds the configured capacity.
        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = tx.reserve() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let id = match runtime.create_and_start().await {
            Ok(id) => id,
            Err(e) => {
                error!("sandbox creation failed, retrying: {}", e);
                drop(permit);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => continue,
                }
            }
        };

        if !wait_until_ready(runtime.as_ref(), &id, READY_TIMEOUT).await {
            error!("sandbox {} never became ready, discarding", id);
            runtime.stop(&id).await;
            continue;
        }

        // Shutdown must win over publication: a handle produced during the
        // drain would otherwise leak.
        if *shutdown.borrow() {
            runtime.stop(&id).await;
            break;
        }

        debug!("sandbox {} is warm", id);
        permit.send(id);
    }
    debug!("pool producer stopped");
}
