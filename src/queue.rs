//! Per-user sequential request queue.
//!
//! Each user with outstanding AI work gets one long-lived worker task fed by a
//! bounded channel. Entries for one user run strictly in submission order and
//! never overlap; different users proceed in parallel. A worker left idle
//! with nothing pending removes itself from the registry and exits.

use crate::config::{USER_QUEUE_CAPACITY, WORKER_IDLE_SECS};
use crate::error::{GatewayError, GatewayResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum QueueMessage {
    Job(Job),
    Shutdown,
}

struct UserWorker {
    sender: mpsc::Sender<QueueMessage>,
    pending: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

/// Counts an entry from submission until it has run or been dropped unrun.
struct PendingSlot(Arc<AtomicUsize>);

impl PendingSlot {
    fn claim(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        crate::metrics::global().job_queued();
        Self(counter.clone())
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        crate::metrics::global().job_finished();
    }
}

type Registry = Arc<DashMap<String, UserWorker>>;

pub struct UserQueues {
    workers: Registry,
    closed: AtomicBool,
    capacity: usize,
    idle_timeout: Duration,
}

impl Default for UserQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl UserQueues {
    pub fn new() -> Self {
        Self::with_capacity(USER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            workers: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
            capacity: capacity.max(1),
            idle_timeout: Duration::from_secs(WORKER_IDLE_SECS),
        }
    }

    /// How long a worker with nothing pending waits before it is reclaimed.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Run `work` in `user_id`'s queue and wait for its result.
    ///
    /// If the caller stops waiting, the entry still runs to completion and
    /// its result is discarded.
    pub async fn enqueue<T, Fut>(&self, user_id: &str, work: Fut) -> GatewayResult<T>
    where
        T: Send + 'static,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let (sender, slot) = self
            .worker_for(user_id)
            .ok_or_else(|| GatewayError::internal("request queue is shut down"))?;

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let outcome = AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(GatewayError::internal("unit of work panicked")));
            drop(slot);
            // Receiver is gone when the caller gave up waiting
            let _ = tx.send(outcome);
        });

        debug!("Queueing AI request for user {}", user_id);
        sender
            .send(QueueMessage::Job(job))
            .await
            .map_err(|_| GatewayError::internal("request queue is shut down"))?;

        rx.await
            .map_err(|_| GatewayError::internal("request was dropped before completion"))?
    }

    /// Entries queued or running for `user_id`.
    pub fn queue_size(&self, user_id: &str) -> usize {
        self.workers
            .get(user_id)
            .map(|w| w.pending.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn active_users(&self) -> usize {
        self.workers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting work, let every worker drain what it already has, and
    /// wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        loop {
            let users: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
            if users.is_empty() {
                break;
            }
            info!("🛑 Shutting down request queues for {} user(s)", users.len());

            for user_id in users {
                let Some((_, worker)) = self.workers.remove(&user_id) else {
                    continue;
                };
                if worker.sender.send(QueueMessage::Shutdown).await.is_err() {
                    debug!("Worker for user {} already stopped", user_id);
                }
                if let Err(e) = worker.handle.await {
                    error!("Worker for user {} ended abnormally: {}", user_id, e);
                }
            }
        }
    }

    /// Sender for `user_id`'s worker plus a claimed pending slot, spawning the
    /// worker if needed. The slot is claimed under the registry shard lock so
    /// an idle worker cannot reclaim itself in between.
    fn worker_for(&self, user_id: &str) -> Option<(mpsc::Sender<QueueMessage>, PendingSlot)> {
        if self.is_closed() {
            return None;
        }
        let worker = match self.workers.entry(user_id.to_string()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                // Re-checked under the shard lock; shutdown must see every insert
                if self.is_closed() {
                    return None;
                }
                entry.insert(self.spawn_worker(user_id))
            }
        };
        Some((worker.sender.clone(), PendingSlot::claim(&worker.pending)))
    }

    fn spawn_worker(&self, user_id: &str) -> UserWorker {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(run_worker(
            user_id.to_string(),
            receiver,
            self.workers.clone(),
            pending.clone(),
            self.idle_timeout,
        ));
        info!("Started request worker for user {}", user_id);
        UserWorker { sender, pending, handle }
    }
}

async fn run_worker(
    user_id: String,
    mut receiver: mpsc::Receiver<QueueMessage>,
    registry: Registry,
    pending: Arc<AtomicUsize>,
    idle_timeout: Duration,
) {
    loop {
        let message = match tokio::time::timeout(idle_timeout, receiver.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => {
                let reclaimed = registry
                    .remove_if(&user_id, |_, worker| {
                        Arc::ptr_eq(&worker.pending, &pending)
                            && worker.pending.load(Ordering::SeqCst) == 0
                    })
                    .is_some();
                if reclaimed {
                    debug!("Reclaiming idle request worker for user {}", user_id);
                    receiver.close();
                    while let Ok(message) = receiver.try_recv() {
                        if let QueueMessage::Job(job) = message {
                            job.await;
                        }
                    }
                    break;
                }
                continue;
            }
        };
        match message {
            QueueMessage::Job(job) => {
                info!("Processing AI request for user {}", user_id);
                job.await;
            }
            QueueMessage::Shutdown => break,
        }
    }
    info!("Request worker for user {} stopped", user_id);
}
