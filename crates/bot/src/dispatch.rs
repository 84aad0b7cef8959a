use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use bridge_core::{InboundMessage, Router, truncate};

/// Where the reply for one inbound message goes.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Called before and after routing; transports without a busy indicator
    /// can ignore it.
    async fn typing(&self, _active: bool) {}

    async fn send(&self, text: &str) -> Result<()>;
}

struct Job {
    message: InboundMessage,
    sink: Arc<dyn ReplySink>,
}

/// Runs each user's messages strictly in arrival order on a per-user worker,
/// while different users proceed concurrently.
pub struct Dispatcher {
    router: Arc<Router>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueues a message behind anything already pending for the same user.
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, message: InboundMessage, sink: Arc<dyn ReplySink>) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let job = Job { message, sink };
        let job = match queues.get(&job.message.user_key) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                // Worker is gone; start a fresh one below.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let user_key = job.message.user_key.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            return;
        }
        debug!(user = %user_key, "Starting user worker");
        tokio::spawn(run_worker(Arc::clone(&self.router), rx));
        queues.insert(user_key, tx);
    }
}

async fn run_worker(router: Arc<Router>, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(Job { message, sink }) = rx.recv().await {
        sink.typing(true).await;
        let reply = router.route(&message).await;
        sink.typing(false).await;
        if let Err(e) = sink.send(&reply).await {
            warn!(
                user = %message.user_key,
                error = %e,
                reply = %truncate(&reply, 120),
                "Failed to deliver reply"
            );
        }
    }
}
