//! Handle to a running render engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, warn};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// A launched render engine.
///
/// Either backed by a child process the backend spawned, or detached when the
/// backend renders without a long-lived process.
pub struct EngineInstance {
    id: u64,
    launched_at: DateTime<Utc>,
    endpoint: Option<String>,
    child: Mutex<Option<Child>>,
    dead: AtomicBool,
}

impl EngineInstance {
    /// An engine with no process of its own.
    pub fn detached(endpoint: Option<String>) -> Self {
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            launched_at: Utc::now(),
            endpoint,
            child: Mutex::new(None),
            dead: AtomicBool::new(false),
        }
    }

    /// An engine backed by a spawned process.
    pub fn with_process(child: Child, endpoint: Option<String>) -> Self {
        let engine = Self::detached(endpoint);
        Self {
            child: Mutex::new(Some(child)),
            ..engine
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    /// Address the engine announced at startup, if any.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.try_lock().ok()?.as_ref()?.id()
    }

    /// Flag the engine as unusable; the pool relaunches it on next acquire.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Whether the engine can still take renders.
    pub fn is_alive(&self) -> bool {
        if self.dead.load(Ordering::Acquire) {
            return false;
        }

        // Someone else holds the lock (shutting down or polling); assume alive.
        let Ok(mut guard) = self.child.try_lock() else {
            return true;
        };

        match guard.as_mut().map(Child::try_wait) {
            None => true,
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!(engine = self.id, %status, "Render engine process exited");
                self.dead.store(true, Ordering::Release);
                false
            }
            Some(Err(e)) => {
                warn!(engine = self.id, error = %e, "Failed to poll render engine process");
                self.dead.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Stop the engine process, waiting at most `grace` for it to exit.
    pub async fn shutdown(&self, grace: Duration) {
        self.dead.store(true, Ordering::Release);
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if process_utils::terminate(&mut child, grace).await {
                debug!(engine = self.id, "Render engine stopped");
            } else {
                warn!(engine = self.id, "Render engine did not exit within grace period");
            }
        }
    }
}

impl std::fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInstance")
            .field("id", &self.id)
            .field("launched_at", &self.launched_at)
            .field("endpoint", &self.endpoint)
            .field("dead", &self.dead.load(Ordering::Relaxed))
            .finish()
    }
}
