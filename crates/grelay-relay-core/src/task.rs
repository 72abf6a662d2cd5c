use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

// A billing panic must stay inside its task.
#[cfg(panic = "abort")]
compile_error!("grelay needs panic = \"unwind\": billing tasks catch panics");

/// Supervisor for detached billing work. Tasks outlive the request that
/// spawned them; `drain` waits for them at shutdown.
#[derive(Debug, Clone, Default)]
pub struct BillingTasks {
    tracker: TaskTracker,
}

impl BillingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(event = "billing_task_panicked", task = name, reason = %reason);
            }
        });
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Closes the tracker and waits for in-flight tasks.
    pub async fn drain(&self) {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(event = "billing_drain", pending);
        }
        self.tracker.wait().await;
    }

    /// Like `drain`, giving up after `limit`. Returns false on timeout.
    pub async fn drain_timeout(&self, limit: Duration) -> bool {
        match tokio::time::timeout(limit, self.drain()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(event = "billing_drain_timeout", pending = self.tracker.len());
                false
            }
        }
    }
}
