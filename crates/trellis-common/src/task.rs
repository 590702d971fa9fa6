//! Background loop lifecycle.
//!
//! Every periodic loop in the mesh (health sweep, delivery tick, retention
//! sweep) runs as its own task selecting between its interval and a shutdown
//! channel. [`TaskHandle::stop`] signals the channel and joins the task, so
//! a tick that is already running always completes before `stop` returns.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Handle to a spawned background loop.
pub struct TaskHandle {
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(shutdown: mpsc::Sender<()>, handle: JoinHandle<()>) -> Self {
        Self { shutdown, handle }
    }

    /// Signal the loop to stop and wait for the in-flight tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        if let Err(e) = self.handle.await {
            warn!("background task did not shut down cleanly: {}", e);
        }
    }

    /// Stop without waiting. The task is aborted at its next await point.
    pub fn abort(self) {
        self.handle.abort();
    }
}
