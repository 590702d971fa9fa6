//! Background health sweep.
//!
//! Runs [`ServiceRegistry::sweep`] on the configured interval. Sweep passes
//! never overlap: the next tick is not polled until the previous pass
//! finished, and `stop()` waits for an in-flight pass.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use trellis_common::TaskHandle;

use crate::registry::ServiceRegistry;

pub struct HealthSweeper {
    registry: Arc<ServiceRegistry>,
}

impl HealthSweeper {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    pub fn spawn(self) -> TaskHandle {
        let (tx, mut rx) = mpsc::channel(1);
        let interval = self.registry.config().sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.registry.sweep().await,
                    _ = rx.recv() => {
                        info!("health sweeper stopping");
                        break;
                    }
                }
            }
        });
        TaskHandle::new(tx, handle)
    }
}
