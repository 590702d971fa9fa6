//! Background loops owned by the queue.
//!
//! The delivery loop drives [`MessageQueue::deliver_due`] on a short fixed
//! tick; the retention sweeper drops messages that outlived the retention
//! window. Both run as independent tasks so a slow handler never delays
//! retention, and neither loop overlaps itself.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use trellis_common::TaskHandle;

use crate::queue::MessageQueue;

pub struct DeliveryLoop {
    queue: Arc<MessageQueue>,
}

impl DeliveryLoop {
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self { queue }
    }

    pub fn spawn(self) -> TaskHandle {
        let (tx, mut rx) = mpsc::channel(1);
        let tick = self.queue.config().tick_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.queue.deliver_due().await,
                    _ = rx.recv() => {
                        info!("delivery loop stopping");
                        break;
                    }
                }
            }
        });
        TaskHandle::new(tx, handle)
    }
}

pub struct RetentionSweeper {
    queue: Arc<MessageQueue>,
}

impl RetentionSweeper {
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self { queue }
    }

    pub fn spawn(self) -> TaskHandle {
        let (tx, mut rx) = mpsc::channel(1);
        let interval = self.queue.config().retention_sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.queue.sweep_retention().await,
                    _ = rx.recv() => {
                        info!("retention sweeper stopping");
                        break;
                    }
                }
            }
        });
        TaskHandle::new(tx, handle)
    }
}
