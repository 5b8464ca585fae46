//! Notification Dispatch
//!
//! The core emits `Notification` payloads onto an unbounded channel. A
//! dispatcher task drains the channel into a [`NotificationSink`]. Delivery
//! failures are logged and dropped; they never touch committed state.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::types::{Metadata, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// A transition was committed
    StatusChanged,
    /// A human has to step in
    ActionRequired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::StatusChanged => "STATUS_CHANGED",
            NotificationKind::ActionRequired => "ACTION_REQUIRED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub transaction_id: TransactionId,
    pub kind: NotificationKind,
    pub payload: Metadata,
}

impl Notification {
    pub fn new(transaction_id: TransactionId, kind: NotificationKind, payload: Metadata) -> Self {
        Self {
            transaction_id,
            kind,
            payload,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Notification permission denied: {0}")]
    PermissionDenied(String),

    #[error("Notification channel unavailable: {0}")]
    Unavailable(String),
}

/// End-user facing consumer of notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Get sink name for logging
    fn name(&self) -> &'static str;

    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Sink that writes notifications to the log
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            txn_id = %notification.transaction_id,
            kind = notification.kind.as_str(),
            summary = notification.payload.get("summary").unwrap_or(""),
            reason = notification.payload.get("reason").unwrap_or(""),
            "Notification"
        );
        Ok(())
    }
}

/// Producer side, held by the store and the orchestrator
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationSender {
    /// Queue a notification; never blocks, never fails the caller
    pub fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("Notification dropped, dispatcher is gone");
        }
    }
}

/// Consumer side, owned by the dispatcher
pub struct NotificationReceiver {
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationReceiver {
    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next notification; None once all senders are dropped
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

/// Create a new notification channel pair
pub fn notification_channel() -> (NotificationSender, NotificationReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NotificationSender { tx }, NotificationReceiver { rx })
}

pub struct NotificationDispatcher {
    receiver: NotificationReceiver,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationDispatcher {
    pub fn new(receiver: NotificationReceiver, sink: Arc<dyn NotificationSink>) -> Self {
        Self { receiver, sink }
    }

    /// Deliver until every sender is dropped; returns the delivered count
    pub async fn run(mut self) -> usize {
        info!(sink = self.sink.name(), "Starting notification dispatcher");
        let mut delivered = 0;
        while let Some(notification) = self.receiver.recv().await {
            if self.deliver(&notification).await {
                delivered += 1;
            }
        }
        info!(delivered, "Notification dispatcher stopped");
        delivered
    }

    /// Deliver whatever is queued right now, without waiting
    pub async fn dispatch_pending(&mut self, max_per_batch: usize) -> usize {
        let mut delivered = 0;
        for _ in 0..max_per_batch {
            let Some(notification) = self.receiver.try_recv() else {
                break;
            };
            if self.deliver(&notification).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn deliver(&self, notification: &Notification) -> bool {
        match self.sink.notify(notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    sink = self.sink.name(),
                    txn_id = %notification.transaction_id,
                    kind = notification.kind.as_str(),
                    error = %e,
                    "Notification delivery failed (suppressed)"
                );
                false
            }
        }
    }
}
