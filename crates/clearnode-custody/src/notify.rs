//! Post-commit notifications for downstream delivery.

use async_trait::async_trait;
use clearnode_core::Address;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::error::NotifyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    BalanceUpdate,
    ChannelUpdate,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Wallet the notification is addressed to.
    pub wallet: Address,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(wallet: Address, kind: NotificationKind, payload: serde_json::Value) -> Self {
        Self {
            wallet,
            kind,
            payload,
        }
    }
}

/// Receives notifications after the producing transaction has committed.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notifications: Vec<Notification>) -> Result<(), NotifyError>;
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notifications: Vec<Notification>) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Notification> {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *seen)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notifications: Vec<Notification>) -> Result<(), NotifyError> {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(notifications);
        Ok(())
    }
}

/// Fire-and-forget delivery: failures are logged and swallowed.
pub(crate) async fn deliver(notifier: &dyn Notifier, notifications: Vec<Notification>) {
    if notifications.is_empty() {
        return;
    }
    let count = notifications.len();
    if let Err(e) = notifier.notify(notifications).await {
        tracing::warn!(count, error = %e, "notification delivery failed");
    }
}
