//! Clearnode custody settlement
//!
//! Follows the custody contract on every configured chain and keeps the
//! channel registry and ledger in step with it. Disputed channels with a
//! newer signed state get a checkpoint queued, which the action worker
//! submits back to the chain.

pub mod backoff;
pub mod engine;
pub mod error;
pub mod listener;
pub mod notify;
pub mod reconciler;
pub mod service;
pub mod worker;

pub use backoff::backoff_delay;
pub use engine::{CustodyEngine, HandleOutcome};
pub use error::{CustodyError, ListenerError, NotifyError, ServiceError, WorkerError};
pub use listener::{EventListener, Watermark};
pub use notify::{NoopNotifier, Notification, NotificationKind, Notifier, RecordingNotifier};
pub use reconciler::{ReconcileReport, Reconciler};
pub use service::SettlementService;
pub use worker::{ActionWorker, BatchReport, CheckpointPayload};

use tokio::sync::watch;

/// Resolves once the shutdown flag is set or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
