//! Background task applying persistence operations in submission order.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::eviction::EvictionManager;

/// A queued mutation of the persistent backing.
#[derive(Debug)]
pub(crate) enum PersistOp {
  Write { key: String, raw: String },
  Remove(String),
  Clear,
  /// Acknowledged once every earlier operation has been applied
  Flush(oneshot::Sender<()>),
}

/// Spawn the writer. It exits once every sender has been dropped.
pub(crate) fn spawn(manager: Arc<EvictionManager>) -> mpsc::UnboundedSender<PersistOp> {
  let (tx, mut rx) = mpsc::unbounded_channel();

  tokio::spawn(async move {
    while let Some(op) = rx.recv().await {
      apply(&manager, op);
    }
  });

  tx
}

fn apply(manager: &EvictionManager, op: PersistOp) {
  match op {
    PersistOp::Write { key, raw } => {
      // Failures are already logged by the eviction manager
      let _ = manager.write_with_eviction(&key, &raw);
    }
    PersistOp::Remove(key) => {
      if let Err(e) = manager.remove(&key) {
        warn!(key = %key, error = %e, "Failed to remove persisted cache entry");
      }
    }
    PersistOp::Clear => {
      if let Err(e) = manager.clear() {
        warn!(error = %e, "Failed to clear persisted cache");
      }
    }
    PersistOp::Flush(ack) => {
      // Ignore send errors - the waiter may have given up
      let _ = ack.send(());
    }
  }
}
