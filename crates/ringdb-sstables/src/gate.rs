//! Operation gate keeping a table alive while directory work is in flight.
//!
//! Operations hold an [`OperationGuard`]; dropping the table first closes
//! the gate, which waits for every outstanding guard and refuses new ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::debug;

use crate::error::{SstError, SstResult};

/// Barrier that a table closes before it goes away.
#[derive(Debug, Clone, Default)]
pub struct OperationGate {
    lock: Arc<RwLock<()>>,
    closed: Arc<AtomicBool>,
}

/// Proof that an operation is in progress; releases on drop.
#[derive(Debug)]
pub struct OperationGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

impl OperationGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an operation, failing once the gate is closed.
    pub fn enter(&self) -> SstResult<OperationGuard> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SstError::Closing);
        }
        let guard = Arc::clone(&self.lock)
            .try_read_owned()
            .map_err(|_| SstError::Closing)?;
        Ok(OperationGuard { _guard: guard })
    }

    /// Refuses new operations and waits for running ones to finish.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _exclusive = self.lock.write().await;
        debug!("operation gate closed");
    }

    /// Returns true once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_waits_for_guard() {
        let gate = OperationGate::new();
        let guard = gate.enter().unwrap();

        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.close().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());
        assert!(gate.enter().is_err());

        drop(guard);
        closer.await.unwrap();
        assert!(gate.is_closed());
    }

    #[tokio::test]
    async fn test_close_without_operations() {
        let gate = OperationGate::new();
        gate.close().await;
        assert!(matches!(gate.enter(), Err(SstError::Closing)));
    }
}
