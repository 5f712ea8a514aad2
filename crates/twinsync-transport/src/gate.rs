//! Single-slot gate for transport-affecting operations.
//!
//! Two ways to hold the slot:
//! - [`Gate::acquire`] returns a permit released when it is dropped, so every
//!   exit path of the caller releases it.
//! - [`Gate::hold`] parks the permit inside the gate until a later, separate
//!   call to [`Gate::release_held`]. Reconnect uses this to pause all traffic.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, SemaphorePermit};

/// The gate was closed and will never grant the slot again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("gate closed")]
pub struct GateClosed;

/// Capacity-1 mutual exclusion with hold-and-release-later support.
#[derive(Debug)]
pub struct Gate {
    semaphore: Arc<Semaphore>,
    held: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            held: Mutex::new(None),
        }
    }

    /// Wait for the slot; it is released when the permit drops.
    ///
    /// # Errors
    ///
    /// Returns [`GateClosed`] if the gate has been closed.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, GateClosed> {
        self.semaphore.acquire().await.map_err(|_| GateClosed)
    }

    /// Wait for the slot and keep it until [`Gate::release_held`].
    ///
    /// Holding twice is a no-op; the second call returns at once.
    ///
    /// # Errors
    ///
    /// Returns [`GateClosed`] if the gate has been closed.
    pub async fn hold(&self) -> Result<(), GateClosed> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            tracing::warn!("Gate already held, ignoring second hold");
            return Ok(());
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)?;
        *held = Some(permit);
        Ok(())
    }

    /// Release a slot parked by [`Gate::hold`].
    ///
    /// Returns `false` if nothing was held.
    pub async fn release_held(&self) -> bool {
        self.held.lock().await.take().is_some()
    }

    /// Whether the slot is currently free.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.semaphore.available_permits() == 1
    }

    /// Close the gate; pending and future waits fail with [`GateClosed`].
    pub fn close(&self) {
        self.semaphore.close();
    }
}
