//! Admission gate for server-mode units.
//!
//! A counting limiter over a tokio semaphore. Units acquire a [`Ticket`]
//! inside their own task, so a full gate never stalls the accept loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};

/// Bounds the number of concurrently running units
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Admission of one unit. The slot frees when the ticket drops.
#[derive(Debug)]
pub struct Ticket {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait up to `timeout` for a free slot
    pub async fn acquire(&self, timeout: Duration) -> Result<Ticket> {
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned())
            .await
            .map_err(|_| ProtocolError::AdmissionTimeout)?
            .map_err(|_| ProtocolError::InvalidState("Admission gate closed"))?;
        Ok(Ticket { _permit: permit })
    }

    /// [`acquire`](Self::acquire), giving up early if `cancel` fires
    pub async fn acquire_or_cancel(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Ticket> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            ticket = self.acquire(timeout) => ticket,
        }
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_extra_unit_times_out_alone() {
        let gate = AdmissionGate::new(2);
        let first = gate.acquire(Duration::from_millis(500)).await.unwrap();
        let _second = gate.acquire(Duration::from_millis(500)).await.unwrap();
        assert_eq!(gate.available(), 0);

        let started = Instant::now();
        let third = gate.acquire(Duration::from_millis(100)).await;
        assert!(matches!(third, Err(ProtocolError::AdmissionTimeout)));
        assert!(started.elapsed() >= Duration::from_millis(100));

        drop(first);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_waiter_admitted_when_slot_frees() {
        let gate = AdmissionGate::new(1);
        let held = gate.acquire(Duration::from_millis(10)).await.unwrap();

        let waiter = gate.clone();
        let pending =
            tokio::spawn(async move { waiter.acquire(Duration::from_secs(2)).await.is_ok() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(pending.await.unwrap());
        assert_eq!(gate.capacity(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let gate = AdmissionGate::new(1);
        let _held = gate.acquire(Duration::from_millis(10)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            gate.acquire_or_cancel(Duration::from_secs(5), &cancel).await,
            Err(ProtocolError::Cancelled)
        ));
    }
}
