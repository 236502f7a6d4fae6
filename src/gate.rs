use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::Error;

/// Bounds the number of exchanges in flight.
///
/// The gate is a thin wrapper over a [`tokio::sync::Semaphore`] holding
/// exactly `limit` permits. Callers [`admit`](ConcurrencyGate::admit)
/// themselves before starting an exchange and hold the returned
/// [`GatePermit`] for the exchange's whole lifetime. The permit returns to
/// the pool when dropped, so release happens on every exit path (completion,
/// error, timeout, even a panicking task) without any bookkeeping at the call
/// sites.
///
/// A limit of zero would deadlock every caller and is rejected at
/// construction.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Result<Self, Error> {
        if limit == 0 {
            return Err(Error::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        })
    }

    /// Suspends until a slot is free, then claims it.
    pub async fn admit(&self) -> Result<GatePermit, Error> {
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => Ok(GatePermit { _permit: permit }),
            Err(_) => Err(Error::GateClosed),
        }
    }

    /// The admission ceiling this gate was built with.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently free. Mostly useful for tests and introspection.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// One claimed slot in a [`ConcurrencyGate`]. Dropping it releases the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}
