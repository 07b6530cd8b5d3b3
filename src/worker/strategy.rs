//! Reservation strategies: how long a worker waits for its next job.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ReserveError;
use crate::queue::{JobSource, Reservation};

/// Default number of consecutive empty rounds before a worker terminates.
pub const DEFAULT_TERMINATE_AFTER_WAITS: u32 = 2;

/// Reserves the next job from a source.
#[async_trait]
pub trait ReservationStrategy: Send + Sync {
    /// Returns a job, or `ReserveError::WaitTimeout` when none arrived in
    /// time, or `ReserveError::Terminate` when the worker should stop.
    async fn reserve(&mut self, source: &dyn JobSource) -> Result<Reservation, ReserveError>;
}

/// Blocking pop with a timeout.
#[derive(Debug, Clone)]
pub struct BlockingStrategy {
    interval: Duration,
}

impl BlockingStrategy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl ReservationStrategy for BlockingStrategy {
    async fn reserve(&mut self, source: &dyn JobSource) -> Result<Reservation, ReserveError> {
        source
            .pop_blocking(self.interval)
            .await?
            .ok_or(ReserveError::WaitTimeout)
    }
}

/// Non-blocking pop followed by a sleep when the source is empty.
#[derive(Debug, Clone)]
pub struct SleepStrategy {
    interval: Duration,
}

impl SleepStrategy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl ReservationStrategy for SleepStrategy {
    async fn reserve(&mut self, source: &dyn JobSource) -> Result<Reservation, ReserveError> {
        match source.pop_non_blocking().await? {
            Some(reservation) => Ok(reservation),
            None => {
                tokio::time::sleep(self.interval).await;
                Err(ReserveError::WaitTimeout)
            }
        }
    }
}

/// Turns the N-th consecutive `WaitTimeout` of the inner strategy into
/// `Terminate`. Any reservation resets the count.
pub struct TerminateDecorator<S> {
    inner: S,
    required_waits: u32,
    waits: u32,
}

impl<S: ReservationStrategy> TerminateDecorator<S> {
    pub fn new(inner: S, required_waits: u32) -> Self {
        Self {
            inner,
            required_waits: required_waits.max(1),
            waits: 0,
        }
    }

    /// Consecutive waits observed so far.
    pub fn waits(&self) -> u32 {
        self.waits
    }
}

#[async_trait]
impl<S: ReservationStrategy> ReservationStrategy for TerminateDecorator<S> {
    async fn reserve(&mut self, source: &dyn JobSource) -> Result<Reservation, ReserveError> {
        match self.inner.reserve(source).await {
            Ok(reservation) => {
                self.waits = 0;
                Ok(reservation)
            }
            Err(ReserveError::WaitTimeout) => {
                self.waits += 1;
                if self.waits >= self.required_waits {
                    debug!(source = %source.name(), waits = self.waits, "Source stayed empty, terminating");
                    Err(ReserveError::Terminate)
                } else {
                    Err(ReserveError::WaitTimeout)
                }
            }
            Err(e) => Err(e),
        }
    }
}
