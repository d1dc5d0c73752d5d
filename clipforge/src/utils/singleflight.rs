//! Single-flight cell shared by the compile cache and the engine pool.
//!
//! One caller (the leader) performs the work; everyone else who finds the
//! cell in the owner's in-flight slot waits on it and observes the same
//! outcome. The owner keeps the cell behind the same lock that guards its
//! map, so at most one leader exists per key.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Notify, OnceCell};

static NEXT_FLIGHT_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome observed by every waiter of a flight.
#[derive(Debug, Clone)]
pub enum FlightOutcome<T> {
    /// The leader produced a value.
    Done(T),
    /// The leader failed; waiters fail with the same message.
    Failed(String),
    /// The leader went away before finishing; waiters should start over.
    Abandoned,
}

/// A single in-flight operation.
pub struct InFlight<T> {
    id: u64,
    result: OnceCell<FlightOutcome<T>>,
    notify: Notify,
}

impl<T: Clone> InFlight<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FLIGHT_ID.fetch_add(1, Ordering::Relaxed),
            result: OnceCell::new(),
            notify: Notify::new(),
        })
    }

    /// Unique id, used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Publish the outcome and wake all waiters. Only the first call wins.
    pub fn finish(&self, outcome: FlightOutcome<T>) -> bool {
        let won = self.result.set(outcome).is_ok();
        self.notify.notify_waiters();
        won
    }

    pub fn is_finished(&self) -> bool {
        self.result.initialized()
    }

    /// Wait for the leader to publish an outcome.
    pub async fn wait(&self) -> FlightOutcome<T> {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_observe_the_first_outcome() {
        let flight: Arc<InFlight<u32>> = InFlight::new();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let flight = flight.clone();
                tokio::spawn(async move { flight.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(flight.finish(FlightOutcome::Done(7)));
        assert!(!flight.finish(FlightOutcome::Failed("late".to_string())));

        for waiter in waiters {
            assert!(matches!(waiter.await.unwrap(), FlightOutcome::Done(7)));
        }
    }

    #[tokio::test]
    async fn finished_flight_returns_immediately() {
        let flight: Arc<InFlight<u32>> = InFlight::new();
        flight.finish(FlightOutcome::Abandoned);
        assert!(flight.is_finished());
        assert!(matches!(flight.wait().await, FlightOutcome::Abandoned));
    }

    #[test]
    fn ids_are_unique() {
        let a: Arc<InFlight<()>> = InFlight::new();
        let b: Arc<InFlight<()>> = InFlight::new();
        assert_ne!(a.id(), b.id());
    }
}
