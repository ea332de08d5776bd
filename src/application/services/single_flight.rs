//! Per-key request coalescing.
//!
//! The first caller for a key becomes the leader and does the work. Callers
//! arriving while it runs become followers and wait for its outcome instead
//! of repeating the work. The entry is removed before the outcome is
//! published, so a caller arriving afterwards starts fresh and finds the
//! committed blob in storage.
//!
//! A leader dropped before completing publishes no outcome. Its followers
//! see [`None`] from [`FlightWaiter::wait`] and join again, so one of them
//! takes the work over.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::errors::ProxyError;

#[derive(Clone)]
enum State {
    Running,
    Done(Result<(), ProxyError>),
    Abandoned,
}

type FlightMap = Arc<Mutex<HashMap<String, watch::Receiver<State>>>>;

/// Role assigned by [`SingleFlight::join`].
pub enum Flight {
    /// Do the work, then call [`FlightGuard::complete`].
    Leader(FlightGuard),
    /// Wait for the leader with [`FlightWaiter::wait`].
    Follower(FlightWaiter),
}

/// Tracks in-flight work by key.
#[derive(Clone, Default)]
pub struct SingleFlight {
    in_flight: FlightMap,
}

impl SingleFlight {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the flight for `key`, becoming leader if none is running.
    #[must_use]
    pub fn join(&self, key: &str) -> Flight {
        let mut map = self.in_flight.lock();
        if let Some(rx) = map.get(key) {
            debug!(key, "Joining in-flight computation");
            return Flight::Follower(FlightWaiter { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(State::Running);
        map.insert(key.to_string(), rx);
        Flight::Leader(FlightGuard {
            key: key.to_string(),
            tx: Some(tx),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Number of keys currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Returns true if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held by the leader. Dropping it without completing lets followers take
/// the work over.
pub struct FlightGuard {
    key: String,
    tx: Option<watch::Sender<State>>,
    in_flight: FlightMap,
}

impl FlightGuard {
    /// Publishes the outcome to every follower.
    pub fn complete(mut self, outcome: Result<(), ProxyError>) {
        self.publish(State::Done(outcome));
    }

    fn publish(&mut self, state: State) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        self.in_flight.lock().remove(&self.key);
        let _ = tx.send(state);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(key = %self.key, "In-flight computation abandoned");
            self.publish(State::Abandoned);
        }
    }
}

/// Held by a follower.
pub struct FlightWaiter {
    rx: watch::Receiver<State>,
}

impl FlightWaiter {
    /// Waits for the leader's outcome.
    ///
    /// Returns `None` if the leader went away without one; the caller
    /// should [`SingleFlight::join`] again.
    pub async fn wait(mut self) -> Option<Result<(), ProxyError>> {
        let state = match self.rx.wait_for(|state| !matches!(state, State::Running)).await {
            Ok(state) => (*state).clone(),
            Err(_) => State::Abandoned,
        };
        match state {
            State::Done(outcome) => Some(outcome),
            State::Running | State::Abandoned => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leader(flight: Flight) -> FlightGuard {
        match flight {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("expected leader"),
        }
    }

    fn follower(flight: Flight) -> FlightWaiter {
        match flight {
            Flight::Follower(waiter) => waiter,
            Flight::Leader(_) => panic!("expected follower"),
        }
    }

    #[tokio::test]
    async fn test_followers_share_success() {
        let flights = SingleFlight::new();
        let guard = leader(flights.join("k"));
        let a = follower(flights.join("k"));
        let b = follower(flights.join("k"));

        let waiting = tokio::spawn(async move { (a.wait().await, b.wait().await) });
        guard.complete(Ok(()));

        let (a, b) = waiting.await.unwrap();
        assert!(matches!(a, Some(Ok(()))) && matches!(b, Some(Ok(()))));
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_followers_share_failure() {
        let flights = SingleFlight::new();
        let guard = leader(flights.join("k"));
        let waiter = follower(flights.join("k"));

        guard.complete(Err(ProxyError::upstream("timeout")));

        let err = waiter.wait().await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamFetch { .. }));
    }

    #[tokio::test]
    async fn test_dropped_leader_lets_follower_take_over() {
        let flights = SingleFlight::new();
        let guard = leader(flights.join("k"));
        let waiter = follower(flights.join("k"));

        drop(guard);

        assert!(waiter.wait().await.is_none());
        assert!(flights.is_empty());
        let _next = leader(flights.join("k"));
    }

    #[tokio::test]
    async fn test_cancelled_leader_task_releases_followers() {
        let flights = SingleFlight::new();
        let guard = leader(flights.join("k"));
        let waiter = follower(flights.join("k"));

        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        task.abort();

        assert!(waiter.wait().await.is_none());
        assert!(flights.is_empty());
    }

    #[test]
    fn test_new_leader_after_completion() {
        let flights = SingleFlight::new();
        leader(flights.join("k")).complete(Ok(()));
        let _next = leader(flights.join("k"));
        let _other = leader(flights.join("other"));
        assert_eq!(flights.len(), 2);
    }
}
