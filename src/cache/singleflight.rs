//! Per-key deduplication of concurrent work.
//!
//! The first caller for a key becomes the leader and spawns the work on its own
//! task; callers arriving while it is pending await the same task instead of
//! starting their own. The task runs to completion even if every caller goes
//! away, and it removes its registry entry when it finishes, panics or is
//! aborted, so a later call for the same key starts fresh.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use thiserror::Error;

/// Whether a caller started the work or joined work already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

/// The spawned work panicked or was cancelled before producing a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("in-flight work for `{key}` did not complete: {reason}")]
pub struct FlightAborted {
    pub key: String,
    pub reason: String,
}

type FlightFuture<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;

struct Flight<T: Clone> {
    id: u64,
    future: FlightFuture<T>,
}

type Registry<T> = Arc<DashMap<String, Flight<T>>>;

/// Removes the flight from the registry when the spawned task ends.
struct Deregister<T: Clone> {
    registry: Registry<T>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for Deregister<T> {
    fn drop(&mut self) {
        self.registry
            .remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}

pub struct SingleFlight<T: Clone> {
    inflight: Registry<T>,
    next_id: AtomicU64,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work currently registered.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Run `work` for `key` unless an identical call is already pending, in which
    /// case wait for that call's result instead. `work` is only invoked by the
    /// leader. Must be called from within a Tokio runtime.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> (Result<T, FlightAborted>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (future, role) = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => (occupied.get().future.clone(), FlightRole::Follower),
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let guard = Deregister {
                    registry: Arc::clone(&self.inflight),
                    key: key.to_string(),
                    id,
                };
                let pending = work();
                let task = tokio::spawn(async move {
                    let _guard = guard;
                    pending.await
                });
                let owned_key = key.to_string();
                let future = async move {
                    task.await.map_err(|err| FlightAborted {
                        key: owned_key,
                        reason: err.to_string(),
                    })
                }
                .boxed()
                .shared();
                vacant.insert(Flight {
                    id,
                    future: future.clone(),
                });
                (future, FlightRole::Leader)
            }
        };

        (future.await, role)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use tokio::sync::{Semaphore, oneshot};

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flights: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel::<()>();

        let leader = {
            let flights = flights.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                flights
                    .run("card/Hello.png", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        let _ = gate.await;
                        7
                    })
                    .await
            })
        };

        while flights.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let follower = {
            let flights = flights.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                flights
                    .run("card/Hello.png", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        0
                    })
                    .await
            })
        };

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        release.send(()).expect("release leader");

        let (leader_value, leader_role) = leader.await.expect("leader task");
        let (follower_value, follower_role) = follower.await.expect("follower task");

        assert_eq!(leader_value, Ok(7));
        assert_eq!(follower_value, Ok(7));
        assert_eq!(leader_role, FlightRole::Leader);
        assert_eq!(follower_role, FlightRole::Follower);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn completed_work_is_not_reused() {
        let flights: SingleFlight<usize> = SingleFlight::new();
        let executions = AtomicUsize::new(0);

        for expected in 1..=2 {
            let count = executions.fetch_add(1, Ordering::SeqCst) + 1;
            let (value, role) = flights.run("k", move || async move { count }).await;
            assert_eq!(value, Ok(expected));
            assert_eq!(role, FlightRole::Leader);
        }
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let flights: SingleFlight<&'static str> = SingleFlight::new();
        let (a, _) = flights.run("a", || async { "a" }).await;
        let (b, _) = flights.run("b", || async { "b" }).await;
        assert_eq!((a, b), (Ok("a"), Ok("b")));
    }

    #[tokio::test]
    async fn dropped_leader_does_not_strand_work() {
        let flights: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        // One slot, held for the duration of the work.
        let slots = Arc::new(Semaphore::new(1));
        let finished = Arc::new(AtomicUsize::new(0));

        let leader = {
            let flights = flights.clone();
            let slots = slots.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                flights
                    .run("a", move || async move {
                        let _permit = slots.acquire_owned().await.expect("slot");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        1
                    })
                    .await
            })
        };

        while flights.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        leader.abort();
        assert!(leader.await.expect_err("aborted").is_cancelled());

        tokio::time::timeout(Duration::from_secs(5), async {
            while flights.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("abandoned flight deregisters");
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(slots.available_permits(), 1);

        let slots_for_b = slots.clone();
        let (value, role) = tokio::time::timeout(
            Duration::from_secs(1),
            flights.run("b", move || async move {
                let _permit = slots_for_b.acquire_owned().await.expect("slot");
                2
            }),
        )
        .await
        .expect("unrelated key runs");
        assert_eq!(value, Ok(2));
        assert_eq!(role, FlightRole::Leader);
    }

    #[tokio::test]
    async fn panicking_work_is_reported_and_deregistered() {
        let flights: SingleFlight<u32> = SingleFlight::new();

        let (value, _) = flights
            .run("boom", || async { panic!("render task exploded") })
            .await;

        let err = value.expect_err("panicked");
        assert_eq!(err.key, "boom");
        assert_eq!(flights.in_flight(), 0);
    }
}
