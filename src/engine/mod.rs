//! The poll allocation engine: eligibility rules, entry admission, the
//! idempotent draw, lifecycle monitoring and per-poll view synchronization.

pub mod admission;
pub mod draw;
pub mod identity;
pub mod lifecycle;
pub mod polls;
pub mod rules;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::db::schema::PollId;
use crate::db::store::Store;
use crate::engine::admission::AdmissionService;
use crate::engine::draw::DrawExecutor;
use crate::engine::identity::{AttemptStore, IdentityService};
use crate::engine::lifecycle::LifecycleMonitor;
use crate::engine::polls::PollManager;
use crate::engine::sync::PollObserver;

/// Shared handles every engine component needs.
pub struct Engine<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl<S: Store> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            store_timeout: self.store_timeout,
        }
    }
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, store_timeout: Duration) -> Self {
        Self { store, clock, store_timeout }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    pub fn admission(&self) -> AdmissionService<S> {
        AdmissionService::new(self.clone())
    }

    pub fn draws(&self) -> DrawExecutor<S> {
        DrawExecutor::new(self.clone())
    }

    pub fn polls(&self) -> PollManager<S> {
        PollManager::new(self.clone())
    }

    pub fn monitor(&self, interval: Duration) -> LifecycleMonitor<S> {
        LifecycleMonitor::new(self.clone(), interval)
    }

    pub fn observer(&self, id_poll: PollId, refresh_interval: Duration) -> PollObserver<S> {
        PollObserver::new(self.clone(), id_poll, refresh_interval)
    }

    pub fn identity(&self, attempts: Arc<dyn AttemptStore>, max_attempts: u32, lockout: Duration) -> IdentityService<S> {
        IdentityService::new(self.clone(), attempts, max_attempts, lockout)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use super::Engine;
    use crate::clock::ManualClock;
    use crate::db::memory::MemoryStore;
    use crate::db::schema::{Exclusions, NewPoll, Poll, SelectionPolicy, SlotCapacity, UserId};
    use crate::db::store::Store;

    pub const OWNER: UserId = 1000;

    pub fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    pub fn engine() -> (Engine<MemoryStore>, Arc<ManualClock>) {
        engine_with(MemoryStore::new())
    }

    pub fn engine_with(store: MemoryStore) -> (Engine<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let engine = Engine::new(Arc::new(store), clock.clone(), Duration::from_secs(5));
        (engine, clock)
    }

    pub fn new_poll(policy: SelectionPolicy, capacity: SlotCapacity, exclusions: Exclusions) -> NewPoll {
        NewPoll {
            title: "Office days".to_owned(),
            description: "Desk allocation".to_owned(),
            capacity,
            closes_at: start() + chrono::Duration::hours(1),
            policy,
            exclusions,
        }
    }

    pub async fn poll(engine: &Engine<MemoryStore>, policy: SelectionPolicy, capacity: SlotCapacity) -> Poll {
        poll_with(engine, policy, capacity, Exclusions::default()).await
    }

    pub async fn poll_with(
        engine: &Engine<MemoryStore>,
        policy: SelectionPolicy,
        capacity: SlotCapacity,
        exclusions: Exclusions,
    ) -> Poll {
        let mut new = new_poll(policy, capacity, exclusions);
        new.closes_at = engine.now() + chrono::Duration::hours(1);
        engine.polls().create_poll(OWNER, new).await.unwrap()
    }

    /// Registers `n` entrants and returns their ids.
    pub async fn entrants(engine: &Engine<MemoryStore>, n: usize) -> Vec<UserId> {
        let mut ids = Vec::new();
        for i in 0..n {
            let e = engine.store().add_entrant(&format!("Entrant {}", i), "1234").await.unwrap();
            ids.push(e.id);
        }
        ids
    }
}
