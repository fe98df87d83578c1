//! Keeps a local view of one poll in step with the store.
//!
//! Change events name the table that changed, so only that part of the view
//! is re-read. Each part has a [`FetchGuard`]: while a fetch is in flight,
//! further events for that part only mark it dirty, and the running fetch
//! makes one more pass before it finishes. A storm of events therefore costs
//! at most one outstanding request per part.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evlog::meta;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::db::schema::{ChangeEvent, Entry, Poll, PollId, PollResult, Table};
use crate::db::store::Store;
use crate::engine::Engine;
use crate::error::StoreError;
use crate::runtime::get_logger;
use crate::support::bounded::bounded;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Poll,
    Entries,
    Results,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Poll, Resource::Entries, Resource::Results];
}

impl From<Table> for Resource {
    fn from(t: Table) -> Self {
        match t {
            Table::Poll => Resource::Poll,
            Table::Entry => Resource::Entries,
            Table::Result => Resource::Results,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollView {
    pub poll: Option<Poll>,
    pub entries: Vec<Entry>,
    pub results: Vec<PollResult>,
}

/// Single-flight flag with a trailing pass.
#[derive(Debug, Default)]
pub struct FetchGuard {
    in_flight: AtomicBool,
    dirty: AtomicBool,
}

impl FetchGuard {
    /// Records that the resource is stale. Returns true if the caller now
    /// owns the fetch; false if one is already running and will pick the
    /// change up.
    pub fn try_begin(&self) -> bool {
        self.dirty.store(true, Ordering::SeqCst);
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Call before each read.
    pub fn start_pass(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    /// Call after each read. Returns true if another pass is needed, in
    /// which case the caller still owns the fetch.
    pub fn finish_pass(&self) -> bool {
        if self.dirty.load(Ordering::SeqCst) {
            return true;
        }
        self.in_flight.store(false, Ordering::SeqCst);

        // A change may have landed between the load above and the release.
        self.dirty.load(Ordering::SeqCst)
            && self.in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Releases the fetch after a failed read.
    pub fn abandon(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct Inner<S: Store> {
    engine: Engine<S>,
    id_poll: PollId,
    refresh_interval: Duration,
    view: RwLock<PollView>,
    poll_guard: FetchGuard,
    entries_guard: FetchGuard,
    results_guard: FetchGuard,
}

impl<S: Store> Inner<S> {
    fn guard(&self, resource: Resource) -> &FetchGuard {
        match resource {
            Resource::Poll => &self.poll_guard,
            Resource::Entries => &self.entries_guard,
            Resource::Results => &self.results_guard,
        }
    }
}

pub struct PollObserver<S: Store> {
    inner: Arc<Inner<S>>,
}

impl<S: Store> Clone for PollObserver<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: Store> PollObserver<S> {
    pub fn new(engine: Engine<S>, id_poll: PollId, refresh_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                id_poll,
                refresh_interval,
                view: RwLock::new(PollView::default()),
                poll_guard: FetchGuard::default(),
                entries_guard: FetchGuard::default(),
                results_guard: FetchGuard::default(),
            }),
        }
    }

    pub fn id_poll(&self) -> PollId {
        self.inner.id_poll
    }

    pub async fn snapshot(&self) -> PollView {
        self.inner.view.read().await.clone()
    }

    /// Re-reads every part of the view.
    pub async fn refresh_all(&self) -> Result<(), StoreError> {
        let (a, b, c) = futures::join!(
            self.fetch(Resource::Poll),
            self.fetch(Resource::Entries),
            self.fetch(Resource::Results),
        );
        a.and(b).and(c).map(|_| ())
    }

    /// Re-reads one part of the view. Returns false without touching the
    /// store if a fetch for it was already running; that fetch will make a
    /// trailing pass.
    pub async fn fetch(&self, resource: Resource) -> Result<bool, StoreError> {
        let guard = self.inner.guard(resource);
        if !guard.try_begin() {
            return Ok(false);
        }

        loop {
            guard.start_pass();
            if let Err(e) = self.load(resource).await {
                guard.abandon();
                return Err(e);
            }
            if !guard.finish_pass() {
                return Ok(true);
            }
        }
    }

    async fn load(&self, resource: Resource) -> Result<(), StoreError> {
        let store = self.inner.engine.store();
        let limit = self.inner.engine.store_timeout();
        let id_poll = self.inner.id_poll;

        match resource {
            Resource::Poll => {
                let poll = bounded(limit, store.get_poll(id_poll)).await?;
                self.inner.view.write().await.poll = poll;
            }
            Resource::Entries => {
                let entries = bounded(limit, store.list_entries(id_poll)).await?;
                self.inner.view.write().await.entries = entries;
            }
            Resource::Results => {
                let results = bounded(limit, store.list_results(id_poll)).await?;
                self.inner.view.write().await.results = results;
            }
        }

        Ok(())
    }

    /// Starts a fetch for the part of the view `ev` touches. Events for
    /// other polls are ignored.
    pub fn on_change(&self, ev: ChangeEvent) -> Option<JoinHandle<()>> {
        if ev.id_poll != self.inner.id_poll {
            return None;
        }

        let this = self.clone();
        let resource = Resource::from(ev.table);
        Some(tokio::spawn(async move {
            if let Err(e) = this.fetch(resource).await {
                get_logger().error_with_err("Could not refresh poll view.", &e, meta! {
                    "PollID" => this.inner.id_poll,
                    "Resource" => format!("{:?}", resource),
                });
            }
        }))
    }

    /// Follows change events and refreshes periodically until `shutdown`
    /// resolves.
    pub async fn run<F: Future<Output = ()>>(&self, shutdown: F) {
        let mut changes = self.inner.engine.store().subscribe();
        let mut feed_open = true;
        let mut ticker = tokio::time::interval(self.inner.refresh_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                _ = ticker.tick() => self.refresh_logged().await,
                ev = changes.recv(), if feed_open => match ev {
                    Ok(ev) => {
                        self.on_change(ev);
                    }
                    Err(RecvError::Lagged(n)) => {
                        get_logger().debug("Change feed lagged; refreshing whole view.", meta! {
                            "PollID" => self.inner.id_poll,
                            "Missed" => n,
                        });
                        self.refresh_logged().await;
                    }
                    Err(RecvError::Closed) => {
                        get_logger().info("Change feed closed; falling back to periodic refresh.", meta! {
                            "PollID" => self.inner.id_poll,
                        });
                        feed_open = false;
                    }
                },
            }
        }
    }

    async fn refresh_logged(&self) {
        if let Err(e) = self.refresh_all().await {
            get_logger().error_with_err("Could not refresh poll view.", &e, meta! {
                "PollID" => self.inner.id_poll,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::schema::{SelectionPolicy, Slot, SlotCapacity};
    use crate::engine::testing;

    #[test]
    fn guard_admits_one_fetch_at_a_time() {
        let guard = FetchGuard::default();
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        assert!(guard.in_flight());
        guard.abandon();
        assert!(guard.try_begin());
    }

    #[test]
    fn change_during_fetch_forces_one_trailing_pass() {
        let guard = FetchGuard::default();
        assert!(guard.try_begin());

        guard.start_pass();
        assert!(!guard.try_begin());
        assert!(!guard.try_begin());
        assert!(guard.finish_pass());

        guard.start_pass();
        assert!(!guard.finish_pass());
        assert!(!guard.in_flight());
    }

    #[test]
    fn table_maps_to_resource() {
        assert_eq!(Resource::from(Table::Poll), Resource::Poll);
        assert_eq!(Resource::from(Table::Entry), Resource::Entries);
        assert_eq!(Resource::from(Table::Result), Resource::Results);
    }

    #[tokio::test]
    async fn fetch_reads_only_the_named_part() {
        let (engine, _) = testing::engine();
        let users = testing::entrants(&engine, 1).await;
        let poll = testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;

        let observer = engine.observer(poll.id, Duration::from_secs(3600));
        observer.refresh_all().await.unwrap();
        assert_eq!(observer.snapshot().await, PollView {
            poll: Some(poll.clone()),
            entries: Vec::new(),
            results: Vec::new(),
        });

        engine.admission().admit(poll.id, users[0], Slot::Morning).await.unwrap();
        engine.draws().draw(poll.id).await.unwrap();

        assert!(observer.fetch(Resource::Entries).await.unwrap());
        let view = observer.snapshot().await;
        assert_eq!(view.entries.len(), 1);
        assert!(view.results.is_empty());
        assert!(!view.poll.unwrap().drawn);

        observer.refresh_all().await.unwrap();
        let view = observer.snapshot().await;
        assert_eq!(view.results.len(), 1);
        assert!(view.poll.unwrap().drawn);
    }

    #[tokio::test]
    async fn events_for_other_polls_are_ignored() {
        let (engine, _) = testing::engine();
        let observer = engine.observer(7, Duration::from_secs(3600));
        assert!(observer.on_change(ChangeEvent { id_poll: 8, table: Table::Entry }).is_none());
        observer.on_change(ChangeEvent { id_poll: 7, table: Table::Entry }).unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn running_observer_follows_admissions_and_the_draw() {
        let (engine, _) = testing::engine();
        let users = testing::entrants(&engine, 3).await;
        let poll = testing::poll(&engine, SelectionPolicy::Fcfs, SlotCapacity::new(2, 0, 0)).await;

        let observer = engine.observer(poll.id, Duration::from_secs(3600));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let runner = {
            let observer = observer.clone();
            tokio::spawn(async move {
                observer.run(async {
                    let _ = stopped.await;
                }).await
            })
        };

        for u in &users {
            let _ = engine.admission().admit(poll.id, *u, Slot::Morning).await;
        }

        let mut view = observer.snapshot().await;
        for _ in 0..200 {
            view = observer.snapshot().await;
            let closed = view.poll.as_ref().map(|p| p.drawn).unwrap_or(false);
            if closed && view.entries.len() == 2 && view.results.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(view.entries.len(), 2);
        assert_eq!(view.results.len(), 2);
        assert!(view.poll.unwrap().drawn);

        stop.send(()).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn lagged_feed_refreshes_every_part() {
        let (engine, _) = testing::engine_with(MemoryStore::with_change_buffer(1));
        let users = testing::entrants(&engine, 2).await;
        let poll = testing::poll(&engine, SelectionPolicy::Fcfs, SlotCapacity::new(2, 0, 0)).await;

        let observer = engine.observer(poll.id, Duration::from_secs(3600));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let runner = {
            let observer = observer.clone();
            tokio::spawn(async move {
                observer.run(async {
                    let _ = stopped.await;
                }).await
            })
        };
        for _ in 0..100 {
            if observer.snapshot().await.poll.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let before = observer.snapshot().await;
        assert!(before.entries.is_empty());

        // Fills the poll, then buries its events under one for another poll.
        for u in &users {
            engine.admission().admit(poll.id, *u, Slot::Morning).await.unwrap();
        }
        testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;

        let expected = PollView {
            poll: engine.store().get_poll(poll.id).await.unwrap(),
            entries: engine.store().list_entries(poll.id).await.unwrap(),
            results: engine.store().list_results(poll.id).await.unwrap(),
        };
        assert!(expected.poll.as_ref().unwrap().drawn);

        let mut view = observer.snapshot().await;
        for _ in 0..100 {
            view = observer.snapshot().await;
            if view == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(view, expected);

        stop.send(()).unwrap();
        runner.await.unwrap();
    }
}
