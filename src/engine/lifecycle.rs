//! Lifecycle monitoring.
//!
//! ```text
//! OPEN ──(closes_at reached | capacity exhausted)──► PENDING_DRAW ──(draw ok)──► CLOSED
//! ```
//!
//! Every running instance watches independently and shares nothing with the
//! others. A monitor only calls [`DrawExecutor::draw`] after reading the poll
//! from the store and finding it expired and undrawn; redundant calls from
//! other instances resolve to the same outcome because the draw is idempotent.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use evlog::meta;
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;

use crate::db::schema::{Poll, PollId, SelectionPolicy, Table};
use crate::db::store::Store;
use crate::engine::draw::DrawExecutor;
use crate::engine::Engine;
use crate::error::{DrawError, StoreError};
use crate::runtime::get_logger;
use crate::support::bounded::bounded;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Open,
    PendingDraw,
    Closed,
}

/// Phase of `poll` given how many results it holds.
pub fn phase(poll: &Poll, results: usize, now: DateTime<Utc>) -> Phase {
    if poll.drawn {
        return Phase::Closed;
    }
    if !poll.open || now >= poll.closes_at {
        return Phase::PendingDraw;
    }
    if poll.policy == SelectionPolicy::Fcfs && results >= poll.capacity.total() as usize {
        return Phase::PendingDraw;
    }
    Phase::Open
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub drawn: usize,
    pub failed: usize,
}

pub struct LifecycleMonitor<S: Store> {
    engine: Engine<S>,
    executor: DrawExecutor<S>,
    interval: Duration,
}

impl<S: Store> LifecycleMonitor<S> {
    pub fn new(engine: Engine<S>, interval: Duration) -> Self {
        Self {
            executor: engine.draws(),
            engine,
            interval,
        }
    }

    pub fn with_executor(mut self, executor: DrawExecutor<S>) -> Self {
        self.executor = executor;
        self
    }

    /// Reads the poll from the store and draws it if it is due.
    /// Returns the phase the poll is in afterwards.
    pub async fn check(&self, id_poll: PollId) -> Result<Phase, DrawError> {
        let store = self.engine.store();
        let limit = self.engine.store_timeout();
        let now = self.engine.now();

        let poll = bounded(limit, store.get_poll(id_poll)).await
            .map_err(|e| DrawError::from_store(id_poll, e))?
            .ok_or(DrawError::NotFound { id_poll })?;

        let results = match poll.policy {
            SelectionPolicy::Fcfs if !poll.drawn => bounded(limit, store.list_results(id_poll)).await
                .map_err(|e| DrawError::from_store(id_poll, e))?
                .len(),
            _ => 0,
        };

        match phase(&poll, results, now) {
            Phase::PendingDraw => {
                get_logger().info("Poll is due for its draw.", meta! {
                    "PollID" => id_poll,
                    "ClosesAt" => poll.closes_at,
                });
                self.executor.draw(id_poll).await?;
                Ok(Phase::Closed)
            }
            other => Ok(other),
        }
    }

    /// Checks every undrawn poll once.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let pending = bounded(self.engine.store_timeout(), self.engine.store().list_pending_polls()).await?;

        let checks = pending.iter().map(|p| self.check(p.id));
        let mut report = SweepReport {
            checked: pending.len(),
            ..SweepReport::default()
        };

        for r in join_all(checks).await {
            match r {
                Ok(Phase::Closed) => report.drawn += 1,
                Ok(_) => {}
                Err(_) => report.failed += 1,
            }
        }

        Ok(report)
    }

    /// Watches one poll until it is closed.
    pub async fn watch(&self, id_poll: PollId) -> Result<(), DrawError> {
        let mut changes = self.engine.store().subscribe();
        let mut feed_open = true;
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                ev = changes.recv(), if feed_open => match ev {
                    Ok(ev) if ev.id_poll != id_poll => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        feed_open = false;
                        continue;
                    }
                },
            }

            match self.check(id_poll).await {
                Ok(Phase::Closed) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    get_logger().error_with_err("Lifecycle check failed; will retry.", &e, meta! {
                        "PollID" => id_poll,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sweeps on every tick and checks individual polls as their entries
    /// change, until `shutdown` resolves.
    pub async fn run_sweeps<F: Future<Output = ()>>(&self, shutdown: F) {
        let mut changes = self.engine.store().subscribe();
        let mut feed_open = true;
        let mut ticker = tokio::time::interval(self.interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    get_logger().info("Lifecycle monitor stopping.", None);
                    return;
                }
                _ = ticker.tick() => self.sweep_logged().await,
                ev = changes.recv(), if feed_open => match ev {
                    Ok(ev) if ev.table != Table::Result => {
                        if let Err(e) = self.check(ev.id_poll).await {
                            get_logger().error_with_err("Lifecycle check failed.", &e, meta! {
                                "PollID" => ev.id_poll,
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        get_logger().debug("Change feed lagged; sweeping all pending polls.", meta! {
                            "Missed" => n,
                        });
                        self.sweep_logged().await;
                    }
                    Err(RecvError::Closed) => feed_open = false,
                },
            }
        }
    }

    async fn sweep_logged(&self) {
        match self.sweep().await {
            Ok(report) if report.drawn > 0 || report.failed > 0 => {
                get_logger().info("Lifecycle sweep finished.", meta! {
                    "Checked" => report.checked,
                    "Drawn" => report.drawn,
                    "Failed" => report.failed,
                });
            }
            Ok(_) => {}
            Err(e) => {
                get_logger().error_with_err("Lifecycle sweep failed.", &e, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::schema::{Slot, SlotCapacity};
    use crate::db::store::{DrawInput, WinnerSelector};
    use crate::engine::draw::select_winners;
    use crate::engine::testing;

    #[test]
    fn phases() {
        let (engine, _) = testing::engine();
        let now = engine.now();
        let mut poll = crate::db::schema::Poll {
            id: 1,
            time_created: now,
            id_owner: testing::OWNER,
            title: "t".to_owned(),
            description: String::new(),
            capacity: SlotCapacity::new(1, 1, 0),
            closes_at: now + ChronoDuration::minutes(5),
            policy: SelectionPolicy::Fcfs,
            open: true,
            drawn: false,
            exclusions: Default::default(),
        };

        assert_eq!(phase(&poll, 1, now), Phase::Open);
        assert_eq!(phase(&poll, 2, now), Phase::PendingDraw);
        assert_eq!(phase(&poll, 0, poll.closes_at), Phase::PendingDraw);

        poll.policy = SelectionPolicy::Random;
        assert_eq!(phase(&poll, 5, now), Phase::Open);

        poll.open = false;
        assert_eq!(phase(&poll, 0, now), Phase::PendingDraw);

        poll.drawn = true;
        assert_eq!(phase(&poll, 0, now), Phase::Closed);
    }

    /// Counts how often the store actually ran a selection.
    struct CountingSelector(AtomicUsize);

    impl WinnerSelector for CountingSelector {
        fn select(&self, input: &DrawInput<'_>) -> Vec<(crate::db::schema::UserId, Slot)> {
            self.0.fetch_add(1, Ordering::SeqCst);
            select_winners(&mut rand::thread_rng(), input)
        }
    }

    #[tokio::test]
    async fn open_poll_is_left_alone() {
        let (engine, _) = testing::engine();
        let poll = testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;

        let selector = Arc::new(CountingSelector(AtomicUsize::new(0)));
        let monitor = engine.monitor(std::time::Duration::from_secs(30))
            .with_executor(engine.draws().with_selector(selector.clone()));

        assert_eq!(monitor.check(poll.id).await.unwrap(), Phase::Open);
        assert_eq!(selector.0.load(Ordering::SeqCst), 0);
        assert!(!engine.store().get_poll(poll.id).await.unwrap().unwrap().drawn);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_monitors_draw_an_expired_poll_once() {
        let (engine, clock) = testing::engine();
        let users = testing::entrants(&engine, 4).await;
        let poll = testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;
        for u in &users {
            engine.admission().admit(poll.id, *u, Slot::Morning).await.unwrap();
        }
        clock.advance(ChronoDuration::hours(1));

        let selector = Arc::new(CountingSelector(AtomicUsize::new(0)));
        let id_poll = poll.id;
        let checks = (0..8).map(|_| {
            let monitor = engine.monitor(std::time::Duration::from_secs(30))
                .with_executor(engine.draws().with_selector(selector.clone()));
            tokio::spawn(async move { monitor.check(id_poll).await })
        }).collect::<Vec<_>>();

        for r in join_all(checks).await {
            assert_eq!(r.unwrap().unwrap(), Phase::Closed);
        }
        assert_eq!(selector.0.load(Ordering::SeqCst), 1);
        assert_eq!(engine.store().list_results(id_poll).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_draws_only_due_polls() {
        let (engine, clock) = testing::engine();
        let due = testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;
        clock.advance(ChronoDuration::minutes(30));
        let later = testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;
        clock.advance(ChronoDuration::minutes(31));

        let report = engine.monitor(std::time::Duration::from_secs(30)).sweep().await.unwrap();
        assert_eq!(report, SweepReport { checked: 2, drawn: 1, failed: 0 });

        assert!(engine.store().get_poll(due.id).await.unwrap().unwrap().drawn);
        assert!(!engine.store().get_poll(later.id).await.unwrap().unwrap().drawn);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_returns_once_the_poll_expires() {
        let (engine, clock) = testing::engine();
        let poll = testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;

        let monitor = engine.monitor(std::time::Duration::from_secs(30));
        let id_poll = poll.id;
        let watcher = tokio::spawn(async move { monitor.watch(id_poll).await });

        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert!(!watcher.is_finished());

        clock.advance(ChronoDuration::hours(1));
        tokio::time::sleep(std::time::Duration::from_secs(31)).await;

        watcher.await.unwrap().unwrap();
        assert!(engine.store().get_poll(id_poll).await.unwrap().unwrap().drawn);
    }

    #[tokio::test(start_paused = true)]
    async fn run_sweeps_stops_on_shutdown() {
        let (engine, clock) = testing::engine();
        let poll = testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;
        clock.advance(ChronoDuration::hours(2));

        let monitor = engine.monitor(std::time::Duration::from_secs(30));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let runner = tokio::spawn(async move {
            monitor.run_sweeps(async {
                let _ = stopped.await;
            }).await
        });

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(engine.store().get_poll(poll.id).await.unwrap().unwrap().drawn);

        stop.send(()).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn lagged_feed_triggers_a_sweep() {
        let (engine, clock) = testing::engine_with(MemoryStore::with_change_buffer(1));
        let due = testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;

        // Only the first tick sweeps; the next one is an hour away.
        let monitor = engine.monitor(std::time::Duration::from_secs(3600));
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let runner = tokio::spawn(async move {
            monitor.run_sweeps(async {
                let _ = stopped.await;
            }).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!engine.store().get_poll(due.id).await.unwrap().unwrap().drawn);

        // No event names the expired poll, so only the lag can get it drawn.
        clock.advance(ChronoDuration::hours(2));
        for _ in 0..3 {
            testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;
        }

        let mut drawn = false;
        for _ in 0..100 {
            drawn = engine.store().get_poll(due.id).await.unwrap().unwrap().drawn;
            if drawn {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(drawn);

        stop.send(()).unwrap();
        runner.await.unwrap();
    }
}
