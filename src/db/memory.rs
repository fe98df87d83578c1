//! In-process store. One mutex over the whole state plays the role of the
//! poll row lock, so every trait call is atomic exactly as it is against
//! Postgres. Used by tests and single-instance deployments.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};

use crate::db::schema::{ChangeEvent, Entrant, Entry, NewPoll, Poll, PollId, PollResult, Slot, Table, UserId};
use crate::db::store::{DrawInput, DrawRecord, EntryInsert, FcfsAdmission, Rejection, Store, WinnerSelector};
use crate::error::StoreError;

const CHANGE_BUFFER: usize = 256;

#[derive(Default)]
struct State {
    next_poll: PollId,
    next_entrant: UserId,
    polls: BTreeMap<PollId, Poll>,
    entrants: BTreeMap<UserId, Entrant>,
    entries: Vec<Entry>,
    results: Vec<PollResult>,
}

impl State {
    fn entry(&self, id_poll: PollId, id_user: UserId) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id_poll == id_poll && e.id_user == id_user)
    }

    fn results_for(&self, id_poll: PollId) -> Vec<PollResult> {
        self.results.iter().filter(|r| r.id_poll == id_poll).cloned().collect()
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_change_buffer(CHANGE_BUFFER)
    }

    /// Keeps at most `capacity` undelivered change events per subscriber;
    /// slower subscribers see `RecvError::Lagged`.
    pub fn with_change_buffer(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));

        Self {
            state: Mutex::new(State {
                next_poll: 1,
                next_entrant: 1,
                ..State::default()
            }),
            changes,
        }
    }

    fn notify(&self, id_poll: PollId, table: Table) {
        // No subscribers is fine.
        let _ = self.changes.send(ChangeEvent { id_poll, table });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_poll(&self, id_owner: UserId, poll: &NewPoll, now: DateTime<Utc>) -> Result<Poll, StoreError> {
        let mut state = self.state.lock().await;

        let id = state.next_poll;
        state.next_poll += 1;

        let created = Poll {
            id,
            time_created: now,
            id_owner,
            title: poll.title.clone(),
            description: poll.description.clone(),
            capacity: poll.capacity,
            closes_at: poll.closes_at,
            policy: poll.policy,
            open: true,
            drawn: false,
            exclusions: poll.exclusions.clone(),
        };
        state.polls.insert(id, created.clone());
        drop(state);

        self.notify(id, Table::Poll);
        Ok(created)
    }

    async fn get_poll(&self, id_poll: PollId) -> Result<Option<Poll>, StoreError> {
        Ok(self.state.lock().await.polls.get(&id_poll).cloned())
    }

    async fn list_pending_polls(&self) -> Result<Vec<Poll>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.polls.values().filter(|p| !p.drawn).cloned().collect())
    }

    async fn get_entry(&self, id_poll: PollId, id_user: UserId) -> Result<Option<Entry>, StoreError> {
        Ok(self.state.lock().await.entry(id_poll, id_user).cloned())
    }

    async fn list_entries(&self, id_poll: PollId) -> Result<Vec<Entry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.entries.iter().filter(|e| e.id_poll == id_poll).cloned().collect())
    }

    async fn list_results(&self, id_poll: PollId) -> Result<Vec<PollResult>, StoreError> {
        Ok(self.state.lock().await.results_for(id_poll))
    }

    async fn recent_winners(
        &self,
        id_owner: UserId,
        since: DateTime<Utc>,
        excluding: Option<PollId>,
    ) -> Result<HashSet<UserId>, StoreError> {
        let state = self.state.lock().await;

        Ok(state.results.iter()
            .filter(|r| Some(r.id_poll) != excluding && r.time_created >= since)
            .filter(|r| state.polls.get(&r.id_poll).map_or(false, |p| p.id_owner == id_owner))
            .map(|r| r.id_user)
            .collect())
    }

    async fn count_entrants(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.entrants.len() as i64)
    }

    async fn add_entrant(&self, name: &str, pin: &str) -> Result<Entrant, StoreError> {
        let mut state = self.state.lock().await;

        let id = state.next_entrant;
        state.next_entrant += 1;

        let entrant = Entrant {
            id,
            name: name.to_owned(),
            pin: pin.to_owned(),
        };
        state.entrants.insert(id, entrant.clone());

        Ok(entrant)
    }

    async fn get_entrant(&self, id_user: UserId) -> Result<Option<Entrant>, StoreError> {
        Ok(self.state.lock().await.entrants.get(&id_user).cloned())
    }

    async fn insert_random_entry(
        &self,
        id_poll: PollId,
        id_user: UserId,
        slot: Slot,
        now: DateTime<Utc>,
    ) -> Result<EntryInsert, StoreError> {
        let mut state = self.state.lock().await;

        let poll = state.polls.get(&id_poll).ok_or(StoreError::NotFound { what: "poll" })?;
        if !poll.accepts_entries(now) {
            return Ok(EntryInsert::Rejected(Rejection::PollClosed));
        }
        if state.entry(id_poll, id_user).is_some() {
            return Ok(EntryInsert::Rejected(Rejection::AlreadyEntered));
        }

        let entry = Entry { id_poll, id_user, slot, time_created: now };
        state.entries.push(entry.clone());
        drop(state);

        self.notify(id_poll, Table::Entry);
        Ok(EntryInsert::Inserted(entry))
    }

    async fn try_admit_fcfs(
        &self,
        id_poll: PollId,
        id_user: UserId,
        slot: Slot,
        capacity: u32,
        now: DateTime<Utc>,
    ) -> Result<FcfsAdmission, StoreError> {
        let mut state = self.state.lock().await;

        let poll = state.polls.get(&id_poll).ok_or(StoreError::NotFound { what: "poll" })?;
        let total_capacity = poll.capacity.total() as usize;
        if !poll.accepts_entries(now) {
            return Ok(FcfsAdmission::rejected(Rejection::PollClosed, poll.drawn));
        }
        if state.entry(id_poll, id_user).is_some() {
            return Ok(FcfsAdmission::rejected(Rejection::AlreadyEntered, false));
        }

        let taken = state.results.iter().filter(|r| r.id_poll == id_poll && r.slot == slot).count();
        if taken >= capacity as usize {
            return Ok(FcfsAdmission::rejected(Rejection::SlotFull, false));
        }

        state.entries.push(Entry { id_poll, id_user, slot, time_created: now });
        state.results.push(PollResult { id_poll, id_user, slot, time_created: now });

        let filled = state.results.iter().filter(|r| r.id_poll == id_poll).count();
        let poll_full = filled >= total_capacity;
        if poll_full {
            if let Some(poll) = state.polls.get_mut(&id_poll) {
                poll.open = false;
                poll.drawn = true;
            }
        }
        drop(state);

        self.notify(id_poll, Table::Entry);
        self.notify(id_poll, Table::Result);
        if poll_full {
            self.notify(id_poll, Table::Poll);
        }
        Ok(FcfsAdmission::admitted(poll_full))
    }

    async fn draw_random_winners(
        &self,
        id_poll: PollId,
        now: DateTime<Utc>,
        select: &dyn WinnerSelector,
    ) -> Result<DrawRecord, StoreError> {
        let mut state = self.state.lock().await;

        let poll = state.polls.get(&id_poll).cloned().ok_or(StoreError::NotFound { what: "poll" })?;
        if poll.drawn {
            return Ok(DrawRecord {
                results: state.results_for(id_poll),
                poll,
                newly_drawn: false,
            });
        }

        let entries: Vec<Entry> = state.entries.iter().filter(|e| e.id_poll == id_poll).cloned().collect();
        let recent_winners: HashSet<UserId> = match poll.exclusions.recent_winners.since(now) {
            None => HashSet::new(),
            Some(since) => state.results.iter()
                .filter(|r| r.id_poll != id_poll && r.time_created >= since)
                .filter(|r| state.polls.get(&r.id_poll).map_or(false, |p| p.id_owner == poll.id_owner))
                .map(|r| r.id_user)
                .collect(),
        };

        let winners = select.select(&DrawInput {
            poll: &poll,
            entries: &entries,
            recent_winners: &recent_winners,
        });

        // Mirror the (poll, user, slot) uniqueness constraint before writing
        // anything so a bad selection leaves no partial draw behind.
        let mut seen = HashSet::new();
        for (id_user, slot) in &winners {
            let exists = state.results.iter().any(|r| r.id_poll == id_poll && r.id_user == *id_user && r.slot == *slot);
            if exists || !seen.insert((*id_user, *slot)) {
                return Err(StoreError::Duplicate { constraint: "result_id_poll_id_user_slot_key".to_owned() });
            }
        }

        for (id_user, slot) in winners {
            state.results.push(PollResult { id_poll, id_user, slot, time_created: now });
        }
        let poll = match state.polls.get_mut(&id_poll) {
            Some(p) => {
                p.open = false;
                p.drawn = true;
                p.clone()
            }
            None => return Err(StoreError::NotFound { what: "poll" }),
        };
        let results = state.results_for(id_poll);
        drop(state);

        self.notify(id_poll, Table::Result);
        self.notify(id_poll, Table::Poll);
        Ok(DrawRecord { poll, results, newly_drawn: true })
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::schema::{Exclusions, SelectionPolicy, SlotCapacity};

    fn new_poll(policy: SelectionPolicy, capacity: SlotCapacity, now: DateTime<Utc>) -> NewPoll {
        NewPoll {
            title: "Friday desks".to_owned(),
            description: String::new(),
            capacity,
            closes_at: now + Duration::hours(1),
            policy,
            exclusions: Exclusions::default(),
        }
    }

    #[tokio::test]
    async fn fcfs_primitive_closes_poll_when_every_slot_is_full() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let poll = store.create_poll(1, &new_poll(SelectionPolicy::Fcfs, SlotCapacity::new(1, 1, 0), now), now).await.unwrap();

        let first = store.try_admit_fcfs(poll.id, 10, Slot::Morning, 1, now).await.unwrap();
        assert!(first.success);
        assert!(!first.poll_full);

        let second = store.try_admit_fcfs(poll.id, 11, Slot::Afternoon, 1, now).await.unwrap();
        assert!(second.success);
        assert!(second.poll_full);

        let poll = store.get_poll(poll.id).await.unwrap().unwrap();
        assert!(!poll.open);
        assert!(poll.drawn);

        let late = store.try_admit_fcfs(poll.id, 12, Slot::Afternoon, 1, now).await.unwrap();
        assert_eq!(late.rejection, Some(Rejection::PollClosed));
    }

    #[tokio::test]
    async fn random_entry_is_rejected_after_close_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let poll = store.create_poll(1, &new_poll(SelectionPolicy::Random, SlotCapacity::new(1, 0, 0), now), now).await.unwrap();

        let late = store.insert_random_entry(poll.id, 10, Slot::Morning, poll.closes_at).await.unwrap();
        assert_eq!(late, EntryInsert::Rejected(Rejection::PollClosed));
        assert!(store.list_entries(poll.id).await.unwrap().is_empty());
    }

    struct PicksTwice;

    impl WinnerSelector for PicksTwice {
        fn select(&self, _input: &DrawInput<'_>) -> Vec<(UserId, Slot)> {
            vec![(10, Slot::Morning), (10, Slot::Morning)]
        }
    }

    #[tokio::test]
    async fn bad_selection_leaves_poll_undrawn() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let poll = store.create_poll(1, &new_poll(SelectionPolicy::Random, SlotCapacity::new(2, 0, 0), now), now).await.unwrap();

        let err = store.draw_random_winners(poll.id, now, &PicksTwice).await.unwrap_err();
        assert_eq!(err.as_label(), "store_duplicate");

        let poll = store.get_poll(poll.id).await.unwrap().unwrap();
        assert!(!poll.drawn);
        assert!(store.list_results(poll.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mutations_are_announced() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();
        let now = Utc::now();
        let poll = store.create_poll(1, &new_poll(SelectionPolicy::Random, SlotCapacity::new(1, 0, 0), now), now).await.unwrap();
        store.insert_random_entry(poll.id, 10, Slot::Morning, now).await.unwrap();

        assert_eq!(changes.recv().await.unwrap(), ChangeEvent { id_poll: poll.id, table: Table::Poll });
        assert_eq!(changes.recv().await.unwrap(), ChangeEvent { id_poll: poll.id, table: Table::Entry });
    }

    #[tokio::test]
    async fn fcfs_primitive_reports_duplicate_before_full_slot() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let poll = store.create_poll(1, &new_poll(SelectionPolicy::Fcfs, SlotCapacity::new(1, 1, 0), now), now).await.unwrap();

        assert!(store.try_admit_fcfs(poll.id, 10, Slot::Morning, 1, now).await.unwrap().success);

        let again = store.try_admit_fcfs(poll.id, 10, Slot::Morning, 1, now).await.unwrap();
        assert_eq!(again.rejection, Some(Rejection::AlreadyEntered));

        let other = store.try_admit_fcfs(poll.id, 11, Slot::Morning, 1, now).await.unwrap();
        assert_eq!(other.rejection, Some(Rejection::SlotFull));
    }
}
