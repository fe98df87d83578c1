//! The store seam: every invariant the engine relies on is enforced behind
//! this trait, inside a single transaction per call.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::db::schema::{ChangeEvent, Entrant, Entry, NewPoll, Poll, PollId, PollResult, Slot, UserId};
use crate::error::StoreError;

/// Why the store refused an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    PollClosed,
    AlreadyEntered,
    SlotFull,
}

impl Rejection {
    pub fn as_message(&self) -> &'static str {
        match self {
            Rejection::PollClosed => "poll is closed",
            Rejection::AlreadyEntered => "user already entered this poll",
            Rejection::SlotFull => "slot capacity reached",
        }
    }
}

/// Answer of the atomic first-come-first-served primitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FcfsAdmission {
    pub success: bool,
    pub message: String,
    /// Total capacity across all slots has been reached; the poll was closed
    /// in the same transaction.
    pub poll_full: bool,
    pub rejection: Option<Rejection>,
}

impl FcfsAdmission {
    pub fn admitted(poll_full: bool) -> Self {
        Self {
            success: true,
            message: if poll_full { "admitted; poll is now full".to_owned() } else { "admitted".to_owned() },
            poll_full,
            rejection: None,
        }
    }

    pub fn rejected(rejection: Rejection, poll_full: bool) -> Self {
        Self {
            success: false,
            message: rejection.as_message().to_owned(),
            poll_full,
            rejection: Some(rejection),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryInsert {
    Inserted(Entry),
    Rejected(Rejection),
}

/// What the winner selector sees while the poll row is locked.
pub struct DrawInput<'a> {
    pub poll: &'a Poll,
    pub entries: &'a [Entry],
    pub recent_winners: &'a HashSet<UserId>,
}

/// Chooses winners for a poll being drawn. Runs while the poll is locked,
/// so it must not block.
pub trait WinnerSelector: Send + Sync {
    fn select(&self, input: &DrawInput<'_>) -> Vec<(UserId, Slot)>;
}

#[derive(Clone, Debug)]
pub struct DrawRecord {
    pub poll: Poll,
    pub results: Vec<PollResult>,
    /// False when another caller had already drawn the poll.
    pub newly_drawn: bool,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn create_poll(&self, id_owner: UserId, poll: &NewPoll, now: DateTime<Utc>) -> Result<Poll, StoreError>;

    async fn get_poll(&self, id_poll: PollId) -> Result<Option<Poll>, StoreError>;

    /// Polls that have not been drawn yet.
    async fn list_pending_polls(&self) -> Result<Vec<Poll>, StoreError>;

    async fn get_entry(&self, id_poll: PollId, id_user: UserId) -> Result<Option<Entry>, StoreError>;

    async fn list_entries(&self, id_poll: PollId) -> Result<Vec<Entry>, StoreError>;

    async fn list_results(&self, id_poll: PollId) -> Result<Vec<PollResult>, StoreError>;

    /// Users holding a result created at or after `since` on any poll owned
    /// by `id_owner`, other than `excluding`.
    async fn recent_winners(
        &self,
        id_owner: UserId,
        since: DateTime<Utc>,
        excluding: Option<PollId>,
    ) -> Result<HashSet<UserId>, StoreError>;

    async fn count_entrants(&self) -> Result<i64, StoreError>;

    async fn add_entrant(&self, name: &str, pin: &str) -> Result<Entrant, StoreError>;

    async fn get_entrant(&self, id_user: UserId) -> Result<Option<Entrant>, StoreError>;

    /// Records a random-draw entry, re-checking under lock that the poll
    /// still accepts entries.
    async fn insert_random_entry(
        &self,
        id_poll: PollId,
        id_user: UserId,
        slot: Slot,
        now: DateTime<Utc>,
    ) -> Result<EntryInsert, StoreError>;

    /// Compare-and-insert: counts results for `slot` under the poll's row
    /// lock and records both the entry and its result when below `capacity`.
    async fn try_admit_fcfs(
        &self,
        id_poll: PollId,
        id_user: UserId,
        slot: Slot,
        capacity: u32,
        now: DateTime<Utc>,
    ) -> Result<FcfsAdmission, StoreError>;

    /// Locks the poll, returns the existing results if it is already drawn,
    /// otherwise persists the winners chosen by `select` and marks the poll
    /// closed and drawn.
    async fn draw_random_winners(
        &self,
        id_poll: PollId,
        now: DateTime<Utc>,
        select: &dyn WinnerSelector,
    ) -> Result<DrawRecord, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
