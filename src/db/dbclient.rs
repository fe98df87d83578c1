use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evlog::meta;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::broadcast;

use crate::db::model;
use crate::db::schema::{ChangeEvent, Entrant, Entry, NewPoll, Poll, PollId, PollResult, Slot, UserId};
use crate::db::store::{DrawRecord, EntryInsert, FcfsAdmission, Store, WinnerSelector};
use crate::error::StoreError;
use crate::runtime::get_logger;

pub const CHANGE_CHANNEL: &str = "lottery_changes";

const CHANGE_BUFFER: usize = 1024;
const LISTEN_RETRY: Duration = Duration::from_secs(1);

/// Postgres-backed [`Store`].
pub struct DBClient {
    pool: PgPool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl DBClient {
    pub async fn new(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        tokio::spawn(forward_changes(listener, changes.clone()));

        Ok(Self { pool, changes })
    }

    pub fn conn(&self) -> &PgPool {
        &self.pool
    }
}

async fn forward_changes(mut listener: PgListener, changes: broadcast::Sender<ChangeEvent>) {
    loop {
        match listener.recv().await {
            Ok(notification) => match ChangeEvent::parse(notification.payload()) {
                Some(ev) => {
                    let _ = changes.send(ev);
                }
                None => {
                    get_logger().debug("Ignored unrecognized change notification.", meta! {
                        "Payload" => notification.payload(),
                    });
                }
            },
            Err(e) => {
                get_logger().error_with_err("Change listener failed; retrying.", &e, None);
                tokio::time::sleep(LISTEN_RETRY).await;
            }
        }
    }
}

fn classify(e: anyhow::Error) -> StoreError {
    if let Some(sqlx::Error::Database(db)) = e.downcast_ref::<sqlx::Error>() {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Duplicate { constraint: db.message().to_owned() };
        }
    }
    StoreError::Backend(e)
}

#[async_trait]
impl Store for DBClient {
    async fn create_poll(&self, id_owner: UserId, poll: &NewPoll, now: DateTime<Utc>) -> Result<Poll, StoreError> {
        model::add_poll(&self.pool, id_owner, poll, now).await.map_err(classify)
    }

    async fn get_poll(&self, id_poll: PollId) -> Result<Option<Poll>, StoreError> {
        model::get_poll(&self.pool, id_poll).await.map_err(classify)
    }

    async fn list_pending_polls(&self) -> Result<Vec<Poll>, StoreError> {
        model::list_pending_polls(&self.pool).await.map_err(classify)
    }

    async fn get_entry(&self, id_poll: PollId, id_user: UserId) -> Result<Option<Entry>, StoreError> {
        model::get_entry(&self.pool, id_poll, id_user).await.map_err(classify)
    }

    async fn list_entries(&self, id_poll: PollId) -> Result<Vec<Entry>, StoreError> {
        model::list_entries(&self.pool, id_poll).await.map_err(classify)
    }

    async fn list_results(&self, id_poll: PollId) -> Result<Vec<PollResult>, StoreError> {
        model::list_results(&self.pool, id_poll).await.map_err(classify)
    }

    async fn recent_winners(
        &self,
        id_owner: UserId,
        since: DateTime<Utc>,
        excluding: Option<PollId>,
    ) -> Result<HashSet<UserId>, StoreError> {
        model::recent_winners(&self.pool, id_owner, since, excluding).await.map_err(classify)
    }

    async fn count_entrants(&self) -> Result<i64, StoreError> {
        model::count_entrants(&self.pool).await.map_err(classify)
    }

    async fn add_entrant(&self, name: &str, pin: &str) -> Result<Entrant, StoreError> {
        model::add_entrant(&self.pool, name, pin).await.map_err(classify)
    }

    async fn get_entrant(&self, id_user: UserId) -> Result<Option<Entrant>, StoreError> {
        model::get_entrant(&self.pool, id_user).await.map_err(classify)
    }

    async fn insert_random_entry(
        &self,
        id_poll: PollId,
        id_user: UserId,
        slot: Slot,
        now: DateTime<Utc>,
    ) -> Result<EntryInsert, StoreError> {
        model::insert_random_entry(&self.pool, id_poll, id_user, slot, now).await
            .map_err(classify)?
            .ok_or(StoreError::NotFound { what: "poll" })
    }

    async fn try_admit_fcfs(
        &self,
        id_poll: PollId,
        id_user: UserId,
        slot: Slot,
        capacity: u32,
        now: DateTime<Utc>,
    ) -> Result<FcfsAdmission, StoreError> {
        model::try_admit_fcfs(&self.pool, id_poll, id_user, slot, capacity, now).await
            .map_err(classify)?
            .ok_or(StoreError::NotFound { what: "poll" })
    }

    async fn draw_random_winners(
        &self,
        id_poll: PollId,
        now: DateTime<Utc>,
        select: &dyn WinnerSelector,
    ) -> Result<DrawRecord, StoreError> {
        model::draw_random_winners(&self.pool, id_poll, now, select).await
            .map_err(classify)?
            .ok_or(StoreError::NotFound { what: "poll" })
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
