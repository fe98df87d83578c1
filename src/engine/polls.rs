use chrono::{DateTime, Utc};
use evlog::meta;

use crate::db::schema::{Exclusions, NewPoll, Poll, PollId, Slot, UserId};
use crate::db::store::Store;
use crate::engine::draw::DrawOutcome;
use crate::engine::rules::{self, EligibilityPreview};
use crate::engine::Engine;
use crate::error::{PollError, ValidationError};
use crate::runtime::get_logger;
use crate::support::bounded::bounded;

pub const MAX_TITLE_LEN: usize = 200;

/// Largest capacity a single slot may have; slots are stored as INTEGER.
pub const MAX_SLOT_CAPACITY: u32 = i32::MAX as u32;

/// Checks a poll definition and returns it normalized.
pub fn validate(mut poll: NewPoll, now: DateTime<Utc>) -> Result<NewPoll, ValidationError> {
    poll.title = poll.title.trim().to_owned();
    poll.description = poll.description.trim().to_owned();

    if poll.title.is_empty() {
        return Err(ValidationError::new("title", "must not be empty"));
    }
    if poll.title.chars().count() > MAX_TITLE_LEN {
        return Err(ValidationError::new("title", format!("must be at most {} characters", MAX_TITLE_LEN)));
    }
    if poll.closes_at <= now {
        return Err(ValidationError::new("closes_at", "must be in the future"));
    }
    if Slot::ALL.iter().any(|s| poll.capacity.get(*s) > MAX_SLOT_CAPACITY) {
        return Err(ValidationError::new("capacity", format!("each slot must have at most {} spots", MAX_SLOT_CAPACITY)));
    }
    if poll.capacity.total() == 0 {
        return Err(ValidationError::new("capacity", "at least one slot must have a spot"));
    }

    Ok(poll)
}

/// Manager-side poll operations.
pub struct PollManager<S: Store> {
    engine: Engine<S>,
}

impl<S: Store> PollManager<S> {
    pub fn new(engine: Engine<S>) -> Self {
        Self { engine }
    }

    pub async fn create_poll(&self, id_owner: UserId, poll: NewPoll) -> Result<Poll, PollError> {
        let now = self.engine.now();

        let poll = match validate(poll, now) {
            Ok(v) => v,
            Err(e) => {
                get_logger().info("Rejected invalid poll definition.", meta! {
                    "OwnerID" => id_owner,
                    "Field" => e.field,
                    "Reason" => e.reason,
                });
                return Err(e.into());
            }
        };

        let created = bounded(self.engine.store_timeout(), self.engine.store().create_poll(id_owner, &poll, now)).await?;

        get_logger().info("Poll created.", meta! {
            "PollID" => created.id,
            "OwnerID" => id_owner,
            "Policy" => created.policy,
            "Capacity" => created.capacity.total(),
            "ClosesAt" => created.closes_at,
        });

        Ok(created)
    }

    pub async fn get_poll(&self, id_poll: PollId) -> Result<Poll, PollError> {
        bounded(self.engine.store_timeout(), self.engine.store().get_poll(id_poll)).await?
            .ok_or(PollError::NotFound { id_poll })
    }

    /// How many users a set of exclusions leaves eligible. Pass `editing`
    /// when previewing changes to an existing poll so its own winners are
    /// not counted.
    pub async fn preview(
        &self,
        id_owner: UserId,
        exclusions: &Exclusions,
        editing: Option<PollId>,
    ) -> Result<EligibilityPreview, PollError> {
        let preview = rules::preview(
            self.engine.store().as_ref(),
            id_owner,
            exclusions,
            editing,
            self.engine.now(),
            self.engine.store_timeout(),
        ).await?;

        Ok(preview)
    }

    /// Closes and draws a poll before its deadline.
    pub async fn close_early(&self, id_owner: UserId, id_poll: PollId) -> Result<DrawOutcome, PollError> {
        let poll = self.get_poll(id_poll).await?;
        if poll.id_owner != id_owner {
            get_logger().info("Non-owner attempted to close poll.", meta! {
                "PollID" => id_poll,
                "UserID" => id_owner,
            });
            return Err(PollError::NotOwner { id_poll, id_user: id_owner });
        }

        Ok(self.engine.draws().draw(id_poll).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::schema::{RecentWinnerRule, SelectionPolicy, SlotCapacity, Window};
    use crate::engine::testing::{self, OWNER};

    #[test]
    fn validation_rules() {
        let now = testing::start();
        let base = testing::new_poll(SelectionPolicy::Random, SlotCapacity::new(1, 0, 0), Exclusions::default());

        let mut blank = base.clone();
        blank.title = "   ".to_owned();
        assert_eq!(validate(blank, now).unwrap_err().field, "title");

        let mut past = base.clone();
        past.closes_at = now - Duration::minutes(1);
        assert_eq!(validate(past, now).unwrap_err().field, "closes_at");

        let mut empty = base.clone();
        empty.capacity = SlotCapacity::default();
        assert_eq!(validate(empty, now).unwrap_err().field, "capacity");

        let mut huge = base.clone();
        huge.capacity = SlotCapacity::new(u32::MAX, 1, 0);
        assert_eq!(validate(huge, now).unwrap_err().field, "capacity");

        let mut largest = base.clone();
        largest.capacity = SlotCapacity::new(MAX_SLOT_CAPACITY, MAX_SLOT_CAPACITY, MAX_SLOT_CAPACITY);
        assert!(validate(largest, now).is_ok());

        let mut padded = base;
        padded.title = "  Week 12  ".to_owned();
        assert_eq!(validate(padded, now).unwrap().title, "Week 12");
    }

    #[tokio::test]
    async fn created_poll_starts_open_and_undrawn() {
        let (engine, _) = testing::engine();
        let poll = testing::poll(&engine, SelectionPolicy::Fcfs, SlotCapacity::new(2, 2, 1)).await;

        assert!(poll.open);
        assert!(!poll.drawn);
        assert_eq!(engine.polls().get_poll(poll.id).await.unwrap().capacity.total(), 5);
    }

    #[tokio::test]
    async fn oversized_capacity_is_rejected_not_stored() {
        let (engine, _) = testing::engine();
        let new = testing::new_poll(SelectionPolicy::Fcfs, SlotCapacity::new(u32::MAX, 1, 0), Exclusions::default());

        let err = engine.polls().create_poll(OWNER, new).await.unwrap_err();
        assert_eq!(err.as_label(), "validation");
        assert!(engine.store().list_pending_polls().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preview_counts_manually_excluded_recent_winner_once() {
        let (engine, clock) = testing::engine();
        let users = testing::entrants(&engine, 6).await;

        let earlier = testing::poll(&engine, SelectionPolicy::Fcfs, SlotCapacity::new(1, 0, 0)).await;
        engine.admission().admit(earlier.id, users[0], Slot::Morning).await.unwrap();

        clock.advance(Duration::days(2));

        let exclusions = Exclusions {
            excluded_user_ids: [users[0]].into_iter().collect(),
            recent_winners: RecentWinnerRule::Within(Window::Week),
        };
        let preview = engine.polls().preview(OWNER, &exclusions, None).await.unwrap();
        assert_eq!(preview.excluded_count, 1);
        assert_eq!(preview.eligible_count, 5);

        // Another manager's winners are not counted.
        let other = engine.polls().preview(OWNER + 1, &Exclusions {
            excluded_user_ids: Default::default(),
            recent_winners: RecentWinnerRule::Within(Window::Week),
        }, None).await.unwrap();
        assert_eq!(other.excluded_count, 0);
    }

    #[tokio::test]
    async fn only_owner_may_close_early() {
        let (engine, _) = testing::engine();
        let poll = testing::poll(&engine, SelectionPolicy::Random, SlotCapacity::new(1, 0, 0)).await;

        let err = engine.polls().close_early(OWNER + 1, poll.id).await.unwrap_err();
        assert_eq!(err.as_label(), "not_owner");

        let outcome = engine.polls().close_early(OWNER, poll.id).await.unwrap();
        assert!(!outcome.already_drawn);
        assert!(engine.polls().get_poll(poll.id).await.unwrap().drawn);
    }
}
