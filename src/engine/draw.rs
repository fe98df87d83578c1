//! The draw: the one transition from "closed, undrawn" to "closed, drawn".
//!
//! All the work happens inside [`Store::draw_random_winners`], which holds
//! the poll's row lock and re-reads `drawn` before writing. Any number of
//! callers may race here; the first to take the lock draws and the rest get
//! its winners back.

use std::sync::Arc;

use evlog::meta;
use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::db::schema::{Entry, PollId, PollResult, SelectionPolicy, Slot, UserId};
use crate::db::store::{DrawInput, Store, WinnerSelector};
use crate::engine::rules;
use crate::engine::Engine;
use crate::error::DrawError;
use crate::runtime::get_logger;
use crate::support::bounded::bounded;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawOutcome {
    pub id_poll: PollId,
    pub winners: Vec<PollResult>,
    /// Another caller had already drawn this poll; nothing was written.
    pub already_drawn: bool,
}

/// Picks winners for a random poll: per slot, `min(capacity, eligible)`
/// entries uniformly without replacement. First-come-first-served polls
/// already hold their results, so nothing is picked for them.
pub fn select_winners<R: Rng + ?Sized>(rng: &mut R, input: &DrawInput<'_>) -> Vec<(UserId, Slot)> {
    if input.poll.policy == SelectionPolicy::Fcfs {
        return Vec::new();
    }

    let by_slot = input.entries.iter()
        .filter(|e| rules::eligible(input.poll, e.id_user, input.recent_winners))
        .into_group_map_by(|e| e.slot);

    let mut winners = Vec::new();
    for slot in Slot::ALL {
        let pool: &[&Entry] = match by_slot.get(&slot) {
            None => continue,
            Some(v) => v.as_slice(),
        };
        let capacity = input.poll.capacity.get(slot) as usize;

        for entry in pool.choose_multiple(rng, capacity) {
            winners.push((entry.id_user, slot));
        }
    }

    winners
}

/// Default selector, backed by the thread-local RNG.
pub struct RandomSelector;

impl WinnerSelector for RandomSelector {
    fn select(&self, input: &DrawInput<'_>) -> Vec<(UserId, Slot)> {
        select_winners(&mut rand::thread_rng(), input)
    }
}

pub struct DrawExecutor<S: Store> {
    engine: Engine<S>,
    selector: Arc<dyn WinnerSelector>,
}

impl<S: Store> DrawExecutor<S> {
    pub fn new(engine: Engine<S>) -> Self {
        Self {
            engine,
            selector: Arc::new(RandomSelector),
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn WinnerSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Idempotent: every call for the same poll returns the same winners.
    pub async fn draw(&self, id_poll: PollId) -> Result<DrawOutcome, DrawError> {
        let now = self.engine.now();
        let limit = self.engine.store_timeout();

        let record = match bounded(limit, self.engine.store().draw_random_winners(id_poll, now, self.selector.as_ref())).await {
            Ok(v) => v,
            Err(e) => {
                let e = DrawError::from_store(id_poll, e);
                get_logger().error_with_err("Draw failed.", &e, meta! {
                    "PollID" => id_poll,
                    "Reason" => e.as_label(),
                });
                return Err(e);
            }
        };

        if record.newly_drawn {
            get_logger().info("Poll drawn.", meta! {
                "PollID" => id_poll,
                "Policy" => record.poll.policy,
                "Winners" => record.results.len(),
            });
        } else {
            get_logger().debug("Poll was already drawn.", meta! {
                "PollID" => id_poll,
            });
        }

        Ok(DrawOutcome {
            id_poll,
            winners: record.results,
            already_drawn: !record.newly_drawn,
        })
    }
}
