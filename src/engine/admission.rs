//! Entry admission.
//!
//! Checks run in a fixed order and stop at the first failure:
//! poll exists and is open, no prior entry, eligibility, then the policy
//! specific write. The store re-checks open state and uniqueness inside its
//! own transaction, so the early checks only produce friendlier errors.

use evlog::meta;

use crate::db::schema::{Entry, PollId, SelectionPolicy, Slot, UserId};
use crate::db::store::{EntryInsert, Rejection, Store};
use crate::engine::rules;
use crate::engine::Engine;
use crate::error::{AdmissionError, StoreError};
use crate::runtime::get_logger;
use crate::support::bounded::bounded;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// First-come-first-served: the entry is also a result.
    Won { entry: Entry, poll_full: bool },
    /// Random policy: the entry waits for the draw.
    Entered { entry: Entry },
}

impl AdmissionOutcome {
    pub fn entry(&self) -> &Entry {
        match self {
            AdmissionOutcome::Won { entry, .. } => entry,
            AdmissionOutcome::Entered { entry } => entry,
        }
    }
}

/// Result of retrying an admission whose first attempt had an unknown outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resubmission {
    /// The earlier attempt had gone through.
    AlreadyRecorded(Entry),
    Admitted(AdmissionOutcome),
}

pub struct AdmissionService<S: Store> {
    engine: Engine<S>,
}

impl<S: Store> AdmissionService<S> {
    pub fn new(engine: Engine<S>) -> Self {
        Self { engine }
    }

    pub async fn admit(&self, id_poll: PollId, id_user: UserId, slot: Slot) -> Result<AdmissionOutcome, AdmissionError> {
        let r = self.try_admit(id_poll, id_user, slot).await;

        match &r {
            Ok(outcome) => {
                get_logger().info("Entry admitted.", meta! {
                    "PollID" => id_poll,
                    "UserID" => id_user,
                    "Slot" => slot,
                    "Won" => matches!(outcome, AdmissionOutcome::Won { .. }),
                });
                if let AdmissionOutcome::Won { poll_full: true, .. } = outcome {
                    get_logger().info("Poll filled; closed early.", meta! {
                        "PollID" => id_poll,
                    });
                }
            }
            Err(e) if e.is_transient() => {
                get_logger().error_with_err("Admission failed with an unknown outcome.", e, meta! {
                    "PollID" => id_poll,
                    "UserID" => id_user,
                    "Slot" => slot,
                });
            }
            Err(e) => {
                get_logger().info("Entry rejected.", meta! {
                    "PollID" => id_poll,
                    "UserID" => id_user,
                    "Slot" => slot,
                    "Reason" => e.as_label(),
                });
            }
        }

        r
    }

    /// Retries an admission after a transient failure. Looks for an entry
    /// left by the earlier attempt before writing again.
    pub async fn resubmit(&self, id_poll: PollId, id_user: UserId, slot: Slot) -> Result<Resubmission, AdmissionError> {
        let limit = self.engine.store_timeout();

        if let Some(entry) = bounded(limit, self.engine.store().get_entry(id_poll, id_user)).await? {
            return Ok(Resubmission::AlreadyRecorded(entry));
        }

        Ok(Resubmission::Admitted(self.admit(id_poll, id_user, slot).await?))
    }

    async fn try_admit(&self, id_poll: PollId, id_user: UserId, slot: Slot) -> Result<AdmissionOutcome, AdmissionError> {
        let store = self.engine.store();
        let limit = self.engine.store_timeout();
        let now = self.engine.now();

        let poll = bounded(limit, store.get_poll(id_poll)).await?
            .ok_or(AdmissionError::NotFound { what: "poll" })?;
        if bounded(limit, store.get_entrant(id_user)).await?.is_none() {
            return Err(AdmissionError::NotFound { what: "entrant" });
        }

        if !poll.accepts_entries(now) {
            return Err(AdmissionError::PollClosed { id_poll });
        }

        if bounded(limit, store.get_entry(id_poll, id_user)).await?.is_some() {
            return Err(AdmissionError::DuplicateEntry { id_poll, id_user });
        }

        let recent = rules::recent_winners_for(store.as_ref(), poll.id_owner, &poll.exclusions, Some(id_poll), now, limit).await?;
        if let Some(reason) = rules::check(&poll.exclusions, id_user, &recent) {
            return Err(AdmissionError::RuleExclusion { id_user, reason: reason.as_str() });
        }

        match poll.policy {
            SelectionPolicy::Fcfs => {
                let capacity = poll.capacity.get(slot);
                let admission = bounded(limit, store.try_admit_fcfs(id_poll, id_user, slot, capacity, now)).await
                    .map_err(|e| write_error(id_poll, id_user, e))?;

                if admission.success {
                    return Ok(AdmissionOutcome::Won {
                        entry: Entry { id_poll, id_user, slot, time_created: now },
                        poll_full: admission.poll_full,
                    });
                }

                Err(match admission.rejection {
                    Some(Rejection::AlreadyEntered) => AdmissionError::DuplicateEntry { id_poll, id_user },
                    Some(Rejection::PollClosed) => AdmissionError::PollClosed { id_poll },
                    Some(Rejection::SlotFull) | None => AdmissionError::CapacityExceeded { slot },
                })
            }
            SelectionPolicy::Random => {
                let inserted = bounded(limit, store.insert_random_entry(id_poll, id_user, slot, now)).await
                    .map_err(|e| write_error(id_poll, id_user, e))?;
                match inserted {
                    EntryInsert::Inserted(entry) => Ok(AdmissionOutcome::Entered { entry }),
                    EntryInsert::Rejected(Rejection::AlreadyEntered) => Err(AdmissionError::DuplicateEntry { id_poll, id_user }),
                    EntryInsert::Rejected(_) => Err(AdmissionError::PollClosed { id_poll }),
                }
            }
        }
    }
}

/// A unique violation on the entry write means the user already entered.
fn write_error(id_poll: PollId, id_user: UserId, e: StoreError) -> AdmissionError {
    match e {
        StoreError::Duplicate { .. } => AdmissionError::DuplicateEntry { id_poll, id_user },
        e => e.into(),
    }
}
