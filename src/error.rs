//! Error taxonomy for the allocation engine.
//!
//! - [`ValidationError`]: malformed input, never retried.
//! - [`StoreError`]: failures reported by a [`Store`](crate::db::store::Store).
//! - [`AdmissionError`]: why an entry was not admitted.
//! - [`DrawError`]: why a draw did not complete. A failed draw never leaves
//!   partial results behind.
//! - [`PollError`]: manager-side poll creation and early close.
//! - [`IdentityError`]: PIN confirmation failures.

use std::time::Duration;

use thiserror::Error;

use crate::db::schema::{PollId, Slot, UserId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{what} not found")]
    NotFound { what: &'static str },

    #[error("unique constraint violated: {constraint}")]
    Duplicate { constraint: String },

    /// The store did not answer within the configured bound.
    #[error("store operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "store_not_found",
            StoreError::Duplicate { .. } => "store_duplicate",
            StoreError::Timeout { .. } => "store_timeout",
            StoreError::Backend(_) => "store_backend",
        }
    }

    /// Timeouts and backend failures are transient from the caller's point of view.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout { .. } | StoreError::Backend(_))
    }
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("poll {id_poll} is closed")]
    PollClosed { id_poll: PollId },

    #[error("user {id_user} already entered poll {id_poll}")]
    DuplicateEntry { id_poll: PollId, id_user: UserId },

    #[error("user {id_user} is not eligible: {reason}")]
    RuleExclusion { id_user: UserId, reason: &'static str },

    #[error("no spots remaining for {slot}")]
    CapacityExceeded { slot: Slot },

    #[error("{what} not found")]
    NotFound { what: &'static str },

    /// The store refused the write on a uniqueness constraint.
    #[error("entry conflicts with an existing record: {constraint}")]
    Conflict { constraint: String },

    /// The outcome is unknown; re-check for an existing entry before retrying.
    #[error("transient store failure: {source}")]
    Transient { source: StoreError },
}

impl AdmissionError {
    pub fn as_label(&self) -> &'static str {
        match self {
            AdmissionError::Validation(_) => "validation",
            AdmissionError::PollClosed { .. } => "poll_closed",
            AdmissionError::DuplicateEntry { .. } => "duplicate_entry",
            AdmissionError::RuleExclusion { .. } => "rule_exclusion",
            AdmissionError::CapacityExceeded { .. } => "capacity_exceeded",
            AdmissionError::NotFound { .. } => "not_found",
            AdmissionError::Conflict { .. } => "conflict",
            AdmissionError::Transient { .. } => "transient",
        }
    }

    /// Message suitable for showing to the entrant.
    pub fn as_message(&self) -> String {
        match self {
            AdmissionError::Validation(e) => e.to_string(),
            AdmissionError::PollClosed { .. } => "This poll is closed.".to_owned(),
            AdmissionError::DuplicateEntry { .. } => "You have already entered this poll.".to_owned(),
            AdmissionError::RuleExclusion { .. } => "You are not eligible for this poll.".to_owned(),
            AdmissionError::CapacityExceeded { slot } => format!("No spots remaining for {}.", slot),
            AdmissionError::NotFound { what } => format!("The {} could not be found.", what),
            AdmissionError::Conflict { .. } => "You have already entered this poll.".to_owned(),
            AdmissionError::Transient { .. } => "Something went wrong; please check your entry and try again.".to_owned(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AdmissionError::Transient { .. })
    }
}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { what } => AdmissionError::NotFound { what },
            StoreError::Duplicate { constraint } => AdmissionError::Conflict { constraint },
            other => AdmissionError::Transient { source: other },
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DrawError {
    #[error("poll {id_poll} not found")]
    NotFound { id_poll: PollId },

    #[error("transient store failure while drawing: {source}")]
    Transient { source: StoreError },

    #[error("draw failed: {source}")]
    Store { source: StoreError },
}

impl DrawError {
    pub fn as_label(&self) -> &'static str {
        match self {
            DrawError::NotFound { .. } => "draw_not_found",
            DrawError::Transient { .. } => "draw_transient",
            DrawError::Store { .. } => "draw_store",
        }
    }

    /// Draws are idempotent, so any transient failure may be retried blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DrawError::Transient { .. })
    }

    pub(crate) fn from_store(id_poll: PollId, e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => DrawError::NotFound { id_poll },
            e if e.is_transient() => DrawError::Transient { source: e },
            e => DrawError::Store { source: e },
        }
    }
}

/// Failures of manager-side poll operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("poll {id_poll} not found")]
    NotFound { id_poll: PollId },

    #[error("user {id_user} does not own poll {id_poll}")]
    NotOwner { id_poll: PollId, id_user: UserId },

    #[error(transparent)]
    Draw(#[from] DrawError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl PollError {
    pub fn as_label(&self) -> &'static str {
        match self {
            PollError::Validation(_) => "validation",
            PollError::NotFound { .. } => "not_found",
            PollError::NotOwner { .. } => "not_owner",
            PollError::Draw(e) => e.as_label(),
            PollError::Store(e) => e.as_label(),
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("entrant {id_user} not found")]
    NotFound { id_user: UserId },

    #[error("incorrect PIN; {remaining} attempt(s) remaining")]
    Mismatch { remaining: u32 },

    #[error("too many attempts; retry after {retry_after:?}")]
    LockedOut { retry_after: Duration },

    #[error("transient store failure: {source}")]
    Transient { source: StoreError },
}

impl IdentityError {
    pub fn as_label(&self) -> &'static str {
        match self {
            IdentityError::Validation(_) => "validation",
            IdentityError::NotFound { .. } => "not_found",
            IdentityError::Mismatch { .. } => "pin_mismatch",
            IdentityError::LockedOut { .. } => "locked_out",
            IdentityError::Transient { .. } => "transient",
        }
    }
}
