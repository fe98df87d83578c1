//! Eligibility rules. Everything here is pure except [`preview`], which only
//! gathers inputs before delegating to [`EligibilityPreview::compute`].

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::schema::{Exclusions, Poll, PollId, UserId};
use crate::db::store::Store;
use crate::error::StoreError;
use crate::support::bounded::bounded;

/// Smallest eligible pool that is still considered competitive.
pub const COMPETITIVE_POOL: u64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ineligibility {
    ManuallyExcluded,
    RecentWinner,
}

impl Ineligibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ineligibility::ManuallyExcluded => "manually excluded",
            Ineligibility::RecentWinner => "won a recent poll",
        }
    }
}

/// Why `candidate` may not take part, if anything.
pub fn check(exclusions: &Exclusions, candidate: UserId, recent_winners: &HashSet<UserId>) -> Option<Ineligibility> {
    if exclusions.excluded_user_ids.contains(&candidate) {
        return Some(Ineligibility::ManuallyExcluded);
    }
    if exclusions.recent_winners.window().is_some() && recent_winners.contains(&candidate) {
        return Some(Ineligibility::RecentWinner);
    }
    None
}

pub fn eligible(poll: &Poll, candidate: UserId, recent_winners: &HashSet<UserId>) -> bool {
    check(&poll.exclusions, candidate, recent_winners).is_none()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolWarning {
    /// Nobody could possibly take part.
    NoEligibleEntrants,
    /// Fewer than [`COMPETITIVE_POOL`] users remain eligible.
    Uncompetitive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EligibilityPreview {
    pub excluded_count: u64,
    pub eligible_count: u64,
    pub warning: Option<PoolWarning>,
}

impl EligibilityPreview {
    /// A manually excluded recent winner is counted once.
    pub fn compute(total_users: u64, exclusions: &Exclusions, recent_winners: &HashSet<UserId>) -> Self {
        let mut excluded: HashSet<UserId> = exclusions.excluded_user_ids.iter().copied().collect();
        if exclusions.recent_winners.window().is_some() {
            excluded.extend(recent_winners.iter().copied());
        }

        let excluded_count = excluded.len() as u64;
        let eligible_count = total_users.saturating_sub(excluded_count);

        let warning = match eligible_count {
            0 => Some(PoolWarning::NoEligibleEntrants),
            n if n < COMPETITIVE_POOL => Some(PoolWarning::Uncompetitive),
            _ => None,
        };

        Self { excluded_count, eligible_count, warning }
    }
}

/// Recent winners relevant to a poll owned by `id_owner`, as of `now`.
pub async fn recent_winners_for<S: Store + ?Sized>(
    store: &S,
    id_owner: UserId,
    exclusions: &Exclusions,
    excluding: Option<PollId>,
    now: DateTime<Utc>,
    limit: Duration,
) -> Result<HashSet<UserId>, StoreError> {
    match exclusions.recent_winners.since(now) {
        None => Ok(HashSet::new()),
        Some(since) => bounded(limit, store.recent_winners(id_owner, since, excluding)).await,
    }
}

/// Preview shown to a manager while configuring exclusions.
pub async fn preview<S: Store + ?Sized>(
    store: &S,
    id_owner: UserId,
    exclusions: &Exclusions,
    excluding: Option<PollId>,
    now: DateTime<Utc>,
    limit: Duration,
) -> Result<EligibilityPreview, StoreError> {
    let total = bounded(limit, store.count_entrants()).await?;
    let recent = recent_winners_for(store, id_owner, exclusions, excluding, now, limit).await?;

    Ok(EligibilityPreview::compute(total.max(0) as u64, exclusions, &recent))
}
