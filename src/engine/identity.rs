//! Entrant registration and PIN confirmation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use evlog::meta;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::db::schema::{Entrant, UserId};
use crate::db::store::Store;
use crate::engine::Engine;
use crate::error::{IdentityError, ValidationError};
use crate::runtime::get_logger;
use crate::support::bounded::bounded;

pub const MAX_NAME_LEN: usize = 100;

static PIN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{4}$").unwrap());

pub fn validate_pin(pin: &str) -> Result<(), ValidationError> {
    if !PIN_PATTERN.is_match(pin) {
        return Err(ValidationError::new("pin", "must be exactly 4 digits"));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::new("name", "must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::new("name", format!("must be at most {} characters", MAX_NAME_LEN)));
    }
    Ok(name.to_owned())
}

/// Failed-attempt counters, one window per key.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Failures recorded in the key's current window.
    async fn failures(&self, key: UserId, now: DateTime<Utc>) -> u32;

    /// Records a failure and returns the window's new count. Opens a window
    /// of `ttl` if none is running.
    async fn record_failure(&self, key: UserId, now: DateTime<Utc>, ttl: chrono::Duration) -> u32;

    async fn reset(&self, key: UserId);

    /// Time left in the key's current window.
    async fn retry_after(&self, key: UserId, now: DateTime<Utc>) -> Option<Duration>;
}

#[derive(Clone, Copy, Debug)]
struct Attempts {
    count: u32,
    window_ends: DateTime<Utc>,
}

/// Per-process counters. Instances do not share them.
#[derive(Default)]
pub struct MemoryAttemptStore {
    attempts: DashMap<UserId, Attempts>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: UserId, now: DateTime<Utc>) -> Option<Attempts> {
        let a = *self.attempts.get(&key)?;
        if now >= a.window_ends {
            self.attempts.remove(&key);
            return None;
        }
        Some(a)
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn failures(&self, key: UserId, now: DateTime<Utc>) -> u32 {
        self.live(key, now).map(|a| a.count).unwrap_or(0)
    }

    async fn record_failure(&self, key: UserId, now: DateTime<Utc>, ttl: chrono::Duration) -> u32 {
        let mut a = self.attempts.entry(key).or_insert(Attempts { count: 0, window_ends: now + ttl });
        if now >= a.window_ends {
            *a = Attempts { count: 0, window_ends: now + ttl };
        }
        a.count += 1;
        a.count
    }

    async fn reset(&self, key: UserId) {
        self.attempts.remove(&key);
    }

    async fn retry_after(&self, key: UserId, now: DateTime<Utc>) -> Option<Duration> {
        let a = self.live(key, now)?;
        (a.window_ends - now).to_std().ok()
    }
}

pub struct IdentityService<S: Store> {
    engine: Engine<S>,
    attempts: Arc<dyn AttemptStore>,
    max_attempts: u32,
    lockout: chrono::Duration,
}

impl<S: Store> IdentityService<S> {
    pub fn new(engine: Engine<S>, attempts: Arc<dyn AttemptStore>, max_attempts: u32, lockout: Duration) -> Self {
        Self {
            engine,
            attempts,
            max_attempts: max_attempts.max(1),
            lockout: chrono::Duration::seconds(lockout.as_secs() as i64),
        }
    }

    pub async fn register(&self, name: &str, pin: &str) -> Result<Entrant, IdentityError> {
        let name = validate_name(name)?;
        validate_pin(pin)?;

        let entrant = bounded(self.engine.store_timeout(), self.engine.store().add_entrant(&name, pin)).await
            .map_err(|source| IdentityError::Transient { source })?;

        get_logger().info("Entrant registered.", meta! {
            "UserID" => entrant.id,
        });

        Ok(entrant)
    }

    /// Confirms that `pin` belongs to `id_user`.
    pub async fn verify(&self, id_user: UserId, pin: &str) -> Result<Entrant, IdentityError> {
        validate_pin(pin)?;
        let now = self.engine.now();

        if self.attempts.failures(id_user, now).await >= self.max_attempts {
            let retry_after = self.attempts.retry_after(id_user, now).await.unwrap_or_default();
            return Err(IdentityError::LockedOut { retry_after });
        }

        let entrant = bounded(self.engine.store_timeout(), self.engine.store().get_entrant(id_user)).await
            .map_err(|source| IdentityError::Transient { source })?
            .ok_or(IdentityError::NotFound { id_user })?;

        if entrant.pin == pin {
            self.attempts.reset(id_user).await;
            return Ok(entrant);
        }

        let failures = self.attempts.record_failure(id_user, now, self.lockout).await;
        if failures >= self.max_attempts {
            let retry_after = self.attempts.retry_after(id_user, now).await.unwrap_or_default();
            get_logger().info("Entrant locked out after repeated PIN failures.", meta! {
                "UserID" => id_user,
                "Failures" => failures,
                "RetryAfterSecs" => retry_after.as_secs(),
            });
            return Err(IdentityError::LockedOut { retry_after });
        }

        Err(IdentityError::Mismatch { remaining: self.max_attempts - failures })
    }
}
