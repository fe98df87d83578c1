use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::error::ValidationError;

pub type PollId = i32;
pub type UserId = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Morning,
    Afternoon,
    FullDay,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Morning, Slot::Afternoon, Slot::FullDay];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Morning => "morning",
            Slot::Afternoon => "afternoon",
            Slot::FullDay => "full_day",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "morning" => Ok(Slot::Morning),
            "afternoon" => Ok(Slot::Afternoon),
            "full_day" | "full-day" | "fullday" => Ok(Slot::FullDay),
            other => Err(ValidationError::new("slot", format!("unknown slot '{}'", other))),
        }
    }
}

/// Number of winners each slot can hold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotCapacity {
    pub morning: u32,
    pub afternoon: u32,
    pub full_day: u32,
}

impl SlotCapacity {
    pub fn new(morning: u32, afternoon: u32, full_day: u32) -> Self {
        Self { morning, afternoon, full_day }
    }

    pub fn get(&self, slot: Slot) -> u32 {
        match slot {
            Slot::Morning => self.morning,
            Slot::Afternoon => self.afternoon,
            Slot::FullDay => self.full_day,
        }
    }

    pub fn total(&self) -> u64 {
        self.morning as u64 + self.afternoon as u64 + self.full_day as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionPolicy {
    Random,
    Fcfs,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::Random => "random",
            SelectionPolicy::Fcfs => "fcfs",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(SelectionPolicy::Random),
            "fcfs" => Ok(SelectionPolicy::Fcfs),
            other => Err(ValidationError::new("selection_policy", format!("unknown policy '{}'", other))),
        }
    }
}

/// Cool-down period used by the recent-winner rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Window {
    Day,
    Week,
    Month,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Day => "day",
            Window::Week => "week",
            Window::Month => "month",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Window::Day => Duration::days(1),
            Window::Week => Duration::days(7),
            Window::Month => Duration::days(30),
        }
    }
}

impl FromStr for Window {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" => Ok(Window::Day),
            "week" => Ok(Window::Week),
            "month" => Ok(Window::Month),
            other => Err(ValidationError::new("recent_winner_window", format!("unknown window '{}'", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecentWinnerRule {
    Off,
    Within(Window),
}

impl RecentWinnerRule {
    /// Builds the rule from the loose `{enabled, window}` pair managers submit.
    pub fn from_parts(enabled: bool, window: Option<Window>) -> Result<Self, ValidationError> {
        match (enabled, window) {
            (false, _) => Ok(RecentWinnerRule::Off),
            (true, Some(w)) => Ok(RecentWinnerRule::Within(w)),
            (true, None) => Err(ValidationError::new(
                "recent_winner_window",
                "a window is required when recent-winner exclusion is enabled",
            )),
        }
    }

    pub fn window(&self) -> Option<Window> {
        match self {
            RecentWinnerRule::Off => None,
            RecentWinnerRule::Within(w) => Some(*w),
        }
    }

    /// Earliest win time that still counts as "recent" at `now`.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window().map(|w| now - w.duration())
    }
}

/// Exclusion configuration of a poll, validated once at creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exclusions {
    pub excluded_user_ids: BTreeSet<UserId>,
    pub recent_winners: RecentWinnerRule,
}

impl Default for Exclusions {
    fn default() -> Self {
        Self {
            excluded_user_ids: BTreeSet::new(),
            recent_winners: RecentWinnerRule::Off,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Poll {
    pub id: PollId,
    pub time_created: DateTime<Utc>,
    pub id_owner: UserId,
    pub title: String,
    pub description: String,
    pub capacity: SlotCapacity,
    pub closes_at: DateTime<Utc>,
    pub policy: SelectionPolicy,
    pub open: bool,
    pub drawn: bool,
    pub exclusions: Exclusions,
}

impl Poll {
    /// True while entries may still be admitted.
    pub fn accepts_entries(&self, now: DateTime<Utc>) -> bool {
        self.open && !self.drawn && now < self.closes_at
    }
}

/// Poll definition as submitted by its owner, before validation.
#[derive(Clone, Debug)]
pub struct NewPoll {
    pub title: String,
    pub description: String,
    pub capacity: SlotCapacity,
    pub closes_at: DateTime<Utc>,
    pub policy: SelectionPolicy,
    pub exclusions: Exclusions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entrant {
    pub id: UserId,
    pub name: String,
    pub pin: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub id_poll: PollId,
    pub id_user: UserId,
    pub slot: Slot,
    pub time_created: DateTime<Utc>,
}

/// A finalized winner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollResult {
    pub id_poll: PollId,
    pub id_user: UserId,
    pub slot: Slot,
    pub time_created: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Poll,
    Entry,
    Result,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Poll => "poll",
            Table::Entry => "entry",
            Table::Result => "result",
        }
    }
}

impl FromStr for Table {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(Table::Poll),
            "entry" => Ok(Table::Entry),
            "result" => Ok(Table::Result),
            other => Err(ValidationError::new("table", format!("unknown table '{}'", other))),
        }
    }
}

/// Change notification scoped to one poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub id_poll: PollId,
    pub table: Table,
}

impl ChangeEvent {
    /// Parses a `<table>:<poll id>` notification payload.
    pub fn parse(payload: &str) -> Option<Self> {
        let (table, id) = payload.split_once(':')?;
        Some(ChangeEvent {
            id_poll: id.trim().parse().ok()?,
            table: table.trim().parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_parsing_accepts_common_spellings() {
        assert_eq!("Full-Day".parse::<Slot>().unwrap(), Slot::FullDay);
        assert_eq!(" morning ".parse::<Slot>().unwrap(), Slot::Morning);
        assert!("evening".parse::<Slot>().is_err());
    }

    #[test]
    fn recent_winner_rule_requires_window_when_enabled() {
        assert_eq!(RecentWinnerRule::from_parts(false, None).unwrap(), RecentWinnerRule::Off);
        assert_eq!(RecentWinnerRule::from_parts(false, Some(Window::Day)).unwrap(), RecentWinnerRule::Off);
        assert_eq!(
            RecentWinnerRule::from_parts(true, Some(Window::Week)).unwrap(),
            RecentWinnerRule::Within(Window::Week)
        );
        let err = RecentWinnerRule::from_parts(true, None).unwrap_err();
        assert_eq!(err.field, "recent_winner_window");
    }

    #[test]
    fn change_event_payload() {
        assert_eq!(
            ChangeEvent::parse("entry:42"),
            Some(ChangeEvent { id_poll: 42, table: Table::Entry })
        );
        assert_eq!(ChangeEvent::parse("ballot:42"), None);
        assert_eq!(ChangeEvent::parse("poll"), None);
    }

    #[test]
    fn capacity_totals() {
        let cap = SlotCapacity::new(2, 1, 3);
        assert_eq!(cap.total(), 6);
        assert_eq!(cap.get(Slot::Afternoon), 1);

        let huge = SlotCapacity::new(u32::MAX, u32::MAX, 1);
        assert_eq!(huge.total(), 2 * u32::MAX as u64 + 1);
    }
}
