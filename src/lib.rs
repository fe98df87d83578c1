//! Timed lottery allocation of limited slots to entrants.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod support;
