//! Domain layer types and invariants.

pub mod entities;
pub mod error;
pub mod schedule;
pub mod types;
