//! Domain layer types and invariants.

pub mod card;
pub mod error;
pub mod options;
