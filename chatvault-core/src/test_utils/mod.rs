//! Test helpers shared across the crate's unit tests
//!
//! - [`fixtures`]: back-dated sessions
//! - [`faults`]: stores that fail on demand

pub mod faults;
pub mod fixtures;

pub use faults::*;
pub use fixtures::*;
