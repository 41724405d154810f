//! # Correlation
//!
//! Attribute-based routing of loosely-typed external events to the one
//! orchestration instance waiting for them.

pub mod index;
pub mod key;

pub use index::{CorrelationIndex, IndexedInstance};
pub use key::CorrelationKey;
