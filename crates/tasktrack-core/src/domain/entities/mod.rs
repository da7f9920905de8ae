//! Domain entities.

mod task;

pub use task::*;
