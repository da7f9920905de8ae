//! # TaskTrack Core
//!
//! Core types, the task domain model, and error definitions shared by every
//! TaskTrack crate.

pub mod domain;
pub mod error;
pub mod id;
pub mod result;

pub use domain::*;
pub use error::*;
pub use id::*;
pub use result::*;

// Re-export shaku for dependency injection
pub use shaku::Interface;
