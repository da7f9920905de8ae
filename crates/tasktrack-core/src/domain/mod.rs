//! Task domain entities, value objects, and change notifications.

pub mod entities;
pub mod events;
pub mod value_objects;

pub use entities::*;
pub use events::*;
pub use value_objects::*;
