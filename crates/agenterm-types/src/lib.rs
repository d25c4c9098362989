pub mod entities;
pub mod error;
pub mod events;
pub mod provider;

pub use entities::*;
pub use error::*;
pub use events::*;
pub use provider::*;

/// Generates a 128-bit random identifier rendered as 32 lowercase hex digits,
/// matching the id shape used throughout the persistence layer.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
