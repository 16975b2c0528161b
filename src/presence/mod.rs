// Per-user presence: a small status root per room plus one detail bucket per user

// Public API - what other modules can use
pub use models::{JoinAttributes, PresenceRoster, PresenceStatus, RoomUser, UserMetadata, UserRecord};
pub use store::PresenceStore;

// Internal modules
pub mod models;
mod store;
