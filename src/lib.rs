// Library crate for the meeting-room control plane
// This file exposes the public API for the server binary and integration tests

pub mod auth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod lock;
pub mod presence;
pub mod room;
pub mod scheduler;
pub mod services;
pub mod shared;

// Re-export commonly used types for easier access in tests
pub use bus::{InMemorySubstrate, Substrate};
pub use cache::LocalCache;
pub use config::CoreConfig;
pub use event::{EventBus, RoomEvent, RoomSubscription};
pub use lock::{Lease, LockManager};
pub use presence::{PresenceStatus, PresenceStore};
pub use room::{CreateRoomRequest, RoomStateStore};
pub use scheduler::ReconciliationScheduler;
pub use services::CoreServices;
pub use shared::{AppError, AppState, StoreError};
