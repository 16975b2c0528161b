// Room messaging: reliable per-room logs and best-effort fanout
//
// Reliable traffic is persisted in one stream per room and read through
// durable consumers. Best-effort traffic is fire-and-forget.

// Public API - what other modules can use
pub use bus::{ConsumerGrant, Delivery, EventBus};
pub use events::{Envelope, RoomEvent};
pub use room_handler::{RoomEventError, RoomEventHandler};
pub use room_subscription::RoomSubscription;

// Internal modules
mod bus;
mod events;
mod room_handler;
mod room_subscription;
