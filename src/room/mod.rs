// Room registry: one record per room lifetime, mirrored on the bus and
// recorded in durable storage

// Public API - what other modules can use
pub use durable::{
    InMemoryRoomInfoRepository, PostgresRoomInfoRepository, RoomInfoRepository, RoomSession,
};
pub use handlers::get_room;
pub use models::{RoomMetadata, RoomRecord, RoomStatus};
pub use store::{RoomStateStore, RoomStoreSettings};
pub use types::{CreateRoomRequest, RoomResponse};

// Internal modules
pub mod durable;
mod handlers;
pub mod models;
mod store;
mod types;
