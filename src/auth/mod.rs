// Join tokens and per-connection permission grants

// Public API - what other modules can use
pub use authorizer::{ConnectionAuthorizer, ConnectionGrant};
pub use handlers::authorize_connection;
pub use permissions::ConnectionPermissions;
pub use token::{JoinClaims, TokenConfig};

// Internal modules
mod authorizer;
mod handlers;
mod permissions;
mod token;
