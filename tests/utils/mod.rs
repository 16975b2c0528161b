pub mod assertions;
pub mod setup;

// Re-export main utilities for use by test files
#[allow(unused_imports)]
pub use assertions::{drain_private_events, drain_system_events, eventually};
#[allow(unused_imports)]
pub use setup::{TestSetup, TestSetupBuilder};
