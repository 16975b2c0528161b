// Reconciliation loops: presence decay, lifetime policies and drift repair
// against the media server

// Public API - what other modules can use
pub use media::{InMemoryMediaPlane, MediaParticipant, MediaPlane};
pub use reconciler::{
    ReconciliationScheduler, SchedulerConfig, TickReport, ACTIVE_ROOM_CHECKER,
    EMPTY_ROOM_CHECKER, ENDED_ROOM_SWEEPER,
};

// Internal modules
mod media;
mod reconciler;
