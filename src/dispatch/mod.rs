// One-shot server-to-server tasks on a work-queue stream
//
// Any process may submit; every worker competes on the same durable
// consumer, so each task runs on exactly one worker at a time.

// Public API - what other modules can use
pub use handler::{TaskError, TaskHandler};
pub use queue::{TaskQueue, TaskRequest};
pub use worker::TaskWorker;

// Internal modules
mod handler;
mod queue;
mod worker;
