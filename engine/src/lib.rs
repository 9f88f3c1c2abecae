//! The execution engine: a bounded queue serviced by a fixed worker pool,
//! an in-memory registry of running tasks, and the event broadcaster that
//! fans execution output out to live subscribers.

pub mod broadcaster;
pub mod orchestrator;
pub mod queue;
pub mod task;

pub use broadcaster::{ClientMessage, EventBroadcaster, ProgressEvent, ServerEvent, SubscriberHandle, SubscriptionFilter};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
pub use queue::{ExecutionQueue, QueueFull};
pub use task::TaskSnapshot;
