//! Broker scheduling engine.
//!
//! The [`Scheduler`] is a single-writer state machine: one task feeds it
//! [`Message`]s and it reacts by sending messages to clients and workers
//! through [`SchedulerDeps`]. All job and worker state lives inside it, so
//! there are no locks and every decision can be unit tested by feeding
//! messages and inspecting what was sent.

pub mod gateway;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod snapshot;

pub use gateway::ClientGateway;
pub use queue::JobQueue;
pub use registry::{WorkerDescriptor, WorkerRegistry};
pub use scheduler::{Message, Scheduler, SchedulerConfig, SchedulerDeps, run_scheduler, run_ticker};
pub use snapshot::{JobSummary, SchedulerSnapshot};
