//! Scheduling and processing: queue, worker registry, dispatcher and local workers

mod dispatcher;
mod queue;
mod registry;
mod tier;
mod worker;

pub use dispatcher::{Assignment, DispatchReport, Dispatcher};
pub use queue::QueueManager;
pub use registry::{rank_workers, WorkerRegistry};
pub use tier::WorkerTier;
pub use worker::{local_registration, ProcessingWorker, WorkerContext};
