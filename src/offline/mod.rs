//! Offline write support: queued mutations, their persistence, and replay.

mod handler;
mod mutation;
mod queue;
mod repository;

pub use handler::HttpMutationHandler;
pub use mutation::{
  MutationEnvelope, MutationHandler, MutationStatus, PendingMutation, ReplayError,
};
pub use queue::{OfflineMutationQueue, QueueSummary, ReplayOutcome, ReplayPolicy, ReplayResult};
pub use repository::{
  JsonFileRepository, MemoryQueueRepository, QueueRepository, SqliteQueueRepository, QUEUE_KEY,
  SEQUENCE_KEY,
};
