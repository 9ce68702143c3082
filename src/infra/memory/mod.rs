//! In-process backends implementing the queue and storage contracts.

mod queue;
mod results;
mod schedules;

pub use queue::MemoryJobQueue;
pub use results::MemoryArtifactStore;
pub use schedules::MemoryScheduleStore;
