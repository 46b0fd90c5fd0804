//! Persistence backends for limiter snapshots.

mod mongo;
mod snapshot;

pub use mongo::{Database, MongoSnapshotStore};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
