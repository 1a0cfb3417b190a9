pub mod record;
pub mod store;

pub use record::{
    NewRecord, RecordError, RecordKey, RecordStatus, StoreSide, SyncRecord, SyncStats, Transition,
};
pub use store::QueueStore;
