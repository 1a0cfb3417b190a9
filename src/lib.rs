// ABOUTME: Library root for dual-replicator
// ABOUTME: Bidirectional store replication with a durable offline write-ahead queue

pub mod codec;
pub mod commands;
pub mod connectivity;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod offline;
pub mod provenance;
pub mod reconcile;
pub mod registry;
pub mod settings;
pub mod store;
pub mod task;
pub mod utils;

pub use codec::{Codec, CodecError, EncryptionKey};
pub use connectivity::{Connectivity, ConnectivityProbe, ConnectivityTrigger};
pub use daemon::{DaemonConfig, SyncDaemon};
pub use engine::{
    AttemptOutcome, EngineConfig, MirrorMode, MirrorOutcome, ReplicationEngine, Subscription,
};
pub use error::{SyncError, SyncResult};
pub use offline::{DrainReport, OfflineQueue, QueueConfig};
pub use provenance::{Envelope, ProvenanceTag};
pub use reconcile::{ReconcileConfig, ReconcileReport, Reconciler};
pub use registry::{Direction, Flow, SyncConfig, SyncRegistry};
pub use settings::Settings;
pub use sync_queue::{QueueStore, RecordKey, RecordStatus, StoreSide, SyncRecord, SyncStats};
