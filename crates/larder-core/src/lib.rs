// ABOUTME: Core library for larder, containing the record model, backup payload types, and autosave queue.
// ABOUTME: This crate defines the shared data model and write pipeline used by the store and the CLI.

pub mod backup;
pub mod clock;
pub mod connectivity;
pub mod operation;
pub mod queue;
pub mod record;
pub mod retry;

pub use backup::{BACKUP_VERSION, BackupPayload, ImportOptions, ImportReport, MergeStrategy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use operation::{Operation, OperationKind};
pub use queue::{
    AutosaveConfig, AutosaveError, PersistBatch, PersistError, PersistFn, WriteQueue, persist_fn,
};
pub use record::{RecordKind, StoredRecord, derive_id, normalize};
pub use retry::RetryPolicy;
