// ABOUTME: Persistence layer for larder: storage engines, schema migration, and the record store.
// ABOUTME: Also hosts the backup codec, the autosave writer, and atomic backup file IO.

pub mod backup;
pub mod engine;
pub mod file;
pub mod memory;
pub mod migration;
pub mod records;
pub mod sqlite;
pub mod writer;

pub use backup::BackupCodec;
pub use engine::{
    CollectionSpec, IndexSpec, ListOptions, Mutation, SchemaEditor, StorageEngine, StoreError,
    StoreHandle,
};
pub use file::{BackupFileError, read_backup_file, write_backup_file};
pub use memory::MemoryEngine;
pub use migration::{MigrationStep, Migrator, SCHEMA_VERSION};
pub use records::{LegacyMigration, RecordStore};
pub use sqlite::SqliteEngine;
pub use writer::RecordWriter;
