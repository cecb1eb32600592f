// ABOUTME: Versioned schema migration run by engines while opening, inside one upgrade transaction.
// ABOUTME: Steps are gated by version, check for existing shape before creating it, and never repeat.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use larder_core::backup::{MergeStrategy, should_replace};
use larder_core::clock::{Clock, SystemClock};
use larder_core::record::{RecordKind, normalize};
use serde_json::Value;

use crate::engine::{CollectionSpec, SchemaEditor, StoreError};

/// Schema version produced by the default migrator.
pub const SCHEMA_VERSION: u32 = 3;

/// Collection used by builds that kept exactly one profile.
pub const LEGACY_PROFILE_COLLECTION: &str = "profile";

/// Key the single legacy profile was stored under.
pub const LEGACY_PROFILE_KEY: &str = "current";

/// A step receives the editor and the instant the upgrade started, which
/// it uses for any timestamp it has to make up.
pub type StepFn = fn(&mut dyn SchemaEditor, DateTime<Utc>) -> Result<(), StoreError>;

/// One upgrade step, applied when the stored version is below `version`.
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub version: u32,
    pub description: &'static str,
    pub apply: StepFn,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// An ordered list of migration steps.
#[derive(Clone)]
pub struct Migrator {
    steps: Vec<MigrationStep>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator").field("steps", &self.steps).finish()
    }
}

impl Migrator {
    /// Build a migrator; steps are sorted by version and duplicate versions
    /// keep the first occurrence.
    pub fn new(mut steps: Vec<MigrationStep>) -> Self {
        steps.sort_by_key(|step| step.version);
        steps.dedup_by_key(|step| step.version);
        Self {
            steps,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for the timestamps steps stamp on migrated records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The version a fully migrated store is at.
    pub fn current_version(&self) -> u32 {
        self.steps.last().map(|step| step.version).unwrap_or(0)
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Apply every step newer than `old_version`, in order, and return the
    /// resulting version. Any failure is reported as `MigrationFailed` for
    /// the step that failed; the caller must discard the transaction.
    pub fn upgrade(&self, editor: &mut dyn SchemaEditor, old_version: u32) -> Result<u32, StoreError> {
        let mut applied = old_version;
        let now = self.clock.now();
        for step in self.steps.iter().filter(|step| step.version > old_version) {
            tracing::info!(
                version = step.version,
                description = step.description,
                "applying schema migration"
            );
            (step.apply)(editor, now).map_err(|err| match err {
                StoreError::MigrationFailed { .. } => err,
                other => StoreError::MigrationFailed {
                    version: step.version,
                    reason: other.to_string(),
                },
            })?;
            applied = step.version;
        }
        Ok(applied)
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new(vec![
            MigrationStep {
                version: 1,
                description: "create settings and the single-profile store",
                apply: create_initial_collections,
            },
            MigrationStep {
                version: 2,
                description: "create multi-record profiles and projects",
                apply: create_record_collections,
            },
            MigrationStep {
                version: 3,
                description: "copy the single profile forward and retire its store",
                apply: retire_single_profile,
            },
        ])
    }
}

/// Declared shape of the current collections.
pub fn collection_specs() -> Vec<CollectionSpec> {
    vec![
        CollectionSpec::new(RecordKind::Setting.collection(), "id"),
        CollectionSpec::new(RecordKind::Profile.collection(), "id")
            .index("updatedAt")
            .index("derivedKey"),
        CollectionSpec::new(RecordKind::Project.collection(), "id")
            .index("updatedAt")
            .index("label"),
    ]
}

fn spec_for(name: &str) -> CollectionSpec {
    collection_specs()
        .into_iter()
        .find(|spec| spec.name == name)
        .unwrap_or_else(|| CollectionSpec::new(name, "id"))
}

/// Create the collection if missing, then any of its indexes that are
/// missing. Safe on a store that already has part of the shape.
pub fn ensure_collection(editor: &mut dyn SchemaEditor, spec: &CollectionSpec) -> Result<(), StoreError> {
    if !editor.has_collection(&spec.name)? {
        editor.create_collection(spec)?;
        return Ok(());
    }
    for index in &spec.indexes {
        if !editor.has_index(&spec.name, &index.name)? {
            editor.create_index(&spec.name, index)?;
        }
    }
    Ok(())
}

fn create_initial_collections(editor: &mut dyn SchemaEditor, _: DateTime<Utc>) -> Result<(), StoreError> {
    ensure_collection(editor, &spec_for(RecordKind::Setting.collection()))?;
    ensure_collection(editor, &CollectionSpec::new(LEGACY_PROFILE_COLLECTION, "id"))
}

fn create_record_collections(editor: &mut dyn SchemaEditor, _: DateTime<Utc>) -> Result<(), StoreError> {
    ensure_collection(editor, &spec_for(RecordKind::Profile.collection()))?;
    ensure_collection(editor, &spec_for(RecordKind::Project.collection()))
}

fn retire_single_profile(editor: &mut dyn SchemaEditor, now: DateTime<Utc>) -> Result<(), StoreError> {
    let profiles = RecordKind::Profile.collection();
    ensure_collection(editor, &spec_for(profiles))?;

    if !editor.has_collection(LEGACY_PROFILE_COLLECTION)? {
        return Ok(());
    }

    let legacy = editor.read_all(LEGACY_PROFILE_COLLECTION)?;
    let mut copied = 0usize;
    for mut raw in legacy {
        // The singleton key is not an identity; let the email decide.
        if let Some(obj) = raw.as_object_mut()
            && obj.get("id").and_then(Value::as_str) == Some(LEGACY_PROFILE_KEY)
        {
            obj.remove("id");
        }

        let record = normalize(RecordKind::Profile, &raw, now);
        let existing = editor.get(profiles, &record.id)?;
        if !should_replace(MergeStrategy::KeepNewer, &raw, existing.as_ref()) {
            continue;
        }
        editor.put(profiles, &record.id, record.to_value()?)?;
        copied += 1;
    }

    editor.delete_collection(LEGACY_PROFILE_COLLECTION)?;
    tracing::info!(copied, "retired single-profile store");
    Ok(())
}
