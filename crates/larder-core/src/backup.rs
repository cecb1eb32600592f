// ABOUTME: Wire types for larder backups and the merge rules applied when importing them.
// ABOUTME: Payload records stay raw JSON so payloads written by older versions remain readable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::record::{parse_timestamp, resolve_timestamp};

/// Payload schema version written by this build.
pub const BACKUP_VERSION: u32 = 2;

/// Version assumed for payloads that do not state one.
pub const LEGACY_BACKUP_VERSION: u32 = 1;

/// A full export of every tracked collection.
///
/// Only `data` matters to an import, so the header fields fall back to
/// defaults instead of rejecting payloads written by older builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    #[serde(default = "legacy_version")]
    pub version: u32,
    #[serde(default = "unknown_export_time", deserialize_with = "lenient_timestamp")]
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub data: BTreeMap<String, Vec<Value>>,
}

impl BackupPayload {
    pub fn new(exported_at: DateTime<Utc>) -> Self {
        Self {
            version: BACKUP_VERSION,
            exported_at,
            data: BTreeMap::new(),
        }
    }

    /// Total number of records across all collections.
    pub fn record_count(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }
}

fn legacy_version() -> u32 {
    LEGACY_BACKUP_VERSION
}

fn unknown_export_time() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Accept RFC 3339 text, naive ISO text, or epoch milliseconds. Anything
/// else, null included, reads as the epoch.
fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&raw).unwrap_or_else(unknown_export_time))
}

/// How an incoming record competes with an existing one of the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Replace only when the incoming record is at least as new.
    #[default]
    KeepNewer,
    /// Always replace.
    Overwrite,
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-newer" => Ok(MergeStrategy::KeepNewer),
            "overwrite" => Ok(MergeStrategy::Overwrite),
            other => Err(format!("unknown merge strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    pub merge_strategy: MergeStrategy,
}

/// Outcome counts for one import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped_older: usize,
    /// Records with no primary key; they cannot be placed anywhere.
    pub skipped_invalid: usize,
    /// Records belonging to collections this build does not track.
    pub skipped_collections: usize,
}

/// A record's timestamp in epoch milliseconds, or zero when none resolves.
pub fn timestamp_millis(raw: &Value) -> i64 {
    resolve_timestamp(raw)
        .map(|at| at.timestamp_millis())
        .unwrap_or(0)
}

/// Decide whether `incoming` should replace `existing`. Ties go to the
/// incoming record under keep-newer.
pub fn should_replace(strategy: MergeStrategy, incoming: &Value, existing: Option<&Value>) -> bool {
    match (strategy, existing) {
        (_, None) => true,
        (MergeStrategy::Overwrite, Some(_)) => true,
        (MergeStrategy::KeepNewer, Some(existing)) => {
            timestamp_millis(incoming) >= timestamp_millis(existing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn keep_newer_prefers_newer_and_ties() {
        let old = json!({"id": "a", "updatedAt": "2024-01-01T00:00:00Z"});
        let new = json!({"id": "a", "updatedAt": "2024-02-01T00:00:00Z"});

        assert!(should_replace(MergeStrategy::KeepNewer, &new, Some(&old)));
        assert!(!should_replace(MergeStrategy::KeepNewer, &old, Some(&new)));
        assert!(should_replace(MergeStrategy::KeepNewer, &old, Some(&old)));
    }

    #[test]
    fn overwrite_always_replaces() {
        let old = json!({"updatedAt": "2024-01-01T00:00:00Z"});
        let new = json!({"updatedAt": "2024-02-01T00:00:00Z"});
        assert!(should_replace(MergeStrategy::Overwrite, &old, Some(&new)));
    }

    #[test]
    fn missing_existing_always_accepts() {
        let undated = json!({"id": "a"});
        assert!(should_replace(MergeStrategy::KeepNewer, &undated, None));
    }

    #[test]
    fn undated_records_resolve_to_zero() {
        assert_eq!(timestamp_millis(&json!({"id": "a"})), 0);
        assert_eq!(timestamp_millis(&json!("nope")), 0);

        let dated = json!({"id": "a", "updatedAt": "2024-01-01T00:00:00Z"});
        let undated = json!({"id": "a"});
        assert!(!should_replace(MergeStrategy::KeepNewer, &undated, Some(&dated)));
    }

    #[test]
    fn payload_reads_older_version_without_data() {
        let raw = json!({"version": 1, "exportedAt": "2023-05-01T00:00:00Z"});
        let payload: BackupPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.version, 1);
        assert!(payload.data.is_empty());
        assert_eq!(
            payload.exported_at,
            Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn payload_reads_header_without_export_time() {
        let raw = json!({"version": 1, "data": {"settings": [{"key": "theme", "value": "dark"}]}});
        let payload: BackupPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.exported_at, DateTime::UNIX_EPOCH);
        assert_eq!(payload.record_count(), 1);
        assert_eq!(payload.data["settings"][0]["value"], "dark");
    }

    #[test]
    fn payload_reads_epoch_millis_export_time() {
        let raw = json!({"version": 1, "exportedAt": 1685577600000i64, "data": {}});
        let payload: BackupPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(
            payload.exported_at,
            Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn payload_without_version_or_readable_time_uses_defaults() {
        let raw = json!({"exportedAt": "last tuesday", "data": {"profiles": []}});
        let payload: BackupPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.version, LEGACY_BACKUP_VERSION);
        assert_eq!(payload.exported_at, DateTime::UNIX_EPOCH);

        let raw = json!({"exportedAt": null});
        let payload: BackupPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.exported_at, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn payload_written_today_reads_back_unchanged() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap();
        let mut payload = BackupPayload::new(at);
        payload
            .data
            .insert("settings".to_string(), vec![json!({"id": "theme", "value": "dark"})]);

        let text = serde_json::to_string(&payload).unwrap();
        let back: BackupPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn merge_strategy_parses_kebab_case() {
        assert_eq!("keep-newer".parse::<MergeStrategy>(), Ok(MergeStrategy::KeepNewer));
        assert_eq!("overwrite".parse::<MergeStrategy>(), Ok(MergeStrategy::Overwrite));
        assert!("merge".parse::<MergeStrategy>().is_err());

        let json = serde_json::to_value(MergeStrategy::KeepNewer).unwrap();
        assert_eq!(json, json!("keep-newer"));
    }
}
