// ABOUTME: Defines StoredRecord and RecordKind, the canonical shape of every persisted profile, project, and setting.
// ABOUTME: normalize() turns partial or legacy input into a canonical record; derive_id() yields stable identifiers.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

/// Field names consulted, in order, when looking for a record's timestamp.
pub const TIMESTAMP_FIELDS: &[&str] = &[
    "updatedAt",
    "updated_at",
    "modifiedAt",
    "lastModified",
    "createdAt",
    "created_at",
];

/// Envelope fields stripped from flat legacy input before it becomes `data`.
const ENVELOPE_FIELDS: &[&str] = &["id", "updatedAt", "updated_at", "derivedKey", "label"];

/// The kinds of entity larder persists. Each kind owns one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Profile,
    Project,
    Setting,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Profile, RecordKind::Project, RecordKind::Setting];

    /// The storage collection holding records of this kind.
    pub fn collection(self) -> &'static str {
        match self {
            RecordKind::Profile => "profiles",
            RecordKind::Project => "projects",
            RecordKind::Setting => "settings",
        }
    }

    pub fn from_collection(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.collection() == name)
    }

    /// The identity-bearing data field ids are derived from, if any.
    pub fn identity_field(self) -> Option<&'static str> {
        match self {
            RecordKind::Profile => Some("email"),
            RecordKind::Project | RecordKind::Setting => None,
        }
    }

    fn label_fields(self) -> &'static [&'static str] {
        match self {
            RecordKind::Profile => &["name", "displayName", "email"],
            RecordKind::Project => &["name", "title"],
            RecordKind::Setting => &["key"],
        }
    }

    /// Envelope fields that carry the primary key. Settings written by older
    /// builds were keyed by `key` instead of `id`.
    fn key_fields(self) -> &'static [&'static str] {
        match self {
            RecordKind::Setting => &["id", "key"],
            RecordKind::Profile | RecordKind::Project => &["id"],
        }
    }

    /// Data fields every record of this kind carries, with their defaults.
    fn required_fields(self) -> Vec<(&'static str, Value)> {
        match self {
            RecordKind::Profile => vec![
                ("name", Value::String(String::new())),
                ("email", Value::String(String::new())),
                ("projects", Value::Array(Vec::new())),
            ],
            RecordKind::Project => vec![
                ("name", Value::String(String::new())),
                ("description", Value::String(String::new())),
                ("tags", Value::Array(Vec::new())),
            ],
            RecordKind::Setting => vec![("value", Value::Null)],
        }
    }

    /// The primary key carried by raw input, if it has one.
    pub fn primary_key(self, raw: &Value) -> Option<String> {
        let obj = raw.as_object()?;
        self.key_fields()
            .iter()
            .find_map(|field| obj.get(*field).and_then(key_string))
    }
}

/// The canonical persisted record. Serialized camelCase; `updatedAt` is an
/// RFC 3339 string with millisecond precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: String,
    pub data: Map<String, Value>,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_key: Option<String>,
    #[serde(with = "iso8601")]
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    /// Serialize into the JSON value stored by engines and backups.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Stamp the record as modified at `at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = truncate_to_millis(at);
    }
}

/// Derive the id for a record: an explicitly supplied id wins, then the
/// trimmed, lower-cased identity field, then a fresh ULID.
pub fn derive_id(kind: RecordKind, data: &Map<String, Value>, provided: Option<&str>) -> String {
    if let Some(id) = provided.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    if let Some(key) = identity_key(kind, data) {
        return key;
    }
    Ulid::new().to_string()
}

/// Build a canonical record from arbitrary input. Never fails: anything
/// missing or of the wrong type is replaced with a default, and a missing
/// timestamp becomes `now`.
///
/// Accepts the canonical shape (`{id, data, label, updatedAt}`) as well as
/// flat legacy objects where the entity fields sit at the top level.
pub fn normalize(kind: RecordKind, raw: &Value, now: DateTime<Utc>) -> StoredRecord {
    let empty = Map::new();
    let obj = raw.as_object().unwrap_or(&empty);

    let mut data = match obj.get("data").and_then(Value::as_object) {
        Some(inner) => inner.clone(),
        None => obj
            .iter()
            .filter(|(field, _)| !ENVELOPE_FIELDS.contains(&field.as_str()))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect(),
    };

    for (field, default) in kind.required_fields() {
        let keep = data
            .get(field)
            .is_some_and(|existing| default.is_null() || same_type(existing, &default));
        if !keep {
            data.insert(field.to_string(), default);
        }
    }

    let provided = kind.primary_key(raw);
    let id = derive_id(kind, &data, provided.as_deref());

    let derived_key = obj
        .get("derivedKey")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .or_else(|| identity_key(kind, &data));

    let label = obj
        .get("label")
        .and_then(Value::as_str)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .or_else(|| {
            kind.label_fields().iter().find_map(|field| {
                data.get(*field)
                    .and_then(Value::as_str)
                    .filter(|label| !label.is_empty())
                    .map(str::to_string)
            })
        })
        .unwrap_or_else(|| match kind {
            RecordKind::Setting => id.clone(),
            RecordKind::Profile | RecordKind::Project => String::new(),
        });

    let updated_at = resolve_timestamp(raw).unwrap_or(now);

    StoredRecord {
        id,
        data,
        label,
        derived_key,
        updated_at: truncate_to_millis(updated_at),
    }
}

/// Find a record's timestamp by checking `TIMESTAMP_FIELDS` at the top
/// level and then inside `data`. Accepts RFC 3339 strings, naive ISO
/// strings (read as UTC), and epoch-millisecond numbers.
pub fn resolve_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    let obj = raw.as_object()?;
    let nested = obj.get("data").and_then(Value::as_object);

    TIMESTAMP_FIELDS.iter().find_map(|field| {
        obj.get(*field)
            .and_then(parse_timestamp)
            .or_else(|| nested.and_then(|d| d.get(*field)).and_then(parse_timestamp))
    })
}

/// Read one timestamp value in any of the forms `resolve_timestamp` accepts.
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn identity_key(kind: RecordKind, data: &Map<String, Value>) -> Option<String> {
    let field = kind.identity_field()?;
    data.get(field)
        .and_then(Value::as_str)
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn same_type(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// Millisecond-precision RFC 3339 with a `Z` suffix, so stored timestamps
/// sort lexicographically in chronological order.
mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn derive_id_is_stable_for_same_email() {
        let data = json!({"email": "X@Y.com"});
        let data = data.as_object().unwrap();
        let first = derive_id(RecordKind::Profile, data, None);
        let second = derive_id(RecordKind::Profile, data, None);
        assert_eq!(first, second);
        assert_eq!(first, "x@y.com");

        let other = json!({"email": "other@y.com"});
        let other_id = derive_id(RecordKind::Profile, other.as_object().unwrap(), None);
        assert_ne!(first, other_id);
    }

    #[test]
    fn derive_id_trims_and_lowercases_identity() {
        let data = json!({"email": "  Ana@Example.COM "});
        let id = derive_id(RecordKind::Profile, data.as_object().unwrap(), None);
        assert_eq!(id, "ana@example.com");
    }

    #[test]
    fn derive_id_prefers_provided_id() {
        let data = json!({"email": "ana@example.com"});
        let id = derive_id(RecordKind::Profile, data.as_object().unwrap(), Some(" p-42 "));
        assert_eq!(id, "p-42");

        let blank = derive_id(RecordKind::Profile, data.as_object().unwrap(), Some("   "));
        assert_eq!(blank, "ana@example.com");
    }

    #[test]
    fn derive_id_falls_back_to_random_ulid() {
        let data = Map::new();
        let a = derive_id(RecordKind::Project, &data, None);
        let b = derive_id(RecordKind::Project, &data, None);
        assert_ne!(a, b);
        assert!(a.parse::<Ulid>().is_ok());
    }

    #[test]
    fn normalize_never_fails_on_garbage() {
        for raw in [json!(null), json!("a string"), json!(42), json!([1, 2, 3])] {
            let record = normalize(RecordKind::Profile, &raw, now());
            assert!(!record.id.is_empty());
            assert_eq!(record.data["name"], json!(""));
            assert_eq!(record.data["email"], json!(""));
            assert_eq!(record.data["projects"], json!([]));
            assert_eq!(record.label, "");
            assert!(record.derived_key.is_none());
            assert_eq!(record.updated_at, now());
        }
    }

    #[test]
    fn normalize_flat_legacy_profile() {
        let raw = json!({
            "name": "Ana",
            "email": "Ana@Example.com",
            "updatedAt": "2023-01-02T03:04:05Z",
            "theme": "dark"
        });
        let record = normalize(RecordKind::Profile, &raw, now());

        assert_eq!(record.id, "ana@example.com");
        assert_eq!(record.label, "Ana");
        assert_eq!(record.derived_key.as_deref(), Some("ana@example.com"));
        assert_eq!(record.data["theme"], json!("dark"));
        assert!(!record.data.contains_key("updatedAt"));
        assert_eq!(
            record.updated_at,
            Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).unwrap()
        );
    }

    #[test]
    fn normalize_replaces_ill_typed_required_fields() {
        let raw = json!({"id": "p1", "name": 7, "tags": "not-a-list"});
        let record = normalize(RecordKind::Project, &raw, now());
        assert_eq!(record.id, "p1");
        assert_eq!(record.data["name"], json!(""));
        assert_eq!(record.data["tags"], json!([]));
        assert_eq!(record.data["description"], json!(""));
    }

    #[test]
    fn normalize_is_a_fixed_point_on_canonical_records() {
        let raw = json!({"email": "ana@example.com", "name": "Ana Souza"});
        let first = normalize(RecordKind::Profile, &raw, now());
        let value = first.to_value().unwrap();
        let second = normalize(RecordKind::Profile, &value, now() + chrono::Duration::days(3));
        assert_eq!(first, second);
        assert_eq!(value, second.to_value().unwrap());
    }

    #[test]
    fn normalize_setting_accepts_key_alias() {
        let raw = json!({"key": "theme", "value": "dark"});
        let record = normalize(RecordKind::Setting, &raw, now());
        assert_eq!(record.id, "theme");
        assert_eq!(record.label, "theme");
        assert_eq!(record.data["value"], json!("dark"));
    }

    #[test]
    fn normalize_truncates_to_millis() {
        let precise = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let record = normalize(RecordKind::Project, &json!({}), precise);
        assert_eq!(record.updated_at.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(record.updated_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn resolve_timestamp_checks_fields_in_order() {
        let raw = json!({
            "createdAt": "2020-01-01T00:00:00Z",
            "lastModified": 1_600_000_000_000i64
        });
        let ts = resolve_timestamp(&raw).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_600_000_000_000);

        let nested = json!({"data": {"updated_at": "2021-05-05T10:00:00"}});
        let ts = resolve_timestamp(&nested).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2021, 5, 5, 10, 0, 0).unwrap());

        assert!(resolve_timestamp(&json!({"updatedAt": "garbage"})).is_none());
    }

    #[test]
    fn stored_record_serializes_millis_with_z() {
        let record = normalize(RecordKind::Setting, &json!({"id": "locale"}), now());
        let value = record.to_value().unwrap();
        assert_eq!(value["updatedAt"], json!("2024-06-01T09:30:00.000Z"));
        assert!(value.get("derivedKey").is_none());
    }

    #[test]
    fn record_kind_collection_round_trip() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::from_collection(kind.collection()), Some(kind));
        }
        assert_eq!(RecordKind::from_collection("widgets"), None);
    }
}
