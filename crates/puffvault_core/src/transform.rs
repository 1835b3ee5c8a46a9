//! Record transformation and field-level privacy tagging.
//!
//! Every source row maps to exactly one vault document. The mapping is pure
//! and total: each declared field has a fallback, so null or malformed
//! source values never abort the transform. Which fields are private is a
//! static table ([`FieldPolicy::default`]) that configuration may override,
//! keeping the classification auditable in one place instead of scattered
//! through the mapping.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::source::SourceRecord;

/// Marker key the target store uses for field-level encryption.
pub const ALLOT_MARKER: &str = "%allot";

/// Fields encrypted at rest, readable only by the owner identity and its
/// grantees. Directly identifying (device id, network address, reward token)
/// or behavioral (consumable choice, usage metrics, raw timestamps).
const DEFAULT_PRIVATE_FIELDS: &[&str] = &[
    "vape_id",
    "pod_type",
    "pod_flavour",
    "pod_remaining",
    "pod_nicotine_level",
    "puff_duration",
    "timestamp",
    "ip",
    "nft_token_id",
];

/// Fields stored in plaintext: non-identifying counters, firmware strings,
/// validity and settlement flags, bookkeeping timestamps. Supports aggregate
/// analytics without exposing an individual.
const DEFAULT_PUBLIC_FIELDS: &[&str] = &[
    "ble_name",
    "app_version",
    "valid",
    "nft_tier",
    "local_datetime",
    "source",
    "uploaded_at",
    "is_settled",
    "settled_metadata",
    "is_delayed_upload",
    "flag",
    "lease_id",
    "count",
    "created_at",
    "updated_at",
];

/// The private/public field split, as configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPolicy {
    /// Names of fields tagged for field-level encryption.
    pub private: BTreeSet<String>,
}

impl Default for FieldPolicy {
    fn default() -> Self {
        Self {
            private: DEFAULT_PRIVATE_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl FieldPolicy {
    pub fn is_private(&self, field: &str) -> bool {
        self.private.contains(field)
    }
}

/// How document identifiers are generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentIdMode {
    /// UUIDv5 over (collection, source id). Re-uploading the same source
    /// record after a crash-resume produces the same id, so the target
    /// store dedupes naturally.
    #[default]
    Deterministic,
    /// Fresh UUIDv4 per transform call.
    Random,
}

/// A transformed document, partitioned into private and public field groups.
///
/// `source_id` and `owner_ref` are carried as plain attributes so every
/// document traces back to exactly one source record.
#[derive(Debug, Clone)]
pub struct VaultDocument {
    pub id: Uuid,
    pub source_id: i64,
    pub owner_ref: i64,
    pub private: BTreeMap<String, Value>,
    pub public: BTreeMap<String, Value>,
}

impl VaultDocument {
    /// Wire form: private values wrapped in the encryption marker, public
    /// values plain, traceability attributes at the top level.
    pub fn to_wire(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert("_id".into(), json!(self.id.to_string()));
        doc.insert("id".into(), json!(self.source_id));
        doc.insert("user_id".into(), json!(self.owner_ref));
        for (name, value) in &self.private {
            doc.insert(name.clone(), json!({ ALLOT_MARKER: value }));
        }
        for (name, value) in &self.public {
            doc.insert(name.clone(), value.clone());
        }
        Value::Object(doc)
    }
}

/// Pure source-row to vault-document mapper.
#[derive(Debug, Clone)]
pub struct Transformer {
    policy: FieldPolicy,
    id_mode: DocumentIdMode,
    namespace: Uuid,
}

impl Transformer {
    /// `collection_id` namespaces deterministic document ids so two
    /// collections never collide on the same source id.
    pub fn new(policy: FieldPolicy, id_mode: DocumentIdMode, collection_id: Uuid) -> Self {
        Self {
            policy,
            id_mode,
            namespace: collection_id,
        }
    }

    pub fn document_id(&self, source_id: i64) -> Uuid {
        match self.id_mode {
            DocumentIdMode::Deterministic => {
                Uuid::new_v5(&self.namespace, source_id.to_string().as_bytes())
            }
            DocumentIdMode::Random => Uuid::new_v4(),
        }
    }

    /// Map one source record to a vault document. Total: missing values
    /// take their declared fallback, classification is unaffected.
    pub fn transform(&self, record: &SourceRecord) -> VaultDocument {
        let now = Utc::now();
        let mut private = BTreeMap::new();
        let mut public = BTreeMap::new();

        for (name, value) in record_fields(record, now) {
            if self.policy.is_private(name) {
                private.insert(name.to_string(), value);
            } else {
                public.insert(name.to_string(), value);
            }
        }

        VaultDocument {
            id: self.document_id(record.id),
            source_id: record.id,
            owner_ref: record.user_id,
            private,
            public,
        }
    }
}

/// The declared, total field mapping with fallbacks.
fn record_fields(record: &SourceRecord, now: DateTime<Utc>) -> Vec<(&'static str, Value)> {
    vec![
        ("vape_id", text(&record.vape_id)),
        ("pod_type", text(&record.pod_type)),
        ("pod_flavour", text(&record.pod_flavour)),
        ("pod_remaining", json!(record.pod_remaining.unwrap_or(0))),
        (
            "pod_nicotine_level",
            text_or(&record.pod_nicotine_level, "0"),
        ),
        ("puff_duration", json!(record.puff_duration.unwrap_or(1))),
        ("timestamp", iso(&record.timestamp, now)),
        ("ip", text(&record.ip)),
        ("nft_token_id", json!(record.nft_token_id.unwrap_or(0))),
        ("ble_name", text(&record.ble_name)),
        ("app_version", text(&record.app_version)),
        ("valid", json!(record.valid.unwrap_or(true))),
        ("nft_tier", json!(record.nft_tier.unwrap_or(1))),
        ("local_datetime", text(&record.local_datetime)),
        ("source", text_or(&record.source, "migration")),
        ("uploaded_at", iso(&record.uploaded_at, now)),
        ("is_settled", json!(record.is_settled.unwrap_or(false))),
        (
            "settled_metadata",
            object_or_empty(&record.settled_metadata),
        ),
        (
            "is_delayed_upload",
            json!(record.is_delayed_upload.unwrap_or(false)),
        ),
        ("flag", text(&record.flag)),
        ("lease_id", json!(record.lease_id.unwrap_or(0))),
        ("count", json!(record.count.unwrap_or(1))),
        ("created_at", iso(&record.created_at, now)),
        ("updated_at", iso(&record.updated_at, now)),
    ]
}

fn text(value: &Option<String>) -> Value {
    json!(value.clone().unwrap_or_default())
}

fn text_or(value: &Option<String>, fallback: &str) -> Value {
    json!(value.clone().unwrap_or_else(|| fallback.to_string()))
}

fn iso(value: &Option<DateTime<Utc>>, now: DateTime<Utc>) -> Value {
    json!(value.unwrap_or(now).to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Nested objects pass through; anything malformed collapses to `{}`.
fn object_or_empty(value: &Option<Value>) -> Value {
    match value {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    }
}

/// JSON schema for the target collection, derived from the same field
/// tables the transform uses. Private fields appear as share objects.
pub fn collection_schema(policy: &FieldPolicy) -> Value {
    let mut properties = serde_json::Map::new();
    properties.insert("_id".into(), json!({"type": "string", "format": "uuid"}));
    properties.insert("id".into(), json!({"type": "integer"}));
    properties.insert("user_id".into(), json!({"type": "integer"}));

    for name in DEFAULT_PRIVATE_FIELDS.iter().chain(DEFAULT_PUBLIC_FIELDS) {
        let schema = if policy.is_private(name) {
            json!({
                "type": "object",
                "properties": { "%share": { "type": "string" } },
                "required": ["%share"],
            })
        } else {
            json!({ "type": field_schema_type(name) })
        };
        properties.insert(name.to_string(), schema);
    }

    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "array",
        "items": {
            "type": "object",
            "properties": properties,
            "required": ["_id", "id", "user_id"],
        },
    })
}

fn field_schema_type(name: &str) -> &'static str {
    match name {
        "pod_remaining" | "puff_duration" | "nft_token_id" | "nft_tier" | "lease_id" | "count" => {
            "integer"
        }
        "valid" | "is_settled" | "is_delayed_upload" => "boolean",
        "settled_metadata" => "object",
        _ => "string",
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn transformer() -> Transformer {
        Transformer::new(
            FieldPolicy::default(),
            DocumentIdMode::Deterministic,
            Uuid::new_v4(),
        )
    }

    fn full_record() -> SourceRecord {
        let mut record = SourceRecord::new(101, 7);
        record.vape_id = Some("VAPE-01".into());
        record.pod_type = Some("standard".into());
        record.pod_flavour = Some("mint".into());
        record.pod_remaining = Some(80);
        record.pod_nicotine_level = Some("3".into());
        record.puff_duration = Some(12);
        record.timestamp = Some(Utc::now());
        record.ip = Some("10.0.0.1".into());
        record.nft_token_id = Some(555);
        record.ble_name = Some("device-a".into());
        record.app_version = Some("2.1.0".into());
        record.valid = Some(true);
        record.settled_metadata = Some(json!({"tx": "0xabc"}));
        record
    }

    #[test]
    fn test_partition_never_leaks_private_fields() {
        let doc = transformer().transform(&full_record());

        for name in DEFAULT_PRIVATE_FIELDS {
            assert!(doc.private.contains_key(*name), "{name} must be private");
            assert!(!doc.public.contains_key(*name), "{name} leaked to public");
        }
        for name in DEFAULT_PUBLIC_FIELDS {
            assert!(doc.public.contains_key(*name), "{name} must be public");
            assert!(!doc.private.contains_key(*name), "{name} leaked to private");
        }
    }

    #[test]
    fn test_partition_unchanged_for_absent_values() {
        // All-null record: fallbacks apply, classification does not move.
        let doc = transformer().transform(&SourceRecord::new(1, 1));

        for name in DEFAULT_PRIVATE_FIELDS {
            assert!(doc.private.contains_key(*name));
        }
        for name in DEFAULT_PUBLIC_FIELDS {
            assert!(doc.public.contains_key(*name));
        }
    }

    #[test]
    fn test_fallbacks_are_total() {
        let doc = transformer().transform(&SourceRecord::new(1, 1));

        assert_eq!(doc.private["vape_id"], json!(""));
        assert_eq!(doc.private["pod_remaining"], json!(0));
        assert_eq!(doc.private["pod_nicotine_level"], json!("0"));
        assert_eq!(doc.private["puff_duration"], json!(1));
        assert_eq!(doc.public["valid"], json!(true));
        assert_eq!(doc.public["nft_tier"], json!(1));
        assert_eq!(doc.public["is_settled"], json!(false));
        assert_eq!(doc.public["count"], json!(1));
        assert_eq!(doc.public["settled_metadata"], json!({}));
        assert_eq!(doc.public["source"], json!("migration"));
        // timestamp fallbacks are "now": present and non-empty
        assert!(doc.private["timestamp"].as_str().is_some());
    }

    #[test]
    fn test_malformed_nested_object_falls_back_to_empty() {
        let mut record = full_record();
        record.settled_metadata = Some(json!("not an object"));

        let doc = transformer().transform(&record);
        assert_eq!(doc.public["settled_metadata"], json!({}));
    }

    #[test]
    fn test_deterministic_ids_stable_random_ids_fresh() {
        let collection = Uuid::new_v4();
        let det = Transformer::new(
            FieldPolicy::default(),
            DocumentIdMode::Deterministic,
            collection,
        );
        let record = full_record();
        assert_eq!(det.transform(&record).id, det.transform(&record).id);

        // A different collection namespaces differently.
        let other = Transformer::new(
            FieldPolicy::default(),
            DocumentIdMode::Deterministic,
            Uuid::new_v4(),
        );
        assert_ne!(det.transform(&record).id, other.transform(&record).id);

        let random = Transformer::new(FieldPolicy::default(), DocumentIdMode::Random, collection);
        assert_ne!(random.transform(&record).id, random.transform(&record).id);
    }

    #[test]
    fn test_wire_form_wraps_private_values() {
        let doc = transformer().transform(&full_record());
        let wire = doc.to_wire();

        assert_eq!(wire["vape_id"], json!({ ALLOT_MARKER: "VAPE-01" }));
        assert_eq!(wire["ble_name"], json!("device-a"));
        assert_eq!(wire["id"], json!(101));
        assert_eq!(wire["user_id"], json!(7));
        assert_eq!(wire["_id"], json!(doc.id.to_string()));
    }

    #[test]
    fn test_policy_override_moves_field() {
        let mut policy = FieldPolicy::default();
        policy.private.insert("ble_name".into());

        let transformer = Transformer::new(policy, DocumentIdMode::Deterministic, Uuid::new_v4());
        let doc = transformer.transform(&full_record());

        assert!(doc.private.contains_key("ble_name"));
        assert!(!doc.public.contains_key("ble_name"));
        assert_eq!(
            doc.to_wire()["ble_name"],
            json!({ ALLOT_MARKER: "device-a" })
        );
    }

    #[test]
    fn test_collection_schema_tracks_policy() {
        let schema = collection_schema(&FieldPolicy::default());
        let properties = &schema["items"]["properties"];

        assert_eq!(properties["vape_id"]["type"], json!("object"));
        assert_eq!(properties["ble_name"]["type"], json!("string"));
        assert_eq!(properties["nft_tier"]["type"], json!("integer"));
        assert_eq!(properties["valid"]["type"], json!("boolean"));
    }
}
