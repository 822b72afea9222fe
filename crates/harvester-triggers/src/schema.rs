//! Trigger records: wire shape, validation, identity and content hashing.

use chrono::{DateTime, Utc};
use harvester_core::OverlapPolicy;
use harvester_store::TriggerRow;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::error::{Result, TriggerError};
use crate::schedule;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_TASK_NAME_LEN: usize = 100;
pub const MAX_CRON_LEN: usize = 120;
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Where a trigger record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    /// Config file or inline config. Ids are derived from the name.
    Static,
    /// Trigger store rows, managed at runtime.
    Database,
}

/// A record as written by a human, before validation.
///
/// Accepts both `task_name` and `taskName`. `id` is optional for static
/// records and derived from `name` when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTrigger {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(alias = "taskName")]
    pub task_name: String,
    pub cron: String,
    #[serde(default)]
    pub params: Option<JsonValue>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

fn default_enabled() -> bool {
    true
}

impl From<&TriggerRow> for RawTrigger {
    fn from(row: &TriggerRow) -> Self {
        Self {
            id: Some(row.id.clone()),
            name: row.name.clone(),
            task_name: row.task_name.clone(),
            cron: row.cron.clone(),
            params: Some(row.params.clone()),
            enabled: row.enabled,
            description: row.description.clone(),
            overlap: row.overlap,
        }
    }
}

/// A validated trigger config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfigSource {
    pub id: String,
    pub name: String,
    pub task_name: String,
    /// Normalized, always has a seconds field.
    pub cron: String,
    /// Always a JSON object.
    pub params: JsonValue,
    pub enabled: bool,
    pub description: Option<String>,
    pub overlap: OverlapPolicy,
    pub source: TriggerOrigin,
}

/// A validated config plus the provider that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfigEntry {
    #[serde(flatten)]
    pub config: TriggerConfigSource,
    pub provider_name: String,
    pub loaded_at: DateTime<Utc>,
}

impl TriggerConfigEntry {
    pub fn new(config: TriggerConfigSource, provider_name: impl Into<String>) -> Self {
        Self {
            config,
            provider_name: provider_name.into(),
            loaded_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }
}

/// Stable id for a static trigger: `static-` plus 16 hex chars of
/// SHA-256 over the trigger name.
pub fn derive_static_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!("static-{}", &hex::encode(digest)[..16])
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len > max {
        return Err(TriggerError::validation(
            field,
            format!("{len} characters, at most {max} allowed"),
        ));
    }
    Ok(())
}

fn required(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TriggerError::validation(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Validate one record and turn it into a [`TriggerConfigSource`].
pub fn validate(raw: RawTrigger, origin: TriggerOrigin) -> Result<TriggerConfigSource> {
    let name = required("name", &raw.name)?;
    check_len("name", &name, MAX_NAME_LEN)?;

    let task_name = required("taskName", &raw.task_name)?;
    check_len("taskName", &task_name, MAX_TASK_NAME_LEN)?;

    let cron_expr = required("cron", &raw.cron)?;
    check_len("cron", &cron_expr, MAX_CRON_LEN)?;
    schedule::parse(&cron_expr)?;

    let id = match raw.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ if origin == TriggerOrigin::Static => derive_static_id(&name),
        _ => return Err(TriggerError::validation("id", "must not be empty")),
    };
    check_len("id", &id, MAX_ID_LEN)?;

    if let Some(desc) = &raw.description {
        check_len("description", desc, MAX_DESCRIPTION_LEN)?;
    }

    let params = match raw.params {
        None | Some(JsonValue::Null) => JsonValue::Object(Default::default()),
        Some(JsonValue::Object(map)) => JsonValue::Object(map),
        Some(other) => {
            return Err(TriggerError::validation(
                "params",
                format!("must be an object, got {}", json_kind(&other)),
            ))
        }
    };

    Ok(TriggerConfigSource {
        id,
        name,
        task_name,
        cron: schedule::normalize(&cron_expr),
        params,
        enabled: raw.enabled,
        description: raw.description.filter(|d| !d.trim().is_empty()),
        overlap: raw.overlap,
        source: origin,
    })
}

/// Decode and validate one untyped record.
pub fn parse_record(value: JsonValue, origin: TriggerOrigin) -> Result<TriggerConfigSource> {
    let raw: RawTrigger = serde_json::from_value(value)
        .map_err(|e| TriggerError::validation("record", e.to_string()))?;
    validate(raw, origin)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Fields that decide how a trigger is scheduled and what it runs.
#[derive(Serialize)]
struct HashedFields<'a> {
    id: &'a str,
    name: &'a str,
    task_name: &'a str,
    cron: &'a str,
    enabled: bool,
    params: &'a JsonValue,
    overlap: OverlapPolicy,
}

/// SHA-256 over the scheduling-relevant fields of every config, in id order.
/// Provenance (`provider_name`, `loaded_at`) is not part of the hash.
pub fn content_hash<'a>(configs: impl IntoIterator<Item = &'a TriggerConfigSource>) -> String {
    let mut sorted: Vec<&TriggerConfigSource> = configs.into_iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = Sha256::new();
    for c in sorted {
        let fields = HashedFields {
            id: &c.id,
            name: &c.name,
            task_name: &c.task_name,
            cron: &c.cron,
            enabled: c.enabled,
            params: &c.params,
            overlap: c.overlap,
        };
        // Serializing borrowed strings and a JSON value cannot fail.
        let encoded = serde_json::to_vec(&fields).unwrap_or_default();
        hasher.update(&encoded);
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(name: &str, cron: &str) -> RawTrigger {
        serde_json::from_value(json!({ "name": name, "taskName": "echo", "cron": cron })).unwrap()
    }

    #[test]
    fn static_ids_are_stable_and_name_based() {
        let a = derive_static_id("nightly-report");
        assert_eq!(a, derive_static_id("nightly-report"));
        assert_ne!(a, derive_static_id("hourly-report"));
        assert!(a.starts_with("static-"));
        assert_eq!(a.len(), "static-".len() + 16);
    }

    #[test]
    fn static_record_without_id_gets_derived_one() {
        let cfg = validate(raw("nightly", "0 3 * * *"), TriggerOrigin::Static).unwrap();
        assert_eq!(cfg.id, derive_static_id("nightly"));
        assert_eq!(cfg.cron, "0 0 3 * * *");
        assert_eq!(cfg.params, json!({}));
        assert!(cfg.enabled);
    }

    #[test]
    fn database_record_requires_id() {
        let err = validate(raw("nightly", "0 3 * * *"), TriggerOrigin::Database).unwrap_err();
        assert!(matches!(err, TriggerError::Validation { ref field, .. } if field == "id"));
    }

    #[test]
    fn missing_task_name_is_a_validation_error() {
        let err = parse_record(json!({ "name": "x", "cron": "* * * * *" }), TriggerOrigin::Static)
            .unwrap_err();
        assert!(matches!(err, TriggerError::Validation { .. }));
    }

    #[test]
    fn limits_are_enforced() {
        let long = "n".repeat(MAX_NAME_LEN + 1);
        assert!(validate(raw(&long, "* * * * *"), TriggerOrigin::Static).is_err());
        assert!(validate(raw("ok", "not a cron"), TriggerOrigin::Static).is_err());

        let mut r = raw("ok", "* * * * *");
        r.description = Some("d".repeat(MAX_DESCRIPTION_LEN + 1));
        assert!(validate(r, TriggerOrigin::Static).is_err());

        let mut r = raw("ok", "* * * * *");
        r.params = Some(json!([1, 2]));
        let err = validate(r, TriggerOrigin::Static).unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn hash_ignores_order_and_provenance_but_not_content() {
        let a = validate(raw("a", "* * * * *"), TriggerOrigin::Static).unwrap();
        let b = validate(raw("b", "*/5 * * * *"), TriggerOrigin::Static).unwrap();

        let h1 = content_hash([&a, &b]);
        let h2 = content_hash([&b, &a]);
        assert_eq!(h1, h2);

        let mut b2 = b.clone();
        b2.cron = "0 */10 * * * *".into();
        assert_ne!(h1, content_hash([&a, &b2]));

        let mut b3 = b.clone();
        b3.params = json!({ "k": 1 });
        assert_ne!(h1, content_hash([&a, &b3]));
    }
}
