use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use super::{catalog, EventSchema, FieldType, SchemaError, SchemaVersion, ValidationError};

#[derive(Debug, Default)]
struct TypeEntry {
    schemas: BTreeMap<SchemaVersion, EventSchema>,
    /// `(old, new) -> new can read data written against old`, for every ordered pair.
    compatibility: HashMap<(SchemaVersion, SchemaVersion), bool>,
}

impl TypeEntry {
    fn rebuild_compatibility(&mut self) {
        self.compatibility.clear();
        for (old_version, old) in &self.schemas {
            for (new_version, new) in &self.schemas {
                if old_version != new_version {
                    self.compatibility
                        .insert((*old_version, *new_version), forward_compatible(old, new));
                }
            }
        }
    }
}

/// In-memory registry of event schemas keyed by event type and semantic version.
///
/// Registration takes the write lock (one registration at a time); lookups and
/// validation share the read lock.
#[derive(Debug, Default)]
pub struct EventSchemaRegistry {
    types: RwLock<HashMap<String, TypeEntry>>,
}

impl EventSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the platform's own event schemas.
    pub fn with_builtin_schemas() -> Result<Self, SchemaError> {
        let registry = Self::new();
        for (event_type, schema) in catalog::builtin_schemas() {
            registry.register_schema(event_type, schema)?;
        }
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TypeEntry>> {
        self.types.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TypeEntry>> {
        self.types.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_schema(&self, event_type: &str, schema: EventSchema) -> Result<(), SchemaError> {
        if event_type.trim().is_empty() {
            return Err(SchemaError::MissingEventType);
        }
        let version: SchemaVersion = schema.version.parse()?;

        let mut types = self.write();
        let entry = types.entry(event_type.to_string()).or_default();
        if entry.schemas.contains_key(&version) {
            return Err(SchemaError::DuplicateVersion {
                event_type: event_type.to_string(),
                version: schema.version,
            });
        }

        entry.schemas.insert(version, schema);
        entry.rebuild_compatibility();

        info!(event_type, version = %version, "registered event schema");
        Ok(())
    }

    /// Schema for `version`, or the numerically highest version when `None`.
    pub fn get_schema(&self, event_type: &str, version: Option<&str>) -> Result<EventSchema, SchemaError> {
        let types = self.read();
        let entry = types
            .get(event_type)
            .filter(|e| !e.schemas.is_empty())
            .ok_or_else(|| SchemaError::UnknownEventType(event_type.to_string()))?;

        let found = match version {
            None => entry.schemas.values().next_back(),
            Some(raw) => raw
                .parse::<SchemaVersion>()
                .ok()
                .and_then(|v| entry.schemas.get(&v)),
        };

        found.cloned().ok_or_else(|| SchemaError::UnknownVersion {
            event_type: event_type.to_string(),
            version: version.unwrap_or_default().to_string(),
        })
    }

    /// Validate a payload. An empty list means the payload is valid.
    ///
    /// Fails only when the event type or the requested version is not registered.
    pub fn validate_event(
        &self,
        event_type: &str,
        payload: &JsonValue,
        version: Option<&str>,
    ) -> Result<Vec<ValidationError>, SchemaError> {
        let schema = self.get_schema(event_type, version)?;
        let empty = Map::new();
        let object = payload.as_object().unwrap_or(&empty);

        let mut errors = Vec::new();
        for field in &schema.fields {
            let value = object.get(&field.name).filter(|v| !v.is_null());
            let Some(value) = value else {
                if field.required {
                    errors.push(ValidationError {
                        field: field.name.clone(),
                        error: "Required field missing".to_string(),
                    });
                }
                continue;
            };

            if !matches_type(field.field_type, value) {
                errors.push(ValidationError {
                    field: field.name.clone(),
                    error: format!(
                        "Invalid type. Expected {}, got {}",
                        field.field_type,
                        json_type_name(value)
                    ),
                });
                continue;
            }

            if let Some(allowed) = &field.allowed {
                if !allowed.contains(value) {
                    let listed: Vec<String> = allowed.iter().map(display_value).collect();
                    errors.push(ValidationError {
                        field: field.name.clone(),
                        error: format!("Value must be one of: {}", listed.join(", ")),
                    });
                }
            }
        }

        for deprecated in &schema.deprecated_fields {
            if object.contains_key(deprecated) {
                warn!(
                    event_type,
                    version = %schema.version,
                    field = %deprecated,
                    "payload uses deprecated field"
                );
            }
        }

        if !errors.is_empty() {
            debug!(event_type, errors = errors.len(), "event payload failed validation");
        }
        Ok(errors)
    }

    /// Whether data written against `old_version` can be read by `new_version`.
    ///
    /// Equal versions are always compatible; unknown types or versions never are.
    pub fn is_compatible(&self, event_type: &str, old_version: &str, new_version: &str) -> bool {
        if old_version == new_version {
            return true;
        }

        let (Ok(old), Ok(new)) = (
            old_version.parse::<SchemaVersion>(),
            new_version.parse::<SchemaVersion>(),
        ) else {
            return false;
        };
        if old == new {
            return true;
        }

        self.read()
            .get(event_type)
            .and_then(|e| e.compatibility.get(&(old, new)).copied())
            .unwrap_or(false)
    }

    /// Registered versions of an event type, ascending numerically.
    pub fn schema_versions(&self, event_type: &str) -> Vec<String> {
        self.read()
            .get(event_type)
            .map(|e| e.schemas.keys().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    pub fn registered_event_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, e)| !e.schemas.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every `(old, new, compatible)` triple for an event type, ordered by versions.
    pub fn compatibility_matrix(&self, event_type: &str) -> Vec<(String, String, bool)> {
        let types = self.read();
        let Some(entry) = types.get(event_type) else {
            return Vec::new();
        };

        let mut pairs: Vec<_> = entry.compatibility.iter().collect();
        pairs.sort_by_key(|((old, new), _)| (*old, *new));
        pairs
            .into_iter()
            .map(|((old, new), ok)| (old.to_string(), new.to_string(), *ok))
            .collect()
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}

/// Forward compatibility of `new` with data written against `old`.
fn forward_compatible(old: &EventSchema, new: &EventSchema) -> bool {
    for old_field in &old.fields {
        let Some(new_field) = new.get_field(&old_field.name) else {
            return false;
        };
        if new_field.field_type != old_field.field_type {
            return false;
        }
        if old_field.required && !new_field.required {
            return false;
        }
    }

    new.fields.iter().all(|new_field| {
        !new_field.required || old.get_field(&new_field.name).is_some() || new_field.default.is_some()
    })
}

fn matches_type(expected: FieldType, value: &JsonValue) -> bool {
    match expected {
        FieldType::String => value.is_string(),
        FieldType::Number => value.as_f64().is_some_and(f64::is_finite),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
        FieldType::Date => value.as_str().is_some_and(is_date),
    }
}

fn is_date(raw: &str) -> bool {
    DateTime::parse_from_rfc3339(raw).is_ok()
        || NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok()
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn display_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaField;
    use serde_json::json;

    fn submitted_v1() -> EventSchema {
        EventSchema::new("JobSubmitted", "1.0.0")
            .field(SchemaField::required("job_id", FieldType::String))
            .field(SchemaField::required("agent", FieldType::String).one_of(["AlphaCal", "ImageReconstruction"]))
            .field(SchemaField::optional("submitted_at", FieldType::Date))
    }

    #[test]
    fn duplicate_version_is_rejected() {
        let registry = EventSchemaRegistry::new();
        registry.register_schema("job.submitted", submitted_v1()).unwrap();

        let err = registry
            .register_schema("job.submitted", submitted_v1())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Schema version 1.0.0 already registered for job.submitted"
        );
    }

    #[test]
    fn blank_event_type_is_rejected() {
        let registry = EventSchemaRegistry::new();
        for event_type in ["", "   "] {
            let err = registry.register_schema(event_type, submitted_v1()).unwrap_err();
            assert_eq!(err, SchemaError::MissingEventType);
            assert_eq!(err.to_string(), "eventType and schema are required");
        }
        assert!(registry.registered_event_types().is_empty());
    }

    #[test]
    fn equal_versions_compare_numerically() {
        let registry = EventSchemaRegistry::new();
        registry.register_schema("job.submitted", submitted_v1()).unwrap();

        assert!(registry.is_compatible("job.submitted", "01.0.0", "1.0.0"));
        assert!(registry.is_compatible("job.submitted", "1.0.0", "1.00.0"));
        assert!(!registry.is_compatible("job.submitted", "1.0.0", "2.0.0"));
    }

    #[test]
    fn invalid_version_is_rejected_and_nothing_registered() {
        let registry = EventSchemaRegistry::new();
        let err = registry
            .register_schema("job.submitted", EventSchema::new("JobSubmitted", "1.0"))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidVersion(_)));
        assert!(registry.registered_event_types().is_empty());
    }

    #[test]
    fn latest_is_numeric_maximum() {
        let registry = EventSchemaRegistry::new();
        for version in ["1.2.0", "1.10.0", "1.9.3"] {
            registry
                .register_schema("job.submitted", EventSchema::new("JobSubmitted", version))
                .unwrap();
        }

        assert_eq!(registry.get_schema("job.submitted", None).unwrap().version, "1.10.0");
        assert_eq!(
            registry.schema_versions("job.submitted"),
            vec!["1.2.0", "1.9.3", "1.10.0"]
        );
    }

    #[test]
    fn lookups_report_unknown_type_and_version() {
        let registry = EventSchemaRegistry::new();
        assert_eq!(
            registry.get_schema("job.unknown", None).unwrap_err().to_string(),
            "No schemas registered for event type: job.unknown"
        );

        registry.register_schema("job.submitted", submitted_v1()).unwrap();
        assert_eq!(
            registry
                .get_schema("job.submitted", Some("2.0.0"))
                .unwrap_err()
                .to_string(),
            "Schema version 2.0.0 not found for job.submitted"
        );
        assert!(registry.schema_versions("job.unknown").is_empty());
    }

    #[test]
    fn validation_reports_missing_type_and_enum_errors() {
        let registry = EventSchemaRegistry::new();
        registry.register_schema("job.submitted", submitted_v1()).unwrap();

        let errors = registry
            .validate_event(
                "job.submitted",
                &json!({"agent": "Other", "submitted_at": 42, "extra": true}),
                None,
            )
            .unwrap();

        assert_eq!(
            errors,
            vec![
                ValidationError {
                    field: "job_id".into(),
                    error: "Required field missing".into()
                },
                ValidationError {
                    field: "agent".into(),
                    error: "Value must be one of: AlphaCal, ImageReconstruction".into()
                },
                ValidationError {
                    field: "submitted_at".into(),
                    error: "Invalid type. Expected date, got number".into()
                },
            ]
        );
    }

    #[test]
    fn null_counts_as_missing_and_dates_accept_common_forms() {
        let registry = EventSchemaRegistry::new();
        registry.register_schema("job.submitted", submitted_v1()).unwrap();

        let errors = registry
            .validate_event("job.submitted", &json!({"job_id": null, "agent": "AlphaCal"}), None)
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "job_id");

        for date in ["2025-01-01", "2025-01-01T10:00:00", "2025-01-01T10:00:00Z", "2025-01-01T10:00:00.5+02:00"] {
            let payload = json!({"job_id": "j", "agent": "AlphaCal", "submitted_at": date});
            assert!(registry.validate_event("job.submitted", &payload, None).unwrap().is_empty(), "{date}");
        }

        let payload = json!({"job_id": "j", "agent": "AlphaCal", "submitted_at": "yesterday"});
        assert_eq!(registry.validate_event("job.submitted", &payload, None).unwrap().len(), 1);
    }

    #[test]
    fn validation_of_unregistered_version_fails() {
        let registry = EventSchemaRegistry::new();
        registry.register_schema("job.submitted", submitted_v1()).unwrap();
        assert!(matches!(
            registry.validate_event("job.submitted", &json!({}), Some("9.9.9")),
            Err(SchemaError::UnknownVersion { .. })
        ));
    }

    #[test]
    fn forward_compatibility_rules() {
        let registry = EventSchemaRegistry::new();
        let v1 = EventSchema::new("S", "1.0.0").field(SchemaField::required("a", FieldType::String));
        let v2_optional = EventSchema::new("S", "1.1.0")
            .field(SchemaField::required("a", FieldType::String))
            .field(SchemaField::optional("b", FieldType::Number));
        let v3_required_default = EventSchema::new("S", "1.2.0")
            .field(SchemaField::required("a", FieldType::String))
            .field(SchemaField::required("c", FieldType::Number).with_default(0));
        let v4_required_no_default = EventSchema::new("S", "1.3.0")
            .field(SchemaField::required("a", FieldType::String))
            .field(SchemaField::required("d", FieldType::Number));
        let v5_type_change = EventSchema::new("S", "2.0.0").field(SchemaField::required("a", FieldType::Number));
        let v6_relaxed = EventSchema::new("S", "2.1.0").field(SchemaField::optional("a", FieldType::String));

        for schema in [v1, v2_optional, v3_required_default, v4_required_no_default, v5_type_change, v6_relaxed] {
            registry.register_schema("s", schema).unwrap();
        }

        assert!(registry.is_compatible("s", "1.0.0", "1.0.0"));
        assert!(registry.is_compatible("s", "1.0.0", "1.1.0"));
        assert!(registry.is_compatible("s", "1.0.0", "1.2.0"));
        assert!(!registry.is_compatible("s", "1.0.0", "1.3.0"));
        assert!(!registry.is_compatible("s", "1.0.0", "2.0.0"));
        assert!(!registry.is_compatible("s", "1.0.0", "2.1.0"));
        // Removing an old field breaks compatibility.
        assert!(!registry.is_compatible("s", "1.1.0", "1.0.0"));
        assert!(!registry.is_compatible("s", "1.0.0", "9.9.9"));
        assert!(!registry.is_compatible("other", "1.0.0", "1.1.0"));

        assert_eq!(registry.compatibility_matrix("s").len(), 6 * 5);
    }

    #[test]
    fn clear_forgets_everything() {
        let registry = EventSchemaRegistry::with_builtin_schemas().unwrap();
        assert!(!registry.registered_event_types().is_empty());
        registry.clear();
        assert!(registry.registered_event_types().is_empty());
    }
}
