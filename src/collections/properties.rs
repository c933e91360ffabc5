// Schema properties: tagged variants, value coercion, record validation.
//
// The variant enum is the extension point for new primitive types; each
// variant supplies coercion through cast_or_create_property_value.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ValidationErrors};
use crate::events::ResourceRef;

/// The variant of a schema property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PropertyKind {
    #[serde(rename = "FREE_TEXT")]
    FreeText,
    #[serde(rename = "DB_REFERENCE")]
    DbReference { database_id: String },
}

/// One named, typed slot in a collection's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaProperty {
    pub id: String,
    pub label: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub repeated: bool,
    #[serde(flatten)]
    pub kind: PropertyKind,
}

fn default_visible() -> bool {
    true
}

impl SchemaProperty {
    pub fn free_text(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            visible: true,
            required: false,
            repeated: false,
            kind: PropertyKind::FreeText,
        }
    }

    pub fn db_reference(id: &str, label: &str, database_id: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            visible: true,
            required: false,
            repeated: false,
            kind: PropertyKind::DbReference {
                database_id: database_id.to_string(),
            },
        }
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn repeated(mut self, repeated: bool) -> Self {
        self.repeated = repeated;
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }
}

/// Validated metadata: property id -> coerced string values. Always a list,
/// even for non-repeated properties.
pub type Metadata = BTreeMap<String, Vec<String>>;

/// Raw inbound metadata: property id (or label, before conversion) -> values.
pub type RawMetadata = BTreeMap<String, Vec<Value>>;

pub fn parse_schema(json: &str) -> Result<Vec<SchemaProperty>> {
    Ok(serde_json::from_str(json)?)
}

pub fn schema_to_json(schema: &[SchemaProperty]) -> Result<String> {
    Ok(serde_json::to_string(schema)?)
}

/// Lift validated metadata back into raw form (used when re-validating stored
/// assets against a proposed schema).
pub fn metadata_to_raw(metadata: &Metadata) -> RawMetadata {
    metadata
        .iter()
        .map(|(key, values)| {
            (
                key.clone(),
                values.iter().map(|v| Value::String(v.clone())).collect(),
            )
        })
        .collect()
}

/// Normalize a JSON value into a value list. Arrays pass through; scalars
/// become a single-element list; null becomes empty.
pub fn value_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

const MSG_REQUIRED: &str = "value is required";
const MSG_NOT_REPEATED: &str = "property does not accept multiple values";
const MSG_NOT_SCALAR: &str = "value must be a scalar";

/// Coerce one raw value to a property-typed value. Returns `Ok(None)` for
/// blank values ("no value"), `Err(message)` when the raw value is
/// structurally impossible for the variant. For controlled-database
/// references into a label-record collection, the referenced record is
/// created on the fly; records created that way are appended to `created`
/// so the causing operation can announce them once it has flushed.
pub fn cast_or_create_property_value(
    conn: &Connection,
    property: &SchemaProperty,
    raw: &Value,
    created: &mut Vec<ResourceRef>,
) -> Result<std::result::Result<Option<String>, String>> {
    let text = match raw {
        Value::Null => return Ok(Ok(None)),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(_) | Value::Object(_) => return Ok(Err(MSG_NOT_SCALAR.to_string())),
    };

    if text.trim().is_empty() {
        return Ok(Ok(None));
    }

    match &property.kind {
        PropertyKind::FreeText => Ok(Ok(Some(text))),
        PropertyKind::DbReference { database_id } => {
            if super::asset_exists_in_collection(conn, database_id, &text)? {
                return Ok(Ok(Some(text)));
            }
            // Label-record collections accept a plain label and create the
            // record on first use.
            match super::get_or_create_label_record(conn, database_id, &text)? {
                Some((id, newly_created)) => {
                    if newly_created {
                        created.push(ResourceRef::new(id.clone(), Some(database_id.clone())));
                    }
                    Ok(Ok(Some(id)))
                }
                None => Ok(Err(format!("no record '{}' in referenced database", text))),
            }
        }
    }
}

/// Validate a raw metadata record against a merged schema.
///
/// Unknown keys are dropped. Every schema property appears in the output,
/// with an empty list when no value was supplied. Returns the coerced
/// metadata, or per-property error messages. Label records created during
/// coercion are appended to `created`.
pub fn validate_metadata(
    conn: &Connection,
    schema: &[SchemaProperty],
    raw: &RawMetadata,
    created: &mut Vec<ResourceRef>,
) -> Result<std::result::Result<Metadata, ValidationErrors>> {
    let mut metadata = Metadata::new();
    let mut errors = ValidationErrors::new();

    for property in schema {
        let raw_values = raw.get(&property.id).cloned().unwrap_or_default();
        let mut property_errors: Vec<String> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        for raw_value in &raw_values {
            match cast_or_create_property_value(conn, property, raw_value, created)? {
                Ok(Some(value)) => values.push(value),
                Ok(None) => {}
                Err(message) => property_errors.push(message),
            }
        }

        if !property.repeated && values.len() > 1 {
            property_errors.push(MSG_NOT_REPEATED.to_string());
        }
        if property.required && values.is_empty() && property_errors.is_empty() {
            property_errors.push(MSG_REQUIRED.to_string());
        }

        if property_errors.is_empty() {
            metadata.insert(property.id.clone(), values);
        } else {
            errors.insert(property.id.clone(), property_errors);
        }
    }

    if errors.is_empty() {
        Ok(Ok(metadata))
    } else {
        Ok(Err(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_round_trips_through_json() {
        let schema = vec![
            SchemaProperty::free_text("title", "Title").required(true),
            SchemaProperty::db_reference("author", "Author", "people").repeated(true),
        ];
        let json = schema_to_json(&schema).unwrap();
        let parsed = parse_schema(&json).unwrap();
        assert_eq!(parsed, schema);
    }

    #[test]
    fn test_schema_json_shape() {
        let schema = vec![SchemaProperty::free_text("title", "Title")];
        let json = schema_to_json(&schema).unwrap();
        assert!(json.contains("\"type\":\"FREE_TEXT\""), "got {}", json);
    }

    #[test]
    fn test_value_list_wraps_scalars() {
        assert_eq!(value_list(&Value::String("x".into())).len(), 1);
        assert!(value_list(&Value::Null).is_empty());
        assert_eq!(
            value_list(&serde_json::json!(["a", "b"])),
            vec![Value::String("a".into()), Value::String("b".into())]
        );
    }
}
