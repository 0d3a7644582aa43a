//! Domain model types used throughout gitindex.
//!
//! These types bridge the content store, the index manager, and whatever
//! dispatch layer sits in front of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::diff::ChangeRecord;

/// Field holding an object's identity inside its JSON representation.
pub const UUID_FIELD: &str = "uuid";

// ---------------------------------------------------------------------------
// Content-type schemas
// ---------------------------------------------------------------------------

/// A content-type definition read from `_schemas/<namespace>.<name>.avsc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentTypeSchema {
    #[serde(rename = "type", default = "default_record_kind")]
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default)]
    pub fields: Vec<SchemaField>,
}

fn default_record_kind() -> String {
    "record".into()
}

/// One field of a [`ContentTypeSchema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl ContentTypeSchema {
    /// `<namespace>.<name>`, the content-type identifier.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Index mapping derived from the field types, used when the store does
    /// not ship a custom mapping for this type.
    pub fn default_mapping(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let mapped = if field.name == UUID_FIELD {
                serde_json::json!({ "type": "keyword" })
            } else {
                search_type(&field.field_type)
            };
            properties.insert(field.name.clone(), mapped);
        }
        properties
            .entry(UUID_FIELD.to_string())
            .or_insert_with(|| serde_json::json!({ "type": "keyword" }));
        serde_json::json!({ "properties": properties })
    }
}

fn search_type(field_type: &Value) -> Value {
    let name = match field_type {
        Value::String(s) => s.as_str(),
        // Unions: the first non-null branch decides.
        Value::Array(branches) => {
            return branches
                .iter()
                .find(|b| b.as_str() != Some("null"))
                .map(search_type)
                .unwrap_or_else(|| serde_json::json!({ "type": "keyword" }));
        }
        Value::Object(obj) => match obj.get("type").and_then(Value::as_str) {
            Some("array") => {
                return obj
                    .get("items")
                    .map(search_type)
                    .unwrap_or_else(|| serde_json::json!({ "type": "keyword" }))
            }
            Some("enum") => "enum",
            Some(other) if obj.len() == 1 => other,
            _ => "record",
        },
        _ => "record",
    };
    match name {
        "string" => serde_json::json!({ "type": "text" }),
        "enum" => serde_json::json!({ "type": "keyword" }),
        "int" | "long" => serde_json::json!({ "type": "long" }),
        "float" | "double" => serde_json::json!({ "type": "double" }),
        "boolean" => serde_json::json!({ "type": "boolean" }),
        "bytes" => serde_json::json!({ "type": "binary" }),
        _ => serde_json::json!({ "type": "object" }),
    }
}

// ---------------------------------------------------------------------------
// Content objects
// ---------------------------------------------------------------------------

/// An instance of a content type: a uuid plus a generic field mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentObject {
    pub content_type: String,
    pub uuid: String,
    pub fields: Map<String, Value>,
}

impl ContentObject {
    /// Build an object, taking the uuid from `fields` when present and
    /// generating a fresh one otherwise.
    pub fn new(content_type: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        let uuid = match fields.remove(UUID_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => Uuid::new_v4().simple().to_string(),
        };
        Self {
            content_type: content_type.into(),
            uuid,
            fields,
        }
    }

    pub fn with_uuid(
        content_type: impl Into<String>,
        uuid: impl Into<String>,
        mut fields: Map<String, Value>,
    ) -> Self {
        fields.remove(UUID_FIELD);
        Self {
            content_type: content_type.into(),
            uuid: uuid.into(),
            fields,
        }
    }

    /// Decode a stored JSON document. `fallback_uuid` (the file stem) is used
    /// when the document carries no uuid of its own.
    pub fn from_json(
        content_type: impl Into<String>,
        fallback_uuid: &str,
        value: Value,
    ) -> Result<Self, String> {
        let Value::Object(mut fields) = value else {
            return Err("content object must be a JSON object".into());
        };
        let uuid = match fields.remove(UUID_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Null) | None if !fallback_uuid.is_empty() => fallback_uuid.to_string(),
            Some(other) => return Err(format!("invalid uuid field: {}", other)),
            None => return Err("missing uuid".into()),
        };
        Ok(Self {
            content_type: content_type.into(),
            uuid,
            fields,
        })
    }

    /// The full JSON representation, uuid included.
    pub fn to_json(&self) -> Value {
        let mut doc = self.fields.clone();
        doc.insert(UUID_FIELD.to_string(), Value::String(self.uuid.clone()));
        Value::Object(doc)
    }

    /// Path of this object relative to the store root.
    pub fn relative_path(&self) -> String {
        format!("{}/{}.json", self.content_type, self.uuid)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        if field == UUID_FIELD {
            return None;
        }
        self.fields.get(field)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            content_type: self.content_type.clone(),
            uuid: self.uuid.clone(),
        }
    }
}

/// Identity of a content object, recoverable from its path alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub content_type: String,
    pub uuid: String,
}

// ---------------------------------------------------------------------------
// Store reports
// ---------------------------------------------------------------------------

/// Snapshot of a store's position and schemas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSummary {
    pub name: String,
    pub branch: Option<String>,
    pub commit: String,
    pub timestamp: String,
    pub author: String,
    pub schemas: BTreeMap<String, ContentTypeSchema>,
}

/// Classified changes between an earlier commit and the store's head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSummary {
    pub name: String,
    #[serde(rename = "previous-index")]
    pub previous: String,
    #[serde(rename = "current-index")]
    pub current: String,
    pub diff: Vec<ChangeRecord>,
}

/// Objects added or modified since an earlier commit, for clients pulling
/// content rather than a bare change list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullSummary {
    /// Content type to object bodies; every known type has an entry.
    #[serde(flatten)]
    pub objects: BTreeMap<String, Vec<Value>>,
    /// Renames, then deletions. These carry no body.
    pub other: Vec<ChangeRecord>,
    /// Head commit the objects were read at.
    pub commit: String,
}

/// Every object of a store, grouped by content type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDump {
    #[serde(flatten)]
    pub objects: BTreeMap<String, Vec<Value>>,
    pub commit: String,
}
