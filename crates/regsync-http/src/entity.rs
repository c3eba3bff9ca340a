//! Entity records as seen by list and detail endpoints.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys checked, in order, for an entity's identifier.
pub const ID_KEYS: [&str; 4] = ["id", "userId", "subjectId", "subject_id"];

fn id_from(map: &Map<String, Value>) -> Option<String> {
    ID_KEYS.iter().find_map(|key| match map.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// EntitySummary
// ---------------------------------------------------------------------------

/// One item of a paged listing.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct EntitySummary {
    pub id: Option<String>,
    pub fields: Map<String, Value>,
}

impl EntitySummary {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut fields = Map::new();
        fields.insert("id".to_string(), Value::String(id.clone()));
        Self {
            id: Some(id),
            fields,
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self {
                id: id_from(&fields),
                fields,
            },
            Value::String(s) if !s.trim().is_empty() => Self::new(s.trim()),
            other => {
                let mut fields = Map::new();
                fields.insert("value".to_string(), other);
                Self { id: None, fields }
            }
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// EntityDetail
// ---------------------------------------------------------------------------

/// Multi-valued fields the planner can edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionField {
    Permissions,
    ProjectIds,
}

impl CollectionField {
    /// Wire key of the field.
    pub fn key(self) -> &'static str {
        match self {
            CollectionField::Permissions => "permissions",
            CollectionField::ProjectIds => "projectIds",
        }
    }
}

/// The full record fetched by id.
///
/// Fields the planner edits are typed. Everything else, the record's own id
/// included, is kept verbatim in `extra` and written back untouched. A typed
/// key whose value has an unexpected shape is also left in `extra`, so it
/// round-trips.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityDetail {
    pub email: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub project_ids: Option<Vec<String>>,
    pub extra: Map<String, Value>,
}

/// Strings kept, numbers stringified, nulls dropped. Anything else fails.
fn string_list(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) => out.push(s.clone()),
            Value::Number(n) => out.push(n.to_string()),
            Value::Null => {}
            _ => return None,
        }
    }
    Some(out)
}

impl EntityDetail {
    pub fn from_value(value: Value) -> Result<Self, String> {
        let mut extra = match value {
            Value::Object(map) => map,
            other => {
                return Err(format!(
                    "expected a JSON object, got {}",
                    json_type_name(&other)
                ))
            }
        };

        let email = match extra.get("email") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        if email.is_some() {
            extra.remove("email");
        }

        let mut take_list = |key: &str| {
            let parsed = extra.get(key).and_then(string_list);
            if parsed.is_some() {
                extra.remove(key);
            }
            parsed
        };
        let permissions = take_list(CollectionField::Permissions.key());
        let project_ids = take_list(CollectionField::ProjectIds.key());

        Ok(Self {
            email,
            permissions,
            project_ids,
            extra,
        })
    }

    /// The complete record, typed fields merged over `extra`.
    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        if let Some(email) = &self.email {
            map.insert("email".to_string(), Value::String(email.clone()));
        }
        for field in [CollectionField::Permissions, CollectionField::ProjectIds] {
            if let Some(values) = self.collection(field) {
                map.insert(
                    field.key().to_string(),
                    Value::Array(values.iter().cloned().map(Value::String).collect()),
                );
            }
        }
        Value::Object(map)
    }

    /// The id the record carries itself, if any. The registry does not
    /// always echo it, so callers address the record by its listing id.
    pub fn id(&self) -> Option<String> {
        id_from(&self.extra)
    }

    pub fn collection(&self, field: CollectionField) -> Option<&[String]> {
        match field {
            CollectionField::Permissions => self.permissions.as_deref(),
            CollectionField::ProjectIds => self.project_ids.as_deref(),
        }
    }

    /// Replace a collection, discarding any unparsed value under the same key.
    pub fn set_collection(&mut self, field: CollectionField, values: Vec<String>) {
        self.extra.remove(field.key());
        match field {
            CollectionField::Permissions => self.permissions = Some(values),
            CollectionField::ProjectIds => self.project_ids = Some(values),
        }
    }

    pub fn set_email(&mut self, email: String) {
        self.extra.remove("email");
        self.email = Some(email);
    }

    /// Display name as `firstName lastName`, falling back to `name`.
    pub fn display_name(&self) -> Option<String> {
        let part = |key: &str| {
            self.extra
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        match (part("firstName"), part("lastName")) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            (Some(one), None) | (None, Some(one)) => Some(one.to_string()),
            (None, None) => part("name").map(str::to_string),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Serialize for EntityDetail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EntityDetail {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        EntityDetail::from_value(value).map_err(de::Error::custom)
    }
}
