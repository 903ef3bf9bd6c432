//! Schema definitions
//!
//! Declarative, serde-loadable descriptions of models and fields. These are
//! resolved into [`EntityModel`](super::EntityModel)s by the schema builder.
//!
//! Field kinds:
//! - scalar: string, int, float, bool, id, datetime, json
//! - embedded: sub-document described by another (possibly embedded-only) model
//! - reference: stored id(s) of documents of another entity model
//! - virtual: inverse of a reference, never stored

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scalar value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    /// UTF-8 string
    String,
    /// 64-bit signed integer
    Int,
    /// 64-bit floating point
    Float,
    /// Boolean
    Bool,
    /// Opaque identifier (string or integer)
    Id,
    /// RFC 3339 timestamp string
    DateTime,
    /// Any JSON value
    Json,
}

impl ScalarType {
    /// Returns the type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::Bool => "bool",
            ScalarType::Id => "id",
            ScalarType::DateTime => "datetime",
            ScalarType::Json => "json",
        }
    }
}

/// What a field holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldKind {
    /// Plain value
    Scalar {
        #[serde(rename = "type")]
        scalar: ScalarType,
    },
    /// Sub-document stored inline
    Embedded { model: String },
    /// Stored id(s) of another entity
    Reference { model: String },
    /// Documents of `model` whose `by` field references this one
    Virtual { model: String, by: String },
}

/// Field definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name as seen by callers
    pub name: String,

    /// Storage key (defaults to the name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Field kind
    #[serde(flatten)]
    pub kind: FieldKind,

    /// Whether the field holds a list
    #[serde(default)]
    pub array: bool,

    /// Whether the field must be present
    #[serde(default)]
    pub required: bool,

    /// Whether a stored value may not change
    #[serde(default)]
    pub immutable: bool,

    /// Whether the driver should index the field
    #[serde(default)]
    pub indexed: bool,

    /// Whether values must be unique across the collection
    #[serde(default)]
    pub unique: bool,

    /// Value used when input omits the field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Referential policy: "cascade", "nullify" or "restrict"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,

    /// Named rule plugins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,

    /// Named transformers applied before validation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<String>,

    /// Named binder producing a bound value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound: Option<String>,
}

impl FieldDef {
    /// Create a field of any kind
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            key: None,
            kind,
            array: false,
            required: false,
            immutable: false,
            indexed: false,
            unique: false,
            default: None,
            on_delete: None,
            rules: Vec::new(),
            transforms: Vec::new(),
            bound: None,
        }
    }

    /// Create a scalar field
    pub fn scalar(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self::new(name, FieldKind::Scalar { scalar })
    }

    /// Create a string field
    pub fn string(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::String)
    }

    /// Create an int field
    pub fn int(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Int)
    }

    /// Create a float field
    pub fn float(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Float)
    }

    /// Create a bool field
    pub fn bool(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Bool)
    }

    /// Create a datetime field
    pub fn datetime(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::DateTime)
    }

    /// Create a free-form JSON field
    pub fn json(name: impl Into<String>) -> Self {
        Self::scalar(name, ScalarType::Json)
    }

    /// Create an embedded sub-document field
    pub fn embedded(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Embedded {
                model: model.into(),
            },
        )
    }

    /// Create a reference field
    pub fn reference(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                model: model.into(),
            },
        )
    }

    /// Create a virtual (inverse) field
    pub fn virtual_ref(
        name: impl Into<String>,
        model: impl Into<String>,
        by: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            FieldKind::Virtual {
                model: model.into(),
                by: by.into(),
            },
        )
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn on_delete(mut self, policy: impl Into<String>) -> Self {
        self.on_delete = Some(policy.into());
        self
    }

    pub fn rule(mut self, name: impl Into<String>) -> Self {
        self.rules.push(name.into());
        self
    }

    pub fn transform(mut self, name: impl Into<String>) -> Self {
        self.transforms.push(name.into());
        self
    }

    pub fn bound(mut self, binder: impl Into<String>) -> Self {
        self.bound = Some(binder.into());
        self
    }
}

fn default_driver() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

/// Model definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    /// Model name
    pub name: String,

    /// Collection key (defaults to the name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Driver persisting this model
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Whether the model is persisted on its own (false: embedded-only)
    #[serde(default = "default_true")]
    pub entity: bool,

    /// Whether creation/update stamps are applied
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Declared fields
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl ModelDef {
    /// Create an entity model persisted by the default driver
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            driver: default_driver(),
            entity: true,
            timestamps: true,
            fields: Vec::new(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    /// Model only ever stored inline inside other documents
    pub fn embedded_only(mut self) -> Self {
        self.entity = false;
        self.timestamps = false;
        self
    }

    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }
}

/// Full schema definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    #[serde(default)]
    pub models: Vec<ModelDef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let field = FieldDef::reference("friends", "Person")
            .array()
            .on_delete("nullify");

        assert!(field.array);
        assert_eq!(field.on_delete.as_deref(), Some("nullify"));
        assert_eq!(
            field.kind,
            FieldKind::Reference {
                model: "Person".to_string()
            }
        );
    }

    #[test]
    fn test_unique_implies_indexed() {
        let field = FieldDef::string("email").unique();
        assert!(field.indexed);
    }

    #[test]
    fn test_deserialize_model() {
        let def: ModelDef = serde_json::from_value(json!({
            "name": "Person",
            "fields": [
                { "name": "name", "kind": "scalar", "type": "string", "required": true },
                { "name": "friends", "kind": "reference", "model": "Person", "array": true },
                { "name": "authored", "kind": "virtual", "model": "Book", "by": "author" }
            ]
        }))
        .unwrap();

        assert_eq!(def.driver, "default");
        assert!(def.entity);
        assert_eq!(def.fields.len(), 3);
        assert_eq!(def.fields[0], FieldDef::string("name").required());
        assert_eq!(
            def.fields[2].kind,
            FieldKind::Virtual {
                model: "Book".to_string(),
                by: "author".to_string()
            }
        );
    }

    #[test]
    fn test_type_names() {
        assert_eq!(ScalarType::DateTime.type_name(), "datetime");
        assert_eq!(ScalarType::Json.type_name(), "json");
    }
}
