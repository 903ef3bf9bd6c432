//! Entity model
//!
//! Resolved, immutable view of a model: fields with storage keys, the driver
//! persisting it, and the referential-integrity table of references that point
//! at it. Translation between caller names and storage keys happens here.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::registry::Schema;
use super::types::{FieldDef, FieldKind, ModelDef, ScalarType};
use crate::config::TimestampConfig;
use crate::driver::{Driver, IndexSpec};
use crate::error::{ResolverError, ResolverResult};

/// Name of the implicit identifier field
pub const ID_FIELD: &str = "id";

/// Referential policy applied when a referenced document is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnDelete {
    /// Delete (or pull from) referring documents
    Cascade,
    /// Set the referring path to null
    Nullify,
    /// Refuse the delete while references exist
    Restrict,
}

impl OnDelete {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "cascade",
            OnDelete::Nullify => "nullify",
            OnDelete::Restrict => "restrict",
        }
    }
}

impl FromStr for OnDelete {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cascade" => Ok(OnDelete::Cascade),
            "nullify" => Ok(OnDelete::Nullify),
            "restrict" => Ok(OnDelete::Restrict),
            other => Err(ResolverError::config(format!(
                "Unknown onDelete policy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for OnDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a model's referential-integrity table: documents of `model`
/// refer to this model through `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityRef {
    pub model: String,
    pub path: String,
    pub is_array: bool,
    pub op: OnDelete,
}

/// Resolved field
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub key: String,
    pub kind: FieldKind,
    pub array: bool,
    pub required: bool,
    pub immutable: bool,
    pub indexed: bool,
    pub unique: bool,
    pub default: Option<Value>,
    pub on_delete: Option<OnDelete>,
    pub rules: Vec<String>,
    pub transforms: Vec<String>,
    pub bound: Option<String>,
    /// Name of the model declaring the field
    pub owner: String,
}

impl Field {
    fn from_def(owner: &str, def: &FieldDef) -> ResolverResult<Self> {
        let on_delete = def
            .on_delete
            .as_deref()
            .map(OnDelete::from_str)
            .transpose()?;

        if on_delete.is_some() && !matches!(def.kind, FieldKind::Reference { .. }) {
            return Err(ResolverError::config(format!(
                "{}.{} declares onDelete but is not a reference",
                owner, def.name
            )));
        }

        let mut field = Self::base(owner, def);
        field.on_delete = on_delete;
        Ok(field)
    }

    fn id(owner: &str, key: &str) -> Self {
        let mut field = Self::base(owner, &FieldDef::scalar(ID_FIELD, ScalarType::Id));
        field.key = key.to_string();
        field.immutable = true;
        field
    }

    fn base(owner: &str, def: &FieldDef) -> Self {
        Self {
            name: def.name.clone(),
            key: def.key.clone().unwrap_or_else(|| def.name.clone()),
            kind: def.kind.clone(),
            array: def.array,
            required: def.required,
            immutable: def.immutable,
            indexed: def.indexed,
            unique: def.unique,
            default: def.default.clone(),
            on_delete: None,
            rules: def.rules.clone(),
            transforms: def.transforms.clone(),
            bound: def.bound.clone(),
            owner: owner.to_string(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, FieldKind::Scalar { .. })
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.kind, FieldKind::Embedded { .. })
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::Reference { .. })
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, FieldKind::Virtual { .. })
    }

    /// Reference or virtual: values live in another entity
    pub fn is_relation(&self) -> bool {
        self.is_reference() || self.is_virtual()
    }

    /// Whether the field is written to storage
    pub fn is_persistable(&self) -> bool {
        !self.is_virtual()
    }

    pub fn is_id(&self) -> bool {
        self.name == ID_FIELD
    }

    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self.kind {
            FieldKind::Scalar { scalar } => Some(scalar),
            _ => None,
        }
    }

    /// Model the field points at, for embedded and relation fields
    pub fn model_ref(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Scalar { .. } => None,
            FieldKind::Embedded { model }
            | FieldKind::Reference { model }
            | FieldKind::Virtual { model, .. } => Some(model),
        }
    }

    /// Back-reference field name of a virtual field
    pub fn virtual_by(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Virtual { by, .. } => Some(by),
            _ => None,
        }
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.iter().any(|r| r == name)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.name)
    }
}

/// Collapse relation objects (`{id: ..}`) to their identifiers
pub fn collapse_ids(value: &Value) -> Value {
    match value {
        Value::Object(obj) => obj.get(ID_FIELD).cloned().unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.iter().map(collapse_ids).collect()),
        other => other.clone(),
    }
}

/// Resolved model
pub struct EntityModel {
    name: String,
    key: String,
    entity: bool,
    timestamps: bool,
    id_key: String,
    fields: Vec<Field>,
    driver: Option<Arc<dyn Driver>>,
    referential: Vec<IntegrityRef>,
}

impl fmt::Debug for EntityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityModel")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("entity", &self.entity)
            .field("fields", &self.fields.len())
            .finish()
    }
}

impl fmt::Display for EntityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl EntityModel {
    pub(crate) fn new(
        def: &ModelDef,
        driver: Option<Arc<dyn Driver>>,
        timestamps: &TimestampConfig,
    ) -> ResolverResult<Self> {
        let id_key = driver
            .as_ref()
            .map(|d| d.directives().id_key)
            .unwrap_or_else(|| ID_FIELD.to_string());

        let mut fields = Vec::with_capacity(def.fields.len() + 3);
        if def.entity && !def.fields.iter().any(|f| f.name == ID_FIELD) {
            fields.push(Field::id(&def.name, &id_key));
        }
        for field_def in &def.fields {
            fields.push(Field::from_def(&def.name, field_def)?);
        }

        let stamped = def.entity && def.timestamps && timestamps.enabled;
        if stamped {
            for stamp in [&timestamps.created_field, &timestamps.updated_field] {
                if !fields.iter().any(|f| &f.name == stamp) {
                    fields.push(Field::base(
                        &def.name,
                        &FieldDef::datetime(stamp.as_str()),
                    ));
                }
            }
        }

        for (i, field) in fields.iter().enumerate() {
            let clash = fields[..i]
                .iter()
                .any(|other| other.name == field.name || other.key == field.key);
            if clash {
                return Err(ResolverError::config(format!(
                    "Duplicate field name or key '{}' on model {}",
                    field.name, def.name
                )));
            }
        }

        Ok(Self {
            name: def.name.clone(),
            key: def.key.clone().unwrap_or_else(|| def.name.clone()),
            entity: def.entity,
            timestamps: stamped,
            id_key,
            fields,
            driver,
            referential: Vec::new(),
        })
    }

    pub(crate) fn set_referential_integrity(&mut self, refs: Vec<IntegrityRef>) {
        self.referential = refs;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection key used by the driver
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_entity(&self) -> bool {
        self.entity
    }

    pub fn has_timestamps(&self) -> bool {
        self.timestamps
    }

    /// Storage key of the identifier
    pub fn id_key(&self) -> &str {
        &self.id_key
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Driver persisting this model
    pub fn driver(&self) -> ResolverResult<&Arc<dyn Driver>> {
        self.driver.as_ref().ok_or_else(|| {
            ResolverError::config(format!("Model {} is not persisted by a driver", self.name))
        })
    }

    /// References from other models pointing at this one
    pub fn referential_integrity(&self) -> &[IntegrityRef] {
        &self.referential
    }

    /// Look up a field by name, falling back to storage key
    pub fn field(&self, name_or_key: &str) -> Option<&Field> {
        self.field_by_name(name_or_key)
            .or_else(|| self.field_by_key(name_or_key))
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_key(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Field lookup that rejects unknown names
    pub fn require_field(&self, name: &str) -> ResolverResult<&Field> {
        self.field(name).ok_or_else(|| {
            ResolverError::bad_request(format!("Unknown field '{}' on model {}", name, self.name))
        })
    }

    /// Walk a dotted path through embedded and related models
    pub fn field_at_path(&self, schema: &Schema, path: &str) -> Option<Field> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut field = self.field(first)?.clone();
        for segment in segments {
            let model = schema.model(field.model_ref()?)?;
            field = model.field(segment)?.clone();
        }
        Some(field)
    }

    /// Storage keys of persisted fields
    pub fn select_keys(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.is_persistable())
            .map(|f| f.key.clone())
            .collect()
    }

    /// Index declarations for `create_indexes`
    pub fn indexes(&self) -> Vec<IndexSpec> {
        self.fields
            .iter()
            .filter(|f| f.indexed || f.unique)
            .map(|f| IndexSpec {
                key: f.key.clone(),
                unique: f.unique,
            })
            .collect()
    }

    /// Fill in schema defaults for omitted fields
    pub fn default_values(&self, schema: &Schema, data: &Value) -> Value {
        let mut out = data.as_object().cloned().unwrap_or_default();
        for field in &self.fields {
            match out.get(&field.name) {
                None => {
                    if let Some(default) = &field.default {
                        out.insert(field.name.clone(), default.clone());
                    }
                }
                Some(value) if field.is_embedded() && !value.is_null() => {
                    if let Some(embedded) = field.model_ref().and_then(|m| schema.model(m)) {
                        let value = map_items(value, |v| embedded.default_values(schema, v));
                        out.insert(field.name.clone(), value);
                    }
                }
                Some(_) => {}
            }
        }
        Value::Object(out)
    }

    /// Caller names to storage keys; unknown and virtual fields are dropped
    pub fn serialize(&self, schema: &Schema, data: &Value) -> Value {
        let Some(obj) = data.as_object() else {
            return data.clone();
        };
        let mut out = Map::new();
        for (name, value) in obj {
            let Some(field) = self.field(name) else { continue };
            if !field.is_persistable() {
                continue;
            }
            let value = if field.is_reference() {
                collapse_ids(value)
            } else if field.is_embedded() && !value.is_null() {
                match field.model_ref().and_then(|m| schema.model(m)) {
                    Some(embedded) => map_items(value, |v| embedded.serialize(schema, v)),
                    None => value.clone(),
                }
            } else {
                value.clone()
            };
            out.insert(field.key.clone(), value);
        }
        Value::Object(out)
    }

    /// Storage keys back to caller names
    pub fn deserialize(&self, schema: &Schema, doc: &Value) -> Value {
        let Some(obj) = doc.as_object() else {
            return doc.clone();
        };
        let mut out = Map::new();
        for (key, value) in obj {
            let Some(field) = self.field_by_key(key).or_else(|| self.field_by_name(key)) else {
                continue;
            };
            let value = if field.is_embedded() && !value.is_null() {
                match field.model_ref().and_then(|m| schema.model(m)) {
                    Some(embedded) => map_items(value, |v| embedded.deserialize(schema, v)),
                    None => value.clone(),
                }
            } else {
                value.clone()
            };
            out.insert(field.name.clone(), value);
        }
        Value::Object(out)
    }
}

/// Apply `f` to a value, or to each element of an array
pub(crate) fn map_items(value: &Value, f: impl Fn(&Value) -> Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(f).collect()),
        other => f(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        Schema::builder()
            .driver("default", Arc::new(MemoryDriver::new("default")))
            .model(
                ModelDef::new("Person")
                    .key("people")
                    .field(FieldDef::string("name").key("full_name").required())
                    .field(FieldDef::reference("friends", "Person").array())
                    .field(FieldDef::embedded("address", "Address"))
                    .field(FieldDef::virtual_ref("authored", "Book", "author")),
            )
            .model(
                ModelDef::new("Address")
                    .embedded_only()
                    .field(FieldDef::string("city").default_value(json!("Oslo")))
                    .field(FieldDef::reference("owner", "Person").on_delete("nullify")),
            )
            .model(
                ModelDef::new("Book")
                    .field(FieldDef::string("title"))
                    .field(FieldDef::reference("author", "Person").on_delete("restrict")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_on_delete_parsing() {
        assert_eq!("cascade".parse::<OnDelete>().unwrap(), OnDelete::Cascade);
        let err = "explode".parse::<OnDelete>().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_implicit_id_and_timestamps() {
        let schema = schema();
        let person = schema.get_model("Person").unwrap();

        let id = person.field("id").unwrap();
        assert_eq!(id.key, "_id");
        assert!(id.immutable);
        assert!(person.field("createdAt").is_some());

        let address = schema.get_model("Address").unwrap();
        assert!(address.field("id").is_none());
        assert!(address.field("createdAt").is_none());
    }

    #[test]
    fn test_serialize_renames_and_collapses() {
        let schema = schema();
        let person = schema.get_model("Person").unwrap();

        let data = json!({
            "name": "Ann",
            "friends": [{"id": "p2"}, "p3"],
            "authored": ["b1"],
            "bogus": 1
        });
        let stored = person.serialize(&schema, &data);
        assert_eq!(stored, json!({"full_name": "Ann", "friends": ["p2", "p3"]}));
    }

    #[test]
    fn test_deserialize_restores_names() {
        let schema = schema();
        let person = schema.get_model("Person").unwrap();

        let doc = json!({"_id": "p1", "full_name": "Ann", "address": {"city": "Bergen"}, "junk": 1});
        let data = person.deserialize(&schema, &doc);
        assert_eq!(
            data,
            json!({"id": "p1", "name": "Ann", "address": {"city": "Bergen"}})
        );
    }

    #[test]
    fn test_default_values_recurse_into_embedded() {
        let schema = schema();
        let person = schema.get_model("Person").unwrap();

        let data = person.default_values(&schema, &json!({"name": "Ann", "address": {}}));
        assert_eq!(data["address"]["city"], json!("Oslo"));
    }

    #[test]
    fn test_field_at_path() {
        let schema = schema();
        let book = schema.get_model("Book").unwrap();

        let field = book.field_at_path(&schema, "author.address.city").unwrap();
        assert_eq!(field.to_string(), "Address.city");
        assert!(book.field_at_path(&schema, "author.nope").is_none());
    }

    #[test]
    fn test_require_field() {
        let schema = schema();
        let book = schema.get_model("Book").unwrap();
        assert_eq!(book.require_field("nope").unwrap_err().code(), "BAD_REQUEST");
    }

    #[test]
    fn test_referential_integrity_table() {
        let schema = schema();
        let person = schema.get_model("Person").unwrap();

        let refs = person.referential_integrity();
        assert!(refs.contains(&IntegrityRef {
            model: "Person".to_string(),
            path: "address.owner".to_string(),
            is_array: false,
            op: OnDelete::Nullify,
        }));
        assert!(refs.contains(&IntegrityRef {
            model: "Book".to_string(),
            path: "author".to_string(),
            is_array: false,
            op: OnDelete::Restrict,
        }));
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn test_on_delete_requires_reference() {
        let result = Schema::builder()
            .driver("default", Arc::new(MemoryDriver::new("default")))
            .model(ModelDef::new("A").field(FieldDef::string("x").on_delete("cascade")))
            .build();
        assert!(result.is_err());
    }
}
