//! Field rules, transformers and binders
//!
//! Validation order for a write:
//! 1. unknown fields (BadRequest)
//! 2. value types
//! 3. required: create rejects missing or null, update rejects explicit null
//! 4. immutable: update may not change a stored non-null value
//! 5. selfless: a self-reference may not contain the document's own id
//! 6. named rule plugins
//!
//! Embedded values are validated recursively against their model. The
//! `ensureId` rule is asynchronous and checked by the executor.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};

use super::model::{collapse_ids, EntityModel, Field, ID_FIELD};
use super::registry::Schema;
use super::types::ScalarType;
use crate::error::{ResolverError, ResolverResult};

/// Rule name resolved asynchronously against storage
pub const ENSURE_ID: &str = "ensureId";

/// Rule plugin: `Ok(false)` or an error rejects the value
pub type RuleFn = Arc<dyn Fn(&Field, &Value) -> ResolverResult<bool> + Send + Sync>;

/// Transformer applied to input before validation
pub type TransformFn = Arc<dyn Fn(&Field, Value) -> Value + Send + Sync>;

/// Binder producing a value from the current one
pub type BinderFn = Arc<dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync>;

/// Kind of write being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
}

/// Named rule plugins
#[derive(Clone)]
pub struct RuleRegistry {
    rules: HashMap<String, RuleFn>,
    transformers: HashMap<String, TransformFn>,
    binders: HashMap<String, BinderFn>,
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .field("transformers", &self.transformers.keys().collect::<Vec<_>>())
            .field("binders", &self.binders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl RuleRegistry {
    /// Registry with no plugins at all
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            transformers: HashMap::new(),
            binders: HashMap::new(),
        }
    }

    /// Registry with the built-in plugins
    pub fn with_builtins() -> Self {
        Self::empty()
            .transformer("toLowerCase", |_, v| map_strings(v, |s| s.to_lowercase()))
            .transformer("toUpperCase", |_, v| map_strings(v, |s| s.to_uppercase()))
            .transformer("trim", |_, v| map_strings(v, |s| s.trim().to_string()))
            .transformer("toTitleCase", |_, v| map_strings(v, title_case))
            .transformer("dedupe", |_, v| dedupe(v))
            .rule("email", |_, v| Ok(v.as_str().map(is_email).unwrap_or(false)))
            .rule("nonEmpty", |_, v| {
                Ok(match v {
                    Value::String(s) => !s.trim().is_empty(),
                    Value::Array(items) => !items.is_empty(),
                    _ => true,
                })
            })
            .binder("now", |_| Some(Value::String(Utc::now().to_rfc3339())))
    }

    pub fn rule<F>(mut self, name: impl Into<String>, rule: F) -> Self
    where
        F: Fn(&Field, &Value) -> ResolverResult<bool> + Send + Sync + 'static,
    {
        self.rules.insert(name.into(), Arc::new(rule));
        self
    }

    pub fn transformer<F>(mut self, name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&Field, Value) -> Value + Send + Sync + 'static,
    {
        self.transformers.insert(name.into(), Arc::new(transform));
        self
    }

    pub fn binder<F>(mut self, name: impl Into<String>, binder: F) -> Self
    where
        F: Fn(Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.binders.insert(name.into(), Arc::new(binder));
        self
    }

    pub fn has_rule(&self, name: &str) -> bool {
        name == ENSURE_ID || self.rules.contains_key(name)
    }

    pub fn has_transformer(&self, name: &str) -> bool {
        self.transformers.contains_key(name)
    }

    pub fn has_binder(&self, name: &str) -> bool {
        self.binders.contains_key(name)
    }

    /// Apply field transformers to the fields present in `data`
    pub fn transform(&self, schema: &Schema, model: &EntityModel, data: Value) -> Value {
        let Value::Object(mut obj) = data else {
            return data;
        };
        for field in model.fields() {
            let Some(mut value) = obj.remove(&field.name) else {
                continue;
            };
            for name in &field.transforms {
                if let Some(transform) = self.transformers.get(name) {
                    value = transform(field, value);
                }
            }
            if field.is_embedded() && !value.is_null() {
                if let Some(embedded) = field.model_ref().and_then(|m| schema.model(m)) {
                    value = match value {
                        Value::Array(items) => Value::Array(
                            items
                                .into_iter()
                                .map(|v| self.transform(schema, embedded, v))
                                .collect(),
                        ),
                        other => self.transform(schema, embedded, other),
                    };
                }
            }
            obj.insert(field.name.clone(), value);
        }
        Value::Object(obj)
    }

    /// Resolve bound values. With `all`, every bound field is bound; otherwise
    /// only fields already present in `data`.
    pub fn bind(&self, model: &EntityModel, data: Value, all: bool) -> Value {
        let Value::Object(mut obj) = data else {
            return data;
        };
        for field in model.fields() {
            let Some(binder) = field.bound.as_ref().and_then(|b| self.binders.get(b)) else {
                continue;
            };
            if !all && !obj.contains_key(&field.name) {
                continue;
            }
            if let Some(value) = binder(obj.get(&field.name)) {
                obj.insert(field.name.clone(), value);
            }
        }
        Value::Object(obj)
    }

    /// Enforce field rules on write input. `old` is the stored document for
    /// updates and `Value::Null` for creates.
    pub fn validate(
        &self,
        schema: &Schema,
        model: &EntityModel,
        data: &Value,
        old: &Value,
        op: WriteOp,
    ) -> ResolverResult<()> {
        let obj = data.as_object().ok_or_else(|| {
            ResolverError::bad_request(format!("Input for {} must be an object", model.name()))
        })?;
        let own_id = old.get(ID_FIELD).filter(|v| !v.is_null());
        self.validate_object(schema, model, obj, old, own_id, op, model.name())
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_object(
        &self,
        schema: &Schema,
        model: &EntityModel,
        obj: &Map<String, Value>,
        old: &Value,
        own_id: Option<&Value>,
        op: WriteOp,
        prefix: &str,
    ) -> ResolverResult<()> {
        for key in obj.keys() {
            if !key.starts_with('$') && model.field(key).is_none() {
                return Err(ResolverError::bad_request(format!(
                    "Unknown field '{}.{}'",
                    prefix, key
                )));
            }
        }

        for field in model.fields() {
            let path = format!("{}.{}", prefix, field.name);
            let value = obj.get(&field.name);
            let stored = old.get(&field.name).filter(|v| !v.is_null());

            if let Some(value) = value.filter(|v| !v.is_null()) {
                check_type(field, value, &path)?;
            }

            let missing = match op {
                WriteOp::Create => value.map(Value::is_null).unwrap_or(true),
                WriteOp::Update => value.map(Value::is_null).unwrap_or(false),
            };
            if field.required && missing {
                return Err(ResolverError::validation(format!("{} is required", path)));
            }

            if op == WriteOp::Update && field.immutable {
                if let (Some(stored), Some(value)) = (stored, value) {
                    if stored != value {
                        return Err(ResolverError::validation(format!("{} is immutable", path)));
                    }
                }
            }

            let Some(value) = value.filter(|v| !v.is_null()) else {
                continue;
            };

            if field.is_reference() && field.model_ref() == Some(field.owner.as_str()) {
                if let Some(own_id) = own_id {
                    let refers_to_self = match collapse_ids(value) {
                        Value::Array(ids) => ids.contains(own_id),
                        id => &id == own_id,
                    };
                    if refers_to_self {
                        return Err(ResolverError::validation(format!(
                            "{} cannot reference itself",
                            path
                        )));
                    }
                }
            }

            if field.is_embedded() {
                if let Some(embedded) = field.model_ref().and_then(|m| schema.model(m)) {
                    match value {
                        Value::Array(items) => {
                            for item in items {
                                let item = item.as_object().ok_or_else(|| {
                                    ResolverError::validation(format!("{} must be an object", path))
                                })?;
                                self.validate_object(
                                    schema,
                                    embedded,
                                    item,
                                    &Value::Null,
                                    None,
                                    op,
                                    &path,
                                )?;
                            }
                        }
                        Value::Object(item) => {
                            let old_item = stored.cloned().unwrap_or(Value::Null);
                            self.validate_object(schema, embedded, item, &old_item, None, op, &path)?;
                        }
                        _ => {
                            return Err(ResolverError::validation(format!(
                                "{} must be an object",
                                path
                            )))
                        }
                    }
                }
            }

            for name in field.rules.iter().filter(|r| r.as_str() != ENSURE_ID) {
                let rule = self.rules.get(name).ok_or_else(|| {
                    ResolverError::config(format!("{} uses unknown rule '{}'", path, name))
                })?;
                let values: Vec<&Value> = match value {
                    Value::Array(items) if field.array => items.iter().collect(),
                    other => vec![other],
                };
                for v in values {
                    if !rule(field, v)? {
                        return Err(ResolverError::validation(format!(
                            "{} failed rule '{}'",
                            path, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Ids that must exist before the write: `(model, id)` for every
    /// reference field tagged `ensureId`
    pub fn ensure_id_refs(&self, model: &EntityModel, data: &Value) -> Vec<(String, Value)> {
        let mut refs = Vec::new();
        for field in model.fields().iter().filter(|f| f.has_rule(ENSURE_ID)) {
            let (Some(target), Some(value)) = (field.model_ref(), data.get(&field.name)) else {
                continue;
            };
            match collapse_ids(value) {
                Value::Null => {}
                Value::Array(ids) => refs.extend(
                    ids.into_iter()
                        .filter(|id| !id.is_null())
                        .map(|id| (target.to_string(), id)),
                ),
                id => refs.push((target.to_string(), id)),
            }
        }
        refs
    }
}

fn check_type(field: &Field, value: &Value, path: &str) -> ResolverResult<()> {
    if field.array {
        let items = value
            .as_array()
            .ok_or_else(|| ResolverError::validation(format!("{} must be a list", path)))?;
        return items
            .iter()
            .filter(|v| !v.is_null())
            .try_for_each(|v| check_item(field, v, path));
    }
    if value.is_array() && field.scalar_type() != Some(ScalarType::Json) {
        return Err(ResolverError::validation(format!(
            "{} must not be a list",
            path
        )));
    }
    check_item(field, value, path)
}

fn check_item(field: &Field, value: &Value, path: &str) -> ResolverResult<()> {
    let ok = match field.scalar_type() {
        Some(ScalarType::String) => value.is_string(),
        Some(ScalarType::Int) => value.is_i64() || value.is_u64(),
        Some(ScalarType::Float) => value.is_number(),
        Some(ScalarType::Bool) => value.is_boolean(),
        Some(ScalarType::Id) => value.is_string() || value.is_i64() || value.is_u64(),
        Some(ScalarType::DateTime) => value
            .as_str()
            .map(|s| DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false),
        Some(ScalarType::Json) => true,
        None if field.is_embedded() => value.is_object(),
        None => value.is_string() || value.is_number() || value.is_object(),
    };
    if ok {
        Ok(())
    } else {
        let expected = field
            .scalar_type()
            .map(|s| s.type_name())
            .unwrap_or(if field.is_embedded() { "object" } else { "id" });
        Err(ResolverError::validation(format!(
            "{} expected {}, got {}",
            path,
            expected,
            json_type_name(value)
        )))
    }
}

/// Returns JSON type name for error messages
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn map_strings(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Value::String(f(&s)),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn dedupe(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut out: Vec<Value> = Vec::with_capacity(items.len());
            for item in items {
                if !out.contains(&item) {
                    out.push(item);
                }
            }
            Value::Array(out)
        }
        other => other,
    }
}

fn is_email(s: &str) -> bool {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s.]+(\.[^@\s.]+)+$").ok())
        .as_ref()
        .map(|re| re.is_match(s))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::schema::{FieldDef, ModelDef};
    use serde_json::json;

    fn schema() -> Arc<Schema> {
        Schema::builder()
            .driver("default", Arc::new(MemoryDriver::new("default")))
            .model(
                ModelDef::new("Person")
                    .field(
                        FieldDef::string("name")
                            .required()
                            .transform("trim")
                            .transform("toTitleCase"),
                    )
                    .field(FieldDef::string("email").rule("email").transform("toLowerCase"))
                    .field(FieldDef::int("age"))
                    .field(FieldDef::string("ssn").immutable())
                    .field(FieldDef::reference("friends", "Person").array().transform("dedupe"))
                    .field(FieldDef::embedded("address", "Address"))
                    .field(FieldDef::datetime("seenAt").bound("now")),
            )
            .model(
                ModelDef::new("Address")
                    .embedded_only()
                    .field(FieldDef::string("city").required()),
            )
            .build()
            .unwrap()
    }

    fn validate(data: Value, old: Value, op: WriteOp) -> ResolverResult<()> {
        let schema = schema();
        let person = schema.get_model("Person").unwrap();
        schema.rules().validate(&schema, &person, &data, &old, op)
    }

    #[test]
    fn test_transform() {
        let schema = schema();
        let person = schema.get_model("Person").unwrap();
        let data = schema.rules().transform(
            &schema,
            &person,
            json!({"name": "  ada LOVELACE ", "email": "ADA@X.IO", "friends": ["a", "a", "b"]}),
        );
        assert_eq!(
            data,
            json!({"name": "Ada Lovelace", "email": "ada@x.io", "friends": ["a", "b"]})
        );
    }

    #[test]
    fn test_required_on_create_and_update() {
        let err = validate(json!({"age": 3}), Value::Null, WriteOp::Create).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        let old = json!({"id": "p1", "name": "Ann"});
        assert!(validate(json!({"age": 3}), old.clone(), WriteOp::Update).is_ok());
        assert!(validate(json!({"name": null}), old, WriteOp::Update).is_err());
    }

    #[test]
    fn test_unknown_field_is_bad_request() {
        let err = validate(json!({"name": "Ann", "bogus": 1}), Value::Null, WriteOp::Create)
            .unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[test]
    fn test_type_mismatch() {
        let err =
            validate(json!({"name": "Ann", "age": "three"}), Value::Null, WriteOp::Create).unwrap_err();
        assert!(err.to_string().contains("expected int"));
    }

    #[test]
    fn test_immutable() {
        let old = json!({"id": "p1", "name": "Ann", "ssn": "123"});
        assert!(validate(json!({"ssn": "123"}), old.clone(), WriteOp::Update).is_ok());
        assert!(validate(json!({"ssn": "999"}), old, WriteOp::Update).is_err());

        let unset = json!({"id": "p1", "name": "Ann"});
        assert!(validate(json!({"ssn": "999"}), unset, WriteOp::Update).is_ok());
    }

    #[test]
    fn test_selfless() {
        let old = json!({"id": "p1", "name": "Ann"});
        let err = validate(json!({"friends": ["p2", "p1"]}), old, WriteOp::Update).unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn test_embedded_validated() {
        let err = validate(
            json!({"name": "Ann", "address": {}}),
            Value::Null,
            WriteOp::Create,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Person.address.city"));
    }

    #[test]
    fn test_custom_rule() {
        assert!(validate(json!({"name": "Ann", "email": "nope"}), Value::Null, WriteOp::Create).is_err());
        assert!(validate(json!({"name": "Ann", "email": "a@b.io"}), Value::Null, WriteOp::Create).is_ok());
    }

    #[test]
    fn test_bind() {
        let schema = schema();
        let person = schema.get_model("Person").unwrap();

        let bound = schema.rules().bind(&person, json!({"name": "Ann"}), true);
        assert!(bound["seenAt"].is_string());

        let unbound = schema.rules().bind(&person, json!({"name": "Ann"}), false);
        assert!(unbound.get("seenAt").is_none());
    }

    #[test]
    fn test_ensure_id_refs() {
        let rules = RuleRegistry::default();
        let schema = Schema::builder()
            .driver("default", Arc::new(MemoryDriver::new("default")))
            .rules(rules)
            .model(ModelDef::new("Book").field(FieldDef::reference("author", "Person").rule(ENSURE_ID)))
            .model(ModelDef::new("Person"))
            .build()
            .unwrap();
        let book = schema.get_model("Book").unwrap();

        let refs = schema
            .rules()
            .ensure_id_refs(&book, &json!({"author": {"id": "p1"}}));
        assert_eq!(refs, vec![("Person".to_string(), json!("p1"))]);
    }

    #[test]
    fn test_email() {
        assert!(is_email("a@b.io"));
        assert!(!is_email("a@b"));
        assert!(!is_email("@b.io"));
        assert!(!is_email("a b@c.io"));
        assert!(!is_email("a@.io"));
        assert!(!is_email("a@b..io"));
        assert!(!is_email("a@b@c.io"));
        assert!(is_email("first.last@mail.example.org"));
    }
}
