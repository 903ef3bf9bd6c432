//! Cross-model query planner
//!
//! Rewrites a nested predicate over field names into a storage-level predicate
//! the root model's driver can evaluate on its own.
//!
//! Planning walks the predicate with an explicit work list and sorts lookups
//! into layers by relationship depth:
//! - scalar and embedded entries are aliased to storage keys in place
//! - an object on a relationship becomes a lookup one layer deeper
//! - a list on a relationship is a group of alternatives: literal ids and
//!   nested objects whose lookup results are unioned with the literals
//! - a literal on a virtual relationship becomes an `{id: literal}` lookup
//!
//! Execution runs layers deepest-first. Lookups of one layer run concurrently
//! through the resolver (and so through the batching cache); their results are
//! folded into the parent lookup before the next layer starts. A fold always
//! narrows: a group is unioned on its own first, then intersected with
//! whatever the parent already holds under the same key. The root lookup is
//! never executed here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ResolverError, ResolverResult};
use crate::resolver::Resolver;
use crate::schema::{EntityModel, Field, Schema, ID_FIELD};

/// How a lookup's results flow into its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Index of the parent lookup in the previous layer
    pub parent: usize,
    /// Storage key set on the parent query
    pub target_key: String,
    /// Field collected from each result
    pub project: String,
    /// List group this lookup is one alternative of
    pub group: Option<usize>,
}

/// One aliased query against one model
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup {
    pub model: String,
    pub query: Map<String, Value>,
    pub link: Option<Link>,
}

/// Lookups at one relationship depth
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// Model that first reached this depth
    pub model: String,
    /// Storage key of the relationship that led here
    pub alias: String,
    /// Models the originating model refers to
    pub data_refs: BTreeSet<String>,
    pub lookups: Vec<Lookup>,
}

/// Layered lookup plan for one predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub layers: Vec<Layer>,
    /// Literal ids of each list group, indexed by `Link::group`
    pub groups: Vec<Vec<Value>>,
}

impl Plan {
    /// Number of layers, the root included
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Lookups that hit a driver when the plan runs
    pub fn lookup_count(&self) -> usize {
        self.layers.iter().skip(1).map(|l| l.lookups.len()).sum()
    }

    /// The root query, fully aliased
    pub fn root(&self) -> Map<String, Value> {
        self.layers
            .first()
            .and_then(|l| l.lookups.first())
            .map(|l| l.query.clone())
            .unwrap_or_default()
    }
}

struct Pending {
    model: Arc<EntityModel>,
    predicate: Map<String, Value>,
    alias: String,
    depth: usize,
    link: Option<Link>,
}

/// Build the layered plan without touching any driver
pub fn plan(schema: &Schema, model: &Arc<EntityModel>, predicate: &Value) -> ResolverResult<Plan> {
    let predicate = predicate
        .as_object()
        .cloned()
        .ok_or_else(|| ResolverError::bad_request("Filter must be an object"))?;

    let mut layers: Vec<Layer> = Vec::new();
    let mut groups: Vec<Vec<Value>> = Vec::new();
    let mut work = vec![Pending {
        model: Arc::clone(model),
        predicate,
        alias: String::new(),
        depth: 0,
        link: None,
    }];

    while let Some(pending) = work.pop() {
        if layers.len() <= pending.depth {
            layers.push(Layer {
                model: pending.model.name().to_string(),
                alias: pending.alias.clone(),
                data_refs: pending
                    .model
                    .fields()
                    .iter()
                    .filter(|f| f.is_relation())
                    .filter_map(|f| f.model_ref().map(str::to_string))
                    .collect(),
                lookups: Vec::new(),
            });
        }

        let index = layers[pending.depth].lookups.len();
        let query = alias_entries(schema, &pending, index, &mut work, &mut groups)?;
        layers[pending.depth].lookups.push(Lookup {
            model: pending.model.name().to_string(),
            query,
            link: pending.link,
        });
    }

    Ok(Plan { layers, groups })
}

fn alias_entries(
    schema: &Schema,
    pending: &Pending,
    index: usize,
    work: &mut Vec<Pending>,
    groups: &mut Vec<Vec<Value>>,
) -> ResolverResult<Map<String, Value>> {
    let model = &pending.model;
    let mut out = Map::new();
    let mut relations = Vec::new();

    for (key, value) in &pending.predicate {
        let field = model.require_field(key)?;

        if field.is_relation() {
            relations.push((field, value));
        } else if field.is_embedded() {
            out.insert(field.key.clone(), alias_embedded(schema, field, value)?);
        } else {
            out.insert(field.key.clone(), value.clone());
        }
    }

    // Relations last, so an empty virtual list narrows a literal id entry
    for (field, value) in relations {
        let target = schema.entity(field.model_ref().unwrap_or_default())?;
        let link = |group: Option<usize>| link_for(model, field, index, group);
        let child = |predicate: Map<String, Value>, group: Option<usize>| Pending {
            model: Arc::clone(&target),
            predicate,
            alias: field.key.clone(),
            depth: pending.depth + 1,
            link: Some(link(group)),
        };

        match value {
            Value::Object(nested) => work.push(child(nested.clone(), None)),
            Value::Array(items) => {
                let group = groups.len();
                let mut literals = Vec::new();
                let mut alternatives = Vec::new();
                for item in items {
                    match item {
                        Value::Object(nested) => alternatives.push(nested.clone()),
                        Value::Null if field.is_virtual() => {
                            return Err(null_virtual(model, field));
                        }
                        literal if field.is_virtual() => alternatives.push(id_predicate(literal)),
                        literal => literals.push(literal.clone()),
                    }
                }

                if alternatives.is_empty() {
                    narrow(&mut out, &link(None).target_key, literals);
                } else {
                    groups.push(literals);
                    work.extend(alternatives.into_iter().map(|p| child(p, Some(group))));
                }
            }
            Value::Null if field.is_virtual() => return Err(null_virtual(model, field)),
            literal if field.is_virtual() => work.push(child(id_predicate(literal), None)),
            literal => {
                out.insert(field.key.clone(), literal.clone());
            }
        }
    }

    Ok(out)
}

fn null_virtual(model: &EntityModel, field: &Field) -> ResolverError {
    ResolverError::bad_request(format!(
        "Cannot filter virtual field {}.{} by null",
        model.name(),
        field.name
    ))
}

fn id_predicate(literal: &Value) -> Map<String, Value> {
    let mut predicate = Map::new();
    predicate.insert(ID_FIELD.to_string(), literal.clone());
    predicate
}

fn link_for(model: &EntityModel, field: &Field, parent: usize, group: Option<usize>) -> Link {
    match field.virtual_by() {
        Some(by) => Link {
            parent,
            target_key: model.id_key().to_string(),
            project: by.to_string(),
            group,
        },
        None => Link {
            parent,
            target_key: field.key.clone(),
            project: ID_FIELD.to_string(),
            group,
        },
    }
}

/// Alias the keys of an embedded predicate recursively
fn alias_embedded(schema: &Schema, field: &Field, value: &Value) -> ResolverResult<Value> {
    let Some(embedded) = field.model_ref().and_then(|m| schema.model(m)) else {
        return Ok(value.clone());
    };
    match value {
        Value::Object(entries) => {
            let mut out = Map::new();
            for (key, value) in entries {
                let inner = embedded.require_field(key)?;
                let value = if inner.is_embedded() {
                    alias_embedded(schema, inner, value)?
                } else {
                    value.clone()
                };
                out.insert(inner.key.clone(), value);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| alias_embedded(schema, field, item))
                .collect::<ResolverResult<_>>()?,
        )),
        other => Ok(other.clone()),
    }
}

/// Resolve a nested predicate into a storage-level predicate for `model`
pub async fn resolve_where_clause(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    predicate: &Value,
) -> ResolverResult<Value> {
    let mut plan = plan(resolver.schema(), model, predicate)?;
    if plan.depth() <= 1 {
        return Ok(Value::Object(plan.root()));
    }

    for depth in (1..plan.depth()).rev() {
        let layer = &plan.layers[depth];
        debug!(
            model = %model.name(),
            layer = depth,
            alias = %layer.alias,
            lookups = layer.lookups.len(),
            "resolving lookup layer"
        );

        let results = join_all(
            layer
                .lookups
                .iter()
                .map(|lookup| resolver.lookup(&lookup.model, Value::Object(lookup.query.clone()))),
        )
        .await;

        let mut folds: Vec<(usize, String, Vec<Value>)> = Vec::with_capacity(results.len());
        let mut unions: BTreeMap<usize, (usize, String, Vec<Value>)> = BTreeMap::new();
        for (lookup, result) in layer.lookups.iter().zip(results) {
            let docs = result?;
            let Some(link) = &lookup.link else {
                continue;
            };
            let values = project(&docs, &link.project);
            match link.group {
                Some(group) => {
                    let (_, _, merged) = unions.entry(group).or_insert_with(|| {
                        let literals = plan.groups.get(group).cloned().unwrap_or_default();
                        (link.parent, link.target_key.clone(), literals)
                    });
                    for value in values {
                        if !merged.contains(&value) {
                            merged.push(value);
                        }
                    }
                }
                None => folds.push((link.parent, link.target_key.clone(), values)),
            }
        }
        folds.extend(unions.into_values());

        let parents = &mut plan.layers[depth - 1].lookups;
        for (parent, key, values) in folds {
            if let Some(parent) = parents.get_mut(parent) {
                narrow(&mut parent.query, &key, values);
            }
        }
    }

    Ok(Value::Object(plan.root()))
}

/// Distinct non-null values of `field` across `docs`, arrays flattened
fn project(docs: &[Value], field: &str) -> Vec<Value> {
    let mut values = Vec::new();
    for doc in docs {
        let found = match doc.get(field) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(value) => vec![value.clone()],
        };
        for value in found {
            if !values.contains(&value) {
                values.push(value);
            }
        }
    }
    values
}

/// Restrict `key` to `values`, intersecting with any condition already there
fn narrow(query: &mut Map<String, Value>, key: &str, values: Vec<Value>) {
    let narrowed = match query.remove(key) {
        None => values,
        Some(Value::Array(existing)) => existing.into_iter().filter(|v| values.contains(v)).collect(),
        Some(Value::Null) => Vec::new(),
        Some(existing) => {
            if values.contains(&existing) {
                vec![existing]
            } else {
                Vec::new()
            }
        }
    };
    query.insert(key.to_string(), Value::Array(narrowed));
}
