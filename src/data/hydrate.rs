//! Relation hydration
//!
//! Materializes the relations a read selects. Paths are grouped by their first
//! segment; embedded values recurse with the rest of the path, references load
//! every target by id and virtual fields find the documents pointing back at
//! this one. Loaded documents land under `$field`, next to the stored value.
//! Every load goes through the resolver, so repeated targets are batched.

use std::collections::BTreeMap;

use futures_util::future::{try_join_all, BoxFuture, FutureExt};
use serde_json::{Map, Value};

use super::carry_session;
use crate::driver::SessionId;
use crate::error::{ResolverError, ResolverResult};
use crate::query::{Method, Query};
use crate::resolver::Resolver;
use crate::schema::{collapse_ids, EntityModel, Field, ID_FIELD};

/// Head segment → remaining paths (empty when the head itself is selected)
fn group_paths(paths: &[String]) -> BTreeMap<&str, Vec<String>> {
    let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for path in paths {
        match path.split_once('.') {
            Some((head, rest)) => groups.entry(head).or_default().push(rest.to_string()),
            None => {
                groups.entry(path.as_str()).or_default();
            }
        }
    }
    groups
}

/// Hydrate `doc` (already deserialized) for the selected `paths`
pub(crate) fn hydrate<'a>(
    resolver: &'a Resolver,
    model: &'a EntityModel,
    doc: Value,
    paths: &'a [String],
    session: Option<SessionId>,
) -> BoxFuture<'a, ResolverResult<Value>> {
    async move {
        if paths.is_empty() {
            return Ok(doc);
        }
        let Value::Object(mut obj) = doc else {
            return Ok(doc);
        };

        for (head, rest) in group_paths(paths) {
            let field = model.require_field(head)?;
            if field.is_embedded() {
                if rest.is_empty() {
                    continue;
                }
                if let Some(value) = obj.remove(&field.name) {
                    let value = hydrate_embedded(resolver, field, value, &rest, session).await?;
                    obj.insert(field.name.clone(), value);
                }
                continue;
            }

            let session = field
                .model_ref()
                .and_then(|target| carry_session(resolver, model, target, session));
            if field.is_reference() {
                let Some(value) = obj.get(&field.name) else {
                    continue;
                };
                let value = hydrate_reference(resolver, field, value, &rest, session).await?;
                obj.insert(format!("${}", field.name), value);
            } else if field.is_virtual() {
                let own_id = obj.get(ID_FIELD).cloned().unwrap_or(Value::Null);
                let value = hydrate_virtual(resolver, field, own_id, &rest, session).await?;
                obj.insert(format!("${}", field.name), value);
            }
        }
        Ok(Value::Object(obj))
    }
    .boxed()
}

fn related<'r>(resolver: &'r Resolver, field: &Field) -> ResolverResult<&'r std::sync::Arc<EntityModel>> {
    field
        .model_ref()
        .and_then(|name| resolver.schema().model(name))
        .ok_or_else(|| ResolverError::config(format!("{} has no related model", field)))
}

async fn hydrate_embedded(
    resolver: &Resolver,
    field: &Field,
    value: Value,
    rest: &[String],
    session: Option<SessionId>,
) -> ResolverResult<Value> {
    let embedded = related(resolver, field)?;
    match value {
        Value::Array(items) => {
            let items = try_join_all(
                items
                    .into_iter()
                    .map(|item| hydrate(resolver, embedded, item, rest, session)),
            )
            .await?;
            Ok(Value::Array(items))
        }
        Value::Null => Ok(Value::Null),
        item => hydrate(resolver, embedded, item, rest, session).await,
    }
}

async fn load_one(
    resolver: &Resolver,
    model: &str,
    id: Value,
    select: &[String],
    session: Option<SessionId>,
) -> ResolverResult<Option<Value>> {
    let query = Query::new(model, Method::Get)
        .id(id)?
        .select(select.iter().cloned())
        .session(session);
    resolver.load(query).await?.into_one()
}

async fn hydrate_reference(
    resolver: &Resolver,
    field: &Field,
    value: &Value,
    rest: &[String],
    session: Option<SessionId>,
) -> ResolverResult<Value> {
    let target = related(resolver, field)?.name();
    match collapse_ids(value) {
        Value::Null => Ok(Value::Null),
        Value::Array(ids) => {
            let loads = ids
                .into_iter()
                .filter(|id| !id.is_null())
                .map(|id| load_one(resolver, target, id, rest, session));
            let docs = try_join_all(loads).await?;
            Ok(Value::Array(docs.into_iter().flatten().collect()))
        }
        id => Ok(load_one(resolver, target, id, rest, session)
            .await?
            .unwrap_or(Value::Null)),
    }
}

async fn hydrate_virtual(
    resolver: &Resolver,
    field: &Field,
    own_id: Value,
    rest: &[String],
    session: Option<SessionId>,
) -> ResolverResult<Value> {
    let empty = || if field.array { Value::Array(Vec::new()) } else { Value::Null };
    if own_id.is_null() {
        return Ok(empty());
    }

    let target = related(resolver, field)?;
    let by = field
        .virtual_by()
        .ok_or_else(|| ResolverError::config(format!("{} has no back-reference", field)))?;
    let by_key = target.require_field(by)?.key.clone();

    let mut native = Map::new();
    native.insert(by_key, own_id);
    let query = Query::new(target.name(), Method::Find)
        .native(Value::Object(native))?
        .select(rest.iter().cloned())
        .session(session);
    let docs = resolver.load(query).await?.into_list()?;

    if field.array {
        Ok(Value::Array(docs))
    } else {
        Ok(docs.into_iter().next().unwrap_or_else(empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_paths() {
        let paths: Vec<String> = ["name", "friends.name", "friends.address.city", "address"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let groups = group_paths(&paths);
        assert_eq!(groups["name"], Vec::<String>::new());
        assert_eq!(groups["friends"], vec!["name", "address.city"]);
        assert_eq!(groups["address"], Vec::<String>::new());
    }
}
