//! Operation executor
//!
//! Runs one descriptor against its model's driver. Reads resolve their
//! predicate through the planner, run the driver step through the
//! descriptor's interceptors and hydrate the selected relations. Writes apply
//! stamps, defaults, binders and transformers, validate, check `ensureId`
//! references and persist; deletes additionally enforce referential
//! integrity inside a transaction scope.
//!
//! Single-document writes need an `id`. Without one the write applies to
//! every document matching the filter, one document at a time.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{try_join_all, BoxFuture, FutureExt};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::hydrate::hydrate;
use super::integrity;
use super::{carry_session, Output};
use crate::driver::{QueryOptions, SessionId, TxnOperation};
use crate::error::{ResolverError, ResolverResult};
use crate::hooks::{intercept, HookEvent, HookKind};
use crate::query::paginate::{filter_by_count, paginate};
use crate::query::{resolve_where_clause, unravel, Connection, Method, Query, ResultSorter};
use crate::resolver::Resolver;
use crate::schema::{collapse_ids, EntityModel, Field, WriteOp};
use crate::txn::TransactionScope;

/// Execute a descriptor. `scope` is the transaction the operation was queued
/// in, if any; deletes nest their own scope under it.
pub(crate) fn execute(
    resolver: Resolver,
    query: Query,
    scope: Option<TransactionScope>,
) -> BoxFuture<'static, ResolverResult<Output>> {
    async move {
        let model = resolver.schema().entity(query.model())?;
        debug!(
            request_id = %resolver.context().request_id,
            method = %query.method(),
            model = %model.name(),
            session = ?query.session_id(),
            "executing operation"
        );

        match (query.method(), query.get_id().cloned()) {
            (Method::Get, _) => get(&resolver, &model, &query).await.map(Output::One),
            (Method::Find, _) => find(&resolver, &model, &query).await.map(Output::Many),
            (Method::Count, _) => count(&resolver, &model, &query).await.map(Output::Count),
            (Method::Create, _) => create(&resolver, &model, &query)
                .await
                .map(|doc| Output::One(Some(doc))),
            (Method::Update, Some(id)) => update(&resolver, &model, &query, &id)
                .await
                .map(|doc| Output::One(Some(doc))),
            (Method::Delete, Some(id)) => delete(&resolver, &model, &query, &id, scope.as_ref())
                .await
                .map(|doc| Output::One(Some(doc))),
            (Method::Push | Method::Pull, Some(id)) => splice(&resolver, &model, &query, &id)
                .await
                .map(|doc| Output::One(Some(doc))),
            (Method::Delete, None) => delete_many(&resolver, &model, &query, scope.as_ref())
                .await
                .map(Output::List),
            (Method::Update | Method::Push | Method::Pull, None) => {
                for_each_match(&resolver, &model, &query, scope.as_ref())
                    .await
                    .map(Output::List)
            }
        }
    }
    .boxed()
}

fn hook_event(
    resolver: &Resolver,
    kind: HookKind,
    query: &Query,
    target: Value,
    doc: Option<Value>,
) -> HookEvent {
    HookEvent {
        kind,
        method: query.method(),
        model: query.model().to_string(),
        request_id: resolver.context().request_id,
        query: target,
        input: query.get_input().cloned(),
        doc,
    }
}

/// Paths that need hydrating: selection, sort keys and the count filter
fn hydration_paths(query: &Query) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let sort = query.get_sort().iter().map(|s| &s.path);
    let counted = query.get_count_filter().map(|c| &c.path);
    for path in query.get_select().iter().chain(sort).chain(counted) {
        if !paths.contains(path) {
            paths.push(path.clone());
        }
    }
    paths
}

/// Session plus the storage keys a projected read needs
fn driver_options(model: &EntityModel, query: &Query) -> QueryOptions {
    let mut fields = Vec::new();
    if !query.get_select().is_empty() {
        for path in hydration_paths(query) {
            let head = path.split('.').next().unwrap_or(&path);
            let Some(field) = model.field(head) else { continue };
            if field.is_virtual() || fields.contains(&field.key) {
                continue;
            }
            fields.push(field.key.clone());
        }
    }
    QueryOptions {
        session: query.session_id(),
        fields,
    }
}

/// Storage-level predicate of a read
async fn resolve_predicate(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
) -> ResolverResult<Value> {
    if let Some(native) = query.get_native() {
        return Ok(native.clone());
    }
    let schema = resolver.schema();
    let predicate = schema.rules().bind(model, query.predicate(), false);
    let predicate = schema.rules().transform(schema, model, predicate);
    let resolved = resolve_where_clause(resolver, model, &predicate).await?;

    if query.get_flags().debug {
        info!(
            model = %model.name(),
            predicate = %predicate,
            resolved = %resolved,
            "resolved where clause"
        );
    }
    Ok(resolved)
}

fn required<T>(query: &Query, model: &EntityModel, result: Option<T>) -> ResolverResult<Option<T>> {
    if result.is_none() && query.get_flags().required {
        return Err(ResolverError::not_found(format!(
            "{} {}",
            model.name(),
            query.predicate()
        )));
    }
    Ok(result)
}

async fn get(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
) -> ResolverResult<Option<Value>> {
    let Some(id) = query.get_id() else {
        let mut docs = fetch(resolver, model, query).await?;
        ResultSorter::sort(&mut docs, query.get_sort());
        return required(query, model, docs.into_iter().next());
    };

    let driver = model.driver()?;
    let options = driver_options(model, query);
    let event = hook_event(resolver, HookKind::Query, query, id.clone(), None);
    let raw = intercept(
        query.interceptors(),
        &event,
        Box::pin(async {
            let doc = driver.get(model.key(), id, &options).await?;
            Ok(doc.unwrap_or(Value::Null))
        }),
    )
    .await?;

    let doc = match raw {
        Value::Null => None,
        raw => {
            let doc = model.deserialize(resolver.schema(), &raw);
            let paths = hydration_paths(query);
            Some(hydrate(resolver, model, doc, &paths, query.session_id()).await?)
        }
    };
    required(query, model, doc)
}

/// Matching documents, deserialized and hydrated, in driver order
async fn fetch(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
) -> ResolverResult<Vec<Value>> {
    let filter = resolve_predicate(resolver, model, query).await?;
    let driver = model.driver()?;
    let options = driver_options(model, query);
    let event = hook_event(resolver, HookKind::Query, query, filter.clone(), None);
    let raw = intercept(
        query.interceptors(),
        &event,
        Box::pin(async {
            let rows = driver.find(model.key(), &filter, &options).await?;
            Ok(Value::Array(rows))
        }),
    )
    .await?;

    let rows = match raw {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    let schema = resolver.schema();
    let paths = hydration_paths(query);
    let session = query.session_id();
    try_join_all(
        rows.iter()
            .map(|row| hydrate(resolver, model, model.deserialize(schema, row), &paths, session)),
    )
    .await
}

async fn find(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
) -> ResolverResult<Connection> {
    let mut docs = fetch(resolver, model, query).await?;
    if let Some(filter) = query.get_count_filter() {
        docs = filter_by_count(docs, filter)?;
    }
    ResultSorter::sort(&mut docs, query.get_sort());

    let connection = paginate(docs, query, resolver.config().pagination.max_page_size)?;
    if connection.is_empty() && query.get_flags().required {
        return Err(ResolverError::not_found(format!(
            "{} {}",
            model.name(),
            query.predicate()
        )));
    }
    Ok(connection)
}

async fn count(resolver: &Resolver, model: &Arc<EntityModel>, query: &Query) -> ResolverResult<u64> {
    if let Some(filter) = query.get_count_filter() {
        let docs = fetch(resolver, model, query).await?;
        return Ok(filter_by_count(docs, filter)?.len() as u64);
    }

    let filter = resolve_predicate(resolver, model, query).await?;
    let driver = model.driver()?;
    let options = QueryOptions::default().with_session(query.session_id());
    let event = hook_event(resolver, HookKind::Query, query, filter.clone(), None);
    let raw = intercept(
        query.interceptors(),
        &event,
        Box::pin(async {
            let n = driver.count(model.key(), &filter, &options).await?;
            Ok(Value::from(n))
        }),
    )
    .await?;

    raw.as_u64()
        .ok_or_else(|| ResolverError::driver(format!("count of {} returned {}", model.name(), raw)))
}

/// Caller input as an unravelled object
fn input_object(model: &EntityModel, query: &Query) -> ResolverResult<Value> {
    match query.get_input() {
        None => Ok(Value::Object(Map::new())),
        Some(input) if input.is_object() => Ok(unravel(input.clone())),
        Some(_) => Err(ResolverError::bad_request(format!(
            "Input for {} must be an object",
            model.name()
        ))),
    }
}

fn stamp(resolver: &Resolver, model: &EntityModel, input: &mut Value, created: bool) {
    if !model.has_timestamps() {
        return;
    }
    let Some(obj) = input.as_object_mut() else {
        return;
    };
    let stamps = resolver.schema().timestamps();
    let now = Value::String(Utc::now().to_rfc3339());
    if created {
        obj.insert(stamps.created_field.clone(), now.clone());
    }
    obj.insert(stamps.updated_field.clone(), now);
}

/// Every `ensureId` reference in `input` must resolve
async fn ensure_ids(
    resolver: &Resolver,
    model: &EntityModel,
    input: &Value,
    session: Option<SessionId>,
) -> ResolverResult<()> {
    let refs = resolver.schema().rules().ensure_id_refs(model, input);
    let checks = refs.into_iter().map(|(target, id)| async move {
        let query = Query::new(target.as_str(), Method::Get)
            .id(id.clone())?
            .session(carry_session(resolver, model, &target, session));
        match resolver.load(query).await?.into_one()? {
            Some(_) => Ok(()),
            None => Err(ResolverError::validation(format!(
                "{} {} does not exist",
                target, id
            ))),
        }
    });
    try_join_all(checks).await?;
    Ok(())
}

async fn create(resolver: &Resolver, model: &Arc<EntityModel>, query: &Query) -> ResolverResult<Value> {
    let schema = resolver.schema();
    let rules = schema.rules();

    let mut input = input_object(model, query)?;
    stamp(resolver, model, &mut input, true);
    let input = model.default_values(schema, &input);
    let input = rules.bind(model, input, true);
    let input = rules.transform(schema, model, input);
    rules.validate(schema, model, &input, &Value::Null, WriteOp::Create)?;
    ensure_ids(resolver, model, &input, query.session_id()).await?;

    let data = model.serialize(schema, &input);
    let driver = model.driver()?;
    let options = QueryOptions::default().with_session(query.session_id());
    let event = hook_event(resolver, HookKind::Mutation, query, Value::Null, None);
    let created = intercept(
        query.interceptors(),
        &event,
        driver.create(model.key(), data, &options),
    )
    .await?;

    let doc = model.deserialize(schema, &created);
    hydrate(resolver, model, doc, &hydration_paths(query), query.session_id()).await
}

/// Stored document by id; missing documents are NotFound
async fn load_current(
    resolver: &Resolver,
    model: &EntityModel,
    id: &Value,
    session: Option<SessionId>,
) -> ResolverResult<Value> {
    let query = Query::new(model.name(), Method::Get)
        .id(id.clone())?
        .session(session)
        .required(true);
    resolver
        .load(query)
        .await?
        .into_one()?
        .ok_or_else(|| ResolverError::not_found(format!("{} {}", model.name(), id)))
}

async fn update(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
    id: &Value,
) -> ResolverResult<Value> {
    let schema = resolver.schema();
    let rules = schema.rules();
    let current = load_current(resolver, model, id, query.session_id()).await?;

    let mut input = input_object(model, query)?;
    stamp(resolver, model, &mut input, false);
    let input = rules.bind(model, input, false);
    let input = rules.transform(schema, model, input);
    rules.validate(schema, model, &input, &current, WriteOp::Update)?;
    ensure_ids(resolver, model, &input, query.session_id()).await?;

    persist_replace(resolver, model, query, id, current, input).await
}

/// Deep-merge `input` over `current` and hand both to the driver
async fn persist_replace(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
    id: &Value,
    current: Value,
    input: Value,
) -> ResolverResult<Value> {
    let schema = resolver.schema();
    let merged = model.serialize(schema, &merge_deep(current.clone(), &input));
    let data = model.serialize(schema, &input);

    let driver = model.driver()?;
    let options = QueryOptions::default().with_session(query.session_id());
    let event = hook_event(resolver, HookKind::Mutation, query, id.clone(), Some(current));
    let stored = intercept(
        query.interceptors(),
        &event,
        driver.replace(model.key(), id, data, merged, &options),
    )
    .await?;

    let doc = model.deserialize(schema, &stored);
    hydrate(resolver, model, doc, &hydration_paths(query), query.session_id()).await
}

/// Objects merge key by key; anything else is replaced
fn merge_deep(current: Value, input: &Value) -> Value {
    match (current, input) {
        (Value::Object(mut base), Value::Object(changes)) => {
            for (key, change) in changes {
                let merged = match base.remove(key) {
                    Some(existing) => merge_deep(existing, change),
                    None => change.clone(),
                };
                base.insert(key.clone(), merged);
            }
            Value::Object(base)
        }
        (_, input) => input.clone(),
    }
}

/// Array field reached through embedded fields only
fn splice_field(resolver: &Resolver, model: &EntityModel, path: &str) -> ResolverResult<Field> {
    let invalid = || ResolverError::bad_request(format!("Cannot splice field '{}'", path));
    let segments: Vec<&str> = path.split('.').collect();
    let mut owner = model;
    for (i, segment) in segments.iter().enumerate() {
        let field = owner.field(segment).ok_or_else(invalid)?;
        if i + 1 == segments.len() {
            return if field.array && !field.is_virtual() {
                Ok(field.clone())
            } else {
                Err(invalid())
            };
        }
        if !field.is_embedded() || field.array {
            return Err(invalid());
        }
        owner = field
            .model_ref()
            .and_then(|name| resolver.schema().model(name))
            .map(|embedded| embedded.as_ref())
            .ok_or_else(invalid)?;
    }
    Err(invalid())
}

fn get_path<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(doc, |current, segment| current.get(segment))
}

fn wrap_path(path: &str, value: Value) -> Value {
    let mut obj = Map::new();
    obj.insert(path.to_string(), value);
    unravel(Value::Object(obj))
}

fn content_hash(value: &Value) -> String {
    format!("{:x}", Sha256::digest(value.to_string().as_bytes()))
}

async fn splice(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
    id: &Value,
) -> ResolverResult<Value> {
    let schema = resolver.schema();
    let rules = schema.rules();
    let splice = query.get_splice().ok_or_else(|| {
        ResolverError::bad_request(format!("\"{}\" needs a field and values", query.method()))
    })?;
    let field = splice_field(resolver, model, &splice.field)?;
    let current = load_current(resolver, model, id, query.session_id()).await?;

    let normalized = rules.transform(
        schema,
        model,
        wrap_path(&splice.field, Value::Array(splice.values.clone())),
    );
    let values = get_path(&normalized, &splice.field).cloned().unwrap_or(Value::Null);
    let values = if field.is_reference() {
        collapse_ids(&values)
    } else {
        values
    };
    let values = match values {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    let existing = match get_path(&current, &splice.field) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    let next: Vec<Value> = match query.method() {
        Method::Pull => {
            let pulled: HashSet<String> = values.iter().map(content_hash).collect();
            existing
                .into_iter()
                .filter(|item| !pulled.contains(&content_hash(item)))
                .collect()
        }
        _ => existing.into_iter().chain(values).collect(),
    };

    let mut input = wrap_path(&splice.field, Value::Array(next));
    stamp(resolver, model, &mut input, false);
    rules.validate(schema, model, &input, &current, WriteOp::Update)?;
    ensure_ids(resolver, model, &input, query.session_id()).await?;

    persist_replace(resolver, model, query, id, current, input).await
}

async fn delete(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
    id: &Value,
    parent: Option<&TransactionScope>,
) -> ResolverResult<Value> {
    let current = load_current(resolver, model, id, query.session_id()).await?;

    let scope = resolver.transaction(parent);
    let prepared = async {
        integrity::resolve(resolver, model, id, &scope).await?;
        let op = delete_op(resolver.clone(), Arc::clone(model), query.clone(), id.clone(), current.clone());
        scope.queue(model.name(), op)
    }
    .await;
    if let Err(e) = prepared {
        return Err(scope.abort(e).await);
    }
    scope.run().await?;

    hydrate(resolver, model, current, &hydration_paths(query), query.session_id()).await
}

/// Deferred driver delete of one document
fn delete_op(
    resolver: Resolver,
    model: Arc<EntityModel>,
    query: Query,
    id: Value,
    current: Value,
) -> TxnOperation {
    let label = format!("delete {} {}", model.name(), id);
    TxnOperation::new(label, move |session| {
        async move {
            let driver = model.driver()?;
            let doc = model.serialize(resolver.schema(), &current);
            let options = QueryOptions::default().with_session(session);
            let event = hook_event(&resolver, HookKind::Mutation, &query, id.clone(), Some(current));
            intercept(
                query.interceptors(),
                &event,
                driver.delete(model.key(), &id, doc, &options),
            )
            .await
        }
        .boxed()
    })
}

/// Ids of every document matching a where-based write, read past the cache
async fn matching_ids(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
) -> ResolverResult<Vec<Value>> {
    let filter = resolve_predicate(resolver, model, query).await?;
    let driver = model.driver()?;
    let options = QueryOptions {
        session: query.session_id(),
        fields: vec![model.id_key().to_string()],
    };
    let rows = driver.find(model.key(), &filter, &options).await?;
    let ids: Vec<Value> = rows
        .iter()
        .filter_map(|row| row.get(model.id_key()).cloned())
        .collect();

    if ids.is_empty() && query.get_flags().required {
        return Err(ResolverError::not_found(format!(
            "{} {}",
            model.name(),
            query.predicate()
        )));
    }
    debug!(model = %model.name(), matched = ids.len(), method = %query.method(), "where-based write");
    Ok(ids)
}

/// Single-document copy of a where-based write
fn per_document(query: &Query, id: Value) -> ResolverResult<Query> {
    let mut single = Query::new(query.model(), query.method())
        .id(id)?
        .select(query.get_select().iter().cloned())
        .session(query.session_id())
        .flags(query.get_flags());
    if let Some(input) = query.get_input() {
        single = single.input(input.clone());
    }
    if let Some(splice) = query.get_splice() {
        single = single.splice(splice.field.clone(), splice.values.clone());
    }
    if let Some(meta) = query.get_meta() {
        single = single.meta(meta.clone());
    }
    for interceptor in query.interceptors() {
        single = single.intercept(Arc::clone(interceptor));
    }
    Ok(single)
}

/// Update, push or pull every matching document in turn
async fn for_each_match(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
    scope: Option<&TransactionScope>,
) -> ResolverResult<Vec<Value>> {
    let ids = matching_ids(resolver, model, query).await?;
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        let single = per_document(query, id)?;
        if let Some(doc) = execute(resolver.clone(), single, scope.cloned()).await?.into_one()? {
            results.push(doc);
        }
    }
    Ok(results)
}

/// Delete every matching document, each in a child of one shared scope
async fn delete_many(
    resolver: &Resolver,
    model: &Arc<EntityModel>,
    query: &Query,
    parent: Option<&TransactionScope>,
) -> ResolverResult<Vec<Value>> {
    let ids = matching_ids(resolver, model, query).await?;
    let scope = resolver.transaction(parent);

    let mut deleted = Vec::with_capacity(ids.len());
    for id in ids {
        let result = match per_document(query, id) {
            Ok(single) => execute(resolver.clone(), single, Some(scope.clone()))
                .await
                .and_then(Output::into_one),
            Err(e) => Err(e),
        };
        match result {
            Ok(Some(doc)) => deleted.push(doc),
            Ok(None) => {}
            Err(e) => return Err(scope.abort(e).await),
        }
    }
    scope.run().await?;
    Ok(deleted)
}
