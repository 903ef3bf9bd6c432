//! In-memory driver
//!
//! Keeps collections as insertion-ordered document lists. Writes made under a
//! session record undo entries; commit drops them and rollback replays them in
//! reverse. Call and transaction logs, plus failure injection, let callers
//! observe batching and transaction ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{json, Map, Value};
use tracing::debug;

use super::filter::PredicateFilter;
use super::{
    Driver, DriverDirectives, DriverFuture, DriverTransaction, IndexSpec, QueryOptions,
    SessionId, TransactionHandle, TxnOperation,
};
use crate::error::{ResolverError, ResolverResult};

const ID_KEY: &str = "_id";

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub method: String,
    pub collection: String,
    pub session: Option<SessionId>,
}

/// Native transaction lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnEvent {
    Begin(SessionId),
    Commit(SessionId),
    Rollback(SessionId),
}

/// Previous state of one document touched inside a session
#[derive(Debug, Clone)]
struct UndoEntry {
    collection: String,
    id: Value,
    previous: Option<Value>,
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, Vec<Value>>,
    indexes: HashMap<String, Vec<IndexSpec>>,
    undo: HashMap<SessionId, Vec<UndoEntry>>,
    calls: Vec<DriverCall>,
    events: Vec<TxnEvent>,
    failures: Vec<(String, Option<String>)>,
    fail_rollbacks: bool,
}

impl MemoryState {
    fn record(
        &mut self,
        method: &str,
        collection: &str,
        session: Option<SessionId>,
    ) -> ResolverResult<()> {
        self.calls.push(DriverCall {
            method: method.to_string(),
            collection: collection.to_string(),
            session,
        });

        let injected = self.failures.iter().any(|(m, c)| {
            m == method && c.as_deref().map(|c| c == collection).unwrap_or(true)
        });
        if injected {
            return Err(ResolverError::driver(format!(
                "injected failure on {} {}",
                method, collection
            )));
        }
        Ok(())
    }

    fn collection(&mut self, name: &str) -> &mut Vec<Value> {
        self.collections.entry(name.to_string()).or_default()
    }

    fn position(&self, collection: &str, id: &Value) -> Option<usize> {
        self.collections
            .get(collection)?
            .iter()
            .position(|doc| doc.get(ID_KEY) == Some(id))
    }

    fn remember(&mut self, session: Option<SessionId>, collection: &str, id: &Value) {
        let Some(session) = session else { return };
        let previous = self
            .position(collection, id)
            .and_then(|i| self.collections.get(collection).map(|docs| docs[i].clone()));
        self.undo.entry(session).or_default().push(UndoEntry {
            collection: collection.to_string(),
            id: id.clone(),
            previous,
        });
    }

    fn check_unique(&self, collection: &str, doc: &Value) -> ResolverResult<()> {
        let Some(indexes) = self.indexes.get(collection) else {
            return Ok(());
        };
        let docs = self.collections.get(collection);
        for index in indexes.iter().filter(|i| i.unique) {
            let value = match doc.get(&index.key) {
                Some(v) if !v.is_null() => v,
                _ => continue,
            };
            let clash = docs
                .map(|docs| {
                    docs.iter().any(|other| {
                        other.get(ID_KEY) != doc.get(ID_KEY) && other.get(&index.key) == Some(value)
                    })
                })
                .unwrap_or(false);
            if clash {
                return Err(ResolverError::driver(format!(
                    "duplicate key {} = {} in {}",
                    index.key, value, collection
                )));
            }
        }
        Ok(())
    }

    fn restore(&mut self, entry: UndoEntry) {
        let position = self.position(&entry.collection, &entry.id);
        let docs = self.collection(&entry.collection);
        match (position, entry.previous) {
            (Some(i), Some(previous)) => docs[i] = previous,
            (Some(i), None) => {
                docs.remove(i);
            }
            (None, Some(previous)) => docs.push(previous),
            (None, None) => {}
        }
    }
}

/// Driver backed by process memory
pub struct MemoryDriver {
    name: String,
    transactions: bool,
    state: Arc<RwLock<MemoryState>>,
    next_session: AtomicU64,
}

impl MemoryDriver {
    /// Create a transactional in-memory driver
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transactions: true,
            state: Arc::new(RwLock::new(MemoryState::default())),
            next_session: AtomicU64::new(1),
        }
    }

    /// Create an in-memory driver without native transactions
    pub fn without_transactions(name: impl Into<String>) -> Self {
        Self {
            transactions: false,
            ..Self::new(name)
        }
    }

    fn write_state(&self) -> ResolverResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|e| ResolverError::driver(e.to_string()))
    }

    /// Insert raw documents, bypassing call logs and sessions
    pub fn seed(&self, collection: &str, docs: Vec<Value>) -> ResolverResult<()> {
        let mut state = self.write_state()?;
        let target = state.collection(collection);
        for mut doc in docs {
            ensure_id(&mut doc);
            target.push(doc);
        }
        Ok(())
    }

    /// Snapshot of a collection in insertion order
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.collections.get(collection).cloned().unwrap_or_default()
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<DriverCall> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.calls.clone()
    }

    /// Number of calls made to one method
    pub fn call_count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.method == method).count()
    }

    /// Forget the call log
    pub fn reset_calls(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.calls.clear();
    }

    /// Native transaction lifecycle events so far
    pub fn events(&self) -> Vec<TxnEvent> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.events.clone()
    }

    /// Make every call to `method` fail, optionally only for one collection
    pub fn fail_on(&self, method: &str, collection: Option<&str>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .failures
            .push((method.to_string(), collection.map(str::to_string)));
    }

    /// Make every rollback fail
    pub fn fail_rollbacks(&self, fail: bool) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.fail_rollbacks = fail;
    }

    /// Remove injected failures
    pub fn clear_failures(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.failures.clear();
        state.fail_rollbacks = false;
    }
}

fn ensure_id(doc: &mut Value) {
    if let Some(obj) = doc.as_object_mut() {
        let missing = obj.get(ID_KEY).map(Value::is_null).unwrap_or(true);
        if missing {
            obj.insert(
                ID_KEY.to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
    }
}

/// Keep the id plus the requested top-level keys
fn project(doc: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return doc.clone();
    }
    let Some(obj) = doc.as_object() else {
        return doc.clone();
    };
    let mut out = Map::new();
    for (key, value) in obj {
        let wanted = key == ID_KEY
            || fields
                .iter()
                .any(|f| f == key || f.split('.').next() == Some(key.as_str()));
        if wanted {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn directives(&self) -> DriverDirectives {
        DriverDirectives {
            transactions: self.transactions,
            id_key: ID_KEY.to_string(),
        }
    }

    fn get<'a>(
        &'a self,
        collection: &'a str,
        id: &'a Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Option<Value>> {
        Box::pin(async move {
            let mut state = self.write_state()?;
            state.record("get", collection, options.session)?;
            let doc = state
                .position(collection, id)
                .and_then(|i| state.collections.get(collection).map(|docs| docs[i].clone()));
            Ok(doc.map(|d| project(&d, &options.fields)))
        })
    }

    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let mut state = self.write_state()?;
            state.record("find", collection, options.session)?;
            Ok(state
                .collections
                .get(collection)
                .map(|docs| {
                    docs.iter()
                        .filter(|doc| PredicateFilter::matches(doc, filter))
                        .map(|doc| project(doc, &options.fields))
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn count<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.write_state()?;
            state.record("count", collection, options.session)?;
            Ok(state
                .collections
                .get(collection)
                .map(|docs| {
                    docs.iter()
                        .filter(|doc| PredicateFilter::matches(doc, filter))
                        .count() as u64
                })
                .unwrap_or(0))
        })
    }

    fn create<'a>(
        &'a self,
        collection: &'a str,
        mut data: Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Value> {
        Box::pin(async move {
            let mut state = self.write_state()?;
            state.record("create", collection, options.session)?;
            ensure_id(&mut data);
            let id = data.get(ID_KEY).cloned().unwrap_or(Value::Null);
            if state.position(collection, &id).is_some() {
                return Err(ResolverError::driver(format!(
                    "duplicate id {} in {}",
                    id, collection
                )));
            }
            state.check_unique(collection, &data)?;
            state.remember(options.session, collection, &id);
            state.collection(collection).push(data.clone());
            Ok(data)
        })
    }

    fn replace<'a>(
        &'a self,
        collection: &'a str,
        id: &'a Value,
        _data: Value,
        mut merged: Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Value> {
        Box::pin(async move {
            let mut state = self.write_state()?;
            state.record("replace", collection, options.session)?;
            let position = state.position(collection, id).ok_or_else(|| {
                ResolverError::driver(format!("no document {} in {}", id, collection))
            })?;
            if let Some(obj) = merged.as_object_mut() {
                obj.insert(ID_KEY.to_string(), id.clone());
            }
            state.check_unique(collection, &merged)?;
            state.remember(options.session, collection, id);
            state.collection(collection)[position] = merged.clone();
            Ok(merged)
        })
    }

    fn delete<'a>(
        &'a self,
        collection: &'a str,
        id: &'a Value,
        doc: Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Value> {
        Box::pin(async move {
            let mut state = self.write_state()?;
            state.record("delete", collection, options.session)?;
            match state.position(collection, id) {
                Some(position) => {
                    state.remember(options.session, collection, id);
                    Ok(state.collection(collection).remove(position))
                }
                None => Ok(doc),
            }
        })
    }

    fn native<'a>(
        &'a self,
        collection: &'a str,
        method: &'a str,
        args: Vec<Value>,
    ) -> DriverFuture<'a, Value> {
        Box::pin(async move {
            let mut state = self.write_state()?;
            state.record("native", collection, None)?;
            let docs = state.collections.get(collection).cloned().unwrap_or_default();
            match method {
                "ids" => Ok(Value::Array(
                    docs.iter().filter_map(|d| d.get(ID_KEY).cloned()).collect(),
                )),
                "find" => {
                    let filter = args.first().cloned().unwrap_or(Value::Null);
                    Ok(Value::Array(
                        docs.into_iter()
                            .filter(|d| PredicateFilter::matches(d, &filter))
                            .collect(),
                    ))
                }
                "count" => Ok(json!(docs.len())),
                "drop" => {
                    state.collections.remove(collection);
                    Ok(json!(docs.len()))
                }
                other => Err(ResolverError::bad_request(format!(
                    "Unsupported native method '{}'",
                    other
                ))),
            }
        })
    }

    fn create_indexes<'a>(
        &'a self,
        collection: &'a str,
        indexes: &'a [IndexSpec],
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.write_state()?;
            state.record("createIndexes", collection, None)?;
            state
                .indexes
                .insert(collection.to_string(), indexes.to_vec());
            Ok(())
        })
    }

    fn transaction(&self, ops: Vec<TxnOperation>) -> DriverFuture<'_, DriverTransaction> {
        Box::pin(async move {
            if !self.transactions {
                return Err(ResolverError::driver(format!(
                    "driver {} does not support transactions",
                    self.name
                )));
            }

            let session = self.next_session.fetch_add(1, Ordering::SeqCst);
            {
                let mut state = self.write_state()?;
                state.undo.insert(session, Vec::new());
                state.events.push(TxnEvent::Begin(session));
            }
            debug!(driver = %self.name, session, ops = ops.len(), "begin transaction");

            let mut results = Vec::with_capacity(ops.len());
            let mut failure = None;
            for op in ops {
                let label = op.label().to_string();
                match op.execute(Some(session)).await {
                    Ok(value) => results.push(value),
                    Err(e) => {
                        debug!(driver = %self.name, session, op = %label, error = %e, "operation failed");
                        failure = Some(e);
                        break;
                    }
                }
            }

            Ok(DriverTransaction {
                data: match failure {
                    Some(e) => Err(e),
                    None => Ok(results),
                },
                handle: Arc::new(MemoryTransaction {
                    session,
                    state: Arc::clone(&self.state),
                }),
            })
        })
    }
}

/// Commit/rollback handle for one in-memory session
struct MemoryTransaction {
    session: SessionId,
    state: Arc<RwLock<MemoryState>>,
}

impl TransactionHandle for MemoryTransaction {
    fn commit(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self
                .state
                .write()
                .map_err(|e| ResolverError::driver(e.to_string()))?;
            state.undo.remove(&self.session);
            state.events.push(TxnEvent::Commit(self.session));
            debug!(session = self.session, "commit transaction");
            Ok(())
        })
    }

    fn rollback(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self
                .state
                .write()
                .map_err(|e| ResolverError::driver(e.to_string()))?;
            if state.fail_rollbacks {
                return Err(ResolverError::driver(format!(
                    "rollback of session {} failed",
                    self.session
                )));
            }
            let entries = state.undo.remove(&self.session).unwrap_or_default();
            for entry in entries.into_iter().rev() {
                state.restore(entry);
            }
            state.events.push(TxnEvent::Rollback(self.session));
            debug!(session = self.session, "rollback transaction");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn opts() -> QueryOptions {
        QueryOptions::default()
    }

    #[tokio::test]
    async fn test_create_assigns_id() {
        let driver = MemoryDriver::new("mem");
        let doc = driver
            .create("people", json!({"name": "Ann"}), &opts())
            .await
            .unwrap();

        assert!(doc.get("_id").and_then(Value::as_str).is_some());
        assert_eq!(driver.documents("people").len(), 1);
    }

    #[tokio::test]
    async fn test_find_and_count() {
        let driver = MemoryDriver::new("mem");
        driver
            .seed(
                "people",
                vec![
                    json!({"_id": "a", "age": 30}),
                    json!({"_id": "b", "age": 40}),
                    json!({"_id": "c", "age": 30}),
                ],
            )
            .unwrap();

        let found = driver
            .find("people", &json!({"age": 30}), &opts())
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        let count = driver
            .count("people", &json!({"_id": ["a", "b"]}), &opts())
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(driver.call_count("find"), 1);
        assert_eq!(driver.call_count("count"), 1);
    }

    #[tokio::test]
    async fn test_projection_keeps_id() {
        let driver = MemoryDriver::new("mem");
        driver
            .seed("people", vec![json!({"_id": "a", "name": "Ann", "age": 3})])
            .unwrap();

        let options = QueryOptions {
            session: None,
            fields: vec!["name".to_string()],
        };
        let doc = driver
            .get("people", &json!("a"), &options)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc, json!({"_id": "a", "name": "Ann"}));
    }

    #[tokio::test]
    async fn test_unique_index() {
        let driver = MemoryDriver::new("mem");
        let index = vec![IndexSpec {
            key: "email".to_string(),
            unique: true,
        }];
        driver.create_indexes("people", &index).await.unwrap();
        driver
            .create("people", json!({"email": "a@x.io"}), &opts())
            .await
            .unwrap();

        let err = driver
            .create("people", json!({"email": "a@x.io"}), &opts())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DRIVER_FAILURE");
    }

    #[tokio::test]
    async fn test_transaction_rollback_restores() {
        let driver = Arc::new(MemoryDriver::new("mem"));
        driver
            .seed("people", vec![json!({"_id": "a", "name": "Ann"})])
            .unwrap();

        let d1 = Arc::clone(&driver);
        let d2 = Arc::clone(&driver);
        let ops = vec![
            TxnOperation::new("create", move |session| {
                async move {
                    d1.create(
                        "people",
                        json!({"_id": "b"}),
                        &QueryOptions::default().with_session(session),
                    )
                    .await
                }
                .boxed()
            }),
            TxnOperation::new("delete", move |session| {
                async move {
                    d2.delete(
                        "people",
                        &json!("a"),
                        Value::Null,
                        &QueryOptions::default().with_session(session),
                    )
                    .await
                }
                .boxed()
            }),
        ];

        let txn = driver.transaction(ops).await.unwrap();
        assert_eq!(txn.data.unwrap().len(), 2);
        assert_eq!(driver.documents("people"), vec![json!({"_id": "b"})]);

        txn.handle.rollback().await.unwrap();
        assert_eq!(
            driver.documents("people"),
            vec![json!({"_id": "a", "name": "Ann"})]
        );
        assert_eq!(
            driver.events(),
            vec![TxnEvent::Begin(1), TxnEvent::Rollback(1)]
        );
    }

    #[tokio::test]
    async fn test_transaction_returns_handle_on_failure() {
        let driver = Arc::new(MemoryDriver::new("mem"));
        driver.fail_on("create", Some("people"));

        let d = Arc::clone(&driver);
        let ops = vec![TxnOperation::new("create", move |session| {
            async move {
                d.create(
                    "people",
                    json!({}),
                    &QueryOptions::default().with_session(session),
                )
                .await
            }
            .boxed()
        })];

        let txn = driver.transaction(ops).await.unwrap();
        assert!(txn.data.is_err());
        txn.handle.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_transactional_driver_refuses_sessions() {
        let driver = MemoryDriver::without_transactions("plain");
        assert!(!driver.directives().transactions);
        assert!(driver.transaction(Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_native_methods() {
        let driver = MemoryDriver::new("mem");
        driver
            .seed("people", vec![json!({"_id": "a"}), json!({"_id": "b"})])
            .unwrap();

        let ids = driver.native("people", "ids", Vec::new()).await.unwrap();
        assert_eq!(ids, json!(["a", "b"]));

        let err = driver.native("people", "explode", Vec::new()).await;
        assert!(err.is_err());
    }
}
