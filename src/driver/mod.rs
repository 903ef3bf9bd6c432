//! # Driver Contract
//!
//! Storage-specific adapters implement [`Driver`]. The resolver never talks to
//! a backing store any other way: every read, write, index build and native
//! transaction goes through this trait.
//!
//! Drivers that report `transactions: false` in their directives never see
//! [`Driver::transaction`]; the coordinator runs their queued operations
//! directly and synthesizes commit/rollback handles.

pub mod filter;
pub mod memory;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ResolverResult;

pub use filter::PredicateFilter;
pub use memory::{DriverCall, MemoryDriver, TxnEvent};

/// Boxed future returned by every driver method
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = ResolverResult<T>> + Send + 'a>>;

/// Identifier of a driver-native transaction session
pub type SessionId = u64;

/// Capabilities reported by a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDirectives {
    /// Whether the driver can run an operation list atomically
    pub transactions: bool,
    /// Storage key holding document identifiers
    pub id_key: String,
}

/// Options passed through to every driver call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Native session the call belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    /// Storage keys the caller needs back
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl QueryOptions {
    /// Same options bound to a session
    pub fn with_session(mut self, session: Option<SessionId>) -> Self {
        self.session = session;
        self
    }
}

/// Index declaration handed to `create_indexes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Storage key being indexed
    pub key: String,
    /// Whether values must be unique across the collection
    pub unique: bool,
}

/// Deferred operation queued on a transaction bucket.
///
/// The driver decides when to run it and which session it runs under.
pub struct TxnOperation {
    label: String,
    run: Box<dyn FnOnce(Option<SessionId>) -> BoxFuture<'static, ResolverResult<Value>> + Send>,
}

impl TxnOperation {
    /// Wrap a deferred operation
    pub fn new<F>(label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(Option<SessionId>) -> BoxFuture<'static, ResolverResult<Value>> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(run),
        }
    }

    /// Human readable description for logs
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the operation under the given session
    pub async fn execute(self, session: Option<SessionId>) -> ResolverResult<Value> {
        (self.run)(session).await
    }
}

impl fmt::Debug for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnOperation")
            .field("label", &self.label)
            .finish()
    }
}

/// Commit/rollback handle of one driver transaction
pub trait TransactionHandle: Send + Sync {
    /// Make the queued work permanent
    fn commit(&self) -> DriverFuture<'_, ()>;

    /// Undo the queued work
    fn rollback(&self) -> DriverFuture<'_, ()>;
}

/// Result of handing an operation list to a driver.
///
/// The handle is returned even when an operation failed so the coordinator can
/// roll the session back in tree order.
pub struct DriverTransaction {
    /// Per-operation results, or the first failure
    pub data: ResolverResult<Vec<Value>>,
    /// Commit/rollback handle for the session
    pub handle: Arc<dyn TransactionHandle>,
}

/// Storage adapter contract consumed by the resolver
pub trait Driver: Send + Sync {
    /// Driver name, unique within a schema
    fn name(&self) -> &str;

    /// Capabilities of this driver
    fn directives(&self) -> DriverDirectives;

    /// Fetch one document by identifier
    fn get<'a>(
        &'a self,
        collection: &'a str,
        id: &'a Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Option<Value>>;

    /// Fetch every document matching a storage-level predicate
    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Vec<Value>>;

    /// Count documents matching a storage-level predicate
    fn count<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, u64>;

    /// Persist a new document, returning it with its identifier
    fn create<'a>(
        &'a self,
        collection: &'a str,
        data: Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Value>;

    /// Replace a document with `merged`; `data` is the partial change set
    fn replace<'a>(
        &'a self,
        collection: &'a str,
        id: &'a Value,
        data: Value,
        merged: Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Value>;

    /// Remove a document; `doc` is the document being removed
    fn delete<'a>(
        &'a self,
        collection: &'a str,
        id: &'a Value,
        doc: Value,
        options: &'a QueryOptions,
    ) -> DriverFuture<'a, Value>;

    /// Driver specific escape hatch
    fn native<'a>(
        &'a self,
        collection: &'a str,
        method: &'a str,
        args: Vec<Value>,
    ) -> DriverFuture<'a, Value>;

    /// Build indexes for a collection
    fn create_indexes<'a>(
        &'a self,
        collection: &'a str,
        indexes: &'a [IndexSpec],
    ) -> DriverFuture<'a, ()>;

    /// Run an operation list inside one native transaction
    fn transaction(&self, ops: Vec<TxnOperation>) -> DriverFuture<'_, DriverTransaction>;
}
