//! Transaction scopes
//!
//! A [`TransactionScope`] is one node of a [`TransactionTree`]. Operations
//! matched through it are queued per driver and only reach storage on
//! `exec()`/`run()`. Only the root scope waits for the tree to settle; a
//! child scope records its decision and defers to the root.
//!
//! Every scope of a tree must eventually be committed or rolled back, or the
//! tree never settles.

use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::warn;

use super::tree::{Marker, TransactionTree};
use crate::data::worker;
use crate::data::Output;
use crate::driver::TxnOperation;
use crate::error::{ResolverError, ResolverResult};
use crate::hooks::Interceptor;
use crate::query::{Method, Query};
use crate::resolver::Resolver;

/// One scope of a transaction tree
#[derive(Clone)]
pub struct TransactionScope {
    resolver: Resolver,
    tree: Arc<TransactionTree>,
    node: usize,
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("node", &self.node)
            .field("marker", &self.marker())
            .finish()
    }
}

impl TransactionScope {
    pub(crate) fn new(resolver: Resolver, parent: Option<&TransactionScope>) -> Self {
        match parent {
            Some(parent) => Self {
                resolver,
                tree: Arc::clone(&parent.tree),
                node: parent.tree.add_child(parent.node),
            },
            None => {
                let tree = TransactionTree::new(Arc::clone(resolver.cache()));
                Self {
                    resolver,
                    tree,
                    node: 0,
                }
            }
        }
    }

    pub fn is_root(&self) -> bool {
        self.node == 0
    }

    /// Decision recorded on this scope, if any
    pub fn marker(&self) -> Option<Marker> {
        self.tree.marker(self.node)
    }

    /// Tree this scope belongs to
    pub fn tree(&self) -> &Arc<TransactionTree> {
        &self.tree
    }

    /// Start an operation on `model`, queued in this scope
    pub fn match_model(&self, model: &str) -> ResolverResult<TxnQuery> {
        self.resolver.schema().entity(model)?;
        Ok(TxnQuery {
            scope: self.clone(),
            query: Query::new(model, Method::Get),
        })
    }

    /// Queue a deferred operation in the bucket of `model`'s driver
    pub(crate) fn queue(&self, model: &str, op: TxnOperation) -> ResolverResult<()> {
        let model = self.resolver.schema().entity(model)?;
        let driver = Arc::clone(model.driver()?);
        self.tree.queue(self.node, driver, op);
        Ok(())
    }

    /// Queue a descriptor; it runs through the executor under the session
    /// the driver hands out at `exec()` time
    pub(crate) fn enqueue(&self, query: Query) -> ResolverResult<()> {
        let model = query.model().to_string();
        let label = format!("{} {}", query.method(), model);
        let scope = self.clone();

        let op = TxnOperation::new(label, move |session| {
            let resolver = scope.resolver.clone();
            let query = query.session(session);
            async move {
                worker::execute(resolver, query, Some(scope))
                    .await
                    .map(Output::into_value)
            }
            .boxed()
        });
        self.queue(&model, op)
    }

    /// Execute queued operations without deciding
    pub async fn exec(&self) -> ResolverResult<Vec<Value>> {
        self.tree.exec(self.node).await
    }

    /// Execute, then commit on success or roll back on failure
    pub async fn run(&self) -> ResolverResult<Vec<Value>> {
        match self.exec().await {
            Ok(results) => {
                self.tree.mark(self.node, Marker::Commit);
                self.tree.perform().await;
                if self.is_root() {
                    self.tree.outcome().await?;
                }
                Ok(results)
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Mark for commit and wait for the tree to settle
    pub async fn commit(&self) -> ResolverResult<Vec<Value>> {
        self.tree.mark(self.node, Marker::Commit);
        self.tree.perform().await;
        self.tree.outcome().await
    }

    /// Mark for rollback and wait for the tree to settle
    pub async fn rollback(&self) -> ResolverResult<Vec<Value>> {
        self.tree.mark(self.node, Marker::Rollback);
        self.tree.perform().await;
        self.tree.outcome().await
    }

    /// Mark for rollback because of `cause` and return the error to report.
    /// The root waits for settlement; a failing rollback wraps `cause`.
    pub(crate) async fn abort(&self, cause: ResolverError) -> ResolverError {
        warn!(node = self.node, error = %cause, "rolling back transaction scope");
        self.tree.mark(self.node, Marker::Rollback);
        self.tree.perform().await;
        if !self.is_root() {
            return cause;
        }
        match self.tree.outcome().await {
            Err(e @ ResolverError::RollbackFailed { .. }) => e.with_cause(cause),
            _ => cause,
        }
    }
}

/// Operation builder bound to a scope
#[derive(Debug)]
pub struct TxnQuery {
    scope: TransactionScope,
    query: Query,
}

impl TxnQuery {
    pub fn id(mut self, id: impl Into<Value>) -> ResolverResult<Self> {
        self.query = self.query.id(id)?;
        Ok(self)
    }

    pub fn filter(mut self, filter: Value) -> ResolverResult<Self> {
        self.query = self.query.filter(filter)?;
        Ok(self)
    }

    pub fn native(mut self, native: Value) -> ResolverResult<Self> {
        self.query = self.query.native(native)?;
        Ok(self)
    }

    pub fn select<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = self.query.select(paths);
        self
    }

    pub fn intercept(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.query = self.query.intercept(interceptor);
        self
    }

    fn targets_existing(&self) -> bool {
        self.query.get_id().is_some()
            || self.query.get_filter().is_some()
            || self.query.get_native().is_some()
    }

    /// Queue an update when targeting documents, a create otherwise
    pub fn save(mut self, input: Value) -> ResolverResult<()> {
        let method = if self.targets_existing() {
            Method::Update
        } else {
            Method::Create
        };
        self.query = self.query.input(input);
        self.enqueue(method)
    }

    /// Queue a delete, cascading referential integrity
    pub fn remove(self) -> ResolverResult<()> {
        self.enqueue(Method::Delete)
    }

    /// Queue appending `values` to an array field
    pub fn push(mut self, field: impl Into<String>, values: Vec<Value>) -> ResolverResult<()> {
        self.query = self.query.splice(field, values);
        self.enqueue(Method::Push)
    }

    /// Queue removing `values` from an array field
    pub fn pull(mut self, field: impl Into<String>, values: Vec<Value>) -> ResolverResult<()> {
        self.query = self.query.splice(field, values);
        self.enqueue(Method::Pull)
    }

    fn enqueue(self, method: Method) -> ResolverResult<()> {
        self.scope.enqueue(self.query.with_method(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::driver::MemoryDriver;
    use crate::schema::{FieldDef, ModelDef, Schema};
    use serde_json::json;

    fn resolver() -> (Resolver, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new("default"));
        let schema = Schema::builder()
            .driver("default", driver.clone())
            .model(
                ModelDef::new("Note")
                    .without_timestamps()
                    .field(FieldDef::string("title")),
            )
            .build()
            .unwrap();
        (Resolver::new(schema, ResolverConfig::default()), driver)
    }

    #[tokio::test]
    async fn test_queued_until_run() {
        let (resolver, driver) = resolver();
        let txn = resolver.transaction(None);
        txn.match_model("Note")
            .unwrap()
            .save(json!({"title": "draft"}))
            .unwrap();
        assert!(driver.documents("Note").is_empty());

        let results = txn.run().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(driver.documents("Note").len(), 1);
        assert_eq!(txn.marker(), Some(Marker::Commit));
    }

    #[tokio::test]
    async fn test_failed_exec_rolls_back() {
        let (resolver, driver) = resolver();
        driver.seed("Note", vec![json!({"_id": "n1", "title": "a"})]).unwrap();

        let txn = resolver.transaction(None);
        txn.match_model("Note")
            .unwrap()
            .id("n1")
            .unwrap()
            .save(json!({"title": "b"}))
            .unwrap();
        txn.match_model("Note")
            .unwrap()
            .id("missing")
            .unwrap()
            .save(json!({"title": "c"}))
            .unwrap();

        let err = txn.run().await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(txn.marker(), Some(Marker::Rollback));
        assert_eq!(
            driver.documents("Note"),
            vec![json!({"_id": "n1", "title": "a"})]
        );
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected() {
        let (resolver, _) = resolver();
        let txn = resolver.transaction(None);
        assert!(txn.match_model("Ghost").is_err());
    }

    #[tokio::test]
    async fn test_child_defers_to_root() {
        let (resolver, driver) = resolver();
        let root = resolver.transaction(None);
        let child = resolver.transaction(Some(&root));
        assert!(!child.is_root());

        child
            .match_model("Note")
            .unwrap()
            .save(json!({"title": "child"}))
            .unwrap();
        child.run().await.unwrap();
        assert!(!root.tree().is_performed());

        root.run().await.unwrap();
        assert!(root.tree().is_performed());
        assert_eq!(driver.documents("Note").len(), 1);
    }
}
