//! Resolver
//!
//! Entry point for one logical request. A [`Resolver`] owns the request
//! context and the batching cache; clones share both. Reads without a driver
//! session go through the cache, writes go straight to the executor and clear
//! the cache once the driver acknowledged them.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::debug;

use crate::config::ResolverConfig;
use crate::context::RequestContext;
use crate::data::{worker, BatchCache, CacheStats, Output};
use crate::error::ResolverResult;
use crate::hooks::Interceptor;
use crate::query::{Connection, Method, Query, SortSpec};
use crate::schema::Schema;
use crate::txn::TransactionScope;

struct Inner {
    schema: Arc<Schema>,
    config: ResolverConfig,
    cache: Arc<BatchCache>,
    context: RequestContext,
}

/// Request-scoped data resolver
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("request_id", &self.inner.context.request_id)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl Resolver {
    pub fn new(schema: Arc<Schema>, config: ResolverConfig) -> Self {
        Self::with_context(schema, config, RequestContext::new())
    }

    pub fn with_context(schema: Arc<Schema>, config: ResolverConfig, context: RequestContext) -> Self {
        let cache = Arc::new(BatchCache::new(config.cache.clone()));
        debug!(request_id = %context.request_id, cache = cache.is_enabled(), "resolver created");
        Self {
            inner: Arc::new(Inner {
                schema,
                config,
                cache,
                context,
            }),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &RequestContext {
        &self.inner.context
    }

    pub(crate) fn cache(&self) -> &Arc<BatchCache> {
        &self.inner.cache
    }

    /// Execute a descriptor
    pub fn load(&self, query: Query) -> BoxFuture<'static, ResolverResult<Output>> {
        let resolver = self.clone();
        let outside_session = query.session_id().is_none();

        if query.method().is_read() {
            if !outside_session {
                return worker::execute(resolver, query, None);
            }
            let key = BatchCache::key(&query);
            return self
                .inner
                .cache
                .load(key, move || worker::execute(resolver, query, None));
        }

        async move {
            let output = worker::execute(resolver.clone(), query, None).await?;
            if outside_session {
                resolver.inner.cache.clear_all();
            }
            Ok(output)
        }
        .boxed()
    }

    /// Documents of `model` matching an already storage-level predicate
    pub(crate) fn lookup(
        &self,
        model: &str,
        predicate: Value,
    ) -> BoxFuture<'static, ResolverResult<Vec<Value>>> {
        let load = Query::new(model, Method::Find)
            .native(predicate)
            .map(|query| self.load(query));
        async move { load?.await?.into_list() }.boxed()
    }

    pub async fn get(&self, query: Query) -> ResolverResult<Option<Value>> {
        self.load(query.with_method(Method::Get)).await?.into_one()
    }

    pub async fn find(&self, query: Query) -> ResolverResult<Vec<Value>> {
        self.load(query.with_method(Method::Find)).await?.into_list()
    }

    /// Find as a cursor connection
    pub async fn query(&self, query: Query) -> ResolverResult<Connection> {
        self.load(query.with_method(Method::Find))
            .await?
            .into_connection()
    }

    pub async fn count(&self, query: Query) -> ResolverResult<u64> {
        self.load(query.with_method(Method::Count)).await?.into_count()
    }

    pub async fn create(&self, query: Query) -> ResolverResult<Value> {
        self.write(query, Method::Create).await
    }

    /// Update one document by id, or every document matching the filter
    pub async fn update(&self, query: Query) -> ResolverResult<Value> {
        self.write(query, Method::Update).await
    }

    pub async fn delete(&self, query: Query) -> ResolverResult<Value> {
        self.write(query, Method::Delete).await
    }

    pub async fn push(&self, query: Query) -> ResolverResult<Value> {
        self.write(query, Method::Push).await
    }

    pub async fn pull(&self, query: Query) -> ResolverResult<Value> {
        self.write(query, Method::Pull).await
    }

    async fn write(&self, query: Query, method: Method) -> ResolverResult<Value> {
        Ok(self.load(query.with_method(method)).await?.into_value())
    }

    /// Fluent builder for operations on `model`
    pub fn match_model(&self, model: &str) -> ResolverResult<Matcher> {
        self.schema().entity(model)?;
        Ok(Matcher {
            resolver: self.clone(),
            query: Query::new(model, Method::Get),
        })
    }

    /// Open a transaction scope, nested under `parent` when given
    pub fn transaction(&self, parent: Option<&TransactionScope>) -> TransactionScope {
        TransactionScope::new(self.clone(), parent)
    }

    /// Forget the cached result of one read
    pub fn clear(&self, query: &Query) -> bool {
        self.inner.cache.clear(&BatchCache::key(query))
    }

    pub fn clear_all(&self) {
        self.inner.cache.clear_all();
    }

    /// Seed the cache with a known result for a read
    pub fn prime(&self, query: &Query, output: Output) -> bool {
        self.inner.cache.prime(BatchCache::key(query), output)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }
}

/// Fluent operation builder bound to a resolver
#[derive(Debug, Clone)]
pub struct Matcher {
    resolver: Resolver,
    query: Query,
}

impl Matcher {
    /// Adjust the underlying descriptor
    pub fn with<F>(mut self, f: F) -> ResolverResult<Self>
    where
        F: FnOnce(Query) -> ResolverResult<Query>,
    {
        self.query = f(self.query)?;
        Ok(self)
    }

    pub fn id(self, id: impl Into<Value>) -> ResolverResult<Self> {
        self.with(|q| q.id(id))
    }

    pub fn filter(self, filter: Value) -> ResolverResult<Self> {
        self.with(|q| q.filter(filter))
    }

    pub fn native(self, native: Value) -> ResolverResult<Self> {
        self.with(|q| q.native(native))
    }

    pub fn select<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = self.query.select(paths);
        self
    }

    pub fn sort(self, sort: Vec<SortSpec>) -> ResolverResult<Self> {
        self.with(|q| q.sort(sort))
    }

    pub fn skip(self, skip: i64) -> ResolverResult<Self> {
        self.with(|q| q.skip(skip))
    }

    pub fn limit(self, limit: i64) -> ResolverResult<Self> {
        self.with(|q| q.limit(limit))
    }

    pub fn first(self, first: i64) -> ResolverResult<Self> {
        self.with(|q| q.first(first))
    }

    pub fn last(self, last: i64) -> ResolverResult<Self> {
        self.with(|q| q.last(last))
    }

    pub fn before(self, cursor: impl Into<String>) -> ResolverResult<Self> {
        self.with(|q| q.before(cursor))
    }

    pub fn after(self, cursor: impl Into<String>) -> ResolverResult<Self> {
        self.with(|q| q.after(cursor))
    }

    pub fn required(mut self) -> Self {
        self.query = self.query.required(true);
        self
    }

    pub fn intercept(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.query = self.query.intercept(interceptor);
        self
    }

    pub fn into_query(self) -> Query {
        self.query
    }

    pub async fn one(self) -> ResolverResult<Option<Value>> {
        self.resolver.get(self.query).await
    }

    pub async fn many(self) -> ResolverResult<Vec<Value>> {
        self.resolver.find(self.query).await
    }

    pub async fn connection(self) -> ResolverResult<Connection> {
        self.resolver.query(self.query).await
    }

    pub async fn count(self) -> ResolverResult<u64> {
        self.resolver.count(self.query).await
    }

    /// Update when targeting documents, create otherwise
    pub async fn save(self, input: Value) -> ResolverResult<Value> {
        let targets_existing = self.query.get_id().is_some()
            || self.query.get_filter().is_some()
            || self.query.get_native().is_some();
        let query = self.query.input(input);
        if targets_existing {
            self.resolver.update(query).await
        } else {
            self.resolver.create(query).await
        }
    }

    pub async fn remove(self) -> ResolverResult<Value> {
        self.resolver.delete(self.query).await
    }

    pub async fn push(self, field: impl Into<String>, values: Vec<Value>) -> ResolverResult<Value> {
        self.resolver.push(self.query.splice(field, values)).await
    }

    pub async fn pull(self, field: impl Into<String>, values: Vec<Value>) -> ResolverResult<Value> {
        self.resolver.pull(self.query.splice(field, values)).await
    }
}
