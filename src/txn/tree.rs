//! Transaction tree
//!
//! Scopes of one logical transaction form a tree. Each node queues operations
//! per driver, executes them into driver transactions, and is eventually
//! marked `Commit` or `Rollback`. Settlement happens exactly once, as soon as
//! every node carries a marker:
//!
//! 1. Flatten the tree in pre-order (parents before children, siblings in
//!    creation order)
//! 2. Split at the first `Rollback` node: the prefix commits, the rest
//!    (including commit-marked scopes after it) rolls back
//! 3. Run rollback handles one at a time, latest node first
//! 4. If anything commits, clear the read cache, then run every commit handle
//! 5. Publish the outcome to every scope of the tree
//!
//! A rollback handle failing aborts settlement with `RollbackFailed`; no
//! commit handle runs afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::data::BatchCache;
use crate::driver::{Driver, DriverFuture, TransactionHandle, TxnOperation};
use crate::error::{ResolverError, ResolverResult};

/// Settled result shared by every scope of a tree: the commit set's data
pub type Outcome = ResolverResult<Vec<Value>>;

/// Final decision recorded on a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Commit,
    Rollback,
}

struct Bucket {
    driver: Arc<dyn Driver>,
    ops: Vec<TxnOperation>,
}

#[derive(Default)]
struct Node {
    parent: Option<usize>,
    children: Vec<usize>,
    marker: Option<Marker>,
    buckets: Vec<Bucket>,
    handles: Vec<Arc<dyn TransactionHandle>>,
    data: Vec<Value>,
}

/// Handle synthesized for drivers without native transactions. Their work is
/// already applied; both decisions only invalidate cached reads.
struct CacheHandle {
    cache: Arc<BatchCache>,
}

impl TransactionHandle for CacheHandle {
    fn commit(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.cache.clear_all();
            Ok(())
        })
    }

    fn rollback(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.cache.clear_all();
            Ok(())
        })
    }
}

/// Arena of scopes sharing one outcome
pub struct TransactionTree {
    nodes: Mutex<Vec<Node>>,
    performed: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
    outcome: Shared<BoxFuture<'static, Outcome>>,
    cache: Arc<BatchCache>,
}

impl std::fmt::Debug for TransactionTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTree")
            .field("nodes", &self.lock().len())
            .field("performed", &self.is_performed())
            .finish()
    }
}

impl TransactionTree {
    /// New tree holding only its root (node 0)
    pub fn new(cache: Arc<BatchCache>) -> Arc<Self> {
        let (sender, receiver) = oneshot::channel();
        let outcome = receiver
            .map(|received| {
                received.unwrap_or_else(|_| {
                    Err(ResolverError::driver("transaction tree dropped before settling"))
                })
            })
            .boxed()
            .shared();

        Arc::new(Self {
            nodes: Mutex::new(vec![Node::default()]),
            performed: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            outcome,
            cache,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Node>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a child scope under `parent`
    pub fn add_child(&self, parent: usize) -> usize {
        let mut nodes = self.lock();
        let index = nodes.len();
        nodes.push(Node {
            parent: Some(parent),
            ..Node::default()
        });
        if let Some(node) = nodes.get_mut(parent) {
            node.children.push(index);
        }
        index
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.lock().get(node).and_then(|n| n.parent)
    }

    pub fn marker(&self, node: usize) -> Option<Marker> {
        self.lock().get(node).and_then(|n| n.marker)
    }

    pub fn is_performed(&self) -> bool {
        self.performed.load(Ordering::SeqCst)
    }

    /// Queue an operation in the node's bucket for `driver`
    pub fn queue(&self, node: usize, driver: Arc<dyn Driver>, op: TxnOperation) {
        let mut nodes = self.lock();
        let Some(node) = nodes.get_mut(node) else {
            return;
        };
        match node
            .buckets
            .iter_mut()
            .find(|b| b.driver.name() == driver.name())
        {
            Some(bucket) => bucket.ops.push(op),
            None => node.buckets.push(Bucket {
                driver,
                ops: vec![op],
            }),
        }
    }

    /// Record a decision. A rollback always wins over a commit.
    pub fn mark(&self, node: usize, marker: Marker) {
        let mut nodes = self.lock();
        if let Some(node) = nodes.get_mut(node) {
            if node.marker != Some(Marker::Rollback) {
                node.marker = Some(marker);
            }
        }
    }

    /// Node indexes in pre-order
    pub fn flatten(&self) -> Vec<usize> {
        flatten(&self.lock())
    }

    /// Commit and rollback sets, once every node is marked
    pub fn ready(&self) -> Option<(Vec<usize>, Vec<usize>)> {
        let nodes = self.lock();
        let order = flatten(&nodes);
        if order.iter().any(|&i| nodes[i].marker.is_none()) {
            return None;
        }
        let split = order
            .iter()
            .position(|&i| nodes[i].marker == Some(Marker::Rollback))
            .unwrap_or(order.len());
        let rollbacks = order[split..].to_vec();
        let mut commits = order;
        commits.truncate(split);
        Some((commits, rollbacks))
    }

    /// Run the node's buckets: native transactions where supported, plain
    /// sequential execution otherwise. Handles are kept even on failure.
    pub async fn exec(&self, node: usize) -> ResolverResult<Vec<Value>> {
        let buckets = match self.lock().get_mut(node) {
            Some(node) => std::mem::take(&mut node.buckets),
            None => return Ok(Vec::new()),
        };

        let runs = buckets.into_iter().map(|bucket| self.exec_bucket(bucket));
        let results = join_all(runs).await;

        let mut data = Vec::new();
        let mut failure = None;
        {
            let mut nodes = self.lock();
            for (result, handle) in results {
                if let (Some(handle), Some(node)) = (handle, nodes.get_mut(node)) {
                    node.handles.push(handle);
                }
                match result {
                    Ok(values) => data.extend(values),
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            if let Some(node) = nodes.get_mut(node) {
                node.data.extend(data.iter().cloned());
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(data),
        }
    }

    async fn exec_bucket(
        &self,
        bucket: Bucket,
    ) -> (ResolverResult<Vec<Value>>, Option<Arc<dyn TransactionHandle>>) {
        let Bucket { driver, ops } = bucket;
        debug!(driver = %driver.name(), ops = ops.len(), "executing bucket");

        if driver.directives().transactions {
            return match driver.transaction(ops).await {
                Ok(txn) => (txn.data, Some(txn.handle)),
                Err(e) => (Err(e), None),
            };
        }

        let handle: Arc<dyn TransactionHandle> = Arc::new(CacheHandle {
            cache: Arc::clone(&self.cache),
        });
        let mut values = Vec::with_capacity(ops.len());
        for op in ops {
            match op.execute(None).await {
                Ok(value) => values.push(value),
                Err(e) => return (Err(e), Some(handle)),
            }
        }
        (Ok(values), Some(handle))
    }

    /// Settle the tree if it is ready and nobody settled it yet
    pub async fn perform(&self) {
        let Some((commits, rollbacks)) = self.ready() else {
            return;
        };
        if self.performed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (rollback_handles, commit_handles, commit_data) = {
            let nodes = self.lock();
            let rollback_handles: Vec<_> = rollbacks
                .iter()
                .rev()
                .flat_map(|&i| nodes[i].handles.iter().rev().cloned())
                .collect();
            let commit_handles: Vec<_> = commits
                .iter()
                .flat_map(|&i| nodes[i].handles.iter().cloned())
                .collect();
            let commit_data: Vec<Value> = commits
                .iter()
                .flat_map(|&i| nodes[i].data.iter().cloned())
                .collect();
            (rollback_handles, commit_handles, commit_data)
        };

        info!(
            commits = commits.len(),
            rollbacks = rollbacks.len(),
            "settling transaction tree"
        );
        let outcome = self
            .settle(rollback_handles, commit_handles, commit_data, !commits.is_empty())
            .await;

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }

    async fn settle(
        &self,
        rollback_handles: Vec<Arc<dyn TransactionHandle>>,
        commit_handles: Vec<Arc<dyn TransactionHandle>>,
        commit_data: Vec<Value>,
        has_commits: bool,
    ) -> Outcome {
        for handle in &rollback_handles {
            if let Err(e) = handle.rollback().await {
                warn!(error = %e, "rollback handle failed");
                return Err(ResolverError::rollback_failed(None, e));
            }
        }

        if has_commits {
            self.cache.clear_all();
        }
        let results = join_all(commit_handles.iter().map(|h| h.commit())).await;
        for result in results {
            result?;
        }
        Ok(commit_data)
    }

    /// Outcome shared by every scope; resolves once the tree settles
    pub fn outcome(&self) -> Shared<BoxFuture<'static, Outcome>> {
        self.outcome.clone()
    }
}

fn flatten(nodes: &[Node]) -> Vec<usize> {
    let mut order = Vec::with_capacity(nodes.len());
    if nodes.is_empty() {
        return order;
    }
    let mut stack = vec![0];
    while let Some(index) = stack.pop() {
        order.push(index);
        stack.extend(nodes[index].children.iter().rev());
    }
    order
}
