//! Data layer
//!
//! Request-scoped read batching, the operation executor, relation hydration
//! and referential integrity.

pub mod cache;
pub(crate) mod hydrate;
pub(crate) mod integrity;
pub(crate) mod worker;

use serde_json::Value;

use crate::driver::SessionId;
use crate::error::{ResolverError, ResolverResult};
use crate::query::Connection;
use crate::resolver::Resolver;
use crate::schema::EntityModel;

pub use cache::{BatchCache, CacheStats};

/// Result of one executed descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Single-document reads and writes
    One(Option<Value>),
    /// Sorted, paginated reads
    Many(Connection),
    /// Where-based writes
    List(Vec<Value>),
    Count(u64),
}

impl Output {
    pub fn into_one(self) -> ResolverResult<Option<Value>> {
        match self {
            Output::One(doc) => Ok(doc),
            other => Err(unexpected("a single document", &other)),
        }
    }

    pub fn into_connection(self) -> ResolverResult<Connection> {
        match self {
            Output::Many(connection) => Ok(connection),
            other => Err(unexpected("a connection", &other)),
        }
    }

    pub fn into_list(self) -> ResolverResult<Vec<Value>> {
        match self {
            Output::Many(connection) => Ok(connection.into_nodes()),
            Output::List(docs) => Ok(docs),
            other => Err(unexpected("a document list", &other)),
        }
    }

    pub fn into_count(self) -> ResolverResult<u64> {
        match self {
            Output::Count(n) => Ok(n),
            other => Err(unexpected("a count", &other)),
        }
    }

    /// Flatten into plain JSON
    pub fn into_value(self) -> Value {
        match self {
            Output::One(doc) => doc.unwrap_or(Value::Null),
            Output::Many(connection) => Value::Array(connection.into_nodes()),
            Output::List(docs) => Value::Array(docs),
            Output::Count(n) => Value::from(n),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Output::One(_) => "single document",
            Output::Many(_) => "connection",
            Output::List(_) => "document list",
            Output::Count(_) => "count",
        }
    }
}

/// Sessions are per driver: a read of `to` issued while writing `from` only
/// joins the session when both models live on the same driver. Embedded
/// models have no driver and stay in the session of their owner.
pub(crate) fn carry_session(
    resolver: &Resolver,
    from: &EntityModel,
    to: &str,
    session: Option<SessionId>,
) -> Option<SessionId> {
    let session = session?;
    let to = resolver.schema().model(to)?;
    let same = match (from.driver(), to.driver()) {
        (Ok(a), Ok(b)) => a.name() == b.name(),
        (Err(_), _) => true,
        (Ok(_), Err(_)) => false,
    };
    same.then_some(session)
}

fn unexpected(wanted: &str, got: &Output) -> ResolverError {
    ResolverError::driver(format!("expected {}, got {}", wanted, got.kind()))
}
