//! polystore - A cross-driver data resolver
//!
//! Emulates joins across stores that cannot join, coordinates nested
//! transactions across drivers with and without native transactions, enforces
//! referential integrity on delete and batches identical reads per request.

pub mod config;
pub mod context;
pub mod data;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod txn;

pub use config::{CacheConfig, PaginationConfig, ResolverConfig, TimestampConfig};
pub use context::RequestContext;
pub use data::{BatchCache, CacheStats, Output};
pub use driver::{Driver, DriverDirectives, MemoryDriver, QueryOptions, TxnOperation};
pub use error::{ResolverError, ResolverResult};
pub use hooks::{HookEvent, HookFuture, HookKind, Interceptor, Next, TracingInterceptor};
pub use query::{Connection, Method, PageInfo, Query, SortDirection, SortSpec};
pub use resolver::{Matcher, Resolver};
pub use schema::{FieldDef, ModelDef, Schema};
pub use txn::{Marker, TransactionScope, TxnQuery};
