//! Query layer
//!
//! Operation descriptors, cross-model predicate planning and the in-memory
//! sort/pagination post-processor.

pub mod descriptor;
pub mod paginate;
pub mod planner;
pub mod sorter;

pub use descriptor::{
    unravel, CountFilter, Method, Query, QueryFlags, SortDirection, SortSpec, Splice,
};
pub use paginate::{decode_cursor, encode_cursor, Connection, Edge, PageInfo};
pub use planner::{plan, resolve_where_clause, Layer, Link, Lookup, Plan};
pub use sorter::ResultSorter;
