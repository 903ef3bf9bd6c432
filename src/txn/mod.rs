//! Transactions
//!
//! Nested transaction scopes settled together as one tree, across drivers
//! with and without native transactions.

pub mod scope;
pub mod tree;

pub use scope::{TransactionScope, TxnQuery};
pub use tree::{Marker, Outcome, TransactionTree};
