//! Schema subsystem
//!
//! Models, fields and the rule plugins applied to them.
//!
//! # Design Principles
//!
//! - Definitions are plain serde data; the built schema is immutable
//! - Every entity carries an implicit `id` field keyed by its driver
//! - Cross-model references are checked once, at build time
//! - Referential-integrity tables are precomputed per target model

mod model;
mod registry;
mod rules;
mod types;

pub use model::{collapse_ids, EntityModel, Field, IntegrityRef, OnDelete, ID_FIELD};
pub use registry::{Schema, SchemaBuilder};
pub use rules::{BinderFn, RuleFn, RuleRegistry, TransformFn, WriteOp, ENSURE_ID};
pub use types::{FieldDef, FieldKind, ModelDef, ScalarType, SchemaDef};

pub(crate) use model::map_items;
