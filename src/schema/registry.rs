//! Schema registry
//!
//! Builds [`EntityModel`]s from definitions, validates cross-model references
//! and computes every model's referential-integrity table. A built schema is
//! immutable and shared behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::model::{EntityModel, IntegrityRef};
use super::rules::RuleRegistry;
use super::types::{FieldKind, ModelDef, SchemaDef};
use crate::config::TimestampConfig;
use crate::driver::Driver;
use crate::error::{ResolverError, ResolverResult};

/// Immutable set of models, drivers and rule plugins
pub struct Schema {
    models: HashMap<String, Arc<EntityModel>>,
    order: Vec<String>,
    drivers: HashMap<String, Arc<dyn Driver>>,
    rules: RuleRegistry,
    timestamps: TimestampConfig,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("models", &self.order)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Build from a loaded definition and named drivers
    pub fn from_def(
        def: SchemaDef,
        drivers: impl IntoIterator<Item = (String, Arc<dyn Driver>)>,
    ) -> ResolverResult<Arc<Self>> {
        let mut builder = Self::builder();
        for (name, driver) in drivers {
            builder = builder.driver(name, driver);
        }
        builder.models(def.models).build()
    }

    /// Model by name, if declared
    pub fn model(&self, name: &str) -> Option<&Arc<EntityModel>> {
        self.models.get(name)
    }

    /// Model by name; unknown names are a configuration error
    pub fn get_model(&self, name: &str) -> ResolverResult<Arc<EntityModel>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| ResolverError::config(format!("Unknown model '{}'", name)))
    }

    /// Persisted model by name; embedded-only models are rejected
    pub fn entity(&self, name: &str) -> ResolverResult<Arc<EntityModel>> {
        let model = self.get_model(name)?;
        if !model.is_entity() {
            return Err(ResolverError::bad_request(format!(
                "Model {} is embedded-only",
                name
            )));
        }
        Ok(model)
    }

    /// Models in declaration order
    pub fn models(&self) -> impl Iterator<Item = &Arc<EntityModel>> {
        self.order.iter().filter_map(|name| self.models.get(name))
    }

    /// Persisted models in declaration order
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityModel>> {
        self.models().filter(|m| m.is_entity())
    }

    pub fn driver(&self, name: &str) -> Option<&Arc<dyn Driver>> {
        self.drivers.get(name)
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    pub fn timestamps(&self) -> &TimestampConfig {
        &self.timestamps
    }

    /// Create declared indexes on every entity's driver
    pub async fn setup(&self) -> ResolverResult<()> {
        for model in self.entities() {
            let indexes = model.indexes();
            if indexes.is_empty() {
                continue;
            }
            debug!(model = %model.name(), count = indexes.len(), "creating indexes");
            model
                .driver()?
                .create_indexes(model.key(), &indexes)
                .await?;
        }
        Ok(())
    }
}

/// Builder for [`Schema`]
#[derive(Default)]
pub struct SchemaBuilder {
    drivers: HashMap<String, Arc<dyn Driver>>,
    models: Vec<ModelDef>,
    rules: Option<RuleRegistry>,
    timestamps: TimestampConfig,
}

impl SchemaBuilder {
    pub fn driver(mut self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(name.into(), driver);
        self
    }

    pub fn model(mut self, model: ModelDef) -> Self {
        self.models.push(model);
        self
    }

    pub fn models(mut self, models: impl IntoIterator<Item = ModelDef>) -> Self {
        self.models.extend(models);
        self
    }

    /// Replace the built-in rule registry
    pub fn rules(mut self, rules: RuleRegistry) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn timestamps(mut self, timestamps: TimestampConfig) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn build(self) -> ResolverResult<Arc<Schema>> {
        let rules = self.rules.unwrap_or_default();
        let defs: HashMap<&str, &ModelDef> =
            self.models.iter().map(|m| (m.name.as_str(), m)).collect();
        if defs.len() != self.models.len() {
            return Err(ResolverError::config("Duplicate model name in schema"));
        }

        let mut built = HashMap::with_capacity(self.models.len());
        for def in &self.models {
            validate_model(def, &defs, &rules)?;
            let driver = if def.entity {
                let driver = self.drivers.get(&def.driver).ok_or_else(|| {
                    ResolverError::config(format!(
                        "Model {} uses unknown driver '{}'",
                        def.name, def.driver
                    ))
                })?;
                Some(Arc::clone(driver))
            } else {
                None
            };
            built.insert(
                def.name.clone(),
                EntityModel::new(def, driver, &self.timestamps)?,
            );
        }

        let mut integrity = integrity_tables(&self.models, &defs);
        for (name, model) in built.iter_mut() {
            model.set_referential_integrity(integrity.remove(name).unwrap_or_default());
        }

        info!(
            models = self.models.len(),
            drivers = self.drivers.len(),
            "schema built"
        );

        Ok(Arc::new(Schema {
            models: built
                .into_iter()
                .map(|(name, model)| (name, Arc::new(model)))
                .collect(),
            order: self.models.iter().map(|m| m.name.clone()).collect(),
            drivers: self.drivers,
            rules,
            timestamps: self.timestamps,
        }))
    }
}

fn validate_model(
    def: &ModelDef,
    defs: &HashMap<&str, &ModelDef>,
    rules: &RuleRegistry,
) -> ResolverResult<()> {
    for field in &def.fields {
        let path = format!("{}.{}", def.name, field.name);
        match &field.kind {
            FieldKind::Scalar { .. } => {}
            FieldKind::Embedded { model } => {
                if !defs.contains_key(model.as_str()) {
                    return Err(ResolverError::config(format!(
                        "{} embeds unknown model '{}'",
                        path, model
                    )));
                }
            }
            FieldKind::Reference { model } => {
                let target = defs.get(model.as_str()).ok_or_else(|| {
                    ResolverError::config(format!("{} references unknown model '{}'", path, model))
                })?;
                if !target.entity {
                    return Err(ResolverError::config(format!(
                        "{} references embedded-only model '{}'",
                        path, model
                    )));
                }
            }
            FieldKind::Virtual { model, by } => {
                let target = defs.get(model.as_str()).ok_or_else(|| {
                    ResolverError::config(format!("{} references unknown model '{}'", path, model))
                })?;
                let back = target.fields.iter().find(|f| &f.name == by).ok_or_else(|| {
                    ResolverError::config(format!(
                        "{} is virtual by unknown field '{}.{}'",
                        path, model, by
                    ))
                })?;
                let points_back = matches!(
                    &back.kind,
                    FieldKind::Reference { model } if model == &def.name
                );
                if !points_back {
                    return Err(ResolverError::config(format!(
                        "{} is virtual by {}.{} which does not reference {}",
                        path, model, by, def.name
                    )));
                }
            }
        }

        for name in &field.rules {
            if !rules.has_rule(name) {
                return Err(ResolverError::config(format!(
                    "{} uses unknown rule '{}'",
                    path, name
                )));
            }
        }
        for name in &field.transforms {
            if !rules.has_transformer(name) {
                return Err(ResolverError::config(format!(
                    "{} uses unknown transformer '{}'",
                    path, name
                )));
            }
        }
        if let Some(name) = &field.bound {
            if !rules.has_binder(name) {
                return Err(ResolverError::config(format!(
                    "{} uses unknown binder '{}'",
                    path, name
                )));
            }
        }
    }
    Ok(())
}

/// For every entity and every reference declaring `on_delete` (top level, or
/// inside a single-valued embedded field), add a row to the target's table.
fn integrity_tables(
    models: &[ModelDef],
    defs: &HashMap<&str, &ModelDef>,
) -> HashMap<String, Vec<IntegrityRef>> {
    let mut tables: HashMap<String, Vec<IntegrityRef>> = HashMap::new();

    let mut add = |target: &str, row: IntegrityRef| {
        tables.entry(target.to_string()).or_default().push(row);
    };

    for model in models.iter().filter(|m| m.entity) {
        for field in &model.fields {
            match &field.kind {
                FieldKind::Reference { model: target } => {
                    if let Some(op) = field.on_delete.as_deref().and_then(|p| p.parse().ok()) {
                        add(
                            target,
                            IntegrityRef {
                                model: model.name.clone(),
                                path: field.name.clone(),
                                is_array: field.array,
                                op,
                            },
                        );
                    }
                }
                FieldKind::Embedded { model: embedded } if !field.array => {
                    let Some(embedded) = defs.get(embedded.as_str()) else {
                        continue;
                    };
                    for inner in &embedded.fields {
                        let FieldKind::Reference { model: target } = &inner.kind else {
                            continue;
                        };
                        if let Some(op) = inner.on_delete.as_deref().and_then(|p| p.parse().ok()) {
                            add(
                                target,
                                IntegrityRef {
                                    model: model.name.clone(),
                                    path: format!("{}.{}", field.name, inner.name),
                                    is_array: inner.array,
                                    op,
                                },
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }
    tables
}
