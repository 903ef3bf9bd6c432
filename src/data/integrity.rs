//! Referential integrity on delete
//!
//! Walks the integrity table of the model being deleted. Restrict policies are
//! counted first and block the delete before anything is queued. Cascade and
//! nullify policies queue where-based writes in the delete's scope, so they
//! commit or roll back together with the delete itself.

use futures_util::future::try_join_all;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ResolverError, ResolverResult};
use crate::query::{unravel, Method, Query};
use crate::resolver::Resolver;
use crate::schema::{EntityModel, IntegrityRef, OnDelete};
use crate::txn::TransactionScope;

fn referencing(rule: &IntegrityRef, id: &Value) -> Value {
    let mut filter = Map::new();
    filter.insert(rule.path.clone(), id.clone());
    Value::Object(filter)
}

/// Reject the delete of `id` if a restrict policy still has references
async fn check_restrictions(
    resolver: &Resolver,
    model: &EntityModel,
    id: &Value,
) -> ResolverResult<()> {
    let counts = model
        .referential_integrity()
        .iter()
        .filter(|rule| rule.op == OnDelete::Restrict)
        .map(|rule| async move {
            let query = Query::new(rule.model.as_str(), Method::Count).filter(referencing(rule, id))?;
            let n = resolver.load(query).await?.into_count()?;
            Ok::<_, ResolverError>((rule, n))
        });

    for (rule, n) in try_join_all(counts).await? {
        if n > 0 {
            warn!(
                model = %model.name(),
                id = %id,
                referenced_by = %rule.model,
                path = %rule.path,
                count = n,
                "delete restricted"
            );
            return Err(ResolverError::restricted(format!(
                "{} {} is still referenced by {} {} document(s) through '{}'",
                model.name(),
                id,
                n,
                rule.model,
                rule.path
            )));
        }
    }
    Ok(())
}

/// Enforce `model`'s integrity table for the delete of `id`, queueing
/// cascades and nullifications in `scope`
pub(crate) async fn resolve(
    resolver: &Resolver,
    model: &EntityModel,
    id: &Value,
    scope: &TransactionScope,
) -> ResolverResult<()> {
    check_restrictions(resolver, model, id).await?;

    for rule in model.referential_integrity() {
        let base = Query::new(rule.model.as_str(), Method::Update).filter(referencing(rule, id))?;
        let query = match (rule.op, rule.is_array) {
            (OnDelete::Restrict, _) => continue,
            (OnDelete::Cascade | OnDelete::Nullify, true) => base
                .with_method(Method::Pull)
                .splice(rule.path.clone(), vec![id.clone()]),
            (OnDelete::Cascade, false) => base.with_method(Method::Delete),
            (OnDelete::Nullify, false) => {
                let mut input = Map::new();
                input.insert(rule.path.clone(), Value::Null);
                base.input(unravel(Value::Object(input)))
            }
        };
        debug!(
            model = %model.name(),
            referenced_by = %rule.model,
            path = %rule.path,
            policy = %rule.op,
            method = %query.method(),
            "queueing integrity operation"
        );
        scope.enqueue(query)?;
    }
    Ok(())
}
