//! Result sorting
//!
//! Sorts hydrated documents by one or more dotted paths. A path may reach
//! several values (arrays, relations); they are reduced to the smallest for
//! ascending keys and the largest for descending keys. Ties fall back to the
//! document id, ascending. Sort is stable and deterministic.

use std::cmp::Ordering;

use serde_json::Value;

use super::descriptor::{SortDirection, SortSpec};

/// Sorts result documents
pub struct ResultSorter;

impl ResultSorter {
    /// Sorts documents according to the sort specification
    pub fn sort(documents: &mut Vec<Value>, specs: &[SortSpec]) {
        if specs.is_empty() {
            return;
        }

        let mut decorated: Vec<(Vec<Option<Value>>, Value)> = documents
            .drain(..)
            .map(|doc| {
                let keys = specs
                    .iter()
                    .map(|spec| Self::reduce(get_deep(&doc, &spec.path), spec.direction))
                    .collect();
                (keys, doc)
            })
            .collect();

        decorated.sort_by(|(a_keys, a_doc), (b_keys, b_doc)| {
            specs
                .iter()
                .zip(a_keys.iter().zip(b_keys.iter()))
                .map(|(spec, (a, b))| {
                    let ordering = Self::compare_values(a.as_ref(), b.as_ref());
                    match spec.direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    }
                })
                .find(|o| o.is_ne())
                .unwrap_or_else(|| Self::compare_values(a_doc.get("id"), b_doc.get("id")))
        });

        documents.extend(decorated.into_iter().map(|(_, doc)| doc));
    }

    fn reduce(values: Vec<Value>, direction: SortDirection) -> Option<Value> {
        let pick = |a: Value, b: Value| {
            let ordering = Self::compare_values(Some(&a), Some(&b));
            match (direction, ordering) {
                (SortDirection::Asc, Ordering::Greater) => b,
                (SortDirection::Desc, Ordering::Less) => b,
                _ => a,
            }
        };
        values.into_iter().reduce(pick)
    }

    /// Compares two JSON values for sorting.
    ///
    /// Ordering rules:
    /// - missing < null < bool < number < string
    /// - For same types, natural ordering
    pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a_val), Some(b_val)) => {
                let type_order = |v: &Value| -> u8 {
                    match v {
                        Value::Null => 0,
                        Value::Bool(_) => 1,
                        Value::Number(_) => 2,
                        Value::String(_) => 3,
                        Value::Array(_) => 4,
                        Value::Object(_) => 5,
                    }
                };

                let a_type = type_order(a_val);
                let b_type = type_order(b_val);

                if a_type != b_type {
                    return a_type.cmp(&b_type);
                }

                match (a_val, b_val) {
                    (Value::Bool(a_b), Value::Bool(b_b)) => a_b.cmp(b_b),
                    (Value::Number(a_n), Value::Number(b_n)) => {
                        let a_f = a_n.as_f64().unwrap_or(0.0);
                        let b_f = b_n.as_f64().unwrap_or(0.0);
                        a_f.partial_cmp(&b_f).unwrap_or(Ordering::Equal)
                    }
                    (Value::String(a_s), Value::String(b_s)) => a_s.cmp(b_s),
                    _ => Ordering::Equal,
                }
            }
        }
    }
}

/// Every non-null value reachable through a dotted path.
///
/// Hydrated `$field` values win over the raw field at each step, and arrays
/// are flattened along the way.
pub fn get_deep(doc: &Value, path: &str) -> Vec<Value> {
    let mut current: Vec<&Value> = vec![doc];
    for segment in path.split('.') {
        let hydrated = format!("${}", segment);
        current = current
            .into_iter()
            .flat_map(flatten)
            .filter_map(|value| {
                let obj = value.as_object()?;
                obj.get(&hydrated)
                    .filter(|v| !v.is_null())
                    .or_else(|| obj.get(segment))
            })
            .collect();
    }
    current
        .into_iter()
        .flat_map(flatten)
        .filter(|v| !v.is_null())
        .cloned()
        .collect()
}

fn flatten(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().flat_map(flatten).collect(),
        other => vec![other],
    }
}
