//! Predicate filtering for in-memory drivers
//!
//! Evaluates storage-level predicates against documents. A predicate is a JSON
//! object whose entries are ANDed:
//! - scalar: equality, or membership when the document holds an array
//! - array: IN, or intersection when the document holds an array
//! - object: nested match against an embedded document (any element for arrays)
//! - null: field is null or missing
//!
//! String expectations containing `*` match as case-insensitive globs.

use regex::Regex;
use serde_json::{Map, Value};

/// Evaluates predicates against documents
pub struct PredicateFilter;

impl PredicateFilter {
    /// Checks if a document matches every entry of a predicate
    pub fn matches(document: &Value, predicate: &Value) -> bool {
        match predicate {
            Value::Object(entries) => Self::matches_entries(document, entries),
            Value::Null => true,
            _ => false,
        }
    }

    fn matches_entries(document: &Value, entries: &Map<String, Value>) -> bool {
        entries
            .iter()
            .all(|(key, expected)| Self::matches_entry(document, key, expected))
    }

    fn matches_entry(document: &Value, key: &str, expected: &Value) -> bool {
        match lookup_path(document, key) {
            Some(actual) => Self::value_matches(actual, expected),
            None => expected.is_null(),
        }
    }

    fn value_matches(actual: &Value, expected: &Value) -> bool {
        match expected {
            Value::Null => actual.is_null(),
            Value::Array(options) => match actual {
                Value::Array(items) => items
                    .iter()
                    .any(|item| options.iter().any(|o| Self::eq_match(item, o))),
                _ => options.iter().any(|o| Self::eq_match(actual, o)),
            },
            Value::Object(sub) => match actual {
                Value::Object(_) => Self::matches_entries(actual, sub),
                Value::Array(items) => items.iter().any(|item| Self::matches_entries(item, sub)),
                _ => false,
            },
            _ => match actual {
                Value::Array(items) => items.iter().any(|item| Self::eq_match(item, expected)),
                _ => Self::eq_match(actual, expected),
            },
        }
    }

    /// Equality with numeric widening and glob strings
    fn eq_match(actual: &Value, expected: &Value) -> bool {
        match (actual, expected) {
            (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(af), Some(bf)) => af == bf,
                _ => a == b,
            },
            (Value::String(a), Value::String(b)) if b.contains('*') => {
                glob_to_regex(b).map(|re| re.is_match(a)).unwrap_or(false)
            }
            _ => actual == expected,
        }
    }
}

/// Resolve a dotted path, stepping into objects only
fn lookup_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = document.get(path) {
        return Some(value);
    }
    path.split('.')
        .try_fold(document, |current, segment| current.get(segment))
}

/// Compile a `*`/`?` glob into an anchored, case-insensitive regex
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("(?i)^{}$", escaped)).ok()
}
