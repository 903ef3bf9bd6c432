//! Pagination
//!
//! Every sorted result is tagged with an opaque cursor: base64 of
//! `{"i": position, "id": id}`. Cursor paging follows Relay connection
//! semantics; classic paging is a plain skip/limit slice.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::descriptor::{CountFilter, Query};
use crate::driver::filter::glob_to_regex;
use crate::error::{ResolverError, ResolverResult};
use crate::query::sorter::get_deep;

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    i: usize,
    id: Value,
}

/// Encode a cursor for the document at `index`
pub fn encode_cursor(index: usize, id: &Value) -> String {
    let payload = serde_json::json!({ "i": index, "id": id });
    STANDARD.encode(payload.to_string())
}

/// Decode a cursor into its position and id
pub fn decode_cursor(cursor: &str) -> ResolverResult<(usize, Value)> {
    let bytes = STANDARD
        .decode(cursor)
        .map_err(|e| ResolverError::bad_request(format!("Invalid cursor '{}': {}", cursor, e)))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|e| ResolverError::bad_request(format!("Invalid cursor '{}': {}", cursor, e)))?;
    Ok((payload.i, payload.id))
}

/// One result with its cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub cursor: String,
    pub node: Value,
}

/// Relay page metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub has_previous_page: bool,
    pub has_next_page: bool,
    /// Results before slicing
    pub total_count: usize,
}

/// Page of results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub edges: Vec<Edge>,
    pub page_info: PageInfo,
}

impl Connection {
    pub fn nodes(&self) -> Vec<&Value> {
        self.edges.iter().map(|e| &e.node).collect()
    }

    pub fn into_nodes(self) -> Vec<Value> {
        self.edges.into_iter().map(|e| e.node).collect()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Keep documents whose number of values at the path matches the glob
pub fn filter_by_count(docs: Vec<Value>, filter: &CountFilter) -> ResolverResult<Vec<Value>> {
    let re = glob_to_regex(&filter.glob).ok_or_else(|| {
        ResolverError::bad_request(format!("Invalid count filter '{}'", filter.glob))
    })?;
    Ok(docs
        .into_iter()
        .filter(|doc| re.is_match(&get_deep(doc, &filter.path).len().to_string()))
        .collect())
}

fn tag(docs: Vec<Value>) -> Vec<Edge> {
    docs.into_iter()
        .enumerate()
        .map(|(i, node)| Edge {
            cursor: encode_cursor(i, node.get("id").unwrap_or(&Value::Null)),
            node,
        })
        .collect()
}

fn clamp(n: Option<usize>, max: Option<usize>) -> Option<usize> {
    match (n, max) {
        (Some(n), Some(max)) => Some(n.min(max)),
        (n, _) => n,
    }
}

/// Slice sorted documents according to the descriptor's paging options
pub fn paginate(
    docs: Vec<Value>,
    query: &Query,
    max_page_size: Option<usize>,
) -> ResolverResult<Connection> {
    let total_count = docs.len();
    let mut edges = tag(docs);

    if !query.uses_cursor_paging() {
        let skip = query.get_skip().unwrap_or(0).min(edges.len());
        edges.drain(..skip);
        if let Some(limit) = clamp(query.get_limit(), max_page_size) {
            edges.truncate(limit);
        }
        return Ok(Connection {
            edges,
            page_info: PageInfo {
                total_count,
                ..PageInfo::default()
            },
        });
    }

    let position = |cursor: &str| -> ResolverResult<Option<usize>> {
        decode_cursor(cursor)?;
        Ok(edges.iter().position(|e| e.cursor == cursor))
    };

    let mut start = 0;
    let mut end = edges.len();
    if let Some(after) = query.get_after() {
        if let Some(pos) = position(after)? {
            start = pos + 1;
        }
    }
    if let Some(before) = query.get_before() {
        if let Some(pos) = position(before)? {
            end = pos.max(start);
        }
    }

    let mut has_previous_page = start > 0;
    let mut has_next_page = end < edges.len();
    let mut page: Vec<Edge> = edges.drain(start..end).collect();

    if let Some(first) = clamp(query.get_first(), max_page_size) {
        if page.len() > first {
            page.truncate(first);
            has_next_page = true;
        }
    }
    if let Some(last) = clamp(query.get_last(), max_page_size) {
        if page.len() > last {
            page.drain(..page.len() - last);
            has_previous_page = true;
        }
    }

    Ok(Connection {
        page_info: PageInfo {
            start_cursor: page.first().map(|e| e.cursor.clone()),
            end_cursor: page.last().map(|e| e.cursor.clone()),
            has_previous_page,
            has_next_page,
            total_count,
        },
        edges: page,
    })
}
