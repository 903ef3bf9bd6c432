//! Request Context
//!
//! Identity and caller attributes of one logical request. A resolver, and
//! with it the batching cache, lives exactly as long as its request context.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

/// Per-request identity handed to interceptors and log events
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlates every driver call made on behalf of this request
    pub request_id: Uuid,

    /// Opaque caller attributes, e.g. tenant or user
    pub attributes: HashMap<String, Value>,

    opened: Instant,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    /// Reuse an id issued upstream so logs line up across services
    pub fn with_id(request_id: Uuid) -> Self {
        Self {
            request_id,
            attributes: HashMap::new(),
            opened: Instant::now(),
        }
    }

    pub fn attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn get_attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Time since the request was opened
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
