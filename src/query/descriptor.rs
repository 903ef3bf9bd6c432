//! Operation descriptor
//!
//! A [`Query`] names the model, the method and everything the executor needs
//! to run it. Builder methods consume the descriptor and reject contradictory
//! combinations up front:
//!
//! - `id` excludes filter, native, sort and every paging option
//! - `filter` and `native` exclude each other (and `id`)
//! - classic paging (`skip`/`limit`) and cursor paging (`first`/`last`/
//!   `before`/`after`) exclude each other
//! - `first` and `last` exclude each other

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::driver::{QueryOptions, SessionId};
use crate::error::{ResolverError, ResolverResult};
use crate::hooks::Interceptor;

/// Operation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Find,
    Count,
    Create,
    Update,
    Delete,
    Push,
    Pull,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Find => "find",
            Method::Count => "count",
            Method::Create => "create",
            Method::Update => "update",
            Method::Delete => "delete",
            Method::Push => "push",
            Method::Pull => "pull",
        }
    }

    /// Reads go through the batching cache; writes never do
    pub fn is_read(&self) -> bool {
        matches!(self, Method::Get | Method::Find | Method::Count)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl FromStr for SortDirection {
    type Err = ResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "1" => Ok(SortDirection::Asc),
            "desc" | "-1" => Ok(SortDirection::Desc),
            other => Err(ResolverError::bad_request(format!(
                "Unknown sort direction '{}'",
                other
            ))),
        }
    }
}

/// One sort key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    /// Dotted field path
    pub path: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Keep documents where the number of values at `path` matches `glob`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountFilter {
    pub path: String,
    pub glob: String,
}

/// Array field and values for push/pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Splice {
    pub field: String,
    pub values: Vec<Value>,
}

/// Behavior flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFlags {
    /// Single-result reads fail with NotFound instead of yielding nothing
    pub required: bool,
    /// Log the resolved predicate
    pub debug: bool,
}

/// Operation descriptor
#[derive(Clone)]
pub struct Query {
    model: String,
    method: Method,
    id: Option<Value>,
    filter: Option<Value>,
    native: Option<Value>,
    select: Vec<String>,
    sort: Vec<SortSpec>,
    skip: Option<usize>,
    limit: Option<usize>,
    first: Option<usize>,
    last: Option<usize>,
    before: Option<String>,
    after: Option<String>,
    count_filter: Option<CountFilter>,
    input: Option<Value>,
    splice: Option<Splice>,
    meta: Option<Value>,
    flags: QueryFlags,
    options: QueryOptions,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("model", &self.model)
            .field("method", &self.method)
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("native", &self.native)
            .field("sort", &self.sort)
            .field("flags", &self.flags)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

fn non_negative(prop: &str, n: i64) -> ResolverResult<usize> {
    usize::try_from(n).map_err(|_| {
        ResolverError::bad_request(format!("\"{}\" must not be negative (got {})", prop, n))
    })
}

impl Query {
    pub fn new(model: impl Into<String>, method: Method) -> Self {
        Self {
            model: model.into(),
            method,
            id: None,
            filter: None,
            native: None,
            select: Vec::new(),
            sort: Vec::new(),
            skip: None,
            limit: None,
            first: None,
            last: None,
            before: None,
            after: None,
            count_filter: None,
            input: None,
            splice: None,
            meta: None,
            flags: QueryFlags::default(),
            options: QueryOptions::default(),
            interceptors: Vec::new(),
        }
    }

    fn is_set(&self, prop: &str) -> bool {
        match prop {
            "id" => self.id.is_some(),
            "where" => self.filter.is_some(),
            "native" => self.native.is_some(),
            "sort" => !self.sort.is_empty(),
            "skip" => self.skip.is_some(),
            "limit" => self.limit.is_some(),
            "first" => self.first.is_some(),
            "last" => self.last.is_some(),
            "before" => self.before.is_some(),
            "after" => self.after.is_some(),
            _ => false,
        }
    }

    fn prop_check(&self, prop: &str, checks: &[&str]) -> ResolverResult<()> {
        match checks.iter().find(|check| self.is_set(check)) {
            Some(check) => Err(ResolverError::bad_request(format!(
                "Cannot use \"{}\" while using \"{}\"",
                prop, check
            ))),
            None => Ok(()),
        }
    }

    fn is_classic_paging(&self) -> bool {
        self.skip.is_some() || self.limit.is_some()
    }

    fn is_cursor_paging(&self) -> bool {
        self.first.is_some() || self.last.is_some() || self.before.is_some() || self.after.is_some()
    }

    fn classic_check(&self, prop: &str) -> ResolverResult<()> {
        if self.is_cursor_paging() {
            return Err(ResolverError::bad_request(format!(
                "Cannot use \"{}\" while using Cursor-Style Pagination",
                prop
            )));
        }
        Ok(())
    }

    fn cursor_check(&self, prop: &str) -> ResolverResult<()> {
        if self.is_classic_paging() {
            return Err(ResolverError::bad_request(format!(
                "Cannot use \"{}\" while using Classic-Style Pagination",
                prop
            )));
        }
        Ok(())
    }

    pub fn id(mut self, id: impl Into<Value>) -> ResolverResult<Self> {
        self.prop_check(
            "id",
            &["where", "native", "sort", "skip", "limit", "before", "after", "first", "last"],
        )?;
        self.id = Some(id.into());
        Ok(self)
    }

    /// Nested predicate over field names; dotted keys are unravelled
    pub fn filter(mut self, filter: Value) -> ResolverResult<Self> {
        self.prop_check("where", &["id", "native"])?;
        if !filter.is_object() {
            return Err(ResolverError::bad_request("\"where\" must be an object"));
        }
        self.filter = Some(unravel(filter));
        Ok(self)
    }

    /// Storage-level predicate passed to the driver as is
    pub fn native(mut self, native: Value) -> ResolverResult<Self> {
        self.prop_check("native", &["id", "where"])?;
        self.native = Some(native);
        Ok(self)
    }

    pub fn select<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn sort(mut self, sort: Vec<SortSpec>) -> ResolverResult<Self> {
        self.prop_check("sort", &["id"])?;
        self.sort = sort;
        Ok(self)
    }

    /// Append one sort key
    pub fn sort_by(self, path: impl Into<String>, direction: SortDirection) -> ResolverResult<Self> {
        let mut sort = self.sort.clone();
        sort.push(SortSpec {
            path: path.into(),
            direction,
        });
        self.sort(sort)
    }

    pub fn skip(mut self, skip: i64) -> ResolverResult<Self> {
        self.prop_check("skip", &["id"])?;
        self.classic_check("skip")?;
        self.skip = Some(non_negative("skip", skip)?);
        Ok(self)
    }

    pub fn limit(mut self, limit: i64) -> ResolverResult<Self> {
        self.prop_check("limit", &["id"])?;
        self.classic_check("limit")?;
        self.limit = Some(non_negative("limit", limit)?);
        Ok(self)
    }

    pub fn first(mut self, first: i64) -> ResolverResult<Self> {
        self.prop_check("first", &["id", "last"])?;
        self.cursor_check("first")?;
        self.first = Some(non_negative("first", first)?);
        Ok(self)
    }

    pub fn last(mut self, last: i64) -> ResolverResult<Self> {
        self.prop_check("last", &["id", "first"])?;
        self.cursor_check("last")?;
        self.last = Some(non_negative("last", last)?);
        Ok(self)
    }

    pub fn before(mut self, cursor: impl Into<String>) -> ResolverResult<Self> {
        self.prop_check("before", &["id"])?;
        self.cursor_check("before")?;
        self.before = Some(cursor.into());
        Ok(self)
    }

    pub fn after(mut self, cursor: impl Into<String>) -> ResolverResult<Self> {
        self.prop_check("after", &["id"])?;
        self.cursor_check("after")?;
        self.after = Some(cursor.into());
        Ok(self)
    }

    pub fn count_filter(mut self, path: impl Into<String>, glob: impl Into<String>) -> Self {
        self.count_filter = Some(CountFilter {
            path: path.into(),
            glob: glob.into(),
        });
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn splice(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.splice = Some(Splice {
            field: field.into(),
            values,
        });
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.flags.required = required;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.flags.debug = debug;
        self
    }

    pub fn flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Run against a driver session
    pub fn session(mut self, session: Option<SessionId>) -> Self {
        self.options.session = session;
        self
    }

    pub fn intercept(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Same descriptor under another method
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn get_id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn get_filter(&self) -> Option<&Value> {
        self.filter.as_ref()
    }

    pub fn get_native(&self) -> Option<&Value> {
        self.native.as_ref()
    }

    /// Predicate the descriptor matches: filter, native, `{id}` or `{}`
    pub fn predicate(&self) -> Value {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        if let Some(native) = &self.native {
            return native.clone();
        }
        match &self.id {
            Some(id) => json!({ "id": id }),
            None => Value::Object(Map::new()),
        }
    }

    pub fn get_select(&self) -> &[String] {
        &self.select
    }

    pub fn get_sort(&self) -> &[SortSpec] {
        &self.sort
    }

    pub fn get_skip(&self) -> Option<usize> {
        self.skip
    }

    pub fn get_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn get_first(&self) -> Option<usize> {
        self.first
    }

    pub fn get_last(&self) -> Option<usize> {
        self.last
    }

    pub fn get_before(&self) -> Option<&str> {
        self.before.as_deref()
    }

    pub fn get_after(&self) -> Option<&str> {
        self.after.as_deref()
    }

    pub fn get_count_filter(&self) -> Option<&CountFilter> {
        self.count_filter.as_ref()
    }

    pub fn get_input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    pub fn get_splice(&self) -> Option<&Splice> {
        self.splice.as_ref()
    }

    pub fn get_meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    pub fn get_flags(&self) -> QueryFlags {
        self.flags
    }

    pub fn get_options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.options.session
    }

    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }

    /// Whether the descriptor uses any cursor option
    pub fn uses_cursor_paging(&self) -> bool {
        self.is_cursor_paging()
    }

    /// Canonical identity of a read; equal descriptors yield equal keys
    pub fn cache_key(&self) -> Value {
        json!({
            "model": self.model,
            "method": self.method,
            "where": self.predicate(),
            "native": self.native.is_some(),
            "select": self.select,
            "sort": self.sort,
            "skip": self.skip,
            "limit": self.limit,
            "before": self.before,
            "after": self.after,
            "first": self.first,
            "last": self.last,
            "countFilter": self.count_filter,
        })
    }
}

/// Expand dotted keys into nested objects: `{"a.b": 1}` → `{"a": {"b": 1}}`
pub fn unravel(value: Value) -> Value {
    let Value::Object(obj) = value else {
        return value;
    };
    let mut out = Map::new();
    for (key, value) in obj {
        let segments: Vec<&str> = key.split('.').collect();
        insert_path(&mut out, &segments, unravel(value));
    }
    Value::Object(out)
}

fn insert_path(target: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => match (target.get_mut(*last), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => existing.extend(incoming),
            (_, value) => {
                target.insert(last.to_string(), value);
            }
        },
        [head, rest @ ..] => {
            let slot = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                insert_path(inner, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find() -> Query {
        Query::new("Person", Method::Find)
    }

    #[test]
    fn test_id_conflicts_with_filter() {
        let err = find()
            .filter(json!({"name": "Ann"}))
            .unwrap()
            .id("p1")
            .unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
        assert!(err.to_string().contains("\"id\" while using \"where\""));
    }

    #[test]
    fn test_filter_conflicts_with_native() {
        let err = find()
            .native(json!({"_id": "p1"}))
            .unwrap()
            .filter(json!({}))
            .unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[test]
    fn test_sort_conflicts_with_id() {
        assert!(find().id("p1").unwrap().sort(vec![SortSpec::asc("name")]).is_err());
        assert!(find()
            .sort(vec![SortSpec::asc("name")])
            .unwrap()
            .id("p1")
            .is_err());
    }

    #[test]
    fn test_classic_and_cursor_paging_exclusive() {
        assert!(find().skip(1).unwrap().first(2).is_err());
        assert!(find().after("abc").unwrap().limit(2).is_err());
        assert!(find().limit(5).unwrap().skip(2).is_ok());
    }

    #[test]
    fn test_first_and_last_exclusive() {
        assert!(find().first(2).unwrap().last(2).is_err());
        assert!(find().last(2).unwrap().first(2).is_err());
    }

    #[test]
    fn test_negative_counts_rejected() {
        assert_eq!(find().first(-1).unwrap_err().code(), "BAD_REQUEST");
        assert_eq!(find().limit(-3).unwrap_err().code(), "BAD_REQUEST");
    }

    #[test]
    fn test_first_is_not_padded() {
        let q = find().first(3).unwrap();
        assert_eq!(q.get_first(), Some(3));
    }

    #[test]
    fn test_unravel() {
        let value = unravel(json!({"a.b": 1, "a": {"c": 2}, "d": {"e.f": 3}}));
        assert_eq!(value, json!({"a": {"b": 1, "c": 2}, "d": {"e": {"f": 3}}}));
    }

    #[test]
    fn test_predicate() {
        assert_eq!(find().id("p1").unwrap().predicate(), json!({"id": "p1"}));
        assert_eq!(find().predicate(), json!({}));
    }

    #[test]
    fn test_cache_key_ignores_construction_order() {
        let a = find()
            .filter(json!({"name": "Ann", "age": 3}))
            .unwrap()
            .sort(vec![SortSpec::desc("age")])
            .unwrap();
        let b = find()
            .sort(vec![SortSpec::desc("age")])
            .unwrap()
            .filter(json!({"age": 3, "name": "Ann"}))
            .unwrap();
        assert_eq!(a.cache_key().to_string(), b.cache_key().to_string());

        let c = find().filter(json!({"name": "Bob"})).unwrap();
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_sort_direction_parse() {
        assert_eq!("DESC".parse::<SortDirection>().unwrap(), SortDirection::Desc);
        assert_eq!("-1".parse::<SortDirection>().unwrap(), SortDirection::Desc);
        assert!("sideways".parse::<SortDirection>().is_err());
    }
}
