//! Interception Pipeline
//!
//! Every backend step of an operation runs through the interceptors attached
//! to its descriptor: first → ... → last → step. An interceptor may inspect the
//! event, call `next` and adjust the outcome, or skip `next` and answer itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::ResolverResult;
use crate::query::Method;

/// Boxed outcome of an intercepted step
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = ResolverResult<Value>> + Send + 'a>>;

/// Whether the intercepted step reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Query,
    Mutation,
}

/// What an interceptor gets to see
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub kind: HookKind,
    pub method: Method,
    pub model: String,
    pub request_id: Uuid,
    /// Identifier or filter the step targets
    pub query: Value,
    /// Caller input for writes
    pub input: Option<Value>,
    /// Stored document a write starts from
    pub doc: Option<Value>,
}

/// Per-operation interceptor
pub trait Interceptor: Send + Sync {
    /// Handle the event, usually by awaiting `next.run(event)`
    fn process<'a>(&'a self, event: &'a HookEvent, next: Next<'a>) -> HookFuture<'a>;
}

/// Remainder of the chain
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    step: HookFuture<'a>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(interceptors: &'a [Arc<dyn Interceptor>], step: HookFuture<'a>) -> Self {
        Self { interceptors, step }
    }

    /// Run the next interceptor or the step itself
    pub fn run(self, event: &'a HookEvent) -> HookFuture<'a> {
        Box::pin(async move {
            if let Some((first, rest)) = self.interceptors.split_first() {
                let next = Next {
                    interceptors: rest,
                    step: self.step,
                };
                first.process(event, next).await
            } else {
                self.step.await
            }
        })
    }
}

/// Run `step` through `interceptors`
pub(crate) async fn intercept<'a>(
    interceptors: &'a [Arc<dyn Interceptor>],
    event: &'a HookEvent,
    step: HookFuture<'a>,
) -> ResolverResult<Value> {
    Next::new(interceptors, step).run(event).await
}

/// Logs every intercepted step with its duration and outcome
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInterceptor;

impl Interceptor for TracingInterceptor {
    fn process<'a>(&'a self, event: &'a HookEvent, next: Next<'a>) -> HookFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let result = next.run(event).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => debug!(
                    request_id = %event.request_id,
                    kind = ?event.kind,
                    method = %event.method,
                    model = %event.model,
                    elapsed_ms,
                    "step succeeded"
                ),
                Err(e) => debug!(
                    request_id = %event.request_id,
                    kind = ?event.kind,
                    method = %event.method,
                    model = %event.model,
                    elapsed_ms,
                    error = %e,
                    "step failed"
                ),
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn event() -> HookEvent {
        HookEvent {
            kind: HookKind::Query,
            method: Method::Get,
            model: "Person".to_string(),
            request_id: Uuid::new_v4(),
            query: json!("p1"),
            input: None,
            doc: None,
        }
    }

    struct Record(Arc<Mutex<Vec<&'static str>>>, &'static str);

    impl Interceptor for Record {
        fn process<'a>(&'a self, event: &'a HookEvent, next: Next<'a>) -> HookFuture<'a> {
            Box::pin(async move {
                self.0.lock().unwrap().push(self.1);
                next.run(event).await
            })
        }
    }

    struct Replace;

    impl Interceptor for Replace {
        fn process<'a>(&'a self, _event: &'a HookEvent, _next: Next<'a>) -> HookFuture<'a> {
            Box::pin(async move { Ok(json!("replaced")) })
        }
    }

    #[tokio::test]
    async fn test_chain_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Record(seen.clone(), "first")),
            Arc::new(TracingInterceptor),
            Arc::new(Record(seen.clone(), "second")),
        ];
        let event = event();

        let result = intercept(&chain, &event, Box::pin(async { Ok(json!(1)) })).await;
        assert_eq!(result.unwrap(), json!(1));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_interceptor_replaces_result() {
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(Replace)];
        let event = event();

        let result = intercept(&chain, &event, Box::pin(async { Ok(json!(1)) })).await;
        assert_eq!(result.unwrap(), json!("replaced"));
    }

    #[tokio::test]
    async fn test_empty_chain_runs_step() {
        let event = event();
        let result = intercept(&[], &event, Box::pin(async { Ok(json!([1, 2])) })).await;
        assert_eq!(result.unwrap(), json!([1, 2]));
    }
}
