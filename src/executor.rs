//! Runs a single tool call with a deadline and fault isolation.
//!
//! The handler runs on its own tokio task. A panic inside it is caught at
//! the task boundary and reported as [`ToolError::Panicked`]. If the deadline
//! or the caller's cancellation arrives first, the handler's context is
//! cancelled and the task is left to finish on its own; the caller stops
//! waiting either way.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinError;

use crate::config::{ToolsConfig, DEFAULT_TOOL_TIMEOUT};
use crate::context::{CallContext, ContextDone};
use crate::error::ToolError;
use crate::telemetry::trace_tool_call;
use crate::tool::{ToolCall, ToolRegistry};

/// Executes calls against a [`ToolRegistry`].
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    /// A zero `timeout` falls back to the 30s default.
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_TOOL_TIMEOUT
        } else {
            timeout
        };
        Self { registry, timeout }
    }

    pub fn from_config(registry: Arc<ToolRegistry>, config: &ToolsConfig) -> Self {
        Self::new(registry, config.effective_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run `call` and return the handler's raw output.
    pub async fn run(&self, ctx: &CallContext, call: &ToolCall) -> Result<String, ToolError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound {
                name: call.name.clone(),
            })?;
        let args = parse_arguments(call)?;
        if let Some(done) = ctx.err() {
            return Err(context_error(&call.name, done, self.timeout));
        }

        let call_ctx = ctx.with_timeout(self.timeout);
        let limit = call_ctx.remaining().unwrap_or(self.timeout);
        let mut span = trace_tool_call(&call.name, &call.id);
        let started = Instant::now();

        let mut handle = tokio::spawn({
            let ctx = call_ctx.clone();
            async move { tool.execute(ctx, args).await }
        });

        let result = tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(ToolError::Failed {
                    name: call.name.clone(),
                    message: format!("{err:#}"),
                }),
                Err(join_err) => Err(join_error(&call.name, join_err)),
            },
            done = call_ctx.done() => {
                // Let a cooperative handler notice; the task itself is abandoned.
                call_ctx.cancel();
                Err(context_error(&call.name, done, limit))
            }
        };

        match &result {
            Ok(_) => {
                span.set_status(true, "");
                tracing::debug!(
                    tool = %call.name,
                    call_id = %call.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool call finished"
                );
            }
            Err(err) => {
                span.set_status(false, &err.to_string());
                tracing::warn!(
                    tool = %call.name,
                    call_id = %call.id,
                    kind = err.kind(),
                    error = %err,
                    "tool call failed"
                );
            }
        }
        result
    }
}

fn parse_arguments(call: &ToolCall) -> Result<serde_json::Value, ToolError> {
    if call.arguments.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(&call.arguments).map_err(|e| ToolError::InvalidArguments {
        name: call.name.clone(),
        reason: e.to_string(),
    })
}

fn context_error(name: &str, done: ContextDone, limit: Duration) -> ToolError {
    match done {
        ContextDone::DeadlineExceeded => ToolError::Timeout {
            name: name.to_string(),
            timeout: limit,
        },
        ContextDone::Cancelled => ToolError::Cancelled {
            name: name.to_string(),
        },
    }
}

fn join_error(name: &str, err: JoinError) -> ToolError {
    if err.is_panic() {
        ToolError::Panicked {
            name: name.to_string(),
            message: panic_message(err.into_panic()),
        }
    } else {
        ToolError::Cancelled {
            name: name.to_string(),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{EchoTool, FnTool};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn executor(timeout: Duration) -> ToolExecutor {
        let registry = ToolRegistry::new()
            .with(EchoTool)
            .with(FnTool::new("fail", "Always fails", |_ctx, _args| async {
                anyhow::bail!("backend unavailable")
            }))
            .with(FnTool::new("panic", "Panics", |_ctx, args| async move {
                if args.get("safe").is_none() {
                    panic!("handler exploded");
                }
                Ok(String::new())
            }))
            .with(FnTool::new("sleep", "Sleeps for `ms`", |_ctx, args| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(format!("slept {ms}"))
            }));
        ToolExecutor::new(Arc::new(registry), timeout)
    }

    #[tokio::test]
    async fn runs_handler_and_returns_output() {
        let exec = executor(Duration::from_secs(5));
        let call = ToolCall::new("c1", "echo", r#"{"input":"hi"}"#);
        let out = exec.run(&CallContext::background(), &call).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn empty_arguments_are_an_empty_object() {
        let exec = executor(Duration::from_secs(5));
        let call = ToolCall::new("c1", "echo", "");
        assert_eq!(exec.run(&CallContext::background(), &call).await.unwrap(), "");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let exec = executor(Duration::from_secs(5));
        let call = ToolCall::new("c1", "missing", "{}");
        let err = exec.run(&CallContext::background(), &call).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { ref name } if name == "missing"));
    }

    #[tokio::test]
    async fn malformed_arguments_are_rejected() {
        let exec = executor(Duration::from_secs(5));
        let call = ToolCall::new("c1", "echo", "{not json");
        let err = exec.run(&CallContext::background(), &call).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn handler_error_is_failed() {
        let exec = executor(Duration::from_secs(5));
        let call = ToolCall::new("c1", "fail", "{}");
        let err = exec.run(&CallContext::background(), &call).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
        assert!(err.to_string().contains("backend unavailable"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let exec = executor(Duration::from_secs(5));
        let call = ToolCall::new("c1", "panic", "{}");
        let err = exec.run(&CallContext::background(), &call).await.unwrap_err();
        match err {
            ToolError::Panicked { name, message } => {
                assert_eq!(name, "panic");
                assert!(message.contains("handler exploded"));
            }
            other => panic!("expected Panicked, got {other:?}"),
        }

        // The executor is still usable afterwards.
        let ok = ToolCall::new("c2", "echo", r#"{"input":"still here"}"#);
        assert_eq!(exec.run(&CallContext::background(), &ok).await.unwrap(), "still here");
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let exec = executor(Duration::from_millis(50));
        let call = ToolCall::new("c1", "sleep", r#"{"ms": 5000}"#);
        let start = Instant::now();
        let err = exec.run(&CallContext::background(), &call).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn caller_cancellation_stops_waiting() {
        let exec = executor(Duration::from_secs(30));
        let ctx = CallContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let call = ToolCall::new("c1", "sleep", r#"{"ms": 5000}"#);
        let err = exec.run(&ctx, &call).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn handler_sees_its_context_cancelled_on_timeout() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        let registry = ToolRegistry::new().with(FnTool::new(
            "cooperative",
            "Waits for cancellation",
            move |ctx, _args| {
                let flag = Arc::clone(&flag);
                async move {
                    ctx.token().cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(String::new())
                }
            },
        ));
        let exec = ToolExecutor::new(Arc::new(registry), Duration::from_millis(30));
        let call = ToolCall::new("c1", "cooperative", "{}");
        let err = exec.run(&CallContext::background(), &call).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn already_cancelled_context_never_starts_handler() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let registry = ToolRegistry::new().with(FnTool::new("mark", "Marks", move |_ctx, _args| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(String::new())
            }
        }));
        let exec = ToolExecutor::new(Arc::new(registry), Duration::from_secs(1));
        let ctx = CallContext::background();
        ctx.cancel();
        let err = exec
            .run(&ctx, &ToolCall::new("c1", "mark", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!started.load(Ordering::SeqCst));
    }

    #[test]
    fn zero_timeout_uses_default() {
        let exec = ToolExecutor::new(Arc::new(ToolRegistry::new()), Duration::ZERO);
        assert_eq!(exec.timeout(), DEFAULT_TOOL_TIMEOUT);
    }
}
