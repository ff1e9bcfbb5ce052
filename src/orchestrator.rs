//! Batch dispatch of tool calls.
//!
//! Batches of two or more calls run on a bounded worker pool when parallel
//! execution is enabled; otherwise they run one by one and stop at the
//! first failure. In the parallel case every call runs to completion before
//! results are inspected, and the reported error is always the
//! lowest-indexed failure, the same one a sequential run would hit first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::config::ToolsConfig;
use crate::context::CallContext;
use crate::error::{DispatchError, ToolError};
use crate::executor::ToolExecutor;
use crate::observer::{CallTiming, ExecutionSummary, Observer, ObserverEvent, TracingObserver};
use crate::telemetry::trace_dispatch;
use crate::tool::{ToolCall, ToolOutcome, ToolRegistry};

/// Result of one call, before the batch verdict.
#[derive(Debug)]
struct CallReport {
    index: usize,
    result: Result<String, ToolError>,
    duration: Duration,
}

/// Dispatches batches of tool calls through a [`ToolExecutor`].
pub struct ToolOrchestrator {
    executor: ToolExecutor,
    config: ToolsConfig,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for ToolOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolOrchestrator")
            .field("executor", &self.executor)
            .field("config", &self.config)
            .field("observer", &self.observer.name())
            .finish()
    }
}

impl ToolOrchestrator {
    pub fn new(registry: Arc<ToolRegistry>, config: ToolsConfig) -> Self {
        Self {
            executor: ToolExecutor::from_config(registry, &config),
            config,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replace the default `tracing` observer.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// Pool width that a batch of `calls` calls would get.
    pub fn worker_count(&self, calls: usize) -> usize {
        self.config.effective_max_workers().min(calls).max(1)
    }

    /// Run `calls` and return their outcomes in call order, or the error of
    /// the lowest-indexed failing call. Never returns partial results.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        calls: &[ToolCall],
    ) -> Result<Vec<ToolOutcome>, DispatchError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let parallel = self.config.parallel_execution && calls.len() > 1;
        let workers = if parallel {
            self.worker_count(calls.len())
        } else {
            1
        };
        let mut span = trace_dispatch(calls.len(), workers);
        let started = Instant::now();

        let reports = if parallel {
            self.run_parallel(ctx, calls, workers).await
        } else {
            self.run_sequential(ctx, calls).await
        };

        self.emit_summary(calls, &reports, workers, parallel, started.elapsed())
            .await;

        let verdict = collect(calls, reports);
        match &verdict {
            Ok(_) => span.set_status(true, ""),
            Err(err) => span.set_status(false, &err.to_string()),
        }
        verdict
    }

    async fn run_sequential(&self, ctx: &CallContext, calls: &[ToolCall]) -> Vec<CallReport> {
        let mut reports = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().enumerate() {
            let report =
                run_observed(&self.executor, self.observer.as_ref(), ctx, index, call).await;
            let failed = report.result.is_err();
            reports.push(report);
            if failed {
                break;
            }
        }
        reports
    }

    async fn run_parallel(
        &self,
        ctx: &CallContext,
        calls: &[ToolCall],
        workers: usize,
    ) -> Vec<CallReport> {
        let gate = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(calls.len());

        for (index, call) in calls.iter().enumerate() {
            let gate = Arc::clone(&gate);
            let executor = self.executor.clone();
            let observer = Arc::clone(&self.observer);
            let ctx = ctx.clone();
            let call = call.clone();
            handles.push(tokio::spawn(async move {
                let _permit = match gate.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return CallReport {
                            index,
                            result: Err(ToolError::Cancelled { name: call.name }),
                            duration: Duration::ZERO,
                        }
                    }
                };
                run_observed(&executor, observer.as_ref(), &ctx, index, &call).await
            }));
        }

        // Join every worker before looking at any result.
        let mut reports = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let report = match handle.await {
                Ok(report) => report,
                Err(join_err) => CallReport {
                    index,
                    result: Err(ToolError::Panicked {
                        name: calls[index].name.clone(),
                        message: join_err.to_string(),
                    }),
                    duration: Duration::ZERO,
                },
            };
            reports.push(report);
        }
        reports
    }

    async fn emit_summary(
        &self,
        calls: &[ToolCall],
        reports: &[CallReport],
        workers: usize,
        parallel: bool,
        total_duration: Duration,
    ) {
        let succeeded = reports.iter().filter(|r| r.result.is_ok()).count();
        let summary = ExecutionSummary {
            total_calls: calls.len(),
            succeeded,
            failed: reports.len() - succeeded,
            workers,
            parallel,
            total_duration,
            calls: reports
                .iter()
                .map(|r| CallTiming {
                    index: r.index,
                    tool_name: calls[r.index].name.clone(),
                    success: r.result.is_ok(),
                    duration: r.duration,
                })
                .collect(),
        };
        let event = ObserverEvent::BatchSummary {
            summary,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.observer.record_event(event).await {
            tracing::warn!(
                observer = self.observer.name(),
                error = %e,
                "observer rejected batch summary"
            );
        }
    }
}

/// Run one call and report its start and finish to `observer`.
async fn run_observed(
    executor: &ToolExecutor,
    observer: &dyn Observer,
    ctx: &CallContext,
    index: usize,
    call: &ToolCall,
) -> CallReport {
    notify(
        observer,
        ObserverEvent::ToolCallStart {
            index,
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            timestamp: Utc::now(),
        },
    )
    .await;

    let started = Instant::now();
    let result = executor.run(ctx, call).await;
    let duration = started.elapsed();

    notify(
        observer,
        ObserverEvent::ToolCall {
            index,
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: result.is_ok(),
            error_kind: result.as_ref().err().map(|e| e.kind().to_string()),
            latency_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        },
    )
    .await;

    CallReport {
        index,
        result,
        duration,
    }
}

async fn notify(observer: &dyn Observer, event: ObserverEvent) {
    if let Err(e) = observer.record_event(event).await {
        tracing::warn!(observer = observer.name(), error = %e, "observer rejected event");
    }
}

/// Walk reports in index order; the first failure wins.
fn collect(
    calls: &[ToolCall],
    reports: Vec<CallReport>,
) -> Result<Vec<ToolOutcome>, DispatchError> {
    let mut outcomes = Vec::with_capacity(reports.len());
    for report in reports {
        let call = &calls[report.index];
        match report.result {
            Ok(output) => outcomes.push(ToolOutcome {
                index: report.index,
                call_id: call.id.clone(),
                name: call.name.clone(),
                output,
                duration: report.duration,
            }),
            Err(source) => {
                return Err(DispatchError::Tool {
                    index: report.index,
                    call_id: call.id.clone(),
                    source,
                })
            }
        }
    }
    Ok(outcomes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
