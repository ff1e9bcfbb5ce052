//! Observability trait and types.
//!
//! The orchestrator reports every tool call and one summary per batch to an
//! [`Observer`]. Observer failures are logged and never affect the batch.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Timing of one call inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTiming {
    pub index: usize,
    pub tool_name: String,
    pub success: bool,
    pub duration: Duration,
}

/// What happened to a whole batch, emitted once after every call finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_calls: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Worker-pool width; 1 for sequential runs.
    pub workers: usize,
    pub parallel: bool,
    pub total_duration: Duration,
    pub calls: Vec<CallTiming>,
}

/// Events that can be recorded by an observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObserverEvent {
    ToolCallStart {
        index: usize,
        call_id: String,
        tool_name: String,
        timestamp: DateTime<Utc>,
    },
    ToolCall {
        index: usize,
        call_id: String,
        tool_name: String,
        success: bool,
        error_kind: Option<String>,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },
    BatchSummary {
        summary: ExecutionSummary,
        timestamp: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Core trait every observability backend must implement.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Human-readable name of this observer.
    fn name(&self) -> &str;

    /// Record a structured event.
    async fn record_event(&self, event: ObserverEvent) -> anyhow::Result<()>;

    /// Flush any buffered data.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TracingObserver
// ---------------------------------------------------------------------------

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver;

#[async_trait]
impl Observer for TracingObserver {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn record_event(&self, event: ObserverEvent) -> anyhow::Result<()> {
        match event {
            ObserverEvent::ToolCallStart {
                index, tool_name, ..
            } => {
                tracing::debug!(index, tool = %tool_name, "tool call started");
            }
            ObserverEvent::ToolCall {
                index,
                tool_name,
                success: true,
                latency_ms,
                ..
            } => {
                tracing::debug!(index, tool = %tool_name, latency_ms, "tool call succeeded");
            }
            ObserverEvent::ToolCall {
                index,
                tool_name,
                error_kind,
                latency_ms,
                ..
            } => {
                tracing::warn!(
                    index,
                    tool = %tool_name,
                    error_kind = error_kind.as_deref().unwrap_or("unknown"),
                    latency_ms,
                    "tool call failed"
                );
            }
            ObserverEvent::BatchSummary { summary, .. } => {
                let per_call: Vec<String> = summary
                    .calls
                    .iter()
                    .map(|c| format!("{}={}ms", c.tool_name, c.duration.as_millis()))
                    .collect();
                tracing::info!(
                    total = summary.total_calls,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    workers = summary.workers,
                    parallel = summary.parallel,
                    total_ms = summary.total_duration.as_millis() as u64,
                    per_call = %per_call.join(","),
                    "tool batch finished"
                );
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NoopObserver
// ---------------------------------------------------------------------------

/// An observer that silently discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopObserver;

#[async_trait]
impl Observer for NoopObserver {
    fn name(&self) -> &str {
        "noop"
    }

    async fn record_event(&self, _event: ObserverEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryObserver
// ---------------------------------------------------------------------------

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    events: Mutex<Vec<ObserverEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// All batch summaries recorded so far.
    pub fn summaries(&self) -> Vec<ExecutionSummary> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObserverEvent::BatchSummary { summary, .. } => Some(summary),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Observer for MemoryObserver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn record_event(&self, event: ObserverEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .push(event);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
