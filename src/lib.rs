//! Resource control for an agent runtime.
//!
//! Two pieces: a token-bucket [`RateLimiter`] that shapes calls to a
//! quota-bound LLM API, and a [`ToolOrchestrator`] that runs batches of tool
//! calls on a bounded worker pool with per-call timeouts and panic
//! containment.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod key_registry;
pub mod observer;
pub mod orchestrator;
pub mod rate_limiter;
pub mod telemetry;
pub mod token_bucket;
pub mod tool;

pub use config::{CoreConfig, RateLimitConfig, ToolsConfig};
pub use context::{CallContext, ContextDone};
pub use error::{ConfigError, DispatchError, ToolError, WaitError};
pub use executor::ToolExecutor;
pub use orchestrator::ToolOrchestrator;
pub use rate_limiter::{RateLimiter, Reservation, Stats};
pub use tool::{FnTool, Tool, ToolCall, ToolOutcome, ToolRegistry};
