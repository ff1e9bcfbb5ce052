use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use agent_governor::config::CoreConfig;
use agent_governor::telemetry::{self, GovernorTracer};
use agent_governor::tool::{EchoTool, FnTool, ToolCall, ToolRegistry};
use agent_governor::{CallContext, RateLimiter, ToolOrchestrator};

#[derive(Parser)]
#[command(
    name = "agent-governor",
    version,
    about = "Rate limiting and tool dispatch for agent runtimes"
)]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Fire a burst of requests at a limiter and print its stats
    Simulate {
        /// Number of admission attempts
        #[arg(short = 'n', long, default_value_t = 30)]
        requests: usize,
        /// Spread requests round-robin over this many keys
        #[arg(short, long, default_value_t = 1)]
        keys: usize,
        /// Block in `wait` instead of using `allow`
        #[arg(long)]
        wait: bool,
    },
    /// Dispatch a batch of demo tool calls and print the outcomes
    Dispatch {
        /// Number of calls in the batch
        #[arg(short = 'n', long, default_value_t = 4)]
        calls: usize,
        /// How long each call sleeps, in milliseconds
        #[arg(long, default_value_t = 50)]
        sleep_ms: u64,
        /// Make the call at this index fail
        #[arg(long)]
        fail_at: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print JSON schema for configuration
    Schema,
    /// Validate the config file and print it with defaults filled in
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging(cli.json_logs);

    let cfg = CoreConfig::load_or_default(cli.config.as_deref())?;
    let tracer = GovernorTracer::init(&cfg.tracing)?;

    let outcome = run(cli.command, cfg).await;
    tracer.shutdown();
    outcome
}

async fn run(command: Commands, cfg: CoreConfig) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => match action {
            ConfigAction::Schema => {
                println!("{}", serde_json::to_string_pretty(&CoreConfig::json_schema())?);
            }
            ConfigAction::Check => {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            }
        },
        Commands::Simulate {
            requests,
            keys,
            wait,
        } => {
            let limiter = RateLimiter::new(cfg.rate_limit)?;
            let ctx = CallContext::background();
            let keys = keys.max(1);
            let mut admitted = 0usize;
            for i in 0..requests {
                let key = format!("key-{}", i % keys);
                let ok = if wait {
                    limiter.wait(&ctx, &key).await.is_ok()
                } else {
                    limiter.allow(&key)
                };
                if ok {
                    admitted += 1;
                }
            }
            let per_key: serde_json::Map<String, serde_json::Value> = (0..keys)
                .map(|k| -> anyhow::Result<(String, serde_json::Value)> {
                    let key = format!("key-{k}");
                    let stats = serde_json::to_value(limiter.stats(&key))?;
                    Ok((key, stats))
                })
                .collect::<anyhow::Result<_>>()?;
            let report = serde_json::json!({
                "requests": requests,
                "admitted": admitted,
                "active_keys": limiter.active_keys(),
                "stats": per_key,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            limiter.shutdown().await;
        }
        Commands::Dispatch {
            calls,
            sleep_ms,
            fail_at,
        } => {
            let registry = ToolRegistry::new()
                .with(EchoTool)
                .with(FnTool::new(
                    "sleep",
                    "Sleeps for `ms` milliseconds",
                    |ctx, args| async move {
                        let ms = args["ms"].as_u64().unwrap_or(0);
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                                Ok(format!("slept {ms}ms"))
                            }
                            _ = ctx.token().cancelled() => anyhow::bail!("interrupted"),
                        }
                    },
                ))
                .with(FnTool::new("fail", "Always fails", |_ctx, _args| async {
                    anyhow::bail!("demo failure")
                }));
            let orchestrator = ToolOrchestrator::new(Arc::new(registry), cfg.tools);

            let batch: Vec<ToolCall> = (0..calls)
                .map(|i| {
                    let id = format!("call_{i}");
                    if Some(i) == fail_at {
                        ToolCall::new(id, "fail", "{}")
                    } else {
                        ToolCall::new(id, "sleep", format!(r#"{{"ms": {sleep_ms}}}"#))
                    }
                })
                .collect();

            let outcomes = orchestrator
                .dispatch(&CallContext::background(), &batch)
                .await?;
            let messages: Vec<_> = outcomes.iter().map(|o| o.to_message()).collect();
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
    }
    Ok(())
}
