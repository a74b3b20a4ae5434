//! orchesity: orchestration engine CLI
//!
//! Drives the engine against simulated backends, for trying out routing
//! policies, fan-out and caching without provider credentials.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use tracing::info;

use orchesity::backend::SimulatedBackend;
use orchesity::{BackendId, EngineConfig, Orchesity, OrchestrationRequest, Orchestrator, SelectionPolicy};

/// Backends used when neither `--backend` nor the config names any.
const DEFAULT_BACKENDS: &[&str] = &["openai/gpt-4:120", "anthropic/claude:150", "local/llama:60"];

/// Orchesity CLI
#[derive(Parser)]
#[command(name = "orchesity")]
#[command(version)]
#[command(about = "Adaptive multi-backend orchestration engine")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "ORCHESITY_CONFIG")]
    config: Option<PathBuf>,

    /// Simulated backend as `name[:latency_ms[:failure_rate]]` (repeatable).
    #[arg(short, long = "backend")]
    backends: Vec<String>,

    /// Selection policy (overrides config and environment).
    #[arg(short, long)]
    policy: Option<SelectionPolicy>,

    /// Seed for the `random` policy.
    #[arg(long)]
    seed: Option<u64>,

    /// Show audit records (the `orchesity::audit` target) when `RUST_LOG` is unset.
    #[arg(long)]
    audit: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Orchestrate a prompt and print the response as JSON
    Run {
        /// Prompt (or omit to read from stdin)
        prompt: Option<String>,
        /// Backends to target (default: any registered backend)
        #[arg(short, long = "target")]
        targets: Vec<String>,
        /// Fan out to every eligible backend
        #[arg(long)]
        stream: bool,
        /// Successes required before returning
        #[arg(long)]
        min_success: Option<usize>,
        /// Request deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
        /// Bypass the response cache
        #[arg(long)]
        no_cache: bool,
        /// Issue the same request this many times concurrently
        #[arg(long, default_value_t = 1)]
        repeat: usize,
        /// Print per-backend statistics and cache counters afterwards
        #[arg(long)]
        stats: bool,
    },

    /// Send a test prompt straight to one backend
    Probe {
        /// Backend id
        backend: String,
    },

    /// Print the backend the active policy would pick first
    Top,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    let fallback = if args.audit {
        "warn,orchesity::audit=info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_writer(io::stderr)
        .init();

    let engine = build_engine(&args)?;
    info!(policy = %engine.policy(), backends = ?engine.backends(), "engine ready");

    match args.command {
        Command::Run {
            prompt,
            targets,
            stream,
            min_success,
            deadline_ms,
            no_cache,
            repeat,
            stats,
        } => {
            let prompt = resolve_text(prompt)?;
            let mut request = OrchestrationRequest::new(prompt)
                .backends(targets)
                .stream(stream)
                .use_cache(!no_cache);
            request.min_success = min_success;
            request.deadline_ms = deadline_ms;

            let runs = (0..repeat.max(1)).map(|_| engine.orchestrate(request.clone()));
            for outcome in join_all(runs).await {
                match outcome {
                    Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
                    Err(e) => eprintln!("error: {e}"),
                }
            }

            if stats {
                println!("{}", serde_json::to_string_pretty(&engine.backend_stats())?);
                if let Some(cache) = engine.cache_stats().await {
                    println!("{}", serde_json::to_string_pretty(&cache)?);
                }
            }
        }

        Command::Probe { backend } => {
            let report = engine.probe(&BackendId::from(backend)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Top => match engine.top_backend() {
            Some((backend, metrics)) => {
                println!("{backend}");
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            }
            None => println!("no eligible backend"),
        },
    }

    Ok(())
}

fn build_engine(args: &Args) -> orchesity::Result<Orchestrator> {
    let mut config = EngineConfig::load(args.config.as_deref())?;
    config.apply_env()?;
    if let Some(policy) = args.policy {
        config.routing.policy = policy;
    }

    let specs: Vec<String> = if !args.backends.is_empty() {
        args.backends.clone()
    } else if !config.backends.is_empty() {
        config.backends.iter().map(|p| p.id.to_string()).collect()
    } else {
        DEFAULT_BACKENDS.iter().map(|s| s.to_string()).collect()
    };

    let mut builder = Orchesity::builder().config(config);
    for spec in &specs {
        builder = builder.backend(Arc::new(SimulatedBackend::parse(spec)?));
    }
    if let Some(seed) = args.seed {
        builder = builder.seed(seed);
    }
    builder.build()
}

/// Prompt from the argument, stdin, or both (`"{arg}\n\n{stdin}"`).
fn resolve_text(arg: Option<String>) -> Result<String, Box<dyn std::error::Error>> {
    let stdin_text = if io::stdin().is_terminal() {
        None
    } else {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        let trimmed = buf.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    };

    match (arg, stdin_text) {
        (Some(a), Some(s)) => Ok(format!("{a}\n\n{s}")),
        (Some(a), None) => Ok(a),
        (None, Some(s)) => Ok(s),
        (None, None) => Err("run: no prompt provided (pass it as an argument or via stdin)".into()),
    }
}
