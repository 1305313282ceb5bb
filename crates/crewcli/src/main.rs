// crates/crewcli/src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use crewcore::{ExecutionEvent, StopFlag};
use crewlimits::{ProviderLimits, TokenBucketManager};
use crewruntime::{ExecutionManager, RuntimeConfig, Submission};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "crew")]
#[command(about = "Crew execution runtime CLI", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run simulated crews through the execution manager
    Run {
        /// Number of crews to submit
        #[arg(short, long, default_value_t = 5)]
        count: usize,

        /// How long each crew works, in milliseconds
        #[arg(short, long, default_value_t = 500)]
        duration_ms: u64,

        /// Per-crew timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Worker threads (overrides the config)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Request a stop for the last N crews shortly after submitting
        #[arg(long, default_value_t = 0)]
        stop: usize,

        /// Make every Nth crew fail
        #[arg(long)]
        fail_every: Option<usize>,

        /// Runtime config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Push requests through a token bucket and report grant timing
    Throttle {
        /// Bucket rate in tokens per minute (also the ceiling with --rpm)
        #[arg(long, default_value_t = 600.0)]
        tokens_per_minute: f64,

        /// Number of requests to send
        #[arg(short, long, default_value_t = 10)]
        requests: usize,

        /// Estimated tokens per request
        #[arg(long, default_value_t = 100.0)]
        tokens_per_request: f64,

        /// Provider requests-per-minute limit
        #[arg(long)]
        rpm: Option<f64>,

        /// Fail immediately instead of waiting for tokens
        #[arg(long)]
        no_wait: bool,
    },

    /// Print the effective runtime configuration
    Config {
        /// Runtime config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            count,
            duration_ms,
            timeout_ms,
            workers,
            stop,
            fail_every,
            config,
        } => {
            let mut config = load_config(config)?;
            if let Some(workers) = workers {
                config.max_workers = workers;
            }
            let plan = RunPlan {
                count,
                duration: Duration::from_millis(duration_ms),
                timeout: timeout_ms.map(Duration::from_millis),
                stop,
                fail_every,
            };
            run_crews(config, plan).await?;
        }

        Commands::Throttle {
            tokens_per_minute,
            requests,
            tokens_per_request,
            rpm,
            no_wait,
        } => {
            throttle(tokens_per_minute, requests, tokens_per_request, rpm, !no_wait).await?;
        }

        Commands::Config { config } => {
            let config = load_config(config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_file(path)?.merge_env()?,
        None => RuntimeConfig::from_env()?,
    };
    tracing::debug!("Loaded runtime config: {:?}", config);
    Ok(config)
}

struct RunPlan {
    count: usize,
    duration: Duration,
    timeout: Option<Duration>,
    stop: usize,
    fail_every: Option<usize>,
}

/// Stand-in for a crew run: works in small steps and honours the stop flag.
fn simulated_crew(stop: StopFlag, duration: Duration, fail: bool) -> Result<String> {
    const STEPS: u32 = 10;
    for _ in 0..STEPS {
        stop.sleep(duration / STEPS)?;
    }
    if fail {
        anyhow::bail!("simulated agent failure");
    }
    Ok(format!("crew finished after {:?}", duration))
}

async fn run_crews(config: RuntimeConfig, plan: RunPlan) -> Result<()> {
    println!("🚀 Starting execution manager");
    println!("   Workers: {}", config.max_workers);
    println!("   Crews: {}", plan.count);
    println!();

    let manager = Arc::new(ExecutionManager::new(config)?);

    // Subscribe to events for real-time output
    let mut events = manager.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::Submitted { execution_id, .. } => {
                    println!("  📥 Submitted {}", execution_id);
                }
                ExecutionEvent::Started {
                    execution_id,
                    worker,
                    ..
                } => {
                    println!("  ⚡ {} started on {}", execution_id, worker);
                }
                ExecutionEvent::StopRequested {
                    execution_id,
                    prevented_start,
                    ..
                } => {
                    if prevented_start {
                        println!("  🛑 {} cancelled before starting", execution_id);
                    } else {
                        println!("  ✋ {} asked to stop", execution_id);
                    }
                }
                ExecutionEvent::Finished {
                    execution_id,
                    status,
                    duration_ms,
                    ..
                } => {
                    println!("  🏁 {} finished as {} in {}ms", execution_id, status, duration_ms);
                }
            }
        }
    });

    let ids: Vec<String> = (0..plan.count)
        .map(|i| format!("crew-{}-{}", i, Uuid::new_v4().simple()))
        .collect();

    let mut runs = Vec::with_capacity(ids.len());
    for (index, id) in ids.iter().enumerate() {
        let manager = Arc::clone(&manager);
        let id = id.clone();
        let duration = plan.duration;
        let fail = plan
            .fail_every
            .map_or(false, |every| every > 0 && (index + 1) % every == 0);
        let mut submission = Submission::new();
        if let Some(timeout) = plan.timeout {
            submission = submission.timeout(timeout);
        }

        runs.push(tokio::spawn(async move {
            let result = manager
                .submit(
                    id.clone(),
                    move |stop| simulated_crew(stop, duration, fail),
                    submission,
                )
                .await;
            (id, result)
        }));
    }

    if plan.stop > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        for id in ids.iter().rev().take(plan.stop) {
            if !manager.request_stop(id) {
                println!("  ⚠️  {} was no longer running", id);
            }
        }
    }

    println!();
    for run in runs {
        let (id, result) = run.await?;
        match result {
            Ok(output) => println!("  ✅ {}: {}", id, output),
            Err(e) => println!("  ❌ {}: {}", id, e),
        }
    }

    manager.shutdown(true).await;

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Metrics:");
    println!("{}", serde_json::to_string_pretty(&manager.get_metrics())?);

    Ok(())
}

async fn throttle(
    tokens_per_minute: f64,
    requests: usize,
    tokens_per_request: f64,
    rpm: Option<f64>,
    wait: bool,
) -> Result<()> {
    let rate = match rpm {
        Some(rpm) => ProviderLimits::new(rpm, tokens_per_request)
            .with_ceiling(tokens_per_minute)
            .effective_tokens_per_minute(),
        None => tokens_per_minute,
    };

    println!("🪣 Bucket rate: {} tokens/min", rate);
    println!();

    let limiter = TokenBucketManager::new();
    let started = Instant::now();
    let mut granted = 0;
    for i in 0..requests {
        if limiter
            .consume_tokens("cli", tokens_per_request, rate, wait)
            .await?
        {
            granted += 1;
            println!(
                "  ✅ request {} granted at {:.2}s",
                i + 1,
                started.elapsed().as_secs_f64()
            );
        } else {
            println!("  ⏳ request {} throttled", i + 1);
        }
    }

    println!();
    println!(
        "📊 {}/{} requests granted in {:.2}s",
        granted,
        requests,
        started.elapsed().as_secs_f64()
    );

    Ok(())
}
