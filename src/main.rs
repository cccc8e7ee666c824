use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::{ConcurrencySemaphore, DistributedWindowLimiter, LocalLockoutTracker, MemoryCounterStore};

/// Admission control toolkit.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// YAML configuration file (TURNSTILE_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective configuration as YAML
    Config,
    /// Drive all three components with synthetic traffic
    Simulate {
        /// Distinct caller addresses
        #[arg(long, default_value_t = 20)]
        callers: u8,
        /// Requests sent through the window limiter
        #[arg(long, default_value_t = 500)]
        requests: usize,
        /// Expensive jobs pushed through the semaphore
        #[arg(long, default_value_t = 12)]
        jobs: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    info!("Configuration loaded");

    match cli.command {
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Simulate {
            callers,
            requests,
            jobs,
        } => simulate(&config, callers.max(1), requests, jobs).await,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn caller_addr(index: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, index))
}

async fn simulate(config: &TurnstileConfig, callers: u8, requests: usize, jobs: usize) {
    info!(callers, requests, jobs, "Starting simulation");

    let limiter = DistributedWindowLimiter::new(MemoryCounterStore::new(), config.rate_limit.clone());
    let mut allowed = 0usize;
    let mut denied = 0usize;
    for _ in 0..requests {
        let addr = caller_addr(rand::thread_rng().gen_range(0..callers));
        match limiter.check_addr("api", Some(addr), chrono::Utc::now()).await {
            Ok(decision) if decision.allowed => allowed += 1,
            Ok(_) => denied += 1,
            Err(e) => error!(error = %e, "Counter store failed"),
        }
    }
    info!(allowed, denied, "Window limiter finished");

    let tracker = LocalLockoutTracker::new(config.lockout.clone());
    let mut locked_out = 0usize;
    for _ in 0..requests {
        let addr = caller_addr(rand::thread_rng().gen_range(0..callers)).to_string();
        if rand::thread_rng().gen_bool(0.1) {
            tracker.reset(&addr);
            continue;
        }
        if !tracker.record_attempt_now(&addr).allowed {
            locked_out += 1;
        }
    }
    info!(
        locked_out,
        tracked = tracker.len(),
        capacity = tracker.capacity(),
        "Lockout tracker finished"
    );

    let semaphore = Arc::new(ConcurrencySemaphore::from_config(&config.concurrency));
    let completed = Arc::new(AtomicUsize::new(0));
    let timed_out = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..jobs)
        .map(|job| {
            let semaphore = semaphore.clone();
            let completed = completed.clone();
            let timed_out = timed_out.clone();
            let work = Duration::from_millis(rand::thread_rng().gen_range(20..120));
            tokio::spawn(async move {
                let outcome = semaphore
                    .run(None, async {
                        tokio::time::sleep(work).await;
                    })
                    .await;
                match outcome {
                    Ok(()) => {
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(job, error = %e, "Job not admitted");
                        timed_out.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            error!(error = %e, "Job task failed");
        }
    }
    info!(
        completed = completed.load(Ordering::Relaxed),
        timed_out = timed_out.load(Ordering::Relaxed),
        capacity = semaphore.capacity(),
        "Concurrency semaphore finished"
    );
}
