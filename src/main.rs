use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use storegate::config::StoregateConfig;
use storegate::store::{MemoryStore, RedisStore, SharedStore};
use storegate::{
    AdmissionGate, OptimisticCounter, QuotaDecision, RateLimiter, StoregateError, UnitOfWork,
};

/// Admission control and optimistic counters over a shared store.
#[derive(Debug, Parser)]
#[command(name = "storegate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Redis URL, overriding the configuration
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Use a process-local store instead of Redis. State lives only as long
    /// as this process, so every run starts from empty quotas and counters and
    /// a single `admit` is never denied; mainly useful with `hammer`.
    #[arg(long, global = true)]
    memory: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a unit of work through the admission gate
    Admit {
        /// Caller identity, e.g. the client address
        #[arg(long)]
        caller: String,
        /// Group or region
        #[arg(long)]
        group: Option<String>,
        /// Tenant or customer
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Increment a resource's view counter
    Increment { resource_id: String },
    /// Fire concurrent increments at one resource and report the outcome
    Hammer {
        resource_id: String,
        #[arg(long, default_value_t = 50)]
        concurrency: usize,
    },
    /// Validate the configuration and print the admission rules
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = StoregateConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis_url {
        config.store.url = url;
    }

    if let Command::CheckConfig = cli.command {
        let rules = config.admission_rules()?;
        let policy = config.counter.retry_policy()?;
        println!("{}", serde_json::to_string_pretty(&rules)?);
        info!(
            rules = rules.len(),
            max_attempts = policy.max_attempts,
            "Configuration is valid"
        );
        return Ok(ExitCode::SUCCESS);
    }

    if cli.memory {
        warn!("Using in-memory store; quotas and counters reset when this process exits");
        run(Arc::new(MemoryStore::new()), &config, cli.command).await
    } else {
        let store = RedisStore::connect_with_config(config.redis_store_config()).await?;
        run(Arc::new(store), &config, cli.command).await
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run<S: SharedStore + 'static>(
    store: Arc<S>,
    config: &StoregateConfig,
    command: Command,
) -> anyhow::Result<ExitCode> {
    match command {
        Command::Admit {
            caller,
            group,
            tenant,
        } => {
            let limiter = RateLimiter::with_prefix(store, config.rate_limiting.key_prefix.clone());
            let gate = AdmissionGate::new(limiter, config.admission_rules()?);

            let unit = UnitOfWork {
                caller,
                group,
                tenant,
                resource: None,
            };
            let decision = gate.admit(&unit).await?;
            println!("{}", serde_json::to_string(&decision)?);

            Ok(match decision {
                QuotaDecision::Allowed => ExitCode::SUCCESS,
                QuotaDecision::Denied { .. } => ExitCode::from(2),
            })
        }
        Command::Increment { resource_id } => {
            let counter = counter(store, config)?;
            let views = counter.increment_resource(&resource_id).await?;
            println!("{}", json!({ "id": resource_id, "views": views }));
            Ok(ExitCode::SUCCESS)
        }
        Command::Hammer {
            resource_id,
            concurrency,
        } => {
            let counter = counter(store, config)?;

            tokio::select! {
                report = hammer(&counter, &resource_id, concurrency) => {
                    println!("{}", report?);
                    Ok(ExitCode::SUCCESS)
                }
                _ = signal::ctrl_c() => {
                    warn!("Interrupted, abandoning in-flight increments");
                    Ok(ExitCode::from(130))
                }
            }
        }
        Command::CheckConfig => Ok(ExitCode::SUCCESS),
    }
}

fn counter<S: SharedStore>(
    store: Arc<S>,
    config: &StoregateConfig,
) -> anyhow::Result<OptimisticCounter<S>> {
    Ok(OptimisticCounter::new(store)
        .with_policy(config.counter.retry_policy()?)
        .with_naming(config.counter.namespace.clone(), config.counter.name.clone()))
}

async fn hammer<S: SharedStore>(
    counter: &OptimisticCounter<S>,
    resource_id: &str,
    concurrency: usize,
) -> anyhow::Result<serde_json::Value> {
    let key = counter.resource_key(resource_id);
    let before = counter.current(&key).await?;

    let results = join_all((0..concurrency).map(|_| counter.increment(&key))).await;

    let mut committed = 0usize;
    let mut exhausted = 0usize;
    for result in results {
        match result {
            Ok(_) => committed += 1,
            Err(StoregateError::ContentionExhausted { .. }) => exhausted += 1,
            Err(e) => return Err(e.into()),
        }
    }

    let after = counter.current(&key).await?;
    info!(
        key = %key,
        committed = committed,
        exhausted = exhausted,
        "Hammer finished"
    );

    Ok(json!({
        "key": key.to_string(),
        "requested": concurrency,
        "committed": committed,
        "exhausted": exhausted,
        "before": before,
        "after": after,
    }))
}
