//! cadence - job lifecycle engine.
//!
//! Usage:
//!   cadence run <config>          Start the engine and seed configured jobs
//!   cadence validate <config>     Validate the configuration without running
//!   cadence list <config>         List configured and stored jobs
//!   cadence stats <config>        Show job counts by status and type
//!   cadence stuck <config>        List jobs running past the stuck timeout
//!   cadence reset-stuck <config>  Force-fail jobs running past the timeout
//!   cadence cleanup <config>      Delete finished jobs older than N days

use cadence::config::{
    CadenceConfig, JobConfig, StorageConfig, YamlLoader, load_jobs_from_directory, seed_jobs,
};
use cadence::{
    Admin, InMemoryJobStore, JobFilter, JobService, JobStore, LoggingHook, Notifier, Scheduler,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// cadence - job lifecycle engine
#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and seed the configured jobs
    Run {
        /// Path to cadence.yaml
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Validate the configuration without running
    Validate {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// List configured jobs and jobs in the store
    List {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Show job counts by status and type as JSON
    Stats {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// List jobs running longer than the timeout
    Stuck {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Timeout in minutes (default: the engine's stuck timeout)
        #[arg(long)]
        timeout_mins: Option<u64>,
    },

    /// Force-fail jobs running longer than the timeout
    ResetStuck {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Timeout in minutes (default: the engine's stuck timeout)
        #[arg(long)]
        timeout_mins: Option<u64>,
    },

    /// Delete finished jobs older than the given number of days
    Cleanup {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Minimum age in days
        #[arg(long, default_value = "30")]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_engine(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::List { config } => list_jobs(&config).await?,
        Commands::Stats { config } => show_stats(&config).await?,
        Commands::Stuck {
            config,
            timeout_mins,
        } => list_stuck(&config, timeout_mins).await?,
        Commands::ResetStuck {
            config,
            timeout_mins,
        } => reset_stuck(&config, timeout_mins).await?,
        Commands::Cleanup { config, days } => cleanup(&config, days).await?,
    }

    Ok(())
}

/// Load the configuration together with any jobs from `jobs_dir`.
fn load(path: &Path) -> Result<(CadenceConfig, Vec<JobConfig>), Box<dyn std::error::Error>> {
    let config = YamlLoader::load_config(path)?;
    let mut jobs = config.jobs.clone();
    if let Some(dir) = &config.jobs_dir {
        // Relative job directories resolve against the config file.
        let dir = match path.parent() {
            Some(parent) if dir.is_relative() => parent.join(dir),
            _ => dir.clone(),
        };
        jobs.extend(load_jobs_from_directory(&dir)?);
    }
    Ok((config, jobs))
}

/// Open the configured store for administrative commands.
async fn open_store(storage: &StorageConfig) -> Result<Arc<dyn JobStore>, Box<dyn std::error::Error>> {
    match storage {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; administrative commands see an empty store");
            let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
            Ok(store)
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            let store: Arc<dyn JobStore> = Arc::new(cadence::SqliteJobStore::new(path).await?);
            Ok(store)
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => Err("sqlite storage requires the `sqlite` feature".into()),
    }
}

async fn run_engine(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading configuration from: {}", path.display());
    let (config, jobs) = load(path)?;

    match &config.storage {
        StorageConfig::Memory => run_with_store(InMemoryJobStore::new(), &config, &jobs).await,
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite store at {}", path);
            let store = cadence::SqliteJobStore::new(path).await?;
            run_with_store(store, &config, &jobs).await
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => Err("sqlite storage requires the `sqlite` feature".into()),
    }
}

async fn run_with_store<S: JobStore + 'static>(
    store: S,
    config: &CadenceConfig,
    jobs: &[JobConfig],
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(store);
    let service = JobService::new(store.clone());

    let created = seed_jobs(&service, jobs).await?;
    info!("Seeded {} new job(s) of {} configured", created.len(), jobs.len());
    for job in &created {
        info!("  - {} ({}) id={}", job.name, job.job_type, job.id);
    }

    let settings = config.engine.to_settings();
    info!(
        "Starting engine (one-time tick: {:?}, recurring tick: {:?}, workers: {}+{})",
        settings.one_time_interval,
        settings.recurring_interval,
        settings.job_workers,
        settings.retry_workers
    );
    info!("Press Ctrl+C to stop");

    let scheduler = Scheduler::with_store(store)
        .with_hook(Arc::new(LoggingHook))
        .with_settings(settings);
    let (handle, scheduler_task) = scheduler.start().await;

    // Wait for Ctrl+C
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    info!("Goodbye!");
    Ok(())
}

fn validate_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    match load(path) {
        Ok((config, jobs)) => {
            info!("Configuration is valid ({:?} storage)", config.storage);
            for job in &jobs {
                info!("  - {}: OK", job.name);
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e)
        }
    }
}

async fn list_jobs(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (config, jobs) = load(path)?;

    println!("Configured jobs:");
    if jobs.is_empty() {
        println!("  (none)");
    }
    for job in &jobs {
        let schedule = &job.schedule;
        let when = if let Some(cron) = &schedule.cron {
            format!("cron '{}'", cron)
        } else if let Some(every) = &schedule.every {
            format!("every {}", every)
        } else if let Some(at) = &schedule.at {
            format!("at {}", at)
        } else if let Some(after) = &schedule.after {
            format!("after {}", after)
        } else {
            "immediately".to_string()
        };
        println!("  - {} [{}], priority {}", job.name, when, job.priority);
    }

    if config.storage == StorageConfig::Memory {
        return Ok(());
    }

    let store = open_store(&config.storage).await?;
    let stored = store.list_jobs(&JobFilter::new()).await?;
    println!();
    println!("Stored jobs:");
    for job in &stored {
        println!(
            "  - {} {} ({}) {} retries {}/{}",
            job.id, job.name, job.job_type, job.status, job.current_retry_count, job.max_retries
        );
        if let Some(err) = &job.error_message {
            println!("      last error: {}", err);
        }
    }
    Ok(())
}

fn admin_for(store: Arc<dyn JobStore>, config: &CadenceConfig) -> Admin {
    Admin::new(store, Arc::new(Notifier::new()))
        .with_stuck_timeout(Duration::from_secs(config.engine.stuck_timeout_secs))
}

fn stuck_timeout(config: &CadenceConfig, timeout_mins: Option<u64>) -> Duration {
    timeout_mins
        .map(|mins| Duration::from_secs(mins * 60))
        .unwrap_or(Duration::from_secs(config.engine.stuck_timeout_secs))
}

async fn show_stats(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (config, _) = load(path)?;
    let store = open_store(&config.storage).await?;
    let stats = admin_for(store, &config).statistics().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn list_stuck(path: &Path, timeout_mins: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let (config, _) = load(path)?;
    let timeout = stuck_timeout(&config, timeout_mins);
    let store = open_store(&config.storage).await?;
    let stuck = admin_for(store, &config).stuck_jobs(timeout).await?;

    if stuck.is_empty() {
        println!("No jobs running longer than {:?}", timeout);
        return Ok(());
    }
    for job in &stuck {
        let started = job
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("  - {} {} started {}", job.id, job.name, started);
    }
    Ok(())
}

async fn reset_stuck(path: &Path, timeout_mins: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let (config, _) = load(path)?;
    let timeout = stuck_timeout(&config, timeout_mins);
    let store = open_store(&config.storage).await?;
    let reset = admin_for(store, &config).reset_stuck_jobs(timeout).await?;
    println!("Reset {} stuck job(s)", reset.len());
    Ok(())
}

async fn cleanup(path: &Path, days: u32) -> Result<(), Box<dyn std::error::Error>> {
    let (config, _) = load(path)?;
    let store = open_store(&config.storage).await?;
    let deleted = admin_for(store, &config).cleanup(days).await?;
    println!("Deleted {} job(s) finished more than {} day(s) ago", deleted, days);
    Ok(())
}
