use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;

use job_engine::action::builtin_registry;
use job_engine::config::{
    random_name, ApiConfig, CoordinationConfig, DistributorConfig, EngineConfig, ExecutorConfig,
    LoggingConfig,
};
use job_engine::coordination::{LeaderElection, LocalCoordinator, LockingQueue, ZkCoordinator};
use job_engine::distributor::{builtin_generator, Distributor, JobGenerator};
use job_engine::error::EngineError;
use job_engine::executor::Executor;
use job_engine::logging;
use job_engine::shutdown::install_shutdown_handler;
use job_engine::store::{HttpResourceStore, ResourceStore};

/// Exit status for errors that prevent the process from starting.
const STARTUP_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "job-engine")]
#[command(version)]
#[command(about = "Distributes and executes jobs stored in a resource API")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an executor pool and/or distributors
    Run(RunArgs),

    /// List the built-in actions
    Actions,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Base name for this process (random when omitted)
    #[arg(long)]
    name: Option<String>,

    /// Number of worker tasks to start (0 disables the executor)
    #[arg(long, default_value = "1")]
    threads: usize,

    /// Distribute jobs of this type (repeatable)
    #[arg(long = "distribute", value_name = "JOB_TYPE")]
    distribute: Vec<String>,

    // === Resource API ===
    /// Resource API endpoint
    #[arg(long, default_value = "https://nuv.la")]
    api_url: String,

    /// Resource API username
    #[arg(long, env = "JOB_ENGINE_API_USER")]
    api_user: Option<String>,

    /// Resource API password
    #[arg(long, env = "JOB_ENGINE_API_PASS", hide_env_values = true)]
    api_pass: Option<String>,

    /// Do not verify the API server certificate
    #[arg(long)]
    insecure: bool,

    // === Coordination ===
    /// ZooKeeper hosts (host:port[,host:port...]). Without it every role runs
    /// against an in-process coordinator and only this process takes part.
    #[arg(long, env = "JOB_ENGINE_ZK_HOSTS")]
    zk_hosts: Option<String>,

    /// Seconds an unrenewed checkout stays invisible before it is redelivered
    /// (in-process coordinator only)
    #[arg(long, default_value = "60")]
    checkout_timeout_secs: u64,

    // === Logging ===
    /// Directory for daily rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl RunArgs {
    fn into_config(self) -> EngineConfig {
        let mut api = ApiConfig::default().with_endpoint(self.api_url);
        api.username = self.api_user;
        api.password = self.api_pass;
        api.insecure = self.insecure;

        EngineConfig {
            name: self.name.unwrap_or_else(random_name),
            executor: ExecutorConfig::default().with_worker_count(self.threads),
            distributors: self
                .distribute
                .into_iter()
                .map(DistributorConfig::new)
                .collect(),
            api,
            coordination: CoordinationConfig {
                zk_hosts: self.zk_hosts,
                checkout_timeout: Duration::from_secs(self.checkout_timeout_secs),
                ..CoordinationConfig::default()
            },
            logging: LoggingConfig {
                log_dir: self.log_dir,
                ..LoggingConfig::default()
            },
        }
    }
}

// =============================================================================
// Run
// =============================================================================

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    config.validate()?;

    let registry = Arc::new(builtin_registry()?);
    let generators = config
        .distributors
        .iter()
        .map(|d| Ok((d.clone(), builtin_generator(&d.job_type)?)))
        .collect::<Result<Vec<(DistributorConfig, Arc<dyn JobGenerator>)>, EngineError>>()?;

    let store = HttpResourceStore::new(&config.api).context("failed to build API client")?;
    let (username, password) = config
        .api
        .credentials()
        .ok_or_else(|| EngineError::Config("API credentials missing".into()))?;
    store
        .login(username, password)
        .await
        .map_err(|e| EngineError::Authentication(e.to_string()))?;
    let store: Arc<dyn ResourceStore> = Arc::new(store);

    let shutdown = install_shutdown_handler();
    let mut tasks = JoinSet::new();

    // With ZooKeeper the resource API enqueues new jobs itself; the
    // in-process queue is only fed by this process's distributors.
    let session_lost = tokio_util::sync::CancellationToken::new();
    let (election, queue, enqueue): (Arc<dyn LeaderElection>, Arc<dyn LockingQueue>, bool) =
        match &config.coordination.zk_hosts {
            Some(hosts) => {
                let coordinator = ZkCoordinator::connect(hosts)
                    .await
                    .context("failed to connect to ZooKeeper")?;
                let queue = coordinator.queue(&config.executor.queue_path).await?;

                let watched = coordinator.clone();
                let shutdown = shutdown.clone();
                let session_lost = session_lost.clone();
                tasks.spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        state = watched.session_ended() => {
                            tracing::error!(state = ?state, "ZooKeeper session ended, shutting down");
                            session_lost.cancel();
                            shutdown.cancel();
                        }
                    }
                });
                (coordinator as Arc<dyn LeaderElection>, queue as Arc<dyn LockingQueue>, false)
            }
            None => {
                let coordinator = LocalCoordinator::new(config.coordination.clone());
                let queue = coordinator.queue(&config.executor.queue_path);
                (coordinator as Arc<dyn LeaderElection>, queue as Arc<dyn LockingQueue>, true)
            }
        };

    tracing::info!(
        name = %config.name,
        workers = config.executor.worker_count,
        distributors = config.distributors.len(),
        endpoint = %config.api.endpoint,
        zk_hosts = ?config.coordination.zk_hosts,
        "Starting job engine"
    );

    if config.executor.worker_count > 0 {
        let executor = Executor::new(
            config.executor.clone(),
            config.name.clone(),
            queue.clone(),
            store.clone(),
            registry,
        );
        tasks.spawn(executor.run(shutdown.clone()));
    }

    for (distributor_config, generator) in generators {
        let mut distributor = Distributor::new(
            distributor_config,
            &config.name,
            generator,
            store.clone(),
            election.clone(),
        );
        if enqueue {
            distributor = distributor.with_queue(queue.clone());
        }
        let shutdown = shutdown.clone();
        tasks.spawn(async move { distributor.run(shutdown).await });
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Engine task ended abnormally");
        }
    }

    if session_lost.is_cancelled() {
        anyhow::bail!("coordination session lost");
    }
    tracing::info!(name = %config.name, "Job engine stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            let config = run_args.into_config();
            let _guard = match logging::init(&config.logging) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("job-engine: {:#}", e);
                    return ExitCode::from(STARTUP_FAILURE);
                }
            };

            match run(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    let error = format!("{:#}", e);
                    tracing::error!(error = %error, "Fatal error, exiting");
                    ExitCode::from(STARTUP_FAILURE)
                }
            }
        }
        Commands::Actions => match builtin_registry() {
            Ok(registry) => {
                for name in registry.names() {
                    println!("{}", name);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("job-engine: {}", e);
                ExitCode::from(STARTUP_FAILURE)
            }
        },
    }
}
