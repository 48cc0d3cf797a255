use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aiperf::RunConfig;
use aiperf::comms::ProxyBroker;
use aiperf::controller::{LaunchMode, SystemController, exit_code};
use aiperf::dataset::DatasetManagerService;
use aiperf::records::{RecordProcessorService, RecordsManagerService};
use aiperf::service::{Service, ServiceContext, ServiceRunner};
use aiperf::telemetry::TelemetryManagerService;
use aiperf::timing::TimingManagerService;
use aiperf::workers::WorkerService;

#[derive(Parser)]
#[command(name = "aiperf", about = "Distributed benchmark driver for LLM inference endpoints")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a profiling benchmark.
    Profile {
        /// Path to the run configuration (JSON with `service` and `user`
        /// sections).
        #[arg(long)]
        config: PathBuf,
        /// Spawn each service as a child OS process instead of an
        /// in-process task.
        #[arg(long)]
        subprocess: bool,
    },
    /// Run a single service process (spawned by the controller).
    #[command(hide = true)]
    Service {
        kind: ServiceKind,
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ServiceKind {
    Broker,
    TimingManager,
    DatasetManager,
    Worker,
    RecordProcessor,
    RecordsManager,
    TelemetryManager,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aiperf=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_run_config(path: &PathBuf) -> anyhow::Result<RunConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Profile { config, subprocess } => run_profile(config, subprocess).await,
        Command::Service { kind, config } => run_service(kind, config).await,
    };
    std::process::exit(code);
}

async fn run_profile(config: PathBuf, subprocess: bool) -> i32 {
    let run_config = match load_run_config(&config) {
        Ok(run_config) => run_config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return 2;
        }
    };

    let launch_mode = if subprocess {
        LaunchMode::Subprocess
    } else {
        LaunchMode::InProcess
    };
    let controller = SystemController::new(run_config.service, run_config.user)
        .with_launch_mode(launch_mode);

    // Ctrl-c cancels the run; in-flight work is drained and partial
    // results still come back.
    let cancel = controller.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = controller.run().await;
    if let Err(e) = &outcome {
        tracing::error!(error = %e, "profiling run failed");
    }
    exit_code(&outcome)
}

async fn run_service(kind: ServiceKind, config: PathBuf) -> i32 {
    let run_config = match load_run_config(&config) {
        Ok(run_config) => run_config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return 2;
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let result = match kind {
        ServiceKind::Broker => {
            ProxyBroker::new(run_config.service.comms.clone(), cancel)
                .run()
                .await
        }
        ServiceKind::TimingManager => {
            run_one(
                TimingManagerService::new(run_config.user.clone()),
                run_config.service,
                cancel,
            )
            .await
        }
        ServiceKind::DatasetManager => {
            match DatasetManagerService::new(run_config.user.conversations.clone()) {
                Ok(service) => run_one(service, run_config.service, cancel).await,
                Err(e) => Err(e),
            }
        }
        ServiceKind::Worker => match WorkerService::new(run_config.user.clone()) {
            Ok(service) => run_one(service, run_config.service, cancel).await,
            Err(e) => Err(e),
        },
        ServiceKind::RecordProcessor => {
            run_one(
                RecordProcessorService::new(run_config.user.clone(), None),
                run_config.service,
                cancel,
            )
            .await
        }
        ServiceKind::RecordsManager => {
            run_one(
                RecordsManagerService::new(run_config.user.clone()),
                run_config.service,
                cancel,
            )
            .await
        }
        ServiceKind::TelemetryManager => {
            run_one(
                TelemetryManagerService::new(run_config.user.clone()),
                run_config.service,
                cancel,
            )
            .await
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "service failed");
            1
        }
    }
}

async fn run_one<S: Service>(
    service: S,
    service_config: aiperf::ServiceConfig,
    cancel: CancellationToken,
) -> aiperf::Result<()> {
    let ctx = ServiceContext::create(service.service_type(), service_config, cancel).await?;
    ServiceRunner::new(Arc::new(service), ctx).run().await
}
