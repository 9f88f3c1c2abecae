use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{Builder, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use oscar_engine::{EventBroadcaster, Orchestrator};
use oscar_host::{server, service::ExecutionService, Cli, HostState};
use oscar_lib::RiskClassifier;
use oscar_sandbox::{DockerCliDriver, SandboxDriver};
use oscar_store::{CredentialVault, InMemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut opts = Cli::parse();
    if opts.config_path.exists() {
        opts.merge_from_file()?;
    }

    let _guard = subscribe_log(&opts.log_path, &opts.log_level, opts.max_log);
    debug!("Args:\n{:#?}", opts);

    let store = Arc::new(InMemoryStore::new());
    let vault = Arc::new(CredentialVault::new(&opts.encryption_secret));
    let sandbox: Arc<dyn SandboxDriver> =
        Arc::new(DockerCliDriver::new(&opts.docker_bin, &opts.sandbox_image));
    let broadcaster = Arc::new(EventBroadcaster::new());

    let orchestrator = Orchestrator::new(
        store.clone(),
        store.clone(),
        vault.clone(),
        sandbox,
        broadcaster.clone(),
        opts.orchestrator_config(),
    );
    orchestrator.serve().await;

    let classifier = RiskClassifier::new(opts.important_tables.clone().unwrap_or_default());
    let service = Arc::new(ExecutionService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        vault,
        orchestrator.clone(),
        classifier,
    ));

    let state = HostState {
        opts: Arc::new(opts.clone()),
        service,
        broadcaster,
        orchestrator: orchestrator.clone(),
    };

    server::serve(state, &opts.address).await?;

    info!("draining running executions");
    if let Err(err) = orchestrator.shutdown().await {
        warn!(%err, "shutdown was not clean");
    }
    Ok(())
}

fn subscribe_log(
    log_path: &Option<PathBuf>,
    log_level: &str,
    max_log: usize,
) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(env_filter);

    match log_path {
        Some(dir) => {
            let appender = Builder::new()
                .rotation(Rotation::DAILY)
                .filename_prefix("oscar.log")
                .max_log_files(max_log)
                .build(dir)
                .expect("failed to initialize rolling log appender");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")));
            tracing_subscriber::registry()
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stdout_layer).init();
            None
        }
    }
}
