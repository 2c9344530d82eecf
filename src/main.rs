use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use autodemo::{
    api::{self, ApiHandle, WorkerClient},
    config::{Config, PkiPaths},
    control,
    jobs::JobStore,
    logging,
    pki::{self, CertificateAuthority},
    proxy::ProxyManager,
    recorder::RecorderState,
    session::{LocalSink, ProjectSink, SessionGate},
    stages::ArtifactStage,
    worker::Worker,
};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "autodemo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run capture proxies, the control API and, without a remote worker, the job worker.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Run only the job store, the worker API and the worker loop.
    Worker {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Manage the interception certificate authority.
    Pki {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        action: PkiCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum PkiCommand {
    /// Create or load the CA and end-entity keys and print their location.
    Init,
    /// Copy the CA certificate for installation in client trust stores.
    Export {
        #[arg(long)]
        out: PathBuf,
        /// Overwrite an existing file at `--out`.
        #[arg(long)]
        force: bool,
    },
}

/// Job store, worker API and worker loop running in this process.
struct WorkerRuntime {
    sink: LocalSink,
    api: ApiHandle,
    worker: JoinHandle<()>,
}

impl WorkerRuntime {
    async fn start(config: &Config, cancel: CancellationToken) -> anyhow::Result<Self> {
        let db_path = config.worker.db_path();
        let store = JobStore::open(db_path.clone(), config.worker.busy_timeout())
            .with_context(|| format!("open job store {}", db_path.display()))?;
        let sink = LocalSink::new(store.clone());
        let api = api::serve_worker_api(config.worker.listen, sink.clone()).await?;

        let worker = Worker::new(
            store,
            Arc::new(ArtifactStage::new(config.worker.hooks.clone())),
        );
        let worker = tokio::spawn(async move { worker.run(cancel).await });

        Ok(Self { sink, api, worker })
    }

    async fn shutdown(self) {
        self.api.shutdown().await;
        if let Err(err) = self.worker.await {
            tracing::error!("worker task failed: {err}");
        }
    }
}

async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let pki_paths = config.pki_paths()?;
    let ca = CertificateAuthority::bootstrap(&pki_paths)
        .context("bootstrap certificate authority")?;
    let cancel = CancellationToken::new();

    let (sink, worker_runtime): (Arc<dyn ProjectSink>, Option<WorkerRuntime>) =
        match config.session.worker_url.as_deref() {
            Some(worker_url) => (Arc::new(WorkerClient::new(worker_url)), None),
            None => {
                let runtime = WorkerRuntime::start(config, cancel.clone()).await?;
                (Arc::new(runtime.sink.clone()), Some(runtime))
            }
        };

    let recorder_state = Arc::new(RecorderState::new());
    let gate = Arc::new(SessionGate::new(
        sink,
        config.worker.projects_dir(),
        Arc::clone(&recorder_state),
    ));
    let proxies = Arc::new(
        ProxyManager::new(Arc::new(ca), gate.clone(), recorder_state)
            .context("build proxy manager")?,
    );
    for spec in &config.proxies {
        // Failures stay visible through the proxy list.
        let _ = proxies.create_proxy(spec.clone()).await;
    }
    let control_api = control::serve_control_api(
        config.control.listen,
        Arc::clone(&proxies),
        Arc::clone(&gate),
    )
    .await?;

    eprintln!(
        "{}",
        startup_summary(
            config,
            &pki_paths,
            control_api.listen_addr,
            worker_runtime.as_ref().map(|runtime| runtime.api.listen_addr),
        )
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();

    if let Err(err) = proxies.shutdown(SHUTDOWN_DEADLINE).await {
        tracing::error!("proxy shutdown: {err}");
    }
    control_api.shutdown().await;
    if let Some(runtime) = worker_runtime {
        runtime.shutdown().await;
    }
    Ok(())
}

async fn run_worker(config: &Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let runtime = WorkerRuntime::start(config, cancel.clone()).await?;
    eprintln!(
        "worker: api_listen={}, db_path={}, projects_dir={}",
        runtime.api.listen_addr,
        config.worker.db_path().display(),
        config.worker.projects_dir().display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for ctrl-c")?;
    cancel.cancel();
    runtime.shutdown().await;
    Ok(())
}

fn run_pki_command(config: &Config, command: PkiCommand) -> anyhow::Result<()> {
    let paths = config.pki_paths()?;
    match command {
        PkiCommand::Init => {
            let ca = CertificateAuthority::bootstrap(&paths)
                .context("bootstrap certificate authority")?;
            println!("ca_key={}", paths.ca_key.display());
            println!("ca_cert={}", paths.ca_cert.display());
            println!("ee_key={}", paths.ee_key.display());
            println!("sha256={}", ca.fingerprint());
        }
        PkiCommand::Export { out, force } => {
            pki::export_ca_cert(&paths.ca_cert, &out, force)?;
            println!("exported CA certificate to {}", out.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            run_serve(&config).await?;
        }
        Command::Worker { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            run_worker(&config).await?;
        }
        Command::Pki { config, action } => {
            let config = Config::load(config.as_deref())?;
            run_pki_command(&config, action)?;
        }
    }

    Ok(())
}

fn startup_summary(
    config: &Config,
    pki_paths: &PkiPaths,
    control_listen_addr: std::net::SocketAddr,
    worker_listen_addr: Option<std::net::SocketAddr>,
) -> String {
    let sink = match (config.session.worker_url.as_deref(), worker_listen_addr) {
        (Some(worker_url), _) => format!("remote({worker_url})"),
        (None, Some(addr)) => format!("local(api={addr})"),
        (None, None) => "none".to_owned(),
    };

    format!(
        "startup config: control_listen={}, proxies={}, projects_dir={}, sink={}, ca_cert={}",
        control_listen_addr,
        config.proxies.len(),
        config.worker.projects_dir().display(),
        sink,
        pki_paths.ca_cert.display()
    )
}
