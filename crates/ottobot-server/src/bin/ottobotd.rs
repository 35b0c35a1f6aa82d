use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ottobot_sandbox::docker::DockerConfig;
use ottobot_sandbox::{DockerSupervisor, Supervisor, UnavailableSupervisor};
use ottobot_server::reapers::{
    spawn_port_reaper, spawn_sandbox_reaper, RECLAIM_INTERVAL, SANDBOX_REAP_INTERVAL,
    SANDBOX_STALE_AGE,
};
use ottobot_server::worker::new_worker_id;
use ottobot_server::{
    build_router, AppState, Config, EchoAgentFactory, Lifecycle, LifecycleConfig, WorkerConfig,
    WorkerRuntime, DEFAULT_API_PORT,
};
use ottobot_session::{
    MessageFabric, PortAllocator, PortKind, PortRange, SessionRegistry, WorkQueue,
};
use ottobot_store::{MemoryStore, ReliableStore, Store};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// HTTP gateway only.
    Api,
    /// Job worker only.
    Worker,
    /// Gateway and worker in one process.
    All,
}

#[derive(Parser, Debug)]
#[command(name = "ottobotd", author, version, about = "ottobot session orchestration plane")]
struct Options {
    /// Process role.
    #[arg(long, value_enum, default_value = "all", env = "MODE")]
    mode: Mode,
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0", env = "API_HOST")]
    host: String,
    /// Port for the HTTP server
    #[arg(long, default_value_t = DEFAULT_API_PORT, env = "API_PORT")]
    port: u16,
    /// Host clients use to reach published sandbox ports
    #[arg(long, default_value = "localhost", env = "PUBLIC_HOST")]
    public_host: String,

    /// Coordination store host (reserved for a networked Store backend)
    #[arg(long, default_value = "localhost", env = "STORE_HOST")]
    store_host: String,
    /// Coordination store port
    #[arg(long, default_value_t = 6379, env = "STORE_PORT")]
    store_port: u16,
    /// Coordination store password
    #[arg(long, env = "STORE_PASSWORD", hide_env_values = true)]
    store_password: Option<String>,

    /// Parallel job handlers per worker
    #[arg(long, default_value_t = 2, env = "WORKER_CONCURRENCY")]
    worker_concurrency: usize,
    /// Soft cap on sessions per worker
    #[arg(long, default_value_t = 10, env = "MAX_SESSIONS_PER_WORKER")]
    max_sessions_per_worker: usize,
    /// Session TTL in seconds
    #[arg(long, default_value_t = 3600, env = "SESSION_TIMEOUT")]
    session_timeout: u64,

    #[arg(long, default_value_t = 6080, env = "DESKTOP_PORT_RANGE_START")]
    desktop_port_range_start: u16,
    #[arg(long, default_value_t = 6200, env = "DESKTOP_PORT_RANGE_END")]
    desktop_port_range_end: u16,
    #[arg(long, default_value_t = 8080, env = "TOOL_PORT_RANGE_START")]
    tool_port_range_start: u16,
    #[arg(long, default_value_t = 8200, env = "TOOL_PORT_RANGE_END")]
    tool_port_range_end: u16,

    /// Memory cap per sandbox container
    #[arg(long, default_value = "2g", env = "CONTAINER_MEMORY_LIMIT")]
    container_memory_limit: String,
    /// CPU shares per sandbox container
    #[arg(long, default_value_t = 1024, env = "CONTAINER_CPU_LIMIT")]
    container_cpu_limit: u32,
    /// Docker network sandboxes attach to
    #[arg(long, env = "CONTAINER_NETWORK")]
    container_network: Option<String>,
    /// Sandbox image without the environment tag
    #[arg(long, default_value = "ottobot/agent", env = "AGENT_IMAGE")]
    agent_image: String,
    /// Host directory holding per-session workspaces
    #[arg(long, default_value = "/var/lib/ottobot", env = "OTTOBOT_DATA_DIR")]
    data_dir: PathBuf,

    /// Comma-separated allowed CORS origins; `*` allows any
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,
    /// `text` or `json`
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
    /// Directory for rolling log files; stdout-only when unset
    #[arg(long, env = "OTTOBOT_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(&options);

    run(options).await
}

fn init_tracing(options: &Options) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.clone()));
    let json = options.log_format.eq_ignore_ascii_case("json");

    let mut guard = None;
    let file_layer = options.log_dir.as_ref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Failed to create log directory {dir:?}: {e}. Logging to file disabled.");
            return None;
        }
        let appender = tracing_appender::rolling::daily(dir, "ottobotd.log");
        let (non_blocking, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_target(false)
                .with_ansi(false),
        )
    });

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
    guard
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for interrupt");
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    cancel.cancel();
}

async fn run(options: Options) -> anyhow::Result<()> {
    if options.desktop_port_range_start > options.desktop_port_range_end
        || options.tool_port_range_start > options.tool_port_range_end
    {
        anyhow::bail!("port range start must not exceed its end");
    }
    if options.desktop_port_range_start <= options.tool_port_range_end
        && options.tool_port_range_start <= options.desktop_port_range_end
    {
        anyhow::bail!("desktop and tool port ranges must be disjoint");
    }

    let config = Arc::new(Config {
        api_host: options.host.clone(),
        api_port: options.port,
        public_host: options.public_host.clone(),
        worker_concurrency: options.worker_concurrency.max(1),
        max_sessions_per_worker: options.max_sessions_per_worker,
        session_timeout: Duration::from_secs(options.session_timeout),
        desktop_ports: PortRange::new(
            options.desktop_port_range_start,
            options.desktop_port_range_end,
        ),
        tool_ports: PortRange::new(options.tool_port_range_start, options.tool_port_range_end),
        cors_origins: options.cors_origins.clone(),
    });

    // The process-local backend behind the retrying adapter. A networked
    // Store implementation plugs in here; STORE_HOST/PORT/PASSWORD are
    // accepted so deployments keep their wiring.
    tracing::debug!(
        store_host = %options.store_host,
        store_port = options.store_port,
        has_password = options.store_password.is_some(),
        "store connection configured; in-process backend active"
    );
    let store: Arc<dyn Store> =
        Arc::new(ReliableStore::with_defaults(Arc::new(MemoryStore::new())));

    let registry = SessionRegistry::new(store.clone(), config.session_timeout);
    let fabric = MessageFabric::new(store.clone());
    let queue = WorkQueue::new(store.clone());
    let desktop_ports =
        PortAllocator::new(store.clone(), PortKind::Desktop, config.desktop_ports);
    let tool_ports = PortAllocator::new(store.clone(), PortKind::Tool, config.tool_ports);

    let supervisor = build_supervisor(&options);
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let worker = if options.mode != Mode::Api {
        let worker_id = new_worker_id();
        let lifecycle = Arc::new(Lifecycle::new(
            worker_id.clone(),
            registry.clone(),
            fabric.clone(),
            queue.clone(),
            desktop_ports.clone(),
            tool_ports.clone(),
            supervisor.clone(),
            Arc::new(EchoAgentFactory::new()),
            config.public_host.clone(),
            LifecycleConfig::default(),
        ));
        let runtime = Arc::new(WorkerRuntime::new(
            worker_id,
            store.clone(),
            queue.clone(),
            lifecycle,
            WorkerConfig {
                concurrency: config.worker_concurrency,
                max_sessions: config.max_sessions_per_worker,
                ..Default::default()
            },
        ));
        let parent_cancel = cancel.clone();
        let worker_cancel = runtime.cancellation_token();
        tokio::spawn(async move {
            parent_cancel.cancelled().await;
            worker_cancel.cancel();
        });
        let runtime_for_task = runtime.clone();
        Some(tokio::spawn(async move {
            if let Err(error) = runtime_for_task.run().await {
                tracing::error!(%error, "worker runtime failed");
            }
        }))
    } else {
        None
    };

    if options.mode != Mode::Worker {
        spawn_port_reaper(
            registry.clone(),
            desktop_ports.clone(),
            RECLAIM_INTERVAL,
            cancel.clone(),
        );
        spawn_port_reaper(
            registry.clone(),
            tool_ports.clone(),
            RECLAIM_INTERVAL,
            cancel.clone(),
        );
        spawn_sandbox_reaper(
            supervisor.clone(),
            SANDBOX_REAP_INTERVAL,
            SANDBOX_STALE_AGE,
            cancel.clone(),
        );

        let state = AppState {
            config: config.clone(),
            store: store.clone(),
            registry: registry.clone(),
            fabric: fabric.clone(),
            queue: queue.clone(),
            desktop_ports: desktop_ports.clone(),
            tool_ports: tool_ports.clone(),
            supervisor: supervisor.clone(),
            http: reqwest::Client::new(),
            started_at: Instant::now(),
        };
        let app = build_router(state);

        let addr = SocketAddr::new(parse_bind_ip(&config.api_host), config.api_port);
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("ottobotd listening on http://{addr} (mode: {:?})", options.mode);

        let serve_cancel = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
            .await?;
    }

    if let Some(worker) = worker {
        // In combined mode the gateway has already exited; stop the worker
        // too. In worker-only mode this task runs until a signal cancels it.
        if options.mode == Mode::All {
            cancel.cancel();
        }
        if let Err(error) = worker.await {
            tracing::error!(%error, "worker task join failed");
        }
    }

    tracing::info!("ottobotd stopped");
    Ok(())
}

fn parse_bind_ip(bind: &str) -> IpAddr {
    match bind.parse() {
        Ok(ip) => ip,
        Err(error) => {
            tracing::error!(
                ?error,
                %bind,
                "invalid bind address; defaulting to 0.0.0.0"
            );
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }
}

fn build_supervisor(options: &Options) -> Arc<dyn Supervisor> {
    let docker_config = DockerConfig {
        data_root: options.data_dir.clone(),
        probe_host: options.public_host.clone(),
        image_base: options.agent_image.clone(),
        network: options.container_network.clone(),
        memory_limit: options.container_memory_limit.clone(),
        cpu_shares: options.container_cpu_limit,
    };
    match DockerSupervisor::new(docker_config) {
        Ok(supervisor) => Arc::new(supervisor),
        Err(error) => {
            tracing::error!(
                %error,
                "failed to initialize docker supervisor; running in degraded mode"
            );
            Arc::new(UnavailableSupervisor::new(error.to_string()))
        }
    }
}
