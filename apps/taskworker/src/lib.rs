//! Taskworker Service
//!
//! One binary, four modes:
//!
//! ```text
//! taskworker run     supervisor: broker (gRPC) → fetch loop → slots → child processes
//! taskworker child   child executor: JSON lines on stdin/stdout, logs on stderr
//! taskworker dev     supervisor against an in-memory broker with demo activations
//! taskworker broker  local gRPC broker over an in-memory store
//! ```
//!
//! The supervisor re-executes its own binary with `child` for every slot,
//! so a handler that hangs or crashes only takes its child down.

pub mod cli;
pub mod tasks;

use axum::Router as HttpRouter;
use cli::{BrokerArgs, Cli, Commands, DevArgs, RunArgs, WorkerArgs};
use core_config::server::HealthServerConfig;
use core_config::taskworker::TaskworkerSettings;
use core_config::tracing::{init_tracing, init_tracing_with_output, LogOutput};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskworker::child::serve_child;
use taskworker::constants::{DEFAULT_OPTIONS_REFRESH_INTERVAL, DEFAULT_TOPIC, ROUTE_OVERRIDES_OPTION};
use taskworker::{
    connect_redis, health_router, metrics, ChildSpawner, GrpcTaskService, GrpcTaskServiceConfig,
    HealthState, InMemoryOptions, InMemoryTaskService, InProcessSpawner, LocalBroker, OptionsStore,
    PendingTaskStore, PolledOptions, ProcessSpawner, RedisAtMostOnceStore, RedisOptionsSource, Router,
    TaskService, TaskWorker, WorkerApp, WorkerConfig,
};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Entry point for every mode.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run_supervisor(args).await,
        Commands::Child => run_child().await,
        Commands::Dev(args) => run_dev(args).await,
        Commands::Broker(args) => run_broker(args).await,
    }
}

/// Start the health and metrics HTTP server
///
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, config: HealthServerConfig) -> Result<()> {
    let app: HttpRouter = health_router(health_state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

fn init_supervisor_observability() -> Result<Environment> {
    let environment = Environment::from_env();
    init_tracing(&environment);
    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;
    Ok(environment)
}

/// Shutdown channel flipped by SIGINT/SIGTERM.
fn spawn_shutdown_handler() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = tx.send(true);
    });
    (shutdown_tx, shutdown_rx)
}

fn spawn_health_server(state: HealthState) -> Result<()> {
    let config = HealthServerConfig::from_env().wrap_err("Failed to load health server configuration")?;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(state, config).await {
            error!(error = %e, "Health server failed");
        }
    });
    Ok(())
}

fn health_state() -> HealthState {
    HealthState::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Build the worker app from environment settings and CLI overrides.
///
/// With `TASKWORKER_REDIS_URL` set, one Redis connection backs both the
/// at-most-once markers and the live route overrides.
async fn build_app(settings: &TaskworkerSettings, args: &WorkerArgs) -> Result<WorkerApp> {
    let registry = tasks::build_registry().wrap_err("Failed to register tasks")?;

    let redis = match &settings.redis_url {
        Some(url) => Some(connect_redis(url).await.wrap_err("Failed to connect to Redis")?),
        None => None,
    };

    let options: Arc<dyn OptionsStore> = match &redis {
        Some(conn) => {
            let polled = Arc::new(PolledOptions::new(
                Arc::new(RedisOptionsSource::new(conn.clone())),
                [ROUTE_OVERRIDES_OPTION],
            ));
            if let Err(e) = polled.refresh().await {
                warn!(error = %e, "Initial options refresh failed, starting without route overrides");
            }
            polled.clone().spawn_refresh(DEFAULT_OPTIONS_REFRESH_INTERVAL);
            info!(interval = ?DEFAULT_OPTIONS_REFRESH_INTERVAL, "Polling route overrides from Redis");
            polled
        }
        None => Arc::new(InMemoryOptions::new()),
    };

    let router = Router::from_settings(settings, options);
    let mut app = WorkerApp::new(registry, router);
    app.set_config(json!({
        "rpc_secret": settings.rpc_secret,
        "at_most_once_ttl_secs": args.at_most_once_ttl_secs,
        "at_most_once_fail_open": args.at_most_once_fail_open,
    }))?;

    if let Some(conn) = redis {
        info!("Using Redis for at-most-once tracking");
        app = app.with_at_most_once_store(Arc::new(RedisAtMostOnceStore::new(conn)));
    }
    Ok(app)
}

fn worker_config(settings: &TaskworkerSettings, args: &WorkerArgs) -> WorkerConfig {
    WorkerConfig::default()
        .with_concurrency(args.concurrency.unwrap_or(settings.concurrency))
        .with_queue_size(args.queue_size)
        .with_namespace(args.namespace.clone().or_else(|| settings.namespace.clone()))
        .with_partition(args.partition)
        .with_max_child_task_count(args.max_child_task_count)
        .with_health_check_file(
            args.health_check_file
                .clone()
                .or_else(|| settings.health_check_file.clone()),
        )
}

fn child_spawner() -> Result<Arc<dyn ChildSpawner>> {
    let spawner = ProcessSpawner::current_exe()
        .wrap_err("Failed to locate the taskworker binary")?
        .with_args(["child"]);
    Ok(Arc::new(spawner))
}

/// Run the supervisor against the configured broker hosts
///
/// 1. Sets up structured logging and metrics
/// 2. Loads settings from the environment, applying CLI overrides
/// 3. Starts the health server
/// 4. Runs the fetch loop until SIGINT/SIGTERM, then drains the slots
async fn run_supervisor(args: RunArgs) -> Result<()> {
    init_supervisor_observability()?;
    let settings = TaskworkerSettings::from_env().wrap_err("Failed to load taskworker configuration")?;

    let app = Arc::new(build_app(&settings, &args.worker).await?);
    let service_config = GrpcTaskServiceConfig::default()
        .with_namespace(args.worker.namespace.clone().or_else(|| settings.namespace.clone()))
        .with_rebalance_after(args.rebalance_after);
    let service = GrpcTaskService::new(
        settings.broker_hosts.clone(),
        app.config().rpc_secret.clone(),
        service_config,
    )?;
    info!(hosts = ?settings.broker_hosts, "Broker client configured");

    let (_shutdown_tx, shutdown_rx) = spawn_shutdown_handler();
    let health = health_state();
    spawn_health_server(health.clone())?;

    let worker = TaskWorker::new(
        app,
        Arc::new(service),
        child_spawner()?,
        worker_config(&settings, &args.worker),
    )
    .with_readiness(health.readiness());
    let stats = worker.run(shutdown_rx).await?;

    info!(?stats, "Taskworker service stopped");
    Ok(())
}

/// Child executor: serve activations from the supervisor until stdin closes.
async fn run_child() -> Result<()> {
    let environment = Environment::from_env();
    init_tracing_with_output(&environment, LogOutput::Stderr);

    // the supervisor decides when a child stops; a terminal Ctrl+C reaches
    // the whole process group
    tokio::spawn(async {
        while signal::ctrl_c().await.is_ok() {
            info!("Child executor ignoring Ctrl+C, waiting for the supervisor");
        }
    });

    let registry = Arc::new(tasks::build_registry().wrap_err("Failed to register tasks")?);
    info!(pid = std::process::id(), "Child executor ready");

    serve_child(registry, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .wrap_err("Child executor protocol failed")?;

    info!(pid = std::process::id(), "Child executor exiting");
    Ok(())
}

/// Supervisor against an in-memory broker seeded with demo activations.
async fn run_dev(args: DevArgs) -> Result<()> {
    init_supervisor_observability()?;
    let settings = TaskworkerSettings::from_env().wrap_err("Failed to load taskworker configuration")?;

    let app = Arc::new(build_app(&settings, &args.worker).await?);
    let service = InMemoryTaskService::default();
    for (taskname, params) in tasks::demo_tasks(args.count) {
        app.send_task(&service, tasks::NAMESPACE, taskname, &params).await?;
    }
    info!(count = args.count, "Seeded demo activations");

    let store = service.store().clone();
    let (shutdown_tx, shutdown_rx) = spawn_shutdown_handler();
    if args.exit_when_idle {
        let store = store.clone();
        tokio::spawn(async move {
            while store.counts().outstanding() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            info!("All demo activations finished");
            let _ = shutdown_tx.send(true);
        });
    }

    let health = health_state();
    spawn_health_server(health.clone())?;

    let spawner: Arc<dyn ChildSpawner> = if args.in_process {
        Arc::new(InProcessSpawner::new(app.registry().clone()))
    } else {
        child_spawner()?
    };
    let mut config = worker_config(&settings, &args.worker);
    if config.namespace.is_none() {
        // fetch from the topic the demo activations were routed to
        config = config.with_namespace(Some(tasks::NAMESPACE.to_string()));
    }
    let service: Arc<dyn TaskService> = Arc::new(service);
    let worker = TaskWorker::new(app, service, spawner, config).with_readiness(health.readiness());
    let stats = worker.run(shutdown_rx).await?;

    let counts = store.counts();
    info!(
        ?stats,
        complete = counts.complete,
        failure = counts.failure,
        pending = counts.pending,
        processing = counts.processing,
        "Dev run finished"
    );
    Ok(())
}

/// Local gRPC broker over an in-memory store.
async fn run_broker(args: BrokerArgs) -> Result<()> {
    let environment = Environment::from_env();
    init_tracing(&environment);
    let settings = TaskworkerSettings::from_env().wrap_err("Failed to load taskworker configuration")?;

    let store = Arc::new(PendingTaskStore::new());
    if args.seed > 0 {
        let registry = tasks::build_registry().wrap_err("Failed to register tasks")?;
        let namespace = registry
            .namespace(tasks::NAMESPACE)
            .ok_or_else(|| eyre::eyre!("namespace {} is not registered", tasks::NAMESPACE))?;
        for (taskname, params) in tasks::demo_tasks(args.seed) {
            store.push(DEFAULT_TOPIC, namespace.create_activation(taskname, &params)?);
        }
        info!(count = args.seed, topic = DEFAULT_TOPIC, "Seeded demo activations");
    }

    if settings.rpc_secret.is_none() {
        warn!("TASKWORKER_RPC_SECRET is not set, the broker accepts unauthenticated calls");
    }
    let broker = LocalBroker::new(store).with_rpc_secret(settings.rpc_secret.clone());

    info!(address = %args.listen, "Broker listening");
    tonic::transport::Server::builder()
        .add_service(broker.into_service())
        .serve_with_shutdown(args.listen, async {
            if let Err(e) = shutdown_signal().await {
                error!("Error waiting for shutdown signal: {}", e);
            }
        })
        .await
        .wrap_err("Broker server failed")?;

    info!("Broker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        sigterm.recv().await;
        Ok::<_, eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
