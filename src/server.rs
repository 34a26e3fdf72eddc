/// Server setup and initialization
///
/// Wires together all components: node type registry, state store, event bus,
/// history, credential lookup, job queue, worker pool and HTTP routes.
/// Provides the main application factory function for creating the Axum app.

use crate::{
    api::{create_api_routes, AppState},
    config::{Config, StateBackend},
    credentials::{CredentialLookup, SqliteCredentialLookup, StaticCredentialLookup},
    events::{
        EventBus, ExecutionEventHandler, ExecutionEventPublisher, ExecutionEventSubscriber,
        ExecutionListenerLifecycleManager, NativeEventBus, RecentEventBuffer, SubscriptionHandle,
        SweeperHandle,
    },
    history::{ExecutionHistory, SqliteExecutionHistory},
    queue::{InMemoryJobQueue, JobQueue, RetryPolicy},
    runtime::{EngineServices, ExecutionWorker, HttpNodeExecutor},
    state::{spawn_reclaimer, ExecutionStateStore, InMemoryStateStore},
    workflow::registry::NodeTypeRegistry,
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Running application: router plus the background tasks it depends on
pub struct App {
    pub router: Router,
    pub worker: Arc<ExecutionWorker>,
    /// Per-execution listeners for in-process observers
    pub listeners: ExecutionListenerLifecycleManager,
    subscription: SubscriptionHandle,
    sweeper: SweeperHandle,
    reclaimer: SweeperHandle,
}

impl App {
    /// Stop the worker gracefully, then the event tasks
    pub async fn shutdown(self) {
        self.worker.stop().await;
        self.subscription.shutdown().await;
        self.sweeper.shutdown().await;
        self.reclaimer.shutdown().await;
        tracing::info!("👋 Background tasks stopped");
    }
}

/// Create the state store selected by configuration
async fn create_state_store(config: &Config) -> Result<Arc<dyn ExecutionStateStore>> {
    match config.state.backend {
        StateBackend::Memory => {
            tracing::info!("🧠 Using in-memory state store");
            Ok(Arc::new(InMemoryStateStore::new(
                config.state.active_ttl(),
                config.state.completion_ttl(),
            )))
        }
        #[cfg(feature = "redis")]
        StateBackend::Redis => {
            let store = crate::state::RedisStateStore::connect(
                &config.state.redis_url,
                config.state.key_prefix.clone(),
                config.state.active_ttl(),
                config.state.completion_ttl(),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect Redis state store: {}", e))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StateBackend::Redis => Err(anyhow::anyhow!(
            "Redis state backend requested but flowrunner was built without the `redis` feature"
        )),
    }
}

/// Create the event bus matching the state backend
fn create_event_bus(config: &Config) -> Result<Arc<dyn EventBus>> {
    match config.state.backend {
        StateBackend::Memory => Ok(Arc::new(NativeEventBus::new())),
        #[cfg(feature = "redis")]
        StateBackend::Redis => {
            let bus = crate::events::RedisEventBus::new(&config.state.redis_url, config.events.channel.clone())
                .map_err(|e| anyhow::anyhow!("Failed to create Redis event bus: {}", e))?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "redis"))]
        StateBackend::Redis => Err(anyhow::anyhow!(
            "Redis event bus requested but flowrunner was built without the `redis` feature"
        )),
    }
}

/// Open the SQLite pool, creating the database directory if needed
async fn open_database(url: &str) -> Result<SqlitePool> {
    let file = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if let Some(parent) = Path::new(file).parent().filter(|p| !p.as_os_str().is_empty()) {
        tracing::info!("📁 Ensuring database directory exists: {}", parent.display());
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Failed to create database directory: {}", e))?;
    }

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database {}: {}", url, e))
}

/// Create the application with all routes and background tasks
pub async fn create_app(config: Config) -> Result<App> {
    // Node type descriptions
    tracing::info!("📚 Initializing node type registry");
    let node_types = if config.runtime.node_types_path.is_empty() {
        tracing::warn!("⚠️ No node types file configured, every node is treated as a data node");
        Arc::new(NodeTypeRegistry::new())
    } else {
        Arc::new(NodeTypeRegistry::load_from_file(&config.runtime.node_types_path)?)
    };

    // Live state and events
    let state = create_state_store(&config).await?;
    let bus = create_event_bus(&config)?;
    let publisher = ExecutionEventPublisher::new(Arc::clone(&bus));

    // History and credentials share one SQLite database
    let (history, credentials): (Option<Arc<dyn ExecutionHistory>>, Arc<dyn CredentialLookup>) =
        if config.database.url.is_empty() {
            tracing::warn!("⚠️ No database configured: history disabled, no credentials resolvable");
            (None, Arc::new(StaticCredentialLookup::new()))
        } else {
            tracing::info!("💾 Initializing execution history and credential lookup");
            let pool = open_database(&config.database.url).await?;
            let history = SqliteExecutionHistory::new(pool.clone());
            history.init_schema().await?;
            let credentials = SqliteCredentialLookup::new(pool);
            credentials.init_schema().await?;
            (Some(Arc::new(history)), Arc::new(credentials))
        };

    // Consumer side: backlog and per-execution listeners
    tracing::info!("📡 Subscribing to execution events on '{}'", config.events.channel);
    let recent_events = Arc::new(RecentEventBuffer::new(
        config.events.buffer_max_events,
        Duration::from_secs(config.events.buffer_ttl_secs),
    ));
    let listeners = ExecutionListenerLifecycleManager::new(Duration::from_secs(config.listeners.max_age_secs));
    let subscriber = Arc::new(ExecutionEventSubscriber::new());
    subscriber.add_handler(Arc::clone(&recent_events) as Arc<dyn ExecutionEventHandler>);
    subscriber.add_handler(Arc::new(listeners.clone()) as Arc<dyn ExecutionEventHandler>);
    let subscription = subscriber.spawn(Arc::clone(&bus));
    let sweeper = listeners.spawn_sweeper(Duration::from_secs(config.listeners.sweep_interval_secs));
    let reclaimer = spawn_reclaimer(
        config.state.reclaim_interval(),
        Arc::clone(&state),
        Arc::clone(&recent_events),
    );

    // Worker pool
    tracing::info!("⚙️ Initializing execution worker");
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new(RetryPolicy {
        attempts: config.queue.attempts,
        backoff_base: Duration::from_millis(config.queue.backoff_base_ms),
    }));
    let services = EngineServices {
        state: Arc::clone(&state),
        publisher,
        node_types,
        credentials,
        history,
        node_timeout: config.worker.node_timeout(),
    };
    let worker = Arc::new(ExecutionWorker::new(services, queue, config.worker.concurrency));
    worker
        .initialize(Arc::new(HttpNodeExecutor::new(config.runtime.node_executor_url.clone())))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize worker: {}", e))?;
    worker
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start worker: {}", e))?;

    // Create the main application router
    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_api_routes(AppState {
            state,
            recent_events,
            worker: Arc::clone(&worker),
        }));

    tracing::info!("✅ Application initialized successfully");

    Ok(App {
        router,
        worker,
        listeners,
        subscription,
        sweeper,
        reclaimer,
    })
}

/// Start the HTTP server with the given configuration
///
/// Serves until Ctrl-C, then drains in-flight jobs before returning.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowrunner worker...");

    let app = create_app(config.clone()).await?;

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.router.clone().into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("🛑 Shutdown signal received");
        })
        .await?;

    app.shutdown().await;
    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
