use axum::routing::get;
use axum::Router;
use matchdata_engine::bridge::{ws, BridgeConfig, FanoutBridge};
use matchdata_engine::config::{Config, RuntimeSettings, SettingsHandle};
use matchdata_engine::frames::FrameAggregator;
use matchdata_engine::ingest::LiveIngestLoop;
use matchdata_engine::metrics::Counters;
use matchdata_engine::sched::{JobContext, Scheduler};
use matchdata_engine::store::TickStore;
use matchdata_engine::upstream::ratelimit::{RateGovernor, RateLimits};
use matchdata_engine::upstream::{RetryPolicy, UpstreamClient};
use matchdata_engine::{api, EngineState};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

// Exit codes: 0 normal shutdown, 1 fatal init failure, 2 unrecoverable
// dependency loss.
const EXIT_OK: i32 = 0;
const EXIT_INIT: i32 = 1;
const EXIT_DEPENDENCY: i32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenvy::dotenv().ok();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    info!("🚀 Starting matchdata engine...");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Configuration error: {}", e);
            return EXIT_INIT;
        }
    };
    info!("📋 Configuration loaded (upstream key present, masked)");

    info!("🔌 Connecting to Postgres...");
    let pool = match PgPoolOptions::new()
        .max_connections(config.pool_max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!("❌ Postgres connection failed: {}", e);
            return EXIT_INIT;
        }
    };
    info!("✅ Connected to Postgres");

    let counters = Arc::new(Counters::default());
    let store = Arc::new(TickStore::new(pool, counters.clone()));
    if let Err(e) = store.ensure_schema().await {
        error!("❌ Schema setup failed: {}", e);
        return EXIT_INIT;
    }

    let governor = Arc::new(RateGovernor::new(RateLimits {
        max_rps: config.max_rps,
        max_rpm: config.max_rpm,
        max_rpd: config.max_rpd,
        acquire_timeout: config.rate_acquire_timeout,
    }));
    let upstream = match UpstreamClient::new(
        config.upstream_base_url.clone(),
        config.upstream_key.clone(),
        config.request_timeout,
        governor,
        RetryPolicy {
            attempts: config.retry_attempts,
            base_delay: config.retry_delay,
            max_backoff: config.max_backoff,
        },
        counters.clone(),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("❌ Upstream client setup failed: {}", e);
            return EXIT_INIT;
        }
    };

    let settings = SettingsHandle::new(RuntimeSettings::from_env());
    if config.bus_dsn.is_some() {
        info!("📡 BUS_DSN set; ignored in single-process deployment (in-memory fan-out)");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (notes_tx, notes_rx) = mpsc::channel(1024);

    let frames = Arc::new(FrameAggregator::new(store.clone(), counters.clone()));
    let ingest = Arc::new(LiveIngestLoop::new(
        upstream.clone(),
        store.clone(),
        frames.clone(),
        notes_tx,
        settings.clone(),
        counters.clone(),
        config.live_workers,
        config.consec_fail_limit,
        config.pull_cooldown,
    ));
    let bridge = Arc::new(FanoutBridge::new(
        store.clone(),
        counters.clone(),
        BridgeConfig {
            ring_capacity: config.ring_capacity,
            horizon: config.catchup_horizon,
            slow_timeout: config.slow_consumer_timeout,
        },
    ));
    tokio::spawn(bridge.clone().run(notes_rx, shutdown_rx.clone()));

    let (scheduler, consumers) = Scheduler::new(
        JobContext {
            upstream: upstream.clone(),
            store: store.clone(),
            ingest: ingest.clone(),
            frames: frames.clone(),
            settings: settings.clone(),
        },
        counters.clone(),
    );
    if let Err(e) = scheduler.load_catalog().await {
        error!("❌ Job catalog load failed: {}", e);
        return EXIT_INIT;
    }
    scheduler.spawn_workers(consumers, shutdown_rx.clone());
    tokio::spawn(scheduler.clone().run_dispatcher(shutdown_rx.clone()));

    spawn_pool_watchdog(store.clone(), config.pool_max_connections);
    spawn_dependency_watchdog(store.clone(), upstream.clone(), config.fatal_timeout);

    let state = Arc::new(EngineState {
        config: config.clone(),
        settings,
        counters,
        store,
        upstream,
        ingest,
        frames,
        bridge,
        scheduler: scheduler.clone(),
    });

    let app = Router::new()
        .merge(api::routes())
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("❌ Failed to bind {}: {}", addr, e);
            return EXIT_INIT;
        }
    };
    info!("🌐 Operator and subscriber server on {}", addr);
    info!("✅ matchdata engine is ready");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });
    if let Err(e) = serve.await {
        error!("server error: {}", e);
        let _ = shutdown_tx.send(true);
        return EXIT_DEPENDENCY;
    }

    // Graceful drain: no new dispatches, running work finishes, the bridge
    // flushes what is already queued.
    let _ = shutdown_tx.send(true);
    drain(&scheduler, config.drain_timeout).await;
    info!("👋 Shutdown complete");
    EXIT_OK
}

/// Wait until every queue is empty or the drain window closes.
async fn drain(scheduler: &Scheduler, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let pending: usize = scheduler.queue_depths().iter().map(|(_, d)| d).sum();
        if pending == 0 {
            break;
        }
        if Instant::now() >= deadline {
            warn!("drain window closed with {} queued messages", pending);
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Log when pool utilization stays above 80 % for more than 30 s.
fn spawn_pool_watchdog(store: Arc<TickStore>, max_connections: u32) {
    tokio::spawn(async move {
        let mut over_since: Option<Instant> = None;
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            let pool = store.pool();
            let busy = pool.size().saturating_sub(pool.num_idle() as u32);
            let over = max_connections > 0 && busy * 100 > max_connections * 80;
            match (over, over_since) {
                (true, None) => over_since = Some(Instant::now()),
                (true, Some(since)) if since.elapsed() >= Duration::from_secs(30) => {
                    warn!(
                        "connection pool hot: {}/{} busy for over 30 s",
                        busy, max_connections
                    );
                    over_since = Some(Instant::now());
                }
                (false, _) => over_since = None,
                _ => {}
            }
        }
    });
}

/// Exit with code 2 when the database or the upstream stays unreachable
/// beyond the fatal window.
fn spawn_dependency_watchdog(
    store: Arc<TickStore>,
    upstream: Arc<UpstreamClient>,
    fatal_timeout: Duration,
) {
    tokio::spawn(async move {
        let fatal_ms = fatal_timeout.as_millis() as i64;
        let started_ms = chrono::Utc::now().timestamp_millis();
        let mut db_down_since: Option<Instant> = None;
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            tick.tick().await;

            match tokio::time::timeout(Duration::from_secs(5), store.ping()).await {
                Ok(Ok(())) => db_down_since = None,
                _ => {
                    let since = *db_down_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= fatal_timeout {
                        error!("database unreachable for over {:?}; exiting", fatal_timeout);
                        std::process::exit(EXIT_DEPENDENCY);
                    }
                }
            }

            let last_attempt = upstream.health.last_attempt_ms.load(Ordering::Relaxed);
            let last_success = upstream.health.last_success_ms.load(Ordering::Relaxed);
            // A success (or process start, if none yet) anchors the window;
            // attempts that keep failing past it are fatal.
            let anchor = if last_success > 0 { last_success } else { started_ms };
            if last_attempt > 0 && last_attempt - anchor > fatal_ms {
                error!(
                    "upstream calls failing for over {:?}; exiting",
                    fatal_timeout
                );
                std::process::exit(EXIT_DEPENDENCY);
            }
        }
    });
}
