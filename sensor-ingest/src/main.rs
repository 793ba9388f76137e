use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sensor_common::dedupe::DedupeCache;
use sensor_common::geofence::PgGeofence;
use sensor_common::store::PgEventStore;

use sensor_ingest::app::{create_router, AppState};
use sensor_ingest::bus::{BusConsumer, HEARTBEAT_INTERVAL};
use sensor_ingest::config::Config;
use sensor_ingest::feed::BroadcastFeed;
use sensor_ingest::generator::SyntheticGenerator;
use sensor_ingest::health::HealthRegistry;
use sensor_ingest::metrics::setup_metrics_routes;
use sensor_ingest::notifier::TelegramNotifier;
use sensor_ingest::pipeline::Pipeline;
use sensor_ingest::sweeper::sweep_loop;

async fn listen(app: Router, bind: String, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }

    info!("shutdown requested");
    shutdown.cancel();
}

// A component is considered stalled once it misses a few of its own intervals.
fn liveness_deadline(interval: Duration) -> Duration {
    interval * 3 + Duration::from_secs(5)
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    config.validate().wrap_err("invalid configuration")?;

    let store = PgEventStore::new(&config.database_url, config.max_pg_connections)
        .await
        .wrap_err("failed to connect to postgres")?;

    if config.run_migrations.is_on() {
        sqlx::migrate!("../migrations")
            .run(store.pool())
            .await
            .wrap_err("failed to run migrations")?;
        info!("migrations applied");
    }

    let geofence = Arc::new(PgGeofence::new(
        store.pool().clone(),
        config.boundary_table.clone(),
    ));
    let dedupe = Arc::new(DedupeCache::new(config.dedupe.cache_config()));
    let feed = Arc::new(BroadcastFeed::new(config.feed_channel_capacity));

    let notifier = TelegramNotifier::new(&config.telegram).wrap_err("failed to build notifier")?;
    if !notifier.is_configured() {
        info!("telegram credentials not set, alerts are disabled");
    }

    let pipeline = Pipeline::new(
        dedupe.clone(),
        geofence.clone(),
        Arc::new(store.clone()),
        feed.clone(),
        Arc::new(notifier),
    );

    let liveness = HealthRegistry::new();
    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let sweep_interval = config.dedupe.sweep_interval.0;
    tasks.push(tokio::spawn(sweep_loop(
        dedupe,
        sweep_interval,
        liveness.register("dedupe_sweeper", liveness_deadline(sweep_interval)),
        shutdown.clone(),
    )));

    if config.bus.enabled.is_on() {
        let consumer = BusConsumer::new(config.bus.clone(), pipeline.clone());
        // Reconnect backoff counts against the deadline too.
        let deadline = liveness_deadline(HEARTBEAT_INTERVAL + config.bus.reconnect_backoff.0);
        tasks.push(tokio::spawn(consumer.run(
            liveness.register("bus_consumer", deadline),
            shutdown.clone(),
        )));
    } else {
        info!("bus consumer disabled");
    }

    if config.simulator.enabled.is_on() {
        let generator = SyntheticGenerator::new(geofence, pipeline, &config.simulator);
        let interval = config.simulator.interval.0;
        tasks.push(tokio::spawn(generator.run(
            liveness.register("simulator", liveness_deadline(interval)),
            shutdown.clone(),
        )));
    } else {
        info!("sensor simulator disabled");
    }

    let state = AppState {
        store,
        feed,
        liveness,
        sse_keepalive: Duration::from_secs(config.sse_keepalive_secs),
        shutdown: shutdown.clone(),
    };
    let app = setup_metrics_routes(create_router(state))?;

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let served = listen(app, config.bind(), shutdown.clone()).await;
    if let Err(e) = &served {
        error!("http server failed: {}", e);
    }

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("background task panicked: {}", e);
        }
    }
    info!("sensor-ingest stopped");

    served
}
