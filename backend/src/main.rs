use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, middleware, web};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use linkguard::services::{
    JobConfig, LimitAdjustmentJob, MaintenanceJob, OutboxNotifier, OutboxRelayJob, OutboxService,
};
use linkguard::{
    AppState, BroadcastNotifier, Clock, Config, InMemoryStore, Notifier, PostgresStore, SafetyEngine,
    SafetyStore, SystemClock, TimeoutStore, handlers,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linkguard=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().map_err(std::io::Error::other)?;

    info!("Starting LinkGuard server on {}:{}", config.host, config.port);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let broadcast = BroadcastNotifier::default();
    spawn_notification_logger(&broadcast);

    let (base_store, notifier, outbox): (Arc<dyn SafetyStore>, Arc<dyn Notifier>, Option<Arc<OutboxService>>) =
        match &config.database_url {
            Some(database_url) => {
                let db_pool = PgPoolOptions::new()
                    .max_connections(config.database_max_connections)
                    .connect(database_url)
                    .await
                    .map_err(std::io::Error::other)?;

                info!("Database connection pool established");

                sqlx::migrate!("./migrations")
                    .run(&db_pool)
                    .await
                    .map_err(std::io::Error::other)?;

                info!("Database migrations completed");

                let outbox = Arc::new(OutboxService::new(db_pool.clone()));
                (
                    Arc::new(PostgresStore::new(db_pool, clock.clone())),
                    Arc::new(OutboxNotifier::new(outbox.clone())),
                    Some(outbox),
                )
            }
            None => {
                warn!("DATABASE_URL not set; using the in-memory store (state is lost on restart)");
                (
                    Arc::new(InMemoryStore::new(clock.clone())),
                    Arc::new(broadcast.clone()),
                    None,
                )
            }
        };

    let store: Arc<dyn SafetyStore> = Arc::new(TimeoutStore::new(base_store, config.store_timeout()));
    let engine = Arc::new(SafetyEngine::new(store, clock, notifier, config.engine_config()));
    info!("Safety engine initialized");

    // Background jobs; the shutdown senders must outlive the server
    let _maintenance_shutdown = MaintenanceJob::new(
        engine.clone(),
        JobConfig::every(Duration::from_secs(config.maintenance_interval_secs)),
    )
    .start();
    let _adjustment_shutdown = LimitAdjustmentJob::new(
        engine.clone(),
        JobConfig::every(Duration::from_secs(config.limit_adjustment_interval_secs)),
    )
    .start();
    let _relay_shutdown = outbox.map(|outbox| {
        OutboxRelayJob::new(
            outbox,
            Arc::new(broadcast.clone()),
            JobConfig::every(Duration::from_secs(config.outbox_relay_interval_secs)),
        )
        .start()
    });
    info!("Background jobs started");

    let server_addr = format!("{}:{}", config.host, config.port);
    let app_state = web::Data::new(AppState { config, engine });

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::Logger::default())
            .configure(handlers::configure_health_routes)
            .service(web::scope("/v1").configure(handlers::configure_v1_routes))
    })
    .bind(&server_addr)?
    .run()
    .await
}

/// Log every published notification (the in-process consumer)
fn spawn_notification_logger(broadcast: &BroadcastNotifier) {
    let mut rx = broadcast.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => info!(
                    channel = %notification.channel,
                    action = ?notification.action,
                    user_id = ?notification.user_id,
                    action_class = ?notification.action_class,
                    "Safety notification"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notification logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
