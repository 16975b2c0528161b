use axum::{
    routing::{get, post},
    Router,
};
use roomcore::bus::InMemorySubstrate;
use roomcore::room::{InMemoryRoomInfoRepository, PostgresRoomInfoRepository, RoomInfoRepository};
use roomcore::scheduler::InMemoryMediaPlane;
use roomcore::{auth, room, CoreConfig, CoreServices};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcore=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting room control plane");
    let config = CoreConfig::from_env()?;

    let durable: Arc<dyn RoomInfoRepository> = match &config.database_url {
        Some(database_url) => {
            let pool = sqlx::PgPool::connect(database_url).await?;
            let repository = PostgresRoomInfoRepository::new(pool);
            repository.ensure_schema().await?;
            info!("Using PostgreSQL room info repository");
            Arc::new(repository)
        }
        None => {
            info!("DATABASE_URL not set, using in-memory room info repository");
            Arc::new(InMemoryRoomInfoRepository::new())
        }
    };

    let services = CoreServices::build(
        Arc::new(InMemorySubstrate::new()),
        durable,
        Arc::new(InMemoryMediaPlane::new()),
        &config,
    );
    services.tasks.provision().await?;

    let scheduler = services.scheduler();
    let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/rooms/:room_id", get(room::get_room))
        .route("/auth/connection", post(auth::authorize_connection))
        .layer(TraceLayer::new_for_http())
        .with_state(services.app_state());

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server running on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    services.shutdown().await;
    scheduler_handle.await?;
    info!("Server stopped");
    Ok(())
}
