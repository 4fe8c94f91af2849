use std::sync::Arc;

use conductor::api::{self, ApiState};
use conductor::app_state::{spawn_aggregator, AppState};
use conductor::config::Config;
use conductor::remote::{HttpRemoteActor, RemoteActor, Role};
use conductor::store::{bootstrap, DocumentStore, SqliteDocumentStore};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let roles: Vec<&str> = config.roles.iter().map(|r| r.as_str()).collect();
    info!(port = config.port, roles = ?roles, node = %config.node_name, "conductor starting");

    // Store
    let store = SqliteDocumentStore::connect(&config.database_url).await?;
    bootstrap(&store)
        .await
        .map_err(|e| anyhow::anyhow!("store bootstrap failed: {e}"))?;
    let store: Arc<dyn DocumentStore> = Arc::new(store);

    let remote: Arc<dyn RemoteActor> = Arc::new(
        HttpRemoteActor::new(config.hosts.clone(), config.remote_timeout)
            .map_err(|e| anyhow::anyhow!("remote client setup failed: {e}"))?,
    );

    // Worker pool, only when this process serves the aggregator role
    let aggregator = if config.hosts_role(Role::Aggregator) {
        Some(
            spawn_aggregator(
                remote.clone(),
                config.worker_concurrency,
                config.worker_max_attempts,
            )
            .await?,
        )
    } else {
        None
    };

    let state = ApiState {
        app_state: AppState::start(store, remote, &config.node_name, aggregator).await?,
        roles: config.roles.clone(),
    };

    let app = api::router(&config.roles)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
