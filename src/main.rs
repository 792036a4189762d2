//! Story Session Back binary entrypoint wiring REST, SSE, the narrator and the
//! session store.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use story_session_back::{
    config::AppConfig,
    dao::{
        session_store::{SessionStore, memory::MemorySessionStore},
        storage::StorageError,
    },
    narrator::{ChatCompletionsGenerator, TextGenerator, UnconfiguredGenerator},
    routes,
    services::storage_supervisor,
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let generator: Arc<dyn TextGenerator> = match ChatCompletionsGenerator::from_env() {
        Ok(generator) => {
            info!(model = generator.model(), "text generation configured");
            Arc::new(generator)
        }
        Err(err) => {
            warn!(error = %err, "text generation unavailable; using fallback narration only");
            Arc::new(UnconfiguredGenerator)
        }
    };

    let app_state = AppState::new(config, generator);
    spawn_storage_supervisor(app_state.clone())?;

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Start the storage supervisor for the backend named by `STORE_BACKEND`
/// (`memory`, `couch` or `mongo`; defaults to `memory`).
fn spawn_storage_supervisor(state: SharedState) -> anyhow::Result<()> {
    let backend = env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".into());
    info!(backend = %backend, "selecting session store backend");

    match backend.as_str() {
        "memory" => {
            let store = MemorySessionStore::new();
            tokio::spawn(storage_supervisor::run(state, move || {
                let store: Arc<dyn SessionStore> = Arc::new(store.clone());
                async move { Ok::<_, StorageError>(store) }
            }));
        }
        #[cfg(feature = "couch-store")]
        "couch" => {
            use story_session_back::dao::session_store::couchdb::{CouchConfig, CouchSessionStore};

            let config = CouchConfig::from_env().context("reading CouchDB configuration")?;
            tokio::spawn(storage_supervisor::run(state, move || {
                let config = config.clone();
                async move {
                    let store = CouchSessionStore::connect(config).await?;
                    Ok::<_, StorageError>(Arc::new(store) as Arc<dyn SessionStore>)
                }
            }));
        }
        #[cfg(feature = "mongo-store")]
        "mongo" => {
            use story_session_back::dao::session_store::mongodb::{MongoConfig, MongoSessionStore};

            tokio::spawn(storage_supervisor::run(state, || async {
                let config = MongoConfig::from_env().await?;
                let store = MongoSessionStore::connect(config).await?;
                Ok::<_, StorageError>(Arc::new(store) as Arc<dyn SessionStore>)
            }));
        }
        other => anyhow::bail!("unsupported STORE_BACKEND `{other}`"),
    }
    Ok(())
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
