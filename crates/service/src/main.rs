use animstudio::{
    InMemorySessionStore, ManimRenderer, OpenAiCompatModel, Orchestrator, Renderer, SessionStore,
    StudioConfig, load_config,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod routes;

use routes::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "ANIMSTUDIO_CONFIG")]
    config: Option<PathBuf>,
    /// Address to bind the service to
    #[arg(long, env = "ANIMSTUDIO_ADDR")]
    addr: Option<String>,
    /// Directory rendered videos are written to and served from
    #[arg(long, env = "ANIMSTUDIO_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
    /// Optional auth key required for requests (Bearer token)
    #[arg(long, env = "ANIMSTUDIO_AUTH_KEY")]
    auth_key: Option<String>,
}

impl Args {
    async fn into_config(self) -> Result<StudioConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .await
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => StudioConfig::default(),
        };
        if let Some(addr) = self.addr {
            config.server.addr = addr;
        }
        if let Some(dir) = self.output_dir {
            config.render.output_dir = dir;
        }
        if let Some(key) = self.auth_key {
            config.server.auth_key = Some(key);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("animstudio=info,animstudio_service=info,tower_http=info")
    });
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = Args::parse().into_config().await?;

    info!(
        addr = %config.server.addr,
        model = %config.model.model,
        model_url = %config.model.base_url,
        output_dir = %config.render.output_dir.display(),
        auth = %config.server.auth_key.as_ref().map(|_| "enabled").unwrap_or("disabled"),
        "starting service"
    );

    tokio::fs::create_dir_all(&config.render.output_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create output directory {}",
                config.render.output_dir.display()
            )
        })?;

    let model = OpenAiCompatModel::new(config.model_settings())
        .context("Failed to configure the code model")?;
    let renderer = ManimRenderer::new(config.render_settings());
    let store: Arc<dyn SessionStore> =
        Arc::new(InMemorySessionStore::with_policy(config.session_policy()));

    let tooling = renderer.probe().await;
    if !tooling.all_requirements_met() {
        for hint in tooling.recommendations() {
            warn!(%hint, "render tooling incomplete");
        }
    }

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(model),
        Arc::new(renderer),
        config.pipeline_settings(),
    );

    let _sweeper = spawn_session_sweeper(
        store,
        Duration::from_secs(config.sessions.sweep_interval_secs),
    );

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        auth_key: config.server.auth_key.clone(),
        output_dir: config.render.output_dir.clone(),
        work_dir: config.render.work_dir.clone(),
    };

    let app = routes::router(state)
        .nest_service("/animations", ServeDir::new(&config.render.output_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("service stopped");
    Ok(())
}

/// Periodically drops sessions that have been idle past their expiry.
fn spawn_session_sweeper(store: Arc<dyn SessionStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.evict_expired().await {
                Ok(0) => {}
                Ok(evicted) => info!(evicted, "evicted idle sessions"),
                Err(e) => warn!(error = %e, "session sweep failed"),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
