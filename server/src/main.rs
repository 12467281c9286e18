use std::{net::SocketAddr, path::Path, sync::Arc};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};
use tracing::{info, warn};

use server::config::ServerConfig;
use server::{router, AppState};
use tts_core::{
    AudioStore, FsStore, MemoryStore, PiperLoader, SynthesisCache, SynthesisEngine, TtsManager,
    VoiceModelRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting TTS server...");

    let config = ServerConfig::from_env();
    info!(
        "Server configuration loaded: port={}, models_dir={}, default_voice={}",
        config.port,
        config.models_dir.display(),
        config.default_voice
    );

    let store = open_store(config.cache_dir.as_deref())?;
    let registry = VoiceModelRegistry::new(&config.models_dir, Arc::new(PiperLoader));
    let tts = TtsManager::new(
        registry.clone(),
        SynthesisEngine::new(),
        SynthesisCache::new(store),
        config.default_voice.clone(),
    );

    let voices = tts.available_voices();
    info!("Found {} voice(s) in {}", voices.len(), config.models_dir.display());
    if !voices.contains(&config.default_voice) {
        warn!("Default voice '{}' is not installed", config.default_voice);
    }

    if !config.preload_voices.is_empty() {
        let loaded = registry.preload(&config.preload_voices).await;
        info!("Preloaded {}/{} voice(s)", loaded, config.preload_voices.len());
    }

    let state = AppState::new(tts);

    let cors = cors_layer(config.cors_allowed_origins.as_deref());

    // One bucket shared by every client
    let per_second = u64::from((config.rate_limit_per_minute / 60).max(1));
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(per_second)
            .burst_size(config.rate_limit_per_minute.max(1))
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .context("Invalid rate limit configuration")?,
    );
    info!("Rate limiting: {} requests per minute", config.rate_limit_per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors)
        .into_inner();

    let app = router(state).layer(middleware_stack);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

fn open_store(cache_dir: Option<&Path>) -> anyhow::Result<Arc<dyn AudioStore>> {
    let Some(dir) = cache_dir else {
        warn!("PIPER_CACHE_DIR is blank, cached audio is kept in memory and lost on restart");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let store = FsStore::open(dir)
        .with_context(|| format!("Failed to open cache dir {}", dir.display()))?;
    info!("Caching audio in {}", dir.display());
    Ok(Arc::new(store))
}

fn cors_layer(allowed_origins: Option<&[String]>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_credentials(false);

    let Some(allowed_origins) = allowed_origins else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return base.allow_origin(tower_http::cors::Any);
    };

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        base.allow_origin(tower_http::cors::Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        base.allow_origin(tower_http::cors::AllowOrigin::list(origins))
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
