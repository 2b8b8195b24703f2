//! HTTP sidecar serving the cloned voice.
//!
//! The listener comes up before the model is loaded; [`AppState`] starts
//! empty and receives its engine once loading, prompt creation and warm-up
//! have finished on a background thread.

pub mod error;
pub mod handlers;
mod startup;
pub mod synthesizer;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::future::{Future, IntoFuture};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use error::ApiError;
pub use startup::{build_voice_prompt, load_engine};
pub use synthesizer::{ModelEngine, SynthesisError, SynthesisRequest, Synthesizer};

/// Runtime settings of the service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub model: String,
    pub tokenizer: Option<String>,
    pub ref_audio: PathBuf,
    pub ref_text: Option<String>,
    pub device: String,
    pub prompt_cache: Option<PathBuf>,
    pub warmup: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8880,
            model: "Qwen/Qwen3-TTS-12Hz-1.7B-Base".to_string(),
            tokenizer: None,
            ref_audio: PathBuf::from("voices/monika.mp3"),
            ref_text: Some("Hey, it's me, Monika! How are you doing today?".to_string()),
            device: "auto".to_string(),
            prompt_cache: None,
            warmup: true,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared handler state; the engine slot is filled once.
#[derive(Clone, Default)]
pub struct AppState {
    engine: Arc<OnceLock<Arc<dyn Synthesizer>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(engine: Arc<dyn Synthesizer>) -> Self {
        let state = Self::new();
        state.set_engine(engine);
        state
    }

    /// Returns false if an engine was already installed.
    pub fn set_engine(&self, engine: Arc<dyn Synthesizer>) -> bool {
        self.engine.set(engine).is_ok()
    }

    pub fn engine(&self) -> Option<Arc<dyn Synthesizer>> {
        self.engine.get().cloned()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tts/health", get(handlers::health))
        .route("/api/tts", post(handlers::synthesize))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind, start loading the model in the background, and serve until
/// ctrl-c or SIGTERM. A model load failure stops the server with an error.
pub async fn run(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(config.address())
        .await
        .with_context(|| format!("Failed to bind {}", config.address()))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let loader = move || load_engine(&config).map(|engine| Arc::new(engine) as Arc<dyn Synthesizer>);
    serve_with_loader(listener, loader, shutdown_signal()).await?;
    tracing::info!("shut down");
    Ok(())
}

/// Serve on `listener` while `loader` runs on its own thread.
///
/// Returns when `shutdown` resolves, or with the loader's error as soon as
/// it fails.
pub async fn serve_with_loader<L, S>(listener: TcpListener, loader: L, shutdown: S) -> Result<()>
where
    L: FnOnce() -> Result<Arc<dyn Synthesizer>> + Send + 'static,
    S: Future<Output = ()> + Send + 'static,
{
    let state = AppState::new();
    let (failed_tx, failed_rx) = oneshot::channel();
    spawn_loader(loader, state.clone(), failed_tx)?;

    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .into_future();
    tokio::select! {
        res = server => res.context("server error"),
        Ok(e) = failed_rx => Err(e.context("model failed to load")),
    }
}

// A plain thread so shutdown does not wait on a half-loaded model.
fn spawn_loader<L>(loader: L, state: AppState, failed: oneshot::Sender<anyhow::Error>) -> Result<()>
where
    L: FnOnce() -> Result<Arc<dyn Synthesizer>> + Send + 'static,
{
    std::thread::Builder::new()
        .name("model-loader".into())
        .spawn(move || match loader() {
            Ok(engine) => {
                state.set_engine(engine);
                tracing::info!("ready");
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "model failed to load");
                let _ = failed.send(e);
            }
        })
        .context("Failed to spawn model loader")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AudioBuffer;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Silent;

    #[async_trait]
    impl Synthesizer for Silent {
        fn has_voice(&self) -> bool {
            true
        }

        async fn synthesize(&self, _request: SynthesisRequest) -> Result<AudioBuffer, SynthesisError> {
            Ok(AudioBuffer::new(vec![0.0; 240], 24_000))
        }
    }

    async fn local_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    async fn health_body(addr: std::net::SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /api/tts/health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_load_failure_stops_server() {
        let listener = local_listener().await;
        let serving = serve_with_loader(listener, || Err(anyhow::anyhow!("no weights")), std::future::pending());
        let err = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("server kept running after the load failed")
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("model failed to load"), "{message}");
        assert!(message.contains("no weights"), "{message}");
    }

    #[tokio::test]
    async fn test_loaded_engine_is_served_until_shutdown() {
        let listener = local_listener().await;
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let loader = || Ok(Arc::new(Silent) as Arc<dyn Synthesizer>);
        let server = tokio::spawn(serve_with_loader(listener, loader, async {
            let _ = stop_rx.await;
        }));

        let mut body = String::new();
        for _ in 0..50 {
            body = health_body(addr).await;
            if body.contains("\"model\":\"loaded\"") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(body.contains("\"voice\":\"cloned\""), "{body}");

        stop_tx.send(()).unwrap();
        let res = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert!(res.is_ok());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "0.0.0.0:8880");
        assert_eq!(config.ref_audio, PathBuf::from("voices/monika.mp3"));
        assert!(config.warmup);
    }

    #[test]
    fn test_state_starts_empty() {
        assert!(AppState::new().engine().is_none());
    }
}
