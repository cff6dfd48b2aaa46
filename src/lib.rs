pub mod config;
pub mod database;
pub mod error;
mod handlers;
pub mod llm;
pub mod pipeline;
pub mod quiz;
pub mod sse;
pub mod transcription;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use config::Config;
use database::Database;
use llm::LlmClient;
use pipeline::{PipelineConfig, TranscriptPipeline};
use quiz::{QuizConfig, QuizEngine};
use transcription::ListenClient;

pub use handlers::create_router;

/// Shared state handed to every route.
pub struct AppState {
    pub db: Arc<Database>,
    pub pipeline: Arc<TranscriptPipeline>,
    pub quizzes: Arc<QuizEngine>,
}

impl AppState {
    pub fn new(config: &Config, db: Arc<Database>) -> Self {
        let stt = Arc::new(ListenClient::new(
            &config.transcription_api_base_url,
            &config.transcription_api_key,
        ));
        let llm = Arc::new(
            LlmClient::new(&config.llm_api_base_url, &config.llm_api_key)
                .with_model(&config.llm_model),
        );

        Self {
            db: db.clone(),
            pipeline: Arc::new(TranscriptPipeline::new(
                db.clone(),
                stt,
                llm.clone(),
                PipelineConfig::default(),
            )),
            quizzes: Arc::new(QuizEngine::new(db, llm, QuizConfig::default())),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
///
/// `log` records from the store and pipeline are bridged into the same
/// output.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=debug", level)));

    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Open the store, bind the listener and serve until Ctrl+C or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let db = Database::connect(&config.database_url)
        .with_context(|| format!("failed to open database {}", config.database_url))?;
    let state = Arc::new(AppState::new(&config, Arc::new(db)));
    let app = create_router(state);

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", bind_addr))?;
    log::info!("Listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    log::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C, shutting down"),
        _ = terminate => log::info!("Received SIGTERM, shutting down"),
    }
}
