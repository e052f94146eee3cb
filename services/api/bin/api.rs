//! Main Entrypoint for the Course Generation API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Connecting the course store (Postgres, or memory when unconfigured).
//! 3. Building the content, video and speech collaborators.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use coursegen_api::{
    config::{Config, Provider},
    db::Db,
    external::{ElevenLabsSpeech, YouTubeSearch},
    router::create_router,
    state::AppState,
};
use coursegen_core::{
    Collaborators, CourseOrchestrator,
    llm_client::{ContentService, OpenAICompatibleService, StaticContentService},
    prompts::PromptSet,
    resources::{FsObjectStore, SpeechSynthesizer, VideoSearch},
};
use sqlx::PgPool;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)
        .with_context(|| format!("Could not read prompts from {}", prompts_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

fn content_service(config: &Config) -> anyhow::Result<Arc<dyn ContentService>> {
    let (api_key, api_base) = match config.provider {
        Provider::Static => {
            warn!("Using the static content provider; courses are placeholders.");
            return Ok(Arc::new(StaticContentService::default()));
        }
        Provider::OpenAI => (&config.openai_api_key, "https://api.openai.com/v1/"),
        Provider::Gemini => (
            &config.gemini_api_key,
            "https://generativelanguage.googleapis.com/v1beta/openai",
        ),
    };
    let api_key = api_key
        .as_ref()
        .context("API key missing for the configured provider")?;
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(api_base);
    Ok(Arc::new(OpenAICompatibleService::new(
        openai_config,
        config.chat_model.clone(),
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Build Collaborators ---
    let prompts = load_prompts(&config.prompts_path)?;
    let prompts = PromptSet::from_map(&prompts)?;
    let mut collaborators =
        Collaborators::in_memory(content_service(&config)?, prompts, &config.pipeline);

    match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to database")?;
            let db = Db::new(pool);
            db.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            collaborators.courses = Arc::new(db);
        }
        None => warn!("DATABASE_URL not set; courses will not survive a restart."),
    }

    fs::create_dir_all(&config.audio_dir)
        .with_context(|| format!("Could not create {}", config.audio_dir.display()))?;
    collaborators.objects = Arc::new(FsObjectStore::new(config.audio_dir.clone()));
    collaborators.videos = config
        .youtube_api_key
        .clone()
        .map(|key| -> Arc<dyn VideoSearch> { Arc::new(YouTubeSearch::new(key)) });
    collaborators.speech = config.speech.clone().map(|speech| -> Arc<dyn SpeechSynthesizer> {
        Arc::new(ElevenLabsSpeech::new(speech.api_key, speech.voice_id))
    });

    let orchestrator = CourseOrchestrator::new(config.pipeline.clone(), collaborators);
    let app_state = Arc::new(AppState {
        orchestrator,
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        videos = config.youtube_api_key.is_some(),
        speech = config.speech.is_some(),
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
