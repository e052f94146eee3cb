use coursegen_core::PipelineConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Backends for course and module content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
    /// Deterministic offline content, for local development.
    Static,
}

#[derive(Clone, Debug)]
pub struct SpeechConfig {
    pub api_key: String,
    pub voice_id: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Courses are kept in memory only when unset.
    pub database_url: Option<String>,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub youtube_api_key: Option<String>,
    pub speech: Option<SpeechConfig>,
    pub audio_dir: PathBuf,
    pub pipeline: PipelineConfig,
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let provider_str =
            std::env::var("CONTENT_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "gemini" => Provider::Gemini,
            "static" => Provider::Static,
            other => {
                return Err(ConfigError::InvalidValue(
                    "CONTENT_PROVIDER".to_string(),
                    format!("'{other}' is not one of openai, gemini, static"),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
            Provider::Static => {}
        }

        let youtube_api_key = std::env::var("YOUTUBE_API_KEY").ok().filter(|k| !k.is_empty());
        let speech = match (
            std::env::var("ELEVENLABS_API_KEY").ok(),
            std::env::var("ELEVENLABS_VOICE_ID").ok(),
        ) {
            (Some(api_key), Some(voice_id)) => Some(SpeechConfig { api_key, voice_id }),
            (Some(_), None) => {
                return Err(ConfigError::MissingVar(
                    "ELEVENLABS_VOICE_ID must be set with ELEVENLABS_API_KEY".to_string(),
                ));
            }
            _ => None,
        };
        let audio_dir = std::env::var("AUDIO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./audio"));

        let mut pipeline = PipelineConfig::default();
        if let Some(workers) = parse_var::<usize>("BACKGROUND_CONCURRENCY")? {
            if workers == 0 {
                return Err(ConfigError::InvalidValue(
                    "BACKGROUND_CONCURRENCY".to_string(),
                    "must be at least 1".to_string(),
                ));
            }
            pipeline.background_concurrency = workers;
        }
        if let Some(secs) = parse_var::<u64>("FAST_PATH_BUDGET_SECS")? {
            pipeline.fast_path_budget = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var::<usize>("CACHE_MEMORY_BYTES")? {
            pipeline.cache_memory_bytes = bytes;
        }
        if let Some(courses) = parse_var::<usize>("RESIDENT_COURSES")? {
            pipeline.max_resident_courses = courses;
        }

        Ok(Self {
            bind_address,
            database_url,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            log_level,
            prompts_path,
            youtube_api_key,
            speech,
            audio_dir,
            pipeline,
        })
    }
}
