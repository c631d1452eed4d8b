use crate::provider::{openai, ultravox};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// The realtime voice providers a session bridge can be pointed at.
///
/// Selected once when a bridge is constructed and never switched at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// Direct WebSocket handshake against the OpenAI realtime API.
    OpenAI,
    /// REST call creation followed by a WebSocket join (Ultravox).
    Ultravox,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenAI => write!(f, "openai"),
            ProviderKind::Ultravox => write!(f, "ultravox"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAI),
            "ultravox" => Ok(ProviderKind::Ultravox),
            other => Err(ConfigError::InvalidValue(
                "provider".to_string(),
                format!("'{}' is not a supported provider", other),
            )),
        }
    }
}

/// Which side of the conversation opens it.
///
/// The wire values are the ones Ultravox expects in its call-creation body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum FirstSpeaker {
    #[default]
    #[serde(rename = "FIRST_SPEAKER_USER")]
    User,
    #[serde(rename = "FIRST_SPEAKER_AGENT")]
    Agent,
}

/// Session parameters applied to a provider connection at establishment time.
///
/// Built once before the bridge is constructed and passed by value into the
/// protocol client; never mutated afterwards.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// System prompt text. May be empty.
    pub instructions: String,
    /// Provider-specific model identifier.
    pub model: String,
    /// Provider-specific voice identifier.
    pub voice: String,
    pub first_speaker: FirstSpeaker,
}

impl SessionConfig {
    /// Creates a session config carrying the given provider's default model
    /// and voice, with empty instructions and the user speaking first.
    pub fn new(provider: ProviderKind) -> Self {
        let (model, voice) = match provider {
            ProviderKind::OpenAI => (openai::DEFAULT_MODEL, openai::DEFAULT_VOICE),
            ProviderKind::Ultravox => (ultravox::DEFAULT_MODEL, ultravox::DEFAULT_VOICE),
        };
        Self {
            instructions: String::new(),
            model: model.to_string(),
            voice: voice.to_string(),
            first_speaker: FirstSpeaker::default(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub ultravox_api_key: Option<String>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let ultravox_api_key = std::env::var("ULTRAVOX_API_KEY").ok();

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            openai_api_key,
            ultravox_api_key,
            log_level,
        })
    }

    /// Returns the API key for the given provider, or an error naming the
    /// missing environment variable.
    pub fn api_key_for(&self, provider: ProviderKind) -> Result<&str, ConfigError> {
        let (key, var) = match provider {
            ProviderKind::OpenAI => (self.openai_api_key.as_deref(), "OPENAI_API_KEY"),
            ProviderKind::Ultravox => (self.ultravox_api_key.as_deref(), "ULTRAVOX_API_KEY"),
        };
        key.ok_or_else(|| {
            ConfigError::MissingVar(format!("{} must be set for the '{}' provider", var, provider))
        })
    }
}
