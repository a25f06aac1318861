//! Configuration management for voice-relay.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults, so an empty or missing file yields a usable setup.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::transport::Backend;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub retry_backoff_secs: f64,
    pub grace_period_secs: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_secs: 2.0,
            grace_period_secs: 5.0,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_backoff(&self) -> Duration {
        secs_or(self.retry_backoff_secs, Self::default().retry_backoff_secs)
    }

    pub fn grace_period(&self) -> Duration {
        secs_or(self.grace_period_secs, Self::default().grace_period_secs)
    }
}

/// Negative values clamp to zero; NaN or out-of-range values use `fallback`.
fn secs_or(secs: f64, fallback: f64) -> Duration {
    let secs = if secs.is_nan() { fallback } else { secs.max(0.0) };
    Duration::try_from_secs_f64(secs).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub dir: PathBuf,
    pub prefix: String,
    pub extension: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            prefix: "respuesta".into(),
            extension: "mp3".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalServeConfig {
    pub host: String,
    pub port: u16,
    /// Address used only to discover which local interface routes outward.
    pub route_addr: String,
}

impl Default for LocalServeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            route_addr: "8.8.8.8:80".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub device: Option<String>,
    /// Decode and play in-process before trying external players.
    pub use_audio_stack: bool,
    pub players: Vec<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device: None,
            use_audio_stack: true,
            players: vec!["mpg123".into(), "mplayer".into(), "afplay".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemotePublishConfig {
    pub repo_url: String,
    pub clone_dir: PathBuf,
    pub remote: String,
    pub branch: String,
    pub public_base_url: String,
    pub file_name: String,
    /// Publish under the artifact's own name instead of `file_name`.
    pub unique_names: bool,
    /// Regex matched against file names in the clone root; matches are removed before each publish.
    pub stale_pattern: String,
    pub commit_message: String,
    pub cache_param: String,
}

impl Default for RemotePublishConfig {
    fn default() -> Self {
        Self {
            repo_url: "https://github.com/pecec1to/audio.git".into(),
            clone_dir: PathBuf::from("audio_repo"),
            remote: "origin".into(),
            branch: "main".into(),
            public_base_url: "https://pecec1to.github.io/audio".into(),
            file_name: "respuesta_chatbot.mp3".into(),
            unique_names: false,
            stale_pattern: r"\.mp3$".into(),
            commit_message: "Actualizar archivo de audio".into(),
            cache_param: "cache_bust".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub bridge_url: String,
    pub serial: String,
    pub search_timeout_secs: u64,
    pub volume: f32,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            bridge_url: "http://127.0.0.1:8790".into(),
            serial: "20256".into(),
            search_timeout_secs: 10,
            volume: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub model: String,
    pub host: String,
    pub api_key_env: String,
    pub fallback_reply: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".into(),
            host: "https://generativelanguage.googleapis.com".into(),
            api_key_env: "GOOGLE_API_KEY".into(),
            fallback_reply: "Ha ocurrido un error al procesar tu mensaje.".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub lang: String,
    pub host: String,
    pub max_chunk_chars: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            lang: "es".into(),
            host: "https://translate.google.com".into(),
            max_chunk_chars: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub stop_words: Vec<String>,
    pub greeting: Option<String>,
    /// Transport to switch to when the configured one fails setup.
    pub fallback_transport: Option<Backend>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_words: vec!["salir".into(), "stop".into()],
            greeting: None,
            fallback_transport: Some(Backend::LocalServe),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transport: Backend,
    pub delivery: DeliveryConfig,
    pub artifacts: ArtifactConfig,
    pub local_serve: LocalServeConfig,
    pub bluetooth: BluetoothConfig,
    pub remote_publish: RemotePublishConfig,
    pub robot: RobotConfig,
    pub chat: ChatConfig,
    pub speech: SpeechConfig,
    pub session: SessionConfig,
    pub history: HistoryConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./voice-relay.yaml
    /// 2. ~/.config/voice-relay/config.yaml
    /// 3. /etc/voice-relay/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("voice-relay.yaml")),
                dirs::home_dir().map(|h| h.join(".config/voice-relay/config.yaml")),
                Some(PathBuf::from("/etc/voice-relay/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}
