//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (APP_ prefix, `__` between group and field)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (HOST, PORT, WS_PORT, OPENAI_API_KEY)
//! 2. Environment variables (APP_SERVER__HOST, APP_UPSTREAM__CONNECT_TIMEOUT_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Ownership Model:
//! The configuration is loaded once at startup and handed to whatever needs it.
//! Every relay session receives its own snapshot when it is constructed, so a
//! runtime update through `PUT /api/v1/config` only affects sessions created
//! after the update. [`AppConfig::save`] is the only way configuration leaves
//! the process.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Default system instructions sent to the upstream voice model.
pub const DEFAULT_INSTRUCTIONS: &str = "You are Chief, a calm and capable personal \
productivity assistant. You help the user stay on top of their email, calendar, \
messages and notes. Speak naturally and keep answers short: one or two sentences \
unless the user asks for more detail. When you are unsure, ask a brief clarifying question.";

/// Main relay configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, upstream, session,
/// performance, audio) keeps each concern readable and lets the environment
/// override a single field with names like `APP_UPSTREAM__MODEL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionConfig,
    pub performance: PerformanceConfig,
    pub audio: AudioConfig,
}

/// Listening sockets.
///
/// ## Fields:
/// - `host`: IP address or hostname both servers bind to
/// - `port`: HTTP port (liveness, metrics, config)
/// - `ws_port`: relay WebSocket port; when unset it is `port + 1`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
}

/// Upstream realtime voice API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket endpoint, without the model query parameter
    pub url: String,
    /// Model identifier appended as `?model=...`
    pub model: String,
    /// Server-side default credential used when a client supplies none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Value of the protocol-version header (`OpenAI-Beta`)
    pub beta_header: String,
    /// Bound on the upstream connection attempt
    pub connect_timeout_secs: u64,
}

/// Parameters of the one-time `session.update` sent upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub transcription_model: String,
    /// Voice activity detection sensitivity (0.0 - 1.0)
    pub vad_threshold: f32,
    /// Audio kept before detected speech, in milliseconds
    pub vad_prefix_padding_ms: u32,
    /// Silence that ends a turn, in milliseconds
    pub vad_silence_duration_ms: u32,
    pub temperature: f32,
    /// Either a token count or `"inf"`
    pub max_response_output_tokens: String,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - Each session holds two sockets, so `max_concurrent_sessions` bounds open sockets at twice its value
/// - `client_timeout_secs` must exceed `heartbeat_interval_secs` or every client times out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub shutdown_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    /// Largest WebSocket frame accepted from a client
    pub max_frame_bytes: usize,
}

/// Wire audio format shared by capture and playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Samples per captured frame
    pub frame_samples: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3001,
                ws_port: None,
            },
            upstream: UpstreamConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
                api_key: None,
                beta_header: "realtime=v1".to_string(),
                connect_timeout_secs: 10,
            },
            session: SessionConfig {
                voice: "alloy".to_string(),
                instructions: DEFAULT_INSTRUCTIONS.to_string(),
                input_audio_format: "pcm16".to_string(),
                output_audio_format: "pcm16".to_string(),
                transcription_model: "whisper-1".to_string(),
                vad_threshold: 0.5,
                vad_prefix_padding_ms: 300,
                vad_silence_duration_ms: 500,
                temperature: 0.8,
                max_response_output_tokens: "inf".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 32,
                shutdown_timeout_secs: 10,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                max_frame_bytes: 1024 * 1024,
            },
            audio: AudioConfig {
                sample_rate: 24_000,
                frame_samples: 4096,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_UPSTREAM__MODEL=...`: Override the realtime model
    /// - `APP_PERFORMANCE__MAX_CONCURRENT_SESSIONS=64`: Field names keep their own underscores
    /// - `PORT=8080`: HTTP port for deployment platforms (relay listens on 8081)
    /// - `OPENAI_API_KEY=sk-...`: Default credential for clients that send none
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(ws_port) = env::var("WS_PORT") {
            settings = settings.set_override("server.ws_port", ws_port)?;
        }

        // Empty values are treated as unset so `OPENAI_API_KEY=` disables the default
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                settings = settings.set_override("upstream.api_key", key)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Write the configuration to `path` as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.port == u16::MAX && self.server.ws_port.is_none() {
            return Err(anyhow::anyhow!("WebSocket port cannot default to port + 1 when port is 65535"));
        }

        if let Some(ws_port) = self.server.ws_port {
            if ws_port == 0 || ws_port == self.server.port {
                return Err(anyhow::anyhow!("WebSocket port must be nonzero and differ from the HTTP port"));
            }
        }

        if self.upstream.url.trim().is_empty() || self.upstream.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Upstream url and model must be set"));
        }

        if self.upstream.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream connect timeout must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.session.vad_threshold) {
            return Err(anyhow::anyhow!("VAD threshold must be between 0.0 and 1.0"));
        }

        if !(0.6..=1.2).contains(&self.session.temperature) {
            return Err(anyhow::anyhow!("Temperature must be between 0.6 and 1.2"));
        }

        let max_tokens = self.session.max_response_output_tokens.as_str();
        if max_tokens != "inf" && max_tokens.parse::<u32>().map_or(true, |n| n == 0) {
            return Err(anyhow::anyhow!("max_response_output_tokens must be \"inf\" or a positive integer"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0
            || self.performance.heartbeat_interval_secs >= self.performance.client_timeout_secs
        {
            return Err(anyhow::anyhow!("Heartbeat interval must be nonzero and shorter than the client timeout"));
        }

        if self.performance.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.frame_samples == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and frame size must be greater than 0"));
        }

        Ok(())
    }

    /// Port of the relay WebSocket server.
    pub fn ws_port(&self) -> u16 {
        self.server.ws_port.unwrap_or_else(|| self.server.port.saturating_add(1))
    }

    pub fn has_default_api_key(&self) -> bool {
        self.upstream.api_key.as_deref().is_some_and(|key| !key.trim().is_empty())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the `session` and `performance` groups can change at runtime.
    /// Listening sockets and the upstream credential are fixed for the
    /// lifetime of the process. For example, `{"session": {"voice": "verse"}}`
    /// changes only the voice used by sessions created from now on.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(session) = partial_config.get("session") {
            let target = &mut updated.session;
            if let Some(voice) = session.get("voice").and_then(|v| v.as_str()) {
                target.voice = voice.to_string();
            }
            if let Some(instructions) = session.get("instructions").and_then(|v| v.as_str()) {
                target.instructions = instructions.to_string();
            }
            if let Some(model) = session.get("transcription_model").and_then(|v| v.as_str()) {
                target.transcription_model = model.to_string();
            }
            if let Some(threshold) = session.get("vad_threshold").and_then(|v| v.as_f64()) {
                target.vad_threshold = threshold as f32;
            }
            if let Some(padding) = session.get("vad_prefix_padding_ms").and_then(|v| v.as_u64()) {
                target.vad_prefix_padding_ms = u32::try_from(padding)?;
            }
            if let Some(silence) = session.get("vad_silence_duration_ms").and_then(|v| v.as_u64()) {
                target.vad_silence_duration_ms = u32::try_from(silence)?;
            }
            if let Some(temperature) = session.get("temperature").and_then(|v| v.as_f64()) {
                target.temperature = temperature as f32;
            }
            match session.get("max_response_output_tokens") {
                Some(serde_json::Value::String(tokens)) => target.max_response_output_tokens = tokens.clone(),
                Some(serde_json::Value::Number(tokens)) => target.max_response_output_tokens = tokens.to_string(),
                _ => {}
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            let target = &mut updated.performance;
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                target.max_concurrent_sessions = usize::try_from(sessions)?;
            }
            if let Some(interval) = performance.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                target.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = performance.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                target.client_timeout_secs = timeout;
            }
        }

        // Validate before committing so a bad update leaves the current config untouched
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
