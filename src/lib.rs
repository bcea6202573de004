//! # Chief Voice Relay
//!
//! Server-side relay between voice clients and the upstream realtime voice
//! API, plus the client-side audio pieces a native voice client needs.
//!
//! ## Modules:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **error**: HTTP, relay and audio error types
//! - **state**: shared state, metrics and session slots
//! - **health** / **handlers** / **middleware**: the HTTP surface
//! - **relay**: connection manager, relay sessions and upstream handshake
//! - **audio**: capture, codec and playback
//! - **client**: a voice client built on `audio` that talks to the relay

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod relay;
pub mod state;

pub use config::AppConfig;
pub use state::AppState;
