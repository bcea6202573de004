//! # Realtime Voice Relay
//!
//! Bridges browser (or native) voice clients to the upstream realtime voice
//! API. The relay does not interpret conversation content: it moves frames
//! between two sockets, injects one configuration event during the upstream
//! handshake, and tears both sockets down together.
//!
//! ## Components:
//! - **manager**: upgrade endpoint, credential and capacity gates
//! - **session**: per-connection actor that does the forwarding
//! - **upstream**: authorized handshake request and bounded connect
//! - **events**: the few message shapes the relay reads or writes itself

pub mod events;
pub mod manager;
pub mod session;
pub mod upstream;

pub use manager::relay_websocket;
pub use session::RelaySession;
