//! Upstream connection setup.
//!
//! Builds the authorized handshake request for the realtime voice API and
//! opens the socket with a bounded wait.

use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Header carrying the realtime protocol version.
pub const PROTOCOL_HEADER: &str = "OpenAI-Beta";

/// Where and how to reach the upstream, snapshotted per session.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub url: String,
    pub model: String,
    pub beta_header: String,
    pub connect_timeout: Duration,
}

impl UpstreamTarget {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            model: config.model.clone(),
            beta_header: config.beta_header.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    /// Endpoint with the model query parameter appended.
    pub fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, separator, self.model)
    }

    /// Handshake request with bearer authorization and the protocol header.
    pub fn build_request(&self, api_key: &str) -> RelayResult<Request> {
        let mut request = self
            .endpoint()
            .into_client_request()
            .map_err(|e| RelayError::InvalidUpstreamRequest(e.to_string()))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| RelayError::InvalidUpstreamRequest("API key contains invalid characters".to_string()))?;
        let protocol = HeaderValue::from_str(&self.beta_header)
            .map_err(|e| RelayError::InvalidUpstreamRequest(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(PROTOCOL_HEADER, protocol);
        Ok(request)
    }
}

/// Open the upstream socket, failing after `target.connect_timeout`.
pub async fn connect(target: UpstreamTarget, api_key: String) -> RelayResult<UpstreamSocket> {
    let request = target.build_request(&api_key)?;
    debug!(endpoint = %target.endpoint(), "Connecting to upstream");

    let attempt = tokio_tungstenite::connect_async(request);
    match tokio::time::timeout(target.connect_timeout, attempt).await {
        Ok(Ok((socket, response))) => {
            info!(status = %response.status(), model = %target.model, "Upstream connection established");
            Ok(socket)
        }
        Ok(Err(err)) => Err(RelayError::UpstreamConnect(err.to_string())),
        Err(_) => Err(RelayError::UpstreamTimeout(target.connect_timeout.as_secs())),
    }
}
