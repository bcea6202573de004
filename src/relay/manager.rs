//! # Connection Manager
//!
//! Entry point of the relay WebSocket server. For every upgrade request it:
//! 1. Resolves a credential: `api_key` query parameter, then an
//!    `Authorization: Bearer` header, then the server default
//! 2. Reserves a session slot
//! 3. Starts exactly one [`RelaySession`] bound to that client and credential
//!
//! A request that fails step 1 or 2 is still upgraded, so the client can
//! read the reason. It receives a single `error` notice and is closed, and no
//! upstream connection is attempted.

use crate::error::RelayError;
use crate::relay::events::RelayNotice;
use crate::relay::session::{RelaySession, RelaySessionConfig};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use tracing::{info, warn};

/// Query parameter carrying the client's credential.
pub const API_KEY_PARAM: &str = "api_key";

/// Where a session's credential came from. Logged instead of the key itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Query,
    Header,
    ServerDefault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub key: String,
    pub source: CredentialSource,
}

/// Pick the credential for a connection, ignoring blank values.
pub fn resolve_credential(
    query: &HashMap<String, String>,
    authorization: Option<&str>,
    server_default: Option<&str>,
) -> Option<Credential> {
    let non_blank = |value: &str| {
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    };

    if let Some(key) = query.get(API_KEY_PARAM).and_then(|v| non_blank(v)) {
        return Some(Credential {
            key,
            source: CredentialSource::Query,
        });
    }

    if let Some(key) = authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .and_then(non_blank)
    {
        return Some(Credential {
            key,
            source: CredentialSource::Header,
        });
    }

    server_default.and_then(non_blank).map(|key| Credential {
        key,
        source: CredentialSource::ServerDefault,
    })
}

/// Mount the relay on every path of a server.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/{path:.*}", web::get().to(relay_websocket));
}

/// Upgrade handler for the relay WebSocket server.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = app_state.get_config();
    let peer = req.connection_info().peer_addr().unwrap_or("unknown").to_string();

    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .map(web::Query::into_inner)
        .unwrap_or_default();
    let authorization = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    let credential = match resolve_credential(&query, authorization, config.upstream.api_key.as_deref()) {
        Some(credential) => credential,
        None => {
            warn!(peer = %peer, "Rejecting relay connection without credential");
            app_state.record_rejected_session();
            return ws::start(RejectedConnection::new(RelayError::MissingCredential), &req, stream);
        }
    };

    let permit = match app_state.try_acquire_session(config.performance.max_concurrent_sessions) {
        Some(permit) => permit,
        None => {
            warn!(peer = %peer, "Rejecting relay connection, all session slots in use");
            return ws::start(RejectedConnection::new(RelayError::AtCapacity), &req, stream);
        }
    };

    let session = RelaySession::new(credential.key, RelaySessionConfig::from_app_config(&config), permit);
    info!(
        peer = %peer,
        session_id = %session.id(),
        credential_source = ?credential.source,
        "Accepted relay connection"
    );

    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(config.performance.max_frame_bytes)
        .start()
}

/// Short-lived actor for connections refused before a session exists.
///
/// Sends one error notice, closes, and never touches the upstream.
pub struct RejectedConnection {
    reason: RelayError,
}

impl RejectedConnection {
    pub fn new(reason: RelayError) -> Self {
        Self { reason }
    }
}

impl Actor for RejectedConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.text(RelayNotice::from(&self.reason).to_json());
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Policy,
            description: Some(self.reason.to_string()),
        }));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RejectedConnection {
    fn handle(&mut self, _msg: Result<ws::Message, ws::ProtocolError>, _ctx: &mut Self::Context) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_query_credential_wins() {
        let credential =
            resolve_credential(&query(&[("api_key", "valid123")]), Some("Bearer header-key"), Some("default")).unwrap();
        assert_eq!(credential.key, "valid123");
        assert_eq!(credential.source, CredentialSource::Query);
    }

    #[test]
    fn test_header_then_default() {
        let from_header = resolve_credential(&query(&[]), Some("Bearer header-key"), Some("default")).unwrap();
        assert_eq!(from_header.key, "header-key");
        assert_eq!(from_header.source, CredentialSource::Header);

        let from_default = resolve_credential(&query(&[("api_key", "  ")]), Some("Basic abc"), Some("default")).unwrap();
        assert_eq!(from_default.key, "default");
        assert_eq!(from_default.source, CredentialSource::ServerDefault);
    }

    #[test]
    fn test_no_credential_anywhere() {
        assert!(resolve_credential(&query(&[]), None, None).is_none());
        assert!(resolve_credential(&query(&[("api_key", "")]), Some("Bearer "), Some("")).is_none());
    }
}
