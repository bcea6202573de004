use crate::config::AppConfig;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

/// File written by `PUT /api/v1/config?persist=true`, the same one `AppConfig::load` reads.
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Default, Deserialize)]
pub struct UpdateParams {
    #[serde(default)]
    pub persist: bool,
}

/// Public view of the configuration. The credential is reported only as present or absent.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "ws_port": config.ws_port()
        },
        "upstream": {
            "url": config.upstream.url,
            "model": config.upstream.model,
            "beta_header": config.upstream.beta_header,
            "connect_timeout_secs": config.upstream.connect_timeout_secs,
            "default_api_key": config.has_default_api_key()
        },
        "session": config.session,
        "performance": config.performance,
        "audio": config.audio
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Apply a partial update to `session` / `performance`.
///
/// Only sessions created after the update see the new values.
pub async fn update_config(
    state: web::Data<AppState>,
    params: web::Query<UpdateParams>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    if params.persist {
        // Never write the credential to disk
        let mut persisted = current_config.clone();
        persisted.upstream.api_key = None;
        persisted
            .save(CONFIG_FILE)
            .map_err(|e| AppError::ConfigError(format!("Failed to save {}: {}", CONFIG_FILE, e)))?;
        tracing::info!(path = CONFIG_FILE, "Configuration persisted");
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "persisted": params.persist,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    fn app_state() -> AppState {
        let mut config = AppConfig::default();
        config.upstream.api_key = Some("sk-hidden".to_string());
        AppState::new(config)
    }

    #[actix_web::test]
    async fn test_get_config_redacts_credential() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/config").to_request()).await;
        assert_eq!(body["config"]["upstream"]["default_api_key"], true);
        assert_eq!(body["config"]["session"]["voice"], "alloy");
        assert!(!body.to_string().contains("sk-hidden"));
    }

    #[actix_web::test]
    async fn test_update_applies_and_rejects_invalid() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let ok = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"session": {"voice": "verse"}, "performance": {"max_concurrent_sessions": 4}}))
            .to_request();
        let response = test::call_service(&app, ok).await;
        assert!(response.status().is_success());
        assert_eq!(state.get_config().session.voice, "verse");
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 4);

        let bad = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"session": {"temperature": 3.0}}))
            .to_request();
        let response = test::call_service(&app, bad).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().session.temperature, 0.8);
    }
}
