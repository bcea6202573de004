//! # Application State Management
//!
//! Shared state for the HTTP handlers and the relay connection manager.
//!
//! ## What is shared (and what is not):
//! - **config**: the current configuration. Sessions never hold a reference to it;
//!   they take an owned snapshot at construction time.
//! - **metrics**: counters updated by middleware and by session lifecycle events.
//! - **start_time**: immutable, used for uptime.
//!
//! Relay sessions do not share any mutable state with each other. The only
//! thing they touch here is their slot in the session count, through a
//! [`SessionPermit`].
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers (on many worker threads) hold the same state
//! - **RwLock**: concurrent readers, exclusive writers
//! - Poisoned locks are recovered rather than propagated: the data behind them
//!   is plain counters and config, which stay consistent after a panic elsewhere.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests and relay sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors since server start
    pub error_count: u64,

    /// Relay sessions currently holding a slot
    pub active_sessions: u32,

    /// Relay sessions started since server start
    pub sessions_total: u64,

    /// Connections turned away (missing credential or no free slot)
    pub sessions_rejected: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// A reserved relay session slot.
///
/// Created by [`AppState::try_acquire_session`] and released exactly once when
/// dropped, whichever way the session ends.
#[derive(Debug)]
pub struct SessionPermit {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately and gives the caller a snapshot
    /// that cannot change underneath it.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    /// Reserve a relay session slot if fewer than `max_sessions` are active.
    ///
    /// The check and the increment happen under one write lock, so two
    /// connections racing for the last slot cannot both get it.
    pub fn try_acquire_session(&self, max_sessions: usize) -> Option<SessionPermit> {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions as usize >= max_sessions {
            metrics.sessions_rejected += 1;
            return None;
        }
        metrics.active_sessions += 1;
        metrics.sessions_total += 1;
        Some(SessionPermit {
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Count a connection refused before it got a session (e.g. missing credential).
    pub fn record_rejected_session(&self) {
        self.write_metrics().sessions_rejected += 1;
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn write_metrics(&self) -> std::sync::RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 (no errors) and 1.0 (every request failed).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_permits_respect_capacity() {
        let state = AppState::new(AppConfig::default());

        let first = state.try_acquire_session(2).expect("first slot");
        let _second = state.try_acquire_session(2).expect("second slot");
        assert!(state.try_acquire_session(2).is_none());

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 2);
        assert_eq!(metrics.sessions_total, 2);
        assert_eq!(metrics.sessions_rejected, 1);

        drop(first);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);
        assert!(state.try_acquire_session(2).is_some());
    }

    #[test]
    fn test_permit_released_once() {
        let state = AppState::new(AppConfig::default());
        let permit = state.try_acquire_session(1).unwrap();
        drop(permit);
        drop(state.try_acquire_session(1));
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = AppState::new(AppConfig::default());
        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 32);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }
}
