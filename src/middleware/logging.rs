//! Request logging for the HTTP port.
//!
//! Each request gets a short request id and a span carrying it, so log lines
//! emitted by handlers can be tied back to the request. Liveness probes are
//! logged at debug level to keep the info stream readable.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

const PROBE_PATHS: [&str; 2] = ["/health", "/api/v1/health"];

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingService { service }))
    }
}

pub struct RequestLoggingService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let probe = PROBE_PATHS.contains(&req.path());
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        let span = info_span!(
            "http_request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.path()
        );
        if !probe {
            span.in_scope(|| info!(remote_addr = %remote_addr, "Request started"));
        }

        let fut = self.service.call(req);

        Box::pin(
            async move {
                let result = fut.await;
                let elapsed_ms = started.elapsed().as_millis() as u64;

                match &result {
                    Ok(response) if probe => {
                        debug!(status = response.status().as_u16(), elapsed_ms, "Probe served");
                    }
                    Ok(response) => {
                        info!(status = response.status().as_u16(), elapsed_ms, "Request completed");
                    }
                    Err(err) => {
                        error!(elapsed_ms, error = %err, "Request failed");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}
