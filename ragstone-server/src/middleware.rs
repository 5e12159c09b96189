// Copyright 2025 Ragstone (https://github.com/ragstone)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Request middleware: identity extraction + rate gating, and trace-id
//! request logging with metrics. Stack order (outermost first): CORS →
//! identity/gate → request logging → routing; none of it is optional.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use ragstone_core::ApiEnvelope;

use crate::api::AppState;
use crate::gate::{GateDecision, UserIdentity};

/// Trace id attached to every request, injected into response headers and
/// downstream logs.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

fn peer_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        // In-process callers (tests, health probes) count as loopback.
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Identity extraction and admission. Rejections answer 429 here and
/// never reach a handler.
pub async fn admission_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = peer_ip(&request);
    let (identity, decision) = state.gate.admit(request.headers(), peer);

    match decision {
        GateDecision::Allowed { .. } => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        GateDecision::RateLimited { .. } | GateDecision::IntervalLimited { .. } => {
            let reason = match decision {
                GateDecision::RateLimited { .. } => "quota",
                _ => "min-interval",
            };
            tracing::warn!(
                user_id = %identity.user_id,
                tier = %identity.tier,
                reason,
                "request rejected by rate gate"
            );
            state.metrics.record(
                request.method().as_str(),
                request.uri().path(),
                StatusCode::TOO_MANY_REQUESTS.as_u16(),
                std::time::Duration::ZERO,
                0,
                0,
            );

            let envelope = ApiEnvelope::error(
                match reason {
                    "quota" => format!(
                        "rate limit exceeded for tier '{}', retry in {}s",
                        identity.tier,
                        decision.retry_after_secs()
                    ),
                    _ => format!(
                        "requests too frequent, minimum interval not met; retry in {}s",
                        decision.retry_after_secs()
                    ),
                },
                "rate-limited",
                Some(serde_json::json!({ "reason": reason })),
            );
            let mut response =
                (StatusCode::TOO_MANY_REQUESTS, Json(envelope)).into_response();
            if let Ok(value) = HeaderValue::from_str(&decision.retry_after_secs().to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Structured request logging: one trace id per request, a span carrying
/// it for all downstream logs, and a metrics record on completion.
pub async fn logging_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let trace_id = uuid::Uuid::new_v4().simple().to_string();
    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let identity = request
        .extensions()
        .get::<UserIdentity>()
        .map(|i| i.user_id.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    let bytes_in = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let span = tracing::info_span!(
        "request",
        trace_id = %trace_id,
        method = %method,
        route = %route,
        user = %identity
    );
    let started = Instant::now();

    span.in_scope(|| tracing::info!("request started"));
    let mut response = {
        use tracing::Instrument;
        next.run(request).instrument(span.clone()).await
    };

    let latency = started.elapsed();
    let status = response.status();
    let bytes_out = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    span.in_scope(|| {
        if latency.as_secs_f64() > 5.0 {
            tracing::warn!(
                status = status.as_u16(),
                latency_ms = latency.as_millis() as u64,
                "slow request"
            );
        } else {
            tracing::info!(
                status = status.as_u16(),
                latency_ms = latency.as_millis() as u64,
                "request completed"
            );
        }
    });

    state
        .metrics
        .record(method.as_str(), &route, status.as_u16(), latency, bytes_in, bytes_out);

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert("x-trace-id", value);
    }
    response
}

/// Panic recovery body: the catch-panic layer calls this to produce the
/// `internal` envelope instead of tearing the connection down.
pub fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");

    let envelope = ApiEnvelope::error("internal server error", "internal", None);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(envelope)).into_response()
}
