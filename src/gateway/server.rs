// HTTP front end
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::HttpBody;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::handlers;
use super::types::{ErrorResponse, HealthResponse};
use super::{AppContext, GatewayError};
use crate::rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Serves the gateway until `shutdown` resolves
pub async fn serve(
    ctx: Arc<AppContext>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), hyper::Error> {
    let addr = ctx.config.server.bind_address;
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        requests_per_second_per_ip: ctx.config.server.requests_per_second_per_ip,
        global_requests_per_second: ctx.config.server.requests_per_second,
    }));

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let ctx = ctx.clone();
        let limiter = limiter.clone();
        let remote = conn.remote_addr();

        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let ctx = ctx.clone();
                let limiter = limiter.clone();
                async move { Ok::<_, Infallible>(handle(&ctx, &limiter, req, remote).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("Gateway listening on http://{}", addr);

    server.with_graceful_shutdown(shutdown).await
}

/// Routes one request. Never fails: every error becomes a JSON error body.
pub async fn handle(
    ctx: &AppContext,
    limiter: &RateLimiter,
    req: Request<Body>,
    remote: SocketAddr,
) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("request", id = %request_id, method = %req.method(), path = %req.uri().path());

    async move {
        let started = Instant::now();

        let mut response = match limiter.check(remote.ip()) {
            RateLimitResult::Allowed => route(ctx, req).await,
            RateLimitResult::RateLimited(reason) => {
                debug!("Rate limited {}: {:?}", remote.ip(), reason);
                ctx.metrics.record_rate_limited();
                error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests")
            }
        };

        let status = response.status();
        ctx.metrics.record_request(started.elapsed(), status.is_success());
        if status.is_server_error() {
            warn!("Responded {} in {:?}", status, started.elapsed());
        } else {
            debug!("Responded {} in {:?}", status, started.elapsed());
        }

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}

async fn route(ctx: &AppContext, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();

    if path != "/health" && !authorized(ctx, &req) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    match (req.method(), path.as_str()) {
        (&Method::GET, "/health") => health(ctx).await,
        (&Method::GET, "/metrics") => Response::builder()
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(ctx.metrics.render_prometheus()))
            .unwrap_or_else(|_| internal_error()),
        (&Method::POST, "/decrypt_signature") => match read_json(ctx, req).await {
            Ok(body) => respond(handlers::decrypt_signature(ctx, body).await),
            Err(response) => response,
        },
        (&Method::POST, "/get_sts") => match read_json(ctx, req).await {
            Ok(body) => respond(handlers::get_sts(ctx, body).await),
            Err(response) => response,
        },
        (&Method::POST, "/resolve_url") => match read_json(ctx, req).await {
            Ok(body) => respond(handlers::resolve_url(ctx, body).await),
            Err(response) => response,
        },
        (_, "/health" | "/metrics" | "/decrypt_signature" | "/get_sts" | "/resolve_url") => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
        }
        _ => error_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

fn authorized(ctx: &AppContext, req: &Request<Body>) -> bool {
    match &ctx.config.server.api_token {
        None => true,
        Some(token) => req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value == token)
            .unwrap_or(false),
    }
}

async fn health(ctx: &AppContext) -> Response<Body> {
    let stats = ctx.pool.stats().await;
    let body = HealthResponse {
        status: if ctx.pool.is_running() { "ok" } else { "shutting_down" },
        version: env!("CARGO_PKG_VERSION"),
        workers: stats.workers,
        busy_workers: stats.busy,
        queued_tasks: stats.queued,
        cached_scripts: ctx.scripts.len().await,
        cached_preprocessed: ctx.preprocessed.len().await,
    };
    json_response(StatusCode::OK, &body)
}

async fn read_json<T: DeserializeOwned>(
    ctx: &AppContext,
    req: Request<Body>,
) -> Result<T, Response<Body>> {
    let limit = ctx.config.server.max_body_bytes;
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.map(|len| len > limit).unwrap_or(false) {
        return Err(error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"));
    }

    // Enforced per chunk so a body without a length header is cut off as
    // soon as it passes the limit
    let mut body = req.into_body();
    let mut bytes = Vec::with_capacity(declared.unwrap_or(0));
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| {
            debug!("Failed to read request body: {}", e);
            error_response(StatusCode::BAD_REQUEST, "Unreadable request body")
        })?;
        if bytes.len() + chunk.len() > limit {
            return Err(error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"));
        }
        bytes.extend_from_slice(&chunk);
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("Invalid JSON body: {}", e)))
}

fn respond<T: Serialize>(result: Result<T, GatewayError>) -> Response<Body> {
    match result {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                error!("Request failed: {}", e);
            } else {
                debug!("Request rejected: {}", e);
            }
            error_response(status, &e.to_string())
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| internal_error()),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            internal_error()
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    json_response(
        status,
        &ErrorResponse {
            error: message.to_string(),
        },
    )
}

fn internal_error() -> Response<Body> {
    let mut response = Response::new(Body::from("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
