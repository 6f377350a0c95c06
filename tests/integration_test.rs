use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Method, Request, StatusCode};
use reqwest::Url;
use tempfile::TempDir;

use yt_cipher_rs::{
    config::AppConfig,
    fetcher::{FetchError, ScriptSource},
    gateway::{
        self, handlers, AppContext, DecryptSignatureRequest, DecryptSignatureResponse,
        GatewayError, GetStsRequest, ResolveUrlRequest,
    },
    rate_limit::{RateLimitConfig, RateLimiter},
    worker::{
        CancelToken, ChallengeKind, ChallengeResponse, InputKind, SolveResult, SolverInput, SolverOutput,
        SolvingEngine,
    },
};

const PLAYER_URL: &str = "https://www.youtube.com/s/player/abc123/base.js";

struct CountingSource {
    calls: AtomicUsize,
}

#[async_trait]
impl ScriptSource for CountingSource {
    async fn fetch(&self, _url: &Url) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("var cfg={signatureTimestamp:19834};function decipher(a){return a}".to_string())
    }
}

/// Reverses signatures and upper-cases n values. Emits a preprocessed form
/// whenever asked to.
#[derive(Default)]
struct FakeEngine {
    calls: AtomicUsize,
    kinds: Mutex<Vec<InputKind>>,
}

impl SolvingEngine for FakeEngine {
    fn solve(&self, input: &SolverInput, _cancel: &CancelToken) -> SolverOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.kinds.lock().unwrap().push(input.kind);

        let responses = input
            .requests
            .iter()
            .map(|request| ChallengeResponse::Result {
                data: request
                    .challenges
                    .iter()
                    .map(|challenge| {
                        let answer = match request.kind {
                            ChallengeKind::Signature => challenge.chars().rev().collect(),
                            ChallengeKind::NParameter => challenge.to_uppercase(),
                        };
                        (challenge.clone(), answer)
                    })
                    .collect(),
            })
            .collect();

        SolverOutput::Result(SolveResult {
            preprocessed_output: input
                .emit_preprocessed
                .then(|| format!("/* preprocessed */{}", input.content)),
            responses,
        })
    }
}

struct Harness {
    ctx: Arc<AppContext>,
    source: Arc<CountingSource>,
    engine: Arc<FakeEngine>,
}

fn config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.cache.cache_dir = dir.path().to_path_buf();
    config.cache.metadata_flush_delay = Duration::ZERO;
    config.worker.pool_size = 2;
    config.worker.task_timeout = Duration::from_secs(5);
    config
}

fn harness(config: AppConfig) -> Harness {
    let source = Arc::new(CountingSource {
        calls: AtomicUsize::new(0),
    });
    let engine = Arc::new(FakeEngine::default());
    let ctx = AppContext::with_source(config, engine.clone(), source.clone())
        .expect("Failed to build context");

    Harness {
        ctx: Arc::new(ctx),
        source,
        engine,
    }
}

fn decrypt_request(sig: &str, n: &str) -> DecryptSignatureRequest {
    DecryptSignatureRequest {
        player_url: PLAYER_URL.to_string(),
        encrypted_signature: Some(sig.to_string()),
        n_param: Some(n.to_string()),
    }
}

#[tokio::test]
async fn test_repeated_decrypt_is_served_from_cache() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir));

    let first = handlers::decrypt_signature(&h.ctx, decrypt_request("XYZ", "123abc"))
        .await
        .unwrap();
    let second = handlers::decrypt_signature(&h.ctx, decrypt_request("XYZ", "123abc"))
        .await
        .unwrap();

    let expected = DecryptSignatureResponse {
        decrypted_signature: "ZYX".to_string(),
        decrypted_n_sig: "123ABC".to_string(),
    };
    assert_eq!(first, expected);
    assert_eq!(second, expected);
    assert_eq!(h.engine.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);

    let snapshot = h.ctx.metrics.snapshot();
    assert_eq!(snapshot.result_hits, 1);
    assert_eq!(snapshot.engine_invocations, 1);

    h.ctx.shutdown().await;
}

#[tokio::test]
async fn test_new_challenge_uses_preprocessed_player() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir));

    handlers::decrypt_signature(&h.ctx, decrypt_request("AAA", "n1"))
        .await
        .unwrap();
    let other = handlers::decrypt_signature(&h.ctx, decrypt_request("BCD", "n2"))
        .await
        .unwrap();

    assert_eq!(other.decrypted_signature, "DCB");
    assert_eq!(
        *h.engine.kinds.lock().unwrap(),
        vec![InputKind::Player, InputKind::Preprocessed]
    );
    assert_eq!(h.ctx.preprocessed.len().await, 1);

    h.ctx.shutdown().await;
}

#[tokio::test]
async fn test_caches_survive_restart() {
    let dir = TempDir::new().unwrap();

    let first = harness(config(&dir));
    handlers::decrypt_signature(&first.ctx, decrypt_request("XYZ", "n"))
        .await
        .unwrap();
    first.ctx.shutdown().await;

    let second = harness(config(&dir));
    let response = handlers::decrypt_signature(&second.ctx, decrypt_request("QRS", "m"))
        .await
        .unwrap();

    assert_eq!(response.decrypted_signature, "SRQ");
    assert_eq!(second.source.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        *second.engine.kinds.lock().unwrap(),
        vec![InputKind::Preprocessed]
    );

    second.ctx.shutdown().await;
}

#[tokio::test]
async fn test_get_sts_reads_timestamp_without_worker() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir));

    let request = || GetStsRequest {
        player_url: PLAYER_URL.to_string(),
    };
    assert_eq!(handlers::get_sts(&h.ctx, request()).await.unwrap().sts, "19834");
    assert_eq!(handlers::get_sts(&h.ctx, request()).await.unwrap().sts, "19834");

    assert_eq!(h.engine.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);

    h.ctx.shutdown().await;
}

#[tokio::test]
async fn test_resolve_url_rewrites_query() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir));

    let response = handlers::resolve_url(
        &h.ctx,
        ResolveUrlRequest {
            stream_url: "https://rr1.example.com/videoplayback?itag=18&n=abc&s=XYZ".to_string(),
            player_url: PLAYER_URL.to_string(),
            encrypted_signature: Some("XYZ".to_string()),
            signature_key: None,
            n_param: None,
        },
    )
    .await
    .unwrap();

    let url = Url::parse(&response.resolved_url).unwrap();
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert_eq!(
        pairs,
        vec![
            ("itag".to_string(), "18".to_string()),
            ("n".to_string(), "ABC".to_string()),
            ("sig".to_string(), "ZYX".to_string()),
        ]
    );

    h.ctx.shutdown().await;
}

#[tokio::test]
async fn test_invalid_requests_are_client_errors() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir));

    let missing = handlers::decrypt_signature(&h.ctx, DecryptSignatureRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(missing, GatewayError::MissingField("player_url")));

    let foreign = handlers::decrypt_signature(
        &h.ctx,
        DecryptSignatureRequest {
            player_url: "https://evil.example/s/player/abc123/base.js".to_string(),
            ..decrypt_request("XYZ", "n")
        },
    )
    .await
    .unwrap_err();
    assert_eq!(foreign.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);

    h.ctx.shutdown().await;
}

#[tokio::test]
async fn test_http_routing_and_auth() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.server.api_token = Some("secret".to_string());
    let h = harness(config);
    let limiter = RateLimiter::new(RateLimitConfig::default());
    let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();

    let body = r#"{"player_url":"/s/player/abc123/base.js","encrypted_signature":"XYZ"}"#;
    let request = |token: Option<&str>| {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/decrypt_signature");
        if let Some(token) = token {
            builder = builder.header("authorization", token);
        }
        builder.body(Body::from(body)).unwrap()
    };

    let denied = gateway::handle(&h.ctx, &limiter, request(None), remote).await;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = gateway::handle(&h.ctx, &limiter, request(Some("secret")), remote).await;
    assert_eq!(allowed.status(), StatusCode::OK);
    assert!(allowed.headers().contains_key("x-request-id"));
    let bytes = hyper::body::to_bytes(allowed.into_body()).await.unwrap();
    let decoded: DecryptSignatureResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(decoded.decrypted_signature, "ZYX");
    assert_eq!(decoded.decrypted_n_sig, "");

    let health = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let health = gateway::handle(&h.ctx, &limiter, health, remote).await;
    assert_eq!(health.status(), StatusCode::OK);

    let missing = Request::builder()
        .uri("/nowhere")
        .header("authorization", "secret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        gateway::handle(&h.ctx, &limiter, missing, remote).await.status(),
        StatusCode::NOT_FOUND
    );

    let metrics = Request::builder()
        .uri("/metrics")
        .header("authorization", "secret")
        .body(Body::empty())
        .unwrap();
    let metrics = gateway::handle(&h.ctx, &limiter, metrics, remote).await;
    let text = hyper::body::to_bytes(metrics.into_body()).await.unwrap();
    assert!(String::from_utf8_lossy(&text).contains("ytcipher_requests_total"));

    h.ctx.shutdown().await;
}

#[tokio::test]
async fn test_streamed_body_is_cut_off_at_limit() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.server.max_body_bytes = 1024;
    let h = harness(config);
    let limiter = RateLimiter::new(RateLimitConfig::default());
    let remote: SocketAddr = "127.0.0.1:40001".parse().unwrap();

    // No content-length: the body arrives as an open-ended stream of chunks
    let (mut sender, body) = Body::channel();
    let feeder = tokio::spawn(async move {
        let chunk = hyper::body::Bytes::from(vec![b' '; 1024]);
        let mut sent = 0usize;
        while sent < 10_000 && sender.send_data(chunk.clone()).await.is_ok() {
            sent += 1;
        }
        sent
    });

    let request = Request::builder()
        .method(Method::POST)
        .uri("/decrypt_signature")
        .body(body)
        .unwrap();
    assert!(!request.headers().contains_key("content-length"));

    let response = gateway::handle(&h.ctx, &limiter, request, remote).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let sent = feeder.await.unwrap();
    assert!(sent < 100, "server kept reading {} chunks past the limit", sent);

    h.ctx.shutdown().await;
}

#[tokio::test]
async fn test_requests_after_shutdown_are_unavailable() {
    let dir = TempDir::new().unwrap();
    let h = harness(config(&dir));
    h.ctx.shutdown().await;

    let err = handlers::decrypt_signature(&h.ctx, decrypt_request("XYZ", "n"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}
