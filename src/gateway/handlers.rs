// Endpoint logic: resolve the player, consult caches, dispatch to the pool
use std::sync::Arc;
use std::time::Instant;

use reqwest::Url;
use tracing::{debug, warn};

use super::types::{
    non_empty, DecryptSignatureRequest, DecryptSignatureResponse, GetStsRequest, GetStsResponse,
    ResolveUrlRequest, ResolveUrlResponse,
};
use super::{AppContext, GatewayError};
use crate::fetcher::ResolvedScript;
use crate::worker::{ChallengeKind, ChallengeRequest, ChallengeResponse, InputKind, SolverInput};

const DEFAULT_SIGNATURE_KEY: &str = "sig";

fn require<'a>(value: &'a str, field: &'static str) -> Result<&'a str, GatewayError> {
    if value.is_empty() {
        return Err(GatewayError::MissingField(field));
    }
    Ok(value)
}

pub async fn decrypt_signature(
    ctx: &AppContext,
    request: DecryptSignatureRequest,
) -> Result<DecryptSignatureResponse, GatewayError> {
    let player_url = require(&request.player_url, "player_url")?;
    decrypt(
        ctx,
        player_url,
        non_empty(&request.encrypted_signature),
        non_empty(&request.n_param),
    )
    .await
}

pub async fn get_sts(
    ctx: &AppContext,
    request: GetStsRequest,
) -> Result<GetStsResponse, GatewayError> {
    let player_url = require(&request.player_url, "player_url")?;
    let script = ctx.fetcher.resolve(player_url).await?;

    if let Some(sts) = ctx.timestamps.get(&script.key) {
        ctx.metrics.record_result_hit();
        return Ok(GetStsResponse { sts });
    }
    ctx.metrics.record_result_miss();

    let content = ctx.fetcher.content(&script).await?;
    let sts = ctx
        .timestamp_pattern()
        .captures(&content)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(GatewayError::TimestampNotFound)?;

    ctx.timestamps.set(script.key.clone(), sts.clone());
    Ok(GetStsResponse { sts })
}

pub async fn resolve_url(
    ctx: &AppContext,
    request: ResolveUrlRequest,
) -> Result<ResolveUrlResponse, GatewayError> {
    let stream_url = require(&request.stream_url, "stream_url")?;
    let player_url = require(&request.player_url, "player_url")?;
    let mut url = Url::parse(stream_url)
        .map_err(|e| GatewayError::InvalidUrl(format!("{}: {}", stream_url, e)))?;

    let signature = non_empty(&request.encrypted_signature);
    let signature_key = non_empty(&request.signature_key).unwrap_or(DEFAULT_SIGNATURE_KEY);
    let n_param = match non_empty(&request.n_param) {
        Some(n) => Some(n.to_string()),
        None => url
            .query_pairs()
            .find(|(key, _)| key == "n")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty()),
    };

    let decrypted = decrypt(ctx, player_url, signature, n_param.as_deref()).await?;

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !(signature.is_some() && (key == "s" || key == signature_key)))
        .map(|(key, value)| {
            if key == "n" && n_param.is_some() {
                (key.into_owned(), decrypted.decrypted_n_sig.clone())
            } else {
                (key.into_owned(), value.into_owned())
            }
        })
        .collect();

    let has_n = pairs.iter().any(|(key, _)| key == "n");
    if n_param.is_some() && !has_n {
        pairs.push(("n".to_string(), decrypted.decrypted_n_sig.clone()));
    }
    if signature.is_some() {
        pairs.push((signature_key.to_string(), decrypted.decrypted_signature.clone()));
    }

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    Ok(ResolveUrlResponse {
        resolved_url: url.to_string(),
    })
}

/// Shared decrypt path: result cache, then exactly one solver task
async fn decrypt(
    ctx: &AppContext,
    player_url: &str,
    signature: Option<&str>,
    n_param: Option<&str>,
) -> Result<DecryptSignatureResponse, GatewayError> {
    let script = ctx.fetcher.resolve(player_url).await?;

    if signature.is_none() && n_param.is_none() {
        return Ok(DecryptSignatureResponse::default());
    }

    let result_key = format!(
        "{}:{}:{}",
        script.path.display(),
        signature.unwrap_or_default(),
        n_param.unwrap_or_default()
    );
    if let Some(cached) = ctx.signatures.get(&result_key) {
        debug!("Result cache hit for {}", script.key);
        ctx.metrics.record_result_hit();
        return Ok(cached);
    }
    ctx.metrics.record_result_miss();

    let mut requests = Vec::new();
    if let Some(signature) = signature {
        requests.push(ChallengeRequest {
            kind: ChallengeKind::Signature,
            challenges: vec![signature.to_string()],
        });
    }
    if let Some(n) = n_param {
        requests.push(ChallengeRequest {
            kind: ChallengeKind::NParameter,
            challenges: vec![n.to_string()],
        });
    }

    let responses = solve(ctx, &script, requests).await?;
    let mut answers = responses.into_iter();
    let mut response = DecryptSignatureResponse::default();
    if let Some(signature) = signature {
        response.decrypted_signature = answer(answers.next(), signature)?;
    }
    if let Some(n) = n_param {
        response.decrypted_n_sig = answer(answers.next(), n)?;
    }

    ctx.signatures.set(result_key, response.clone());
    Ok(response)
}

fn answer(response: Option<ChallengeResponse>, challenge: &str) -> Result<String, GatewayError> {
    match response {
        Some(ChallengeResponse::Result { mut data }) => data
            .remove(challenge)
            .ok_or_else(|| GatewayError::Engine(format!("no answer for challenge {}", challenge))),
        Some(ChallengeResponse::Error { message }) => Err(GatewayError::Engine(message)),
        None => Err(GatewayError::Engine("missing response".to_string())),
    }
}

/// Runs one solver task, preferring a preprocessed player over the raw one.
/// A preprocessed form produced along the way is stored for later tasks.
async fn solve(
    ctx: &AppContext,
    script: &ResolvedScript,
    requests: Vec<ChallengeRequest>,
) -> Result<Vec<ChallengeResponse>, GatewayError> {
    let input = match preprocessed(ctx, &script.key).await {
        Some(content) => SolverInput {
            kind: InputKind::Preprocessed,
            content: (*content).clone(),
            emit_preprocessed: false,
            requests,
        },
        None => {
            let raw = ctx.fetcher.content(script).await?;
            SolverInput {
                kind: InputKind::Player,
                content: (*raw).clone(),
                emit_preprocessed: true,
                requests,
            }
        }
    };
    let from_player = input.kind == InputKind::Player;

    let started = Instant::now();
    let result = ctx.pool.exec(input).await?;
    debug!("Solved {} in {:?}", script.key, started.elapsed());

    if from_player {
        if let Some(output) = result.preprocessed_output {
            if let Err(e) = ctx.preprocessed.set(&script.key, &output, Some(script.url.as_str())).await {
                warn!("Failed to cache preprocessed player {}: {}", script.key, e);
            }
            ctx.preprocessed_memory.set(script.key.clone(), Arc::new(output));
        }
    }

    Ok(result.responses)
}

async fn preprocessed(ctx: &AppContext, key: &str) -> Option<Arc<String>> {
    if let Some(content) = ctx.preprocessed_memory.get(key) {
        return Some(content);
    }

    let content = Arc::new(ctx.preprocessed.get(key).await?);
    ctx.preprocessed_memory.set(key, content.clone());
    Some(content)
}
