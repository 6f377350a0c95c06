// Request and response bodies
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DecryptSignatureRequest {
    pub player_url: String,
    pub encrypted_signature: Option<String>,
    pub n_param: Option<String>,
}

/// Decrypted signature and n parameter. Empty strings stand for challenges
/// that were not asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptSignatureResponse {
    pub decrypted_signature: String,
    pub decrypted_n_sig: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GetStsRequest {
    pub player_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStsResponse {
    pub sts: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResolveUrlRequest {
    pub stream_url: String,
    pub player_url: String,
    pub encrypted_signature: Option<String>,
    pub signature_key: Option<String>,
    pub n_param: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveUrlResponse {
    pub resolved_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    pub cached_scripts: usize,
    pub cached_preprocessed: usize,
}

/// Treats `Some("")` like an absent field
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
