use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ApiError;
use crate::formats::{new_reference, SignatureRequest, SignatureResponse};
use crate::hawk::{self, AuthError, RequestInfo};
use crate::server::AppState;
use crate::signing::AnySigner;

/// Reserved credential id for the monitoring endpoint; never part of
/// the authorization matrix.
pub const MONITOR_PRINCIPAL: &str = "monitor";

/// Which signing operation a route requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    File,
    Data,
    Hash,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::File => "file",
            Capability::Data => "data",
            Capability::Hash => "hash",
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Hawk-authenticates a request against a known secret and records its
/// nonce. Shared by the signing routes and the monitor.
fn verify_hawk(
    state: &AppState,
    parsed: &hawk::HawkHeader,
    secret: &str,
    method: &str,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ApiError> {
    let (host, port) = hawk::host_port(headers, state.trust_forwarded, state.fallback_port)?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let req = RequestInfo {
        method,
        path,
        host: &host,
        port,
        content_type: content_type(headers),
        body,
    };
    hawk::verify_request(parsed, secret, &req, state.max_skew, unix_now())?;
    state.nonces.check_and_insert(&parsed.id, &parsed.nonce)?;
    Ok(())
}

fn parse_authorization(headers: &HeaderMap) -> Result<hawk::HawkHeader, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AuthError::MalformedHeader("missing Authorization header".into()))?;
    Ok(hawk::parse_header(value)?)
}

/// Authenticates a signing request and returns the principal id.
fn authenticate(
    state: &AppState,
    method: &str,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String, ApiError> {
    let parsed = parse_authorization(headers)?;
    let principal = state
        .principals
        .get(&parsed.id)
        .ok_or(AuthError::UnknownPrincipal)?;
    verify_hawk(state, &parsed, &principal.key, method, uri, headers, body)?;
    Ok(parsed.id)
}

pub async fn sign_file(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    sign(state, Capability::File, uri, headers, body).await
}

pub async fn sign_data(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    sign(state, Capability::Data, uri, headers, body).await
}

pub async fn sign_hash(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    sign(state, Capability::Hash, uri, headers, body).await
}

/// One handler for all three signing routes; the route fixes the
/// required capability. Tasks are processed and answered in input
/// order.
async fn sign(
    state: Arc<AppState>,
    capability: Capability,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = authenticate(&state, "POST", &uri, &headers, &body)?;

    let tasks: Vec<SignatureRequest> = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("failed to parse request body: {e}")))?;

    let mut responses = Vec::with_capacity(tasks.len());
    for task in tasks {
        let input = decode_input(capability, &task.input)?;
        let signer_id = state
            .authorizations
            .resolve(&principal, task.key_id.as_deref())
            .map_err(ApiError::Auth)?;
        let signer = state.signers.get(signer_id).cloned().ok_or_else(|| {
            ApiError::Unexpected(anyhow::anyhow!("registry is missing signer {signer_id:?}"))
        })?;
        let options = merge_options(signer.defaults(), task.options.as_ref());
        responses.push(invoke(signer, capability, input, options).await?);
    }

    tracing::info!(
        principal = %principal,
        capability = capability.as_str(),
        tasks = responses.len(),
        "signing request served"
    );
    Ok((StatusCode::CREATED, Json(responses)).into_response())
}

/// The signer's defaults overlaid with the task's options; task keys
/// win.
fn merge_options(
    defaults: serde_json::Value,
    overrides: Option<&serde_json::Value>,
) -> serde_json::Value {
    let Some(overrides) = overrides else {
        return defaults;
    };
    let mut merged = defaults;
    match (merged.as_object_mut(), overrides.as_object()) {
        (Some(base), Some(keys)) => {
            for (key, value) in keys {
                base.insert(key.clone(), value.clone());
            }
        }
        _ => return overrides.clone(),
    }
    merged
}

fn decode_input(capability: Capability, input: &str) -> Result<Vec<u8>, ApiError> {
    match capability {
        Capability::File | Capability::Data => B64
            .decode(input)
            .map_err(|e| ApiError::BadRequest(format!("invalid base64 input: {e}"))),
        Capability::Hash => hex::decode(input)
            .map_err(|e| ApiError::BadRequest(format!("invalid hex digest: {e}"))),
    }
}

fn capability_error(signer: &AnySigner, capability: Capability) -> ApiError {
    ApiError::CapabilityUnsupported {
        id: signer.id().to_string(),
        capability: capability.as_str(),
    }
}

/// Runs one signing task on the blocking pool and assembles its
/// response entry.
async fn invoke(
    signer: Arc<AnySigner>,
    capability: Capability,
    input: Vec<u8>,
    options: serde_json::Value,
) -> Result<SignatureResponse, ApiError> {
    match capability {
        Capability::File => {
            if signer.as_file_signer().is_none() {
                return Err(capability_error(&signer, capability));
            }
        }
        Capability::Data => {
            if signer.as_data_signer().is_none() {
                return Err(capability_error(&signer, capability));
            }
        }
        Capability::Hash => match signer.as_hash_signer() {
            None => return Err(capability_error(&signer, capability)),
            Some(hash_signer) => {
                let expected = hash_signer.expected_digest_len();
                if input.len() != expected {
                    return Err(ApiError::BadRequest(format!(
                        "signer {:?} expects a {expected}-byte digest, got {} bytes",
                        signer.id(),
                        input.len()
                    )));
                }
            }
        },
    }

    let worker = signer.clone();
    let signed = tokio::task::spawn_blocking(move || match capability {
        Capability::File => worker.as_file_signer().map(|s| s.sign_file(&input, &options)),
        Capability::Data => worker.as_data_signer().map(|s| s.sign_data(&input, &options)),
        Capability::Hash => worker.as_hash_signer().map(|s| s.sign_hash(&input, &options)),
    })
    .await
    .map_err(|e| ApiError::Unexpected(anyhow::anyhow!("signing task failed to run: {e}")))?;

    let signed = match signed {
        Some(result) => result.map_err(|source| ApiError::Signer {
            id: signer.id().to_string(),
            source,
        })?,
        None => return Err(capability_error(&signer, capability)),
    };

    let config = signer.config();
    let (signature, signed_file) = match capability {
        Capability::File => (None, Some(B64.encode(&signed))),
        Capability::Data | Capability::Hash => (Some(signer.encode_signature(&signed)), None),
    };
    Ok(SignatureResponse {
        reference: new_reference(),
        type_tag: config.type_tag.to_string(),
        mode: config.mode,
        signer_id: config.id,
        public_key: signer.public_key(),
        signature,
        signed_file,
        x5u: signer.x5u(),
    })
}

/// Picks the digest matching a hash signer's expected length, for
/// monitoring hash-only signers.
fn digest_for_len(input: &[u8], len: usize) -> Option<Vec<u8>> {
    match len {
        32 => Some(Sha256::digest(input).to_vec()),
        48 => Some(Sha384::digest(input).to_vec()),
        64 => Some(Sha512::digest(input).to_vec()),
        _ => None,
    }
}

/// `GET /__monitor__`: one signed response per registered signer over a
/// fixed input, authenticated by the dedicated monitoring credential.
pub async fn monitor(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Some(monitoring_key) = state.monitoring_key.clone() else {
        return Ok((StatusCode::NOT_FOUND, "monitoring is not configured").into_response());
    };

    let parsed = parse_authorization(&headers)?;
    if parsed.id != MONITOR_PRINCIPAL {
        return Err(AuthError::UnknownPrincipal.into());
    }
    verify_hawk(&state, &parsed, &monitoring_key, "GET", &uri, &headers, b"")?;

    let mut signer_ids: Vec<String> = state.signers.keys().cloned().collect();
    signer_ids.sort();

    let mut responses = Vec::with_capacity(signer_ids.len());
    for id in signer_ids {
        let signer = state.signers.get(&id).cloned().ok_or_else(|| {
            ApiError::Unexpected(anyhow::anyhow!("registry is missing signer {id:?}"))
        })?;
        let input = signer.monitoring_input().to_vec();

        let options = signer.defaults();
        let response = if signer.as_data_signer().is_some() {
            invoke(signer, Capability::Data, input, options).await?
        } else if let Some(hash_signer) = signer.as_hash_signer() {
            let digest = digest_for_len(&input, hash_signer.expected_digest_len())
                .ok_or_else(|| {
                    ApiError::Unexpected(anyhow::anyhow!(
                        "signer {id:?} expects an unsupported digest length"
                    ))
                })?;
            invoke(signer.clone(), Capability::Hash, digest, options).await?
        } else {
            invoke(signer, Capability::File, input, options).await?
        };
        responses.push(response);
    }

    Ok((StatusCode::CREATED, Json(responses)).into_response())
}

pub async fn heartbeat() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn lbheartbeat() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn version() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
