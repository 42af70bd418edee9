//! Request handlers for the artifact cache protocol.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use morph_cache::{CacheFilename, ClaimOutcome};
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio_util::io::ReaderStream;

#[derive(Deserialize)]
pub struct ArtifactQuery {
    pub filename: String,
}

#[derive(Deserialize)]
pub struct FetchQuery {
    pub url: String,
}

/// `GET /1.0/artifacts?filename=KEY.KIND.NAME` (HEAD gets the status
/// with no body). 409 while a writer holds the key's claim.
pub async fn get_artifact(
    State(state): State<AppState>,
    Query(query): Query<ArtifactQuery>,
) -> ApiResult<Response> {
    let filename = CacheFilename::parse(&query.filename)?;
    let key = *filename.key();
    let path = state.cache.dir().join(filename.to_filename());

    if !path.exists() {
        if state.cache.is_in_flight(&key) {
            return Err(ApiError::Busy(query.filename));
        }
        return Err(ApiError::NotFound(query.filename));
    }

    // Bump last_access through the cache for real artifact reads.
    let file = match &filename {
        CacheFilename::Artifact { kind, name, .. } => {
            state.cache.open_for_read(&key, *kind, name)?
        }
        _ => std::fs::File::open(&path).map_err(|e| ApiError::Internal(e.to_string()))?,
    };
    let file = tokio::fs::File::from_std(file);
    let stream = ReaderStream::new(file);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// `POST /1.0/artifacts` multipart upload. Each part's filename names the
/// final cache file; parts are grouped by key and committed atomically
/// per key. Uploading an already-committed key is accepted and ignored.
pub async fn post_artifacts(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<StatusCode> {
    if !state.enable_writes {
        return Err(ApiError::WritesDisabled);
    }

    let mut files: Vec<(CacheFilename, bytes::Bytes)> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let filename = field
            .file_name()
            .map(|s| s.to_string())
            .or_else(|| field.name().map(|s| s.to_string()))
            .ok_or_else(|| ApiError::BadRequest("multipart part without a name".to_string()))?;
        let parsed = CacheFilename::parse(&filename)?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        files.push((parsed, bytes));
    }
    if files.is_empty() {
        return Err(ApiError::BadRequest("empty upload".to_string()));
    }

    let mut by_key: BTreeMap<morph_core::CacheKey, Vec<(CacheFilename, bytes::Bytes)>> =
        BTreeMap::new();
    for (filename, bytes) in files {
        by_key.entry(*filename.key()).or_default().push((filename, bytes));
    }

    for (key, group) in by_key {
        match state.cache.claim(&key)? {
            ClaimOutcome::Done => {
                tracing::debug!(key = %key, "upload for committed key, ignoring");
            }
            ClaimOutcome::Busy => return Err(ApiError::Busy(key.to_hex())),
            ClaimOutcome::Claimed(mut claim) => {
                for (filename, bytes) in &group {
                    let partial = claim.partial_for(filename);
                    std::fs::write(&partial, bytes)
                        .map_err(|e| ApiError::Internal(e.to_string()))?;
                }
                claim.commit()?;
                tracing::info!(key = %key, files = group.len(), "upload committed");
            }
        }
    }

    Ok(StatusCode::CREATED)
}

/// `GET /1.0/fetch?url=U`: pull one cache file from another cache into
/// this one. The url must carry the target's `filename` query parameter.
pub async fn fetch(
    State(state): State<AppState>,
    Query(query): Query<FetchQuery>,
) -> ApiResult<StatusCode> {
    if !state.enable_writes {
        return Err(ApiError::WritesDisabled);
    }

    let url: reqwest::Url = query
        .url
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("bad url: {e}")))?;
    let filename = url
        .query_pairs()
        .find(|(name, _)| name == "filename")
        .map(|(_, value)| value.to_string())
        .ok_or_else(|| {
            ApiError::BadRequest("fetch url has no filename parameter".to_string())
        })?;
    let parsed = CacheFilename::parse(&filename)?;

    let response = state
        .http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match response.status() {
        reqwest::StatusCode::OK => {}
        reqwest::StatusCode::NOT_FOUND => return Err(ApiError::NotFound(filename)),
        reqwest::StatusCode::CONFLICT => return Err(ApiError::Busy(filename)),
        status => {
            return Err(ApiError::Internal(format!(
                "upstream cache answered {status}"
            )));
        }
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    match state.cache.claim(parsed.key())? {
        ClaimOutcome::Done => Ok(StatusCode::OK),
        ClaimOutcome::Busy => Err(ApiError::Busy(filename)),
        ClaimOutcome::Claimed(mut claim) => {
            let partial = claim.partial_for(&parsed);
            std::fs::write(&partial, &bytes).map_err(|e| ApiError::Internal(e.to_string()))?;
            claim.commit()?;
            tracing::info!(file = %filename, bytes = bytes.len(), "fetched from upstream");
            Ok(StatusCode::OK)
        }
    }
}
