//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that lists the bucket and round-trips a probe blob

use crate::{
    models::{ListOptions, WriterOptions},
    services::bucket::Bucket,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness probe. Always 200 OK; never touches the bucket.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Lists a single entry from the bucket.
/// 2. Writes, reads back and deletes a `.readyz-{uuid}` blob.
///
/// HTTP 200 when both checks pass, HTTP 503 otherwise.
pub async fn readyz(State(bucket): State<Bucket>) -> impl IntoResponse {
    let outcome =
        tokio::task::spawn_blocking(move || (list_check(&bucket), blob_check(&bucket))).await;
    let (list_result, blob_result) = match outcome {
        Ok(results) => results,
        Err(e) => {
            let msg = format!("probe task failed: {}", e);
            (Err(msg.clone()), Err(msg))
        }
    };

    let list_ok = list_result.is_ok();
    let blob_ok = blob_result.is_ok();
    let overall_ok = list_ok && blob_ok;

    let mut checks = HashMap::new();
    checks.insert(
        "list",
        CheckStatus {
            ok: list_ok,
            error: list_result.err(),
        },
    );
    checks.insert(
        "blob",
        CheckStatus {
            ok: blob_ok,
            error: blob_result.err(),
        },
    );

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

fn list_check(bucket: &Bucket) -> Result<(), String> {
    bucket
        .list_page(&ListOptions::default().page_size(1))
        .map(|_| ())
        .map_err(|e| format!("could not list: {}", e))
}

fn blob_check(bucket: &Bucket) -> Result<(), String> {
    let key = format!(".readyz-{}", Uuid::new_v4());
    bucket
        .write_all(&key, b"readyz", WriterOptions::default())
        .map_err(|e| format!("could not write probe blob: {}", e))?;

    let read = bucket.read_all(&key);
    // best-effort cleanup; a failed delete is reported only if the read succeeded
    let deleted = bucket.delete(&key);
    match read {
        Ok(bytes) if bytes == b"readyz" => {
            deleted.map_err(|e| format!("could not remove probe blob: {}", e))
        }
        Ok(_) => Err("probe blob content mismatch".to_string()),
        Err(e) => Err(format!("could not read probe blob: {}", e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
