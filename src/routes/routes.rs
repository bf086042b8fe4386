//! Defines routes for the HTTP gateway over a single bucket.
//!
//! ## Structure
//! - **Health endpoints**
//!   - `GET    /healthz` -> liveness
//!   - `GET    /readyz` -> readiness (lists and round-trips a probe blob)
//!
//! - **Bucket-level endpoints**
//!   - `GET    /objects` -> list (supports prefix, delimiter, max-keys, continuation-token)
//!
//! - **Object-level endpoints**
//!   - `PUT    /objects/{*key}` -> upload, or copy with `x-amz-copy-source`
//!   - `GET    /objects/{*key}` -> download (single byte range supported)
//!   - `HEAD   /objects/{*key}` -> attributes only
//!   - `DELETE /objects/{*key}` -> delete
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, get_object, head_object, list_objects, upload_object},
    },
    services::bucket::Bucket,
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build the router. The served `Bucket` is shared state for every handler.
pub fn routes() -> Router<Bucket> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/objects/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        .route("/objects", get(list_objects))
}
