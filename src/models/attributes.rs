//! Attributes recorded for a committed blob.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Attributes of a single committed blob.
///
/// Attributes are fixed at commit time; overwriting a key replaces them,
/// except for `create_time`, which the new version inherits.
#[derive(Clone, Debug, PartialEq)]
pub struct Attributes {
    /// Cache-Control value supplied at write time.
    pub cache_control: String,

    /// Content-Disposition value supplied at write time.
    pub content_disposition: String,

    /// Content-Encoding value supplied at write time.
    pub content_encoding: String,

    /// Content-Language value supplied at write time.
    pub content_language: String,

    /// Content type (MIME type).
    pub content_type: String,

    /// Caller-supplied metadata. Keys are lowercase.
    pub metadata: HashMap<String, String>,

    /// When the first version of this key was committed.
    pub create_time: DateTime<Utc>,

    /// When the current version was committed.
    pub mod_time: DateTime<Utc>,

    /// Size in bytes.
    pub size: u64,

    /// MD5 of the content, when the backend tracks one.
    pub md5: Option<md5::Digest>,

    /// Opaque version tag, unique per committed write.
    pub etag: String,
}
