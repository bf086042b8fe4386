//! Per-operation options, including the optional interception hooks.

use crate::errors::Result;
use std::{collections::HashMap, fmt, sync::Arc};
use tokio_util::sync::CancellationToken;

/// The operation a [`Hook`] is asked to approve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent<'a> {
    Read { key: &'a str },
    Write { key: &'a str, content_type: &'a str },
    Copy { dst_key: &'a str, src_key: &'a str },
}

/// A policy invoked before an operation touches the bucket.
///
/// Returning `Ok(())` lets the operation continue; any error aborts it and is
/// handed back to the caller with its code unchanged.
#[derive(Clone)]
pub struct Hook(Arc<dyn Fn(&HookEvent<'_>) -> Result<()> + Send + Sync>);

impl Hook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&HookEvent<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn check(&self, event: &HookEvent<'_>) -> Result<()> {
        (self.0)(event)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook(..)")
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReaderOptions {
    pub before_read: Option<Hook>,
}

/// Options accepted when opening a writer.
#[derive(Clone, Debug, Default)]
pub struct WriterOptions {
    /// Content type; when empty the façade guesses one from the key.
    pub content_type: String,
    pub cache_control: String,
    pub content_disposition: String,
    pub content_encoding: String,
    pub content_language: String,

    /// User metadata. Keys are lowercased by the façade.
    pub metadata: HashMap<String, String>,

    /// Expected MD5 of the full payload; a mismatch aborts the commit.
    pub content_md5: Option<md5::Digest>,

    pub before_write: Option<Hook>,

    /// Canceling this token before `close` aborts the commit.
    pub cancel: CancellationToken,
}

impl WriterOptions {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CopyOptions {
    pub before_copy: Option<Hook>,
}

/// HTTP method a signed URL is valid for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignedMethod {
    #[default]
    Get,
    Put,
    Delete,
}

#[derive(Clone, Debug)]
pub struct SignedUrlOptions {
    pub expiry: std::time::Duration,
    pub method: SignedMethod,
    /// Content type the signed PUT must carry, if any.
    pub content_type: String,
}

impl Default for SignedUrlOptions {
    fn default() -> Self {
        Self {
            expiry: std::time::Duration::from_secs(3600),
            method: SignedMethod::Get,
            content_type: String::new(),
        }
    }
}
