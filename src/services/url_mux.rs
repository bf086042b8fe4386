//! Maps URL schemes to bucket openers.
//!
//! A `UrlMux` is built once at startup, populated with openers, and then
//! shared read-only. Registration takes `&mut self`, so no lock is needed
//! once the mux is handed out.

use crate::{
    drivers::{fileblob, memblob},
    errors::{Error, Result},
    services::bucket::Bucket,
};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::debug;
use url::Url;

/// Constructs a bucket from a URL of one scheme.
pub trait BucketUrlOpener: Send + Sync {
    /// Openers must reject query parameters they do not understand.
    fn open_bucket_url(&self, url: &Url) -> Result<Bucket>;
}

/// Fail if `url` carries any query parameter not in `allowed`.
pub fn reject_unknown_params(url: &Url, allowed: &[&str]) -> Result<()> {
    for (name, _) in url.query_pairs() {
        if !allowed.contains(&name.as_ref()) {
            return Err(Error::invalid_argument(format!(
                "open bucket {url}: invalid query parameter {name:?}"
            )));
        }
    }
    Ok(())
}

#[derive(Default)]
pub struct UrlMux {
    openers: HashMap<String, Arc<dyn BucketUrlOpener>>,
}

impl fmt::Debug for UrlMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.openers.keys().collect();
        schemes.sort();
        f.debug_struct("UrlMux").field("schemes", &schemes).finish()
    }
}

impl UrlMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mux with the bundled `mem` and `file` drivers registered.
    pub fn with_default_drivers() -> Self {
        let mut mux = Self::new();
        mux.register_bucket(memblob::SCHEME, memblob::UrlOpener);
        mux.register_bucket(fileblob::SCHEME, fileblob::UrlOpener);
        mux
    }

    /// Register `opener` for `scheme`.
    ///
    /// # Panics
    ///
    /// If `scheme` is already registered or is not a valid URL scheme.
    pub fn register_bucket(&mut self, scheme: &str, opener: impl BucketUrlOpener + 'static) {
        assert!(
            is_valid_scheme(scheme),
            "blob: invalid URL scheme {scheme:?}"
        );
        assert!(
            !self.openers.contains_key(scheme),
            "blob: scheme {scheme:?} already registered"
        );
        self.openers.insert(scheme.to_string(), Arc::new(opener));
    }

    pub fn valid_scheme(&self, scheme: &str) -> bool {
        self.openers.contains_key(scheme)
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<_> = self.openers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    pub fn open_bucket(&self, raw_url: &str) -> Result<Bucket> {
        let url = Url::parse(raw_url).map_err(|err| {
            Error::invalid_argument(format!("open bucket {raw_url:?}: {err}"))
        })?;
        self.open_bucket_url(&url)
    }

    pub fn open_bucket_url(&self, url: &Url) -> Result<Bucket> {
        let opener = self.openers.get(url.scheme()).ok_or_else(|| {
            Error::invalid_argument(format!(
                "open bucket {url}: no driver registered for scheme {:?} (known: {})",
                url.scheme(),
                self.schemes().join(", ")
            ))
        })?;
        debug!(scheme = url.scheme(), "opening bucket");
        opener.open_bucket_url(url)
    }
}

/// Lowercase RFC 3986 scheme: a letter followed by letters, digits, `+`, `-` or `.`.
fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;
    use crate::models::WriterOptions;

    #[test]
    fn opens_memory_buckets() {
        let mux = UrlMux::with_default_drivers();
        let bucket = mux.open_bucket("mem://").unwrap();
        bucket.write_all("k", b"v", WriterOptions::default()).unwrap();
        assert_eq!(bucket.read_all("k").unwrap(), b"v");

        // Each open is a fresh, unshared bucket.
        let other = mux.open_bucket("mem://").unwrap();
        assert!(!other.exists("k").unwrap());
    }

    #[test]
    fn unknown_scheme_fails() {
        let mux = UrlMux::with_default_drivers();
        let err = mux.open_bucket("gs://bucket").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(err.to_string().contains("gs"));
    }

    #[test]
    fn unparsable_url_fails() {
        let mux = UrlMux::with_default_drivers();
        assert!(mux.open_bucket("not a url").is_err());
    }

    #[test]
    fn unknown_query_parameters_fail() {
        let mux = UrlMux::with_default_drivers();
        let err = mux.open_bucket("mem://?region=us").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}?bogus=1", dir.path().display());
        assert!(mux.open_bucket(&url).is_err());
    }

    #[test]
    fn file_urls_accept_create_dir() {
        let mux = UrlMux::with_default_drivers();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("made");
        let url = format!("file://{}?create_dir=true", root.display());
        let bucket = mux.open_bucket(&url).unwrap();
        assert!(root.is_dir());

        let driver = bucket.downcast_driver::<fileblob::FileBucket>().unwrap();
        assert_eq!(driver.root(), root.as_path());
    }

    #[test]
    fn file_urls_honor_create_dir_false() {
        let mux = UrlMux::with_default_drivers();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("absent");

        let url = format!("file://{}?create_dir=false", root.display());
        let err = mux.open_bucket(&url).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(!root.exists());

        let url = format!("file://{}?create_dir=1", root.display());
        let err = mux.open_bucket(&url).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(!root.exists());
    }

    #[test]
    fn schemes_must_be_lowercase() {
        assert!(is_valid_scheme("mem"));
        assert!(is_valid_scheme("s3+v2.x-y"));
        assert!(!is_valid_scheme("Mem"));
        assert!(!is_valid_scheme("mEm"));
        assert!(!is_valid_scheme("9p"));
        assert!(!is_valid_scheme(""));
    }

    #[test]
    #[should_panic(expected = "invalid URL scheme")]
    fn uppercase_registration_panics() {
        let mut mux = UrlMux::new();
        mux.register_bucket("Mem", memblob::UrlOpener);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut mux = UrlMux::with_default_drivers();
        mux.register_bucket("mem", memblob::UrlOpener);
    }

    #[test]
    fn custom_openers_can_be_added() {
        struct Fixed;
        impl BucketUrlOpener for Fixed {
            fn open_bucket_url(&self, url: &Url) -> Result<Bucket> {
                reject_unknown_params(url, &[])?;
                Ok(memblob::open_bucket())
            }
        }

        let mut mux = UrlMux::new();
        mux.register_bucket("test+mem", Fixed);
        assert!(mux.valid_scheme("test+mem"));
        assert!(mux.open_bucket("test+mem://anything").is_ok());
        assert_eq!(mux.schemes(), vec!["test+mem"]);
    }
}
