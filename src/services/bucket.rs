//! src/services/bucket.rs
//!
//! `Bucket` is the public face of every backend. It owns one driver behind an
//! `Arc<dyn Driver>`, turns driver errors into [`Error`]s with a normalized
//! [`ErrorCode`], and adds the parts every backend shares: streaming
//! `Reader`/`Writer` handles, the lazy listing iterator, content-type
//! defaults, metadata normalization, and MD5 verification of uploads.

use crate::{
    driver::{Driver, DriverReader, DriverWriter},
    errors::{DriverError, Error, ErrorCode, Result},
    models::{
        Attributes, CopyOptions, ListObject, ListOptions, ListPage, ReaderOptions,
        SignedUrlOptions, WriterOptions,
    },
};
use chrono::{DateTime, Utc};
use mime_guess::Mime;
use std::{any::Any, collections::HashMap, fmt, io, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A handle to one bucket. Cloning is cheap and clones share the driver.
#[derive(Clone)]
pub struct Bucket {
    driver: Arc<dyn Driver>,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").finish_non_exhaustive()
    }
}

/// Wrap a driver failure, keeping errors that are already classified.
fn wrap_err(driver: &dyn Driver, op: &str, key: &str, err: DriverError) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(err) => {
            let code = driver.error_code(&err);
            Error::with_source(code, format!("{op} {key:?}: {err}"), err)
        }
    }
}

impl Bucket {
    pub fn new(driver: impl Driver + 'static) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    fn wrap(&self, op: &str, key: &str, err: DriverError) -> Error {
        wrap_err(self.driver.as_ref(), op, key, err)
    }

    pub fn attributes(&self, key: &str) -> Result<Attributes> {
        self.driver
            .attributes(key)
            .map_err(|err| self.wrap("attributes", key, err))
    }

    /// Whether a blob exists at `key`. Errors other than NotFound propagate.
    pub fn exists(&self, key: &str) -> Result<bool> {
        match self.attributes(key) {
            Ok(_) => Ok(true),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Read the whole blob.
    pub fn new_reader(&self, key: &str, opts: &ReaderOptions) -> Result<Reader> {
        self.new_range_reader(key, 0, None, opts)
    }

    /// Read `length` bytes from `offset`, or to the end when `length` is `None`.
    pub fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
        opts: &ReaderOptions,
    ) -> Result<Reader> {
        let inner = self
            .driver
            .new_range_reader(key, offset, length, opts)
            .map_err(|err| self.wrap("new reader", key, err))?;
        Ok(Reader {
            inner,
            driver: Arc::clone(&self.driver),
            key: key.to_string(),
        })
    }

    pub fn read_all(&self, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.new_reader(key, &ReaderOptions::default())?;
        let mut out = Vec::with_capacity(reader.size() as usize);
        io::Read::read_to_end(&mut reader, &mut out)
            .map_err(|err| self.wrap("read", key, err.into()))?;
        reader.close()?;
        Ok(out)
    }

    /// Open a writer. Nothing is visible to readers until [`Writer::close`].
    pub fn new_writer(&self, key: &str, mut opts: WriterOptions) -> Result<Writer> {
        let content_type = if opts.content_type.is_empty() {
            mime_guess::from_path(key)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        } else {
            opts.content_type
                .parse::<Mime>()
                .map_err(|err| {
                    Error::invalid_argument(format!(
                        "new writer {key:?}: invalid content type {:?}: {err}",
                        opts.content_type
                    ))
                })?
                .to_string()
        };
        opts.metadata = normalize_metadata(key, std::mem::take(&mut opts.metadata))?;

        let cancel = opts.cancel.child_token();
        let content_md5 = opts.content_md5;
        let driver_opts = WriterOptions {
            content_type: content_type.clone(),
            cancel: cancel.clone(),
            ..opts
        };

        let inner = self
            .driver
            .new_typed_writer(key, &content_type, &driver_opts)
            .map_err(|err| self.wrap("new writer", key, err))?;
        Ok(Writer {
            inner: Some(inner),
            driver: Arc::clone(&self.driver),
            key: key.to_string(),
            cancel,
            content_md5,
            hasher: md5::Context::new(),
        })
    }

    pub fn write_all(&self, key: &str, data: &[u8], opts: WriterOptions) -> Result<()> {
        let mut writer = self.new_writer(key, opts)?;
        io::Write::write_all(&mut writer, data)
            .map_err(|err| self.wrap("write", key, err.into()))?;
        writer.close()
    }

    /// Lazily iterate every entry matching `opts`, one driver page at a time.
    ///
    /// Iteration starts from `opts.page_token` when set. Each call starts a
    /// fresh listing; an iterator cannot be resumed after it is dropped.
    pub fn list(&self, opts: ListOptions) -> ListIter {
        ListIter {
            driver: Arc::clone(&self.driver),
            opts,
            page: Vec::new().into_iter(),
            done: false,
        }
    }

    /// A single page, for callers that paginate themselves.
    pub fn list_page(&self, opts: &ListOptions) -> Result<ListPage> {
        self.driver
            .list_paged(opts)
            .map_err(|err| self.wrap("list", &opts.prefix, err))
    }

    pub fn copy(&self, dst_key: &str, src_key: &str, opts: &CopyOptions) -> Result<()> {
        self.driver
            .copy(dst_key, src_key, opts)
            .map_err(|err| self.wrap("copy", src_key, err))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.driver
            .delete(key)
            .map_err(|err| self.wrap("delete", key, err))
    }

    pub fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> Result<String> {
        self.driver
            .signed_url(key, opts)
            .map_err(|err| self.wrap("signed url", key, err))
    }

    /// The concrete driver, if it exposes itself and is a `T`.
    pub fn downcast_driver<T: Any>(&self) -> Option<&T> {
        self.driver.as_any()?.downcast_ref::<T>()
    }

    pub fn close(&self) -> Result<()> {
        self.driver
            .close()
            .map_err(|err| self.wrap("close", "", err))
    }
}

/// Lowercase metadata keys, rejecting empty and case-colliding ones.
fn normalize_metadata(
    key: &str,
    metadata: HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut out = HashMap::with_capacity(metadata.len());
    for (name, value) in metadata {
        if name.is_empty() {
            return Err(Error::invalid_argument(format!(
                "new writer {key:?}: metadata keys may not be empty"
            )));
        }
        let lower = name.to_lowercase();
        if out.insert(lower.clone(), value).is_some() {
            return Err(Error::invalid_argument(format!(
                "new writer {key:?}: duplicate case-insensitive metadata key {lower:?}"
            )));
        }
    }
    Ok(out)
}

/// Streaming read handle. Released when closed or dropped.
pub struct Reader {
    inner: Box<dyn DriverReader>,
    driver: Arc<dyn Driver>,
    key: String,
}

impl Reader {
    /// Attributes of the version this reader streams, captured at open.
    pub fn attributes(&self) -> &Attributes {
        self.inner.attributes()
    }

    pub fn content_type(&self) -> &str {
        &self.attributes().content_type
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        self.attributes().mod_time
    }

    /// Size of the whole blob, regardless of the requested range.
    pub fn size(&self) -> u64 {
        self.attributes().size
    }

    pub fn close(self) -> Result<()> {
        let Reader { inner, driver, key } = self;
        inner
            .close()
            .map_err(|err| wrap_err(driver.as_ref(), "close reader", &key, err))
    }
}

impl io::Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Streaming write handle.
///
/// `close` commits; dropping without closing discards everything written.
pub struct Writer {
    inner: Option<Box<dyn DriverWriter>>,
    driver: Arc<dyn Driver>,
    key: String,
    cancel: CancellationToken,
    content_md5: Option<md5::Digest>,
    hasher: md5::Context,
}

impl Writer {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Commit the written bytes.
    pub fn close(mut self) -> Result<()> {
        let Some(inner) = self.inner.take() else {
            return Err(Error::new(ErrorCode::Unknown, "writer already closed"));
        };

        if let Some(expected) = self.content_md5 {
            let actual = self.hasher.clone().compute();
            if actual != expected {
                self.cancel.cancel();
                if let Err(err) = inner.close() {
                    debug!(key = %self.key, "discarded writer after MD5 mismatch: {}", err);
                }
                return Err(Error::invalid_argument(format!(
                    "close writer {:?}: MD5 {actual:x} does not match expected {expected:x}",
                    self.key
                )));
            }
        }

        inner
            .close()
            .map_err(|err| wrap_err(self.driver.as_ref(), "close writer", &self.key, err))
    }
}

impl io::Write for Writer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::other("write after close"))?;
        let n = inner.write(data)?;
        if self.content_md5.is_some() {
            self.hasher.consume(&data[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            warn!(key = %self.key, "writer dropped without close; discarding");
            self.cancel.cancel();
            drop(inner);
        }
    }
}

/// Lazy listing over all pages. Yields `Err` once and then stops on failure.
pub struct ListIter {
    driver: Arc<dyn Driver>,
    opts: ListOptions,
    page: std::vec::IntoIter<ListObject>,
    done: bool,
}

impl Iterator for ListIter {
    type Item = Result<ListObject>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(obj) = self.page.next() {
                return Some(Ok(obj));
            }
            if self.done {
                return None;
            }
            match self.driver.list_paged(&self.opts) {
                Ok(page) => {
                    debug!(
                        prefix = %self.opts.prefix,
                        count = page.objects.len(),
                        "fetched list page"
                    );
                    match page.next_page_token {
                        Some(token) if !token.is_empty() => self.opts.page_token = Some(token),
                        _ => self.done = true,
                    }
                    self.page = page.objects.into_iter();
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(wrap_err(
                        self.driver.as_ref(),
                        "list",
                        &self.opts.prefix,
                        err,
                    )));
                }
            }
        }
    }
}
