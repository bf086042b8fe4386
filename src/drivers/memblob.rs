//! In-process reference driver.
//!
//! All blobs live in one ordered map behind a bucket-wide mutex. Every
//! operation holds the lock for its full duration; only the copying of bytes
//! into a writer's buffer or out of a reader happens outside it. Committed
//! content is immutable `Bytes`, so readers and copies share it without
//! duplicating the payload.

use crate::{
    driver::{Driver, DriverReader, DriverWriter},
    errors::{self, DriverError, ErrorCode},
    models::{
        Attributes, CopyOptions, HookEvent, ListObject, ListOptions, ListPage, ReaderOptions,
        SignedUrlOptions, WriterOptions,
    },
    services::{bucket::Bucket, url_mux::BucketUrlOpener, url_mux::reject_unknown_params},
};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    io::{self, Cursor},
    ops::Bound,
    sync::Arc,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

pub const SCHEME: &str = "mem";

#[derive(Debug, Error)]
pub enum MemBlobError {
    #[error("blob not found")]
    NotFound,
    #[error("invalid key (empty string)")]
    EmptyKey,
    #[error("offset {offset} is past the end of the blob ({size} bytes)")]
    OffsetOutOfRange { offset: u64, size: u64 },
    #[error("malformed page token")]
    InvalidPageToken,
    #[error("not implemented")]
    NotImplemented,
    #[error("write canceled")]
    Canceled,
}

/// Opens `mem://` URLs. No query parameters are accepted.
#[derive(Debug, Default)]
pub struct UrlOpener;

impl BucketUrlOpener for UrlOpener {
    fn open_bucket_url(&self, url: &Url) -> errors::Result<Bucket> {
        reject_unknown_params(url, &[])?;
        Ok(open_bucket())
    }
}

/// A fresh, empty in-memory bucket.
pub fn open_bucket() -> Bucket {
    Bucket::new(MemBucket::default())
}

#[derive(Clone, Debug)]
struct BlobEntry {
    content: Bytes,
    attributes: Attributes,
}

#[derive(Debug, Default)]
pub struct MemBucket {
    blobs: Arc<Mutex<BTreeMap<String, BlobEntry>>>,
}

impl MemBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl Driver for MemBucket {
    fn attributes(&self, key: &str) -> Result<Attributes, DriverError> {
        let blobs = self.blobs.lock();
        blobs
            .get(key)
            .map(|entry| entry.attributes.clone())
            .ok_or_else(|| MemBlobError::NotFound.into())
    }

    fn list_paged(&self, opts: &ListOptions) -> Result<ListPage, DriverError> {
        let token = match &opts.page_token {
            Some(raw) if !raw.is_empty() => {
                Some(std::str::from_utf8(raw).map_err(|_| MemBlobError::InvalidPageToken)?)
            }
            _ => None,
        };

        let blobs = self.blobs.lock();
        let keys = blobs
            .range::<str, _>((Bound::Included(opts.prefix.as_str()), Bound::Unbounded))
            .map(|(key, _)| key.as_str())
            .take_while(|key| key.starts_with(opts.prefix.as_str()));

        let page = super::paginate(keys, opts, token, |key| {
            let entry = blobs.get(key).ok_or(MemBlobError::NotFound)?;
            Ok::<_, MemBlobError>(ListObject {
                key: key.to_string(),
                mod_time: Some(entry.attributes.mod_time),
                size: entry.attributes.size,
                md5: entry.attributes.md5,
                is_dir: false,
            })
        })?;
        Ok(page)
    }

    fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
        opts: &ReaderOptions,
    ) -> Result<Box<dyn DriverReader>, DriverError> {
        let blobs = self.blobs.lock();
        let entry = blobs.get(key).ok_or(MemBlobError::NotFound)?;

        if let Some(hook) = &opts.before_read {
            hook.check(&HookEvent::Read { key })?;
        }

        let size = entry.content.len() as u64;
        if offset > size {
            return Err(MemBlobError::OffsetOutOfRange { offset, size }.into());
        }
        let end = match length {
            Some(length) => offset.saturating_add(length).min(size),
            None => size,
        };
        // Bytes::slice shares the stored buffer; it is read-only.
        let view = entry.content.slice(offset as usize..end as usize);

        Ok(Box::new(MemReader {
            cursor: Cursor::new(view),
            attrs: entry.attributes.clone(),
        }))
    }

    fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> Result<Box<dyn DriverWriter>, DriverError> {
        if key.is_empty() {
            return Err(MemBlobError::EmptyKey.into());
        }

        if let Some(hook) = &opts.before_write {
            hook.check(&HookEvent::Write { key, content_type })?;
        }

        Ok(Box::new(MemWriter {
            blobs: Arc::clone(&self.blobs),
            key: key.to_string(),
            content_type: content_type.to_string(),
            cache_control: opts.cache_control.clone(),
            content_disposition: opts.content_disposition.clone(),
            content_encoding: opts.content_encoding.clone(),
            content_language: opts.content_language.clone(),
            metadata: opts.metadata.clone(),
            cancel: opts.cancel.clone(),
            buf: BytesMut::new(),
            hasher: md5::Context::new(),
        }))
    }

    fn copy(&self, dst_key: &str, src_key: &str, opts: &CopyOptions) -> Result<(), DriverError> {
        let mut blobs = self.blobs.lock();

        if let Some(hook) = &opts.before_copy {
            hook.check(&HookEvent::Copy { dst_key, src_key })?;
        }

        let entry = blobs.get(src_key).cloned().ok_or(MemBlobError::NotFound)?;
        blobs.insert(dst_key.to_string(), entry);
        debug!(src = %src_key, dst = %dst_key, "copied blob");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), DriverError> {
        let mut blobs = self.blobs.lock();
        if blobs.remove(key).is_none() {
            return Err(MemBlobError::NotFound.into());
        }
        debug!(key = %key, "deleted blob");
        Ok(())
    }

    fn signed_url(&self, _key: &str, _opts: &SignedUrlOptions) -> Result<String, DriverError> {
        Err(MemBlobError::NotImplemented.into())
    }

    fn error_code(&self, err: &DriverError) -> ErrorCode {
        match err.downcast_ref::<MemBlobError>() {
            Some(MemBlobError::NotFound) => ErrorCode::NotFound,
            Some(MemBlobError::EmptyKey)
            | Some(MemBlobError::OffsetOutOfRange { .. })
            | Some(MemBlobError::InvalidPageToken) => ErrorCode::InvalidArgument,
            Some(MemBlobError::NotImplemented) => ErrorCode::Unimplemented,
            Some(MemBlobError::Canceled) => ErrorCode::Canceled,
            None => ErrorCode::Unknown,
        }
    }
}

struct MemReader {
    cursor: Cursor<Bytes>,
    attrs: Attributes,
}

impl io::Read for MemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl DriverReader for MemReader {
    fn attributes(&self) -> &Attributes {
        &self.attrs
    }
}

struct MemWriter {
    blobs: Arc<Mutex<BTreeMap<String, BlobEntry>>>,
    key: String,
    content_type: String,
    cache_control: String,
    content_disposition: String,
    content_encoding: String,
    content_language: String,
    metadata: HashMap<String, String>,
    cancel: CancellationToken,
    buf: BytesMut,
    hasher: md5::Context,
}

impl io::Write for MemWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.hasher.consume(data);
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DriverWriter for MemWriter {
    fn close(self: Box<Self>) -> Result<(), DriverError> {
        if self.cancel.is_cancelled() {
            debug!(key = %self.key, "write canceled before close; nothing committed");
            return Err(MemBlobError::Canceled.into());
        }

        let writer = *self;
        let md5 = writer.hasher.compute();
        let content = writer.buf.freeze();
        let size = content.len() as u64;
        let now = Utc::now();
        let etag = format!(
            "\"{:x}-{:x}\"",
            now.timestamp_nanos_opt().unwrap_or_default(),
            size
        );

        let mut entry = BlobEntry {
            content,
            attributes: Attributes {
                cache_control: writer.cache_control,
                content_disposition: writer.content_disposition,
                content_encoding: writer.content_encoding,
                content_language: writer.content_language,
                content_type: writer.content_type,
                metadata: writer.metadata,
                create_time: now,
                mod_time: now,
                size,
                md5: Some(md5),
                etag,
            },
        };

        let mut blobs = writer.blobs.lock();
        if let Some(prev) = blobs.get(&writer.key) {
            entry.attributes.create_time = prev.attributes.create_time;
        }
        blobs.insert(writer.key.clone(), entry);
        debug!(key = %writer.key, size, "committed blob");
        Ok(())
    }
}
