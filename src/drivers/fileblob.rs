//! Driver storing each blob as a file beneath a root directory.
//!
//! The key `photos/2025/img.jpg` lives at `{root}/photos/2025/img.jpg`, with
//! its attributes in a JSON sidecar `{root}/photos/2025/img.jpg.attrs`.
//! Writes stream into a `.tmp-{uuid}` file next to the target, which is
//! fsynced and renamed into place on close, so readers only ever see whole
//! versions.
//!
//! A bucket-wide lock serializes every step that touches a blob's pair of
//! files (commit, copy, delete and attribute reads), so a blob's content and
//! sidecar always flip together. Streaming bytes into a temp file happens
//! outside the lock.

use crate::{
    driver::{Driver, DriverReader, DriverWriter},
    errors::{self, DriverError, ErrorCode},
    models::{
        Attributes, CopyOptions, HookEvent, ListObject, ListOptions, ListPage, ReaderOptions,
        SignedUrlOptions, WriterOptions,
    },
    services::{
        bucket::Bucket,
        url_mux::{BucketUrlOpener, reject_unknown_params},
    },
};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::HashMap,
    fs::{self, File},
    io::{self, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const SCHEME: &str = "file";

const ATTRS_EXT: &str = ".attrs";
const TMP_PREFIX: &str = ".tmp-";
const MAX_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum FileBlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid key `{key}`: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("offset {offset} is past the end of the blob ({size} bytes)")]
    OffsetOutOfRange { offset: u64, size: u64 },
    #[error("malformed page token")]
    InvalidPageToken,
    #[error("bucket directory `{0}` does not exist")]
    MissingRoot(PathBuf),
    #[error("signed URLs are not supported")]
    NotImplemented,
    #[error("write to `{0}` canceled")]
    Canceled(String),
    #[error("corrupt attributes file `{path}`: {source}")]
    CorruptAttributes {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Options for [`open_bucket`].
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Create the root directory if it is missing.
    pub create_dir: bool,
}

/// Opens `file:///abs/path` URLs. Accepts `create_dir` as the only query parameter.
#[derive(Debug, Default)]
pub struct UrlOpener;

impl BucketUrlOpener for UrlOpener {
    fn open_bucket_url(&self, url: &Url) -> errors::Result<Bucket> {
        reject_unknown_params(url, &["create_dir"])?;
        let mut create_dir = false;
        for (_, value) in url.query_pairs().filter(|(name, _)| name == "create_dir") {
            create_dir = value.parse::<bool>().map_err(|_| {
                errors::Error::invalid_argument(format!(
                    "open bucket {url}: create_dir must be `true` or `false`, got {value:?}"
                ))
            })?;
        }
        let dir = url.to_file_path().map_err(|_| {
            errors::Error::invalid_argument(format!(
                "open bucket {url}: not an absolute local path"
            ))
        })?;
        open_bucket(dir, &Options { create_dir })
    }
}

/// Open a bucket rooted at `dir`.
pub fn open_bucket(dir: impl Into<PathBuf>, opts: &Options) -> errors::Result<Bucket> {
    let root = dir.into();
    if opts.create_dir {
        fs::create_dir_all(&root).map_err(|err| {
            errors::Error::with_source(
                ErrorCode::Unknown,
                format!("open bucket {}", root.display()),
                err.into(),
            )
        })?;
    }
    if !root.is_dir() {
        return Err(errors::Error::not_found(
            FileBlobError::MissingRoot(root).to_string(),
        ));
    }
    Ok(Bucket::new(FileBucket {
        root,
        lock: Arc::default(),
    }))
}

#[derive(Debug)]
pub struct FileBucket {
    root: PathBuf,
    /// Guards blob/sidecar pairs; shared with every open writer.
    lock: Arc<Mutex<()>>,
}

/// On-disk form of [`Attributes`]; size and times not stored here come from
/// the blob file itself.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    #[serde(default)]
    cache_control: String,
    #[serde(default)]
    content_disposition: String,
    #[serde(default)]
    content_encoding: String,
    #[serde(default)]
    content_language: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    create_time: Option<DateTime<Utc>>,
    /// Commit time; the file's mtime is only a fallback.
    mod_time: Option<DateTime<Utc>>,
    /// Base64 MD5 of the content.
    md5: Option<String>,
    #[serde(default)]
    etag: String,
}

impl FileBucket {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject keys that cannot be mapped to a path beneath the root.
    fn ensure_key_safe(key: &str) -> Result<(), FileBlobError> {
        let invalid = |reason| {
            Err(FileBlobError::InvalidKey {
                key: key.to_string(),
                reason,
            })
        };
        if key.is_empty() {
            return invalid("empty key");
        }
        if key.len() > MAX_KEY_LEN {
            return invalid("key too long");
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return invalid("control characters and backslashes are not allowed");
        }
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return invalid("empty, `.` and `..` path segments are not allowed");
            }
        }
        if key.ends_with(ATTRS_EXT) {
            return invalid("the `.attrs` suffix is reserved");
        }
        if key.rsplit('/').next().is_some_and(|b| b.starts_with(TMP_PREFIX)) {
            return invalid("the `.tmp-` prefix is reserved");
        }
        Ok(())
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    fn attrs_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(ATTRS_EXT);
        PathBuf::from(name)
    }

    fn read_sidecar(path: &Path) -> Result<Option<Sidecar>, FileBlobError> {
        let attrs_path = Self::attrs_path(path);
        match fs::read(&attrs_path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|source| FileBlobError::CorruptAttributes {
                    path: attrs_path,
                    source,
                }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Stat the blob file, mapping a missing file (or a directory) to NotFound.
    fn stat(&self, key: &str, path: &Path) -> Result<fs::Metadata, FileBlobError> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(meta),
            Ok(_) => Err(FileBlobError::NotFound(key.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(FileBlobError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn load_attributes(&self, key: &str) -> Result<Attributes, FileBlobError> {
        Self::ensure_key_safe(key)?;
        let path = self.blob_path(key);
        let meta = self.stat(key, &path)?;
        let sidecar = Self::read_sidecar(&path)?.unwrap_or_default();

        let mod_time = match sidecar.mod_time {
            Some(mod_time) => mod_time,
            None => meta.modified().map(DateTime::from)?,
        };
        let size = meta.len();
        let content_type = if sidecar.content_type.is_empty() {
            mime_guess::from_path(&path)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        } else {
            sidecar.content_type
        };
        let etag = if sidecar.etag.is_empty() {
            synthesize_etag(mod_time, size)
        } else {
            sidecar.etag
        };

        Ok(Attributes {
            cache_control: sidecar.cache_control,
            content_disposition: sidecar.content_disposition,
            content_encoding: sidecar.content_encoding,
            content_language: sidecar.content_language,
            content_type,
            metadata: sidecar.metadata,
            create_time: sidecar.create_time.unwrap_or(mod_time),
            mod_time,
            size,
            md5: sidecar.md5.as_deref().and_then(decode_md5),
            etag,
        })
    }

    /// Every key under the root, sorted.
    fn collect_keys(&self) -> Result<Vec<String>, FileBlobError> {
        let mut keys = Vec::new();
        walk(&self.root, "", &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    /// Remove empty directories from `start` up to, but excluding, the root.
    fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current) {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

fn walk(dir: &Path, rel: &str, keys: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            // Not representable as a key.
            continue;
        };
        let key = if rel.is_empty() {
            name.clone()
        } else {
            format!("{rel}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), &key, keys)?;
        } else if file_type.is_file()
            && !name.ends_with(ATTRS_EXT)
            && !name.starts_with(TMP_PREFIX)
        {
            keys.push(key);
        }
    }
    Ok(())
}

/// A path for staging a file in the same directory as `path`.
fn staging_path(path: &Path) -> PathBuf {
    path.with_file_name(format!("{TMP_PREFIX}{}", Uuid::new_v4()))
}

/// Move staged content and sidecar into place as one unit.
///
/// The previous sidecar is parked under a staging name first so it can be
/// put back if either rename fails; the previous content is only replaced by
/// the last rename. Callers hold the bucket lock and remove their staged
/// files on error.
fn install(
    staged_content: &Path,
    content_path: &Path,
    staged_attrs: &Path,
    attrs_path: &Path,
) -> io::Result<()> {
    let backup = staging_path(attrs_path);
    let had_attrs = match fs::rename(attrs_path, &backup) {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => return Err(err),
    };
    let restore = || {
        let restored = if had_attrs {
            fs::rename(&backup, attrs_path)
        } else {
            fs::remove_file(attrs_path)
        };
        if let Err(err) = restored {
            debug!("failed to restore {}: {}", attrs_path.display(), err);
        }
    };

    if let Err(err) = fs::rename(staged_attrs, attrs_path) {
        restore();
        return Err(err);
    }
    if let Err(err) = fs::rename(staged_content, content_path) {
        restore();
        return Err(err);
    }
    if had_attrs {
        if let Err(err) = fs::remove_file(&backup) {
            debug!("failed to remove {}: {}", backup.display(), err);
        }
    }
    Ok(())
}

fn write_sidecar(path: &Path, sidecar: &Sidecar) -> Result<(), FileBlobError> {
    let raw = serde_json::to_vec_pretty(sidecar)
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    fs::write(path, raw)?;
    Ok(())
}

fn synthesize_etag(mod_time: DateTime<Utc>, size: u64) -> String {
    format!(
        "\"{:x}-{:x}\"",
        mod_time.timestamp_nanos_opt().unwrap_or_default(),
        size
    )
}

fn decode_md5(encoded: &str) -> Option<md5::Digest> {
    let raw = general_purpose::STANDARD.decode(encoded).ok()?;
    let bytes: [u8; 16] = raw.try_into().ok()?;
    Some(md5::Digest(bytes))
}

impl Driver for FileBucket {
    fn attributes(&self, key: &str) -> Result<Attributes, DriverError> {
        let _guard = self.lock.lock();
        Ok(self.load_attributes(key)?)
    }

    fn list_paged(&self, opts: &ListOptions) -> Result<ListPage, DriverError> {
        let token = match &opts.page_token {
            Some(raw) if !raw.is_empty() => {
                Some(std::str::from_utf8(raw).map_err(|_| FileBlobError::InvalidPageToken)?)
            }
            _ => None,
        };

        let _guard = self.lock.lock();
        let keys = self.collect_keys()?;
        let page = super::paginate(keys.iter().map(String::as_str), opts, token, |key| {
            let attrs = self.load_attributes(key)?;
            Ok::<_, FileBlobError>(ListObject {
                key: key.to_string(),
                mod_time: Some(attrs.mod_time),
                size: attrs.size,
                md5: attrs.md5,
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
        // The open handle keeps this version readable after the lock drops.
        let _guard = self.lock.lock();
        let attrs = self.load_attributes(key)?;

        if let Some(hook) = &opts.before_read {
            hook.check(&HookEvent::Read { key })?;
        }

        if offset > attrs.size {
            return Err(FileBlobError::OffsetOutOfRange {
                offset,
                size: attrs.size,
            }
            .into());
        }

        let mut file = File::open(self.blob_path(key)).map_err(|err| match err.kind() {
            ErrorKind::NotFound => FileBlobError::NotFound(key.to_string()),
            _ => FileBlobError::Io(err),
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(FileBlobError::from)?;
        let limit = length.unwrap_or(u64::MAX);

        Ok(Box::new(FileReader {
            inner: file.take(limit),
            attrs,
        }))
    }

    fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> Result<Box<dyn DriverWriter>, DriverError> {
        Self::ensure_key_safe(key)?;

        if let Some(hook) = &opts.before_write {
            hook.check(&HookEvent::Write { key, content_type })?;
        }

        let final_path = self.blob_path(key);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            FileBlobError::Io(io::Error::other("blob path missing parent directory"))
        })?;
        let tmp_path = staging_path(&final_path);
        let file = {
            // Directory pruning in `delete` must not race the temp file's creation.
            let _guard = self.lock.lock();
            fs::create_dir_all(&parent).map_err(FileBlobError::from)?;
            File::create(&tmp_path).map_err(FileBlobError::from)?
        };

        Ok(Box::new(FileWriter {
            lock: Arc::clone(&self.lock),
            key: key.to_string(),
            file: Some(BufWriter::new(file)),
            tmp_path,
            final_path,
            sidecar: Sidecar {
                cache_control: opts.cache_control.clone(),
                content_disposition: opts.content_disposition.clone(),
                content_encoding: opts.content_encoding.clone(),
                content_language: opts.content_language.clone(),
                content_type: content_type.to_string(),
                metadata: opts.metadata.clone(),
                ..Default::default()
            },
            cancel: opts.cancel.clone(),
            hasher: md5::Context::new(),
            size: 0,
        }))
    }

    fn copy(&self, dst_key: &str, src_key: &str, opts: &CopyOptions) -> Result<(), DriverError> {
        Self::ensure_key_safe(dst_key)?;
        Self::ensure_key_safe(src_key)?;

        if let Some(hook) = &opts.before_copy {
            hook.check(&HookEvent::Copy { dst_key, src_key })?;
        }

        let _guard = self.lock.lock();
        let src_path = self.blob_path(src_key);
        self.stat(src_key, &src_path)?;
        let sidecar = Self::read_sidecar(&src_path)?.unwrap_or_default();
        let dst_path = self.blob_path(dst_key);
        let parent = dst_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            FileBlobError::Io(io::Error::other("blob path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).map_err(FileBlobError::from)?;

        // Stage both files, then flip them into place together.
        let staged_content = staging_path(&dst_path);
        let staged_attrs = staging_path(&dst_path);
        let staged = fs::copy(&src_path, &staged_content)
            .map_err(FileBlobError::from)
            .and_then(|_| write_sidecar(&staged_attrs, &sidecar))
            .and_then(|_| {
                install(
                    &staged_content,
                    &dst_path,
                    &staged_attrs,
                    &Self::attrs_path(&dst_path),
                )
                .map_err(FileBlobError::from)
            });
        if let Err(err) = staged {
            let _ = fs::remove_file(&staged_content);
            let _ = fs::remove_file(&staged_attrs);
            return Err(err.into());
        }
        debug!(src = %src_key, dst = %dst_key, "copied blob");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), DriverError> {
        Self::ensure_key_safe(key)?;
        let _guard = self.lock.lock();
        let path = self.blob_path(key);
        self.stat(key, &path)?;

        match fs::remove_file(&path) {
            Ok(_) => debug!("removed blob file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FileBlobError::NotFound(key.to_string()).into());
            }
            Err(err) => return Err(FileBlobError::from(err).into()),
        }
        match fs::remove_file(Self::attrs_path(&path)) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(FileBlobError::from(err).into()),
        }

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent);
        }
        Ok(())
    }

    fn signed_url(&self, _key: &str, _opts: &SignedUrlOptions) -> Result<String, DriverError> {
        Err(FileBlobError::NotImplemented.into())
    }

    fn error_code(&self, err: &DriverError) -> ErrorCode {
        let io_code = |err: &io::Error| match err.kind() {
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
            _ => ErrorCode::Unknown,
        };
        if let Some(err) = err.downcast_ref::<FileBlobError>() {
            return match err {
                FileBlobError::NotFound(_) | FileBlobError::MissingRoot(_) => ErrorCode::NotFound,
                FileBlobError::InvalidKey { .. }
                | FileBlobError::OffsetOutOfRange { .. }
                | FileBlobError::InvalidPageToken => ErrorCode::InvalidArgument,
                FileBlobError::NotImplemented => ErrorCode::Unimplemented,
                FileBlobError::Canceled(_) => ErrorCode::Canceled,
                FileBlobError::CorruptAttributes { .. } => ErrorCode::Unknown,
                FileBlobError::Io(err) => io_code(err),
            };
        }
        match err.downcast_ref::<io::Error>() {
            Some(err) => io_code(err),
            None => ErrorCode::Unknown,
        }
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }
}

struct FileReader {
    inner: io::Take<File>,
    attrs: Attributes,
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl DriverReader for FileReader {
    fn attributes(&self) -> &Attributes {
        &self.attrs
    }
}

struct FileWriter {
    lock: Arc<Mutex<()>>,
    key: String,
    /// `None` once the temp file has been committed.
    file: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    sidecar: Sidecar,
    cancel: CancellationToken,
    hasher: md5::Context,
    size: u64,
}

impl FileWriter {
    fn commit(&mut self, file: BufWriter<File>) -> Result<(), FileBlobError> {
        let file = file.into_inner().map_err(|err| err.into_error())?;
        file.sync_all()?;
        drop(file);

        let digest = self.hasher.clone().compute();
        let lock = Arc::clone(&self.lock);
        let _guard = lock.lock();

        // One instant stamps both times for a new key.
        let now = Utc::now();
        let previous = if self.final_path.is_file() {
            FileBucket::read_sidecar(&self.final_path)
                .ok()
                .flatten()
                .and_then(|prev| prev.create_time)
        } else {
            None
        };
        self.sidecar.create_time = Some(previous.unwrap_or(now));
        self.sidecar.mod_time = Some(now);
        self.sidecar.md5 = Some(general_purpose::STANDARD.encode(digest.0));
        self.sidecar.etag = synthesize_etag(now, self.size);

        let attrs_path = FileBucket::attrs_path(&self.final_path);
        let staged_attrs = staging_path(&attrs_path);
        let installed = write_sidecar(&staged_attrs, &self.sidecar).and_then(|_| {
            install(&self.tmp_path, &self.final_path, &staged_attrs, &attrs_path)
                .map_err(FileBlobError::from)
        });
        if installed.is_err() {
            let _ = fs::remove_file(&staged_attrs);
        }
        installed
    }
}

impl Write for FileWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("write after close"))?;
        let n = file.write(data)?;
        self.hasher.consume(&data[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl DriverWriter for FileWriter {
    fn close(mut self: Box<Self>) -> Result<(), DriverError> {
        let Some(file) = self.file.take() else {
            return Err(io::Error::other("writer already closed").into());
        };

        if self.cancel.is_cancelled() {
            drop(file);
            let _ = fs::remove_file(&self.tmp_path);
            debug!(key = %self.key, "write canceled before close; nothing committed");
            return Err(FileBlobError::Canceled(self.key.clone()).into());
        }

        if let Err(err) = self.commit(file) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(err.into());
        }
        debug!(key = %self.key, size = self.size, "committed blob");
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
