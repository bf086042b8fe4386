//! HTTP handlers for object operations on the served bucket.
//!
//! Bucket calls block, so each handler runs them on the blocking pool.
//! Bodies are streamed both ways: uploads feed a blob `Writer` through a
//! `SyncIoBridge`, downloads pump a blob `Reader` into a duplex pipe that the
//! response body reads from.

use crate::{
    errors::{AppError, Error, ErrorCode},
    models::{Attributes, CopyOptions, ListOptions, ListPage, ReaderOptions, WriterOptions},
    services::bucket::Bucket,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use base64::{Engine as _, engine::general_purpose};
use chrono::SecondsFormat;
use futures::StreamExt;
use serde::Deserialize;
use std::io::{self, Read};
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};
use tracing::warn;

/// Prefix of user metadata headers.
const META_HEADER_PREFIX: &str = "x-amz-meta-";
const COPY_SOURCE_HEADER: &str = "x-amz-copy-source";
const DOWNLOAD_PIPE_CAPACITY: usize = 64 * 1024;

/// Query params accepted by `GET /objects`.
#[derive(Debug, Default, Deserialize)]
pub struct ListObjectsQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

/// `PUT /objects/{*key}`: upload, or copy when `x-amz-copy-source` is set.
pub async fn upload_object(
    State(bucket): State<Bucket>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    if let Some(source) = headers.get(COPY_SOURCE_HEADER) {
        let source = source
            .to_str()
            .map_err(|_| AppError::bad_request("copy source must be valid UTF-8"))?
            .trim_start_matches('/')
            .to_string();
        return copy_object(bucket, key, source).await;
    }

    let opts = writer_options_from_headers(&headers)?;
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    let mut source = SyncIoBridge::new(StreamReader::new(stream));

    let attrs = tokio::task::spawn_blocking(move || -> Result<Attributes, AppError> {
        let mut writer = bucket.new_writer(&key, opts)?;
        // On error the writer is dropped unclosed, which discards the upload.
        io::copy(&mut source, &mut writer)?;
        writer.close()?;
        Ok(bucket.attributes(&key)?)
    })
    .await??;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&attrs.etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

async fn copy_object(bucket: Bucket, dst: String, src: String) -> Result<Response, AppError> {
    let attrs = tokio::task::spawn_blocking(move || -> Result<Attributes, Error> {
        bucket.copy(&dst, &src, &CopyOptions::default())?;
        bucket.attributes(&dst)
    })
    .await??;

    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<CopyObjectResult>"#,
            r#"<LastModified>{}</LastModified>"#,
            r#"<ETag>{}</ETag>"#,
            r#"</CopyObjectResult>"#
        ),
        attrs.mod_time.to_rfc3339_opts(SecondsFormat::Millis, true),
        xml_escape(&attrs.etag)
    );
    xml_response(StatusCode::OK, xml)
}

/// `GET /objects/{*key}`: streaming download, honouring a single byte range.
pub async fn get_object(
    State(bucket): State<Bucket>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let range = match headers.get(header::RANGE) {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(ByteRange::parse)
                .ok_or_else(|| AppError::bad_request("malformed Range header"))?,
        ),
        None => None,
    };

    // One reader supplies the bytes and the attributes, so both describe the
    // same version even if the key is overwritten meanwhile.
    let (attrs, span, reader) = tokio::task::spawn_blocking(move || -> Result<_, AppError> {
        let (offset, length) = range.map_or((0, None), ByteRange::request);
        let mut reader =
            match bucket.new_range_reader(&key, offset, length, &ReaderOptions::default()) {
                // The driver rejects a start past the end.
                Err(err)
                    if matches!(range, Some(ByteRange::From { .. }))
                        && err.code() == ErrorCode::InvalidArgument =>
                {
                    return Err(not_satisfiable());
                }
                opened => opened?,
            };
        let attrs = reader.attributes().clone();
        let span = match range {
            Some(range) => Some(range.resolve(attrs.size).ok_or_else(not_satisfiable)?),
            None => None,
        };
        if let Some((start, _)) = span {
            // The reader already starts at `offset`; skip the rest of a suffix.
            io::copy(&mut (&mut reader).take(start - offset), &mut io::sink())?;
        }
        Ok((attrs, span, reader))
    })
    .await??;

    let limit = span.map_or(u64::MAX, |(_, len)| len);
    let (pipe_out, pipe_in) = tokio::io::duplex(DOWNLOAD_PIPE_CAPACITY);
    let mut sink = SyncIoBridge::new(pipe_in);
    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        if let Err(err) = io::copy(&mut (&mut reader).take(limit), &mut sink) {
            warn!("streaming download aborted: {}", err);
        }
        let _ = sink.shutdown();
        if let Err(err) = reader.close() {
            warn!("closing blob reader: {}", err);
        }
    });

    let mut response = Response::new(Body::from_stream(ReaderStream::new(pipe_out)));
    match span {
        Some((start, len)) => {
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            set_object_headers(response.headers_mut(), &attrs, len);
            let end = (start + len).saturating_sub(1);
            if let Ok(value) =
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, attrs.size))
            {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        None => {
            *response.status_mut() = StatusCode::OK;
            set_object_headers(response.headers_mut(), &attrs, attrs.size);
        }
    }
    Ok(response)
}

/// `HEAD /objects/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(bucket): State<Bucket>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let attrs = tokio::task::spawn_blocking(move || bucket.attributes(&key)).await??;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &attrs, attrs.size);
    Ok(response)
}

/// `DELETE /objects/{*key}`
pub async fn delete_object(
    State(bucket): State<Bucket>,
    Path(key): Path<String>,
) -> Result<StatusCode, AppError> {
    tokio::task::spawn_blocking(move || bucket.delete(&key)).await??;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /objects`: list, supports ?prefix=&delimiter=&max-keys=&continuation-token=
pub async fn list_objects(
    State(bucket): State<Bucket>,
    Query(q): Query<ListObjectsQuery>,
) -> Result<Response, AppError> {
    let page_token = match q.continuation_token.as_deref() {
        Some(token) => Some(decode_continuation_token(token)?),
        None => None,
    };
    let opts = ListOptions {
        prefix: q.prefix.clone().unwrap_or_default(),
        delimiter: q.delimiter.clone().unwrap_or_default(),
        page_size: q.max_keys.unwrap_or(1000).clamp(1, 1000),
        page_token,
    };

    let page = {
        let opts = opts.clone();
        tokio::task::spawn_blocking(move || bucket.list_page(&opts)).await??
    };
    let xml = build_list_objects_xml(&opts, q.continuation_token.as_deref(), &page);
    xml_response(StatusCode::OK, xml)
}

fn writer_options_from_headers(headers: &HeaderMap) -> Result<WriterOptions, AppError> {
    let text = |name: HeaderName| -> Result<String, AppError> {
        match headers.get(&name) {
            Some(value) => value
                .to_str()
                .map(str::to_string)
                .map_err(|_| AppError::bad_request(format!("header {} is not valid UTF-8", name))),
            None => Ok(String::new()),
        }
    };

    let mut opts = WriterOptions {
        content_type: text(header::CONTENT_TYPE)?,
        cache_control: text(header::CACHE_CONTROL)?,
        content_disposition: text(header::CONTENT_DISPOSITION)?,
        content_encoding: text(header::CONTENT_ENCODING)?,
        content_language: text(header::CONTENT_LANGUAGE)?,
        ..Default::default()
    };

    if let Some(value) = headers.get("content-md5") {
        let raw = value
            .to_str()
            .ok()
            .and_then(|v| general_purpose::STANDARD.decode(v).ok())
            .ok_or_else(|| AppError::bad_request("Content-MD5 must be base64"))?;
        let digest: [u8; 16] = raw
            .try_into()
            .map_err(|_| AppError::bad_request("Content-MD5 must be 16 bytes"))?;
        opts.content_md5 = Some(md5::Digest(digest));
    }

    for (name, value) in headers {
        if let Some(meta_key) = name.as_str().strip_prefix(META_HEADER_PREFIX) {
            let value = value
                .to_str()
                .map_err(|_| AppError::bad_request(format!("header {} is not valid UTF-8", name)))?;
            opts.metadata.insert(meta_key.to_string(), value.to_string());
        }
    }
    Ok(opts)
}

fn set_object_headers(headers: &mut HeaderMap, attrs: &Attributes, content_length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&attrs.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Ok(value) = HeaderValue::from_str(&attrs.etag) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&attrs.mod_time.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    let optional = [
        (header::CACHE_CONTROL, &attrs.cache_control),
        (header::CONTENT_DISPOSITION, &attrs.content_disposition),
        (header::CONTENT_ENCODING, &attrs.content_encoding),
        (header::CONTENT_LANGUAGE, &attrs.content_language),
    ];
    for (name, value) in optional {
        if value.is_empty() {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }

    if let Some(md5) = attrs.md5 {
        if let Ok(value) = HeaderValue::from_str(&general_purpose::STANDARD.encode(md5.0)) {
            headers.insert(HeaderName::from_static("content-md5"), value);
        }
    }

    for (key, value) in &attrs.metadata {
        let name = HeaderName::from_bytes(format!("{META_HEADER_PREFIX}{key}").as_bytes());
        if let (Ok(name), Ok(value)) = (name, HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
}

/// A single `Range: bytes=...` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ByteRange {
    /// `bytes=start-` or `bytes=start-end` (inclusive).
    From { start: u64, end: Option<u64> },
    /// `bytes=-n`: the last `n` bytes.
    Suffix(u64),
}

impl ByteRange {
    fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());
        if start.is_empty() {
            return end.parse().ok().map(ByteRange::Suffix);
        }
        let start = start.parse().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            let end: u64 = end.parse().ok()?;
            if end < start {
                return None;
            }
            Some(end)
        };
        Some(ByteRange::From { start, end })
    }

    /// `(offset, length)` to open a reader with before the blob size is known.
    /// A suffix needs the size, so it opens the whole blob.
    fn request(self) -> (u64, Option<u64>) {
        match self {
            ByteRange::From { start, end } => (start, end.map(|end| end - start + 1)),
            ByteRange::Suffix(_) => (0, None),
        }
    }

    /// `(offset, length)` within a blob of `size` bytes, or `None` when the
    /// range selects nothing.
    fn resolve(self, size: u64) -> Option<(u64, u64)> {
        match self {
            ByteRange::From { start, end } => {
                if start >= size {
                    return None;
                }
                let last = end.map_or(size - 1, |end| end.min(size - 1));
                Some((start, last - start + 1))
            }
            ByteRange::Suffix(0) => None,
            ByteRange::Suffix(n) => {
                if size == 0 {
                    return None;
                }
                let len = n.min(size);
                Some((size - len, len))
            }
        }
    }
}

fn not_satisfiable() -> AppError {
    AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, "range not satisfiable")
}

fn xml_response(status: StatusCode, xml: String) -> Result<Response, AppError> {
    let mut response = Response::new(Body::from(xml));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    *response.status_mut() = status;
    Ok(response)
}

fn build_list_objects_xml(
    opts: &ListOptions,
    continuation_token: Option<&str>,
    page: &ListPage,
) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
    );
    xml.push_str(&format!("<Prefix>{}</Prefix>", xml_escape(&opts.prefix)));
    xml.push_str(&format!("<MaxKeys>{}</MaxKeys>", opts.page_size));
    xml.push_str(&format!("<KeyCount>{}</KeyCount>", page.objects.len()));
    if let Some(token) = continuation_token {
        xml.push_str(&format!(
            "<ContinuationToken>{}</ContinuationToken>",
            xml_escape(token)
        ));
    }
    if !opts.delimiter.is_empty() {
        xml.push_str(&format!(
            "<Delimiter>{}</Delimiter>",
            xml_escape(&opts.delimiter)
        ));
    }
    xml.push_str(&format!(
        "<IsTruncated>{}</IsTruncated>",
        if page.next_page_token.is_some() {
            "true"
        } else {
            "false"
        }
    ));
    if let Some(next) = &page.next_page_token {
        xml.push_str(&format!(
            "<NextContinuationToken>{}</NextContinuationToken>",
            xml_escape(&encode_continuation_token(next))
        ));
    }

    for obj in page.objects.iter().filter(|o| !o.is_dir) {
        xml.push_str("<Contents>");
        xml.push_str(&format!("<Key>{}</Key>", xml_escape(&obj.key)));
        if let Some(mod_time) = obj.mod_time {
            xml.push_str(&format!(
                "<LastModified>{}</LastModified>",
                mod_time.to_rfc3339_opts(SecondsFormat::Millis, true)
            ));
        }
        if let Some(md5) = obj.md5 {
            xml.push_str(&format!("<ETag>\"{:x}\"</ETag>", md5));
        }
        xml.push_str(&format!("<Size>{}</Size>", obj.size));
        xml.push_str("</Contents>");
    }

    for dir in page.objects.iter().filter(|o| o.is_dir) {
        xml.push_str("<CommonPrefixes><Prefix>");
        xml.push_str(&xml_escape(&dir.key));
        xml.push_str("</Prefix></CommonPrefixes>");
    }

    xml.push_str("</ListBucketResult>");
    xml
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn encode_continuation_token(token: &[u8]) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> Result<Vec<u8>, AppError> {
    general_purpose::STANDARD
        .decode(token)
        .map_err(|_| AppError::bad_request("continuation-token must be base64"))
}
