//! The contract every storage backend implements.
//!
//! A driver works with its own native error type, boxed as [`DriverError`].
//! It never has to produce the shared taxonomy itself except through
//! [`Driver::error_code`], which the façade calls on every failure.
//!
//! Drivers are synchronous: each call blocks until the backend answers.
//! Readers and writers returned by a driver are owned by one caller and are
//! released when closed or dropped.

use crate::{
    errors::{DriverError, ErrorCode},
    models::{
        Attributes, CopyOptions, ListOptions, ListPage, ReaderOptions, SignedUrlOptions,
        WriterOptions,
    },
};
use std::{any::Any, io};

/// Capability set of a storage backend.
pub trait Driver: Send + Sync {
    /// Attributes of the blob at `key`.
    fn attributes(&self, key: &str) -> Result<Attributes, DriverError>;

    /// One page of keys, lexicographically ordered.
    ///
    /// Entries come after `opts.page_token` when one is given. Keys sharing a
    /// delimiter-bounded segment after the prefix collapse into a single
    /// directory entry, emitted once.
    fn list_paged(&self, opts: &ListOptions) -> Result<ListPage, DriverError>;

    /// A reader over `length` bytes starting at `offset`, or to the end of
    /// the blob when `length` is `None`.
    ///
    /// `offset` past the end of the blob is an error.
    fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
        opts: &ReaderOptions,
    ) -> Result<Box<dyn DriverReader>, DriverError>;

    /// A writer whose content becomes visible only when it is closed.
    ///
    /// An empty key is invalid.
    fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> Result<Box<dyn DriverWriter>, DriverError>;

    /// Duplicate the blob at `src_key`, content and attributes, at `dst_key`.
    fn copy(&self, dst_key: &str, src_key: &str, opts: &CopyOptions) -> Result<(), DriverError>;

    fn delete(&self, key: &str) -> Result<(), DriverError>;

    fn signed_url(&self, key: &str, opts: &SignedUrlOptions) -> Result<String, DriverError>;

    /// Classify one of this driver's errors. Anything unrecognized is `Unknown`.
    fn error_code(&self, err: &DriverError) -> ErrorCode;

    /// Release backend resources.
    fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Escape hatch to the concrete backend; `None` unless a driver opts in.
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
}

/// Streaming reader returned by [`Driver::new_range_reader`].
pub trait DriverReader: io::Read + Send {
    /// Attributes of the version being read, captured when the reader opened.
    fn attributes(&self) -> &Attributes;

    fn close(self: Box<Self>) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Streaming writer returned by [`Driver::new_typed_writer`].
///
/// Bytes written are buffered privately. `close` either commits them
/// atomically or, when the writer's cancellation token has fired, discards
/// them and returns a cancellation error. Dropping a writer without closing
/// it never commits.
pub trait DriverWriter: io::Write + Send {
    fn close(self: Box<Self>) -> Result<(), DriverError>;
}
