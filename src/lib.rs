//! Portable blob storage.
//!
//! One API for storing, reading, listing, copying and deleting blobs in a
//! bucket, whatever backs it. Buckets are opened from URLs through a
//! [`UrlMux`]; the scheme picks the driver:
//!
//! ```
//! use blobport::{ListOptions, UrlMux, WriterOptions};
//!
//! let mux = UrlMux::with_default_drivers();
//! let bucket = mux.open_bucket("mem://")?;
//! bucket.write_all("notes/today.txt", b"hello", WriterOptions::default())?;
//!
//! for obj in bucket.list(ListOptions::default().delimiter("/")) {
//!     println!("{}", obj?.key);
//! }
//! # Ok::<(), blobport::Error>(())
//! ```
//!
//! Backends implement [`driver::Driver`]. The in-memory driver
//! ([`drivers::memblob`]) is the reference other drivers are measured against.

pub mod config;
pub mod driver;
pub mod drivers;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod server;
pub mod services;

pub use errors::{Error, ErrorCode, Result};
pub use models::{
    Attributes, CopyOptions, Hook, HookEvent, ListObject, ListOptions, ListPage, ReaderOptions,
    SignedUrlOptions, WriterOptions,
};
pub use services::{
    bucket::{Bucket, ListIter, Reader, Writer},
    url_mux::{BucketUrlOpener, UrlMux},
};
