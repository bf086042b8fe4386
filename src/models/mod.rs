//! Data types shared by drivers and the bucket façade.
//!
//! Blob attributes, listing requests/pages, and per-operation options.
//! Nothing here knows which backend is in use.

pub mod attributes;
pub mod listing;
pub mod options;

pub use attributes::Attributes;
pub use listing::{DEFAULT_PAGE_SIZE, ListObject, ListOptions, ListPage};
pub use options::{
    CopyOptions, Hook, HookEvent, ReaderOptions, SignedMethod, SignedUrlOptions, WriterOptions,
};
