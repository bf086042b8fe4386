//! Listing request and response types.

use chrono::{DateTime, Utc};

/// Page size used when a request asks for `0`.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Parameters of a single listing call.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Only keys starting with this prefix are returned.
    pub prefix: String,

    /// When non-empty, keys sharing a delimiter-bounded segment after the
    /// prefix collapse into one directory entry.
    pub delimiter: String,

    /// Maximum entries per page; `0` means [`DEFAULT_PAGE_SIZE`].
    pub page_size: usize,

    /// Continuation token returned by the previous page.
    pub page_token: Option<Vec<u8>>,
}

impl ListOptions {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub(crate) fn effective_page_size(&self) -> usize {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }
}

/// One entry of a listing: a blob summary or a synthetic directory.
#[derive(Clone, Debug, PartialEq)]
pub struct ListObject {
    /// Blob key, or for directories the shared prefix ending in the delimiter.
    pub key: String,

    /// Modification time; `None` for directories.
    pub mod_time: Option<DateTime<Utc>>,

    /// Size in bytes; `0` for directories.
    pub size: u64,

    /// Content MD5, when known; `None` for directories.
    pub md5: Option<md5::Digest>,

    /// Whether this entry is a directory marker.
    pub is_dir: bool,
}

impl ListObject {
    pub fn dir(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            mod_time: None,
            size: 0,
            md5: None,
            is_dir: true,
        }
    }
}

/// A single page of results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListPage {
    pub objects: Vec<ListObject>,

    /// Token for the next page; `None` once the listing is exhausted.
    pub next_page_token: Option<Vec<u8>>,
}
