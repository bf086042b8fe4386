//! Storage backends.
//!
//! - `memblob`: in-process reference implementation (`mem://`)
//! - `fileblob`: blobs as files under a local directory (`file:///path`)

pub mod fileblob;
pub mod memblob;

use crate::models::{ListObject, ListOptions, ListPage};

/// Build one page from keys that are already in lexicographic order.
///
/// Keys outside `opts.prefix` are skipped. With a delimiter, every key whose
/// remainder after the prefix contains it is folded into a directory entry;
/// only the first key of a run produces the entry. Entries at or before
/// `token` are skipped. `summarize` runs only for blobs that land on the page.
///
/// The continuation token is the key of the last entry, and is set only when
/// another entry exists past the page.
pub(crate) fn paginate<'a, I, F, E>(
    keys: I,
    opts: &ListOptions,
    token: Option<&str>,
    mut summarize: F,
) -> Result<ListPage, E>
where
    I: IntoIterator<Item = &'a str>,
    F: FnMut(&str) -> Result<ListObject, E>,
{
    let page_size = opts.effective_page_size();
    let mut last_prefix: Option<String> = None;
    let mut page = ListPage::default();

    for key in keys {
        let Some(rest) = key.strip_prefix(opts.prefix.as_str()) else {
            continue;
        };

        let dir = if opts.delimiter.is_empty() {
            None
        } else {
            rest.find(opts.delimiter.as_str())
                .map(|idx| format!("{}{}", opts.prefix, &rest[..idx + opts.delimiter.len()]))
        };

        if let Some(dir) = &dir {
            if last_prefix.as_deref() == Some(dir.as_str()) {
                continue;
            }
            last_prefix = Some(dir.clone());
        }

        let entry_key = dir.as_deref().unwrap_or(key);
        if token.is_some_and(|t| entry_key <= t) {
            continue;
        }

        if page.objects.len() == page_size {
            page.next_page_token = page.objects.last().map(|o| o.key.clone().into_bytes());
            return Ok(page);
        }

        let obj = match dir {
            Some(dir) => ListObject::dir(dir),
            None => summarize(key)?,
        };
        page.objects.push(obj);
    }

    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn keys_of(page: &ListPage) -> Vec<&str> {
        page.objects.iter().map(|o| o.key.as_str()).collect()
    }

    fn list(keys: &[&str], opts: &ListOptions, token: Option<&str>) -> ListPage {
        let result: Result<ListPage, Infallible> =
            paginate(keys.iter().copied(), opts, token, |k| {
                Ok(ListObject {
                    key: k.to_string(),
                    mod_time: None,
                    size: k.len() as u64,
                    md5: None,
                    is_dir: false,
                })
            });
        match result {
            Ok(page) => page,
            Err(never) => match never {},
        }
    }

    #[test]
    fn directory_runs_count_once_against_page_size() {
        let keys = ["a/1", "a/2", "a/3", "b", "c/1"];
        let opts = ListOptions::default().delimiter("/").page_size(2);

        let first = list(&keys, &opts, None);
        assert_eq!(keys_of(&first), vec!["a/", "b"]);
        assert_eq!(first.next_page_token.as_deref(), Some(&b"b"[..]));

        let second = list(&keys, &opts, Some("b"));
        assert_eq!(keys_of(&second), vec!["c/"]);
        assert!(second.next_page_token.is_none());
        assert!(second.objects[0].is_dir);
    }

    #[test]
    fn directory_on_page_boundary_is_not_repeated() {
        let keys = ["a/1", "a/2", "b/1"];
        let opts = ListOptions::default().delimiter("/").page_size(1);

        let first = list(&keys, &opts, None);
        assert_eq!(keys_of(&first), vec!["a/"]);
        let second = list(&keys, &opts, Some("a/"));
        assert_eq!(keys_of(&second), vec!["b/"]);
        assert!(second.next_page_token.is_none());
    }

    #[test]
    fn prefix_is_kept_in_directory_keys() {
        let keys = ["photos/2024/a.jpg", "photos/2025/b.jpg", "photos/c.jpg", "z"];
        let opts = ListOptions::with_prefix("photos/").delimiter("/");
        let page = list(&keys, &opts, None);
        assert_eq!(
            keys_of(&page),
            vec!["photos/2024/", "photos/2025/", "photos/c.jpg"]
        );
    }

    #[test]
    fn multi_character_delimiter() {
        let keys = ["a::b", "a::c", "ab"];
        let opts = ListOptions::default().delimiter("::");
        let page = list(&keys, &opts, None);
        assert_eq!(keys_of(&page), vec!["a::", "ab"]);
    }
}
