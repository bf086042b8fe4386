//! Behaviour every driver must share, run against each bundled driver.

use blobport::{
    Bucket, CopyOptions, Error, ErrorCode, Hook, HookEvent, ListOptions, ReaderOptions,
    WriterOptions,
    drivers::{fileblob, memblob},
};
use std::{
    collections::BTreeSet,
    io::{Read, Write},
    thread,
    time::Duration,
};
use tempfile::TempDir;

/// Each test runs once per driver; the tempdir keeps the file bucket alive.
fn buckets() -> Vec<(&'static str, Bucket, Option<TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let file = fileblob::open_bucket(dir.path(), &fileblob::Options::default()).unwrap();
    vec![
        ("mem", memblob::open_bucket(), None),
        ("file", file, Some(dir)),
    ]
}

fn keys(bucket: &Bucket, opts: ListOptions) -> Vec<String> {
    bucket
        .list(opts)
        .map(|obj| obj.unwrap().key)
        .collect::<Vec<_>>()
}

#[test]
fn write_then_read_round_trips() {
    for (name, bucket, _dir) in buckets() {
        let payload = b"the quick brown fox".repeat(1000);
        let mut w = bucket
            .new_writer("docs/fox.txt", WriterOptions::default())
            .unwrap();
        for chunk in payload.chunks(777) {
            w.write_all(chunk).unwrap();
        }
        w.close().unwrap();

        assert_eq!(bucket.read_all("docs/fox.txt").unwrap(), payload, "{name}");

        let attrs = bucket.attributes("docs/fox.txt").unwrap();
        assert_eq!(attrs.size, payload.len() as u64, "{name}");
        assert_eq!(attrs.content_type, "text/plain", "{name}");
        assert_eq!(attrs.md5, Some(md5::compute(&payload)), "{name}");
        assert!(!attrs.etag.is_empty(), "{name}");
    }
}

#[test]
fn writer_attributes_are_stored() {
    for (name, bucket, _dir) in buckets() {
        let mut opts = WriterOptions::with_content_type("application/json");
        opts.cache_control = "no-cache".into();
        opts.content_language = "en".into();
        opts.metadata.insert("Owner".into(), "ops".into());
        bucket.write_all("cfg", b"{}", opts).unwrap();

        let attrs = bucket.attributes("cfg").unwrap();
        assert_eq!(attrs.content_type, "application/json", "{name}");
        assert_eq!(attrs.cache_control, "no-cache", "{name}");
        assert_eq!(attrs.content_language, "en", "{name}");
        assert_eq!(attrs.metadata.get("owner").map(String::as_str), Some("ops"), "{name}");
    }
}

#[test]
fn creation_time_survives_overwrite() {
    for (name, bucket, _dir) in buckets() {
        bucket.write_all("k", b"v1", WriterOptions::default()).unwrap();
        let first = bucket.attributes("k").unwrap();
        assert_eq!(first.create_time, first.mod_time, "{name}");

        thread::sleep(Duration::from_millis(20));
        bucket.write_all("k", b"version two", WriterOptions::default()).unwrap();
        let second = bucket.attributes("k").unwrap();

        assert_eq!(second.create_time, first.create_time, "{name}");
        assert!(second.mod_time > first.mod_time, "{name}");
        assert_eq!(second.size, 11, "{name}");
    }
}

#[test]
fn range_reads() {
    for (name, bucket, _dir) in buckets() {
        bucket
            .write_all("r", b"hello world", WriterOptions::default())
            .unwrap();
        let opts = ReaderOptions::default();

        let mut out = String::new();
        let mut r = bucket.new_range_reader("r", 6, Some(3), &opts).unwrap();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "wor", "{name}");
        assert_eq!(r.size(), 11, "{name}");
        r.close().unwrap();

        let mut out = String::new();
        let mut r = bucket.new_range_reader("r", 6, None, &opts).unwrap();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "world", "{name}");

        let mut out = Vec::new();
        let mut r = bucket.new_range_reader("r", 11, None, &opts).unwrap();
        r.read_to_end(&mut out).unwrap();
        assert!(out.is_empty(), "{name}");

        let err = bucket.new_range_reader("r", 12, None, &opts).err().unwrap();
        assert_eq!(err.code(), ErrorCode::InvalidArgument, "{name}");
    }
}

#[test]
fn missing_blobs_are_not_found() {
    for (name, bucket, _dir) in buckets() {
        let code = |err: Error| err.code();
        assert_eq!(code(bucket.attributes("nope").unwrap_err()), ErrorCode::NotFound, "{name}");
        assert_eq!(code(bucket.read_all("nope").unwrap_err()), ErrorCode::NotFound, "{name}");
        assert_eq!(code(bucket.delete("nope").unwrap_err()), ErrorCode::NotFound, "{name}");
        assert_eq!(
            code(bucket.copy("dst", "nope", &CopyOptions::default()).unwrap_err()),
            ErrorCode::NotFound,
            "{name}"
        );
        assert!(!bucket.exists("nope").unwrap(), "{name}");
    }
}

#[test]
fn empty_key_is_invalid() {
    for (name, bucket, _dir) in buckets() {
        let err = bucket
            .write_all("", b"x", WriterOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument, "{name}");
    }
}

#[test]
fn listing_is_sorted_and_complete() {
    for (name, bucket, _dir) in buckets() {
        let written = ["b/2", "a", "c/x/y", "b/1", "d"];
        for key in written {
            bucket.write_all(key, key.as_bytes(), WriterOptions::default()).unwrap();
        }

        let mut expected: Vec<String> = written.iter().map(|k| k.to_string()).collect();
        expected.sort();
        assert_eq!(keys(&bucket, ListOptions::default()), expected, "{name}");

        let listed = bucket.list(ListOptions::default()).map(|o| o.unwrap());
        for obj in listed {
            assert!(!obj.is_dir, "{name}");
            assert_eq!(obj.size, obj.key.len() as u64, "{name}");
            assert_eq!(obj.md5, Some(md5::compute(obj.key.as_bytes())), "{name}");
            assert!(obj.mod_time.is_some(), "{name}");
        }

        assert_eq!(
            keys(&bucket, ListOptions::with_prefix("b/")),
            vec!["b/1", "b/2"],
            "{name}"
        );
    }
}

#[test]
fn delimiter_collapses_directories() {
    for (name, bucket, _dir) in buckets() {
        for key in ["a/x", "a/y", "b"] {
            bucket.write_all(key, b"", WriterOptions::default()).unwrap();
        }

        let page = bucket
            .list_page(&ListOptions::default().delimiter("/"))
            .unwrap();
        let listed: Vec<(&str, bool)> = page
            .objects
            .iter()
            .map(|o| (o.key.as_str(), o.is_dir))
            .collect();
        assert_eq!(listed, vec![("a/", true), ("b", false)], "{name}");
        assert!(page.next_page_token.is_none(), "{name}");

        assert_eq!(
            keys(&bucket, ListOptions::with_prefix("a/").delimiter("/")),
            vec!["a/x", "a/y"],
            "{name}"
        );
    }
}

#[test]
fn pages_walk_every_key_once() {
    for (name, bucket, _dir) in buckets() {
        for key in ["a", "b", "c"] {
            bucket.write_all(key, b"", WriterOptions::default()).unwrap();
        }

        let mut opts = ListOptions::default().page_size(1);
        let mut seen = Vec::new();
        loop {
            let page = bucket.list_page(&opts).unwrap();
            assert!(page.objects.len() <= 1, "{name}");
            seen.extend(page.objects.into_iter().map(|o| o.key));
            match page.next_page_token {
                Some(token) => opts.page_token = Some(token),
                None => break,
            }
        }
        assert_eq!(seen, vec!["a", "b", "c"], "{name}");

        // The iterator fetches the same pages lazily.
        assert_eq!(
            keys(&bucket, ListOptions::default().page_size(1)),
            vec!["a", "b", "c"],
            "{name}"
        );
    }
}

#[test]
fn bad_page_token_is_invalid() {
    for (name, bucket, _dir) in buckets() {
        let mut opts = ListOptions::default();
        opts.page_token = Some(vec![0xff, 0xfe]);
        let err = bucket.list_page(&opts).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument, "{name}");
    }
}

#[test]
fn copy_and_delete() {
    for (name, bucket, _dir) in buckets() {
        bucket
            .write_all("src.txt", b"payload", WriterOptions::default())
            .unwrap();
        bucket
            .copy("nested/dst.txt", "src.txt", &CopyOptions::default())
            .unwrap();

        bucket.delete("src.txt").unwrap();
        assert_eq!(bucket.read_all("nested/dst.txt").unwrap(), b"payload", "{name}");
        assert!(!bucket.exists("src.txt").unwrap(), "{name}");

        let attrs = bucket.attributes("nested/dst.txt").unwrap();
        assert_eq!(attrs.content_type, "text/plain", "{name}");
        assert_eq!(attrs.md5, Some(md5::compute(b"payload")), "{name}");

        bucket.delete("nested/dst.txt").unwrap();
        assert!(keys(&bucket, ListOptions::default()).is_empty(), "{name}");
    }
}

#[test]
fn hooks_can_veto_or_allow() {
    for (name, bucket, _dir) in buckets() {
        let deny = Hook::new(|event| match event {
            HookEvent::Write { key, .. } if key.starts_with("private/") => Err(Error::new(
                ErrorCode::PermissionDenied,
                format!("{key} is read-only"),
            )),
            _ => Ok(()),
        });
        let opts = WriterOptions {
            before_write: Some(deny),
            ..Default::default()
        };
        let err = bucket
            .write_all("private/x", b"no", opts.clone())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied, "{name}");
        assert!(!bucket.exists("private/x").unwrap(), "{name}");
        bucket.write_all("public/x", b"yes", opts).unwrap();

        let copy_opts = CopyOptions {
            before_copy: Some(Hook::new(|_| Ok(()))),
        };
        bucket.copy("public/y", "public/x", &copy_opts).unwrap();
        assert_eq!(bucket.read_all("public/y").unwrap(), b"yes", "{name}");

        let read_opts = ReaderOptions {
            before_read: Some(Hook::new(|_| {
                Err(Error::new(ErrorCode::PermissionDenied, "no reads"))
            })),
        };
        let err = bucket.new_reader("public/y", &read_opts).err().unwrap();
        assert_eq!(err.code(), ErrorCode::PermissionDenied, "{name}");
    }
}

#[test]
fn canceled_writes_leave_nothing_behind() {
    for (name, bucket, _dir) in buckets() {
        bucket.write_all("k", b"old", WriterOptions::default()).unwrap();

        let opts = WriterOptions::default();
        let cancel = opts.cancel.clone();
        let mut w = bucket.new_writer("k", opts).unwrap();
        w.write_all(b"new").unwrap();
        cancel.cancel();
        assert_eq!(w.close().unwrap_err().code(), ErrorCode::Canceled, "{name}");
        assert_eq!(bucket.read_all("k").unwrap(), b"old", "{name}");

        let mut w = bucket.new_writer("dropped", WriterOptions::default()).unwrap();
        w.write_all(b"partial").unwrap();
        drop(w);
        assert!(!bucket.exists("dropped").unwrap(), "{name}");
        assert_eq!(keys(&bucket, ListOptions::default()), vec!["k"], "{name}");
    }
}

#[test]
fn content_md5_mismatch_is_rejected() {
    for (name, bucket, _dir) in buckets() {
        let opts = WriterOptions {
            content_md5: Some(md5::compute(b"something else")),
            ..Default::default()
        };
        let err = bucket.write_all("k", b"payload", opts).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument, "{name}");
        assert!(!bucket.exists("k").unwrap(), "{name}");

        let opts = WriterOptions {
            content_md5: Some(md5::compute(b"payload")),
            ..Default::default()
        };
        bucket.write_all("k", b"payload", opts).unwrap();
    }
}

#[test]
fn concurrent_writers_to_distinct_keys() {
    for (name, bucket, _dir) in buckets() {
        thread::scope(|s| {
            for i in 0..8 {
                let bucket = bucket.clone();
                s.spawn(move || {
                    let key = format!("t/{i}");
                    bucket
                        .write_all(&key, key.as_bytes(), WriterOptions::default())
                        .unwrap();
                });
            }
        });

        let listed: BTreeSet<String> = keys(&bucket, ListOptions::with_prefix("t/"))
            .into_iter()
            .collect();
        let expected: BTreeSet<String> = (0..8).map(|i| format!("t/{i}")).collect();
        assert_eq!(listed, expected, "{name}");
        for key in &expected {
            assert_eq!(bucket.read_all(key).unwrap(), key.as_bytes(), "{name}: {key}");
        }
    }
}

#[test]
fn concurrent_writers_to_one_key_leave_a_whole_payload() {
    // Payload sizes differ so a mismatched content/attributes pair shows up.
    let payloads: Vec<Vec<u8>> = (0..6u8)
        .map(|i| vec![b'a' + i; 16 * 1024 + usize::from(i) * 512])
        .collect();

    for (name, bucket, _dir) in buckets() {
        for round in 0..10 {
            thread::scope(|s| {
                for payload in &payloads {
                    let bucket = bucket.clone();
                    s.spawn(move || {
                        let mut w = bucket.new_writer("shared", WriterOptions::default()).unwrap();
                        for chunk in payload.chunks(4096) {
                            w.write_all(chunk).unwrap();
                        }
                        w.close().unwrap();
                    });
                }
            });

            let stored = bucket.read_all("shared").unwrap();
            assert!(payloads.contains(&stored), "{name}: torn write in round {round}");
            let attrs = bucket.attributes("shared").unwrap();
            assert_eq!(attrs.md5, Some(md5::compute(&stored)), "{name}: round {round}");
            assert_eq!(attrs.size, stored.len() as u64, "{name}: round {round}");
        }
    }
}
