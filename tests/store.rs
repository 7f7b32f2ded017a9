//! # End-to-End Store Tests
//!
//! Exercises the full engine through the public surface: open, buckets,
//! puts, cursor seeks, commit, rollback, and reopen cycles against real
//! files. Error-kind assertions go through `downcast_ref::<Error>()`, the
//! same way callers are expected to discriminate failures.

use std::time::Duration;

use tempfile::tempdir;

use pddb::{Database, Error, Options};

fn open_at(path: &std::path::Path) -> Database {
    Database::open(path, Options::default()).unwrap()
}

mod persistence_tests {
    use super::*;

    #[test]
    fn open_empty_put_commit_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.db");

        {
            let db = open_at(&path);
            let tx = db.begin(true).unwrap();
            let bucket = tx.create_bucket(b"b").unwrap();
            bucket.put(b"k", b"v").unwrap();
            tx.commit().unwrap();
        }

        let db = open_at(&path);
        let tx = db.begin(false).unwrap();
        let bucket = tx.bucket(b"b").expect("bucket SHOULD survive reopen");
        let (key, value, flags) = bucket.cursor().seek(b"k").unwrap();
        assert_eq!(key, b"k");
        assert_eq!(value, b"v");
        assert_eq!(flags, 0);
    }

    #[test]
    fn ten_buckets_in_one_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ten.db");

        {
            let db = open_at(&path);
            let tx = db.begin(true).unwrap();
            for i in 0..10u8 {
                tx.create_bucket(format!("{}", i).as_bytes()).unwrap();
            }
            tx.commit().unwrap();
        }

        let db = open_at(&path);
        let tx = db.begin(false).unwrap();
        for i in 0..10u8 {
            assert!(
                tx.bucket(format!("{}", i).as_bytes()).is_some(),
                "bucket {} SHOULD be present after reopen",
                i
            );
        }
    }

    #[test]
    fn nested_buckets_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested.db");

        {
            let db = open_at(&path);
            let tx = db.begin(true).unwrap();
            let outer = tx.create_bucket(b"outer").unwrap();
            let inner = outer.create_bucket(b"inner").unwrap();
            inner.put(b"deep", b"value").unwrap();
            tx.commit().unwrap();
        }

        let db = open_at(&path);
        let tx = db.begin(false).unwrap();
        let inner = tx
            .bucket(b"outer")
            .and_then(|outer| outer.bucket(b"inner"))
            .expect("nested bucket SHOULD survive reopen");
        let (key, value, _) = inner.cursor().seek(b"deep").unwrap();
        assert_eq!(key, b"deep");
        assert_eq!(value, b"value");
    }

    #[test]
    fn bucket_outgrows_its_inline_form() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grow.db");
        let count = 500u32;

        {
            let db = open_at(&path);
            let tx = db.begin(true).unwrap();
            let bucket = tx.create_bucket(b"big").unwrap();
            // Far past a quarter page; forces the bucket onto pages of its
            // own and splits its root leaf on the way.
            for i in 0..count {
                bucket
                    .put(
                        format!("key-{:05}", i).as_bytes(),
                        format!("value-{:05}", i).as_bytes(),
                    )
                    .unwrap();
            }
            tx.commit().unwrap();
        }

        let db = open_at(&path);
        let tx = db.begin(false).unwrap();
        let bucket = tx.bucket(b"big").unwrap();
        let mut cursor = bucket.cursor();
        for i in (0..count).step_by(97) {
            let wanted = format!("key-{:05}", i);
            let (key, value, _) = cursor.seek(wanted.as_bytes()).unwrap();
            assert_eq!(key, wanted.as_bytes());
            assert_eq!(value, format!("value-{:05}", i).as_bytes());
        }
    }

    #[test]
    fn overwrites_across_commits_keep_the_latest_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overwrite.db");
        let db = open_at(&path);

        for round in 0..5u32 {
            let tx = db.begin(true).unwrap();
            if round == 0 {
                tx.create_bucket(b"b").unwrap();
            }
            let bucket = tx.bucket(b"b").unwrap();
            bucket
                .put(b"counter", format!("{}", round).as_bytes())
                .unwrap();
            tx.commit().unwrap();
        }

        let tx = db.begin(false).unwrap();
        let (_, value, _) = tx.bucket(b"b").unwrap().cursor().seek(b"counter").unwrap();
        assert_eq!(value, b"4");
    }

    #[test]
    fn steady_overwrites_reuse_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reuse.db");
        let db = open_at(&path);

        let write_round = |round: u32| {
            let tx = db.begin(true).unwrap();
            if round == 0 {
                tx.create_bucket(b"b").unwrap();
            }
            let bucket = tx.bucket(b"b").unwrap();
            for i in 0..50u32 {
                bucket
                    .put(
                        format!("key-{:03}", i).as_bytes(),
                        format!("round-{}-{}", round, i).as_bytes(),
                    )
                    .unwrap();
            }
            tx.commit().unwrap();
        };

        for round in 0..6 {
            write_round(round);
        }
        let settled = std::fs::metadata(&path).unwrap().len();

        for round in 6..12 {
            write_round(round);
        }
        let after = std::fs::metadata(&path).unwrap().len();

        assert_eq!(
            settled, after,
            "steady-state overwrites SHOULD recycle freed pages instead of growing the file"
        );
    }
}

mod error_kind_tests {
    use super::*;

    #[test]
    fn duplicate_bucket_creation_fails() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("dup.db"));

        let tx = db.begin(true).unwrap();
        tx.create_bucket(b"widgets").unwrap();
        let err = tx.create_bucket(b"widgets").unwrap_err();

        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::BucketExists));
    }

    #[test]
    fn read_only_transaction_rejects_writes() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("ro-tx.db"));

        let tx = db.begin(false).unwrap();
        let err = tx.create_bucket(b"foo").unwrap_err();

        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::TxNotWritable));
    }

    #[test]
    fn committed_transaction_is_closed() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("closed.db"));

        let tx = db.begin(true).unwrap();
        tx.create_bucket(b"first").unwrap();
        tx.commit().unwrap();

        let err = tx.create_bucket(b"second").unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::TxClosed));

        let err = tx.rollback().unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::TxClosed));
    }

    #[test]
    fn key_size_limits_are_enforced() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("limits.db"));

        let tx = db.begin(true).unwrap();
        let bucket = tx.create_bucket(b"b").unwrap();

        let err = bucket.put(&vec![b'k'; 32769], b"v").unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::KeyTooLarge));

        let err = bucket.put(b"", b"v").unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::KeyRequired));

        // At the limit is fine.
        bucket.put(&vec![b'k'; 32768], b"v").unwrap();
    }

    #[test]
    fn oversized_values_are_rejected() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("big-value.db"));

        let tx = db.begin(true).unwrap();
        let bucket = tx.create_bucket(b"b").unwrap();

        // Zero-filled and never touched; the length check fires before
        // any byte of it is read.
        let huge = vec![0u8; (1 << 31) - 1];
        let err = bucket.put(b"k", &huge).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::ValueTooLarge));
    }

    #[test]
    fn garbage_file_fails_open_as_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("y");
        std::fs::write(&path, b"this is not a pddb database").unwrap();

        let err = Database::open(&path, Options::default()).unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Invalid));
    }

    #[test]
    fn plain_key_and_bucket_key_are_incompatible() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("incompat.db"));

        let tx = db.begin(true).unwrap();
        let root = tx.create_bucket(b"root").unwrap();
        root.put(b"plain", b"v").unwrap();
        root.create_bucket(b"nested").unwrap();

        let err = root.create_bucket(b"plain").unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::IncompatibleValue));

        let err = root.put(b"nested", b"v").unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::IncompatibleValue));
    }

    #[test]
    fn empty_bucket_name_is_rejected() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("noname.db"));

        let tx = db.begin(true).unwrap();
        let err = tx.create_bucket(b"").unwrap_err();

        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::BucketNameRequired)
        );
    }

    #[test]
    fn locked_database_open_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("held.db");
        let _holder = open_at(&path);

        let err = Database::open(
            &path,
            Options {
                timeout: Duration::from_millis(120),
                ..Options::default()
            },
        )
        .unwrap_err();

        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Timeout));
    }
}

mod transaction_semantics_tests {
    use super::*;

    #[test]
    fn dropping_a_write_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drop.db");
        let db = open_at(&path);

        {
            let tx = db.begin(true).unwrap();
            let bucket = tx.create_bucket(b"doomed").unwrap();
            bucket.put(b"k", b"v").unwrap();
            // No commit.
        }

        let tx = db.begin(false).unwrap();
        assert!(tx.bucket(b"doomed").is_none());
        drop(tx);

        // The writer lock was released; a new writer works fine.
        let tx = db.begin(true).unwrap();
        tx.create_bucket(b"kept").unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn rollback_discards_staged_changes() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("rollback.db"));

        let tx = db.begin(true).unwrap();
        tx.create_bucket(b"b").unwrap();
        tx.commit().unwrap();

        let tx = db.begin(true).unwrap();
        tx.bucket(b"b").unwrap().put(b"staged", b"v").unwrap();
        tx.rollback().unwrap();

        let tx = db.begin(false).unwrap();
        assert!(tx.bucket(b"b").unwrap().cursor().seek(b"staged").is_none());
    }

    #[test]
    fn readers_keep_their_snapshot_while_a_writer_commits() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("snapshot.db"));

        let tx = db.begin(true).unwrap();
        tx.create_bucket(b"b").unwrap().put(b"k", b"old").unwrap();
        tx.commit().unwrap();

        std::thread::scope(|scope| {
            let reader = db.begin(false).unwrap();

            let writer = scope.spawn(|| {
                let tx = db.begin(true).unwrap();
                tx.bucket(b"b").unwrap().put(b"k", b"new").unwrap();
                tx.commit().unwrap();
            });

            // The reader's snapshot predates the commit.
            let (_, value, _) = reader.bucket(b"b").unwrap().cursor().seek(b"k").unwrap();
            assert_eq!(value, b"old", "snapshot SHOULD NOT see later commits");

            drop(reader);
            writer.join().unwrap();
        });

        let tx = db.begin(false).unwrap();
        let (_, value, _) = tx.bucket(b"b").unwrap().cursor().seek(b"k").unwrap();
        assert_eq!(value, b"new");
    }

    #[test]
    fn writes_are_visible_inside_their_own_transaction() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("own-writes.db"));

        let tx = db.begin(true).unwrap();
        let bucket = tx.create_bucket(b"b").unwrap();
        bucket.put(b"k", b"v").unwrap();

        let (key, value, _) = bucket.cursor().seek(b"k").unwrap();
        assert_eq!(key, b"k");
        assert_eq!(value, b"v");
        tx.commit().unwrap();
    }

    #[test]
    fn update_commits_and_view_reads() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("managed.db"));

        db.update(|tx| {
            let bucket = tx.create_bucket(b"b")?;
            bucket.put(b"k", b"v")
        })
        .unwrap();

        let value = db
            .view(|tx| {
                let bucket = tx.bucket(b"b").expect("bucket SHOULD be committed");
                Ok(bucket.cursor().seek(b"k").unwrap().1)
            })
            .unwrap();
        assert_eq!(value, b"v");
    }

    #[test]
    fn update_rolls_back_on_error() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("managed-err.db"));

        let result: eyre::Result<()> = db.update(|tx| {
            tx.create_bucket(b"b")?;
            eyre::bail!("abort this one")
        });
        assert!(result.is_err());

        db.view(|tx| {
            assert!(tx.bucket(b"b").is_none());
            Ok(())
        })
        .unwrap();
    }
}

mod cursor_tests {
    use super::*;

    #[test]
    fn seek_lands_on_the_next_key_at_or_after() {
        let dir = tempdir().unwrap();
        let db = open_at(&dir.path().join("seek.db"));

        let tx = db.begin(true).unwrap();
        let bucket = tx.create_bucket(b"b").unwrap();
        bucket.put(b"a", b"1").unwrap();
        bucket.put(b"c", b"3").unwrap();

        let mut cursor = bucket.cursor();
        let (key, value, _) = cursor.seek(b"b").unwrap();
        assert_eq!(key, b"c");
        assert_eq!(value, b"3");

        assert!(cursor.seek(b"d").is_none(), "seek past the end SHOULD be empty");
    }

    #[test]
    fn seeking_sorted_keys_visits_them_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("order.db");

        let mut keys: Vec<String> = (0..300).map(|i| format!("k{:04}", i * 7 % 300)).collect();
        {
            let db = open_at(&path);
            let tx = db.begin(true).unwrap();
            let bucket = tx.create_bucket(b"b").unwrap();
            for key in &keys {
                bucket.put(key.as_bytes(), b"x").unwrap();
            }
            tx.commit().unwrap();
        }

        keys.sort();
        let db = open_at(&path);
        let tx = db.begin(false).unwrap();
        let bucket = tx.bucket(b"b").unwrap();
        let mut cursor = bucket.cursor();
        let mut seen = Vec::new();
        for key in &keys {
            let (found, _, _) = cursor.seek(key.as_bytes()).unwrap();
            seen.push(String::from_utf8(found).unwrap());
        }
        assert_eq!(seen, keys);
    }
}
