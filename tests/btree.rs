//! End-to-end B-tree scenarios

use oakdb::storage::btree::{Btree, BtreeConfig};

fn open_db(dir: &tempfile::TempDir, name: &str) -> Btree {
    let path = dir.path().join(name);
    Btree::open_with_config(path.to_str().unwrap(), BtreeConfig::default()).unwrap()
}

/// Open; begin; insert three pairs; commit; seek one back.
#[test]
fn small_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "s1.db");

    db.begin_trans(true).unwrap();
    let root = db.create_table("fruit").unwrap();
    {
        let mut cur = db.cursor(root).unwrap();
        cur.insert(b"apple", b"A").unwrap();
        cur.insert(b"banana", b"B").unwrap();
        cur.insert(b"cherry", b"C").unwrap();
    }
    db.commit().unwrap();

    let mut cur = db.cursor(root).unwrap();
    assert_eq!(cur.moveto(b"banana").unwrap(), 0);
    assert_eq!(cur.full_key().unwrap(), b"banana");
    assert_eq!(cur.full_data().unwrap(), b"B");
    drop(cur);
    db.integrity_check().unwrap();
}

/// A payload far past the inline limit round-trips through its overflow
/// chain, across a close and reopen.
#[test]
fn overflow_payload() {
    let dir = tempfile::tempdir().unwrap();
    let pattern: Vec<u8> = (0..5000u32).map(|i| (i & 0xff) as u8).collect();
    let root;
    {
        let db = open_db(&dir, "s2.db");
        db.begin_trans(true).unwrap();
        root = db.create_table("blobs").unwrap();
        {
            let mut cur = db.cursor(root).unwrap();
            cur.insert(b"k", &pattern).unwrap();
        }
        db.commit().unwrap();
        // The cell must span at least four overflow pages.
        assert!(db.page_count() >= 7, "pages: {}", db.page_count());
        db.close().unwrap();
    }

    let db = open_db(&dir, "s2.db");
    let mut cur = db.cursor(root).unwrap();
    assert_eq!(cur.moveto(b"k").unwrap(), 0);
    assert_eq!(cur.data_size().unwrap(), 5000);
    for offset in [0usize, 1000, 4999] {
        let n = (5000 - offset).min(64);
        let window = cur.data(offset, n).unwrap();
        assert_eq!(window, &pattern[offset..offset + n], "offset {offset}");
    }
    assert_eq!(cur.full_data().unwrap(), pattern);
    drop(cur);
    db.integrity_check().unwrap();
}

/// Twenty wide cells cannot share one page: the root splits and the keys
/// stay in order across the children.
#[test]
fn split_root() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "s3.db");

    db.begin_trans(true).unwrap();
    let root = db.create_table("wide").unwrap();
    let before = db.page_count();
    {
        let mut cur = db.cursor(root).unwrap();
        for i in 0..20 {
            let key = format!("{i:03}");
            cur.insert(key.as_bytes(), &[b'd'; 80]).unwrap();
        }
    }
    db.commit().unwrap();
    // The split allocated child pages under the same root.
    assert!(db.page_count() >= before + 2, "pages: {}", db.page_count());

    let mut cur = db.cursor(root).unwrap();
    assert!(cur.first().unwrap());
    let mut keys = vec![cur.full_key().unwrap()];
    while cur.next().unwrap() {
        keys.push(cur.full_key().unwrap());
    }
    let want: Vec<Vec<u8>> = (0..20).map(|i| format!("{i:03}").into_bytes()).collect();
    assert_eq!(keys, want);
    drop(cur);
    db.integrity_check().unwrap();
}

/// Deleting overflow-bearing entries feeds the free list; later inserts
/// recycle those pages before the file grows.
#[test]
fn free_list_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "s4.db");

    let payload = vec![0x5au8; 500];
    db.begin_trans(true).unwrap();
    let root = db.create_table("recycle").unwrap();
    {
        let mut cur = db.cursor(root).unwrap();
        for i in 0..100 {
            let key = format!("key{i:04}");
            cur.insert(key.as_bytes(), &payload).unwrap();
        }
        for i in (0..100).step_by(2) {
            let key = format!("key{i:04}");
            assert_eq!(cur.moveto(key.as_bytes()).unwrap(), 0);
            cur.delete().unwrap();
        }
    }
    db.commit().unwrap();
    db.integrity_check().unwrap();

    let captured = db.page_count();
    db.begin_trans(true).unwrap();
    {
        let mut cur = db.cursor(root).unwrap();
        for i in (0..80).step_by(2) {
            let key = format!("key{i:04}");
            cur.insert(key.as_bytes(), &payload).unwrap();
        }
    }
    db.commit().unwrap();
    assert_eq!(
        db.page_count(),
        captured,
        "inserts must recycle freed pages before extending the file"
    );
    db.integrity_check().unwrap();
}

/// Inserting an equal key replaces the old entry wholesale.
#[test]
fn insert_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "dup.db");

    db.begin_trans(true).unwrap();
    let root = db.create_table("t").unwrap();
    {
        let mut cur = db.cursor(root).unwrap();
        cur.insert(b"k", b"first").unwrap();
        cur.insert(b"k", &vec![0x11u8; 3000]).unwrap();
        cur.insert(b"k", b"last").unwrap();

        assert_eq!(cur.moveto(b"k").unwrap(), 0);
        assert_eq!(cur.full_data().unwrap(), b"last");
        assert!(cur.first().unwrap());
        assert!(!cur.next().unwrap(), "exactly one entry for the key");
    }
    db.commit().unwrap();
    db.integrity_check().unwrap();
}

/// After a delete the key is gone: moveto lands on a neighbour.
#[test]
fn delete_then_seek() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "gone.db");

    db.begin_trans(true).unwrap();
    let root = db.create_table("t").unwrap();
    {
        let mut cur = db.cursor(root).unwrap();
        for key in ["aa", "bb", "cc"] {
            cur.insert(key.as_bytes(), b"v").unwrap();
        }
        assert_eq!(cur.moveto(b"bb").unwrap(), 0);
        cur.delete().unwrap();
        assert_ne!(cur.moveto(b"bb").unwrap(), 0);
    }
    db.commit().unwrap();
    db.integrity_check().unwrap();
}

/// Rollback discards every change of the transaction, including file
/// growth.
#[test]
fn rollback_discards() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "rb.db");

    db.begin_trans(true).unwrap();
    let root = db.create_table("t").unwrap();
    {
        let mut cur = db.cursor(root).unwrap();
        cur.insert(b"durable", b"1").unwrap();
    }
    db.commit().unwrap();
    let committed_pages = db.page_count();

    db.begin_trans(true).unwrap();
    {
        let mut cur = db.cursor(root).unwrap();
        cur.insert(b"ephemeral", &vec![0u8; 4000]).unwrap();
        cur.insert(b"durable", b"2").unwrap();
    }
    db.rollback().unwrap();

    assert_eq!(db.page_count(), committed_pages);
    let mut cur = db.cursor(root).unwrap();
    assert_ne!(cur.moveto(b"ephemeral").unwrap(), 0);
    assert_eq!(cur.moveto(b"durable").unwrap(), 0);
    assert_eq!(cur.full_data().unwrap(), b"1");
    drop(cur);
    db.integrity_check().unwrap();
}

/// Write transactions and cursors exclude each other the way the
/// transaction surface promises.
#[test]
fn transaction_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "proto.db");

    db.begin_trans(true).unwrap();
    let root = db.create_table("t").unwrap();
    db.commit().unwrap();

    let cur = db.cursor(root).unwrap();
    assert!(db.begin_trans(true).is_err(), "write txn with open cursor");
    drop(cur);

    db.begin_trans(true).unwrap();
    let cur = db.cursor(root).unwrap();
    assert!(db.commit().is_err(), "commit with open cursor");
    drop(cur);
    db.commit().unwrap();

    // Mutation outside a transaction is refused.
    let mut cur = db.cursor(root).unwrap();
    assert!(cur.insert(b"k", b"v").is_err());
}

/// The table directory maps lowercased names to roots; drop reclaims the
/// table's pages.
#[test]
fn table_directory() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir, "names.db");

    db.begin_trans(true).unwrap();
    let root = db.create_table("Widgets").unwrap();
    assert_eq!(db.table_root("widgets").unwrap(), Some(root));
    assert_eq!(db.table_root("WIDGETS").unwrap(), Some(root));
    assert_eq!(db.table_root("missing").unwrap(), None);
    assert!(db.create_table("widgets").is_err(), "duplicate name");

    {
        let mut cur = db.cursor(root).unwrap();
        for i in 0..50 {
            cur.insert(format!("k{i}").as_bytes(), &vec![1u8; 300]).unwrap();
        }
    }
    db.drop_table("widgets").unwrap();
    assert_eq!(db.table_root("widgets").unwrap(), None);
    db.commit().unwrap();
    db.integrity_check().unwrap();
}

/// A file that is not an oakdb database is rejected at open.
#[test]
fn bad_magic_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.db");
    std::fs::write(&path, vec![0xa5u8; 2048]).unwrap();
    let err = Btree::open(path.to_str().unwrap()).unwrap_err();
    assert_eq!(err.code(), oakdb::ErrorCode::Corrupt);
}

/// A deep mixed workload with a modest page size keeps every invariant.
#[test]
fn mixed_workload_integrity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mix.db");
    let config = BtreeConfig {
        page_size: 512,
        cache_pages: 64,
    };
    let db = Btree::open_with_config(path.to_str().unwrap(), config).unwrap();

    db.begin_trans(true).unwrap();
    let root = db.create_table("mix").unwrap();
    {
        let mut cur = db.cursor(root).unwrap();
        // Interleave sizes so cells overflow, rotate, and split.
        for i in 0..400u32 {
            let key = format!("{:08}", (i * 7919) % 100000);
            let len = (i as usize * 37) % 900;
            cur.insert(key.as_bytes(), &vec![(i & 0xff) as u8; len]).unwrap();
        }
        for i in (0..400u32).step_by(3) {
            let key = format!("{:08}", (i * 7919) % 100000);
            if cur.moveto(key.as_bytes()).unwrap() == 0 {
                cur.delete().unwrap();
            }
        }
    }
    db.commit().unwrap();
    db.integrity_check().unwrap();

    // Every surviving key is still readable in order.
    let mut cur = db.cursor(root).unwrap();
    let mut n = 0;
    let mut prev: Option<Vec<u8>> = None;
    if cur.first().unwrap() {
        loop {
            let key = cur.full_key().unwrap();
            if let Some(p) = &prev {
                assert!(p < &key, "keys in order");
            }
            prev = Some(key);
            n += 1;
            if !cur.next().unwrap() {
                break;
            }
        }
    }
    assert!(n > 200, "kept {n} keys");
}
