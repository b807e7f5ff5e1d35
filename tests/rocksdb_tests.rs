#![cfg(feature = "rocksdb")]

mod common;

use maat::conflict::detection::{ScanOptions, scan_conflicts};
use maat::prelude::*;

use common::{column, ht, row, write_intents, writes};

#[test]
fn test_rocksdb_key_spaces_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let writer = TransactionId::generate();
    {
        let doc_db = DocDb::open_rocksdb(dir.path()).unwrap();
        write_intents(&doc_db, writer, &[column("1", 1)], ht(10));
        doc_db
            .put_regular(&row("2"), DocHybridTime::new(ht(100), 0), b"v")
            .unwrap();
    }

    let doc_db = DocDb::open_rocksdb(dir.path()).unwrap();
    let options = ScanOptions {
        requester: None,
        read_time: Some(ht(50)),
        resolution_ht: ht(1_000),
        partial_range_key_intents: false,
    };
    let scan = scan_conflicts(&doc_db, &writes(&[row("1"), row("2")]), &options).unwrap();
    assert!(scan.intents.contains_key(&writer));
    assert_eq!(scan.committed_values_max_ht, Some(ht(100)));

    assert_eq!(doc_db.remove_intents_of(writer).unwrap(), 3);
    let scan = scan_conflicts(&doc_db, &writes(&[row("1")]), &options).unwrap();
    assert!(scan.is_empty());
}
