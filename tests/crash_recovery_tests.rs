use basalt::{BlockId, Database, DiskPosition, StoreConfig};
use tempfile::tempdir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pos(index: i32, offset: usize) -> DiskPosition {
    DiskPosition::new(BlockId::new("data.tbl", index), offset)
}

fn allocate(db: &Database, blocks: i32) {
    let mut tx = db.transaction();
    tx.allocate_new_blocks(&BlockId::new("data.tbl", blocks)).unwrap();
    tx.commit().unwrap();
}

#[test]
fn test_committed_data_survives_reopen() {
    init_logging();
    let dir = tempdir().unwrap();
    {
        let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
        allocate(&db, 1);
        let mut tx = db.transaction();
        tx.write_int(&pos(0, 0), 9).unwrap();
        tx.write_string(&pos(0, 8), "ok").unwrap();
        tx.commit().unwrap();
        // Dropped without any explicit flush of the data pages.
    }

    let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
    let mut reader = db.transaction();
    assert_eq!(reader.read_int(&pos(0, 0)).unwrap(), 9);
    assert_eq!(reader.read_string(&pos(0, 8), 2).unwrap(), "ok");
    reader.commit().unwrap();
}

#[test]
fn test_unfinished_transaction_is_rolled_back_on_reopen() {
    init_logging();
    let dir = tempdir().unwrap();
    {
        let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
        allocate(&db, 5);

        let mut committed = db.transaction();
        committed.write_int(&pos(4, 3), 4).unwrap();
        committed.commit().unwrap();

        let mut unfinished = db.transaction();
        unfinished.write_int(&pos(4, 3), 5).unwrap();
        // Crash before the second transaction ends.
    }

    let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
    let mut reader = db.transaction();
    assert_eq!(reader.read_int(&pos(4, 3)).unwrap(), 4);
    reader.commit().unwrap();
}

#[test]
fn test_repeated_crashes_converge() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
        allocate(&db, 1);
        let mut tx = db.transaction();
        tx.write_int(&pos(0, 0), 21).unwrap();
        tx.commit().unwrap();
    }

    // Each reopen replays the same log; the committed value must hold
    // steady through repeated recoveries.
    for _ in 0..3 {
        let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
        let mut reader = db.transaction();
        assert_eq!(reader.read_int(&pos(0, 0)).unwrap(), 21);
        reader.commit().unwrap();
    }
}

#[test]
fn test_checkpoint_then_crash() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
        allocate(&db, 1);
        let mut tx = db.transaction();
        tx.write_int(&pos(0, 4), 17).unwrap();
        tx.commit().unwrap();
        db.checkpoint().unwrap();

        let mut unfinished = db.transaction();
        unfinished.write_int(&pos(0, 4), 18).unwrap();
        // Crash after the checkpoint, mid-transaction.
    }

    let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
    let mut reader = db.transaction();
    assert_eq!(reader.read_int(&pos(0, 4)).unwrap(), 17);
    reader.commit().unwrap();
}

#[test]
fn test_overwrites_recover_to_last_commit() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
        allocate(&db, 1);
        for value in [1, 2, 3] {
            let mut tx = db.transaction();
            tx.write_int(&pos(0, 0), value).unwrap();
            tx.commit().unwrap();
        }
        let mut unfinished = db.transaction();
        unfinished.write_int(&pos(0, 0), 99).unwrap();
    }

    let db = Database::open(StoreConfig::compact(dir.path())).unwrap();
    let mut reader = db.transaction();
    assert_eq!(reader.read_int(&pos(0, 0)).unwrap(), 3);
    reader.commit().unwrap();
}
