// End-to-end lookaside lifecycle against the file backend.
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use lookaside::api::{
    Connection, ConnectionConfig, ErrorKind, FileBackend, LookasideValue, Session, SessionFlags,
    StorageBackend, TableCursor, TableFormat, inspect_table,
};

fn open(dir: &std::path::Path) -> Connection<FileBackend> {
    Connection::open(FileBackend::new(dir), ConnectionConfig::default()).expect("open")
}

#[test]
fn stale_table_from_previous_run_is_replaced() {
    let temp = tempfile::tempdir().expect("tempdir");
    let table = temp.path().join("lookaside.las");
    {
        let backend = FileBackend::new(temp.path());
        backend
            .create_table("lookaside.las", &TableFormat::lookaside())
            .expect("create");
        let session = Session::new("previous-run");
        let mut cursor = backend
            .open_cursor(&session, "lookaside.las", Default::default())
            .expect("cursor");
        cursor
            .insert(b"stale", &LookasideValue::new(1, 1, b"old".to_vec()))
            .expect("insert");
        backend.close_session(session, Some(cursor)).expect("close");
    }
    assert_eq!(inspect_table(&table).expect("inspect").records, 1);

    let connection = open(temp.path());
    let mut session = connection.open_session("reader");
    let mut cursor = connection.lookaside_cursor(&mut session).expect("cursor");
    assert!(cursor.search(b"stale").expect("search").is_none());
    cursor.release().expect("release");

    let info = inspect_table(&table).expect("inspect");
    assert_eq!(info.records, 0);
    assert_eq!(info.flags, vec!["lookaside", "no_checkpoint", "no_logging"]);
    connection.close().expect("close");
    assert!(!table.exists());
}

#[test]
fn strict_cursor_surfaces_duplicate_inserts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let connection = open(temp.path());
    let mut session = connection.open_session("evict");

    let mut cursor = connection.lookaside_cursor(&mut session).expect("cursor");
    let value = LookasideValue::new(9, 3, b"v".to_vec());
    cursor.insert(b"btree-1/page-4/k", &value).expect("insert");
    let err = cursor
        .insert(b"btree-1/page-4/k", &value)
        .expect_err("duplicate");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    cursor.release().expect("release");

    let mut cursor = connection.lookaside_cursor(&mut session).expect("cursor");
    let err = cursor.remove(b"never-written").expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    cursor.release().expect("release");
}

#[test]
fn released_cursor_starts_from_a_clean_position() {
    let temp = tempfile::tempdir().expect("tempdir");
    let connection = open(temp.path());
    let mut session = connection.open_session("history");

    let mut cursor = connection.lookaside_cursor(&mut session).expect("cursor");
    for key in [&b"a"[..], b"b", b"c"] {
        cursor.insert(key, &LookasideValue::default()).expect("insert");
    }
    assert!(cursor.position().is_some());
    cursor.release().expect("release");

    let mut cursor = connection.lookaside_cursor(&mut session).expect("cursor");
    assert!(cursor.position().is_none());
    let (first, _) = cursor.next().expect("next").expect("entry");
    assert_eq!(first, b"a".to_vec());
    cursor.release().expect("release");
}

#[test]
fn two_callers_share_one_cursor_in_turn() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut connection = Some(open(temp.path()));
    let presence = {
        let connection = connection.as_ref().expect("connection");
        let presence = connection.lookaside().presence();
        let b_acquired = AtomicBool::new(false);

        thread::scope(|scope| {
            let mut session_a = connection.open_session("caller-a");
            session_a.set_flags(SessionFlags::HISTORY_READ);
            let mut cursor_a = connection.lookaside_cursor(&mut session_a).expect("a");
            assert!(!cursor_a.session().may_evict());
            let a_session = cursor_a.session_id();
            cursor_a
                .insert(b"k", &LookasideValue::new(1, 1, b"from-a".to_vec()))
                .expect("insert");

            let waiter = scope.spawn(|| {
                let mut session_b = connection.open_session("caller-b");
                let mut cursor_b = connection.lookaside_cursor(&mut session_b).expect("b");
                b_acquired.store(true, Ordering::SeqCst);
                let seen = cursor_b.search(b"k").expect("search");
                let b_session = cursor_b.session_id();
                cursor_b.release().expect("release b");
                (seen, b_session)
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!b_acquired.load(Ordering::SeqCst));
            cursor_a.release().expect("release a");
            assert_eq!(session_a.flags(), SessionFlags::HISTORY_READ);

            let (seen, b_session) = waiter.join().expect("join");
            assert_eq!(seen.map(|value| value.payload), Some(b"from-a".to_vec()));
            // Both borrowers got the cursor opened by the store's internal session.
            assert_eq!(a_session, b_session);
        });
        presence
    };

    assert!(presence.is_open());
    connection.take().expect("connection").close().expect("close");
    assert!(!presence.is_open());
    assert!(!temp.path().join("lookaside.las").exists());
}
