use cdfsession::{CdfError, FileId, NcType, OpenFlags, Platform, Session, SessionConfig};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

/// Reports a fixed descriptor limit.
struct Limited(usize);

impl Platform for Limited {
    fn open_file_limit(&self) -> usize {
        self.0
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }
}

fn session_with_limit(limit: usize, config: SessionConfig) -> Session {
    Session::with_platform(config, Arc::new(Limited(limit)))
}

fn seed(session: &mut Session, path: &Path) {
    let id = session
        .create(path, OpenFlags::WRITE | OpenFlags::CREATE)
        .expect("create");
    session.add_dimension(id, "n", Some(2)).expect("n");
    session.add_variable(id, "v", NcType::Int, &["n"]).expect("v");
    session.close(id).expect("close");
}

#[test]
fn exhaustion_then_close_open_cycles_keep_working() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("a.cdf");
    // Ceiling is 8 - 3 reserved = 5; the default of 32 is clamped to it.
    let mut session = session_with_limit(8, SessionConfig::default());
    assert_eq!(session.system_limit(), 5);
    assert_eq!(session.negotiated_max_open(), 5);
    seed(&mut session, &path);

    let mut ids: Vec<FileId> = (0..5)
        .map(|_| session.open(&path, OpenFlags::empty()).expect("open"))
        .collect();
    assert_eq!(session.current_open_count(), 5);
    let err = session
        .open(&path, OpenFlags::empty())
        .expect_err("exhausted");
    assert!(matches!(err, CdfError::TooManyOpenFiles { limit: 5 }));
    assert_eq!(session.current_open_count(), 5);

    for _ in 0..20 {
        let victim = ids.remove(1);
        session.close(victim).expect("close");
        let id = session.open(&path, OpenFlags::empty()).expect("reopen");
        assert_eq!(id, victim);
        ids.push(id);
        assert_eq!(session.current_open_count(), 5);
    }
    for id in ids {
        session.close(id).expect("close");
    }
    assert_eq!(session.current_open_count(), 0);
}

#[test]
fn table_grows_from_default_to_ceiling_once() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("a.cdf");
    let mut session = session_with_limit(9, SessionConfig::small_table().with_default_max_open(2));
    seed(&mut session, &path);
    assert_eq!(session.negotiated_max_open(), 2);

    let a = session.open(&path, OpenFlags::empty()).expect("a");
    let b = session.open(&path, OpenFlags::empty()).expect("b");
    let c = session.open(&path, OpenFlags::empty()).expect("c");
    assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
    assert_eq!(session.negotiated_max_open(), 6);
    for id in [a, b, c] {
        session.close(id).expect("close");
    }
}

#[test]
fn negotiated_capacity_never_drops_below_live_files() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("a.cdf");
    let mut session = session_with_limit(1024, SessionConfig::default());
    seed(&mut session, &path);

    assert_eq!(session.max_open_files(0).expect("ensure"), 32);
    let ids: Vec<FileId> = (0..6)
        .map(|_| session.open(&path, OpenFlags::empty()).expect("open"))
        .collect();
    for request in [0, 1, 3, 6, 10, 100, 5_000] {
        let capacity = session.max_open_files(request).expect("allocate");
        assert!(capacity >= session.current_open_count());
        assert!(capacity <= session.system_limit());
    }
    assert_eq!(session.max_open_files(5_000).expect("capped"), 1021);
    for id in ids {
        session.close(id).expect("close");
    }
}

#[test]
fn redefine_needs_a_spare_slot() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("a.cdf");
    let mut session = session_with_limit(5, SessionConfig::default());
    seed(&mut session, &path);

    let writer = session.open(&path, OpenFlags::WRITE).expect("writer");
    let reader = session.open(&path, OpenFlags::empty()).expect("reader");
    let err = session.enter_define(writer).expect_err("no spare slot");
    assert!(matches!(err, CdfError::TooManyOpenFiles { limit: 2 }));
    assert!(!session.is_defining(writer).expect("state"));
    assert_eq!(session.current_open_count(), 2);

    session.close(reader).expect("close reader");
    session.enter_define(writer).expect("redef");
    assert_eq!(session.current_open_count(), 2);
    session.abort(writer).expect("abort");
    assert_eq!(session.current_open_count(), 0);
}
