use cdfsession::catalog::{Schema, Variable};
use cdfsession::codec::{ClassicCodec, CodecGateway, EncodedStream, Header};
use cdfsession::{
    CdfError, DefineOrigin, DefineState, FileKind, HostPlatform, NcType, OpenFlags, Session,
    SessionConfig,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::tempdir;

/// Classic codec whose fill writes fail while `broken` is set.
#[derive(Default)]
struct BrokenFill {
    inner: ClassicCodec,
    broken: AtomicBool,
}

impl CodecGateway for BrokenFill {
    fn encode_header(
        &self,
        kind: FileKind,
        schema: &Schema,
        num_records: u64,
    ) -> Result<Vec<u8>, CdfError> {
        self.inner.encode_header(kind, schema, num_records)
    }

    fn decode_header(&self, stream: &mut EncodedStream) -> Result<Header, CdfError> {
        self.inner.decode_header(stream)
    }

    fn write_num_records(&self, stream: &mut EncodedStream, n: u64) -> Result<(), CdfError> {
        self.inner.write_num_records(stream, n)
    }

    fn write_fill(
        &self,
        stream: &mut EncodedStream,
        var: &Variable,
        span: u64,
    ) -> Result<(), CdfError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(CdfError::CodecFault("fill write failed".into()));
        }
        self.inner.write_fill(stream, var, span)
    }
}

fn entries(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    out.sort();
    out
}

fn doubles(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

fn seed(session: &mut Session, path: &Path) {
    let id = session
        .create(
            path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::CONTAINER,
        )
        .expect("create");
    assert_eq!(session.kind(id).expect("kind"), FileKind::Container);
    session.add_dimension(id, "n", Some(3)).expect("n");
    session
        .add_variable(id, "base", NcType::Double, &["n"])
        .expect("base");
    session.commit_define(id).expect("commit");
    session
        .write_variable(id, "base", &doubles(&[1.5, 2.5, 3.5]))
        .expect("write");
    session.close(id).expect("close");
}

#[test]
fn in_place_growth_creates_no_scratch_file() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("c.cdc");
    let mut session = Session::default();
    seed(&mut session, &path);
    let listing = entries(dir.path());

    let id = session.open(&path, OpenFlags::WRITE).expect("open");
    assert_eq!(session.kind(id).expect("kind"), FileKind::Container);
    session.enter_define(id).expect("define");
    assert_eq!(
        session.state(id).expect("state"),
        DefineState::Defining(DefineOrigin::InPlace)
    );
    assert_eq!(session.current_open_count(), 1);
    assert_eq!(entries(dir.path()), listing);

    session.add_variable(id, "more", NcType::Int, &["n"]).expect("more");
    // Existing data stays readable while defining.
    assert_eq!(
        session.read_variable(id, "base").expect("base"),
        doubles(&[1.5, 2.5, 3.5])
    );
    assert!(matches!(
        session.read_variable(id, "more"),
        Err(CdfError::AlreadyInDefineMode { .. })
    ));
    session.commit_define(id).expect("commit");
    assert_eq!(entries(dir.path()), listing);

    let info = session.describe(id).expect("info");
    let base = info.schema.variable("base").expect("base");
    let more = info.schema.variable("more").expect("more");
    assert_eq!(base.begin(), SessionConfig::default().container_header_reserve);
    assert_eq!(more.begin(), base.begin() + base.len());
    assert_eq!(
        session.read_variable(id, "more").expect("more"),
        [0x80u8, 0, 0, 1].repeat(3)
    );
    session.close(id).expect("close");

    let id = session.open(&path, OpenFlags::empty()).expect("reopen");
    assert_eq!(
        session.read_variable(id, "base").expect("base"),
        doubles(&[1.5, 2.5, 3.5])
    );
    session.close(id).expect("close");
}

#[test]
fn abort_restores_the_previous_schema() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("c.cdc");
    let mut session = Session::default();
    seed(&mut session, &path);
    let before = fs::read(&path).expect("read");

    let id = session.open(&path, OpenFlags::WRITE).expect("open");
    session.enter_define(id).expect("define");
    session.add_variable(id, "gone", NcType::Byte, &["n"]).expect("gone");
    session.abort(id).expect("abort");
    assert_eq!(fs::read(&path).expect("read"), before);

    let id = session.open(&path, OpenFlags::empty()).expect("reopen");
    let info = session.describe(id).expect("info");
    assert_eq!(info.schema.variables().len(), 1);
    session.close(id).expect("close");
}

#[test]
fn record_variables_are_rejected() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("c.cdc");
    let mut session = Session::default();
    seed(&mut session, &path);

    let id = session.open(&path, OpenFlags::WRITE).expect("open");
    session.enter_define(id).expect("define");
    session.add_dimension(id, "t", None).expect("t");
    let err = session
        .add_variable(id, "series", NcType::Float, &["t"])
        .expect_err("record var");
    assert!(matches!(err, CdfError::InvalidArgument(_)));
    assert!(
        session
            .describe(id)
            .expect("info")
            .schema
            .variable("series")
            .is_none()
    );
    session.close(id).expect("close");
}

#[test]
fn header_outgrowing_its_reserve_keeps_define_mode() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("c.cdc");
    let mut session = Session::new(SessionConfig::default().with_container_header_reserve(128));
    seed(&mut session, &path);

    let id = session.open(&path, OpenFlags::WRITE).expect("open");
    session.enter_define(id).expect("define");
    for idx in 0..8 {
        session
            .add_variable(id, &format!("variable_number_{idx}"), NcType::Int, &["n"])
            .expect("var");
    }
    let err = session.commit_define(id).expect_err("too big");
    assert!(matches!(err, CdfError::CodecFault(_)));
    assert_eq!(
        session.state(id).expect("state"),
        DefineState::Defining(DefineOrigin::InPlace)
    );
    session.abort(id).expect("abort");
}

#[test]
fn failed_fill_leaves_the_container_untouched() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("c.cdc");
    let codec = Arc::new(BrokenFill::default());
    let mut session =
        Session::with_parts(SessionConfig::default(), codec.clone(), Arc::new(HostPlatform));
    seed(&mut session, &path);
    let before = fs::read(&path).expect("read");

    let id = session.open(&path, OpenFlags::WRITE).expect("open");
    session.enter_define(id).expect("define");
    session.add_variable(id, "more", NcType::Int, &["n"]).expect("more");
    codec.broken.store(true, Ordering::SeqCst);
    let err = session.commit_define(id).expect_err("fill fails");
    assert!(matches!(err, CdfError::CodecFault(_)));
    assert_eq!(
        session.state(id).expect("state"),
        DefineState::Defining(DefineOrigin::InPlace)
    );
    assert_eq!(fs::read(&path).expect("read"), before);

    session.abort(id).expect("abort");
    assert_eq!(fs::read(&path).expect("read"), before);
    let id = session.open(&path, OpenFlags::empty()).expect("reopen");
    let names: Vec<String> = session
        .describe(id)
        .expect("info")
        .schema
        .variables()
        .iter()
        .map(|v| v.name().to_string())
        .collect();
    assert_eq!(names, vec!["base".to_string()]);
    session.close(id).expect("close");

    // Once fills work again the same definition commits.
    codec.broken.store(false, Ordering::SeqCst);
    let id = session.open(&path, OpenFlags::WRITE).expect("open");
    session.enter_define(id).expect("define");
    session.add_variable(id, "more", NcType::Int, &["n"]).expect("more");
    session.commit_define(id).expect("commit");
    assert_eq!(
        session.read_variable(id, "more").expect("more"),
        [0x80u8, 0, 0, 1].repeat(3)
    );
    session.close(id).expect("close");
}
