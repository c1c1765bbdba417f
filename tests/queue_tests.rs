use std::sync::Arc;

use tempfile::TempDir;

use bedloop::error::{BedloopError, ValidationError};
use bedloop::queue::{EditableQueue, LocalQueue, MultiQueue, NetworkQueue, Queue, QueueKind, Strategy};
use bedloop::replication::MemoryLog;
use bedloop::storage::{gjob, FileLocator, Job, JobManifest, JobRank, JobStore, RunLog, RunResult, Set};

fn local(dir: &TempDir, name: &str) -> LocalQueue {
    LocalQueue::new(
        name,
        Strategy::InOrder,
        "MK3S",
        JobStore::open(dir.path().join(format!("{name}.json"))).unwrap(),
        FileLocator::new(dir.path()),
    )
    .unwrap()
}

fn lan(dir: &TempDir, log: &MemoryLog, addr: &str) -> NetworkQueue {
    NetworkQueue::new(
        "lan",
        Strategy::InOrder,
        "MK3S",
        addr,
        Arc::new(log.connect(addr)),
        FileLocator::new(dir.path()),
    )
    .unwrap()
}

fn manifest(name: &str, paths: &[&str]) -> JobManifest {
    let mut job = Job::new(name, JobRank::Lex(String::new()));
    for p in paths {
        job.push_set(Set::new(job.id, *p, 1).with_profiles(vec!["MK3S".into()]));
    }
    JobManifest::from_job(&job)
}

#[test]
fn test_local_queue_has_priority_over_lan() {
    let dir = TempDir::new().unwrap();
    for f in ["mine.gcode", "shared.gcode"] {
        std::fs::write(dir.path().join(f), "G28\n").unwrap();
    }
    let log = MemoryLog::new();

    let mut mine = local(&dir, "local");
    mine.import_job(&manifest("mine", &["mine.gcode"])).unwrap();
    let mut lan = lan(&dir, &log, "a");
    lan.import_job(&manifest("shared", &["shared.gcode"])).unwrap();

    let mut mq = MultiQueue::new(Strategy::InOrder, RunLog::in_memory()).unwrap();
    mq.add_queue(QueueKind::Local(mine)).unwrap();
    mq.add_queue(QueueKind::Networked(lan)).unwrap();

    assert_eq!(mq.get_set_or_acquire().unwrap().path, "mine.gcode");
    mq.begin_run().unwrap();
    mq.end_run(RunResult::Success).unwrap();

    assert_eq!(mq.get_set_or_acquire().unwrap().path, "shared.gcode");
    assert_eq!(mq.active_queue().unwrap().name(), "lan");

    let snapshots = mq.as_dict();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[1].addr.as_deref(), Some("a"));
    assert_eq!(snapshots[1].jobs[0].acquired_by.as_deref(), Some("a"));
}

#[test]
fn test_gjob_moves_job_between_printers() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    std::fs::create_dir_all(src.path().join("parts")).unwrap();
    std::fs::write(src.path().join("parts/bracket.gcode"), "G28\nG1 X10\n").unwrap();

    let mut from = local(&src, "local");
    let id = from.import_job(&manifest("brackets", &["parts/bracket.gcode"])).unwrap();
    let archive = src.path().join("brackets.gjob");
    gjob::pack(&from.export_job(id).unwrap(), &FileLocator::new(src.path()), &archive).unwrap();

    assert_eq!(gjob::read_manifest(&archive).unwrap().name, "brackets");

    let mut to = local(&dst, "local");
    let manifest = gjob::unpack(&archive, &FileLocator::new(dst.path())).unwrap();
    to.import_job(&manifest).unwrap();

    assert_eq!(
        std::fs::read_to_string(dst.path().join("parts/bracket.gcode")).unwrap(),
        "G28\nG1 X10\n"
    );
    assert!(to.acquire());
    assert_eq!(to.get_set().unwrap().path, "parts/bracket.gcode");
}

#[test]
fn test_lan_rejects_jobs_it_cannot_share() {
    let dir = TempDir::new().unwrap();
    let log = MemoryLog::new();
    let mut lan = lan(&dir, &log, "a");

    let err = lan.import_job(&manifest("ghost", &["missing.gcode"])).unwrap_err();
    assert!(matches!(
        err,
        BedloopError::Validation(ValidationError::MissingFile { ref path, .. }) if path == "missing.gcode"
    ));
    assert!(err.to_string().contains("missing.gcode"));
}

#[test]
fn test_local_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.gcode"), "G28\n").unwrap();
    std::fs::write(dir.path().join("b.gcode"), "G28\n").unwrap();
    let (a, b) = {
        let mut q = local(&dir, "local");
        let a = q.import_job(&manifest("a", &["a.gcode"])).unwrap();
        let b = q.import_job(&manifest("b", &["b.gcode"])).unwrap();
        q.mv_job(b, None).unwrap();
        assert!(q.acquire());
        (a, b)
    };

    let mut q = local(&dir, "local");
    let order: Vec<_> = q.jobs().iter().map(|j| j.id).collect();
    assert_eq!(order, vec![b, a]);
    assert!(q.acquire());
    assert_eq!(q.get_job().unwrap().id, b);
}

#[test]
fn test_holder_keeps_peer_edits() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("j.gcode"), "G28\n").unwrap();
    let log = MemoryLog::new();
    let mut a = lan(&dir, &log, "a");
    let mut b = lan(&dir, &log, "b");

    let id = a.import_job(&manifest("j", &["j.gcode"])).unwrap();
    assert!(a.acquire());

    let mut edit = b.export_job(id).unwrap();
    edit.name = "renamed".into();
    edit.count = 10;
    edit.remaining = 10;
    b.edit_job(id, &edit).unwrap();

    // Finishing the only set starts the next of ten repetitions
    assert!(a.decrement());
    let seen = b.export_job(id).unwrap();
    assert_eq!(seen.name, "renamed");
    assert_eq!(seen.count, 10);
    assert_eq!(seen.remaining, 9);
    assert_eq!(a.get_job().unwrap().name, "renamed");
}

#[test]
fn test_open_run_resumed_after_restart() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.gcode"), "G28\n").unwrap();
    local(&dir, "local")
        .import_job(&manifest("a", &["a.gcode"]))
        .unwrap();

    let open = || {
        let runs = RunLog::open(dir.path().join("runs.json")).unwrap();
        let mut mq = MultiQueue::new(Strategy::InOrder, runs).unwrap();
        mq.add_queue(QueueKind::Local(local(&dir, "local"))).unwrap();
        mq
    };

    let run_id = {
        let mut mq = open();
        assert!(mq.acquire());
        mq.begin_run().unwrap();
        mq.get_run().unwrap().id
    };

    let mut mq = open();
    assert!(mq.acquire());
    mq.begin_run().unwrap();
    assert_eq!(mq.get_run().unwrap().id, run_id);
    assert_eq!(mq.history(10).len(), 1);

    let run = mq.end_run(RunResult::Success).unwrap();
    assert_eq!(run.id, run_id);
    assert_eq!(mq.history(10).len(), 1);
}
