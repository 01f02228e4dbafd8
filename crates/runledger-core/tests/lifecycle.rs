//! End-to-end lifecycle tests across the log, store, facade, and recovery.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use runledger_core::applog::AppendLog;
use runledger_core::model::RunPatch;
use runledger_core::recovery;
use runledger_core::status::RunStatus;
use runledger_core::store::RunFilter;
use runledger_core::telemetry::Counters;
use runledger_core::{RunRecorder, RunStore, StartRun};

fn recorder(dir: &Path) -> RunRecorder {
    let log = AppendLog::open(
        dir.join("events.log"),
        dir.join("events.lock"),
        Duration::from_secs(5),
    )
    .unwrap();
    let store = RunStore::open(dir.join("runs.db")).unwrap();
    RunRecorder::from_parts(log, store, Arc::new(Counters::new()))
}

fn start(rec: &RunRecorder, run_id: &str, agent: &str, job: &str) -> String {
    let receipt = rec.start_run(
        run_id,
        StartRun {
            agent_name: agent.to_string(),
            job_type: job.to_string(),
            ..StartRun::default()
        },
    );
    assert!(receipt.accepted(), "start_run rejected: {:?}", receipt.rejection);
    receipt.event_id
}

#[test]
fn start_checkpoint_end_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());

    let event_id = start(&rec, "nightly-7", "scraper", "crawl");
    rec.checkpoint(
        "nightly-7",
        RunPatch {
            items_discovered: Some(250),
            items_succeeded: Some(100),
            ..RunPatch::default()
        },
    );
    rec.end_run(
        "nightly-7",
        RunPatch {
            status: Some(RunStatus::Partial),
            items_succeeded: Some(230),
            items_failed: Some(20),
            duration_secs: Some(181.5),
            ..RunPatch::default()
        },
    );

    // One run, three events, terminal state with final absolute counters.
    let store = RunStore::open(dir.path().join("runs.db")).unwrap();
    let run = store.get_run(&event_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.items_discovered, 250);
    assert_eq!(run.items_succeeded, 230);
    assert_eq!(run.items_failed, 20);
    assert!(run.end_time.is_some());
    assert_eq!(store.run_count().unwrap(), 1);
    assert_eq!(store.event_count().unwrap(), 3);
}

#[test]
fn rebuild_matches_live_store() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());

    for i in 0..5 {
        let run_id = format!("run-{i}");
        start(&rec, &run_id, "scraper", "crawl");
        rec.checkpoint(
            &run_id,
            RunPatch {
                items_succeeded: Some(i * 10),
                ..RunPatch::default()
            },
        );
        if i % 2 == 0 {
            rec.end_run(
                &run_id,
                RunPatch {
                    status: Some(RunStatus::Success),
                    ..RunPatch::default()
                },
            );
        }
    }

    let live = {
        let store = RunStore::open(dir.path().join("runs.db")).unwrap();
        store.query(&RunFilter::default()).unwrap()
    };

    // Replay the log into a second database; every projected fact matches.
    let log = AppendLog::open(
        dir.path().join("events.log"),
        dir.path().join("events.lock"),
        Duration::from_secs(5),
    )
    .unwrap();
    let rebuilt_path = dir.path().join("rebuilt.db");
    recovery::rebuild(&log, &rebuilt_path).unwrap();
    let rebuilt = RunStore::open(&rebuilt_path)
        .unwrap()
        .query(&RunFilter::default())
        .unwrap();

    assert_eq!(live.len(), rebuilt.len());
    for (a, b) in live.iter().zip(&rebuilt) {
        assert_eq!(a.event_id, b.event_id);
        assert_eq!(a.status, b.status);
        assert_eq!(a.items_succeeded, b.items_succeeded);
        assert_eq!(a.end_time.is_some(), b.end_time.is_some());
        assert_eq!(a.agent_name, b.agent_name);
    }
}

#[test]
fn repeated_rebuild_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());
    start(&rec, "r1", "scraper", "crawl");
    rec.end_run(
        "r1",
        RunPatch {
            status: Some(RunStatus::Success),
            ..RunPatch::default()
        },
    );

    let log = AppendLog::open(
        dir.path().join("events.log"),
        dir.path().join("events.lock"),
        Duration::from_secs(5),
    )
    .unwrap();
    let db = dir.path().join("runs.db");
    for _ in 0..3 {
        recovery::rebuild(&log, &db).unwrap();
        let store = RunStore::open(&db).unwrap();
        assert_eq!(store.run_count().unwrap(), 1);
        assert_eq!(store.event_count().unwrap(), 2);
    }
}

#[test]
fn concurrent_recorders_preserve_every_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    let threads = 4;
    let runs_each = 10;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let dir = path.clone();
            std::thread::spawn(move || {
                // Separate recorder per thread, as separate processes would.
                let rec = recorder(&dir);
                for i in 0..runs_each {
                    let run_id = format!("t{t}-r{i}");
                    start(&rec, &run_id, "scraper", "crawl");
                    rec.end_run(
                        &run_id,
                        RunPatch {
                            status: Some(RunStatus::Success),
                            ..RunPatch::default()
                        },
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // The log holds every record; a rebuild agrees with it exactly.
    let log = AppendLog::open(
        path.join("events.log"),
        path.join("events.lock"),
        Duration::from_secs(5),
    )
    .unwrap();
    assert_eq!(log.record_count().unwrap(), (threads * runs_each * 2) as u64);

    let rebuilt = path.join("rebuilt.db");
    let stats = recovery::rebuild(&log, &rebuilt).unwrap();
    assert_eq!(stats.runs, (threads * runs_each) as i64);

    let store = RunStore::open(&rebuilt).unwrap();
    let done = store
        .query(&RunFilter {
            statuses: vec![RunStatus::Success],
            ..RunFilter::default()
        })
        .unwrap();
    assert_eq!(done.len(), threads * runs_each);
}

#[test]
fn torn_tail_then_rebuild_recovers_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());
    start(&rec, "r1", "scraper", "crawl");

    // A writer died mid-record.
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(dir.path().join("events.log"))
        .unwrap();
    file.write_all(b"{\"record_uid\":\"torn").unwrap();
    drop(file);

    let log = AppendLog::open(
        dir.path().join("events.log"),
        dir.path().join("events.lock"),
        Duration::from_secs(5),
    )
    .unwrap();
    let stats = recovery::rebuild(&log, &dir.path().join("runs.db")).unwrap();
    assert_eq!(stats.records_applied, 1);
    assert_eq!(stats.runs, 1);
}
