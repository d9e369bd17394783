use std::io::Write;
use std::sync::Arc;

use perfsentry::config::DetectorConfig;
use perfsentry::driver::{FrameStatus, RankDriver};
use perfsentry::event::{CallEvent, CommEvent, CommKind, Frame, FunctionTable, ThreadKey};
use perfsentry::outlier::Label;
use perfsentry::ps::{InProcess, ParameterServer};
use perfsentry::reader::{MemorySource, NdjsonSource};
use perfsentry::sink::{MemorySink, NdjsonSink};

fn functions() -> FunctionTable {
    FunctionTable::from_iter([
        (0, "main".to_string()),
        (1, "solve".to_string()),
        (2, "MPI_Send".to_string()),
    ])
}

fn detector() -> DetectorConfig {
    DetectorConfig {
        sigma: 3.0,
        ..Default::default()
    }
}

/// One frame of rank `rid`: `main` around `solve` calls, each sending a message.
fn rank_frame(rid: u64, step: u64, runtimes: &[u64]) -> Frame {
    let key = ThreadKey::new(0, rid, 0);
    let mut frame = Frame::new(step);
    let mut ts = step * 1_000_000;

    frame.call_events.push(CallEvent::entry(key, 0, ts));
    for (i, r) in runtimes.iter().enumerate() {
        ts += 1;
        frame.call_events.push(CallEvent::entry(key, 1, ts));
        frame.comm_events.push(CommEvent {
            pid: 0,
            rid,
            tid: 0,
            kind: CommKind::Send,
            tag: i as u64,
            partner: (rid + 1) % 4,
            bytes: 1_024,
            ts: ts + 1,
        });
        ts += r;
        frame.call_events.push(CallEvent::exit(key, 1, ts));
    }
    frame.call_events.push(CallEvent::exit(key, 0, ts + 1));
    frame
}

#[tokio::test]
async fn ndjson_trace_end_to_end() {
    let frames = [
        rank_frame(0, 0, &[100; 20]),
        Frame::new(1),
        rank_frame(0, 2, &[100, 101, 99, 100, 5_000, 100, 98, 102, 100, 100]),
    ];

    let path = std::env::temp_dir().join(format!("perfsentry-trace-{}.ndjson", std::process::id()));
    {
        let mut file = std::fs::File::create(&path).expect("create trace");
        writeln!(file, r#"{{"functions":{{"0":"main","1":"solve","2":"MPI_Send"}}}}"#)
            .expect("write header");
        for frame in &frames {
            writeln!(file, "{}", serde_json::to_string(frame).expect("serialize frame"))
                .expect("write frame");
        }
    }

    let mut source = NdjsonSource::open(&path).expect("open trace");
    let mut sink = NdjsonSink::new("buffer", Vec::new());
    let ps = Arc::new(ParameterServer::new());
    let mut driver = RankDriver::new(
        0,
        FunctionTable::new(),
        DetectorConfig {
            local_scope: perfsentry::config::LocalScope::Rank,
            ..detector()
        },
        Some(InProcess::new(ps.clone())),
    );

    let report = driver.run(&mut source, &mut sink).await.expect("run");
    let _ = std::fs::remove_file(&path);

    assert_eq!(report.frames, 3);
    assert_eq!(report.open_calls, 0);
    assert_eq!(report.anomalies, 1);
    assert_eq!(ps.get(1).count(), (30, 1));

    let out = String::from_utf8(sink.into_inner()).expect("utf8");
    let lines: Vec<serde_json::Value> = out
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 2, "empty frame produces no output");

    let last = &lines[1];
    assert_eq!(last["step"], 2);
    assert_eq!(last["functions_of_interest"], serde_json::json!([1]));
    let flagged: Vec<&serde_json::Value> = last["records"]
        .as_array()
        .expect("records")
        .iter()
        .filter(|r| r["label"] == -1)
        .collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0]["runtime"], 5_000);
    assert_eq!(flagged[0]["func_name"], "solve");
    assert_eq!(flagged[0]["messages"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn concurrent_ranks_merge_into_one_view() {
    let ps = Arc::new(ParameterServer::new());
    let ranks = 4u64;
    let steps = 5u64;

    let mut tasks = Vec::new();
    for rid in 0..ranks {
        let agg = InProcess::new(ps.clone());
        tasks.push(tokio::spawn(async move {
            let frames: Vec<Frame> = (0..steps)
                .map(|step| rank_frame(rid, step, &[50 + rid, 60, 70]))
                .collect();
            let mut source = MemorySource::new(functions(), frames);
            let mut sink = MemorySink::new();
            let mut driver = RankDriver::new(rid, FunctionTable::new(), detector(), Some(agg));
            let report = driver.run(&mut source, &mut sink).await.expect("run");
            (report, sink.frames)
        }));
    }

    for task in tasks {
        let (report, frames) = task.await.expect("join");
        assert_eq!(report.frames, steps);
        assert_eq!(report.open_calls, 0);
        assert_eq!(frames.len() as u64, steps);
        assert!(frames.iter().all(|f| f.used_global_stats));
    }

    assert_eq!(ps.get(1).count().0, ranks * steps * 3);
    assert_eq!(ps.get(0).count().0, ranks * steps);

    // Sum of per-rank runtimes, independent of arrival order.
    let expected_s1: f64 = (0..ranks).map(|rid| (50 + rid + 60 + 70) as f64).sum::<f64>() * steps as f64;
    assert!((ps.get(1).s1() - expected_s1).abs() < 1e-9);
}

#[tokio::test]
async fn violation_in_one_rank_leaves_others_running() {
    let ps = Arc::new(ParameterServer::new());

    let mut broken = RankDriver::new(
        0,
        functions(),
        detector(),
        Some(InProcess::new(ps.clone())),
    );
    let mut healthy = RankDriver::new(
        1,
        functions(),
        detector(),
        Some(InProcess::new(ps.clone())),
    );

    let key = ThreadKey::new(0, 0, 0);
    let mut bad = Frame::new(0);
    bad.call_events = vec![
        CallEvent::entry(key, 0, 1),
        CallEvent::entry(key, 1, 2),
        CallEvent::exit(key, 1, 5),
        CallEvent::exit(key, 2, 6),
    ];

    let status = broken.process_frame(&bad).await;
    assert!(matches!(status, FrameStatus::Aborted { step: 0, event_index: 3, .. }));
    assert!(broken.is_halted());

    // The aborted frame pushed nothing.
    assert!(ps.get_all().is_empty());

    let status = healthy.process_frame(&rank_frame(1, 0, &[10, 11, 12])).await;
    let FrameStatus::Completed(out) = status else {
        panic!("expected completed frame, got {status:?}");
    };
    assert!(out.records.iter().all(|r| r.label == Label::Normal));
    assert_eq!(ps.get(1).count().0, 3);
}
