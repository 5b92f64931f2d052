//! # End-to-End Scenarios
//!
//! Each test stands up a `HostContext` with an SQLite executor and one or
//! more `SatelliteContext`s connected in-process, then drives the link from
//! the satellite side the way a UI process would.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether_bus::EventStream;
use tether_rpc::{CallOptions, ConnectionState};
use tether_types::{
    LinkError, QueryMode, TaskProgress, TaskProgressPayload, TaskStart, TaskStartPayload,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use crate::fixtures::{host_with_satellites, SqliteExecutor};

const SCHEMA: &str = "
    CREATE TABLE tasks (id INTEGER PRIMARY KEY, title TEXT NOT NULL, done INTEGER NOT NULL DEFAULT 0);
    INSERT INTO tasks (title) VALUES ('write docs'), ('ship release');
";

async fn recv(stream: &mut EventStream) -> Option<Value> {
    timeout(Duration::from_secs(1), stream.recv()).await.unwrap()
}

// =============================================================================
// QUERY PROXY
// =============================================================================

#[tokio::test]
async fn test_select_one_through_proxy() {
    let (_host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 1).unwrap();

    let result = satellites[0]
        .execute_query("SELECT 1", vec![], QueryMode::All)
        .await
        .unwrap();
    assert_eq!(json!(result.rows), json!([[1]]));
}

#[tokio::test]
async fn test_query_modes_against_real_database() {
    let (_host, satellites) = host_with_satellites(SqliteExecutor::with_schema(SCHEMA).unwrap(), 1).unwrap();
    let sat = &satellites[0];

    let run = sat
        .execute_query("UPDATE tasks SET done = 1 WHERE id = ?", vec![json!(2)], QueryMode::Run)
        .await
        .unwrap();
    assert_eq!(run.rows[0]["changes"], json!(1));

    let done = sat
        .execute_query("SELECT title FROM tasks WHERE done = ?", vec![json!(true)], QueryMode::Values)
        .await
        .unwrap();
    assert_eq!(json!(done.rows), json!([["ship release"]]));

    let first = sat
        .execute_query("SELECT id, title FROM tasks ORDER BY id", vec![], QueryMode::Get)
        .await
        .unwrap();
    assert_eq!(json!(first.rows), json!([[1, "write docs"]]));
}

#[tokio::test]
async fn test_database_error_surfaces_as_remote_handler_error() {
    let (_host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 1).unwrap();

    let err = satellites[0]
        .execute_query("SELECT * FROM nowhere", vec![], QueryMode::All)
        .await
        .unwrap_err();
    match err {
        LinkError::RemoteHandler { method, message, .. } => {
            assert_eq!(method, "ExecuteQuery");
            assert!(message.contains("no such table"), "{message}");
        }
        other => panic!("expected remote handler error, got {other:?}"),
    }
}

// =============================================================================
// CONNECTION BOOTSTRAP
// =============================================================================

#[tokio::test]
async fn test_same_tick_callers_share_one_handshake() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 1).unwrap();
    let sat = satellites[0].clone();
    let other = sat.clone();

    let (a, b) = tokio::join!(sat.ensure_connection(), other.ensure_connection());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(sat.connections().handshake_count(), 1);
    assert_eq!(host.peer_count(), 1);
}

#[tokio::test]
async fn test_reconnect_after_host_drops_peer() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 1).unwrap();
    let sat = &satellites[0];

    let first = sat.ensure_connection().await.unwrap();
    let mut states = sat.connections().watch_state();
    for peer in host.peer_ids() {
        host.detach(peer);
    }
    states
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();

    let result = sat.execute_query("SELECT 2", vec![], QueryMode::All).await.unwrap();
    assert_eq!(json!(result.rows), json!([[2]]));
    let second = sat.ensure_connection().await.unwrap();
    assert_eq!(second.generation(), first.generation() + 1);
}

// =============================================================================
// PUB/SUB
// =============================================================================

#[tokio::test]
async fn test_late_subscriber_misses_earlier_publish() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 1).unwrap();
    let sat = &satellites[0];
    sat.ensure_connection().await.unwrap();

    let mut a = sat.bus().stream("invalidate-query");
    host.bus().publish("invalidate-query", json!("tasks"));
    sleep(Duration::from_millis(10)).await;
    let mut b = sat.bus().stream("invalidate-query");
    host.bus().publish("invalidate-query", json!("projects"));

    assert_eq!(recv(&mut a).await, Some(json!("tasks")));
    assert_eq!(recv(&mut a).await, Some(json!("projects")));
    // B's first event is the one published after it subscribed.
    assert_eq!(recv(&mut b).await, Some(json!("projects")));
}

#[tokio::test]
async fn test_broadcast_reaches_every_satellite() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 3).unwrap();
    let mut streams = Vec::new();
    for sat in &satellites {
        sat.ensure_connection().await.unwrap();
        streams.push(sat.bus().stream("invalidate-query"));
    }

    let delivery = host.bus().publish("invalidate-query", json!("tasks"));
    assert_eq!(delivery.peers, 3);
    for stream in &mut streams {
        let got = timeout(Duration::from_secs(1), stream.recv()).await.unwrap();
        assert_eq!(got, Some(json!("tasks")));
    }
}

/// The orchestrator pattern: satellites publish `task-start`, the host
/// listens and reports `task-progress` back to every satellite.
#[tokio::test]
async fn test_task_start_and_progress_flow() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 2).unwrap();
    for sat in &satellites {
        sat.ensure_connection().await.unwrap();
    }

    let bus = host.bus().clone();
    let _orchestrator = host.bus().subscribe_to::<TaskStart, _>(move |start: TaskStartPayload| {
        let progress = TaskProgressPayload {
            task_id: start.task_id,
            message: json!({"status": "running"}),
        };
        let _ = bus.publish_to::<TaskProgress>(&progress);
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = satellites[1]
        .bus()
        .subscribe_to::<TaskProgress, _>(move |p: TaskProgressPayload| {
            let _ = tx.send(p);
        });

    satellites[0]
        .bus()
        .publish_to::<TaskStart>(&TaskStartPayload { task_id: "t-1".into() })
        .unwrap();

    let progress = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(progress.task_id, "t-1");
    assert_eq!(progress.message["status"], json!("running"));
}

// =============================================================================
// DEADLINES
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out_at_deadline() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 1).unwrap();
    host.registry()
        .register_fn("SlowReport", |_params: Value| async {
            sleep(Duration::from_millis(6000)).await;
            Ok(json!("late"))
        })
        .unwrap();
    let sat = &satellites[0];
    let conn = sat.ensure_connection().await.unwrap();

    let started = Instant::now();
    let err = sat
        .connections()
        .call("SlowReport", json!({}), CallOptions::timeout(Duration::from_millis(5000)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(
        err,
        LinkError::Timeout {
            method: "SlowReport".into(),
            timeout_ms: 5000
        }
    );
    assert!(elapsed >= Duration::from_millis(5000) && elapsed < Duration::from_millis(6000));
    assert_eq!(conn.client().pending_count(), 0);
    let stale_before = conn.client().stale_count();

    // The reply at 6000 ms finds no waiting call and is dropped.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(conn.client().pending_count(), 0);
    assert_eq!(conn.client().stale_count(), stale_before + 1);
    let err = sat.call("RefRead", json!({"key": "missing"})).await.unwrap_err();
    assert!(matches!(err, LinkError::RemoteHandler { .. }));
}

// =============================================================================
// SYNCHRONIZED REFERENCES
// =============================================================================

#[tokio::test]
async fn test_ref_write_mirrors_into_every_satellite() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 2).unwrap();
    host.refs().declare("theme", json!("light")).unwrap();
    for sat in &satellites {
        sat.ensure_connection().await.unwrap();
    }

    let version = satellites[0].refs().write("theme", json!("dark")).await.unwrap();
    assert_eq!(version, 2);
    assert_eq!(host.refs().read("theme").unwrap().version, 2);

    for sat in &satellites {
        let mut watch = sat.refs().watch("theme");
        let snapshot = timeout(
            Duration::from_secs(1),
            watch.wait_for(|s| s.as_ref().is_some_and(|s| s.version == 2)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
        assert_eq!(snapshot.value, json!("dark"));
    }
}

#[tokio::test]
async fn test_concurrent_satellite_writes_serialize_at_host() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 3).unwrap();
    host.refs().declare("counter", json!(0)).unwrap();

    let writes: Vec<_> = satellites
        .iter()
        .flat_map(|sat| (0..5).map(move |i| (sat.clone(), i)))
        .map(|(sat, i)| tokio::spawn(async move { sat.refs().write("counter", json!(i)).await }))
        .collect();

    let mut versions = Vec::new();
    for write in writes {
        versions.push(write.await.unwrap().unwrap());
    }
    versions.sort();
    assert_eq!(versions, (2..=16).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_back_to_back_writes_last_one_wins() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 2).unwrap();
    let (writer, reader) = (&satellites[0], &satellites[1]);
    writer.ensure_connection().await.unwrap();
    reader.ensure_connection().await.unwrap();

    for round in 0..50u64 {
        let key = format!("layout-{round}");
        host.refs().declare(key.as_str(), json!("initial")).unwrap();
        let (first, second) = tokio::join!(
            writer.refs().write(&key, json!("first")),
            writer.refs().write(&key, json!("second")),
        );
        assert_eq!((first.unwrap(), second.unwrap()), (2, 3), "round {round}");
        assert_eq!(host.refs().read(&key).unwrap().value, json!("second"));

        let mut watch = reader.refs().watch(&key);
        let mirrored = timeout(
            Duration::from_secs(1),
            watch.wait_for(|s| s.as_ref().is_some_and(|s| s.version == 3)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
        assert_eq!(mirrored.value, json!("second"));
    }
}

#[tokio::test]
async fn test_every_satellite_converges_after_reconnect() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 2).unwrap();
    host.refs().declare("theme", json!("light")).unwrap();
    for sat in &satellites {
        sat.refs().refresh("theme").await.unwrap();
    }

    let mut states: Vec<_> = satellites
        .iter()
        .map(|sat| sat.connections().watch_state())
        .collect();
    for peer in host.peer_ids() {
        host.detach(peer);
    }
    for state in &mut states {
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
    }

    host.refs().write("theme", json!("dark")).unwrap();
    host.refs().write("theme", json!("blue")).unwrap();
    for sat in &satellites {
        assert_eq!(sat.refs().read("theme").unwrap().version, 1);
        sat.ensure_connection().await.unwrap();
    }

    for sat in &satellites {
        let mut watch = sat.refs().watch("theme");
        let snapshot = timeout(
            Duration::from_secs(1),
            watch.wait_for(|s| s.as_ref().is_some_and(|s| s.version == 3)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
        assert_eq!(snapshot.value, json!("blue"));
    }
}

#[tokio::test]
async fn test_shutdown_disposes_subscriptions() {
    let (host, satellites) = host_with_satellites(SqliteExecutor::in_memory().unwrap(), 1).unwrap();
    let sat = &satellites[0];
    sat.ensure_connection().await.unwrap();
    let mut stream = sat.bus().stream("invalidate-query");

    sat.shutdown();
    assert_eq!(timeout(Duration::from_secs(1), stream.recv()).await.unwrap(), None);
    host.shutdown();
    assert_eq!(host.peer_count(), 0);
}
