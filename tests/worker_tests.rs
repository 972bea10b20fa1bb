//! Workers pulling from a live Manager, in process and as child processes.


use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use pln_cluster::client;
use pln_cluster::config::TransportSettings;
use pln_cluster::slavedriver::{ProcessSpawner, SlaveDriver};
use pln_cluster::worker::{run_worker, CommandProcessor, WorkerEndpoints};
use test_harness::{free_port, test_config, transport, wait_until, TestManager};

const WAIT: Duration = Duration::from_secs(10);

fn endpoints(manager: &TestManager) -> WorkerEndpoints {
    WorkerEndpoints {
        streamer: manager.streamer(),
        sink: manager.sink(),
    }
}

#[tokio::test]
async fn test_worker_processes_jobs() {
    let manager = TestManager::start(test_config(|_| {})).await;
    let token = CancellationToken::new();

    let worker = {
        let endpoints = endpoints(&manager);
        let token = token.clone();
        tokio::spawn(async move {
            run_worker(
                &endpoints,
                Arc::new(CommandProcessor::new("cat")),
                Some("w1".to_string()),
                transport(),
                token,
            )
            .await
        })
    };

    let jobs: Vec<_> = (0..5).map(|i| json!({"jobid": i, "text": "hello"})).collect();
    client::submit(&manager.intake(), &jobs, transport())
        .await
        .unwrap();

    let m = &manager;
    let finished = wait_until(WAIT, || async move {
        let status = m.status().await;
        status.jobs.done == 5 && status.active_jobs.is_empty()
    })
    .await;
    assert!(finished);

    token.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failing_command_reports_failure() {
    let manager = TestManager::start(test_config(|_| {})).await;
    let token = CancellationToken::new();

    let worker = {
        let endpoints = endpoints(&manager);
        let token = token.clone();
        tokio::spawn(async move {
            run_worker(
                &endpoints,
                Arc::new(CommandProcessor::new("echo broken >&2; exit 2")),
                None,
                transport(),
                token,
            )
            .await
        })
    };

    client::submit(&manager.intake(), &json!({"jobid": "bad"}), transport())
        .await
        .unwrap();

    let m = &manager;
    let failed = wait_until(WAIT, || async move {
        let status = m.status().await;
        status.jobs.failed == 1 && status.active_jobs.is_empty()
    })
    .await;
    assert!(failed);

    token.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_worker_stops_when_manager_shuts_down() {
    let manager = TestManager::start(test_config(|_| {})).await;
    let endpoints = endpoints(&manager);

    let worker = tokio::spawn(async move {
        run_worker(
            &endpoints,
            Arc::new(CommandProcessor::new("cat")),
            None,
            transport(),
            CancellationToken::new(),
        )
        .await
    });

    // Give the worker time to connect before the streamer goes away.
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.shutdown().await;

    tokio::time::timeout(WAIT, worker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_slavedriver_runs_worker_processes() {
    let streamer_port = free_port();
    let sink_port = free_port();
    let manager = TestManager::start(test_config(|doc| {
        doc.set("streamer", "port", streamer_port.to_string());
        doc.set("sink", "port", sink_port.to_string());
        doc.set("worker", "count", "2");
        doc.set("slavedriver", "heartbeat_interval_ms", "100");
    }))
    .await;

    let driver = SlaveDriver::fetch(&manager.control(), Some("n1".to_string()), transport())
        .await
        .unwrap();
    let worker_endpoints = driver.worker_endpoints().unwrap();
    assert_eq!(worker_endpoints.streamer, manager.streamer());
    assert_eq!(worker_endpoints.sink, manager.sink());

    let spawner = ProcessSpawner::new(
        env!("CARGO_BIN_EXE_pln-cluster"),
        worker_endpoints.streamer,
        worker_endpoints.sink,
        driver.settings().worker_command.clone(),
        driver.identity(),
    );
    let token = CancellationToken::new();
    let task = tokio::spawn(driver.run(Arc::new(spawner), token.clone()));

    let jobs: Vec<_> = (0..10).map(|i| json!({"jobid": i})).collect();
    client::submit(&manager.intake(), &jobs, transport())
        .await
        .unwrap();

    let m = &manager;
    let finished = wait_until(WAIT, || async move {
        let status = m.status().await;
        status.jobs.done == 10 && status.cluster.get("n1").map(|n| n.load) == Some(2)
    })
    .await;
    assert!(finished);

    token.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_worker_processes_use_node_frame_limit() {
    const FRAME_LIMIT: usize = 32 * 1024 * 1024;
    let streamer_port = free_port();
    let sink_port = free_port();
    let manager = TestManager::start(test_config(|doc| {
        doc.set("streamer", "port", streamer_port.to_string());
        doc.set("sink", "port", sink_port.to_string());
        doc.set("zeromq", "max_frame_bytes", FRAME_LIMIT.to_string());
        doc.set("worker", "count", "1");
        doc.set("worker", "command", "wc -c");
    }))
    .await;

    let driver = SlaveDriver::fetch(&manager.control(), Some("n1".to_string()), transport())
        .await
        .unwrap();
    assert_eq!(driver.settings().transport.max_frame_bytes, FRAME_LIMIT);

    let worker_endpoints = driver.worker_endpoints().unwrap();
    let spawner = ProcessSpawner::new(
        env!("CARGO_BIN_EXE_pln-cluster"),
        worker_endpoints.streamer,
        worker_endpoints.sink,
        driver.settings().worker_command.clone(),
        driver.identity(),
    )
    .with_transport(driver.settings().transport);
    let token = CancellationToken::new();
    let task = tokio::spawn(driver.run(Arc::new(spawner), token.clone()));

    // Larger than the default frame limit.
    let large = TransportSettings {
        max_frame_bytes: FRAME_LIMIT,
        ..transport()
    };
    let text = "x".repeat(9 * 1024 * 1024);
    let ack = client::submit(&manager.intake(), &json!({"jobid": 7, "text": text}), large)
        .await
        .unwrap();
    assert!(!ack.is_error());

    let m = &manager;
    let finished = wait_until(WAIT, || async move {
        let status = m.status().await;
        status.jobs.done == 1 && status.active_jobs.is_empty()
    })
    .await;
    assert!(finished);

    token.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}
