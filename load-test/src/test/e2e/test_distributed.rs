use std::time::Duration;

use rama::http::{BodyExtractExt as _, service::client::HttpClientExt as _};

use crate::test::{
    e2e::runtime::{accepted_txs, client, csv_value, read_csv, spawn_app, spawn_app_in, spawn_mock_node},
    tmp_dir,
};

fn metric(metrics: &str, series: &str) -> f64 {
    metrics
        .lines()
        .find_map(|line| line.strip_prefix(series)?.trim().parse().ok())
        .unwrap_or_else(|| panic!("series {series} missing in: {metrics}"))
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_coordinator_with_two_workers() {
    let (_node, node) = spawn_mock_node(&[]).await;

    let coordinator = spawn_app(
        "coordinator_e2e",
        &[
            "coordinator",
            "--bind",
            "127.0.0.1:0",
            "--endpoints",
            &node,
            "-T",
            "2",
            "-r",
            "20",
            "--expect-workers",
            "2",
            "--shutdown-wait",
            "5",
            "--load-test-id",
            "e2e",
        ],
    );
    let coordinator_addr = coordinator.server_addr("coordinator").await.to_string();

    let mut workers = Vec::new();
    for name in ["w1", "w2"] {
        let dir = tmp_dir::try_new("worker_e2e").unwrap();
        let stats_path = dir.join("stats.csv");
        let stats_path_str = stats_path.display().to_string();
        let app = spawn_app_in(
            dir,
            &[
                "worker",
                "--coordinator",
                &coordinator_addr,
                "--name",
                name,
                "--report-interval",
                "0.2",
                "--stats-output",
                &stats_path_str,
            ],
        );
        workers.push((app, stats_path));
    }

    let mut local_total = 0.;
    for (app, stats_path) in workers {
        app.join().await.unwrap();
        let csv = read_csv(&stats_path);
        let total = csv_value(&csv, "total_txs");
        assert!((30. ..=45.).contains(&total), "{csv}");
        local_total += total;
    }

    // the coordinator notices the final reports on its next liveness tick
    let shutting_down = r#"loadtest_coordinator_state{load_test_id="e2e",state="shutting_down"}"#;
    let mut metrics = String::new();
    for _ in 0..20 {
        metrics = client()
            .get(format!("http://{coordinator_addr}/metrics"))
            .send()
            .await
            .unwrap()
            .try_into_string()
            .await
            .unwrap();
        if metric(&metrics, shutting_down) == 1. {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(metric(&metrics, shutting_down), 1., "{metrics}");
    assert_eq!(
        metric(&metrics, r#"loadtest_workers{load_test_id="e2e",state="completed"}"#),
        2.
    );
    assert_eq!(
        metric(&metrics, r#"loadtest_tx_attempted_total{load_test_id="e2e"}"#),
        local_total
    );
    assert_eq!(
        metric(&metrics, r#"loadtest_tx_succeeded_total{load_test_id="e2e"}"#),
        accepted_txs(&node).await as f64
    );

    coordinator.join().await.unwrap();
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_coordinator_startup_deadline_is_fatal() {
    let coordinator = spawn_app(
        "coordinator_deadline_e2e",
        &[
            "coordinator",
            "--bind",
            "127.0.0.1:0",
            "--endpoints",
            "http://127.0.0.1:26657",
            "--expect-workers",
            "2",
            "--worker-connect-timeout",
            "1",
        ],
    );

    let err = coordinator.join().await.unwrap_err();
    assert!(err.to_string().contains("0 of 2"), "{err}");
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_worker_without_coordinator_is_fatal() {
    let worker = spawn_app(
        "worker_unreachable_e2e",
        &[
            "worker",
            "--coordinator",
            "127.0.0.1:9",
            "--coordinator-connect-timeout",
            "1",
        ],
    );

    let err = worker.join().await.unwrap_err();
    assert!(err.to_string().contains("coordinator"), "{err}");
}
