use crate::test::{
    e2e::runtime::{accepted_txs, csv_value, read_csv, spawn_app, spawn_app_in, spawn_mock_node},
    tmp_dir,
};

#[tokio::test]
#[tracing_test::traced_test]
async fn test_standalone_run_against_mock_node() {
    let (_node, node) = spawn_mock_node(&[]).await;

    let dir = tmp_dir::try_new("standalone_e2e").unwrap();
    let stats_path = dir.join("stats.csv");
    let stats_path_str = stats_path.display().to_string();

    let app = spawn_app_in(
        dir,
        &[
            "run",
            "--endpoints",
            &node,
            "-c",
            "2",
            "-T",
            "2",
            "-r",
            "50",
            "-s",
            "64",
            "--stats-output",
            &stats_path_str,
        ],
    );
    app.join().await.unwrap();

    let csv = read_csv(&stats_path);
    let total = csv_value(&csv, "total_txs");
    assert!((85. ..=105.).contains(&total), "{csv}");
    assert_eq!(csv_value(&csv, "failed_txs"), 0., "{csv}");
    assert_eq!(csv_value(&csv, "total_bytes"), total * 64., "{csv}");
    assert_eq!(accepted_txs(&node).await as f64, csv_value(&csv, "succeeded_txs"));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_standalone_is_default_command() {
    let (_node, node) = spawn_mock_node(&[]).await;

    let dir = tmp_dir::try_new("standalone_default_e2e").unwrap();
    let stats_path = dir.join("stats.csv");
    let stats_path_str = stats_path.display().to_string();

    let app = spawn_app_in(
        dir,
        &[
            "--endpoints",
            &node,
            "-T",
            "10",
            "-r",
            "20",
            "-N",
            "5",
            "--broadcast-tx-method",
            "commit",
            "--stats-output",
            &stats_path_str,
        ],
    );
    app.join().await.unwrap();

    let csv = read_csv(&stats_path);
    assert_eq!(csv_value(&csv, "total_txs"), 5., "{csv}");
    assert_eq!(csv_value(&csv, "succeeded_txs"), 5., "{csv}");
    assert!(csv_value(&csv, "total_time") < 5., "{csv}");
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_standalone_rejections_are_failures() {
    let (_node, node) = spawn_mock_node(&["--error-rate", "1"]).await;

    let dir = tmp_dir::try_new("standalone_rejections_e2e").unwrap();
    let stats_path = dir.join("stats.csv");
    let stats_path_str = stats_path.display().to_string();

    let app = spawn_app_in(
        dir,
        &[
            "run",
            "--endpoints",
            &node,
            "-T",
            "1",
            "-r",
            "10",
            "--stats-output",
            &stats_path_str,
        ],
    );
    app.join().await.unwrap();

    let csv = read_csv(&stats_path);
    let total = csv_value(&csv, "total_txs");
    assert!(total > 0., "{csv}");
    assert_eq!(csv_value(&csv, "failed_txs"), total, "{csv}");
    assert_eq!(accepted_txs(&node).await, 0);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_standalone_unreachable_endpoint_is_fatal() {
    let app = spawn_app(
        "standalone_unreachable_e2e",
        &["run", "--endpoints", "http://127.0.0.1:9", "-T", "1"],
    );
    let err = app.join().await.unwrap_err();
    assert!(err.to_string().contains("endpoint"), "{err}");
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_missing_load_test_is_an_error() {
    let app = spawn_app("no_args_e2e", &[]);
    assert!(app.join().await.is_err());
}
