//! Orchestrator tests against the in-memory runtime

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use dockyard::deploy::orchestrator::{Orchestrator, OrchestratorOptions};
use dockyard::filesys::dir::Dir;
use dockyard::models::app_type::AppType;
use dockyard::models::deployment::{DeployRequest, LogSeverity, LogSink, RuntimeLogLine};

use crate::fake_runtime::FakeRuntime;

struct Harness {
    runtime: Arc<FakeRuntime>,
    orchestrator: Arc<Orchestrator>,
    logs_rx: mpsc::UnboundedReceiver<RuntimeLogLine>,
    messages: Arc<Mutex<Vec<(String, LogSeverity)>>>,
    sink: LogSink,
}

impl Harness {
    fn new() -> Self {
        Self::with_options(OrchestratorOptions::default())
    }

    fn with_options(options: OrchestratorOptions) -> Self {
        let runtime = FakeRuntime::new();
        let (logs_tx, logs_rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(runtime.clone(), options, logs_tx).unwrap();

        let messages = Arc::new(Mutex::new(Vec::new()));
        let collected = messages.clone();
        let sink: LogSink = Arc::new(move |message: &str, severity: LogSeverity| {
            collected.lock().unwrap().push((message.to_string(), severity));
        });

        Self {
            runtime,
            orchestrator: Arc::new(orchestrator),
            logs_rx,
            messages,
            sink,
        }
    }

    fn saw(&self, needle: &str, severity: LogSeverity) -> bool {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|(message, seen)| *seen == severity && message.contains(needle))
    }
}

/// Port with an HTTP responder answering 200 on `/`
async fn healthy_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new().route("/", get(|| async { "ok" }));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn source_tree(files: &[(&str, &str)]) -> Dir {
    let dir = Dir::create_temp_dir("dockyard-test").await.unwrap();
    for (name, contents) in files {
        dir.file(name).write_string(contents).await.unwrap();
    }
    dir
}

fn request(project_id: &str, build_id: &str, dir: &Dir, app_type: AppType, port: u16) -> DeployRequest {
    DeployRequest {
        project_id: project_id.to_string(),
        build_id: build_id.to_string(),
        source_dir: dir.path().to_path_buf(),
        app_type,
        host_port: port,
        env: BTreeMap::new(),
    }
}

fn short_health_options() -> OrchestratorOptions {
    let mut options = OrchestratorOptions::default();
    options.health_check.timeout = Duration::from_millis(1000);
    options.health_check.interval = Duration::from_millis(100);
    options
}

async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

const EXPRESS_PACKAGE: &str = r#"{"name": "api", "scripts": {"build": "tsc"}}"#;

#[tokio::test]
async fn test_deploy_express_typescript() {
    let mut harness = Harness::new();
    let dir = source_tree(&[
        ("package.json", EXPRESS_PACKAGE),
        ("src/index.ts", "import express from 'express';\n"),
    ])
    .await;
    let port = healthy_port().await;

    let outcome = harness
        .orchestrator
        .deploy(&request("proj-express-0001", "build-0001-aaaa", &dir, AppType::Express, port), &harness.sink)
        .await;

    assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    assert!(outcome.container_id.is_some());

    let recipes = harness.runtime.recipes();
    assert_eq!(recipes.len(), 1);
    assert!(recipes[0].contains("EXPOSE 3000"));
    assert!(recipes[0].contains("ENV PORT=3000"));
    assert!(recipes[0].contains("src/index.ts"));

    // Synthesized files do not outlive the build
    assert!(!dir.file("Dockerfile").exists().await);
    assert!(!dir.file(".dockerignore").exists().await);

    assert!(harness.orchestrator.is_running("proj-express-0001").await);
    let container = harness.runtime.container("dockyard-proj-exp").unwrap();
    assert_eq!(container.image, "dockyard/proj-exp:build-00");
    assert!(container.env.contains(&"PORT=3000".to_string()));
    assert_eq!(
        container.labels.get("dockyard.project").map(String::as_str),
        Some("proj-express-0001")
    );

    assert!(harness.orchestrator.has_log_stream("proj-express-0001"));
    let line = tokio::time::timeout(Duration::from_secs(2), harness.logs_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line.project_id, "proj-express-0001");
    assert_eq!(line.line, "attached to dockyard-proj-exp");

    assert!(harness.saw("READY", LogSeverity::Success));
    assert!(harness.saw("Step 1/4", LogSeverity::Info));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_deploy_vite_serves_on_port_80() {
    let harness = Harness::new();
    let dir = source_tree(&[
        ("package.json", r#"{"name": "web", "scripts": {"build": "vite build"}}"#),
        ("index.html", "<div id=\"app\"></div>\n"),
    ])
    .await;
    let port = healthy_port().await;

    let outcome = harness
        .orchestrator
        .deploy(&request("proj-vite-00002", "build-0002", &dir, AppType::Vite, port), &harness.sink)
        .await;
    assert!(outcome.success, "deploy failed: {:?}", outcome.error);

    let recipes = harness.runtime.recipes();
    let recipe = &recipes[0];
    assert!(recipe.contains("EXPOSE 80"));
    assert!(recipe.contains("ENV PORT=80"));
    assert!(recipe.contains("nginx"));
    assert!(recipe.contains("/app/dist"));

    let container = harness.runtime.container("dockyard-proj-vit").unwrap();
    assert!(container.env.contains(&"PORT=80".to_string()));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_user_recipe_is_sanitized_in_place() {
    let harness = Harness::new();
    let dir = source_tree(&[
        ("Dockerfile", "FROM node:20\nWORKDIR /app\nCOPY . .\nEXPOSE 8080\nCMD [\"node\", \"index.js\"]\n"),
        ("index.js", "require('http').createServer().listen(process.env.PORT);\n"),
    ])
    .await;
    let port = healthy_port().await;

    let outcome = harness
        .orchestrator
        .deploy(&request("proj-node-00003", "build-0003", &dir, AppType::Node, port), &harness.sink)
        .await;
    assert!(outcome.success, "deploy failed: {:?}", outcome.error);

    // The user's recipe stays, rewritten for the internal port
    let on_disk = dir.file("Dockerfile").read_string().await.unwrap();
    assert!(on_disk.contains("EXPOSE 3000"));
    assert!(!on_disk.contains("8080"));
    assert!(on_disk.contains("ENV PORT=3000"));
    assert_eq!(harness.runtime.recipes()[0], on_disk);
    assert!(harness.saw("Sanitized Dockerfile", LogSeverity::Warn));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_build_failure_starts_nothing() {
    let harness = Harness::new();
    harness.runtime.fail_build();
    let dir = source_tree(&[("package.json", EXPRESS_PACKAGE), ("index.js", "")]).await;

    let outcome = harness
        .orchestrator
        .deploy(&request("proj-broken-0004", "build-0004", &dir, AppType::Node, 1), &harness.sink)
        .await;

    assert!(!outcome.success);
    assert!(outcome.container_id.is_none());
    assert!(outcome.error.unwrap().contains("npm ERR!"));
    assert!(!harness.runtime.commands().contains(&"run".to_string()));
    assert!(harness.runtime.container("dockyard-proj-bro").is_none());
    assert!(!dir.file("Dockerfile").exists().await);
    assert!(harness.saw("ROLLED_BACK", LogSeverity::Error));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_missing_source_fails_before_runtime_build() {
    let harness = Harness::new();
    let dir = Dir::new(std::env::temp_dir().join("dockyard-test-does-not-exist"));

    let outcome = harness
        .orchestrator
        .deploy(&request("proj-missing-05", "build-0005", &dir, AppType::Static, 1), &harness.sink)
        .await;

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("does not exist"));
    assert!(!harness.runtime.commands().contains(&"build".to_string()));
}

#[tokio::test]
async fn test_run_failure_rolls_back() {
    let harness = Harness::new();
    harness.runtime.fail_run();
    let dir = source_tree(&[("index.html", "<h1>hi</h1>\n")]).await;

    let outcome = harness
        .orchestrator
        .deploy(&request("proj-static-0006", "build-0006", &dir, AppType::Static, 1), &harness.sink)
        .await;

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("port is already allocated"));
    assert!(harness.runtime.container("dockyard-proj-sta").is_none());
    assert!(!harness.orchestrator.has_log_stream("proj-static-0006"));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_health_timeout_tears_down_and_captures_logs() {
    let harness = Harness::with_options(short_health_options());
    harness.runtime.set_logs("listening on 8080\nError: EADDRINUSE\n");
    let dir = source_tree(&[("package.json", EXPRESS_PACKAGE), ("server.js", "")]).await;
    let port = closed_port().await;

    let outcome = harness
        .orchestrator
        .deploy(&request("proj-unhealthy-7", "build-0007", &dir, AppType::Express, port), &harness.sink)
        .await;

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains(&format!("port {}", port)));
    assert!(harness.runtime.container("dockyard-proj-unh").is_none());
    assert!(!harness.orchestrator.is_running("proj-unhealthy-7").await);
    assert!(!harness.orchestrator.has_log_stream("proj-unhealthy-7"));
    assert!(harness.saw("Error: EADDRINUSE", LogSeverity::Warn));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let harness = Harness::new();
    let dir = source_tree(&[("index.html", "<h1>hi</h1>\n")]).await;
    let port = healthy_port().await;

    let outcome = harness
        .orchestrator
        .deploy(&request("proj-stop-00008", "build-0008", &dir, AppType::Static, port), &harness.sink)
        .await;
    assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    assert_eq!(harness.runtime.active_follows(), 1);

    assert!(harness.orchestrator.stop("proj-stop-00008").await);
    assert!(harness.orchestrator.stop("proj-stop-00008").await);
    assert!(!harness.orchestrator.is_running("proj-stop-00008").await);
    assert!(!harness.orchestrator.has_log_stream("proj-stop-00008"));

    let runtime = harness.runtime.clone();
    assert!(eventually(move || runtime.active_follows() == 0).await);

    // Never deployed
    assert!(harness.orchestrator.stop("proj-never-deployed").await);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_operations_on_one_project_are_rejected() {
    let harness = Harness::with_options(short_health_options());
    let dir = source_tree(&[("index.html", "<h1>hi</h1>\n")]).await;
    let port = closed_port().await;

    // Held in the health check for the whole timeout
    let first = {
        let orchestrator = harness.orchestrator.clone();
        let sink = harness.sink.clone();
        let request = request("proj-busy-00009", "build-0009", &dir, AppType::Static, port);
        tokio::spawn(async move { orchestrator.deploy(&request, &sink).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = harness
        .orchestrator
        .deploy(&request("proj-busy-00009", "build-0010", &dir, AppType::Static, port), &harness.sink)
        .await;
    assert!(!second.success);
    let error = second.error.unwrap();
    assert!(error.starts_with("Project busy:"), "{}", error);
    assert!(error.contains("already in progress"));
    assert!(!harness.orchestrator.stop("proj-busy-00009").await);
    assert!(!harness.orchestrator.cleanup("proj-busy-00009", &[]).await);

    let first = first.await.unwrap();
    assert!(!first.success);

    // Released once the first deploy finished
    assert!(harness.orchestrator.stop("proj-busy-00009").await);

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_redeploy_replaces_log_stream() {
    let harness = Harness::new();
    let dir = source_tree(&[("index.html", "<h1>hi</h1>\n")]).await;
    let port = healthy_port().await;

    for build_id in ["build-11", "build-12"] {
        let outcome = harness
            .orchestrator
            .deploy(&request("proj-redeploy-11", build_id, &dir, AppType::Static, port), &harness.sink)
            .await;
        assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    }

    assert!(harness.orchestrator.has_log_stream("proj-redeploy-11"));
    let runtime = harness.runtime.clone();
    assert!(eventually(move || runtime.active_follows() == 1).await);
    assert_eq!(
        harness.runtime.container("dockyard-proj-red").unwrap().image,
        "dockyard/proj-red:build-12"
    );

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_retention_keeps_three_newest_images() {
    let harness = Harness::new();
    for (tag, created_at) in [
        ("old-0001", "2024-01-01 10:00:00 +0000 UTC"),
        ("old-0002", "2024-01-02 10:00:00 +0000 UTC"),
        ("old-0003", "2024-01-03 10:00:00 +0000 UTC"),
        ("old-0004", "2024-01-04 10:00:00 +0000 UTC"),
    ] {
        harness.runtime.add_image("dockyard/proj-ret", tag, created_at);
    }
    harness
        .runtime
        .add_image("dockyard/proj-oth", "other-01", "2020-01-01 00:00:00 +0000 UTC");

    let dir = source_tree(&[("index.html", "<h1>hi</h1>\n")]).await;
    let port = healthy_port().await;
    let outcome = harness
        .orchestrator
        .deploy(&request("proj-retention", "new-0005", &dir, AppType::Static, port), &harness.sink)
        .await;
    assert!(outcome.success, "deploy failed: {:?}", outcome.error);

    let mut refs = harness.runtime.image_refs();
    refs.sort();
    assert_eq!(
        refs,
        vec![
            "dockyard/proj-oth:other-01".to_string(),
            "dockyard/proj-ret:new-0005".to_string(),
            "dockyard/proj-ret:old-0003".to_string(),
            "dockyard/proj-ret:old-0004".to_string(),
        ]
    );

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_failed_prune_does_not_stop_others_or_fail_deploy() {
    let harness = Harness::new();
    for (tag, created_at) in [
        ("old-0001", "2024-01-01 10:00:00 +0000 UTC"),
        ("old-0002", "2024-01-02 10:00:00 +0000 UTC"),
        ("old-0003", "2024-01-03 10:00:00 +0000 UTC"),
        ("old-0004", "2024-01-04 10:00:00 +0000 UTC"),
    ] {
        harness.runtime.add_image("dockyard/proj-stu", tag, created_at);
    }
    harness.runtime.fail_rmi("dockyard/proj-stu:old-0001");

    let dir = source_tree(&[("index.html", "<h1>hi</h1>\n")]).await;
    let port = healthy_port().await;
    let outcome = harness
        .orchestrator
        .deploy(&request("proj-stuck-img", "new-0005", &dir, AppType::Static, port), &harness.sink)
        .await;
    assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    assert!(harness.saw("Pruned 1 old image(s)", LogSeverity::Info));

    let mut refs = harness.runtime.image_refs();
    refs.sort();
    assert_eq!(
        refs,
        vec![
            "dockyard/proj-stu:new-0005".to_string(),
            "dockyard/proj-stu:old-0001".to_string(),
            "dockyard/proj-stu:old-0003".to_string(),
            "dockyard/proj-stu:old-0004".to_string(),
        ]
    );

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_cleanup_removes_container_and_build_images() {
    let harness = Harness::new();
    let dir = source_tree(&[("index.html", "<h1>hi</h1>\n")]).await;
    let port = healthy_port().await;

    for build_id in ["build-a-0013", "build-b-0014"] {
        let outcome = harness
            .orchestrator
            .deploy(&request("proj-cleanup-13", build_id, &dir, AppType::Static, port), &harness.sink)
            .await;
        assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    }
    assert_eq!(harness.runtime.image_refs().len(), 2);

    let build_ids = vec!["build-a-0013".to_string(), "build-b-0014".to_string()];
    assert!(harness.orchestrator.cleanup("proj-cleanup-13", &build_ids).await);

    assert!(harness.runtime.image_refs().is_empty());
    assert!(harness.runtime.container("dockyard-proj-cle").is_none());
    assert!(!harness.orchestrator.has_log_stream("proj-cleanup-13"));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_cleanup_survives_a_failed_image_removal() {
    let harness = Harness::new();
    let dir = source_tree(&[("index.html", "<h1>hi</h1>\n")]).await;
    let port = healthy_port().await;

    for build_id in ["keep-a-0021", "drop-b-0022"] {
        let outcome = harness
            .orchestrator
            .deploy(&request("proj-partial-21", build_id, &dir, AppType::Static, port), &harness.sink)
            .await;
        assert!(outcome.success, "deploy failed: {:?}", outcome.error);
    }
    harness.runtime.fail_rmi("dockyard/proj-par:keep-a-0");

    let build_ids = vec!["keep-a-0021".to_string(), "drop-b-0022".to_string()];
    assert!(harness.orchestrator.cleanup("proj-partial-21", &build_ids).await);

    assert_eq!(harness.runtime.image_refs(), vec!["dockyard/proj-par:keep-a-0".to_string()]);
    assert!(harness.runtime.container("dockyard-proj-par").is_none());
    assert!(!harness.orchestrator.has_log_stream("proj-partial-21"));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_recovery_follows_the_discovered_container() {
    let mut harness = Harness::new();
    harness.runtime.add_container("legacy-web-7", "proj-custom-7", "build-c7");

    assert_eq!(harness.orchestrator.recover_log_streams().await, 1);
    assert!(harness.orchestrator.has_log_stream("proj-custom-7"));

    let line = tokio::time::timeout(Duration::from_secs(2), harness.logs_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line.project_id, "proj-custom-7");
    assert_eq!(line.line, "attached to legacy-web-7");

    assert_eq!(harness.orchestrator.shutdown(), 1);
}

#[tokio::test]
async fn test_recover_log_streams_and_shutdown() {
    let mut harness = Harness::new();
    harness.runtime.add_container("dockyard-proj-rec", "proj-recover-1", "build-r1");
    harness.runtime.add_container("dockyard-proj-two", "proj-two-00002", "build-r2");

    assert_eq!(harness.orchestrator.recover_log_streams().await, 2);
    assert!(harness.orchestrator.has_log_stream("proj-recover-1"));
    assert!(harness.orchestrator.has_log_stream("proj-two-00002"));

    // Container state untouched
    assert!(harness.orchestrator.is_running("proj-recover-1").await);
    assert!(!harness.runtime.commands().contains(&"stop".to_string()));

    let line = tokio::time::timeout(Duration::from_secs(2), harness.logs_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(line.line.starts_with("attached to dockyard-proj-"));

    assert_eq!(harness.orchestrator.shutdown(), 2);
    assert!(!harness.orchestrator.has_log_stream("proj-recover-1"));
    let runtime = harness.runtime.clone();
    assert!(eventually(move || runtime.active_follows() == 0).await);
}

#[tokio::test]
async fn test_logs_of_missing_container() {
    let harness = Harness::new();
    assert_eq!(harness.orchestrator.get_logs("proj-nothing", 50).await, "");
    assert!(!harness.orchestrator.is_running("proj-nothing").await);

    let on_line: dockyard::runtime::LineCallback = Arc::new(|_| {});
    tokio_test::assert_err!(harness.orchestrator.stream_logs("proj-nothing", on_line).await);
}

#[tokio::test]
async fn test_stream_logs_is_caller_owned() {
    let harness = Harness::new();
    harness.runtime.add_container("dockyard-proj-own", "proj-owned-15", "build-15");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_line: dockyard::runtime::LineCallback = Arc::new(move |line| {
        let _ = tx.send(line);
    });
    let mut handle = tokio_test::assert_ok!(
        harness.orchestrator.stream_logs("proj-owned-15", on_line).await
    );

    assert_eq!(rx.recv().await.unwrap(), "attached to dockyard-proj-own");
    assert!(!harness.orchestrator.has_log_stream("proj-owned-15"));

    handle.cancel();
    handle.closed().await;
    assert_eq!(harness.runtime.active_follows(), 0);
}

#[tokio::test]
async fn test_runtime_available() {
    let harness = Harness::new();
    assert!(harness.orchestrator.runtime_available().await);
}
