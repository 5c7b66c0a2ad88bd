//! End-to-end tests for the deploy webhook, driven through the router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use deploy_hook::api::build_router;
use deploy_hook::build::{BuildRegistry, BuildStatus};
use deploy_hook::config::Config;
use deploy_hook::debounce::{Debouncer, ManualClock};
use deploy_hook::dispatcher::{Dispatcher, DispatcherConfig};
use deploy_hook::test_utils::{SpyWorkspaceFactory, wait_for, write_script};
use deploy_hook::{AppState, SharedState};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use sha2::Sha256;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "test-secret";

struct TestApp {
    state: SharedState,
    factory: Arc<SpyWorkspaceFactory>,
    clock: Arc<ManualClock>,
    marker: std::path::PathBuf,
    _scratch: TempDir,
    _logs: TempDir,
}

fn test_app() -> TestApp {
    let scratch = TempDir::new().unwrap();
    let logs = TempDir::new().unwrap();
    let marker = scratch.path().join("args.txt");
    let script = write_script(
        scratch.path(),
        "rebuild.sh",
        &format!(
            "printf '%s|%s\\n' \"$#\" \"$1\" > '{}'\necho rebuilt\n",
            marker.display()
        ),
    );

    let logs_path = logs.path().to_path_buf();
    let script_path = script.clone();
    let workspace_root = scratch.path().join("workspaces");
    let config = Config::from_lookup(|key| match key {
        "GITHUB_WEBHOOK_SECRET" => Some(SECRET.to_string()),
        "REPOSITORY_PATH" => Some("/srv/src".to_string()),
        "WEB_INSTALL_PATH" => Some("/srv/www".to_string()),
        "LOGS_PATH" => Some(logs_path.display().to_string()),
        "REBUILD_SCRIPT" => Some(script_path.display().to_string()),
        "WORKSPACE_ROOT" => Some(workspace_root.display().to_string()),
        "KEEP_WORKSPACES" => Some("true".to_string()),
        _ => None,
    })
    .unwrap();

    let factory = Arc::new(SpyWorkspaceFactory::new(config.workspace_root.clone()));
    let clock = Arc::new(ManualClock::new());
    let dispatcher = Dispatcher::new(
        DispatcherConfig::from(&config),
        Debouncer::with_clock(config.debounce_window, clock.clone()),
        factory.clone(),
        Arc::new(BuildRegistry::default()),
    );

    TestApp {
        state: Arc::new(AppState::new(config, dispatcher)),
        factory,
        clock,
        marker,
        _scratch: scratch,
        _logs: logs,
    }
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn push_body(revision: &str) -> Vec<u8> {
    format!(
        r#"{{"repository":{{"ssh_url":"git@x:y.git"}},"after":"{}"}}"#,
        revision
    )
    .into_bytes()
}

fn webhook_request(event: &str, signature: Option<String>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/deploy/webhook")
        .header("content-type", "application/json")
        .header("X-GitHub-Event", event);
    if let Some(signature) = signature {
        builder = builder.header("X-Hub-Signature-256", signature);
    }
    builder.body(Body::from(body)).unwrap()
}

fn signed_push(revision: &str) -> Request<Body> {
    let body = push_body(revision);
    let signature = sign(SECRET, &body);
    webhook_request("push", Some(signature), body)
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, String) {
    let response = build_router(app.state.clone())
        .oneshot(request)
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn read_marker(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().filter(|s| s.ends_with('\n'))
}

#[cfg(unix)]
#[tokio::test]
async fn valid_push_clones_and_spawns_rebuild_with_workspace_path() {
    let app = test_app();

    let (status, body) = send(&app, signed_push("abc123")).await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert!(body.starts_with("Deployment handled"), "{}", body);
    assert_eq!(
        app.factory.clones(),
        vec![("git@x:y.git".to_string(), "abc123".to_string())]
    );

    let marker = app.marker.clone();
    assert!(wait_for(|| read_marker(&marker).is_some()).await);
    let workspace = &app.factory.created_paths()[0];
    assert_eq!(
        read_marker(&app.marker).unwrap(),
        format!("1|{}\n", workspace.display())
    );
    assert!(
        workspace
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("git_y_abc123_")
    );
}

#[tokio::test]
async fn tampered_signature_is_forbidden_and_never_clones() {
    let app = test_app();
    let body = push_body("abc123");
    let mut signature = sign(SECRET, &body);
    let last = signature.pop().unwrap();
    signature.push(if last == '0' { '1' } else { '0' });

    let (status, _) = send(&app, webhook_request("push", Some(signature), body)).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(app.factory.clones().is_empty());
}

#[tokio::test]
async fn missing_or_foreign_signature_is_forbidden() {
    let app = test_app();
    let body = push_body("abc123");

    let (status, _) = send(&app, webhook_request("push", None, body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let wrong = sign("other-secret", &body);
    let (status, _) = send(&app, webhook_request("push", Some(wrong), body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert!(app.factory.clones().is_empty());
}

#[tokio::test]
async fn other_events_are_ignored_without_cloning() {
    let app = test_app();

    for event in ["deployment", "ping", "pull_request", ""] {
        let body = push_body("abc123");
        let signature = sign(SECRET, &body);
        let (status, text) = send(&app, webhook_request(event, Some(signature), body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "Ignored");
    }
    assert!(app.factory.clones().is_empty());
}

#[tokio::test]
async fn unparseable_payload_is_a_server_error() {
    let app = test_app();
    let body = br#"{"repository":{"ssh_url":"git@x:y.git"}}"#.to_vec();
    let signature = sign(SECRET, &body);

    let (status, text) = send(&app, webhook_request("push", Some(signature), body)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(text.contains("after"), "{}", text);
    assert!(app.factory.clones().is_empty());
}

#[tokio::test]
async fn branch_deletion_is_ignored() {
    let app = test_app();
    let body = push_body("0000000000000000000000000000000000000000");
    let signature = sign(SECRET, &body);

    let (status, text) = send(&app, webhook_request("push", Some(signature), body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "Ignored");
    assert!(app.factory.clones().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn second_push_inside_window_is_too_early() {
    let app = test_app();

    let (status, _) = send(&app, signed_push("aaa111")).await;
    assert_eq!(status, StatusCode::OK);

    app.clock.advance(Duration::from_secs(30));
    let (status, text) = send(&app, signed_push("bbb222")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "Too early");
    assert_eq!(app.factory.clones().len(), 1);

    app.clock.advance(Duration::from_secs(30));
    let (status, text) = send(&app, signed_push("ccc333")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.starts_with("Deployment handled"), "{}", text);
    assert_eq!(app.factory.clones().len(), 2);
}

#[tokio::test]
async fn clone_failure_returns_generic_error() {
    let app = test_app();
    app.factory.fail_clones(true);

    let (status, text) = send(&app, signed_push("abc123")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(text, "Failed to prepare build workspace.");
    assert!(!text.contains("git@x"));
}

#[cfg(unix)]
#[tokio::test]
async fn finished_build_is_visible_in_status_endpoints() {
    let app = test_app();
    let (status, _) = send(&app, signed_push("abc123")).await;
    assert_eq!(status, StatusCode::OK);

    let builds = app.state.dispatcher.builds().clone();
    let run = builds.recent(1).pop().unwrap();
    let id = run.id.clone();
    assert!(wait_for(|| builds.get(&id).map(|b| b.status) == Some(BuildStatus::Success)).await);

    let request = Request::builder()
        .uri(format!("/deploy/builds/{}", run.build_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["revision"], "abc123");
    assert_eq!(json["exit_code"], 0);

    let request = Request::builder()
        .uri("/deploy/builds")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["count"], 1);

    let log = std::fs::read_to_string(&run.log_path).unwrap();
    assert!(log.contains("stdout: rebuilt"), "{}", log);
}

#[tokio::test]
async fn unknown_build_is_not_found() {
    let app = test_app();
    let request = Request::builder()
        .uri("/deploy/builds/nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_endpoints_respond() {
    let app = test_app();

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "deploy_hook - healthy");

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
}
