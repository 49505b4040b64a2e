//! `SidecarClient` against an in-process HTTP sidecar.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use hearth::sidecar::{
    PreviewStatus, PreviewUrl, RunOutput, Sidecar, SidecarClient, SidecarError, get_preview_url,
};
use hearth::{RecordingSleeper, RetryPolicy};
use serde_json::{Value, json};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Recorded {
    requests: Arc<Mutex<Vec<(&'static str, Value)>>>,
    tunnel_lookups: Arc<Mutex<u32>>,
}

impl Recorded {
    fn push(&self, endpoint: &'static str, body: &Value) {
        self.requests.lock().unwrap().push((endpoint, body.clone()));
    }

    fn bodies(&self, endpoint: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

async fn create(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
    rec.push("create", &body);
    Json(json!({"sandboxId": body["sandbox_id"], "status": "created"}))
}

async fn write_files(
    State(rec): State<Recorded>,
    Json(body): Json<Value>,
) -> axum::response::Response {
    rec.push("write-files", &body);
    if body["sandbox_id"] == "gone" {
        return (StatusCode::NOT_FOUND, "Sandbox 'gone' not found").into_response();
    }
    let written: Vec<String> = body["files"]
        .as_object()
        .map(|files| files.keys().cloned().collect())
        .unwrap_or_default();
    Json(json!({"written": written})).into_response()
}

async fn list_files(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
    rec.push("list-files", &body);
    Json(json!({"files": ["/app/package.json", "/app/src/app/page.tsx"]}))
}

async fn read_file(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
    rec.push("read-file", &body);
    if body["file_path"] == "/app/package.json" {
        Json(json!({"filePath": body["file_path"], "content": "{\"name\":\"todo\"}"}))
    } else {
        Json(json!({"filePath": body["file_path"], "content": null, "error": "No such file"}))
    }
}

async fn run_command(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
    rec.push("run-command", &body);
    if body["background"] == true {
        Json(json!({"status": "started", "command": body["command"]}))
    } else {
        Json(json!({"stdout": "added 312 packages", "stderr": "", "exitCode": 0}))
    }
}

async fn tunnel_url(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
    rec.push("tunnel-url", &body);
    let mut lookups = rec.tunnel_lookups.lock().unwrap();
    *lookups += 1;
    if *lookups >= 2 {
        Json(json!({"previewUrl": "https://3000-p1.preview.test", "status": "ready"}))
    } else {
        Json(json!({"previewUrl": null, "status": "not_ready"}))
    }
}

async fn terminate(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
    rec.push("terminate", &body);
    Json(json!({"status": "terminated"}))
}

async fn garbage() -> &'static str {
    "<html>bad gateway</html>"
}

async fn spawn_sidecar() -> (String, Recorded) {
    let rec = Recorded::default();
    let app = Router::new()
        .route("/sandbox/create", post(create))
        .route("/sandbox/write-files", post(write_files))
        .route("/sandbox/list-files", post(list_files))
        .route("/sandbox/read-file", post(read_file))
        .route("/sandbox/run-command", post(run_command))
        .route("/sandbox/tunnel-url", post(tunnel_url))
        .route("/sandbox/terminate", post(terminate))
        .with_state(rec.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind sidecar");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), rec)
}

fn client(base: &str) -> SidecarClient {
    SidecarClient::new(base, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_requests_carry_sandbox_id_and_snake_case_fields() {
    let (base, rec) = spawn_sidecar().await;
    let sidecar = client(&base);

    let ack = sidecar.create("p1").await.unwrap();
    assert_eq!(ack.sandbox_id.as_deref(), Some("p1"));
    assert!(!ack.restored());

    let files = BTreeMap::from([("/app/package.json".to_string(), "{}".to_string())]);
    let written = sidecar.write_files("p1", &files).await.unwrap();
    assert_eq!(written.written, vec!["/app/package.json"]);

    let listing = sidecar.list_files("p1", "/app").await.unwrap();
    assert_eq!(listing.files.len(), 2);

    let content = sidecar.read_file("p1", "/app/package.json").await.unwrap();
    assert_eq!(content.content.as_deref(), Some("{\"name\":\"todo\"}"));

    assert_eq!(rec.bodies("create"), vec![json!({"sandbox_id": "p1"})]);
    assert_eq!(
        rec.bodies("write-files"),
        vec![json!({"sandbox_id": "p1", "files": {"/app/package.json": "{}"}})]
    );
    assert_eq!(
        rec.bodies("list-files"),
        vec![json!({"sandbox_id": "p1", "path": "/app"})]
    );
    assert_eq!(
        rec.bodies("read-file"),
        vec![json!({"sandbox_id": "p1", "file_path": "/app/package.json"})]
    );
}

#[tokio::test]
async fn test_missing_file_is_not_an_error() {
    let (base, _) = spawn_sidecar().await;
    let content = client(&base)
        .read_file("p1", "/app/src/nope.ts")
        .await
        .unwrap();
    assert!(content.is_missing());
    assert_eq!(content.error.as_deref(), Some("No such file"));
}

#[tokio::test]
async fn test_run_command_foreground_and_background() {
    let (base, rec) = spawn_sidecar().await;
    let sidecar = client(&base);

    let install = sidecar.run_command("p1", "npm install", false).await.unwrap();
    assert_eq!(install.exit_code(), Some(0));

    let dev = sidecar.run_command("p1", "npm run dev", true).await.unwrap();
    assert_eq!(
        dev,
        RunOutput::Started {
            status: "started".into(),
            command: "npm run dev".into()
        }
    );
    assert_eq!(rec.bodies("run-command")[1]["background"], true);
}

#[tokio::test]
async fn test_non_2xx_surfaces_status_and_body() {
    let (base, _) = spawn_sidecar().await;
    let files = BTreeMap::from([("/app/a.ts".to_string(), String::new())]);
    let err = client(&base).write_files("gone", &files).await.unwrap_err();
    match err {
        SidecarError::Status {
            endpoint,
            status,
            body,
        } => {
            assert_eq!(endpoint, "/sandbox/write-files");
            assert_eq!(status, 404);
            assert!(body.contains("not found"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_undecodable_body() {
    let app = Router::new().route("/sandbox/list-files", post(garbage));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let err = client(&format!("http://{addr}"))
        .list_files("p1", "/app")
        .await
        .unwrap_err();
    assert!(matches!(err, SidecarError::Decode { .. }));
    assert_eq!(err.status(), None);
}

#[tokio::test]
async fn test_transport_error_when_nothing_listens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{addr}"))
        .create("p1")
        .await
        .unwrap_err();
    assert!(matches!(err, SidecarError::Transport { .. }));
    assert_eq!(err.endpoint(), "/sandbox/create");
}

#[tokio::test]
async fn test_preview_poll_over_http() {
    let (base, rec) = spawn_sidecar().await;
    let sidecar = client(&base);
    let sleeper = RecordingSleeper::new();

    let preview = get_preview_url(&sidecar, "p1", &RetryPolicy::default(), &sleeper)
        .await
        .unwrap();

    assert_eq!(preview, PreviewUrl::ready("https://3000-p1.preview.test"));
    assert_eq!(preview.status, PreviewStatus::Ready);
    assert_eq!(rec.bodies("tunnel-url").len(), 2);
    assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(2)]);
}

#[tokio::test]
async fn test_terminate() {
    let (base, rec) = spawn_sidecar().await;
    client(&base).terminate("p1").await.unwrap();
    assert_eq!(rec.bodies("terminate"), vec![json!({"sandbox_id": "p1"})]);
}
