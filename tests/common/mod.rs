#![allow(dead_code)]

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use studygate::config::{SessionCacheMode, UpstreamConfig};
use studygate::file_store::FileStore;
use studygate::gateway::DocumentGateway;
use studygate::persistence::{DocumentStore, MemoryDocumentStore};
use studygate::queue::UserQueues;
use studygate::upstream::UpstreamClient;

/// In-process stand-in for the AI inference service.
#[derive(Default)]
pub struct MockAi {
    pub calls: Mutex<Vec<String>>,
    pub uploads: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub delay_ms: AtomicUsize,
    /// Serve the tunnel's HTML error page instead of JSON.
    pub tunnel_down: AtomicBool,
    /// Non-zero: fail AI calls with this status and a JSON body.
    pub fail_status: AtomicU16,
}

impl MockAi {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, call: String) -> Option<Response> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(call);

        let delay = self.delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.tunnel_down.load(Ordering::SeqCst) {
            let page = "<!DOCTYPE html><html><body>ERR_NGROK_3200: endpoint offline</body></html>";
            return Some(
                (StatusCode::OK, [(header::CONTENT_TYPE, "text/html")], page).into_response(),
            );
        }
        let status = self.fail_status.load(Ordering::SeqCst);
        if status != 0 {
            let status = StatusCode::from_u16(status).unwrap();
            return Some((status, Json(json!({"detail": "model crashed"}))).into_response());
        }
        None
    }
}

fn session_of(body: &Value) -> String {
    body["session_id"].as_str().unwrap_or_default().to_string()
}

async fn upload(State(ai): State<Arc<MockAi>>, mut multipart: axum_extra::extract::Multipart) -> Response {
    let mut size = 0;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            size = field.bytes().await.map(|b| b.len()).unwrap_or(0);
        }
    }
    if let Some(failure) = ai.enter(format!("upload:{}", size)).await {
        return failure;
    }
    let n = ai.uploads.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "session_id": format!("sess-{}", n) })).into_response()
}

async fn summarize(State(ai): State<Arc<MockAi>>, Json(body): Json<Value>) -> Response {
    if let Some(failure) = ai.enter(format!("summarize:{}", session_of(&body))).await {
        return failure;
    }
    Json(json!({ "summary": "A short summary.", "word_count": 3 })).into_response()
}

async fn quiz(State(ai): State<Arc<MockAi>>, Json(body): Json<Value>) -> Response {
    if let Some(failure) = ai.enter(format!("quiz:{}", session_of(&body))).await {
        return failure;
    }
    Json(json!({
        "quiz": [
            {
                "question": "Which letter is second?",
                "options": ["a", "B", "c"],
                "correct_answer": "b",
                "explanation": "B follows A."
            },
            {
                "question": "Unmatched answer?",
                "options": ["x", "y"],
                "correct_answer": "z",
                "explanation": ""
            }
        ]
    }))
    .into_response()
}

async fn ask(State(ai): State<Arc<MockAi>>, Json(body): Json<Value>) -> Response {
    if let Some(failure) = ai.enter(format!("ask:{}", session_of(&body))).await {
        return failure;
    }
    let question = body["question"].as_str().unwrap_or_default();
    Json(json!({ "question": question, "answer": "42" })).into_response()
}

pub async fn spawn_mock_ai() -> (String, Arc<MockAi>) {
    let ai = Arc::new(MockAi::default());
    let app = Router::new()
        .route("/upload", post(upload))
        .route("/summarize", post(summarize))
        .route("/quiz", post(quiz))
        .route("/ask", post(ask))
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .with_state(ai.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), ai)
}

/// Address nothing listens on.
pub async fn dead_upstream_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn upstream_config(base_url: &str) -> UpstreamConfig {
    UpstreamConfig {
        base_url: base_url.to_string(),
        retry_initial_delay_ms: 10,
        ..UpstreamConfig::default()
    }
}

pub struct Harness {
    pub gateway: DocumentGateway,
    pub store: Arc<MemoryDocumentStore>,
    pub files: Arc<FileStore>,
}

pub async fn harness(base_url: &str, cache: SessionCacheMode, dir: &Path) -> Harness {
    let store = Arc::new(MemoryDocumentStore::new());
    let files = Arc::new(FileStore::new(dir.join("uploads")).await.unwrap());
    let upstream = Arc::new(UpstreamClient::new(&upstream_config(base_url)).unwrap());
    let gateway = DocumentGateway::new(
        store.clone() as Arc<dyn DocumentStore>,
        files.clone(),
        upstream,
        Arc::new(UserQueues::new()),
    )
    .with_session_cache(cache);
    Harness { gateway, store, files }
}

pub fn pdf_body(text: &'static str) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::iter(vec![
        Ok(Bytes::from_static(b"%PDF-1.4\n")),
        Ok(Bytes::from_static(text.as_bytes())),
    ])
}
