mod common;

use bytes::Bytes;
use common::{dead_upstream_url, harness, pdf_body, spawn_mock_ai, upstream_config};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use studygate::config::SessionCacheMode;
use studygate::error::GatewayError;
use studygate::persistence::DocumentStore;
use studygate::upstream::UpstreamClient;

const PDF: &str = "application/pdf";

#[tokio::test]
async fn test_concurrent_calls_for_one_user_share_one_session_and_never_overlap() {
    // 1. Setup
    let dir = tempfile::tempdir().unwrap();
    let (url, ai) = spawn_mock_ai().await;
    ai.delay_ms.store(50, Ordering::SeqCst);
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let doc = h
        .gateway
        .upload("alice", "notes.pdf", PDF, pdf_body("chapter one"))
        .await
        .unwrap();

    // 2. Fire summarize and ask at the same time
    let (summary, answer) = tokio::join!(
        h.gateway.summarize("alice", &doc.id),
        h.gateway.ask("alice", &doc.id, "What is the answer?"),
    );

    // 3. Verify
    assert_eq!(summary.unwrap().summary, "A short summary.");
    let answer = answer.unwrap();
    assert_eq!(answer.answer, "42");
    assert_eq!(answer.question, "What is the answer?");

    assert_eq!(ai.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(ai.max_in_flight.load(Ordering::SeqCst), 1);

    let calls = ai.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].starts_with("upload:"));
    assert_eq!(calls[1], "summarize:sess-1");
    assert_eq!(calls[2], "ask:sess-1");

    let stored = h.store.find("alice", &doc.id).await.unwrap().unwrap();
    assert_eq!(stored.session_id.as_deref(), Some("sess-1"));
}

#[tokio::test]
async fn test_disabled_session_cache_reuploads_every_call() {
    let dir = tempfile::tempdir().unwrap();
    let (url, ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Disabled, dir.path()).await;

    let doc = h
        .gateway
        .upload("alice", "notes.pdf", PDF, pdf_body("chapter one"))
        .await
        .unwrap();

    h.gateway.summarize("alice", &doc.id).await.unwrap();
    h.gateway.summarize("alice", &doc.id).await.unwrap();

    assert_eq!(ai.uploads.load(Ordering::SeqCst), 2);
    let calls = ai.calls();
    assert_eq!(calls[1], "summarize:sess-1");
    assert_eq!(calls[3], "summarize:sess-2");
}

#[tokio::test]
async fn test_different_users_are_served_in_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let (url, ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let a = h.gateway.upload("alice", "a.pdf", PDF, pdf_body("a")).await.unwrap();
    let b = h.gateway.upload("bob", "b.pdf", PDF, pdf_body("b")).await.unwrap();

    ai.delay_ms.store(300, Ordering::SeqCst);
    let start = Instant::now();
    let (ra, rb) = tokio::join!(
        h.gateway.summarize("alice", &a.id),
        h.gateway.summarize("bob", &b.id),
    );
    assert!(ra.is_ok() && rb.is_ok());

    // Each user does upload + summarize (600ms); serialized across users would be 1200ms
    assert!(start.elapsed() < Duration::from_millis(1100));
    assert_eq!(ai.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_foreign_document_looks_exactly_like_missing_one() {
    let dir = tempfile::tempdir().unwrap();
    let (url, ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let doc = h
        .gateway
        .upload("alice", "notes.pdf", PDF, pdf_body("private"))
        .await
        .unwrap();

    let foreign = h.gateway.summarize("bob", &doc.id).await.unwrap_err();
    let missing = h
        .gateway
        .summarize("bob", "00000000000000000000000000000000")
        .await
        .unwrap_err();

    assert!(matches!(foreign, GatewayError::NotFoundOrForbidden));
    assert_eq!(foreign.kind(), missing.kind());
    assert_eq!(foreign.to_string(), missing.to_string());

    assert!(matches!(
        h.gateway.delete("bob", &doc.id).await,
        Err(GatewayError::NotFoundOrForbidden)
    ));
    assert!(h.gateway.list("bob").await.unwrap().is_empty());
    assert!(ai.calls().is_empty());
    assert!(h.files.exists(&doc.id).await.unwrap());
}

#[tokio::test]
async fn test_failed_upload_leaves_no_record_or_file() {
    let dir = tempfile::tempdir().unwrap();
    let (url, _ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let broken = futures::stream::iter(vec![
        Ok(Bytes::from_static(b"%PDF-1.4\n")),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")),
    ]);
    let err = h
        .gateway
        .upload("alice", "notes.pdf", PDF, broken)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    assert!(h.gateway.list("alice").await.unwrap().is_empty());
    assert!(h.store.is_empty());

    let leftovers: Vec<_> = std::fs::read_dir(h.files.root()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_upload_rejects_unsupported_type_and_blank_name() {
    let dir = tempfile::tempdir().unwrap();
    let (url, _ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let err = h
        .gateway
        .upload("alice", "notes.txt", "text/plain", pdf_body("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));

    let err = h
        .gateway
        .upload("alice", "   ", PDF, pdf_body("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_delete_removes_record_then_file() {
    let dir = tempfile::tempdir().unwrap();
    let (url, _ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let doc = h
        .gateway
        .upload("alice", "notes.pdf", PDF, pdf_body("bye"))
        .await
        .unwrap();
    assert_eq!(doc.file_size, Some(12));

    h.gateway.delete("alice", &doc.id).await.unwrap();

    assert!(h.store.find("alice", &doc.id).await.unwrap().is_none());
    assert!(!h.files.exists(&doc.id).await.unwrap());
    assert!(matches!(
        h.gateway.summarize("alice", &doc.id).await,
        Err(GatewayError::NotFoundOrForbidden)
    ));
}

#[tokio::test]
async fn test_quiz_answers_become_option_indices() {
    let dir = tempfile::tempdir().unwrap();
    let (url, _ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let doc = h
        .gateway
        .upload("alice", "notes.pdf", PDF, pdf_body("letters"))
        .await
        .unwrap();
    let quiz = h.gateway.generate_quiz("alice", &doc.id).await.unwrap();

    assert_eq!(quiz.len(), 2);
    assert_eq!(quiz[0].correct_answer, 1);
    assert_eq!(quiz[1].correct_answer, 0);
}

#[tokio::test]
async fn test_tunnel_error_page_is_upstream_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let (url, ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let doc = h
        .gateway
        .upload("alice", "notes.pdf", PDF, pdf_body("offline"))
        .await
        .unwrap();
    ai.tunnel_down.store(true, Ordering::SeqCst);

    let err = h.gateway.summarize("alice", &doc.id).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamUnavailable { .. }));
}

#[tokio::test]
async fn test_upstream_json_failure_is_upstream_error() {
    let dir = tempfile::tempdir().unwrap();
    let (url, ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let doc = h
        .gateway
        .upload("alice", "notes.pdf", PDF, pdf_body("crash"))
        .await
        .unwrap();
    ai.fail_status.store(500, Ordering::SeqCst);

    match h.gateway.summarize("alice", &doc.id).await {
        Err(GatewayError::UpstreamError { status, body }) => {
            assert_eq!(status, 500);
            assert!(body.contains("model crashed"));
        }
        other => panic!("expected upstream error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_expired_cached_session_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let (url, ai) = spawn_mock_ai().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let doc = h
        .gateway
        .upload("alice", "notes.pdf", PDF, pdf_body("stale"))
        .await
        .unwrap();
    h.store.set_session(&doc.id, Some("gone".into())).await.unwrap();
    ai.fail_status.store(404, Ordering::SeqCst);

    // Both attempts fail, but the stale handle was dropped and a fresh upload tried
    let err = h.gateway.summarize("alice", &doc.id).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamError { status: 404, .. }));
    let calls = ai.calls();
    assert_eq!(calls[0], "summarize:gone");
    assert!(calls[1].starts_with("upload:"));
}

#[tokio::test]
async fn test_unreachable_upstream_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let url = dead_upstream_url().await;
    let h = harness(&url, SessionCacheMode::Enabled, dir.path()).await;

    let doc = h
        .gateway
        .upload("alice", "notes.pdf", PDF, pdf_body("nobody home"))
        .await
        .unwrap();

    match h.gateway.summarize("alice", &doc.id).await {
        Err(GatewayError::UpstreamUnavailable { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected upstream unavailable, got {:?}", other),
    }
    // The document is untouched by upstream failures
    assert!(h.store.find("alice", &doc.id).await.unwrap().is_some());
    assert_eq!(
        studygate::upstream::UpstreamHealth::Offline,
        h.gateway.health().await
    );
}

#[tokio::test]
async fn test_truncated_response_body_is_retried() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Promises 1000 bytes of JSON, sends a few, then hangs up
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 1000\r\n\r\n{\"summ";
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    let client = UpstreamClient::new(&upstream_config(&url)).unwrap();
    match client.summarize("sess-1").await {
        Err(GatewayError::UpstreamUnavailable { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected upstream unavailable, got {:?}", other),
    }
    assert_eq!(connections.load(Ordering::SeqCst), 3);
}
