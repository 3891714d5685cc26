// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! API-level tests: the axum router over the session service with the stub
//! runtime adapter and in-memory repositories.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use troupe_core::{InterruptRegistry, SessionService, StubRuntimeAdapter};
use troupe_store::{
    InMemoryPersonaRepository, InMemorySessionRepository, NewPersona, PersonaRepository,
    SessionRepository,
};

struct TestApp {
    router: Router,
    sessions: Arc<InMemorySessionRepository>,
    persona_ids: Vec<i64>,
}

async fn test_app() -> TestApp {
    let personas = Arc::new(InMemoryPersonaRepository::default());
    let mut persona_ids = Vec::new();
    for (name, handle) in [("Ada", "ada"), ("Ben", "ben")] {
        let p = personas
            .create_persona("alice", NewPersona::named(name).with_handle(handle))
            .await
            .unwrap();
        persona_ids.push(p.id);
    }
    let sessions = Arc::new(InMemorySessionRepository::new(personas));
    let service = Arc::new(SessionService::new(
        sessions.clone(),
        Arc::new(StubRuntimeAdapter),
        InterruptRegistry::new(),
        50,
    ));
    TestApp { router: troupe_server::app(service), sessions, persona_ids }
}

async fn request(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn create_session_returns_session_id() {
    let app = test_app().await;
    let (status, body) = request(
        &app.router,
        "POST",
        "/sessions",
        Some(json!({ "username": "alice", "title": "first chat" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["session_id"].as_str().unwrap().starts_with("sess-"));
}

#[tokio::test]
async fn create_session_requires_username() {
    let app = test_app().await;
    let (status, _) = request(&app.router, "POST", "/sessions", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_sessions_for_user() {
    let app = test_app().await;
    for _ in 0..2 {
        request(&app.router, "POST", "/sessions", Some(json!({ "username": "alice" }))).await;
    }
    let (status, body) = request(&app.router, "GET", "/sessions?username=alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
    let (_, other) = request(&app.router, "GET", "/sessions?username=bob", None).await;
    assert_eq!(other.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn get_unknown_session_is_404() {
    let app = test_app().await;
    let (status, body) = request(&app.router, "GET", "/sessions/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn patch_updates_metadata_fields() {
    let app = test_app().await;
    let (_, created) = request(
        &app.router,
        "POST",
        "/sessions",
        Some(json!({ "username": "alice", "title": "old" })),
    )
    .await;
    let id = created["session_id"].as_str().unwrap();
    let (status, body) = request(
        &app.router,
        "PATCH",
        &format!("/sessions/{id}"),
        Some(json!({ "user_handle": "al", "title": "new" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "new");
    assert_eq!(body["user_handle"], "al");
}

#[tokio::test]
async fn put_participants_orders_by_persona_id() {
    let app = test_app().await;
    let (_, created) =
        request(&app.router, "POST", "/sessions", Some(json!({ "username": "alice" }))).await;
    let id = created["session_id"].as_str().unwrap();
    let reversed: Vec<i64> = app.persona_ids.iter().rev().copied().collect();
    let (status, body) = request(
        &app.router,
        "PUT",
        &format!("/sessions/{id}/participants"),
        Some(json!({ "persona_ids": reversed })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<i64> = body["participants"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, app.persona_ids);
}

#[tokio::test]
async fn post_message_is_queued_and_processed() {
    let app = test_app().await;
    let (_, created) = request(
        &app.router,
        "POST",
        "/sessions",
        Some(json!({ "username": "alice", "initial_persona_ids": app.persona_ids })),
    )
    .await;
    let id = created["session_id"].as_str().unwrap().to_string();

    let (status, body) = request(
        &app.router,
        "POST",
        &format!("/sessions/{id}/messages"),
        Some(json!({ "content": "hello everyone" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");

    // The stub adapter replies asynchronously; poll until its message lands.
    let mut agent_reply = None;
    for _ in 0..50 {
        let msgs = app.sessions.list_messages(&id, 50).await.unwrap();
        if let Some(m) = msgs.iter().find(|m| m.sender == "ada") {
            agent_reply = Some(m.content.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(agent_reply.as_deref(), Some("user:hello everyone"));

    let (status, listed) =
        request(&app.router, "GET", &format!("/sessions/{id}/messages?limit=50"), None).await;
    assert_eq!(status, StatusCode::OK);
    let senders: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["sender"].as_str().unwrap())
        .collect();
    assert_eq!(senders[0], "user", "chronological order starts with the user message");
    assert!(senders.contains(&"ada"));
}

#[tokio::test]
async fn post_message_requires_content() {
    let app = test_app().await;
    let (_, created) =
        request(&app.router, "POST", "/sessions", Some(json!({ "username": "alice" }))).await;
    let id = created["session_id"].as_str().unwrap();
    let (status, _) = request(
        &app.router,
        "POST",
        &format!("/sessions/{id}/messages"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn post_message_to_unknown_session_is_404() {
    let app = test_app().await;
    let (status, _) = request(
        &app.router,
        "POST",
        "/sessions/nope/messages",
        Some(json!({ "content": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn batch_delete_removes_sessions() {
    let app = test_app().await;
    let mut ids = Vec::new();
    for _ in 0..2 {
        let (_, created) =
            request(&app.router, "POST", "/sessions", Some(json!({ "username": "alice" }))).await;
        ids.push(created["session_id"].as_str().unwrap().to_string());
    }
    let (status, _) = request(
        &app.router,
        "POST",
        "/sessions/batch-delete",
        Some(json!({ "session_ids": ids })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, listed) = request(&app.router, "GET", "/sessions?username=alice", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn delete_session_then_404() {
    let app = test_app().await;
    let (_, created) =
        request(&app.router, "POST", "/sessions", Some(json!({ "username": "alice" }))).await;
    let id = created["session_id"].as_str().unwrap();
    let (status, _) = request(&app.router, "DELETE", &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = request(&app.router, "GET", &format!("/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_json_body_is_400() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sessions")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
