//! HTTP API tests: a real server on an ephemeral port, driven with reqwest.
//!
//! Background jobs are processed by draining a worker against the same
//! database between requests, so assertions never race the queue.

use std::sync::Arc;

use async_trait::async_trait;
use knowledge_space::config::Config;
use knowledge_space::embedding::{DisabledProvider, EmbeddingProvider};
use knowledge_space::error::KbResult;
use knowledge_space::llm::{ChatModel, ChatRequest};
use knowledge_space::server::{serve_on, AppState};
use knowledge_space::worker::Worker;
use knowledge_space::{db, migrate};
use reqwest::StatusCode;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

struct EchoModel;

#[async_trait]
impl ChatModel for EchoModel {
    fn default_model(&self) -> &str {
        "echo"
    }

    async fn stream_chat(&self, request: &ChatRequest, sink: mpsc::Sender<String>) -> KbResult<String> {
        let question = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let reply = format!("You asked: {}", question);
        for word in reply.split_inclusive(' ') {
            let _ = sink.send(word.to_string()).await;
        }
        Ok(reply)
    }
}

struct TestServer {
    _tmp: TempDir,
    base: String,
    client: reqwest::Client,
    pool: SqlitePool,
    config: Arc<Config>,
    shutdown: watch::Sender<bool>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_db_path(tmp.path().join("kb.sqlite"));
        config.auth.jwt_secret = "api-test-secret-0123456789".to_string();
        config.upload.dir = tmp.path().join("uploads");
        adjust(&mut config);
        let config = Arc::new(config);

        let pool = db::connect(&config).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();

        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(DisabledProvider);
        let state = AppState::new(pool.clone(), config.clone(), embedder, Arc::new(EchoModel));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api/v1", listener.local_addr().unwrap());
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(async move {
            serve_on(listener, state, rx).await.unwrap();
        });

        TestServer {
            _tmp: tmp,
            base,
            client: reqwest::Client::new(),
            pool,
            config,
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn register(&self, email: &str) -> String {
        let resp = self
            .client
            .post(self.url("/auth/register"))
            .json(&json!({ "email": email, "password": "correct horse battery" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    async fn post(&self, token: &str, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, token: &str, path: &str) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn drain_jobs(&self) -> usize {
        Worker::with_default_handlers(
            self.pool.clone(),
            self.config.clone(),
            Arc::new(DisabledProvider),
        )
        .unwrap()
        .drain()
        .await
        .unwrap()
    }

    /// A space and knowledge base owned by `token`'s user: (space, kb).
    async fn space_and_kb(&self, token: &str) -> (String, String) {
        let (status, space) = self.post(token, "/spaces", json!({ "name": "Team" })).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(space["role"], "owner");
        let space_id = space["id"].as_str().unwrap().to_string();

        let (status, kb) = self
            .post(
                token,
                &format!("/spaces/{}/knowledge-bases", space_id),
                json!({ "name": "Docs", "description": "team docs" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        (space_id, kb["id"].as_str().unwrap().to_string())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let server = TestServer::start().await;
    let root = server.base.trim_end_matches("/api/v1");
    let resp = server
        .client
        .get(format!("{}/health", root))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["embeddings"], false);
}

#[tokio::test]
async fn register_login_and_me() {
    let server = TestServer::start().await;
    let token = server.register("Ada@Example.com").await;

    let (status, me) = server.get(&token, "/auth/me").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["email"], "ada@example.com");
    assert!(me.get("password_hash").is_none());

    let resp = server
        .client
        .post(server.url("/auth/login"))
        .json(&json!({ "email": "ada@example.com", "password": "correct horse battery" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["token_type"], "Bearer");

    let resp = server
        .client
        .post(server.url("/auth/login"))
        .json(&json!({ "email": "ada@example.com", "password": "wrong password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .client
        .post(server.url("/auth/register"))
        .json(&json!({ "email": "ada@example.com", "password": "another password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn requests_without_a_valid_token_are_rejected() {
    let server = TestServer::start().await;

    let resp = server.client.get(server.url("/spaces")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = server.get("not-a-token", "/spaces").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn registration_can_be_turned_off() {
    let server = TestServer::start_with(|c| c.auth.allow_registration = false).await;
    let resp = server
        .client
        .post(server.url("/auth/register"))
        .json(&json!({ "email": "late@example.com", "password": "correct horse battery" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let server = TestServer::start().await;
    let token = server.register("owner@example.com").await;
    let resp = server
        .client
        .post(server.url("/spaces"))
        .bearer_auth(&token)
        .header("content-type", "application/json")
        .body("{\"name\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn text_source_flows_from_request_to_search() {
    let server = TestServer::start().await;
    let token = server.register("owner@example.com").await;
    let (space, kb) = server.space_and_kb(&token).await;

    let (status, source) = server
        .post(
            &token,
            &format!("/knowledge-bases/{}/sources", kb),
            json!({
                "kind": "text",
                "title": "Incident policy",
                "content": "Severity one incidents require a postmortem within five days."
            }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(source["status"], "pending");
    let source_id = source["id"].as_str().unwrap().to_string();

    let (status, jobs) = server
        .get(&token, &format!("/spaces/{}/jobs?status=queued", space))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().unwrap().len(), 1);
    let job_id = jobs[0]["id"].as_str().unwrap().to_string();

    assert_eq!(server.drain_jobs().await, 1);

    let (_, job) = server.get(&token, &format!("/jobs/{}", job_id)).await;
    assert_eq!(job["status"], "succeeded");
    let (_, source) = server.get(&token, &format!("/sources/{}", source_id)).await;
    assert_eq!(source["status"], "ready");

    let (status, found) = server
        .post(
            &token,
            &format!("/spaces/{}/search", space),
            json!({ "query": "postmortem" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["mode"], "keyword");
    let results = found["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["title"], "Incident policy");
    assert_eq!(results[0]["source_id"], source_id.as_str());

    let (status, _) = server
        .post(
            &token,
            &format!("/spaces/{}/search", space),
            json!({ "query": "postmortem", "mode": "semantic" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, stats) = server.get(&token, &format!("/spaces/{}/stats", space)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["knowledge_bases"], 1);
    assert_eq!(stats["sources"]["ready"], 1);
}

#[tokio::test]
async fn files_upload_as_multipart() {
    let server = TestServer::start().await;
    let token = server.register("owner@example.com").await;
    let (_space, kb) = server.space_and_kb(&token).await;

    let part = reqwest::multipart::Part::bytes(b"# Onboarding\n\nBadges are issued at reception.".to_vec())
        .file_name("onboarding.md");
    let form = reqwest::multipart::Form::new().part("file", part);
    let resp = server
        .client
        .post(server.url(&format!("/knowledge-bases/{}/sources/upload", kb)))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let source: Value = resp.json().await.unwrap();
    assert_eq!(source["kind"], "upload");
    assert_eq!(source["title"], "onboarding.md");

    server.drain_jobs().await;
    let (_, sources) = server
        .get(&token, &format!("/knowledge-bases/{}/sources", kb))
        .await;
    assert_eq!(sources[0]["status"], "ready");

    let form = reqwest::multipart::Form::new().text("note", "no file here");
    let resp = server
        .client
        .post(server.url(&format!("/knowledge-bases/{}/sources/upload", kb)))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn members_and_roles_over_http() {
    let server = TestServer::start().await;
    let owner = server.register("owner@example.com").await;
    let viewer = server.register("viewer@example.com").await;
    let (space, kb) = server.space_and_kb(&owner).await;

    let (status, _) = server.get(&viewer, &format!("/spaces/{}", space)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, member) = server
        .post(
            &owner,
            &format!("/spaces/{}/members", space),
            json!({ "email": "viewer@example.com", "role": "viewer" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(member["role"], "viewer");

    let (status, view) = server.get(&viewer, &format!("/spaces/{}", space)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["role"], "viewer");

    let (status, body) = server
        .post(
            &viewer,
            &format!("/knowledge-bases/{}/sources", kb),
            json!({ "kind": "text", "title": "x", "content": "y" }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let (_, members) = server.get(&viewer, &format!("/spaces/{}/members", space)).await;
    assert_eq!(members.as_array().unwrap().len(), 2);

    let resp = server
        .client
        .delete(server.url(&format!("/spaces/{}", space)))
        .bearer_auth(&viewer)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = server
        .client
        .delete(server.url(&format!("/spaces/{}", space)))
        .bearer_auth(&owner)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let (status, _) = server.get(&owner, &format!("/knowledge-bases/{}", kb)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn jobs_can_be_cancelled_and_retried() {
    let server = TestServer::start().await;
    let token = server.register("owner@example.com").await;
    let (space, kb) = server.space_and_kb(&token).await;

    server
        .post(
            &token,
            &format!("/knowledge-bases/{}/sources", kb),
            json!({ "kind": "text", "title": "Later", "content": "Process me later." }),
        )
        .await;
    let (_, jobs) = server.get(&token, &format!("/spaces/{}/jobs", space)).await;
    let job_id = jobs[0]["id"].as_str().unwrap().to_string();

    let (status, job) = server
        .post(&token, &format!("/jobs/{}/cancel", job_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "cancelled");
    assert_eq!(server.drain_jobs().await, 0);

    let (status, _) = server
        .post(&token, &format!("/jobs/{}/cancel", job_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, job) = server
        .post(&token, &format!("/jobs/{}/retry", job_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "queued");
    assert_eq!(server.drain_jobs().await, 1);

    let stranger = server.register("stranger@example.com").await;
    let (status, _) = server.get(&stranger, &format!("/jobs/{}", job_id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_answers_stream_as_server_sent_events() {
    let server = TestServer::start().await;
    let token = server.register("owner@example.com").await;
    let (space, kb) = server.space_and_kb(&token).await;

    server
        .post(
            &token,
            &format!("/knowledge-bases/{}/sources", kb),
            json!({ "kind": "text", "title": "Office", "content": "The office opens at eight." }),
        )
        .await;
    server.drain_jobs().await;

    let (status, assistant) = server
        .post(
            &token,
            &format!("/spaces/{}/assistants", space),
            json!({ "name": "Front desk", "knowledge_base_ids": [kb] }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let assistant_id = assistant["id"].as_str().unwrap().to_string();

    let (status, conversation) = server
        .post(&token, "/conversations", json!({ "assistant_id": assistant_id }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let conversation_id = conversation["id"].as_str().unwrap().to_string();

    let resp = server
        .client
        .post(server.url(&format!("/conversations/{}/messages", conversation_id)))
        .bearer_auth(&token)
        .json(&json!({ "content": "When does the office open?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = resp.text().await.unwrap();
    let events: Vec<&str> = body
        .lines()
        .filter_map(|l| l.strip_prefix("event: "))
        .collect();
    assert_eq!(events.first(), Some(&"context"));
    assert_eq!(events.last(), Some(&"done"));
    assert!(events.contains(&"delta"));
    assert!(body.contains("\"title\":\"Office\""));

    let (status, messages) = server
        .get(&token, &format!("/conversations/{}/messages", conversation_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(
        messages[1]["content"],
        "You asked: When does the office open?"
    );

    let (_, listed) = server
        .get(&token, &format!("/conversations?assistant_id={}", assistant_id))
        .await;
    assert_eq!(listed[0]["title"], "When does the office open?");

    let resp = server
        .client
        .post(server.url(&format!("/conversations/{}/messages", conversation_id)))
        .bearer_auth(&token)
        .json(&json!({ "content": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_query_strings_use_the_error_envelope() {
    let server = TestServer::start().await;
    let token = server.register("query@example.com").await;
    let (space, _kb) = server.space_and_kb(&token).await;

    let (status, body) = server
        .get(&token, &format!("/spaces/{}/jobs?limit=abc", space))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(!body["error"]["message"].as_str().unwrap().is_empty());

    let (status, body) = server
        .get(&token, &format!("/spaces/{}/jobs?status=exploded", space))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn url_sources_on_internal_hosts_are_refused() {
    let server = TestServer::start().await;
    let token = server.register("ssrf@example.com").await;
    let (space, kb) = server.space_and_kb(&token).await;

    for url in [
        "http://127.0.0.1:9/",
        "http://169.254.169.254/latest/meta-data/",
        "http://[::1]/",
        "http://10.1.2.3/wiki",
    ] {
        let (status, body) = server
            .post(
                &token,
                &format!("/knowledge-bases/{}/sources", kb),
                json!({ "kind": "url", "url": url }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", url);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    let (_, jobs) = server.get(&token, &format!("/spaces/{}/jobs", space)).await;
    assert!(jobs.as_array().unwrap().is_empty());
}
