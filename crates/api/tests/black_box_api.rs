use std::sync::Arc;
use std::time::Duration;

use moodscope_core::UserId;
use moodscope_infra::{Orchestrator, OrchestratorConfig, OrchestratorRuntime};
use moodscope_insights::{SyntheticListeningSource, TemplateGenerator};
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    _runtime: OrchestratorRuntime,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod, in-memory backends, ephemeral port.
        let orchestrator = Arc::new(Orchestrator::in_memory(OrchestratorConfig::default()));
        let runtime = orchestrator.start(
            Arc::new(SyntheticListeningSource::new()),
            Arc::new(TemplateGenerator::new()),
        );
        let app = moodscope_api::app::build_app(orchestrator);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            _runtime: runtime,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit(client: &reqwest::Client, url: String, body: Value) -> String {
    let res = client.post(url).json(&body).send().await.unwrap();
    if res.status() != StatusCode::ACCEPTED {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        panic!("expected 202 Accepted, got {status} body={body}");
    }
    let body: Value = res.json().await.unwrap();
    body["job_id"].as_str().unwrap().to_string()
}

async fn wait_for_job(client: &reqwest::Client, srv: &TestServer, job_id: &str) -> Value {
    // Workers run in the background; poll until the job settles.
    for _ in 0..200 {
        let res = client
            .get(srv.url(&format!("/jobs/{job_id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = res.json().await.unwrap();
        if body["state"] == "succeeded" || body["state"] == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not settle within timeout");
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn ingestion_then_generation_lifecycle() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new().to_string();

    // Ingest
    let job_id = submit(
        &client,
        srv.url("/ingestions"),
        json!({ "user_id": user, "time_range": "medium_term" }),
    )
    .await;
    let job = wait_for_job(&client, &srv, &job_id).await;
    assert_eq!(job["state"], "succeeded");
    assert_eq!(job["category"], "ingestion");
    assert_eq!(job["result"]["type"], "snapshot");
    let snapshot_id = job["result"]["id"].as_str().unwrap().to_string();

    // List
    let res = client
        .get(srv.url(&format!("/users/{user}/snapshots?limit=1")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let listed: Value = res.json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], snapshot_id.as_str());
    assert_eq!(listed[0]["time_range"], "medium_term");

    let res = client
        .get(srv.url(&format!("/snapshots/{snapshot_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Generate
    let request = json!({
        "snapshot_id": snapshot_id,
        "category": "wellness",
        "tone": "supportive",
    });
    let first = submit(&client, srv.url("/insights"), request.clone()).await;
    let job = wait_for_job(&client, &srv, &first).await;
    assert_eq!(job["state"], "succeeded");
    assert_eq!(job["result"]["type"], "insight");
    let insight_id = job["result"]["id"].as_str().unwrap().to_string();

    let res = client
        .get(srv.url(&format!("/insights/{insight_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let insight: Value = res.json().await.unwrap();
    assert_eq!(insight["snapshot_id"], snapshot_id.as_str());
    assert_eq!(insight["tone"], "supportive");
    assert!(!insight["content"].as_str().unwrap().is_empty());

    // Same request again: answered from the stored insight.
    let second = submit(&client, srv.url("/insights"), request).await;
    assert_ne!(first, second);
    let job = wait_for_job(&client, &srv, &second).await;
    assert_eq!(job["state"], "succeeded");
    assert_eq!(job["result"]["id"], insight_id.as_str());

    // List
    let res = client
        .get(srv.url(&format!("/users/{user}/insights?category=wellness&limit=5")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let listed: Value = res.json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], insight_id.as_str());

    let res = client
        .get(srv.url(&format!("/users/{user}/insights?category=roast")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let listed: Value = res.json().await.unwrap();
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/jobs/0190d6f0-0000-7000-8000-000000000000"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["state"], "not_found");
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/ingestions"))
        .json(&json!({ "user_id": "not-a-uuid" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(srv.url("/ingestions"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(srv.url("/jobs"))
        .json(&json!({ "category": "karaoke", "payload": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(srv.url("/jobs/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let user = UserId::new();
    let res = client
        .get(srv.url(&format!("/users/{user}/snapshots?limit=lots")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(srv.url(&format!("/users/{user}/insights?category=horoscope")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn generation_for_missing_snapshot_is_not_found() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let res = client
        .post(srv.url("/insights"))
        .json(&json!({
            "snapshot_id": "0190d6f0-0000-7000-8000-000000000000",
            "category": "roast",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn generic_submission_and_queue_overview() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let job_id = submit(
        &client,
        srv.url("/jobs"),
        json!({ "category": "maintenance", "payload": { "task": "cleanup_jobs" } }),
    )
    .await;
    let job = wait_for_job(&client, &srv, &job_id).await;
    assert_eq!(job["state"], "succeeded");
    assert_eq!(job["category"], "maintenance");

    let res = client.get(srv.url("/admin/queues")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    for category in ["ingestion", "generation", "maintenance"] {
        assert!(body["queues"][category].is_object(), "missing {category}");
    }
    assert!(body["jobs"]["succeeded"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn empty_snapshot_list_is_ok() {
    let srv = TestServer::spawn().await;
    let user = UserId::new();
    let res = reqwest::get(srv.url(&format!("/users/{user}/snapshots")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!([]));
}
