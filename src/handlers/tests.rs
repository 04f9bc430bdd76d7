//! # Tests for Handlers

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::handlers::root;
use crate::jobs::JobStatus;
use crate::server::{AppState, create_app};

async fn test_db() -> DatabaseConnection {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await.expect("connect sqlite");
    Migrator::up(&db, None).await.expect("migrate");
    db
}

async fn test_app() -> Router {
    let config = AppConfig {
        source_collection_id: "source".to_string(),
        ..AppConfig::default()
    };
    create_app(AppState::new(Arc::new(config), test_db().await))
}

fn redact_config() -> Value {
    json!({
        "pathRules": [
            { "path": "Patient.name", "method": "redact" },
            { "path": "birthDate", "method": "keep" }
        ]
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, headers, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_root_handler_returns_expected_service_info() {
    let axum::Json(service_info) = root().await;

    assert_eq!(service_info.service, "anonymizer");
    assert_eq!(service_info.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_health_reports_reachable_database() {
    let app = test_app().await;

    let (status, _, _) = send(&app, request("GET", "/health")).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_create_job_returns_accepted_with_location() {
    let app = test_app().await;

    let (status, headers, body) = send(
        &app,
        post_json("/anonymize/deid-2024?resource_type=Patient", &redact_config()),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().expect("job id");
    assert!(Uuid::parse_str(job_id).is_ok());
    assert_eq!(
        headers.get(header::CONTENT_LOCATION).unwrap(),
        &format!("/anonymize/jobs/{}", job_id)
    );

    let (status, _, job) = send(&app, request("GET", &format!("/anonymize/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "queued");
    assert_eq!(job["collection_id"], "deid-2024");
    assert_eq!(job["resource_type"], "Patient");
    assert_eq!(job["page"], 0);
    assert!(job.get("failure_details").is_none());
}

#[tokio::test]
async fn test_create_job_rejects_invalid_collection_id() {
    let app = test_app().await;

    let (status, headers, body) =
        send(&app, post_json("/anonymize/bad%20id", &redact_config())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
    assert!(body["details"]["collection_id"].is_string());
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
}

#[tokio::test]
async fn test_create_job_rejects_source_collection() {
    let app = test_app().await;

    let (status, _, body) = send(&app, post_json("/anonymize/source", &redact_config())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["details"]["collection_id"],
        "cannot export into the source collection"
    );
}

#[tokio::test]
async fn test_create_job_rejects_invalid_configuration() {
    let app = test_app().await;
    let config = json!({ "pathRules": [{ "path": "identifier", "method": "cryptoHash" }] });

    let (status, _, body) = send(&app, post_json("/anonymize/deid", &config)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["configuration"].is_string());
}

#[tokio::test]
async fn test_create_job_rejects_unknown_method() {
    let app = test_app().await;
    let config = json!({ "pathRules": [{ "path": "name", "method": "scramble" }] });

    let (status, _, body) = send(&app, post_json("/anonymize/deid", &config)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_create_job_rejects_invalid_resource_type() {
    let app = test_app().await;

    let (status, _, body) = send(
        &app,
        post_json("/anonymize/deid?resource_type=patient", &redact_config()),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["resource_type"].is_string());
}

#[tokio::test]
async fn test_get_job_unknown_and_malformed_ids() {
    let app = test_app().await;

    let (status, _, body) = send(
        &app,
        request("GET", &format!("/anonymize/jobs/{}", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _, _) = send(&app, request("GET", "/anonymize/jobs/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_job_then_cancel_again_conflicts() {
    let app = test_app().await;
    let (_, _, created) = send(&app, post_json("/anonymize/deid", &redact_config())).await;
    let uri = format!("/anonymize/jobs/{}", created["job_id"].as_str().unwrap());

    let (status, _, job) = send(&app, request("DELETE", &uri)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(job["status"], JobStatus::Canceled.as_str());
    assert!(job["end_time"].is_string());

    let (status, _, body) = send(&app, request("DELETE", &uri)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
}

#[tokio::test]
async fn test_error_envelope_echoes_request_id() {
    let app = test_app().await;
    let request = Request::builder()
        .method("GET")
        .uri(format!("/anonymize/jobs/{}", Uuid::new_v4()))
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();

    let (status, _, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["trace_id"], "req-123");
}

#[tokio::test]
async fn test_openapi_document_lists_anonymize_routes() {
    let app = test_app().await;

    let (status, _, doc) = send(&app, request("GET", "/openapi.json")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/anonymize/{collection_id}"]["post"].is_object());
    assert!(doc["paths"]["/anonymize/jobs/{job_id}"]["delete"].is_object());
}
