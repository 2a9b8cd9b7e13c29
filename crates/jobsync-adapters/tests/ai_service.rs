use std::time::Duration;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use jobsync_adapters::{AiServiceClient, EnrichmentError, EnrichmentGateway, ProcessingMode};
use serde_json::json;

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn router() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/translate/{id}",
            post(|Path(id): Path<String>| async move {
                if id == "broken" {
                    return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"detail": "boom"})));
                }
                let skipped = id == "seen";
                (
                    StatusCode::OK,
                    Json(json!({
                        "jobId": id,
                        "skipped": skipped,
                        "skipReason": skipped.then_some("already translated"),
                        "savedToDB": !skipped
                    })),
                )
            }),
        )
}

async fn client() -> AiServiceClient {
    let base = spawn(router()).await;
    AiServiceClient::new(base, ProcessingMode::Translate, Duration::from_secs(5)).expect("client")
}

#[tokio::test]
async fn enrich_reports_processed_and_skipped() {
    let client = client().await;

    let done = client.enrich("job-1").await.expect("processed");
    assert!(!done.skipped);
    assert!(done.saved_to_db);
    assert_eq!(done.job_id.as_deref(), Some("job-1"));

    let seen = client.enrich("seen").await.expect("skipped");
    assert!(seen.skipped);
    assert_eq!(seen.skip_reason.as_deref(), Some("already translated"));
}

#[tokio::test]
async fn enrich_surfaces_service_errors() {
    let client = client().await;
    let err = client.enrich("broken").await.unwrap_err();
    assert!(matches!(err, EnrichmentError::Status { status: 500, .. }));
}

#[tokio::test]
async fn health_check_hits_health_endpoint() {
    let client = client().await;
    client.health_check().await.expect("healthy");

    let other = AiServiceClient::new(
        spawn(Router::new()).await,
        ProcessingMode::Process,
        Duration::from_secs(5),
    )
    .unwrap();
    assert!(matches!(
        other.health_check().await,
        Err(EnrichmentError::Status { status: 404, .. })
    ));
}
