//! HTTP surface tests driven through the router without a socket.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use std::sync::Arc;
use tower::ServiceExt;

use stratum::api::{app_state, create_router};
use stratum::catalog::{LineageIndex, MetadataCache};
use stratum::lease::LeaseManager;
use stratum::manager::PayloadManager;
use stratum::repository::MemoryRepository;
use stratum::service::ServiceContext;
use stratum::storage::{DiskBackend, RamBackend, StorageBackend, TierRouter};
use stratum::stream::StreamManager;
use tempfile::TempDir;

fn router() -> (axum::Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let ram = Arc::new(RamBackend::new(16 * 1024 * 1024));
    let disk = Arc::new(DiskBackend::new(dir.path()).unwrap());
    let tier_router = Arc::new(TierRouter::new(vec![
        ram as Arc<dyn StorageBackend>,
        disk as Arc<dyn StorageBackend>,
    ]));
    let repository = Arc::new(MemoryRepository::new());
    let manager = Arc::new(PayloadManager::new(
        repository.clone(),
        tier_router,
        Arc::new(LeaseManager::new(1_000, 60_000)),
        Arc::new(MetadataCache::new()),
        Arc::new(LineageIndex::new()),
    ));
    let streams = Arc::new(StreamManager::new(repository));
    let state = app_state(ServiceContext::new(manager, streams));
    (create_router(state), dir)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (router, _dir) = router();
    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_allocate_commit_resolve_delete_flow() {
    let (router, _dir) = router();

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/catalog/allocate",
            serde_json::json!({"size_bytes": 64, "preferred_tier": "ram"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let descriptor = body_json(response).await;
    let id = descriptor["id"].as_str().unwrap().to_string();
    assert_eq!(descriptor["state"], "allocated");
    assert_eq!(descriptor["version"], 1);
    assert_eq!(descriptor["location"]["tier"], "ram");

    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/v1/catalog/commit/{}", id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["state"], "active");

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v1/data/resolve/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/catalog/payloads/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // gone now
    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/v1/data/resolve/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_lease_conflict_maps_to_conflict_status() {
    let (router, _dir) = router();

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/catalog/allocate",
            serde_json::json!({"size_bytes": 8}),
        ))
        .await
        .unwrap();
    let id = body_json(response).await["id"].as_str().unwrap().to_string();

    router
        .clone()
        .oneshot(post_json(
            &format!("/v1/catalog/commit/{}", id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/data/lease",
            serde_json::json!({"id": id, "min_lease_duration_ms": 60000}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let lease = body_json(response).await;
    assert_eq!(lease["lease_id"].as_str().unwrap().len(), 32);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/catalog/payloads/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["error"], "lease_conflict");
}

#[tokio::test]
async fn test_invalid_uuid_is_bad_request() {
    let (router, _dir) = router();
    let response = router
        .oneshot(
            Request::builder()
                .uri("/v1/data/resolve/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stream_endpoints() {
    let (router, _dir) = router();

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/streams",
            serde_json::json!({"namespace": "ns", "name": "s"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let payload = stratum::core::PayloadId::generate();
    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/streams/append",
            serde_json::json!({
                "namespace": "ns",
                "name": "s",
                "items": [{"payload_uuid": payload}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let appended = body_json(response).await;
    assert_eq!(appended["first_offset"], 0);

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/streams/commit",
            serde_json::json!({
                "namespace": "ns",
                "name": "s",
                "consumer_group": "g",
                "offset": 0,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/streams/ns/s/committed/g")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["offset"], 0);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/v1/streams/ns/s")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(post_json(
            "/v1/streams/read",
            serde_json::json!({"namespace": "ns", "name": "s"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stats_shape() {
    let (router, _dir) = router();
    let response = router
        .oneshot(
            Request::builder()
                .uri("/v1/admin/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["payloads_ram"], 0);
    assert_eq!(stats["bytes_disk"], 0);
    assert_eq!(stats["active_leases"], 0);
}
