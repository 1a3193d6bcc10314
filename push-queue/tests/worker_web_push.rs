mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use base64::Engine as _;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use push_queue::config::WorkerConfig;
use push_queue::database::models::DeliveryStatusCounts;
use push_queue::database::repositories::SubscriptionStore;
use push_queue::delivery::{WebPushClient, WebPushConfig};
use push_queue::queue::{NotificationPayload, NotificationQueue};
use push_queue::worker::DequeueWorker;

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn device_keys() -> (String, String) {
    let secret = p256::SecretKey::random(&mut OsRng);
    let mut auth = [0u8; 16];
    OsRng.fill_bytes(&mut auth);
    (
        b64(secret.public_key().to_encoded_point(false).as_bytes()),
        b64(&auth),
    )
}

fn web_push_client() -> WebPushClient {
    let signing_key = SigningKey::random(&mut OsRng);
    let config = WebPushConfig::from_keys(
        &b64(signing_key.verifying_key().to_encoded_point(false).as_bytes()),
        &b64(signing_key.to_bytes().as_slice()),
        "mailto:ops@example.com",
    )
    .unwrap();
    WebPushClient::new(config).unwrap()
}

#[derive(Default)]
struct PushService {
    accepted: AtomicUsize,
    rejected: AtomicUsize,
}

async fn accept(State(state): State<Arc<PushService>>) -> StatusCode {
    state.accepted.fetch_add(1, Ordering::SeqCst);
    StatusCode::CREATED
}

async fn gone(State(state): State<Arc<PushService>>) -> StatusCode {
    state.rejected.fetch_add(1, Ordering::SeqCst);
    StatusCode::GONE
}

#[tokio::test]
async fn worker_delivers_and_prunes_dead_endpoints() {
    let service = Arc::new(PushService::default());
    let app = Router::new()
        .route("/push/{id}", post(accept))
        .route("/expired/{id}", post(gone))
        .with_state(service.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (_dir, node) = common::setup().await;
    let live = format!("http://{addr}/push/phone");
    let dead = format!("http://{addr}/expired/old-laptop");
    for endpoint in [&live, &dead] {
        let (p256dh, auth) = device_keys();
        node.store.upsert("erin", endpoint, &p256dh, &auth).await.unwrap();
    }
    node.queue
        .enqueue_single(
            "erin",
            &NotificationPayload::new("Circle invite", "frank added you").with_navigate("/circles"),
        )
        .await
        .unwrap();

    let token = CancellationToken::new();
    let worker = DequeueWorker::new(
        node.queue.clone(),
        node.store.clone(),
        Arc::new(web_push_client()),
        WorkerConfig {
            instance_id: "it-worker".to_string(),
            idle_delay: Duration::from_millis(20),
            ..WorkerConfig::default()
        },
        token.clone(),
    );
    let stats = worker.stats();
    let handle = worker.spawn();

    let expected = DeliveryStatusCounts {
        sent: 1,
        failed: 1,
        ..Default::default()
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while node.queue.status_counts().await.unwrap() != expected {
        assert!(tokio::time::Instant::now() < deadline, "worker did not settle");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    token.cancel();
    handle.await.unwrap();

    assert_eq!(service.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(service.rejected.load(Ordering::SeqCst), 1);

    let remaining = node.store.list_for_user("erin").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].endpoint, live);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.sent, 1);
    assert_eq!(snapshot.gone, 1);
    assert_eq!(snapshot.storage_errors, 0);
}
