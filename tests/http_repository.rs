use std::time::Duration;

use driver_dispatch::error::AppError;
use driver_dispatch::models::offer::DeclineReason;
use driver_dispatch::models::order::{DriverAction, OrderStatus};
use driver_dispatch::models::presence::{GeoPoint, PresenceStatus};
use driver_dispatch::repository::OrderRepository;
use driver_dispatch::repository::http::HttpOrderRepository;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn repository(server: &MockServer) -> HttpOrderRepository {
    HttpOrderRepository::new(
        server.uri(),
        Some("driver-token".to_string()),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn order_body(order_id: Uuid, status: &str) -> serde_json::Value {
    json!({
        "order_id": order_id,
        "status": status,
        "driver_assigned_at": "2026-03-01T12:00:00Z",
        "arrived_at_restaurant_at": null,
        "picked_up_at": null,
        "delivered_at": null,
        "updated_at": "2026-03-01T12:00:00Z"
    })
}

#[tokio::test]
async fn accept_parses_the_claimed_order() {
    let server = MockServer::start().await;
    let assignment_id = Uuid::new_v4();
    let order_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/assignments/{assignment_id}/accept")))
        .and(header("authorization", "Bearer driver-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_body(order_id, "ACCEPTED")))
        .expect(1)
        .mount(&server)
        .await;

    let order = repository(&server)
        .accept_assignment_offer(assignment_id)
        .await
        .unwrap();

    assert_eq!(order.order_id, order_id);
    assert_eq!(order.status, OrderStatus::Preparing);
    assert!(order.snapshot.is_none());
}

#[tokio::test]
async fn accept_conflict_means_someone_else_won() {
    let server = MockServer::start().await;
    let assignment_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/assignments/{assignment_id}/accept")))
        .respond_with(ResponseTemplate::new(409).set_body_string("order already assigned"))
        .mount(&server)
        .await;

    let err = repository(&server)
        .accept_assignment_offer(assignment_id)
        .await
        .unwrap_err();

    assert_eq!(err, AppError::AssignmentUnavailable { assignment_id });
}

#[tokio::test]
async fn rejected_pickup_is_a_stage_error() {
    let server = MockServer::start().await;
    let order_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/orders/{order_id}/pickup")))
        .respond_with(ResponseTemplate::new(422).set_body_string("order is not ready"))
        .mount(&server)
        .await;

    let err = repository(&server).pickup_order(order_id).await.unwrap_err();

    match err {
        AppError::InvalidStageTransition { action, reason, .. } => {
            assert_eq!(action, DriverAction::PickUp);
            assert_eq!(reason, "order is not ready");
        }
        other => panic!("expected stage error, got {other:?}"),
    }
}

#[tokio::test]
async fn unavailable_backend_is_a_network_error() {
    let server = MockServer::start().await;
    let driver_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/drivers/{driver_id}/heartbeat")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = repository(&server)
        .send_heartbeat(driver_id, None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Network(_)));
}

#[tokio::test]
async fn server_error_on_accept_is_retryable() {
    let server = MockServer::start().await;
    let assignment_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/assignments/{assignment_id}/accept")))
        .respond_with(ResponseTemplate::new(500).set_body_string("database unavailable"))
        .mount(&server)
        .await;

    let err = repository(&server)
        .accept_assignment_offer(assignment_id)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Network(_)), "got {err:?}");
}

#[tokio::test]
async fn no_content_means_no_active_order() {
    let server = MockServer::start().await;
    let driver_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path(format!("/drivers/{driver_id}/active-order")))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let order = repository(&server)
        .fetch_active_order(driver_id)
        .await
        .unwrap();

    assert!(order.is_none());
}

#[tokio::test]
async fn active_order_is_parsed_when_present() {
    let server = MockServer::start().await;
    let driver_id = Uuid::new_v4();
    let order_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path(format!("/drivers/{driver_id}/active-order")))
        .respond_with(ResponseTemplate::new(200).set_body_json(order_body(order_id, "READY")))
        .mount(&server)
        .await;

    let order = repository(&server)
        .fetch_active_order(driver_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(order.order_id, order_id);
    assert_eq!(order.status, OrderStatus::Ready);
}

#[tokio::test]
async fn driver_state_carries_status_and_location() {
    let server = MockServer::start().await;
    let driver_id = Uuid::new_v4();

    Mock::given(method("PUT"))
        .and(path(format!("/drivers/{driver_id}/state")))
        .and(body_json(json!({
            "status": "ONLINE",
            "location": { "lat": 52.52, "lng": 13.405 }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    repository(&server)
        .update_driver_state(
            driver_id,
            PresenceStatus::Online,
            Some(GeoPoint {
                lat: 52.52,
                lng: 13.405,
            }),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn decline_sends_the_reason() {
    let server = MockServer::start().await;
    let assignment_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/assignments/{assignment_id}/decline")))
        .and(body_json(json!({ "reason": "too_far" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    repository(&server)
        .decline_assignment_offer(assignment_id, DeclineReason::TooFar)
        .await
        .unwrap();
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let repository =
        HttpOrderRepository::new(uri, None, Duration::from_millis(500)).unwrap();
    let err = repository
        .send_heartbeat(Uuid::new_v4(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Network(_)));
}
