use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use driver_dispatch::api::rest::router;
use driver_dispatch::config::SessionConfig;
use driver_dispatch::engine::session::SessionDeps;
use driver_dispatch::models::events::InboundEvent;
use driver_dispatch::models::offer::{AssignmentOffer, OfferSnapshot, OrderItem, Party};
use driver_dispatch::models::presence::GeoPoint;
use driver_dispatch::observability::metrics::Metrics;
use driver_dispatch::repository::memory::InMemoryOrderRepository;
use driver_dispatch::state::AppState;
use driver_dispatch::transport::loopback::LoopbackFactory;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    app: Router,
    repo: Arc<InMemoryOrderRepository>,
    transports: Arc<LoopbackFactory>,
}

fn setup() -> TestApp {
    let repo = Arc::new(InMemoryOrderRepository::new());
    let transports = Arc::new(LoopbackFactory::new());
    let config = SessionConfig {
        order_poll_interval: None,
        ..SessionConfig::default()
    };
    let state = AppState::new(
        SessionDeps {
            repository: repo.clone(),
            transports: transports.clone(),
        },
        config,
        Arc::new(Metrics::new()),
    );

    TestApp {
        app: router(Arc::new(state)),
        repo,
        transports,
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    empty_request("GET", uri)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn snapshot() -> OfferSnapshot {
    OfferSnapshot {
        restaurant: Party {
            name: "Pizzeria Roma".to_string(),
            address: "Via Appia 3".to_string(),
            location: Some(GeoPoint {
                lat: 41.8902,
                lng: 12.4922,
            }),
            phone: None,
        },
        customer: Party {
            name: "Marco".to_string(),
            address: "Piazza Navona 1".to_string(),
            location: Some(GeoPoint {
                lat: 41.8992,
                lng: 12.4731,
            }),
            phone: None,
        },
        items: vec![OrderItem {
            name: "Margherita".to_string(),
            quantity: 2,
            unit_price_cents: 900,
        }],
        subtotal_cents: 1800,
        delivery_fee_cents: 250,
        total_cents: 2050,
    }
}

/// Opens a session with a location fix and takes the driver online.
async fn online_driver(test: &TestApp) -> Uuid {
    let driver_id = Uuid::new_v4();
    let response = test
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/drivers/{driver_id}/session"),
            json!({
                "location_permission": true,
                "location": { "lat": 41.8950, "lng": 12.4823 }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = test
        .app
        .clone()
        .oneshot(empty_request("POST", &format!("/drivers/{driver_id}/online")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    driver_id
}

fn push_offer(test: &TestApp, driver_id: Uuid, order_id: Uuid, wave: u32) -> AssignmentOffer {
    let offer = test
        .repo
        .publish_offer(driver_id, order_id, wave, Some(Duration::from_secs(30)))
        .unwrap();
    let transport = test.transports.transport(driver_id).unwrap();
    assert!(transport.deliver(InboundEvent::OfferReceived(offer.clone())));
    offer
}

async fn post(test: &TestApp, uri: &str) -> axum::response::Response {
    test.app
        .clone()
        .oneshot(empty_request("POST", uri))
        .await
        .unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let test = setup();
    let response = test.app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["online"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let test = setup();
    online_driver(&test).await;
    let response = test.app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("active_sessions 1"));
}

#[tokio::test]
async fn open_session_returns_offline_connected_view() {
    let test = setup();
    let driver_id = Uuid::new_v4();
    let response = test
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/drivers/{driver_id}/session"),
            json!({ "location_permission": false }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["driver_id"], driver_id.to_string());
    assert_eq!(body["connected"], true);
    assert_eq!(body["presence"]["status"], "OFFLINE");
    assert!(body["offer"].is_null());
    assert!(body["order"].is_null());

    let response = test
        .app
        .oneshot(empty_request("POST", &format!("/drivers/{driver_id}/session")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_driver_returns_404() {
    let test = setup();
    let response = test
        .app
        .oneshot(get_request(&format!("/drivers/{}/presence", Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn going_online_is_reflected_in_presence() {
    let test = setup();
    let driver_id = online_driver(&test).await;

    let response = test
        .app
        .oneshot(get_request(&format!("/drivers/{driver_id}/presence")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["presence"]["status"], "ONLINE");
    assert_eq!(body["presence"]["location_permission_granted"], true);
    assert_eq!(body["health"]["degraded"], false);
}

#[tokio::test]
async fn busy_while_offline_returns_409() {
    let test = setup();
    let driver_id = Uuid::new_v4();
    test.app
        .clone()
        .oneshot(empty_request("POST", &format!("/drivers/{driver_id}/session")))
        .await
        .unwrap();

    let response = post(&test, &format!("/drivers/{driver_id}/busy")).await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["code"], "invalid_presence_transition");
}

#[tokio::test]
async fn offer_is_visible_and_can_be_declined() {
    let test = setup();
    let driver_id = online_driver(&test).await;
    let offer = push_offer(&test, driver_id, test.repo.create_order(snapshot()), 1);

    let response = test
        .app
        .clone()
        .oneshot(get_request(&format!("/drivers/{driver_id}/offer")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(
        body["offer"]["offer"]["assignment_id"],
        offer.assignment_id.to_string()
    );
    assert_eq!(body["offer"]["state"], "PENDING");

    let response = test
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!(
                "/drivers/{driver_id}/offers/{}/decline",
                offer.assignment_id
            ),
            json!({ "reason": "too_far" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["outcome"], "DECLINED");

    let response = post(
        &test,
        &format!("/drivers/{driver_id}/offers/{}/accept", offer.assignment_id),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["code"], "stale_offer");
}

#[tokio::test]
async fn losing_the_race_reads_already_taken() {
    let test = setup();
    let winner = online_driver(&test).await;
    let loser = online_driver(&test).await;

    let order_id = test.repo.create_order(snapshot());
    let winning = push_offer(&test, winner, order_id, 1);
    let losing = push_offer(&test, loser, order_id, 2);

    let response = post(
        &test,
        &format!("/drivers/{winner}/offers/{}/accept", winning.assignment_id),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["stage"], "ASSIGNED");

    let response = post(
        &test,
        &format!("/drivers/{loser}/offers/{}/accept", losing.assignment_id),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"], "already taken");
    assert_eq!(body["code"], "assignment_unavailable");

    let response = test
        .app
        .oneshot(get_request(&format!("/drivers/{winner}/presence")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["presence"]["status"], "BUSY");
}

#[tokio::test]
async fn pickup_before_ready_returns_422() {
    let test = setup();
    let driver_id = online_driver(&test).await;
    let offer = push_offer(&test, driver_id, test.repo.create_order(snapshot()), 1);

    post(
        &test,
        &format!("/drivers/{driver_id}/offers/{}/accept", offer.assignment_id),
    )
    .await;

    let response = post(&test, &format!("/drivers/{driver_id}/order/navigate")).await;
    assert_eq!(body_json(response).await["stage"], "EN_ROUTE_TO_RESTAURANT");
    let response = post(&test, &format!("/drivers/{driver_id}/order/arrive")).await;
    assert_eq!(body_json(response).await["stage"], "WAITING_AT_RESTAURANT");

    let response = post(&test, &format!("/drivers/{driver_id}/order/pickup")).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["code"], "invalid_stage_transition");

    let response = test
        .app
        .oneshot(get_request(&format!("/drivers/{driver_id}/order")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["stage"], "WAITING_AT_RESTAURANT");
    assert_eq!(body["order"]["status"], "PREPARING");
}

#[tokio::test]
async fn cancel_moves_order_to_history() {
    let test = setup();
    let driver_id = online_driver(&test).await;
    let offer = push_offer(&test, driver_id, test.repo.create_order(snapshot()), 1);
    post(
        &test,
        &format!("/drivers/{driver_id}/offers/{}/accept", offer.assignment_id),
    )
    .await;

    let response = test
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/drivers/{driver_id}/order/cancel"),
            json!({ "reason": "vehicle_breakdown" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "CANCELLED");

    let response = test
        .app
        .clone()
        .oneshot(get_request(&format!("/drivers/{driver_id}/history")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["reason"], "cancelled");

    let response = test
        .app
        .oneshot(get_request(&format!("/drivers/{driver_id}/order")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn location_update_reports_distance_to_next_stop() {
    let test = setup();
    let driver_id = online_driver(&test).await;
    let offer = push_offer(&test, driver_id, test.repo.create_order(snapshot()), 1);
    post(
        &test,
        &format!("/drivers/{driver_id}/offers/{}/accept", offer.assignment_id),
    )
    .await;

    let response = test
        .app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/drivers/{driver_id}/location"),
            json!({ "location": { "lat": 41.8902, "lng": 12.4922 } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["next_stop_km"].as_f64().unwrap() < 0.01);

    let response = test
        .app
        .oneshot(json_request(
            "PATCH",
            &format!("/drivers/{driver_id}/location"),
            json!({ "location": { "lat": 200.0, "lng": 12.4922 } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn closing_session_forgets_driver() {
    let test = setup();
    let driver_id = online_driver(&test).await;

    let response = test
        .app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/drivers/{driver_id}/session")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let transport = test.transports.transport(driver_id).unwrap();
    assert!(transport.driver_id().is_some());
    assert!(
        !transport.deliver(InboundEvent::OfferExpired {
            assignment_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
        })
    );

    let response = test
        .app
        .oneshot(get_request(&format!("/drivers/{driver_id}/session")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
