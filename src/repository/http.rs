use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::offer::DeclineReason;
use crate::models::order::{ActiveOrder, CancellationReason, DeliveryProof, DriverAction};
use crate::models::presence::{GeoPoint, PresenceStatus};
use crate::repository::OrderRepository;

#[derive(Debug, Clone, Copy)]
enum Call {
    Accept(Uuid),
    Decline,
    Stage(DriverAction),
    DriverState,
    Heartbeat,
    FetchActive,
}

impl Call {
    fn label(self) -> &'static str {
        match self {
            Call::Accept(_) => "accept_assignment_offer",
            Call::Decline => "decline_assignment_offer",
            Call::Stage(DriverAction::ArriveAtRestaurant) => "arrive_at_restaurant",
            Call::Stage(DriverAction::PickUp) => "pickup_order",
            Call::Stage(DriverAction::StartDelivery) => "start_delivery",
            Call::Stage(DriverAction::CompleteDelivery) => "complete_delivery",
            Call::Stage(DriverAction::Cancel) => "cancel_order",
            Call::Stage(DriverAction::StartNavigation) => "start_navigation",
            Call::DriverState => "update_driver_state",
            Call::Heartbeat => "send_heartbeat",
            Call::FetchActive => "fetch_active_order",
        }
    }
}

/// REST client for the dispatch backend.
pub struct HttpOrderRepository {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpOrderRepository {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Internal(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, call: Call, request: RequestBuilder) -> Result<Response, AppError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| transport_failure(call, err))?;

        let status = response.status();
        debug!(call = call.label(), status = %status, "repository responded");

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_failure(call, status, body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        call: Call,
        request: RequestBuilder,
    ) -> Result<T, AppError> {
        let response = self.send(call, request).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| AppError::Backend(format!("{} returned invalid body: {err}", call.label())))
    }

    async fn order_action<B: Serialize + ?Sized>(
        &self,
        action: DriverAction,
        path: String,
        body: &B,
    ) -> Result<ActiveOrder, AppError> {
        let request = self.client.post(self.url(&path)).json(body);
        self.send_json(Call::Stage(action), request).await
    }
}

fn transport_failure(call: Call, err: reqwest::Error) -> AppError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        AppError::Network(format!("{} failed: {err}", call.label()))
    } else {
        AppError::Backend(format!("{} failed: {err}", call.label()))
    }
}

fn status_failure(call: Call, status: StatusCode, body: String) -> AppError {
    match (call, status.as_u16()) {
        (Call::Accept(assignment_id), 404 | 409 | 410) => {
            AppError::AssignmentUnavailable { assignment_id }
        }
        (Call::Stage(action), 409 | 422) => AppError::stage_blocked(None, action, body),
        (_, 404) => AppError::NotFound(format!("{}: {body}", call.label())),
        // retryable: the request may not have been applied
        (_, 408 | 500..=599) => {
            AppError::Network(format!("{} failed with {status}", call.label()))
        }
        _ => AppError::Backend(format!("{} failed with {status}: {body}", call.label())),
    }
}

#[async_trait]
impl OrderRepository for HttpOrderRepository {
    async fn accept_assignment_offer(&self, assignment_id: Uuid) -> Result<ActiveOrder, AppError> {
        let request = self
            .client
            .post(self.url(&format!("/assignments/{assignment_id}/accept")));
        self.send_json(Call::Accept(assignment_id), request).await
    }

    async fn decline_assignment_offer(
        &self,
        assignment_id: Uuid,
        reason: DeclineReason,
    ) -> Result<(), AppError> {
        let request = self
            .client
            .post(self.url(&format!("/assignments/{assignment_id}/decline")))
            .json(&json!({ "reason": reason }));
        self.send(Call::Decline, request).await.map(|_| ())
    }

    async fn arrive_at_restaurant(&self, order_id: Uuid) -> Result<ActiveOrder, AppError> {
        self.order_action(
            DriverAction::ArriveAtRestaurant,
            format!("/orders/{order_id}/arrive"),
            &json!({}),
        )
        .await
    }

    async fn pickup_order(&self, order_id: Uuid) -> Result<ActiveOrder, AppError> {
        self.order_action(
            DriverAction::PickUp,
            format!("/orders/{order_id}/pickup"),
            &json!({}),
        )
        .await
    }

    async fn start_delivery(&self, order_id: Uuid) -> Result<ActiveOrder, AppError> {
        self.order_action(
            DriverAction::StartDelivery,
            format!("/orders/{order_id}/start-delivery"),
            &json!({}),
        )
        .await
    }

    async fn complete_delivery(
        &self,
        order_id: Uuid,
        proof: Option<DeliveryProof>,
    ) -> Result<ActiveOrder, AppError> {
        self.order_action(
            DriverAction::CompleteDelivery,
            format!("/orders/{order_id}/complete"),
            &json!({ "proof": proof }),
        )
        .await
    }

    async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: CancellationReason,
    ) -> Result<(), AppError> {
        let request = self
            .client
            .post(self.url(&format!("/orders/{order_id}/cancel")))
            .json(&json!({ "reason": reason }));
        self.send(Call::Stage(DriverAction::Cancel), request)
            .await
            .map(|_| ())
    }

    async fn update_driver_state(
        &self,
        driver_id: Uuid,
        status: PresenceStatus,
        location: Option<GeoPoint>,
    ) -> Result<(), AppError> {
        let request = self
            .client
            .put(self.url(&format!("/drivers/{driver_id}/state")))
            .json(&json!({ "status": status, "location": location }));
        self.send(Call::DriverState, request).await.map(|_| ())
    }

    async fn send_heartbeat(
        &self,
        driver_id: Uuid,
        location: Option<GeoPoint>,
    ) -> Result<(), AppError> {
        let request = self
            .client
            .post(self.url(&format!("/drivers/{driver_id}/heartbeat")))
            .json(&json!({ "location": location }));
        self.send(Call::Heartbeat, request).await.map(|_| ())
    }

    async fn fetch_active_order(&self, driver_id: Uuid) -> Result<Option<ActiveOrder>, AppError> {
        let request = self
            .client
            .get(self.url(&format!("/drivers/{driver_id}/active-order")));

        let response = match self.send(Call::FetchActive, request).await {
            Ok(response) => response,
            Err(AppError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        response
            .json::<Option<ActiveOrder>>()
            .await
            .map_err(|err| AppError::Backend(format!("fetch_active_order returned invalid body: {err}")))
    }
}
