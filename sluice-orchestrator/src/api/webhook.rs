//! Webhook API Handler
//!
//! Reads the raw body untouched: the signature covers the exact bytes sent.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use sluice_core::dto::webhook::WebhookResponse;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::Delivery;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const EVENT_HEADER: &str = "x-github-event";

/// POST /webhook
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let delivery = Delivery {
        id: header(DELIVERY_HEADER),
        event: header(EVENT_HEADER),
        signature: header(SIGNATURE_HEADER),
        body: &body,
    };

    let response = state.webhook.receive(delivery).await?;
    Ok(Json(response))
}
