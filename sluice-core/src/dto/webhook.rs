//! Webhook response body

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the receiver did with an authenticated delivery
///
/// Every variant is returned with HTTP 200 so senders do not retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookResponse {
    /// A run was admitted
    Accepted { run_id: Uuid },
    /// The event does not concern the deployment branch
    Ignored { reason: String },
    /// The delivery id was already processed within the retention window
    Duplicate,
}
