//! Webhook Receiver
//!
//! Authenticates push notifications, filters them to the deployment branch
//! and turns each distinct delivery into exactly one run request. Never waits
//! for the run itself.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sluice_core::domain::run::{ImageRef, RunTrigger, SourceRef};
use sluice_core::dto::webhook::WebhookResponse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use super::scheduler::{RunRequest, RunScheduler, SchedulerError};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing signature")]
    MissingSignature,

    #[error("signature mismatch")]
    InvalidSignature,

    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("failed to submit run: {0}")]
    Submit(#[from] SchedulerError),
}

/// One inbound delivery, as read off the HTTP request
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub id: Option<&'a str>,
    pub event: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    #[serde(default)]
    deleted: bool,
    repository: PushRepository,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    clone_url: String,
}

/// Delivery ids seen within the retention window
pub struct DeliveryLog {
    retention: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl DeliveryLog {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records `id`, returning false if it was already seen
    ///
    /// Check and insert happen under one lock, so concurrent duplicates
    /// have exactly one winner.
    pub fn claim(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen();
        seen.retain(|_, at| now.duration_since(*at) < self.retention);

        if seen.contains_key(id) {
            return false;
        }
        seen.insert(id.to_string(), now);
        true
    }

    /// Forgets `id` so a redelivery is processed again
    pub fn release(&self, id: &str) {
        self.seen().remove(id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen().len()
    }

    fn seen(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Verifies a `sha256=<hex>` HMAC signature over the raw body
///
/// The comparison is constant-time.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> Result<(), WebhookError> {
    let hex_signature = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(WebhookError::InvalidSignature)?;
    let signature = hex::decode(hex_signature).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| WebhookError::InvalidSignature)
}

pub struct WebhookReceiver {
    secret: Vec<u8>,
    branch: String,
    image_repository: String,
    deliveries: DeliveryLog,
    scheduler: RunScheduler,
}

impl WebhookReceiver {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        branch: impl Into<String>,
        image_repository: impl Into<String>,
        retention: Duration,
        scheduler: RunScheduler,
    ) -> Self {
        Self {
            secret: secret.into(),
            branch: branch.into(),
            image_repository: image_repository.into(),
            deliveries: DeliveryLog::new(retention),
            scheduler,
        }
    }

    /// Handles one delivery
    ///
    /// Nothing happens before the signature checks out; a bad signature
    /// leaves no trace beyond the log line.
    pub async fn receive(&self, delivery: Delivery<'_>) -> Result<WebhookResponse, WebhookError> {
        let delivery_id = delivery.id.unwrap_or("-");

        let signature = delivery.signature.ok_or_else(|| {
            warn!("Webhook delivery {} rejected: no signature", delivery_id);
            WebhookError::MissingSignature
        })?;
        if let Err(e) = verify_signature(&self.secret, delivery.body, signature) {
            warn!("Webhook delivery {} rejected: {}", delivery_id, e);
            return Err(e);
        }

        if let Some(event) = delivery.event.filter(|event| *event != "push") {
            info!("Webhook delivery {} ignored: {} event", delivery_id, event);
            return Ok(WebhookResponse::Ignored {
                reason: format!("{} events do not trigger runs", event),
            });
        }

        let id = delivery
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| WebhookError::Malformed("missing delivery id".to_string()))?;

        let push: PushEvent = serde_json::from_slice(delivery.body)
            .map_err(|e| WebhookError::Malformed(e.to_string()))?;

        let branch = push.git_ref.strip_prefix("refs/heads/");
        if branch != Some(self.branch.as_str()) {
            info!(
                "Webhook delivery {} ignored: {} is not {}",
                id, push.git_ref, self.branch
            );
            return Ok(WebhookResponse::Ignored {
                reason: format!("{} is not the deployment branch", push.git_ref),
            });
        }

        if push.deleted || push.after.chars().all(|c| c == '0') {
            info!("Webhook delivery {} ignored: branch deleted", id);
            return Ok(WebhookResponse::Ignored {
                reason: "branch deletion".to_string(),
            });
        }

        if !self.deliveries.claim(id) {
            info!("Webhook delivery {} ignored: duplicate", id);
            return Ok(WebhookResponse::Duplicate);
        }

        let request = RunRequest {
            source: SourceRef {
                repository: push.repository.clone_url,
                revision: push.after.clone(),
            },
            image: ImageRef {
                repository: self.image_repository.clone(),
                tag: None,
            },
            trigger: RunTrigger::Webhook {
                delivery_id: id.to_string(),
            },
        };

        match self.scheduler.submit(request).await {
            Ok(run_id) => {
                info!(
                    "Webhook delivery {} accepted: {} at {} -> run {}",
                    id, self.branch, push.after, run_id
                );
                Ok(WebhookResponse::Accepted { run_id })
            }
            Err(e) => {
                self.deliveries.release(id);
                warn!("Webhook delivery {} failed to submit: {}", id, e);
                Err(e.into())
            }
        }
    }
}
