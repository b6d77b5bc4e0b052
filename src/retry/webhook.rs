use crate::retry::DeliveryAttempts;
use serde::{Deserialize, Serialize};

/// Default attempt limit for a webhook delivery.
pub const DEFAULT_WEBHOOK_MAX_ATTEMPTS: u32 = 5;

/// Retry context for an outbound webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Id of the delivery log record being retried.
    pub log_id: String,
    pub project_id: String,
    pub url: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    DEFAULT_WEBHOOK_MAX_ATTEMPTS
}

impl WebhookDelivery {
    pub fn new(
        log_id: impl Into<String>,
        project_id: impl Into<String>,
        url: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            log_id: log_id.into(),
            project_id: project_id.into(),
            url: url.into(),
            event_type: event_type.into(),
            payload,
            attempts: 0,
            max_attempts: DEFAULT_WEBHOOK_MAX_ATTEMPTS,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl DeliveryAttempts for WebhookDelivery {
    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exhausts_after_max_attempts() {
        let mut delivery = WebhookDelivery::new("log-1", "p1", "https://hooks.test/in", "room.ended", json!({}));
        for _ in 0..DEFAULT_WEBHOOK_MAX_ATTEMPTS {
            assert!(!delivery.is_exhausted());
            delivery.record_attempt();
        }
        assert!(delivery.is_exhausted());
    }

    #[test]
    fn deserializes_with_defaults() {
        let delivery: WebhookDelivery = serde_json::from_value(json!({
            "log_id": "log-2",
            "project_id": "p1",
            "url": "https://hooks.test/in",
            "event_type": "participant.left",
            "payload": { "room": "r1" }
        }))
        .unwrap();
        assert_eq!(delivery.attempts, 0);
        assert_eq!(delivery.max_attempts, 5);
    }
}
