//! Webhook delivery of job notifications.

use backup_engine::notify::{Notification, Notifier};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Discord rejects longer `content` fields.
const MAX_CONTENT_CHARS: usize = 2000;

pub fn webhook_payload(notification: &Notification) -> Value {
    let mut content = notification.to_string();
    if content.chars().count() > MAX_CONTENT_CHARS {
        content = content.chars().take(MAX_CONTENT_CHARS - 3).collect::<String>() + "...";
    }
    json!({
        "content": content,
        "event": notification.event(),
        "details": notification,
    })
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        info!(event = notification.event(), "{notification}");
        let payload = webhook_payload(&notification);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(event = notification.event(), "No runtime available, webhook not sent");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let event = notification.event();
        handle.spawn(async move {
            match client
                .post(&url)
                .json(&payload)
                .send()
                .await
                .and_then(|r| r.error_for_status())
            {
                Ok(_) => debug!(event, "Webhook delivered"),
                Err(e) => warn!(event, error = %e, "Webhook delivery failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_text_and_event() {
        let n = Notification::BackupFailed {
            triggered_by: "scheduled".to_string(),
            error_kind: "insufficient_space".to_string(),
            error: "Insufficient space: available 1 B".to_string(),
            duration_secs: 3,
        };
        let payload = webhook_payload(&n);
        assert_eq!(payload["event"], "backup_failed");
        assert!(payload["content"].as_str().unwrap().contains("Insufficient space"));
        assert_eq!(payload["details"]["error_kind"], "insufficient_space");
    }

    #[test]
    fn test_content_truncated() {
        let n = Notification::BackupFailed {
            triggered_by: "scheduled".to_string(),
            error_kind: "transfer".to_string(),
            error: "x".repeat(5000),
            duration_secs: 3,
        };
        let content = webhook_payload(&n)["content"].as_str().unwrap().to_string();
        assert_eq!(content.chars().count(), MAX_CONTENT_CHARS);
        assert!(content.ends_with("..."));
    }
}
