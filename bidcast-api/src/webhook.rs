//! Project start/stop notifications.
//!
//! Plain GET requests against each endpoint's configured webhook. HTTP 200
//! counts as delivered; anything else is logged and forgotten. Both start
//! and stop carry the literal `status=1` for receiver compatibility.

use std::time::Duration;
use tracing::{info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookNotifier {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("webhook client construction cannot fail");
        Self { client }
    }

    /// `GET <request_url>?roomId=<room>&pushUrl=<url>&status=1`
    pub async fn notify_start(&self, request_url: &str, room_id: &str, push_url: &str) {
        if request_url.is_empty() {
            return;
        }
        let url = format!("{request_url}?roomId={room_id}&pushUrl={push_url}&status=1");
        self.fire(&url).await;
    }

    /// `GET <request_url>?roomId=<room>&pushId=<id>&status=1`
    pub async fn notify_stop(&self, request_url: &str, room_id: &str, push_id: i32) {
        if request_url.is_empty() {
            return;
        }
        let url = format!("{request_url}?roomId={room_id}&pushId={push_id}&status=1");
        self.fire(&url).await;
    }

    async fn fire(&self, url: &str) {
        match self.client.get(url).send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                info!(%url, "webhook delivered");
            }
            Ok(response) => {
                warn!(%url, status = %response.status(), "webhook rejected");
            }
            Err(err) => {
                warn!(%url, %err, "webhook failed");
            }
        }
    }
}
