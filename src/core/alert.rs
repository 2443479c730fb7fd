// src/core/alert.rs

//! Alert dispatch for persistent health-check failures.
//!
//! Only the transport named by `REPORT_DST` is wired; anything else
//! (including the `"None"` default) logs the alert and drops it.

use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Payload accepted by the reporting endpoint.
#[derive(Serialize, Debug)]
struct AlertPayload {
    content: String,
    receiver: String,
    auth: String,
}

/// Dispatches alerts describing a broken cluster to the configured sink.
#[derive(Debug, Clone)]
pub struct AlertSender {
    dst: String,
    client: reqwest::Client,
}

impl AlertSender {
    pub fn new(dst: impl Into<String>) -> Self {
        Self {
            dst: dst.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Sends one alert naming the failure and the offending node. Transport
    /// parameters come from the environment so rotation does not require an
    /// agent restart.
    pub async fn send(&self, error_message: &str, error_node: &str) {
        if self.dst != "XIAOLUBAN" {
            warn!(
                dst = %self.dst,
                "no alert transport configured; dropping alert: {} ({})",
                error_message, error_node
            );
            return;
        }

        let Some(url) = std::env::var("LUBAN_URL").ok() else {
            error!("LUBAN_URL is not set; cannot dispatch alert");
            return;
        };
        let cluster = std::env::var("MONITOR_CLUSTER_NAME").unwrap_or_default();
        let payload = AlertPayload {
            content: format!(
                "[FalconFS metadata check] cluster={cluster} reason={error_message} nodes={error_node}"
            ),
            receiver: std::env::var("LUBAN_RECEIVER").unwrap_or_default(),
            auth: std::env::var("LUBAN_TOKEN").unwrap_or_default(),
        };
        if let Ok(body) = serde_json::to_string(&payload) {
            debug!("dispatching alert: {}", body);
        }

        match self.client.post(&url).json(&payload).send().await {
            Ok(res) if res.status().is_success() => {
                info!("alert dispatched for {}", error_node);
            }
            Ok(res) => {
                error!("alert endpoint returned {}", res.status());
            }
            Err(e) => {
                error!("failed to dispatch alert: {}", e);
            }
        }
    }
}
