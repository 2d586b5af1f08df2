// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

//! Server-Sent Events listener for real-time tunnel status updates

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::Response;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::daemon_client::{add_auth_header, create_event_client, DaemonClientConfig};
use crate::types::TunnelEvent;

/// Event listener for daemon SSE stream
pub struct EventListener {
    config: DaemonClientConfig,
}

impl EventListener {
    pub fn new(config: DaemonClientConfig) -> Self {
        Self { config }
    }

    /// Start listening to daemon events.
    /// Reconnects with exponential backoff if the stream drops.
    pub async fn listen(&self) -> Result<mpsc::Receiver<TunnelEvent>> {
        let (tx, rx) = mpsc::channel(100);

        let config = self.config.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                match Self::connect(&config).await {
                    Ok(response) => {
                        backoff = Duration::from_secs(1);
                        Self::pump(response, &tx).await;
                    }
                    Err(e) => tracing::warn!("Event stream error: {}", e),
                }

                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        Ok(rx)
    }

    /// Connect once and fail fast. The returned channel closes when the
    /// stream ends.
    pub async fn subscribe_once(&self) -> Result<mpsc::Receiver<TunnelEvent>> {
        let response = Self::connect(&self.config).await?;
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            Self::pump(response, &tx).await;
        });
        Ok(rx)
    }

    async fn connect(config: &DaemonClientConfig) -> Result<Response> {
        let url = format!("{}/api/events", config.daemon_base_url()?);
        let client = create_event_client(config)?;
        let request = add_auth_header(client.get(&url), config)?;

        let response = request
            .send()
            .await
            .context("Failed to connect to event stream")?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            anyhow::bail!("Event stream rejected: 401 Unauthorized (check auth_token)");
        }
        if !response.status().is_success() {
            anyhow::bail!("Event stream request failed: {}", response.status());
        }
        Ok(response)
    }

    async fn pump(response: Response, tx: &mpsc::Sender<TunnelEvent>) {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Error reading event stream: {}", e);
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            // axum may terminate lines with \r\n
            if buffer.contains('\r') {
                buffer = buffer.replace("\r\n", "\n");
            }

            while let Some(pos) = buffer.find("\n\n") {
                let message: String = buffer.drain(..pos + 2).collect();
                tracing::debug!("Raw SSE message: {:?}", message);

                if let Some(event) = Self::parse_sse_message(&message) {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("Receiver dropped, stopping event listener");
                        return;
                    }
                }
            }
        }
    }

    /// Parse an SSE message into a TunnelEvent
    fn parse_sse_message(message: &str) -> Option<TunnelEvent> {
        for line in message.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str::<TunnelEvent>(data) {
                Ok(event) => return Some(event),
                Err(e) => tracing::warn!("Failed to parse SSE event: {} (error: {})", data, e),
            }
        }
        None
    }
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new(DaemonClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_message() {
        let message = "event: tunnel_status\ndata: {\"type\":\"tunnel_status\",\"name\":\"office\",\"active\":true,\"success\":true,\"timestamp\":\"2025-01-01T00:00:00Z\"}\n";
        match EventListener::parse_sse_message(message) {
            Some(TunnelEvent::TunnelStatus { name, active, success, error, .. }) => {
                assert_eq!(name, "office");
                assert!(active);
                assert!(success);
                assert!(error.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignores_comments_and_garbage() {
        assert!(EventListener::parse_sse_message(": keep-alive\n").is_none());
        assert!(EventListener::parse_sse_message("data: {not json}\n").is_none());
        assert!(matches!(
            EventListener::parse_sse_message(
                "data:{\"type\":\"heartbeat\",\"timestamp\":\"2025-01-01T00:00:00Z\"}"
            ),
            Some(TunnelEvent::Heartbeat { .. })
        ));
    }
}
