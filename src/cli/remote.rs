//! HTTP client for a running chronicle server.
//!
//! Used by `chronicle tail` and `chronicle history`. The live stream is
//! delivered at least once: on a dropped connection the client reconnects
//! with the last sequence it saw and drops replayed frames by event id.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{EventType, LogSeq, StreamEvent, StreamFrame};
use crate::stream::EventBuffer;

/// Events remembered for duplicate suppression
const DEDUP_CAPACITY: usize = 1024;

/// One parsed SSE block
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseBlock {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Parse one `\n\n`-terminated SSE block. Comment-only blocks yield `None`.
pub fn parse_sse_block(block: &str) -> Option<SseBlock> {
    let mut parsed = SseBlock::default();
    let mut data_lines = Vec::new();
    let mut any_field = false;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        any_field = true;
        match field {
            "event" => parsed.event = Some(value.to_string()),
            "id" => parsed.id = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if !any_field {
        return None;
    }
    parsed.data = data_lines.join("\n");
    Some(parsed)
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    events: Vec<StreamFrame>,
}

/// Client for the event endpoints of a chronicle server
pub struct GatewayClient {
    base_url: String,
    client: reqwest::Client,
    reconnect_delay: Duration,
    max_reconnects: u32,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnects: 5,
        }
    }

    /// Recent events of a run, oldest first
    pub async fn history(&self, run_id: Uuid, count: usize) -> Result<Vec<StreamEvent>> {
        let url = format!("{}/runs/{}/events/history", self.base_url, run_id);
        let response = self
            .client
            .get(&url)
            .query(&[("count", count)])
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("History request failed ({}): {}", status, text);
        }

        let body: HistoryResponse = response
            .json()
            .await
            .context("Failed to decode history response")?;
        Ok(body.events.into_iter().map(StreamEvent::from).collect())
    }

    /// Follow a run until the server ends the stream. `on_event` sees each
    /// event once, heartbeats excluded.
    pub async fn tail(
        &self,
        run_id: Uuid,
        from: Option<LogSeq>,
        mut on_event: impl FnMut(&StreamEvent),
    ) -> Result<()> {
        let mut buffer = EventBuffer::new(DEDUP_CAPACITY);
        let mut last_seq = from;
        let mut reconnects = 0u32;

        loop {
            match self
                .follow_once(run_id, last_seq, &mut buffer, &mut on_event)
                .await
            {
                Ok(FollowEnd::StreamEnd) => return Ok(()),
                Ok(FollowEnd::Dropped(seq)) => {
                    last_seq = seq.or(last_seq);
                    warn!(%run_id, "Event stream dropped, reconnecting");
                }
                Err(e) => {
                    if reconnects >= self.max_reconnects {
                        return Err(e);
                    }
                    warn!(%run_id, error = %format!("{:#}", e), "Event stream failed, reconnecting");
                }
            }

            reconnects += 1;
            if reconnects > self.max_reconnects {
                anyhow::bail!("Gave up on run {} after {} reconnects", run_id, self.max_reconnects);
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn follow_once(
        &self,
        run_id: Uuid,
        from: Option<LogSeq>,
        buffer: &mut EventBuffer,
        on_event: &mut impl FnMut(&StreamEvent),
    ) -> Result<FollowEnd> {
        let url = format!("{}/runs/{}/events", self.base_url, run_id);
        let mut request = self.client.get(&url).header("Accept", "text/event-stream");
        if let Some(seq) = from {
            request = request.header("Last-Event-ID", seq.to_string());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Subscribe failed ({}): {}", status, text);
        }

        debug!(%run_id, ?from, "Subscribed");
        let mut last_seq = from;
        let mut pending = String::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(%run_id, error = %e, "Body read failed");
                    return Ok(FollowEnd::Dropped(last_seq));
                }
            };
            pending.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(end) = pending.find("\n\n") {
                let block: String = pending.drain(..end + 2).collect();
                let Some(parsed) = parse_sse_block(&block) else {
                    continue;
                };

                let frame: StreamFrame = serde_json::from_str(&parsed.data)
                    .with_context(|| format!("Malformed frame: {}", parsed.data))?;
                let event = StreamEvent::from(frame);

                match event.event_type {
                    EventType::Heartbeat => continue,
                    EventType::StreamEnd => {
                        on_event(&event);
                        return Ok(FollowEnd::StreamEnd);
                    }
                    _ => {}
                }

                if let Some(seq) = event.log_seq {
                    last_seq = Some(seq);
                }
                if buffer.push(event.clone()) {
                    on_event(&event);
                }
            }
        }

        Ok(FollowEnd::Dropped(last_seq))
    }
}

enum FollowEnd {
    StreamEnd,
    Dropped(Option<LogSeq>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_block() {
        let block = "event: draft_produced\ndata: {\"a\":1}\nid: 7\n\n";
        let parsed = parse_sse_block(block).unwrap();
        assert_eq!(parsed.event.as_deref(), Some("draft_produced"));
        assert_eq!(parsed.id.as_deref(), Some("7"));
        assert_eq!(parsed.data, "{\"a\":1}");

        // Multi-line data joins with newlines
        let parsed = parse_sse_block("data: one\ndata: two\n\n").unwrap();
        assert_eq!(parsed.data, "one\ntwo");

        // Keep-alive comments carry nothing
        assert!(parse_sse_block(": keep-alive\n\n").is_none());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = GatewayClient::new("http://127.0.0.1:8787/");
        assert_eq!(client.base_url, "http://127.0.0.1:8787");
    }
}
