//! Event-stream reader for the gateway leg.
//!
//! Consumes the gateway's SSE stream line by line and splits it into two
//! kinds of records: endpoint announcements (fed to the resolver, never
//! queued) and message payloads (queued inbound). Anything unrecognized is
//! queued as-is with a warning rather than dropped.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

use crate::endpoint::EndpointResolver;
use crate::error::{BridgeError, BridgeResult};

/// A classified `data:` record from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseRecord {
    /// The gateway named a reply-submission path.
    Announcement {
        path: String,
        correlation_id: Option<String>,
    },
    /// A structured message payload for the relay.
    Message(String),
    /// Unrecognized content; forwarded best-effort.
    Raw(String),
}

/// Classify one `data:` record against the gateway's service root.
#[must_use]
pub fn classify(data: &str, service_root: &str) -> SseRecord {
    let messages_prefix = format!("{service_root}/messages/");
    let message_prefix = format!("{service_root}/message/");

    if data.starts_with(&messages_prefix) || data.starts_with(&message_prefix) {
        return SseRecord::Announcement {
            path: data.to_string(),
            correlation_id: trailing_segment(data).map(str::to_string),
        };
    }
    if !service_root.is_empty() && data.starts_with(&format!("{service_root}/")) {
        return SseRecord::Announcement {
            path: data.to_string(),
            correlation_id: None,
        };
    }
    if serde_json::from_str::<serde_json::Value>(data).is_ok() {
        return SseRecord::Message(data.to_string());
    }
    if data.starts_with('/') {
        // Looks like a path the gateway wants us to post to.
        return SseRecord::Announcement {
            path: data.to_string(),
            correlation_id: None,
        };
    }
    SseRecord::Raw(data.to_string())
}

fn trailing_segment(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next()?;
    if segment.is_empty() { None } else { Some(segment) }
}

/// Accumulates stream chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

/// Extract the payload of a `data:` line, if the line is one.
fn data_payload(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?;
    Some(payload.strip_prefix(' ').unwrap_or(payload))
}

/// Read the event stream until shutdown, receiver drop, or stream end.
///
/// Announcements go to the resolver; everything else is queued inbound.
///
/// # Errors
///
/// Returns `BridgeError::Transport` when the stream ends and the transparent
/// HTTP error when it fails mid-read, so the session loop treats the leg as
/// dropped either way.
pub async fn run_stream(
    response: reqwest::Response,
    resolver: Arc<Mutex<EndpointResolver>>,
    inbound: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) -> BridgeResult<()> {
    let service_root = resolver.lock().await.service_root().to_string();
    let mut stream = response.bytes_stream();
    let mut buffer = LineBuffer::default();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let chunk: Bytes = tokio::select! {
            changed = shutdown.changed() => {
                // A closed channel means the bridge is gone.
                if changed.is_err() {
                    return Ok(());
                }
                continue;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(BridgeError::Transport("gateway event stream ended".into())),
            },
        };

        buffer.push(&chunk);
        while let Some(line) = buffer.next_line() {
            let Some(data) = data_payload(&line) else {
                continue;
            };
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            match classify(data, &service_root) {
                SseRecord::Announcement {
                    path,
                    correlation_id,
                } => {
                    debug!(path = %path, id = ?correlation_id, "stored gateway endpoint");
                    resolver
                        .lock()
                        .await
                        .record(&path, correlation_id.as_deref());
                }
                SseRecord::Message(payload) => {
                    if inbound.send(payload).await.is_err() {
                        debug!("inbound receiver dropped, stopping event stream");
                        return Ok(());
                    }
                }
                SseRecord::Raw(payload) => {
                    warn!(data = %crate::envelope::preview(&payload), "unrecognized event-stream record, forwarding as-is");
                    if inbound.send(payload).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/mcp_server";

    #[test]
    fn per_id_announcement_extracts_correlation_id() {
        let record = classify("/mcp_server/messages/7", ROOT);
        assert_eq!(
            record,
            SseRecord::Announcement {
                path: "/mcp_server/messages/7".into(),
                correlation_id: Some("7".into()),
            }
        );

        let record = classify("/mcp_server/message/abc123", ROOT);
        assert!(matches!(
            record,
            SseRecord::Announcement { correlation_id: Some(id), .. } if id == "abc123"
        ));
    }

    #[test]
    fn service_root_announcement_has_no_id() {
        let record = classify("/mcp_server/sess/xyz", ROOT);
        assert_eq!(
            record,
            SseRecord::Announcement {
                path: "/mcp_server/sess/xyz".into(),
                correlation_id: None,
            }
        );
    }

    #[test]
    fn json_payload_is_a_message() {
        let data = r#"{"jsonrpc":"2.0","id":1,"result":{}}"#;
        assert_eq!(classify(data, ROOT), SseRecord::Message(data.into()));
    }

    #[test]
    fn bare_path_outside_root_is_generic_announcement() {
        let record = classify("/other/messages/1", ROOT);
        assert!(matches!(
            record,
            SseRecord::Announcement { correlation_id: None, .. }
        ));
    }

    #[test]
    fn unparseable_record_is_raw() {
        assert_eq!(
            classify("hello world", ROOT),
            SseRecord::Raw("hello world".into())
        );
    }

    #[test]
    fn announcements_are_never_messages() {
        // An announcement must not be queued even though it is a plain string.
        let record = classify("/mcp_server/messages/9", ROOT);
        assert!(!matches!(record, SseRecord::Message(_) | SseRecord::Raw(_)));
    }

    #[test]
    fn line_buffer_splits_across_chunks() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"data: one\ndata: tw");
        assert_eq!(buffer.next_line().as_deref(), Some("data: one"));
        assert_eq!(buffer.next_line(), None);

        buffer.push(b"o\r\n");
        assert_eq!(buffer.next_line().as_deref(), Some("data: two"));
    }

    #[test]
    fn data_prefix_with_and_without_space() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload(": keep-alive comment"), None);
        assert_eq!(data_payload("event: endpoint"), None);
    }
}
