//! Reply-endpoint bookkeeping for the session-scoped gateway leg.
//!
//! The gateway announces, over its event stream, the path each reply must be
//! posted to — sometimes one path per in-flight correlation id, sometimes a
//! session-wide path. The resolver tracks those announcements and turns a
//! correlation id into an ordered ladder of candidate paths, so a send can
//! always be attempted even when the gateway has rotated endpoints mid-flight.

use std::collections::HashMap;

use url::Url;

use crate::error::{BridgeError, BridgeResult};

/// Tracks announced reply endpoints for one gateway session.
///
/// Single writer (the event-stream reader), single reader (the send ladder);
/// callers serialize access behind one mutex.
#[derive(Debug)]
pub struct EndpointResolver {
    /// `scheme://host[:port]` of the gateway.
    origin: String,
    /// Directory of the SSE path, for joining relative announcements.
    sse_parent: String,
    /// Gateway service root: the SSE path without its trailing `/sse`.
    service_root: String,
    by_id: HashMap<String, String>,
    latest: Option<String>,
}

impl EndpointResolver {
    /// Build a resolver from the configured SSE URL.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` when the URL cannot be parsed or has no
    /// host.
    pub fn new(gateway_url: &str) -> BridgeResult<Self> {
        let url = Url::parse(gateway_url)
            .map_err(|e| BridgeError::Config(format!("invalid gateway URL: {e}")))?;
        if !url.has_host() {
            return Err(BridgeError::Config(format!(
                "gateway URL has no host: {gateway_url}"
            )));
        }

        let origin = url.origin().ascii_serialization();
        let path = url.path().trim_end_matches('/');
        let service_root = path
            .strip_suffix("/sse")
            .unwrap_or_else(|| parent_of(path))
            .to_string();
        let sse_parent = parent_of(path).to_string();

        Ok(Self {
            origin,
            sse_parent,
            service_root,
            by_id: HashMap::new(),
            latest: None,
        })
    }

    /// The gateway service root path (may be empty when mounted at `/`).
    #[must_use]
    pub fn service_root(&self) -> &str {
        &self.service_root
    }

    /// The well-known fallback path for posts with no usable announcement.
    #[must_use]
    pub fn default_messages_path(&self) -> String {
        format!("{}/messages", self.service_root)
    }

    /// Store an announced endpoint. Always becomes the latest; also mapped
    /// to `correlation_id` when one was named.
    pub fn record(&mut self, path: &str, correlation_id: Option<&str>) {
        if let Some(id) = correlation_id {
            self.by_id.insert(id.to_string(), path.to_string());
        }
        self.latest = Some(path.to_string());
    }

    /// Resolve a correlation id to a single path: exact match, then the
    /// latest announcement, then the well-known default. Never fails.
    #[must_use]
    pub fn resolve(&self, correlation_id: Option<&str>) -> String {
        correlation_id
            .and_then(|id| self.by_id.get(id))
            .or(self.latest.as_ref())
            .cloned()
            .unwrap_or_else(|| self.default_messages_path())
    }

    /// The send-strategy ladder for a correlation id: per-id endpoint,
    /// latest endpoint, generic messages endpoint, base service endpoint —
    /// deduplicated, in that order.
    #[must_use]
    pub fn candidates(&self, correlation_id: Option<&str>) -> Vec<String> {
        let mut ladder = Vec::with_capacity(4);
        let mut push = |path: String| {
            if !ladder.contains(&path) {
                ladder.push(path);
            }
        };

        if let Some(path) = correlation_id.and_then(|id| self.by_id.get(id)) {
            push(path.clone());
        }
        if let Some(path) = &self.latest {
            push(path.clone());
        }
        push(self.default_messages_path());
        push(self.base_service_path());
        ladder
    }

    /// Drop the per-id mapping once its reply has been delivered.
    pub fn mark_delivered(&mut self, correlation_id: &str) {
        self.by_id.remove(correlation_id);
    }

    /// Forget every announcement. Called when the gateway signals that the
    /// session-scoped endpoints are stale.
    pub fn invalidate(&mut self) {
        self.by_id.clear();
        self.latest = None;
    }

    /// Build the full URL for an announced path. Absolute paths join against
    /// the gateway origin; relative ones against the SSE URL's directory.
    #[must_use]
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.origin)
        } else {
            format!("{}{}/{path}", self.origin, self.sse_parent)
        }
    }

    fn base_service_path(&self) -> String {
        if self.service_root.is_empty() {
            "/".into()
        } else {
            self.service_root.clone()
        }
    }
}

fn parent_of(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}
