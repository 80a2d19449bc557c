//! Thread identity resolution
//!
//! Derives the ThreadKey for the open message. Order of preference:
//! 1. `CONVERSATION_ID:<token>` marker embedded in the body
//! 2. The host's native conversation identifier
//! 3. Thread-indexing headers (only where the transport profile enables it)

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::host::MailHost;
use crate::transport::TransportProfile;
use crate::types::error::{NotesError, Result};
use crate::types::{MailItem, ThreadKey};

/// Marker prefix injected into forwarded mail bodies
pub const MARKER_PREFIX: &str = "CONVERSATION_ID:";

/// Length of the conversation root in a Thread-Index header value
const THREAD_INDEX_ROOT_LEN: usize = 22;

/// Where a ThreadKey came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySource {
    BodyMarker,
    ConversationId,
    ThreadIndexHeader,
    ReferencesHeader,
}

/// Result of resolving the open message
#[derive(Debug, Clone)]
pub struct Resolution {
    pub item: MailItem,
    pub key: Option<(ThreadKey, KeySource)>,
}

impl Resolution {
    pub fn thread_key(&self) -> Option<&ThreadKey> {
        self.key.as_ref().map(|(k, _)| k)
    }
}

/// Find the first `CONVERSATION_ID:<token>` marker in a body
pub fn extract_marker(body: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(rel) = body[search_from..].find(MARKER_PREFIX) {
        let token_start = search_from + rel + MARKER_PREFIX.len();
        let token_len = body[token_start..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
            .unwrap_or(body.len() - token_start);
        if token_len > 0 {
            return Some(&body[token_start..token_start + token_len]);
        }
        search_from = token_start;
    }
    None
}

/// Format the marker for a key
pub fn marker_for(key: &ThreadKey) -> String {
    format!("{}{}", MARKER_PREFIX, key.as_str())
}

/// Resolves the ThreadKey of whatever message the host has open
pub struct ThreadResolver {
    host: Arc<dyn MailHost>,
    profile: TransportProfile,
    poll_interval: Duration,
    max_attempts: u32,
}

impl ThreadResolver {
    pub fn new(
        host: Arc<dyn MailHost>,
        profile: TransportProfile,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            host,
            profile,
            poll_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Poll the host until the open item is available
    ///
    /// Fails with `HostNotReady` after `max_attempts` checks. Dropping the
    /// returned future cancels the wait.
    pub async fn wait_for_item(&self) -> Result<MailItem> {
        for attempt in 1..=self.max_attempts {
            if let Some(item) = self.host.current_item().await {
                if attempt > 1 {
                    debug!("Mail item became available after {} checks", attempt);
                }
                return Ok(item);
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        warn!(
            "Mail item not available after {} checks ({:?} interval)",
            self.max_attempts, self.poll_interval
        );
        Err(NotesError::HostNotReady {
            attempts: self.max_attempts,
        })
    }

    /// Wait for the host item and derive its key
    pub async fn resolve(&self) -> Result<Resolution> {
        let item = self.wait_for_item().await?;
        let key = self.key_for_item(&item);

        match &key {
            Some((k, source)) => info!("Resolved thread key {} from {:?}", k, source),
            None => warn!("Open message has no usable conversation identifier"),
        }

        Ok(Resolution { item, key })
    }

    /// Derive a key from an already available item
    pub fn key_for_item(&self, item: &MailItem) -> Option<(ThreadKey, KeySource)> {
        if let Some(token) = extract_marker(&item.body_html) {
            return Some((ThreadKey::new(token), KeySource::BodyMarker));
        }

        if let Some(id) = item.conversation_id.as_deref() {
            let key = ThreadKey::new(id);
            if !key.is_empty() {
                return Some((key, KeySource::ConversationId));
            }
        }

        if self.profile.header_fallback {
            return key_from_headers(item);
        }

        None
    }
}

/// Last-resort key from thread-indexing headers
fn key_from_headers(item: &MailItem) -> Option<(ThreadKey, KeySource)> {
    if let Some(value) = item.header("Thread-Index") {
        match STANDARD.decode(value.trim()) {
            Ok(bytes) if bytes.len() >= THREAD_INDEX_ROOT_LEN => {
                let root = STANDARD.encode(&bytes[..THREAD_INDEX_ROOT_LEN]);
                return Some((ThreadKey::new(root), KeySource::ThreadIndexHeader));
            }
            Ok(bytes) => debug!("Thread-Index too short ({} bytes)", bytes.len()),
            Err(e) => debug!("Thread-Index is not valid base64: {}", e),
        }
    }

    // The first References entry is the thread root
    let root = item
        .header("References")
        .and_then(|refs| refs.split_whitespace().next())
        .map(|id| id.trim_matches(|c| c == '<' || c == '>'))
        .filter(|id| !id.is_empty())?;

    Some((ThreadKey::new(root), KeySource::ReferencesHeader))
}
