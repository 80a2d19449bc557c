pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

use crate::types::error::{NotesError, Result};

/// Characters stripped from the end of a thread key before comparison
const KEY_PADDING: &[char] = &['='];

/// Normalize a raw conversation identifier for comparison
///
/// Trims whitespace, strips trailing padding and case-folds.
pub fn normalize_thread_key(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(KEY_PADDING)
        .trim_end()
        .to_lowercase()
}

/// Identifier correlating comments to one email conversation
///
/// Equality and hashing use the normalized form; the trimmed raw form is
/// what gets written to the store.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadKey(String);

impl ThreadKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    /// Raw (trimmed) key as written to the store
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn normalized(&self) -> String {
        normalize_thread_key(&self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.normalized().is_empty()
    }

    /// Compare against a raw key read back from the store
    pub fn matches(&self, raw: &str) -> bool {
        self.normalized() == normalize_thread_key(raw)
    }
}

impl PartialEq for ThreadKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for ThreadKey {}

impl Hash for ThreadKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Debug for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadKey({})", self.0)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mail client platform reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Mac,
    Web,
    Ios,
    Android,
    Unknown,
}

impl Platform {
    pub fn is_desktop(&self) -> bool {
        matches!(self, Platform::Windows | Platform::Mac)
    }
}

impl FromStr for Platform {
    type Err = NotesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "windows" | "pc" => Ok(Platform::Windows),
            "mac" | "macos" => Ok(Platform::Mac),
            "web" | "officeonline" | "outlookwebapp" => Ok(Platform::Web),
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "unknown" => Ok(Platform::Unknown),
            other => Err(NotesError::InvalidInput(format!("Unknown platform: {}", other))),
        }
    }
}

/// Resource a credential is valid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Audience {
    /// Mail, directory and list-item API
    Collaboration,
    /// Document-store REST API (attachments)
    DocumentStore,
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Audience::Collaboration => f.write_str("collaboration"),
            Audience::DocumentStore => f.write_str("document-store"),
        }
    }
}

/// Bearer credential for one audience
#[derive(Clone)]
pub struct AccessToken {
    pub audience: Audience,
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("audience", &self.audience)
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A mention parsed out of comment markup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionToken {
    pub display_name: String,
    pub recipient_address: String,
    /// Byte offset of the markup span in the source text
    pub start: usize,
    /// Byte offset one past the end of the markup span
    pub end: usize,
}

/// Where an attachment lives in the document store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum AttachmentLocator {
    /// Server-relative path, directly linkable
    RelativePath(String),
    /// Opaque id, bytes require an authenticated fetch
    Opaque(String),
}

impl AttachmentLocator {
    pub fn from_raw(raw: &str) -> Self {
        if raw.starts_with('/') {
            AttachmentLocator::RelativePath(raw.to_string())
        } else {
            AttachmentLocator::Opaque(raw.to_string())
        }
    }
}

/// Attachment owned by one comment record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub file_name: String,
    pub locator: AttachmentLocator,
}

/// A persisted comment, re-read in full on every fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: String,
    pub thread_key: ThreadKey,
    pub author_display_name: String,
    pub body: String,
    pub mentioned_display_names: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default)]
    pub submission_key: Option<String>,
}

/// Separator used for mentioned display names at rest
pub const MENTION_NAME_SEPARATOR: &str = ", ";

/// Join display names for storage
pub fn join_display_names(names: &[String]) -> String {
    names.join(MENTION_NAME_SEPARATOR)
}

/// Split stored display names back into a list
pub fn split_display_names(stored: &str) -> Vec<String> {
    stored
        .split(',')
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
        .collect()
}

/// A comment built client-side, not yet persisted
#[derive(Debug, Clone)]
pub struct NewComment {
    pub thread_key: ThreadKey,
    pub author_display_name: String,
    pub body: String,
    pub mentioned_display_names: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Idempotency key generated per submission attempt
    pub submission_key: String,
}

/// Snapshot of the message currently open in the mail client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailItem {
    pub body_html: String,
    pub conversation_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub user_display_name: String,
    /// Thread-indexing headers, secondary fallback only
    #[serde(default)]
    pub internet_headers: Vec<(String, String)>,
}

impl MailItem {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.internet_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A file queued for upload with a comment
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    /// Read a file from disk into an upload payload
    pub async fn from_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| NotesError::InvalidInput(format!("Not a file path: {:?}", path)))?
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self { file_name, bytes })
    }
}

/// Directory entry offered by the mention picker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub display_name: String,
    pub address: String,
}

impl Person {
    /// Markup inserted into the comment when this person is picked
    pub fn mention_markup(&self) -> String {
        crate::mention::encode(&self.display_name, &self.address)
    }
}
