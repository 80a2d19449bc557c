//! Comment sync loop
//!
//! Owns the comment history of the open thread. Fetches on open, on a
//! fixed-interval timer while a thread is known, and after every successful
//! submission.
//!
//! Features:
//! - Fetch sequencing: only the most recently started fetch may publish
//! - Failed fetches keep the previous comments
//! - Submission runs create, upload, notify, refetch in that order

pub mod monitor;

use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attachments::{AttachmentTransfer, Download};
use crate::auth::TokenBroker;
use crate::config::AppConfig;
use crate::host::MailHost;
use crate::mention;
use crate::notify::NotificationDispatcher;
use crate::store::CommentStore;
use crate::sync::monitor::{drain_pending, RefreshMonitor, RefreshTrigger};
use crate::thread::{Resolution, ThreadResolver};
use crate::types::error::{NotesError, Result};
use crate::types::{AttachmentRef, CommentRecord, NewComment, OutgoingFile, ThreadKey};

/// Sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Loading,
    Submitting,
}

/// What the presentation layer renders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub thread_key: Option<ThreadKey>,
    pub comments: Vec<CommentRecord>,
    pub state: SyncState,
    pub loading: bool,
    pub sending: bool,
    pub last_error: Option<String>,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            thread_key: None,
            comments: Vec::new(),
            state: SyncState::Idle,
            loading: false,
            sending: false,
            last_error: None,
            last_refreshed: None,
        }
    }
}

/// Event emitted by the sync loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    CommentsUpdated { count: usize },
    StateChanged(SyncState),
    FetchFailed { message: String },
    SubmitFailed { message: String },
}

/// Result of a submission whose comment was persisted
#[derive(Debug)]
pub struct SubmitOutcome {
    pub record_id: String,
    pub submission_key: String,
    pub uploaded: Vec<String>,
    pub attachment_failures: Vec<NotesError>,
    /// Recipients a notification was sent to
    pub notified: Vec<String>,
    pub notification_error: Option<NotesError>,
}

struct RunningMonitor {
    monitor: Arc<RefreshMonitor>,
    timer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

/// The comment sync loop for one panel
pub struct CommentSync {
    store: CommentStore,
    attachments: AttachmentTransfer,
    notifier: NotificationDispatcher,
    resolver: ThreadResolver,
    refresh_interval: Duration,
    resolution: RwLock<Option<Resolution>>,
    snapshot: Arc<RwLock<SyncSnapshot>>,
    fetch_seq: AtomicU64,
    event_tx: Sender<SyncEvent>,
    monitor: Mutex<Option<RunningMonitor>>,
}

impl CommentSync {
    pub fn new(
        store: CommentStore,
        attachments: AttachmentTransfer,
        notifier: NotificationDispatcher,
        resolver: ThreadResolver,
        refresh_interval: Duration,
    ) -> (Arc<Self>, Receiver<SyncEvent>) {
        let (tx, rx) = flume::unbounded();

        let sync = Self {
            store,
            attachments,
            notifier,
            resolver,
            refresh_interval,
            resolution: RwLock::new(None),
            snapshot: Arc::new(RwLock::new(SyncSnapshot::default())),
            fetch_seq: AtomicU64::new(0),
            event_tx: tx,
            monitor: Mutex::new(None),
        };

        (Arc::new(sync), rx)
    }

    /// Wire up every component from configuration
    ///
    /// The broker is shared with the caller so that other consumers (the
    /// people directory) reuse the same sign-in.
    pub fn from_config(
        config: &AppConfig,
        host: Arc<dyn MailHost>,
        broker: Arc<TokenBroker>,
    ) -> (Arc<Self>, Receiver<SyncEvent>) {
        let profile = config.transport_profile(host.platform());
        info!("Using transport profile {:?}", profile);

        let store = CommentStore::new(&config.store, broker.clone());
        let attachments = AttachmentTransfer::new(&config.store, broker.clone(), profile);
        let notifier = NotificationDispatcher::new(&config.store.graph_base_url, broker);
        let resolver = ThreadResolver::new(
            host,
            profile,
            config.sync.host_poll_interval(),
            config.sync.host_poll_attempts,
        );

        Self::new(
            store,
            attachments,
            notifier,
            resolver,
            config.sync.refresh_interval(),
        )
    }

    pub async fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn thread_key(&self) -> Option<ThreadKey> {
        self.resolution
            .read()
            .await
            .as_ref()
            .and_then(|r| r.thread_key().cloned())
    }

    /// Whether the refresh timer is active
    pub async fn is_polling(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .map(|m| m.monitor.is_running())
            .unwrap_or(false)
    }

    /// Resolve the open message, fetch its comments and start the timer
    ///
    /// Returns the resolved key, or `None` when the message has no usable
    /// identifier (nothing is fetched then).
    pub async fn open(self: &Arc<Self>) -> Result<Option<ThreadKey>> {
        let resolution = self.resolver.resolve().await?;
        let key = resolution.thread_key().cloned();

        *self.resolution.write().await = Some(resolution);
        self.fetch_seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut snapshot = self.snapshot.write().await;
            if snapshot.thread_key != key {
                snapshot.comments.clear();
            }
            snapshot.thread_key = key.clone();
        }

        let Some(key) = key else {
            self.stop_monitor().await;
            self.update_snapshot(|s| {
                s.loading = false;
                s.state = settled_state(s);
            })
            .await;
            return Ok(None);
        };

        if let Err(e) = self.refresh().await {
            warn!("Initial fetch for thread {} failed: {}", key, e);
        }
        self.start_monitor(key.clone()).await;

        Ok(Some(key))
    }

    /// Forget the current thread and stop the timer
    pub async fn clear_thread(&self) {
        info!("Clearing current thread");
        self.stop_monitor().await;
        *self.resolution.write().await = None;
        // Results of fetches still in flight belong to the old thread
        self.fetch_seq.fetch_add(1, Ordering::SeqCst);

        let mut snapshot = self.snapshot.write().await;
        snapshot.thread_key = None;
        snapshot.comments.clear();
        snapshot.loading = false;
        snapshot.state = SyncState::Idle;
    }

    /// Stop the timer; in-flight requests are left to finish
    pub async fn teardown(&self) {
        info!("Tearing down comment sync");
        self.stop_monitor().await;
    }

    /// Fetch the thread's comments with their attachments
    pub async fn refresh(&self) -> Result<()> {
        let Some(key) = self.thread_key().await else {
            debug!("No thread key, skipping refresh");
            return Ok(());
        };

        let seq = self.begin_fetch().await;
        let result = self.fetch(&key).await;
        self.finish_fetch(seq, result).await
    }

    async fn fetch(&self, key: &ThreadKey) -> Result<Vec<CommentRecord>> {
        let mut records = self.store.list(key).await?;
        if records.is_empty() {
            return Ok(records);
        }

        // One document-store token per fetch, so a consent prompt shows at most once
        let token = match self.attachments.document_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    "No document-store token, showing {} comments without attachments: {}",
                    records.len(),
                    e
                );
                return Ok(records);
            }
        };

        for record in records.iter_mut() {
            match self.attachments.list_with(&token, &record.id).await {
                Ok(attachments) => record.attachments = attachments,
                Err(e) => warn!("Failed to list attachments of comment {}: {}", record.id, e),
            }
        }

        Ok(records)
    }

    async fn begin_fetch(&self) -> u64 {
        let seq = self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_snapshot(|s| {
            s.loading = true;
            s.state = SyncState::Loading;
        })
        .await;
        seq
    }

    /// Publish a fetch result unless a newer fetch has started since
    async fn finish_fetch(&self, seq: u64, result: Result<Vec<CommentRecord>>) -> Result<()> {
        if self.fetch_seq.load(Ordering::SeqCst) != seq {
            debug!("Discarding result of superseded fetch #{}", seq);
            return result.map(|_| ());
        }

        match result {
            Ok(comments) => {
                let count = comments.len();
                self.update_snapshot(|s| {
                    s.comments = comments;
                    s.loading = false;
                    s.state = settled_state(s);
                    s.last_error = None;
                    s.last_refreshed = Some(Utc::now());
                })
                .await;
                debug!("Fetch #{} published {} comments", seq, count);
                self.emit_event(SyncEvent::CommentsUpdated { count });
                Ok(())
            }
            Err(e) => {
                warn!("Fetch #{} failed, keeping previous comments: {}", seq, e);
                let message = e.to_string();
                self.update_snapshot(|s| {
                    s.loading = false;
                    s.state = settled_state(s);
                    s.last_error = Some(message.clone());
                })
                .await;
                self.emit_event(SyncEvent::FetchFailed { message });
                Err(e)
            }
        }
    }

    /// Submit a comment with optional attachments
    ///
    /// Only authorization and store-write failures fail the call. Attachment
    /// and notification failures are reported in the outcome.
    pub async fn submit(&self, text: &str, files: Vec<OutgoingFile>) -> Result<SubmitOutcome> {
        if text.trim().is_empty() {
            return Err(NotesError::InvalidInput(
                "Please add a comment before saving".to_string(),
            ));
        }

        let resolution = self.resolution.read().await.clone();
        let Some((item, key)) = resolution
            .and_then(|r| r.thread_key().cloned().map(|k| (r.item, k)))
        else {
            return Err(NotesError::InvalidInput(
                "No conversation is open".to_string(),
            ));
        };

        self.update_snapshot(|s| {
            s.sending = true;
            s.state = SyncState::Submitting;
        })
        .await;

        let extracted = mention::extract(text);
        let comment = NewComment {
            thread_key: key.clone(),
            author_display_name: item.user_display_name.clone(),
            body: extracted.plain_text.clone(),
            mentioned_display_names: extracted.display_names(),
            created_at: Utc::now(),
            submission_key: Uuid::new_v4().to_string(),
        };

        let record_id = match self.store.create(&comment).await {
            Ok(id) => id,
            Err(e) => {
                error!("Submission aborted: {}", e);
                let message = e.to_string();
                self.update_snapshot(|s| {
                    s.sending = false;
                    s.state = settled_state(s);
                    s.last_error = Some(message.clone());
                })
                .await;
                self.emit_event(SyncEvent::SubmitFailed { message });
                return Err(e);
            }
        };

        let report = self.attachments.upload(&record_id, &files).await;

        let recipients = extracted.recipients();
        let mut notified = Vec::new();
        let mut notification_error = None;
        if !recipients.is_empty() {
            match self
                .notifier
                .forward(&item, &recipients, &key, &comment.body)
                .await
            {
                Ok(sent) => notified = sent,
                Err(e) => {
                    warn!("Comment {} saved but notification failed: {}", record_id, e);
                    notification_error = Some(e);
                }
            }
        }

        self.update_snapshot(|s| s.sending = false).await;

        if let Err(e) = self.refresh().await {
            warn!("Refetch after submission failed: {}", e);
        }

        Ok(SubmitOutcome {
            record_id,
            submission_key: comment.submission_key,
            uploaded: report.uploaded,
            attachment_failures: report.failed,
            notified,
            notification_error,
        })
    }

    /// Resolve an attachment of a listed comment
    pub async fn download(&self, record_id: &str, attachment: &AttachmentRef) -> Result<Download> {
        self.attachments.download(record_id, attachment).await
    }

    async fn start_monitor(self: &Arc<Self>, key: ThreadKey) {
        self.stop_monitor().await;

        let (monitor, rx) = RefreshMonitor::new(key, self.refresh_interval);
        let monitor = Arc::new(monitor);

        // Mark before spawning so the loop does not exit immediately
        monitor.mark_running();

        let timer = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.start().await })
        };

        let weak = Arc::downgrade(self);
        let consumer = tokio::spawn(async move {
            while let Ok(trigger) = rx.recv_async().await {
                match trigger {
                    RefreshTrigger::Tick => {
                        if drain_pending(&rx) {
                            break;
                        }
                        let Some(sync) = weak.upgrade() else { break };
                        if let Err(e) = sync.refresh().await {
                            debug!("Timed refresh failed: {}", e);
                        }
                    }
                    RefreshTrigger::Shutdown => break,
                }
            }
        });

        *self.monitor.lock().await = Some(RunningMonitor {
            monitor,
            timer,
            consumer,
        });
    }

    async fn stop_monitor(&self) {
        if let Some(running) = self.monitor.lock().await.take() {
            running.monitor.stop();
            running.timer.abort();
            running.consumer.abort();
        }
    }

    async fn update_snapshot<F>(&self, update_fn: F)
    where
        F: FnOnce(&mut SyncSnapshot),
    {
        let mut snapshot = self.snapshot.write().await;
        let before = snapshot.state;
        update_fn(&mut snapshot);
        if snapshot.state != before {
            self.emit_event(SyncEvent::StateChanged(snapshot.state));
        }
    }

    fn emit_event(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.send(event) {
            debug!("No listener for sync event: {}", e);
        }
    }
}

fn settled_state(snapshot: &SyncSnapshot) -> SyncState {
    if snapshot.sending {
        SyncState::Submitting
    } else {
        SyncState::Idle
    }
}

impl Drop for CommentSync {
    fn drop(&mut self) {
        if let Some(running) = self.monitor.get_mut().take() {
            running.monitor.stop();
            running.timer.abort();
            running.consumer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::FakeIdentity;
    use crate::config::{FilterMode, StoreConfig};
    use crate::host::StaticHost;
    use crate::transport::TransportProfile;
    use crate::types::{MailItem, Platform};
    use httpmock::prelude::*;
    use serde_json::json;

    const ITEMS_PATH: &str = "/v1.0/sites/site-1/lists/list-1/items";
    const DOCUMENT_SCOPE: &str = "https://contoso.sharepoint.com/.default";

    fn mail_item(conversation_id: Option<&str>) -> MailItem {
        MailItem {
            body_html: "<div>Quarterly numbers attached</div>".into(),
            conversation_id: conversation_id.map(|s| s.to_string()),
            subject: "Q3".into(),
            sender: "bob@contoso.com".into(),
            user_display_name: "Ann".into(),
            ..Default::default()
        }
    }

    fn build(server: &MockServer, item: Option<MailItem>) -> (Arc<CommentSync>, Receiver<SyncEvent>) {
        build_with(server, item, Arc::new(FakeIdentity::signed_in("ann@contoso.com")))
    }

    fn build_with(
        server: &MockServer,
        item: Option<MailItem>,
        identity: Arc<FakeIdentity>,
    ) -> (Arc<CommentSync>, Receiver<SyncEvent>) {
        let platform = Platform::Web;
        let profile = TransportProfile::for_platform(platform);
        let broker = Arc::new(TokenBroker::new(identity, &profile, "contoso.sharepoint.com"));
        let config = StoreConfig {
            graph_base_url: server.url("/v1.0"),
            site_id: "site-1".into(),
            list_id: "list-1".into(),
            site_url: server.url("/sites/ops"),
            filter: FilterMode::Client,
        };
        CommentSync::new(
            CommentStore::new(&config, broker.clone()),
            AttachmentTransfer::new(&config, broker.clone(), profile),
            NotificationDispatcher::new(&config.graph_base_url, broker),
            ThreadResolver::new(
                StaticHost::shared(platform, item),
                profile,
                Duration::from_millis(10),
                3,
            ),
            Duration::from_secs(3600),
        )
    }

    fn list_item(id: &str, comment: &str) -> serde_json::Value {
        json!({
            "id": id,
            "createdDateTime": "2030-01-01T00:00:00Z",
            "fields": {
                "EmailID": "conv-1",
                "Comment": comment,
                "MentionedUsers": "",
                "CreatedBy": "Ann",
                "CreatedDate": "2030-01-01T00:00:00Z"
            }
        })
    }

    fn record(id: &str) -> CommentRecord {
        CommentRecord {
            id: id.to_string(),
            thread_key: ThreadKey::new("conv-1"),
            author_display_name: "Ann".into(),
            body: format!("comment {}", id),
            mentioned_display_names: vec![],
            created_at: Utc::now(),
            attachments: vec![],
            submission_key: None,
        }
    }

    #[tokio::test]
    async fn test_open_fetches_and_starts_timer() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200)
                .json_body(json!({ "value": [list_item("1", "first")] }));
        });
        let attachments = server.mock(|when, then| {
            when.method(GET).path_contains("items(1)/AttachmentFiles");
            then.status(200).json_body(json!({
                "value": [{ "FileName": "a.pdf", "ServerRelativeUrl": "/sites/ops/a.pdf" }]
            }));
        });

        let (sync, events) = build(&server, Some(mail_item(Some("conv-1"))));
        let key = sync.open().await.unwrap();
        assert_eq!(key, Some(ThreadKey::new("conv-1")));
        assert!(sync.is_polling().await);
        attachments.assert_hits(1);

        let snapshot = sync.snapshot().await;
        assert_eq!(snapshot.comments.len(), 1);
        assert_eq!(snapshot.comments[0].attachments[0].file_name, "a.pdf");
        assert_eq!(snapshot.state, SyncState::Idle);
        assert!(!snapshot.loading);
        assert!(snapshot.last_refreshed.is_some());

        let events: Vec<SyncEvent> = events.drain().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::CommentsUpdated { count: 1 })));

        sync.teardown().await;
        assert!(!sync.is_polling().await);
    }

    #[tokio::test]
    async fn test_open_without_identifier_fetches_nothing() {
        let server = MockServer::start_async().await;
        let list = server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200).json_body(json!({ "value": [] }));
        });

        let (sync, _events) = build(&server, Some(mail_item(None)));
        assert_eq!(sync.open().await.unwrap(), None);
        assert!(!sync.is_polling().await);
        list.assert_hits(0);
    }

    #[tokio::test]
    async fn test_open_without_identifier_settles_loading() {
        let server = MockServer::start_async().await;
        let (sync, _events) = build(&server, Some(mail_item(None)));

        // A fetch was running when the message changed to one without an identifier
        sync.begin_fetch().await;
        assert!(sync.snapshot().await.loading);

        assert_eq!(sync.open().await.unwrap(), None);
        let snapshot = sync.snapshot().await;
        assert!(!snapshot.loading);
        assert_eq!(snapshot.state, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_declined_document_consent_prompts_once_per_fetch() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200).json_body(json!({
                "value": (1..=5).map(|i| list_item(&i.to_string(), "note")).collect::<Vec<_>>()
            }));
        });
        let attachments = server.mock(|when, then| {
            when.method(GET).path_contains("AttachmentFiles");
            then.status(200).json_body(json!({ "value": [] }));
        });

        let identity = Arc::new(FakeIdentity {
            cancel_interactive: true,
            ..FakeIdentity::signed_in("ann@contoso.com")
        });
        identity
            .needs_consent
            .lock()
            .unwrap()
            .insert(DOCUMENT_SCOPE.to_string());

        let (sync, _events) = build_with(&server, Some(mail_item(Some("conv-1"))), identity.clone());
        sync.open().await.unwrap();

        assert_eq!(identity.interactive_count(), 1);
        attachments.assert_hits(0);
        let snapshot = sync.snapshot().await;
        assert_eq!(snapshot.comments.len(), 5);
        assert!(snapshot.comments.iter().all(|c| c.attachments.is_empty()));
        assert!(snapshot.last_error.is_none());
        sync.teardown().await;
    }

    #[tokio::test]
    async fn test_open_host_never_ready() {
        let server = MockServer::start_async().await;
        let (sync, _events) = build(&server, None);
        let err = sync.open().await.unwrap_err();
        assert_eq!(err, NotesError::HostNotReady { attempts: 3 });
    }

    #[tokio::test]
    async fn test_submit_without_files_creates_one_record() {
        let server = MockServer::start_async().await;
        let create = server.mock(|when, then| {
            when.method(POST).path(ITEMS_PATH);
            then.status(201).json_body(json!({ "id": "11", "fields": {} }));
        });
        server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200)
                .json_body(json!({ "value": [list_item("11", "looks good")] }));
        });
        server.mock(|when, then| {
            when.method(GET).path_contains("AttachmentFiles");
            then.status(200).json_body(json!({ "value": [] }));
        });
        let upload = server.mock(|when, then| {
            when.method(PUT).path_contains("AttachmentFiles");
            then.status(204);
        });
        let send = server.mock(|when, then| {
            when.path("/v1.0/me/sendMail");
            then.status(202);
        });

        let (sync, _events) = build(&server, Some(mail_item(Some("conv-1"))));
        sync.open().await.unwrap();
        let outcome = sync.submit("looks good", vec![]).await.unwrap();

        assert_eq!(outcome.record_id, "11");
        assert!(outcome.uploaded.is_empty());
        assert!(outcome.notified.is_empty());
        create.assert_hits(1);
        upload.assert_hits(0);
        send.assert_hits(0);

        let snapshot = sync.snapshot().await;
        assert!(!snapshot.sending);
        assert_eq!(snapshot.comments[0].body, "looks good");
        sync.teardown().await;
    }

    #[tokio::test]
    async fn test_submit_strips_mentions_and_notifies() {
        let server = MockServer::start_async().await;
        let create = server.mock(|when, then| {
            when.method(POST).path(ITEMS_PATH).json_body_partial(
                json!({
                    "fields": {
                        "EmailID": "conv-1",
                        "Comment": "Hi check this",
                        "MentionedUsers": "Alice",
                        "CreatedBy": "Ann"
                    }
                })
                .to_string(),
            );
            then.status(201).json_body(json!({ "id": "12", "fields": {} }));
        });
        server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200).json_body(json!({ "value": [] }));
        });
        let send = server.mock(|when, then| {
            when.method(POST)
                .path("/v1.0/me/sendMail")
                .body_contains("alice@x.com")
                .body_contains("Hi check this");
            then.status(202);
        });

        let (sync, _events) = build(&server, Some(mail_item(Some("conv-1"))));
        sync.open().await.unwrap();
        let outcome = sync
            .submit("Hi @[Alice](alice@x.com) check this", vec![])
            .await
            .unwrap();

        create.assert_hits(1);
        send.assert_hits(1);
        assert_eq!(outcome.notified, vec!["alice@x.com"]);
        assert!(outcome.notification_error.is_none());
        sync.teardown().await;
    }

    #[tokio::test]
    async fn test_repeated_mention_notifies_once() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path(ITEMS_PATH);
            then.status(201).json_body(json!({ "id": "13", "fields": {} }));
        });
        server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200).json_body(json!({ "value": [] }));
        });
        let send = server.mock(|when, then| {
            when.method(POST).path("/v1.0/me/sendMail");
            then.status(202);
        });

        let (sync, _events) = build(&server, Some(mail_item(Some("conv-1"))));
        sync.open().await.unwrap();
        let outcome = sync
            .submit("@[Alice](alice@x.com) and again @[Alice](alice@x.com)", vec![])
            .await
            .unwrap();

        send.assert_hits(1);
        assert_eq!(outcome.notified, vec!["alice@x.com"]);
        sync.teardown().await;
    }

    #[tokio::test]
    async fn test_mentions_differing_in_case_notify_once() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path(ITEMS_PATH);
            then.status(201).json_body(json!({ "id": "14", "fields": {} }));
        });
        server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200).json_body(json!({ "value": [] }));
        });
        let send = server.mock(|when, then| {
            when.method(POST).path("/v1.0/me/sendMail");
            then.status(202);
        });

        let (sync, _events) = build(&server, Some(mail_item(Some("conv-1"))));
        sync.open().await.unwrap();
        let outcome = sync
            .submit("@[A](alice@x.com) and @[B](ALICE@x.com)", vec![])
            .await
            .unwrap();

        send.assert_hits(1);
        assert_eq!(outcome.notified, vec!["alice@x.com"]);
        sync.teardown().await;
    }

    #[tokio::test]
    async fn test_submit_with_files_uploads_to_new_record() {
        let server = MockServer::start_async().await;
        let create = server.mock(|when, then| {
            when.method(POST).path(ITEMS_PATH);
            then.status(201).json_body(json!({ "id": "21", "fields": {} }));
        });
        let upload_a = server.mock(|when, then| {
            when.method(PUT)
                .path_contains("items(21)/AttachmentFiles('a.txt')")
                .header_exists("authorization");
            then.status(204);
        });
        let upload_b = server.mock(|when, then| {
            when.method(PUT).path_contains("items(21)/AttachmentFiles('b.txt')");
            then.status(500).body("disk full");
        });
        let send = server.mock(|when, then| {
            when.method(POST).path("/v1.0/me/sendMail");
            then.status(202);
        });
        server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200)
                .json_body(json!({ "value": [list_item("21", "see files")] }));
        });
        server.mock(|when, then| {
            when.method(GET).path_contains("items(21)/AttachmentFiles");
            then.status(200).json_body(json!({
                "value": [{ "FileName": "a.txt", "ServerRelativeUrl": "/sites/ops/a.txt" }]
            }));
        });

        let identity = Arc::new(FakeIdentity::signed_in("ann@contoso.com"));
        let (sync, _events) = build_with(&server, Some(mail_item(Some("conv-1"))), identity.clone());
        sync.open().await.unwrap();
        identity.silent_calls.lock().unwrap().clear();

        let files = vec![
            OutgoingFile::new("a.txt", b"alpha".to_vec()),
            OutgoingFile::new("b.txt", b"beta".to_vec()),
        ];
        let outcome = sync
            .submit("@[Alice](alice@x.com) see files", files)
            .await
            .unwrap();

        assert_eq!(outcome.record_id, "21");
        assert_eq!(outcome.uploaded, vec!["a.txt"]);
        assert_eq!(outcome.attachment_failures.len(), 1);
        assert!(matches!(
            &outcome.attachment_failures[0],
            NotesError::AttachmentTransfer { file_name, .. } if file_name == "b.txt"
        ));
        assert_eq!(outcome.notified, vec!["alice@x.com"]);
        assert!(outcome.notification_error.is_none());
        create.assert_hits(1);
        upload_a.assert_hits(1);
        upload_b.assert_hits(1);
        send.assert_hits(1);

        // create, upload, notify, then the refetch of comments and attachments
        let audiences: Vec<&str> = identity
            .silent_calls
            .lock()
            .unwrap()
            .iter()
            .map(|scopes| {
                if scopes.iter().any(|s| s == DOCUMENT_SCOPE) {
                    "document"
                } else {
                    "collaboration"
                }
            })
            .collect();
        assert_eq!(
            audiences,
            vec!["collaboration", "document", "collaboration", "collaboration", "document"]
        );

        let snapshot = sync.snapshot().await;
        assert_eq!(snapshot.comments[0].id, "21");
        assert_eq!(snapshot.comments[0].attachments[0].file_name, "a.txt");
        sync.teardown().await;
    }

    #[tokio::test]
    async fn test_store_write_failure_aborts_submission() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path(ITEMS_PATH);
            then.status(500).body("boom");
        });
        server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200).json_body(json!({ "value": [] }));
        });
        let upload = server.mock(|when, then| {
            when.method(PUT).path_contains("AttachmentFiles");
            then.status(204);
        });
        let send = server.mock(|when, then| {
            when.path("/v1.0/me/sendMail");
            then.status(202);
        });

        let (sync, events) = build(&server, Some(mail_item(Some("conv-1"))));
        sync.open().await.unwrap();
        let files = vec![OutgoingFile::new("a.txt", b"a".to_vec())];
        let err = sync
            .submit("@[Alice](alice@x.com) hi", files)
            .await
            .unwrap_err();

        assert!(matches!(err, NotesError::StoreWrite(_)));
        assert!(err.aborts_submission());
        upload.assert_hits(0);
        send.assert_hits(0);

        let snapshot = sync.snapshot().await;
        assert!(!snapshot.sending);
        assert_eq!(snapshot.state, SyncState::Idle);
        assert!(events
            .drain()
            .any(|e| matches!(e, SyncEvent::SubmitFailed { .. })));
        sync.teardown().await;
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let server = MockServer::start_async().await;
        let create = server.mock(|when, then| {
            when.method(POST).path(ITEMS_PATH);
            then.status(201).json_body(json!({ "id": "1", "fields": {} }));
        });

        let (sync, _events) = build(&server, Some(mail_item(Some("conv-1"))));
        let err = sync.submit("   ", vec![]).await.unwrap_err();
        assert!(matches!(err, NotesError::InvalidInput(_)));

        // Not opened yet, so no thread key
        let err = sync.submit("hello", vec![]).await.unwrap_err();
        assert!(matches!(err, NotesError::InvalidInput(_)));
        create.assert_hits(0);
    }

    #[tokio::test]
    async fn test_stale_fetch_is_discarded() {
        let server = MockServer::start_async().await;
        let (sync, _events) = build(&server, None);

        let slow = sync.begin_fetch().await;
        let fast = sync.begin_fetch().await;

        sync.finish_fetch(fast, Ok(vec![record("new")])).await.unwrap();
        sync.finish_fetch(slow, Ok(vec![record("old")])).await.unwrap();

        let snapshot = sync.snapshot().await;
        assert_eq!(snapshot.comments.len(), 1);
        assert_eq!(snapshot.comments[0].id, "new");
        assert!(!snapshot.loading);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_comments() {
        let server = MockServer::start_async().await;
        let (sync, events) = build(&server, None);

        let seq = sync.begin_fetch().await;
        sync.finish_fetch(seq, Ok(vec![record("1"), record("2")]))
            .await
            .unwrap();

        let seq = sync.begin_fetch().await;
        let err = sync
            .finish_fetch(seq, Err(NotesError::StoreRead("503".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, NotesError::StoreRead(_)));

        let snapshot = sync.snapshot().await;
        assert_eq!(snapshot.comments.len(), 2);
        assert_eq!(snapshot.state, SyncState::Idle);
        assert!(snapshot.last_error.unwrap().contains("503"));
        assert!(events
            .drain()
            .any(|e| matches!(e, SyncEvent::FetchFailed { .. })));
    }

    #[tokio::test]
    async fn test_clear_thread_stops_timer() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path(ITEMS_PATH);
            then.status(200)
                .json_body(json!({ "value": [list_item("1", "first")] }));
        });
        server.mock(|when, then| {
            when.method(GET).path_contains("AttachmentFiles");
            then.status(200).json_body(json!({ "value": [] }));
        });

        let (sync, _events) = build(&server, Some(mail_item(Some("conv-1"))));
        sync.open().await.unwrap();
        assert!(sync.is_polling().await);

        sync.clear_thread().await;
        assert!(!sync.is_polling().await);
        let snapshot = sync.snapshot().await;
        assert!(snapshot.thread_key.is_none());
        assert!(snapshot.comments.is_empty());
    }
}
