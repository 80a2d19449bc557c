//! Comment store client
//!
//! Comments are items of a remote list. The list is append-only from this
//! client's point of view: records are created once and re-read in full.
//!
//! Listing supports two filtering paths. The server path asks the store for
//! a field-equality match; the client path pages through the whole list and
//! compares normalized keys locally. Both paths re-check normalized equality
//! and sort by creation time before returning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::TokenBroker;
use crate::config::{FilterMode, StoreConfig};
use crate::types::error::{NotesError, Result};
use crate::types::{
    join_display_names, split_display_names, Audience, CommentRecord, NewComment, ThreadKey,
};

/// Title written on every comment item
const ITEM_TITLE: &str = "Email Comment";

/// Page size requested when scanning the whole list
const SCAN_PAGE_SIZE: u32 = 500;

/// Field map of a comment item
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommentFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(rename = "EmailID")]
    email_id: Option<String>,
    comment: Option<String>,
    mentioned_users: Option<String>,
    created_by: Option<String>,
    created_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    submission_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateItemRequest<'a> {
    fields: &'a CommentFields,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    id: String,
    #[serde(rename = "createdDateTime")]
    created_date_time: Option<String>,
    #[serde(default)]
    fields: CommentFields,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    value: Vec<ListItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Client for the remote comment list
pub struct CommentStore {
    client: reqwest::Client,
    broker: Arc<TokenBroker>,
    items_url: String,
    filter: FilterMode,
}

impl CommentStore {
    pub fn new(config: &StoreConfig, broker: Arc<TokenBroker>) -> Self {
        let items_url = format!(
            "{}/sites/{}/lists/{}/items",
            config.graph_base_url.trim_end_matches('/'),
            config.site_id,
            config.list_id
        );
        Self {
            client: reqwest::Client::new(),
            broker,
            items_url,
            filter: config.filter,
        }
    }

    /// Persist a new comment and return the store-assigned id
    ///
    /// No retry on failure; the caller decides whether to resubmit.
    pub async fn create(&self, comment: &NewComment) -> Result<String> {
        let token = self.broker.acquire(Audience::Collaboration).await?;

        let fields = CommentFields {
            title: Some(ITEM_TITLE.to_string()),
            email_id: Some(comment.thread_key.as_str().to_string()),
            comment: Some(comment.body.clone()),
            mentioned_users: Some(join_display_names(&comment.mentioned_display_names)),
            created_by: Some(comment.author_display_name.clone()),
            created_date: Some(comment.created_at.to_rfc3339()),
            submission_key: Some(comment.submission_key.clone()),
        };

        debug!("Creating comment item for thread {}", comment.thread_key);

        let response = self
            .client
            .post(&self.items_url)
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .json(&CreateItemRequest { fields: &fields })
            .send()
            .await
            .map_err(|e| NotesError::StoreWrite(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Create comment failed: {} {}", status, error_text);
            return Err(NotesError::StoreWrite(format!("{}: {}", status, error_text)));
        }

        let item: ListItem = response
            .json()
            .await
            .map_err(|e| NotesError::StoreWrite(format!("Unreadable create response: {}", e)))?;

        info!("Created comment {} for thread {}", item.id, comment.thread_key);
        Ok(item.id)
    }

    /// All comments of a thread, oldest first
    pub async fn list(&self, key: &ThreadKey) -> Result<Vec<CommentRecord>> {
        let token = self.broker.acquire(Audience::Collaboration).await?;

        let mut next = Some(self.first_page_url(key));
        let mut items = Vec::new();
        let mut pages = 0u32;

        while let Some(url) = next.take() {
            pages += 1;
            let mut request = self
                .client
                .get(&url)
                .header(reqwest::header::AUTHORIZATION, token.bearer());
            if self.filter == FilterMode::Server {
                request = request.header("prefer", "HonorNonIndexedQueriesWarningMayFailRandomly");
            }

            let response = request
                .send()
                .await
                .map_err(|e| NotesError::StoreRead(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                warn!("Fetch comments failed: {} {}", status, error_text);
                return Err(NotesError::StoreRead(format!("{}: {}", status, error_text)));
            }

            let page: ListPage = response
                .json()
                .await
                .map_err(|e| NotesError::StoreRead(format!("Unreadable list response: {}", e)))?;

            items.extend(page.value);
            next = page.next_link;
        }

        let scanned = items.len();
        let records = collect_thread(items, key);
        debug!(
            "Listed {} of {} items for thread {} ({} pages, {:?} filter)",
            records.len(),
            scanned,
            key,
            pages,
            self.filter
        );
        Ok(records)
    }

    fn first_page_url(&self, key: &ThreadKey) -> String {
        match self.filter {
            FilterMode::Server => {
                let literal = key.as_str().replace('\'', "''");
                format!(
                    "{}?expand=fields&$filter={}&$orderby={}",
                    self.items_url,
                    encode_component(&format!("fields/EmailID eq '{}'", literal)),
                    encode_component("createdDateTime asc")
                )
            }
            FilterMode::Client => {
                format!("{}?expand=fields&$top={}", self.items_url, SCAN_PAGE_SIZE)
            }
        }
    }
}

/// Percent-encode a query component
pub(crate) fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Filter, convert, sort and deduplicate raw list items
fn collect_thread(items: Vec<ListItem>, key: &ThreadKey) -> Vec<CommentRecord> {
    let mut records: Vec<CommentRecord> = items
        .into_iter()
        .filter(|item| {
            item.fields
                .email_id
                .as_deref()
                .is_some_and(|raw| key.matches(raw))
        })
        .map(to_record)
        .collect();

    records.sort_by_key(|r| r.created_at);

    // A resubmitted attempt carries the same key; keep the earliest copy
    let mut seen = HashSet::new();
    records.retain(|r| match &r.submission_key {
        Some(k) => seen.insert(k.clone()),
        None => true,
    });

    records
}

fn to_record(item: ListItem) -> CommentRecord {
    let fields = item.fields;
    let created_at = fields
        .created_date
        .as_deref()
        .and_then(parse_timestamp)
        .or_else(|| item.created_date_time.as_deref().and_then(parse_timestamp))
        .unwrap_or_default();

    CommentRecord {
        id: item.id,
        thread_key: ThreadKey::new(fields.email_id.unwrap_or_default()),
        author_display_name: fields.created_by.unwrap_or_default(),
        body: fields.comment.unwrap_or_default(),
        mentioned_display_names: fields
            .mentioned_users
            .as_deref()
            .map(split_display_names)
            .unwrap_or_default(),
        created_at,
        attachments: Vec::new(),
        submission_key: fields.submission_key,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
