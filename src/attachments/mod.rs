//! Attachment transfer
//!
//! Attachments hang off comment items in the document store. Uploads use
//! the protocol chosen by the transport profile and are best-effort per
//! file: a failed file is logged and reported, the rest still go out.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::TokenBroker;
use crate::config::StoreConfig;
use crate::store::encode_component;
use crate::transport::{TransportProfile, UploadProtocol};
use crate::types::error::{NotesError, Result};
use crate::types::{AccessToken, AttachmentLocator, AttachmentRef, Audience, OutgoingFile};

const ODATA_JSON: &str = "application/json;odata=nometadata";

/// Outcome of uploading a batch of files
#[derive(Debug, Default)]
pub struct UploadReport {
    pub uploaded: Vec<String>,
    pub failed: Vec<NotesError>,
}

impl UploadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A downloadable attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Download {
    /// Directly linkable URL
    Link(String),
    /// Bytes fetched with authorization
    Blob { file_name: String, bytes: Vec<u8> },
}

impl Download {
    /// Write a fetched blob into a directory
    pub async fn save_into(&self, dir: &Path) -> Result<PathBuf> {
        match self {
            Download::Blob { file_name, bytes } => {
                let safe_name = Path::new(file_name)
                    .file_name()
                    .ok_or_else(|| NotesError::InvalidInput(format!("Bad file name: {}", file_name)))?;
                let path = dir.join(safe_name);
                tokio::fs::write(&path, bytes).await?;
                info!("Saved attachment to {:?}", path);
                Ok(path)
            }
            Download::Link(url) => Err(NotesError::InvalidInput(format!(
                "Attachment is a direct link, open {} instead",
                url
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AttachmentList {
    #[serde(default)]
    value: Vec<AttachmentEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachmentEntry {
    file_name: String,
    server_relative_url: String,
}

/// Uploads and downloads comment attachments
pub struct AttachmentTransfer {
    client: reqwest::Client,
    broker: Arc<TokenBroker>,
    profile: TransportProfile,
    site_url: String,
    items_url: String,
}

impl AttachmentTransfer {
    pub fn new(config: &StoreConfig, broker: Arc<TokenBroker>, profile: TransportProfile) -> Self {
        let site_url = config.site_url.trim_end_matches('/').to_string();
        let items_url = format!("{}/_api/web/lists(guid'{}')/items", site_url, config.list_id);
        Self {
            client: reqwest::Client::new(),
            broker,
            profile,
            site_url,
            items_url,
        }
    }

    /// Upload files against a persisted comment
    ///
    /// Never fails as a whole; per-file errors land in the report.
    pub async fn upload(&self, record_id: &str, files: &[OutgoingFile]) -> UploadReport {
        let mut report = UploadReport::default();
        if files.is_empty() {
            return report;
        }

        let token = match self.document_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("No document-store token, skipping {} attachments: {}", files.len(), e);
                report.failed = files
                    .iter()
                    .map(|f| NotesError::AttachmentTransfer {
                        file_name: f.file_name.clone(),
                        message: e.to_string(),
                    })
                    .collect();
                return report;
            }
        };

        for file in files {
            match self.upload_one(&token, record_id, file).await {
                Ok(()) => {
                    debug!("Uploaded {} to comment {}", file.file_name, record_id);
                    report.uploaded.push(file.file_name.clone());
                }
                Err(message) => {
                    warn!(
                        "Upload of {} to comment {} failed: {}",
                        file.file_name, record_id, message
                    );
                    report.failed.push(NotesError::AttachmentTransfer {
                        file_name: file.file_name.clone(),
                        message,
                    });
                }
            }
        }

        info!(
            "Uploaded {}/{} attachments to comment {}",
            report.uploaded.len(),
            files.len(),
            record_id
        );
        report
    }

    async fn upload_one(
        &self,
        token: &AccessToken,
        record_id: &str,
        file: &OutgoingFile,
    ) -> std::result::Result<(), String> {
        let name = encode_component(&file.file_name.replace('\'', "''"));
        let request = match self.profile.upload {
            UploadProtocol::AddEndpoint => self.client.post(format!(
                "{}({})/AttachmentFiles/add(FileName='{}')",
                self.items_url, record_id, name
            )),
            UploadProtocol::ContentPut => self.client.put(format!(
                "{}({})/AttachmentFiles('{}')/$value",
                self.items_url, record_id, name
            )),
        };

        let response = request
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .header(reqwest::header::ACCEPT, ODATA_JSON)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(file.bytes.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let error_text = response.text().await.unwrap_or_default();
            Err(format!("{}: {}", status, error_text))
        }
    }

    /// Attachments of one comment
    pub async fn list(&self, record_id: &str) -> Result<Vec<AttachmentRef>> {
        let token = self.document_token().await?;
        self.list_with(&token, record_id).await
    }

    /// Token for one batch of attachment calls
    pub async fn document_token(&self) -> Result<AccessToken> {
        self.broker.acquire(Audience::DocumentStore).await
    }

    /// Attachments of one comment, reusing a token taken for the batch
    pub async fn list_with(&self, token: &AccessToken, record_id: &str) -> Result<Vec<AttachmentRef>> {
        let response = self
            .client
            .get(format!("{}({})/AttachmentFiles", self.items_url, record_id))
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .header(reqwest::header::ACCEPT, ODATA_JSON)
            .send()
            .await
            .map_err(|e| NotesError::StoreRead(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(NotesError::StoreRead(format!("{}: {}", status, error_text)));
        }

        let list: AttachmentList = response
            .json()
            .await
            .map_err(|e| NotesError::StoreRead(format!("Unreadable attachment list: {}", e)))?;

        Ok(list
            .value
            .into_iter()
            .map(|entry| AttachmentRef {
                file_name: entry.file_name,
                locator: AttachmentLocator::from_raw(&entry.server_relative_url),
            })
            .collect())
    }

    /// Resolve an attachment to a link or fetched bytes
    pub async fn download(&self, record_id: &str, attachment: &AttachmentRef) -> Result<Download> {
        match &attachment.locator {
            AttachmentLocator::RelativePath(path) => {
                Ok(Download::Link(format!("{}{}", self.origin()?, path)))
            }
            AttachmentLocator::Opaque(id) => {
                debug!("Fetching attachment {} of comment {}", id, record_id);
                let token = self.broker.acquire(Audience::DocumentStore).await?;

                let response = self
                    .client
                    .get(format!(
                        "{}/_api/web/GetFileById('{}')/$value",
                        self.site_url,
                        encode_component(id)
                    ))
                    .header(reqwest::header::AUTHORIZATION, token.bearer())
                    .send()
                    .await
                    .map_err(|e| attachment_error(attachment, e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(attachment_error(attachment, status.to_string()));
                }

                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| attachment_error(attachment, e.to_string()))?;

                Ok(Download::Blob {
                    file_name: attachment.file_name.clone(),
                    bytes: bytes.to_vec(),
                })
            }
        }
    }

    /// Scheme and host of the document-store site
    fn origin(&self) -> Result<String> {
        let url = url::Url::parse(&self.site_url)
            .map_err(|e| NotesError::Config(format!("Invalid site_url: {}", e)))?;
        Ok(url.origin().ascii_serialization())
    }
}

fn attachment_error(attachment: &AttachmentRef, message: String) -> NotesError {
    NotesError::AttachmentTransfer {
        file_name: attachment.file_name.clone(),
        message,
    }
}
