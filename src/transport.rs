//! Platform transport profile
//!
//! Token scope form, attachment upload protocol and the thread-identity
//! fallback all depend on the host platform. They are decided once here
//! and the profile is handed to the components that need it.

use serde::{Deserialize, Serialize};

use crate::types::Platform;

/// How attachment bytes are sent to the document store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadProtocol {
    /// `POST .../AttachmentFiles/add(FileName='name')` with a binary body
    AddEndpoint,
    /// `PUT .../AttachmentFiles('name')/$value` with a binary body
    ContentPut,
}

/// Form of the document-store permission scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentScopeForm {
    /// Explicit delegated permission, `https://{tenant}/AllSites.Write`
    Delegated,
    /// Static consent scope, `https://{tenant}/.default`
    Default,
}

/// Platform capabilities, selected once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportProfile {
    pub platform: Platform,
    pub upload: UploadProtocol,
    pub document_scope: DocumentScopeForm,
    /// Consult thread-indexing headers when no conversation id is available
    pub header_fallback: bool,
}

impl TransportProfile {
    pub fn for_platform(platform: Platform) -> Self {
        if platform.is_desktop() {
            Self {
                platform,
                upload: UploadProtocol::AddEndpoint,
                document_scope: DocumentScopeForm::Delegated,
                header_fallback: platform == Platform::Mac,
            }
        } else {
            Self {
                platform,
                upload: UploadProtocol::ContentPut,
                document_scope: DocumentScopeForm::Default,
                header_fallback: false,
            }
        }
    }

    /// Scope string for the document-store audience
    pub fn document_scope(&self, tenant_host: &str) -> String {
        let tenant_host = tenant_host.trim_end_matches('/');
        match self.document_scope {
            DocumentScopeForm::Delegated => format!("https://{}/AllSites.Write", tenant_host),
            DocumentScopeForm::Default => format!("https://{}/.default", tenant_host),
        }
    }
}
