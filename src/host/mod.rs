//! Mail client host
//!
//! The host is the mail client the comment panel runs inside. Only the
//! narrow read surface the engine needs is modelled here.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::{MailItem, Platform};

/// Read access to the mail client
#[async_trait]
pub trait MailHost: Send + Sync {
    /// The currently open message, or `None` while the host is still initializing
    async fn current_item(&self) -> Option<MailItem>;

    /// Platform the host runs on
    fn platform(&self) -> Platform;
}

/// Host backed by a fixed message snapshot
///
/// Used by the command-line front end and in tests. The item can be swapped
/// or cleared to simulate navigation.
pub struct StaticHost {
    platform: Platform,
    item: RwLock<Option<MailItem>>,
}

impl StaticHost {
    pub fn new(platform: Platform, item: Option<MailItem>) -> Self {
        Self {
            platform,
            item: RwLock::new(item),
        }
    }

    pub fn shared(platform: Platform, item: Option<MailItem>) -> Arc<Self> {
        Arc::new(Self::new(platform, item))
    }

    /// Replace the open item
    pub async fn set_item(&self, item: Option<MailItem>) {
        *self.item.write().await = item;
    }
}

#[async_trait]
impl MailHost for StaticHost {
    async fn current_item(&self) -> Option<MailItem> {
        self.item.read().await.clone()
    }

    fn platform(&self) -> Platform {
        self.platform
    }
}
