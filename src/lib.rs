//! threadnotes - internal comment threads for email conversations
//!
//! Attaches mention-aware comments with file attachments to the message
//! open in a mail client, stores them in a remote list and notifies the
//! people mentioned.
//!
//! ## Module Organization
//!
//! - `types/`: Data structures and the crate error type
//! - `config/`: Configuration loading
//! - `mention/`: `@[name](address)` markup codec
//! - `host/`: Mail client collaborator
//! - `thread/`: Thread identity resolution
//! - `transport`: Platform transport profile
//! - `auth/`: Token broker and identity platform client
//! - `store/`: Remote comment list client
//! - `attachments/`: Attachment upload and download
//! - `notify/`: Mention notifications
//! - `directory/`: People for the mention picker
//! - `sync/`: Comment sync loop and refresh timer

pub mod attachments;
pub mod auth;
pub mod config;
pub mod directory;
pub mod host;
pub mod mention;
pub mod notify;
pub mod store;
pub mod sync;
pub mod thread;
pub mod transport;
pub mod types;

use tracing_subscriber::EnvFilter;

pub use types::error::{NotesError, Result};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins; otherwise debug builds log this crate at debug level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("threadnotes=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
