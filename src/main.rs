use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use threadnotes::attachments::Download;
use threadnotes::auth::microsoft::{DevicePrompt, MicrosoftIdentity};
use threadnotes::auth::TokenBroker;
use threadnotes::config::{self, AppConfig};
use threadnotes::directory::Directory;
use threadnotes::host::{MailHost, StaticHost};
use threadnotes::sync::{CommentSync, SyncEvent, SyncSnapshot};
use threadnotes::thread::ThreadResolver;
use threadnotes::types::{MailItem, OutgoingFile, Platform};
use threadnotes::{NotesError, Result};

#[derive(Parser)]
#[command(name = "threadnotes", version, about = "Internal comment threads for email conversations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Platform to behave as (windows, mac, web, ios, android)
    #[arg(long, global = true)]
    platform: Option<Platform>,

    #[command(flatten)]
    message: MessageArgs,
}

/// The open message, as the mail client would report it
#[derive(Args)]
struct MessageArgs {
    /// File holding the message body (HTML)
    #[arg(long, global = true)]
    body_file: Option<PathBuf>,

    /// Native conversation identifier
    #[arg(long, global = true)]
    conversation_id: Option<String>,

    #[arg(long, global = true, default_value = "")]
    subject: String,

    /// Sender address
    #[arg(long, global = true, default_value = "")]
    from: String,

    /// Display name of the signed-in user
    #[arg(long, global = true, default_value = "")]
    user_name: String,

    /// Thread-Index header value
    #[arg(long, global = true)]
    thread_index: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the thread key of the message
    Key,
    /// Fetch and print the comments once
    List {
        /// Save attachments that need authorization into this directory
        #[arg(long)]
        download: Option<PathBuf>,
    },
    /// Add a comment
    Submit {
        /// Comment text; mentions are written as @[Name](address)
        #[arg(long)]
        text: String,
        /// File to attach, may be repeated
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    /// Print comments as they change until interrupted
    Watch,
    /// List people that can be mentioned
    People,
}

#[tokio::main]
async fn main() -> ExitCode {
    threadnotes::init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => config::load_from_path(path)?,
        None => config::load_default()?,
    };
    if cli.platform.is_some() {
        config.platform = cli.platform;
    }

    let platform = config.platform.unwrap_or(Platform::Unknown);
    let item = load_item(&cli.message).await?;
    let host: Arc<dyn MailHost> = StaticHost::shared(platform, Some(item));
    let broker = build_broker(&config, platform);

    match cli.command {
        Commands::Key => {
            let resolver = ThreadResolver::new(
                host,
                config.transport_profile(platform),
                config.sync.host_poll_interval(),
                config.sync.host_poll_attempts,
            );
            match resolver.resolve().await?.key {
                Some((key, source)) => println!("{} ({:?})", key, source),
                None => return Err(NotesError::InvalidInput("Message has no thread key".into())),
            }
        }
        Commands::List { download } => {
            let (sync, _events) = CommentSync::from_config(&config, host, broker);
            sync.open().await?;
            sync.teardown().await;
            let snapshot = sync.snapshot().await;
            print_snapshot(&snapshot);
            if let Some(dir) = download {
                download_attachments(&sync, &snapshot, &dir).await?;
            }
        }
        Commands::Submit { text, attachments } => {
            let mut files = Vec::with_capacity(attachments.len());
            for path in &attachments {
                files.push(OutgoingFile::from_path(path).await?);
            }

            let (sync, _events) = CommentSync::from_config(&config, host, broker);
            sync.open().await?;
            let outcome = sync.submit(&text, files).await;
            sync.teardown().await;
            let outcome = outcome?;

            println!("Saved comment {}", outcome.record_id);
            for name in &outcome.uploaded {
                println!("  attached {}", name);
            }
            for failure in &outcome.attachment_failures {
                println!("  attachment failed: {}", failure);
            }
            if !outcome.notified.is_empty() {
                println!("  notified {}", outcome.notified.join(", "));
            }
            if let Some(e) = &outcome.notification_error {
                println!("  notification failed: {}", e);
            }
        }
        Commands::Watch => {
            let (sync, events) = CommentSync::from_config(&config, host, broker);
            sync.open().await?;
            print_snapshot(&sync.snapshot().await);

            info!("Watching for comment changes, press ctrl-c to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv_async() => match event {
                        Ok(SyncEvent::CommentsUpdated { .. }) => print_snapshot(&sync.snapshot().await),
                        Ok(SyncEvent::FetchFailed { message }) => eprintln!("refresh failed: {}", message),
                        Ok(_) => {}
                        Err(_) => break,
                    },
                }
            }
            sync.teardown().await;
        }
        Commands::People => {
            let directory = Directory::new(
                &config.store.graph_base_url,
                config.sync.directory_page_size,
                broker,
            );
            for person in directory.list_people().await {
                println!("{:<32} {}", person.display_name, person.mention_markup());
            }
        }
    }

    Ok(())
}

fn build_broker(config: &AppConfig, platform: Platform) -> Arc<TokenBroker> {
    let prompt = Arc::new(|prompt: &DevicePrompt| {
        eprintln!("{}", prompt.message);
    });
    let identity = Arc::new(MicrosoftIdentity::new(&config.identity, prompt));
    Arc::new(TokenBroker::new(
        identity,
        &config.transport_profile(platform),
        &config.identity.tenant_host,
    ))
}

async fn load_item(args: &MessageArgs) -> Result<MailItem> {
    let body_html = match &args.body_file {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => String::new(),
    };

    let mut internet_headers = Vec::new();
    if let Some(value) = &args.thread_index {
        internet_headers.push(("Thread-Index".to_string(), value.clone()));
    }

    Ok(MailItem {
        body_html,
        conversation_id: args.conversation_id.clone(),
        subject: args.subject.clone(),
        sender: args.from.clone(),
        user_display_name: args.user_name.clone(),
        internet_headers,
    })
}

fn print_snapshot(snapshot: &SyncSnapshot) {
    if let Some(e) = &snapshot.last_error {
        eprintln!("last refresh failed: {}", e);
    }
    if snapshot.comments.is_empty() {
        println!("No comments yet");
        return;
    }

    for comment in &snapshot.comments {
        println!(
            "[{}] {}: {}",
            comment.created_at.format("%Y-%m-%d %H:%M"),
            comment.author_display_name,
            comment.body
        );
        if !comment.mentioned_display_names.is_empty() {
            println!("    mentioned: {}", comment.mentioned_display_names.join(", "));
        }
        for attachment in &comment.attachments {
            println!("    attachment: {}", attachment.file_name);
        }
    }
}

async fn download_attachments(sync: &CommentSync, snapshot: &SyncSnapshot, dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    for comment in &snapshot.comments {
        for attachment in &comment.attachments {
            match sync.download(&comment.id, attachment).await? {
                Download::Link(url) => println!("{}: {}", attachment.file_name, url),
                blob @ Download::Blob { .. } => {
                    let path = blob.save_into(dir).await?;
                    println!("{}: saved to {}", attachment.file_name, path.display());
                }
            }
        }
    }
    Ok(())
}
