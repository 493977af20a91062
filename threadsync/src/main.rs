//! `threadsync` demo: drives a conversation engine against the in-memory
//! backend and prints the resulting thread.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/threadsync/config.toml`).
//!
//! ```bash
//! cargo run --bin threadsync
//! cargo run --bin threadsync -- --history-size 80 --page-size 25 --sender alice
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use threadsync::config::{CliArgs, ClientConfig};
use threadsync::display::DisplayMessage;
use threadsync::remote::memory::InMemoryRemote;
use threadsync::remote::timeout::TimeoutRemote;
use threadsync::sync::{ConversationSyncEngine, LoadOlder, SyncError, SyncEvent};
use threadsync_proto::message::{AttachmentRef, ConversationId, MessageRef, SenderId};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!("threadsync demo starting");
    let result = run_demo(&config).await;
    tracing::info!("threadsync demo exiting");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with the printed thread.
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("threadsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Seeds a backend, then walks through the engine's operations.
async fn run_demo(config: &ClientConfig) -> Result<(), SyncError> {
    let conversation = ConversationId::new(config.conversation_id.clone());
    let me = SenderId::new(config.sender_id.clone());
    let peer = SenderId::new("peer");

    let backend = Arc::new(InMemoryRemote::with_limits(
        config.sync.page_size,
        config.live_buffer,
    ));
    backend.seed_history(&conversation, &peer, config.history_size);
    let remote = TimeoutRemote::new(Arc::clone(&backend), config.request_timeout);

    let (engine, mut events) =
        ConversationSyncEngine::new(remote, conversation.clone(), me, &config.to_sync_config());
    engine.activate().await?;

    let mut pages = 0;
    loop {
        match engine.load_older_messages().await? {
            LoadOlder::Loaded { inserted, exhausted } => {
                pages += 1;
                println!("page {pages}: {inserted} new messages");
                if exhausted {
                    break;
                }
            }
            LoadOlder::AlreadyLoading => tokio::task::yield_now().await,
            LoadOlder::Exhausted => break,
        }
    }
    println!(
        "history loaded: {} messages, more available: {}",
        engine.messages().len(),
        engine.has_older_messages()
    );

    if let Some(id) = engine.messages().iter().find_map(|m| m.id.clone()) {
        engine.set_reply_target(MessageRef::Durable(id));
    }
    let reply_id = engine.send_message("replying to the latest message").await?;
    engine
        .send_image_message(AttachmentRef::new("uploads/demo.png"))
        .await?;

    backend.post(&conversation, &peer, "hello from the other side");

    if let Some(oldest) = engine.messages().last().and_then(|m| m.id.clone()) {
        engine.delete_message(&oldest).await?;
    }

    // Let the live feed catch up with the peer's post and our own echoes.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let mut redraws = 0;
    while let Ok(event) = events.try_recv() {
        if event == SyncEvent::ThreadChanged {
            redraws += 1;
        } else {
            println!("event: {event:?}");
        }
    }
    println!("thread changed {redraws} times; sent reply {reply_id}");

    println!();
    for msg in engine.messages().iter().take(10) {
        let preview = msg.reply_to.as_ref().map(|r| engine.resolve_reply(r));
        println!(
            "{}",
            DisplayMessage::new(msg, preview.as_ref(), &config.timestamp_format)
        );
    }

    engine.deactivate().await;
    Ok(())
}
