/// Chatline - headless chat session driven from stdin
use chatline_core::{Change, ChatSession, Config, ConnectionState, Message};
use colored::*;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Starting chat session");
    info!("   User: {}", config.identity);
    info!("   API: {}", config.api_base_url);
    info!("   Push: {}", config.ws_base_url);

    let session = Arc::new(
        ChatSession::connect(config).map_err(|e| anyhow::anyhow!("Session error: {}", e))?,
    );
    print_help();

    let printer = tokio::spawn(print_changes(session.clone(), session.subscribe()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut selected: Option<String> = None;

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            break;
        } else if line == "/help" {
            print_help();
        } else if let Some(peer) = line.strip_prefix("/select ") {
            match session.select_peer(peer).await {
                Ok(_) => {
                    selected = Some(peer.trim().to_string());
                    show_conversation(&session, peer.trim()).await;
                }
                Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
            }
        } else if let Some(raw) = line.strip_prefix("/retry ") {
            match raw.trim().parse::<Uuid>() {
                Ok(local_id) => match session.retry_send(local_id).await {
                    Ok(()) => println!("{} Message re-sent", "✓".green().bold()),
                    Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
                },
                Err(_) => eprintln!("{} Not a message id: {}", "✗".red().bold(), raw),
            }
        } else if line == "/chats" {
            show_summaries(&session).await;
        } else if let Some(peer) = selected.as_deref() {
            match session.send_message(peer, line).await {
                Ok(local_id) => println!("{} Sent {}", "✓".green().bold(), local_id.to_string().dimmed()),
                Err(e) => eprintln!("{} Send failed: {} (see /chats, retry with /retry <id>)", "✗".red().bold(), e),
            }
        } else {
            eprintln!("{} Select a peer first: /select <user>", "!".yellow().bold());
        }
    }

    info!("Shutting down");
    session.shutdown().await;
    printer.abort();
    Ok(())
}

fn print_help() {
    println!("{}", "Commands:".bold());
    println!("  {} <user>     Open the conversation with <user>", "/select".cyan());
    println!("  {} <id>        Re-send a failed message", "/retry".cyan());
    println!("  {}             List conversations", "/chats".cyan());
    println!("  {}              Leave", "/quit".cyan());
    println!("  Any other line is sent to the selected user.");
}

fn format_message(message: &Message) -> String {
    let status = if message.failed {
        format!(" [failed {}]", message.local_id.map(|id| id.to_string()).unwrap_or_default())
            .red()
            .to_string()
    } else if message.is_pending() {
        " [sending]".dimmed().to_string()
    } else {
        String::new()
    };
    format!(
        "{} {}: {}{}",
        message.timestamp.format("%H:%M:%S").to_string().dimmed(),
        message.sender.cyan(),
        message.content,
        status
    )
}

async fn show_conversation(session: &ChatSession, peer: &str) {
    let store = session.store().await;
    let online = if store.is_online(peer) { "online".green() } else { "offline".dimmed() };
    println!("{} {} ({})", "─── ".dimmed(), peer.bold(), online);
    for message in store.messages(peer) {
        println!("  {}", format_message(message));
    }
}

async fn show_summaries(session: &ChatSession) {
    let store = session.store().await;
    for summary in store.summaries() {
        let marker = if summary.unread { "●".yellow().to_string() } else { " ".to_string() };
        println!(
            "{} {:<16} {}  {}",
            marker,
            summary.peer.bold(),
            summary.last_timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            summary.last_message_preview
        );
    }
}

async fn print_changes(session: Arc<ChatSession>, mut changes: tokio::sync::broadcast::Receiver<Change>) {
    loop {
        match changes.recv().await {
            Ok(Change::Connection(state)) => {
                let label = match state {
                    ConnectionState::Open => "connected".green(),
                    ConnectionState::Connecting => "connecting".yellow(),
                    ConnectionState::Reconnecting => "reconnecting".yellow(),
                    ConnectionState::Closed => "disconnected".red(),
                };
                println!("{} {}", "⚡".bold(), label);
            }
            Ok(Change::FetchFailed { peer, error }) => {
                eprintln!("{} Could not load history with {}: {}", "✗".red().bold(), peer, error);
            }
            Ok(Change::Messages { peer }) => {
                let store = session.store().await;
                if store.selected_peer() == Some(peer.as_str()) {
                    if let Some(last) = store.messages(&peer).last() {
                        println!("  {}", format_message(last));
                    }
                } else {
                    info!(%peer, "conversation updated");
                }
            }
            Ok(change) => info!(?change, "state changed"),
            Err(RecvError::Lagged(n)) => warn!("change printer lagged {} events", n),
            Err(RecvError::Closed) => return,
        }
    }
}
