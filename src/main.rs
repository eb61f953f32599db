use std::io::{self, Write};

use chat_sync::cli::{Args, Command, HELP};
use chat_sync::{
    ChatApi, ConnectionState, ConversationId, Delivery, HttpApi, Message, MessageKind, SessionCoordinator, Update,
    User,
};
use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Tracks how much of the on-screen timeline has been printed.
struct View {
    conversation: ConversationId,
    printed: usize,
    failed: usize,
}

impl View {
    fn switch_to<A: ChatApi>(&mut self, coordinator: &SessionCoordinator<A>, title: &str) {
        self.conversation = coordinator.active_conversation();
        self.printed = 0;
        self.failed = 0;
        println!("{}", format!("── {title} ──").bold());
        self.flush(coordinator);
    }

    /// Print every message that arrived since the last flush.
    fn flush<A: ChatApi>(&mut self, coordinator: &SessionCoordinator<A>) {
        let messages = coordinator.timeline(self.conversation);
        let self_id = coordinator.session().map(|s| s.user.id);
        for message in messages.iter().skip(self.printed) {
            println!("{}", render(message, self_id));
        }
        self.printed = messages.len().max(self.printed);

        // Entries already printed as pending can fail later.
        let failed = coordinator.failed(self.conversation).len();
        if failed > self.failed {
            println!("{}", format!("{failed} message(s) not delivered, /retry to resend").red());
        }
        self.failed = failed;
    }
}

fn render(message: &Message, self_id: Option<i64>) -> String {
    if message.kind == MessageKind::System {
        return format!("* {}", message.content).dimmed().to_string();
    }
    let name = message.username.as_deref().unwrap_or("?");
    let name = if message.sender_id.is_some() && message.sender_id == self_id {
        name.green().bold()
    } else {
        name.cyan().bold()
    };
    let line = format!("{name}: {}", message.content);
    match message.delivery {
        Delivery::Pending => format!("{line} {}", "…".dimmed()),
        Delivery::Failed => format!("{line} {}", "(failed, /retry)".red()),
        Delivery::Delivered => line,
    }
}

fn print_roster<A: ChatApi>(coordinator: &SessionCoordinator<A>) {
    if coordinator.users().is_empty() {
        println!("{}", "nobody else is online".dimmed());
        return;
    }
    for user in coordinator.users() {
        let marker = if coordinator.is_unread(user.id) { "*".yellow().bold() } else { " ".normal() };
        println!("{marker} {} ({})", user.username, user.id);
    }
}

fn find_peer(users: &[User], needle: &str) -> Option<User> {
    let by_id = needle.parse::<i64>().ok();
    users
        .iter()
        .find(|u| Some(u.id) == by_id || u.username.eq_ignore_ascii_case(needle))
        .cloned()
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_sync=info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = args.resolve_config()?;
    info!(server = %config.base_url, ws = %config.websocket_url(), "starting");

    let api = HttpApi::new(&config);
    let (mut coordinator, mut events) = SessionCoordinator::new(api, config);

    let session = coordinator.join().await?;
    println!("joined as {}", session.user.username.green().bold());
    println!("{}", HELP.dimmed());

    let mut view = View { conversation: ConversationId::Global, printed: 0, failed: 0 };
    view.switch_to(&coordinator, "global");
    prompt();

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let Some(update) = coordinator.apply(event) else { continue };
                match update {
                    Update::Timeline(conversation) if conversation == view.conversation => view.flush(&coordinator),
                    Update::Timeline(_) | Update::Roster => continue,
                    Update::Unread(peer_id) => {
                        let name = coordinator
                            .users()
                            .iter()
                            .find(|u| u.id == peer_id)
                            .map_or_else(|| format!("user {peer_id}"), |u| u.username.clone());
                        println!("{}", format!("new message from {name}").yellow());
                    }
                    Update::Connection(ConnectionState::Disconnected) => {
                        println!("{}", "realtime connection closed".dimmed());
                    }
                    Update::Connection(state) => info!(%state, "realtime"),
                }
                prompt();
            }
            line = lines.next() => {
                let Some(line) = line else { break };
                match Command::parse(&line?) {
                    Command::Say(text) => {
                        if let Err(e) = coordinator.send(&text).await {
                            eprintln!("{}", e.to_string().red());
                        }
                        view.flush(&coordinator);
                    }
                    Command::Users => print_roster(&coordinator),
                    Command::Open(needle) => match find_peer(coordinator.users(), &needle) {
                        Some(peer) => match coordinator.open_conversation(&peer).await {
                            Ok(_) => view.switch_to(&coordinator, &peer.username),
                            Err(e) => eprintln!("{}", e.to_string().red()),
                        },
                        None => eprintln!("{}", format!("no online user matches {needle:?}").red()),
                    },
                    Command::Close => {
                        coordinator.close_conversation();
                        view.switch_to(&coordinator, "global");
                    }
                    Command::Retry => {
                        let conversation = coordinator.active_conversation();
                        for client_ref in coordinator.failed(conversation) {
                            if let Err(e) = coordinator.retry(conversation, &client_ref).await {
                                eprintln!("{}", e.to_string().red());
                            }
                        }
                        view.switch_to(&coordinator, &conversation.to_string());
                    }
                    Command::Help => println!("{HELP}"),
                    Command::Quit => break,
                    Command::Unknown(input) => eprintln!("{}", format!("unknown command {input:?}, try /help").red()),
                }
                prompt();
            }
        }
    }

    coordinator.shutdown();
    Ok(())
}
