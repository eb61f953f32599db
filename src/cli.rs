use std::path::PathBuf;

use clap::Parser;

use crate::config::ClientConfig;
use crate::error::ChatError;

#[derive(Parser, Debug)]
#[command(name = "chat-sync")]
#[command(version)]
#[command(about = "Terminal client for a polling + WebSocket chat server")]
pub struct Args {
    /// TOML config file; flags below override its values
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// HTTP base URL of the chat server
    #[arg(long)]
    pub server: Option<String>,

    /// WebSocket endpoint (defaults to <server>/chats/ws)
    #[arg(long)]
    pub ws: Option<String>,

    /// Don't open the realtime connection until a private chat is opened
    #[arg(long)]
    pub no_realtime: bool,
}

impl Args {
    /// Merge the config file (if any) with command-line overrides.
    pub fn resolve_config(&self) -> Result<ClientConfig, ChatError> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };
        if let Some(server) = &self.server {
            config.base_url = server.trim_end_matches('/').to_string();
        }
        if let Some(ws) = &self.ws {
            config.ws_url = Some(ws.clone());
        }
        if self.no_realtime {
            config.connect_on_join = false;
        }
        config.validate()?;
        Ok(config)
    }
}

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text for the active conversation.
    Say(String),
    Users,
    /// Open a private chat by username or numeric id.
    Open(String),
    Close,
    /// Re-send every failed message in the active conversation.
    Retry,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Say(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "users" | "who" => Command::Users,
            "open" | "dm" if !arg.is_empty() => Command::Open(arg.to_string()),
            "close" | "global" => Command::Close,
            "retry" => Command::Retry,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

pub const HELP: &str = "\
commands:
  /users           list online users (* = unread)
  /open <name|id>  open a private chat
  /close           back to the global room
  /retry           re-send failed messages
  /quit            leave";
