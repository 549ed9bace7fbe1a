use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use client_core::{
    config::DEFAULT_CONFIG_PATH, load_settings_from, presence::Presence, run_session,
    ConnectionManager, HttpMessageApi, MessageView, PeerPresence, SessionCommand, SessionEvent,
};
use shared::domain::{DeliveryStatus, TempId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast, mpsc},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the config file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    /// Conversation to open on start.
    #[arg(long)]
    peer: Option<String>,
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config);
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let local_user = UserId::new(args.user_id);
    info!(user_id = %local_user, server_url = %settings.server_url, "desktop: starting session");

    let connection = ConnectionManager::new(settings.clone());
    let api = Arc::new(HttpMessageApi::new(&settings.server_url, local_user.clone())?);
    let (commands, commands_rx) = mpsc::channel(settings.event_buffer);
    let (events, events_rx) = broadcast::channel(settings.event_buffer);
    tokio::spawn(print_events(events_rx));
    let driver = tokio::spawn(run_session(
        connection,
        api,
        local_user,
        settings,
        commands_rx,
        events,
    ));

    if let Some(peer) = args.peer {
        commands
            .send(SessionCommand::SelectPeer(Some(UserId::new(peer))))
            .await?;
    }

    println!(
        "commands: /open <user>, /close, /typing, /away, /back, /retry, /resend <id>, \
         /delete, /block, /quit"
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            continue;
        };
        let quit = command == SessionCommand::Logout;
        if commands.send(command).await.is_err() || quit {
            break;
        }
    }
    // A closed command channel logs the session out.
    drop(commands);
    driver.await??;
    Ok(())
}

fn parse_command(line: &str) -> Option<SessionCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match head {
        "/open" if !rest.is_empty() => SessionCommand::SelectPeer(Some(UserId::new(rest))),
        "/open" => return None,
        "/close" => SessionCommand::SelectPeer(None),
        "/typing" => SessionCommand::InputChanged,
        "/away" => SessionCommand::SetFocused(false),
        "/back" => SessionCommand::SetFocused(true),
        "/retry" => SessionCommand::RetryHistory,
        "/resend" if !rest.is_empty() => SessionCommand::Resend(TempId::new(rest)),
        "/resend" => return None,
        "/delete" => SessionCommand::DeleteConversation,
        "/block" => SessionCommand::BlockPeer,
        "/quit" => SessionCommand::Logout,
        _ => SessionCommand::Send(line.to_string()),
    };
    Some(command)
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => render(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "desktop: event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn render(event: &SessionEvent) {
    match event {
        SessionEvent::MessagesChanged(messages) => {
            println!("--- {} message(s)", messages.len());
            for view in messages {
                println!("{}", format_message(view));
            }
        }
        SessionEvent::PresenceChanged(Some(presence)) => {
            println!("* {}", describe_presence(presence));
        }
        SessionEvent::PresenceChanged(None) => {}
        SessionEvent::PeerTyping(true) => println!("* typing..."),
        SessionEvent::PeerTyping(false) => {}
        SessionEvent::ConnectionChanged(state) => println!("* connection: {state:?}"),
        SessionEvent::HistoryFailed {
            peer,
            retryable,
            reason,
        } => {
            println!("! could not load the conversation with {peer}: {reason}");
            if *retryable {
                println!("  try again with /retry");
            }
        }
        SessionEvent::SendFailed {
            temp_id,
            retryable,
            reason,
        } => {
            println!("! message was not saved: {reason}");
            if *retryable {
                println!("  resubmit with /resend {temp_id}");
            }
        }
        SessionEvent::Notice(text) => println!("! {text}"),
    }
}

fn format_message(view: &MessageView) -> String {
    let message = &view.message;
    let time = message.created_at.with_timezone(&Local).format("%H:%M");
    if view.outgoing {
        let status = match view.status {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        };
        format!("[{time}] you: {} ({status})", message.content)
    } else {
        format!("[{time}] {}: {}", message.sender, message.content)
    }
}

fn describe_presence(presence: &PeerPresence) -> String {
    let state = match (presence.presence, presence.last_seen) {
        (Presence::Online, _) => "online".to_string(),
        (Presence::Offline, Some(at)) => {
            format!("last seen {}", at.with_timezone(&Local).format("%Y-%m-%d %H:%M"))
        }
        (Presence::Offline, None) => "offline".to_string(),
        (Presence::Unknown, _) => "presence unknown".to_string(),
    };
    if presence.stale {
        format!("{} is {state} (reconnecting)", presence.peer)
    } else {
        format!("{} is {state}", presence.peer)
    }
}
