//! Parley client - terminal entry point
//!
//! Joins one group conversation and relays stdin to it.
//!
//! Usage: `parley-client <user-id> <username> <group-id>` with the bearer
//! token in `PARLEY_TOKEN`. Lines starting with `/react <message-id> <emoji>`
//! toggle a reaction; `/quit` leaves.

use anyhow::{bail, Context, Result};
use parley_client::{ChatClient, ChatConfig, ChatEvent, CurrentUser, SharedToken, WebSocketTransport};
use parley_shared::{ConversationKey, MessageType};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("parley_client=debug")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [user_id, username, group_id] = args.as_slice() else {
        bail!("usage: parley-client <user-id> <username> <group-id>");
    };
    let user = CurrentUser::new(user_id.parse().context("user id must be a number")?, username);
    let group_id = group_id.parse().context("group id must be a number")?;
    let key = ConversationKey::Group(group_id);

    let config = ChatConfig::from_env().context("invalid configuration")?;
    let token = std::env::var("PARLEY_TOKEN").context("PARLEY_TOKEN is not set")?;

    let client = ChatClient::new(config, WebSocketTransport, SharedToken::new(token), user);
    client.connect().await.context("failed to connect")?;
    let conversation = client
        .open_conversation(key)
        .context("connection dropped before subscribing")?;

    let mut events = client.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChatEvent::GroupMessageReceived { message, .. } => {
                    println!(
                        "[{}] {}: {}",
                        message.id.unwrap_or_default(),
                        message.sender.username,
                        message.content
                    );
                }
                ChatEvent::ConnectionStateChanged(state) => println!("* {:?}", state),
                ChatEvent::NotificationReceived(body) => println!("* notification {}", body),
                ChatEvent::RoomEventReceived(body) => println!("* room event {}", body),
                ChatEvent::PingResponse(_) => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if let Some(rest) = line.strip_prefix("/react ") {
            let mut parts = rest.split_whitespace();
            match (parts.next().and_then(|id| id.parse().ok()), parts.next()) {
                (Some(message_id), Some(emoji)) => {
                    match client.toggle_reaction(group_id, message_id, emoji) {
                        Ok(transition) => println!("* {:?}", transition),
                        Err(e) => println!("! {}", e),
                    }
                    if let Some(view) = client.reaction_view(key, message_id) {
                        println!("* reactions {:?}", view.counts);
                    }
                }
                _ => println!("! usage: /react <message-id> <emoji>"),
            }
            continue;
        }

        if let Err(e) = client.send_message(key, line, MessageType::Text) {
            println!("! {}", e);
        }
    }

    conversation.close();
    client.disconnect();
    Ok(())
}
