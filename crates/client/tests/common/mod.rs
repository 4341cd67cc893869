//! In-memory STOMP server standing in for the chat backend.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use parley_client::{ChatConfig, ReconnectConfig, Transport, TransportError, WireChannel};
use parley_shared::stomp::{HEADER_DESTINATION, HEADER_ID, HEADER_MESSAGE, HEADER_SUBSCRIPTION};
use parley_shared::{Command, Frame};
use serde_json::Value;
use tokio::sync::oneshot;

/// How the server answers CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Accept,
    Reject,
    Silent,
}

struct Live {
    session: usize,
    to_client: UnboundedSender<String>,
    subscriptions: Vec<(String, String)>,
    hangup: Option<oneshot::Sender<()>>,
}

struct ServerState {
    reachable: bool,
    handshake: Handshake,
    opens: usize,
    received: Vec<Frame>,
    live: Option<Live>,
    next_message_id: u64,
}

#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                reachable: true,
                handshake: Handshake::Accept,
                opens: 0,
                received: Vec::new(),
                live: None,
                next_message_id: 0,
            })),
        }
    }
}

impl MockServer {
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    pub fn set_handshake(&self, handshake: Handshake) {
        self.state.lock().unwrap().handshake = handshake;
    }

    /// Number of transports opened so far.
    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn received(&self, command: Command) -> Vec<Frame> {
        self.state
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|f| f.command == command)
            .cloned()
            .collect()
    }

    /// JSON bodies of SEND frames addressed to `destination`.
    pub fn sent_to(&self, destination: &str) -> Vec<Value> {
        self.received(Command::Send)
            .into_iter()
            .filter(|f| f.get(HEADER_DESTINATION) == Some(destination))
            .map(|f| serde_json::from_str(&f.body).unwrap())
            .collect()
    }

    /// Destinations the live session is subscribed to.
    pub fn subscribed(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .live
            .as_ref()
            .map(|live| live.subscriptions.iter().map(|(_, d)| d.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliver `body` to every live subscription on `destination`. Returns
    /// how many subscriptions it reached.
    pub fn publish(&self, destination: &str, body: Value) -> usize {
        let mut state = self.state.lock().unwrap();
        state.next_message_id += 1;
        let message_id = state.next_message_id.to_string();
        let Some(live) = state.live.as_ref() else {
            return 0;
        };
        let mut delivered = 0;
        for (id, _) in live.subscriptions.iter().filter(|(_, d)| d == destination) {
            let frame = Frame::new(Command::Message)
                .header(HEADER_SUBSCRIPTION, id.as_str())
                .header(HEADER_DESTINATION, destination)
                .header("message-id", message_id.as_str())
                .body(body.to_string());
            if live.to_client.unbounded_send(frame.encode()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Sever the live connection from the server side.
    pub fn drop_connection(&self) {
        self.state.lock().unwrap().live = None;
    }

    /// Stop reading from the client while keeping the server side open, so
    /// client writes start failing but no close is observed.
    pub fn deafen(&self) {
        let hangup = self
            .state
            .lock()
            .unwrap()
            .live
            .as_mut()
            .and_then(|live| live.hangup.take());
        if let Some(hangup) = hangup {
            let _ = hangup.send(());
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().unwrap().live.is_some()
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn open(&self, _url: &str) -> Result<WireChannel, TransportError> {
        let (client_out, from_client) = unbounded::<String>();
        let (to_client, client_in) = unbounded::<String>();

        let (hangup, deafened) = oneshot::channel();
        let session = {
            let mut state = self.state.lock().unwrap();
            state.opens += 1;
            if !state.reachable {
                return Err(TransportError::Connection("connection refused".into()));
            }
            state.live = Some(Live {
                session: state.opens,
                to_client,
                subscriptions: Vec::new(),
                hangup: Some(hangup),
            });
            state.opens
        };

        tokio::spawn(serve(Arc::clone(&self.state), session, from_client, deafened));
        Ok(WireChannel {
            outgoing: client_out,
            incoming: client_in,
        })
    }
}

async fn serve(
    state: Arc<Mutex<ServerState>>,
    session: usize,
    mut from_client: UnboundedReceiver<String>,
    mut deafened: oneshot::Receiver<()>,
) {
    loop {
        let text = tokio::select! {
            next = from_client.next() => match next {
                Some(text) => text,
                None => break,
            },
            _ = &mut deafened => return,
        };
        let Ok(Some(frame)) = Frame::decode(&text) else {
            continue;
        };
        let mut state = state.lock().unwrap();
        state.received.push(frame.clone());
        let handshake = state.handshake;
        let Some(live) = state.live.as_mut().filter(|l| l.session == session) else {
            continue;
        };

        match frame.command {
            Command::Connect => match handshake {
                Handshake::Accept => {
                    let reply = Frame::new(Command::Connected).header("version", "1.2");
                    let _ = live.to_client.unbounded_send(reply.encode());
                }
                Handshake::Reject => {
                    let reply = Frame::new(Command::Error).header(HEADER_MESSAGE, "bad token");
                    let _ = live.to_client.unbounded_send(reply.encode());
                }
                Handshake::Silent => {}
            },
            Command::Subscribe => {
                if let (Some(id), Some(dest)) = (frame.get(HEADER_ID), frame.get(HEADER_DESTINATION)) {
                    live.subscriptions.push((id.to_string(), dest.to_string()));
                }
            }
            Command::Unsubscribe => {
                if let Some(id) = frame.get(HEADER_ID) {
                    live.subscriptions.retain(|(sub, _)| sub != id);
                }
            }
            _ => {}
        }
    }

    // Client closed its side
    let mut state = state.lock().unwrap();
    if state.live.as_ref().is_some_and(|l| l.session == session) {
        state.live = None;
    }
}

pub fn config() -> ChatConfig {
    ChatConfig {
        health_check_interval: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(10),
        typing_idle_timeout: Duration::from_secs(3),
        reconnect: ReconnectConfig {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        },
        ..ChatConfig::default()
    }
}

/// Let every spawned task run until idle. With paused time this advances
/// the clock by one millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
