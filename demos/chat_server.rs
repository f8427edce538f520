//! Room-broadcast chat server to point the load test at.
//!
//! Run with: cargo run --example chat_server [addr]

use hashbrown::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_tungstenite::tungstenite::Message;

const DEFAULT_ADDR: &str = "0.0.0.0:6789";
const CHANNEL_CAPACITY: usize = 100;

type Rooms = Arc<Mutex<HashMap<String, RoomEntry>>>;

// A registered room and the number of connections currently inside it. The entry is removed
// when that number drops to zero, which drops the last handle and ends the room task.
struct RoomEntry {
    handle: RoomHandle,
    connections: usize,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Accepting connections at {}", addr);

    let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));
    loop {
        let (stream, peer) = listener.accept().await?;
        let rooms = rooms.clone();
        tokio::spawn(async move {
            if let Err(err) = accept_connection(stream, rooms).await {
                tracing::debug!("Connection from {} failed: {:#}", peer, err);
            }
        });
    }
}

/// What clients send: a join first, then any number of texts.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientMessage {
    Join { room: String, user: String },
    Text { text: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    Message { user: String, text: String },
    Joined { user: String },
    Left { user: String },
}

async fn accept_connection(stream: TcpStream, rooms: Rooms) -> anyhow::Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    let Some(frame) = ws.next().await else {
        return Ok(());
    };
    let (room, user) = match frame? {
        Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text)? {
            ClientMessage::Join { room, user } => (room, user),
            ClientMessage::Text { .. } => anyhow::bail!("Expected a join message first"),
        },
        _ => return Ok(()),
    };
    tracing::debug!("{} is joining {}", user, room);

    let handle = enter_room(&rooms, &room);
    let res = handle.join(user, ws).await;
    drop(handle);
    leave_room(&rooms, &room);
    res
}

fn enter_room(rooms: &Rooms, room: &str) -> RoomHandle {
    let mut rooms = rooms.lock().unwrap_or_else(|e| e.into_inner());
    let entry = rooms.entry(room.to_string()).or_insert_with(|| RoomEntry {
        handle: RoomHandle::start(room.to_string()),
        connections: 0,
    });
    entry.connections += 1;
    entry.handle.clone()
}

fn leave_room(rooms: &Rooms, room: &str) {
    let mut rooms = rooms.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = rooms.get_mut(room) {
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections == 0 {
            rooms.remove(room);
        }
    }
}

#[derive(Debug)]
enum RoomEvent {
    Join(Member, oneshot::Sender<u64>),
    Text(String, String),
    Leave(u64),
}

#[derive(Debug)]
struct Member {
    user: String,
    sender: mpsc::Sender<Message>,
}

// A room owns its members and processes events one at a time on its own task, so the
// member map needs no locking.
struct Room {
    name: String,
    members: HashMap<u64, Member>,
    next_member_id: u64,
}

impl Room {
    async fn listen(mut self, mut event_rx: mpsc::Receiver<RoomEvent>) {
        while let Some(event) = event_rx.recv().await {
            match event {
                RoomEvent::Join(member, id_tx) => {
                    let id = self.next_member_id;
                    self.next_member_id += 1;
                    let user = member.user.clone();
                    self.members.insert(id, member);
                    let _ = id_tx.send(id);
                    self.broadcast(ServerMessage::Joined { user }).await;
                }
                RoomEvent::Text(user, text) => {
                    self.broadcast(ServerMessage::Message { user, text }).await;
                }
                RoomEvent::Leave(id) => {
                    if let Some(member) = self.members.remove(&id) {
                        self.broadcast(ServerMessage::Left { user: member.user })
                            .await;
                    }
                }
            }
        }
        tracing::debug!("Room {} closed", self.name);
    }

    async fn broadcast(&mut self, message: ServerMessage) {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!("Failed to encode {:?}: {}", message, err);
                return;
            }
        };
        let mut gone = Vec::new();
        for (id, member) in &self.members {
            if member.sender.send(Message::text(json.clone())).await.is_err() {
                gone.push(*id);
            }
        }
        for id in gone {
            self.members.remove(&id);
        }
    }
}

#[derive(Clone)]
struct RoomHandle {
    event_tx: mpsc::Sender<RoomEvent>,
}

impl RoomHandle {
    fn start(name: String) -> Self {
        tracing::info!("Opening room {}", name);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let room = Room {
            name,
            members: HashMap::new(),
            next_member_id: 0,
        };
        tokio::spawn(room.listen(event_rx));
        Self { event_tx }
    }

    async fn join(
        &self,
        user: String,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    ) -> anyhow::Result<()> {
        let (id_tx, id_rx) = oneshot::channel();
        let (sender, mut outbound) = mpsc::channel(CHANNEL_CAPACITY);
        self.event_tx
            .send(RoomEvent::Join(
                Member {
                    user: user.clone(),
                    sender,
                },
                id_tx,
            ))
            .await?;
        let id = id_rx.await?;

        let (mut write, mut read) = futures_util::StreamExt::split(ws);

        // Forward room broadcasts to the socket until either side goes away.
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(frame)) = read.next().await {
            let Message::Text(text) = frame else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Text { text }) => {
                    self.event_tx
                        .send(RoomEvent::Text(user.clone(), text))
                        .await?;
                }
                Ok(ClientMessage::Join { .. }) => {
                    tracing::debug!("{} sent a second join, ignoring it", user);
                }
                Err(err) => tracing::debug!("Ignoring frame from {}: {}", user, err),
            }
        }

        self.event_tx.send(RoomEvent::Leave(id)).await?;
        writer.abort();
        tracing::debug!("{} left", user);
        Ok(())
    }
}
