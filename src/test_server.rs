//! A local WebSocket server for exercising the scenario in tests.

use futures_util::SinkExt;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    /// Announces the join, then echoes every text back with the sender's user.
    Echo,
    /// Like `Echo` but replaces every echoed text.
    EchoText(&'static str),
    /// Reads everything, answers nothing.
    Silent,
    /// Closes the connection right after the join.
    Hangup,
    /// Answers the join with a frame that is not JSON.
    Garbage,
    /// Stops reading after the join, so the client's writes eventually block.
    Stall,
}

/// A text frame as seen by the server.
#[derive(Debug)]
pub struct Frame {
    pub at: Instant,
    pub text: String,
}

pub struct TestServer {
    pub url: String,
    /// Every text frame received by the server, in arrival order.
    pub frames: mpsc::UnboundedReceiver<Frame>,
}

impl TestServer {
    pub async fn start(behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frames_tx, frames) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, behaviour, frames_tx.clone()));
            }
        });
        Self { url, frames }
    }

    /// A URL nothing listens on.
    pub async fn unused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }
}

async fn serve(stream: TcpStream, behaviour: Behaviour, frames: mpsc::UnboundedSender<Frame>) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    let Some(Ok(Message::Text(join))) = ws.next().await else {
        return;
    };
    let join = join.to_string();
    let _ = frames.send(Frame {
        at: Instant::now(),
        text: join.clone(),
    });
    let user = serde_json::from_str::<Value>(&join)
        .ok()
        .and_then(|join| join.get("user").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    match behaviour {
        Behaviour::Hangup => {
            let _ = ws.close(None).await;
            return;
        }
        Behaviour::Garbage => {
            let _ = ws.send(Message::text("not json")).await;
        }
        Behaviour::Echo | Behaviour::EchoText(_) => {
            let joined = json!({"type": "Joined", "user": user}).to_string();
            let _ = ws.send(Message::text(joined)).await;
        }
        Behaviour::Stall => {
            // Keep the socket open without ever reading from it again.
            std::future::pending::<()>().await;
        }
        Behaviour::Silent => {}
    }

    while let Some(Ok(frame)) = ws.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let text = text.to_string();
        let _ = frames.send(Frame {
            at: Instant::now(),
            text: text.clone(),
        });
        let echoed = match behaviour {
            Behaviour::Echo => serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|value| value.get("text").and_then(Value::as_str).map(str::to_string)),
            Behaviour::EchoText(replacement) => Some(replacement.to_string()),
            _ => None,
        };
        if let Some(echoed) = echoed {
            let reply = json!({"type": "Message", "user": user, "text": echoed}).to_string();
            if ws.send(Message::text(reply)).await.is_err() {
                break;
            }
        }
    }
}
