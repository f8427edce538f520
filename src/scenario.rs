use std::sync::Arc;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::checks::{Checks, STATUS_IS_101};
use crate::config::Config;
use crate::session::{RunCounter, Session, TextMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// The chat scenario run by every VU: join a room, send a burst of messages and wait until
// all of them come back. A single instance is shared by all VUs, so everything that changes
// between iterations lives in the Session each iteration derives from the shared counter.
pub struct Scenario {
    url: String,
    rooms: u64,
    messages: usize,
    send_delay: Duration,
    counter: Arc<RunCounter>,
    checks: Arc<Checks>,
}

/// How the connection of an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// Every test message came back and the client closed the connection.
    Completed,
    /// The server closed the connection or the stream ended first.
    ClosedByPeer,
    /// The runtime stopped the iteration.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub room: String,
    pub user: String,
    pub sent: usize,
    pub received: usize,
    pub ending: Ending,
    pub upgrade_status: Option<u16>,
}

impl Outcome {
    fn new(session: &Session) -> Self {
        Self {
            room: session.room.clone(),
            user: session.user.clone(),
            sent: 0,
            received: 0,
            ending: Ending::Interrupted,
            upgrade_status: None,
        }
    }
}

impl Scenario {
    pub fn new(config: &Config, counter: Arc<RunCounter>, checks: Arc<Checks>) -> Self {
        Self {
            url: config.url.clone(),
            rooms: config.rooms,
            messages: config.messages,
            send_delay: config.send_delay,
            counter,
            checks,
        }
    }

    pub async fn iteration(&self, interrupt: &CancellationToken) -> anyhow::Result<Outcome> {
        let session = Session::next(&self.counter, self.rooms);
        let mut outcome = Outcome::new(&session);
        tracing::debug!(room = %session.room, user = %session.user, "Connecting");

        // The interrupt can arrive while we are still connecting. Nothing was opened yet, so
        // there is no upgrade to check and we leave without recording anything.
        let connected = tokio::select! {
            res = connect_async(self.url.as_str()) => res,
            _ = interrupt.cancelled() => return Ok(outcome),
        };
        let (socket, response) = match connected {
            Ok(connected) => connected,
            Err(err) => {
                self.checks.record(STATUS_IS_101, false);
                return Err(err).with_context(|| format!("Failed to connect to {}", self.url));
            }
        };
        let status = response.status().as_u16();
        outcome.upgrade_status = Some(status);

        // Any error from here on aborts the iteration before the check, the same way a
        // malformed frame does. Only a connection that ended (by us, the server or the
        // interrupt) gets its upgrade status checked.
        let ending = self.exchange(&session, socket, interrupt, &mut outcome).await?;
        outcome.ending = ending;
        self.checks.record(STATUS_IS_101, status == 101);
        tracing::debug!(
            room = %outcome.room,
            user = %outcome.user,
            sent = outcome.sent,
            received = outcome.received,
            ending = ?outcome.ending,
            upgrade_status = ?outcome.upgrade_status,
            "Iteration finished"
        );
        Ok(outcome)
    }

    async fn exchange(
        &self,
        session: &Session,
        socket: Socket,
        interrupt: &CancellationToken,
        outcome: &mut Outcome,
    ) -> anyhow::Result<Ending> {
        let (mut write, mut read) = futures_util::StreamExt::split(socket);

        let join = serde_json::to_string(&session.join_message())?;
        write
            .send(Message::text(join))
            .await
            .context("Failed to send join message")?;

        // The join is out, so the burst timer starts now. It fires exactly once and races with
        // the inbound frames: echoes of other users (or even ours, from an earlier connection)
        // may arrive before it fires, and ours may arrive while the burst is still going out.
        let burst = tokio::time::sleep(self.send_delay);
        tokio::pin!(burst);
        let mut burst_sent = false;

        loop {
            tokio::select! {
                _ = interrupt.cancelled() => return Ok(Ending::Interrupted),
                _ = &mut burst, if !burst_sent => {
                    burst_sent = true;
                    // A server that stops reading makes these writes block, so the interrupt
                    // has to be able to cut the burst short as well.
                    tokio::select! {
                        res = send_burst(&mut write, self.messages, &mut outcome.sent) => res?,
                        _ = interrupt.cancelled() => return Ok(Ending::Interrupted),
                    }
                    tracing::trace!(user = %session.user, sent = outcome.sent, "Burst sent");
                }
                frame = read.next() => {
                    let frame = match frame {
                        Some(frame) => frame.context("Failed to read from socket")?,
                        None => return Ok(Ending::ClosedByPeer),
                    };
                    match frame {
                        Message::Text(text) => {
                            let message: serde_json::Value = serde_json::from_str(&text)
                                .with_context(|| format!("Received malformed JSON: {:?}", &*text))?;
                            // Joined/Left announcements and other users' messages are skipped.
                            if session.is_echo(&message) {
                                outcome.received += 1;
                                if outcome.received == self.messages {
                                    write
                                        .send(Message::Close(None))
                                        .await
                                        .context("Failed to close connection")?;
                                    return Ok(Ending::Completed);
                                }
                            }
                        }
                        Message::Close(_) => return Ok(Ending::ClosedByPeer),
                        _ => {}
                    }
                }
            }
        }
    }
}

// Sends the numbered test messages back to back, without waiting for anything in between.
async fn send_burst(
    write: &mut SplitSink<Socket, Message>,
    messages: usize,
    sent: &mut usize,
) -> anyhow::Result<()> {
    for i in 0..messages {
        let text = serde_json::to_string(&TextMessage::numbered(i))?;
        write
            .send(Message::text(text))
            .await
            .context("Failed to send test message")?;
        *sent += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{Behaviour, TestServer};
    use serde_json::json;

    fn scenario(url: &str) -> (Scenario, Arc<Checks>) {
        scenario_with(url, |_| {})
    }

    fn scenario_with(url: &str, configure: impl FnOnce(&mut Config)) -> (Scenario, Arc<Checks>) {
        let mut config = Config::default();
        config.url = url.to_string();
        config.send_delay = Duration::from_millis(50);
        configure(&mut config);
        let checks = Arc::new(Checks::new());
        let scenario = Scenario::new(&config, Arc::new(RunCounter::new()), checks.clone());
        (scenario, checks)
    }

    fn interrupt_after(delay: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            child.cancel();
        });
        token
    }

    #[tokio::test]
    async fn completes_after_all_echoes() {
        let mut server = TestServer::start(Behaviour::Echo).await;
        let (scenario, checks) = scenario(&server.url);

        let outcome = scenario
            .iteration(&interrupt_after(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(outcome.ending, Ending::Completed);
        assert_eq!(outcome.room, "room-0");
        assert_eq!(outcome.sent, 10);
        assert_eq!(outcome.received, 10);
        assert_eq!(outcome.upgrade_status, Some(101));

        let summary = checks.summary();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].name, STATUS_IS_101);
        assert_eq!((summary[0].passes, summary[0].fails), (1, 0));

        let join = server.frames.recv().await.unwrap();
        let join: serde_json::Value = serde_json::from_str(&join.text).unwrap();
        assert_eq!(join, json!({"room": "room-0", "user": outcome.user}));
        for i in 0..10 {
            let frame = server.frames.recv().await.unwrap();
            assert_eq!(frame.text, format!(r#"{{"text":"test: {}"}}"#, i));
        }
    }

    #[tokio::test]
    async fn burst_waits_for_send_delay() {
        let mut server = TestServer::start(Behaviour::Silent).await;
        let (scenario, _) = scenario_with(&server.url, |config| {
            config.send_delay = Duration::from_millis(400);
        });

        let outcome = scenario
            .iteration(&interrupt_after(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(outcome.sent, 10);

        let join = server.frames.recv().await.unwrap();
        let first = server.frames.recv().await.unwrap();
        assert_eq!(first.text, r#"{"text":"test: 0"}"#);
        // Both timestamps are taken on arrival, so allow for the join travelling slower
        // than the first test frame.
        let gap = first.at - join.at;
        assert!(gap >= Duration::from_millis(380), "burst came {:?} after the join", gap);
    }

    #[tokio::test]
    async fn interrupt_cuts_a_blocked_burst_short() {
        let server = TestServer::start(Behaviour::Stall).await;
        // Enough frames to fill the socket buffers of a peer that stopped reading.
        let (scenario, checks) = scenario_with(&server.url, |config| {
            config.messages = 1_000_000;
            config.send_delay = Duration::ZERO;
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            scenario.iteration(&interrupt_after(Duration::from_millis(500))),
        )
        .await
        .expect("interrupt did not stop the burst")
        .unwrap();
        assert_eq!(outcome.ending, Ending::Interrupted);
        assert!(outcome.sent > 0);
        assert!(outcome.sent < 1_000_000);
        assert_eq!(checks.summary()[0].passes, 1);
    }

    #[tokio::test]
    async fn rooms_advance_between_iterations() {
        let server = TestServer::start(Behaviour::Echo).await;
        let (scenario, _) = scenario(&server.url);
        let interrupt = interrupt_after(Duration::from_secs(10));

        let first = scenario.iteration(&interrupt).await.unwrap();
        let second = scenario.iteration(&interrupt).await.unwrap();
        assert_eq!(first.room, "room-0");
        assert_eq!(second.room, "room-1");
        assert_ne!(first.user, second.user);
    }

    #[tokio::test]
    async fn prefix_match_counts_as_echo() {
        let server = TestServer::start(Behaviour::EchoText("testing")).await;
        let (scenario, _) = scenario(&server.url);

        let outcome = scenario
            .iteration(&interrupt_after(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(outcome.ending, Ending::Completed);
        assert_eq!(outcome.received, 10);
    }

    #[tokio::test]
    async fn silent_server_runs_until_interrupted() {
        let mut server = TestServer::start(Behaviour::Silent).await;
        let (scenario, checks) = scenario(&server.url);

        let outcome = scenario
            .iteration(&interrupt_after(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(outcome.ending, Ending::Interrupted);
        assert_eq!(outcome.sent, 10);
        assert_eq!(outcome.received, 0);
        assert_eq!(checks.summary()[0].passes, 1);

        // Join plus the whole burst reached the server.
        for _ in 0..11 {
            assert!(server.frames.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn server_hangup_ends_iteration() {
        let server = TestServer::start(Behaviour::Hangup).await;
        let (scenario, checks) = scenario(&server.url);

        let outcome = scenario
            .iteration(&interrupt_after(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(outcome.ending, Ending::ClosedByPeer);
        assert_eq!(outcome.received, 0);
        assert_eq!(checks.summary()[0].passes, 1);
    }

    #[tokio::test]
    async fn malformed_json_aborts_without_check() {
        let server = TestServer::start(Behaviour::Garbage).await;
        let (scenario, checks) = scenario(&server.url);

        let err = scenario
            .iteration(&interrupt_after(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("malformed JSON"));
        assert!(checks.summary().is_empty());
    }

    #[tokio::test]
    async fn connect_failure_fails_check() {
        let url = TestServer::unused_url().await;
        let (scenario, checks) = scenario(&url);

        let err = scenario
            .iteration(&interrupt_after(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to connect"));
        let summary = checks.summary();
        assert_eq!((summary[0].passes, summary[0].fails), (0, 1));
    }
}
