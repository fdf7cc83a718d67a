//! In-memory broker used by connection and manager tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::mpsc;

use super::frame::{self, Command, Frame, Inbound};
use super::transport::{Connector, DialFuture, TransportEvent, TransportSession};
use crate::error::LinkError;

/// Connector that hands the broker side of every session to the test.
#[derive(Debug)]
pub(crate) struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    refuse: AtomicU32,
    dials: AtomicU32,
}

impl MockConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers,
            refuse: AtomicU32::new(0),
            dials: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// Fails the next `n` dials.
    pub(crate) fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub(crate) fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(&self, _url: &str) -> DialFuture {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Box::pin(async {
                Err(LinkError::Connection("connection refused".to_string()))
            });
        }

        let (outbound, out_rx) = mpsc::unbounded_channel();
        let (in_tx, inbound) = mpsc::unbounded_channel();
        let liveness = Arc::new(AtomicBool::new(true));
        let _ = self.servers.send(MockServer {
            events: in_tx,
            frames: out_rx,
            liveness: Arc::clone(&liveness),
        });
        Box::pin(async move {
            Ok(TransportSession {
                outbound,
                inbound,
                liveness,
            })
        })
    }
}

/// Broker side of one mock session.
#[derive(Debug)]
pub(crate) struct MockServer {
    events: mpsc::UnboundedSender<TransportEvent>,
    frames: mpsc::UnboundedReceiver<String>,
    liveness: Arc<AtomicBool>,
}

#[allow(clippy::panic)]
impl MockServer {
    /// Next frame written by the client, skipping heart-beats.
    pub(crate) async fn next_frame(&mut self) -> Frame {
        loop {
            let Some(text) = self.frames.recv().await else {
                panic!("client closed the session");
            };
            let Ok(units) = frame::decode(&text) else {
                panic!("client wrote a malformed frame: {text:?}");
            };
            if let Some(frame) = units.into_iter().find_map(|u| match u {
                Inbound::Frame(f) => Some(f),
                Inbound::Heartbeat => None,
            }) {
                return frame;
            }
        }
    }

    /// Next frame, asserting its command.
    pub(crate) async fn expect(&mut self, command: Command) -> Frame {
        let frame = self.next_frame().await;
        assert_eq!(frame.command, command, "unexpected frame {frame:?}");
        frame
    }

    /// Waits for the next bare heart-beat and returns when it arrived.
    pub(crate) async fn heartbeat(&mut self) -> tokio::time::Instant {
        loop {
            let Some(text) = self.frames.recv().await else {
                panic!("client closed the session");
            };
            if text == frame::HEARTBEAT {
                return tokio::time::Instant::now();
            }
        }
    }

    /// Completes the STOMP handshake without heart-beats.
    pub(crate) async fn accept(&mut self) -> Frame {
        let connect = self.expect(Command::Connect).await;
        self.reply(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", "0,0"),
        );
        connect
    }

    /// Returns `true` once the client has dropped the session, ignoring any
    /// frames still queued.
    pub(crate) async fn closed(&mut self) -> bool {
        while self.frames.recv().await.is_some() {}
        true
    }

    pub(crate) fn reply(&self, frame: Frame) {
        self.send_text(frame.encode());
    }

    pub(crate) fn send_text(&self, text: String) {
        let _ = self.events.send(TransportEvent::Message(text));
    }

    /// Delivers a `MESSAGE` frame.
    pub(crate) fn message(&self, subscription: &str, destination: &str, body: &str) {
        self.reply(
            Frame::new(Command::Message)
                .header("subscription", subscription)
                .header("destination", destination)
                .header("message-id", uuid::Uuid::new_v4().to_string())
                .with_body(body),
        );
    }

    /// Simulates the socket going away.
    pub(crate) fn drop_connection(&self, reason: &str) {
        self.liveness.store(false, Ordering::Release);
        let _ = self.events.send(TransportEvent::Closed(reason.to_string()));
    }

    /// Clears the liveness flag without closing the stream.
    pub(crate) fn go_silent(&self) {
        self.liveness.store(false, Ordering::Release);
    }
}
