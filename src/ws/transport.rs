//! Transport seam between a connection task and the network.
//!
//! A [`Connector`] dials a broker and returns a [`TransportSession`]: an
//! outbound text channel, an inbound event channel and a liveness flag.
//! The production [`WebSocketConnector`] splits a `tokio-tungstenite`
//! stream into a reader task and a writer task; dropping the session's
//! outbound sender closes the socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::LinkError;

/// Event produced by the transport reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text message from the broker.
    Message(String),
    /// The socket closed or failed; no further events follow.
    Closed(String),
}

/// One live transport session.
#[derive(Debug)]
pub struct TransportSession {
    /// Outbound text messages. Dropping the sender closes the socket once
    /// queued messages are written.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Inbound events, in arrival order.
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
    /// Cleared by the transport when the socket goes away.
    pub liveness: Arc<AtomicBool>,
}

impl TransportSession {
    /// Returns `true` while the underlying socket is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.liveness.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Queues a text message.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Connection`] if the writer has gone away.
    pub fn send(&self, text: String) -> Result<(), LinkError> {
        self.outbound
            .send(text)
            .map_err(|_| LinkError::Connection("transport closed".to_string()))
    }
}

/// Future returned by [`Connector::connect`].
pub type DialFuture = BoxFuture<'static, Result<TransportSession, LinkError>>;

/// Opens transport sessions.
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Dials `url`.
    fn connect(&self, url: &str) -> DialFuture;
}

/// [`Connector`] speaking WebSocket through `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, url: &str) -> DialFuture {
        let url = url.to_string();
        Box::pin(async move {
            let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| LinkError::Connection(format!("dial {url}: {e}")))?;
            let (mut sink, mut stream) = socket.split();

            let (outbound, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, inbound) = mpsc::unbounded_channel();
            let liveness = Arc::new(AtomicBool::new(true));

            let writer_live = Arc::clone(&liveness);
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        tracing::debug!(error = %e, "websocket write failed");
                        break;
                    }
                }
                let _ = sink.close().await;
                writer_live.store(false, Ordering::Release);
            });

            let reader_live = Arc::clone(&liveness);
            tokio::spawn(async move {
                let reason = loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx
                                .send(TransportEvent::Message(text.as_str().to_owned()))
                                .is_err()
                            {
                                break "session dropped".to_string();
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let Ok(text) = String::from_utf8(bytes.to_vec()) else {
                                tracing::warn!("dropping non-UTF-8 binary message");
                                continue;
                            };
                            if in_tx.send(TransportEvent::Message(text)).is_err() {
                                break "session dropped".to_string();
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map_or_else(
                                || "closed by broker".to_string(),
                                |f| {
                                    format!(
                                        "closed by broker ({}): {}",
                                        u16::from(f.code),
                                        f.reason.as_str()
                                    )
                                },
                            );
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    }
                };
                reader_live.store(false, Ordering::Release);
                let _ = in_tx.send(TransportEvent::Closed(reason));
            });

            Ok(TransportSession {
                outbound,
                inbound,
                liveness,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_reports_closed_writer() {
        let (outbound, out_rx) = mpsc::unbounded_channel();
        let (_in_tx, inbound) = mpsc::unbounded_channel();
        let session = TransportSession {
            outbound,
            inbound,
            liveness: Arc::new(AtomicBool::new(true)),
        };
        assert!(session.is_connected());
        tokio_test::assert_ok!(session.send("x".into()));

        drop(out_rx);
        assert!(!session.is_connected());
        assert!(matches!(
            session.send("y".into()),
            Err(LinkError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn dial_failure_is_a_connection_error() {
        let result = WebSocketConnector.connect("ws://127.0.0.1:1/ws").await;
        assert!(matches!(result, Err(LinkError::Connection(_))));
    }
}
