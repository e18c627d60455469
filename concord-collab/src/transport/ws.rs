//! WebSocket client transport.
//!
//! One persistent connection per transport. A writer task drains an mpsc
//! queue into the socket; a reader task decodes text frames and fans them
//! out to subscribers in arrival order. Subscribers survive reconnects:
//! `open` after a drop reuses the same fan-out.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{Inbox, StateCell, Subscribers, Transport, TransportError, TransportState};
use crate::protocol::{decode, Envelope, MessageLimits};

/// Outbound frames buffered ahead of the socket.
const WRITE_QUEUE: usize = 256;

pub struct WsTransport {
    url: String,
    local_id: String,
    limits: MessageLimits,
    subscribers: Subscribers,
    state: Arc<StateCell>,
    writer: Mutex<Option<mpsc::Sender<WsMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self::with_limits(url, local_id, MessageLimits::default())
    }

    pub fn with_limits(
        url: impl Into<String>,
        local_id: impl Into<String>,
        limits: MessageLimits,
    ) -> Self {
        Self {
            url: url.into(),
            local_id: local_id.into(),
            limits,
            subscribers: Subscribers::default(),
            state: Arc::new(StateCell::new()),
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    async fn open(&self) -> Result<(), TransportError> {
        match self.state.get() {
            TransportState::Open => return Ok(()),
            TransportState::Error => {
                self.state.set(TransportState::Closed);
            }
            _ => {}
        }
        self.abort_tasks();
        self.state.set(TransportState::Opening);

        let ws_stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::warn!("connect to {} failed: {e}", self.url);
                self.state.set(TransportState::Error);
                return Err(TransportError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(WRITE_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if ws_writer.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        let subscribers = self.subscribers.clone();
        let limits = self.limits.clone();
        let state = self.state.clone();
        let url = self.url.clone();
        let reader = tokio::spawn(async move {
            let mut failed = false;
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match decode(text.as_str(), &limits) {
                        Ok(envelope) => {
                            subscribers.deliver(&envelope);
                        }
                        Err(e) => log::warn!("dropping inbound message from {url}: {e}"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("websocket error from {url}: {e}");
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                state.set(TransportState::Error);
            } else {
                state.set(TransportState::Closed);
            }
            log::info!("connection to {url} ended");
        });

        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(out_tx);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([writer, reader]);
        self.state.set(TransportState::Open);
        log::info!("connected to {} as {}", self.url, self.local_id);
        Ok(())
    }

    async fn close(&self) {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = writer {
            let _ = tx.send(WsMessage::Close(None)).await;
        }
        self.abort_tasks();
        self.state.set(TransportState::Closed);
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let state = self.state.get();
        if state != TransportState::Open {
            return Err(TransportError::NotOpen(state));
        }
        let text = envelope.encode(&self.limits)?;
        let tx = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)?;
        tx.send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn on_message(&self) -> Inbox {
        self.subscribers.subscribe()
    }

    fn on_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_sets_error() {
        // Port 1 is never a websocket server.
        let t = WsTransport::new("ws://127.0.0.1:1", "c1");
        let err = t.open().await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
        assert_eq!(t.state(), TransportState::Error);
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let t = WsTransport::new("ws://127.0.0.1:1", "c1");
        let env = Envelope::new("c1", crate::protocol::Message::Hello { doc_id: "d".into() });
        assert!(matches!(t.send(env).await, Err(TransportError::NotOpen(_))));
    }
}
