//! In-process fan-out bus.
//!
//! A [`BusRegistry`] is constructed once and handed to every
//! [`BusTransport`]; rooms live inside it rather than in process globals,
//! so independent tests (or tenants) never see each other's traffic.
//!
//! Every envelope is encoded and decoded on the way through, so the bus
//! enforces exactly the same boundary checks as a network connection.
//! Fan-out happens under the registry lock, giving one total order per room.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use super::{Inbox, StateCell, Subscribers, Transport, TransportError, TransportState};
use crate::protocol::{decode, Envelope, MessageLimits, ProtocolError};

type Rooms = HashMap<String, BTreeMap<String, Subscribers>>;

/// Registry of bus rooms and their attached peers.
#[derive(Clone, Default)]
pub struct BusRegistry {
    rooms: Arc<Mutex<Rooms>>,
    limits: MessageLimits,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: MessageLimits) -> Self {
        Self {
            rooms: Arc::default(),
            limits,
        }
    }

    /// Create a transport for `peer_id` in `room`. It attaches on `open`.
    pub fn transport(&self, room: impl Into<String>, peer_id: impl Into<String>) -> BusTransport {
        BusTransport {
            registry: self.clone(),
            room: room.into(),
            peer_id: peer_id.into(),
            subscribers: Subscribers::default(),
            state: StateCell::new(),
        }
    }

    /// Peers currently attached to `room`, sorted.
    pub fn members(&self, room: &str) -> Vec<String> {
        self.lock()
            .get(room)
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, room: &str, peer: &str, subscribers: Subscribers) {
        self.lock()
            .entry(room.to_string())
            .or_default()
            .insert(peer.to_string(), subscribers);
        log::debug!("bus: {peer} joined room {room}");
    }

    fn detach(&self, room: &str, peer: &str) {
        let mut rooms = self.lock();
        if let Some(peers) = rooms.get_mut(room) {
            peers.remove(peer);
            if peers.is_empty() {
                rooms.remove(room);
            }
        }
        log::debug!("bus: {peer} left room {room}");
    }

    /// Deliver raw text from `from` to every other addressed peer.
    fn publish(&self, room: &str, from: &str, text: &str) -> Result<usize, ProtocolError> {
        let envelope = decode(text, &self.limits)?;
        let rooms = self.lock();
        let Some(peers) = rooms.get(room) else {
            return Ok(0);
        };
        let mut delivered = 0;
        for (peer, subscribers) in peers {
            if peer != from && envelope.is_for(peer) {
                delivered += subscribers.deliver(&envelope);
            }
        }
        log::trace!("bus: {from} -> {room}: {} to {delivered}", envelope.kind());
        Ok(delivered)
    }
}

/// One peer's endpoint on the bus.
pub struct BusTransport {
    registry: BusRegistry,
    room: String,
    peer_id: String,
    subscribers: Subscribers,
    state: StateCell,
}

impl BusTransport {
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Simulate a dropped link: detach and move to `Error`.
    pub fn sever(&self) {
        self.registry.detach(&self.room, &self.peer_id);
        self.state.set(TransportState::Error);
    }
}

#[async_trait]
impl Transport for BusTransport {
    fn local_id(&self) -> &str {
        &self.peer_id
    }

    async fn open(&self) -> Result<(), TransportError> {
        match self.state.get() {
            TransportState::Open => return Ok(()),
            TransportState::Error => {
                self.state.set(TransportState::Closed);
            }
            _ => {}
        }
        self.state.set(TransportState::Opening);
        self.registry
            .attach(&self.room, &self.peer_id, self.subscribers.clone());
        self.state.set(TransportState::Open);
        Ok(())
    }

    async fn close(&self) {
        self.registry.detach(&self.room, &self.peer_id);
        self.state.set(TransportState::Closed);
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let state = self.state.get();
        if state != TransportState::Open {
            return Err(TransportError::NotOpen(state));
        }
        let text = envelope.encode(&self.registry.limits)?;
        self.registry.publish(&self.room, &self.peer_id, &text)?;
        Ok(())
    }

    fn on_message(&self) -> Inbox {
        self.subscribers.subscribe()
    }

    fn on_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }
}

impl Drop for BusTransport {
    fn drop(&mut self) {
        if self.state.get() == TransportState::Open {
            self.registry.detach(&self.room, &self.peer_id);
        }
    }
}
