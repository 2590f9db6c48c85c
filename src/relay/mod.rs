//! Collaboration relay: best-effort fan-out of canvas updates per book.
//!
//! The relay is advisory only. Delivery is not guaranteed, ordering between
//! two broadcasts is not guaranteed, and receivers are expected to treat a
//! missed or duplicated update as harmless: the persisted page store, not
//! this channel, is the source of truth.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::storage::BookId;

/// A page-content-changed notification, opaque content included so viewers
/// on the same page can repaint without a round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasUpdate {
    pub book_id: BookId,
    pub page_number: u32,
    pub content: serde_json::Value,
}

/// Unique identifier for a connected relay client
pub type ClientId = Uuid;

type Room = DashMap<ClientId, mpsc::UnboundedSender<CanvasUpdate>>;

/// Room-per-book broadcast registry
#[derive(Default)]
pub struct CollaborationRelay {
    rooms: DashMap<BookId, Room>,
}

impl CollaborationRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a book's room; events broadcast by other clients arrive on the
    /// returned receiver.
    pub fn subscribe(&self, book_id: BookId, client_id: ClientId) -> mpsc::UnboundedReceiver<CanvasUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms.entry(book_id).or_default().insert(client_id, tx);
        debug!(book_id, %client_id, "client joined book room");
        rx
    }

    /// Leave a room; the room itself is dropped once empty
    pub fn unsubscribe(&self, book_id: BookId, client_id: ClientId) {
        if let Some(room) = self.rooms.get(&book_id) {
            room.remove(&client_id);
        }
        self.rooms
            .remove_if(&book_id, |_, room| room.is_empty());
        debug!(book_id, %client_id, "client left book room");
    }

    /// Send an update to every other subscriber of the book's room.
    /// Fire-and-forget: closed receivers and missing rooms are ignored.
    pub fn broadcast(&self, from: ClientId, update: CanvasUpdate) {
        if let Some(room) = self.rooms.get(&update.book_id) {
            for entry in room.iter() {
                if *entry.key() != from {
                    let _ = entry.value().send(update.clone());
                }
            }
        }
    }

    /// Number of active rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
