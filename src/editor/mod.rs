//! Editor module for the page reconciliation core.
//!
//! This module implements the in-memory editing state of an open book:
//! - `ReconciliationEngine`: the overlay of pending page edits over the
//!   persisted snapshot, with its numbering invariants
//! - `SaveCoordinator`: the flatten-renumber-replace save protocol
//! - `EditSession` / `SessionManager`: per-session ownership of one engine
//!
//! Page content is an opaque JSON value throughout; the engine only ever asks
//! whether content is present, never what it contains.

pub mod engine;
pub mod save;
pub mod session;

pub use engine::ReconciliationEngine;
pub use session::SessionManager;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Client-local page label used for navigation before a save commits. Not
/// guaranteed dense; only the save assigns the persisted 1..N numbering.
pub type WorkingNumber = u32;

/// Opaque serialized canvas document. Absence (a blank page) is modeled as
/// `Option<PageContent>` rather than a sentinel value inside the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageContent(serde_json::Value);

impl PageContent {
    /// Wrap a canvas payload; JSON null means "nothing drawn" and maps to None.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            other => Some(PageContent(other)),
        }
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// Serialize for the page table
    pub fn to_blob(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }

    /// Deserialize from a page row; unreadable or null blobs count as blank
    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        serde_json::from_slice(blob).ok().and_then(Self::from_value)
    }
}

/// Where an overlay entry came from: a page that exists in the persisted
/// snapshot, or one created in this session and never saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageOrigin {
    Existing,
    New,
}

/// A pending edit for one working page number
#[derive(Debug, Clone)]
pub struct OverlayEntry {
    pub origin: PageOrigin,
    /// None until the user draws something on the page
    pub content: Option<PageContent>,
}

/// Result type for editor operations
pub type EditorResult<T> = Result<T, EditorError>;

/// Errors surfaced by the editing core. The variants deliberately distinguish
/// "nothing happened, try again" (InvariantViolation, NotReady) from "your
/// draft edits are safe but not saved" (Persistence) from "you are not allowed
/// to do this" (Forbidden).
#[derive(Error, Debug)]
pub enum EditorError {
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The save transaction failed or rolled back. The overlay is preserved
    /// unchanged so the caller may retry without losing edits.
    #[error("persistence failure (draft edits retained): {0}")]
    Persistence(#[from] StorageError),

    #[error("editing surface not ready")]
    NotReady,
}
