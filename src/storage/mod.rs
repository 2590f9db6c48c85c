//! Storage module for persistent book data using Sled.
//!
//! This module provides the embedded database layer behind the editor: users,
//! books, per-book permission grants, and the page table the save protocol
//! replaces atomically. Page content is carried as raw JSON bytes and never
//! inspected here.

mod sled_store;

pub use sled_store::{BookStore, StorageError, StorageResult};

use serde::{Deserialize, Serialize};

/// Unique identifier for a user
pub type UserId = u64;

/// Unique identifier for a book
pub type BookId = u64;

/// A registered user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub email: String,
    /// Salted hash, opaque to everything but the auth module
    pub password_hash: String,
    /// Unix timestamp of registration
    pub created_at: i64,
}

/// Physical page format of a book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PageSize {
    A4,
    A5,
}

impl Default for PageSize {
    fn default() -> Self {
        PageSize::A4
    }
}

/// Page orientation of a book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Default for Orientation {
    fn default() -> Self {
        Orientation::Portrait
    }
}

/// A friendship book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRecord {
    pub id: BookId,
    pub title: String,
    pub description: String,
    pub owner_id: UserId,
    pub page_size: PageSize,
    pub orientation: Orientation,
    pub archived: bool,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of the last successful save, if any
    pub last_saved_at: Option<i64>,
}

impl BookRecord {
    pub fn new(id: BookId, owner_id: UserId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            owner_id,
            page_size: PageSize::default(),
            orientation: Orientation::default(),
            archived: false,
            created_at: chrono::Utc::now().timestamp(),
            last_saved_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_format(mut self, page_size: PageSize, orientation: Orientation) -> Self {
        self.page_size = page_size;
        self.orientation = orientation;
        self
    }
}

/// Role a user holds on a book. The derived order is the authorization scale:
/// an operation requiring role R succeeds iff the caller's role >= R.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

/// A persisted page row. Uniqueness of (book_id, page_number) is enforced by
/// key construction in the store. `content: None` is the explicit empty-content
/// marker for pages nobody drew on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub book_id: BookId,
    pub page_number: u32,
    /// Opaque serialized canvas document (JSON bytes), or None for a blank page
    pub content: Option<Vec<u8>>,
    /// Unix timestamp of the save that wrote this row
    pub updated_at: i64,
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/friendbook.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}
