//! Sled-based store for users, books, permissions and pages.
//!
//! All cross-tree mutations that must be all-or-nothing (book creation with the
//! creator's admin grant, the replace-all-pages save, book deletion cascades)
//! go through `sled::Transactional` so a failure at any step leaves every tree
//! as it was before the attempt.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{
    BookId, BookRecord, Orientation, PageRecord, PageSize, Role, StorageConfig, UserId, UserRecord,
};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

impl StorageError {
    fn from_tx(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::Sled(e),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree names for different data types
const TREE_USERS: &str = "users";
const TREE_USERS_BY_EMAIL: &str = "users_by_email";
const TREE_USERS_BY_NAME: &str = "users_by_name";
const TREE_BOOKS: &str = "books";
const TREE_PERMISSIONS: &str = "permissions";
const TREE_PAGES: &str = "pages";

fn user_key(id: UserId) -> [u8; 8] {
    id.to_be_bytes()
}

fn book_key(id: BookId) -> [u8; 8] {
    id.to_be_bytes()
}

/// Permission rows are keyed (book_id, user_id), which enforces the
/// at-most-one-role-per-pair invariant structurally.
fn perm_key(book_id: BookId, user_id: UserId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&book_id.to_be_bytes());
    key[8..].copy_from_slice(&user_id.to_be_bytes());
    key
}

/// Page rows are keyed (book_id, page_number) in big-endian so one prefix scan
/// yields a book's pages in page order.
fn page_key(book_id: BookId, page_number: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&book_id.to_be_bytes());
    key[8..].copy_from_slice(&page_number.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

/// Sled-backed store for the friendship book tables
#[derive(Clone)]
pub struct BookStore {
    db: Arc<Db>,
    users: Tree,
    users_by_email: Tree,
    users_by_name: Tree,
    books: Tree,
    permissions: Tree,
    pages: Tree,
}

impl BookStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let users = db.open_tree(TREE_USERS)?;
        let users_by_email = db.open_tree(TREE_USERS_BY_EMAIL)?;
        let users_by_name = db.open_tree(TREE_USERS_BY_NAME)?;
        let books = db.open_tree(TREE_BOOKS)?;
        let permissions = db.open_tree(TREE_PERMISSIONS)?;
        let pages = db.open_tree(TREE_PAGES)?;

        Ok(Self {
            db: Arc::new(db),
            users,
            users_by_email,
            users_by_name,
            books,
            permissions,
            pages,
        })
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Create a user. Username and email uniqueness is checked and the index
    /// trees are written in the same transaction as the user row.
    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> StorageResult<UserRecord> {
        let user = UserRecord {
            id: self.db.generate_id()?,
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let user_bytes = bincode::serialize(&user)?;

        (&self.users, &self.users_by_email, &self.users_by_name)
            .transaction(|(users, by_email, by_name)| {
                if by_email.get(email.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        StorageError::AlreadyExists(format!("email {}", email)),
                    ));
                }
                if by_name.get(username.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        StorageError::AlreadyExists(format!("username {}", username)),
                    ));
                }
                users.insert(&user_key(user.id)[..], user_bytes.as_slice())?;
                by_email.insert(email.as_bytes(), &user_key(user.id)[..])?;
                by_name.insert(username.as_bytes(), &user_key(user.id)[..])?;
                Ok(())
            })
            .map_err(StorageError::from_tx)?;

        Ok(user)
    }

    /// Load a user by id
    pub fn get_user(&self, id: UserId) -> StorageResult<Option<UserRecord>> {
        match self.users.get(user_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Look up a user by email (login path)
    pub fn get_user_by_email(&self, email: &str) -> StorageResult<Option<UserRecord>> {
        match self.users_by_email.get(email.as_bytes())? {
            Some(id_bytes) => match decode_u64(&id_bytes) {
                Some(id) => self.get_user(id),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Check whether a username is still free
    pub fn username_available(&self, username: &str) -> StorageResult<bool> {
        Ok(self.users_by_name.get(username.as_bytes())?.is_none())
    }

    /// Rename a user, keeping the name index consistent
    pub fn update_username(&self, id: UserId, new_username: &str) -> StorageResult<()> {
        let mut user = self
            .get_user(id)?
            .ok_or_else(|| StorageError::NotFound(format!("user {}", id)))?;
        let old_username = user.username.clone();
        user.username = new_username.to_string();
        let user_bytes = bincode::serialize(&user)?;

        (&self.users, &self.users_by_name)
            .transaction(|(users, by_name)| {
                if let Some(existing) = by_name.get(new_username.as_bytes())? {
                    if decode_u64(&existing) != Some(id) {
                        return Err(ConflictableTransactionError::Abort(
                            StorageError::AlreadyExists(format!("username {}", new_username)),
                        ));
                    }
                }
                by_name.remove(old_username.as_bytes())?;
                by_name.insert(new_username.as_bytes(), &user_key(id)[..])?;
                users.insert(&user_key(id)[..], user_bytes.as_slice())?;
                Ok(())
            })
            .map_err(StorageError::from_tx)?;

        Ok(())
    }

    /// Replace a user's password hash
    pub fn update_password(&self, id: UserId, password_hash: &str) -> StorageResult<()> {
        let mut user = self
            .get_user(id)?
            .ok_or_else(|| StorageError::NotFound(format!("user {}", id)))?;
        user.password_hash = password_hash.to_string();
        self.users.insert(user_key(id), bincode::serialize(&user)?)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Books and permissions
    // ------------------------------------------------------------------

    /// Create a book. The creating user is granted admin in the same
    /// transaction, so a book can never exist without its owner's grant.
    pub fn create_book(
        &self,
        owner_id: UserId,
        title: &str,
        description: &str,
        page_size: PageSize,
        orientation: Orientation,
    ) -> StorageResult<BookRecord> {
        let book = BookRecord::new(self.db.generate_id()?, owner_id, title)
            .with_description(description)
            .with_format(page_size, orientation);
        let book_bytes = bincode::serialize(&book)?;
        let role_bytes = bincode::serialize(&Role::Admin)?;

        (&self.books, &self.permissions)
            .transaction(|(books, perms)| {
                books.insert(&book_key(book.id)[..], book_bytes.as_slice())?;
                perms.insert(&perm_key(book.id, owner_id)[..], role_bytes.as_slice())?;
                Ok::<_, ConflictableTransactionError<StorageError>>(())
            })
            .map_err(StorageError::from_tx)?;

        Ok(book)
    }

    /// Load a book by id
    pub fn get_book(&self, id: BookId) -> StorageResult<Option<BookRecord>> {
        match self.books.get(book_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List books the user holds any grant on, filtered by archived flag,
    /// together with the user's role on each.
    pub fn list_books_for(
        &self,
        user_id: UserId,
        archived: bool,
    ) -> StorageResult<Vec<(BookRecord, Role)>> {
        let mut out = Vec::new();
        for item in self.permissions.iter() {
            let (key, value) = item?;
            if key.len() != 16 {
                continue;
            }
            if decode_u64(&key[8..]) != Some(user_id) {
                continue;
            }
            let book_id = match decode_u64(&key[..8]) {
                Some(id) => id,
                None => continue,
            };
            let role: Role = bincode::deserialize(&value)?;
            if let Some(book) = self.get_book(book_id)? {
                if book.archived == archived {
                    out.push((book, role));
                }
            }
        }
        out.sort_by_key(|(book, _)| book.id);
        Ok(out)
    }

    /// Set or clear the archived flag
    pub fn set_archived(&self, id: BookId, archived: bool) -> StorageResult<()> {
        let mut book = self
            .get_book(id)?
            .ok_or_else(|| StorageError::NotFound(format!("book {}", id)))?;
        book.archived = archived;
        self.books.insert(book_key(id), bincode::serialize(&book)?)?;
        Ok(())
    }

    /// Update title, description and page format
    pub fn update_settings(
        &self,
        id: BookId,
        title: &str,
        description: &str,
        page_size: PageSize,
        orientation: Orientation,
    ) -> StorageResult<()> {
        let mut book = self
            .get_book(id)?
            .ok_or_else(|| StorageError::NotFound(format!("book {}", id)))?;
        book.title = title.to_string();
        book.description = description.to_string();
        book.page_size = page_size;
        book.orientation = orientation;
        self.books.insert(book_key(id), bincode::serialize(&book)?)?;
        Ok(())
    }

    /// Delete a book together with all of its pages and permission grants
    pub fn delete_book(&self, id: BookId) -> StorageResult<()> {
        let page_keys = self.collect_keys(&self.pages, &book_key(id))?;
        let perm_keys = self.collect_keys(&self.permissions, &book_key(id))?;

        (&self.books, &self.permissions, &self.pages)
            .transaction(|(books, perms, pages)| {
                for key in &page_keys {
                    pages.remove(key.as_slice())?;
                }
                for key in &perm_keys {
                    perms.remove(key.as_slice())?;
                }
                books.remove(&book_key(id)[..])?;
                Ok::<_, ConflictableTransactionError<StorageError>>(())
            })
            .map_err(StorageError::from_tx)?;

        Ok(())
    }

    /// Grant or update a role. The (book, user) key makes this an upsert, so a
    /// pair can never hold two roles.
    pub fn grant_role(&self, book_id: BookId, user_id: UserId, role: Role) -> StorageResult<()> {
        if self.get_book(book_id)?.is_none() {
            return Err(StorageError::NotFound(format!("book {}", book_id)));
        }
        self.permissions
            .insert(perm_key(book_id, user_id), bincode::serialize(&role)?)?;
        Ok(())
    }

    /// Look up the role a user holds on a book
    pub fn get_role(&self, book_id: BookId, user_id: UserId) -> StorageResult<Option<Role>> {
        match self.permissions.get(perm_key(book_id, user_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    /// Load a book's pages in page-number order
    pub fn load_pages(&self, book_id: BookId) -> StorageResult<Vec<PageRecord>> {
        let mut out = Vec::new();
        for item in self.pages.scan_prefix(book_key(book_id)) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Atomically replace a book's pages with `contents[i]` as page_number i+1.
    ///
    /// Every existing row for the book is removed and the new dense range is
    /// inserted in one transaction; the book's `last_saved_at` is stamped in
    /// the same transaction. A failure at any point leaves the page table
    /// exactly as it was before the call.
    pub fn replace_pages(
        &self,
        book_id: BookId,
        contents: &[Option<Vec<u8>>],
    ) -> StorageResult<()> {
        let book = self
            .get_book(book_id)?
            .ok_or_else(|| StorageError::NotFound(format!("book {}", book_id)))?;
        let old_keys = self.collect_keys(&self.pages, &book_key(book_id))?;
        let now = chrono::Utc::now().timestamp();

        let mut saved_book = book;
        saved_book.last_saved_at = Some(now);
        let book_bytes = bincode::serialize(&saved_book)?;

        let mut new_rows = Vec::with_capacity(contents.len());
        for (i, content) in contents.iter().enumerate() {
            let record = PageRecord {
                book_id,
                page_number: (i + 1) as u32,
                content: content.clone(),
                updated_at: now,
            };
            new_rows.push((
                page_key(book_id, record.page_number),
                bincode::serialize(&record)?,
            ));
        }

        (&self.pages, &self.books)
            .transaction(|(pages, books)| {
                for key in &old_keys {
                    pages.remove(key.as_slice())?;
                }
                for (key, value) in &new_rows {
                    pages.insert(&key[..], value.as_slice())?;
                }
                books.insert(&book_key(book_id)[..], book_bytes.as_slice())?;
                Ok::<_, ConflictableTransactionError<StorageError>>(())
            })
            .map_err(StorageError::from_tx)?;

        Ok(())
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            user_count: self.users.len(),
            book_count: self.books.len(),
            page_count: self.pages.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }

    fn collect_keys(&self, tree: &Tree, prefix: &[u8]) -> StorageResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for item in tree.scan_prefix(prefix) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

/// Statistics about the store
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub user_count: usize,
    pub book_count: usize,
    pub page_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for BookStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
