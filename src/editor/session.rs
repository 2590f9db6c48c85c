//! Editing sessions: one engine per (user, book) editing surface.
//!
//! A session owns its `ReconciliationEngine` exclusively; the engine is not
//! safe for concurrent mutation and is not meant to be, so each session is
//! wrapped in a mutex and sessions never share engines. Across sessions the
//! only shared mutable state is the page store behind the save transaction.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::save::{save_book, PagePersistence, SaveOutcome};
use super::{EditorError, EditorResult, PageContent, ReconciliationEngine, WorkingNumber};
use crate::storage::{BookId, UserId};

/// One open editing surface over a book
pub struct EditSession {
    pub id: Uuid,
    pub book_id: BookId,
    pub user_id: UserId,
    engine: ReconciliationEngine,
    /// Working number the user is currently looking at
    pub current_page: WorkingNumber,
    last_active: Instant,
}

impl EditSession {
    fn new(
        book_id: BookId,
        user_id: UserId,
        snapshot: Vec<(WorkingNumber, Option<PageContent>)>,
    ) -> Self {
        let engine = ReconciliationEngine::with_snapshot(snapshot);
        let current_page = engine.effective_page_list().first().copied().unwrap_or(1);
        Self {
            id: Uuid::new_v4(),
            book_id,
            user_id,
            engine,
            current_page,
            last_active: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    fn is_stale(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    /// Visible working numbers, ascending
    pub fn page_list(&self) -> Vec<WorkingNumber> {
        self.engine.effective_page_list()
    }

    /// Content a working number currently shows (None renders blank)
    pub fn resolve(&self, number: WorkingNumber) -> Option<PageContent> {
        self.engine.resolve_content(number).cloned()
    }

    /// Record the canvas state of a page and make it the current one
    pub fn record(
        &mut self,
        number: WorkingNumber,
        content: Option<PageContent>,
    ) -> EditorResult<()> {
        self.touch();
        self.engine.record_page_content(number, content)?;
        self.current_page = number;
        Ok(())
    }

    /// Add a blank page and switch to it
    pub fn add_page(&mut self) -> EditorResult<WorkingNumber> {
        self.touch();
        let number = self.engine.add_page()?;
        self.current_page = number;
        Ok(number)
    }

    /// Delete a page; if it was the current one, fall back to the first
    /// remaining visible page.
    pub fn delete_page(&mut self, number: WorkingNumber) -> EditorResult<()> {
        self.touch();
        self.engine.delete_page(number)?;
        if self.current_page == number {
            self.current_page = self.page_list().first().copied().unwrap_or(1);
        }
        Ok(())
    }

    /// Run the save protocol with the caller's live canvas content. On
    /// success the session continues over the rebased engine with the
    /// renumbered current page.
    pub fn save<S: PagePersistence>(
        &mut self,
        store: &S,
        current: WorkingNumber,
        live_content: Option<PageContent>,
    ) -> EditorResult<SaveOutcome> {
        self.touch();
        let outcome = save_book(store, self.book_id, &mut self.engine, current, live_content)?;
        self.current_page = outcome.current_page;
        Ok(outcome)
    }
}

/// Registry of open editing sessions
pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<Mutex<EditSession>>>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout,
        }
    }

    /// Open a session over a loaded page snapshot and return its id
    pub fn open(
        &self,
        book_id: BookId,
        user_id: UserId,
        snapshot: Vec<(WorkingNumber, Option<PageContent>)>,
    ) -> Uuid {
        let session = EditSession::new(book_id, user_id, snapshot);
        let id = session.id;
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        info!(%id, book_id, user_id, "editing session opened");
        id
    }

    /// Fetch a session, refusing sessions owned by someone else
    pub fn get(&self, id: Uuid, user_id: UserId) -> EditorResult<Arc<Mutex<EditSession>>> {
        let session = self
            .sessions
            .get(&id)
            .map(|s| s.clone())
            .ok_or(EditorError::NotReady)?;
        if session.lock().user_id != user_id {
            return Err(EditorError::Forbidden(
                "session belongs to another user".to_string(),
            ));
        }
        Ok(session)
    }

    pub fn close(&self, id: Uuid) {
        if self.sessions.remove(&id).is_some() {
            debug!(%id, "editing session closed");
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions idle past the timeout; pending edits in them are lost,
    /// which matches discarding a browser tab.
    pub fn cleanup(&self) -> usize {
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().lock().is_stale(self.timeout))
            .map(|entry| *entry.key())
            .collect();

        for id in &stale {
            warn!(%id, "removing stale editing session");
            self.sessions.remove(id);
        }
        stale.len()
    }

    /// Periodic cleanup loop (runs until the process exits)
    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.cleanup();
                if removed > 0 {
                    debug!(removed, "cleaned up stale editing sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageResult;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn content(label: &str) -> PageContent {
        PageContent::from_value(json!(label)).unwrap()
    }

    #[derive(Default)]
    struct MemoryStore {
        pages: StdMutex<Vec<Option<Vec<u8>>>>,
    }

    impl PagePersistence for MemoryStore {
        fn replace_pages(&self, _book_id: BookId, contents: &[Option<Vec<u8>>]) -> StorageResult<()> {
            *self.pages.lock().unwrap() = contents.to_vec();
            Ok(())
        }
    }

    #[test]
    fn test_open_session_starts_on_first_page() {
        let manager = SessionManager::new(Duration::from_secs(300));
        let id = manager.open(1, 7, vec![(2, Some(content("B"))), (5, Some(content("E")))]);

        let session = manager.get(id, 7).unwrap();
        let session = session.lock();
        assert_eq!(session.current_page, 2);
        assert_eq!(session.page_list(), vec![2, 5]);
    }

    #[test]
    fn test_session_ownership_enforced() {
        let manager = SessionManager::new(Duration::from_secs(300));
        let id = manager.open(1, 7, Vec::new());

        assert!(matches!(
            manager.get(id, 8),
            Err(EditorError::Forbidden(_))
        ));
        assert!(manager.get(id, 7).is_ok());
    }

    #[test]
    fn test_unknown_session_not_ready() {
        let manager = SessionManager::new(Duration::from_secs(300));
        assert!(matches!(
            manager.get(Uuid::new_v4(), 7),
            Err(EditorError::NotReady)
        ));
    }

    #[test]
    fn test_add_and_delete_track_current_page() {
        let manager = SessionManager::new(Duration::from_secs(300));
        let id = manager.open(1, 7, vec![(1, Some(content("A")))]);
        let session = manager.get(id, 7).unwrap();
        let mut session = session.lock();

        let added = session.add_page().unwrap();
        assert_eq!(session.current_page, added);

        session.delete_page(added).unwrap();
        assert_eq!(session.current_page, 1);
    }

    #[test]
    fn test_save_through_session_renumbers_current() {
        let store = MemoryStore::default();
        let manager = SessionManager::new(Duration::from_secs(300));
        let id = manager.open(
            1,
            7,
            vec![
                (1, Some(content("A"))),
                (2, Some(content("B"))),
                (3, Some(content("C"))),
            ],
        );
        let session = manager.get(id, 7).unwrap();
        let mut session = session.lock();

        session.delete_page(2).unwrap();
        session.record(3, Some(content("C"))).unwrap();
        let outcome = session.save(&store, 3, Some(content("C"))).unwrap();

        assert_eq!(outcome.page_count, 2);
        assert_eq!(session.current_page, 2);
        assert_eq!(session.page_list(), vec![1, 2]);
    }

    #[test]
    fn test_cleanup_removes_stale_sessions() {
        let manager = SessionManager::new(Duration::from_millis(0));
        let id = manager.open(1, 7, Vec::new());

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.cleanup(), 1);
        assert_eq!(manager.count(), 0);
        assert!(matches!(manager.get(id, 7), Err(EditorError::NotReady)));
    }
}
