//! SaveCoordinator: flatten the reconciled state into a dense persisted page set.
//!
//! The save is all-or-nothing from the caller's perspective: either the page
//! table ends up holding exactly the flattened 1..N list and the engine is
//! rebased onto it, or the table is untouched and the engine keeps every
//! pending edit for a retry.

use tracing::{debug, info};

use super::{EditorError, EditorResult, PageContent, ReconciliationEngine, WorkingNumber};
use crate::storage::{BookId, BookStore, StorageResult};

/// The persistence seam consumed by the save protocol. The production
/// implementation is the sled-backed `BookStore`; tests substitute stores
/// that record or fail the replace call.
pub trait PagePersistence {
    /// Atomically replace a book's pages with `contents[i]` as page i+1,
    /// stamping the book's last-saved timestamp in the same transaction.
    fn replace_pages(&self, book_id: BookId, contents: &[Option<Vec<u8>>]) -> StorageResult<()>;
}

impl PagePersistence for BookStore {
    fn replace_pages(&self, book_id: BookId, contents: &[Option<Vec<u8>>]) -> StorageResult<()> {
        BookStore::replace_pages(self, book_id, contents)
    }
}

/// What a successful save tells the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Renumbered position of the working number that was active at save
    /// time, or 1 if that number no longer exists
    pub current_page: u32,
    /// Total pages persisted
    pub page_count: usize,
}

/// Flatten the engine state and persist it as the dense range 1..N.
///
/// `current` is the working number the caller is editing and `live_content`
/// the canvas state of that surface at save time. The live content is only
/// captured while `current` is still visible; recording it for a working
/// number the user just deleted would resurrect the page.
pub fn save_book<S: PagePersistence>(
    store: &S,
    book_id: BookId,
    engine: &mut ReconciliationEngine,
    current: WorkingNumber,
    live_content: Option<PageContent>,
) -> EditorResult<SaveOutcome> {
    if !engine.is_ready() {
        return Err(EditorError::NotReady);
    }

    let visible = engine.effective_page_list();
    if visible.contains(&current) {
        engine.record_page_content(current, live_content)?;
    }

    let final_list = engine.effective_page_list();
    if final_list.is_empty() {
        return Err(EditorError::InvariantViolation(
            "cannot save a book with no pages".to_string(),
        ));
    }

    // Resolve every position; never-drawn pages persist as explicit empty
    // markers so the stored range 1..N has no holes.
    let mut resolved: Vec<Option<PageContent>> = Vec::with_capacity(final_list.len());
    let mut blobs: Vec<Option<Vec<u8>>> = Vec::with_capacity(final_list.len());
    for number in &final_list {
        let content = engine.resolve_content(*number).cloned();
        let blob = match &content {
            Some(c) => Some(c.to_blob().map_err(|e| {
                EditorError::InvariantViolation(format!("unserializable page content: {}", e))
            })?),
            None => None,
        };
        resolved.push(content);
        blobs.push(blob);
    }

    debug!(
        book_id,
        pages = final_list.len(),
        "replacing page set with dense renumbering"
    );

    // The one suspension point: on failure the store rolled back and the
    // overlay is untouched, so the caller can retry.
    store.replace_pages(book_id, &blobs)?;

    let current_page = final_list
        .iter()
        .position(|n| *n == current)
        .map(|i| (i + 1) as u32)
        .unwrap_or(1);

    engine.rebase(
        resolved
            .into_iter()
            .enumerate()
            .map(|(i, content)| ((i + 1) as u32, content))
            .collect(),
    );

    info!(
        book_id,
        pages = final_list.len(),
        current_page,
        "book saved"
    );

    Ok(SaveOutcome {
        current_page,
        page_count: final_list.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use serde_json::json;
    use std::sync::Mutex;

    fn content(label: &str) -> PageContent {
        PageContent::from_value(json!(label)).unwrap()
    }

    /// In-memory store standing in for the page table
    #[derive(Default)]
    struct MemoryStore {
        pages: Mutex<Vec<Option<Vec<u8>>>>,
    }

    impl MemoryStore {
        fn labels(&self) -> Vec<Option<String>> {
            self.pages
                .lock()
                .unwrap()
                .iter()
                .map(|blob| {
                    blob.as_deref()
                        .and_then(PageContent::from_blob)
                        .map(|c| c.as_value().as_str().unwrap_or_default().to_string())
                })
                .collect()
        }
    }

    impl PagePersistence for MemoryStore {
        fn replace_pages(&self, _book_id: BookId, contents: &[Option<Vec<u8>>]) -> StorageResult<()> {
            *self.pages.lock().unwrap() = contents.to_vec();
            Ok(())
        }
    }

    /// Store whose transaction always aborts, leaving prior state intact
    struct FailingStore {
        pages: Mutex<Vec<Option<Vec<u8>>>>,
    }

    impl PagePersistence for FailingStore {
        fn replace_pages(&self, _book_id: BookId, _contents: &[Option<Vec<u8>>]) -> StorageResult<()> {
            Err(StorageError::Aborted("simulated storage failure".into()))
        }
    }

    fn engine_with_pages(labels: &[(u32, &str)]) -> ReconciliationEngine {
        ReconciliationEngine::with_snapshot(labels.iter().map(|(n, l)| (*n, Some(content(l)))))
    }

    #[test]
    fn test_first_page_of_new_book() {
        // 0 pages -> addPage() -> record "A" -> save -> exactly [{1, A}]
        let store = MemoryStore::default();
        let mut engine = ReconciliationEngine::with_snapshot([]);
        let first = engine.add_page().unwrap();
        assert_eq!(first, 1);

        let outcome = save_book(&store, 1, &mut engine, first, Some(content("A"))).unwrap();
        assert_eq!(outcome, SaveOutcome { current_page: 1, page_count: 1 });
        assert_eq!(store.labels(), vec![Some("A".to_string())]);
    }

    #[test]
    fn test_delete_middle_page_renumbers_densely() {
        // [1:A, 2:B, 3:C] -> delete 2 -> save -> [{1, A}, {2, C}]
        let store = MemoryStore::default();
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B"), (3, "C")]);
        engine.delete_page(2).unwrap();

        let outcome = save_book(&store, 1, &mut engine, 3, Some(content("C"))).unwrap();
        assert_eq!(outcome.page_count, 2);
        // The active page 3 became page 2 after renumbering
        assert_eq!(outcome.current_page, 2);
        assert_eq!(
            store.labels(),
            vec![Some("A".to_string()), Some("C".to_string())]
        );
    }

    #[test]
    fn test_never_drawn_page_persists_empty_marker() {
        let store = MemoryStore::default();
        let mut engine = engine_with_pages(&[(1, "A")]);
        engine.add_page().unwrap();

        save_book(&store, 1, &mut engine, 1, Some(content("A"))).unwrap();
        assert_eq!(store.labels(), vec![Some("A".to_string()), None]);
    }

    #[test]
    fn test_save_is_idempotent_without_edits() {
        let store = MemoryStore::default();
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B")]);

        let first = save_book(&store, 1, &mut engine, 1, Some(content("A"))).unwrap();
        let after_first = store.labels();

        let second = save_book(&store, 1, &mut engine, 1, Some(content("A"))).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.labels(), after_first);
    }

    #[test]
    fn test_failed_transaction_preserves_overlay() {
        let before: Vec<Option<Vec<u8>>> = vec![Some(content("A").to_blob().unwrap())];
        let store = FailingStore {
            pages: Mutex::new(before.clone()),
        };
        let mut engine = engine_with_pages(&[(1, "A")]);
        let added = engine.add_page().unwrap();
        engine.record_page_content(added, Some(content("B"))).unwrap();

        let err = save_book(&store, 1, &mut engine, added, Some(content("B"))).unwrap_err();
        assert!(matches!(err, EditorError::Persistence(_)));

        // Store byte-for-byte untouched, edits still pending for a retry
        assert_eq!(*store.pages.lock().unwrap(), before);
        assert!(engine.has_pending_edits());
        assert_eq!(engine.effective_page_list(), vec![1, added]);
        assert_eq!(engine.resolve_content(added), Some(&content("B")));
    }

    #[test]
    fn test_save_zero_pages_rejected_before_transaction() {
        // A failing store proves the transaction is never reached
        let store = FailingStore { pages: Mutex::new(Vec::new()) };
        let mut engine = ReconciliationEngine::with_snapshot([]);

        let err = save_book(&store, 1, &mut engine, 1, None).unwrap_err();
        assert!(matches!(err, EditorError::InvariantViolation(_)));
        assert!(err.to_string().contains("no pages"));
    }

    #[test]
    fn test_current_page_falls_back_after_delete() {
        let store = MemoryStore::default();
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B")]);
        engine.delete_page(2).unwrap();

        // The caller's surface still shows working number 2; it must not be
        // resurrected, and the returned current page falls back to 1.
        let outcome = save_book(&store, 1, &mut engine, 2, Some(content("B"))).unwrap();
        assert_eq!(outcome.current_page, 1);
        assert_eq!(store.labels(), vec![Some("A".to_string())]);
    }

    #[test]
    fn test_save_rebases_engine_onto_dense_numbers() {
        let store = MemoryStore::default();
        let mut engine = engine_with_pages(&[(1, "A"), (4, "D")]);

        save_book(&store, 1, &mut engine, 4, Some(content("D"))).unwrap();

        // Post-save the snapshot is dense and nothing is pending
        assert!(!engine.has_pending_edits());
        assert_eq!(engine.effective_page_list(), vec![1, 2]);
        assert_eq!(engine.resolve_content(2), Some(&content("D")));
        assert_eq!(engine.add_page().unwrap(), 3);
    }

    #[test]
    fn test_not_ready_engine_cannot_save() {
        let store = MemoryStore::default();
        let mut engine = ReconciliationEngine::new();
        assert!(matches!(
            save_book(&store, 1, &mut engine, 1, None),
            Err(EditorError::NotReady)
        ));
    }

    #[test]
    fn test_overlapping_sessions_last_save_wins() {
        // Sessions X and Y both load [1:A, 2:B]. X adds page 3 with D and
        // saves; Y, unaware, deletes its local page 1 and saves. The final
        // store reflects only Y's save: the documented lost-update gap of
        // replace-all saves, accepted rather than fixed.
        let store = MemoryStore::default();

        let mut session_x = engine_with_pages(&[(1, "A"), (2, "B")]);
        let p3 = session_x.add_page().unwrap();
        session_x.record_page_content(p3, Some(content("D"))).unwrap();
        save_book(&store, 1, &mut session_x, p3, Some(content("D"))).unwrap();
        assert_eq!(
            store.labels(),
            vec![Some("A".to_string()), Some("B".to_string()), Some("D".to_string())]
        );

        let mut session_y = engine_with_pages(&[(1, "A"), (2, "B")]);
        session_y.delete_page(1).unwrap();
        save_book(&store, 1, &mut session_y, 2, Some(content("B"))).unwrap();

        // X's page D is gone: full replace, no merge
        assert_eq!(store.labels(), vec![Some("B".to_string())]);
    }
}
