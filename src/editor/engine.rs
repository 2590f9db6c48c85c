//! ReconciliationEngine: pending page edits over a persisted snapshot.
//!
//! One engine belongs to one editing session. It never performs I/O: the
//! snapshot is loaded once when the book is opened, every mutation is a pure
//! data-structure update, and the save coordinator is the only thing that
//! turns the reconciled state back into storage operations.

use std::collections::{BTreeMap, BTreeSet};

use super::{EditorError, EditorResult, OverlayEntry, PageContent, PageOrigin, WorkingNumber};

/// In-memory overlay tracking new, edited and deleted pages against the
/// snapshot of the persisted page store.
///
/// Working numbers are a client-local labeling scheme: not dense, only unique
/// within the session. Deleting a snapshot-backed page never touches the
/// snapshot itself; the number is suppressed in a separate deleted set until
/// a save commits.
#[derive(Debug, Default)]
pub struct ReconciliationEngine {
    /// Persisted pages as of session open; a blank row is a present entry
    /// with no content, so its number still occupies a position
    base: BTreeMap<WorkingNumber, Option<PageContent>>,
    /// Pending edits keyed by working number
    overlay: BTreeMap<WorkingNumber, OverlayEntry>,
    /// Snapshot-backed numbers suppressed at read and save time
    deleted: BTreeSet<WorkingNumber>,
    /// False until a snapshot is loaded; operations fail with NotReady before
    ready: bool,
}

impl ReconciliationEngine {
    /// An engine with no snapshot yet; every operation returns `NotReady`
    /// until `load_snapshot` is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine over a loaded snapshot
    pub fn with_snapshot(
        pages: impl IntoIterator<Item = (WorkingNumber, Option<PageContent>)>,
    ) -> Self {
        let mut engine = Self::new();
        engine.load_snapshot(pages);
        engine
    }

    /// Install the persisted snapshot and discard any pending state
    pub fn load_snapshot(
        &mut self,
        pages: impl IntoIterator<Item = (WorkingNumber, Option<PageContent>)>,
    ) {
        self.base = pages.into_iter().collect();
        self.overlay.clear();
        self.deleted.clear();
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn ensure_ready(&self) -> EditorResult<()> {
        if self.ready {
            Ok(())
        } else {
            Err(EditorError::NotReady)
        }
    }

    /// Upsert the overlay entry for a working number with the given content.
    /// Origin is inferred from whether the snapshot holds that number. Affects
    /// only the overlay; storage is never contacted.
    pub fn record_page_content(
        &mut self,
        number: WorkingNumber,
        content: Option<PageContent>,
    ) -> EditorResult<()> {
        self.ensure_ready()?;
        let origin = if self.base.contains_key(&number) {
            PageOrigin::Existing
        } else {
            PageOrigin::New
        };
        self.overlay.insert(number, OverlayEntry { origin, content });
        Ok(())
    }

    /// Create a new blank page and return its working number.
    ///
    /// The number is max(snapshot numbers, overlay numbers) + 1; for a book
    /// with no pages and no pending entries the very first page is exactly 1.
    /// Deleted snapshot numbers still count toward the maximum, so a freshly
    /// added page can never collide with a number that exists in storage.
    /// Working numbers are client-chosen, so the maximum may already sit at
    /// the top of the range; refusing beats wrapping back to 0.
    pub fn add_page(&mut self) -> EditorResult<WorkingNumber> {
        self.ensure_ready()?;
        let number = match self.base.keys().chain(self.overlay.keys()).max() {
            Some(&highest) => highest.checked_add(1).ok_or_else(|| {
                EditorError::InvariantViolation(format!(
                    "no working number available above {}",
                    highest
                ))
            })?,
            None => 1,
        };
        self.overlay.insert(
            number,
            OverlayEntry {
                origin: PageOrigin::New,
                content: None,
            },
        );
        Ok(number)
    }

    /// Delete a visible page.
    ///
    /// Snapshot-backed numbers are suppressed (the persisted row stays until
    /// the next save); session-new numbers are dropped from the overlay
    /// outright. Refuses to delete the sole remaining visible page, leaving
    /// all state unchanged.
    pub fn delete_page(&mut self, number: WorkingNumber) -> EditorResult<()> {
        self.ensure_ready()?;

        let in_base = self.base.contains_key(&number) && !self.deleted.contains(&number);
        let in_overlay = self.overlay.contains_key(&number) && !self.deleted.contains(&number);
        if !in_base && !in_overlay {
            return Err(EditorError::InvariantViolation(format!(
                "page {} is not visible",
                number
            )));
        }
        if self.visible_count() == 1 {
            return Err(EditorError::InvariantViolation(
                "cannot delete the last page".to_string(),
            ));
        }

        if self.base.contains_key(&number) {
            self.deleted.insert(number);
            self.overlay.remove(&number);
        } else {
            self.overlay.remove(&number);
        }
        Ok(())
    }

    /// The ordered sequence of visible working numbers:
    /// (snapshot ∪ overlay) − deleted, ascending. Recomputed from current
    /// state on every call; holds no state of its own.
    pub fn effective_page_list(&self) -> Vec<WorkingNumber> {
        self.base
            .keys()
            .chain(self.overlay.keys())
            .filter(|n| !self.deleted.contains(n))
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of currently visible pages
    pub fn visible_count(&self) -> usize {
        self.effective_page_list().len()
    }

    /// Resolve what a working number currently shows, in priority order:
    /// overlay content if recorded and non-blank, else snapshot content if the
    /// number exists there and is not deleted, else nothing (blank page).
    pub fn resolve_content(&self, number: WorkingNumber) -> Option<&PageContent> {
        if let Some(entry) = self.overlay.get(&number) {
            if let Some(content) = &entry.content {
                return Some(content);
            }
        }
        if !self.deleted.contains(&number) {
            return self.base.get(&number).and_then(|content| content.as_ref());
        }
        None
    }

    /// Whether any edits are pending against the snapshot
    pub fn has_pending_edits(&self) -> bool {
        !self.overlay.is_empty() || !self.deleted.is_empty()
    }

    /// Replace the snapshot with the just-saved dense page set and clear all
    /// pending state. Called by the save coordinator on confirmed success
    /// only; the persisted store is the sole source of truth again afterwards.
    pub(crate) fn rebase(&mut self, pages: Vec<(WorkingNumber, Option<PageContent>)>) {
        self.load_snapshot(pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(label: &str) -> PageContent {
        PageContent::from_value(json!(label)).unwrap()
    }

    fn engine_with_pages(labels: &[(u32, &str)]) -> ReconciliationEngine {
        ReconciliationEngine::with_snapshot(labels.iter().map(|(n, l)| (*n, Some(content(l)))))
    }

    #[test]
    fn test_not_ready_before_snapshot() {
        let mut engine = ReconciliationEngine::new();
        assert!(matches!(engine.add_page(), Err(EditorError::NotReady)));
        assert!(matches!(
            engine.record_page_content(1, None),
            Err(EditorError::NotReady)
        ));
        assert!(matches!(engine.delete_page(1), Err(EditorError::NotReady)));
    }

    #[test]
    fn test_first_page_of_empty_book_is_one() {
        let mut engine = ReconciliationEngine::with_snapshot([]);
        assert_eq!(engine.add_page().unwrap(), 1);
        assert_eq!(engine.add_page().unwrap(), 2);
        assert_eq!(engine.effective_page_list(), vec![1, 2]);
    }

    #[test]
    fn test_add_page_continues_after_snapshot() {
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B"), (3, "C")]);
        assert_eq!(engine.add_page().unwrap(), 4);
    }

    #[test]
    fn test_add_page_counts_deleted_numbers() {
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B"), (3, "C")]);
        engine.delete_page(3).unwrap();
        // 3 still exists in the snapshot, so the next number must skip it
        assert_eq!(engine.add_page().unwrap(), 4);
        assert_eq!(engine.effective_page_list(), vec![1, 2, 4]);
    }

    #[test]
    fn test_effective_list_has_no_duplicates_or_deleted() {
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B")]);
        engine.record_page_content(1, Some(content("A'"))).unwrap();
        engine.record_page_content(2, Some(content("B'"))).unwrap();
        let added = engine.add_page().unwrap();
        engine.record_page_content(added, Some(content("C"))).unwrap();
        engine.delete_page(2).unwrap();

        let list = engine.effective_page_list();
        assert_eq!(list, vec![1, 3]);

        let mut deduped = list.clone();
        deduped.dedup();
        assert_eq!(list, deduped);
        assert!(!list.contains(&2));
    }

    #[test]
    fn test_effective_list_is_restartable() {
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B")]);
        engine.delete_page(1).unwrap();
        assert_eq!(engine.effective_page_list(), engine.effective_page_list());
    }

    #[test]
    fn test_delete_last_page_refused_and_state_unchanged() {
        let mut engine = engine_with_pages(&[(1, "A")]);
        engine.record_page_content(1, Some(content("A'"))).unwrap();

        let err = engine.delete_page(1).unwrap_err();
        assert!(matches!(err, EditorError::InvariantViolation(_)));
        assert!(err.to_string().contains("last page"));

        assert_eq!(engine.effective_page_list(), vec![1]);
        assert_eq!(engine.resolve_content(1), Some(&content("A'")));
        assert!(engine.has_pending_edits());
    }

    #[test]
    fn test_delete_unknown_page_refused() {
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B")]);
        assert!(matches!(
            engine.delete_page(9),
            Err(EditorError::InvariantViolation(_))
        ));
        engine.delete_page(2).unwrap();
        // Already deleted: no longer visible
        assert!(matches!(
            engine.delete_page(2),
            Err(EditorError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_delete_new_page_removes_it_outright() {
        let mut engine = engine_with_pages(&[(1, "A")]);
        let added = engine.add_page().unwrap();
        engine.delete_page(added).unwrap();

        assert_eq!(engine.effective_page_list(), vec![1]);
        // Nothing left pending: the new page never reached the snapshot
        assert!(!engine.has_pending_edits());
    }

    #[test]
    fn test_add_page_refused_at_top_of_number_range() {
        let mut engine = engine_with_pages(&[(1, "A")]);
        engine
            .record_page_content(u32::MAX, Some(content("Z")))
            .unwrap();

        let err = engine.add_page().unwrap_err();
        assert!(matches!(err, EditorError::InvariantViolation(_)));

        // Refused without wrapping: nothing changed, nothing labeled 0
        assert_eq!(engine.effective_page_list(), vec![1, u32::MAX]);
        assert_eq!(engine.resolve_content(u32::MAX), Some(&content("Z")));
    }

    #[test]
    fn test_record_infers_origin() {
        let mut engine = engine_with_pages(&[(1, "A")]);
        engine.record_page_content(1, Some(content("A'"))).unwrap();
        engine.record_page_content(5, Some(content("E"))).unwrap();

        assert_eq!(engine.overlay[&1].origin, PageOrigin::Existing);
        assert_eq!(engine.overlay[&5].origin, PageOrigin::New);
    }

    #[test]
    fn test_resolve_priority() {
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B")]);

        // Overlay beats snapshot
        engine.record_page_content(1, Some(content("A'"))).unwrap();
        assert_eq!(engine.resolve_content(1), Some(&content("A'")));

        // Blank overlay entry falls through to the snapshot
        engine.record_page_content(2, None).unwrap();
        assert_eq!(engine.resolve_content(2), Some(&content("B")));

        // Unknown number renders blank
        assert_eq!(engine.resolve_content(9), None);
    }

    #[test]
    fn test_blank_persisted_page_keeps_its_number() {
        let engine =
            ReconciliationEngine::with_snapshot([(1, Some(content("A"))), (2, None)]);
        assert_eq!(engine.effective_page_list(), vec![1, 2]);
        assert_eq!(engine.resolve_content(2), None);
    }

    #[test]
    fn test_resolve_deleted_page_is_blank() {
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B")]);
        engine.delete_page(2).unwrap();
        assert_eq!(engine.resolve_content(2), None);
    }

    #[test]
    fn test_mixed_sequence_keeps_invariants() {
        let mut engine = engine_with_pages(&[(1, "A"), (2, "B"), (3, "C")]);
        let p4 = engine.add_page().unwrap();
        engine.record_page_content(p4, Some(content("D"))).unwrap();
        engine.delete_page(2).unwrap();
        let p5 = engine.add_page().unwrap();
        engine.delete_page(p5).unwrap();
        engine.record_page_content(1, Some(content("A'"))).unwrap();

        let list = engine.effective_page_list();
        assert_eq!(list, vec![1, 3, 4]);
        for n in &list {
            assert!(!engine.deleted.contains(n));
        }
    }
}
