use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::data::{self, tag_store::SqliteTagStore};
use crate::error::AppError;
use crate::models::organize::OrganizeProgress;

pub struct AppState {
    pub store: Arc<SqliteTagStore>,
    pub organize_cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    pub organize_status: Mutex<HashMap<String, OrganizeProgress>>,
    organize_running: AtomicBool,
}

/// Held for the duration of one organization run; dropping it frees the slot.
pub struct OrganizeRunGuard<'a> {
    state: &'a AppState,
}

impl Drop for OrganizeRunGuard<'_> {
    fn drop(&mut self) {
        self.state.organize_running.store(false, Ordering::Release);
    }
}

impl AppState {
    pub fn new(store: Arc<SqliteTagStore>) -> Self {
        Self {
            store,
            organize_cancel_flags: Mutex::new(HashMap::new()),
            organize_status: Mutex::new(HashMap::new()),
            organize_running: AtomicBool::new(false),
        }
    }

    pub fn open(path: &Path) -> Result<Self, AppError> {
        let conn = data::open_database(path)?;
        Ok(Self::new(Arc::new(SqliteTagStore::new(conn))))
    }

    pub fn open_default() -> Result<Self, AppError> {
        Self::open(&data::default_database_path()?)
    }

    pub fn try_begin_organize(&self) -> Result<OrganizeRunGuard<'_>, AppError> {
        if self
            .organize_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AppError::General("organization already running".to_string()));
        }
        Ok(OrganizeRunGuard { state: self })
    }

    pub fn is_organize_running(&self) -> bool {
        self.organize_running.load(Ordering::Acquire)
    }

    pub fn reset_organize_cancel_flag(&self, session_id: &str) -> Arc<AtomicBool> {
        let mut flags = self
            .organize_cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let flag = flags
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        flag.store(false, Ordering::Relaxed);
        flag
    }

    pub fn mark_organize_cancelled(&self, session_id: Option<&str>) {
        let flags = self
            .organize_cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = session_id {
            if let Some(flag) = flags.get(id) {
                flag.store(true, Ordering::Relaxed);
            }
            return;
        }

        for flag in flags.values() {
            flag.store(true, Ordering::Relaxed);
        }
    }

    pub fn clear_organize_cancel_flag(&self, session_id: &str) {
        let mut flags = self
            .organize_cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        flags.remove(session_id);
    }

    /// Drops the session's flag once `flag` is its only outside holder, so a
    /// second live context for the same session keeps receiving cancels.
    pub fn release_organize_cancel_flag(&self, session_id: &str, flag: &Arc<AtomicBool>) {
        let mut flags = self
            .organize_cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let releasable = flags
            .get(session_id)
            .is_some_and(|stored| Arc::ptr_eq(stored, flag) && Arc::strong_count(stored) <= 2);
        if releasable {
            flags.remove(session_id);
        }
    }

    pub fn organize_cancel_flag_count(&self) -> usize {
        self.organize_cancel_flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn get_organize_status(&self, session_id: &str) -> Option<OrganizeProgress> {
        self.organize_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }

    pub fn set_organize_status(&self, session_id: &str, progress: OrganizeProgress) {
        self.organize_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session_id.to_string(), progress);
    }

    pub fn clear_organize_status(&self, session_id: &str) {
        self.organize_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::organize::OrganizePhase;

    fn test_state() -> AppState {
        AppState::new(Arc::new(SqliteTagStore::open_in_memory().unwrap()))
    }

    #[test]
    fn cancel_scopes_are_session_specific() {
        let state = test_state();
        let flag_a = state.reset_organize_cancel_flag("a");
        let flag_b = state.reset_organize_cancel_flag("b");

        state.mark_organize_cancelled(Some("a"));

        assert!(flag_a.load(Ordering::Relaxed));
        assert!(!flag_b.load(Ordering::Relaxed));
    }

    #[test]
    fn cancel_without_session_marks_all_active_sessions() {
        let state = test_state();
        let flag_a = state.reset_organize_cancel_flag("a");
        let flag_b = state.reset_organize_cancel_flag("b");

        state.mark_organize_cancelled(None);

        assert!(flag_a.load(Ordering::Relaxed));
        assert!(flag_b.load(Ordering::Relaxed));
    }

    #[test]
    fn reset_reuses_and_clears_flag() {
        let state = test_state();
        let flag = state.reset_organize_cancel_flag("a");
        state.mark_organize_cancelled(Some("a"));

        let again = state.reset_organize_cancel_flag("a");
        assert!(Arc::ptr_eq(&flag, &again));
        assert!(!flag.load(Ordering::Relaxed));

        state.clear_organize_cancel_flag("a");
        state.mark_organize_cancelled(Some("a"));
        assert!(!flag.load(Ordering::Relaxed));
    }

    #[test]
    fn release_keeps_flag_while_another_holder_is_alive() {
        let state = test_state();
        let first = state.reset_organize_cancel_flag("a");
        let second = state.reset_organize_cancel_flag("a");

        state.release_organize_cancel_flag("a", &first);
        drop(first);
        assert_eq!(state.organize_cancel_flag_count(), 1);
        state.mark_organize_cancelled(Some("a"));
        assert!(second.load(Ordering::Relaxed));

        state.release_organize_cancel_flag("a", &second);
        assert_eq!(state.organize_cancel_flag_count(), 0);
    }

    #[test]
    fn release_ignores_a_replaced_flag() {
        let state = test_state();
        let stale = Arc::new(AtomicBool::new(false));
        let _live = state.reset_organize_cancel_flag("a");

        state.release_organize_cancel_flag("a", &stale);
        assert_eq!(state.organize_cancel_flag_count(), 1);
    }

    #[test]
    fn only_one_run_at_a_time() {
        let state = test_state();
        let guard = state.try_begin_organize().unwrap();
        assert!(state.is_organize_running());
        assert!(matches!(
            state.try_begin_organize(),
            Err(AppError::General(msg)) if msg == "organization already running"
        ));

        drop(guard);
        assert!(!state.is_organize_running());
        assert!(state.try_begin_organize().is_ok());
    }

    #[test]
    fn status_is_stored_per_session() {
        let state = test_state();
        let progress = OrganizeProgress {
            phase: OrganizePhase::Processing,
            current_batch: 1,
            total_batches: 2,
            processed_count: 0,
            total_count: 30,
            current_status: "Processing batch 1/2".to_string(),
        };
        state.set_organize_status("a", progress.clone());

        assert_eq!(state.get_organize_status("a"), Some(progress));
        assert!(state.get_organize_status("b").is_none());
        state.clear_organize_status("a");
        assert!(state.get_organize_status("a").is_none());
    }

    #[test]
    fn open_creates_database_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(&dir.path().join("marksmith.db")).unwrap();
        state.store.set_setting("k", "v").unwrap();
        assert_eq!(state.store.get_setting("k").unwrap().as_deref(), Some("v"));
    }
}
