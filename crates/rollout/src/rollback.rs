//! Rollback ledger: every executed app, in execution order
//!
//! Apps are recorded by the owner of their batch once the batch has
//! returned, in declared order. Phases of one parallel wave own separate
//! batches and may record at the same time, hence the mutex.

use crate::result::{AppKey, AppResult, ExecutionStatus};
use crate::settings::Settings;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Recorded,
    /// Handed out for rollback; never handed out again
    Taken,
    RolledBack,
}

/// One executed app
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Enclosing phase names, outermost first
    pub scope: Vec<String>,
    pub app: String,
    pub failed: bool,
    /// Settings the app ran with, handed back to the rollback call
    pub settings: Settings,
    pub data: Option<Value>,
    state: EntryState,
}

impl LedgerEntry {
    pub fn key(&self) -> AppKey {
        (self.scope.clone(), self.app.clone())
    }

    fn within(&self, scope: &[String]) -> bool {
        self.scope.starts_with(scope)
    }
}

#[derive(Debug, Default)]
pub struct RollbackLedger {
    entries: Mutex<Vec<LedgerEntry>>,
    /// A whole-run rollback requested from inside a concurrent batch
    deferred_all: AtomicBool,
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LedgerEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a finished app; pending or skipped apps are ignored
    pub fn record(&self, scope: &[String], result: &AppResult, settings: &Settings) {
        let failed = match result.status {
            ExecutionStatus::Success => false,
            ExecutionStatus::Failed => true,
            _ => return,
        };
        self.lock().push(LedgerEntry {
            scope: scope.to_vec(),
            app: result.name.clone(),
            failed,
            settings: settings.clone(),
            data: result.rollback_data.clone(),
            state: EntryState::Recorded,
        });
    }

    /// Ask the batch owner to roll back the whole run once its batch returns
    pub fn defer_all(&self) {
        self.deferred_all.store(true, Ordering::SeqCst);
    }

    pub fn has_deferred_all(&self) -> bool {
        self.deferred_all.load(Ordering::SeqCst)
    }

    /// Clear a deferred whole-run rollback, returning whether one was pending
    pub fn take_deferred_all(&self) -> bool {
        self.deferred_all.swap(false, Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Hand out `picked` entries (newest first) that were not handed out before
    fn take_where(&self, pick: impl Fn(&LedgerEntry) -> bool) -> Vec<LedgerEntry> {
        let mut entries = self.lock();
        let mut taken = Vec::new();
        for entry in entries.iter_mut().rev() {
            if pick(entry) && entry.state == EntryState::Recorded {
                entry.state = EntryState::Taken;
                taken.push(entry.clone());
            }
        }
        taken
    }

    /// Hand out the newest entry matching `pick`, unless it was handed out already
    fn take_latest(&self, pick: impl Fn(&LedgerEntry) -> bool) -> Vec<LedgerEntry> {
        let mut entries = self.lock();
        match entries.iter_mut().rev().find(|e| pick(e)) {
            Some(entry) if entry.state == EntryState::Recorded => {
                entry.state = EntryState::Taken;
                vec![entry.clone()]
            }
            _ => Vec::new(),
        }
    }

    /// The named app in exactly `scope`
    pub fn take_app(&self, scope: &[String], app: &str) -> Vec<LedgerEntry> {
        self.take_latest(|e| e.scope == scope && e.app == app)
    }

    /// The most recently failed app anywhere inside `scope`
    pub fn take_last_failed(&self, scope: &[String]) -> Vec<LedgerEntry> {
        self.take_latest(|e| e.failed && e.within(scope))
    }

    /// Every app inside `scope`, newest first
    pub fn take_scope(&self, scope: &[String]) -> Vec<LedgerEntry> {
        self.take_where(|e| e.within(scope))
    }

    /// Every app in the run, newest first
    pub fn take_all(&self) -> Vec<LedgerEntry> {
        self.take_where(|_| true)
    }

    /// Note that an entry's rollback went through
    pub fn confirm(&self, entry: &LedgerEntry) {
        let mut entries = self.lock();
        if let Some(found) = entries
            .iter_mut()
            .rev()
            .find(|e| e.state == EntryState::Taken && e.scope == entry.scope && e.app == entry.app)
        {
            found.state = EntryState::RolledBack;
        }
    }

    /// Apps whose rollback went through
    pub fn rolled_back(&self) -> HashSet<AppKey> {
        self.lock()
            .iter()
            .filter(|e| e.state == EntryState::RolledBack)
            .map(LedgerEntry::key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn ran(name: &str, ok: bool) -> AppResult {
        let mut app = AppResult::new(name);
        app.start();
        if ok {
            app.succeed(Some(json!({ "app": name })));
        } else {
            app.fail("boom", None);
        }
        app
    }

    fn scope(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| (*s).to_string()).collect()
    }

    fn names(entries: &[LedgerEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.app.as_str()).collect()
    }

    fn ledger() -> RollbackLedger {
        let ledger = RollbackLedger::new();
        let settings = Settings::default();
        ledger.record(&[], &ran("a", true), &settings);
        ledger.record(&scope(&["web"]), &ran("b", true), &settings);
        ledger.record(&scope(&["web", "edge"]), &ran("c", false), &settings);
        ledger.record(&scope(&["db"]), &ran("d", true), &settings);
        ledger
    }

    #[test]
    fn test_unfinished_apps_are_not_recorded() {
        let ledger = RollbackLedger::new();
        let mut skipped = AppResult::new("off");
        skipped.skip();
        ledger.record(&[], &skipped, &Settings::default());
        ledger.record(&[], &AppResult::new("never"), &Settings::default());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_take_all_is_reverse_order() {
        assert_eq!(names(&ledger().take_all()), ["d", "c", "b", "a"]);
    }

    #[test]
    fn test_take_scope_includes_nested() {
        let ledger = ledger();
        assert_eq!(names(&ledger.take_scope(&scope(&["web"]))), ["c", "b"]);
        assert_eq!(names(&ledger.take_all()), ["d", "a"]);
    }

    #[test]
    fn test_take_last_failed() {
        let ledger = ledger();
        assert_eq!(names(&ledger.take_last_failed(&[])), ["c"]);
        assert!(ledger.take_last_failed(&[]).is_empty());
        assert!(ledger.take_last_failed(&scope(&["db"])).is_empty());
    }

    #[test]
    fn test_entries_handed_out_once() {
        let ledger = ledger();
        assert_eq!(names(&ledger.take_app(&[], "a")), ["a"]);
        assert!(ledger.take_app(&[], "a").is_empty());
        assert!(ledger.take_app(&[], "b").is_empty());
    }

    #[test]
    fn test_confirm_marks_rolled_back() {
        let ledger = ledger();
        let taken = ledger.take_scope(&scope(&["web"]));
        ledger.confirm(&taken[1]);

        let rolled = ledger.rolled_back();
        assert_eq!(rolled.len(), 1);
        assert!(rolled.contains(&(scope(&["web"]), "b".to_string())));
    }

    #[test]
    fn test_record_after_poisoned_lock() {
        let ledger = Arc::new(RollbackLedger::new());
        let poisoner = Arc::clone(&ledger);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.lock().expect("lock before poisoning");
            panic!("intentional poison");
        })
        .join();

        ledger.record(&[], &ran("a", true), &Settings::default());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_deferred_full_rollback_is_taken_once() {
        let ledger = ledger();
        assert!(!ledger.has_deferred_all());
        ledger.defer_all();
        assert!(ledger.has_deferred_all());
        assert!(ledger.take_deferred_all());
        assert!(!ledger.take_deferred_all());
        assert_eq!(ledger.len(), 4);
    }
}
