use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::{
    db::models::{RenderRecord, RenderScope, RenderStatus, OPTIMISTIC_ID_PREFIX},
    identity::fingerprint,
};

use super::equality::sequence_equals;

/// Why a submission was refused. Refusals indicate a UI race, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmitRejection {
    EmptyKey,
    /// A persisted, non-archived record for the key is still queued.
    AlreadyQueued,
    /// An optimistic submission for the key is still outstanding.
    AlreadyPending,
    /// Retry asked for a key whose placeholder has not failed.
    NothingToRetry,
    /// Retry asked for a key whose lock window has not elapsed.
    Locked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// The exposed view was replaced.
    pub changed: bool,
    /// At least one non-archived record in the view is queued.
    pub has_queued: bool,
    /// Placeholders superseded by a persisted twin during this pass.
    pub retired: usize,
}

/// Owned reconciliation state for one scope (owner + active URL).
///
/// Merges the last persisted snapshot with client-side placeholders and tracks the
/// time-boxed locks that bridge the gap between submission and feed visibility.
/// Every method takes `now_ms` explicitly so the merge stays deterministic.
#[derive(Debug, Clone)]
pub struct ReconciliationState {
    scope: RenderScope,
    persisted: Vec<RenderRecord>,
    view: Vec<RenderRecord>,
    optimistic: HashMap<String, RenderRecord>,
    pending_by_key: HashSet<String>,
    lock_until_by_key: HashMap<String, i64>,
    lock_until_by_record_id: HashMap<String, i64>,
    /// Persisted ids already present for a key when its placeholder was installed.
    prior_ids_by_key: HashMap<String, HashSet<String>>,
}

impl ReconciliationState {
    pub fn new(scope: RenderScope) -> Self {
        Self {
            scope,
            persisted: Vec::new(),
            view: Vec::new(),
            optimistic: HashMap::new(),
            pending_by_key: HashSet::new(),
            lock_until_by_key: HashMap::new(),
            lock_until_by_record_id: HashMap::new(),
            prior_ids_by_key: HashMap::new(),
        }
    }

    pub fn scope(&self) -> &RenderScope {
        &self.scope
    }

    pub fn view(&self) -> &[RenderRecord] {
        &self.view
    }

    pub fn persisted(&self) -> &[RenderRecord] {
        &self.persisted
    }

    pub fn placeholder(&self, key: &str) -> Option<&RenderRecord> {
        self.optimistic.get(key)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending_by_key.contains(key)
    }

    pub fn is_key_locked(&self, key: &str, now_ms: i64) -> bool {
        self.lock_until_by_key
            .get(key)
            .is_some_and(|until| *until > now_ms)
    }

    pub fn is_record_locked(&self, record_id: &str, now_ms: i64) -> bool {
        self.lock_until_by_record_id
            .get(record_id)
            .is_some_and(|until| *until > now_ms)
    }

    pub fn has_queued(&self) -> bool {
        self.view.iter().any(|record| record.is_queued() && !record.archived)
    }

    /// Extend (never shorten) the lock on `key` and, optionally, a record id.
    pub fn lock(&mut self, key: &str, record_id: Option<&str>, until_ms: i64) {
        extend(&mut self.lock_until_by_key, key, until_ms);
        if let Some(record_id) = record_id {
            extend(&mut self.lock_until_by_record_id, record_id, until_ms);
        }
    }

    pub fn check_submission(&self, key: &str) -> Result<(), SubmitRejection> {
        if key.is_empty() {
            return Err(SubmitRejection::EmptyKey);
        }

        let queued = self
            .persisted
            .iter()
            .any(|record| record.key_str() == key && record.is_queued() && !record.archived);
        if queued {
            return Err(SubmitRejection::AlreadyQueued);
        }

        if self.pending_by_key.contains(key) {
            return Err(SubmitRejection::AlreadyPending);
        }

        Ok(())
    }

    /// Install the placeholder and lock for a new job on `key`.
    pub fn begin_submission(
        &mut self,
        key: &str,
        name_hint: Option<String>,
        now_ms: i64,
        lock_ms: u64,
    ) -> Result<RenderRecord, SubmitRejection> {
        self.check_submission(key)?;

        let seed = format!(
            "{}|{}|{}|{}",
            self.scope.owner, self.scope.url, key, now_ms
        );
        let id = format!("{OPTIMISTIC_ID_PREFIX}{}-{:x}", fingerprint(&seed), now_ms);

        let record = RenderRecord {
            id: id.clone(),
            key: Some(key.to_string()),
            status: RenderStatus::Queued,
            url: Some(self.scope.url.clone()),
            url_fingerprint: Some(self.scope.url_fingerprint.clone()),
            name_hint,
            html: Some(String::new()),
            archived: false,
            created_at: now_ms,
            updated_at: now_ms,
        };

        let prior_ids = self
            .persisted
            .iter()
            .filter(|record| record.key_str() == key)
            .map(|record| record.id.clone())
            .collect();
        self.prior_ids_by_key.insert(key.to_string(), prior_ids);

        let lock_ms = i64::try_from(lock_ms).unwrap_or(i64::MAX);
        self.lock(key, Some(&id), now_ms.saturating_add(lock_ms));
        self.view.insert(0, record.clone());
        self.optimistic.insert(key.to_string(), record.clone());
        self.pending_by_key.insert(key.to_string());

        Ok(record)
    }

    /// Flip the placeholder `record_id` for `key` to failed. Locks stay in place.
    pub fn mark_submission_failed(&mut self, key: &str, record_id: &str) -> bool {
        let mut found = false;

        if let Some(placeholder) = self.optimistic.get_mut(key) {
            if placeholder.id == record_id {
                placeholder.status = RenderStatus::Failed;
                found = true;
            }
        }

        for record in self.view.iter_mut().filter(|record| record.id == record_id) {
            record.status = RenderStatus::Failed;
            found = true;
        }

        found
    }

    /// Clear a failed placeholder so `key` can be submitted again.
    pub fn prepare_retry(&mut self, key: &str, now_ms: i64) -> Result<(), SubmitRejection> {
        let failed = self
            .optimistic
            .get(key)
            .is_some_and(|placeholder| placeholder.status == RenderStatus::Failed);
        if !failed {
            return Err(SubmitRejection::NothingToRetry);
        }
        if self.is_key_locked(key, now_ms) {
            return Err(SubmitRejection::Locked);
        }

        if let Some(placeholder) = self.forget_placeholder(key) {
            self.view.retain(|record| record.id != placeholder.id);
        }
        self.pending_by_key.remove(key);
        Ok(())
    }

    /// Merge a fresh persisted snapshot with outstanding placeholders.
    pub fn reconcile(&mut self, fresh: Vec<RenderRecord>, now_ms: i64) -> ReconcileOutcome {
        let scope = &self.scope;
        let filtered: Vec<RenderRecord> = fresh
            .into_iter()
            .filter(|record| scope.matches(record))
            .collect();

        self.lock_until_by_key.retain(|_, until| *until > now_ms);
        self.lock_until_by_record_id.retain(|_, until| *until > now_ms);

        // A record that only just became persisted inherits the key's lock window.
        for (key, until) in &self.lock_until_by_key {
            for record in filtered.iter().filter(|record| record.key_str() == key) {
                extend(&mut self.lock_until_by_record_id, &record.id, *until);
            }
        }

        let mut retired = 0;
        let mut survivors = Vec::new();
        let keys: Vec<String> = self.optimistic.keys().cloned().collect();
        for key in keys {
            let Some(placeholder) = self.optimistic.get(&key) else {
                continue;
            };
            let superseded = filtered
                .iter()
                .any(|record| self.is_twin(record, placeholder));
            if superseded {
                self.forget_placeholder(&key);
                retired += 1;
            } else {
                survivors.push(placeholder.clone());
            }
        }
        survivors.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut merged = survivors;
        merged.extend(filtered.iter().cloned());

        let changed = !sequence_equals(&self.view, &merged);
        if changed {
            self.view = merged;
        }

        for record in &filtered {
            let key = record.key_str();
            if key.is_empty() || !record.status.is_terminal() {
                continue;
            }
            if let Some(placeholder) = self.optimistic.get(key) {
                if !self.is_twin(record, placeholder) {
                    continue;
                }
            }
            self.forget_placeholder(key);
            self.pending_by_key.remove(key);
        }

        self.persisted = filtered;

        ReconcileOutcome {
            changed,
            has_queued: self.has_queued(),
            retired,
        }
    }

    /// Fail every placeholder still queued. Returns how many flipped.
    pub fn fail_stale_placeholders(&mut self) -> usize {
        let mut stale = Vec::new();
        for placeholder in self.optimistic.values_mut() {
            if placeholder.is_queued() {
                placeholder.status = RenderStatus::Failed;
                stale.push(placeholder.id.clone());
            }
        }

        for record in self.view.iter_mut() {
            if stale.contains(&record.id) {
                record.status = RenderStatus::Failed;
            }
        }

        stale.len()
    }

    /// Drop a record from the view. Key locks are left alone.
    pub fn discard(&mut self, record_id: &str) -> Option<RenderRecord> {
        let position = self.view.iter().position(|record| record.id == record_id)?;
        let removed = self.view.remove(position);
        self.persisted.retain(|record| record.id != record_id);
        self.lock_until_by_record_id.remove(record_id);

        if removed.is_optimistic() {
            let key = removed.key_str();
            if self
                .optimistic
                .get(key)
                .is_some_and(|placeholder| placeholder.id == removed.id)
            {
                self.forget_placeholder(key);
                self.pending_by_key.remove(key);
            }
        }

        Some(removed)
    }

    /// A persisted record supersedes a placeholder when keys match and the record was not
    /// already known when the placeholder went in. Timestamps play no part.
    fn is_twin(&self, record: &RenderRecord, placeholder: &RenderRecord) -> bool {
        let key = placeholder.key_str();
        if record.key_str() != key {
            return false;
        }
        !self
            .prior_ids_by_key
            .get(key)
            .is_some_and(|ids| ids.contains(&record.id))
    }

    fn forget_placeholder(&mut self, key: &str) -> Option<RenderRecord> {
        self.prior_ids_by_key.remove(key);
        self.optimistic.remove(key)
    }
}

fn extend(map: &mut HashMap<String, i64>, id: &str, until_ms: i64) {
    let entry = map.entry(id.to_string()).or_insert(until_ms);
    if *entry < until_ms {
        *entry = until_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_762_822_804_825;
    const LOCK_MS: u64 = 60_000;

    fn scope() -> RenderScope {
        RenderScope::for_url("owner-1", "https://example.com/page")
    }

    fn state() -> ReconciliationState {
        ReconciliationState::new(scope())
    }

    fn persisted(id: &str, key: &str, status: RenderStatus) -> RenderRecord {
        RenderRecord {
            id: id.into(),
            key: Some(key.into()),
            status,
            url: Some("https://example.com/page".into()),
            ..Default::default()
        }
    }

    #[test]
    fn submission_installs_placeholder_and_lock() {
        let mut state = state();
        let record = state
            .begin_submission("shotA", Some("Landing".into()), NOW, LOCK_MS)
            .unwrap();

        assert!(record.is_optimistic());
        assert_eq!(record.status, RenderStatus::Queued);
        assert_eq!(record.url.as_deref(), Some("https://example.com/page"));
        assert_eq!(state.view().len(), 1);
        assert!(state.is_pending("shotA"));
        assert!(state.is_key_locked("shotA", NOW + 59_999));
        assert!(!state.is_key_locked("shotA", NOW + 60_000));
        assert!(state.is_record_locked(&record.id, NOW));
        assert!(state.has_queued());
    }

    #[test]
    fn happy_path_retires_placeholder() {
        let mut state = state();
        state.begin_submission("shotA", None, NOW, LOCK_MS).unwrap();

        let mut ready = persisted("r1", "shotA", RenderStatus::Ready);
        ready.html = Some("<p>x</p>".into());
        let outcome = state.reconcile(vec![ready], NOW + 1_000);

        assert!(outcome.changed);
        assert_eq!(outcome.retired, 1);
        assert!(!outcome.has_queued);
        assert_eq!(state.view().len(), 1);
        assert_eq!(state.view()[0].id, "r1");
        assert!(state.placeholder("shotA").is_none());
        assert!(!state.is_pending("shotA"));
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let mut state = state();
        state.begin_submission("shotA", None, NOW, LOCK_MS).unwrap();

        assert_eq!(
            state.begin_submission("shotA", None, NOW + 10, LOCK_MS),
            Err(SubmitRejection::AlreadyPending)
        );
        assert_eq!(state.view().len(), 1);
    }

    #[test]
    fn queued_persisted_record_blocks_submission() {
        let mut state = state();
        state.reconcile(vec![persisted("r1", "shotA", RenderStatus::Queued)], NOW);
        assert_eq!(
            state.check_submission("shotA"),
            Err(SubmitRejection::AlreadyQueued)
        );

        let mut archived = persisted("r1", "shotA", RenderStatus::Queued);
        archived.archived = true;
        state.reconcile(vec![archived], NOW);
        assert_eq!(state.check_submission("shotA"), Ok(()));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_eq!(
            state().check_submission(""),
            Err(SubmitRejection::EmptyKey)
        );
    }

    #[test]
    fn failure_flips_placeholder_and_keeps_pending() {
        let mut state = state();
        let record = state.begin_submission("shotB", None, NOW, LOCK_MS).unwrap();

        assert!(state.mark_submission_failed("shotB", &record.id));
        assert_eq!(state.view()[0].status, RenderStatus::Failed);
        assert_eq!(
            state.placeholder("shotB").map(|p| p.status),
            Some(RenderStatus::Failed)
        );
        assert!(state.is_pending("shotB"));
        assert!(state.is_key_locked("shotB", NOW + 1));

        // An unrelated snapshot leaves the failed placeholder visible.
        state.reconcile(vec![persisted("r2", "other", RenderStatus::Ready)], NOW + 5);
        assert_eq!(state.view()[0].id, record.id);
        assert!(state.is_pending("shotB"));
    }

    #[test]
    fn terminal_persisted_record_clears_pending_after_failure() {
        let mut state = state();
        let record = state.begin_submission("shotB", None, NOW, LOCK_MS).unwrap();
        state.mark_submission_failed("shotB", &record.id);

        state.reconcile(vec![persisted("r3", "shotB", RenderStatus::Failed)], NOW + 5);
        assert!(!state.is_pending("shotB"));
        assert_eq!(state.view().len(), 1);
        assert_eq!(state.view()[0].id, "r3");
    }

    #[test]
    fn retry_waits_for_lock_expiry() {
        let mut state = state();
        let record = state.begin_submission("shotB", None, NOW, LOCK_MS).unwrap();

        assert_eq!(
            state.prepare_retry("shotB", NOW + 1),
            Err(SubmitRejection::NothingToRetry)
        );

        state.mark_submission_failed("shotB", &record.id);
        assert_eq!(
            state.prepare_retry("shotB", NOW + 1),
            Err(SubmitRejection::Locked)
        );

        state.prepare_retry("shotB", NOW + 60_000).unwrap();
        assert!(!state.is_pending("shotB"));
        assert!(state.view().is_empty());
        assert!(state
            .begin_submission("shotB", None, NOW + 60_001, LOCK_MS)
            .is_ok());
    }

    #[test]
    fn lock_propagates_to_newly_persisted_record() {
        let mut state = state();
        state.begin_submission("shotC", None, NOW, LOCK_MS).unwrap();

        let outcome = state.reconcile(
            vec![persisted("r9", "shotC", RenderStatus::Queued)],
            NOW + 2_000,
        );

        assert!(outcome.has_queued);
        assert!(state.is_record_locked("r9", NOW + 2_000));
        assert!(state.is_record_locked("r9", NOW + 59_999));
        assert!(!state.is_record_locked("r9", NOW + 60_000));
        // Queued twin retires the placeholder but the key stays pending.
        assert_eq!(state.view().len(), 1);
        assert!(state.is_pending("shotC"));
    }

    #[test]
    fn relocking_only_extends() {
        let mut state = state();
        state.lock("k", Some("id"), NOW + 10_000);
        state.lock("k", Some("id"), NOW + 1_000);
        assert!(state.is_key_locked("k", NOW + 5_000));
        assert!(state.is_record_locked("id", NOW + 5_000));

        state.lock("k", None, NOW + 20_000);
        assert!(state.is_key_locked("k", NOW + 15_000));
        assert!(!state.is_record_locked("id", NOW + 15_000));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut state = state();
        state.begin_submission("shotA", None, NOW, LOCK_MS).unwrap();
        let snapshot = vec![
            persisted("r1", "other", RenderStatus::Ready),
            persisted("r2", "third", RenderStatus::Queued),
        ];

        let first = state.reconcile(snapshot.clone(), NOW + 1);
        let view = state.view().to_vec();
        let second = state.reconcile(snapshot, NOW + 2);

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(state.view(), view.as_slice());
        assert_eq!(state.view()[0].key_str(), "shotA");
    }

    #[test]
    fn out_of_scope_records_are_filtered() {
        let mut state = state();
        let mut foreign = persisted("x", "shotA", RenderStatus::Queued);
        foreign.url = Some("https://other.example/".into());

        let outcome = state.reconcile(vec![foreign], NOW);
        assert!(state.view().is_empty());
        assert!(!outcome.has_queued);
    }

    #[test]
    fn persisted_records_with_same_key_are_both_kept() {
        let mut state = state();
        state.reconcile(
            vec![
                persisted("r2", "shotA", RenderStatus::Ready),
                persisted("r1", "shotA", RenderStatus::Ready),
            ],
            NOW,
        );
        assert_eq!(state.view().len(), 2);
    }

    #[test]
    fn older_persisted_record_does_not_swallow_new_submission() {
        let mut state = state();
        let mut old = persisted("r1", "shotA", RenderStatus::Failed);
        old.created_at = NOW - 3_600_000;
        state.reconcile(vec![old.clone()], NOW);

        state.begin_submission("shotA", None, NOW, LOCK_MS).unwrap();
        state.reconcile(vec![old], NOW + 1_000);

        assert_eq!(state.view().len(), 2);
        assert!(state.view()[0].is_optimistic());
        assert!(state.is_pending("shotA"));
    }

    #[test]
    fn lagging_server_clock_still_retires_placeholder() {
        let mut state = state();
        state.begin_submission("shotA", None, NOW, LOCK_MS).unwrap();

        let mut ready = persisted("r1", "shotA", RenderStatus::Ready);
        ready.created_at = NOW - 10_000;
        ready.updated_at = NOW - 9_000;
        let outcome = state.reconcile(vec![ready], NOW + 2_000);

        assert_eq!(outcome.retired, 1);
        assert_eq!(state.view().len(), 1);
        assert_eq!(state.view()[0].id, "r1");
        assert!(!state.is_pending("shotA"));
        assert!(!outcome.has_queued);
    }

    #[test]
    fn unknown_timestamps_retire_placeholder() {
        let mut state = state();
        state.begin_submission("shotA", None, NOW, LOCK_MS).unwrap();

        state.reconcile(vec![persisted("r1", "shotA", RenderStatus::Queued)], NOW + 1);

        assert_eq!(state.view().len(), 1);
        assert!(!state.view()[0].is_optimistic());
        assert!(state.placeholder("shotA").is_none());
    }

    #[test]
    fn retry_treats_earlier_failure_as_known() {
        let mut state = state();
        state.begin_submission("shotB", None, NOW, LOCK_MS).unwrap();
        state.reconcile(vec![persisted("r1", "shotB", RenderStatus::Failed)], NOW + 1);
        assert!(!state.is_pending("shotB"));

        let placeholder = state
            .begin_submission("shotB", None, NOW + 120_000, LOCK_MS)
            .unwrap();
        state.reconcile(
            vec![persisted("r1", "shotB", RenderStatus::Failed)],
            NOW + 120_001,
        );
        assert_eq!(state.view()[0].id, placeholder.id);
        assert!(state.is_pending("shotB"));

        state.reconcile(
            vec![
                persisted("r2", "shotB", RenderStatus::Ready),
                persisted("r1", "shotB", RenderStatus::Failed),
            ],
            NOW + 125_000,
        );
        let ids: Vec<&str> = state.view().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
        assert!(!state.is_pending("shotB"));
    }

    #[test]
    fn stale_placeholders_fail() {
        let mut state = state();
        state.begin_submission("a", None, NOW, LOCK_MS).unwrap();
        state.begin_submission("b", None, NOW + 1, LOCK_MS).unwrap();

        assert_eq!(state.fail_stale_placeholders(), 2);
        assert!(state.view().iter().all(|r| r.status == RenderStatus::Failed));
        assert!(!state.has_queued());
        assert_eq!(state.fail_stale_placeholders(), 0);
    }

    #[test]
    fn placeholders_are_ordered_newest_first() {
        let mut state = state();
        state.begin_submission("a", None, NOW, LOCK_MS).unwrap();
        state.begin_submission("b", None, NOW + 1, LOCK_MS).unwrap();
        state.reconcile(vec![persisted("r1", "c", RenderStatus::Ready)], NOW + 2);

        let keys: Vec<&str> = state.view().iter().map(RenderRecord::key_str).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn discard_removes_record_but_keeps_key_lock() {
        let mut state = state();
        state.begin_submission("shotC", None, NOW, LOCK_MS).unwrap();
        state.reconcile(vec![persisted("r9", "shotC", RenderStatus::Ready)], NOW + 1);

        let removed = state.discard("r9").unwrap();
        assert_eq!(removed.id, "r9");
        assert!(state.view().is_empty());
        assert!(!state.is_record_locked("r9", NOW + 2));
        assert!(state.is_key_locked("shotC", NOW + 2));
        assert!(state.discard("r9").is_none());
    }

    #[test]
    fn discarding_placeholder_clears_pending() {
        let mut state = state();
        let record = state.begin_submission("shotD", None, NOW, LOCK_MS).unwrap();
        state.mark_submission_failed("shotD", &record.id);

        state.discard(&record.id).unwrap();
        assert!(!state.is_pending("shotD"));
        assert!(state.placeholder("shotD").is_none());
        assert!(state.is_key_locked("shotD", NOW + 1));
    }
}
