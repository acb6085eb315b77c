//! Shared result store
//!
//! The only state mutated concurrently by workers. Every transition updates the
//! map entry and the matching counters inside one critical section, which keeps
//! `sum(counters) == items whose outcome is not Unknown` at all times.
//! Counters are atomics so the progress reporter can sample them without
//! taking the lock.

use crate::types::{ItemId, Outcome, OutcomeCounts};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Concurrency-safe map of item outcomes plus one counter per counted outcome
#[derive(Debug, Default)]
pub struct ResultStore {
    outcomes: Mutex<HashMap<ItemId, Outcome>>,
    counters: [AtomicUsize; 7],
}

impl ResultStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ItemId, Outcome>> {
        // a panicking worker must not take the whole run down with it
        self.outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn adjust(&self, from: Option<Outcome>, to: Outcome) {
        if let Some(i) = from.and_then(Outcome::counter_index) {
            self.counters[i].fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(i) = to.counter_index() {
            self.counters[i].fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Move an item to `outcome`, returning its previous outcome
    ///
    /// Overwrites, never duplicates: the previous outcome's counter is
    /// decremented in the same critical section.
    pub fn set(&self, id: &ItemId, outcome: Outcome) -> Option<Outcome> {
        let mut map = self.lock();
        let previous = map.insert(id.clone(), outcome);
        self.adjust(previous, outcome);
        previous
    }

    /// Register a dispatched item as `Unknown` unless it already has an outcome
    pub fn mark_pending(&self, id: &ItemId) {
        let mut map = self.lock();
        map.entry(id.clone()).or_insert(Outcome::Unknown);
    }

    /// Mark an item as skipped before dispatch
    pub fn mark_skipped(&self, id: &ItemId) {
        self.set(id, Outcome::Skipped);
    }

    /// Reset an item to `Unknown` ahead of re-dispatch
    ///
    /// Returns the outcome the item had. Settled items (`Success`,
    /// `Skipped`) are left untouched and `None` is returned, so a stale retry
    /// list can never un-succeed an item.
    pub fn mark_retrying(&self, id: &ItemId) -> Option<Outcome> {
        let mut map = self.lock();
        let entry = map.entry(id.clone()).or_insert(Outcome::Unknown);
        let previous = *entry;
        if previous.is_settled() {
            return None;
        }
        *entry = Outcome::Unknown;
        self.adjust(Some(previous), Outcome::Unknown);
        Some(previous)
    }

    /// Current outcome of an item
    pub fn outcome(&self, id: &ItemId) -> Option<Outcome> {
        self.lock().get(id).copied()
    }

    /// Items of `ids` that still need work (neither `Success` nor `Skipped`), in order
    pub fn retry_set(&self, ids: &[ItemId]) -> Vec<ItemId> {
        let map = self.lock();
        ids.iter()
            .filter(|id| !map.get(*id).is_some_and(|o| o.is_settled()))
            .cloned()
            .collect()
    }

    /// Outcomes of `ids` in order; unseen items read as `Unknown`
    pub fn outcomes_for(&self, ids: &[ItemId]) -> Vec<(ItemId, Outcome)> {
        let map = self.lock();
        ids.iter()
            .map(|id| (id.clone(), map.get(id).copied().unwrap_or(Outcome::Unknown)))
            .collect()
    }

    /// Lock-free counter snapshot
    pub fn counts(&self) -> OutcomeCounts {
        OutcomeCounts::from_array(std::array::from_fn(|i| {
            self.counters[i].load(Ordering::Acquire)
        }))
    }

    /// Number of tracked items (any outcome, including `Unknown`)
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no item is tracked yet
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether the counters agree with the map
    ///
    /// Checked under the lock, so it is exact even while workers run.
    pub fn counters_consistent(&self) -> bool {
        let map = self.lock();
        let mut expected = [0usize; 7];
        for outcome in map.values() {
            if let Some(i) = outcome.counter_index() {
                expected[i] += 1;
            }
        }
        expected
            .iter()
            .zip(&self.counters)
            .all(|(want, have)| *want == have.load(Ordering::Acquire))
    }
}
