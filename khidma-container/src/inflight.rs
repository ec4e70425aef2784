//! Builds in flight across concurrent resolutions.
//!
//! Every top-level resolution is an owner. An owner initialising a cache
//! cell is that cell's builder; an owner about to await a cell is a waiter.
//! The per-resolution chain only sees one owner, so a loop through two
//! owners (task 1 builds `A` and waits on `B`, task 2 builds `B` and waits
//! on `A`) is caught here: the wait that would close the loop fails with
//! [`KhidmaError::CyclicDependency`] instead of blocking forever.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{CyclicDependencyError, KhidmaError, Result};
use crate::key::ServiceKey;

/// One cache cell: a singleton (`scope: None`) or an entry of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Slot {
    pub scope: Option<u64>,
    pub key: ServiceKey,
}

impl Slot {
    pub fn singleton(key: ServiceKey) -> Self {
        Self { scope: None, key }
    }

    pub fn scoped(scope: u64, key: ServiceKey) -> Self {
        Self {
            scope: Some(scope),
            key,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct BuildTracker {
    next_owner: AtomicU64,
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Cell -> owner running its initialiser.
    builders: HashMap<Slot, u64>,
    /// Owner -> cells it is waiting on.
    waits: HashMap<u64, Vec<Slot>>,
}

impl BuildTracker {
    pub fn next_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `owner` as waiting on `slot`.
    ///
    /// `outer` is the owner's chain of keys around `slot`, outermost first.
    /// Check and registration share one critical section, so of two owners
    /// closing a loop at the same time the second always sees the first.
    pub fn wait(&self, owner: u64, slot: Slot, outer: &[ServiceKey]) -> Result<Waiting<'_>> {
        let mut state = self.state.lock();

        if let Some(trail) = state.loop_back(owner, &slot) {
            let start = trail
                .last()
                .and_then(|closing| outer.iter().position(|k| k == closing))
                .unwrap_or(0);
            let mut chain = outer[start..].to_vec();
            chain.extend(trail);

            warn!(cycle = ?chain, "Cyclic dependency across concurrent resolutions");
            return Err(KhidmaError::CyclicDependency(CyclicDependencyError { chain }));
        }

        state.waits.entry(owner).or_default().push(slot.clone());
        Ok(Waiting {
            tracker: self,
            owner,
            slot,
        })
    }

    /// Marks `owner` as the builder of `slot` until the guard drops.
    pub fn begin(&self, owner: u64, slot: &Slot) -> Building<'_> {
        self.state.lock().builders.insert(slot.clone(), owner);
        Building {
            tracker: self,
            owner,
            slot: slot.clone(),
        }
    }
}

impl TrackerState {
    /// Keys from `slot` through waiting owners back to a cell `owner` is
    /// building, if waiting on `slot` would close such a loop.
    fn loop_back(&self, owner: u64, slot: &Slot) -> Option<Vec<ServiceKey>> {
        let builder = *self.builders.get(slot)?;
        // Another branch of the same resolution; it makes progress.
        if builder == owner {
            return None;
        }

        let mut seen = HashSet::new();
        let mut trail = vec![slot.key.clone()];
        let closed = self.follow(owner, builder, &mut seen, &mut trail);
        closed.then_some(trail)
    }

    fn follow(&self, owner: u64, builder: u64, seen: &mut HashSet<u64>, trail: &mut Vec<ServiceKey>) -> bool {
        if !seen.insert(builder) {
            return false;
        }
        let Some(waits) = self.waits.get(&builder) else {
            return false;
        };

        for slot in waits {
            let Some(&next) = self.builders.get(slot) else {
                continue;
            };
            trail.push(slot.key.clone());
            if next == owner || self.follow(owner, next, seen, trail) {
                return true;
            }
            trail.pop();
        }
        false
    }

    fn remove_wait(&mut self, owner: u64, slot: &Slot) {
        let Some(waits) = self.waits.get_mut(&owner) else {
            return;
        };
        if let Some(at) = waits.iter().position(|s| s == slot) {
            waits.swap_remove(at);
        }
        if waits.is_empty() {
            self.waits.remove(&owner);
        }
    }
}

/// Drops the wait registration.
#[must_use]
pub(crate) struct Waiting<'a> {
    tracker: &'a BuildTracker,
    owner: u64,
    slot: Slot,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.tracker.state.lock().remove_wait(self.owner, &self.slot);
    }
}

/// Drops the builder registration.
#[must_use]
pub(crate) struct Building<'a> {
    tracker: &'a BuildTracker,
    owner: u64,
    slot: Slot,
}

impl Drop for Building<'_> {
    fn drop(&mut self) {
        let mut state = self.tracker.state.lock();
        if state.builders.get(&self.slot) == Some(&self.owner) {
            state.builders.remove(&self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;
    struct C;

    fn slot<T: 'static>() -> Slot {
        Slot::singleton(ServiceKey::of::<T>())
    }

    #[test]
    fn two_owners_waiting_on_each_other_is_a_cycle() {
        let tracker = BuildTracker::default();
        let _a = tracker.begin(1, &slot::<A>());
        let _b = tracker.begin(2, &slot::<B>());

        let _first = tracker.wait(1, slot::<B>(), &[ServiceKey::of::<A>()]).unwrap();
        match tracker.wait(2, slot::<A>(), &[ServiceKey::of::<B>()]) {
            Err(KhidmaError::CyclicDependency(e)) => assert_eq!(
                e.chain,
                vec![ServiceKey::of::<B>(), ServiceKey::of::<A>(), ServiceKey::of::<B>()]
            ),
            Err(other) => panic!("Expected CyclicDependency, got: {other:?}"),
            Ok(_) => panic!("Expected CyclicDependency, got a registered wait"),
        }
    }

    #[test]
    fn loop_through_three_owners_is_found() {
        let tracker = BuildTracker::default();
        let _a = tracker.begin(1, &slot::<A>());
        let _b = tracker.begin(2, &slot::<B>());
        let _c = tracker.begin(3, &slot::<C>());

        let _w1 = tracker.wait(1, slot::<B>(), &[ServiceKey::of::<A>()]).unwrap();
        let _w2 = tracker.wait(2, slot::<C>(), &[ServiceKey::of::<B>()]).unwrap();
        assert!(matches!(
            tracker.wait(3, slot::<A>(), &[ServiceKey::of::<C>()]),
            Err(KhidmaError::CyclicDependency(_))
        ));
    }

    #[test]
    fn waiting_on_an_unrelated_builder_is_fine() {
        let tracker = BuildTracker::default();
        let _b = tracker.begin(2, &slot::<B>());

        assert!(tracker.wait(1, slot::<B>(), &[ServiceKey::of::<A>()]).is_ok());
    }

    #[test]
    fn guards_clear_their_registrations() {
        let tracker = BuildTracker::default();
        let a = tracker.begin(1, &slot::<A>());
        let b = tracker.begin(2, &slot::<B>());
        let wait = tracker.wait(1, slot::<B>(), &[ServiceKey::of::<A>()]).unwrap();
        drop((wait, a, b));

        let state = tracker.state.lock();
        assert!(state.builders.is_empty());
        assert!(state.waits.is_empty());
    }

    #[test]
    fn scopes_keep_slots_apart() {
        let tracker = BuildTracker::default();
        let _a = tracker.begin(1, &Slot::scoped(1, ServiceKey::of::<A>()));
        let _b = tracker.begin(2, &Slot::scoped(1, ServiceKey::of::<B>()));
        let _w = tracker
            .wait(1, Slot::scoped(1, ServiceKey::of::<B>()), &[ServiceKey::of::<A>()])
            .unwrap();

        // Same key in another scope is a different cell.
        assert!(tracker
            .wait(2, Slot::scoped(2, ServiceKey::of::<A>()), &[ServiceKey::of::<B>()])
            .is_ok());
        assert!(tracker
            .wait(2, Slot::scoped(1, ServiceKey::of::<A>()), &[ServiceKey::of::<B>()])
            .is_err());
    }
}
