use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

#[derive(Default)]
struct Inner {
    committed: u64,
    // sid -> deliveries not yet completed
    outstanding: BTreeMap<u64, usize>,
    completed: BTreeSet<u64>,
}

/// Decides how far a durable sink may commit its offset.
///
/// The sink tracks every sequence id it routes, once per delivery and in fetch
/// order, before the message enters either lane. Deliveries complete in any
/// order. The offset only moves up to the highest completed id below the
/// oldest outstanding one, and never backwards.
#[derive(Default)]
pub struct OffsetTracker {
    inner: Mutex<Inner>,
}

impl OffsetTracker {
    /// Forgets all tracking state; `committed` is the last persisted offset.
    pub fn reset(&self, committed: u64) {
        *self.inner.lock() = Inner { committed, ..Default::default() };
    }

    pub fn track(&self, sid: u64, deliveries: usize) {
        if deliveries == 0 {
            return;
        }
        *self.inner.lock().outstanding.entry(sid).or_insert(0) += deliveries;
    }

    /// Marks one delivery of `sid` done. Returns the new offset to commit, if
    /// it advanced.
    pub fn complete(&self, sid: u64) -> Option<u64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if sid <= inner.committed {
            return None;
        }
        let remaining = inner.outstanding.get_mut(&sid).map(|n| {
            *n -= 1;
            *n
        });
        match remaining {
            Some(0) => {
                inner.outstanding.remove(&sid);
            }
            Some(_) => return None,
            None => {}
        }
        inner.completed.insert(sid);

        let floor = inner.outstanding.keys().next().copied();
        let candidate = match floor {
            Some(floor) => inner.completed.range(..floor).next_back().copied(),
            None => inner.completed.iter().next_back().copied(),
        }?;
        let rest = match floor {
            Some(floor) => inner.completed.split_off(&floor),
            None => BTreeSet::new(),
        };
        inner.completed = rest;
        if candidate <= inner.committed {
            return None;
        }
        inner.committed = candidate;
        Some(candidate)
    }

    #[inline]
    pub fn committed(&self) -> u64 {
        self.inner.lock().committed
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.values().sum()
    }
}
