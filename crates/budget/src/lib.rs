//! Shared send budgets.
//!
//! A budget is a pool of "permission to send N bytes" identified by a budget id.
//! Creditors add to the pool as their peer acknowledges data, and debitors claim
//! from it before they send. A single BudgetTable is shared by every scope of
//! an engine, and is the only structure in the bridge which is mutated from
//! more than one thread: balances and totals are atomics, and each slot guards
//! its watcher list with its own lock.
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Flusher is invoked with the trace id of a credit when a waiting watcher
/// may now be able to claim. It's called outside of any table lock, and
/// is expected to hand the notification off to the watcher's own scope.
pub type Flusher = Arc<dyn Fn(u64) + Send + Sync>;

/// BudgetIndex is an opaque reference to an acquired budget slot.
/// It remembers the budget id it was acquired for, so that an index which
/// outlives its slot can never claim from a budget that re-used the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BudgetIndex {
    slot: u32,
    budget_id: u64,
}

impl BudgetIndex {
    #[inline]
    pub fn budget_id(&self) -> u64 {
        self.budget_id
    }
}

/// BudgetTable is a fixed-capacity table of shared budgets.
pub struct BudgetTable {
    slots: Box<[Slot]>,
    // Maps acquired budget ids to their slot and reference counts.
    // Only acquire and release take this lock; credit and claim do not.
    index: Mutex<HashMap<u64, Entry>>,
    next_budget_id: AtomicU64,
}

struct Slot {
    budget_id: AtomicU64,
    balance: AtomicI64,
    credited: AtomicU64,
    claimed: AtomicU64,
    watchers: Mutex<Vec<Watcher>>,
}

struct Watcher {
    watcher_id: u64,
    flusher: Flusher,
    waiting: bool,
}

struct Entry {
    slot: usize,
    creditors: u32,
    debitors: u32,
}

impl BudgetTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                budget_id: AtomicU64::new(0),
                balance: AtomicI64::new(0),
                credited: AtomicU64::new(0),
                claimed: AtomicU64::new(0),
                watchers: Mutex::new(Vec::new()),
            })
            .collect();

        Self {
            slots,
            index: Mutex::new(HashMap::new()),
            next_budget_id: AtomicU64::new(1),
        }
    }

    /// Supply a new, non-zero budget id namespaced by the scope which owns its creditor.
    pub fn supply_budget_id(&self, scope: u8) -> u64 {
        let next = self.next_budget_id.fetch_add(1, Ordering::Relaxed);
        ((scope as u64) << 56) | (next & 0x00ff_ffff_ffff_ffff)
    }

    /// Acquire the creditor side of `budget_id`, allocating its slot if needed.
    /// Returns None if the table is full.
    pub fn acquire_creditor(&self, budget_id: u64) -> Option<BudgetIndex> {
        let slot = self.acquire_slot(budget_id, |entry| entry.creditors += 1)?;
        Some(BudgetIndex {
            slot: slot as u32,
            budget_id,
        })
    }

    /// Release a creditor acquired through `acquire_creditor`.
    pub fn release_creditor(&self, index: BudgetIndex) {
        self.release_slot(index, |entry| {
            if entry.creditors == 0 {
                return false;
            }
            entry.creditors -= 1;
            true
        });
    }

    /// Add `amount` to the balance of `budget_id`, waking any watchers which are
    /// waiting for credit. Returns the previous balance, or None if no creditor
    /// or debitor currently holds the budget, or the amount is refused.
    pub fn credit(&self, trace_id: u64, budget_id: u64, amount: u64) -> Option<i64> {
        let slot = self.index.lock().unwrap().get(&budget_id).map(|e| e.slot)?;
        self.credit_index(
            trace_id,
            BudgetIndex {
                slot: slot as u32,
                budget_id,
            },
            amount,
        )
    }

    /// Add `amount` to the balance of an acquired budget index.
    /// An amount beyond the range of a balance is refused with None.
    pub fn credit_index(&self, trace_id: u64, index: BudgetIndex, amount: u64) -> Option<i64> {
        let slot = self.slot(index)?;
        let Ok(signed) = i64::try_from(amount) else {
            tracing::warn!(budget_id = index.budget_id, amount, "refusing credit beyond balance range");
            return None;
        };

        // Order matters: `credited` is raised before the balance so that
        // an observer never sees more claimed than credited.
        slot.credited.fetch_add(amount, Ordering::AcqRel);
        let previous = slot.balance.fetch_add(signed, Ordering::AcqRel);

        let flushers: Vec<Flusher> = {
            let mut watchers = slot.watchers.lock().unwrap();
            watchers
                .iter_mut()
                .filter(|w| w.waiting)
                .map(|w| {
                    w.waiting = false;
                    w.flusher.clone()
                })
                .collect()
        };

        tracing::trace!(
            budget_id = index.budget_id,
            amount,
            previous,
            watchers = flushers.len(),
            "credited budget"
        );

        for flusher in flushers {
            flusher(trace_id);
        }
        Some(previous)
    }

    /// Register `watcher_id` as a debitor of `budget_id`.
    /// `flusher` is invoked when credit arrives after a claim came up short.
    /// Returns None (a failure fatal to the requesting stream) if the table is full.
    pub fn acquire(&self, budget_id: u64, watcher_id: u64, flusher: Flusher) -> Option<BudgetIndex> {
        let slot = self.acquire_slot(budget_id, |entry| entry.debitors += 1)?;

        self.slots[slot].watchers.lock().unwrap().push(Watcher {
            watcher_id,
            flusher,
            waiting: false,
        });

        Some(BudgetIndex {
            slot: slot as u32,
            budget_id,
        })
    }

    /// Attempt to claim between `minimum` and `maximum` from the budget,
    /// while leaving at least `deferred` in the balance.
    /// Returns zero if that's not possible, in which case the watcher is
    /// flushed upon the next credit. Never blocks or spins.
    pub fn claim(
        &self,
        index: BudgetIndex,
        watcher_id: u64,
        minimum: u32,
        maximum: u32,
        deferred: u32,
    ) -> u32 {
        let Some(slot) = self.slot(index) else {
            return 0;
        };
        let mut marked = false;

        loop {
            let balance = slot.balance.load(Ordering::Acquire);
            let claimed = (balance - i64::from(deferred)).min(i64::from(maximum));

            if claimed <= 0 || claimed < i64::from(minimum) {
                if marked {
                    return 0;
                }
                // Mark as waiting, then re-check the balance: a credit which
                // landed between our load and the mark would otherwise be missed.
                marked = slot.set_waiting(watcher_id);
                if !marked {
                    return 0; // Not a registered watcher.
                }
                continue;
            }

            if slot
                .balance
                .compare_exchange(
                    balance,
                    balance - claimed,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                slot.claimed.fetch_add(claimed as u64, Ordering::AcqRel);
                return claimed as u32;
            }
        }
    }

    /// Release the debitor registration of `watcher_id`.
    /// Releasing an already-released watcher is a no-op.
    pub fn release(&self, index: BudgetIndex, watcher_id: u64) {
        let Some(slot) = self.slot(index) else {
            return;
        };
        let removed = {
            let mut watchers = slot.watchers.lock().unwrap();
            let before = watchers.len();
            watchers.retain(|w| w.watcher_id != watcher_id);
            before != watchers.len()
        };

        if removed {
            self.release_slot(index, |entry| {
                entry.debitors = entry.debitors.saturating_sub(1);
                true
            });
        }
    }

    /// Current balance of `budget_id`, if it's held.
    pub fn balance(&self, budget_id: u64) -> Option<i64> {
        let slot = self.index.lock().unwrap().get(&budget_id).map(|e| e.slot)?;
        Some(self.slots[slot].balance.load(Ordering::Acquire))
    }

    /// Total (credited, claimed) amounts of `budget_id`, if it's held.
    pub fn totals(&self, budget_id: u64) -> Option<(u64, u64)> {
        let slot = self.index.lock().unwrap().get(&budget_id).map(|e| e.slot)?;
        let slot = &self.slots[slot];

        let claimed = slot.claimed.load(Ordering::Acquire);
        let credited = slot.credited.load(Ordering::Acquire);
        Some((credited, claimed))
    }

    fn slot(&self, index: BudgetIndex) -> Option<&Slot> {
        let slot = self.slots.get(index.slot as usize)?;
        if slot.budget_id.load(Ordering::Acquire) != index.budget_id {
            return None;
        }
        Some(slot)
    }

    fn acquire_slot(&self, budget_id: u64, inc: impl FnOnce(&mut Entry)) -> Option<usize> {
        assert_ne!(budget_id, 0, "budget id zero means 'no budget'");
        let mut index = self.index.lock().unwrap();

        if let Some(entry) = index.get_mut(&budget_id) {
            inc(entry);
            return Some(entry.slot);
        }

        let Some(slot) = self
            .slots
            .iter()
            .position(|s| s.budget_id.load(Ordering::Acquire) == 0)
        else {
            tracing::warn!(budget_id, capacity = self.slots.len(), "budget table is full");
            return None;
        };

        let s = &self.slots[slot];
        s.balance.store(0, Ordering::Release);
        s.credited.store(0, Ordering::Release);
        s.claimed.store(0, Ordering::Release);
        s.watchers.lock().unwrap().clear();
        s.budget_id.store(budget_id, Ordering::Release);

        let mut entry = Entry {
            slot,
            creditors: 0,
            debitors: 0,
        };
        inc(&mut entry);
        index.insert(budget_id, entry);

        Some(slot)
    }

    fn release_slot(&self, index: BudgetIndex, dec: impl FnOnce(&mut Entry) -> bool) {
        let mut guard = self.index.lock().unwrap();

        let Some(entry) = guard.get_mut(&index.budget_id) else {
            return;
        };
        if entry.slot != index.slot as usize || !dec(entry) {
            return;
        }
        if entry.creditors == 0 && entry.debitors == 0 {
            guard.remove(&index.budget_id);
            self.slots[index.slot as usize]
                .budget_id
                .store(0, Ordering::Release);
        }
    }
}

impl Slot {
    fn set_waiting(&self, watcher_id: u64) -> bool {
        let mut watchers = self.watchers.lock().unwrap();
        match watchers.iter_mut().find(|w| w.watcher_id == watcher_id) {
            Some(w) => {
                w.waiting = true;
                true
            }
            None => false,
        }
    }
}
