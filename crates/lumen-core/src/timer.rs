//! Idle-connection timers.
//!
//! Timer records live in an arena addressed by generation-checked
//! [`TimerId`] handles; a separate ordered index keyed by
//! `(expiry, insertion sequence)` keeps them sorted ascending. The list is
//! owned by the event-loop thread and never shared.

use std::collections::BTreeMap;
use std::time::Instant;

/// Stable handle to a timer. Stale handles (timer already fired or removed)
/// are detected by generation and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: usize,
    generation: u64,
}

/// A timer evicted by [`TimerList::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub id: TimerId,
    /// Connection slot the timer guards.
    pub slot: usize,
    pub expire: Instant,
}

#[derive(Debug)]
struct Entry {
    expire: Instant,
    seq: u64,
    slot: usize,
}

#[derive(Debug, Default)]
struct ArenaSlot {
    generation: u64,
    entry: Option<Entry>,
}

#[derive(Debug, Default)]
pub struct TimerList {
    arena: Vec<ArenaSlot>,
    free: Vec<usize>,
    order: BTreeMap<(Instant, u64), usize>,
    next_seq: u64,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a timer for `slot` expiring at `expire`.
    pub fn add(&mut self, expire: Instant, slot: usize) -> TimerId {
        let seq = self.bump_seq();
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.arena.push(ArenaSlot::default());
                self.arena.len() - 1
            }
        };
        let cell = &mut self.arena[index];
        cell.generation += 1;
        cell.entry = Some(Entry { expire, seq, slot });
        self.order.insert((expire, seq), index);

        TimerId {
            index,
            generation: cell.generation,
        }
    }

    /// Push a timer's deadline later. Deadlines only move forward: an
    /// earlier `expire` is clamped to the current one, and the timer is
    /// re-sorted behind every entry with an equal deadline.
    pub fn adjust(&mut self, id: TimerId, expire: Instant) -> bool {
        let seq = self.bump_seq();
        let Some(entry) = Self::lookup_mut(&mut self.arena, id) else {
            return false;
        };
        let expire = expire.max(entry.expire);
        self.order.remove(&(entry.expire, entry.seq));
        entry.expire = expire;
        entry.seq = seq;
        self.order.insert((expire, seq), id.index);
        true
    }

    /// Unlink a timer. Returns the guarded slot, or `None` for a stale handle.
    pub fn remove(&mut self, id: TimerId) -> Option<usize> {
        let entry = Self::lookup_mut(&mut self.arena, id)?;
        let key = (entry.expire, entry.seq);
        let slot = entry.slot;
        self.arena[id.index].entry = None;
        self.order.remove(&key);
        self.free.push(id.index);
        Some(slot)
    }

    /// Evict every timer with `expire <= now`, earliest first, calling
    /// `on_expire` for each after it has been unlinked. Returns the count.
    pub fn tick<F: FnMut(Expired)>(&mut self, now: Instant, mut on_expire: F) -> usize {
        let mut fired = 0;
        while let Some((&(expire, _), &index)) = self.order.first_key_value() {
            if expire > now {
                break;
            }
            self.order.pop_first();

            let cell = &mut self.arena[index];
            let Some(entry) = cell.entry.take() else {
                continue;
            };
            let id = TimerId {
                index,
                generation: cell.generation,
            };
            self.free.push(index);
            fired += 1;
            on_expire(Expired {
                id,
                slot: entry.slot,
                expire: entry.expire,
            });
        }
        fired
    }

    pub fn expiry(&self, id: TimerId) -> Option<Instant> {
        self.arena
            .get(id.index)
            .filter(|cell| cell.generation == id.generation)
            .and_then(|cell| cell.entry.as_ref())
            .map(|entry| entry.expire)
    }

    /// Guarded slots in expiry order.
    pub fn slots_in_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.order
            .values()
            .filter_map(|&index| self.arena[index].entry.as_ref().map(|e| e.slot))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn lookup_mut(arena: &mut [ArenaSlot], id: TimerId) -> Option<&mut Entry> {
        let cell = arena.get_mut(id.index)?;
        if cell.generation != id.generation {
            return None;
        }
        cell.entry.as_mut()
    }
}
