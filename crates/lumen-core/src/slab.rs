// src/slab.rs
use crate::timer::TimerId;
use std::os::fd::RawFd;

/// Event-loop bookkeeping for one connection slot. The connection state
/// itself lives in [`crate::context::Slot`]; this half is never shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMeta {
    /// Socket while active; index of the next free slot (or -1) while free.
    pub fd: RawFd,
    pub timer: Option<TimerId>,
    pub active: bool,
}

impl SlotMeta {
    const fn empty() -> Self {
        Self {
            fd: -1,
            timer: None,
            active: false,
        }
    }
}

pub struct ConnectionSlab {
    entries: Box<[SlotMeta]>,
    head_free: i32,
    active_count: usize,
}

impl ConnectionSlab {
    /// Allocate every slot up front.
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let mut meta = SlotMeta::empty();
            // The fd field works as the `next` index pointer.
            meta.fd = if i + 1 == capacity { -1 } else { (i + 1) as i32 };
            entries.push(meta);
        }

        Self {
            entries: entries.into_boxed_slice(),
            head_free: if capacity == 0 { -1 } else { 0 },
            active_count: 0,
        }
    }

    /// O(1): claim a free slot for `fd`. `None` when every slot is in use.
    pub fn allocate(&mut self, fd: RawFd) -> Option<usize> {
        if self.head_free == -1 {
            return None;
        }

        let idx = self.head_free as usize;
        let meta = &mut self.entries[idx];
        self.head_free = meta.fd;

        meta.fd = fd;
        meta.timer = None;
        meta.active = true;

        self.active_count += 1;
        Some(idx)
    }

    /// O(1): return a slot to the free list. Freeing an inactive slot is a
    /// no-op.
    pub fn free(&mut self, index: usize) {
        let Some(meta) = self.entries.get_mut(index) else {
            return;
        };
        if !meta.active {
            return;
        }

        meta.fd = self.head_free;
        meta.timer = None;
        meta.active = false;

        self.head_free = index as i32;
        self.active_count -= 1;
    }

    pub fn get(&self, index: usize) -> Option<&SlotMeta> {
        self.entries.get(index).filter(|m| m.active)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SlotMeta> {
        self.entries.get_mut(index).filter(|m| m.active)
    }

    /// Indices of every active slot.
    pub fn active(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, m)| m.active)
            .map(|(i, _)| i)
    }

    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}
