//! Frame table, free frame list, and the clock evictor
//!
//! The frame table is an arena indexed by physical frame number. A slot
//! names its occupant by `(pid, vpn)` only; the occupant's translation
//! entries are owned by the process and reached through the registry of
//! weak page-table handles kept alongside the table.
//!
//! Everything here is mutated under the single frame-table lock held by
//! [`super::vm::Vm`].

use super::process::Pid;
use super::translation::PageTable;
use slab::Slab;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Non-owning reference to the page occupying a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupant {
    pub pid: Pid,
    pub vpn: usize,
}

/// One physical frame's bookkeeping
#[derive(Debug, Clone, Default)]
pub struct FrameEntry {
    pub occupant: Option<Occupant>,
    /// Active pins; the frame is never a victim while non-zero
    pins: u32,
}

impl FrameEntry {
    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn pins(&self) -> u32 {
        self.pins
    }
}

/// Inspection copy of a frame table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame: usize,
    pub occupant: Option<Occupant>,
    pub pinned: bool,
}

/// Frames with no occupant
#[derive(Debug, Default)]
pub struct FreeList {
    frames: VecDeque<usize>,
}

impl FreeList {
    pub fn new(frames: impl IntoIterator<Item = usize>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn take(&mut self) -> Option<usize> {
        self.frames.pop_front()
    }

    pub fn give(&mut self, frame: usize) {
        debug_assert!(!self.frames.contains(&frame), "frame {} freed twice", frame);
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A frame chosen by the clock, with the page table of the page it held
#[derive(Debug)]
pub struct Victim {
    pub frame: usize,
    /// None when the previous owner has already gone away
    pub evicted: Option<(Occupant, Arc<PageTable>)>,
}

/// Global frame table state
#[derive(Debug)]
pub struct FrameTable {
    entries: Vec<FrameEntry>,
    free: FreeList,
    /// Frames with at least one pin
    pinned_count: usize,
    /// Clock hand; never reset
    cursor: usize,
    spaces: Slab<Weak<PageTable>>,
}

impl FrameTable {
    /// A table whose frames all start on the free list
    pub fn new(num_frames: usize) -> Self {
        Self {
            entries: vec![FrameEntry::default(); num_frames],
            free: FreeList::new(0..num_frames),
            pinned_count: 0,
            cursor: 0,
            spaces: Slab::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, frame: usize) -> &FrameEntry {
        &self.entries[frame]
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned_count
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// No frame can be obtained until something is unpinned or freed
    pub fn exhausted(&self) -> bool {
        self.free.is_empty() && self.pinned_count == self.entries.len()
    }

    /// Register an address space, allocating its pid
    pub fn register(&mut self, table: &Arc<PageTable>) -> Pid {
        Pid(self.spaces.insert(Arc::downgrade(table)) as u32)
    }

    pub fn unregister(&mut self, pid: Pid) {
        self.spaces.try_remove(pid.0 as usize);
    }

    pub fn is_registered(&self, pid: Pid) -> bool {
        self.spaces.contains(pid.0 as usize)
    }

    fn space(&self, pid: Pid) -> Option<Arc<PageTable>> {
        self.spaces.get(pid.0 as usize).and_then(Weak::upgrade)
    }

    pub fn take_free(&mut self) -> Option<usize> {
        self.free.take()
    }

    /// Clear a frame's slot and put it back on the free list
    pub fn release(&mut self, frame: usize) {
        let entry = &mut self.entries[frame];
        if entry.pins > 0 {
            entry.pins = 0;
            self.pinned_count -= 1;
        }
        entry.occupant = None;
        self.free.give(frame);
    }

    /// Record a new occupant for a frame the caller holds pinned
    pub fn assign(&mut self, frame: usize, occupant: Occupant) {
        let entry = &mut self.entries[frame];
        debug_assert!(entry.is_pinned(), "assigning unpinned frame {}", frame);
        entry.occupant = Some(occupant);
    }

    pub fn pin(&mut self, frame: usize) {
        let entry = &mut self.entries[frame];
        entry.pins += 1;
        if entry.pins == 1 {
            self.pinned_count += 1;
        }
    }

    /// Drop one pin; true when the frame became evictable
    pub fn unpin(&mut self, frame: usize) -> bool {
        let entry = &mut self.entries[frame];
        debug_assert!(entry.pins > 0, "unpinning unpinned frame {}", frame);
        if entry.pins == 0 {
            return false;
        }
        entry.pins -= 1;
        if entry.pins == 0 {
            self.pinned_count -= 1;
            true
        } else {
            false
        }
    }

    /// Run the clock until an unpinned frame whose page was not used since
    /// the hand last passed turns up.
    ///
    /// The owner's `used` bit is the reference bit. It is cleared when the
    /// frame is spared. Pinned frames are skipped without aging. The hand is left one past the
    /// victim. The slot keeps naming the old occupant until the caller
    /// assigns the frame; telling the owner's page table is also up to the
    /// caller.
    ///
    /// # Panics
    ///
    /// If every frame is pinned; callers wait for `!exhausted()` first.
    pub fn select_victim(&mut self) -> Victim {
        let n = self.entries.len();
        assert!(
            self.pinned_count < n,
            "clock invoked with all {} frames pinned",
            n
        );

        loop {
            let idx = self.cursor;
            self.cursor = (self.cursor + 1) % n;

            if self.entries[idx].is_pinned() {
                continue;
            }

            let occupant = self.entries[idx].occupant;
            let owner = occupant.and_then(|occ| self.space(occ.pid).map(|table| (occ, table)));

            let Some((occ, table)) = owner else {
                // Orphaned frame: its owner dropped without unloading.
                log::trace!("clock: frame {} has no live owner", idx);
                self.entries[idx].occupant = None;
                return Victim {
                    frame: idx,
                    evicted: None,
                };
            };

            if table.take_used(occ.vpn) {
                log::trace!("clock: second chance for frame {} ({} vpn {})", idx, occ.pid, occ.vpn);
                continue;
            }

            return Victim {
                frame: idx,
                evicted: Some((occ, table)),
            };
        }
    }

    pub fn snapshot(&self) -> Vec<FrameInfo> {
        self.entries
            .iter()
            .enumerate()
            .map(|(frame, e)| FrameInfo {
                frame,
                occupant: e.occupant,
                pinned: e.is_pinned(),
            })
            .collect()
    }
}
