//! Per-process translation entries
//!
//! Each process owns one entry per virtual page. Where a non-resident page
//! should be restored from is recorded explicitly in [`PageState`] rather
//! than by reusing the virtual page number field.

use std::sync::{Mutex, MutexGuard};

/// Where a virtual page's content currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Never faulted in; content comes from the image or zero-fill
    NeverLoaded,
    /// Resident in the given physical frame
    Resident { frame: usize },
    /// Evicted while dirty; content lives in the given swap slot
    Swapped { slot: usize },
    /// Evicted while clean; content is reproducible from the image or zero-fill
    Discarded,
}

/// Virtual-to-physical mapping for one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationEntry {
    /// Virtual page number this entry describes
    pub vpn: usize,
    pub state: PageState,
    /// Content must never be written (code/rodata)
    pub read_only: bool,
    /// Accessed since the clock last cleared it
    pub used: bool,
    /// Content differs from what the image or zero-fill would produce
    pub dirty: bool,
}

impl TranslationEntry {
    pub fn new(vpn: usize, read_only: bool) -> Self {
        Self {
            vpn,
            state: PageState::NeverLoaded,
            read_only,
            used: false,
            dirty: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.state, PageState::Resident { .. })
    }

    /// Physical frame, if resident
    pub fn ppn(&self) -> Option<usize> {
        match self.state {
            PageState::Resident { frame } => Some(frame),
            _ => None,
        }
    }
}

/// A process's translation entries, shared with the evictor
///
/// Lock order: the frame table lock is always taken before this one.
#[derive(Debug)]
pub struct PageTable {
    entries: Mutex<Vec<TranslationEntry>>,
}

impl PageTable {
    /// Build a table of `num_pages` never-loaded entries
    pub fn new(num_pages: usize, read_only: impl Fn(usize) -> bool) -> Self {
        let entries = (0..num_pages)
            .map(|vpn| TranslationEntry::new(vpn, read_only(vpn)))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Lock the whole table
    pub fn lock(&self) -> MutexGuard<'_, Vec<TranslationEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of one entry
    pub fn entry(&self, vpn: usize) -> Option<TranslationEntry> {
        self.lock().get(vpn).cloned()
    }

    pub fn is_dirty(&self, vpn: usize) -> bool {
        self.lock().get(vpn).is_some_and(|e| e.dirty)
    }

    /// Read and clear the used bit
    pub fn take_used(&self, vpn: usize) -> bool {
        match self.lock().get_mut(vpn) {
            Some(entry) => std::mem::replace(&mut entry.used, false),
            None => false,
        }
    }

    /// Evictor notification: the page was written to `slot` and is gone
    pub fn mark_swapped(&self, vpn: usize, slot: usize) {
        if let Some(entry) = self.lock().get_mut(vpn) {
            entry.state = PageState::Swapped { slot };
        }
    }

    /// Evictor notification: the page was clean and is gone
    pub fn mark_evicted(&self, vpn: usize) {
        if let Some(entry) = self.lock().get_mut(vpn) {
            entry.state = PageState::Discarded;
            entry.used = false;
        }
    }

    /// Install a freshly restored page
    pub fn mark_resident(&self, vpn: usize, frame: usize) {
        if let Some(entry) = self.lock().get_mut(vpn) {
            entry.vpn = vpn;
            entry.state = PageState::Resident { frame };
        }
    }

    /// Record an access, returning false if the page is not resident
    /// in `frame` anymore
    pub fn touch(&self, vpn: usize, frame: usize, write: bool) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(vpn) else {
            return false;
        };
        if entry.ppn() != Some(frame) {
            return false;
        }
        entry.used = true;
        if write {
            entry.dirty = true;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table() {
        let table = PageTable::new(4, |vpn| vpn < 2);
        assert_eq!(table.len(), 4);
        let e0 = table.entry(0).unwrap();
        assert!(e0.read_only);
        assert_eq!(e0.state, PageState::NeverLoaded);
        assert!(!e0.is_valid());
        assert!(!table.entry(3).unwrap().read_only);
        assert!(table.entry(4).is_none());
    }

    #[test]
    fn test_resident_and_evicted() {
        let table = PageTable::new(2, |_| false);
        table.mark_resident(1, 7);
        assert_eq!(table.entry(1).unwrap().ppn(), Some(7));

        table.mark_evicted(1);
        let entry = table.entry(1).unwrap();
        assert!(!entry.is_valid());
        assert_eq!(entry.state, PageState::Discarded);
    }

    #[test]
    fn test_swapped_slot_kept_separately_from_vpn() {
        let table = PageTable::new(3, |_| false);
        table.mark_resident(2, 0);
        table.mark_swapped(2, 9);
        let entry = table.entry(2).unwrap();
        assert_eq!(entry.vpn, 2);
        assert_eq!(entry.state, PageState::Swapped { slot: 9 });
    }

    #[test]
    fn test_touch_sets_bits() {
        let table = PageTable::new(1, |_| false);
        table.mark_resident(0, 3);

        assert!(table.touch(0, 3, false));
        assert!(!table.is_dirty(0));
        assert!(table.take_used(0));
        assert!(!table.take_used(0));

        assert!(table.touch(0, 3, true));
        assert!(table.is_dirty(0));
    }

    #[test]
    fn test_touch_stale_frame() {
        let table = PageTable::new(1, |_| false);
        table.mark_resident(0, 3);
        assert!(!table.touch(0, 4, true));
        assert!(!table.is_dirty(0));
    }
}
