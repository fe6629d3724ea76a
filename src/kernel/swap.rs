//! Swap
//!
//! Slot allocation over a page-granular backing store. Freed slots are
//! reused in FIFO order before the store is extended; slot bookkeeping has
//! its own lock, separate from the frame table.

use super::config::SwapBacking;
use super::error::{Result, SwapOp, VmError};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A byte-addressed backing store
pub trait SwapStore: Send {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
}

/// Swap held in host memory
#[derive(Debug, Default)]
pub struct MemorySwap {
    data: Vec<u8>,
}

impl MemorySwap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl SwapStore for MemorySwap {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read {}..{} past end {}", start, end, self.data.len()),
            ));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Swap held in a host file
#[derive(Debug)]
pub struct FileSwap {
    file: File,
}

impl FileSwap {
    /// Create or truncate the swap file
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl SwapStore for FileSwap {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }
}

#[derive(Debug, Default)]
struct Slots {
    free: VecDeque<usize>,
    next: usize,
}

/// Allocates swap slots and moves pages in and out of them
pub struct SwapManager {
    slots: Mutex<Slots>,
    store: Mutex<Box<dyn SwapStore>>,
    page_size: usize,
}

impl SwapManager {
    pub fn new(store: Box<dyn SwapStore>, page_size: usize) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            store: Mutex::new(store),
            page_size,
        }
    }

    /// Open the configured backing store
    pub fn from_backing(backing: &SwapBacking, page_size: usize) -> Result<Self> {
        let store: Box<dyn SwapStore> = match backing {
            SwapBacking::Memory => Box::new(MemorySwap::new()),
            SwapBacking::File { path } => {
                Box::new(FileSwap::open(path).map_err(|e| {
                    VmError::InvalidConfig(format!("swap file {}: {}", path.display(), e))
                })?)
            }
        };
        Ok(Self::new(store, page_size))
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store(&self) -> MutexGuard<'_, Box<dyn SwapStore>> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reuse the oldest freed slot, else extend the store by one slot
    pub fn allocate_slot(&self) -> usize {
        let mut slots = self.slots();
        match slots.free.pop_front() {
            Some(slot) => slot,
            None => {
                let slot = slots.next;
                slots.next += 1;
                slot
            }
        }
    }

    /// Return a slot to the reuse pool
    pub fn free_slot(&self, slot: usize) {
        let mut slots = self.slots();
        debug_assert!(slot < slots.next, "freeing unallocated slot {}", slot);
        debug_assert!(!slots.free.contains(&slot), "double free of slot {}", slot);
        slots.free.push_back(slot);
    }

    /// Number of slots ever handed out
    pub fn high_water(&self) -> usize {
        self.slots().next
    }

    pub fn slots_in_use(&self) -> usize {
        let slots = self.slots();
        slots.next - slots.free.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn write(&self, slot: usize, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), self.page_size);
        let offset = (slot * self.page_size) as u64;
        self.store().write(offset, page).map_err(|e| VmError::SwapIo {
            slot,
            op: SwapOp::Write,
            message: e.to_string(),
        })
    }

    pub fn read(&self, slot: usize, page: &mut [u8]) -> Result<()> {
        debug_assert_eq!(page.len(), self.page_size);
        let offset = (slot * self.page_size) as u64;
        self.store().read(offset, page).map_err(|e| VmError::SwapIo {
            slot,
            op: SwapOp::Read,
            message: e.to_string(),
        })
    }
}

impl std::fmt::Debug for SwapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots();
        f.debug_struct("SwapManager")
            .field("page_size", &self.page_size)
            .field("next", &slots.next)
            .field("free", &slots.free)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SwapManager {
        SwapManager::new(Box::new(MemorySwap::new()), 16)
    }

    #[test]
    fn test_slots_are_sequential() {
        let swap = manager();
        assert_eq!(swap.allocate_slot(), 0);
        assert_eq!(swap.allocate_slot(), 1);
        assert_eq!(swap.allocate_slot(), 2);
        assert_eq!(swap.high_water(), 3);
        assert_eq!(swap.slots_in_use(), 3);
    }

    #[test]
    fn test_freed_slot_reused_once() {
        let swap = manager();
        let a = swap.allocate_slot();
        let _b = swap.allocate_slot();
        swap.free_slot(a);

        assert_eq!(swap.allocate_slot(), a);
        assert_eq!(swap.allocate_slot(), 2);
        assert_eq!(swap.high_water(), 3);
    }

    #[test]
    fn test_reuse_is_fifo() {
        let swap = manager();
        for _ in 0..4 {
            swap.allocate_slot();
        }
        swap.free_slot(2);
        swap.free_slot(0);
        assert_eq!(swap.allocate_slot(), 2);
        assert_eq!(swap.allocate_slot(), 0);
        assert_eq!(swap.slots_in_use(), 4);
    }

    #[test]
    fn test_write_then_read() {
        let swap = manager();
        let slot = swap.allocate_slot();
        let slot2 = swap.allocate_slot();
        swap.write(slot2, &[7u8; 16]).unwrap();
        swap.write(slot, &[3u8; 16]).unwrap();

        let mut page = [0u8; 16];
        swap.read(slot2, &mut page).unwrap();
        assert_eq!(page, [7u8; 16]);
        swap.read(slot, &mut page).unwrap();
        assert_eq!(page, [3u8; 16]);
    }

    #[test]
    fn test_read_unwritten_slot_fails() {
        let swap = manager();
        let slot = swap.allocate_slot();
        let mut page = [0u8; 16];
        let err = swap.read(slot, &mut page).unwrap_err();
        assert!(matches!(
            err,
            VmError::SwapIo {
                op: SwapOp::Read,
                ..
            }
        ));
    }

    #[test]
    fn test_file_swap() {
        let path = std::env::temp_dir().join(format!("vmsim-swap-test-{}", std::process::id()));
        let mut store = FileSwap::open(&path).unwrap();
        store.write(32, b"0123456789abcdef").unwrap();
        let mut buf = [0u8; 16];
        store.read(32, &mut buf).unwrap();
        assert_eq!(&buf, b"0123456789abcdef");
        assert!(store.read(4096, &mut buf).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
