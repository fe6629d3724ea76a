//! Process address spaces
//!
//! A process sees memory through the [`AddressSpace`] capability. Two
//! implementations share the same page-walking accessors:
//!
//! - [`PagedProcess`] brings pages in on demand and may lose them to the
//!   clock at any time it does not hold them pinned.
//! - [`EagerProcess`] loads every page up front and keeps its frames pinned
//!   until it unloads, so a fault never happens.
//!
//! Layout of a loaded program, in pages:
//!
//! ```text
//! | image sections ... | stack (stack_pages) | argv page |
//! 0                                         initial_sp
//! ```

use super::error::{Result, VmError};
use super::loader::ProgramImage;
use super::translation::PageTable;
use super::vm::{FaultOutcome, Vm};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Where things live in a loaded program's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub image_pages: usize,
    pub stack_pages: usize,
    /// Image, stack, and one argument page
    pub num_pages: usize,
    /// Stack pointer at entry: the top of the stack
    pub initial_sp: usize,
    pub entry_point: usize,
    pub argc: usize,
    /// Address of the argument pointer array
    pub argv: usize,
}

impl Layout {
    /// Size the address space, rejecting arguments that overflow a page
    pub fn plan(
        image: &ProgramImage,
        stack_pages: usize,
        args: &[&str],
        page_size: usize,
    ) -> Result<Self> {
        // 4-byte pointer, then the string and its NUL
        let size: usize = args.iter().map(|a| 4 + a.len() + 1).sum();
        if size > page_size {
            return Err(VmError::ArgumentsTooLong {
                size,
                limit: page_size,
            });
        }

        let image_pages = image.num_pages();
        let num_pages = image_pages + stack_pages + 1;
        Ok(Self {
            image_pages,
            stack_pages,
            num_pages,
            initial_sp: (image_pages + stack_pages) * page_size,
            entry_point: image.entry_point(),
            argc: args.len(),
            argv: (num_pages - 1) * page_size,
        })
    }
}

/// Memory access capability of a process
pub trait AddressSpace: Send + Sync {
    fn pid(&self) -> Pid;

    fn layout(&self) -> &Layout;

    fn num_pages(&self) -> usize {
        self.layout().num_pages
    }

    fn page_size(&self) -> usize;

    /// Physical address of `vaddr` if its page is resident
    fn translate(&self, vaddr: usize) -> Option<usize>;

    /// Make the page holding `vaddr` resident
    fn handle_fault(&self, vaddr: usize) -> Result<FaultOutcome>;

    /// Copy from virtual memory into `buf`; returns bytes copied, which is
    /// short if the range runs off the end of the address space
    fn read_memory(&self, vaddr: usize, buf: &mut [u8]) -> Result<usize>;

    /// Copy `buf` into virtual memory; returns bytes copied, which is short
    /// at the end of the address space or at the first read-only page
    fn write_memory(&self, vaddr: usize, buf: &[u8]) -> Result<usize>;

    /// Read a NUL-terminated string of at most `max_len` bytes.
    /// `None` if no terminator turns up in range.
    fn read_string(&self, vaddr: usize, max_len: usize) -> Result<Option<String>> {
        // Never buffer more than the rest of the address space holds.
        let remaining = self
            .num_pages()
            .saturating_mul(self.page_size())
            .saturating_sub(vaddr);
        let mut bytes = vec![0u8; max_len.min(remaining).saturating_add(1)];
        let read = self.read_memory(vaddr, &mut bytes)?;
        Ok(bytes[..read]
            .iter()
            .position(|&b| b == 0)
            .map(|len| String::from_utf8_lossy(&bytes[..len]).into_owned()))
    }

    /// Give back every frame and swap slot. Later accesses fail with
    /// [`VmError::UnknownProcess`].
    fn unload(&self);
}

/// State common to both process kinds
#[derive(Debug)]
struct Space {
    pid: Pid,
    vm: Arc<Vm>,
    table: Arc<PageTable>,
    image: Arc<ProgramImage>,
    layout: Layout,
    /// Held across a fault, which serializes faults within this process;
    /// false once unloaded
    loaded: Mutex<bool>,
    /// Pins the process itself keeps on each resident frame
    wired: u32,
}

impl Space {
    fn new(
        vm: Arc<Vm>,
        image: Arc<ProgramImage>,
        args: &[&str],
        wired: u32,
    ) -> Result<Self> {
        if image.page_size() != vm.page_size() {
            return Err(VmError::InvalidConfig(format!(
                "image built for {}-byte pages, machine uses {}",
                image.page_size(),
                vm.page_size()
            )));
        }
        let layout = Layout::plan(&image, vm.config().stack_pages, args, vm.page_size())?;
        let table = Arc::new(PageTable::new(layout.num_pages, |vpn| {
            image.is_read_only(vpn)
        }));
        let pid = vm.register(&table);
        Ok(Self {
            pid,
            vm,
            table,
            image,
            layout,
            loaded: Mutex::new(true),
            wired,
        })
    }

    fn loaded(&self) -> MutexGuard<'_, bool> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_loaded(&self) -> Result<()> {
        if *self.loaded() {
            Ok(())
        } else {
            Err(VmError::UnknownProcess)
        }
    }

    fn fault(&self, vaddr: usize) -> Result<FaultOutcome> {
        let loaded = self.loaded();
        if !*loaded {
            return Err(VmError::UnknownProcess);
        }
        let outcome = self
            .vm
            .handle_fault(self.pid, &self.table, &self.image, vaddr);
        drop(loaded);
        outcome
    }

    /// Walk `len` bytes from `vaddr` a page at a time. Each page is faulted
    /// in if needed, pinned, handed to `copy` with the frame, the offset in
    /// the page and the buffer range it covers, marked used (and dirty for
    /// writes), then unpinned.
    fn transfer(
        &self,
        vaddr: usize,
        len: usize,
        write: bool,
        mut fault: impl FnMut(usize) -> Result<()>,
        mut copy: impl FnMut(usize, usize, Range<usize>) -> usize,
    ) -> Result<usize> {
        self.check_loaded()?;
        let page_size = self.vm.page_size();
        let num_pages = self.layout.num_pages;
        let mut done = 0;

        while done < len {
            let Some(addr) = vaddr.checked_add(done) else {
                break;
            };
            let vpn = addr / page_size;
            let offset = addr % page_size;
            if vpn >= num_pages {
                break;
            }
            if write && self.table.entry(vpn).is_some_and(|e| e.read_only) {
                break;
            }

            // The page can be evicted again between the fault and the pin.
            let frame = loop {
                if let Some(frame) = self.vm.pin_resident(&self.table, vpn) {
                    break frame;
                }
                fault(vpn * page_size)?;
            };

            let chunk = (page_size - offset).min(len - done);
            let copied = copy(frame, offset, done..done + chunk);
            self.table.touch(vpn, frame, write);
            self.vm.unpin(frame);
            done += copied;
        }
        Ok(done)
    }

    fn read(
        &self,
        vaddr: usize,
        buf: &mut [u8],
        fault: impl FnMut(usize) -> Result<()>,
    ) -> Result<usize> {
        let memory = self.vm.memory();
        self.transfer(vaddr, buf.len(), false, fault, |frame, offset, range| {
            memory.read(frame, offset, &mut buf[range])
        })
    }

    fn write(
        &self,
        vaddr: usize,
        buf: &[u8],
        fault: impl FnMut(usize) -> Result<()>,
    ) -> Result<usize> {
        let memory = self.vm.memory();
        self.transfer(vaddr, buf.len(), true, fault, |frame, offset, range| {
            memory.write(frame, offset, &buf[range])
        })
    }

    fn unload(&self) {
        let mut loaded = self.loaded();
        if !*loaded {
            return;
        }
        *loaded = false;
        self.vm.release_space(self.pid, &self.table, self.wired);
    }
}

/// Lay the argument strings out in the last page: a table of 4-byte
/// little-endian pointers followed by the NUL-terminated strings.
fn store_args(space: &dyn AddressSpace, args: &[&str]) -> Result<()> {
    let layout = space.layout();
    let mut entry_offset = layout.argv;
    let mut string_offset = entry_offset + args.len() * 4;

    let put = |vaddr: usize, bytes: &[u8]| -> Result<()> {
        let written = space.write_memory(vaddr, bytes)?;
        if written != bytes.len() {
            return Err(VmError::LoadFailed {
                vpn: vaddr / space.page_size(),
                message: format!("short argument write: {} of {}", written, bytes.len()),
            });
        }
        Ok(())
    };

    for arg in args {
        // Pointers are 32 bits wide.
        let ptr = u32::try_from(string_offset).map_err(|_| VmError::LoadFailed {
            vpn: string_offset / space.page_size(),
            message: format!("argument at {:#x} is beyond 32-bit reach", string_offset),
        })?;
        put(entry_offset, &ptr.to_le_bytes())?;
        entry_offset += 4;
        put(string_offset, arg.as_bytes())?;
        string_offset += arg.len();
        put(string_offset, &[0])?;
        string_offset += 1;
    }
    Ok(())
}

/// A demand-paged process
#[derive(Debug)]
pub struct PagedProcess {
    space: Space,
}

impl PagedProcess {
    /// Set up the address space and write the arguments. No section page
    /// is read until something touches it.
    pub fn load(vm: Arc<Vm>, image: Arc<ProgramImage>, args: &[&str]) -> Result<Self> {
        let process = Self {
            space: Space::new(vm, image, args, 0)?,
        };
        store_args(&process, args)?;
        log::debug!(
            "{} loaded: {} pages, argc {}",
            process.space.pid,
            process.space.layout.num_pages,
            args.len()
        );
        Ok(process)
    }

    pub fn page_table(&self) -> &PageTable {
        &self.space.table
    }
}

impl AddressSpace for PagedProcess {
    fn pid(&self) -> Pid {
        self.space.pid
    }

    fn layout(&self) -> &Layout {
        &self.space.layout
    }

    fn page_size(&self) -> usize {
        self.space.vm.page_size()
    }

    fn translate(&self, vaddr: usize) -> Option<usize> {
        self.space.vm.translate(&self.space.table, vaddr)
    }

    fn handle_fault(&self, vaddr: usize) -> Result<FaultOutcome> {
        self.space.fault(vaddr)
    }

    fn read_memory(&self, vaddr: usize, buf: &mut [u8]) -> Result<usize> {
        self.space
            .read(vaddr, buf, |addr| self.space.fault(addr).map(|_| ()))
    }

    fn write_memory(&self, vaddr: usize, buf: &[u8]) -> Result<usize> {
        self.space
            .write(vaddr, buf, |addr| self.space.fault(addr).map(|_| ()))
    }

    fn unload(&self) {
        self.space.unload();
    }
}

impl Drop for PagedProcess {
    fn drop(&mut self) {
        self.space.unload();
    }
}

/// A process whose whole image is resident for its lifetime
#[derive(Debug)]
pub struct EagerProcess {
    space: Space,
}

impl EagerProcess {
    /// Take a frame for every page, fill them, and write the arguments.
    /// Fails with [`VmError::OutOfMemory`] if the free list is too short.
    pub fn load(vm: Arc<Vm>, image: Arc<ProgramImage>, args: &[&str]) -> Result<Self> {
        let process = Self {
            space: Space::new(vm, image, args, 1)?,
        };
        let space = &process.space;
        space.vm.load_wired(space.pid, &space.table, &space.image)?;
        store_args(&process, args)?;
        Ok(process)
    }

    pub fn page_table(&self) -> &PageTable {
        &self.space.table
    }

    /// Nothing is ever missing while loaded
    fn no_fault(_vaddr: usize) -> Result<()> {
        Err(VmError::UnknownProcess)
    }
}

impl AddressSpace for EagerProcess {
    fn pid(&self) -> Pid {
        self.space.pid
    }

    fn layout(&self) -> &Layout {
        &self.space.layout
    }

    fn page_size(&self) -> usize {
        self.space.vm.page_size()
    }

    fn translate(&self, vaddr: usize) -> Option<usize> {
        self.space.vm.translate(&self.space.table, vaddr)
    }

    /// Pages were loaded up front; in-range faults find them resident
    fn handle_fault(&self, vaddr: usize) -> Result<FaultOutcome> {
        self.space.check_loaded()?;
        if vaddr / self.page_size() >= self.space.layout.num_pages {
            return Ok(FaultOutcome::Ignored);
        }
        match self.translate(vaddr) {
            Some(paddr) => Ok(FaultOutcome::AlreadyResident {
                frame: paddr / self.page_size(),
            }),
            None => Err(VmError::UnknownProcess),
        }
    }

    fn read_memory(&self, vaddr: usize, buf: &mut [u8]) -> Result<usize> {
        self.space.read(vaddr, buf, Self::no_fault)
    }

    fn write_memory(&self, vaddr: usize, buf: &[u8]) -> Result<usize> {
        self.space.write(vaddr, buf, Self::no_fault)
    }

    fn unload(&self) {
        self.space.unload();
    }
}

impl Drop for EagerProcess {
    fn drop(&mut self) {
        self.space.unload();
    }
}
