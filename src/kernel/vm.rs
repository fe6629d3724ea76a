//! Demand paging core
//!
//! Owns physical memory, the frame table, swap, and the tracer, and
//! implements the page fault handler and pinning on top of them.
//!
//! Locking:
//! - One frame-table lock covers the frame table, free list, pin counts,
//!   the clock hand and the address-space registry.
//! - Swap slot bookkeeping and the swap store have their own locks.
//! - Order is frame table, then page table, then frame bytes, then swap.
//! - A fault holds the frame-table lock only while choosing a frame and
//!   while installing it; content is restored with the frame pinned and
//!   the lock released.

use super::config::VmConfig;
use super::error::{Result, VmError};
use super::frame::{FrameInfo, FrameTable, Occupant};
use super::loader::ProgramImage;
use super::memory::PhysicalMemory;
use super::process::Pid;
use super::swap::{SwapManager, SwapStore};
use super::trace::{PagingStats, TraceCategory, TraceEvent, Tracer};
use super::translation::{PageState, PageTable, TranslationEntry};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Where a faulted page's content came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Section,
    ZeroFill,
    Swap,
}

impl std::fmt::Display for PageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageSource::Section => write!(f, "section"),
            PageSource::ZeroFill => write!(f, "zero-fill"),
            PageSource::Swap => write!(f, "swap"),
        }
    }
}

/// What a call to the fault handler did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The address lies outside the address space; nothing happened
    Ignored,
    /// Someone else brought the page in first
    AlreadyResident { frame: usize },
    Loaded { frame: usize, source: PageSource },
}

/// The VM subsystem shared by every process
pub struct Vm {
    config: VmConfig,
    memory: PhysicalMemory,
    frames: Mutex<FrameTable>,
    /// Signalled whenever a pin is dropped or a frame is freed
    frame_released: Condvar,
    swap: SwapManager,
    tracer: Mutex<Tracer>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Result<Self> {
        config.validate()?;
        let swap = SwapManager::from_backing(&config.swap, config.page_size)?;
        Ok(Self::build(config, swap))
    }

    /// Use a caller-supplied backing store instead of the configured one
    pub fn with_swap_store(config: VmConfig, store: Box<dyn SwapStore>) -> Result<Self> {
        config.validate()?;
        let swap = SwapManager::new(store, config.page_size);
        Ok(Self::build(config, swap))
    }

    fn build(config: VmConfig, swap: SwapManager) -> Self {
        let mut tracer = Tracer::new();
        if config.trace {
            tracer.enable();
        }
        Self {
            memory: PhysicalMemory::new(config.num_frames, config.page_size),
            frames: Mutex::new(FrameTable::new(config.num_frames)),
            frame_released: Condvar::new(),
            swap,
            tracer: Mutex::new(tracer),
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn swap(&self) -> &SwapManager {
        &self.swap
    }

    fn frames(&self) -> MutexGuard<'_, FrameTable> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tracer(&self) -> MutexGuard<'_, Tracer> {
        self.tracer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> PagingStats {
        self.tracer().stats
    }

    fn record(&self, update: impl FnOnce(&mut PagingStats), event: TraceEvent) {
        let mut tracer = self.tracer();
        update(&mut tracer.stats);
        tracer.trace(event);
    }

    pub fn free_frames(&self) -> usize {
        self.frames().free_list().len()
    }

    pub fn pinned_frames(&self) -> usize {
        self.frames().pinned_count()
    }

    pub fn frame_snapshot(&self) -> Vec<FrameInfo> {
        self.frames().snapshot()
    }

    /// Add an address space to the registry the clock consults
    pub fn register(&self, table: &Arc<PageTable>) -> Pid {
        let pid = self.frames().register(table);
        self.record(
            |s| s.processes_loaded += 1,
            TraceEvent::instant(TraceCategory::Process, "load")
                .with_pid(pid)
                .with_detail(format!("{} pages", table.len())),
        );
        pid
    }

    /// Bring the page holding `vaddr` into a frame.
    ///
    /// The caller serializes faults per address space. Out-of-range
    /// addresses are dropped without allocating anything.
    pub fn handle_fault(
        &self,
        pid: Pid,
        table: &PageTable,
        image: &ProgramImage,
        vaddr: usize,
    ) -> Result<FaultOutcome> {
        let vpn = vaddr / self.page_size();
        let Some(entry) = table.entry(vpn) else {
            log::warn!("{} fault at {:#x} outside its {} pages; ignored", pid, vaddr, table.len());
            self.record(
                |s| s.ignored_faults += 1,
                TraceEvent::instant(TraceCategory::Fault, "ignored")
                    .with_pid(pid)
                    .with_detail(format!("vaddr {:#x}", vaddr)),
            );
            return Ok(FaultOutcome::Ignored);
        };
        if let Some(frame) = entry.ppn() {
            return Ok(FaultOutcome::AlreadyResident { frame });
        }

        let ft = self.frames();
        let (mut ft, frame) = self.obtain_frame(ft)?;
        ft.pin(frame);
        ft.assign(frame, Occupant { pid, vpn });
        drop(ft);

        let restored = self.restore(&entry, image, frame);

        let mut ft = self.frames();
        match restored {
            Ok(source) => {
                table.mark_resident(vpn, frame);
                ft.unpin(frame);
                drop(ft);
                self.frame_released.notify_all();

                log::debug!("{} fault vpn {} -> frame {} ({})", pid, vpn, frame, source);
                self.record(
                    |s| {
                        s.faults += 1;
                        match source {
                            PageSource::Section => s.section_loads += 1,
                            PageSource::ZeroFill => s.zero_fills += 1,
                            PageSource::Swap => s.swap_ins += 1,
                        }
                    },
                    TraceEvent::instant(TraceCategory::Fault, source.to_string())
                        .with_pid(pid)
                        .with_detail(format!("vpn {} -> frame {}", vpn, frame)),
                );
                Ok(FaultOutcome::Loaded { frame, source })
            }
            Err(e) => {
                ft.release(frame);
                drop(ft);
                self.frame_released.notify_all();
                log::warn!("{} fault vpn {} failed: {}", pid, vpn, e);
                Err(e)
            }
        }
    }

    /// Take a free frame, else evict one, else wait until a pin drops
    fn obtain_frame<'a>(
        &'a self,
        mut ft: MutexGuard<'a, FrameTable>,
    ) -> Result<(MutexGuard<'a, FrameTable>, usize)> {
        loop {
            if let Some(frame) = ft.take_free() {
                return Ok((ft, frame));
            }
            if !ft.exhausted() {
                let frame = self.evict(&mut ft)?;
                return Ok((ft, frame));
            }
            log::debug!("all {} frames pinned; waiting", ft.len());
            self.record(
                |s| s.waits += 1,
                TraceEvent::instant(TraceCategory::Pin, "wait"),
            );
            ft = self
                .frame_released
                .wait(ft)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Run the clock and push the victim's page out.
    ///
    /// Dirty pages are written to a fresh swap slot before the owner's
    /// entry is switched over, all under the frame-table lock, so the owner
    /// can never see a slot that has not been written yet.
    fn evict(&self, ft: &mut FrameTable) -> Result<usize> {
        let victim = ft.select_victim();
        let Some((occ, owner)) = victim.evicted else {
            return Ok(victim.frame);
        };

        let mut swapped = None;
        if owner.is_dirty(occ.vpn) {
            let slot = self.swap.allocate_slot();
            let written = self
                .memory
                .with_frame(victim.frame, |data| self.swap.write(slot, data));
            if let Err(e) = written {
                self.swap.free_slot(slot);
                log::warn!("swap-out of {} vpn {} failed: {}", occ.pid, occ.vpn, e);
                return Err(e);
            }
            owner.mark_swapped(occ.vpn, slot);
            swapped = Some(slot);
        } else {
            owner.mark_evicted(occ.vpn);
        }

        log::debug!(
            "evict frame {} ({} vpn {}){}",
            victim.frame,
            occ.pid,
            occ.vpn,
            swapped.map(|s| format!(" to slot {}", s)).unwrap_or_default()
        );
        let mut tracer = self.tracer();
        tracer.stats.evictions += 1;
        tracer.trace(
            TraceEvent::instant(TraceCategory::Evict, "evict")
                .with_pid(occ.pid)
                .with_detail(format!("frame {} vpn {}", victim.frame, occ.vpn)),
        );
        if let Some(slot) = swapped {
            tracer.stats.swap_outs += 1;
            tracer.trace(
                TraceEvent::instant(TraceCategory::Swap, "swap-out")
                    .with_pid(occ.pid)
                    .with_detail(format!("vpn {} -> slot {}", occ.vpn, slot)),
            );
        }
        Ok(victim.frame)
    }

    /// Fill a pinned frame with a page's content.
    ///
    /// Only a non-read-only page evicted while dirty comes back from swap;
    /// first faults, read-only pages and clean evictions reload from the
    /// image or zero-fill.
    fn restore(&self, entry: &TranslationEntry, image: &ProgramImage, frame: usize) -> Result<PageSource> {
        match (entry.state, entry.read_only) {
            (PageState::Swapped { slot }, false) => {
                self.memory
                    .with_frame(frame, |data| self.swap.read(slot, data))?;
                self.swap.free_slot(slot);
                Ok(PageSource::Swap)
            }
            _ => self.fill_from_image(image, entry.vpn, frame),
        }
    }

    fn fill_from_image(&self, image: &ProgramImage, vpn: usize, frame: usize) -> Result<PageSource> {
        let from_section = self
            .memory
            .with_frame(frame, |data| image.fill_page(vpn, data))?;
        Ok(if from_section {
            PageSource::Section
        } else {
            PageSource::ZeroFill
        })
    }

    /// Pin the frame holding `vpn` if the page is resident
    pub fn pin_resident(&self, table: &PageTable, vpn: usize) -> Option<usize> {
        let mut ft = self.frames();
        let frame = table.entry(vpn)?.ppn()?;
        ft.pin(frame);
        Some(frame)
    }

    pub fn unpin(&self, frame: usize) {
        self.frames().unpin(frame);
        self.frame_released.notify_all();
    }

    /// Physical address of `vaddr` if its page is resident right now
    pub fn translate(&self, table: &PageTable, vaddr: usize) -> Option<usize> {
        let page_size = self.page_size();
        let _ft = self.frames();
        let frame = table.entry(vaddr / page_size)?.ppn()?;
        Some(frame * page_size + vaddr % page_size)
    }

    /// Take `count` frames for a non-paging address space, pinned for its
    /// lifetime and filled from the image.
    pub fn load_wired(&self, pid: Pid, table: &PageTable, image: &ProgramImage) -> Result<()> {
        let count = table.len();
        let mut frames = Vec::with_capacity(count);
        {
            let mut ft = self.frames();
            for vpn in 0..count {
                let Some(frame) = ft.take_free() else {
                    for frame in frames {
                        ft.release(frame);
                    }
                    log::debug!("{} needs {} frames; insufficient physical memory", pid, count);
                    return Err(VmError::OutOfMemory);
                };
                ft.pin(frame);
                ft.assign(frame, Occupant { pid, vpn });
                frames.push(frame);
            }
        }

        for (vpn, &frame) in frames.iter().enumerate() {
            let filled = self.fill_from_image(image, vpn, frame);
            let mut ft = self.frames();
            match filled {
                Ok(source) => {
                    table.mark_resident(vpn, frame);
                    drop(ft);
                    self.record(
                        |s| match source {
                            PageSource::Section => s.section_loads += 1,
                            _ => s.zero_fills += 1,
                        },
                        TraceEvent::instant(TraceCategory::Fault, "preload")
                            .with_pid(pid)
                            .with_detail(format!("vpn {} -> frame {}", vpn, frame)),
                    );
                }
                Err(e) => {
                    for &frame in &frames[vpn..] {
                        ft.release(frame);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Return every frame and swap slot an address space holds and drop it
    /// from the registry.
    ///
    /// `wired` is the number of pins the address space itself keeps on each
    /// of its frames. Pins beyond that belong to accessors still copying;
    /// this waits for them to finish first.
    pub fn release_space(&self, pid: Pid, table: &PageTable, wired: u32) {
        let mut freed_frames = 0;
        let mut freed_slots = 0;
        {
            let mut ft = self.frames();
            while Self::in_use(&ft, pid, table, wired) {
                ft = self
                    .frame_released
                    .wait(ft)
                    .unwrap_or_else(|e| e.into_inner());
            }
            let mut entries = table.lock();
            for entry in entries.iter_mut() {
                match entry.state {
                    PageState::Resident { frame } => {
                        if ft.entry(frame).occupant == Some(Occupant { pid, vpn: entry.vpn }) {
                            ft.release(frame);
                            freed_frames += 1;
                        }
                    }
                    PageState::Swapped { slot } => {
                        self.swap.free_slot(slot);
                        freed_slots += 1;
                    }
                    PageState::NeverLoaded | PageState::Discarded => {}
                }
                entry.state = PageState::NeverLoaded;
                entry.used = false;
                entry.dirty = false;
            }
            drop(entries);
            ft.unregister(pid);
        }
        self.frame_released.notify_all();

        log::debug!("{} unloaded: {} frames, {} swap slots freed", pid, freed_frames, freed_slots);
        self.record(
            |s| s.processes_unloaded += 1,
            TraceEvent::instant(TraceCategory::Process, "unload")
                .with_pid(pid)
                .with_detail(format!("{} frames, {} slots", freed_frames, freed_slots)),
        );
    }

    /// Some frame of `pid` is pinned by more than its own wiring
    fn in_use(ft: &FrameTable, pid: Pid, table: &PageTable, wired: u32) -> bool {
        table.lock().iter().any(|entry| match entry.state {
            PageState::Resident { frame } => {
                let slot = ft.entry(frame);
                slot.occupant == Some(Occupant { pid, vpn: entry.vpn }) && slot.pins() > wired
            }
            _ => false,
        })
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.config)
            .field("swap", &self.swap)
            .finish_non_exhaustive()
    }
}
