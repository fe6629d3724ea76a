//! The kernel - demand-paged virtual memory
//!
//! - Processes see memory only through pinned accessors
//! - One frame pool shared by every process, reclaimed by a clock
//! - Dirty pages go to swap; clean ones are reloaded from the image

pub mod config;
pub mod error;
pub mod frame;
pub mod loader;
pub mod memory;
pub mod process;
pub mod swap;
pub mod trace;
pub mod translation;
pub mod vm;


pub use config::{SwapBacking, VmConfig};
pub use error::{Result, SwapOp, VmError};
pub use frame::{FrameInfo, Occupant};
pub use loader::{MemorySection, ProgramImage, Section};
pub use process::{AddressSpace, EagerProcess, Layout, PagedProcess, Pid};
pub use swap::{FileSwap, MemorySwap, SwapManager, SwapStore};
pub use trace::{PagingStats, TraceCategory, TraceEvent, TraceSummary, Tracer};
pub use translation::{PageState, PageTable, TranslationEntry};
pub use vm::{FaultOutcome, PageSource, Vm};

use std::sync::Arc;

/// The kernel owns the VM and hands out process address spaces
#[derive(Debug, Clone)]
pub struct Kernel {
    vm: Arc<Vm>,
}

impl Kernel {
    pub fn new(config: VmConfig) -> Result<Self> {
        let vm = Vm::new(config)?;
        log::info!(
            "vm up: {} frames of {} bytes, swap {:?}",
            vm.num_frames(),
            vm.page_size(),
            vm.config().swap
        );
        Ok(Self { vm: Arc::new(vm) })
    }

    /// Wrap an existing VM, e.g. one with a custom swap store
    pub fn with_vm(vm: Vm) -> Self {
        Self { vm: Arc::new(vm) }
    }

    /// Start a demand-paged process
    pub fn spawn_paged(&self, image: Arc<ProgramImage>, args: &[&str]) -> Result<Arc<PagedProcess>> {
        PagedProcess::load(self.vm.clone(), image, args).map(Arc::new)
    }

    /// Start a process whose whole image is loaded and pinned up front
    pub fn spawn_eager(&self, image: Arc<ProgramImage>, args: &[&str]) -> Result<Arc<EagerProcess>> {
        EagerProcess::load(self.vm.clone(), image, args).map(Arc::new)
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn stats(&self) -> PagingStats {
        self.vm.stats()
    }

    pub fn summary(&self) -> TraceSummary {
        self.vm.tracer().summary()
    }

    pub fn free_frames(&self) -> usize {
        self.vm.free_frames()
    }

    pub fn frame_snapshot(&self) -> Vec<FrameInfo> {
        self.vm.frame_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> Kernel {
        Kernel::new(VmConfig::default().page_size(32).num_frames(4).stack_pages(2)).unwrap()
    }

    #[test]
    fn test_kernel_rejects_bad_config() {
        let err = Kernel::new(VmConfig::default().page_size(100)).unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));
    }

    #[test]
    fn test_spawned_processes_get_distinct_pids() {
        let kernel = kernel();
        let image = Arc::new(ProgramImage::from_segments(32, &[("text", &[1u8; 8][..], true)]).unwrap());
        let a = kernel.spawn_paged(image.clone(), &[]).unwrap();
        let b = kernel.spawn_paged(image, &[]).unwrap();
        assert_ne!(a.pid(), b.pid());
        assert_eq!(kernel.stats().processes_loaded, 2);
    }

    #[test]
    fn test_pid_reused_after_exit() {
        let kernel = kernel();
        let image = Arc::new(ProgramImage::from_segments(32, &[]).unwrap());
        let first = kernel.spawn_paged(image.clone(), &[]).unwrap().pid();
        let second = kernel.spawn_paged(image, &[]).unwrap().pid();
        assert_eq!(first, second);
    }

    #[test]
    fn test_eager_and_paged_share_the_pool() {
        let kernel = kernel();
        let image = Arc::new(ProgramImage::from_segments(32, &[("data", &[7u8; 32][..], false)]).unwrap());
        let eager = kernel.spawn_eager(image.clone(), &[]).unwrap();
        assert_eq!(kernel.free_frames(), 0);

        let paged = kernel.spawn_paged(image, &[]).unwrap();
        let mut buf = [0u8; 4];
        // Every frame is pinned by the eager process; unpin them from another
        // thread so the paged fault can proceed.
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(eager);
        });
        assert_eq!(paged.read_memory(0, &mut buf).unwrap(), 4);
        assert_eq!(buf, [7; 4]);
        handle.join().unwrap();
        assert_eq!(kernel.stats().processes_unloaded, 1);
    }
}
