//! vmsim - demand-paged virtual memory for a teaching OS simulator
//!
//! Design principles:
//! - Tractable: one global frame-table lock, a fixed lock order
//! - A process touches memory only through pinned accessors
//! - Physical memory is small on purpose; the clock and swap do the rest
//!
//! Layout:
//! - [`kernel`]: frames, swap, the fault handler, process address spaces
//! - [`logger`]: a `log` backend writing through [`console_log!`]

pub mod kernel;
pub mod logger;

/// Log to stderr
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}
