//! Virtual memory error types

use std::fmt;

/// VM result type
pub type Result<T> = std::result::Result<T, VmError>;

/// Which direction a swap transfer was going when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOp {
    Read,
    Write,
}

impl fmt::Display for SwapOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapOp::Read => write!(f, "read"),
            SwapOp::Write => write!(f, "write"),
        }
    }
}

/// Virtual memory errors
///
/// Short transfers and frame exhaustion are not errors; they surface as a
/// partial byte count and as blocking respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Backing store failed; the page content is unrecoverable
    SwapIo {
        slot: usize,
        op: SwapOp,
        message: String,
    },
    /// The executable section loader could not produce a page
    LoadFailed { vpn: usize, message: String },
    /// Not enough free frames to load a non-paging process
    OutOfMemory,
    /// Sections are not contiguous from virtual page 0
    FragmentedImage { expected: usize, found: usize },
    /// Program arguments do not fit in the argument page
    ArgumentsTooLong { size: usize, limit: usize },
    /// Configuration rejected by validation or parsing
    InvalidConfig(String),
    /// The process has already been unloaded
    UnknownProcess,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::SwapIo { slot, op, message } => {
                write!(f, "swap {} failed at slot {}: {}", op, slot, message)
            }
            VmError::LoadFailed { vpn, message } => {
                write!(f, "failed to load page {}: {}", vpn, message)
            }
            VmError::OutOfMemory => write!(f, "insufficient physical memory"),
            VmError::FragmentedImage { expected, found } => write!(
                f,
                "fragmented executable: section starts at page {}, expected {}",
                found, expected
            ),
            VmError::ArgumentsTooLong { size, limit } => {
                write!(f, "arguments too long: {} bytes (limit {})", size, limit)
            }
            VmError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            VmError::UnknownProcess => write!(f, "process is not loaded"),
        }
    }
}

impl std::error::Error for VmError {}
