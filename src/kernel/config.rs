//! Kernel configuration
//!
//! Sizes the simulated machine: page size, number of physical frames,
//! stack pages given to each process, and where swap lives.

use super::error::{Result, VmError};
use log::LevelFilter;
use serde::Deserialize;
use std::path::PathBuf;

/// Backing store used for swapped-out pages
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SwapBacking {
    /// Growable buffer in host memory
    #[default]
    Memory,
    /// A host file, truncated when the kernel starts
    File { path: PathBuf },
}

/// Configuration for the VM kernel
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Bytes per page and per frame
    pub page_size: usize,
    /// Number of physical frames in the shared pool
    pub num_frames: usize,
    /// Stack pages appended after each program image
    pub stack_pages: usize,
    /// Swap backing store
    pub swap: SwapBacking,
    /// Level for the console logger installed by the CLI
    pub log_level: LevelFilter,
    /// Start with the paging tracer enabled
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            page_size: 1024,
            num_frames: 16,
            stack_pages: 8,
            swap: SwapBacking::Memory,
            log_level: LevelFilter::Warn,
            trace: false,
        }
    }
}

impl VmConfig {
    pub fn page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }

    pub fn num_frames(mut self, n: usize) -> Self {
        self.num_frames = n;
        self
    }

    pub fn stack_pages(mut self, n: usize) -> Self {
        self.stack_pages = n;
        self
    }

    pub fn swap(mut self, backing: SwapBacking) -> Self {
        self.swap = backing;
        self
    }

    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    pub fn trace(mut self, enabled: bool) -> Self {
        self.trace = enabled;
        self
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: VmConfig =
            serde_json::from_str(text).map_err(|e| VmError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject machines the simulator cannot run
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(VmError::InvalidConfig(format!(
                "page_size must be a non-zero power of two, got {}",
                self.page_size
            )));
        }
        // Argument pointers are 4 bytes; a page must hold at least one.
        if self.page_size < 8 {
            return Err(VmError::InvalidConfig(format!(
                "page_size {} is too small",
                self.page_size
            )));
        }
        if self.num_frames == 0 {
            return Err(VmError::InvalidConfig(
                "num_frames must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(VmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = VmConfig::default().page_size(256).num_frames(4).stack_pages(2);
        assert_eq!(config.page_size, 256);
        assert_eq!(config.num_frames, 4);
        assert_eq!(config.stack_pages, 2);
    }

    #[test]
    fn test_rejects_bad_page_size() {
        assert!(VmConfig::default().page_size(1000).validate().is_err());
        assert!(VmConfig::default().page_size(0).validate().is_err());
        assert!(VmConfig::default().page_size(4).validate().is_err());
    }

    #[test]
    fn test_rejects_zero_frames() {
        assert!(VmConfig::default().num_frames(0).validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let config = VmConfig::from_json(r#"{ "num_frames": 3, "log_level": "debug" }"#).unwrap();
        assert_eq!(config.num_frames, 3);
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.swap, SwapBacking::Memory);
    }

    #[test]
    fn test_from_json_file_swap() {
        let config =
            VmConfig::from_json(r#"{ "swap": { "kind": "file", "path": "/tmp/swap.bin" } }"#)
                .unwrap();
        assert_eq!(
            config.swap,
            SwapBacking::File {
                path: PathBuf::from("/tmp/swap.bin")
            }
        );
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(matches!(
            VmConfig::from_json(r#"{ "page_size": 3 }"#),
            Err(VmError::InvalidConfig(_))
        ));
        assert!(VmConfig::from_json("not json").is_err());
    }
}
