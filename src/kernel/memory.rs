//! Simulated physical memory
//!
//! A fixed array of page-sized frames. Who may touch a frame's bytes is
//! decided by pinning in the frame table: only the holder of a pin reads or
//! writes a frame. Each frame still sits behind its own lock so the
//! convention never has to be trusted for memory safety; under correct
//! pinning those locks are uncontended.

use std::sync::{Mutex, MutexGuard};

/// One physical frame
#[derive(Debug)]
struct Frame {
    data: Mutex<Box<[u8]>>,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; page_size].into_boxed_slice()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The machine's physical memory
#[derive(Debug)]
pub struct PhysicalMemory {
    frames: Vec<Frame>,
    page_size: usize,
}

impl PhysicalMemory {
    pub fn new(num_frames: usize, page_size: usize) -> Self {
        Self {
            frames: (0..num_frames).map(|_| Frame::new(page_size)).collect(),
            page_size,
        }
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Run `f` over a frame's bytes
    pub fn with_frame<R>(&self, frame: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.frames[frame].lock();
        f(&mut data)
    }

    /// Read from a frame, clamped to the page
    pub fn read(&self, frame: usize, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= self.page_size {
            return 0;
        }
        let to_read = buf.len().min(self.page_size - offset);
        self.with_frame(frame, |data| {
            buf[..to_read].copy_from_slice(&data[offset..offset + to_read]);
        });
        to_read
    }

    /// Write to a frame, clamped to the page
    pub fn write(&self, frame: usize, offset: usize, buf: &[u8]) -> usize {
        if offset >= self.page_size {
            return 0;
        }
        let to_write = buf.len().min(self.page_size - offset);
        self.with_frame(frame, |data| {
            data[offset..offset + to_write].copy_from_slice(&buf[..to_write]);
        });
        to_write
    }

    pub fn zero_fill(&self, frame: usize) {
        self.with_frame(frame, |data| data.fill(0));
    }

    /// Copy of a whole frame
    pub fn snapshot(&self, frame: usize) -> Vec<u8> {
        self.with_frame(frame, |data| data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_start_zeroed() {
        let mem = PhysicalMemory::new(2, 64);
        assert_eq!(mem.num_frames(), 2);
        assert!(mem.snapshot(1).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_write() {
        let mem = PhysicalMemory::new(1, 64);
        assert_eq!(mem.write(0, 10, b"hello"), 5);

        let mut buf = [0u8; 5];
        assert_eq!(mem.read(0, 10, &mut buf), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_clamped_at_page_end() {
        let mem = PhysicalMemory::new(1, 16);
        assert_eq!(mem.write(0, 12, b"abcdefgh"), 4);
        let mut buf = [0u8; 8];
        assert_eq!(mem.read(0, 12, &mut buf), 4);
        assert_eq!(&buf[..4], b"abcd");
        assert_eq!(mem.write(0, 16, b"x"), 0);
    }

    #[test]
    fn test_zero_fill() {
        let mem = PhysicalMemory::new(1, 16);
        mem.write(0, 0, &[0xff; 16]);
        mem.zero_fill(0);
        assert!(mem.snapshot(0).iter().all(|&b| b == 0));
    }
}
