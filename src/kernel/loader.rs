//! Program images
//!
//! An image is an ordered list of sections laid out contiguously from
//! virtual page 0. Sections deposit one page at a time into a frame, which
//! is all the pager needs to bring a code or data page in on demand.

use super::error::{Result, VmError};
use std::fmt;

/// A loadable executable section
pub trait Section: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    /// First virtual page covered by this section
    fn first_vpn(&self) -> usize;
    /// Length in pages
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn is_read_only(&self) -> bool;
    /// Bytes per page this section was cut into
    fn page_size(&self) -> usize;
    /// Fill `dest` (one page) with page `index` of this section
    fn load_page(&self, index: usize, dest: &mut [u8]) -> Result<()>;
}

/// A section backed by bytes in host memory
#[derive(Debug, Clone)]
pub struct MemorySection {
    name: String,
    first_vpn: usize,
    read_only: bool,
    data: Vec<u8>,
    page_size: usize,
}

impl MemorySection {
    pub fn new(
        name: impl Into<String>,
        first_vpn: usize,
        data: Vec<u8>,
        read_only: bool,
        page_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            first_vpn,
            read_only,
            data,
            page_size,
        }
    }
}

impl Section for MemorySection {
    fn name(&self) -> &str {
        &self.name
    }

    fn first_vpn(&self) -> usize {
        self.first_vpn
    }

    fn len(&self) -> usize {
        self.data.len().div_ceil(self.page_size)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn load_page(&self, index: usize, dest: &mut [u8]) -> Result<()> {
        if index >= self.len() || dest.len() != self.page_size {
            return Err(VmError::LoadFailed {
                vpn: self.first_vpn + index,
                message: format!(
                    "section {} has {} pages of {} bytes",
                    self.name,
                    self.len(),
                    self.page_size
                ),
            });
        }
        let start = index * self.page_size;
        let end = (start + self.page_size).min(self.data.len());
        let chunk = &self.data[start..end];
        dest[..chunk.len()].copy_from_slice(chunk);
        dest[chunk.len()..].fill(0);
        Ok(())
    }
}

/// A program's sections
#[derive(Debug)]
pub struct ProgramImage {
    sections: Vec<Box<dyn Section>>,
    entry_point: usize,
    num_pages: usize,
    page_size: usize,
}

impl ProgramImage {
    /// Build an image, rejecting sections that leave gaps or overlap or
    /// that were cut into pages of another size
    pub fn new(
        page_size: usize,
        sections: Vec<Box<dyn Section>>,
        entry_point: usize,
    ) -> Result<Self> {
        let mut num_pages = 0;
        for section in &sections {
            if section.page_size() != page_size {
                return Err(VmError::InvalidConfig(format!(
                    "section {} uses {}-byte pages, image uses {}",
                    section.name(),
                    section.page_size(),
                    page_size
                )));
            }
            if section.first_vpn() != num_pages {
                log::debug!("fragmented executable at section {}", section.name());
                return Err(VmError::FragmentedImage {
                    expected: num_pages,
                    found: section.first_vpn(),
                });
            }
            num_pages += section.len();
        }
        Ok(Self {
            sections,
            entry_point,
            num_pages,
            page_size,
        })
    }

    /// Lay out `(name, bytes, read_only)` segments back to back from page 0
    pub fn from_segments(page_size: usize, segments: &[(&str, &[u8], bool)]) -> Result<Self> {
        let mut sections: Vec<Box<dyn Section>> = Vec::with_capacity(segments.len());
        let mut vpn = 0;
        for (name, bytes, read_only) in segments {
            let section = MemorySection::new(*name, vpn, bytes.to_vec(), *read_only, page_size);
            vpn += section.len();
            sections.push(Box::new(section));
        }
        Self::new(page_size, sections, 0)
    }

    pub fn sections(&self) -> &[Box<dyn Section>] {
        &self.sections
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    /// Pages covered by sections
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// The section holding `vpn` and the page index within it
    pub fn section_for(&self, vpn: usize) -> Option<(&dyn Section, usize)> {
        self.sections
            .iter()
            .find(|s| vpn >= s.first_vpn() && vpn < s.first_vpn() + s.len())
            .map(|s| (s.as_ref(), vpn - s.first_vpn()))
    }

    pub fn is_read_only(&self, vpn: usize) -> bool {
        self.section_for(vpn).is_some_and(|(s, _)| s.is_read_only())
    }

    /// Fill a page from its section, or zeros outside the image.
    /// Returns true if a section supplied the content.
    pub fn fill_page(&self, vpn: usize, dest: &mut [u8]) -> Result<bool> {
        match self.section_for(vpn) {
            Some((section, index)) => {
                section.load_page(index, dest)?;
                Ok(true)
            }
            None => {
                dest.fill(0);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_section_pads_last_page() {
        let section = MemorySection::new("data", 0, vec![1u8; 20], false, 16);
        assert_eq!(section.len(), 2);

        let mut page = [0xaau8; 16];
        section.load_page(1, &mut page).unwrap();
        assert_eq!(&page[..4], &[1, 1, 1, 1]);
        assert!(page[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_memory_section_bad_index() {
        let section = MemorySection::new("text", 3, vec![0u8; 16], true, 16);
        let mut page = [0u8; 16];
        assert!(matches!(
            section.load_page(1, &mut page),
            Err(VmError::LoadFailed { vpn: 4, .. })
        ));
    }

    #[test]
    fn test_image_layout() {
        let image =
            ProgramImage::from_segments(16, &[("text", &[1u8; 32][..], true), ("data", &[2u8; 5][..], false)])
                .unwrap();
        assert_eq!(image.num_pages(), 3);
        assert!(image.is_read_only(1));
        assert!(!image.is_read_only(2));
        assert!(!image.is_read_only(3));

        let (section, index) = image.section_for(2).unwrap();
        assert_eq!(section.name(), "data");
        assert_eq!(index, 0);
        assert!(image.section_for(3).is_none());
    }

    #[test]
    fn test_fragmented_image_rejected() {
        let sections: Vec<Box<dyn Section>> = vec![
            Box::new(MemorySection::new("text", 0, vec![0u8; 16], true, 16)),
            Box::new(MemorySection::new("data", 2, vec![0u8; 16], false, 16)),
        ];
        assert_eq!(
            ProgramImage::new(16, sections, 0).unwrap_err(),
            VmError::FragmentedImage {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn test_fill_page_outside_image_zeroes() {
        let image = ProgramImage::from_segments(16, &[("text", &[9u8; 16][..], true)]).unwrap();
        let mut page = [0xffu8; 16];
        assert!(!image.fill_page(5, &mut page).unwrap());
        assert_eq!(page, [0u8; 16]);
        assert!(image.fill_page(0, &mut page).unwrap());
        assert_eq!(page, [9u8; 16]);
    }

    #[test]
    fn test_mismatched_section_page_size_rejected() {
        let sections: Vec<Box<dyn Section>> =
            vec![Box::new(MemorySection::new("text", 0, vec![0u8; 32], true, 32))];
        assert!(matches!(
            ProgramImage::new(16, sections, 0),
            Err(VmError::InvalidConfig(_))
        ));
        let image = ProgramImage::from_segments(32, &[("text", &[0u8; 8][..], true)]).unwrap();
        assert_eq!(image.page_size(), 32);
    }
}
