//! Memory backed by a file mapping.

use std::fs::File;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use super::local::page_size;
use super::Memory;

/// A read-only mapping of a file where `read(0, ..)` yields the byte at a
/// chosen file offset.
///
/// The mapping itself starts at the enclosing page boundary; the intra-page
/// slack is remembered so exposed addresses line up with the requested
/// offset exactly.
pub struct MemoryFileAtOffset {
    map: Mmap,
    /// Offset of the requested byte within the first mapped page.
    slack: usize,
    /// Number of exposed bytes, excluding the slack.
    size: usize,
}

impl MemoryFileAtOffset {
    /// Maps `path` so that address zero corresponds to `offset`, exposing
    /// the rest of the file.
    pub fn new<P: AsRef<Path>>(path: P, offset: u64) -> Option<Self> {
        Self::create(path.as_ref(), offset, u64::MAX)
    }

    /// Maps `path` at `offset`, exposing at most `size` bytes.
    pub fn with_size<P: AsRef<Path>>(path: P, offset: u64, size: u64) -> Option<Self> {
        Self::create(path.as_ref(), offset, size)
    }

    fn create(path: &Path, offset: u64, size: u64) -> Option<Self> {
        let file = File::open(path).ok()?;
        let file_size = file.metadata().ok()?.len();
        if offset >= file_size {
            return None;
        }

        let page_mask = page_size() as u64 - 1;
        let slack = (offset & page_mask) as usize;
        let aligned_offset = offset & !page_mask;

        let mut map_size = file_size - aligned_offset;
        if let Some(max_size) = size.checked_add(slack as u64) {
            if max_size < map_size {
                // The caller wants less than the rest of the file.
                map_size = max_size;
            }
        }

        let map = unsafe {
            MmapOptions::new()
                .offset(aligned_offset)
                .len(map_size as usize)
                .map(&file)
                .ok()?
        };

        Some(MemoryFileAtOffset {
            map,
            slack,
            size: map_size as usize - slack,
        })
    }

    /// The number of bytes exposed by this mapping.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Memory for MemoryFileAtOffset {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let Ok(offset) = usize::try_from(addr) else {
            return 0;
        };
        if offset >= self.size {
            return 0;
        }
        let actual = dst.len().min(self.size - offset);
        let start = self.slack + offset;
        dst[..actual].copy_from_slice(&self.map[start..start + actual]);
        actual
    }
}
