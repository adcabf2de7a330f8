//! A single entry of the target's address space.

use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use framewalk_common::{Arch, SharedString};

use crate::elf::Elf;
use crate::maps::{Maps, MAPS_FLAGS_DEVICE_MAP, PROT_READ};
use crate::memory::{Memory, MemoryFileAtOffset, MemoryRange, MemoryRanges};

/// Sentinel for a load bias that has not been computed yet.
const LOAD_BIAS_UNSET: i64 = i64::MAX;

/// One mapping of the target's address space: `[start, end)` plus the file
/// offset, protection flags and backing name, linked to its neighbours and
/// owning the lazily created ELF for the module it belongs to.
pub struct MapInfo {
    /// First address covered by the mapping.
    pub start: u64,
    /// First address past the mapping.
    pub end: u64,
    /// Offset of the mapping within its backing file.
    pub offset: u64,
    /// Protection bits plus the device / JIT marker flags.
    pub flags: u16,
    /// Backing file name; empty for anonymous mappings.
    pub name: SharedString,

    pub(crate) index: usize,
    pub(crate) prev_map: Option<usize>,
    pub(crate) prev_real_map: Option<usize>,
    pub(crate) next_real_map: Option<usize>,

    elf: Mutex<Option<Arc<Elf>>>,
    /// Offset of this mapping within the ELF image backing it. Non-zero
    /// only when the mapping's own offset does not point at an ELF header.
    elf_offset: AtomicU64,
    /// File offset of the ELF header backing this mapping.
    elf_start_offset: AtomicU64,
    load_bias: AtomicI64,
    build_id: OnceLock<Arc<[u8]>>,
    memory_backed_elf: AtomicBool,
}

impl MapInfo {
    /// Creates an unlinked entry; [`Maps`](crate::maps::Maps) parsing links it.
    pub fn new(start: u64, end: u64, offset: u64, flags: u16, name: &str) -> Self {
        MapInfo {
            start,
            end,
            offset,
            flags,
            name: SharedString::from(name),
            index: 0,
            prev_map: None,
            prev_real_map: None,
            next_real_map: None,
            elf: Mutex::new(None),
            elf_offset: AtomicU64::new(0),
            elf_start_offset: AtomicU64::new(0),
            load_bias: AtomicI64::new(LOAD_BIAS_UNSET),
            build_id: OnceLock::new(),
            memory_backed_elf: AtomicBool::new(false),
        }
    }

    /// The previous entry in address order.
    pub fn prev_map<'m>(&self, maps: &'m Maps) -> Option<&'m Arc<MapInfo>> {
        maps.get(self.prev_map?)
    }

    /// The nearest preceding mapping with real protection bits that shares
    /// this mapping's backing file.
    pub fn prev_real_map<'m>(&self, maps: &'m Maps) -> Option<&'m Arc<MapInfo>> {
        maps.get(self.prev_real_map?)
    }

    /// The nearest following mapping with real protection bits that shares
    /// this mapping's backing file.
    pub fn next_real_map<'m>(&self, maps: &'m Maps) -> Option<&'m Arc<MapInfo>> {
        maps.get(self.next_real_map?)
    }

    /// Offset of this mapping within its backing ELF image.
    pub fn elf_offset(&self) -> u64 {
        self.elf_offset.load(Ordering::Relaxed)
    }

    /// File offset of the ELF header backing this mapping.
    pub fn elf_start_offset(&self) -> u64 {
        self.elf_start_offset.load(Ordering::Relaxed)
    }

    /// Returns true if the ELF for this mapping was synthesized from target
    /// memory rather than a file.
    pub fn memory_backed_elf(&self) -> bool {
        self.memory_backed_elf.load(Ordering::Relaxed)
    }

    /// Returns true if the entry carries no information at all.
    pub fn is_blank(&self) -> bool {
        self.offset == 0 && self.flags == 0 && self.name.is_empty()
    }

    /// Chooses the memory that backs this mapping's ELF.
    ///
    /// Tries the named file first, classifying the offset (whole file,
    /// embedded ELF, or split `r--`/`r-x` pair); falls back to synthesizing
    /// from target memory. Device and empty mappings yield nothing.
    pub fn create_memory(
        &self,
        maps: &Maps,
        process_memory: &Arc<dyn Memory>,
    ) -> Option<Box<dyn Memory>> {
        if self.end <= self.start {
            return None;
        }

        self.elf_offset.store(0, Ordering::Relaxed);

        if self.flags & MAPS_FLAGS_DEVICE_MAP != 0 {
            return None;
        }

        if !self.name.is_empty() {
            if let Some(memory) = self.file_memory(maps) {
                return Some(memory);
            }
        }

        self.memory_backed_elf.store(true, Ordering::Relaxed);

        // It is possible that only part of the ELF is mapped executable and
        // a read-only map holds the beginning (linker rosegment). Validate
        // before trusting this range alone.
        let range = MemoryRange::new(process_memory.clone(), self.start, self.end - self.start, 0);
        if Elf::is_valid_image(&range) {
            // Peek at the next map: the rest of an in-memory ELF may live
            // in a second mapping of the same name at a larger offset.
            let next = self.next_real_map(maps);
            match next {
                Some(next)
                    if self.offset == 0 && !self.name.is_empty() && self.offset < next.offset =>
                {
                    let mut ranges = MemoryRanges::new();
                    ranges.insert(range);
                    ranges.insert(MemoryRange::new(
                        process_memory.clone(),
                        next.start,
                        next.end - next.start,
                        next.offset - self.offset,
                    ));
                    return Some(Box::new(ranges));
                }
                _ => return Some(Box::new(range)),
            }
        }

        // No header here; look for the read-only map preceding this one
        // that holds the real start of the ELF data.
        let Some(prev) = self.prev_real_map(maps) else {
            self.memory_backed_elf.store(false, Ordering::Relaxed);
            return None;
        };
        if self.offset == 0 || self.name.is_empty() || prev.offset >= self.offset {
            self.memory_backed_elf.store(false, Ordering::Relaxed);
            return None;
        }

        // Make sure relative pc values are corrected properly.
        let elf_offset = self.offset - prev.offset;
        self.elf_offset.store(elf_offset, Ordering::Relaxed);
        self.elf_start_offset.store(prev.offset, Ordering::Relaxed);

        let mut ranges = MemoryRanges::new();
        ranges.insert(MemoryRange::new(
            process_memory.clone(),
            prev.start,
            prev.end - prev.start,
            0,
        ));
        ranges.insert(MemoryRange::new(
            process_memory.clone(),
            self.start,
            self.end - self.start,
            elf_offset,
        ));
        Some(Box::new(ranges))
    }

    /// Maps the backing file, classifying the mapping's offset.
    fn file_memory(&self, maps: &Maps) -> Option<Box<dyn Memory>> {
        if self.offset == 0 {
            let memory = MemoryFileAtOffset::new(self.name.as_str(), 0)?;
            return Some(Box::new(memory));
        }

        // The offset is non-zero, so either an ELF is embedded in the file
        // at that offset, the offset points at the executable part of a
        // split ELF, or the whole file is the ELF and the offset must be
        // remembered.
        let map_size = self.end - self.start;
        let memory = MemoryFileAtOffset::with_size(self.name.as_str(), self.offset, map_size)?;

        if let Some(max_size) = Elf::image_size(&memory) {
            // Embedded ELF. The dynamic linker only maps part of the file,
            // so remap with the full size when it exceeds the map.
            self.elf_start_offset.store(self.offset, Ordering::Relaxed);
            if max_size > map_size {
                if let Some(larger) =
                    MemoryFileAtOffset::with_size(self.name.as_str(), self.offset, max_size)
                {
                    return Some(Box::new(larger));
                }
                if let Some(again) =
                    MemoryFileAtOffset::with_size(self.name.as_str(), self.offset, map_size)
                {
                    return Some(Box::new(again));
                }
                self.elf_start_offset.store(0, Ordering::Relaxed);
                return None;
            }
            return Some(Box::new(memory));
        }

        // No ELF at the offset; try the whole file.
        if let Some(whole) = MemoryFileAtOffset::new(self.name.as_str(), 0) {
            if Elf::is_valid_image(&whole) {
                self.elf_offset.store(self.offset, Ordering::Relaxed);
                // If this is not the r-x half of a split pair, the real
                // offset is the start of the ELF within the file.
                let prev = self.prev_real_map(maps);
                let is_split_exec = matches!(
                    prev,
                    Some(prev) if prev.offset == 0 && prev.flags == PROT_READ
                );
                if !is_split_exec {
                    self.elf_start_offset.store(self.offset, Ordering::Relaxed);
                }
                return Some(Box::new(whole));
            }
        }

        if let Some(memory) = self.file_memory_from_previous_read_only_map(maps) {
            return Some(memory);
        }

        // No ELF found anywhere; hand back the plain window over the map.
        let memory = MemoryFileAtOffset::with_size(self.name.as_str(), self.offset, map_size)?;
        Some(Box::new(memory))
    }

    /// One last attempt: the previous map is read-only with the same name
    /// and stretches across this map.
    fn file_memory_from_previous_read_only_map(&self, maps: &Maps) -> Option<Box<dyn Memory>> {
        let prev = self.prev_real_map(maps)?;
        if prev.flags != PROT_READ {
            return None;
        }

        let map_size = self.end - prev.end;
        let memory = MemoryFileAtOffset::with_size(self.name.as_str(), prev.offset, map_size)?;

        let max_size = Elf::image_size(&memory)?;
        if max_size < map_size {
            return None;
        }

        let memory = MemoryFileAtOffset::with_size(self.name.as_str(), prev.offset, max_size)?;
        self.elf_offset
            .store(self.offset - prev.offset, Ordering::Relaxed);
        self.elf_start_offset.store(prev.offset, Ordering::Relaxed);
        Some(Box::new(memory))
    }

    /// Returns the ELF backing this mapping, creating it on first use.
    ///
    /// The created object is kept even when invalid so construction is not
    /// retried. When this mapping is the r-x half of a split pair, the ELF
    /// is shared with the read-only half.
    pub fn elf(
        &self,
        maps: &Maps,
        process_memory: &Arc<dyn Memory>,
        expected_arch: Arch,
    ) -> Arc<Elf> {
        let elf = {
            let mut guard = lock(&self.elf);
            if let Some(elf) = guard.as_ref() {
                return elf.clone();
            }

            let memory = self.create_memory(maps, process_memory);
            let mut elf = Elf::new(memory);
            // Keep the elf around even when init fails so we do not retry.
            elf.init();
            if elf.is_valid() && elf.arch() != Some(expected_arch) {
                elf.invalidate();
            }
            let elf = Arc::new(elf);
            *guard = Some(elf.clone());
            elf
        };

        if !elf.is_valid() {
            self.elf_start_offset.store(self.offset, Ordering::Relaxed);
            return elf;
        }

        let elf_start_offset = self.elf_start_offset();
        if let Some(prev) = self.prev_real_map(maps) {
            if elf_start_offset != self.offset && prev.offset == elf_start_offset {
                // A read-only map preceding a read-execute map of the same
                // object: both use one ELF.
                let mut prev_guard = lock(&prev.elf);
                match prev_guard.as_ref() {
                    None => {
                        *prev_guard = Some(elf.clone());
                        prev.memory_backed_elf
                            .store(self.memory_backed_elf(), Ordering::Relaxed);
                    }
                    Some(prev_elf) => {
                        // Discard ours and use the previous map's instead.
                        let prev_elf = prev_elf.clone();
                        drop(prev_guard);
                        *lock(&self.elf) = Some(prev_elf.clone());
                        return prev_elf;
                    }
                }
            }
        }
        elf
    }

    /// Returns the already-created ELF, if any.
    pub fn cached_elf(&self) -> Option<Arc<Elf>> {
        lock(&self.elf).clone()
    }

    /// Returns the load bias of the module backing this mapping.
    ///
    /// The value is computed at most once and published through an atomic;
    /// later callers observe the first writer's value.
    pub fn load_bias(&self, maps: &Maps, process_memory: &Arc<dyn Memory>) -> u64 {
        let cur = self.load_bias.load(Ordering::Relaxed);
        if cur != LOAD_BIAS_UNSET {
            return cur as u64;
        }

        if let Some(elf) = self.cached_elf() {
            let bias = if elf.is_valid() { elf.load_bias() } else { 0 };
            self.load_bias.store(bias as i64, Ordering::Relaxed);
            return bias;
        }

        // Read only enough of the ELF data to compute the bias.
        let bias = self
            .create_memory(maps, process_memory)
            .and_then(Elf::read_load_bias)
            .unwrap_or(0);
        self.load_bias.store(bias as i64, Ordering::Relaxed);
        bias
    }

    /// Returns the raw build id of the module backing this mapping.
    ///
    /// Computed at most once; the first writer's value wins.
    pub fn build_id(&self, maps: &Maps) -> Arc<[u8]> {
        self.build_id
            .get_or_init(|| {
                if let Some(elf) = self.cached_elf() {
                    return elf.build_id().unwrap_or_default().into();
                }
                // Without an elf object, this only works if the file backing
                // this mapping is available; memory-only modules have no
                // section names to search.
                self.file_memory(maps)
                    .and_then(Elf::read_build_id)
                    .unwrap_or_default()
                    .into()
            })
            .clone()
    }

    /// Sets the build id if it was not already set, returning the stored
    /// value either way.
    pub fn set_build_id(&self, build_id: Vec<u8>) -> Arc<[u8]> {
        let _ = self.build_id.set(build_id.into());
        self.build_id.get().cloned().unwrap_or_else(|| Arc::from(&[][..]))
    }

    /// The build id as a lowercase hex string.
    pub fn printable_build_id(&self, maps: &Maps) -> String {
        let raw = self.build_id(maps);
        let mut printable = String::with_capacity(raw.len() * 2);
        for byte in raw.iter() {
            let _ = write!(printable, "{byte:02x}");
        }
        printable
    }

    /// Resolves a function name through the mapping's ELF, if one has been
    /// created.
    pub fn function_name(&self, rel_pc: u64) -> Option<(SharedString, u64)> {
        let elf = self.cached_elf()?;
        elf.function_name(rel_pc)
    }
}

impl fmt::Debug for MapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapInfo")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("flags", &format_args!("{:#x}", self.flags))
            .field("name", &self.name)
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBuffer;

    fn process_memory(data: Vec<u8>) -> Arc<dyn Memory> {
        Arc::new(MemoryBuffer::new(data))
    }

    #[test]
    fn test_empty_range_yields_no_memory() {
        let maps = Maps::new();
        let info = MapInfo::new(0x2000, 0x2000, 0, PROT_READ, "/does/not/matter.so");
        assert!(info.create_memory(&maps, &process_memory(vec![0; 0x100])).is_none());
        let reversed = MapInfo::new(0x2000, 0x1000, 0, PROT_READ, "");
        assert!(reversed
            .create_memory(&maps, &process_memory(vec![0; 0x100]))
            .is_none());
    }

    #[test]
    fn test_device_map_yields_no_memory() {
        let maps = Maps::parse("1000-2000 r-xp 0 fd:00 0 /dev/binder\n").unwrap();
        let info = maps.find(0x1000).unwrap();
        assert!(info
            .create_memory(&maps, &process_memory(vec![0; 0x100]))
            .is_none());
    }

    #[test]
    fn test_split_mapping_unions_read_only_half() {
        // The r-- map holds the ELF header; the r-x map starts mid-file.
        // Neither is backed by a real file, so the memory is synthesized
        // from the process.
        let maps = Maps::parse(
            "40000000-40001000 r--p 0 00:00 0 /nonexistent/libfake.so\n\
             40001000-40003000 r-xp 1000 00:00 0 /nonexistent/libfake.so\n",
        )
        .unwrap();

        let mut image = vec![0u8; 0x3000];
        image[..4].copy_from_slice(b"\x7fELF");
        image[0x1800] = 0xcd;
        let process: Arc<dyn Memory> =
            Arc::new(crate::memory::MemoryOfflineBuffer::new(image, 0x40000000));

        let exec = maps.find(0x40001000).unwrap();
        let memory = exec.create_memory(&maps, &process).unwrap();
        assert_eq!(exec.elf_offset(), 0x1000);
        assert_eq!(exec.elf_start_offset(), 0);
        assert!(exec.memory_backed_elf());

        // The union exposes the header from the r-- half and the code from
        // the r-x half in one file-offset space.
        let mut magic = [0u8; 4];
        assert!(memory.read_fully(0, &mut magic));
        assert_eq!(&magic, b"\x7fELF");
        let mut byte = [0u8; 1];
        assert!(memory.read_fully(0x1800, &mut byte));
        assert_eq!(byte[0], 0xcd);
    }

    #[test]
    fn test_memory_backed_elf_whole_map() {
        let maps = Maps::parse("40000000-40003000 r-xp 0 00:00 0\n").unwrap();
        let mut image = vec![0u8; 0x3000];
        image[..4].copy_from_slice(b"\x7fELF");
        let process: Arc<dyn Memory> =
            Arc::new(crate::memory::MemoryOfflineBuffer::new(image, 0x40000000));

        let info = maps.find(0x40000000).unwrap();
        let memory = info.create_memory(&maps, &process).unwrap();
        assert!(info.memory_backed_elf());
        let mut magic = [0u8; 4];
        assert!(memory.read_fully(0, &mut magic));
        assert_eq!(&magic, b"\x7fELF");
    }

    #[test]
    fn test_build_id_published_once() {
        let maps = Maps::new();
        let info = MapInfo::new(0x1000, 0x2000, 0, PROT_READ, "");
        let first = info.set_build_id(b"abcd".to_vec());
        let second = info.set_build_id(b"efgh".to_vec());
        assert_eq!(&*first, b"abcd");
        assert_eq!(&*second, b"abcd");
        assert_eq!(&*info.build_id(&maps), b"abcd");
    }

    #[test]
    fn test_printable_build_id() {
        let maps = Maps::new();
        let info = MapInfo::new(0x1000, 0x2000, 0, PROT_READ, "");
        info.set_build_id(vec![0x2d, 0xd0, 0x4b, 0xa8]);
        assert_eq!(info.printable_build_id(&maps), "2dd04ba8");
    }
}
