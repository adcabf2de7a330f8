//! Random-access views over a target's byte address space.
//!
//! Everything the engine learns about a target -- maps, ELF images, stack
//! contents, JIT descriptors -- comes through the [`Memory`] trait. A read
//! returns the number of bytes actually available; a short read means the
//! rest of the span is not readable right now, not that it never will be.
//!
//! The concrete oracles cover the supported targets: the calling process
//! ([`MemoryLocal`]), a ptrace-attached process ([`MemoryRemote`]), files
//! ([`MemoryFileAtOffset`]), byte buffers, shifted and unioned windows
//! ([`MemoryRange`], [`MemoryRanges`]), offline snapshots, a small page
//! cache ([`MemoryCache`]) and lazily decompressed XZ data ([`MemoryXz`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

mod file;
mod local;
mod remote;
mod xz;

pub use file::MemoryFileAtOffset;
pub use local::MemoryLocal;
pub use remote::MemoryRemote;
pub use xz::MemoryXz;

/// Number of address bits covered by one [`MemoryCache`] page.
const CACHE_BITS: u64 = 12;
/// Size in bytes of one [`MemoryCache`] page.
const CACHE_SIZE: usize = 1 << CACHE_BITS;
/// Mask selecting the offset within a cache page.
const CACHE_MASK: u64 = (CACHE_SIZE as u64) - 1;

/// A read-only random-access view over a byte address space.
///
/// Implementations must be usable from multiple threads; oracles with
/// internal state (caches, lazy decompression) guard it themselves.
pub trait Memory: Send + Sync {
    /// Reads up to `dst.len()` bytes at `addr`.
    ///
    /// Returns the number of bytes actually read, which may be anything from
    /// zero to the requested length. A short read indicates the remainder of
    /// the span is not readable at this instant.
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize;

    /// Reads exactly `dst.len()` bytes at `addr`.
    ///
    /// Returns false if the full span could not be read. Partial data may
    /// have been written to `dst` regardless.
    fn read_fully(&self, addr: u64, dst: &mut [u8]) -> bool {
        self.read(addr, dst) == dst.len()
    }

    /// Reads a NUL-terminated string of at most `max_read` bytes at `addr`.
    fn read_string(&self, addr: u64, max_read: usize) -> Option<String> {
        // Large enough for nearly all symbol names, so the common case is a
        // single read.
        let mut buffer = [0u8; 256];
        let mut offset = 0;
        while offset < max_read {
            let want = buffer.len().min(max_read - offset);
            let size = self.read(addr + offset as u64, &mut buffer[..want]);
            if size == 0 {
                // End of string not found and no more data to read.
                return None;
            }
            if let Some(length) = buffer[..size].iter().position(|&c| c == 0) {
                if offset == 0 {
                    // A single read captured the whole string.
                    return String::from_utf8(buffer[..length].to_vec()).ok();
                }
                // The buffer only holds the last block; re-read from the start.
                let mut full = vec![0u8; offset + length];
                if !self.read_fully(addr, &mut full) {
                    return None;
                }
                return String::from_utf8(full).ok();
            }
            offset += size;
        }
        None
    }

    /// Reads a little-endian `u8` at `addr`.
    fn read_u8(&self, addr: u64) -> Option<u8> {
        let mut buf = [0u8; 1];
        self.read_fully(addr, &mut buf).then(|| buf[0])
    }

    /// Reads a little-endian `u16` at `addr`.
    fn read_u16(&self, addr: u64) -> Option<u16> {
        let mut buf = [0u8; 2];
        self.read_fully(addr, &mut buf)
            .then(|| LittleEndian::read_u16(&buf))
    }

    /// Reads a little-endian `u32` at `addr`.
    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read_fully(addr, &mut buf)
            .then(|| LittleEndian::read_u32(&buf))
    }

    /// Reads a little-endian `u64` at `addr`.
    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read_fully(addr, &mut buf)
            .then(|| LittleEndian::read_u64(&buf))
    }
}

impl<M: Memory + ?Sized> Memory for Arc<M> {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        (**self).read(addr, dst)
    }
}

/// A memory view over an owned byte buffer addressed from zero.
#[derive(Clone, Debug, Default)]
pub struct MemoryBuffer {
    data: Vec<u8>,
}

impl MemoryBuffer {
    /// Creates a view over the given bytes.
    pub fn new(data: Vec<u8>) -> Self {
        MemoryBuffer { data }
    }

    /// Creates a zeroed buffer of the given size.
    pub fn with_size(size: usize) -> Self {
        MemoryBuffer {
            data: vec![0; size],
        }
    }

    /// The number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Mutable access to the underlying bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Memory for MemoryBuffer {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let Ok(offset) = usize::try_from(addr) else {
            return 0;
        };
        if offset >= self.data.len() {
            return 0;
        }
        let actual = dst.len().min(self.data.len() - offset);
        dst[..actual].copy_from_slice(&self.data[offset..offset + actual]);
        actual
    }
}

/// A view exposing `[begin, begin + length)` of another memory at `offset`.
///
/// A read at `addr` in the caller's coordinates lands at
/// `begin + (addr - offset)` in the underlying memory, clamped to the
/// range's length.
#[derive(Clone)]
pub struct MemoryRange {
    memory: Arc<dyn Memory>,
    begin: u64,
    length: u64,
    offset: u64,
}

impl MemoryRange {
    /// Creates a range view over `memory`.
    pub fn new(memory: Arc<dyn Memory>, begin: u64, length: u64, offset: u64) -> Self {
        MemoryRange {
            memory,
            begin,
            length,
            offset,
        }
    }

    /// The caller-coordinate offset at which this range begins.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The number of bytes this range exposes.
    pub fn length(&self) -> u64 {
        self.length
    }
}

impl Memory for MemoryRange {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if addr < self.offset {
            return 0;
        }
        let read_offset = addr - self.offset;
        if read_offset >= self.length {
            return 0;
        }
        let read_length = (dst.len() as u64).min(self.length - read_offset);
        let Some(read_addr) = read_offset.checked_add(self.begin) else {
            return 0;
        };
        self.memory.read(read_addr, &mut dst[..read_length as usize])
    }
}

/// A union of non-overlapping [`MemoryRange`]s.
///
/// Ranges are indexed by their exclusive end address so a lookup is a single
/// `upper_bound`. A read never spans two ranges.
#[derive(Default)]
pub struct MemoryRanges {
    maps: BTreeMap<u64, MemoryRange>,
}

impl MemoryRanges {
    /// Creates an empty union.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a range into the union.
    pub fn insert(&mut self, range: MemoryRange) {
        // A crafted segment offset could overflow here; clamp rather than
        // wrap so the range stays findable.
        let last_addr = range.offset().checked_add(range.length()).unwrap_or(u64::MAX);
        self.maps.insert(last_addr, range);
    }
}

impl Memory for MemoryRanges {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        use std::ops::Bound;
        if let Some((_, range)) = self
            .maps
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
        {
            return range.read(addr, dst);
        }
        0
    }
}

/// An offline view over raw bytes captured from `[start, end)` of a target.
pub struct MemoryOfflineBuffer {
    data: Vec<u8>,
    start: u64,
    end: u64,
}

impl MemoryOfflineBuffer {
    /// Creates a view where `data[0]` corresponds to address `start`.
    pub fn new(data: Vec<u8>, start: u64) -> Self {
        let end = start + data.len() as u64;
        MemoryOfflineBuffer { data, start, end }
    }
}

impl Memory for MemoryOfflineBuffer {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if addr < self.start || addr >= self.end {
            return 0;
        }
        let offset = (addr - self.start) as usize;
        let read_length = dst.len().min((self.end - addr) as usize);
        dst[..read_length].copy_from_slice(&self.data[offset..offset + read_length]);
        read_length
    }
}

/// An ordered list of offline memories; the first non-empty read wins.
///
/// No read crosses from one part into the next.
#[derive(Default)]
pub struct MemoryOfflineParts {
    memories: Vec<Box<dyn Memory>>,
}

impl MemoryOfflineParts {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a part to the list.
    pub fn add(&mut self, memory: Box<dyn Memory>) {
        self.memories.push(memory);
    }

    /// Returns true if no parts have been added.
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

impl Memory for MemoryOfflineParts {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        for memory in &self.memories {
            let bytes = memory.read(addr, dst);
            if bytes != 0 {
                return bytes;
            }
        }
        0
    }
}

/// A fixed-page read cache in front of another memory.
///
/// Reads larger than 64 bytes bypass the cache entirely. Smaller reads pull
/// in whole pages; a read crossing a page boundary can touch at most two
/// pages, which is handled without a loop.
pub struct MemoryCache {
    inner: Arc<dyn Memory>,
    cache: Mutex<HashMap<u64, Box<[u8; CACHE_SIZE]>>>,
}

impl MemoryCache {
    /// Wraps `inner` with a page cache.
    pub fn new(inner: Arc<dyn Memory>) -> Self {
        MemoryCache {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Copies from the page holding `addr_page`, fetching it on a miss.
    ///
    /// Returns false if the page is unreadable, in which case the caller
    /// falls back to the uncached path.
    fn read_cached(
        &self,
        cache: &mut HashMap<u64, Box<[u8; CACHE_SIZE]>>,
        addr_page: u64,
        offset: usize,
        dst: &mut [u8],
    ) -> bool {
        if !cache.contains_key(&addr_page) {
            let mut page = Box::new([0u8; CACHE_SIZE]);
            if !self.inner.read_fully(addr_page << CACHE_BITS, &mut page[..]) {
                return false;
            }
            cache.insert(addr_page, page);
        }
        let page = cache.get(&addr_page).unwrap();
        dst.copy_from_slice(&page[offset..offset + dst.len()]);
        true
    }
}

impl Memory for MemoryCache {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        // Only bother with the cache for small reads.
        if dst.len() > 64 {
            return self.inner.read(addr, dst);
        }

        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let addr_page = addr >> CACHE_BITS;
        let max_read = (((addr_page + 1) << CACHE_BITS) - addr) as usize;
        if dst.len() <= max_read {
            let offset = (addr & CACHE_MASK) as usize;
            if self.read_cached(&mut cache, addr_page, offset, dst) {
                return dst.len();
            }
            return self.inner.read(addr, dst);
        }

        // The read crosses into the next page; since a small read can cross
        // at most one boundary, fetch the second page directly.
        let (first, second) = dst.split_at_mut(max_read);
        let offset = (addr & CACHE_MASK) as usize;
        if !self.read_cached(&mut cache, addr_page, offset, first) {
            return self.inner.read(addr, dst);
        }
        if !self.read_cached(&mut cache, addr_page + 1, 0, second) {
            return self
                .inner
                .read((addr_page + 1) << CACHE_BITS, second)
                + max_read;
        }
        dst.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingMemory {
        inner: MemoryBuffer,
        reads: Mutex<usize>,
    }

    impl Memory for CountingMemory {
        fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
            *self.reads.lock().unwrap() += 1;
            self.inner.read(addr, dst)
        }
    }

    #[test]
    fn test_buffer_read() {
        let memory = MemoryBuffer::new(vec![1, 2, 3, 4, 5]);
        let mut dst = [0u8; 3];
        assert_eq!(memory.read(1, &mut dst), 3);
        assert_eq!(dst, [2, 3, 4]);

        // Short read at the end of the buffer.
        assert_eq!(memory.read(4, &mut dst), 1);
        assert_eq!(memory.read(5, &mut dst), 0);
        assert_eq!(memory.read(u64::MAX, &mut dst), 0);
    }

    #[test]
    fn test_read_zero_length() {
        let memory = MemoryBuffer::new(vec![1, 2, 3]);
        let mut dst = [];
        assert_eq!(memory.read(0, &mut dst), 0);
    }

    #[test]
    fn test_read_string() {
        let mut data = b"_ZN3artL13CheckJNIFieldE\0tail".to_vec();
        data.splice(0..0, [0u8; 16]);
        let memory = MemoryBuffer::new(data);
        assert_eq!(
            memory.read_string(16, 256).unwrap(),
            "_ZN3artL13CheckJNIFieldE"
        );
        // The terminator must be found within max_read bytes.
        assert_eq!(memory.read_string(16, 8), None);
    }

    #[test]
    fn test_read_string_multiple_chunks() {
        let mut data = vec![b'a'; 300];
        data.push(0);
        let memory = MemoryBuffer::new(data);
        let value = memory.read_string(0, 400).unwrap();
        assert_eq!(value.len(), 300);
    }

    #[test]
    fn test_range_shifts_and_clamps() {
        let inner = Arc::new(MemoryBuffer::new((0..100).collect()));
        let range = MemoryRange::new(inner, 10, 20, 1000);

        let mut dst = [0u8; 4];
        assert_eq!(range.read(999, &mut dst), 0);
        assert_eq!(range.read(1000, &mut dst), 4);
        assert_eq!(dst, [10, 11, 12, 13]);

        // Clamped at the end of the range.
        assert_eq!(range.read(1018, &mut dst), 2);
        assert_eq!(range.read(1020, &mut dst), 0);
    }

    #[test]
    fn test_ranges_no_cross_range_reads() {
        let inner: Arc<dyn Memory> = Arc::new(MemoryBuffer::new((0..=255).collect()));
        let mut ranges = MemoryRanges::new();
        ranges.insert(MemoryRange::new(inner.clone(), 0, 16, 0x1000));
        ranges.insert(MemoryRange::new(inner, 100, 16, 0x1010));

        let mut dst = [0u8; 8];
        assert_eq!(ranges.read(0x100c, &mut dst), 4);
        assert_eq!(&dst[..4], &[12, 13, 14, 15]);
        assert_eq!(ranges.read(0x1010, &mut dst), 8);
        assert_eq!(&dst[..8], &[100, 101, 102, 103, 104, 105, 106, 107]);
        assert_eq!(ranges.read(0x1020, &mut dst), 0);
    }

    #[test]
    fn test_offline_buffer_bounds() {
        let memory = MemoryOfflineBuffer::new(vec![9, 8, 7, 6], 0x5000);
        let mut dst = [0u8; 4];
        assert_eq!(memory.read(0x4fff, &mut dst), 0);
        assert_eq!(memory.read(0x5002, &mut dst), 2);
        assert_eq!(&dst[..2], &[7, 6]);
        assert_eq!(memory.read(0x5004, &mut dst), 0);
    }

    #[test]
    fn test_offline_parts_first_hit_wins() {
        let mut parts = MemoryOfflineParts::new();
        parts.add(Box::new(MemoryOfflineBuffer::new(vec![1; 8], 0x1000)));
        parts.add(Box::new(MemoryOfflineBuffer::new(vec![2; 8], 0x2000)));

        let mut dst = [0u8; 4];
        assert_eq!(parts.read(0x2000, &mut dst), 4);
        assert_eq!(dst, [2; 4]);
        assert_eq!(parts.read(0x3000, &mut dst), 0);
    }

    #[test]
    fn test_cache_matches_uncached() {
        let data: Vec<u8> = (0..(3 * CACHE_SIZE)).map(|i| (i % 251) as u8).collect();
        let inner = Arc::new(MemoryBuffer::new(data.clone()));
        let cached = MemoryCache::new(inner.clone());

        for addr in [0u64, 1, 63, 4090, 4096, 8190] {
            for len in [1usize, 8, 63, 64] {
                let mut a = vec![0u8; len];
                let mut b = vec![0u8; len];
                let cached_len = cached.read(addr, &mut a);
                let direct_len = inner.read(addr, &mut b);
                assert_eq!(cached_len, direct_len, "addr={addr} len={len}");
                assert_eq!(a, b, "addr={addr} len={len}");
            }
        }
    }

    #[test]
    fn test_cache_bypass_for_large_reads() {
        let inner = Arc::new(CountingMemory {
            inner: MemoryBuffer::new(vec![0xab; 2 * CACHE_SIZE]),
            reads: Mutex::new(0),
        });
        let cached = MemoryCache::new(inner.clone());

        let mut small = [0u8; 16];
        assert_eq!(cached.read(0, &mut small), 16);
        assert_eq!(cached.read(16, &mut small), 16);
        // One page fetch serves both small reads.
        assert_eq!(*inner.reads.lock().unwrap(), 1);

        let mut large = [0u8; 65];
        assert_eq!(cached.read(0, &mut large), 65);
        assert_eq!(*inner.reads.lock().unwrap(), 2);
    }
}
