//! DEX files published for interpreted methods.
//!
//! The engine does not parse DEX bytecode itself; an opaque [`DexSymbols`]
//! capability maps a file-relative offset to a method name and extent.
//! Parsed files are interned process-wide behind weak handles so
//! system-wide profilers do not re-parse one file per target process, while
//! dropping the last unwinder releases the file.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;
use log::warn;

use framewalk_common::SharedString;

use crate::map_info::{lock, MapInfo};
use crate::memory::{Memory, MemoryBuffer, MemoryFileAtOffset};

/// `dex\n`, the start of every DEX header.
const DEX_MAGIC: [u8; 4] = [0x64, 0x65, 0x78, 0x0a];

/// A method located by the symbolizer capability.
#[derive(Clone, Debug)]
pub struct MethodInfo {
    /// File-relative offset of the method's first instruction.
    pub offset: u64,
    /// Extent of the method in bytes.
    pub len: u64,
    /// The method's human-readable signature.
    pub name: String,
}

/// The opaque DEX symbolizer capability.
///
/// Absence of a symbolizer disables naming but never unwinding.
pub trait DexSymbols: Send + Sync {
    /// Returns the method containing `dex_offset` within the file held in
    /// `memory`, whose total size is `file_size`.
    fn method_info(&self, memory: &dyn Memory, file_size: u64, dex_offset: u64)
        -> Option<MethodInfo>;
}

type MappedFileKey = (String, u64, u64);

lazy_static! {
    /// Process-wide weak intern table keyed by `(path, offset, size)`.
    static ref MAPPED_DEX_FILES: Mutex<HashMap<MappedFileKey, Weak<DexFile>>> =
        Mutex::new(HashMap::new());
}

/// One DEX file mapped into the target.
pub struct DexFile {
    memory: Box<dyn Memory>,
    base_addr: u64,
    file_size: u64,
    dex_symbols: Option<Arc<dyn DexSymbols>>,
    /// Method cache keyed by the interval's exclusive end offset.
    symbols: Mutex<BTreeMap<u64, (u64, SharedString)>>,
}

impl DexFile {
    /// Loads the DEX file at `[base_addr, base_addr + file_size)`.
    ///
    /// Prefers mapping the backing file from disk; falls back to copying
    /// the bytes out of the target. Files with an on-disk identity are
    /// interned in the process-wide weak table.
    pub fn create(
        base_addr: u64,
        file_size: u64,
        memory: &Arc<dyn Memory>,
        info: Option<&MapInfo>,
        dex_symbols: Option<&Arc<dyn DexSymbols>>,
    ) -> Option<Arc<DexFile>> {
        if file_size == 0 {
            return None;
        }

        let disk_identity = info.and_then(|info| {
            if info.name.is_empty() || base_addr < info.start || base_addr >= info.end {
                return None;
            }
            let offset_in_file = (base_addr - info.start) + info.offset;
            (file_size <= info.end - base_addr)
                .then(|| (info.name.to_string(), offset_in_file, file_size))
        });

        if let Some(key) = disk_identity {
            let mut cache = lock(&MAPPED_DEX_FILES);
            if let Some(existing) = cache.get(&key).and_then(Weak::upgrade) {
                return Some(existing);
            }
            if let Some(dex) =
                Self::create_uncached(base_addr, file_size, memory, Some(&key), dex_symbols)
            {
                cache.insert(key, Arc::downgrade(&dex));
                return Some(dex);
            }
            return None;
        }

        Self::create_uncached(base_addr, file_size, memory, None, dex_symbols)
    }

    fn create_uncached(
        base_addr: u64,
        file_size: u64,
        memory: &Arc<dyn Memory>,
        disk: Option<&MappedFileKey>,
        dex_symbols: Option<&Arc<dyn DexSymbols>>,
    ) -> Option<Arc<DexFile>> {
        // Try to map the file directly from disk.
        let mut dex_memory: Option<Box<dyn Memory>> = disk.and_then(|(path, offset, size)| {
            let mapped = MemoryFileAtOffset::with_size(path, *offset, *size)?;
            Some(Box::new(mapped) as Box<dyn Memory>)
        });

        // Fallback: copy into a local buffer.
        if dex_memory.is_none() {
            let mut buffer = MemoryBuffer::with_size(file_size as usize);
            if !memory.read_fully(base_addr, buffer.data_mut()) {
                return None;
            }
            dex_memory = Some(Box::new(buffer));
        }
        let dex_memory = dex_memory?;

        let mut magic = [0u8; 4];
        if !dex_memory.read_fully(0, &mut magic) || magic != DEX_MAGIC {
            warn!("no dex header at {base_addr:#x}");
            return None;
        }

        Some(Arc::new(DexFile {
            memory: dex_memory,
            base_addr,
            file_size,
            dex_symbols: dex_symbols.cloned(),
            symbols: Mutex::new(BTreeMap::new()),
        }))
    }

    /// The absolute address this file is mapped at.
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// The file's size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Returns true if `dex_pc` falls within the file.
    pub fn is_valid_pc(&self, dex_pc: u64) -> bool {
        self.base_addr <= dex_pc && (dex_pc - self.base_addr) < self.file_size
    }

    /// Resolves the method containing `dex_pc` and its offset within the
    /// method.
    pub fn function_name(&self, dex_pc: u64) -> Option<(SharedString, u64)> {
        let dex_offset = dex_pc.checked_sub(self.base_addr)?;

        let mut cache = lock(&self.symbols);

        // Look in the cache first.
        let cached = cache
            .range((Bound::Excluded(dex_offset), Bound::Unbounded))
            .next()
            .filter(|entry| entry.1 .0 <= dex_offset);
        if let Some((_, (start, name))) = cached {
            return Some((name.clone(), dex_offset - start));
        }

        // Ask the symbolizer; symbolization happens under the lock, since
        // the expected cost is dominated by cache hits.
        let method = self
            .dex_symbols
            .as_ref()?
            .method_info(&*self.memory, self.file_size, dex_offset)?;
        if method.offset == 0 || dex_offset < method.offset {
            return None;
        }
        let name = SharedString::from(method.name);
        cache.insert(method.offset + method.len, (method.offset, name.clone()));
        Some((name, dex_offset - method.offset))
    }
}
