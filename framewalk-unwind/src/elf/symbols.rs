//! ELF symbol tables with an ordered interval cache.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use scroll::Pread;

use framewalk_common::SharedString;

use crate::map_info::lock;
use crate::memory::Memory;

/// Sizes of one symbol record per ELF class.
const SYM32_SIZE: u64 = 16;
const SYM64_SIZE: u64 = 24;

const STT_FUNC: u8 = goblin::elf::sym::STT_FUNC;

/// One symbol table (`.symtab` or `.dynsym`) plus its string table.
///
/// Function symbols are cached in a map keyed by the interval's exclusive
/// end address; a lookup is one `upper_bound` probe. The table itself is
/// walked at most once.
pub struct ElfSymbols {
    offset: u64,
    end: u64,
    entry_size: u64,
    str_offset: u64,
    str_end: u64,
    is_64bit: bool,
    cache: Mutex<SymbolCache>,
}

#[derive(Default)]
struct SymbolCache {
    /// end_addr -> (start_addr, name offset in strtab resolved to a name).
    entries: BTreeMap<u64, (u64, SharedString)>,
    walked: bool,
}

impl ElfSymbols {
    /// Describes a symbol table at `[offset, offset + size)` with strings
    /// at `[str_offset, str_offset + str_size)`.
    pub fn new(
        offset: u64,
        size: u64,
        entry_size: u64,
        str_offset: u64,
        str_size: u64,
        is_64bit: bool,
    ) -> Self {
        let entry_size = if entry_size != 0 {
            entry_size
        } else if is_64bit {
            SYM64_SIZE
        } else {
            SYM32_SIZE
        };
        ElfSymbols {
            offset,
            end: offset.saturating_add(size),
            entry_size,
            str_offset,
            str_end: str_offset.saturating_add(str_size),
            is_64bit,
            cache: Mutex::new(SymbolCache::default()),
        }
    }

    /// Finds the function symbol containing `addr` (a virtual address) and
    /// its offset within the function.
    pub fn get_name(&self, addr: u64, memory: &dyn Memory) -> Option<(SharedString, u64)> {
        let mut cache = lock(&self.cache);

        if !cache.walked {
            cache.walked = true;
            self.walk(memory, &mut cache);
        }

        let (&end, &(start, ref name)) = cache
            .entries
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()?;
        debug_assert!(start < end);
        (start <= addr).then(|| (name.clone(), addr - start))
    }

    /// Finds the value of a defined symbol by name, regardless of its
    /// type. Used to locate global variables; walked directly since this
    /// only happens during catalog initialization.
    pub fn global_address(&self, name: &str, memory: &dyn Memory) -> Option<u64> {
        let min_size = if self.is_64bit { SYM64_SIZE } else { SYM32_SIZE };
        if self.entry_size < min_size {
            return None;
        }

        let mut cur = self.offset;
        let mut buf = [0u8; SYM64_SIZE as usize];
        while cur.checked_add(min_size).is_some_and(|end| end <= self.end) {
            let entry = &mut buf[..min_size as usize];
            if !memory.read_fully(cur, entry) {
                return None;
            }
            cur = cur.saturating_add(self.entry_size);

            let (name_offset, value, shndx) = if self.is_64bit {
                (
                    entry.pread_with::<u32>(0, scroll::LE).unwrap_or(0),
                    entry.pread_with::<u64>(8, scroll::LE).unwrap_or(0),
                    entry.pread_with::<u16>(6, scroll::LE).unwrap_or(0),
                )
            } else {
                (
                    entry.pread_with::<u32>(0, scroll::LE).unwrap_or(0),
                    entry.pread_with::<u32>(4, scroll::LE).unwrap_or(0) as u64,
                    entry.pread_with::<u16>(14, scroll::LE).unwrap_or(0),
                )
            };

            // Undefined symbols live in other modules.
            if shndx == 0 {
                continue;
            }
            let str_addr = self.str_offset + name_offset as u64;
            if str_addr >= self.str_end {
                continue;
            }
            let max = (self.str_end - str_addr) as usize;
            match memory.read_string(str_addr, max.min(1024)) {
                Some(candidate) if candidate == name => return Some(value),
                _ => continue,
            }
        }
        None
    }

    /// Walks the whole table once, caching every function symbol with a
    /// non-zero size.
    fn walk(&self, memory: &dyn Memory, cache: &mut SymbolCache) {
        let min_size = if self.is_64bit { SYM64_SIZE } else { SYM32_SIZE };
        if self.entry_size < min_size {
            return;
        }

        let mut cur = self.offset;
        let mut buf = [0u8; SYM64_SIZE as usize];
        while cur.checked_add(min_size).is_some_and(|end| end <= self.end) {
            let entry = &mut buf[..min_size as usize];
            if !memory.read_fully(cur, entry) {
                return;
            }
            cur = cur.saturating_add(self.entry_size);

            let (name_offset, value, size, info) = if self.is_64bit {
                let name: u32 = entry.pread_with(0, scroll::LE).unwrap_or(0);
                let info: u8 = entry.pread_with(4, scroll::LE).unwrap_or(0);
                let value: u64 = entry.pread_with(8, scroll::LE).unwrap_or(0);
                let size: u64 = entry.pread_with(16, scroll::LE).unwrap_or(0);
                (name, value, size, info)
            } else {
                let name: u32 = entry.pread_with(0, scroll::LE).unwrap_or(0);
                let value: u32 = entry.pread_with(4, scroll::LE).unwrap_or(0);
                let size: u32 = entry.pread_with(8, scroll::LE).unwrap_or(0);
                let info: u8 = entry.pread_with(12, scroll::LE).unwrap_or(0);
                (name, value as u64, size as u64, info)
            };

            // Ignore non-function and zero-size symbols.
            if goblin::elf::sym::st_type(info) != STT_FUNC || size == 0 {
                continue;
            }
            let str_addr = self.str_offset + name_offset as u64;
            if str_addr >= self.str_end {
                continue;
            }
            let max = (self.str_end - str_addr) as usize;
            let Some(name) = memory.read_string(str_addr, max.min(1024)) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            cache
                .entries
                .insert(value.saturating_add(size), (value, SharedString::from(name)));
        }
    }
}
