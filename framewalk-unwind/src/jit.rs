//! Runtime-generated code discovery via the GDB JIT interface.
//!
//! The target publishes a descriptor variable whose entries form a doubly
//! linked list of symbol files: in-memory ELFs for JIT-compiled code, or
//! DEX files for interpreted methods. The descriptor's fields are
//! pointer-sized on the target, so the wire layout is parameterized per
//! architecture; on 32-bit x86 the 64-bit size field is not naturally
//! aligned.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use log::warn;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{FromBytes, FromZeroes};

use framewalk_common::{Arch, SharedString};

use crate::dex::{DexFile, DexSymbols};
use crate::elf::Elf;
use crate::map_info::lock;
use crate::maps::{basename, Maps, PROT_READ, PROT_WRITE};
use crate::memory::{Memory, MemoryRange};

/// The descriptor variable naming JIT-compiled code.
pub const JIT_DEBUG_DESCRIPTOR: &str = "__jit_debug_descriptor";
/// The descriptor variable naming loaded DEX files.
pub const DEX_DEBUG_DESCRIPTOR: &str = "__dex_debug_descriptor";

/// The ART modules whose globals are searched by default.
pub const DEFAULT_SEARCH_LIBS: &[&str] = &["libart.so", "libartd.so"];

/// Guard against a corrupted list that cycles.
const MAX_ENTRIES: usize = 10000;

type U32L = U32<LittleEndian>;
type U64L = U64<LittleEndian>;

/// A target-side `JITDescriptor` with 32-bit pointers.
#[derive(FromBytes, FromZeroes)]
#[repr(C)]
struct JitDescriptor32 {
    version: U32L,
    action_flag: U32L,
    relevant_entry: U32L,
    first_entry: U32L,
}

/// A target-side `JITDescriptor` with 64-bit pointers.
#[derive(FromBytes, FromZeroes)]
#[repr(C)]
struct JitDescriptor64 {
    version: U32L,
    action_flag: U32L,
    relevant_entry: U64L,
    first_entry: U64L,
}

/// `JITCodeEntry` on x86-32: the size field is packed, not aligned.
#[derive(FromBytes, FromZeroes)]
#[repr(C)]
struct JitCodeEntryX86 {
    next: U32L,
    prev: U32L,
    symfile_addr: U32L,
    symfile_size: U64L,
}

/// `JITCodeEntry` on arm32/mips32: the size field is 8-byte aligned.
#[derive(FromBytes, FromZeroes)]
#[repr(C)]
struct JitCodeEntry32 {
    next: U32L,
    prev: U32L,
    symfile_addr: U32L,
    _pad: U32L,
    symfile_size: U64L,
}

/// `JITCodeEntry` on 64-bit targets.
#[derive(FromBytes, FromZeroes)]
#[repr(C)]
struct JitCodeEntry64 {
    next: U64L,
    prev: U64L,
    symfile_addr: U64L,
    symfile_size: U64L,
}

const _: () = assert!(std::mem::size_of::<JitDescriptor32>() == 16);
const _: () = assert!(std::mem::size_of::<JitDescriptor64>() == 24);
const _: () = assert!(std::mem::size_of::<JitCodeEntryX86>() == 20);
const _: () = assert!(std::mem::size_of::<JitCodeEntry32>() == 24);
const _: () = assert!(std::mem::size_of::<JitCodeEntry64>() == 32);

/// One wire layout of the descriptor plus its entries.
trait JitLayout: FromBytes + Send + Sync {
    const DESCRIPTOR_SIZE: usize;
    const ENTRY_SIZE: usize;
    fn descriptor_first_entry(buf: &[u8]) -> Option<(u32, u64)>;
    fn entry_fields(buf: &[u8]) -> Option<(u64, u64, u64)>;
}

macro_rules! jit_layout {
    ($name:ident, $descriptor:ty, $entry:ty) => {
        impl JitLayout for $name {
            const DESCRIPTOR_SIZE: usize = std::mem::size_of::<$descriptor>();
            const ENTRY_SIZE: usize = std::mem::size_of::<$entry>();

            fn descriptor_first_entry(buf: &[u8]) -> Option<(u32, u64)> {
                let descriptor = <$descriptor>::read_from(buf)?;
                Some((descriptor.version.get(), descriptor.first_entry.get().into()))
            }

            fn entry_fields(buf: &[u8]) -> Option<(u64, u64, u64)> {
                let entry = <$entry>::read_from(buf)?;
                Some((
                    entry.next.get().into(),
                    entry.symfile_addr.get().into(),
                    entry.symfile_size.get(),
                ))
            }
        }
    };
}

jit_layout!(JitCodeEntryX86, JitDescriptor32, JitCodeEntryX86);
jit_layout!(JitCodeEntry32, JitDescriptor32, JitCodeEntry32);
jit_layout!(JitCodeEntry64, JitDescriptor64, JitCodeEntry64);

/// A symbol file published through the descriptor list.
pub trait Symfile: Send + Sync {
    /// Loads a symbol file from `[addr, addr + size)` of the target.
    fn load(
        maps: &Maps,
        memory: &Arc<dyn Memory>,
        addr: u64,
        size: u64,
        dex_symbols: Option<&Arc<dyn DexSymbols>>,
    ) -> Option<Arc<Self>>;

    /// Returns true if this file covers `pc`.
    fn is_valid_pc(&self, pc: u64) -> bool;

    /// Resolves the function containing `pc`.
    fn function_name(&self, pc: u64) -> Option<(SharedString, u64)>;
}

/// An in-memory ELF published for JIT-compiled code.
///
/// Its addresses are absolute, so queries use the unadjusted pc.
pub struct JitElf {
    elf: Elf,
}

impl JitElf {
    /// The wrapped module, for CFI stepping.
    pub fn elf(&self) -> &Elf {
        &self.elf
    }
}

impl Symfile for JitElf {
    fn load(
        _maps: &Maps,
        memory: &Arc<dyn Memory>,
        addr: u64,
        size: u64,
        _dex_symbols: Option<&Arc<dyn DexSymbols>>,
    ) -> Option<Arc<Self>> {
        let range = MemoryRange::new(memory.clone(), addr, size, 0);
        let mut elf = Elf::new(Some(Box::new(range)));
        elf.init();
        if !elf.is_valid() {
            return None;
        }
        Some(Arc::new(JitElf { elf }))
    }

    fn is_valid_pc(&self, pc: u64) -> bool {
        self.elf.is_valid_pc(pc)
    }

    fn function_name(&self, pc: u64) -> Option<(SharedString, u64)> {
        self.elf.function_name(pc)
    }
}

impl Symfile for DexFile {
    fn load(
        maps: &Maps,
        memory: &Arc<dyn Memory>,
        addr: u64,
        size: u64,
        dex_symbols: Option<&Arc<dyn DexSymbols>>,
    ) -> Option<Arc<Self>> {
        let map_info = maps.find(addr);
        DexFile::create(addr, size, memory, map_info.map(|info| &**info), dex_symbols)
    }

    fn is_valid_pc(&self, pc: u64) -> bool {
        DexFile::is_valid_pc(self, pc)
    }

    fn function_name(&self, pc: u64) -> Option<(SharedString, u64)> {
        DexFile::function_name(self, pc)
    }
}

struct CatalogState<S> {
    initialized: bool,
    entry_addr: u64,
    seen: usize,
    entries: Vec<Arc<S>>,
}

/// A catalog of symbol files discovered through one descriptor variable.
struct GlobalDebugImpl<L, S> {
    memory: Arc<dyn Memory>,
    arch: Arch,
    search_libs: Vec<String>,
    variable_name: &'static str,
    dex_symbols: Option<Arc<dyn DexSymbols>>,
    state: Mutex<CatalogState<S>>,
    layout: PhantomData<L>,
}

trait GlobalDebugInterface<S>: Send + Sync {
    fn find(&self, maps: &Maps, pc: u64) -> Option<Arc<S>>;
    fn function_name(&self, maps: &Maps, pc: u64) -> Option<(SharedString, u64)>;
}

impl<L: JitLayout, S: Symfile> GlobalDebugImpl<L, S> {
    fn new(
        memory: Arc<dyn Memory>,
        arch: Arch,
        search_libs: Vec<String>,
        variable_name: &'static str,
        dex_symbols: Option<Arc<dyn DexSymbols>>,
    ) -> Self {
        GlobalDebugImpl {
            memory,
            arch,
            search_libs,
            variable_name,
            dex_symbols,
            state: Mutex::new(CatalogState {
                initialized: false,
                entry_addr: 0,
                seen: 0,
                entries: Vec::new(),
            }),
            layout: PhantomData,
        }
    }

    fn read_descriptor(&self, addr: u64) -> u64 {
        let mut buf = vec![0u8; L::DESCRIPTOR_SIZE];
        if !self.memory.read_fully(addr, &mut buf) {
            return 0;
        }
        match L::descriptor_first_entry(&buf) {
            // Either an unknown version or no entries at all.
            Some((1, first_entry)) => first_entry,
            _ => 0,
        }
    }

    fn read_entry(&self, addr: u64) -> Option<(u64, u64, u64)> {
        let mut buf = vec![0u8; L::ENTRY_SIZE];
        if !self.memory.read_fully(addr, &mut buf) {
            return None;
        }
        L::entry_fields(&buf)
    }

    /// Locates the descriptor by resolving the named global in the
    /// allow-listed modules. Failure leaves the catalog permanently empty.
    fn init(&self, state: &mut CatalogState<S>, maps: &Maps) {
        // Whatever happens below, never attempt this twice.
        state.initialized = true;

        // Look for the pattern that must exist: a map with a zero offset
        // holding the module, later followed by its read-write data map.
        let mut map_zero: Option<&Arc<crate::map_info::MapInfo>> = None;
        for info in maps.iter() {
            if info.offset == 0 && !info.name.is_empty() {
                if map_zero.map_or(true, |zero| zero.name != info.name) {
                    map_zero = Some(info);
                }
            }
            let Some(zero) = map_zero else {
                continue;
            };
            if info.flags != PROT_READ | PROT_WRITE
                || info.name != zero.name
                || !self.search_lib_matches(basename(&info.name))
            {
                continue;
            }

            let elf = zero.elf(maps, &self.memory, self.arch);
            let Some(file_offset) = elf.global_variable_offset(self.variable_name) else {
                continue;
            };
            if file_offset < info.offset {
                continue;
            }
            let addr = file_offset - info.offset + info.start;
            if addr >= info.end {
                continue;
            }
            let entry_addr = self.read_descriptor(addr);
            if entry_addr != 0 {
                state.entry_addr = entry_addr;
                return;
            }
        }
    }

    fn search_lib_matches(&self, name: &str) -> bool {
        self.search_libs.iter().any(|lib| lib == name)
    }

    /// Walks until `callback` accepts a symbol file, loading unknown
    /// entries along the way. Loaded entries are retained.
    fn for_each_symfile(&self, maps: &Maps, callback: impl Fn(&Arc<S>) -> bool) -> Option<Arc<S>> {
        // A single lock; this object is consulted too rarely for finer
        // grain to pay off.
        let mut state = lock(&self.state);
        if !state.initialized {
            self.init(&mut state, maps);
        }

        for entry in &state.entries {
            if callback(entry) {
                return Some(entry.clone());
            }
        }

        while state.entry_addr != 0 {
            let Some((next, symfile_addr, symfile_size)) = self.read_entry(state.entry_addr)
            else {
                state.entry_addr = 0;
                break;
            };
            state.seen += 1;
            if symfile_addr == 0 || state.seen > MAX_ENTRIES {
                // The descriptor looks corrupt; stop walking for good.
                warn!("{}: corrupt entry list", self.variable_name);
                state.entry_addr = 0;
                break;
            }
            state.entry_addr = next;

            let Some(entry) = S::load(
                maps,
                &self.memory,
                symfile_addr,
                symfile_size,
                self.dex_symbols.as_ref(),
            ) else {
                // Failed to load this symbol file; skip it.
                continue;
            };
            state.entries.push(entry.clone());
            if callback(&entry) {
                return Some(entry);
            }
        }
        None
    }
}

impl<L: JitLayout, S: Symfile> GlobalDebugInterface<S> for GlobalDebugImpl<L, S> {
    fn find(&self, maps: &Maps, pc: u64) -> Option<Arc<S>> {
        // If symbol files overlap in pc ranges, the first match wins.
        self.for_each_symfile(maps, |file| file.is_valid_pc(pc))
    }

    fn function_name(&self, maps: &Maps, pc: u64) -> Option<(SharedString, u64)> {
        let file = self.find(maps, pc)?;
        file.function_name(pc)
    }
}

fn create_catalog<S: Symfile + 'static>(
    memory: Arc<dyn Memory>,
    arch: Arch,
    search_libs: Vec<String>,
    variable_name: &'static str,
    dex_symbols: Option<Arc<dyn DexSymbols>>,
) -> Box<dyn GlobalDebugInterface<S>> {
    match arch {
        Arch::X86 => Box::new(GlobalDebugImpl::<JitCodeEntryX86, S>::new(
            memory,
            arch,
            search_libs,
            variable_name,
            dex_symbols,
        )),
        Arch::Arm | Arch::Mips32 => Box::new(GlobalDebugImpl::<JitCodeEntry32, S>::new(
            memory,
            arch,
            search_libs,
            variable_name,
            dex_symbols,
        )),
        Arch::Arm64 | Arch::X86_64 | Arch::Riscv64 | Arch::Mips64 => {
            Box::new(GlobalDebugImpl::<JitCodeEntry64, S>::new(
                memory,
                arch,
                search_libs,
                variable_name,
                dex_symbols,
            ))
        }
        _ => unreachable!("unhandled architecture"),
    }
}

fn default_search_libs() -> Vec<String> {
    DEFAULT_SEARCH_LIBS.iter().map(|s| s.to_string()).collect()
}

/// The catalog of in-memory ELFs for JIT-compiled code.
pub struct JitDebug {
    inner: Box<dyn GlobalDebugInterface<JitElf>>,
}

impl JitDebug {
    /// Creates a catalog reading `__jit_debug_descriptor` from the default
    /// ART modules.
    pub fn new(memory: Arc<dyn Memory>, arch: Arch) -> Self {
        Self::with_search_libs(memory, arch, default_search_libs())
    }

    /// Creates a catalog with a caller-supplied module allow-list.
    pub fn with_search_libs(
        memory: Arc<dyn Memory>,
        arch: Arch,
        search_libs: Vec<String>,
    ) -> Self {
        JitDebug {
            inner: create_catalog(memory, arch, search_libs, JIT_DEBUG_DESCRIPTOR, None),
        }
    }

    /// Finds the JIT module covering `pc` (unadjusted address space).
    pub fn find(&self, maps: &Maps, pc: u64) -> Option<Arc<JitElf>> {
        self.inner.find(maps, pc)
    }

    /// Resolves a JIT method name.
    pub fn function_name(&self, maps: &Maps, pc: u64) -> Option<(SharedString, u64)> {
        self.inner.function_name(maps, pc)
    }
}

/// The catalog of DEX files for interpreted code.
pub struct DexFiles {
    inner: Box<dyn GlobalDebugInterface<DexFile>>,
}

impl DexFiles {
    /// Creates a catalog reading `__dex_debug_descriptor`; without a
    /// symbolizer the files load but yield no names.
    pub fn new(
        memory: Arc<dyn Memory>,
        arch: Arch,
        dex_symbols: Option<Arc<dyn DexSymbols>>,
    ) -> Self {
        Self::with_search_libs(memory, arch, default_search_libs(), dex_symbols)
    }

    /// Creates a catalog with a caller-supplied module allow-list.
    pub fn with_search_libs(
        memory: Arc<dyn Memory>,
        arch: Arch,
        search_libs: Vec<String>,
        dex_symbols: Option<Arc<dyn DexSymbols>>,
    ) -> Self {
        DexFiles {
            inner: create_catalog(
                memory,
                arch,
                search_libs,
                DEX_DEBUG_DESCRIPTOR,
                dex_symbols,
            ),
        }
    }

    /// Finds the DEX file covering `pc`.
    pub fn find(&self, maps: &Maps, pc: u64) -> Option<Arc<DexFile>> {
        self.inner.find(maps, pc)
    }

    /// Resolves an interpreted method name.
    pub fn function_name(&self, maps: &Maps, pc: u64) -> Option<(SharedString, u64)> {
        self.inner.function_name(maps, pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBuffer;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(JitCodeEntryX86::DESCRIPTOR_SIZE, 16);
        assert_eq!(JitCodeEntryX86::ENTRY_SIZE, 20);
        assert_eq!(JitCodeEntry32::ENTRY_SIZE, 24);
        assert_eq!(JitCodeEntry64::DESCRIPTOR_SIZE, 24);
        assert_eq!(JitCodeEntry64::ENTRY_SIZE, 32);
    }

    #[test]
    fn test_x86_size_field_is_unaligned() {
        // symfile_size begins at offset 12 on x86, 16 on arm32.
        let mut buf = vec![0u8; 24];
        buf[12..20].copy_from_slice(&0x1234u64.to_le_bytes());
        let (_, _, size) = JitCodeEntryX86::entry_fields(&buf[..20]).unwrap();
        assert_eq!(size, 0x1234);

        let mut buf = vec![0u8; 24];
        buf[16..24].copy_from_slice(&0x5678u64.to_le_bytes());
        let (_, _, size) = JitCodeEntry32::entry_fields(&buf).unwrap();
        assert_eq!(size, 0x5678);
    }

    #[test]
    fn test_descriptor_version_check() {
        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(vec![0u8; 64]));
        let catalog = GlobalDebugImpl::<JitCodeEntry64, JitElf>::new(
            memory.clone(),
            Arch::Arm64,
            default_search_libs(),
            JIT_DEBUG_DESCRIPTOR,
            None,
        );
        // Version 0 descriptor: rejected.
        assert_eq!(catalog.read_descriptor(0), 0);

        let mut data = vec![0u8; 64];
        data[0..4].copy_from_slice(&1u32.to_le_bytes());
        data[16..24].copy_from_slice(&0xdead000u64.to_le_bytes());
        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(data));
        let catalog = GlobalDebugImpl::<JitCodeEntry64, JitElf>::new(
            memory,
            Arch::Arm64,
            default_search_libs(),
            JIT_DEBUG_DESCRIPTOR,
            None,
        );
        assert_eq!(catalog.read_descriptor(0), 0xdead000);
    }

    #[test]
    fn test_corrupt_entry_halts_walk() {
        // Descriptor at 0 pointing at an entry whose symfile_addr is zero.
        let mut data = vec![0u8; 0x100];
        data[0..4].copy_from_slice(&1u32.to_le_bytes());
        data[16..24].copy_from_slice(&0x40u64.to_le_bytes());
        // Entry at 0x40: next = 0x80, symfile_addr = 0.
        data[0x40..0x48].copy_from_slice(&0x80u64.to_le_bytes());
        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(data));

        let catalog = GlobalDebugImpl::<JitCodeEntry64, JitElf>::new(
            memory,
            Arch::Arm64,
            default_search_libs(),
            JIT_DEBUG_DESCRIPTOR,
            None,
        );
        let maps = Maps::new();
        {
            let mut state = lock(&catalog.state);
            state.initialized = true;
            state.entry_addr = 0x40;
        }
        assert!(catalog.for_each_symfile(&maps, |_| true).is_none());
        assert_eq!(lock(&catalog.state).entry_addr, 0);
    }
}
