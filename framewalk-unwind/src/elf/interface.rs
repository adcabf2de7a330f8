//! Class-aware parsing of ELF program and section tables.

use std::sync::Arc;

use scroll::Pread;

use goblin::elf::header::{
    EI_CLASS, EI_DATA, ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_386, EM_AARCH64, EM_ARM,
    EM_MIPS, EM_RISCV, EM_X86_64,
};
use goblin::elf::note::NT_GNU_BUILD_ID;
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_DYNAMIC, PT_GNU_EH_FRAME, PT_LOAD, PT_NOTE};
use goblin::elf::section_header::{SHT_DYNSYM, SHT_NOTE, SHT_PROGBITS, SHT_SYMTAB};

use framewalk_common::{Arch, SharedString};

use crate::dwarf::section::{DwarfSection, SectionGeometry, StepResult};
use crate::dwarf::{DwarfEhFrameWithHdr, DwarfError, DwarfErrorCode, DwarfResult};
use crate::memory::Memory;
use crate::regs::Regs;

use super::symbols::ElfSymbols;

/// arm32 exception-index table segment.
const PT_ARM_EXIDX: u32 = 0x7000_0001;

const DT_NULL: u64 = goblin::elf::dynamic::DT_NULL;
const DT_STRTAB: u64 = goblin::elf::dynamic::DT_STRTAB;
const DT_STRSZ: u64 = goblin::elf::dynamic::DT_STRSZ;
const DT_SONAME: u64 = goblin::elf::dynamic::DT_SONAME;

#[derive(Clone, Copy, Debug, Default)]
struct LoadSegment {
    offset: u64,
    vaddr: u64,
    memsz: u64,
    flags: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct VaddrRange {
    offset: u64,
    vaddr_start: u64,
    vaddr_end: u64,
}

impl VaddrRange {
    fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.vaddr_start && vaddr < self.vaddr_end
    }

    fn to_offset(&self, vaddr: u64) -> u64 {
        vaddr - self.vaddr_start + self.offset
    }
}

/// The parsed shape of one ELF image: segments, unwind sections, symbol
/// tables and notes, all referenced by file offset into the backing
/// memory.
pub struct ElfInterface {
    memory: Arc<dyn Memory>,
    is_64bit: bool,
    machine: u16,
    arch: Arch,
    load_bias: u64,

    pt_loads: Vec<LoadSegment>,
    note_windows: Vec<(u64, u64)>,
    dynamic: Option<VaddrRange>,
    data: Option<VaddrRange>,

    eh_frame_hdr_geometry: Option<SectionGeometry>,
    eh_frame_geometry: Option<SectionGeometry>,
    debug_frame_geometry: Option<SectionGeometry>,
    /// `(offset, size)` of an embedded XZ debug image.
    pub gnu_debugdata: Option<(u64, u64)>,
    /// arm32 exception index table, used for pc validity only.
    arm_exidx: Option<SectionGeometry>,

    symbols: Vec<ElfSymbols>,

    eh_frame_with_hdr: Option<DwarfEhFrameWithHdr>,
    eh_frame: Option<DwarfSection>,
    debug_frame: Option<DwarfSection>,
}

impl ElfInterface {
    /// Parses the image in `memory`. Returns `None` when the bytes are not
    /// a little-endian ELF of a supported machine.
    pub fn new(memory: Arc<dyn Memory>) -> Option<Self> {
        let mut ident = [0u8; 6];
        if !memory.read_fully(0, &mut ident) || &ident[..4] != ELFMAG {
            return None;
        }
        let is_64bit = match ident[EI_CLASS] {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            _ => return None,
        };
        if ident[EI_DATA] != ELFDATA2LSB {
            return None;
        }

        let machine = memory.read_u16(18)?;
        let arch = match machine {
            EM_ARM => Arch::Arm,
            EM_386 => Arch::X86,
            EM_X86_64 => Arch::X86_64,
            EM_AARCH64 => Arch::Arm64,
            EM_RISCV => Arch::Riscv64,
            EM_MIPS if is_64bit => Arch::Mips64,
            EM_MIPS => Arch::Mips32,
            _ => return None,
        };

        let mut interface = ElfInterface {
            memory,
            is_64bit,
            machine,
            arch,
            load_bias: 0,
            pt_loads: Vec::new(),
            note_windows: Vec::new(),
            dynamic: None,
            data: None,
            eh_frame_hdr_geometry: None,
            eh_frame_geometry: None,
            debug_frame_geometry: None,
            gnu_debugdata: None,
            arm_exidx: None,
            symbols: Vec::new(),
            eh_frame_with_hdr: None,
            eh_frame: None,
            debug_frame: None,
        };
        interface.read_program_headers();
        interface.read_section_headers();
        Some(interface)
    }

    /// The pointer size of the image in bytes.
    pub fn addr_size(&self) -> u8 {
        if self.is_64bit {
            8
        } else {
            4
        }
    }

    /// The machine field of the header.
    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// The architecture of the image.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The load bias of the first executable load segment.
    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    fn read_program_headers(&mut self) {
        let memory = self.memory.clone();
        let Some((phoff, phentsize, phnum)) = self.header_table(true) else {
            return;
        };

        let mut exec_bias_set = false;
        for index in 0..phnum {
            let offset = phoff + index as u64 * phentsize as u64;
            let mut buf = [0u8; 56];
            let size = if self.is_64bit { 56 } else { 32 };
            if !memory.read_fully(offset, &mut buf[..size]) {
                return;
            }
            let buf = &buf[..size];

            let p_type: u32 = buf.pread_with(0, scroll::LE).unwrap_or(0);
            let (p_flags, p_offset, p_vaddr, p_filesz, p_memsz) = if self.is_64bit {
                (
                    buf.pread_with::<u32>(4, scroll::LE).unwrap_or(0),
                    buf.pread_with::<u64>(8, scroll::LE).unwrap_or(0),
                    buf.pread_with::<u64>(16, scroll::LE).unwrap_or(0),
                    buf.pread_with::<u64>(32, scroll::LE).unwrap_or(0),
                    buf.pread_with::<u64>(40, scroll::LE).unwrap_or(0),
                )
            } else {
                (
                    buf.pread_with::<u32>(24, scroll::LE).unwrap_or(0),
                    buf.pread_with::<u32>(4, scroll::LE).unwrap_or(0) as u64,
                    buf.pread_with::<u32>(8, scroll::LE).unwrap_or(0) as u64,
                    buf.pread_with::<u32>(16, scroll::LE).unwrap_or(0) as u64,
                    buf.pread_with::<u32>(20, scroll::LE).unwrap_or(0) as u64,
                )
            };

            match p_type {
                PT_LOAD => {
                    self.pt_loads.push(LoadSegment {
                        offset: p_offset,
                        vaddr: p_vaddr,
                        memsz: p_memsz,
                        flags: p_flags,
                    });
                    if p_flags & PF_X != 0 && !exec_bias_set {
                        self.load_bias = p_vaddr.wrapping_sub(p_offset);
                        exec_bias_set = true;
                    }
                    if p_flags & (PF_R | PF_W) == PF_R | PF_W && self.data.is_none() {
                        self.data = Some(VaddrRange {
                            offset: p_offset,
                            vaddr_start: p_vaddr,
                            vaddr_end: p_vaddr.saturating_add(p_memsz),
                        });
                    }
                }
                PT_GNU_EH_FRAME => {
                    self.eh_frame_hdr_geometry = Some(SectionGeometry {
                        offset: p_offset,
                        size: p_filesz,
                        bias: p_vaddr.wrapping_sub(p_offset) as i64,
                    });
                }
                PT_DYNAMIC => {
                    self.dynamic = Some(VaddrRange {
                        offset: p_offset,
                        vaddr_start: p_vaddr,
                        vaddr_end: p_vaddr.saturating_add(p_memsz),
                    });
                }
                PT_NOTE => {
                    self.note_windows.push((p_offset, p_filesz));
                }
                PT_ARM_EXIDX if self.arch == Arch::Arm => {
                    self.arm_exidx = Some(SectionGeometry {
                        offset: p_offset,
                        size: p_filesz,
                        bias: p_vaddr.wrapping_sub(p_offset) as i64,
                    });
                }
                _ => {}
            }
        }
    }

    fn read_section_headers(&mut self) {
        let memory = self.memory.clone();
        let Some((shoff, shentsize, shnum)) = self.header_table(false) else {
            return;
        };
        let is_64bit = self.is_64bit;
        let shstrndx = memory.read_u16(if is_64bit { 62 } else { 50 }).unwrap_or(0);

        let read_shdr = |index: u16| -> Option<(u32, u32, u64, u64, u64, u32, u64)> {
            let offset = shoff + index as u64 * shentsize as u64;
            let mut buf = [0u8; 64];
            let size = if is_64bit { 64 } else { 40 };
            if !memory.read_fully(offset, &mut buf[..size]) {
                return None;
            }
            let buf = &buf[..size];
            let sh_name: u32 = buf.pread_with(0, scroll::LE).ok()?;
            let sh_type: u32 = buf.pread_with(4, scroll::LE).ok()?;
            if is_64bit {
                Some((
                    sh_name,
                    sh_type,
                    buf.pread_with::<u64>(16, scroll::LE).ok()?,
                    buf.pread_with::<u64>(24, scroll::LE).ok()?,
                    buf.pread_with::<u64>(32, scroll::LE).ok()?,
                    buf.pread_with::<u32>(40, scroll::LE).ok()?,
                    buf.pread_with::<u64>(56, scroll::LE).ok()?,
                ))
            } else {
                Some((
                    sh_name,
                    sh_type,
                    buf.pread_with::<u32>(12, scroll::LE).ok()? as u64,
                    buf.pread_with::<u32>(16, scroll::LE).ok()? as u64,
                    buf.pread_with::<u32>(20, scroll::LE).ok()? as u64,
                    buf.pread_with::<u32>(24, scroll::LE).ok()?,
                    buf.pread_with::<u32>(36, scroll::LE).ok()? as u64,
                ))
            }
        };

        let shstr = read_shdr(shstrndx);
        let name_of = |sh_name: u32| -> Option<String> {
            let (_, _, _, str_offset, str_size, _, _) = shstr?;
            if sh_name as u64 >= str_size {
                return None;
            }
            memory.read_string(str_offset + sh_name as u64, 128)
        };

        for index in 0..shnum {
            let Some((sh_name, sh_type, sh_addr, sh_offset, sh_size, sh_link, sh_entsize)) =
                read_shdr(index)
            else {
                continue;
            };

            match sh_type {
                SHT_SYMTAB | SHT_DYNSYM => {
                    let Some((_, _, _, str_offset, str_size, _, _)) = read_shdr(sh_link as u16)
                    else {
                        continue;
                    };
                    let symbols = ElfSymbols::new(
                        sh_offset,
                        sh_size,
                        sh_entsize,
                        str_offset,
                        str_size,
                        is_64bit,
                    );
                    // The full symbol table outranks the dynamic one.
                    if sh_type == SHT_SYMTAB {
                        self.symbols.insert(0, symbols);
                    } else {
                        self.symbols.push(symbols);
                    }
                }
                SHT_PROGBITS | SHT_NOTE => {
                    let Some(name) = name_of(sh_name) else {
                        continue;
                    };
                    let geometry = SectionGeometry {
                        offset: sh_offset,
                        size: sh_size,
                        bias: sh_addr.wrapping_sub(sh_offset) as i64,
                    };
                    match name.as_str() {
                        ".eh_frame_hdr" => {
                            self.eh_frame_hdr_geometry.get_or_insert(geometry);
                        }
                        ".eh_frame" => self.eh_frame_geometry = Some(geometry),
                        ".debug_frame" => self.debug_frame_geometry = Some(geometry),
                        ".gnu_debugdata" => self.gnu_debugdata = Some((sh_offset, sh_size)),
                        ".note.gnu.build-id" => self.note_windows.push((sh_offset, sh_size)),
                        ".ARM.exidx" => self.arm_exidx = Some(geometry),
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    /// Reads `(offset, entsize, num)` of the program (`phdr = true`) or
    /// section header table.
    fn header_table(&self, phdr: bool) -> Option<(u64, u16, u16)> {
        let memory = &self.memory;
        if self.is_64bit {
            let offset = memory.read_u64(if phdr { 0x20 } else { 0x28 })?;
            let entsize = memory.read_u16(if phdr { 54 } else { 58 })?;
            let num = memory.read_u16(if phdr { 56 } else { 60 })?;
            (offset != 0 && num != 0).then_some((offset, entsize, num))
        } else {
            let offset = memory.read_u32(if phdr { 0x1c } else { 0x20 })? as u64;
            let entsize = memory.read_u16(if phdr { 42 } else { 46 })?;
            let num = memory.read_u16(if phdr { 44 } else { 48 })?;
            (offset != 0 && num != 0).then_some((offset, entsize, num))
        }
    }

    /// Creates the DWARF section objects from the recorded geometry.
    pub fn init_headers(&mut self) {
        if let Some(hdr) = self.eh_frame_hdr_geometry {
            match DwarfEhFrameWithHdr::new(
                self.memory.clone(),
                hdr,
                self.eh_frame_geometry,
                self.arch,
                self.load_bias,
                self.addr_size(),
            ) {
                Ok(section) => self.eh_frame_with_hdr = Some(section),
                Err(_) => self.eh_frame_hdr_geometry = None,
            }
        }
        if self.eh_frame_with_hdr.is_none() {
            if let Some(geometry) = self.eh_frame_geometry {
                self.eh_frame = Some(DwarfSection::eh_frame(
                    self.memory.clone(),
                    geometry,
                    self.arch,
                    self.load_bias,
                    self.addr_size(),
                ));
            }
        }
        if let Some(geometry) = self.debug_frame_geometry {
            self.debug_frame = Some(DwarfSection::debug_frame(
                self.memory.clone(),
                geometry,
                self.arch,
                self.load_bias,
                self.addr_size(),
            ));
        }
    }

    /// Steps one frame using this image's CFI.
    ///
    /// `.debug_frame` is consulted first since it holds the most specific
    /// information, then `.eh_frame`.
    pub fn step(
        &mut self,
        pc: u64,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> DwarfResult<StepResult> {
        let mut first_error: Option<DwarfError> = None;

        if let Some(debug_frame) = self.debug_frame.as_mut() {
            match debug_frame.step(pc, regs, process_memory) {
                Ok(result) => return Ok(result),
                Err(err) => first_error = Some(err),
            }
        }
        if let Some(eh_frame) = self.eh_frame_with_hdr.as_mut() {
            match eh_frame.step(pc, regs, process_memory) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(eh_frame) = self.eh_frame.as_mut() {
            match eh_frame.step(pc, regs, process_memory) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| DwarfError::new(DwarfErrorCode::NoFdes)))
    }

    /// Resolves the function containing the virtual address `vaddr`.
    pub fn function_name(&self, vaddr: u64) -> Option<(SharedString, u64)> {
        for symbols in &self.symbols {
            if let Some(found) = symbols.get_name(vaddr, &*self.memory) {
                return Some(found);
            }
        }
        None
    }

    /// Finds the virtual address of a named global in the symbol tables.
    pub fn global_variable_vaddr(&self, name: &str) -> Option<u64> {
        for symbols in &self.symbols {
            if let Some(vaddr) = symbols.global_address(name, &*self.memory) {
                return Some(vaddr);
            }
        }
        None
    }

    /// Maps a global's virtual address to its file offset, accepting only
    /// addresses inside the data or dynamic segments.
    pub fn vaddr_to_global_offset(&self, vaddr: u64) -> Option<u64> {
        if let Some(range) = self.data.filter(|range| range.contains(vaddr)) {
            return Some(range.to_offset(vaddr));
        }
        if let Some(range) = self.dynamic.filter(|range| range.contains(vaddr)) {
            return Some(range.to_offset(vaddr));
        }
        None
    }

    /// Returns true if `rel_pc` lies inside an executable load segment or a
    /// CFI-covered range.
    pub fn is_valid_pc(&mut self, rel_pc: u64) -> bool {
        for load in &self.pt_loads {
            if load.flags & PF_X != 0
                && rel_pc >= load.offset
                && rel_pc < load.offset.saturating_add(load.memsz)
            {
                return true;
            }
        }
        if self.arm_exidx_covers(rel_pc) {
            return true;
        }
        if let Some(section) = self.debug_frame.as_mut() {
            if section.fde_from_pc(rel_pc).is_ok() {
                return true;
            }
        }
        if let Some(section) = self.eh_frame_with_hdr.as_mut() {
            if section.fde_from_pc(rel_pc).is_ok() {
                return true;
            }
        }
        if let Some(section) = self.eh_frame.as_mut() {
            if section.fde_from_pc(rel_pc).is_ok() {
                return true;
            }
        }
        false
    }

    /// Returns true if the arm exception index table covers `rel_pc`.
    ///
    /// Each entry's key is a prel31 reference to the function it covers;
    /// the table is sorted, so the first entry bounds the covered code from
    /// below and the last entry's enclosing executable segment bounds it
    /// from above.
    fn arm_exidx_covers(&self, rel_pc: u64) -> bool {
        let Some(exidx) = self.arm_exidx else {
            return false;
        };
        if exidx.size < 8 {
            return false;
        }
        let count = exidx.size / 8;

        let entry_fn = |index: u64| -> Option<u64> {
            let entry_offset = exidx.offset + index * 8;
            let key = self.memory.read_u32(entry_offset)?;
            let mut rel = (key & 0x7fff_ffff) as u64;
            if rel & 0x4000_0000 != 0 {
                // Sign extend the prel31 value.
                rel |= !0x7fff_ffffu64;
            }
            let entry_vaddr = entry_offset.wrapping_add(exidx.bias as u64);
            Some(entry_vaddr.wrapping_add(rel).wrapping_sub(self.load_bias))
        };

        let Some(first_fn) = entry_fn(0) else {
            return false;
        };
        let Some(last_fn) = entry_fn(count - 1) else {
            return false;
        };
        if rel_pc < first_fn {
            return false;
        }
        for load in &self.pt_loads {
            if load.flags & PF_X != 0
                && last_fn >= load.offset
                && last_fn < load.offset.saturating_add(load.memsz)
            {
                return rel_pc < load.offset.saturating_add(load.memsz);
            }
        }
        false
    }

    /// Reads the GNU build id note, searching all note windows.
    pub fn read_build_id(&self) -> Option<Vec<u8>> {
        for &(offset, size) in &self.note_windows {
            if let Some(id) = self.read_build_id_from_window(offset, size) {
                return Some(id);
            }
        }
        None
    }

    fn read_build_id_from_window(&self, offset: u64, size: u64) -> Option<Vec<u8>> {
        let end = offset.saturating_add(size);
        let mut cur = offset;
        while cur.checked_add(12).is_some_and(|header_end| header_end <= end) {
            let namesz = self.memory.read_u32(cur)? as u64;
            let descsz = self.memory.read_u32(cur + 4)? as u64;
            let n_type = self.memory.read_u32(cur + 8)?;
            let name_start = cur + 12;
            let desc_start = name_start.saturating_add((namesz + 3) & !3);
            let next = desc_start.saturating_add((descsz + 3) & !3);

            if n_type == NT_GNU_BUILD_ID && namesz == 4 {
                let mut name = [0u8; 4];
                if self.memory.read_fully(name_start, &mut name) && &name == b"GNU\0" {
                    let mut desc = vec![0u8; descsz as usize];
                    if self.memory.read_fully(desc_start, &mut desc) {
                        return Some(desc);
                    }
                    return None;
                }
            }
            if next <= cur {
                break;
            }
            cur = next;
        }
        None
    }

    /// Reads `DT_SONAME` from the dynamic segment.
    pub fn soname(&self) -> Option<String> {
        let dynamic = self.dynamic?;
        let entry_size = if self.is_64bit { 16 } else { 8 };

        let mut strtab_vaddr = None;
        let mut strsz = None;
        let mut soname_offset = None;

        let mut cur = dynamic.offset;
        let end = dynamic
            .offset
            .saturating_add(dynamic.vaddr_end - dynamic.vaddr_start);
        while cur.checked_add(entry_size).is_some_and(|entry_end| entry_end <= end) {
            let (tag, value) = if self.is_64bit {
                (self.memory.read_u64(cur)?, self.memory.read_u64(cur + 8)?)
            } else {
                (
                    self.memory.read_u32(cur)? as u64,
                    self.memory.read_u32(cur + 4)? as u64,
                )
            };
            cur += entry_size;
            match tag {
                DT_NULL => break,
                DT_STRTAB => strtab_vaddr = Some(value),
                DT_STRSZ => strsz = Some(value),
                DT_SONAME => soname_offset = Some(value),
                _ => {}
            }
        }

        let strtab_offset = self.vaddr_to_file_offset(strtab_vaddr?)?;
        let soname_offset = soname_offset?;
        let strsz = strsz?;
        if soname_offset >= strsz {
            return None;
        }
        self.memory
            .read_string(strtab_offset + soname_offset, (strsz - soname_offset) as usize)
    }

    /// Maps a virtual address to a file offset through the load segments.
    fn vaddr_to_file_offset(&self, vaddr: u64) -> Option<u64> {
        for load in &self.pt_loads {
            if vaddr >= load.vaddr && vaddr < load.vaddr.saturating_add(load.memsz) {
                return Some(vaddr - load.vaddr + load.offset);
            }
        }
        None
    }
}
