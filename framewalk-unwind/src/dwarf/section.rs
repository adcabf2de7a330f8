//! CFI sections: `.eh_frame`, `.eh_frame_hdr` and `.debug_frame`.
//!
//! Both section kinds hold the same CIE/FDE record stream; they differ in
//! the CIE marker value and in how an FDE names its CIE. The header variant
//! adds a binary-search table keyed by initial pc.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use super::cfa::DwarfCfa;
use super::encoding::*;
use super::memory::DwarfMemory;
use super::op::DwarfOp;
use super::{
    DwarfCie, DwarfError, DwarfErrorCode, DwarfFde, DwarfLocation, DwarfLocations, DwarfResult,
    CFA_REG,
};
use crate::memory::Memory;
use crate::regs::Regs;
use framewalk_common::Arch;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SectionKind {
    EhFrame,
    DebugFrame,
}

/// The geometry of a CFI section within its module.
#[derive(Clone, Copy, Debug, Default)]
pub struct SectionGeometry {
    /// File offset of the section data.
    pub offset: u64,
    /// Size of the section data in bytes.
    pub size: u64,
    /// The section's `vaddr - file_offset` delta.
    pub bias: i64,
}

/// A parsed CFI section with CIE, FDE and row caches.
pub struct DwarfSection {
    kind: SectionKind,
    memory: Arc<dyn Memory>,
    arch: Arch,
    addr_size: u8,
    entries_offset: u64,
    entries_end: u64,
    section_bias: i64,
    load_bias: u64,

    cie_cache: HashMap<u64, DwarfCie>,
    fde_index: Option<Vec<DwarfFde>>,
    /// Evaluated rows keyed by their exclusive end pc.
    loc_cache: BTreeMap<u64, DwarfLocations>,
}

/// An `.eh_frame` section.
pub type DwarfEhFrame = DwarfSection;
/// A `.debug_frame` section.
pub type DwarfDebugFrame = DwarfSection;

impl DwarfSection {
    /// Creates a view over an `.eh_frame` section.
    pub fn eh_frame(
        memory: Arc<dyn Memory>,
        geometry: SectionGeometry,
        arch: Arch,
        load_bias: u64,
        addr_size: u8,
    ) -> Self {
        Self::new(SectionKind::EhFrame, memory, geometry, arch, load_bias, addr_size)
    }

    /// Creates a view over a `.debug_frame` section.
    pub fn debug_frame(
        memory: Arc<dyn Memory>,
        geometry: SectionGeometry,
        arch: Arch,
        load_bias: u64,
        addr_size: u8,
    ) -> Self {
        Self::new(SectionKind::DebugFrame, memory, geometry, arch, load_bias, addr_size)
    }

    fn new(
        kind: SectionKind,
        memory: Arc<dyn Memory>,
        geometry: SectionGeometry,
        arch: Arch,
        load_bias: u64,
        addr_size: u8,
    ) -> Self {
        DwarfSection {
            kind,
            memory,
            arch,
            addr_size,
            entries_offset: geometry.offset,
            entries_end: geometry.offset.saturating_add(geometry.size),
            section_bias: geometry.bias,
            load_bias,
            cie_cache: HashMap::new(),
            fde_index: None,
            loc_cache: BTreeMap::new(),
        }
    }

    fn cursor(&self) -> DwarfMemory<'_> {
        let mut memory = DwarfMemory::new(&*self.memory, self.addr_size);
        memory.set_pcrel_bias(self.section_bias);
        memory
    }

    /// The marker distinguishing CIEs from FDEs, per entry width.
    fn cie_marker(&self, is_64bit: bool) -> u64 {
        match (self.kind, is_64bit) {
            (SectionKind::EhFrame, _) => 0,
            (SectionKind::DebugFrame, false) => u32::MAX as u64,
            (SectionKind::DebugFrame, true) => u64::MAX,
        }
    }

    /// Parses the CIE at `offset`, caching the result.
    pub fn get_cie(&mut self, offset: u64) -> DwarfResult<DwarfCie> {
        if let Some(cie) = self.cie_cache.get(&offset) {
            return Ok(cie.clone());
        }
        let cie = self.parse_cie(offset)?;
        self.cie_cache.insert(offset, cie.clone());
        Ok(cie)
    }

    fn parse_cie(&mut self, offset: u64) -> DwarfResult<DwarfCie> {
        let mut memory = self.cursor();
        memory.set_cur_offset(offset);
        let mut cie = DwarfCie::default();

        let (length, is_64bit) = read_entry_length(&mut memory)?;
        cie.cfa_instructions_end = memory.cur_offset().saturating_add(length);

        let id = if is_64bit {
            memory.read_u64()?
        } else {
            memory.read_u32()? as u64
        };
        if id != self.cie_marker(is_64bit) {
            return Err(DwarfErrorCode::IllegalValue.into());
        }

        cie.version = memory.read_u8()?;
        if !matches!(cie.version, 1 | 3 | 4 | 5) {
            return Err(DwarfErrorCode::UnsupportedVersion.into());
        }

        loop {
            let ch = memory.read_u8()?;
            if ch == 0 {
                break;
            }
            cie.augmentation.push(ch);
        }

        if cie.version >= 4 {
            // Address size and segment size.
            let address_size = memory.read_u8()?;
            if address_size != self.addr_size {
                return Err(DwarfErrorCode::IllegalValue.into());
            }
            cie.segment_size = memory.read_u8()?;
        }

        cie.code_alignment_factor = memory.read_uleb128()?;
        cie.data_alignment_factor = memory.read_sleb128()?;
        cie.return_address_register = if cie.version == 1 {
            memory.read_u8()? as u64
        } else {
            memory.read_uleb128()?
        };

        if cie.augmentation.first() == Some(&b'z') {
            let aug_length = memory.read_uleb128()?;
            let aug_start = memory.cur_offset();
            cie.cfa_instructions_offset = aug_start.saturating_add(aug_length);

            for &ch in &cie.augmentation.clone()[1..] {
                match ch {
                    b'L' => cie.lsda_encoding = memory.read_u8()?,
                    b'P' => {
                        let encoding = memory.read_u8()?;
                        // The personality routine is not needed to unwind.
                        memory.read_encoded_value(encoding)?;
                    }
                    b'R' => cie.fde_address_encoding = memory.read_u8()?,
                    b'S' => cie.is_signal_frame = true,
                    // An unknown augmentation stops parsing; the length
                    // field still lets us skip the data.
                    _ => break,
                }
            }
        } else {
            cie.cfa_instructions_offset = memory.cur_offset();
        }
        Ok(cie)
    }

    /// Parses the FDE at `offset`.
    pub fn get_fde_from_offset(&mut self, offset: u64) -> DwarfResult<DwarfFde> {
        let (mut fde, cie_offset) = {
            let mut memory = self.cursor();
            memory.set_cur_offset(offset);
            let mut fde = DwarfFde::default();

            let (length, is_64bit) = read_entry_length(&mut memory)?;
            fde.cfa_instructions_end = memory.cur_offset().saturating_add(length);

            let id_offset = memory.cur_offset();
            let id = if is_64bit {
                memory.read_u64()?
            } else {
                memory.read_u32()? as u64
            };
            if id == self.cie_marker(is_64bit) {
                // This is a CIE, not an FDE.
                return Err(DwarfErrorCode::IllegalValue.into());
            }

            let cie_offset = match self.kind {
                // The CIE pointer counts back from its own field.
                SectionKind::EhFrame => id_offset
                    .checked_sub(id)
                    .ok_or_else(|| DwarfError::new(DwarfErrorCode::IllegalValue))?,
                // The CIE pointer is a section offset.
                SectionKind::DebugFrame => self.entries_offset.saturating_add(id),
            };
            fde.cie_offset = cie_offset;
            (fde, cie_offset)
        };

        fde.cie = self.get_cie(cie_offset)?;

        let mut memory = self.cursor();
        memory.set_cur_offset(offset);
        let (length, is_64bit) = read_entry_length(&mut memory)?;
        let _ = length;
        // Skip the id field again.
        memory.set_cur_offset(memory.cur_offset() + if is_64bit { 8 } else { 4 });

        if fde.cie.segment_size != 0 {
            memory.set_cur_offset(memory.cur_offset() + fde.cie.segment_size as u64);
        }

        let pc_start = memory.read_encoded_value(fde.cie.fde_address_encoding)?;
        let pc_range = memory.read_encoded_value(fde.cie.fde_address_encoding & 0x0f)?;
        // Decoded addresses are virtual; bring them into module-relative
        // space.
        fde.pc_start = pc_start.wrapping_sub(self.load_bias);
        fde.pc_end = fde.pc_start.wrapping_add(pc_range);

        if fde.cie.augmentation.first() == Some(&b'z') {
            let aug_length = memory.read_uleb128()?;
            let aug_start = memory.cur_offset();
            if fde.cie.lsda_encoding != DW_EH_PE_OMIT && aug_length != 0 {
                memory.set_func_offset(fde.pc_start);
                fde.lsda_address = memory.read_encoded_value(fde.cie.lsda_encoding)?;
            }
            fde.cfa_instructions_offset = aug_start.saturating_add(aug_length);
        } else {
            fde.cfa_instructions_offset = memory.cur_offset();
        }

        if fde.cfa_instructions_offset > fde.cfa_instructions_end {
            return Err(DwarfErrorCode::IllegalValue.into());
        }
        Ok(fde)
    }

    /// Iterates all entries, populating the FDE index and the CIE cache.
    fn build_fde_index(&mut self) -> DwarfResult<()> {
        if self.fde_index.is_some() {
            return Ok(());
        }
        let mut fdes = Vec::new();
        let mut cur = self.entries_offset;

        while cur.checked_add(4).is_some_and(|end| end <= self.entries_end) {
            let mut memory = self.cursor();
            memory.set_cur_offset(cur);
            let (length, is_64bit) = match read_entry_length(&mut memory) {
                Ok(pair) => pair,
                Err(_) => break,
            };
            if length == 0 {
                // Zero terminator.
                break;
            }
            let next = memory.cur_offset().saturating_add(length);

            let id = if is_64bit {
                memory.read_u64().unwrap_or(u64::MAX)
            } else {
                memory.read_u32().unwrap_or(u32::MAX) as u64
            };
            if id == self.cie_marker(is_64bit) {
                // Cache the CIE while we are here; failures surface later
                // if an FDE actually references it.
                let _ = self.get_cie(cur);
            } else if let Ok(fde) = self.get_fde_from_offset(cur) {
                fdes.push(fde);
            }

            if next <= cur {
                break;
            }
            cur = next;
        }

        fdes.sort_by_key(|fde| fde.pc_start);
        self.fde_index = Some(fdes);
        Ok(())
    }

    /// Finds the FDE covering `pc`.
    pub fn fde_from_pc(&mut self, pc: u64) -> DwarfResult<DwarfFde> {
        self.build_fde_index()?;
        let fdes = self.fde_index.as_ref().unwrap();
        if fdes.is_empty() {
            return Err(DwarfErrorCode::NoFdes.into());
        }

        let index = fdes.partition_point(|fde| fde.pc_start <= pc);
        if index > 0 {
            let fde = &fdes[index - 1];
            if pc < fde.pc_end {
                return Ok(fde.clone());
            }
        }
        // Ranges can overlap in broken producers; fall back to a scan.
        for fde in fdes.iter() {
            if pc >= fde.pc_start && pc < fde.pc_end {
                return Ok(fde.clone());
            }
        }
        Err(DwarfErrorCode::NoFdes.into())
    }

    /// Builds the register-rule row for `pc` within `fde`.
    pub fn get_cfa_location_info(&mut self, pc: u64, fde: &DwarfFde) -> DwarfResult<DwarfLocations> {
        let mut memory = self.cursor();
        let mut cfa = DwarfCfa::new(&mut memory, fde, self.arch, self.load_bias);
        let mut row = cfa.get_location_info(pc)?;
        row.return_address_register = fde.cie.return_address_register;
        row.is_signal_frame = fde.cie.is_signal_frame;
        Ok(row)
    }

    /// Steps one frame: finds the row for `pc`, evaluates it against `regs`.
    ///
    /// Returns `finished = true` when the row marks the end of the stack.
    pub fn step(
        &mut self,
        pc: u64,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> DwarfResult<StepResult> {
        let cached = self
            .loc_cache
            .range((Bound::Excluded(pc), Bound::Unbounded))
            .next()
            .filter(|(_, row)| row.pc_start <= pc)
            .map(|(_, row)| row.clone());

        let row = match cached {
            Some(row) => row,
            None => {
                let fde = self.fde_from_pc(pc)?;
                let row = self.get_cfa_location_info(pc, &fde)?;
                self.loc_cache.insert(row.pc_end, row.clone());
                row
            }
        };

        let finished = self.eval(&row, regs, process_memory)?;
        Ok(StepResult {
            finished,
            is_signal_frame: row.is_signal_frame,
        })
    }

    fn eval_expression(
        &self,
        length: u64,
        end_offset: u64,
        regs: &dyn Regs,
        process_memory: &dyn Memory,
        cfa: Option<u64>,
    ) -> DwarfResult<u64> {
        let start = end_offset
            .checked_sub(length)
            .ok_or_else(|| DwarfError::new(DwarfErrorCode::IllegalValue))?;
        let mut memory = self.cursor();
        let view = |reg: u32| regs.get(reg as u16);
        let mut op = DwarfOp::new(
            &mut memory,
            process_memory,
            &view,
            regs.arch().word_mask(),
        );
        let initial: Vec<u64> = cfa.into_iter().collect();
        op.eval(start, end_offset, &initial)
    }

    /// Executes a row against the register snapshot.
    fn eval(
        &self,
        row: &DwarfLocations,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> DwarfResult<bool> {
        // 1. The CFA.
        let cfa = match row.get(CFA_REG) {
            Some(DwarfLocation::Register { reg, offset }) => {
                let value = regs
                    .get(*reg as u16)
                    .ok_or_else(|| DwarfError::new(DwarfErrorCode::IllegalValue))?;
                value.wrapping_add(*offset as u64)
            }
            Some(DwarfLocation::ValExpression { length, end_offset }) => {
                self.eval_expression(*length, *end_offset, regs, process_memory, None)?
            }
            Some(_) => return Err(DwarfErrorCode::IllegalValue.into()),
            None => return Err(DwarfErrorCode::CfaNotDefined.into()),
        };

        // A zero CFA is the end-of-stack sentinel.
        if cfa == 0 {
            return Ok(true);
        }

        // 2. Register rules, all evaluated against the pre-step values.
        let total_regs = regs.total_regs();
        let mut updates: Vec<(u16, u64)> = Vec::with_capacity(row.len());
        let mut return_address_undefined = false;
        for (&reg, location) in row.iter() {
            if reg == CFA_REG {
                continue;
            }
            if reg >= total_regs as u32 {
                continue;
            }
            let reg = reg as u16;
            match location {
                DwarfLocation::Undefined => {
                    if reg as u64 == row.return_address_register {
                        return_address_undefined = true;
                    }
                }
                DwarfLocation::Offset(offset) => {
                    let addr = cfa.wrapping_add(*offset as u64);
                    let value = read_pointer(process_memory, addr, self.addr_size)
                        .ok_or_else(|| DwarfError::memory_invalid(addr))?;
                    updates.push((reg, value));
                }
                DwarfLocation::ValOffset(offset) => {
                    updates.push((reg, cfa.wrapping_add(*offset as u64)));
                }
                DwarfLocation::Register { reg: source, offset } => {
                    let value = regs
                        .get(*source as u16)
                        .ok_or_else(|| DwarfError::new(DwarfErrorCode::IllegalValue))?;
                    updates.push((reg, value.wrapping_add(*offset as u64)));
                }
                DwarfLocation::Expression { length, end_offset } => {
                    let addr = self.eval_expression(
                        *length,
                        *end_offset,
                        regs,
                        process_memory,
                        Some(cfa),
                    )?;
                    let value = read_pointer(process_memory, addr, self.addr_size)
                        .ok_or_else(|| DwarfError::memory_invalid(addr))?;
                    updates.push((reg, value));
                }
                DwarfLocation::ValExpression { length, end_offset } => {
                    let value = self.eval_expression(
                        *length,
                        *end_offset,
                        regs,
                        process_memory,
                        Some(cfa),
                    )?;
                    updates.push((reg, value));
                }
            }
        }

        for (reg, value) in updates {
            regs.set(reg, value);
        }

        // 3. The return-address column becomes the new pc; an undefined
        // rule there terminates the unwind.
        if return_address_undefined {
            regs.set_pc(0);
        } else {
            let ra = regs
                .get(row.return_address_register as u16)
                .unwrap_or(0);
            let mask = regs.pac_mask();
            regs.set_pc(ra & !mask);
        }
        regs.set_sp(cfa);

        Ok(regs.pc() == 0)
    }
}

/// The outcome of a successful CFI step.
#[derive(Clone, Copy, Debug)]
pub struct StepResult {
    /// The row marked the end of the stack.
    pub finished: bool,
    /// The row came from a signal-frame CIE.
    pub is_signal_frame: bool,
}

fn read_pointer(memory: &dyn Memory, addr: u64, addr_size: u8) -> Option<u64> {
    match addr_size {
        4 => memory.read_u32(addr).map(u64::from),
        _ => memory.read_u64(addr),
    }
}

/// Reads the `length` field of a CIE/FDE, handling the 64-bit escape.
fn read_entry_length(memory: &mut DwarfMemory<'_>) -> DwarfResult<(u64, bool)> {
    let length = memory.read_u32()?;
    if length == u32::MAX {
        Ok((memory.read_u64()?, true))
    } else {
        Ok((length as u64, false))
    }
}

/// An `.eh_frame_hdr` lookup table in front of an `.eh_frame` section.
pub struct DwarfEhFrameWithHdr {
    /// The underlying `.eh_frame`, used for record parsing and as the
    /// fallback scanner when the header's count is zero.
    eh_frame: DwarfSection,
    /// Virtual address of the header (datarel base).
    hdr_vaddr: u64,
    table_encoding: u8,
    table_offset: u64,
    table_entry_size: u64,
    fde_count: u64,
    load_bias: u64,
    hdr_bias: i64,
}

impl DwarfEhFrameWithHdr {
    /// Parses the header at `hdr` and wires it to the `.eh_frame` data.
    ///
    /// When the `.eh_frame` geometry is unknown (in-memory modules located
    /// via `PT_GNU_EH_FRAME` only), it is derived from the header's
    /// `eh_frame_ptr` field.
    pub fn new(
        memory: Arc<dyn Memory>,
        hdr: SectionGeometry,
        eh_frame: Option<SectionGeometry>,
        arch: Arch,
        load_bias: u64,
        addr_size: u8,
    ) -> DwarfResult<Self> {
        let mut cursor = DwarfMemory::new(&*memory, addr_size);
        cursor.set_pcrel_bias(hdr.bias);
        cursor.set_data_offset(hdr.offset.wrapping_add(hdr.bias as u64));
        cursor.set_cur_offset(hdr.offset);

        let version = cursor.read_u8()?;
        if version != 1 {
            return Err(DwarfErrorCode::UnsupportedVersion.into());
        }
        let eh_frame_ptr_encoding = cursor.read_u8()?;
        let fde_count_encoding = cursor.read_u8()?;
        let table_encoding = cursor.read_u8()?;

        let eh_frame_ptr = cursor.read_encoded_value(eh_frame_ptr_encoding)?;
        let fde_count = if fde_count_encoding == DW_EH_PE_OMIT {
            0
        } else {
            cursor.read_encoded_value(fde_count_encoding)?
        };
        let table_offset = cursor.cur_offset();
        let table_entry_size = cursor.encoded_size(table_encoding).unwrap_or(0) * 2;

        let eh_frame_geometry = eh_frame.unwrap_or_else(|| SectionGeometry {
            // Derive the file offset from the pointer's virtual address,
            // assuming the same mapping delta as the header.
            offset: eh_frame_ptr.wrapping_sub(hdr.bias as u64),
            size: u64::MAX,
            bias: hdr.bias,
        });

        Ok(DwarfEhFrameWithHdr {
            eh_frame: DwarfSection::eh_frame(memory, eh_frame_geometry, arch, load_bias, addr_size),
            hdr_vaddr: hdr.offset.wrapping_add(hdr.bias as u64),
            table_encoding,
            table_offset,
            table_entry_size,
            fde_count,
            load_bias,
            hdr_bias: hdr.bias,
        })
    }

    fn cursor(&self) -> DwarfMemory<'_> {
        let mut memory = DwarfMemory::new(&*self.eh_frame.memory, self.eh_frame.addr_size);
        memory.set_pcrel_bias(self.hdr_bias);
        memory.set_data_offset(self.hdr_vaddr);
        memory
    }

    /// Reads table entry `index`: `(initial_pc, fde_offset)`, both in
    /// module-relative / file space.
    fn table_entry(&self, index: u64) -> DwarfResult<(u64, u64)> {
        let mut cursor = self.cursor();
        let offset = index
            .checked_mul(self.table_entry_size)
            .and_then(|delta| self.table_offset.checked_add(delta))
            .ok_or_else(|| DwarfError::new(DwarfErrorCode::IllegalValue))?;
        cursor.set_cur_offset(offset);
        let initial_pc = cursor
            .read_encoded_value(self.table_encoding)?
            .wrapping_sub(self.load_bias);
        let fde_vaddr = cursor.read_encoded_value(self.table_encoding)?;
        let fde_offset = fde_vaddr.wrapping_sub(self.eh_frame.section_bias as u64);
        Ok((initial_pc, fde_offset))
    }

    /// Finds the FDE covering `pc` via the search table, falling back to a
    /// record scan when the table is empty.
    pub fn fde_from_pc(&mut self, pc: u64) -> DwarfResult<DwarfFde> {
        if self.fde_count == 0 || self.table_entry_size == 0 {
            // A valid-looking header with no usable table; scan records.
            return self.eh_frame.fde_from_pc(pc);
        }

        let mut first = 0u64;
        let mut last = self.fde_count;
        let mut found: Option<u64> = None;
        while first < last {
            let current = (first + last) / 2;
            let (initial_pc, fde_offset) = self.table_entry(current)?;
            if pc == initial_pc {
                found = Some(fde_offset);
                break;
            }
            if pc < initial_pc {
                last = current;
            } else {
                first = current + 1;
            }
        }
        let fde_offset = match found {
            Some(offset) => offset,
            None => {
                if last == 0 {
                    return Err(DwarfErrorCode::NoFdes.into());
                }
                self.table_entry(last - 1)?.1
            }
        };

        let fde = self.eh_frame.get_fde_from_offset(fde_offset)?;
        if pc < fde.pc_start || pc >= fde.pc_end {
            return Err(DwarfErrorCode::NoFdes.into());
        }
        Ok(fde)
    }

    /// Steps one frame through the header's table.
    pub fn step(
        &mut self,
        pc: u64,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> DwarfResult<StepResult> {
        let cached = self
            .eh_frame
            .loc_cache
            .range((Bound::Excluded(pc), Bound::Unbounded))
            .next()
            .filter(|(_, row)| row.pc_start <= pc)
            .map(|(_, row)| row.clone());

        let row = match cached {
            Some(row) => row,
            None => {
                let fde = self.fde_from_pc(pc)?;
                let row = self.eh_frame.get_cfa_location_info(pc, &fde)?;
                self.eh_frame.loc_cache.insert(row.pc_end, row.clone());
                row
            }
        };

        let finished = self.eh_frame.eval(&row, regs, process_memory)?;
        Ok(StepResult {
            finished,
            is_signal_frame: row.is_signal_frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBuffer;
    use crate::regs::{Regs, RegsX86_64};

    /// Appends a CIE for x86-64 (`zR`, absptr FDE encoding, RA column 16)
    /// with `def_cfa rsp+8; offset r16, cfa-8` initial instructions.
    fn push_cie(out: &mut Vec<u8>) -> u64 {
        let start = out.len() as u64;
        let body: Vec<u8> = vec![
            1,                     // version
            b'z', b'R', 0,         // augmentation
            1,                     // code alignment
            0x78,                  // data alignment (-8)
            16,                    // return address register
            1,                     // augmentation length
            DW_EH_PE_ABSPTR,       // fde encoding
            DW_CFA_DEF_CFA, 7, 8,
            DW_CFA_OFFSET | 16, 1,
            DW_CFA_NOP, DW_CFA_NOP,
        ];
        out.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // CIE id
        out.extend_from_slice(&body);
        start
    }

    /// Appends an FDE covering `[pc_start, pc_start + pc_range)` bound to
    /// the CIE at `cie_offset` (section-relative).
    fn push_fde(out: &mut Vec<u8>, cie_offset: u64, pc_start: u64, pc_range: u64) -> u64 {
        let start = out.len() as u64;
        let mut body: Vec<u8> = Vec::new();
        body.extend_from_slice(&pc_start.to_le_bytes());
        body.extend_from_slice(&pc_range.to_le_bytes());
        body.push(0); // augmentation length
        body.extend_from_slice(&[DW_CFA_NOP; 3]);

        out.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        // The CIE pointer counts back from its own field.
        let id_field = start + 4;
        out.extend_from_slice(&((id_field - cie_offset) as u32).to_le_bytes());
        out.extend_from_slice(&body);
        start
    }

    fn eh_frame_section(data: Vec<u8>) -> DwarfSection {
        let size = data.len() as u64;
        DwarfSection::eh_frame(
            Arc::new(MemoryBuffer::new(data)),
            SectionGeometry {
                offset: 0,
                size,
                bias: 0,
            },
            Arch::X86_64,
            0,
            8,
        )
    }

    #[test]
    fn test_eh_frame_fde_lookup() {
        let mut data = Vec::new();
        let cie = push_cie(&mut data);
        push_fde(&mut data, cie, 0x1000, 0x100);
        push_fde(&mut data, cie, 0x1100, 0x100);
        let mut section = eh_frame_section(data);

        let fde = section.fde_from_pc(0x1000).unwrap();
        assert_eq!(fde.pc_start, 0x1000);
        assert_eq!(fde.pc_end, 0x1100);
        assert_eq!(fde.cie.return_address_register, 16);
        assert_eq!(fde.cie.data_alignment_factor, -8);

        let fde = section.fde_from_pc(0x11ff).unwrap();
        assert_eq!(fde.pc_start, 0x1100);

        assert!(section.fde_from_pc(0xfff).is_err());
        assert!(section.fde_from_pc(0x1200).is_err());
    }

    #[test]
    fn test_debug_frame_cie_marker() {
        // A debug_frame CIE uses the all-ones marker and a section-relative
        // CIE pointer in its FDEs.
        let mut data = Vec::new();
        let body: Vec<u8> = vec![
            1, 0, // version, empty augmentation
            1, 0x78, 16, // alignments, ra
            DW_CFA_DEF_CFA, 7, 8,
        ];
        data.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        data.extend_from_slice(&u32::MAX.to_le_bytes());
        data.extend_from_slice(&body);

        let fde_start = data.len();
        let mut body: Vec<u8> = Vec::new();
        body.extend_from_slice(&0x2000u64.to_le_bytes());
        body.extend_from_slice(&0x80u64.to_le_bytes());
        body.push(DW_CFA_NOP);
        data.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // CIE at section offset 0
        data.extend_from_slice(&body);
        let _ = fde_start;

        let size = data.len() as u64;
        let mut section = DwarfSection::debug_frame(
            Arc::new(MemoryBuffer::new(data)),
            SectionGeometry {
                offset: 0,
                size,
                bias: 0,
            },
            Arch::X86_64,
            0,
            8,
        );
        let fde = section.fde_from_pc(0x2040).unwrap();
        assert_eq!(fde.pc_start, 0x2000);
        assert_eq!(fde.pc_end, 0x2080);
    }

    #[test]
    fn test_step_evaluates_row() {
        let mut data = Vec::new();
        let cie = push_cie(&mut data);
        push_fde(&mut data, cie, 0x1000, 0x100);
        let mut section = eh_frame_section(data);

        // Stack: the return address sits at the stack pointer.
        let mut stack = vec![0u8; 0x40];
        stack[..8].copy_from_slice(&0x1150u64.to_le_bytes());
        let process = crate::memory::MemoryOfflineBuffer::new(stack, 0x7000);

        let mut regs = RegsX86_64::new();
        regs.set_pc(0x1010);
        regs.set_sp(0x7000);
        regs.set(12, 77);

        let result = section.step(0x1010, &mut regs, &process).unwrap();
        assert!(!result.finished);
        assert_eq!(regs.pc(), 0x1150);
        assert_eq!(regs.sp(), 0x7008);
        // Registers without a rule in the row keep their values.
        assert_eq!(regs.get(12), Some(77));
    }

    #[test]
    fn test_step_zero_return_address_finishes() {
        let mut data = Vec::new();
        let cie = push_cie(&mut data);
        push_fde(&mut data, cie, 0x1000, 0x100);
        let mut section = eh_frame_section(data);

        let stack = vec![0u8; 0x40];
        let process = crate::memory::MemoryOfflineBuffer::new(stack, 0x7000);

        let mut regs = RegsX86_64::new();
        regs.set_pc(0x1010);
        regs.set_sp(0x7000);

        let result = section.step(0x1010, &mut regs, &process).unwrap();
        assert!(result.finished);
        assert_eq!(regs.pc(), 0);
    }

    #[test]
    fn test_step_memory_error_carries_address() {
        let mut data = Vec::new();
        let cie = push_cie(&mut data);
        push_fde(&mut data, cie, 0x1000, 0x100);
        let mut section = eh_frame_section(data);

        // No readable stack at all.
        let process = MemoryBuffer::new(vec![]);
        let mut regs = RegsX86_64::new();
        regs.set_pc(0x1010);
        regs.set_sp(0x7000);

        let err = section.step(0x1010, &mut regs, &process).unwrap_err();
        assert_eq!(err.code, DwarfErrorCode::MemoryInvalid);
        assert_eq!(err.address, 0x7000);
    }

    #[test]
    fn test_undefined_pc_rule_terminates() {
        // An FDE whose instructions mark the return address undefined.
        let mut data = Vec::new();
        let cie = push_cie(&mut data);
        let fde_pos = data.len();
        let mut body: Vec<u8> = Vec::new();
        body.extend_from_slice(&0x1000u64.to_le_bytes());
        body.extend_from_slice(&0x100u64.to_le_bytes());
        body.push(0);
        body.extend_from_slice(&[DW_CFA_UNDEFINED, 16]);
        data.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        data.extend_from_slice(&((fde_pos as u64 + 4 - cie) as u32).to_le_bytes());
        data.extend_from_slice(&body);

        let mut section = eh_frame_section(data);
        let process = MemoryBuffer::new(vec![0; 0x40]);
        let mut regs = RegsX86_64::new();
        regs.set_pc(0x1010);
        regs.set_sp(0x20);

        let result = section.step(0x1010, &mut regs, &process).unwrap();
        assert!(result.finished);
        assert_eq!(regs.pc(), 0);
    }

    #[test]
    fn test_row_cache_is_reused() {
        let mut data = Vec::new();
        let cie = push_cie(&mut data);
        push_fde(&mut data, cie, 0x1000, 0x100);
        let mut section = eh_frame_section(data);

        let mut stack = vec![0u8; 0x40];
        stack[..8].copy_from_slice(&0x1020u64.to_le_bytes());
        stack[8..16].copy_from_slice(&0x1040u64.to_le_bytes());
        let process = crate::memory::MemoryOfflineBuffer::new(stack, 0x7000);

        let mut regs = RegsX86_64::new();
        regs.set_pc(0x1010);
        regs.set_sp(0x7000);
        section.step(0x1010, &mut regs, &process).unwrap();
        assert_eq!(section.loc_cache.len(), 1);

        // A second pc in the same row hits the cache instead of reparsing.
        section.step(0x1020, &mut regs, &process).unwrap();
        assert_eq!(section.loc_cache.len(), 1);
        assert_eq!(regs.pc(), 0x1040);
    }

    fn push_hdr(out: &mut Vec<u8>, hdr_offset: u64, entries: &[(i32, i32)], count_override: Option<u32>) {
        assert_eq!(out.len() as u64, hdr_offset);
        out.push(1); // version
        out.push(DW_EH_PE_PCREL | DW_EH_PE_SDATA4); // eh_frame_ptr encoding
        out.push(DW_EH_PE_UDATA4); // fde count encoding
        out.push(DW_EH_PE_DATAREL | DW_EH_PE_SDATA4); // table encoding
        // eh_frame_ptr: unused when the geometry is known; point past the
        // header anyway.
        out.extend_from_slice(&16i32.to_le_bytes());
        let count = count_override.unwrap_or(entries.len() as u32);
        out.extend_from_slice(&count.to_le_bytes());
        for &(pc, fde) in entries {
            out.extend_from_slice(&pc.to_le_bytes());
            out.extend_from_slice(&fde.to_le_bytes());
        }
    }

    #[test]
    fn test_eh_frame_hdr_binary_search() {
        // eh_frame first, then the header table at a known offset.
        let mut data = Vec::new();
        let cie = push_cie(&mut data);
        let fde0 = push_fde(&mut data, cie, 0x1000, 0x100);
        let fde1 = push_fde(&mut data, cie, 0x1100, 0x100);
        let fde2 = push_fde(&mut data, cie, 0x1200, 0x100);
        let eh_frame_size = data.len() as u64;

        let hdr_offset = (data.len() as u64 + 0xf) & !0xf;
        data.resize(hdr_offset as usize, 0);
        // datarel values are relative to the header's address (bias 0).
        let entries: Vec<(i32, i32)> = [(0x1000, fde0), (0x1100, fde1), (0x1200, fde2)]
            .iter()
            .map(|&(pc, fde)| (pc - hdr_offset as i32, fde as i32 - hdr_offset as i32))
            .collect();
        push_hdr(&mut data, hdr_offset, &entries, None);
        let hdr_size = data.len() as u64 - hdr_offset;

        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(data));
        let mut with_hdr = DwarfEhFrameWithHdr::new(
            memory,
            SectionGeometry {
                offset: hdr_offset,
                size: hdr_size,
                bias: 0,
            },
            Some(SectionGeometry {
                offset: 0,
                size: eh_frame_size,
                bias: 0,
            }),
            Arch::X86_64,
            0,
            8,
        )
        .unwrap();

        // The pc at the exact first instruction of an FDE resolves.
        let fde = with_hdr.fde_from_pc(0x1100).unwrap();
        assert_eq!(fde.pc_start, 0x1100);

        let fde = with_hdr.fde_from_pc(0x12ff).unwrap();
        assert_eq!(fde.pc_start, 0x1200);

        assert!(with_hdr.fde_from_pc(0xfff).is_err());
        assert!(with_hdr.fde_from_pc(0x1300).is_err());
    }

    #[test]
    fn test_eh_frame_hdr_zero_count_falls_back_to_scan() {
        let mut data = Vec::new();
        let cie = push_cie(&mut data);
        push_fde(&mut data, cie, 0x1000, 0x100);
        let eh_frame_size = data.len() as u64;

        let hdr_offset = (data.len() as u64 + 0xf) & !0xf;
        data.resize(hdr_offset as usize, 0);
        push_hdr(&mut data, hdr_offset, &[], Some(0));
        let hdr_size = data.len() as u64 - hdr_offset;

        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(data));
        let mut with_hdr = DwarfEhFrameWithHdr::new(
            memory,
            SectionGeometry {
                offset: hdr_offset,
                size: hdr_size,
                bias: 0,
            },
            Some(SectionGeometry {
                offset: 0,
                size: eh_frame_size,
                bias: 0,
            }),
            Arch::X86_64,
            0,
            8,
        )
        .unwrap();

        let fde = with_hdr.fde_from_pc(0x1050).unwrap();
        assert_eq!(fde.pc_start, 0x1000);
    }
}
