//! The call-frame-instruction interpreter.
//!
//! Executes a CIE's initial instructions followed by an FDE's instructions,
//! advancing a virtual location counter until it passes the target pc, and
//! produces the row of register rules in effect there.

use log::debug;

use framewalk_common::Arch;

use super::encoding::*;
use super::memory::DwarfMemory;
use super::{DwarfError, DwarfErrorCode, DwarfFde, DwarfLocation, DwarfLocations, DwarfResult, CFA_REG};

/// Upper bound on executed instructions per row.
const MAX_ITERATIONS: usize = 10000;

/// Interprets the instructions of one FDE.
pub struct DwarfCfa<'a, 'm> {
    memory: &'a mut DwarfMemory<'m>,
    fde: &'a DwarfFde,
    arch: Arch,
    /// Load bias subtracted from decoded code addresses (`DW_CFA_set_loc`).
    pc_bias: u64,

    cur_pc: u64,
    row_start: u64,
    row_end: u64,
    state_stack: Vec<DwarfLocations>,
}

impl<'a, 'm> DwarfCfa<'a, 'm> {
    /// Creates an interpreter for `fde`.
    pub fn new(memory: &'a mut DwarfMemory<'m>, fde: &'a DwarfFde, arch: Arch, pc_bias: u64) -> Self {
        DwarfCfa {
            memory,
            fde,
            arch,
            pc_bias,
            cur_pc: 0,
            row_start: 0,
            row_end: 0,
            state_stack: Vec::new(),
        }
    }

    /// Builds the register-rule row in effect at `pc`.
    pub fn get_location_info(&mut self, pc: u64) -> DwarfResult<DwarfLocations> {
        let mut loc_regs = DwarfLocations::default();

        // The CIE's initial instructions set up the default state; the
        // snapshot feeds DW_CFA_restore.
        self.cur_pc = self.fde.pc_start;
        self.row_start = self.fde.pc_start;
        self.row_end = self.fde.pc_end;
        self.run(
            self.fde.cie.cfa_instructions_offset,
            self.fde.cie.cfa_instructions_end,
            u64::MAX,
            &mut loc_regs,
            None,
        )?;
        let initial = loc_regs.clone();

        self.cur_pc = self.fde.pc_start;
        self.row_start = self.fde.pc_start;
        self.row_end = self.fde.pc_end;
        self.run(
            self.fde.cfa_instructions_offset,
            self.fde.cfa_instructions_end,
            pc,
            &mut loc_regs,
            Some(&initial),
        )?;

        loc_regs.pc_start = self.row_start;
        loc_regs.pc_end = self.row_end;
        Ok(loc_regs)
    }

    /// Advances the location counter; returns false once the counter has
    /// moved past the target pc and the row is complete.
    fn advance(&mut self, delta: u64, pc: u64) -> bool {
        let new_pc = self.cur_pc.wrapping_add(delta);
        if new_pc > pc {
            self.row_end = new_pc;
            return false;
        }
        self.cur_pc = new_pc;
        self.row_start = new_pc;
        true
    }

    /// Moves the location counter to an absolute location.
    fn set_loc(&mut self, target: u64, pc: u64) -> bool {
        if target > pc {
            self.row_end = target;
            return false;
        }
        self.cur_pc = target;
        self.row_start = target;
        true
    }

    fn run(
        &mut self,
        start: u64,
        end: u64,
        pc: u64,
        loc_regs: &mut DwarfLocations,
        initial: Option<&DwarfLocations>,
    ) -> DwarfResult<()> {
        self.memory.set_cur_offset(start);
        let mut iterations = 0;
        while self.memory.cur_offset() < end {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(DwarfErrorCode::TooManyIterations.into());
            }

            let op = self.memory.read_u8()?;
            match op & 0xc0 {
                DW_CFA_ADVANCE_LOC => {
                    let delta = (op & 0x3f) as u64 * self.fde.cie.code_alignment_factor;
                    if !self.advance(delta, pc) {
                        return Ok(());
                    }
                    continue;
                }
                DW_CFA_OFFSET => {
                    let offset = self.memory.read_uleb128()? as i64;
                    let reg = (op & 0x3f) as u32;
                    loc_regs.set(
                        reg,
                        DwarfLocation::Offset(offset * self.fde.cie.data_alignment_factor),
                    );
                    continue;
                }
                DW_CFA_RESTORE => {
                    self.restore(loc_regs, initial, (op & 0x3f) as u32)?;
                    continue;
                }
                _ => {}
            }

            match op {
                DW_CFA_NOP => {}
                DW_CFA_SET_LOC => {
                    // The cursor resolves the encoded address into vaddr
                    // space; bring it into module-relative space.
                    let value = self
                        .memory
                        .read_encoded_value(self.fde.cie.fde_address_encoding)?;
                    let target = value.wrapping_sub(self.pc_bias);
                    if target < self.cur_pc {
                        return Err(DwarfErrorCode::IllegalState.into());
                    }
                    if !self.set_loc(target, pc) {
                        return Ok(());
                    }
                }
                DW_CFA_ADVANCE_LOC1 => {
                    let delta = self.memory.read_u8()? as u64;
                    if !self.advance(delta * self.fde.cie.code_alignment_factor, pc) {
                        return Ok(());
                    }
                }
                DW_CFA_ADVANCE_LOC2 => {
                    let delta = self.memory.read_u16()? as u64;
                    if !self.advance(delta * self.fde.cie.code_alignment_factor, pc) {
                        return Ok(());
                    }
                }
                DW_CFA_ADVANCE_LOC4 => {
                    let delta = self.memory.read_u32()? as u64;
                    if !self.advance(delta * self.fde.cie.code_alignment_factor, pc) {
                        return Ok(());
                    }
                }
                DW_CFA_OFFSET_EXTENDED => {
                    let reg = self.read_reg()?;
                    let offset = self.memory.read_uleb128()? as i64;
                    loc_regs.set(
                        reg,
                        DwarfLocation::Offset(offset * self.fde.cie.data_alignment_factor),
                    );
                }
                DW_CFA_OFFSET_EXTENDED_SF => {
                    let reg = self.read_reg()?;
                    let offset = self.memory.read_sleb128()?;
                    loc_regs.set(
                        reg,
                        DwarfLocation::Offset(offset * self.fde.cie.data_alignment_factor),
                    );
                }
                DW_CFA_RESTORE_EXTENDED => {
                    let reg = self.read_reg()?;
                    self.restore(loc_regs, initial, reg)?;
                }
                DW_CFA_UNDEFINED => {
                    let reg = self.read_reg()?;
                    loc_regs.set(reg, DwarfLocation::Undefined);
                }
                DW_CFA_SAME_VALUE => {
                    // Absence of a rule is same-value.
                    let reg = self.read_reg()?;
                    loc_regs.remove(reg);
                }
                DW_CFA_REGISTER => {
                    let reg = self.read_reg()?;
                    let source = self.read_reg()?;
                    loc_regs.set(
                        reg,
                        DwarfLocation::Register {
                            reg: source,
                            offset: 0,
                        },
                    );
                }
                DW_CFA_REMEMBER_STATE => {
                    self.state_stack.push(loc_regs.clone());
                }
                DW_CFA_RESTORE_STATE => {
                    let saved = self
                        .state_stack
                        .pop()
                        .ok_or_else(|| DwarfError::new(DwarfErrorCode::IllegalState))?;
                    *loc_regs = saved;
                }
                DW_CFA_DEF_CFA => {
                    let reg = self.read_reg()?;
                    let offset = self.memory.read_uleb128()? as i64;
                    loc_regs.set(CFA_REG, DwarfLocation::Register { reg, offset });
                }
                DW_CFA_DEF_CFA_SF => {
                    let reg = self.read_reg()?;
                    let offset = self.memory.read_sleb128()?;
                    loc_regs.set(
                        CFA_REG,
                        DwarfLocation::Register {
                            reg,
                            offset: offset * self.fde.cie.data_alignment_factor,
                        },
                    );
                }
                DW_CFA_DEF_CFA_REGISTER => {
                    let reg = self.read_reg()?;
                    let offset = match loc_regs.get(CFA_REG) {
                        Some(DwarfLocation::Register { offset, .. }) => *offset,
                        _ => return Err(DwarfErrorCode::IllegalState.into()),
                    };
                    loc_regs.set(CFA_REG, DwarfLocation::Register { reg, offset });
                }
                DW_CFA_DEF_CFA_OFFSET => {
                    let offset = self.memory.read_uleb128()? as i64;
                    let reg = match loc_regs.get(CFA_REG) {
                        Some(DwarfLocation::Register { reg, .. }) => *reg,
                        _ => return Err(DwarfErrorCode::IllegalState.into()),
                    };
                    loc_regs.set(CFA_REG, DwarfLocation::Register { reg, offset });
                }
                DW_CFA_DEF_CFA_OFFSET_SF => {
                    let offset =
                        self.memory.read_sleb128()? * self.fde.cie.data_alignment_factor;
                    let reg = match loc_regs.get(CFA_REG) {
                        Some(DwarfLocation::Register { reg, .. }) => *reg,
                        _ => return Err(DwarfErrorCode::IllegalState.into()),
                    };
                    loc_regs.set(CFA_REG, DwarfLocation::Register { reg, offset });
                }
                DW_CFA_DEF_CFA_EXPRESSION => {
                    let location = self.read_expression()?;
                    if let DwarfLocation::Expression { length, end_offset } = location {
                        loc_regs.set(
                            CFA_REG,
                            DwarfLocation::ValExpression { length, end_offset },
                        );
                    }
                }
                DW_CFA_EXPRESSION => {
                    let reg = self.read_reg()?;
                    let location = self.read_expression()?;
                    loc_regs.set(reg, location);
                }
                DW_CFA_VAL_EXPRESSION => {
                    let reg = self.read_reg()?;
                    if let DwarfLocation::Expression { length, end_offset } =
                        self.read_expression()?
                    {
                        loc_regs.set(
                            reg,
                            DwarfLocation::ValExpression { length, end_offset },
                        );
                    }
                }
                DW_CFA_VAL_OFFSET => {
                    let reg = self.read_reg()?;
                    let offset = self.memory.read_uleb128()? as i64;
                    loc_regs.set(
                        reg,
                        DwarfLocation::ValOffset(offset * self.fde.cie.data_alignment_factor),
                    );
                }
                DW_CFA_VAL_OFFSET_SF => {
                    let reg = self.read_reg()?;
                    let offset = self.memory.read_sleb128()?;
                    loc_regs.set(
                        reg,
                        DwarfLocation::ValOffset(offset * self.fde.cie.data_alignment_factor),
                    );
                }
                DW_CFA_AARCH64_NEGATE_RA_STATE => {
                    if self.arch != Arch::Arm64 {
                        return Err(DwarfErrorCode::NotImplemented.into());
                    }
                    // Return-address signing state. The pointer-auth mask on
                    // the register file strips the signature bits whenever
                    // the return address is used, so the toggle itself needs
                    // no rule.
                    debug!("DW_CFA_AARCH64_negate_ra_state at pc {:#x}", self.cur_pc);
                }
                DW_CFA_GNU_ARGS_SIZE => {
                    let _ = self.memory.read_uleb128()?;
                }
                DW_CFA_GNU_NEGATIVE_OFFSET_EXTENDED => {
                    let reg = self.read_reg()?;
                    let offset = self.memory.read_uleb128()? as i64;
                    loc_regs.set(reg, DwarfLocation::Offset(-offset));
                }
                _ => return Err(DwarfErrorCode::NotImplemented.into()),
            }
        }
        Ok(())
    }

    fn read_reg(&mut self) -> DwarfResult<u32> {
        let reg = self.memory.read_uleb128()?;
        u32::try_from(reg).map_err(|_| DwarfError::new(DwarfErrorCode::IllegalValue))
    }

    fn read_expression(&mut self) -> DwarfResult<DwarfLocation> {
        let length = self.memory.read_uleb128()?;
        let end_offset = self
            .memory
            .cur_offset()
            .checked_add(length)
            .ok_or_else(|| DwarfError::new(DwarfErrorCode::IllegalValue))?;
        self.memory.set_cur_offset(end_offset);
        Ok(DwarfLocation::Expression { length, end_offset })
    }

    fn restore(
        &mut self,
        loc_regs: &mut DwarfLocations,
        initial: Option<&DwarfLocations>,
        reg: u32,
    ) -> DwarfResult<()> {
        let Some(initial) = initial else {
            // Restore in CIE initial instructions has nothing to restore to.
            return Err(DwarfErrorCode::IllegalState.into());
        };
        match initial.get(reg) {
            Some(location) => loc_regs.set(reg, *location),
            None => loc_regs.remove(reg),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::DwarfCie;
    use crate::memory::MemoryBuffer;

    /// Builds an FDE covering `[0x1000, 0x2000)` whose CIE instructions are
    /// at `[0, cie_len)` of the buffer and FDE instructions follow.
    fn fde(cie_len: u64, total_len: u64) -> DwarfFde {
        DwarfFde {
            cie_offset: 0,
            cfa_instructions_offset: cie_len,
            cfa_instructions_end: total_len,
            pc_start: 0x1000,
            pc_end: 0x2000,
            lsda_address: 0,
            cie: DwarfCie {
                version: 1,
                return_address_register: 30,
                code_alignment_factor: 1,
                data_alignment_factor: -8,
                cfa_instructions_offset: 0,
                cfa_instructions_end: cie_len,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn location_info(cie: Vec<u8>, fde_ins: Vec<u8>, pc: u64) -> DwarfResult<DwarfLocations> {
        let cie_len = cie.len() as u64;
        let mut program = cie;
        program.extend_from_slice(&fde_ins);
        let total = program.len() as u64;
        let descriptor = fde(cie_len, total);
        let buffer = MemoryBuffer::new(program);
        let mut memory = DwarfMemory::new(&buffer, 8);
        let mut cfa = DwarfCfa::new(&mut memory, &descriptor, Arch::Arm64, 0);
        cfa.get_location_info(pc)
    }

    #[test]
    fn test_def_cfa_and_offset_rule() {
        // CIE: def_cfa r31+0; r30 at cfa-8 (offset factored by -8).
        let cie = vec![DW_CFA_DEF_CFA, 31, 0, DW_CFA_OFFSET | 30, 1];
        let row = location_info(cie, vec![], 0x1000).unwrap();
        assert_eq!(
            row.get(CFA_REG),
            Some(&DwarfLocation::Register { reg: 31, offset: 0 })
        );
        assert_eq!(row.get(30), Some(&DwarfLocation::Offset(-8)));
        assert_eq!(row.pc_start, 0x1000);
        assert_eq!(row.pc_end, 0x2000);
    }

    #[test]
    fn test_rows_advance_with_pc() {
        // FDE: at +0: cfa = r31+16; advance 8; cfa = r29+32.
        let cie = vec![DW_CFA_DEF_CFA, 31, 16];
        let ins = vec![DW_CFA_ADVANCE_LOC | 8, DW_CFA_DEF_CFA, 29, 32];

        let row = location_info(cie.clone(), ins.clone(), 0x1004).unwrap();
        assert_eq!(
            row.get(CFA_REG),
            Some(&DwarfLocation::Register { reg: 31, offset: 16 })
        );
        assert_eq!(row.pc_start, 0x1000);
        assert_eq!(row.pc_end, 0x1008);

        let row = location_info(cie, ins, 0x1008).unwrap();
        assert_eq!(
            row.get(CFA_REG),
            Some(&DwarfLocation::Register { reg: 29, offset: 32 })
        );
        assert_eq!(row.pc_start, 0x1008);
        assert_eq!(row.pc_end, 0x2000);
    }

    #[test]
    fn test_remember_restore_state() {
        let cie = vec![DW_CFA_DEF_CFA, 31, 16];
        let ins = vec![
            DW_CFA_REMEMBER_STATE,
            DW_CFA_DEF_CFA, 29, 32,
            DW_CFA_ADVANCE_LOC | 4,
            DW_CFA_RESTORE_STATE,
        ];
        let row = location_info(cie, ins, 0x1fff).unwrap();
        assert_eq!(
            row.get(CFA_REG),
            Some(&DwarfLocation::Register { reg: 31, offset: 16 })
        );
    }

    #[test]
    fn test_restore_state_on_empty_stack() {
        let cie = vec![DW_CFA_DEF_CFA, 31, 16];
        let ins = vec![DW_CFA_RESTORE_STATE];
        assert_eq!(
            location_info(cie, ins, 0x1fff).unwrap_err().code,
            DwarfErrorCode::IllegalState
        );
    }

    #[test]
    fn test_restore_uses_cie_rule() {
        // CIE gives r19 a rule; the FDE overrides then restores it.
        let cie = vec![DW_CFA_DEF_CFA, 31, 16, DW_CFA_OFFSET | 19, 2];
        let ins = vec![DW_CFA_UNDEFINED, 19, DW_CFA_RESTORE | 19];
        let row = location_info(cie, ins, 0x1fff).unwrap();
        assert_eq!(row.get(19), Some(&DwarfLocation::Offset(-16)));
    }

    #[test]
    fn test_same_value_removes_rule() {
        let cie = vec![DW_CFA_DEF_CFA, 31, 16, DW_CFA_OFFSET | 19, 2];
        let ins = vec![DW_CFA_SAME_VALUE, 19];
        let row = location_info(cie, ins, 0x1fff).unwrap();
        assert_eq!(row.get(19), None);
    }

    #[test]
    fn test_def_cfa_offset_without_register_rule() {
        let ins = vec![DW_CFA_DEF_CFA_OFFSET, 16];
        assert_eq!(
            location_info(vec![], ins, 0x1000).unwrap_err().code,
            DwarfErrorCode::IllegalState
        );
    }

    #[test]
    fn test_expression_rule_records_window() {
        // val_expression for r29 with a 3-byte program.
        let ins = vec![
            DW_CFA_DEF_CFA, 31, 0,
            DW_CFA_VAL_EXPRESSION, 29, 3, 0x11, 0x22, 0x33,
        ];
        let row = location_info(vec![], ins, 0x1000).unwrap();
        match row.get(29) {
            Some(DwarfLocation::ValExpression { length, end_offset }) => {
                assert_eq!(*length, 3);
                assert_eq!(*end_offset, 9);
            }
            other => panic!("unexpected location {other:?}"),
        }
    }

    #[test]
    fn test_unknown_opcode() {
        let ins = vec![0x3f];
        assert_eq!(
            location_info(vec![], ins, 0x1000).unwrap_err().code,
            DwarfErrorCode::NotImplemented
        );
    }
}
