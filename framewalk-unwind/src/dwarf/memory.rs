//! A decoding cursor over a [`Memory`].
//!
//! CFI data is parsed straight out of the module's memory, so the cursor
//! reads scalars, LEB128 values and DWARF-encoded pointers at a running
//! offset rather than borrowing a slice.

use byteorder::{ByteOrder, LittleEndian};

use super::encoding::*;
use super::{DwarfError, DwarfResult};
use crate::memory::Memory;

/// A cursor over CFI bytes with DWARF pointer-encoding support.
///
/// Encoded pcrel/datarel pointers resolve into the module's virtual address
/// space: `pcrel_bias` is the section's `vaddr - file_offset` delta so the
/// cursor can convert its own file position into a virtual address, and
/// `data_offset` is the virtual address the datarel base refers to.
pub struct DwarfMemory<'a> {
    memory: &'a dyn Memory,
    cur_offset: u64,
    addr_size: u8,
    pcrel_bias: i64,
    data_offset: u64,
    func_offset: u64,
}

impl<'a> DwarfMemory<'a> {
    /// Creates a cursor reading `memory` with the given address size.
    pub fn new(memory: &'a dyn Memory, addr_size: u8) -> Self {
        DwarfMemory {
            memory,
            cur_offset: 0,
            addr_size,
            pcrel_bias: 0,
            data_offset: 0,
            func_offset: 0,
        }
    }

    /// The current read offset.
    pub fn cur_offset(&self) -> u64 {
        self.cur_offset
    }

    /// Moves the cursor to `offset`.
    pub fn set_cur_offset(&mut self, offset: u64) {
        self.cur_offset = offset;
    }

    /// The configured pointer size in bytes.
    pub fn addr_size(&self) -> u8 {
        self.addr_size
    }

    /// Sets the pointer size in bytes.
    pub fn set_addr_size(&mut self, addr_size: u8) {
        self.addr_size = addr_size;
    }

    /// Sets the section's `vaddr - file_offset` delta for pcrel decoding.
    pub fn set_pcrel_bias(&mut self, bias: i64) {
        self.pcrel_bias = bias;
    }

    /// Sets the virtual address used as the datarel base.
    pub fn set_data_offset(&mut self, offset: u64) {
        self.data_offset = offset;
    }

    /// Sets the virtual address used as the funcrel base.
    pub fn set_func_offset(&mut self, offset: u64) {
        self.func_offset = offset;
    }

    fn read_raw(&mut self, dst: &mut [u8]) -> DwarfResult<()> {
        if !self.memory.read_fully(self.cur_offset, dst) {
            return Err(DwarfError::memory_invalid(self.cur_offset));
        }
        self.cur_offset += dst.len() as u64;
        Ok(())
    }

    /// Reads one byte.
    pub fn read_u8(&mut self) -> DwarfResult<u8> {
        let mut buf = [0u8; 1];
        self.read_raw(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> DwarfResult<u16> {
        let mut buf = [0u8; 2];
        self.read_raw(&mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> DwarfResult<u32> {
        let mut buf = [0u8; 4];
        self.read_raw(&mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> DwarfResult<u64> {
        let mut buf = [0u8; 8];
        self.read_raw(&mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    /// Reads a pointer-sized little-endian value.
    pub fn read_address(&mut self) -> DwarfResult<u64> {
        match self.addr_size {
            4 => Ok(self.read_u32()? as u64),
            _ => self.read_u64(),
        }
    }

    /// Reads an unsigned LEB128 value.
    pub fn read_uleb128(&mut self) -> DwarfResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                value |= u64::from(byte & 0x7f) << shift;
            }
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Reads a signed LEB128 value.
    pub fn read_sleb128(&mut self) -> DwarfResult<i64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                value |= u64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    // Sign extend.
                    value |= u64::MAX << shift;
                }
                return Ok(value as i64);
            }
        }
    }

    /// The number of bytes an encoded value of this format occupies, or
    /// `None` for variable-length formats.
    pub fn encoded_size(&self, encoding: u8) -> Option<u64> {
        match encoding & 0x0f {
            DW_EH_PE_ABSPTR => Some(self.addr_size as u64),
            DW_EH_PE_UDATA2 | DW_EH_PE_SDATA2 => Some(2),
            DW_EH_PE_UDATA4 | DW_EH_PE_SDATA4 => Some(4),
            DW_EH_PE_UDATA8 | DW_EH_PE_SDATA8 => Some(8),
            _ => None,
        }
    }

    /// Reads a DWARF-encoded pointer and applies its base.
    ///
    /// The result is in the module's virtual address space (for pcrel and
    /// datarel forms) or the raw value (absptr).
    pub fn read_encoded_value(&mut self, encoding: u8) -> DwarfResult<u64> {
        if encoding == DW_EH_PE_OMIT {
            return Ok(0);
        }
        if encoding & DW_EH_PE_INDIRECT != 0 {
            return Err(DwarfError::new(super::DwarfErrorCode::NotImplemented));
        }

        if encoding & 0x70 == DW_EH_PE_ALIGNED {
            let align = self.addr_size as u64;
            self.cur_offset = self
                .cur_offset
                .saturating_add(align - 1)
                & !(align - 1);
            return self.read_address();
        }

        let value_offset = self.cur_offset;
        let value = match encoding & 0x0f {
            DW_EH_PE_ABSPTR => self.read_address()?,
            DW_EH_PE_ULEB128 => self.read_uleb128()?,
            DW_EH_PE_SLEB128 => self.read_sleb128()? as u64,
            DW_EH_PE_UDATA2 => self.read_u16()? as u64,
            DW_EH_PE_SDATA2 => self.read_u16()? as i16 as i64 as u64,
            DW_EH_PE_UDATA4 => self.read_u32()? as u64,
            DW_EH_PE_SDATA4 => self.read_u32()? as i32 as i64 as u64,
            DW_EH_PE_UDATA8 | DW_EH_PE_SDATA8 => self.read_u64()?,
            _ => return Err(DwarfError::new(super::DwarfErrorCode::IllegalValue)),
        };

        let value = match encoding & 0x70 {
            DW_EH_PE_PCREL => {
                // The base is the virtual address of the value's own bytes.
                value.wrapping_add(value_offset.wrapping_add(self.pcrel_bias as u64))
            }
            DW_EH_PE_DATAREL => value.wrapping_add(self.data_offset),
            DW_EH_PE_FUNCREL => value.wrapping_add(self.func_offset),
            DW_EH_PE_TEXTREL => {
                return Err(DwarfError::new(super::DwarfErrorCode::NotImplemented))
            }
            _ => value,
        };
        Ok(value)
    }
}
