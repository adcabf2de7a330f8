//! A view over one ELF module of the target.
//!
//! An [`Elf`] wraps the memory its image lives in (file mapping, target
//! memory range, or a union of both for split mappings), the parsed
//! interface over that memory, and an optional nested interface built from
//! XZ-decompressed `.gnu_debugdata` bytes.

use std::sync::{Arc, Mutex};

use goblin::elf::header::{EI_CLASS, ELFCLASS32, ELFMAG};

use framewalk_common::{Arch, SharedString};

use crate::dwarf::section::StepResult;
use crate::dwarf::DwarfError;
use crate::error::{Error, ErrorCode};
use crate::map_info::{lock, MapInfo};
use crate::memory::{Memory, MemoryXz};
use crate::regs::Regs;

mod interface;
mod symbols;

pub use interface::ElfInterface;
pub use symbols::ElfSymbols;

/// One loaded module.
///
/// Construction never fails: an image that does not parse stays around as
/// an invalid `Elf` so the module's name and addresses can still be
/// reported and construction is not retried.
pub struct Elf {
    memory: Option<Arc<dyn Memory>>,
    valid: bool,
    load_bias: u64,
    interface: Option<Mutex<ElfInterface>>,
    gnu_debugdata_interface: Option<Mutex<ElfInterface>>,
    last_error: Mutex<Error>,
}

impl Elf {
    /// Wraps the given backing memory. Call [`Elf::init`] before use.
    pub fn new(memory: Option<Box<dyn Memory>>) -> Self {
        Elf {
            memory: memory.map(Arc::from),
            valid: false,
            load_bias: 0,
            interface: None,
            gnu_debugdata_interface: None,
            last_error: Mutex::new(Error::default()),
        }
    }

    /// Parses the image; on success the module becomes valid.
    pub fn init(&mut self) {
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let Some(mut interface) = ElfInterface::new(memory) else {
            return;
        };
        interface.init_headers();
        self.load_bias = interface.load_bias();
        self.valid = true;

        self.init_gnu_debugdata(&interface);
        self.interface = Some(Mutex::new(interface));
    }

    /// Builds the nested interface from `.gnu_debugdata`, when present.
    fn init_gnu_debugdata(&mut self, interface: &ElfInterface) {
        let Some((offset, size)) = interface.gnu_debugdata else {
            return;
        };
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let Some(xz) = MemoryXz::new(memory, offset, size, "gnu_debugdata") else {
            return;
        };
        let xz: Arc<dyn Memory> = Arc::new(xz);
        let Some(mut nested) = ElfInterface::new(xz) else {
            return;
        };
        nested.init_headers();
        self.gnu_debugdata_interface = Some(Mutex::new(nested));
    }

    /// Marks the module invalid (e.g. on an architecture mismatch).
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.interface = None;
        self.gnu_debugdata_interface = None;
    }

    /// Returns true if the image parsed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The architecture of the image.
    pub fn arch(&self) -> Option<Arch> {
        let interface = self.interface.as_ref()?;
        Some(lock(interface).arch())
    }

    /// The machine field of the image's header.
    pub fn machine(&self) -> Option<u16> {
        let interface = self.interface.as_ref()?;
        Some(lock(interface).machine())
    }

    /// The backing memory of the image.
    pub fn memory(&self) -> Option<Arc<dyn Memory>> {
        self.memory.clone()
    }

    /// The load bias of the image.
    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// The error recorded by the most recent failed step.
    pub fn last_error(&self) -> Error {
        *lock(&self.last_error)
    }

    /// Converts an absolute pc into module-relative space.
    pub fn rel_pc(&self, pc: u64, map_info: &MapInfo) -> u64 {
        pc.wrapping_sub(map_info.start)
            .wrapping_add(self.load_bias)
            .wrapping_add(map_info.elf_offset())
    }

    /// Recognizes a signal trampoline at `rel_pc` and reloads `regs` from
    /// the signal frame if it matches.
    pub fn step_if_signal_handler(
        &self,
        rel_pc: u64,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> bool {
        regs.step_if_signal_handler(rel_pc, self, process_memory)
    }

    /// Steps one frame using the module's CFI, preferring the primary
    /// image and falling back to the `.gnu_debugdata` image.
    pub fn step(
        &self,
        rel_pc: u64,
        regs: &mut dyn Regs,
        process_memory: &dyn Memory,
    ) -> Result<StepResult, Error> {
        if !self.valid {
            let err = Error::new(ErrorCode::InvalidElf);
            *lock(&self.last_error) = err;
            return Err(err);
        }

        let mut first_error: Option<DwarfError> = None;
        if let Some(interface) = self.interface.as_ref() {
            match lock(interface).step(rel_pc, regs, process_memory) {
                Ok(result) => return Ok(result),
                Err(err) => first_error = Some(err),
            }
        }
        if let Some(interface) = self.gnu_debugdata_interface.as_ref() {
            match lock(interface).step(rel_pc, regs, process_memory) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        let err = first_error
            .map(Error::from)
            .unwrap_or_else(|| Error::new(ErrorCode::UnwindInfoMissing));
        *lock(&self.last_error) = err;
        Err(err)
    }

    /// Resolves the function containing `rel_pc` and its offset.
    pub fn function_name(&self, rel_pc: u64) -> Option<(SharedString, u64)> {
        if !self.valid {
            return None;
        }
        let vaddr = rel_pc.wrapping_add(self.load_bias);
        if let Some(interface) = self.interface.as_ref() {
            if let Some(found) = lock(interface).function_name(vaddr) {
                return Some(found);
            }
        }
        if let Some(interface) = self.gnu_debugdata_interface.as_ref() {
            if let Some(found) = lock(interface).function_name(vaddr) {
                return Some(found);
            }
        }
        None
    }

    /// Returns true if `rel_pc` points at code this module can own.
    pub fn is_valid_pc(&self, rel_pc: u64) -> bool {
        if !self.valid {
            return false;
        }
        if let Some(interface) = self.interface.as_ref() {
            if lock(interface).is_valid_pc(rel_pc) {
                return true;
            }
        }
        if let Some(interface) = self.gnu_debugdata_interface.as_ref() {
            if lock(interface).is_valid_pc(rel_pc) {
                return true;
            }
        }
        false
    }

    /// Returns the file offset of a named global variable.
    ///
    /// The symbol's virtual address is accepted only when it falls inside
    /// the data or dynamic segment, and is translated through that
    /// segment's file mapping.
    pub fn global_variable_offset(&self, name: &str) -> Option<u64> {
        if !self.valid {
            return None;
        }
        let interface = self.interface.as_ref()?;
        let interface = lock(interface);

        let mut vaddr = interface.global_variable_vaddr(name).or_else(|| {
            let nested = self.gnu_debugdata_interface.as_ref()?;
            lock(nested).global_variable_vaddr(name)
        })?;

        if interface.arch() == Arch::Arm64 {
            // Strip tag bits the compiler may have placed on the address.
            vaddr &= 0x00ff_ffff_ffff_ffff;
        }
        vaddr = vaddr.wrapping_sub(self.load_bias);
        interface.vaddr_to_global_offset(vaddr)
    }

    /// Reads the GNU build id of the image.
    pub fn build_id(&self) -> Option<Vec<u8>> {
        let interface = self.interface.as_ref()?;
        lock(interface).read_build_id()
    }

    /// Reads `DT_SONAME` of the image.
    pub fn soname(&self) -> Option<String> {
        let interface = self.interface.as_ref()?;
        lock(interface).soname()
    }

    /// Returns true if `memory` starts with an ELF header.
    pub fn is_valid_image(memory: &dyn Memory) -> bool {
        let mut ident = [0u8; 4];
        memory.read_fully(0, &mut ident) && &ident == ELFMAG
    }

    /// Returns the apparent file size of the ELF in `memory`: the end of
    /// its section-header table. `None` when the bytes are not an ELF.
    pub fn image_size(memory: &dyn Memory) -> Option<u64> {
        if !Self::is_valid_image(memory) {
            return None;
        }
        let class = memory.read_u8(EI_CLASS as u64)?;
        let (shoff, shentsize, shnum) = if class == ELFCLASS32 {
            (
                memory.read_u32(0x20)? as u64,
                memory.read_u16(46)? as u64,
                memory.read_u16(48)? as u64,
            )
        } else {
            (
                memory.read_u64(0x28)?,
                memory.read_u16(58)? as u64,
                memory.read_u16(60)? as u64,
            )
        };
        Some(shoff + shentsize * shnum)
    }

    /// Reads only enough of the image to compute its load bias.
    pub fn read_load_bias(memory: Box<dyn Memory>) -> Option<u64> {
        let interface = ElfInterface::new(Arc::from(memory))?;
        Some(interface.load_bias())
    }

    /// Reads the build id of the image without constructing a full module.
    pub fn read_build_id(memory: Box<dyn Memory>) -> Option<Vec<u8>> {
        let interface = ElfInterface::new(Arc::from(memory))?;
        interface.read_build_id()
    }
}
