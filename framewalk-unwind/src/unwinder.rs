//! The unwind driver.
//!
//! Repeatedly attributes the pc to a module, records a frame, and steps to
//! the caller: signal-trampoline recognition first, then CFI, then the
//! architecture's last-resort stepper, and finally the return-address
//! register as a speculative guess whose frames are withdrawn if they lead
//! nowhere.

use std::sync::Arc;

use framewalk_common::SharedString;

use crate::elf::Elf;
use crate::error::{Error, ErrorCode};
use crate::jit::{DexFiles, JitDebug, Symfile};
use crate::map_info::MapInfo;
use crate::maps::{basename, Maps, MAPS_FLAGS_DEVICE_MAP, MAPS_FLAGS_JIT_SYMFILE_MAP};
use crate::memory::Memory;
use crate::regs::Regs;

/// One reconstructed call frame.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    /// Index of the frame, starting at zero for the crash point.
    pub num: usize,
    /// The program counter, adjusted to point into the call instruction
    /// for frames past the first.
    pub pc: u64,
    /// The module-relative program counter.
    pub rel_pc: u64,
    /// The stack pointer.
    pub sp: u64,
    /// First address of the owning mapping; zero when unmapped.
    pub map_start: u64,
    /// First address past the owning mapping.
    pub map_end: u64,
    /// File offset of the owning mapping.
    pub map_offset: u64,
    /// File offset of the ELF header backing the mapping; non-zero for
    /// embedded (APK) and split modules.
    pub map_elf_start_offset: u64,
    /// Protection and marker flags of the mapping.
    pub map_flags: u16,
    /// Name of the owning module, possibly rewritten to `apk!soname`.
    pub map_name: SharedString,
    /// The symbolic function name, when resolved.
    pub function_name: SharedString,
    /// Offset of the pc within the named function.
    pub function_offset: u64,
    /// Set when the frame was reconstructed from a signal trampoline.
    pub is_signal_frame: bool,
    /// The owning mapping, kept for build-id display.
    pub map_info: Option<Arc<MapInfo>>,
}

/// Knobs for one unwind.
#[derive(Clone, Debug)]
pub struct UnwindOptions {
    /// Hard cap on reconstructed frames.
    pub max_frames: usize,
    /// Resolve symbolic names; when false frames carry only addresses.
    pub resolve_names: bool,
    /// Advisory to the formatter: append `(BuildId: ..)` to each line.
    pub display_build_id: bool,
    /// Rewrite embedded modules as `container!soname`.
    pub embedded_soname: bool,
    /// Module basenames whose initial frames are not recorded.
    pub initial_map_names_to_skip: Vec<String>,
    /// Module name suffixes at which the unwind stops outright.
    pub map_suffixes_to_ignore: Vec<String>,
}

impl Default for UnwindOptions {
    fn default() -> Self {
        UnwindOptions {
            max_frames: 512,
            resolve_names: true,
            display_build_id: false,
            embedded_soname: true,
            initial_map_names_to_skip: Vec::new(),
            map_suffixes_to_ignore: Vec::new(),
        }
    }
}

/// The driver: steps frames until a termination condition is met.
///
/// The register file is consumed; callers clone it first if they want to
/// replay the unwind.
pub struct Unwinder<'a> {
    maps: &'a Maps,
    regs: &'a mut dyn Regs,
    process_memory: Arc<dyn Memory>,
    jit_debug: Option<&'a JitDebug>,
    dex_files: Option<&'a DexFiles>,
    frames: Vec<Frame>,
    last_error: Error,
}

impl<'a> Unwinder<'a> {
    /// Creates a driver over the target's state.
    pub fn new(maps: &'a Maps, regs: &'a mut dyn Regs, process_memory: Arc<dyn Memory>) -> Self {
        Unwinder {
            maps,
            regs,
            process_memory,
            jit_debug: None,
            dex_files: None,
            frames: Vec::new(),
            last_error: Error::default(),
        }
    }

    /// Attaches the JIT code catalog.
    pub fn set_jit_debug(&mut self, jit_debug: &'a JitDebug) {
        self.jit_debug = Some(jit_debug);
    }

    /// Attaches the DEX file catalog. Without it, interpreter frames
    /// render as `<unknown>`.
    pub fn set_dex_files(&mut self, dex_files: &'a DexFiles) {
        self.dex_files = Some(dex_files);
    }

    /// The frames recorded by the last unwind.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The number of frames recorded by the last unwind.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// The error that ended the last unwind, if any.
    pub fn last_error(&self) -> Error {
        self.last_error
    }

    /// Runs the unwind loop.
    pub fn unwind(&mut self, options: &UnwindOptions) {
        self.frames.clear();
        self.last_error = Error::default();

        let arch = self.regs.arch();
        let mut adjust_pc = false;
        let mut return_address_attempt = false;

        while self.frames.len() < options.max_frames {
            let map_info = self.maps.find(self.regs.pc()).cloned();

            let mut elf: Option<Arc<Elf>> = None;
            let mut jit_elf = None;
            let mut rel_pc = self.regs.pc();
            let mut step_pc = self.regs.pc();
            let mut pc_adjustment = 0;

            match map_info.as_ref() {
                Some(info) => {
                    if should_stop(&options.map_suffixes_to_ignore, &info.name) {
                        break;
                    }
                    let module = info.elf(self.maps, &self.process_memory, arch);
                    rel_pc = module.rel_pc(self.regs.pc(), info);
                    // Everything except jit symfile maps steps with the
                    // relative pc.
                    if info.flags & MAPS_FLAGS_JIT_SYMFILE_MAP == 0 {
                        step_pc = rel_pc;
                    }
                    if adjust_pc {
                        pc_adjustment = self.regs.pc_adjustment(rel_pc, &module);
                    }
                    step_pc = step_pc.wrapping_sub(pc_adjustment);

                    // If the pc is in an invalid elf, the code may have been
                    // generated at runtime; ask the jit catalog.
                    if !module.is_valid() {
                        if let Some(jit_debug) = self.jit_debug {
                            let jit_pc = self.regs.pc().wrapping_sub(pc_adjustment);
                            if let Some(found) = jit_debug.find(self.maps, jit_pc) {
                                step_pc = jit_pc;
                                jit_elf = Some(found);
                            }
                        }
                    }
                    elf = Some(module);
                }
                None => {
                    self.last_error = Error::new(ErrorCode::InvalidMap);
                }
            }

            let skip_frame = self.frames.is_empty()
                && map_info.as_ref().is_some_and(|info| {
                    options
                        .initial_map_names_to_skip
                        .iter()
                        .any(|skip| skip == basename(&info.name))
                });
            if !skip_frame {
                self.fill_frame(
                    options,
                    map_info.as_ref(),
                    elf.as_deref(),
                    jit_elf.as_deref(),
                    rel_pc,
                    pc_adjustment,
                );
            }
            adjust_pc = true;

            let cur_pc = self.regs.pc();
            let cur_sp = self.regs.sp();

            let mut stepped = false;
            let mut finished = false;
            let mut in_device_map = false;
            let mut is_signal_frame = false;

            if let Some(info) = map_info.as_ref() {
                if info.flags & MAPS_FLAGS_DEVICE_MAP != 0 {
                    // Do not stop here; a speculative return-address frame
                    // may still be withdrawn below.
                    in_device_map = true;
                } else if self
                    .maps
                    .find(self.regs.sp())
                    .is_some_and(|sp_info| sp_info.flags & MAPS_FLAGS_DEVICE_MAP != 0)
                {
                    in_device_map = true;
                } else if let Some(jit) = jit_elf.as_ref() {
                    match jit.elf().step(step_pc, self.regs, &*self.process_memory) {
                        Ok(result) => {
                            stepped = true;
                            finished = result.finished;
                        }
                        Err(err) => self.last_error = err,
                    }
                } else if let Some(module) = elf.as_ref() {
                    if module.step_if_signal_handler(rel_pc, self.regs, &*self.process_memory) {
                        stepped = true;
                        is_signal_frame = true;
                    } else {
                        match module.step(step_pc, self.regs, &*self.process_memory) {
                            Ok(result) => {
                                stepped = true;
                                finished = result.finished;
                                is_signal_frame = result.is_signal_frame;
                            }
                            Err(err) => {
                                self.last_error = err;
                                // Missing CFI invokes the architecture's
                                // last-resort stepper.
                                if err.code == ErrorCode::UnwindInfoMissing
                                    && self.regs.fallback_step(&*self.process_memory)
                                {
                                    stepped = true;
                                    self.last_error = Error::default();
                                }
                            }
                        }
                    }
                }
            }

            if is_signal_frame {
                if let Some(frame) = self.frames.last_mut() {
                    frame.is_signal_frame = true;
                }
            }

            if finished {
                break;
            }

            if !stepped {
                if return_address_attempt {
                    // Remove the speculative frame unless there is nothing
                    // else: the code may have jumped into the middle of
                    // nowhere with no unwind information at all.
                    if self.frames.len() > 2
                        || self
                            .frames
                            .first()
                            .is_some_and(|frame| self.maps.find(frame.pc).is_some())
                    {
                        self.frames.pop();
                    }
                    break;
                }
                if in_device_map {
                    break;
                }
                // Stepping did not work; try the return address.
                if !self.regs.set_pc_from_return_address(&*self.process_memory) {
                    break;
                }
                return_address_attempt = true;
            } else {
                return_address_attempt = false;
                if self.frames.len() == options.max_frames {
                    self.last_error = Error::new(ErrorCode::MaxFramesExceeded);
                }
            }

            // If the pc and sp did not change, consider everything stopped.
            if cur_pc == self.regs.pc() && cur_sp == self.regs.sp() {
                self.last_error = Error::new(ErrorCode::RepeatedFrame);
                break;
            }
        }
    }

    fn fill_frame(
        &mut self,
        options: &UnwindOptions,
        map_info: Option<&Arc<MapInfo>>,
        elf: Option<&Elf>,
        jit_elf: Option<&crate::jit::JitElf>,
        rel_pc: u64,
        pc_adjustment: u64,
    ) {
        let mut frame = Frame {
            num: self.frames.len(),
            pc: self.regs.pc().wrapping_sub(pc_adjustment),
            rel_pc: rel_pc.wrapping_sub(pc_adjustment),
            sp: self.regs.sp(),
            map_info: map_info.cloned(),
            ..Frame::default()
        };

        if let Some(info) = map_info {
            frame.map_start = info.start;
            frame.map_end = info.end;
            frame.map_offset = info.offset;
            frame.map_elf_start_offset = info.elf_start_offset();
            frame.map_flags = info.flags;
            frame.map_name = info.name.clone();

            if options.embedded_soname && frame.map_elf_start_offset != 0 {
                // A library mapped straight out of its container renders as
                // container!soname.
                if let Some(soname) = elf.and_then(Elf::soname) {
                    frame.map_name =
                        SharedString::from(format!("{}!{}", info.name, soname));
                }
            }
        }

        if options.resolve_names {
            // Runtime-generated code is named by the catalogs; everything
            // else by the module's symbol tables.
            let named = jit_elf
                .and_then(|jit| jit.function_name(frame.pc))
                .or_else(|| {
                    let eligible = elf.map_or(true, |module| !module.is_valid())
                        || frame.map_flags & MAPS_FLAGS_JIT_SYMFILE_MAP != 0;
                    if eligible {
                        self.dex_files
                            .and_then(|dex| dex.function_name(self.maps, frame.pc))
                    } else {
                        None
                    }
                })
                .or_else(|| elf.and_then(|module| module.function_name(frame.rel_pc)));
            if let Some((name, offset)) = named {
                frame.function_name = name;
                frame.function_offset = offset;
            }
        }

        self.frames.push(frame);
    }

    /// Renders one recorded frame as a text line.
    pub fn format_frame(&self, index: usize, options: &UnwindOptions) -> String {
        let Some(frame) = self.frames.get(index) else {
            return String::new();
        };
        crate::format::format_frame(frame, self.regs.arch(), options, self.maps)
    }
}

fn should_stop(suffixes: &[String], map_name: &SharedString) -> bool {
    let Some(dot) = map_name.rfind('.') else {
        return false;
    };
    let suffix = &map_name[dot + 1..];
    suffixes.iter().any(|ignore| ignore == suffix)
}
