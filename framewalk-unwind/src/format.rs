//! Rendering of frames into text lines.

use std::fmt::Write as _;

use framewalk_common::Arch;

use crate::maps::Maps;
use crate::unwinder::{Frame, UnwindOptions};

/// Renders one frame:
/// `  #NN pc HEX  MODULE[ (SYMBOL[+OFF])][ (BuildId: HEX)]`.
///
/// Missing modules render as `<unknown>`, anonymous ones as
/// `<anonymous:HEX>`, and embedded libraries as
/// `container.apk!lib.so (offset 0xOFF)`.
pub fn format_frame(frame: &Frame, arch: Arch, options: &UnwindOptions, maps: &Maps) -> String {
    let mut line = String::with_capacity(128);

    if arch.is_64bit() {
        let _ = write!(line, "  #{:02} pc {:016x}", frame.num, frame.rel_pc);
    } else {
        let _ = write!(line, "  #{:02} pc {:08x}", frame.num, frame.rel_pc);
    }

    if frame.map_start == frame.map_end {
        line.push_str("  <unknown>");
    } else if frame.map_name.is_empty() {
        let _ = write!(line, "  <anonymous:{:x}>", frame.map_start);
    } else {
        let _ = write!(line, "  {}", frame.map_name);
        if frame.map_elf_start_offset != 0 {
            let _ = write!(line, " (offset 0x{:x})", frame.map_elf_start_offset);
        }
    }

    if !frame.function_name.is_empty() {
        let _ = write!(line, " ({}", frame.function_name);
        if frame.function_offset != 0 {
            let _ = write!(line, "+{}", frame.function_offset);
        }
        line.push(')');
    }

    if options.display_build_id {
        if let Some(info) = frame.map_info.as_ref() {
            let build_id = info.printable_build_id(maps);
            if !build_id.is_empty() {
                let _ = write!(line, " (BuildId: {build_id})");
            }
        }
    }

    line
}
