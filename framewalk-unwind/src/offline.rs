//! Loading of post-mortem snapshot directories.
//!
//! A snapshot holds `maps.txt`, `regs.txt`, one or more `*.data` memory
//! captures (stack contents, JIT descriptors and entries), and copies of
//! the module files named by the maps. Together they reconstruct enough of
//! a paused process to unwind it offline.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use framewalk_common::Arch;

use crate::error::{Error, ErrorCode};
use crate::maps::Maps;
use crate::memory::{Memory, MemoryOfflineBuffer, MemoryOfflineParts};
use crate::regs::{regs_for_arch, Regs};

/// A reconstructed offline target.
pub struct OfflineSnapshot {
    /// The target's address-space maps.
    pub maps: Maps,
    /// The captured register file.
    pub regs: Box<dyn Regs>,
    /// The captured memory: the union of all `*.data` files.
    pub process_memory: MemoryOfflineParts,
}

impl OfflineSnapshot {
    /// Loads a snapshot directory captured for `arch`.
    ///
    /// Map entries whose files were captured alongside the snapshot are
    /// rewritten to point into the directory, so module data is read from
    /// the captured copies rather than the original paths.
    pub fn load<P: AsRef<Path>>(dir: P, arch: Arch) -> io::Result<OfflineSnapshot> {
        let dir = dir.as_ref();

        let maps_text = fs::read_to_string(dir.join("maps.txt"))?;
        let maps_text = rewrite_map_names(&maps_text, dir);
        let maps = Maps::parse(&maps_text)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let regs = parse_regs(&fs::read_to_string(dir.join("regs.txt"))?, arch)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let mut process_memory = MemoryOfflineParts::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("data") {
                continue;
            }
            if let Some(memory) = load_memory_capture(&path)? {
                process_memory.add(Box::new(memory));
            }
        }

        Ok(OfflineSnapshot {
            maps,
            regs,
            process_memory,
        })
    }
}

/// Rewrites map names to captured module files where they exist.
///
/// A captured module is stored under the original library's file name,
/// possibly suffixed with a hex load address for modules synthesized from
/// memory.
fn rewrite_map_names(maps_text: &str, dir: &Path) -> String {
    let mut out = String::with_capacity(maps_text.len());
    for line in maps_text.lines() {
        let rewritten = match line.rsplit_once(' ') {
            Some((head, name)) if !name.is_empty() && !name.starts_with('[') => {
                let file = file_for_module(dir, name);
                match file {
                    Some(path) => format!("{} {}", head, path.display()),
                    None => line.to_string(),
                }
            }
            _ => line.to_string(),
        };
        out.push_str(&rewritten);
        out.push('\n');
    }
    out
}

fn file_for_module(dir: &Path, name: &str) -> Option<PathBuf> {
    let base = name.rsplit('/').next()?;
    let candidate = dir.join(base);
    candidate.is_file().then_some(candidate)
}

/// Parses `regs.txt`: one `NAME: HEX` line per register. Unknown names are
/// an error.
fn parse_regs(text: &str, arch: Arch) -> Result<Box<dyn Regs>, Error> {
    let mut regs = regs_for_arch(arch);
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::new(ErrorCode::InvalidParameter))?;
        let value = u64::from_str_radix(value.trim(), 16)
            .map_err(|_| Error::new(ErrorCode::InvalidParameter))?;
        if !regs.set_from_name(name.trim(), value) {
            return Err(Error::new(ErrorCode::InvalidParameter));
        }
    }
    Ok(regs)
}

/// Loads one `*.data` capture: a little-endian `u64` start address
/// followed by the raw bytes of `[start, start + len)`.
fn load_memory_capture(path: &Path) -> io::Result<Option<MemoryOfflineBuffer>> {
    let data = fs::read(path)?;
    if data.len() < 8 {
        return Ok(None);
    }
    let start = LittleEndian::read_u64(&data[..8]);
    Ok(Some(MemoryOfflineBuffer::new(data[8..].to_vec(), start)))
}
