//! The target's address-space map list.
//!
//! A [`Maps`] is an ordered arena of [`MapInfo`] entries, parsed either from
//! `/proc/<pid>/maps`-style text or from a caller-supplied buffer. Entries
//! are sorted, checked for strict ordering, and linked to their meaningful
//! neighbours so split `r--`/`r-x` mappings can reach each other in O(1).

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use nom::branch::alt;
use nom::bytes::complete::{take_while1, take_while_m_n};
use nom::character::complete::{char, digit1, hex_digit1, space0, space1};
use nom::combinator::{map_res, opt, rest};
use nom::sequence::{separated_pair, tuple};
use nom::{Finish, IResult};

use framewalk_common::SharedString;

use crate::error::{Error, ErrorCode};
use crate::map_info::MapInfo;

/// The mapping is readable.
pub const PROT_READ: u16 = 0x1;
/// The mapping is writable.
pub const PROT_WRITE: u16 = 0x2;
/// The mapping is executable.
pub const PROT_EXEC: u16 = 0x4;
/// The mapping names a device file that is not ashmem.
pub const MAPS_FLAGS_DEVICE_MAP: u16 = 0x8000;
/// The mapping holds JIT symfile data published via the debug descriptor.
pub const MAPS_FLAGS_JIT_SYMFILE_MAP: u16 = 0x4000;

fn hex_u64(input: &str) -> IResult<&str, u64> {
    map_res(hex_digit1, |s| u64::from_str_radix(s, 16))(input)
}

fn perms(input: &str) -> IResult<&str, u16> {
    let (rest, perms) = take_while_m_n(4, 4, |c| "rwxps-".contains(c))(input)?;
    let mut flags = 0;
    let bytes = perms.as_bytes();
    if bytes[0] == b'r' {
        flags |= PROT_READ;
    }
    if bytes[1] == b'w' {
        flags |= PROT_WRITE;
    }
    if bytes[2] == b'x' {
        flags |= PROT_EXEC;
    }
    Ok((rest, flags))
}

fn device(input: &str) -> IResult<&str, &str> {
    let (rest, _) = separated_pair(hex_digit1, char(':'), hex_digit1)(input)?;
    Ok((rest, ""))
}

/// Parses one `/proc/<pid>/maps` line:
/// `HEX-HEX PERMS HEX DEV INO [NAME]`.
fn map_line(input: &str) -> IResult<&str, MapInfo> {
    let (input, ((start, end), _, flags, _, offset, _, _, _, inode)) = tuple((
        separated_pair(hex_u64, char('-'), hex_u64),
        space1,
        perms,
        space1,
        hex_u64,
        space1,
        device,
        space1,
        map_res(digit1, |s: &str| s.parse::<u64>()),
    ))(input)?;
    let (input, _) = space0(input)?;
    let (input, name) = opt(alt((take_while1(|c| c != '\n'), rest)))(input)?;

    let mut flags = flags;
    let name = name.unwrap_or("").trim_end();
    if name.starts_with("/dev/") && !name.starts_with("/dev/ashmem/") {
        flags |= MAPS_FLAGS_DEVICE_MAP;
    }
    if name == "[anon:dalvik-jit-code-cache]" || name == "/memfd:jit-cache" {
        flags |= MAPS_FLAGS_JIT_SYMFILE_MAP;
    }
    let _ = inode;

    Ok((input, MapInfo::new(start, end, offset, flags, name)))
}

/// An ordered, linked collection of address-space mappings.
#[derive(Default)]
pub struct Maps {
    entries: Vec<Arc<MapInfo>>,
}

impl Maps {
    /// Creates an empty map list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses map text from a caller-supplied buffer.
    ///
    /// Input order is not trusted; the entries are sorted and linked. A
    /// malformed line or an overlapping pair of entries fails the parse.
    pub fn parse(buffer: &str) -> Result<Self, Error> {
        let mut entries = Vec::new();
        for line in buffer.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let info = Self::parse_line(line)?;
            entries.push(info);
        }
        Self::finish(entries)
    }

    /// Parses a single map line.
    pub fn parse_line(line: &str) -> Result<MapInfo, Error> {
        match map_line(line).finish() {
            Ok((_, info)) if info.end > info.start => Ok(info),
            Ok(_) => Err(Error::new(ErrorCode::InvalidMap)),
            Err(_) => Err(Error::new(ErrorCode::InvalidParameter)),
        }
    }

    /// Parses the maps of the calling process.
    pub fn local() -> io::Result<Self> {
        Self::pid_maps(None)
    }

    /// Parses the maps of another process.
    pub fn remote(pid: i32) -> io::Result<Self> {
        Self::pid_maps(Some(pid))
    }

    /// Parses a maps file captured on disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let buffer = fs::read_to_string(path)?;
        Self::parse(&buffer).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    fn pid_maps(pid: Option<i32>) -> io::Result<Self> {
        let path = match pid {
            Some(pid) => format!("/proc/{pid}/maps"),
            None => "/proc/self/maps".into(),
        };
        Self::from_file(path)
    }

    /// Sorts, checks ordering, and builds the neighbour links.
    fn finish(mut entries: Vec<MapInfo>) -> Result<Self, Error> {
        entries.sort_by_key(|info| info.start);

        for window in entries.windows(2) {
            if window[1].start < window[0].end {
                return Err(Error::new(ErrorCode::InvalidMap));
            }
        }

        // The nearest meaningful neighbour: a mapping with real protection
        // bits that shares the backing file. Gap (`---p`) and anonymous
        // entries in between are skipped.
        let meaningful = |info: &MapInfo| info.flags & (PROT_READ | PROT_WRITE | PROT_EXEC) != 0;
        let same_file = |entries: &[MapInfo], of: usize, candidate: usize| -> Option<usize> {
            let name = &entries[of].name;
            (!name.is_empty() && entries[candidate].name == *name).then_some(candidate)
        };

        let len = entries.len();
        for index in 0..len {
            entries[index].index = index;
            entries[index].prev_map = index.checked_sub(1);
            entries[index].prev_real_map = (0..index)
                .rev()
                .find(|&j| meaningful(&entries[j]))
                .and_then(|j| same_file(&entries, index, j));
            entries[index].next_real_map = (index + 1..len)
                .find(|&j| meaningful(&entries[j]))
                .and_then(|j| same_file(&entries, index, j));
        }

        Ok(Maps {
            entries: entries.into_iter().map(Arc::new).collect(),
        })
    }

    /// Finds the mapping containing `pc` by binary search.
    pub fn find(&self, pc: u64) -> Option<&Arc<MapInfo>> {
        let index = self.entries.partition_point(|info| info.end <= pc);
        let info = self.entries.get(index)?;
        (info.start <= pc).then_some(info)
    }

    /// Returns the entry at `index`.
    pub fn get(&self, index: usize) -> Option<&Arc<MapInfo>> {
        self.entries.get(index)
    }

    /// The number of mappings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no mappings.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the mappings in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<MapInfo>> {
        self.entries.iter()
    }

    /// Renders the list back into maps text. Re-parsing the output yields
    /// an equal list.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for info in &self.entries {
            let r = if info.flags & PROT_READ != 0 { 'r' } else { '-' };
            let w = if info.flags & PROT_WRITE != 0 { 'w' } else { '-' };
            let x = if info.flags & PROT_EXEC != 0 { 'x' } else { '-' };
            let _ = writeln!(
                out,
                "{:x}-{:x} {}{}{}p {:x} 00:00 0 {}",
                info.start, info.end, r, w, x, info.offset, info.name
            );
        }
        out
    }
}

impl<'a> IntoIterator for &'a Maps {
    type Item = &'a Arc<MapInfo>;
    type IntoIter = std::slice::Iter<'a, Arc<MapInfo>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Extracts the short name of a module for display: the basename of a path,
/// or the whole name for anonymous forms.
pub fn basename(name: &SharedString) -> &str {
    match name.rfind('/') {
        Some(index) => &name[index + 1..],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    const MAPS: &str = "\
1000-2000 r--p 0 00:00 0 /system/lib/libc.so
2000-3000 ---p 0 00:00 0 /system/lib/libc.so
3000-4000 r-xp 3000 00:00 0 /system/lib/libc.so
5000-6000 rw-p 0 00:00 0
7000-8000 r-xp 0 fd:01 23456 /dev/binder
9000-a000 rwxp 0 00:00 0 [anon:dalvik-jit-code-cache]
";

    #[test]
    fn test_parse_line() {
        let info = Maps::parse_line("12c00000-12d00000 rw-p 00000000 00:05 10267   /dev/ashmem/dalvik-main")
            .unwrap();
        assert_eq!(info.start, 0x12c00000);
        assert_eq!(info.end, 0x12d00000);
        assert_eq!(info.offset, 0);
        assert_eq!(info.flags, PROT_READ | PROT_WRITE);
        assert_eq!(info.name, "/dev/ashmem/dalvik-main");
    }

    #[test]
    fn test_parse_line_no_name() {
        let info = Maps::parse_line("a000-b000 r--s 1000 103:07 0").unwrap();
        assert_eq!(info.flags, PROT_READ);
        assert!(info.name.is_empty());
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(Maps::parse_line("not a map line").is_err());
        assert!(Maps::parse_line("1000-2000 zzzz 0 00:00 0").is_err());
        // end <= start
        assert!(Maps::parse_line("2000-1000 r--p 0 00:00 0").is_err());
    }

    #[test]
    fn test_flags() {
        let maps = Maps::parse(MAPS).unwrap();
        assert_eq!(
            maps.find(0x7000).unwrap().flags,
            PROT_READ | PROT_EXEC | MAPS_FLAGS_DEVICE_MAP
        );
        assert_eq!(
            maps.find(0x9000).unwrap().flags,
            PROT_READ | PROT_WRITE | PROT_EXEC | MAPS_FLAGS_JIT_SYMFILE_MAP
        );
    }

    #[test]
    fn test_find() {
        let maps = Maps::parse(MAPS).unwrap();
        assert!(maps.find(0xfff).is_none());
        assert_eq!(maps.find(0x1000).unwrap().start, 0x1000);
        assert_eq!(maps.find(0x1fff).unwrap().start, 0x1000);
        assert_eq!(maps.find(0x3abc).unwrap().start, 0x3000);
        assert!(maps.find(0x4000).is_none());
        assert!(maps.find(0x6123).is_none());
    }

    #[test]
    fn test_real_links_skip_gap_map() {
        let maps = Maps::parse(MAPS).unwrap();
        let exec = maps.find(0x3000).unwrap();
        let prev_real = exec.prev_real_map(&maps).unwrap();
        assert_eq!(prev_real.start, 0x1000);
        assert_eq!(prev_real.flags, PROT_READ);

        let ro = maps.find(0x1000).unwrap();
        let next_real = ro.next_real_map(&maps).unwrap();
        assert_eq!(next_real.start, 0x3000);

        // The anonymous map has no real neighbours.
        assert!(maps.find(0x5000).unwrap().prev_real_map(&maps).is_none());
    }

    #[test]
    fn test_overlapping_maps_rejected() {
        let text = "1000-3000 r--p 0 00:00 0 a.so\n2000-4000 r-xp 0 00:00 0 a.so\n";
        assert!(Maps::parse(text).is_err());
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let text = "3000-4000 r-xp 0 00:00 0 b.so\n1000-2000 r--p 0 00:00 0 a.so\n";
        let maps = Maps::parse(text).unwrap();
        assert_eq!(maps.get(0).unwrap().start, 0x1000);
        assert_eq!(maps.get(1).unwrap().start, 0x3000);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let maps = Maps::parse(MAPS).unwrap();
        let text = maps.serialize();
        let reparsed = Maps::parse(&text).unwrap();
        assert_eq!(maps.len(), reparsed.len());
        for (a, b) in maps.iter().zip(reparsed.iter()) {
            assert_eq!(a.start, b.start);
            assert_eq!(a.end, b.end);
            assert_eq!(a.offset, b.offset);
            assert_eq!(a.flags, b.flags);
            assert_eq!(a.name, b.name);
        }
        assert_eq!(text, reparsed.serialize());
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename(&SharedString::from("/system/lib/libc.so")), "libc.so");
        assert_eq!(basename(&SharedString::from("[stack]")), "[stack]");
    }
}
