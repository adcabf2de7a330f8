//! Property tests for the map model and the CFI decoder.

use std::sync::Arc;

use proptest::prelude::*;

use framewalk_unwind::dwarf::section::{DwarfSection, SectionGeometry};
use framewalk_unwind::{Arch, Maps, MemoryBuffer};

/// Builds non-overlapping `[start, end)` ranges from arbitrary seeds.
fn disjoint_ranges(seeds: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    let mut cursor = 0x1000u64;
    let mut ranges = Vec::new();
    for (gap, len) in seeds {
        let start = cursor + (gap % 0x10000) + 1;
        let end = start + (len % 0x10000) + 1;
        ranges.push((start, end));
        cursor = end;
    }
    ranges
}

proptest! {
    /// For any pc inside entry E, `find(pc)` returns E; for any pc in a
    /// gap, `find` returns nothing.
    #[test]
    fn maps_find_matches_linear_scan(
        seeds in prop::collection::vec((0u64..0x10000, 0u64..0x10000), 0..32),
        probes in prop::collection::vec(0u64..0x1000000, 0..64),
    ) {
        let ranges = disjoint_ranges(seeds);
        let text: String = ranges
            .iter()
            .map(|(start, end)| format!("{start:x}-{end:x} r-xp 0 00:00 0 lib.so\n"))
            .collect();
        let maps = Maps::parse(&text).unwrap();

        for &(start, end) in &ranges {
            prop_assert_eq!(maps.find(start).unwrap().start, start);
            prop_assert_eq!(maps.find(end - 1).unwrap().start, start);
            prop_assert!(maps.find(end).map_or(true, |info| info.start == end));
        }
        for probe in probes {
            let expected = ranges
                .iter()
                .find(|&&(start, end)| probe >= start && probe < end)
                .map(|&(start, _)| start);
            prop_assert_eq!(maps.find(probe).map(|info| info.start), expected);
        }
    }

    /// A serialized map list re-parses to an identical list.
    #[test]
    fn maps_serialize_roundtrip(
        seeds in prop::collection::vec((0u64..0x10000, 0u64..0x10000), 0..16),
    ) {
        let ranges = disjoint_ranges(seeds);
        let text: String = ranges
            .iter()
            .enumerate()
            .map(|(index, (start, end))| {
                format!("{start:x}-{end:x} rw-p {index:x} 00:00 0 /data/lib{index}.so\n")
            })
            .collect();
        let maps = Maps::parse(&text).unwrap();
        let reparsed = Maps::parse(&maps.serialize()).unwrap();
        prop_assert_eq!(maps.len(), reparsed.len());
        for (a, b) in maps.iter().zip(reparsed.iter()) {
            prop_assert_eq!(a.start, b.start);
            prop_assert_eq!(a.end, b.end);
            prop_assert_eq!(a.offset, b.offset);
            prop_assert_eq!(a.flags, b.flags);
            prop_assert_eq!(&a.name, &b.name);
        }
    }

    /// Random bytes fed to the CFI decoder produce either an FDE or an
    /// error; they never read outside the buffer or fail to terminate.
    #[test]
    fn cfi_decoder_is_total(
        bytes in prop::collection::vec(any::<u8>(), 0..512),
        pc in 0u64..0x10000,
    ) {
        let size = bytes.len() as u64;
        let mut section = DwarfSection::eh_frame(
            Arc::new(MemoryBuffer::new(bytes)),
            SectionGeometry { offset: 0, size, bias: 0 },
            Arch::X86_64,
            0,
            8,
        );
        match section.fde_from_pc(pc) {
            Ok(fde) => {
                prop_assert!(pc >= fde.pc_start);
                prop_assert!(pc < fde.pc_end);
            }
            Err(_) => {}
        }
    }

    /// The uncached and cached reads of a memory agree for small spans.
    #[test]
    fn cache_read_equivalence(
        data in prop::collection::vec(any::<u8>(), 1..0x3000),
        addr in 0u64..0x3000,
        len in 0usize..=64,
    ) {
        use framewalk_unwind::{Memory, MemoryCache};
        let inner = Arc::new(MemoryBuffer::new(data));
        let cached = MemoryCache::new(inner.clone());

        let mut a = vec![0u8; len];
        let mut b = vec![0u8; len];
        let cached_read = cached.read(addr, &mut a);
        let direct_read = inner.read(addr, &mut b);
        prop_assert_eq!(cached_read, direct_read);
        prop_assert_eq!(a, b);
    }
}
