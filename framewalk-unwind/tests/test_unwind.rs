//! End-to-end unwinds over a synthesized module.
//!
//! The module is a complete little-endian x86-64 ELF image carrying an
//! executable load segment, `.eh_frame_hdr` + `.eh_frame` describing three
//! functions, and a symbol table naming them. The image is placed in fake
//! process memory together with a stack holding the return-address chain.

use std::sync::Arc;

use similar_asserts::assert_eq;

use framewalk_unwind::{
    Maps, Memory, MemoryOfflineBuffer, MemoryOfflineParts, Regs, UnwindOptions, Unwinder,
};
use framewalk_unwind::regs::RegsX86_64;

const MAP_START: u64 = 0x40000000;
const STACK_BASE: u64 = 0x7ff00000;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;

const EH_FRAME_HDR_OFF: usize = 0x2000;
const EH_FRAME_OFF: usize = 0x2100;
const SYMTAB_OFF: usize = 0x2400;
const STRTAB_OFF: usize = 0x2500;
const SHSTRTAB_OFF: usize = 0x2580;
const SHDRS_OFF: usize = 0x2600;
const IMAGE_SIZE: usize = 0x3000;

fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Builds `.eh_frame`: one CIE (`zR`, absptr, ra=16, cfa=rsp+8, ra at
/// cfa-8) plus one FDE per function. Returns the section bytes and the
/// section-relative offset of each FDE.
fn build_eh_frame(functions: &[(u64, u64)]) -> (Vec<u8>, Vec<u32>) {
    let mut out = Vec::new();

    let cie_body: Vec<u8> = vec![
        1, b'z', b'R', 0, 1, 0x78, 16, 1, 0x00, // version..fde encoding
        0x0c, 7, 8, // def_cfa rsp+8
        0x80 | 16, 1, // ra at cfa-8
        0, 0, // nops
    ];
    push_u32(&mut out, cie_body.len() as u32 + 4);
    push_u32(&mut out, 0);
    out.extend_from_slice(&cie_body);

    let mut fde_offsets = Vec::new();
    for &(start, len) in functions {
        let fde_start = out.len() as u32;
        fde_offsets.push(fde_start);
        let mut body = Vec::new();
        push_u64(&mut body, start);
        push_u64(&mut body, len);
        body.push(0); // augmentation length
        body.extend_from_slice(&[0, 0, 0]); // nops
        push_u32(&mut out, body.len() as u32 + 4);
        // CIE pointer: distance from this field back to the CIE.
        push_u32(&mut out, fde_start + 4);
        out.extend_from_slice(&body);
    }
    (out, fde_offsets)
}

/// Builds `.eh_frame_hdr` with a datarel/sdata4 search table.
fn build_eh_frame_hdr(functions: &[(u64, u64)], fde_offsets: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(1); // version
    out.push(0x1b); // eh_frame_ptr: pcrel | sdata4
    out.push(0x03); // fde_count: udata4
    out.push(0x3b); // table: datarel | sdata4
    push_u32(
        &mut out,
        (EH_FRAME_OFF as i64 - (EH_FRAME_HDR_OFF as i64 + 4)) as u32,
    );
    push_u32(&mut out, functions.len() as u32);
    for (&(start, _), &fde) in functions.iter().zip(fde_offsets) {
        push_u32(&mut out, (start as i64 - EH_FRAME_HDR_OFF as i64) as u32);
        push_u32(
            &mut out,
            (EH_FRAME_OFF as i64 + fde as i64 - EH_FRAME_HDR_OFF as i64) as u32,
        );
    }
    out
}

fn build_symtab(functions: &[(u64, u64, &str)]) -> (Vec<u8>, Vec<u8>) {
    let mut symtab = vec![0u8; 24]; // null symbol
    let mut strtab = vec![0u8];
    for &(start, len, name) in functions {
        let name_offset = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);

        let mut sym = Vec::new();
        push_u32(&mut sym, name_offset);
        sym.push(0x12); // GLOBAL | FUNC
        sym.push(0);
        sym.extend_from_slice(&1u16.to_le_bytes()); // defined in section 1
        push_u64(&mut sym, start);
        push_u64(&mut sym, len);
        symtab.extend_from_slice(&sym);
    }
    (symtab, strtab)
}

fn shdr(name: u32, sh_type: u32, addr: u64, offset: u64, size: u64, link: u32, entsize: u64) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, name);
    push_u32(&mut out, sh_type);
    push_u64(&mut out, 0); // flags
    push_u64(&mut out, addr);
    push_u64(&mut out, offset);
    push_u64(&mut out, size);
    push_u32(&mut out, link);
    push_u32(&mut out, 0); // info
    push_u64(&mut out, 0); // addralign
    push_u64(&mut out, entsize);
    out
}

/// Synthesizes the whole ELF image.
fn build_image() -> Vec<u8> {
    let functions = [(0x1000u64, 0x100u64), (0x1100, 0x100), (0x1200, 0x100)];
    let named = [
        (0x1000u64, 0x100u64, "calling1"),
        (0x1100, 0x100, "calling2"),
        (0x1200, 0x100, "calling3"),
    ];

    let mut image = vec![0u8; IMAGE_SIZE];

    // ELF header.
    let mut ehdr = Vec::new();
    ehdr.extend_from_slice(b"\x7fELF");
    ehdr.extend_from_slice(&[2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]); // 64-bit LE
    ehdr.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
    ehdr.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    push_u32(&mut ehdr, 1);
    push_u64(&mut ehdr, 0x1000); // entry
    push_u64(&mut ehdr, EHDR_SIZE as u64); // phoff
    push_u64(&mut ehdr, SHDRS_OFF as u64); // shoff
    push_u32(&mut ehdr, 0);
    ehdr.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    ehdr.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    ehdr.extend_from_slice(&2u16.to_le_bytes()); // phnum
    ehdr.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
    ehdr.extend_from_slice(&6u16.to_le_bytes()); // shnum
    ehdr.extend_from_slice(&5u16.to_le_bytes()); // shstrndx
    put(&mut image, 0, &ehdr);

    // Program headers: one RX load covering the image, plus the eh_frame_hdr.
    let mut phdr = Vec::new();
    push_u32(&mut phdr, 1); // PT_LOAD
    push_u32(&mut phdr, 0x5); // R | X
    push_u64(&mut phdr, 0); // offset
    push_u64(&mut phdr, 0); // vaddr
    push_u64(&mut phdr, 0); // paddr
    push_u64(&mut phdr, IMAGE_SIZE as u64);
    push_u64(&mut phdr, IMAGE_SIZE as u64);
    push_u64(&mut phdr, 0x1000);
    put(&mut image, EHDR_SIZE, &phdr);

    let (eh_frame, fde_offsets) = build_eh_frame(&functions);
    let eh_frame_hdr = build_eh_frame_hdr(&functions, &fde_offsets);

    let mut phdr = Vec::new();
    push_u32(&mut phdr, 0x6474_e550); // PT_GNU_EH_FRAME
    push_u32(&mut phdr, 0x4);
    push_u64(&mut phdr, EH_FRAME_HDR_OFF as u64);
    push_u64(&mut phdr, EH_FRAME_HDR_OFF as u64);
    push_u64(&mut phdr, EH_FRAME_HDR_OFF as u64);
    push_u64(&mut phdr, eh_frame_hdr.len() as u64);
    push_u64(&mut phdr, eh_frame_hdr.len() as u64);
    push_u64(&mut phdr, 4);
    put(&mut image, EHDR_SIZE + PHDR_SIZE, &phdr);

    put(&mut image, EH_FRAME_HDR_OFF, &eh_frame_hdr);
    put(&mut image, EH_FRAME_OFF, &eh_frame);

    let (symtab, strtab) = build_symtab(&named);
    put(&mut image, SYMTAB_OFF, &symtab);
    put(&mut image, STRTAB_OFF, &strtab);

    let shstrtab = b"\0.eh_frame_hdr\0.eh_frame\0.symtab\0.strtab\0.shstrtab\0";
    put(&mut image, SHSTRTAB_OFF, shstrtab);

    // Section headers: null, .eh_frame_hdr, .eh_frame, .symtab, .strtab,
    // .shstrtab.
    let sections = [
        shdr(0, 0, 0, 0, 0, 0, 0),
        shdr(
            1,
            1,
            EH_FRAME_HDR_OFF as u64,
            EH_FRAME_HDR_OFF as u64,
            eh_frame_hdr.len() as u64,
            0,
            0,
        ),
        shdr(
            15,
            1,
            EH_FRAME_OFF as u64,
            EH_FRAME_OFF as u64,
            eh_frame.len() as u64,
            0,
            0,
        ),
        shdr(25, 2, 0, SYMTAB_OFF as u64, symtab.len() as u64, 4, 24),
        shdr(33, 3, 0, STRTAB_OFF as u64, strtab.len() as u64, 0, 0),
        shdr(41, 3, 0, SHSTRTAB_OFF as u64, shstrtab.len() as u64, 0, 0),
    ];
    for (index, section) in sections.iter().enumerate() {
        put(&mut image, SHDRS_OFF + index * SHDR_SIZE, section);
    }

    image
}

/// A stack holding return addresses into calling2 and calling3, then a
/// zero terminator.
fn build_stack() -> Vec<u8> {
    let mut stack = vec![0u8; 0x100];
    put(&mut stack, 0, &(MAP_START + 0x1150).to_le_bytes());
    put(&mut stack, 8, &(MAP_START + 0x1250).to_le_bytes());
    put(&mut stack, 16, &0u64.to_le_bytes());
    stack
}

fn build_target() -> (Maps, RegsX86_64, Arc<dyn Memory>) {
    let maps = Maps::parse(&format!(
        "{:x}-{:x} r-xp 0 00:00 0\n",
        MAP_START,
        MAP_START + IMAGE_SIZE as u64
    ))
    .unwrap();

    let mut memory = MemoryOfflineParts::new();
    memory.add(Box::new(MemoryOfflineBuffer::new(build_image(), MAP_START)));
    memory.add(Box::new(MemoryOfflineBuffer::new(build_stack(), STACK_BASE)));

    let mut regs = RegsX86_64::new();
    regs.set_pc(MAP_START + 0x1080);
    regs.set_sp(STACK_BASE);

    (maps, regs, Arc::new(memory))
}

#[test]
fn test_unwind_three_frames() {
    let (maps, mut regs, memory) = build_target();
    let mut unwinder = Unwinder::new(&maps, &mut regs, memory);
    let options = UnwindOptions::default();
    unwinder.unwind(&options);

    assert_eq!(unwinder.num_frames(), 3);
    let frames = unwinder.frames();

    assert_eq!(frames[0].rel_pc, 0x1080);
    assert_eq!(frames[0].pc, MAP_START + 0x1080);
    assert_eq!(frames[0].sp, STACK_BASE);
    assert_eq!(frames[0].function_name, "calling1");
    assert_eq!(frames[0].function_offset, 0x80);

    // Later frames back up over the call instruction.
    assert_eq!(frames[1].rel_pc, 0x114f);
    assert_eq!(frames[1].sp, STACK_BASE + 8);
    assert_eq!(frames[1].function_name, "calling2");

    assert_eq!(frames[2].rel_pc, 0x124f);
    assert_eq!(frames[2].sp, STACK_BASE + 16);
    assert_eq!(frames[2].function_name, "calling3");
}

#[test]
fn test_unwind_formats_frames() {
    let (maps, mut regs, memory) = build_target();
    let mut unwinder = Unwinder::new(&maps, &mut regs, memory);
    let options = UnwindOptions::default();
    unwinder.unwind(&options);

    assert_eq!(
        unwinder.format_frame(0, &options),
        format!(
            "  #00 pc 0000000000001080  <anonymous:{:x}> (calling1+128)",
            MAP_START
        )
    );
    assert_eq!(
        unwinder.format_frame(2, &options),
        format!(
            "  #02 pc 000000000000124f  <anonymous:{:x}> (calling3+79)",
            MAP_START
        )
    );
}

#[test]
fn test_unwind_without_name_resolution() {
    let (maps, mut regs, memory) = build_target();
    let mut unwinder = Unwinder::new(&maps, &mut regs, memory);
    let mut options = UnwindOptions::default();
    options.resolve_names = false;
    unwinder.unwind(&options);

    assert_eq!(unwinder.num_frames(), 3);
    for frame in unwinder.frames() {
        assert!(frame.function_name.is_empty());
    }
}

#[test]
fn test_unwind_respects_frame_cap() {
    let (maps, mut regs, memory) = build_target();
    let mut unwinder = Unwinder::new(&maps, &mut regs, memory);
    let mut options = UnwindOptions::default();
    options.max_frames = 2;
    unwinder.unwind(&options);

    assert_eq!(unwinder.num_frames(), 2);
    assert_eq!(
        unwinder.last_error().code,
        framewalk_unwind::ErrorCode::MaxFramesExceeded
    );
}

#[test]
fn test_unwind_unmapped_pc_records_unknown_frame() {
    let (maps, _, memory) = build_target();
    let mut regs = RegsX86_64::new();
    regs.set_pc(0x12345000);
    regs.set_sp(STACK_BASE + 0x40);

    let mut unwinder = Unwinder::new(&maps, &mut regs, memory);
    let options = UnwindOptions::default();
    unwinder.unwind(&options);

    assert!(unwinder.num_frames() >= 1);
    let frame = &unwinder.frames()[0];
    assert_eq!(frame.map_start, 0);
    assert_eq!(frame.map_end, 0);
    let line = unwinder.format_frame(0, &options);
    assert!(line.contains("<unknown>"), "{line}");
}
