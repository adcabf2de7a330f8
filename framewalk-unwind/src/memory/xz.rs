//! Lazily decompressed XZ data, used for `.gnu_debugdata` sections.

use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use super::Memory;

/// Upper bound on the compressed container size.
const MAX_COMPRESSED_SIZE: u64 = 1 << 30;

/// Size of the XZ stream header (magic, flags, CRC32).
const STREAM_HEADER_SIZE: usize = 12;
/// Size of the XZ stream footer (CRC32, backward size, flags, magic).
const STREAM_FOOTER_SIZE: usize = 12;

const HEADER_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const FOOTER_MAGIC: [u8; 2] = [b'Y', b'Z'];

struct XzBlock {
    /// Present once the block has been decompressed; blocks stay resident
    /// for the life of the object.
    decompressed_data: Option<Vec<u8>>,
    decompressed_size: u32,
    /// Offset of the block within the compressed container.
    compressed_offset: u32,
    /// Size of the block in the container, including padding and check.
    compressed_size: u32,
    /// Size of the block without the trailing padding (as the index records it).
    unpadded_size: u32,
}

/// A memory view over an XZ container, decompressing blocks on demand.
///
/// Construction scans the container's index without decompressing anything.
/// If all blocks except the last share one power-of-two size, reads locate
/// their block with a shift; otherwise the whole container is decompressed
/// up front and treated as a single block.
pub struct MemoryXz {
    compressed_memory: Arc<dyn Memory>,
    compressed_addr: u64,
    name: String,
    stream_flags: [u8; 2],
    blocks: Mutex<Vec<XzBlock>>,
    block_size_log2: u32,
    size: u64,
}

impl MemoryXz {
    /// Scans the XZ container at `[addr, addr + size)` of `memory`.
    ///
    /// Returns `None` if the data does not parse as a single XZ stream, or
    /// exceeds the compressed-size bound.
    pub fn new(
        memory: Arc<dyn Memory>,
        addr: u64,
        size: u64,
        name: impl Into<String>,
    ) -> Option<Self> {
        let name = name.into();
        if size >= MAX_COMPRESSED_SIZE {
            return None;
        }

        let mut compressed = vec![0u8; size as usize];
        if !memory.read_fully(addr, &mut compressed) {
            return None;
        }

        let (stream_flags, mut blocks) = scan_blocks(&compressed)?;
        let total: u64 = blocks.iter().map(|b| b.decompressed_size as u64).sum();

        let mut this = MemoryXz {
            compressed_memory: memory,
            compressed_addr: addr,
            name,
            stream_flags,
            blocks: Mutex::new(Vec::new()),
            block_size_log2: 31,
            size: total,
        };

        // All blocks (except the last one) must share a power-of-2 size for
        // shift-based lookup to work.
        if blocks.len() > 1 {
            let first_size = blocks[0].decompressed_size;
            let log2 = first_size.trailing_zeros();
            let uniform = first_size.is_power_of_two()
                && blocks[..blocks.len() - 1]
                    .iter()
                    .all(|b| b.decompressed_size == first_size)
                && blocks[blocks.len() - 1].decompressed_size <= first_size;
            if uniform {
                this.block_size_log2 = log2;
            } else {
                // Inconsistent block sizes; decompress and merge everything now.
                let mut data = Vec::with_capacity(total as usize);
                for block in &mut blocks {
                    this.decompress(block)?;
                    data.extend_from_slice(block.decompressed_data.as_deref().unwrap_or(&[]));
                }
                blocks = vec![XzBlock {
                    decompressed_data: Some(data),
                    decompressed_size: total as u32,
                    compressed_offset: 0,
                    compressed_size: 0,
                    unpadded_size: 0,
                }];
            }
        }

        if blocks.is_empty() {
            return None;
        }
        this.blocks = Mutex::new(blocks);
        Some(this)
    }

    /// Total decompressed size of the container.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Decompresses one block by rebuilding a standalone single-block
    /// stream around its bytes and running the XZ codec over it.
    fn decompress(&self, block: &mut XzBlock) -> Option<()> {
        let mut compressed = vec![0u8; block.compressed_size as usize];
        if !self.compressed_memory.read_fully(
            self.compressed_addr + block.compressed_offset as u64,
            &mut compressed,
        ) {
            return None;
        }

        let container = wrap_single_block(
            &compressed,
            self.stream_flags,
            block.unpadded_size,
            block.decompressed_size,
        );

        let mut decompressed = Vec::with_capacity(block.decompressed_size as usize);
        if let Err(err) = lzma_rs::xz_decompress(&mut &container[..], &mut decompressed) {
            warn!("can not decompress \"{}\": {}", self.name, err);
            return None;
        }
        if decompressed.len() != block.decompressed_size as usize {
            warn!("can not decompress \"{}\": size mismatch", self.name);
            return None;
        }

        block.decompressed_data = Some(decompressed);
        Some(())
    }
}

impl Memory for MemoryXz {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if addr >= self.size {
            // Read past the end.
            return 0;
        }

        let mut blocks = match self.blocks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut addr = addr;
        let mut written = 0usize;
        let first = (addr >> self.block_size_log2) as usize;
        for i in first..blocks.len() {
            let block = &mut blocks[i];
            if block.decompressed_data.is_none() && self.decompress(block).is_none() {
                break;
            }
            let data = block.decompressed_data.as_deref().unwrap_or(&[]);
            let offset = (addr - ((i as u64) << self.block_size_log2)) as usize;
            if offset >= data.len() {
                break;
            }
            let copy_bytes = (dst.len() - written).min(data.len() - offset);
            dst[written..written + copy_bytes].copy_from_slice(&data[offset..offset + copy_bytes]);
            written += copy_bytes;
            addr += copy_bytes as u64;
            if written == dst.len() {
                break;
            }
        }
        written
    }
}

/// Reads an XZ multibyte integer, returning the value and encoded length.
fn read_multibyte(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().take(9).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Writes an XZ multibyte integer.
fn write_multibyte(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(data);
    crc.sum()
}

/// Enumerates the blocks of a single XZ stream by parsing its footer and
/// index, without decompressing anything.
fn scan_blocks(data: &[u8]) -> Option<([u8; 2], Vec<XzBlock>)> {
    if data.len() < STREAM_HEADER_SIZE + STREAM_FOOTER_SIZE {
        return None;
    }
    if data[..6] != HEADER_MAGIC {
        return None;
    }
    let stream_flags = [data[6], data[7]];

    let footer = &data[data.len() - STREAM_FOOTER_SIZE..];
    if footer[10..12] != FOOTER_MAGIC || footer[8..10] != stream_flags {
        return None;
    }
    let backward_size = LittleEndian::read_u32(&footer[4..8]);
    let index_size = (backward_size as usize + 1) * 4;

    let index_end = data.len() - STREAM_FOOTER_SIZE;
    let index_start = index_end.checked_sub(index_size)?;
    if index_start < STREAM_HEADER_SIZE {
        return None;
    }

    let index = &data[index_start..index_end];
    if index.first() != Some(&0) {
        return None;
    }
    let mut pos = 1usize;
    let (count, used) = read_multibyte(&index[pos..])?;
    pos += used;

    let mut blocks = Vec::with_capacity(count as usize);
    let mut src_offset = STREAM_HEADER_SIZE as u64;
    for _ in 0..count {
        let (unpadded, used) = read_multibyte(&index[pos..])?;
        pos += used;
        let (uncompressed, used) = read_multibyte(&index[pos..])?;
        pos += used;

        let padded = (unpadded + 3) & !3;
        if src_offset + padded > index_start as u64 {
            return None;
        }
        blocks.push(XzBlock {
            decompressed_data: None,
            decompressed_size: u32::try_from(uncompressed).ok()?,
            compressed_offset: u32::try_from(src_offset).ok()?,
            compressed_size: u32::try_from(padded).ok()?,
            unpadded_size: u32::try_from(unpadded).ok()?,
        });
        src_offset += padded;
    }
    // A gap between the last block and the index means either stream
    // padding or a concatenated stream; neither is produced for embedded
    // debug data.
    if src_offset != index_start as u64 {
        return None;
    }
    if blocks.is_empty() {
        return None;
    }

    Some((stream_flags, blocks))
}

/// Rebuilds a complete single-block XZ stream around raw block bytes so the
/// codec can decode the block in isolation.
fn wrap_single_block(
    block_bytes: &[u8],
    stream_flags: [u8; 2],
    unpadded_size: u32,
    uncompressed_size: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(block_bytes.len() + 64);

    out.extend_from_slice(&HEADER_MAGIC);
    out.extend_from_slice(&stream_flags);
    let mut crc = [0u8; 4];
    LittleEndian::write_u32(&mut crc, crc32(&stream_flags));
    out.extend_from_slice(&crc);

    out.extend_from_slice(block_bytes);

    let index_start = out.len();
    out.push(0x00);
    write_multibyte(&mut out, 1);
    write_multibyte(&mut out, unpadded_size as u64);
    write_multibyte(&mut out, uncompressed_size as u64);
    while (out.len() - index_start) % 4 != 0 {
        out.push(0);
    }
    let index_crc = crc32(&out[index_start..]);
    LittleEndian::write_u32(&mut crc, index_crc);
    out.extend_from_slice(&crc);
    let index_size = out.len() - index_start;

    let mut footer = [0u8; 6];
    LittleEndian::write_u32(&mut footer[..4], (index_size as u32 / 4) - 1);
    footer[4] = stream_flags[0];
    footer[5] = stream_flags[1];
    LittleEndian::write_u32(&mut crc, crc32(&footer));
    out.extend_from_slice(&crc);
    out.extend_from_slice(&footer);
    out.extend_from_slice(&FOOTER_MAGIC);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBuffer;

    #[test]
    fn test_multibyte_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 0x4000, u32::MAX as u64] {
            let mut out = Vec::new();
            write_multibyte(&mut out, value);
            let (parsed, used) = read_multibyte(&out).unwrap();
            assert_eq!(parsed, value);
            assert_eq!(used, out.len());
        }
    }

    #[test]
    fn test_invalid_container() {
        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(vec![0u8; 64]));
        assert!(MemoryXz::new(memory, 0, 64, "bad").is_none());
    }

    #[test]
    fn test_truncated_container() {
        let mut data = HEADER_MAGIC.to_vec();
        data.extend_from_slice(&[0x00, 0x01]);
        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(data));
        assert!(MemoryXz::new(memory, 0, 8, "truncated").is_none());
    }
}
