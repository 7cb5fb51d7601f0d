//! Chunk and page binary formats
//!
//! Only the fixed headers live here. Keys and values are opaque payload
//! bytes, so the chunk layer can verify, traverse and relocate pages without
//! knowing a map's types.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{AoError, Result};
use crate::page_pos::{PagePosition, PageType};

// =============================================================================
// Chunk Header
// =============================================================================

/// Magic bytes identifying a chunk file
pub(crate) const CHUNK_MAGIC: &[u8; 4] = b"AOCK";

/// Current chunk format version
pub(crate) const CHUNK_FORMAT: u16 = 1;

/// Header size: Magic (4) + Format (2) + Flags (2) + Id (4) + PageCount (4)
/// + PageAreaLen (8) + FooterLen (4) + FooterCrc (4) = 32 bytes
pub(crate) const CHUNK_HEADER_SIZE: u64 = 32;

/// Fixed chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkHeader {
    pub id: u32,
    pub page_count: u32,
    pub page_area_len: u64,
    pub footer_len: u32,
    pub footer_crc: u32,
}

impl ChunkHeader {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(CHUNK_MAGIC);
        buf.put_u16_le(CHUNK_FORMAT);
        buf.put_u16_le(0); // flags
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.page_count);
        buf.put_u64_le(self.page_area_len);
        buf.put_u32_le(self.footer_len);
        buf.put_u32_le(self.footer_crc);
    }

    pub(crate) fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < CHUNK_HEADER_SIZE as usize {
            return Err(AoError::Corrupted(format!(
                "chunk header needs {} bytes, got {}",
                CHUNK_HEADER_SIZE,
                buf.len()
            )));
        }
        if &buf[0..4] != CHUNK_MAGIC {
            return Err(AoError::Corrupted(format!(
                "invalid chunk magic: expected AOCK, got {:?}",
                &buf[0..4]
            )));
        }
        buf.advance(4);

        let format = buf.get_u16_le();
        if format != CHUNK_FORMAT {
            return Err(AoError::Corrupted(format!(
                "unsupported chunk format: {}",
                format
            )));
        }
        let _flags = buf.get_u16_le();

        Ok(Self {
            id: buf.get_u32_le(),
            page_count: buf.get_u32_le(),
            page_area_len: buf.get_u64_le(),
            footer_len: buf.get_u32_le(),
            footer_crc: buf.get_u32_le(),
        })
    }
}

// =============================================================================
// Page Record
// =============================================================================

/// Page header: Len (4) + Crc (4) + Type (1) + Flags (1) + KeyCount (4)
/// + ChildCount (4) = 18 bytes, followed by 16 bytes per child
pub(crate) const PAGE_HEADER_SIZE: usize = 18;

/// Bytes per child reference: position (8) + subtree key count (8)
pub(crate) const CHILD_REF_SIZE: usize = 16;

/// Payload is zstd-compressed, prefixed with its raw length
const FLAG_COMPRESSED: u8 = 1;

/// Payloads shorter than this are never worth compressing
const MIN_COMPRESS_LEN: usize = 64;

/// Child reference as stored in an internal page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawChild {
    pub pos: PagePosition,
    pub count: u64,
}

/// Checked, decompressed view of one page record
#[derive(Debug)]
pub(crate) struct RawPage {
    pub page_type: PageType,
    pub key_count: u32,
    pub children: Vec<RawChild>,
    pub payload: Vec<u8>,
}

/// Serialize one page record
pub(crate) fn encode_page(
    page_type: PageType,
    key_count: usize,
    children: &[RawChild],
    payload: &[u8],
    compression: Option<i32>,
) -> Result<Vec<u8>> {
    let mut flags = 0u8;
    let mut body = BytesMut::with_capacity(payload.len() + 4);

    match compression {
        Some(level) if payload.len() >= MIN_COMPRESS_LEN => {
            let compressed = zstd::bulk::compress(payload, level)?;
            if compressed.len() + 4 < payload.len() {
                flags |= FLAG_COMPRESSED;
                body.put_u32_le(payload.len() as u32);
                body.put_slice(&compressed);
            } else {
                body.put_slice(payload);
            }
        }
        _ => body.put_slice(payload),
    }

    let total = PAGE_HEADER_SIZE + children.len() * CHILD_REF_SIZE + body.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32_le(total as u32);
    buf.put_u32_le(0); // crc placeholder
    buf.put_u8(page_type.raw());
    buf.put_u8(flags);
    buf.put_u32_le(key_count as u32);
    buf.put_u32_le(children.len() as u32);
    for child in children {
        buf.put_u64_le(child.pos.raw());
        buf.put_u64_le(child.count);
    }
    buf.put_slice(&body);

    let crc = crc32fast::hash(&buf[8..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    Ok(buf.to_vec())
}

/// Length prefix of a page record (first 4 bytes)
pub(crate) fn page_len(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < 4 {
        return Err(AoError::Corrupted("truncated page length".into()));
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len < PAGE_HEADER_SIZE || len > bytes.len() {
        return Err(AoError::Corrupted(format!(
            "page length {} outside 18..={}",
            len,
            bytes.len()
        )));
    }
    Ok(len)
}

/// Verify and split a page record (exactly one record, as cut by `page_len`)
pub(crate) fn decode_page(bytes: &[u8]) -> Result<RawPage> {
    let len = page_len(bytes)?;
    let bytes = &bytes[..len];

    let stored_crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if crc32fast::hash(&bytes[8..]) != stored_crc {
        return Err(AoError::Corrupted("page checksum mismatch".into()));
    }

    let mut buf = &bytes[8..];
    let page_type = PageType::from_raw(buf.get_u8());
    let flags = buf.get_u8();
    let key_count = buf.get_u32_le();
    let child_count = buf.get_u32_le() as usize;

    if buf.remaining() < child_count * CHILD_REF_SIZE {
        return Err(AoError::Corrupted(format!(
            "page declares {} children but has {} bytes left",
            child_count,
            buf.remaining()
        )));
    }
    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        let raw = buf.get_u64_le();
        let count = buf.get_u64_le();
        let pos = PagePosition::from_raw(raw)
            .ok_or_else(|| AoError::Corrupted("internal page with null child".into()))?;
        children.push(RawChild { pos, count });
    }

    let payload = if flags & FLAG_COMPRESSED != 0 {
        if buf.remaining() < 4 {
            return Err(AoError::Corrupted("compressed payload without length".into()));
        }
        let raw_len = buf.get_u32_le() as usize;
        zstd::bulk::decompress(buf, raw_len)?
    } else {
        buf.to_vec()
    };

    Ok(RawPage {
        page_type,
        key_count,
        children,
        payload,
    })
}

/// Copy a page record with its child positions replaced
///
/// The (possibly compressed) payload is carried over byte for byte.
pub(crate) fn relocate_children(
    bytes: &[u8],
    mut map: impl FnMut(PagePosition) -> Result<PagePosition>,
) -> Result<Vec<u8>> {
    let len = page_len(bytes)?;
    let mut out = bytes[..len].to_vec();
    let child_count = u32::from_le_bytes([out[14], out[15], out[16], out[17]]) as usize;
    if PAGE_HEADER_SIZE + child_count * CHILD_REF_SIZE > len {
        return Err(AoError::Corrupted("child table exceeds page".into()));
    }

    for i in 0..child_count {
        let at = PAGE_HEADER_SIZE + i * CHILD_REF_SIZE;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&out[at..at + 8]);
        let old = PagePosition::from_raw(u64::from_le_bytes(raw))
            .ok_or_else(|| AoError::Corrupted("internal page with null child".into()))?;
        let new = map(old)?;
        out[at..at + 8].copy_from_slice(&new.raw().to_le_bytes());
    }

    let crc = crc32fast::hash(&out[8..]);
    out[4..8].copy_from_slice(&crc.to_le_bytes());
    Ok(out)
}
