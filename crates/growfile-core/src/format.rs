//! Binary format definitions for Growfile stores
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (64 bytes, never moves)                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Heap (append-only): cells, blocks, scalars, directory bytes  │
//! │   ... orphaned blocks stay where they are ...                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every position in the file is an `Offset` relative to the start of the
//! mapping, so a reader can remap at a different address without any stored
//! value changing.

use std::fmt;

use crate::types::TypeDesc;

/// Magic bytes identifying a Growfile store: "GRWF"
pub const MAGIC_ARRAY: [u8; 4] = [0x47, 0x52, 0x57, 0x46];

/// Format version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: u64 = 64;

/// Header layout:
///   [0..4]   magic:      [u8;4] - "GRWF", written last on creation
///   [4..8]   version:    u32
///   [8..16]  directory:  u64    - offset of the directory's cell
///   [16..24] end:        u64    - allocation high-water mark
///   [24..32] generation: u64    - file-level dirty counter
///   [32..40] orphaned:   u64    - bytes abandoned by relocation
///   [40..48] created_at: u64    - unix seconds
///   [48..64] reserved
pub const HDR_VERSION: Offset = Offset(4);
pub const HDR_DIRECTORY: Offset = Offset(8);
pub const HDR_END: Offset = Offset(16);
pub const HDR_GENERATION: Offset = Offset(24);
pub const HDR_ORPHANED: Offset = Offset(32);
pub const HDR_CREATED_AT: Offset = Offset(40);

/// Indirection cell: target, capacity, length, generation (u64 each).
pub const CELL_SIZE: u64 = 32;
pub const CELL_TARGET: u64 = 0;
pub const CELL_CAPACITY: u64 = 8;
pub const CELL_LENGTH: u64 = 16;
pub const CELL_GENERATION: u64 = 24;

/// Reference slot: target, generation (u64 each).
pub const REF_SIZE: u64 = 16;
pub const REF_TARGET: u64 = 0;
pub const REF_GENERATION: u64 = 8;

/// Block header: capacity, element size (u64 each). Elements follow.
pub const BLOCK_HEADER_SIZE: u64 = 16;
pub const BLOCK_CAPACITY: u64 = 0;
pub const BLOCK_ELEM_SIZE: u64 = 8;

/// Size of a generation word.
pub const GENERATION_SIZE: u64 = 8;

/// Fixed part of a directory entry.
pub const ENTRY_FIXED_SIZE: usize = 32;

/// Maximum definition name length in bytes.
pub const MAX_NAME_LEN: usize = 1024;

/// Offset into a store mapping.
///
/// Only a `Region` can turn an offset into memory, which keeps every access
/// going through the current mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    /// The null offset. Nothing is ever allocated inside the header.
    pub const NULL: Self = Self(0);

    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn add(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Round up to a multiple of `align` (a power of two).
    pub const fn align_up(&self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Shape of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Fixed-size value stored in place
    Scalar = 1,
    /// Dynamic array behind an indirection cell
    Array = 2,
    /// Single stored reference
    Ref = 3,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Scalar => "scalar",
            Kind::Array => "array",
            Kind::Ref => "reference",
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Kind::Scalar),
            2 => Some(Kind::Array),
            3 => Some(Kind::Ref),
            _ => None,
        }
    }
}

/// One directory entry (decoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: Kind,
    pub desc: TypeDesc,
    /// Scalar slot, array cell, or reference slot
    pub offset: Offset,
    /// The definition's generation word
    pub generation: Offset,
}

impl DirEntry {
    /// Serialize to the on-disk entry format.
    ///
    /// Layout:
    ///   [0..4]   entry_len:  u32 - whole entry including padding, multiple of 8
    ///   [4..8]   checksum:   u32 - CRC32C of bytes [8..entry_len]
    ///   [8]      kind:       u8
    ///   [9]      reserved:   u8
    ///   [10..12] name_len:   u16
    ///   [12..16] desc_len:   u32
    ///   [16..24] offset:     u64
    ///   [24..32] generation: u64
    ///   [32..]   name, descriptor, zero padding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut desc = Vec::new();
        self.desc.encode(&mut desc);

        let body = ENTRY_FIXED_SIZE + self.name.len() + desc.len();
        let total = (body + 7) & !7;

        let mut buf = vec![0u8; total];
        buf[0..4].copy_from_slice(&(total as u32).to_le_bytes());
        buf[8] = self.kind as u8;
        buf[10..12].copy_from_slice(&(self.name.len() as u16).to_le_bytes());
        buf[12..16].copy_from_slice(&(desc.len() as u32).to_le_bytes());
        buf[16..24].copy_from_slice(&self.offset.as_u64().to_le_bytes());
        buf[24..32].copy_from_slice(&self.generation.as_u64().to_le_bytes());
        buf[32..32 + self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[32 + self.name.len()..body].copy_from_slice(&desc);

        let checksum = crc32c::crc32c(&buf[8..]);
        buf[4..8].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse one entry from the front of `data`.
    ///
    /// Returns the entry and the number of bytes it occupied.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), String> {
        if data.len() < ENTRY_FIXED_SIZE {
            return Err(format!("entry too short: {} bytes", data.len()));
        }
        let total = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if total < ENTRY_FIXED_SIZE || total % 8 != 0 || total > data.len() {
            return Err(format!("bad entry length {} ({} bytes available)", total, data.len()));
        }

        let stored = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let computed = crc32c::crc32c(&data[8..total]);
        if stored != computed {
            return Err(format!(
                "entry checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
                stored, computed
            ));
        }

        let kind = Kind::from_u8(data[8])
            .ok_or_else(|| format!("unknown definition kind {}", data[8]))?;
        let name_len = u16::from_le_bytes([data[10], data[11]]) as usize;
        let desc_len = u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize;
        let offset = u64::from_le_bytes(data[16..24].try_into().map_err(|_| "short offset")?);
        let generation =
            u64::from_le_bytes(data[24..32].try_into().map_err(|_| "short generation")?);

        let name_end = ENTRY_FIXED_SIZE + name_len;
        let desc_end = name_end + desc_len;
        if desc_end > total {
            return Err(format!("entry fields overrun entry length {}", total));
        }

        let name = std::str::from_utf8(&data[ENTRY_FIXED_SIZE..name_end])
            .map_err(|_| "definition name is not UTF-8".to_string())?
            .to_string();
        let desc = TypeDesc::decode(&data[name_end..desc_end])?;
        desc.validate().map_err(|e| format!("entry '{}': {}", name, e))?;

        if desc.kind() != kind {
            return Err(format!(
                "entry '{}' kind {} disagrees with type {}",
                name,
                kind.name(),
                desc
            ));
        }

        Ok((
            Self {
                name,
                kind,
                desc,
                offset: Offset::new(offset),
                generation: Offset::new(generation),
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Storable;

    fn sample_entry() -> DirEntry {
        DirEntry {
            name: "vs".to_string(),
            kind: Kind::Array,
            desc: TypeDesc::array(i32::type_desc()),
            offset: Offset::new(256),
            generation: Offset::new(256 + CELL_GENERATION),
        }
    }

    #[test]
    fn test_entry_is_padded() {
        let bytes = sample_entry().to_bytes();
        assert_eq!(bytes.len() % 8, 0);
        let (entry, used) = DirEntry::from_bytes(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(entry, sample_entry());
    }

    #[test]
    fn test_entries_parse_back_to_back() {
        let mut second = sample_entry();
        second.name = "another_name".to_string();
        second.kind = Kind::Scalar;
        second.desc = f64::type_desc();

        let mut buf = sample_entry().to_bytes();
        buf.extend_from_slice(&second.to_bytes());

        let (a, used) = DirEntry::from_bytes(&buf).unwrap();
        let (b, _) = DirEntry::from_bytes(&buf[used..]).unwrap();
        assert_eq!(a.name, "vs");
        assert_eq!(b.name, "another_name");
        assert_eq!(b.desc, f64::type_desc());
    }

    #[test]
    fn test_corrupted_entry_detected() {
        let mut bytes = sample_entry().to_bytes();
        bytes[33] ^= 0xFF;
        let err = DirEntry::from_bytes(&bytes).unwrap_err();
        assert!(err.contains("checksum"));
    }

    #[test]
    fn test_entry_with_invalid_type_rejected() {
        // Checksum is valid; the descriptor is not.
        let entry = DirEntry {
            name: "empty".to_string(),
            kind: Kind::Scalar,
            desc: TypeDesc::Record { size: 0, align: 1, fields: vec![] },
            offset: Offset::new(256),
            generation: Offset::new(256),
        };
        let err = DirEntry::from_bytes(&entry.to_bytes()).unwrap_err();
        assert!(err.contains("record size 0"), "{}", err);
    }

    #[test]
    fn test_truncated_entry_detected() {
        let bytes = sample_entry().to_bytes();
        assert!(DirEntry::from_bytes(&bytes[..bytes.len() - 8]).is_err());
    }

    #[test]
    fn test_offset_alignment() {
        assert_eq!(Offset::new(13).align_up(8).as_u64(), 16);
        assert_eq!(Offset::new(16).align_up(8).as_u64(), 16);
        assert_eq!(Offset::new(1).align_up(1).as_u64(), 1);
        assert_eq!(format!("{}", Offset::new(255)), "0x000000ff");
    }
}
