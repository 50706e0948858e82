//! Mach-O structures carried in parsed image headers.
//!
//! These are the 64-bit forms; 32-bit load commands are widened during
//! parsing. All of them persist as part of the controller metadata, so they
//! derive serde in addition to the usual traits. NUL-padded name fields
//! serialize as plain strings.

use serde::{Deserialize, Serialize};

use crate::util::fixed_string;

/// Serializes `[u8; 16]` name fields as NUL-trimmed strings.
mod name16 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::fixed_string(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let text = String::deserialize(d)?;
        let mut out = [0u8; 16];
        let bytes = text.as_bytes();
        let len = bytes.len().min(16);
        out[..len].copy_from_slice(&bytes[..len]);
        Ok(out)
    }
}

// =============================================================================
// Header
// =============================================================================

/// 64-bit Mach-O header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachHeader64 {
    /// Magic number
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Total size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (64-bit only)
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the 64-bit header in bytes.
    pub const SIZE: u64 = 32;
}

// =============================================================================
// Segments and Sections
// =============================================================================

/// 64-bit segment command (widened from 32-bit where necessary).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCommand64 {
    /// Segment name, NUL padded
    #[serde(with = "name16")]
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Bytes mapped from the file
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Segment name as a string.
    pub fn name(&self) -> String {
        fixed_string(&self.segname)
    }

    /// True for the `__LINKEDIT` segment.
    pub fn is_linkedit(&self) -> bool {
        self.segname.starts_with(b"__LINKEDIT\0")
    }

    /// True if `addr` lies inside the segment's VM range.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.vmaddr && addr < self.vmaddr + self.vmsize
    }
}

/// 64-bit section.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section64 {
    /// Section name, NUL padded
    #[serde(with = "name16")]
    pub sectname: [u8; 16],
    /// Containing segment name, NUL padded
    #[serde(with = "name16")]
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment (power of two)
    pub align: u32,
    /// Relocation entries file offset
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags (type and attributes)
    pub flags: u32,
    /// Reserved
    pub reserved1: u32,
    /// Reserved
    pub reserved2: u32,
    /// Reserved (64-bit only)
    pub reserved3: u32,
}

impl Section64 {
    /// Section name as a string.
    pub fn name(&self) -> String {
        fixed_string(&self.sectname)
    }

    /// True if `addr` lies inside the section.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.addr + self.size
    }
}

// =============================================================================
// Link-edit Commands
// =============================================================================

/// Symbol table command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymtabCommand {
    /// File offset of the symbol table
    pub symoff: u32,
    /// Number of symbols
    pub nsyms: u32,
    /// File offset of the string table
    pub stroff: u32,
    /// Size of the string table
    pub strsize: u32,
}

/// Dynamic symbol table command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DysymtabCommand {
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

/// Compressed dyld info command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DyldInfoCommand {
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

/// Generic link-edit data command payload (function starts, export trie,
/// chained fixups, ...).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkeditDataCommand {
    /// File offset of the data
    pub dataoff: u32,
    /// Size of the data
    pub datasize: u32,
}

/// 64-bit routines command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RoutinesCommand64 {
    pub init_address: u64,
    pub init_module: u64,
    pub reserved1: u64,
    pub reserved2: u64,
    pub reserved3: u64,
    pub reserved4: u64,
    pub reserved5: u64,
    pub reserved6: u64,
}

/// Build version command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVersionCommand {
    /// Target platform
    pub platform: u32,
    /// Minimum OS version (x.y.z packed)
    pub minos: u32,
    /// SDK version
    pub sdk: u32,
    /// Number of build tool entries
    pub ntools: u32,
}

/// Symbol table entry (64-bit).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Nlist64 {
    /// String table index
    pub n_strx: u32,
    /// Type flags
    pub n_type: u8,
    /// Section number
    pub n_sect: u8,
    /// Description field
    pub n_desc: u16,
    /// Value (address for defined symbols)
    pub n_value: u64,
}

impl Nlist64 {
    /// Size of an on-disk nlist_64 entry.
    pub const SIZE: u64 = 16;

    /// Decodes an entry from 16 little-endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            n_strx: crate::util::read_u32_le(&bytes[0..4]),
            n_type: bytes[4],
            n_sect: bytes[5],
            n_desc: crate::util::read_u16_le(&bytes[6..8]),
            n_value: crate::util::read_u64_le(&bytes[8..16]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name() {
        let mut seg = SegmentCommand64::default();
        seg.segname[..7].copy_from_slice(b"__TEXT\0");
        assert_eq!(seg.name(), "__TEXT");
        assert!(!seg.is_linkedit());

        let mut le = SegmentCommand64::default();
        le.segname[..11].copy_from_slice(b"__LINKEDIT\0");
        assert!(le.is_linkedit());
    }

    #[test]
    fn test_segment_serde_roundtrip() {
        let mut seg = SegmentCommand64 {
            vmaddr: 0x1_8000_0000,
            vmsize: 0x4000,
            fileoff: 0,
            filesize: 0x4000,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            flags: 0,
            ..Default::default()
        };
        seg.segname[..7].copy_from_slice(b"__TEXT\0");

        let json = serde_json::to_string(&seg).unwrap();
        assert!(json.contains("\"__TEXT\""));
        let back: SegmentCommand64 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, seg);
    }

    #[test]
    fn test_nlist_decode() {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&7u32.to_le_bytes());
        bytes[4] = 0x0E; // N_SECT
        bytes[5] = 1;
        bytes[6..8].copy_from_slice(&8u16.to_le_bytes());
        bytes[8..16].copy_from_slice(&0x1_8000_1000u64.to_le_bytes());
        let sym = Nlist64::from_bytes(&bytes);
        assert_eq!(sym.n_strx, 7);
        assert_eq!(sym.n_type, 0x0E);
        assert_eq!(sym.n_value, 0x1_8000_1000);
    }
}
