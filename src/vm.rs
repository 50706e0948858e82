//! Virtual memory reconstruction across cache files.
//!
//! A [`VirtualMemory`] is an ordered map from non-overlapping virtual
//! address ranges to `(file accessor, file offset)` pairs. It answers which
//! backing file serves a given address and performs typed reads through the
//! file accessors. [`VmReader`] layers a cursor and endianness on top for
//! sequential parsing of structures that live in the composite space.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::accessor::{self, LazyFileAccessor, PostAllocRoutine};
use crate::error::{Error, Result};
use crate::util::is_aligned;

/// Page size used for mapping alignment checks.
pub const VM_PAGE_SIZE: u64 = 0x1000;

/// The backing of one mapped address range.
#[derive(Clone, Debug)]
pub struct PageMapping {
    /// Lazy handle to the file providing the bytes.
    pub file: Arc<LazyFileAccessor>,
    /// File offset corresponding to the start of the range.
    pub file_offset: u64,
}

#[derive(Debug)]
struct RangeEntry {
    end: u64,
    mapping: PageMapping,
}

/// An ordered address-range map over the backing cache files.
#[derive(Debug, Default)]
pub struct VirtualMemory {
    // Keyed by range start; entries never overlap.
    map: BTreeMap<u64, RangeEntry>,
}

impl VirtualMemory {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the range `[address, address + size)` as backed by
    /// `file_path` at `file_offset`.
    ///
    /// `post_alloc` runs the first time the file is materialized (and on
    /// every re-materialization), letting the caller apply slide info
    /// lazily.
    ///
    /// # Panics
    ///
    /// Panics if the range collides with an existing one. Overlapping
    /// mappings mean the input is malformed in a way that would silently
    /// corrupt every subsequent lookup.
    pub fn map_pages(
        &mut self,
        session_id: u64,
        address: u64,
        file_offset: u64,
        size: u64,
        file_path: &Path,
        post_alloc: PostAllocRoutine,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if !is_aligned(address, VM_PAGE_SIZE) || !is_aligned(size, VM_PAGE_SIZE) {
            return Err(Error::MappingAlignment {
                addr: address,
                size,
                page_size: VM_PAGE_SIZE,
            });
        }

        let end = address + size;
        let collides = self
            .map
            .range(..end)
            .next_back()
            .map(|(_, entry)| entry.end > address)
            .unwrap_or(false);
        if collides {
            panic!(
                "virtual memory mapping collision at {:#x}..{:#x} ({})",
                address,
                end,
                file_path.display()
            );
        }

        let file = accessor::open(session_id, file_path);
        file.set_post_alloc(post_alloc);
        self.map.insert(
            address,
            RangeEntry {
                end,
                mapping: PageMapping { file, file_offset },
            },
        );
        Ok(())
    }

    /// Returns true if `address` falls inside a mapped range.
    pub fn address_is_mapped(&self, address: u64) -> bool {
        self.entry_at(address).is_some()
    }

    fn entry_at(&self, address: u64) -> Option<(u64, &RangeEntry)> {
        let (start, entry) = self.map.range(..=address).next_back()?;
        (entry.end > address).then_some((*start, entry))
    }

    /// Looks up the mapping containing `address`, returning it together
    /// with the offset of `address` within the range.
    pub fn mapping_at(&self, address: u64) -> Result<(PageMapping, u64)> {
        let (start, entry) = self
            .entry_at(address)
            .ok_or(Error::Unmapped { addr: address })?;
        Ok((entry.mapping.clone(), address - start))
    }

    fn resolve(&self, address: u64, len: usize) -> Result<(PageMapping, u64)> {
        let (start, entry) = self
            .entry_at(address)
            .ok_or(Error::Unmapped { addr: address })?;
        // Reads never span a range boundary.
        if address + len as u64 > entry.end {
            return Err(Error::MappingRead {
                offset: address,
                len,
                mapped: entry.end,
            });
        }
        let intra = address - start;
        Ok((entry.mapping.clone(), entry.mapping.file_offset + intra))
    }

    /// Reads a u8 at `address`.
    pub fn read_u8(&self, address: u64) -> Result<u8> {
        let (mapping, off) = self.resolve(address, 1)?;
        mapping.file.lock()?.read_u8(off)
    }

    /// Reads a little-endian u16 at `address`.
    pub fn read_u16(&self, address: u64) -> Result<u16> {
        let (mapping, off) = self.resolve(address, 2)?;
        mapping.file.lock()?.read_u16(off)
    }

    /// Reads a little-endian u32 at `address`.
    pub fn read_u32(&self, address: u64) -> Result<u32> {
        let (mapping, off) = self.resolve(address, 4)?;
        mapping.file.lock()?.read_u32(off)
    }

    /// Reads a little-endian u64 at `address`.
    pub fn read_u64(&self, address: u64) -> Result<u64> {
        let (mapping, off) = self.resolve(address, 8)?;
        mapping.file.lock()?.read_u64(off)
    }

    /// Reads `len` bytes at `address` into an owned buffer.
    pub fn read_buffer(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let (mapping, off) = self.resolve(address, len)?;
        mapping.file.lock()?.read_buffer(off, len)
    }

    /// Reads a NUL-terminated string at `address` (bounded by the range).
    pub fn read_cstring(&self, address: u64) -> Result<String> {
        let (mapping, off) = self.resolve(address, 1)?;
        mapping.file.lock()?.read_cstring(off)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Byte order of multi-byte reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    /// Little-endian (all shipping caches).
    Little,
    /// Big-endian (byte-swapped Mach-O magic).
    Big,
}

/// A cursor-based reader over a [`VirtualMemory`].
pub struct VmReader<'a> {
    vm: &'a VirtualMemory,
    cursor: u64,
    endianness: Endianness,
}

impl<'a> VmReader<'a> {
    /// Creates a reader positioned at address zero.
    pub fn new(vm: &'a VirtualMemory) -> Self {
        Self {
            vm,
            cursor: 0,
            endianness: Endianness::Little,
        }
    }

    /// Sets the byte order for subsequent multi-byte reads.
    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    /// Moves the cursor to `address`.
    pub fn seek(&mut self, address: u64) {
        self.cursor = address;
    }

    /// Advances the cursor by `offset`.
    pub fn seek_relative(&mut self, offset: i64) {
        self.cursor = self.cursor.wrapping_add_signed(offset);
    }

    /// Current cursor position.
    pub fn offset(&self) -> u64 {
        self.cursor
    }

    /// Reads a u8 at the cursor.
    pub fn read_u8(&mut self) -> Result<u8> {
        let v = self.vm.read_u8(self.cursor)?;
        self.cursor += 1;
        Ok(v)
    }

    /// Reads a u32 at the cursor in the configured byte order.
    pub fn read_u32(&mut self) -> Result<u32> {
        let buf = self.vm.read_buffer(self.cursor, 4)?;
        self.cursor += 4;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u32(&buf),
            Endianness::Big => BigEndian::read_u32(&buf),
        })
    }

    /// Reads a u64 at the cursor in the configured byte order.
    pub fn read_u64(&mut self) -> Result<u64> {
        let buf = self.vm.read_buffer(self.cursor, 8)?;
        self.cursor += 8;
        Ok(match self.endianness {
            Endianness::Little => LittleEndian::read_u64(&buf),
            Endianness::Big => BigEndian::read_u64(&buf),
        })
    }

    /// Reads `dest.len()` bytes at the cursor.
    pub fn read_into(&mut self, dest: &mut [u8]) -> Result<()> {
        let buf = self.vm.read_buffer(self.cursor, dest.len())?;
        dest.copy_from_slice(&buf);
        self.cursor += dest.len() as u64;
        Ok(())
    }

    /// Reads a NUL-terminated string at `address`, leaving the cursor there.
    pub fn read_cstring(&mut self, address: u64) -> Result<String> {
        self.cursor = address;
        self.vm.read_cstring(address)
    }
}
