//! The host analysis view interface.
//!
//! The loader core does not own the binary-analysis framework; it drives it
//! through this narrow trait. Segments, sections, symbols, functions,
//! metadata storage, undo bracketing, and load settings are all the host's
//! responsibility. ObjC metadata post-processing is likewise external and
//! reached through [`ObjcProcessor`].

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::macho::constants::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};

bitflags! {
    /// Protection flags of a materialized segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// Readable
        const READABLE = 1 << 0;
        /// Writable
        const WRITABLE = 1 << 1;
        /// Executable
        const EXECUTABLE = 1 << 2;
        /// Writes permanently denied
        const DENY_WRITE = 1 << 3;
        /// Execution permanently denied
        const DENY_EXECUTE = 1 << 4;
    }
}

impl Default for SegmentFlags {
    fn default() -> Self {
        SegmentFlags::empty()
    }
}

impl SegmentFlags {
    /// Maps Mach-O VM protections onto segment flags. Deny bits are set
    /// when neither the initial nor the maximum protection grants the
    /// permission.
    pub fn from_macho_protections(init_prot: u32, max_prot: u32) -> Self {
        let mut flags = SegmentFlags::empty();
        if init_prot & VM_PROT_READ != 0 {
            flags |= SegmentFlags::READABLE;
        }
        if init_prot & VM_PROT_WRITE != 0 {
            flags |= SegmentFlags::WRITABLE;
        }
        if init_prot & VM_PROT_EXECUTE != 0 {
            flags |= SegmentFlags::EXECUTABLE;
        }
        if init_prot & VM_PROT_WRITE == 0 && max_prot & VM_PROT_WRITE == 0 {
            flags |= SegmentFlags::DENY_WRITE;
        }
        if init_prot & VM_PROT_EXECUTE == 0 && max_prot & VM_PROT_EXECUTE == 0 {
            flags |= SegmentFlags::DENY_EXECUTE;
        }
        flags
    }
}

impl Serialize for SegmentFlags {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(self.bits() as u64)
    }
}

impl<'de> Deserialize<'de> for SegmentFlags {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bits = u64::deserialize(d)?;
        Ok(SegmentFlags::from_bits_truncate(bits as u32))
    }
}

/// Semantics the host assigns to a defined section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionSemantics {
    /// No particular semantics.
    Default,
    /// Read-only code.
    ReadOnlyCode,
    /// Read-only data.
    ReadOnlyData,
    /// Read-write data.
    ReadWriteData,
}

/// Kind of a resolved symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SymbolKind {
    /// Function entry point.
    Function,
    /// Data object.
    Data,
    /// External (undefined here) symbol.
    External,
}

impl SymbolKind {
    /// Stable numeric encoding used in persisted metadata.
    pub fn as_u8(self) -> u8 {
        match self {
            SymbolKind::Function => 0,
            SymbolKind::Data => 1,
            SymbolKind::External => 2,
        }
    }

    /// Decodes the persisted encoding, defaulting unknown values to data.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => SymbolKind::Function,
            2 => SymbolKind::External,
            _ => SymbolKind::Data,
        }
    }
}

/// A named address produced by symtab or export-trie processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Virtual address.
    pub address: u64,
    /// Symbol kind.
    pub kind: SymbolKind,
    /// Raw name.
    pub name: String,
}

impl Symbol {
    /// Creates a symbol.
    pub fn new(address: u64, kind: SymbolKind, name: impl Into<String>) -> Self {
        Self {
            address,
            kind,
            name: name.into(),
        }
    }
}

// Symbols persist as [address, kind, name] triples.
impl Serialize for Symbol {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        (self.address, self.kind.as_u8(), &self.name).serialize(s)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let (address, kind, name): (u64, u8, String) = Deserialize::deserialize(d)?;
        Ok(Symbol {
            address,
            kind: SymbolKind::from_u8(kind),
            name,
        })
    }
}

/// The host analysis view consumed by the loader.
///
/// Implementations must be safe to call from multiple loader threads; the
/// loader serializes its own mutations but host callbacks may interleave
/// with host-driven analysis.
pub trait HostView: Send + Sync {
    /// Stable identifier of the session owning this view.
    fn session_id(&self) -> u64;

    /// Path of the primary cache file the view was opened on.
    fn original_file_path(&self) -> std::path::PathBuf;

    /// Reads a boolean load setting, returning `default` if unset.
    fn setting_bool(&self, key: &str, default: bool) -> bool {
        let _ = key;
        default
    }

    // ---- Raw view storage -------------------------------------------------

    /// Current end of the underlying raw view's storage.
    fn raw_view_end(&self) -> u64;

    /// Appends bytes to the raw view, returning the offset they landed at.
    fn append_raw_bytes(&self, data: &[u8]) -> u64;

    /// Writes bytes at a virtual address (the region must be mapped).
    fn write_virtual_bytes(&self, address: u64, data: &[u8]);

    /// Reads bytes back from a virtual address, if mapped.
    fn read_virtual_bytes(&self, address: u64, len: usize) -> Option<Vec<u8>>;

    // ---- Segments and sections -------------------------------------------

    /// Adds a segment to the raw view backing store.
    fn add_raw_segment(&self, raw_offset: u64, size: u64, flags: SegmentFlags);

    /// Adds a virtual segment mapping `address` to `raw_offset`.
    fn add_virtual_segment(&self, address: u64, size: u64, raw_offset: u64, flags: SegmentFlags);

    /// Defines a named section.
    fn add_section(
        &self,
        name: &str,
        address: u64,
        size: u64,
        semantics: SectionSemantics,
        section_type: &str,
        align: u64,
    );

    /// Returns true if `address` currently falls inside a mapped segment.
    fn is_address_mapped(&self, address: u64) -> bool;

    // ---- Symbols and functions -------------------------------------------

    /// Defines an automatic (analysis-owned) symbol.
    fn define_auto_symbol(&self, symbol: &Symbol);

    /// Defines a user symbol.
    fn define_user_symbol(&self, symbol: &Symbol);

    /// Defines a typed data variable at `address`.
    fn define_data_variable(&self, address: u64, type_name: &str);

    /// Queues a function for analysis at `address`.
    fn add_function(&self, address: u64);

    /// Returns true if analysis already has a function at `address`.
    fn has_function_at(&self, address: u64) -> bool;

    /// Returns the symbol defined at `address`, if any.
    fn symbol_at(&self, address: u64) -> Option<Symbol>;

    /// Requests reanalysis of the function at `address`.
    fn reanalyze_function(&self, address: u64) {
        let _ = address;
    }

    // ---- Type libraries ---------------------------------------------------

    /// Returns true if a type library exists for `install_name`.
    fn has_type_library(&self, install_name: &str) -> bool {
        let _ = install_name;
        false
    }

    /// Binds `symbol` to its imported type from the `install_name` type
    /// library. Returns true if a type was applied.
    fn bind_symbol_type(&self, install_name: &str, symbol: &Symbol) -> bool {
        let _ = (install_name, symbol);
        false
    }

    // ---- Function quirks --------------------------------------------------

    /// Marks the function at `address` as taking no variadic arguments.
    fn set_function_non_variadic(&self, address: u64) {
        let _ = address;
    }

    /// Binds the function at `address` to a single-`id`-parameter calling
    /// convention passing the argument in register `x<register>`.
    fn set_function_register_convention(&self, address: u64, register: u32) {
        let _ = (address, register);
    }

    // ---- Undo and analysis ------------------------------------------------

    /// Opens an undo bracket, returning its identifier.
    fn begin_undo_actions(&self) -> u64 {
        0
    }

    /// Commits an undo bracket.
    fn commit_undo_actions(&self, id: u64) {
        let _ = id;
    }

    /// Discards an undo bracket without rolling back.
    fn forget_undo_actions(&self, id: u64) {
        let _ = id;
    }

    /// Kicks the host's analysis update.
    fn update_analysis(&self) {}

    // ---- Metadata ---------------------------------------------------------

    /// Stores a metadata string on the view.
    fn store_metadata(&self, key: &str, value: &str);

    /// Stores a metadata string on the underlying raw view.
    fn store_raw_metadata(&self, key: &str, value: &str);

    /// Queries a metadata string from the view.
    fn query_metadata(&self, key: &str) -> Option<String>;
}

/// External ObjC metadata processor, invoked per image or globally.
pub trait ObjcProcessor: Send + Sync {
    /// Processes ObjC metadata (classes, methods, selectors) for an image.
    fn process_objc_data(&self, view: &dyn HostView, image_name: &str);

    /// Processes CFString literals for an image.
    fn process_cfstrings(&self, view: &dyn HostView, image_name: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_from_protections() {
        // r-x text segment
        let rx = SegmentFlags::from_macho_protections(0x5, 0x5);
        assert!(rx.contains(SegmentFlags::READABLE | SegmentFlags::EXECUTABLE));
        assert!(rx.contains(SegmentFlags::DENY_WRITE));
        assert!(!rx.contains(SegmentFlags::DENY_EXECUTE));

        // rw- data segment
        let rw = SegmentFlags::from_macho_protections(0x3, 0x3);
        assert!(rw.contains(SegmentFlags::READABLE | SegmentFlags::WRITABLE));
        assert!(rw.contains(SegmentFlags::DENY_EXECUTE));
        assert!(!rw.contains(SegmentFlags::DENY_WRITE));

        // r-- but max allows writes: no deny-write
        let r = SegmentFlags::from_macho_protections(0x1, 0x3);
        assert!(!r.contains(SegmentFlags::DENY_WRITE));
    }

    #[test]
    fn test_symbol_serde_shape() {
        let sym = Symbol::new(0x1_8000_1234, SymbolKind::Function, "_f");
        let json = serde_json::to_string(&sym).unwrap();
        assert_eq!(json, "[6442455604,0,\"_f\"]");
        let back: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sym);
    }
}
