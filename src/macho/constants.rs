//! Mach-O constants consulted by the loader.

// =============================================================================
// Magic Numbers
// =============================================================================

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;
/// 32-bit Mach-O magic (byte-swapped)
pub const MH_CIGAM: u32 = 0xCEFAEDFE;
/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;
/// 64-bit Mach-O magic (byte-swapped)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

// =============================================================================
// Header Flags
// =============================================================================

/// Read-only and read-write segments are split
pub const MH_SPLIT_SEGS: u32 = 0x20;

// =============================================================================
// VM Protections
// =============================================================================

/// Readable
pub const VM_PROT_READ: u32 = 0x1;
/// Writable
pub const VM_PROT_WRITE: u32 = 0x2;
/// Executable
pub const VM_PROT_EXECUTE: u32 = 0x4;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Segment of this file (32-bit)
pub const LC_SEGMENT: u32 = 0x1;
/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Thread
pub const LC_THREAD: u32 = 0x4;
/// Unix thread
pub const LC_UNIXTHREAD: u32 = 0x5;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared library identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Image routines (32-bit)
pub const LC_ROUTINES: u32 = 0x11;
/// Load a weak dylib
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// 64-bit image routines
pub const LC_ROUTINES_64: u32 = 0x1A;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Code signature location
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Segment split info location
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;
/// Re-exported dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Encrypted segment information
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// macOS min version
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
/// iOS min version
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
/// Function starts table location
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// Main entry point
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
/// Data-in-code table location
pub const LC_DATA_IN_CODE: u32 = 0x29;
/// Code signing DRs
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2B;
/// Platform build version
pub const LC_BUILD_VERSION: u32 = 0x32;
/// Export trie location
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// Chained fixups location
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;
/// File set entry
pub const LC_FILESET_ENTRY: u32 = 0x35 | LC_REQ_DYLD;

// =============================================================================
// Section Types and Attributes
// =============================================================================

/// Section type mask (low byte of flags)
pub const SECTION_TYPE: u32 = 0x0000_00FF;

/// Regular section
pub const S_REGULAR: u32 = 0x0;
/// Zero fill on demand
pub const S_ZEROFILL: u32 = 0x1;
/// Literal C strings
pub const S_CSTRING_LITERALS: u32 = 0x2;
/// 4-byte literals
pub const S_4BYTE_LITERALS: u32 = 0x3;
/// 8-byte literals
pub const S_8BYTE_LITERALS: u32 = 0x4;
/// Pointers to literals
pub const S_LITERAL_POINTERS: u32 = 0x5;
/// Non-lazy symbol pointers
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6;
/// Lazy symbol pointers
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7;
/// Symbol stubs
pub const S_SYMBOL_STUBS: u32 = 0x8;
/// Module init function pointers
pub const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9;
/// Module termination function pointers
pub const S_MOD_TERM_FUNC_POINTERS: u32 = 0xA;
/// Coalesced symbols
pub const S_COALESCED: u32 = 0xB;
/// Zero fill (>4GB)
pub const S_GB_ZEROFILL: u32 = 0xC;
/// Interposing function pointer pairs
pub const S_INTERPOSING: u32 = 0xD;
/// 16-byte literals
pub const S_16BYTE_LITERALS: u32 = 0xE;
/// DTrace Object Format
pub const S_DTRACE_DOF: u32 = 0xF;
/// Lazy symbol pointers to lazy-loaded dylibs
pub const S_LAZY_DYLIB_SYMBOL_POINTERS: u32 = 0x10;
/// Thread-local regular section
pub const S_THREAD_LOCAL_REGULAR: u32 = 0x11;
/// Thread-local zerofill
pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;
/// Thread-local variables
pub const S_THREAD_LOCAL_VARIABLES: u32 = 0x13;
/// Thread-local variable pointers
pub const S_THREAD_LOCAL_VARIABLE_POINTERS: u32 = 0x14;
/// Thread-local init function pointers
pub const S_THREAD_LOCAL_INIT_FUNCTION_POINTERS: u32 = 0x15;

/// Section contains only true machine instructions
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
/// Self-modifying code
pub const S_ATTR_SELF_MODIFYING_CODE: u32 = 0x0400_0000;
/// Section contains some machine instructions
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

// =============================================================================
// Symbol Table
// =============================================================================

/// Mask for the type bits of `n_type`
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;
/// Absolute symbol
pub const N_ABS: u8 = 0x2;
/// Defined in section `n_sect`
pub const N_SECT: u8 = 0xE;
/// Indirect symbol
pub const N_INDR: u8 = 0xA;
/// Thumb function (n_desc flag)
pub const N_ARM_THUMB_DEF: u16 = 0x0008;

// =============================================================================
// Export Trie Flags
// =============================================================================

/// Re-export from another dylib
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
