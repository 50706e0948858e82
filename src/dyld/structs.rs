//! Dyld shared cache binary structures.
//!
//! These match the on-disk format of Apple's dyld shared cache and are
//! parsed zero-copy. The header is variable length: fields past
//! `mapping_offset` do not exist in older caches, so callers read
//! `min(mapping_offset, size_of::<DyldCacheHeader>())` bytes into a zeroed
//! value and use [`DyldCacheHeader::contains_field`] before trusting late
//! fields.

use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, KnownLayout};

/// The magic string prefix for all dyld caches.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

// =============================================================================
// Slide Info Constants
// =============================================================================

/// v2: index is into the extras array, not the starts array.
pub const DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA: u16 = 0x8000;
/// v2: page has no rebasing.
pub const DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE: u16 = 0x4000;
/// v2: last chain entry for the page (in the extras array).
pub const DYLD_CACHE_SLIDE_PAGE_ATTR_END: u16 = 0x8000;
/// v3: page has no rebasing.
pub const DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE: u16 = 0xFFFF;
/// v5: page has no rebasing.
pub const DYLD_CACHE_SLIDE_V5_PAGE_ATTR_NO_REBASE: u16 = 0xFFFF;

// =============================================================================
// Header
// =============================================================================

/// The main dyld shared cache header.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheHeader {
    /// Magic identifier, e.g. "dyld_v1   arm64e"
    pub magic: [u8; 16],
    /// File offset to first `DyldCacheMappingInfo`
    pub mapping_offset: u32,
    /// Number of mapping entries
    pub mapping_count: u32,
    /// Legacy image list offset (moved to `images_offset` in newer caches)
    pub images_offset_old: u32,
    /// Legacy image count
    pub images_count_old: u32,
    /// Base address of dyld when cache was built
    pub dyld_base_address: u64,
    /// File offset of code signature
    pub code_signature_offset: u64,
    /// Size of code signature
    pub code_signature_size: u64,
    /// Legacy single-record slide info offset
    pub slide_info_offset_unused: u64,
    /// Legacy slide info size
    pub slide_info_size_unused: u64,
    /// File offset of local symbols info
    pub local_symbols_offset: u64,
    /// Size of local symbols info
    pub local_symbols_size: u64,
    /// UUID of this cache
    pub uuid: [u8; 16],
    /// Cache type: 0 development, 1 production, 2 multi-cache
    pub cache_type: u64,
    /// File offset to table of branch pool addresses
    pub branch_pools_offset: u32,
    /// Number of branch pool addresses
    pub branch_pools_count: u32,
    /// Unslid address of dyld's mach_header in the cache
    pub dyld_in_cache_mh: u64,
    /// Unslid address of dyld's entry point in the cache
    pub dyld_in_cache_entry: u64,
    /// File offset to image text info array
    pub images_text_offset: u64,
    /// Number of image text info entries
    pub images_text_count: u64,
    /// Address of patch info
    pub patch_info_addr: u64,
    /// Size of patch info
    pub patch_info_size: u64,
    /// Unused
    pub other_image_group_addr_unused: u64,
    /// Unused
    pub other_image_group_size_unused: u64,
    /// Address of program launch closures
    pub prog_closures_addr: u64,
    /// Size of program launch closures
    pub prog_closures_size: u64,
    /// Address of program launch closures trie
    pub prog_closures_trie_addr: u64,
    /// Size of program launch closures trie
    pub prog_closures_trie_size: u64,
    /// Platform number
    pub platform: u32,
    /// Format version (8 bits) and flag bits
    pub format_version_and_flags: u32,
    /// Base load address of cache if not slid
    pub shared_region_start: u64,
    /// Overall size required to map the cache and all subcaches
    pub shared_region_size: u64,
    /// Maximum runtime slide
    pub max_slide: u64,
    /// Address of dylibs ImageArray
    pub dylibs_image_array_addr: u64,
    /// Size of dylibs ImageArray
    pub dylibs_image_array_size: u64,
    /// Address of dylibs trie
    pub dylibs_trie_addr: u64,
    /// Size of dylibs trie
    pub dylibs_trie_size: u64,
    /// Address of other ImageArray
    pub other_image_array_addr: u64,
    /// Size of other ImageArray
    pub other_image_array_size: u64,
    /// Address of other trie
    pub other_trie_addr: u64,
    /// Size of other trie
    pub other_trie_size: u64,
    /// File offset to first `DyldCacheMappingAndSlideInfo`
    pub mapping_with_slide_offset: u32,
    /// Number of extended mapping entries
    pub mapping_with_slide_count: u32,
    /// Unused
    pub dylibs_pbl_state_array_addr_unused: u64,
    /// Address of dylibs PrebuiltLoaderSet
    pub dylibs_pbl_set_addr: u64,
    /// Address of programs PrebuiltLoaderSet pool
    pub programs_pbl_set_pool_addr: u64,
    /// Size of programs PrebuiltLoaderSet pool
    pub programs_pbl_set_pool_size: u64,
    /// Address of program trie
    pub program_trie_addr: u64,
    /// Size of program trie
    pub program_trie_size: u32,
    /// OS version of dylibs in this cache
    pub os_version: u32,
    /// Alternative platform (e.g. iOSMac)
    pub alt_platform: u32,
    /// Alternative OS version
    pub alt_os_version: u32,
    /// VM offset to Swift optimizations header
    pub swift_opts_offset: u64,
    /// Size of Swift optimizations header
    pub swift_opts_size: u64,
    /// File offset to first subcache entry
    pub sub_cache_array_offset: u32,
    /// Number of subcache entries
    pub sub_cache_array_count: u32,
    /// UUID of the .symbols subcache file
    pub symbol_file_uuid: [u8; 16],
    /// Rosetta read-only region address
    pub rosetta_read_only_addr: u64,
    /// Rosetta read-only region size
    pub rosetta_read_only_size: u64,
    /// Rosetta read-write region address
    pub rosetta_read_write_addr: u64,
    /// Rosetta read-write region size
    pub rosetta_read_write_size: u64,
    /// File offset to first `DyldCacheImageInfo` (new location)
    pub images_offset: u32,
    /// Number of images (new location)
    pub images_count: u32,
    /// Sub-cache type when `cache_type` is multi-cache
    pub cache_sub_type: u32,
    _pad1: u32,
    /// VM offset to ObjC optimizations header
    pub objc_opts_offset: u64,
    /// Size of ObjC optimizations header
    pub objc_opts_size: u64,
    /// VM offset to cache atlas
    pub cache_atlas_offset: u64,
    /// Size of cache atlas
    pub cache_atlas_size: u64,
    /// VM offset to dynamic data header
    pub dynamic_data_offset: u64,
    /// Maximum size of dynamic data
    pub dynamic_data_max_size: u64,
}

impl DyldCacheHeader {
    /// Checks whether a header field exists based on `mapping_offset`.
    #[inline]
    pub fn contains_field(&self, field_offset: usize) -> bool {
        field_offset < self.mapping_offset as usize
    }

    /// Returns true if the magic carries the "dyld" prefix.
    pub fn is_valid(&self) -> bool {
        &self.magic[..4] == DYLD_CACHE_MAGIC_PREFIX
    }

    /// Returns true if the header is long enough to describe subcaches.
    pub fn has_subcache_array(&self) -> bool {
        self.mapping_offset as usize > offset_of!(Self, sub_cache_array_offset)
    }

    /// Returns true if this cache uses the relocated image list.
    pub fn uses_new_images_offset(&self) -> bool {
        self.contains_field(offset_of!(Self, images_offset)) && self.images_offset != 0
    }
}

// =============================================================================
// Mappings and Images
// =============================================================================

/// Basic mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingInfo {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum memory protection
    pub max_prot: u32,
    /// Initial memory protection
    pub init_prot: u32,
}

/// Extended mapping entry carrying per-mapping slide info.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingAndSlideInfo {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Slide info file offset (0 if none)
    pub slide_info_file_offset: u64,
    /// Slide info file size
    pub slide_info_file_size: u64,
    /// Flags
    pub flags: u64,
    /// Maximum memory protection
    pub max_prot: u32,
    /// Initial memory protection
    pub init_prot: u32,
}

/// Information about a dylib in the cache.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageInfo {
    /// Address of the Mach-O header
    pub address: u64,
    /// Modification time
    pub mod_time: u64,
    /// Inode
    pub inode: u64,
    /// File offset to path string
    pub path_file_offset: u32,
    /// Padding
    pub pad: u32,
}

/// Subcache entry (newer format, explicit file extension).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldSubcacheEntry2 {
    /// UUID of the subcache
    pub uuid: [u8; 16],
    /// VM offset from the main cache
    pub cache_vm_offset: u64,
    /// File extension, e.g. ".01" or "dylddata"
    pub file_extension: [u8; 32],
}

impl DyldSubcacheEntry2 {
    /// Returns the file extension as a string (without guaranteeing a
    /// leading dot).
    pub fn extension(&self) -> String {
        crate::util::fixed_string(&self.file_extension)
    }
}

// =============================================================================
// Slide Info
// =============================================================================

/// Slide info version 2 (standard arm64).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo2 {
    /// Version (2)
    pub version: u32,
    /// Page size
    pub page_size: u32,
    /// Offset to page starts array (from the record start)
    pub page_starts_offset: u32,
    /// Number of page starts entries
    pub page_starts_count: u32,
    /// Offset to page extras array
    pub page_extras_offset: u32,
    /// Number of page extras entries
    pub page_extras_count: u32,
    /// Mask selecting the delta bits of an encoded pointer
    pub delta_mask: u64,
    /// Value added to non-zero rebased pointers
    pub value_add: u64,
}

impl DyldCacheSlideInfo2 {
    /// Mask selecting the value bits of an encoded pointer.
    #[inline]
    pub fn value_mask(&self) -> u64 {
        !self.delta_mask
    }

    /// Shift that turns masked delta bits into a byte delta.
    ///
    /// The delta field counts 4-byte units, hence the -2.
    #[inline]
    pub fn delta_shift(&self) -> u32 {
        self.delta_mask.trailing_zeros().saturating_sub(2)
    }
}

/// Slide info version 3 (arm64e with pointer authentication).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo3 {
    /// Version (3)
    pub version: u32,
    /// Page size
    pub page_size: u32,
    /// Number of page starts entries
    pub page_starts_count: u32,
    /// Padding
    pub _pad: u32,
    /// Value added to authenticated pointers
    pub auth_value_add: u64,
    // Followed by u16 page_starts[page_starts_count]
}

/// Slide info version 5 (arm64e, iOS 18+).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo5 {
    /// Version (5)
    pub version: u32,
    /// Page size
    pub page_size: u32,
    /// Number of page starts entries
    pub page_starts_count: u32,
    /// Padding
    pub _pad: u32,
    /// Value added to rebased pointers
    pub value_add: u64,
    // Followed by u16 page_starts[page_starts_count]
}

/// Encoded pointer for slide info v3.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer3(pub u64);

impl SlidePointer3 {
    /// True for authenticated pointers.
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Offset to the next rebase location, in 8-byte units.
    #[inline]
    pub fn offset_to_next_pointer(&self) -> u64 {
        (self.0 >> 51) & 0x7FF
    }

    /// Auth pointers: offset from the shared cache base.
    #[inline]
    pub fn offset_from_shared_cache_base(&self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }

    /// Plain pointers: the 51-bit packed pointer value, with the top 8 bits
    /// re-expanded to their architectural position.
    #[inline]
    pub fn plain_value(&self) -> u64 {
        let value51 = self.0 & 0x0007_FFFF_FFFF_FFFF;
        let top8 = value51 & 0x0007_F800_0000_0000;
        let bottom43 = value51 & 0x0000_07FF_FFFF_FFFF;
        (top8 << 13) | bottom43
    }
}

/// Encoded pointer for slide info v5.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer5(pub u64);

impl SlidePointer5 {
    /// True for authenticated pointers.
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Offset to the next rebase location, in 8-byte units.
    #[inline]
    pub fn next(&self) -> u64 {
        (self.0 >> 51) & 0x7FF
    }

    /// Offset from the shared cache base (both auth and plain forms).
    #[inline]
    pub fn runtime_offset(&self) -> u64 {
        self.0 & 0x0000_0003_FFFF_FFFF
    }
}
