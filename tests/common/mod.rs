//! Shared test infrastructure: a mock host view and synthetic cache file
//! builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem::offset_of;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dscload::dyld::structs::DyldCacheHeader;
use dscload::view::{HostView, SectionSemantics, SegmentFlags, Symbol};

// =============================================================================
// Mock Host View
// =============================================================================

#[derive(Default)]
pub struct ViewInner {
    pub raw: Vec<u8>,
    pub virtual_chunks: BTreeMap<u64, Vec<u8>>,
    pub raw_segments: Vec<(u64, u64, SegmentFlags)>,
    pub virtual_segments: Vec<(u64, u64, u64, SegmentFlags)>,
    pub sections: Vec<(String, u64, u64, SectionSemantics, String)>,
    pub auto_symbols: HashMap<u64, Symbol>,
    pub user_symbols: HashMap<u64, Symbol>,
    pub data_variables: Vec<(u64, String)>,
    pub functions: HashSet<u64>,
    pub metadata: HashMap<String, String>,
    pub raw_metadata: HashMap<String, String>,
    pub undo_count: u64,
    pub analysis_updates: u64,
}

pub struct MockView {
    session_id: u64,
    path: PathBuf,
    settings: HashMap<String, bool>,
    pub inner: Mutex<ViewInner>,
}

impl MockView {
    pub fn new(session_id: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            session_id,
            path: path.into(),
            settings: HashMap::new(),
            inner: Mutex::new(ViewInner::default()),
        }
    }

    pub fn with_setting(mut self, key: &str, value: bool) -> Self {
        self.settings.insert(key.to_string(), value);
        self
    }

    pub fn virtual_segment_count(&self) -> usize {
        self.inner.lock().unwrap().virtual_segments.len()
    }

    pub fn section_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .sections
            .iter()
            .map(|(name, ..)| name.clone())
            .collect()
    }

    pub fn symbol_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .auto_symbols
            .values()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn add_function_for_test(&self, address: u64) {
        self.inner.lock().unwrap().functions.insert(address);
    }
}

impl HostView for MockView {
    fn session_id(&self) -> u64 {
        self.session_id
    }

    fn original_file_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn setting_bool(&self, key: &str, default: bool) -> bool {
        self.settings.get(key).copied().unwrap_or(default)
    }

    fn raw_view_end(&self) -> u64 {
        self.inner.lock().unwrap().raw.len() as u64
    }

    fn append_raw_bytes(&self, data: &[u8]) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.raw.len() as u64;
        inner.raw.extend_from_slice(data);
        offset
    }

    fn write_virtual_bytes(&self, address: u64, data: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .virtual_chunks
            .insert(address, data.to_vec());
    }

    fn read_virtual_bytes(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let (start, chunk) = inner.virtual_chunks.range(..=address).next_back()?;
        let intra = (address - start) as usize;
        if intra + len > chunk.len() {
            return None;
        }
        Some(chunk[intra..intra + len].to_vec())
    }

    fn add_raw_segment(&self, raw_offset: u64, size: u64, flags: SegmentFlags) {
        self.inner
            .lock()
            .unwrap()
            .raw_segments
            .push((raw_offset, size, flags));
    }

    fn add_virtual_segment(&self, address: u64, size: u64, raw_offset: u64, flags: SegmentFlags) {
        self.inner
            .lock()
            .unwrap()
            .virtual_segments
            .push((address, size, raw_offset, flags));
    }

    fn add_section(
        &self,
        name: &str,
        address: u64,
        size: u64,
        semantics: SectionSemantics,
        section_type: &str,
        _align: u64,
    ) {
        self.inner.lock().unwrap().sections.push((
            name.to_string(),
            address,
            size,
            semantics,
            section_type.to_string(),
        ));
    }

    fn is_address_mapped(&self, address: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .virtual_segments
            .iter()
            .any(|(start, size, ..)| address >= *start && address < start + size)
    }

    fn define_auto_symbol(&self, symbol: &Symbol) {
        self.inner
            .lock()
            .unwrap()
            .auto_symbols
            .insert(symbol.address, symbol.clone());
    }

    fn define_user_symbol(&self, symbol: &Symbol) {
        self.inner
            .lock()
            .unwrap()
            .user_symbols
            .insert(symbol.address, symbol.clone());
    }

    fn define_data_variable(&self, address: u64, type_name: &str) {
        self.inner
            .lock()
            .unwrap()
            .data_variables
            .push((address, type_name.to_string()));
    }

    fn add_function(&self, address: u64) {
        self.inner.lock().unwrap().functions.insert(address);
    }

    fn has_function_at(&self, address: u64) -> bool {
        self.inner.lock().unwrap().functions.contains(&address)
    }

    fn symbol_at(&self, address: u64) -> Option<Symbol> {
        let inner = self.inner.lock().unwrap();
        inner
            .user_symbols
            .get(&address)
            .or_else(|| inner.auto_symbols.get(&address))
            .cloned()
    }

    fn begin_undo_actions(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.undo_count += 1;
        inner.undo_count
    }

    fn update_analysis(&self) {
        self.inner.lock().unwrap().analysis_updates += 1;
    }

    fn store_metadata(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .unwrap()
            .metadata
            .insert(key.to_string(), value.to_string());
    }

    fn store_raw_metadata(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .unwrap()
            .raw_metadata
            .insert(key.to_string(), value.to_string());
    }

    fn query_metadata(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().metadata.get(key).cloned()
    }
}

// =============================================================================
// Byte helpers
// =============================================================================

pub fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub fn put_str(buf: &mut [u8], off: usize, s: &str) {
    buf[off..off + s.len()].copy_from_slice(s.as_bytes());
}

/// Creates a fresh scratch directory for one test.
pub fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("dscload-it-{}-{}", std::process::id(), name));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write_file(path: &Path, contents: &[u8]) {
    std::fs::write(path, contents).unwrap();
}

// =============================================================================
// Mach-O image builder
// =============================================================================

pub const MH_MAGIC_64: u32 = 0xFEEDFACF;
pub const CPU_TYPE_ARM64: u32 = 12 | 0x0100_0000;
pub const MH_DYLIB: u32 = 0x6;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | 0x8000_0000;
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

pub struct SectionSpec {
    pub sectname: &'static str,
    pub segname: &'static str,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub flags: u32,
}

/// Builds raw Mach-O header + load command bytes.
pub struct MachoBuilder {
    buf: Vec<u8>,
    ncmds: u32,
}

impl MachoBuilder {
    pub fn new() -> Self {
        let mut buf = vec![0u8; 32];
        put_u32(&mut buf, 0, MH_MAGIC_64);
        put_u32(&mut buf, 4, CPU_TYPE_ARM64);
        put_u32(&mut buf, 12, MH_DYLIB);
        Self { buf, ncmds: 0 }
    }

    pub fn segment64(
        mut self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        maxprot: u32,
        initprot: u32,
        sections: &[SectionSpec],
    ) -> Self {
        let cmdsize = 72 + 80 * sections.len() as u32;
        let base = self.buf.len();
        self.buf.resize(base + cmdsize as usize, 0);
        put_u32(&mut self.buf, base, LC_SEGMENT_64);
        put_u32(&mut self.buf, base + 4, cmdsize);
        put_str(&mut self.buf, base + 8, name);
        put_u64(&mut self.buf, base + 24, vmaddr);
        put_u64(&mut self.buf, base + 32, vmsize);
        put_u64(&mut self.buf, base + 40, fileoff);
        put_u64(&mut self.buf, base + 48, filesize);
        put_u32(&mut self.buf, base + 56, maxprot);
        put_u32(&mut self.buf, base + 60, initprot);
        put_u32(&mut self.buf, base + 64, sections.len() as u32);

        for (i, sect) in sections.iter().enumerate() {
            let s = base + 72 + i * 80;
            put_str(&mut self.buf, s, sect.sectname);
            put_str(&mut self.buf, s + 16, sect.segname);
            put_u64(&mut self.buf, s + 32, sect.addr);
            put_u64(&mut self.buf, s + 40, sect.size);
            put_u32(&mut self.buf, s + 48, sect.offset);
            put_u32(&mut self.buf, s + 52, 2); // align
            put_u32(&mut self.buf, s + 64, sect.flags);
        }
        self.ncmds += 1;
        self
    }

    pub fn symtab(mut self, symoff: u32, nsyms: u32, stroff: u32, strsize: u32) -> Self {
        let base = self.buf.len();
        self.buf.resize(base + 24, 0);
        put_u32(&mut self.buf, base, LC_SYMTAB);
        put_u32(&mut self.buf, base + 4, 24);
        put_u32(&mut self.buf, base + 8, symoff);
        put_u32(&mut self.buf, base + 12, nsyms);
        put_u32(&mut self.buf, base + 16, stroff);
        put_u32(&mut self.buf, base + 20, strsize);
        self.ncmds += 1;
        self
    }

    pub fn exports_trie(mut self, dataoff: u32, datasize: u32) -> Self {
        let base = self.buf.len();
        self.buf.resize(base + 16, 0);
        put_u32(&mut self.buf, base, LC_DYLD_EXPORTS_TRIE);
        put_u32(&mut self.buf, base + 4, 16);
        put_u32(&mut self.buf, base + 8, dataoff);
        put_u32(&mut self.buf, base + 12, datasize);
        self.ncmds += 1;
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        let sizeofcmds = self.buf.len() as u32 - 32;
        put_u32(&mut self.buf, 16, self.ncmds);
        put_u32(&mut self.buf, 20, sizeofcmds);
        self.buf
    }
}

// =============================================================================
// Cache fixtures
// =============================================================================

pub const CACHE_BASE: u64 = 0x1_8000_0000;

/// A one-leaf export trie: `_f` at image offset 0x410.
pub fn leaf_export_trie() -> Vec<u8> {
    vec![
        0x00, 0x01, b'_', b'f', 0x00, 0x06, // root: one child "_f" at 6
        0x03, 0x00, 0x90, 0x08, // terminal: flags 0, ULEB128(0x410)
        0x00, // no children
    ]
}

/// Builds the regular-format two-image cache of the topology scenario:
///
/// - mapping 0: `0x1_8000_0000 + 0x3000` r-x at file offset 0x1000,
///   containing image A (`/usr/lib/libA.dylib`, TEXT 0x2000) and image B
///   (`/usr/lib/libB.dylib`, TEXT 0x1000)
/// - mapping 1: `0x1_8010_0000 + 0x1000` rw- at 0x4000 (no image)
/// - mapping 2: `0x1_8020_0000 + 0x1000` r-- at 0x5000, image A's LINKEDIT
///   with symtab (`_symA`) and a `_f` export trie
pub fn build_regular_cache(path: &Path) {
    let mut buf = vec![0u8; 0x8000];
    put_str(&mut buf, 0, "dyld_v1   arm64");

    // Short header: ends before the subcache array fields.
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_offset), 0x180);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), 3);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, images_offset_old), 0x400);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, images_count_old), 2);

    // Mappings.
    let mappings = [
        (CACHE_BASE, 0x3000u64, 0x1000u64, 5u32, 5u32),
        (0x1_8010_0000, 0x1000, 0x4000, 3, 3),
        (0x1_8020_0000, 0x1000, 0x5000, 1, 1),
    ];
    for (i, (addr, size, fileoff, maxprot, initprot)) in mappings.iter().enumerate() {
        let off = 0x180 + i * 32;
        put_u64(&mut buf, off, *addr);
        put_u64(&mut buf, off + 8, *size);
        put_u64(&mut buf, off + 16, *fileoff);
        put_u32(&mut buf, off + 24, *maxprot);
        put_u32(&mut buf, off + 28, *initprot);
    }

    // Images.
    put_u64(&mut buf, 0x400, CACHE_BASE);
    put_u32(&mut buf, 0x418, 0x500);
    put_u64(&mut buf, 0x420, CACHE_BASE + 0x2000);
    put_u32(&mut buf, 0x438, 0x520);
    put_str(&mut buf, 0x500, "/usr/lib/libA.dylib");
    put_str(&mut buf, 0x520, "/usr/lib/libB.dylib");

    // Image A at file offset 0x1000 (VA CACHE_BASE).
    let trie = leaf_export_trie();
    let image_a = MachoBuilder::new()
        .segment64(
            "__TEXT",
            CACHE_BASE,
            0x2000,
            0x1000,
            0x2000,
            5,
            5,
            &[SectionSpec {
                sectname: "__text",
                segname: "__TEXT",
                addr: CACHE_BASE + 0x400,
                size: 0x1C00,
                offset: 0x1400,
                flags: S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            }],
        )
        .segment64("__LINKEDIT", 0x1_8020_0000, 0x1000, 0x5000, 0x1000, 1, 1, &[])
        .symtab(0x5000, 1, 0x5100, 0x20)
        .exports_trie(0x5200, trie.len() as u32)
        .finish();
    buf[0x1000..0x1000 + image_a.len()].copy_from_slice(&image_a);

    // Image B at file offset 0x3000 (VA CACHE_BASE + 0x2000).
    let image_b = MachoBuilder::new()
        .segment64(
            "__TEXT",
            CACHE_BASE + 0x2000,
            0x1000,
            0x3000,
            0x1000,
            5,
            5,
            &[SectionSpec {
                sectname: "__text",
                segname: "__TEXT",
                addr: CACHE_BASE + 0x2100,
                size: 0xF00,
                offset: 0x3100,
                flags: S_ATTR_SOME_INSTRUCTIONS,
            }],
        )
        .finish();
    buf[0x3000..0x3000 + image_b.len()].copy_from_slice(&image_b);

    // LINKEDIT contents: one nlist_64 entry for `_symA` inside `__text`.
    put_u32(&mut buf, 0x5000, 1); // n_strx
    buf[0x5004] = 0x0E; // N_SECT
    buf[0x5005] = 1; // section 1
    put_u64(&mut buf, 0x5008, CACHE_BASE + 0x400);
    put_str(&mut buf, 0x5100, "\0_symA");
    buf[0x5200..0x5200 + trie.len()].copy_from_slice(&trie);

    write_file(path, &buf);
}

/// Builds a split-format cache: a long-header primary reporting two
/// subcaches, plus `.1`, `.2` (single-mapping stub islands) and `.symbols`
/// siblings.
pub fn build_split_cache(path: &Path) {
    let mut buf = vec![0u8; 0x4000];
    put_str(&mut buf, 0, "dyld_v1  arm64e");

    // Long header: all fields present.
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_offset), 0x200);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), 1);
    put_u64(&mut buf, offset_of!(DyldCacheHeader, cache_type), 1);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, sub_cache_array_count), 2);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, images_offset), 0x400);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, images_count), 1);

    // Primary mapping.
    put_u64(&mut buf, 0x200, CACHE_BASE);
    put_u64(&mut buf, 0x208, 0x1000);
    put_u64(&mut buf, 0x210, 0x1000);
    put_u32(&mut buf, 0x218, 5);
    put_u32(&mut buf, 0x21C, 5);

    // One image.
    put_u64(&mut buf, 0x400, CACHE_BASE);
    put_u32(&mut buf, 0x418, 0x500);
    put_str(&mut buf, 0x500, "/usr/lib/libA.dylib");

    let image = MachoBuilder::new()
        .segment64("__TEXT", CACHE_BASE, 0x1000, 0x1000, 0x1000, 5, 5, &[])
        .finish();
    buf[0x1000..0x1000 + image.len()].copy_from_slice(&image);
    write_file(path, &buf);

    // Subcaches: single mapping each, no images -> stub islands.
    for (i, addr) in [(1u32, 0x1_8010_0000u64), (2, 0x1_8020_0000)] {
        let mut sub = vec![0u8; 0x2000];
        put_str(&mut sub, 0, "dyld_v1  arm64e");
        put_u32(&mut sub, offset_of!(DyldCacheHeader, mapping_offset), 0x180);
        put_u32(&mut sub, offset_of!(DyldCacheHeader, mapping_count), 1);
        put_u64(&mut sub, 0x180, addr);
        put_u64(&mut sub, 0x188, 0x1000);
        put_u64(&mut sub, 0x190, 0x1000);
        put_u32(&mut sub, 0x198, 5);
        put_u32(&mut sub, 0x19C, 5);
        // Recognizable stub bytes.
        sub[0x1000..0x1010].copy_from_slice(&[0xAA; 16]);
        write_file(&suffixed(path, &format!(".{i}")), &sub);
    }

    // .symbols companion: one mapping, not a stub island candidate by path.
    let mut sym = vec![0u8; 0x2000];
    put_str(&mut sym, 0, "dyld_v1  arm64e");
    put_u32(&mut sym, offset_of!(DyldCacheHeader, mapping_offset), 0x180);
    put_u32(&mut sym, offset_of!(DyldCacheHeader, mapping_count), 1);
    put_u64(&mut sym, 0x180, 0x1_8030_0000);
    put_u64(&mut sym, 0x188, 0x1000);
    put_u64(&mut sym, 0x190, 0x1000);
    put_u32(&mut sym, 0x198, 1);
    put_u32(&mut sym, 0x19C, 1);
    write_file(&suffixed(path, ".symbols"), &sym);
}

pub fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
