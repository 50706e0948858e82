//! Cache format detection and topology enumeration.
//!
//! Reads the primary `dyld_cache_header`, classifies the cache format,
//! and enumerates subcaches, mappings, image starts, branch pools, and the
//! ObjC optimization range. Materializing any of it into a view is the
//! controller's job; this module only produces the [`CacheTopology`]
//! description.

use std::collections::BTreeMap;
use std::mem::size_of;
use std::path::Path;

use tracing::{debug, info, warn};
use zerocopy::FromBytes;

use super::structs::*;
use crate::accessor::{self, MappedFileAccessor};
use crate::error::{Error, Result};
use crate::state::{BackingCache, CacheFormat, MemoryRegion};
use crate::util::base_name;
use crate::view::SegmentFlags;

/// Everything learned about the cache layout before images are parsed.
#[derive(Debug, Default)]
pub struct CacheTopology {
    /// Detected format.
    pub format: CacheFormat,
    /// Backing cache files in discovery order; the primary is first.
    pub backing_caches: Vec<BackingCache>,
    /// Install name to header address.
    pub image_starts: BTreeMap<String, u64>,
    /// Stub island regions discovered from single-mapping subcaches.
    pub stub_islands: Vec<MemoryRegion>,
    /// dyld-data regions from `.dylddata` subcaches.
    pub dyld_data_regions: Vec<MemoryRegion>,
    /// Branch pool header addresses (Regular format only; other formats
    /// record pools directly as pseudo image starts).
    pub branch_pools: Vec<u64>,
    /// `(offset, size)` of ObjC optimization data in the primary cache.
    pub objc_optimization_data_range: Option<(u64, u64)>,
}

/// Reads the variable-length cache header: `mapping_offset` bounds how many
/// bytes of the struct actually exist on disk; absent fields stay zero.
pub fn read_cache_header(file: &MappedFileAccessor) -> Result<DyldCacheHeader> {
    let magic = file.read_span(0, 4)?;
    if magic != DYLD_CACHE_MAGIC_PREFIX {
        return Err(Error::InvalidMagic([magic[0], magic[1], magic[2], magic[3]]));
    }

    let mut raw = [0u8; size_of::<DyldCacheHeader>()];
    let declared = file.read_u32(16)? as usize;
    if declared > raw.len() {
        debug!(
            declared,
            expected = raw.len(),
            "cache header longer than known layout, truncating"
        );
    }
    let len = declared.min(raw.len());
    file.read_into(0, &mut raw[..len])?;
    Ok(DyldCacheHeader::read_from_bytes(&raw[..]).expect("header buffer is exactly sized"))
}

fn detect_format(path: &Path, header: &DyldCacheHeader) -> CacheFormat {
    if !header.has_subcache_array() {
        return CacheFormat::Regular;
    }
    if header.cache_type == 2 {
        return CacheFormat::IOS16;
    }
    let sibling = sibling_path(path, ".01");
    if sibling.exists() {
        CacheFormat::Large
    } else {
        CacheFormat::Split
    }
}

fn sibling_path(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}

/// Classifies the cache and returns the number of backing files it will
/// use, without building any state.
pub fn fast_backing_cache_count(session_id: u64, path: &Path) -> Result<u64> {
    let file = accessor::open(session_id, path).lock()?;
    let header = read_cache_header(&file)?;
    let format = detect_format(path, &header);
    Ok(match format {
        CacheFormat::Regular => 1,
        CacheFormat::Large => header.sub_cache_array_count as u64 + 1,
        CacheFormat::Split | CacheFormat::IOS16 => header.sub_cache_array_count as u64 + 2,
    })
}

fn read_mappings(
    file: &MappedFileAccessor,
    header: &DyldCacheHeader,
) -> Result<Vec<DyldCacheMappingInfo>> {
    let mut mappings = Vec::with_capacity(header.mapping_count as usize);
    for i in 0..header.mapping_count as u64 {
        let mapping: DyldCacheMappingInfo = file.read_obj(
            header.mapping_offset as u64 + i * size_of::<DyldCacheMappingInfo>() as u64,
        )?;
        mappings.push(mapping);
    }
    Ok(mappings)
}

fn read_image_starts(
    file: &MappedFileAccessor,
    offset: u64,
    count: u64,
    out: &mut BTreeMap<String, u64>,
) -> Result<()> {
    for i in 0..count {
        let img: DyldCacheImageInfo =
            file.read_obj(offset + i * size_of::<DyldCacheImageInfo>() as u64)?;
        let name = file.read_cstring(img.path_file_offset as u64)?;
        out.insert(name, img.address);
    }
    Ok(())
}

/// A subcache is a stub island when it has exactly one mapping and carries
/// no images of its own.
fn is_stub_island(header: &DyldCacheHeader) -> bool {
    header.mapping_count == 1
        && header.images_count_old == 0
        && header.images_count == 0
        && header.images_text_offset == 0
}

struct SubcacheLoad<'a> {
    session_id: u64,
    main_file_name: &'a str,
    topology: &'a mut CacheTopology,
}

impl SubcacheLoad<'_> {
    fn load(&mut self, sub_path: &Path, sub_file_name: &str, classify: bool) -> Result<()> {
        let file = accessor::open(self.session_id, sub_path).lock()?;
        let header = read_cache_header(&file)?;
        let mappings = read_mappings(&file, &header)?;

        if classify {
            if sub_path.to_string_lossy().contains(".dylddata") {
                for (j, mapping) in mappings.iter().enumerate() {
                    self.topology.dyld_data_regions.push(MemoryRegion::new(
                        format!("{sub_file_name}::_data{j}"),
                        mapping.address,
                        mapping.size,
                        SegmentFlags::READABLE,
                    ));
                }
            }

            if is_stub_island(&header) {
                let mapping = &mappings[0];
                self.topology.stub_islands.push(MemoryRegion::new(
                    format!("{sub_file_name}::_stubs"),
                    mapping.address,
                    mapping.size,
                    SegmentFlags::READABLE | SegmentFlags::EXECUTABLE,
                ));
            }
        }

        self.topology.backing_caches.push(BackingCache {
            path: sub_path.to_string_lossy().into_owned(),
            is_primary: false,
            mappings,
        });
        Ok(())
    }

    fn load_symbols_companion(&mut self, primary_path: &Path) {
        let sym_path = sibling_path(primary_path, ".symbols");
        let sub_file_name = format!("{}.symbols", self.main_file_name);
        match self.load(&sym_path, &sub_file_name, false) {
            Ok(()) => debug!(path = %sym_path.display(), "loaded .symbols companion"),
            Err(e) => debug!(path = %sym_path.display(), error = %e, "no .symbols companion"),
        }
    }
}

/// Parses the cache topology rooted at `path`.
pub fn parse_topology(session_id: u64, path: &Path) -> Result<CacheTopology> {
    let base_file = accessor::open(session_id, path).lock()?;
    let header = read_cache_header(&base_file)?;

    let mut topology = CacheTopology {
        format: detect_format(path, &header),
        ..Default::default()
    };

    if header.objc_opts_offset != 0 && header.objc_opts_size != 0 {
        topology.objc_optimization_data_range =
            Some((header.objc_opts_offset, header.objc_opts_size));
    }

    topology.backing_caches.push(BackingCache {
        path: path.to_string_lossy().into_owned(),
        is_primary: true,
        mappings: read_mappings(&base_file, &header)?,
    });

    let main_file_name = base_name(&path.to_string_lossy()).to_string();

    match topology.format {
        CacheFormat::Regular => {
            read_image_starts(
                &base_file,
                header.images_offset_old as u64,
                header.images_count_old as u64,
                &mut topology.image_starts,
            )?;
            info!(
                images = header.images_count_old,
                "found images in the shared cache"
            );

            for i in 0..header.branch_pools_count as u64 {
                topology
                    .branch_pools
                    .push(base_file.read_u64(header.branch_pools_offset as u64 + i * 8)?);
            }
            if header.branch_pools_count > 0 {
                info!(
                    pools = header.branch_pools_count,
                    "found branch pools in the shared cache"
                );
            }
        }
        CacheFormat::Large | CacheFormat::IOS16 => {
            read_image_starts(
                &base_file,
                header.images_offset as u64,
                header.images_count as u64,
                &mut topology.image_starts,
            )?;
            record_branch_pool_starts(&base_file, &header, &mut topology)?;

            let mut entries = Vec::with_capacity(header.sub_cache_array_count as usize);
            for i in 0..header.sub_cache_array_count as u64 {
                let entry: DyldSubcacheEntry2 = base_file.read_obj(
                    header.sub_cache_array_offset as u64
                        + i * size_of::<DyldSubcacheEntry2>() as u64,
                )?;
                entries.push(entry);
            }
            drop(base_file);

            let mut loader = SubcacheLoad {
                session_id,
                main_file_name: &main_file_name,
                topology: &mut topology,
            };
            for entry in &entries {
                let ext = entry.extension();
                let suffix = if ext.contains('.') {
                    ext
                } else {
                    format!(".{ext}")
                };
                let sub_path = sibling_path(path, &suffix);
                let sub_file_name = format!("{main_file_name}{suffix}");
                loader.load(&sub_path, &sub_file_name, true)?;
            }
            if loader.topology.format == CacheFormat::IOS16 {
                loader.load_symbols_companion(path);
            }
        }
        CacheFormat::Split => {
            read_image_starts(
                &base_file,
                header.images_offset as u64,
                header.images_count as u64,
                &mut topology.image_starts,
            )?;
            record_branch_pool_starts(&base_file, &header, &mut topology)?;
            let subcache_count = header.sub_cache_array_count;
            drop(base_file);

            let mut loader = SubcacheLoad {
                session_id,
                main_file_name: &main_file_name,
                topology: &mut topology,
            };
            for i in 1..=subcache_count as u64 {
                let suffix = format!(".{i}");
                let sub_path = sibling_path(path, &suffix);
                let sub_file_name = format!("{main_file_name}{suffix}");
                loader.load(&sub_path, &sub_file_name, true)?;
            }
            loader.load_symbols_companion(path);
        }
    }

    if topology.image_starts.is_empty() {
        warn!("shared cache reports no images");
    }

    Ok(topology)
}

/// Branch pool entries become pseudo image starts on the new formats; the
/// Regular format instead parses each pool header and records stub islands.
fn record_branch_pool_starts(
    file: &MappedFileAccessor,
    header: &DyldCacheHeader,
    topology: &mut CacheTopology,
) -> Result<()> {
    for i in 0..header.branch_pools_count as u64 {
        let address = file.read_u64(header.branch_pools_offset as u64 + i * 8)?;
        topology
            .image_starts
            .insert(format!("dyld_shared_cache_branch_islands_{i}"), address);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::mem::offset_of;
    use std::path::PathBuf;

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn write_temp(name: &str, contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dscload-topo-{}-{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    /// Minimal regular-format cache: short header (mapping_offset below the
    /// subcache array field), one mapping, one image.
    fn regular_cache() -> Vec<u8> {
        let mut buf = vec![0u8; 0x1000];
        buf[0..15].copy_from_slice(b"dyld_v1  arm64\0");
        // Short header: pretend the header ends right after the legacy
        // image fields.
        put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_offset), 0x100);
        put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), 1);
        put_u32(&mut buf, offset_of!(DyldCacheHeader, images_offset_old), 0x200);
        put_u32(&mut buf, offset_of!(DyldCacheHeader, images_count_old), 1);

        // Mapping at 0x100.
        put_u64(&mut buf, 0x100, 0x1_8000_0000);
        put_u64(&mut buf, 0x108, 0x1000);
        put_u64(&mut buf, 0x110, 0);
        put_u32(&mut buf, 0x118, 5);
        put_u32(&mut buf, 0x11C, 5);

        // Image at 0x200 -> path at 0x300.
        put_u64(&mut buf, 0x200, 0x1_8000_0000);
        put_u32(&mut buf, 0x218, 0x300);
        buf[0x300..0x314].copy_from_slice(b"/usr/lib/libA.dylib\0");
        buf
    }

    #[test]
    fn test_short_header_is_regular() {
        let path = write_temp("regular", &regular_cache());
        let file = accessor::open(9301, &path).lock().unwrap();
        let header = read_cache_header(&file).unwrap();
        assert!(!header.has_subcache_array());
        assert_eq!(detect_format(&path, &header), CacheFormat::Regular);
        drop(file);

        assert_eq!(fast_backing_cache_count(9301, &path).unwrap(), 1);

        let topology = parse_topology(9301, &path).unwrap();
        assert_eq!(topology.format, CacheFormat::Regular);
        assert_eq!(topology.backing_caches.len(), 1);
        assert!(topology.backing_caches[0].is_primary);
        assert_eq!(topology.backing_caches[0].mappings.len(), 1);
        assert_eq!(
            topology.image_starts.get("/usr/lib/libA.dylib"),
            Some(&0x1_8000_0000)
        );

        accessor::close_session(9301);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut image = regular_cache();
        image[0..4].copy_from_slice(b"nope");
        let path = write_temp("badmagic", &image);
        let file = accessor::open(9302, &path).lock().unwrap();
        assert!(matches!(
            read_cache_header(&file),
            Err(Error::InvalidMagic(_))
        ));
        accessor::close_session(9302);
        std::fs::remove_file(&path).ok();
    }
}
