//! Slide info parsing and in-place pointer rewriting.
//!
//! Stored pointers in the cache are chain-encoded so dyld can slide the
//! whole region at load time. The rewriter walks the v2/v3/v5 page-chain
//! encodings and writes resolved 64-bit virtual addresses back into the
//! (private, copy-on-write) mapping so that every stored pointer reads as a
//! usable address afterwards.
//!
//! Application is idempotent per file: `slide_applied` short-circuits a
//! second pass. Chain-read failures abandon the current chain and continue
//! with the rest.

use std::mem::size_of;

use tracing::{debug, error};

use crate::accessor::MappedFileAccessor;
use crate::dyld::structs::*;
use crate::error::Result;

/// One slide-info record: the mapping it covers plus the parsed
/// version-specific header.
struct SlideMapping {
    info: DyldCacheMappingInfo,
    slide_info_offset: u64,
    version: SlideVersion,
}

enum SlideVersion {
    V2(DyldCacheSlideInfo2),
    V3(DyldCacheSlideInfo3),
    V5(DyldCacheSlideInfo5),
}

/// Parses the slide info of `file` and rewrites every encoded pointer in
/// place. `base` is the cache base address (the first mapping of the
/// primary cache).
///
/// Returns the number of pointers rewritten; zero on the second and later
/// invocations.
pub fn parse_and_apply_slide_info(file: &MappedFileAccessor, base: u64) -> Result<u64> {
    if file.slide_applied() {
        return Ok(0);
    }

    let header: DyldCacheHeader = {
        let mut raw = [0u8; size_of::<DyldCacheHeader>()];
        let declared = file.read_u32(16)? as usize;
        let len = declared.min(raw.len());
        file.read_into(0, &mut raw[..len])?;
        zerocopy::FromBytes::read_from_bytes(&raw[..]).expect("header buffer is sized")
    };

    let mappings = collect_slide_mappings(file, &header, base)?;
    if mappings.is_empty() {
        debug!(path = %file.path().display(), "no slide info");
        file.set_slide_applied(true);
        return Ok(0);
    }

    let mut rewrites: Vec<(u64, u64)> = Vec::new();
    for mapping in &mappings {
        match &mapping.version {
            SlideVersion::V2(info) => {
                walk_v2(file, mapping, info, &mut rewrites);
            }
            SlideVersion::V3(info) => {
                walk_v3(file, mapping, info, &mut rewrites);
            }
            SlideVersion::V5(info) => {
                walk_v5(file, mapping, info, &mut rewrites);
            }
        }
    }

    let count = rewrites.len() as u64;
    for (loc, value) in rewrites {
        file.write_pointer(loc, value)?;
    }
    debug!(
        path = %file.path().display(),
        rewrites = count,
        "applied slide info"
    );
    file.set_slide_applied(true);
    Ok(count)
}

fn collect_slide_mappings(
    file: &MappedFileAccessor,
    header: &DyldCacheHeader,
    base: u64,
) -> Result<Vec<SlideMapping>> {
    let mut mappings = Vec::new();

    if header.slide_info_offset_unused != 0 {
        // Legacy single record; the covered mapping is the cache's second.
        let off = header.slide_info_offset_unused;
        let version = file.read_u32(off)?;
        let info: DyldCacheMappingInfo = file.read_obj(
            header.mapping_offset as u64 + size_of::<DyldCacheMappingInfo>() as u64,
        )?;
        let parsed = match version {
            2 => SlideVersion::V2(file.read_obj(off)?),
            3 => SlideVersion::V3(file.read_obj(off)?),
            other => {
                error!(version = other, "unsupported legacy slide info version");
                return Ok(mappings);
            }
        };
        mappings.push(SlideMapping {
            info,
            slide_info_offset: off,
            version: parsed,
        });
        return Ok(mappings);
    }

    if header.mapping_with_slide_count == 0 {
        debug!("no mappings with slide info");
        return Ok(mappings);
    }

    for i in 0..header.mapping_with_slide_count as u64 {
        let entry: DyldCacheMappingAndSlideInfo = file.read_obj(
            header.mapping_with_slide_offset as u64
                + i * size_of::<DyldCacheMappingAndSlideInfo>() as u64,
        )?;
        if entry.slide_info_file_offset == 0 || entry.size == 0 {
            continue;
        }

        let version = file.read_u32(entry.slide_info_file_offset)?;
        debug!(version, address = entry.address, "slide info record");
        let parsed = match version {
            2 => SlideVersion::V2(file.read_obj(entry.slide_info_file_offset)?),
            3 => {
                let mut info: DyldCacheSlideInfo3 = file.read_obj(entry.slide_info_file_offset)?;
                info.auth_value_add = base;
                SlideVersion::V3(info)
            }
            5 => {
                let mut info: DyldCacheSlideInfo5 = file.read_obj(entry.slide_info_file_offset)?;
                info.value_add = base;
                SlideVersion::V5(info)
            }
            other => {
                error!(version = other, "unknown slide info version, skipping record");
                continue;
            }
        };
        mappings.push(SlideMapping {
            info: DyldCacheMappingInfo {
                address: entry.address,
                size: entry.size,
                file_offset: entry.file_offset,
                max_prot: entry.max_prot,
                init_prot: entry.init_prot,
            },
            slide_info_offset: entry.slide_info_file_offset,
            version: parsed,
        });
    }

    Ok(mappings)
}

// =============================================================================
// v2
// =============================================================================

fn walk_v2(
    file: &MappedFileAccessor,
    mapping: &SlideMapping,
    info: &DyldCacheSlideInfo2,
    rewrites: &mut Vec<(u64, u64)>,
) {
    let page_starts_offset = mapping.slide_info_offset + info.page_starts_offset as u64;
    let extras_offset = mapping.slide_info_offset + info.page_extras_offset as u64;
    let page_size = info.page_size as u64;

    let mut cursor = page_starts_offset;
    for i in 0..info.page_starts_count as u64 {
        let start = match file.read_u16(cursor) {
            Ok(v) => v,
            Err(e) => {
                error!(offset = cursor, error = %e, "failed to read v2 page start");
                return;
            }
        };
        cursor += 2;

        if start == DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE {
            continue;
        }

        let page = mapping.info.file_offset + page_size * i;
        if start & DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA != 0 {
            // The low bits index into the extras array; walk chains until
            // one carries the END attribute.
            let mut j = (start & 0x3FFF) as u64;
            loop {
                let extra = match file.read_u16(extras_offset + j * 2) {
                    Ok(v) => v,
                    Err(e) => {
                        error!(index = j, error = %e, "failed to read v2 slide extra");
                        break;
                    }
                };
                let page_start_offset = ((extra & 0x3FFF) as u64) * 4;
                rebase_v2_chain(file, info, page, page_start_offset, rewrites);
                if extra & DYLD_CACHE_SLIDE_PAGE_ATTR_END != 0 {
                    break;
                }
                j += 1;
            }
        } else {
            rebase_v2_chain(file, info, page, (start as u64) * 4, rewrites);
        }
    }
}

fn rebase_v2_chain(
    file: &MappedFileAccessor,
    info: &DyldCacheSlideInfo2,
    page: u64,
    start_offset: u64,
    rewrites: &mut Vec<(u64, u64)>,
) {
    let delta_mask = info.delta_mask;
    let value_mask = info.value_mask();
    let value_add = info.value_add;
    let delta_shift = info.delta_shift();

    let mut page_offset = start_offset;
    let mut delta = 1u64;
    while delta != 0 {
        let loc = page + page_offset;
        let raw = match file.read_u64(loc) {
            Ok(v) => v,
            Err(e) => {
                error!(loc, error = %e, "failed to read v2 slide pointer");
                break;
            }
        };
        delta = (raw & delta_mask) >> delta_shift;
        let mut value = raw & value_mask;
        if value != 0 {
            value += value_add;
        }
        page_offset += delta;
        rewrites.push((loc, value));
    }
}

// =============================================================================
// v3
// =============================================================================

fn walk_v3(
    file: &MappedFileAccessor,
    mapping: &SlideMapping,
    info: &DyldCacheSlideInfo3,
    rewrites: &mut Vec<(u64, u64)>,
) {
    let page_starts_offset = mapping.slide_info_offset + size_of::<DyldCacheSlideInfo3>() as u64;
    let page_size = info.page_size as u64;

    let mut cursor = page_starts_offset;
    for i in 0..info.page_starts_count as u64 {
        let start = match file.read_u16(cursor) {
            Ok(v) => v,
            Err(e) => {
                error!(offset = cursor, error = %e, "failed to read v3 page start");
                return;
            }
        };
        cursor += 2;

        if start == DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
            continue;
        }

        // The initial page-start value is byte based; chain deltas are in
        // 8-byte strides.
        let mut delta = (start as u64) / 8;
        let mut loc = mapping.info.file_offset + page_size * i;
        loop {
            loc += delta * 8;
            let raw = match file.read_u64(loc) {
                Ok(v) => v,
                Err(e) => {
                    error!(loc, error = %e, "failed to read v3 slide pointer");
                    break;
                }
            };
            let ptr = SlidePointer3(raw);
            delta = ptr.offset_to_next_pointer();

            let value = if ptr.is_auth() {
                info.auth_value_add + ptr.offset_from_shared_cache_base()
            } else {
                ptr.plain_value()
            };
            rewrites.push((loc, value));

            if delta == 0 {
                break;
            }
        }
    }
}

// =============================================================================
// v5
// =============================================================================

fn walk_v5(
    file: &MappedFileAccessor,
    mapping: &SlideMapping,
    info: &DyldCacheSlideInfo5,
    rewrites: &mut Vec<(u64, u64)>,
) {
    let page_starts_offset = mapping.slide_info_offset + size_of::<DyldCacheSlideInfo5>() as u64;
    let page_size = info.page_size as u64;

    let mut cursor = page_starts_offset;
    for i in 0..info.page_starts_count as u64 {
        let start = match file.read_u16(cursor) {
            Ok(v) => v,
            Err(e) => {
                error!(offset = cursor, error = %e, "failed to read v5 page start");
                return;
            }
        };
        cursor += 2;

        if start == DYLD_CACHE_SLIDE_V5_PAGE_ATTR_NO_REBASE {
            continue;
        }

        let mut delta = (start as u64) / 8;
        let mut loc = mapping.info.file_offset + page_size * i;
        loop {
            loc += delta * 8;
            let raw = match file.read_u64(loc) {
                Ok(v) => v,
                Err(e) => {
                    error!(loc, error = %e, "failed to read v5 slide pointer");
                    break;
                }
            };
            let ptr = SlidePointer5(raw);
            delta = ptr.next();

            // Auth and plain pointers both resolve to base + runtime offset.
            let value = info.value_add + ptr.runtime_offset();
            rewrites.push((loc, value));

            if delta == 0 {
                break;
            }
        }
    }
}
