//! Materialization scenarios: image loading, stub island sections,
//! idempotence, and metadata round-trips.

mod common;

use std::sync::Arc;

use common::*;
use dscload::{
    HostView, SegmentFlags, SharedCache, State, SymbolKind, ViewState, SHARED_CACHE_METADATA_TAG,
};

fn saved_state(view: &MockView) -> State {
    State::from_json(&view.query_metadata(SHARED_CACHE_METADATA_TAG).unwrap()).unwrap()
}

#[test]
fn load_image_defines_segments_sections_and_symbols() {
    let dir = test_dir("loadimage");
    let path = dir.join("dyld_shared_cache_arm64");
    build_regular_cache(&path);

    let view = Arc::new(MockView::new(7101, &path));
    let mut cache = SharedCache::open(view.clone()).unwrap();

    assert!(cache.load_image_with_install_name("/usr/lib/libA.dylib", true));
    assert_eq!(cache.view_state(), ViewState::LoadedWithImages);

    // Only __TEXT materialized; __LINKEDIT is gated off by default.
    assert_eq!(view.virtual_segment_count(), 1);
    {
        let inner = view.inner.lock().unwrap();
        let (start, size, _raw, flags) = inner.virtual_segments[0];
        assert_eq!(start, CACHE_BASE);
        assert_eq!(size, 0x2000);
        assert!(flags.contains(SegmentFlags::READABLE | SegmentFlags::EXECUTABLE));
    }

    // The image's section was defined with its prefixed name.
    assert!(view
        .section_names()
        .iter()
        .any(|n| n == "libA.dylib::__text"));

    // Symtab symbol and export both resolved as functions.
    {
        let inner = view.inner.lock().unwrap();
        let sym_a = &inner.auto_symbols[&(CACHE_BASE + 0x400)];
        assert_eq!(sym_a.name, "_symA");
        assert_eq!(sym_a.kind, SymbolKind::Function);
        let f = &inner.auto_symbols[&(CACHE_BASE + 0x410)];
        assert_eq!(f.name, "_f");
        assert_eq!(f.kind, SymbolKind::Function);
        assert!(inner.functions.contains(&(CACHE_BASE + 0x400)));
        // Header data variables were applied over the Mach-O header.
        assert!(inner
            .data_variables
            .iter()
            .any(|(addr, ty)| *addr == CACHE_BASE && ty == "mach_header_64"));
    }

    // The state remembers symbol and export info keyed by text base.
    let state = saved_state(&view);
    assert_eq!(state.symbol_infos[&CACHE_BASE].len(), 1);
    assert!(state.export_infos[&CACHE_BASE]
        .iter()
        .any(|s| s.name == "_f" && s.address == CACHE_BASE + 0x410));

    // The materialized bytes match the backing file through the view.
    let written = view.read_virtual_bytes(CACHE_BASE, 4).unwrap();
    assert_eq!(&written, &0xFEEDFACFu32.to_le_bytes());
}

#[test]
fn load_image_is_idempotent() {
    let dir = test_dir("loadtwice");
    let path = dir.join("dyld_shared_cache_arm64");
    build_regular_cache(&path);

    let view = Arc::new(MockView::new(7102, &path));
    let mut cache = SharedCache::open(view.clone()).unwrap();

    assert!(cache.load_image_with_install_name("/usr/lib/libA.dylib", true));
    let segments_after_first = view.virtual_segment_count();
    let raw_after_first = view.raw_view_end();

    // Second load succeeds without adding host-view segments or bytes.
    assert!(cache.load_image_with_install_name("/usr/lib/libA.dylib", true));
    assert_eq!(view.virtual_segment_count(), segments_after_first);
    assert_eq!(view.raw_view_end(), raw_after_first);

    let state = saved_state(&view);
    let image = state
        .images
        .iter()
        .find(|i| i.install_name == "/usr/lib/libA.dylib")
        .unwrap();
    let text = image
        .regions
        .iter()
        .find(|r| r.pretty_name.contains("__TEXT"))
        .unwrap();
    assert!(text.loaded);
    assert!(text.header_initialized);
    assert_eq!(
        state
            .regions_mapped_into_memory
            .iter()
            .filter(|r| r.pretty_name == text.pretty_name)
            .count(),
        1
    );
}

#[test]
fn load_image_containing_address() {
    let dir = test_dir("containing");
    let path = dir.join("dyld_shared_cache_arm64");
    build_regular_cache(&path);

    let view = Arc::new(MockView::new(7103, &path));
    let mut cache = SharedCache::open(view.clone()).unwrap();

    // An address in the middle of libB's TEXT pulls in libB.
    assert!(cache.load_image_containing_address(CACHE_BASE + 0x2200, true));
    let state = saved_state(&view);
    let image_b = state
        .images
        .iter()
        .find(|i| i.install_name == "/usr/lib/libB.dylib")
        .unwrap();
    assert!(image_b.regions.iter().all(|r| r.loaded));

    // An unmapped address loads nothing.
    assert!(!cache.load_image_containing_address(0x9_0000_0000, true));
}

#[test]
fn load_section_at_stub_island_address() {
    let dir = test_dir("stubisland");
    let path = dir.join("dyld_shared_cache_arm64e");
    build_split_cache(&path);

    let view = Arc::new(MockView::new(7104, &path));
    let mut cache = SharedCache::open(view.clone()).unwrap();
    let raw_end_before = view.raw_view_end();

    assert!(cache.load_section_at_address(0x1_8010_0010));

    let state = saved_state(&view);
    let stub = state
        .stub_island_regions
        .iter()
        .find(|r| r.contains(0x1_8010_0010))
        .expect("stub island region exists");
    assert!(stub.loaded);
    assert_eq!(stub.raw_view_offset_if_loaded, raw_end_before);
    assert!(state
        .regions_mapped_into_memory
        .iter()
        .any(|r| r.pretty_name == stub.pretty_name));

    {
        let inner = view.inner.lock().unwrap();
        let seg = inner
            .virtual_segments
            .iter()
            .find(|(start, ..)| *start == 0x1_8010_0000)
            .expect("stub island segment added");
        assert!(seg.3.contains(SegmentFlags::READABLE | SegmentFlags::EXECUTABLE));
    }

    // Stub bytes arrived in the view.
    let bytes = view.read_virtual_bytes(0x1_8010_0000, 16).unwrap();
    assert_eq!(bytes, vec![0xAA; 16]);

    // Idempotent: the second call is a no-op returning true.
    let segment_count = view.virtual_segment_count();
    assert!(cache.load_section_at_address(0x1_8010_0010));
    assert_eq!(view.virtual_segment_count(), segment_count);

    // An address in no region fails softly.
    assert!(!cache.load_section_at_address(0x9_0000_0000));
}

#[test]
fn load_all_symbols_returns_exports() {
    let dir = test_dir("allsymbols");
    let path = dir.join("dyld_shared_cache_arm64");
    build_regular_cache(&path);

    let view = Arc::new(MockView::new(7105, &path));
    let mut cache = SharedCache::open(view.clone()).unwrap();

    let symbols = cache.load_all_symbols_and_wait();
    assert!(symbols
        .iter()
        .any(|(image, s)| image == "/usr/lib/libA.dylib" && s.name == "_f"));

    let state = saved_state(&view);
    assert!(state.export_infos[&CACHE_BASE]
        .iter()
        .any(|s| s.name == "_f"));
}

#[test]
fn find_symbol_and_apply_with_thunk_prefix() {
    let dir = test_dir("applysym");
    let path = dir.join("dyld_shared_cache_arm64");
    build_regular_cache(&path);

    let view = Arc::new(MockView::new(7106, &path));
    let mut cache = SharedCache::open(view.clone()).unwrap();
    assert!(cache.load_image_with_install_name("/usr/lib/libA.dylib", true));

    // Apply the export at +0x410 to a thunk at another address.
    let target = CACHE_BASE + 0x800;
    cache.find_symbol_at_addr_and_apply_to_addr(CACHE_BASE + 0x410, target, false);

    let inner = view.inner.lock().unwrap();
    let applied = inner.user_symbols.get(&target).expect("symbol applied");
    assert_eq!(applied.name, "j__f");
}

#[test]
fn state_round_trip_without_reparsing() {
    let dir = test_dir("roundtrip");
    let path = dir.join("dyld_shared_cache_arm64");
    build_regular_cache(&path);

    let view = Arc::new(MockView::new(7107, &path));
    let mut cache = SharedCache::open(view.clone()).unwrap();
    assert!(cache.load_image_with_install_name("/usr/lib/libA.dylib", true));

    let images = cache.images().to_vec();
    let backing = cache.backing_caches().to_vec();
    let start_a = cache.image_start("/usr/lib/libA.dylib");

    // A second controller on the same view shares the cached snapshot.
    {
        let second = SharedCache::open(view.clone()).unwrap();
        assert_eq!(second.view_state(), ViewState::LoadedWithImages);
        assert_eq!(second.images(), &images[..]);
        assert_eq!(second.backing_caches(), &backing[..]);
        assert_eq!(second.image_start("/usr/lib/libA.dylib"), start_a);
    }

    // Even with the controllers gone and the files deleted, a fresh
    // controller restores everything from the persisted metadata alone.
    drop(cache);
    std::fs::remove_file(&path).unwrap();

    let third = SharedCache::open(view.clone()).unwrap();
    assert_eq!(third.view_state(), ViewState::LoadedWithImages);
    assert_eq!(third.images(), &images[..]);
    assert_eq!(third.backing_caches(), &backing[..]);
    assert_eq!(third.image_start("/usr/lib/libA.dylib"), start_a);
}
