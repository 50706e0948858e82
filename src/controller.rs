//! The shared cache controller.
//!
//! A `SharedCache` attaches to a host view, performs the initial topology
//! load, and then materializes images, stub islands, dyld-data, and raw
//! cache regions on demand. All of its observable state lives in
//! [`State`]; every mutation happens under the per-view operations lock and
//! is followed by [`SharedCache::save_to_view`], which persists the JSON
//! metadata and publishes the snapshot for other controllers on the same
//! view.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::accessor;
use crate::config::LoaderSettings;
use crate::dyld::topology::{self, CacheTopology};
use crate::error::Result;
use crate::macho::constants::*;
use crate::macho::header::{load_header_for_address, CacheMachOHeader};
use crate::macho::trie::parse_export_trie;
use crate::slide;
use crate::state::{
    self, BackingCache, CacheFormat, CacheImage, CowState, LoadProgress, MemoryRegion, State,
    ViewSpecificState, ViewState, SHARED_CACHE_METADATA_TAG,
};
use crate::util::{base_name, read_uleb128};
use crate::view::{
    HostView, ObjcProcessor, SectionSemantics, SegmentFlags, Symbol, SymbolKind,
};
use crate::vm::{VirtualMemory, VmReader};

/// Identifies a region inside the state, independent of borrows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionRef {
    Image { image: usize, region: usize },
    StubIsland(usize),
    DyldData(usize),
    NonImage(usize),
}

fn region_of(state: &State, r: RegionRef) -> &MemoryRegion {
    match r {
        RegionRef::Image { image, region } => &state.images[image].regions[region],
        RegionRef::StubIsland(i) => &state.stub_island_regions[i],
        RegionRef::DyldData(i) => &state.dyld_data_regions[i],
        RegionRef::NonImage(i) => &state.non_image_regions[i],
    }
}

fn region_of_mut(state: &mut State, r: RegionRef) -> &mut MemoryRegion {
    match r {
        RegionRef::Image { image, region } => &mut state.images[image].regions[region],
        RegionRef::StubIsland(i) => &mut state.stub_island_regions[i],
        RegionRef::DyldData(i) => &mut state.dyld_data_regions[i],
        RegionRef::NonImage(i) => &mut state.non_image_regions[i],
    }
}

/// Controller for one shared cache view.
pub struct SharedCache {
    view: Arc<dyn HostView>,
    state: CowState,
    metadata_valid: bool,
    view_specific: Arc<ViewSpecificState>,
    settings: LoaderSettings,
    objc: Option<Arc<dyn ObjcProcessor>>,
    // Regular-format branch pool addresses, carried between topology
    // parsing and header loading during the initial load.
    pending_branch_pools: Vec<u64>,
}

impl SharedCache {
    /// Attaches a controller to `view`, deserializing persisted metadata or
    /// performing the initial load.
    pub fn open(view: Arc<dyn HostView>) -> Result<SharedCache> {
        Self::open_with_objc(view, None)
    }

    /// Like [`SharedCache::open`] with an external ObjC processor attached.
    pub fn open_with_objc(
        view: Arc<dyn HostView>,
        objc: Option<Arc<dyn ObjcProcessor>>,
    ) -> Result<SharedCache> {
        let view_specific = state::view_specific_state_for_id(view.session_id(), true)
            .expect("registry insertion cannot fail");
        let settings = LoaderSettings::from_view(view.as_ref());
        let mut cache = SharedCache {
            view,
            state: CowState::new(State::default()),
            metadata_valid: false,
            view_specific,
            settings,
            objc,
            pending_branch_pools: Vec::new(),
        };

        cache.deserialize_from_raw_view();

        if cache.state.get().view_state != ViewState::Unloaded {
            cache.view_specific.set_progress(LoadProgress::Finished);
            return Ok(cache);
        }

        {
            let vs = Arc::clone(&cache.view_specific);
            let _guard = vs.operations_lock.lock().unwrap();
            if let Err(e) = cache.perform_initial_load() {
                error!(error = %e, "failed to perform initial load of shared cache");
            }
            cache.state.will_mutate();
            cache.state.get_mut().view_state = ViewState::Loaded;
            cache.save_to_view();
        }

        if cache.settings.auto_load_libsystem {
            let libsystem = cache
                .state
                .get()
                .headers
                .values()
                .find(|h| h.install_name.contains("libsystem_c.dylib"))
                .map(|h| h.install_name.clone());
            if let Some(name) = libsystem {
                info!("loading core libsystem_c.dylib library");
                cache.load_image_with_install_name(&name, false);
            }
        }

        Ok(cache)
    }

    /// Runs format detection on the primary file and reports how many
    /// backing files the cache uses, without building state.
    pub fn fast_get_backing_cache_count(view: &dyn HostView) -> u64 {
        let path = view.original_file_path();
        match topology::fast_backing_cache_count(view.session_id(), &path) {
            Ok(count) => count,
            Err(e) => {
                error!(path = %path.display(), error = %e, "shared cache preload failed");
                0
            }
        }
    }

    /// Load progress for a view, observable before any controller exists.
    pub fn get_load_progress(view_id: u64) -> LoadProgress {
        state::load_progress(view_id)
    }

    // =========================================================================
    // State access
    // =========================================================================

    /// Current view state.
    pub fn view_state(&self) -> ViewState {
        self.state.get().view_state
    }

    /// Detected cache format.
    pub fn cache_format(&self) -> CacheFormat {
        self.state.get().cache_format
    }

    /// The files backing the cache.
    pub fn backing_caches(&self) -> &[BackingCache] {
        &self.state.get().backing_caches
    }

    /// Images and their segment regions.
    pub fn images(&self) -> &[CacheImage] {
        &self.state.get().images
    }

    /// Regions that have been materialized into the view.
    pub fn mapped_regions(&self) -> Vec<MemoryRegion> {
        self.state.get().regions_mapped_into_memory.clone()
    }

    /// All memory regions known to the controller: image segments, stub
    /// islands, dyld-data, and non-image regions.
    pub fn memory_regions(&self) -> Vec<MemoryRegion> {
        let s = self.state.get();
        s.images
            .iter()
            .flat_map(|img| img.regions.iter())
            .chain(s.stub_island_regions.iter())
            .chain(s.dyld_data_regions.iter())
            .chain(s.non_image_regions.iter())
            .cloned()
            .collect()
    }

    /// Install names of every image in the cache.
    pub fn available_images(&self) -> Vec<String> {
        self.state
            .get()
            .headers
            .values()
            .map(|h| h.install_name.clone())
            .collect()
    }

    /// Header address of the image named `install_name`.
    pub fn image_start(&self, install_name: &str) -> Option<u64> {
        self.state.get().image_starts.get(install_name).copied()
    }

    /// Parsed header of the image whose segments contain `address`.
    pub fn header_for_address(&self, address: u64) -> Option<CacheMachOHeader> {
        self.state.get().header_containing(address).cloned()
    }

    /// Pretty name of whatever contains `address`: stub island, dyld data,
    /// non-image region, or an image section.
    pub fn name_for_address(&self, address: u64) -> String {
        let s = self.state.get();
        for region in s
            .stub_island_regions
            .iter()
            .chain(s.dyld_data_regions.iter())
            .chain(s.non_image_regions.iter())
        {
            if region.contains(address) {
                return region.pretty_name.clone();
            }
        }
        if let Some(header) = s.header_containing(address) {
            for section in &header.sections {
                if section.contains(address) {
                    return format!("{}::{}", header.identifier_prefix, section.name());
                }
            }
        }
        String::new()
    }

    /// Identifier prefix of the image containing `address`.
    pub fn image_name_for_address(&self, address: u64) -> String {
        self.state
            .get()
            .header_containing(address)
            .map(|h| h.identifier_prefix.clone())
            .unwrap_or_default()
    }

    /// Base address of the relative method selectors, from the ObjC
    /// optimization data, if the cache carries any.
    pub fn objc_relative_method_base_address(&self, vm: &VirtualMemory) -> Option<u64> {
        let (offset, _size) = self.state.get().objc_optimization_data_range?;
        let base = self.state.get().base_address();
        // relativeMethodSelectorBaseAddressOffset lives 48 bytes into the
        // ObjC optimization header.
        vm.read_u64(base + offset + 48).ok().map(|off| base + off)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn deserialize_from_raw_view(&mut self) {
        if let Some(metadata) = self.view.query_metadata(SHARED_CACHE_METADATA_TAG) {
            let cached = self.view_specific.cached_state.lock().unwrap().clone();
            if let Some(cached) = cached {
                self.state = CowState::shared(cached);
                self.metadata_valid = true;
            } else if let Some(decoded) = state::decode_metadata(&metadata) {
                self.state = CowState::new(decoded);
                self.metadata_valid = true;
            } else {
                self.metadata_valid = false;
            }
            if !self.metadata_valid {
                error!("failed to deserialize shared cache metadata, reloading");
                self.state.will_mutate();
                self.state.get_mut().view_state = ViewState::Unloaded;
            }
        } else {
            self.metadata_valid = true;
            self.state.will_mutate();
            let s = self.state.get_mut();
            s.view_state = ViewState::Unloaded;
            s.images.clear();
        }
    }

    /// Serializes the state to the view and raw view and publishes the
    /// snapshot as the view's cached state.
    pub fn save_to_view(&mut self) -> bool {
        let json = match self.state.get().to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize shared cache state");
                return false;
            }
        };
        self.view.store_metadata(SHARED_CACHE_METADATA_TAG, &json);
        self.view
            .store_raw_metadata(SHARED_CACHE_METADATA_TAG, &json);

        // Publishing shares the snapshot; a copy is made lazily on the next
        // mutation.
        let snapshot = self.state.share();
        *self.view_specific.cached_state.lock().unwrap() = Some(snapshot);
        self.metadata_valid = true;
        true
    }

    // =========================================================================
    // Virtual memory
    // =========================================================================

    /// Builds the virtual memory map over all backing caches. Each file's
    /// first materialization triggers slide rewriting.
    pub fn vm_map(&self, map_pages: bool) -> Result<VirtualMemory> {
        let mut vm = VirtualMemory::new();
        if !map_pages {
            return Ok(vm);
        }

        let session_id = self.view.session_id();
        let base = self.state.get().base_address();
        for cache in &self.state.get().backing_caches {
            let path = std::path::PathBuf::from(&cache.path);
            for mapping in &cache.mappings {
                let hook: accessor::PostAllocRoutine = Arc::new(move |file| {
                    if let Err(e) = slide::parse_and_apply_slide_info(file, base) {
                        error!(path = %file.path().display(), error = %e, "slide rewriting failed");
                    }
                });
                vm.map_pages(
                    session_id,
                    mapping.address,
                    mapping.file_offset,
                    mapping.size,
                    &path,
                    hook,
                )?;
            }
        }
        Ok(vm)
    }

    // =========================================================================
    // Initial load
    // =========================================================================

    fn perform_initial_load(&mut self) -> Result<()> {
        info!("performing initial load of shared cache");
        let path = self.view.original_file_path();
        self.view_specific.set_progress(LoadProgress::LoadingCaches);

        self.state.will_mutate();
        let topology = topology::parse_topology(self.view.session_id(), &path)?;
        self.adopt_topology(&path, topology);

        self.view_specific.set_progress(LoadProgress::LoadingImages);

        let vm = self.vm_map(true)?;
        self.load_branch_island_headers(&vm);
        self.load_all_image_headers(&vm);
        self.collect_non_image_regions();
        self.split_regions_around_images();

        self.save_to_view();
        debug!("finished initial load of shared cache");
        self.view_specific.set_progress(LoadProgress::Finished);
        Ok(())
    }

    fn adopt_topology(&mut self, path: &std::path::Path, topology: CacheTopology) {
        // Branch pools are consumed separately below.
        let branch_pools = topology.branch_pools.clone();
        let s = self.state.get_mut();
        s.base_file_path = path.to_string_lossy().into_owned();
        s.cache_format = topology.format;
        s.image_starts = topology.image_starts;
        s.backing_caches = topology.backing_caches;
        s.stub_island_regions = topology.stub_islands;
        s.dyld_data_regions = topology.dyld_data_regions;
        s.objc_optimization_data_range = topology.objc_optimization_data_range;
        self.pending_branch_pools = branch_pools;
    }

    /// Regular-format branch pools carry real Mach-O headers; parse them
    /// and record their segments as stub islands.
    fn load_branch_island_headers(&mut self, vm: &VirtualMemory) {
        let pools = std::mem::take(&mut self.pending_branch_pools);
        for (i, &address) in pools.iter().enumerate() {
            let name = format!("dyld_shared_cache_branch_islands_{}", i + 1);
            match load_header_for_address(vm, address, &name) {
                Ok(Some(header)) => {
                    for segment in &header.segments {
                        self.state.get_mut().stub_island_regions.push(MemoryRegion::new(
                            format!("{}::{}", name, segment.name()),
                            segment.vmaddr,
                            segment.filesize,
                            SegmentFlags::READABLE | SegmentFlags::EXECUTABLE,
                        ));
                    }
                }
                Ok(None) => warn!(address, "branch island has no Mach-O header"),
                Err(e) => error!(address, error = %e, "failed to load branch island header"),
            }
        }
    }

    fn load_all_image_headers(&mut self, vm: &VirtualMemory) {
        let starts: Vec<(String, u64)> = self
            .state
            .get()
            .image_starts
            .iter()
            .map(|(name, addr)| (name.clone(), *addr))
            .collect();

        for (install_name, address) in starts {
            match load_header_for_address(vm, address, &install_name) {
                Ok(Some(mut header)) => {
                    if header.linkedit_present
                        && vm.address_is_mapped(header.linkedit_segment.vmaddr)
                    {
                        if let Ok((mapping, _)) = vm.mapping_at(header.linkedit_segment.vmaddr) {
                            header.export_trie_path =
                                mapping.file.path().to_string_lossy().into_owned();
                        }
                    }

                    let mut image = CacheImage {
                        install_name: install_name.clone(),
                        header_location: address,
                        regions: Vec::with_capacity(header.segments.len()),
                    };
                    for segment in &header.segments {
                        let mut flags = SegmentFlags::from_macho_protections(
                            segment.initprot,
                            segment.maxprot,
                        );
                        // A segment holding a known entry point is
                        // executable no matter what its protections claim;
                        // this helps with kernel images.
                        for (entry, _) in &header.entry_points {
                            if segment.vmaddr <= *entry
                                && *entry < segment.vmaddr + segment.filesize
                            {
                                flags |= SegmentFlags::EXECUTABLE;
                            }
                        }
                        image.regions.push(MemoryRegion::new(
                            format!("{}::{}", header.identifier_prefix, segment.name()),
                            segment.vmaddr,
                            segment.vmsize,
                            flags,
                        ));
                    }

                    let s = self.state.get_mut();
                    s.headers.insert(address, header);
                    s.images.push(image);
                }
                Ok(None) => error!(install_name = %install_name, "failed to load Mach-O header"),
                Err(e) => {
                    error!(install_name = %install_name, error = %e, "failed to load Mach-O header")
                }
            }
        }
        info!(headers = self.state.get().headers.len(), "loaded Mach-O headers");
    }

    fn collect_non_image_regions(&mut self) {
        let mut regions = Vec::new();
        for cache in &self.state.get().backing_caches {
            let file_name = base_name(&cache.path).to_string();
            for (i, mapping) in cache.mappings.iter().enumerate() {
                regions.push(MemoryRegion::new(
                    format!("{file_name}::{i}"),
                    mapping.address,
                    mapping.size,
                    SegmentFlags::from_macho_protections(mapping.init_prot, mapping.max_prot),
                ));
            }
        }
        self.state.get_mut().non_image_regions = regions;
    }

    /// Splits dyld-data and non-image regions around every image segment so
    /// the three sets stay mutually disjoint.
    fn split_regions_around_images(&mut self) {
        let segments: Vec<(u64, u64)> = self
            .state
            .get()
            .headers
            .values()
            .flat_map(|h| h.segments.iter().map(|s| (s.vmaddr, s.vmaddr + s.vmsize)))
            .collect();

        let s = self.state.get_mut();
        s.dyld_data_regions = split_regions(std::mem::take(&mut s.dyld_data_regions), &segments);
        s.non_image_regions = split_regions(std::mem::take(&mut s.non_image_regions), &segments);
    }

    // =========================================================================
    // Materialization
    // =========================================================================

    /// Copies a region's bytes into the view: appends to the raw view's
    /// storage, establishes the raw and virtual segments, and writes the
    /// bytes at the virtual position. The backing file's slide info is
    /// applied first.
    fn materialize_region(&self, vm: &VirtualMemory, region: &mut MemoryRegion) -> Result<()> {
        let (mapping, _) = vm.mapping_at(region.start)?;
        let file = mapping.file.lock()?;
        slide::parse_and_apply_slide_info(&file, self.state.get().base_address())?;

        let buffer = vm.read_buffer(region.start, region.size as usize)?;
        let raw_offset = self.view.append_raw_bytes(&buffer);
        self.view.add_raw_segment(raw_offset, region.size, region.flags);
        self.view
            .add_virtual_segment(region.start, region.size, raw_offset, region.flags);
        self.view.write_virtual_bytes(region.start, &buffer);

        region.loaded = true;
        region.raw_view_offset_if_loaded = raw_offset;
        Ok(())
    }

    /// Loads every region of the image named `install_name` and initializes
    /// its header structures. Idempotent: already loaded regions are
    /// skipped and a fully loaded image returns `true` without changes.
    pub fn load_image_with_install_name(&mut self, install_name: &str, skip_objc: bool) -> bool {
        let vs = Arc::clone(&self.view_specific);
        let _guard = vs.operations_lock.lock().unwrap();

        self.deserialize_from_raw_view();
        self.state.will_mutate();

        info!(install_name, "loading image");

        let vm = match self.vm_map(true) {
            Ok(vm) => vm,
            Err(e) => {
                error!(error = %e, "failed to map VM pages for shared cache");
                return false;
            }
        };

        let Some(image_index) = self
            .state
            .get()
            .images
            .iter()
            .position(|img| img.install_name == install_name)
        else {
            return false;
        };
        let header_location = self.state.get().images[image_index].header_location;
        if !self.state.get().headers.contains_key(&header_location) {
            return false;
        }

        let undo = self.view.begin_undo_actions();
        self.state.get_mut().view_state = ViewState::LoadedWithImages;

        let region_count = self.state.get().images[image_index].regions.len();
        let mut loaded: Vec<RegionRef> = Vec::new();
        for region_index in 0..region_count {
            let region_ref = RegionRef::Image {
                image: image_index,
                region: region_index,
            };
            let mut region = region_of(self.state.get(), region_ref).clone();

            if region.pretty_name.contains("__LINKEDIT") && !self.settings.allow_loading_linkedit {
                continue;
            }
            if region.loaded {
                debug!(region = %region.pretty_name, "skipping region, already loaded");
                continue;
            }

            if let Err(e) = self.materialize_region(&vm, &mut region) {
                error!(region = %region.pretty_name, error = %e, "failed to materialize region");
                continue;
            }

            let s = self.state.get_mut();
            *region_of_mut(s, region_ref) = region.clone();
            s.regions_mapped_into_memory.push(region);
            loaded.push(region_ref);
        }

        if loaded.is_empty() {
            warn!(install_name, "no regions to load for image");
            self.view.commit_undo_actions(undo);
            // An image whose every region is already materialized is done.
            let all_loaded = self.state.get().images[image_index]
                .regions
                .iter()
                .all(|r| r.loaded || r.pretty_name.contains("__LINKEDIT"));
            return all_loaded;
        }

        self.save_to_view();

        let header = match load_header_for_address(&vm, header_location, install_name) {
            Ok(Some(header)) => header,
            _ => {
                self.view.commit_undo_actions(undo);
                return false;
            }
        };

        self.initialize_header(&vm, &header, &loaded);

        if !skip_objc {
            self.run_objc_processor(&header.identifier_prefix);
        }

        self.save_to_view();
        self.view.update_analysis();
        self.view.commit_undo_actions(undo);
        true
    }

    /// Materializes whichever region contains `address`: an image segment,
    /// a stub island, dyld data, or a raw cache region. Idempotent.
    pub fn load_section_at_address(&mut self, address: u64) -> bool {
        let vs = Arc::clone(&self.view_specific);
        let _guard = vs.operations_lock.lock().unwrap();

        self.deserialize_from_raw_view();
        self.state.will_mutate();

        let vm = match self.vm_map(true) {
            Ok(vm) => vm,
            Err(e) => {
                error!(error = %e, "failed to map VM pages for shared cache");
                return false;
            }
        };

        if let Some(region_ref) = self.find_region(address) {
            return self.load_single_region(&vm, region_ref, address);
        }

        error!(address, "failed to find a region containing address");
        false
    }

    fn find_region(&self, address: u64) -> Option<RegionRef> {
        let s = self.state.get();
        for (i, image) in s.images.iter().enumerate() {
            for (j, region) in image.regions.iter().enumerate() {
                if region.contains(address) {
                    return Some(RegionRef::Image { image: i, region: j });
                }
            }
        }
        for (i, region) in s.stub_island_regions.iter().enumerate() {
            if region.contains(address) {
                return Some(RegionRef::StubIsland(i));
            }
        }
        for (i, region) in s.dyld_data_regions.iter().enumerate() {
            if region.contains(address) {
                return Some(RegionRef::DyldData(i));
            }
        }
        for (i, region) in s.non_image_regions.iter().enumerate() {
            if region.contains(address) {
                return Some(RegionRef::NonImage(i));
            }
        }
        None
    }

    fn load_single_region(&mut self, vm: &VirtualMemory, region_ref: RegionRef, address: u64) -> bool {
        let mut region = region_of(self.state.get(), region_ref).clone();
        if region.loaded && !matches!(region_ref, RegionRef::Image { .. }) {
            return true;
        }
        if region.loaded && region.header_initialized {
            return true;
        }

        let undo = self.view.begin_undo_actions();

        if !region.loaded {
            info!(region = %region.pretty_name, address, "loading section");
            if let Err(e) = self.materialize_region(vm, &mut region) {
                error!(region = %region.pretty_name, error = %e, "failed to materialize region");
                self.view.commit_undo_actions(undo);
                return false;
            }

            // Non-image regions define their own section; image segments
            // get sections from header initialization.
            match region_ref {
                RegionRef::StubIsland(_) => {
                    self.view.add_section(
                        &region.pretty_name,
                        region.start,
                        region.size,
                        SectionSemantics::ReadOnlyCode,
                        "",
                        1,
                    );
                }
                RegionRef::DyldData(_) => {
                    self.view.add_section(
                        &region.pretty_name,
                        region.start,
                        region.size,
                        SectionSemantics::ReadOnlyData,
                        "",
                        1,
                    );
                }
                RegionRef::NonImage(_) => {
                    let semantics = if region.flags.contains(SegmentFlags::DENY_EXECUTE) {
                        SectionSemantics::ReadOnlyData
                    } else {
                        SectionSemantics::ReadOnlyCode
                    };
                    self.view.add_section(
                        &region.pretty_name,
                        region.start,
                        region.size,
                        semantics,
                        "",
                        1,
                    );
                }
                RegionRef::Image { .. } => {}
            }

            let s = self.state.get_mut();
            *region_of_mut(s, region_ref) = region.clone();
            s.regions_mapped_into_memory.push(region.clone());
        }

        self.save_to_view();

        // A partially loaded image initializes just this segment's
        // section and symbol structures.
        if let RegionRef::Image { image, .. } = region_ref {
            if !region.header_initialized {
                let header_location = self.state.get().images[image].header_location;
                let install_name = self.state.get().images[image].install_name.clone();
                debug!(install_name = %install_name, "partial loading image");
                if let Ok(Some(header)) =
                    load_header_for_address(vm, header_location, &install_name)
                {
                    self.initialize_header(vm, &header, &[region_ref]);
                    self.save_to_view();
                }
            }
        }

        self.view.update_analysis();
        self.view.commit_undo_actions(undo);
        true
    }

    /// Loads the image whose segments contain `address`.
    pub fn load_image_containing_address(&mut self, address: u64, skip_objc: bool) -> bool {
        let install_name = self
            .state
            .get()
            .header_containing(address)
            .map(|h| h.install_name.clone());
        match install_name {
            Some(name) => self.load_image_with_install_name(&name, skip_objc),
            None => false,
        }
    }

    // =========================================================================
    // Header initialization
    // =========================================================================

    fn initialize_header(
        &mut self,
        vm: &VirtualMemory,
        header: &CacheMachOHeader,
        regions_to_load: &[RegionRef],
    ) {
        self.state.will_mutate();

        self.define_sections(header, regions_to_load);

        let apply_header_types = regions_to_load.iter().any(|r| {
            let region = region_of(self.state.get(), *r);
            region.contains(header.text_base) && !region.header_initialized
        });
        if apply_header_types {
            self.define_header_data_variables(vm, header);
        }

        let linkedit_mapped =
            header.linkedit_present && vm.address_is_mapped(header.linkedit_segment.vmaddr);

        if self.settings.process_function_starts
            && header.function_starts_present
            && linkedit_mapped
        {
            self.apply_function_starts(vm, header, regions_to_load);
        }

        if header.symtab.symoff != 0 && linkedit_mapped {
            self.apply_symtab(vm, header);
        }

        if header.export_trie_present && linkedit_mapped {
            self.apply_export_trie(vm, header);
        }

        let s = self.state.get_mut();
        for region_ref in regions_to_load {
            region_of_mut(s, *region_ref).header_initialized = true;
        }
    }

    fn define_sections(&self, header: &CacheMachOHeader, regions_to_load: &[RegionRef]) {
        for (i, section) in header.sections.iter().enumerate() {
            if i >= header.section_names.len() {
                break;
            }
            let mut skip = false;
            for region_ref in regions_to_load {
                let region = region_of(self.state.get(), *region_ref);
                if region.contains(section.addr) {
                    skip = region.header_initialized;
                    break;
                }
            }
            if section.size == 0 || skip {
                continue;
            }

            let (type_name, mut semantics) = section_type_and_semantics(section.flags);

            let sect_name = section.name();
            if sect_name == "__text" {
                semantics = SectionSemantics::ReadOnlyCode;
            }
            if sect_name == "__const" {
                semantics = SectionSemantics::ReadOnlyData;
            }
            if sect_name == "__data" {
                semantics = SectionSemantics::ReadWriteData;
            }
            if crate::util::fixed_string(&section.segname) == "__DATA_CONST" {
                semantics = SectionSemantics::ReadOnlyData;
            }

            self.view.add_section(
                &header.section_names[i],
                section.addr,
                section.size,
                semantics,
                type_name,
                1u64 << section.align.min(63),
            );
        }
    }

    /// Defines typed data variables over the Mach-O header and each load
    /// command, with synthesized names keyed by the image's identifier
    /// prefix.
    fn define_header_data_variables(&self, vm: &VirtualMemory, header: &CacheMachOHeader) {
        self.view
            .define_data_variable(header.text_base, "mach_header_64");
        self.view.define_auto_symbol(&Symbol::new(
            header.text_base,
            SymbolKind::Data,
            format!("__macho_header::{}", header.identifier_prefix),
        ));

        let mut reader = VmReader::new(vm);
        reader.seek(header.text_base + crate::macho::structs::MachHeader64::SIZE);
        let mut section_index = 0usize;

        for i in 0..header.ident.ncmds {
            let cur_offset = reader.offset();
            let (cmd, cmdsize) = match (reader.read_u32(), reader.read_u32()) {
                (Ok(cmd), Ok(cmdsize)) => (cmd, cmdsize),
                _ => {
                    error!(text_base = header.text_base, "error applying Mach-O header types");
                    return;
                }
            };
            let next_offset = cur_offset + cmdsize as u64;

            let type_name = match cmd {
                LC_SEGMENT => "segment_command",
                LC_SEGMENT_64 => "segment_command_64",
                LC_SYMTAB => "symtab",
                LC_DYSYMTAB => "dysymtab",
                LC_UUID => "uuid",
                LC_ID_DYLIB | LC_LOAD_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_WEAK_DYLIB
                | LC_LOAD_UPWARD_DYLIB => "dylib_command",
                LC_CODE_SIGNATURE | LC_SEGMENT_SPLIT_INFO | LC_FUNCTION_STARTS
                | LC_DATA_IN_CODE | LC_DYLIB_CODE_SIGN_DRS | LC_DYLD_EXPORTS_TRIE
                | LC_DYLD_CHAINED_FIXUPS => "linkedit_data",
                LC_ENCRYPTION_INFO => "encryption_info",
                LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS => "version_min",
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => "dyld_info",
                _ => "load_command",
            };
            self.view.define_data_variable(cur_offset, type_name);
            self.view.define_auto_symbol(&Symbol::new(
                cur_offset,
                SymbolKind::Data,
                format!("__macho_load_command::{}_[{}]", header.identifier_prefix, i),
            ));

            match cmd {
                LC_SEGMENT | LC_SEGMENT_64 => {
                    let wide = cmd == LC_SEGMENT_64;
                    let (seg_fixed, sect_size, sect_type) = if wide {
                        (7 * 8, 10 * 8, "section_64")
                    } else {
                        (5 * 8, 8 * 8 + 4, "section")
                    };
                    reader.seek_relative(seg_fixed);
                    let nsects = match reader.read_u32() {
                        Ok(v) => v,
                        Err(_) => break,
                    };
                    reader.seek_relative(4);
                    for _ in 0..nsects {
                        self.view.define_data_variable(reader.offset(), sect_type);
                        self.view.define_user_symbol(&Symbol::new(
                            reader.offset(),
                            SymbolKind::Data,
                            format!(
                                "__macho_{}::{}_[{}]",
                                sect_type, header.identifier_prefix, section_index
                            ),
                        ));
                        section_index += 1;
                        reader.seek_relative(sect_size);
                    }
                }
                _ => {}
            }
            reader.seek(next_offset);
        }
    }

    /// Decodes the function-starts ULEB128 delta stream and queues a
    /// function analysis for every address inside a newly loaded region.
    fn apply_function_starts(
        &self,
        vm: &VirtualMemory,
        header: &CacheMachOHeader,
        regions_to_load: &[RegionRef],
    ) {
        let Ok((mapping, _)) = vm.mapping_at(header.linkedit_segment.vmaddr) else {
            return;
        };
        let Ok(file) = mapping.file.lock() else {
            return;
        };
        let Ok(stream) = file.read_buffer(
            header.function_starts.dataoff as u64,
            header.function_starts.datasize as usize,
        ) else {
            warn!(install_name = %header.install_name, "failed to read function starts");
            return;
        };

        let fresh_ranges: Vec<(u64, u64)> = regions_to_load
            .iter()
            .map(|r| region_of(self.state.get(), *r))
            .filter(|r| !r.header_initialized)
            .map(|r| (r.start, r.end()))
            .collect();

        let mut cursor = 0usize;
        let mut current = header.text_base;
        while cursor < stream.len() {
            let Some((delta, consumed)) = read_uleb128(&stream[cursor..]) else {
                break;
            };
            cursor += consumed;
            if delta == 0 {
                break;
            }
            current += delta;
            if fresh_ranges
                .iter()
                .any(|(start, end)| current >= *start && current < *end)
            {
                self.view.add_function(current);
            }
        }
    }

    fn apply_symtab(&mut self, vm: &VirtualMemory, header: &CacheMachOHeader) {
        use crate::macho::structs::Nlist64;

        let Ok((mapping, _)) = vm.mapping_at(header.linkedit_segment.vmaddr) else {
            return;
        };
        let Ok(file) = mapping.file.lock() else {
            return;
        };
        let Ok(strtab) =
            file.read_buffer(header.symtab.stroff as u64, header.symtab.strsize as usize)
        else {
            warn!(install_name = %header.install_name, "failed to read string table");
            return;
        };

        let type_lib = self.type_library_available(&header.install_name);
        let mut symbol_infos: Vec<Symbol> = Vec::new();

        for i in 0..header.symtab.nsyms as u64 {
            let Ok(raw) = file.read_buffer(header.symtab.symoff as u64 + i * Nlist64::SIZE, 16)
            else {
                break;
            };
            let mut sym = Nlist64::from_bytes(&raw);

            if sym.n_strx as usize >= header.symtab.strsize as usize
                || sym.n_type & N_TYPE == N_INDR
            {
                continue;
            }
            let name_bytes = &strtab[sym.n_strx as usize..];
            let name = crate::util::fixed_string(name_bytes);
            if name == "<redacted>" || name.is_empty() {
                continue;
            }

            let mut kind = SymbolKind::Data;
            let in_section = sym.n_type & N_TYPE == N_SECT
                && sym.n_sect > 0
                && (sym.n_sect as usize - 1) < header.sections.len();
            if in_section || sym.n_type & N_TYPE == N_ABS {
                // Kind resolved from the containing section below.
            } else if sym.n_type & N_EXT != 0 {
                kind = SymbolKind::External;
            } else {
                continue;
            }

            if kind != SymbolKind::External {
                let flags = header.section_flags_at(sym.n_value).unwrap_or(0);
                kind = if flags & S_ATTR_PURE_INSTRUCTIONS != 0
                    || flags & S_ATTR_SOME_INSTRUCTIONS != 0
                {
                    SymbolKind::Function
                } else {
                    SymbolKind::Data
                };
            }
            if sym.n_desc & N_ARM_THUMB_DEF != 0 {
                sym.n_value += 1;
            }

            let symbol = Symbol::new(sym.n_value, kind, name);
            if kind == SymbolKind::Function {
                self.view.add_function(sym.n_value);
            }
            self.view.define_auto_symbol(&symbol);
            if type_lib {
                self.view.bind_symbol_type(&header.install_name, &symbol);
            }
            symbol_infos.push(symbol);
        }

        self.state
            .get_mut()
            .symbol_infos
            .insert(header.text_base, symbol_infos);
    }

    fn apply_export_trie(&mut self, vm: &VirtualMemory, header: &CacheMachOHeader) {
        let Ok((mapping, _)) = vm.mapping_at(header.linkedit_segment.vmaddr) else {
            return;
        };
        let Ok(file) = mapping.file.lock() else {
            return;
        };

        let view = Arc::clone(&self.view);
        let symbols = parse_export_trie(&file, header, &|va| view.has_function_at(va));

        let type_lib = self.type_library_available(&header.install_name);
        for symbol in &symbols {
            self.view.define_auto_symbol(symbol);
            if type_lib {
                self.view.bind_symbol_type(&header.install_name, symbol);
            }
            self.apply_objc_export_quirks(symbol);
        }

        self.state
            .get_mut()
            .export_infos
            .insert(header.text_base, symbols);
    }

    /// `_objc_msgSend` is not variadic despite its declaration, and the
    /// specialized retain/release entry points take their single `id`
    /// argument in the register named by their suffix.
    fn apply_objc_export_quirks(&self, symbol: &Symbol) {
        if !self.view.has_function_at(symbol.address) {
            return;
        }
        if symbol.name == "_objc_msgSend" {
            self.view.set_function_non_variadic(symbol.address);
        } else if symbol.name.contains("_objc_retain_x")
            || symbol.name.contains("_objc_release_x")
        {
            if let Some(pos) = symbol.name.rfind('x') {
                if let Ok(register) = symbol.name[pos + 1..].parse::<u32>() {
                    self.view
                        .set_function_register_convention(symbol.address, register);
                }
            }
        }
    }

    fn type_library_available(&self, install_name: &str) -> bool {
        let mut cache = self.view_specific.type_libraries.lock().unwrap();
        if let Some(available) = cache.get(install_name) {
            return *available;
        }
        let available = self.view.has_type_library(install_name);
        cache.insert(install_name.to_string(), available);
        available
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    /// Parses every image's export trie (from the recorded trie paths),
    /// refreshes the export info map, and returns all symbols found.
    pub fn load_all_symbols_and_wait(&mut self) -> Vec<(String, Symbol)> {
        let vs = Arc::clone(&self.view_specific);
        let _guard = vs.operations_lock.lock().unwrap();

        self.state.will_mutate();

        let images: Vec<(String, u64)> = self
            .state
            .get()
            .images
            .iter()
            .map(|img| (img.install_name.clone(), img.header_location))
            .collect();

        let mut all_symbols = Vec::new();
        for (install_name, header_location) in images {
            let Some(header) = self.state.get().headers.get(&header_location).cloned() else {
                continue;
            };
            if header.export_trie_path.is_empty() {
                continue;
            }
            let handle =
                accessor::open(self.view.session_id(), &header.export_trie_path);
            let file = match handle.lock() {
                Ok(file) => file,
                Err(e) => {
                    warn!(
                        path = %header.export_trie_path,
                        install_name = %install_name, error = %e,
                        "failed to open export trie"
                    );
                    continue;
                }
            };
            let view = Arc::clone(&self.view);
            let symbols = parse_export_trie(&file, &header, &|va| view.has_function_at(va));
            self.state
                .get_mut()
                .export_infos
                .insert(header.text_base, symbols.clone());
            all_symbols.extend(symbols.into_iter().map(|s| (install_name.clone(), s)));
        }

        self.save_to_view();
        all_symbols
    }

    /// Finds the symbol at `symbol_location` and applies its name to
    /// `target_location`, prefixed with `j_` when the two differ.
    pub fn find_symbol_at_addr_and_apply_to_addr(
        &mut self,
        symbol_location: u64,
        target_location: u64,
        trigger_reanalysis: bool,
    ) {
        self.state.will_mutate();

        let prefix = if symbol_location != target_location {
            "j_"
        } else {
            ""
        };
        if let Some(existing) = self.view.symbol_at(target_location) {
            if existing.name.contains("j_") {
                return;
            }
        }

        let undo = self.view.begin_undo_actions();
        if let Some(loaded) = self.view.symbol_at(symbol_location) {
            let kind = if self.view.has_function_at(target_location) {
                SymbolKind::Function
            } else {
                loaded.kind
            };
            self.view.define_user_symbol(&Symbol::new(
                target_location,
                kind,
                format!("{prefix}{}", loaded.name),
            ));
        }
        self.view.forget_undo_actions(undo);

        let Some(header) = self.state.get().header_containing(symbol_location).cloned() else {
            return;
        };
        if header.export_trie_path.is_empty() {
            return;
        }
        let handle = accessor::open(self.view.session_id(), &header.export_trie_path);
        let file = match handle.lock() {
            Ok(file) => file,
            Err(e) => {
                warn!(install_name = %header.install_name, error = %e, "failed to open export trie");
                return;
            }
        };

        let view = Arc::clone(&self.view);
        let symbols = parse_export_trie(&file, &header, &|va| view.has_function_at(va));

        let undo = self.view.begin_undo_actions();
        for symbol in &symbols {
            if symbol.address != symbol_location {
                continue;
            }
            let kind = if self.view.has_function_at(target_location) {
                SymbolKind::Function
            } else {
                symbol.kind
            };
            let applied = Symbol::new(target_location, kind, format!("{prefix}{}", symbol.name));
            self.view.define_user_symbol(&applied);
            if self.type_library_available(&header.install_name) {
                self.view.bind_symbol_type(&header.install_name, &applied);
            }
            if trigger_reanalysis {
                self.view.reanalyze_function(target_location);
            }
            break;
        }

        {
            let vs = Arc::clone(&self.view_specific);
            let _guard = vs.operations_lock.lock().unwrap();
            self.state
                .get_mut()
                .export_infos
                .insert(header.text_base, symbols);
        }
        self.view.forget_undo_actions(undo);
    }

    // =========================================================================
    // ObjC hooks
    // =========================================================================

    fn run_objc_processor(&self, image_name: &str) {
        let Some(objc) = &self.objc else {
            return;
        };
        if self.settings.process_objc {
            objc.process_objc_data(self.view.as_ref(), image_name);
        }
        if self.settings.process_cfstrings {
            objc.process_cfstrings(self.view.as_ref(), image_name);
        }
    }

    /// Runs the ObjC processor for a single image.
    pub fn process_objc_sections_for_install_name(&self, install_name: &str) {
        if !self.settings.process_objc && !self.settings.process_cfstrings {
            return;
        }
        self.run_objc_processor(base_name(install_name));
    }

    /// Runs the ObjC processor for every loaded image, once per image.
    pub fn process_all_objc_sections(&self) {
        if !self.settings.process_objc && !self.settings.process_cfstrings {
            return;
        }
        let mut processed = std::collections::HashSet::new();
        let regions = self.mapped_regions();
        for region in regions {
            if !region.loaded {
                continue;
            }
            let Some(header) = self.state.get().header_containing(region.start) else {
                continue;
            };
            if !processed.insert(header.text_base) {
                continue;
            }
            let name = header.identifier_prefix.clone();
            self.run_objc_processor(&name);
        }
    }
}

impl Drop for SharedCache {
    fn drop(&mut self) {
        // Registry entries are weak and prune themselves; warm file
        // mappings stay behind for the next controller on this session.
        debug!("releasing shared cache controller");
    }
}

// =============================================================================
// Free helpers
// =============================================================================

/// Removes every overlap between `regions` and the given `[start, end)`
/// segment ranges, keeping the non-overlapping fragments.
fn split_regions(regions: Vec<MemoryRegion>, segments: &[(u64, u64)]) -> Vec<MemoryRegion> {
    let mut current = regions;
    for &(seg_start, seg_end) in segments {
        let mut next = Vec::with_capacity(current.len());
        for region in current {
            if seg_start >= region.end() || seg_end <= region.start {
                next.push(region);
                continue;
            }
            if region.start < seg_start {
                let mut before = region.clone();
                before.size = seg_start - region.start;
                next.push(before);
            }
            if region.end() > seg_end {
                let mut after = region.clone();
                after.start = seg_end;
                after.size = region.end() - seg_end;
                next.push(after);
            }
        }
        current = next;
    }
    current
}

fn section_type_and_semantics(flags: u32) -> (&'static str, SectionSemantics) {
    match flags & SECTION_TYPE {
        S_REGULAR => {
            if flags & S_ATTR_PURE_INSTRUCTIONS != 0 {
                ("PURE_CODE", SectionSemantics::ReadOnlyCode)
            } else if flags & S_ATTR_SOME_INSTRUCTIONS != 0 {
                ("CODE", SectionSemantics::ReadOnlyCode)
            } else {
                ("REGULAR", SectionSemantics::Default)
            }
        }
        S_ZEROFILL => ("ZEROFILL", SectionSemantics::ReadWriteData),
        S_CSTRING_LITERALS => ("CSTRING_LITERALS", SectionSemantics::ReadOnlyData),
        S_4BYTE_LITERALS => ("4BYTE_LITERALS", SectionSemantics::Default),
        S_8BYTE_LITERALS => ("8BYTE_LITERALS", SectionSemantics::Default),
        S_LITERAL_POINTERS => ("LITERAL_POINTERS", SectionSemantics::ReadOnlyData),
        S_NON_LAZY_SYMBOL_POINTERS => {
            ("NON_LAZY_SYMBOL_POINTERS", SectionSemantics::ReadOnlyData)
        }
        S_LAZY_SYMBOL_POINTERS => ("LAZY_SYMBOL_POINTERS", SectionSemantics::ReadOnlyData),
        S_SYMBOL_STUBS => ("SYMBOL_STUBS", SectionSemantics::ReadOnlyCode),
        S_MOD_INIT_FUNC_POINTERS => ("MOD_INIT_FUNC_POINTERS", SectionSemantics::ReadOnlyData),
        S_MOD_TERM_FUNC_POINTERS => ("MOD_TERM_FUNC_POINTERS", SectionSemantics::ReadOnlyData),
        S_COALESCED => ("COALESCED", SectionSemantics::Default),
        S_GB_ZEROFILL => ("GB_ZEROFILL", SectionSemantics::ReadWriteData),
        S_INTERPOSING => ("INTERPOSING", SectionSemantics::Default),
        S_16BYTE_LITERALS => ("16BYTE_LITERALS", SectionSemantics::Default),
        S_DTRACE_DOF => ("DTRACE_DOF", SectionSemantics::Default),
        S_LAZY_DYLIB_SYMBOL_POINTERS => {
            ("LAZY_DYLIB_SYMBOL_POINTERS", SectionSemantics::ReadOnlyData)
        }
        S_THREAD_LOCAL_REGULAR => ("THREAD_LOCAL_REGULAR", SectionSemantics::Default),
        S_THREAD_LOCAL_ZEROFILL => ("THREAD_LOCAL_ZEROFILL", SectionSemantics::Default),
        S_THREAD_LOCAL_VARIABLES => ("THREAD_LOCAL_VARIABLES", SectionSemantics::Default),
        S_THREAD_LOCAL_VARIABLE_POINTERS => {
            ("THREAD_LOCAL_VARIABLE_POINTERS", SectionSemantics::Default)
        }
        S_THREAD_LOCAL_INIT_FUNCTION_POINTERS => {
            ("THREAD_LOCAL_INIT_FUNCTION_POINTERS", SectionSemantics::Default)
        }
        _ => ("UNKNOWN", SectionSemantics::Default),
    }
}
