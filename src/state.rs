//! Controller state and persistence.
//!
//! The controller's observable state is held as a shared snapshot with a
//! copy-on-write discipline: saving publishes the snapshot (to the view's
//! metadata and to the per-view cached state), after which the snapshot is
//! shared and must be re-uniqued via [`CowState::will_mutate`] before the
//! next mutation. Mutating a shared snapshot directly is a programmer error
//! and panics.
//!
//! The serialized form is a JSON document stored under
//! [`SHARED_CACHE_METADATA_TAG`]; maps keyed by addresses serialize as
//! arrays of `[key, value]` pairs so integers stay JSON numbers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::dyld::structs::DyldCacheMappingInfo;
use crate::error::{Error, Result};
use crate::macho::header::CacheMachOHeader;
use crate::view::{SegmentFlags, Symbol};

/// Metadata key under which the state is stored on the view and raw view.
pub const SHARED_CACHE_METADATA_TAG: &str = "SHAREDCACHE-SharedCacheData";

/// Version tag of the serialized metadata schema.
pub const METADATA_VERSION: u32 = 1;

// =============================================================================
// Enums
// =============================================================================

/// Load state of the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewState {
    /// Nothing parsed yet.
    #[default]
    Unloaded,
    /// Topology parsed, no images materialized.
    Loaded,
    /// At least one image materialized.
    LoadedWithImages,
}

impl ViewState {
    fn as_u8(self) -> u8 {
        match self {
            ViewState::Unloaded => 0,
            ViewState::Loaded => 1,
            ViewState::LoadedWithImages => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ViewState::Loaded,
            2 => ViewState::LoadedWithImages,
            _ => ViewState::Unloaded,
        }
    }
}

/// On-disk layout family of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheFormat {
    /// Single-file cache (old style).
    #[default]
    Regular,
    /// Split cache with numeric subcaches.
    Split,
    /// Large cache with extension-named subcaches.
    Large,
    /// iOS 16+ multi-cache.
    IOS16,
}

impl CacheFormat {
    fn as_u8(self) -> u8 {
        match self {
            CacheFormat::Regular => 0,
            CacheFormat::Split => 1,
            CacheFormat::Large => 2,
            CacheFormat::IOS16 => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => CacheFormat::Split,
            2 => CacheFormat::Large,
            3 => CacheFormat::IOS16,
            _ => CacheFormat::Regular,
        }
    }
}

macro_rules! serde_as_u8 {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_u8(self.as_u8())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(
                d: D,
            ) -> std::result::Result<Self, D::Error> {
                Ok(<$ty>::from_u8(u8::deserialize(d)?))
            }
        }
    };
}

serde_as_u8!(ViewState);
serde_as_u8!(CacheFormat);

/// Progress of the initial load, observable across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProgress {
    /// No controller has started loading yet.
    NotStarted,
    /// Reading cache headers and subcaches.
    LoadingCaches,
    /// Parsing image headers.
    LoadingImages,
    /// Initial load complete.
    Finished,
}

// =============================================================================
// Regions, Images, Caches
// =============================================================================

/// A materializable unit of the cache address space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// Display name, e.g. `libsystem_c.dylib::__TEXT`.
    #[serde(rename = "prettyName")]
    pub pretty_name: String,
    /// Start virtual address.
    pub start: u64,
    /// Size in bytes.
    pub size: u64,
    /// Whether the region has been materialized into the view.
    pub loaded: bool,
    /// Offset of the region's bytes in the raw view, valid when `loaded`.
    #[serde(rename = "rawViewOffsetIfLoaded")]
    pub raw_view_offset_if_loaded: u64,
    /// Whether per-section/header structures have been defined.
    #[serde(rename = "headerInitialized")]
    pub header_initialized: bool,
    /// Segment protection flags.
    pub flags: SegmentFlags,
}

impl MemoryRegion {
    /// Creates an unloaded region.
    pub fn new(pretty_name: impl Into<String>, start: u64, size: u64, flags: SegmentFlags) -> Self {
        Self {
            pretty_name: pretty_name.into(),
            start,
            size,
            loaded: false,
            raw_view_offset_if_loaded: 0,
            header_initialized: false,
            flags,
        }
    }

    /// End address (exclusive).
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// True if `address` lies inside the region.
    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end()
    }
}

/// One image of the cache plus its segment regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheImage {
    /// Install name, e.g. `/usr/lib/libobjc.A.dylib`.
    #[serde(rename = "installName")]
    pub install_name: String,
    /// Virtual address of the Mach-O header.
    #[serde(rename = "headerLocation")]
    pub header_location: u64,
    /// Segment regions of the image.
    pub regions: Vec<MemoryRegion>,
}

/// One file on disk contributing part of the cache address space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackingCache {
    /// Path of the file.
    pub path: String,
    /// True for the primary cache file.
    #[serde(rename = "isPrimary")]
    pub is_primary: bool,
    /// The file's VM mappings.
    #[serde(with = "mapping_tuples")]
    pub mappings: Vec<DyldCacheMappingInfo>,
}

// Mappings persist as [address, size, fileOffset, maxProt, initProt] arrays.
mod mapping_tuples {
    use super::DyldCacheMappingInfo;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        mappings: &[DyldCacheMappingInfo],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(mappings.len()))?;
        for m in mappings {
            seq.serialize_element(&(m.address, m.size, m.file_offset, m.max_prot, m.init_prot))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Vec<DyldCacheMappingInfo>, D::Error> {
        let raw: Vec<(u64, u64, u64, u32, u32)> = Deserialize::deserialize(d)?;
        Ok(raw
            .into_iter()
            .map(
                |(address, size, file_offset, max_prot, init_prot)| DyldCacheMappingInfo {
                    address,
                    size,
                    file_offset,
                    max_prot,
                    init_prot,
                },
            )
            .collect())
    }
}

// Address-keyed maps persist as arrays of [key, value] pairs so keys stay
// JSON numbers.
mod keyed_pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer, V: Serialize>(
        map: &BTreeMap<u64, V>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>, V: Deserialize<'de>>(
        d: D,
    ) -> Result<BTreeMap<u64, V>, D::Error> {
        let raw: Vec<(u64, V)> = Deserialize::deserialize(d)?;
        Ok(raw.into_iter().collect())
    }
}

// =============================================================================
// State
// =============================================================================

/// Everything the controller knows about a loaded cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Schema version of this document.
    #[serde(rename = "metadataVersion")]
    pub metadata_version: u32,
    /// View load state.
    #[serde(rename = "m_viewState")]
    pub view_state: ViewState,
    /// Detected cache format.
    #[serde(rename = "m_cacheFormat")]
    pub cache_format: CacheFormat,
    /// Install name to Mach-O header address.
    #[serde(rename = "m_imageStarts")]
    pub image_starts: BTreeMap<String, u64>,
    /// Path of the primary cache file.
    #[serde(rename = "m_baseFilePath")]
    pub base_file_path: String,
    /// Parsed image headers keyed by text base.
    #[serde(with = "keyed_pairs")]
    pub headers: BTreeMap<u64, CacheMachOHeader>,
    /// Export trie symbols keyed by image text base.
    #[serde(rename = "exportInfos", with = "keyed_pairs")]
    pub export_infos: BTreeMap<u64, Vec<Symbol>>,
    /// Symtab symbols keyed by image text base.
    #[serde(rename = "symbolInfos", with = "keyed_pairs")]
    pub symbol_infos: BTreeMap<u64, Vec<Symbol>>,
    /// The files backing the cache.
    #[serde(rename = "backingCaches")]
    pub backing_caches: Vec<BackingCache>,
    /// Stub island regions.
    #[serde(rename = "stubIslands")]
    pub stub_island_regions: Vec<MemoryRegion>,
    /// Images and their regions.
    pub images: Vec<CacheImage>,
    /// Regions already materialized into the view.
    #[serde(rename = "regionsMappedIntoMemory")]
    pub regions_mapped_into_memory: Vec<MemoryRegion>,
    /// dyld-data regions.
    #[serde(rename = "dyldDataSections")]
    pub dyld_data_regions: Vec<MemoryRegion>,
    /// Raw cache mappings not overlapping any image segment.
    #[serde(rename = "nonImageRegions")]
    pub non_image_regions: Vec<MemoryRegion>,
    /// `(offset, size)` of the ObjC optimization data, if present.
    #[serde(rename = "objcOptimizationDataRange")]
    pub objc_optimization_data_range: Option<(u64, u64)>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            metadata_version: METADATA_VERSION,
            view_state: ViewState::default(),
            cache_format: CacheFormat::default(),
            image_starts: BTreeMap::new(),
            base_file_path: String::new(),
            headers: BTreeMap::new(),
            export_infos: BTreeMap::new(),
            symbol_infos: BTreeMap::new(),
            backing_caches: Vec::new(),
            stub_island_regions: Vec::new(),
            images: Vec::new(),
            regions_mapped_into_memory: Vec::new(),
            dyld_data_regions: Vec::new(),
            non_image_regions: Vec::new(),
            objc_optimization_data_range: None,
        }
    }
}

impl State {
    /// Serializes the state to the JSON metadata document.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes a metadata document, rejecting schema mismatches.
    pub fn from_json(data: &str) -> Result<State> {
        let state: State = serde_json::from_str(data)?;
        if state.metadata_version != METADATA_VERSION {
            return Err(Error::StateVersionMismatch {
                found: state.metadata_version,
                expected: METADATA_VERSION,
            });
        }
        Ok(state)
    }

    /// Base address of the cache: the first mapping of the primary cache.
    pub fn base_address(&self) -> u64 {
        let Some(primary) = self.backing_caches.first() else {
            return 0;
        };
        assert!(primary.is_primary, "first backing cache must be primary");
        primary.mappings.first().map(|m| m.address).unwrap_or(0)
    }

    /// Returns the parsed header whose segments contain `address`.
    pub fn header_containing(&self, address: u64) -> Option<&CacheMachOHeader> {
        self.headers
            .values()
            .find(|h| h.segments.iter().any(|s| s.contains(address)))
    }
}

// =============================================================================
// Copy-on-write Cell
// =============================================================================

/// Shared-snapshot holder enforcing the mutation discipline.
#[derive(Debug)]
pub struct CowState {
    state: Arc<State>,
    shared: bool,
}

impl CowState {
    /// Wraps a fresh, uniquely owned state.
    pub fn new(state: State) -> Self {
        Self {
            state: Arc::new(state),
            shared: false,
        }
    }

    /// Adopts an already shared snapshot.
    pub fn shared(state: Arc<State>) -> Self {
        Self {
            state,
            shared: true,
        }
    }

    /// Read access to the snapshot.
    pub fn get(&self) -> &State {
        &self.state
    }

    /// Ensures the snapshot is uniquely owned, cloning it if it is shared.
    /// Idempotent.
    pub fn will_mutate(&mut self) {
        if self.shared || Arc::strong_count(&self.state) > 1 {
            self.state = Arc::new((*self.state).clone());
            self.shared = false;
        }
    }

    /// Mutable access to the snapshot.
    ///
    /// # Panics
    ///
    /// Panics if the snapshot is shared; call [`CowState::will_mutate`]
    /// first.
    pub fn get_mut(&mut self) -> &mut State {
        assert!(
            !self.shared,
            "attempted to mutate a shared state snapshot without will_mutate()"
        );
        Arc::get_mut(&mut self.state).expect("state snapshot must be uniquely owned for mutation")
    }

    /// Publishes the snapshot for sharing and returns the shared handle.
    /// Further mutation requires [`CowState::will_mutate`] again.
    pub fn share(&mut self) -> Arc<State> {
        self.shared = true;
        Arc::clone(&self.state)
    }
}

// =============================================================================
// Per-view Shared State
// =============================================================================

/// State shared by all controllers attached to the same view.
pub struct ViewSpecificState {
    /// Load progress, readable without locks.
    progress: AtomicU8,
    /// Serializes multi-step operations that mutate metadata.
    pub operations_lock: Mutex<()>,
    /// Guards installation of the cached state snapshot.
    pub cached_state: Mutex<Option<Arc<State>>>,
    /// Availability cache of per-image type libraries.
    pub type_libraries: Mutex<HashMap<String, bool>>,
}

impl ViewSpecificState {
    fn new() -> Self {
        Self {
            progress: AtomicU8::new(0),
            operations_lock: Mutex::new(()),
            cached_state: Mutex::new(None),
            type_libraries: Mutex::new(HashMap::new()),
        }
    }

    /// Current load progress.
    pub fn progress(&self) -> LoadProgress {
        match self.progress.load(Ordering::Acquire) {
            1 => LoadProgress::LoadingCaches,
            2 => LoadProgress::LoadingImages,
            3 => LoadProgress::Finished,
            _ => LoadProgress::NotStarted,
        }
    }

    /// Updates the load progress.
    pub fn set_progress(&self, progress: LoadProgress) {
        let v = match progress {
            LoadProgress::NotStarted => 0,
            LoadProgress::LoadingCaches => 1,
            LoadProgress::LoadingImages => 2,
            LoadProgress::Finished => 3,
        };
        self.progress.store(v, Ordering::Release);
    }
}

type ViewStateRegistry = Mutex<HashMap<u64, Weak<ViewSpecificState>>>;

fn view_state_registry() -> &'static ViewStateRegistry {
    static REGISTRY: OnceLock<ViewStateRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the shared per-view state for `view_id`, creating it when
/// `insert_if_needed`. Expired entries are pruned on insertion.
pub fn view_specific_state_for_id(
    view_id: u64,
    insert_if_needed: bool,
) -> Option<Arc<ViewSpecificState>> {
    let mut registry = view_state_registry().lock().unwrap();

    if let Some(weak) = registry.get(&view_id) {
        if let Some(state) = weak.upgrade() {
            return Some(state);
        }
    }

    if !insert_if_needed {
        return None;
    }

    let state = Arc::new(ViewSpecificState::new());
    registry.insert(view_id, Arc::downgrade(&state));
    registry.retain(|_, weak| weak.strong_count() > 0);
    Some(state)
}

/// Reports the load progress for `view_id` without creating registry
/// entries.
pub fn load_progress(view_id: u64) -> LoadProgress {
    match view_specific_state_for_id(view_id, false) {
        Some(state) => state.progress(),
        None => LoadProgress::NotStarted,
    }
}

/// Decodes a metadata document, logging failures.
pub fn decode_metadata(data: &str) -> Option<State> {
    match State::from_json(data) {
        Ok(state) => Some(state),
        Err(e) => {
            error!(error = %e, "failed to deserialize shared cache metadata");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::SymbolKind;

    fn sample_state() -> State {
        let mut state = State {
            metadata_version: METADATA_VERSION,
            view_state: ViewState::Loaded,
            cache_format: CacheFormat::Split,
            base_file_path: "/tmp/dyld_shared_cache_arm64e".into(),
            objc_optimization_data_range: Some((0x8000, 0x100)),
            ..Default::default()
        };
        state
            .image_starts
            .insert("/usr/lib/libA.dylib".into(), 0x1_8000_0000);
        state.backing_caches.push(BackingCache {
            path: "/tmp/dyld_shared_cache_arm64e".into(),
            is_primary: true,
            mappings: vec![DyldCacheMappingInfo {
                address: 0x1_8000_0000,
                size: 0x4000,
                file_offset: 0,
                max_prot: 5,
                init_prot: 5,
            }],
        });
        state.images.push(CacheImage {
            install_name: "/usr/lib/libA.dylib".into(),
            header_location: 0x1_8000_0000,
            regions: vec![MemoryRegion::new(
                "libA.dylib::__TEXT",
                0x1_8000_0000,
                0x4000,
                SegmentFlags::READABLE | SegmentFlags::EXECUTABLE,
            )],
        });
        state.export_infos.insert(
            0x1_8000_0000,
            vec![Symbol::new(0x1_8000_1234, SymbolKind::Function, "_f")],
        );
        state
    }

    #[test]
    fn test_round_trip() {
        let state = sample_state();
        let json = state.to_json().unwrap();
        let back = State::from_json(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_metadata_keys_present() {
        let json = sample_state().to_json().unwrap();
        for key in [
            "metadataVersion",
            "m_viewState",
            "m_cacheFormat",
            "m_imageStarts",
            "m_baseFilePath",
            "headers",
            "exportInfos",
            "symbolInfos",
            "backingCaches",
            "stubIslands",
            "images",
            "regionsMappedIntoMemory",
            "dyldDataSections",
            "nonImageRegions",
        ] {
            assert!(json.contains(&format!("\"{key}\"")), "missing key {key}");
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut state = sample_state();
        state.metadata_version = METADATA_VERSION + 7;
        let json = state.to_json().unwrap();
        assert!(matches!(
            State::from_json(&json),
            Err(Error::StateVersionMismatch { .. })
        ));
        assert!(decode_metadata(&json).is_none());
    }

    #[test]
    fn test_base_address() {
        let state = sample_state();
        assert_eq!(state.base_address(), 0x1_8000_0000);
        assert_eq!(State::default().base_address(), 0);
    }

    #[test]
    fn test_cow_discipline() {
        let mut cow = CowState::new(sample_state());
        cow.get_mut().view_state = ViewState::LoadedWithImages;

        let shared = cow.share();
        assert_eq!(Arc::strong_count(&shared), 2);

        // Mutating without will_mutate would panic; will_mutate re-uniques.
        cow.will_mutate();
        cow.get_mut().view_state = ViewState::Loaded;

        // The published snapshot is unaffected.
        assert_eq!(shared.view_state, ViewState::LoadedWithImages);
        assert_eq!(cow.get().view_state, ViewState::Loaded);
    }

    #[test]
    #[should_panic(expected = "shared state snapshot")]
    fn test_shared_mutation_panics() {
        let mut cow = CowState::new(sample_state());
        let _shared = cow.share();
        let _ = cow.get_mut();
    }

    #[test]
    fn test_registry_prunes() {
        let a = view_specific_state_for_id(4001, true).unwrap();
        a.set_progress(LoadProgress::Finished);
        assert_eq!(load_progress(4001), LoadProgress::Finished);
        drop(a);
        // The entry expired; a lookup without insertion sees nothing.
        assert_eq!(load_progress(4001), LoadProgress::NotStarted);
    }
}
