//! dscload - the dyld shared cache loader core.
//!
//! This library opens an Apple dyld shared cache (one primary file plus its
//! split subcaches), discovers the embedded Mach-O images, reconstructs a
//! unified virtual address space across the constituent files, rewrites
//! pointer-slide chains so stored pointers read as virtual addresses, and
//! exposes on-demand, idempotent loading of images and sub-regions into a
//! host analysis view together with symbol resolution and durable JSON
//! metadata.
//!
//! # Architecture
//!
//! - [`accessor`]: memory-mapped, capped, lazily materialized access to the
//!   individual cache files.
//! - [`vm`]: the ordered map from virtual address ranges to file offsets.
//! - [`dyld`]: the on-disk cache format and topology parsing.
//! - [`slide`]: the v2/v3/v5 slide-chain walkers rewriting pointers in
//!   place.
//! - [`macho`]: per-image load-command parsing and the export trie.
//! - [`controller`]: the [`SharedCache`] controller tying it together over
//!   a [`view::HostView`].
//! - [`state`]: the controller's persistent, copy-on-write state.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dscload::{HostView, SharedCache};
//!
//! fn load(view: Arc<dyn HostView>) -> dscload::Result<()> {
//!     let mut cache = SharedCache::open(view)?;
//!     for name in cache.available_images() {
//!         println!("{name}");
//!     }
//!     cache.load_image_with_install_name("/usr/lib/libobjc.A.dylib", false);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accessor;
pub mod config;
pub mod controller;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod slide;
pub mod state;
pub mod util;
pub mod view;
pub mod vm;

pub use config::LoaderSettings;
pub use controller::SharedCache;
pub use error::{Error, Result};
pub use macho::header::CacheMachOHeader;
pub use state::{
    BackingCache, CacheFormat, CacheImage, LoadProgress, MemoryRegion, State, ViewState,
    SHARED_CACHE_METADATA_TAG,
};
pub use view::{HostView, ObjcProcessor, SectionSemantics, SegmentFlags, Symbol, SymbolKind};
pub use vm::{VirtualMemory, VmReader};
