//! Dyld shared cache on-disk format and topology parsing.

pub mod structs;
pub mod topology;

pub use structs::*;
pub use topology::{fast_backing_cache_count, parse_topology, CacheTopology};
