//! Mach-O parsing: constants, structures, per-image header loading, and the
//! export trie walker.

pub mod constants;
pub mod header;
pub mod structs;
pub mod trie;

pub use header::{load_header_for_address, CacheMachOHeader};
pub use structs::*;
pub use trie::parse_export_trie;
