//! Export trie parsing.
//!
//! The export trie is a labelled prefix tree compressing exported symbol
//! names to offsets within the image. Walking it is a recursive descent
//! over `[begin, end)`: each node carries optional terminal info (flags and
//! an image offset) followed by labelled child edges. Nothing about the
//! depth is trusted; a hard cap bounds the recursion.

use tracing::warn;

use super::constants::{
    EXPORT_SYMBOL_FLAGS_REEXPORT, S_ATTR_PURE_INSTRUCTIONS, S_ATTR_SOME_INSTRUCTIONS,
};
use super::header::CacheMachOHeader;
use crate::accessor::MappedFileAccessor;
use crate::error::{Error, Result};
use crate::util::read_uleb128;
use crate::view::{Symbol, SymbolKind};

/// Maximum descent depth; real tries are far shallower than this.
const MAX_TRIE_DEPTH: usize = 128;

struct TrieWalk<'a> {
    buffer: &'a [u8],
    header: &'a CacheMachOHeader,
    has_function_at: &'a dyn Fn(u64) -> bool,
    symbols: Vec<Symbol>,
}

impl TrieWalk<'_> {
    fn read_uleb(&self, cursor: &mut usize) -> Result<u64> {
        let (value, consumed) = read_uleb128(&self.buffer[(*cursor).min(self.buffer.len())..])
            .ok_or(Error::InvalidUleb128 {
                offset: *cursor as u64,
            })?;
        *cursor += consumed;
        Ok(value)
    }

    fn classify(&self, address: u64) -> SymbolKind {
        if (self.has_function_at)(address) {
            return SymbolKind::Function;
        }
        let flags = self.header.section_flags_at(address).unwrap_or(0);
        if flags & S_ATTR_PURE_INSTRUCTIONS != 0 || flags & S_ATTR_SOME_INSTRUCTIONS != 0 {
            SymbolKind::Function
        } else {
            SymbolKind::Data
        }
    }

    fn read_node(&mut self, mut cursor: usize, text: &str, depth: usize) -> Result<()> {
        if cursor > self.buffer.len() {
            return Err(Error::InvalidExportTrie {
                offset: cursor as u64,
            });
        }
        if depth > MAX_TRIE_DEPTH {
            return Err(Error::InvalidExportTrie {
                offset: cursor as u64,
            });
        }

        let terminal_size = self.read_uleb(&mut cursor)?;
        let child_cursor = cursor + terminal_size as usize;

        if terminal_size != 0 {
            let flags = self.read_uleb(&mut cursor)?;
            if flags & EXPORT_SYMBOL_FLAGS_REEXPORT == 0 {
                let image_offset = self.read_uleb(&mut cursor)?;
                let address = self.header.text_base + image_offset;
                if !text.is_empty() && address != 0 {
                    let kind = self.classify(address);
                    self.symbols.push(Symbol::new(address, kind, text));
                }
            }
        }

        let mut cursor = child_cursor;
        let child_count = *self
            .buffer
            .get(cursor)
            .ok_or(Error::InvalidExportTrie {
                offset: cursor as u64,
            })?;
        cursor += 1;

        for _ in 0..child_count {
            let label_start = cursor;
            while cursor < self.buffer.len() && self.buffer[cursor] != 0 {
                cursor += 1;
            }
            if cursor >= self.buffer.len() {
                return Err(Error::InvalidExportTrie {
                    offset: cursor as u64,
                });
            }
            let label = String::from_utf8_lossy(&self.buffer[label_start..cursor]).into_owned();
            cursor += 1;

            let next = self.read_uleb(&mut cursor)?;
            if next == 0 {
                return Err(Error::InvalidExportTrie {
                    offset: cursor as u64,
                });
            }
            let child_text = format!("{text}{label}");
            self.read_node(next as usize, &child_text, depth + 1)?;
        }
        Ok(())
    }
}

/// Walks the export trie of `header`, reading the trie bytes from
/// `linkedit_file`, and returns `(address, kind, name)` symbols.
///
/// `has_function_at` lets the classification consult the host view's
/// analysis state. A malformed trie yields the symbols gathered so far.
pub fn parse_export_trie(
    linkedit_file: &MappedFileAccessor,
    header: &CacheMachOHeader,
    has_function_at: &dyn Fn(u64) -> bool,
) -> Vec<Symbol> {
    if !header.export_trie_present || header.export_trie.datasize == 0 {
        return Vec::new();
    }

    let buffer = match linkedit_file.read_span(
        header.export_trie.dataoff as u64,
        header.export_trie.datasize as usize,
    ) {
        Ok(span) => span,
        Err(e) => {
            warn!(install_name = %header.install_name, error = %e, "failed to read export trie");
            return Vec::new();
        }
    };

    let mut walk = TrieWalk {
        buffer,
        header,
        has_function_at,
        symbols: Vec::new(),
    };
    if let Err(e) = walk.read_node(0, "", 0) {
        warn!(install_name = %header.install_name, error = %e, "failed to parse export trie");
    }
    walk.symbols
}

/// Walks an export trie given directly as bytes. Used when the trie has
/// already been copied out of the backing file.
pub fn parse_export_trie_buffer(
    buffer: &[u8],
    header: &CacheMachOHeader,
    has_function_at: &dyn Fn(u64) -> bool,
) -> Vec<Symbol> {
    let mut walk = TrieWalk {
        buffer,
        header,
        has_function_at,
        symbols: Vec::new(),
    };
    if let Err(e) = walk.read_node(0, "", 0) {
        warn!(install_name = %header.install_name, error = %e, "failed to parse export trie");
    }
    walk.symbols
}
