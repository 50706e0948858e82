//! Mach-O header loading from the composite cache address space.
//!
//! Parses the load commands of a single image at a virtual address into a
//! [`CacheMachOHeader`]. 32-bit segment and routines commands are widened
//! to their 64-bit form; `LC_FILESET_ENTRY` images are rejected. Any
//! out-of-range read or malformed `cmdsize` aborts the parse and the caller
//! receives no header.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::base_name;
use crate::vm::{Endianness, VirtualMemory, VmReader};

/// Parsed header of one image inside the shared cache.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMachOHeader {
    /// Address of the Mach-O header (start of `__TEXT`).
    #[serde(rename = "textBase")]
    pub text_base: u64,
    /// Address immediately after the mach header, where load commands begin.
    #[serde(rename = "loadCommandOffset")]
    pub load_command_offset: u64,
    /// The mach header itself.
    pub ident: MachHeader64,
    /// Basename of the install name, used to prefix section and symbol names.
    #[serde(rename = "identifierPrefix")]
    pub identifier_prefix: String,
    /// Install name of the image.
    #[serde(rename = "installName")]
    pub install_name: String,

    /// `(address, from_lc_main)` entry points.
    #[serde(rename = "entryPoints")]
    pub entry_points: Vec<(u64, bool)>,

    /// Symbol table command.
    pub symtab: SymtabCommand,
    /// Dynamic symbol table command.
    pub dysymtab: DysymtabCommand,
    /// Compressed dyld info command.
    #[serde(rename = "dyldInfo")]
    pub dyld_info: DyldInfoCommand,
    /// Routines payload; parsed but not persisted.
    #[serde(skip)]
    pub routines64: RoutinesCommand64,
    /// Function starts location.
    #[serde(rename = "functionStarts")]
    pub function_starts: LinkeditDataCommand,
    /// Sections named `__mod_init_func`.
    #[serde(rename = "moduleInitSections")]
    pub module_init_sections: Vec<Section64>,
    /// Export trie location.
    #[serde(rename = "exportTrie")]
    pub export_trie: LinkeditDataCommand,
    /// Chained fixups location (presence only; not resolved here).
    #[serde(rename = "chainedFixups")]
    pub chained_fixups: LinkeditDataCommand,

    /// Base address used for relocations.
    #[serde(rename = "relocationBase")]
    pub relocation_base: u64,
    /// Segments, widened to 64-bit form.
    pub segments: Vec<SegmentCommand64>,
    /// The `__LINKEDIT` segment if present.
    #[serde(rename = "linkeditSegment")]
    pub linkedit_segment: SegmentCommand64,
    /// All sections of VM-mapped segments.
    pub sections: Vec<Section64>,
    /// Section names, prefixed with `identifier_prefix::`.
    #[serde(rename = "sectionNames")]
    pub section_names: Vec<String>,

    /// Sections holding symbol stubs.
    #[serde(rename = "symbolStubSections")]
    pub symbol_stub_sections: Vec<Section64>,
    /// Sections holding symbol pointers.
    #[serde(rename = "symbolPointerSections")]
    pub symbol_pointer_sections: Vec<Section64>,

    /// Referenced dylib install names.
    pub dylibs: Vec<String>,

    /// Build version command.
    #[serde(rename = "buildVersion")]
    pub build_version: BuildVersionCommand,
    /// `(tool, version)` pairs from the build version command.
    #[serde(rename = "buildToolVersions")]
    pub build_tool_versions: Vec<(u32, u32)>,

    /// Path of the backing file holding this image's export trie.
    #[serde(rename = "exportTriePath")]
    pub export_trie_path: String,

    /// Presence flags.
    #[serde(rename = "linkeditPresent")]
    pub linkedit_present: bool,
    #[serde(rename = "dysymPresent")]
    #[allow(missing_docs)]
    pub dysym_present: bool,
    #[serde(rename = "dyldInfoPresent")]
    #[allow(missing_docs)]
    pub dyld_info_present: bool,
    #[serde(rename = "exportTriePresent")]
    #[allow(missing_docs)]
    pub export_trie_present: bool,
    #[serde(rename = "chainedFixupsPresent")]
    #[allow(missing_docs)]
    pub chained_fixups_present: bool,
    #[serde(rename = "routinesPresent")]
    #[allow(missing_docs)]
    pub routines_present: bool,
    #[serde(rename = "functionStartsPresent")]
    #[allow(missing_docs)]
    pub function_starts_present: bool,
}

impl CacheMachOHeader {
    /// Returns the segment containing `address`, if any.
    pub fn segment_containing(&self, address: u64) -> Option<&SegmentCommand64> {
        self.segments.iter().find(|s| s.contains(address))
    }

    /// Flags of the section containing `address`, if any. When sections
    /// overlap the innermost match wins, mirroring a linear last-match scan.
    pub fn section_flags_at(&self, address: u64) -> Option<u32> {
        let mut flags = None;
        for section in &self.sections {
            if section.contains(address) {
                flags = Some(section.flags);
            }
        }
        flags
    }
}

fn read_name16(reader: &mut VmReader<'_>) -> Result<[u8; 16]> {
    let mut name = [0u8; 16];
    reader.read_into(&mut name)?;
    Ok(name)
}

fn read_section(reader: &mut VmReader<'_>, wide: bool) -> Result<Section64> {
    let mut sect = Section64 {
        sectname: read_name16(reader)?,
        segname: read_name16(reader)?,
        ..Default::default()
    };
    if wide {
        sect.addr = reader.read_u64()?;
        sect.size = reader.read_u64()?;
    } else {
        sect.addr = reader.read_u32()? as u64;
        sect.size = reader.read_u32()? as u64;
    }
    sect.offset = reader.read_u32()?;
    sect.align = reader.read_u32()?;
    sect.reloff = reader.read_u32()?;
    sect.nreloc = reader.read_u32()?;
    sect.flags = reader.read_u32()?;
    sect.reserved1 = reader.read_u32()?;
    sect.reserved2 = reader.read_u32()?;
    if wide {
        sect.reserved3 = reader.read_u32()?;
    }
    Ok(sect)
}

fn classify_section(header: &mut CacheMachOHeader, segment: &SegmentCommand64, sect: Section64) {
    // Sections of segments not mapped into virtual memory are not recorded.
    if segment.vmsize > 0 {
        header.sections.push(sect);
    }
    if sect.sectname.starts_with(b"__mod_init_func") {
        header.module_init_sections.push(sect);
    }
    if sect.flags & (S_ATTR_SELF_MODIFYING_CODE | S_SYMBOL_STUBS)
        == (S_ATTR_SELF_MODIFYING_CODE | S_SYMBOL_STUBS)
    {
        header.symbol_stub_sections.push(sect);
    }
    if sect.flags & SECTION_TYPE == S_NON_LAZY_SYMBOL_POINTERS
        || sect.flags & SECTION_TYPE == S_LAZY_SYMBOL_POINTERS
    {
        header.symbol_pointer_sections.push(sect);
    }
}

fn note_relocation_base(header: &mut CacheMachOHeader, segment: &SegmentCommand64, first: &mut bool) {
    if !*first {
        return;
    }
    let split_or_x86 =
        header.ident.flags & MH_SPLIT_SEGS != 0 || header.ident.cputype == CPU_TYPE_X86_64;
    if !split_or_x86 || segment.flags & VM_PROT_WRITE != 0 {
        header.relocation_base = segment.vmaddr;
        *first = false;
    }
}

/// Reads the Mach-O image at `address`, returning `None` when there is no
/// parseable header there (bad magic, malformed command sizes, or reads off
/// the mapped ranges).
pub fn load_header_for_address(
    vm: &VirtualMemory,
    address: u64,
    install_name: &str,
) -> Result<Option<CacheMachOHeader>> {
    match parse_header(vm, address, install_name) {
        Ok(header) => Ok(Some(header)),
        Err(e) if e.is_mapping_read() || matches!(e, Error::InvalidMachoMagic(_) | Error::Malformed { .. }) => {
            debug!(address, install_name, error = %e, "no Mach-O header");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn parse_header(
    vm: &VirtualMemory,
    address: u64,
    install_name: &str,
) -> Result<CacheMachOHeader> {
    let mut header = CacheMachOHeader {
        text_base: address,
        install_name: install_name.to_string(),
        identifier_prefix: base_name(install_name).to_string(),
        ..Default::default()
    };

    let mut reader = VmReader::new(vm);
    reader.seek(address);

    header.ident.magic = reader.read_u32()?;
    let endianness = match header.ident.magic {
        MH_MAGIC | MH_MAGIC_64 => Endianness::Little,
        MH_CIGAM | MH_CIGAM_64 => Endianness::Big,
        other => return Err(Error::InvalidMachoMagic(other)),
    };
    reader.set_endianness(endianness);

    header.ident.cputype = reader.read_u32()?;
    header.ident.cpusubtype = reader.read_u32()?;
    header.ident.filetype = reader.read_u32()?;
    header.ident.ncmds = reader.read_u32()?;
    header.ident.sizeofcmds = reader.read_u32()?;
    header.ident.flags = reader.read_u32()?;
    if header.ident.cputype & CPU_ARCH_ABI64 != 0 {
        header.ident.reserved = reader.read_u32()?;
    }
    header.load_command_offset = reader.offset();

    let mut first = true;
    for _ in 0..header.ident.ncmds {
        let cur_offset = reader.offset();
        let cmd = reader.read_u32()?;
        let cmdsize = reader.read_u32()?;
        let next_offset = cur_offset + cmdsize as u64;
        if (cmdsize as usize) < 8 {
            return Err(Error::malformed(cur_offset, "load command size underflow"));
        }

        match cmd {
            LC_MAIN => {
                let entry = reader.read_u64()?;
                header.entry_points.push((entry, true));
                let _stack_size = reader.read_u64()?;
            }
            LC_SEGMENT => {
                // Widen the 32-bit form to 64 bits.
                let mut segment = SegmentCommand64 {
                    segname: read_name16(&mut reader)?,
                    ..Default::default()
                };
                segment.vmaddr = reader.read_u32()? as u64;
                segment.vmsize = reader.read_u32()? as u64;
                segment.fileoff = reader.read_u32()? as u64;
                segment.filesize = reader.read_u32()? as u64;
                segment.maxprot = reader.read_u32()?;
                segment.initprot = reader.read_u32()?;
                segment.nsects = reader.read_u32()?;
                segment.flags = reader.read_u32()?;
                note_relocation_base(&mut header, &segment, &mut first);
                for _ in 0..segment.nsects {
                    let sect = read_section(&mut reader, false)?;
                    classify_section(&mut header, &segment, sect);
                }
                header.segments.push(segment);
            }
            LC_SEGMENT_64 => {
                let mut segment = SegmentCommand64 {
                    segname: read_name16(&mut reader)?,
                    ..Default::default()
                };
                segment.vmaddr = reader.read_u64()?;
                segment.vmsize = reader.read_u64()?;
                segment.fileoff = reader.read_u64()?;
                segment.filesize = reader.read_u64()?;
                segment.maxprot = reader.read_u32()?;
                segment.initprot = reader.read_u32()?;
                segment.nsects = reader.read_u32()?;
                segment.flags = reader.read_u32()?;
                if segment.is_linkedit() {
                    header.linkedit_segment = segment;
                    header.linkedit_present = true;
                }
                note_relocation_base(&mut header, &segment, &mut first);
                for _ in 0..segment.nsects {
                    let sect = read_section(&mut reader, true)?;
                    classify_section(&mut header, &segment, sect);
                }
                header.segments.push(segment);
            }
            LC_ROUTINES => {
                header.routines64.init_address = reader.read_u32()? as u64;
                header.routines64.init_module = reader.read_u32()? as u64;
                header.routines64.reserved1 = reader.read_u32()? as u64;
                header.routines64.reserved2 = reader.read_u32()? as u64;
                header.routines64.reserved3 = reader.read_u32()? as u64;
                header.routines64.reserved4 = reader.read_u32()? as u64;
                header.routines64.reserved5 = reader.read_u32()? as u64;
                header.routines64.reserved6 = reader.read_u32()? as u64;
                header.routines_present = true;
            }
            LC_ROUTINES_64 => {
                header.routines64.init_address = reader.read_u64()?;
                header.routines64.init_module = reader.read_u64()?;
                header.routines64.reserved1 = reader.read_u64()?;
                header.routines64.reserved2 = reader.read_u64()?;
                header.routines64.reserved3 = reader.read_u64()?;
                header.routines64.reserved4 = reader.read_u64()?;
                header.routines64.reserved5 = reader.read_u64()?;
                header.routines64.reserved6 = reader.read_u64()?;
                header.routines_present = true;
            }
            LC_FUNCTION_STARTS => {
                header.function_starts.dataoff = reader.read_u32()?;
                header.function_starts.datasize = reader.read_u32()?;
                header.function_starts_present = true;
            }
            LC_SYMTAB => {
                header.symtab.symoff = reader.read_u32()?;
                header.symtab.nsyms = reader.read_u32()?;
                header.symtab.stroff = reader.read_u32()?;
                header.symtab.strsize = reader.read_u32()?;
            }
            LC_DYSYMTAB => {
                header.dysymtab.ilocalsym = reader.read_u32()?;
                header.dysymtab.nlocalsym = reader.read_u32()?;
                header.dysymtab.iextdefsym = reader.read_u32()?;
                header.dysymtab.nextdefsym = reader.read_u32()?;
                header.dysymtab.iundefsym = reader.read_u32()?;
                header.dysymtab.nundefsym = reader.read_u32()?;
                header.dysymtab.tocoff = reader.read_u32()?;
                header.dysymtab.ntoc = reader.read_u32()?;
                header.dysymtab.modtaboff = reader.read_u32()?;
                header.dysymtab.nmodtab = reader.read_u32()?;
                header.dysymtab.extrefsymoff = reader.read_u32()?;
                header.dysymtab.nextrefsyms = reader.read_u32()?;
                header.dysymtab.indirectsymoff = reader.read_u32()?;
                header.dysymtab.nindirectsyms = reader.read_u32()?;
                header.dysymtab.extreloff = reader.read_u32()?;
                header.dysymtab.nextrel = reader.read_u32()?;
                header.dysymtab.locreloff = reader.read_u32()?;
                header.dysymtab.nlocrel = reader.read_u32()?;
                header.dysym_present = true;
            }
            LC_DYLD_CHAINED_FIXUPS => {
                header.chained_fixups.dataoff = reader.read_u32()?;
                header.chained_fixups.datasize = reader.read_u32()?;
                header.chained_fixups_present = true;
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                header.dyld_info.rebase_off = reader.read_u32()?;
                header.dyld_info.rebase_size = reader.read_u32()?;
                header.dyld_info.bind_off = reader.read_u32()?;
                header.dyld_info.bind_size = reader.read_u32()?;
                header.dyld_info.weak_bind_off = reader.read_u32()?;
                header.dyld_info.weak_bind_size = reader.read_u32()?;
                header.dyld_info.lazy_bind_off = reader.read_u32()?;
                header.dyld_info.lazy_bind_size = reader.read_u32()?;
                header.dyld_info.export_off = reader.read_u32()?;
                header.dyld_info.export_size = reader.read_u32()?;
                header.export_trie.dataoff = header.dyld_info.export_off;
                header.export_trie.datasize = header.dyld_info.export_size;
                header.export_trie_present = true;
                header.dyld_info_present = true;
            }
            LC_DYLD_EXPORTS_TRIE => {
                header.export_trie.dataoff = reader.read_u32()?;
                header.export_trie.datasize = reader.read_u32()?;
                header.export_trie_present = true;
            }
            LC_LOAD_DYLIB => {
                let name_offset = reader.read_u32()?;
                if (name_offset as u64) < cmdsize as u64 {
                    let libname = reader.read_cstring(cur_offset + name_offset as u64)?;
                    header.dylibs.push(libname);
                }
            }
            LC_BUILD_VERSION => {
                header.build_version.platform = reader.read_u32()?;
                header.build_version.minos = reader.read_u32()?;
                header.build_version.sdk = reader.read_u32()?;
                header.build_version.ntools = reader.read_u32()?;
                let ntools = header.build_version.ntools.min(10);
                for _ in 0..ntools {
                    let tool = reader.read_u32()?;
                    let version = reader.read_u32()?;
                    header.build_tool_versions.push((tool, version));
                }
            }
            LC_FILESET_ENTRY => {
                return Err(Error::malformed(cur_offset, "fileset images are unsupported"));
            }
            LC_THREAD | LC_UNIXTHREAD => {
                // Thread-state entry points are not used for cache dylibs.
            }
            _ => {}
        }
        reader.seek(next_offset);
    }

    for section in &header.sections {
        let name = crate::util::fixed_string(&section.sectname);
        if header.identifier_prefix.is_empty() {
            header.section_names.push(name);
        } else {
            header
                .section_names
                .push(format!("{}::{}", header.identifier_prefix, name));
        }
    }

    Ok(header)
}
