use std::{
    collections::BTreeMap,
    io::{Read, Seek, SeekFrom},
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use byteorder::{BigEndian, ReadBytesExt};
use object::{
    elf::{
        R_PPC_ADDR14, R_PPC_ADDR14_BRNTAKEN, R_PPC_ADDR14_BRTAKEN, R_PPC_ADDR16, R_PPC_ADDR16_HA,
        R_PPC_ADDR16_HI, R_PPC_ADDR16_LO, R_PPC_ADDR24, R_PPC_ADDR32, R_PPC_NONE, R_PPC_REL24,
        R_PPC_REL32, SHF_EXECINSTR,
    },
    Object, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget, SectionFlags,
    SectionKind,
};

use crate::util::{
    buffer::BeBuffer,
    elf::{entry_symbol, section_count},
    symbols::SymbolMap,
};

/// Do not relocate anything, but advance the offset cursor by the offset
/// field. Emitted when two relocations in a section are more than 0xFFFF
/// bytes apart.
pub const R_DOLPHIN_NOP: u32 = 201;
/// Change which section relocations are being applied to and reset the
/// offset cursor to 0.
pub const R_DOLPHIN_SECTION: u32 = 202;
/// Stop parsing the relocation list for the current module.
pub const R_DOLPHIN_END: u32 = 203;
/// Reference marker. Never emitted here.
#[allow(unused)]
pub const R_DOLPHIN_MRKREF: u32 = 204;

/// Sections OSLink knows how to handle. A section is copied into the REL iff
/// its name matches one of these exactly or begins with `<name>.`.
pub const REL_SECTION_NAMES: [&str; 7] =
    [".init", ".text", ".ctors", ".dtors", ".rodata", ".data", ".bss"];

fn keep_section(name: &str) -> bool {
    REL_SECTION_NAMES.iter().any(|&mask| {
        name == mask || name.strip_prefix(mask).is_some_and(|rest| rest.starts_with('.'))
    })
}

/// Relocations against the DOL and the module itself sort to the back of the
/// stream, where OSLinkFixed can discard them after applying them.
fn module_delay(self_id: u32, module_id: u32) -> u32 {
    if module_id == 0 || module_id == self_id {
        1
    } else {
        0
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelHeader {
    pub module_id: u32,
    pub num_sections: u32,
    pub section_info_offset: u32,
    pub version: u32,
    pub bss_size: u32,
    pub rel_offset: u32,
    pub imp_offset: u32,
    pub imp_size: u32,
    pub prolog_section: u8,
    pub epilog_section: u8,
    pub unresolved_section: u8,
    pub prolog_offset: u32,
    pub epilog_offset: u32,
    pub unresolved_offset: u32,
    /// Maximum alignment of any copied section. (v2+)
    pub align: Option<u32>,
    /// Maximum alignment of any BSS section. (v2+)
    pub bss_align: Option<u32>,
    /// Module size after OSLinkFixed trims the discardable relocations. (v3+)
    pub fix_size: Option<u32>,
}

impl RelHeader {
    /// Header size for a given format version. v1 ends after the entry
    /// offsets, v2 appends the alignment fields, v3 appends `fix_size`.
    pub const fn size(version: u32) -> u32 {
        match version {
            1 => 0x40,
            2 => 0x48,
            _ => 0x4C,
        }
    }

    fn write(&self, buf: &mut BeBuffer) {
        buf.push_u32(self.module_id);
        buf.push_u32(0); // prev link, filled at runtime
        buf.push_u32(0); // next link, filled at runtime
        buf.push_u32(self.num_sections);
        buf.push_u32(self.section_info_offset);
        buf.push_u32(0); // name offset
        buf.push_u32(0); // name size
        buf.push_u32(self.version);
        buf.push_u32(self.bss_size);
        buf.push_u32(self.rel_offset);
        buf.push_u32(self.imp_offset);
        buf.push_u32(self.imp_size);
        buf.push_u8(self.prolog_section);
        buf.push_u8(self.epilog_section);
        buf.push_u8(self.unresolved_section);
        buf.push_u8(0); // bss section, filled at runtime
        buf.push_u32(self.prolog_offset);
        buf.push_u32(self.epilog_offset);
        buf.push_u32(self.unresolved_offset);
        if self.version >= 2 {
            buf.push_u32(self.align.unwrap_or_default());
            buf.push_u32(self.bss_align.unwrap_or_default());
        }
        if self.version >= 3 {
            buf.push_u32(self.fix_size.unwrap_or_default());
        }
    }

    fn parse<R>(reader: &mut R) -> Result<Self>
    where R: Read + Seek + ?Sized {
        let module_id = reader.read_u32::<BigEndian>()?;
        ensure!(reader.read_u32::<BigEndian>()? == 0, "Expected 'prev' link to be 0");
        ensure!(reader.read_u32::<BigEndian>()? == 0, "Expected 'next' link to be 0");
        let num_sections = reader.read_u32::<BigEndian>()?;
        let section_info_offset = reader.read_u32::<BigEndian>()?;
        let _name_offset = reader.read_u32::<BigEndian>()?;
        let _name_size = reader.read_u32::<BigEndian>()?;
        let version = reader.read_u32::<BigEndian>()?;
        ensure!(matches!(version, 1..=3), "Unsupported REL version {}", version);
        let bss_size = reader.read_u32::<BigEndian>()?;
        let rel_offset = reader.read_u32::<BigEndian>()?;
        let imp_offset = reader.read_u32::<BigEndian>()?;
        let imp_size = reader.read_u32::<BigEndian>()?;
        let prolog_section = reader.read_u8()?;
        let epilog_section = reader.read_u8()?;
        let unresolved_section = reader.read_u8()?;
        ensure!(reader.read_u8()? == 0, "Expected BSS section index to be 0");
        let prolog_offset = reader.read_u32::<BigEndian>()?;
        let epilog_offset = reader.read_u32::<BigEndian>()?;
        let unresolved_offset = reader.read_u32::<BigEndian>()?;
        let (align, bss_align) = if version >= 2 {
            (Some(reader.read_u32::<BigEndian>()?), Some(reader.read_u32::<BigEndian>()?))
        } else {
            (None, None)
        };
        let fix_size = if version >= 3 { Some(reader.read_u32::<BigEndian>()?) } else { None };
        Ok(Self {
            module_id,
            num_sections,
            section_info_offset,
            version,
            bss_size,
            rel_offset,
            imp_offset,
            imp_size,
            prolog_section,
            epilog_section,
            unresolved_section,
            prolog_offset,
            epilog_offset,
            unresolved_offset,
            align,
            bss_align,
            fix_size,
        })
    }
}

/// One resolved relocation, before delta encoding (writer side) or after
/// stream decoding (reader side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelReloc {
    /// Module the relocation resolves against. 0 is the DOL.
    pub module_id: u32,
    /// ELF index of the section being patched.
    pub section: u32,
    /// Byte offset of the patch site within `section`.
    pub offset: u32,
    /// Raw R_PPC_* relocation type.
    pub r_type: u32,
    /// Section index within the target module. Ignored by OSLink for DOL
    /// references.
    pub target_section: u8,
    /// Offset within `target_section`, or an absolute address for DOL
    /// references.
    pub addend: u32,
}

/// Builds a complete REL image from a validated relocatable ELF.
pub fn make_rel(
    obj_file: &object::File,
    symbol_map: &SymbolMap,
    module_id: u32,
    version: u32,
) -> Result<Vec<u8>> {
    ensure!(matches!(version, 1..=3), "Unsupported REL version {version}");

    let (prolog_section, prolog_offset) = entry_symbol(obj_file, "_prolog");
    let (epilog_section, epilog_offset) = entry_symbol(obj_file, "_epilog");
    let (unresolved_section, unresolved_offset) = entry_symbol(obj_file, "_unresolved");

    let mut buf = BeBuffer::new();
    // Sizes the header; the real field values are spliced in at the end,
    // once every offset they reference exists.
    RelHeader { version, ..Default::default() }.write(&mut buf);
    debug_assert_eq!(buf.len(), RelHeader::size(version));

    let num_sections = section_count(obj_file);
    let section_info_offset = buf.len();
    for _ in 0..num_sections {
        buf.push_u32(0);
        buf.push_u32(0);
    }

    // Section data. Rows are staged separately and spliced over the
    // placeholder table afterwards; rows for dropped sections stay (0, 0) so
    // REL section indices keep matching ELF section indices.
    let sections_by_index =
        obj_file.sections().map(|s| (s.index().0 as u32, s)).collect::<BTreeMap<_, _>>();
    let mut section_info = BeBuffer::new();
    let mut written_sections = BTreeMap::<u32, u32>::new();
    let mut bss_size = 0u32;
    let mut max_align = 2u32;
    let mut max_bss_align = 2u32;
    for index in 0..num_sections {
        let Some(section) = sections_by_index.get(&index) else {
            section_info.push_u32(0);
            section_info.push_u32(0);
            continue;
        };
        if !keep_section(section.name()?) {
            section_info.push_u32(0);
            section_info.push_u32(0);
            continue;
        }
        let size = section.size() as u32;
        if section.kind() == SectionKind::UninitializedData {
            max_bss_align = max_bss_align.max(section.align() as u32);
            bss_size += size;
            section_info.push_u32(0);
            section_info.push_u32(size);
        } else {
            // Minimum alignment 2: bit 0 of the recorded offset flags
            // executable sections.
            let align = (section.align() as u32).max(2);
            max_align = max_align.max(align);
            buf.align(align);
            let offset = buf.len();
            let exec = matches!(section.flags(),
                SectionFlags::Elf { sh_flags } if sh_flags & SHF_EXECINSTR as u64 != 0);
            section_info.push_u32(if exec { offset | 1 } else { offset });
            section_info.push_u32(size);
            buf.append(section.data()?);
            written_sections.insert(index, offset);
        }
    }
    buf.overwrite(section_info_offset, section_info.as_slice());

    let mut relocations =
        collect_relocations(obj_file, &written_sections, symbol_map, module_id)?;
    relocations.sort_by_key(|r| {
        (module_delay(module_id, r.module_id), r.module_id, r.section, r.offset)
    });

    // One import row per module in the sorted list. Rows are reserved even
    // for a module whose relocations all resolve early; such a row is never
    // opened and stays zeroed, and imp_size only counts opened rows.
    let mut import_count = 0u32;
    let mut last_module = None;
    for rel in &relocations {
        if last_module != Some(rel.module_id) {
            last_module = Some(rel.module_id);
            import_count += 1;
        }
    }

    buf.align(8);
    let imp_offset = buf.len();
    for _ in 0..import_count {
        buf.push_u32(0);
        buf.push_u32(0);
    }
    let rel_offset = buf.len();

    let mut import_info = BeBuffer::new();
    let mut current_module: Option<u32> = None;
    let mut current_section: Option<u32> = None;
    let mut current_offset = 0u32;
    let mut fixed_size = 0u32;
    for rel in &relocations {
        // PC-relative references within the module are final no matter where
        // the module loads; patch them now and keep them out of the stream.
        if rel.module_id == module_id && matches!(rel.r_type, R_PPC_REL24 | R_PPC_REL32) {
            resolve_early(&mut buf, &written_sections, rel)?;
            continue;
        }

        if current_module != Some(rel.module_id) {
            if current_module.is_some() {
                write_reloc(&mut buf, 0, R_DOLPHIN_END, 0, 0);
            }
            // The first DOL/self module marks the end of the relocations
            // OSLinkFixed has to keep resident.
            let last_delay = current_module.map_or(0, |id| module_delay(module_id, id));
            if module_delay(module_id, rel.module_id) > last_delay {
                fixed_size = buf.len() - rel_offset;
            }
            current_module = Some(rel.module_id);
            current_section = None;
            import_info.push_u32(rel.module_id);
            import_info.push_u32(buf.len());
        }

        if current_section != Some(rel.section) {
            current_section = Some(rel.section);
            current_offset = 0;
            write_reloc(&mut buf, 0, R_DOLPHIN_SECTION, rel.section as u8, 0);
        }

        let mut delta = rel.offset - current_offset;
        while delta > 0xFFFF {
            write_reloc(&mut buf, 0xFFFF, R_DOLPHIN_NOP, 0, 0);
            delta -= 0xFFFF;
        }

        check_reloc_type(rel.r_type);
        write_reloc(&mut buf, delta as u16, rel.r_type, rel.target_section, rel.addend);
        current_offset = rel.offset;
    }
    write_reloc(&mut buf, 0, R_DOLPHIN_END, 0, 0);
    // A trailing foreign module means the delay boundary was never crossed
    // and the whole stream must stay resident.
    if current_module.map_or(0, |id| module_delay(module_id, id)) == 0 {
        fixed_size = buf.len() - rel_offset;
    }

    let imp_size = import_info.len();
    if !import_info.is_empty() {
        buf.overwrite(imp_offset, import_info.as_slice());
    }

    let mut header_buf = BeBuffer::new();
    RelHeader {
        module_id,
        num_sections,
        section_info_offset,
        version,
        bss_size,
        rel_offset,
        imp_offset,
        imp_size,
        prolog_section,
        epilog_section,
        unresolved_section,
        prolog_offset,
        epilog_offset,
        unresolved_offset,
        align: Some(max_align),
        bss_align: Some(max_bss_align),
        fix_size: Some(rel_offset + fixed_size),
    }
    .write(&mut header_buf);
    buf.overwrite(0, header_buf.as_slice());

    Ok(buf.into_vec())
}

/// Walks every relocation of every copied section and resolves it against
/// the module itself or the external symbol map. Unresolved entries are
/// reported and dropped.
fn collect_relocations(
    obj_file: &object::File,
    written_sections: &BTreeMap<u32, u32>,
    symbol_map: &SymbolMap,
    module_id: u32,
) -> Result<Vec<RelReloc>> {
    let mut relocations = Vec::new();
    for section in obj_file.sections() {
        let section_index = section.index().0 as u32;
        if !written_sections.contains_key(&section_index) {
            continue;
        }
        for (offset, reloc) in section.relocations() {
            let r_type = match reloc.flags() {
                RelocationFlags::Elf { r_type } => r_type,
                flags => bail!("Unexpected relocation flags: {flags:?}"),
            };
            if r_type == R_PPC_NONE {
                continue;
            }
            let symbol = match reloc.target() {
                RelocationTarget::Symbol(idx) => obj_file.symbol_by_index(idx).with_context(
                    || format!("Failed to locate symbol {} in symbol table", idx.0),
                )?,
                target => bail!("Unexpected relocation target: {target:?}"),
            };
            let mut rel = RelReloc {
                module_id,
                section: section_index,
                offset: offset as u32,
                r_type,
                target_section: 0,
                addend: 0,
            };
            if let Some(symbol_section) = symbol.section_index() {
                // Defined within this module
                rel.target_section = symbol_section.0 as u8;
                rel.addend = (reloc.addend() + symbol.address() as i64) as u32;
                if !written_sections.contains_key(&(symbol_section.0 as u32)) {
                    let target = obj_file.section_by_index(symbol_section)?;
                    if target.kind() != SectionKind::UninitializedData {
                        log::warn!(
                            "Relocation from section '{}' offset {:#X} against symbol '{}' in unwritten section '{}'",
                            section.name().unwrap_or("[error]"),
                            offset,
                            symbol.name().unwrap_or("[error]"),
                            target.name().unwrap_or("[error]"),
                        );
                    }
                }
            } else {
                let name = symbol.name()?;
                match symbol_map.get(name) {
                    Some(location) => {
                        rel.module_id = location.module_id;
                        rel.target_section = location.target_section as u8;
                        rel.addend = (reloc.addend() + location.addr as i64) as u32;
                    }
                    None => {
                        log::warn!("Unresolved external symbol '{}'", name);
                        continue;
                    }
                }
            }
            relocations.push(rel);
        }
    }
    Ok(relocations)
}

/// Patches a PC-relative self-relocation directly into the written section
/// bytes so it never reaches the runtime stream.
fn resolve_early(
    buf: &mut BeBuffer,
    written_sections: &BTreeMap<u32, u32>,
    rel: &RelReloc,
) -> Result<()> {
    let source = written_sections
        .get(&rel.section)
        .copied()
        .ok_or_else(|| anyhow!("Early resolution in unwritten section {}", rel.section))?
        + rel.offset;
    let target = written_sections
        .get(&(rel.target_section as u32))
        .copied()
        .with_context(|| {
            format!("Early resolution against unwritten section {}", rel.target_section)
        })?
        .wrapping_add(rel.addend);
    let delta = target.wrapping_sub(source);
    let mut ins = buf.read_u32(source);
    match rel.r_type {
        // The displacement field is expected to be zero in the input
        R_PPC_REL24 => ins |= delta & 0x03FF_FFFC,
        R_PPC_REL32 => ins = delta,
        _ => unreachable!(),
    }
    buf.overwrite_u32(source, ins);
    Ok(())
}

fn write_reloc(buf: &mut BeBuffer, offset: u16, r_type: u32, section: u8, addend: u32) {
    buf.push_u16(offset);
    buf.push_u8(r_type as u8);
    buf.push_u8(section);
    buf.push_u32(addend);
}

/// Anything outside this set ends up in the stream anyway, but OSLink will
/// not know what to do with it.
fn check_reloc_type(r_type: u32) {
    match r_type {
        R_PPC_NONE | R_PPC_ADDR32 | R_PPC_ADDR24 | R_PPC_ADDR16 | R_PPC_ADDR16_LO
        | R_PPC_ADDR16_HI | R_PPC_ADDR16_HA | R_PPC_ADDR14 | R_PPC_ADDR14_BRTAKEN
        | R_PPC_ADDR14_BRNTAKEN | R_PPC_REL24 | R_DOLPHIN_NOP | R_DOLPHIN_SECTION
        | R_DOLPHIN_END => {}
        _ => log::warn!("Unsupported relocation type {r_type}"),
    }
}

#[derive(Debug, Copy, Clone)]
pub struct RelSectionInfo {
    /// Offset of the section data, with the executable flag already masked
    /// off. 0 for BSS and dropped sections.
    pub offset: u32,
    pub size: u32,
    pub exec: bool,
}

#[derive(Debug, Copy, Clone)]
pub struct RelImport {
    pub module_id: u32,
    pub offset: u32,
}

#[derive(Debug)]
pub struct RelModule {
    pub header: RelHeader,
    pub sections: Vec<RelSectionInfo>,
    pub imports: Vec<RelImport>,
    pub relocations: Vec<RelReloc>,
}

/// Parses a REL image back into its header, section table, import directory
/// and decoded relocation list.
pub fn process_rel<R>(reader: &mut R) -> Result<RelModule>
where R: Read + Seek + ?Sized {
    let header = RelHeader::parse(reader)?;

    reader.seek(SeekFrom::Start(header.section_info_offset as u64))?;
    let mut sections = Vec::with_capacity(header.num_sections as usize);
    let mut total_bss_size = 0u32;
    for _ in 0..header.num_sections {
        let offset = reader.read_u32::<BigEndian>()?;
        let size = reader.read_u32::<BigEndian>()?;
        let exec = offset & 1 == 1;
        let offset = offset & !3;
        if offset == 0 && size > 0 {
            total_bss_size += size;
        }
        sections.push(RelSectionInfo { offset, size, exec });
    }
    ensure!(
        total_bss_size == header.bss_size,
        "Mismatched BSS size: {:#X} != {:#X}",
        total_bss_size,
        header.bss_size
    );

    let mut imports = Vec::new();
    let imp_end = (header.imp_offset + header.imp_size) as u64;
    reader.seek(SeekFrom::Start(header.imp_offset as u64))?;
    while reader.stream_position()? < imp_end {
        let module_id = reader.read_u32::<BigEndian>()?;
        let offset = reader.read_u32::<BigEndian>()?;
        if imports.is_empty() {
            ensure!(
                offset == header.rel_offset,
                "First import offset mismatch: {:#X} != {:#X}",
                offset,
                header.rel_offset
            );
        }
        imports.push(RelImport { module_id, offset });
    }

    let mut relocations = Vec::new();
    for import in &imports {
        reader.seek(SeekFrom::Start(import.offset as u64))?;
        let mut address = 0u32;
        let mut section = u8::MAX;
        loop {
            let offset = reader.read_u16::<BigEndian>()?;
            let r_type = reader.read_u8()? as u32;
            let target_section = reader.read_u8()?;
            let addend = reader.read_u32::<BigEndian>()?;
            match r_type {
                R_PPC_NONE => continue,
                R_DOLPHIN_NOP => {
                    address += offset as u32;
                    continue;
                }
                R_DOLPHIN_SECTION => {
                    address = 0;
                    section = target_section;
                    continue;
                }
                R_DOLPHIN_END => break,
                _ => {}
            }
            address += offset as u32;
            relocations.push(RelReloc {
                module_id: import.module_id,
                section: section as u32,
                offset: address,
                r_type,
                target_section,
                addend,
            });
        }
    }

    Ok(RelModule { header, sections, imports, relocations })
}
