use anyhow::{bail, ensure, Result};
use object::{Architecture, Endianness, Object, ObjectSection, ObjectSymbol};

/// Parses and validates an input object file. REL conversion only makes
/// sense for relocatable big-endian PowerPC objects.
pub fn load_elf(data: &[u8]) -> Result<object::File<'_>> {
    let obj_file = object::read::File::parse(data)?;
    match obj_file.architecture() {
        Architecture::PowerPc => {}
        arch => bail!("Unexpected architecture: {arch:?}"),
    }
    ensure!(obj_file.endianness() == Endianness::Big, "Expected big endian");
    match obj_file.kind() {
        object::ObjectKind::Relocatable => {}
        kind => bail!("Unexpected ELF type: {kind:?}"),
    }
    Ok(obj_file)
}

/// Locates an entry symbol (`_prolog`, `_epilog`, `_unresolved`) by name,
/// returning its section index and offset. Both are 0 when the symbol is
/// absent; the header fields stay zeroed in that case.
pub fn entry_symbol(obj_file: &object::File, name: &str) -> (u8, u32) {
    for symbol in obj_file.symbols() {
        if symbol.name() == Ok(name) {
            let section = symbol.section_index().map_or(0, |idx| idx.0 as u8);
            return (section, symbol.address() as u32);
        }
    }
    (0, 0)
}

/// Number of rows the REL section-info table needs. REL section indices
/// mirror ELF section indices (relocation entries reference them), so the
/// table spans up to the highest index even though most rows stay zeroed.
pub fn section_count(obj_file: &object::File) -> u32 {
    obj_file.sections().map(|s| s.index().0 as u32 + 1).max().unwrap_or(1)
}
