use std::{collections::BTreeMap, io::BufRead, path::Path};

use anyhow::Result;

use crate::util::file::buf_reader;

/// Where an external symbol lives at runtime.
///
/// `module_id` 0 refers to the DOL; OSLink ignores `target_section` for DOL
/// references but the value is carried through regardless.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SymbolLocation {
    pub module_id: u32,
    pub target_section: u32,
    pub addr: u32,
}

pub type SymbolMap = BTreeMap<String, SymbolLocation>;

/// Reads a symbol map file into `map`. Entries already present are
/// overwritten, so later files override earlier ones.
pub fn load_symbol_file(path: &Path, map: &mut SymbolMap) -> Result<()> {
    parse_symbol_map(buf_reader(path)?, map)
}

/// Parses symbol map text:
///
/// - DOL symbols: `address : name` (address in prefixless hex)
/// - REL symbols: `module , section , offset : name` (module and section in
///   C literal notation: `0x` hex, leading `0` octal, otherwise decimal;
///   offset in prefixless hex)
///
/// Blank lines and comment lines are skipped. A line whose first non-space
/// character is `/` counts as a comment. Lines that fail to parse are
/// reported and skipped.
pub fn parse_symbol_map<R: BufRead>(reader: R, map: &mut SymbolMap) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('/') {
            continue;
        }
        match parse_symbol(line) {
            Some((name, location)) => {
                map.insert(name, location);
            }
            None => log::warn!("Invalid symbol: {}", line),
        }
    }
    Ok(())
}

fn parse_symbol(line: &str) -> Option<(String, SymbolLocation)> {
    let mut parts = line.split(':');
    let location = parts.next()?;
    let name = parts.next()?.trim();
    if parts.next().is_some() || name.is_empty() {
        return None;
    }
    let fields = location.split(',').map(str::trim).collect::<Vec<_>>();
    let location = match *fields.as_slice() {
        [addr] => SymbolLocation {
            module_id: 0,
            target_section: 0,
            addr: parse_u32_hex(addr)?,
        },
        [module_id, target_section, addr] => SymbolLocation {
            module_id: parse_u32_c(module_id)?,
            target_section: parse_u32_c(target_section)?,
            addr: parse_u32_hex(addr)?,
        },
        _ => return None,
    };
    Some((name.to_string(), location))
}

fn parse_u32_hex(s: &str) -> Option<u32> { u32::from_str_radix(s, 16).ok() }

/// C integer literal base inference: `0x`/`0X` hex, leading `0` octal,
/// otherwise decimal.
fn parse_u32_c(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> SymbolMap {
        let mut map = SymbolMap::new();
        parse_symbol_map(text.as_bytes(), &mut map).unwrap();
        map
    }

    #[test]
    fn test_dol_symbol() {
        let map = parse("80001234:OSReport\n  803d9a40 : __ArenaLo\n");
        assert_eq!(map["OSReport"], SymbolLocation {
            module_id: 0,
            target_section: 0,
            addr: 0x80001234,
        });
        assert_eq!(map["__ArenaLo"].addr, 0x803D9A40);
    }

    #[test]
    fn test_rel_symbol_bases() {
        let map = parse("2,1,100:decimal\n0x10,0x2,abc:hex\n010,02,20:octal\n");
        assert_eq!(map["decimal"], SymbolLocation {
            module_id: 2,
            target_section: 1,
            addr: 0x100,
        });
        assert_eq!(map["hex"], SymbolLocation {
            module_id: 16,
            target_section: 2,
            addr: 0xABC,
        });
        assert_eq!(map["octal"], SymbolLocation {
            module_id: 8,
            target_section: 2,
            addr: 0x20,
        });
    }

    #[test]
    fn test_comments_and_blanks() {
        let map = parse("// a comment\n/ also a comment\n\n   \n80000000:ok\n");
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("ok"));
    }

    #[test]
    fn test_invalid_lines_skipped() {
        let map = parse("nonsense\n1,2:too_few\n1,2,3,4:too_many\nxyz:bad_hex\n80000000:ok\na:b:c\n");
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("ok"));
    }

    #[test]
    fn test_last_wins() {
        let mut map = SymbolMap::new();
        parse_symbol_map("80000000:sym\n".as_bytes(), &mut map).unwrap();
        parse_symbol_map("80000004:sym\n".as_bytes(), &mut map).unwrap();
        assert_eq!(map["sym"].addr, 0x80000004);
    }
}
