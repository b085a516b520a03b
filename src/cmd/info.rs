use std::path::PathBuf;

use anyhow::Result;
use argp::FromArgs;

use crate::util::{
    file::{map_file, map_reader},
    rel::process_rel,
};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Views REL file information.
#[argp(subcommand, name = "info")]
pub struct Args {
    #[argp(positional)]
    /// REL file
    rel_file: PathBuf,
}

pub fn run(args: Args) -> Result<()> {
    let map = map_file(&args.rel_file)?;
    let rel = process_rel(&mut map_reader(&map))?;

    println!("REL module ID {} (version {})", rel.header.module_id, rel.header.version);
    println!("BSS size: {:#X}", rel.header.bss_size);
    if let (Some(align), Some(bss_align)) = (rel.header.align, rel.header.bss_align) {
        println!("Alignment: {align}, BSS alignment: {bss_align}");
    }
    if let Some(fix_size) = rel.header.fix_size {
        println!("Fixed data size: {:#X}", fix_size);
    }

    println!("\nSections:");
    for (idx, section) in rel.sections.iter().enumerate() {
        if section.size == 0 {
            continue;
        }
        let kind = if section.offset == 0 {
            "bss"
        } else if section.exec {
            "text"
        } else {
            "data"
        };
        println!("  {idx:>3}: {kind:<4} offset {:#010X} size {:#X}", section.offset, section.size);
    }

    println!("\nImports:");
    for import in &rel.imports {
        let count = rel.relocations.iter().filter(|r| r.module_id == import.module_id).count();
        println!(
            "  module {:>5}: {count} relocation(s) at {:#X}",
            import.module_id, import.offset
        );
    }
    Ok(())
}
