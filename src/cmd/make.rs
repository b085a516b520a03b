use std::{io::Write, path::PathBuf};

use anyhow::{anyhow, ensure, Result};
use argp::FromArgs;

use crate::util::{
    elf::load_elf,
    file::{buf_writer, map_file},
    rel::make_rel,
    symbols::{load_symbol_file, SymbolMap},
};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Converts a relocatable PowerPC ELF object into a REL module.
#[argp(subcommand, name = "make")]
pub struct Args {
    #[argp(positional)]
    /// input ELF
    input: Option<PathBuf>,
    #[argp(option, short = 'i')]
    /// input ELF (alternative to the positional form)
    input_file: Option<PathBuf>,
    #[argp(option, short = 's')]
    /// symbol map file; repeat for multiple, later files override earlier ones
    symbol_file: Vec<PathBuf>,
    #[argp(option, short = 'o')]
    /// output REL (default: input with a .rel extension)
    output_file: Option<PathBuf>,
    #[argp(option, default = "0x1000")]
    /// module ID written to the REL header
    rel_id: u32,
    #[argp(option, default = "3")]
    /// REL format version (1, 2 or 3)
    rel_version: u32,
}

pub fn run(args: Args) -> Result<()> {
    let input =
        args.input_file.or(args.input).ok_or_else(|| anyhow!("Input ELF file required"))?;
    ensure!(!args.symbol_file.is_empty(), "At least one symbol file required");
    ensure!(
        matches!(args.rel_version, 1..=3),
        "Unsupported REL version {}",
        args.rel_version
    );
    let out_path = args.output_file.unwrap_or_else(|| input.with_extension("rel"));

    let mut symbol_map = SymbolMap::new();
    for path in &args.symbol_file {
        load_symbol_file(path, &mut symbol_map)?;
    }

    let map = map_file(&input)?;
    let obj_file = load_elf(&map)?;
    let data = make_rel(&obj_file, &symbol_map, args.rel_id, args.rel_version)?;

    let mut out = buf_writer(&out_path)?;
    out.write_all(&data)?;
    out.flush()?;
    log::info!("Wrote {} ({} bytes)", out_path.display(), data.len());
    Ok(())
}
