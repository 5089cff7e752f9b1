//! A parallel static linker for ELF x86-64. The link runs as a sequence of phases with a global
//! barrier between them; within a phase, work is spread across input files (and sections) with
//! rayon. Determinism doesn't depend on scheduling: every contended decision is keyed on file
//! priority and section index rather than on thread arrival order.

pub(crate) use anyhow::bail;

pub(crate) mod archive;
pub mod args;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod hash;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod mapfile;
pub(crate) mod parsing;
pub(crate) mod resolution;
pub(crate) mod string_merging;
pub(crate) mod symbol;
pub(crate) mod symbol_db;
pub(crate) mod x86_64;

pub use args::Args;

use error::Result;
use std::time::Instant;

pub struct Linker {
    args: Args,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Self> {
        Ok(Linker {
            args: Args::parse(input)?,
        })
    }

    pub fn run(&self) -> Result {
        use tracing_subscriber::layer::SubscriberExt as _;
        use tracing_subscriber::util::SubscriberInitExt as _;

        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        link(&self.args)
    }
}

/// Runs a whole link. Public so that tests can drive the linker in-process.
pub fn link(args: &Args) -> Result {
    let start = Instant::now();
    args.setup_thread_pool()?;

    // Serial prelude: open and map the inputs.
    let input_data = input_data::InputData::from_args(args)?;
    let herd = bumpalo_herd::Herd::new();
    let db = symbol_db::SymbolDb::new(args, &herd);
    let merged = string_merging::MergedSections::new(&herd);

    // Phase 1-2: parse files and intern global names.
    let mut files = parsing::parse_input_files(&input_data, &db)?;
    let mut prelude = layout::define_prelude(&db);

    // Phase 3-7: resolve, walk archive liveness to a fixed point, then slice the mergeable
    // sections of the files that ended up live and clean up: weak references to nothing,
    // duplicate COMDAT copies, tentative definitions.
    let outputs = resolution::Outputs::new();
    resolution::resolve_symbols(&files, &outputs)?;
    resolution::mark_live_archive_members(&files, &outputs)?;
    string_merging::split_merge_sections(&mut files, &merged, &herd)?;
    resolution::assign_undefined_weak(&files);
    resolution::eliminate_duplicate_comdat_groups(&mut files);
    resolution::report_duplicate_symbols(&files, &outputs)?;
    resolution::convert_common_symbols(&mut files);

    // Phase 8-9: pack merged strings, decide which synthetic table slots are needed.
    merged.assign_offsets();
    layout::scan_relocations(args, &files, &prelude)?;
    resolution::check_undefined_symbols(&files)?;

    // Phase 10-11: lay everything out, then write it.
    let layout = layout::compute(args, &mut files, &db, &merged, &mut prelude)?;
    elf_writer::write(args, &layout, &files, &prelude)?;

    if args.print_map {
        mapfile::print_map(&layout, &files);
    }

    if args.time_phases {
        eprintln!("fleet: link took {:?}", start.elapsed());
    }
    Ok(())
}
