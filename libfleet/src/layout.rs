//! Decides where everything goes in the output file. Input sections are grouped into output
//! sections, synthetic chunks are instantiated, the whole list is put into a canonical order and
//! then file offsets, virtual addresses and program headers are computed. This is also where the
//! per-file GOT/PLT ranges, the symbol table layout and the addresses of synthetic symbols such
//! as `__bss_start` are assigned, so that write-out can proceed without any further decisions.

use crate::args::Args;
use crate::elf;
use crate::elf::LE;
use crate::elf::SymbolStrength;
use crate::elf::align_to;
use crate::error::Context as _;
use crate::error::Result;
use crate::parsing::FileId;
use crate::parsing::InputSection;
use crate::parsing::LocalSymbol;
use crate::parsing::ObjectFile;
use crate::parsing::PRELUDE_PRIORITY;
use crate::parsing::SectionSlot;
use crate::string_merging::MergedSections;
use crate::symbol::NEEDS_GOT;
use crate::symbol::NEEDS_GOTTP;
use crate::symbol::NEEDS_PLT;
use crate::symbol::Owner;
use crate::symbol::Symbol;
use crate::symbol::SymbolName;
use crate::symbol_db::SymbolDb;
use crate::x86_64;
use hashbrown::HashMap;
use object::read::elf::Rela as _;
use rayon::prelude::*;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

pub(crate) struct OutputChunk<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) kind: ChunkKind<'data>,
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,
    pub(crate) alignment: u64,
    pub(crate) offset: u64,
    pub(crate) address: u64,
    pub(crate) size: u64,
    /// Index in the output section header table. 0 means the chunk has no header (the ELF and
    /// program/section header tables themselves).
    pub(crate) shndx: u32,
    pub(crate) starts_load: bool,
    pub(crate) name_offset: u32,
}

pub(crate) enum ChunkKind<'data> {
    Ehdr,
    ProgramHeaders,
    SectionHeaders,
    Interp,
    Section {
        members: Vec<(FileId, object::SectionIndex)>,
    },
    Merged(&'data crate::string_merging::MergedSection<'data>),
    Got,
    GotPlt,
    Plt,
    RelaPlt,
    Symtab,
    Strtab,
    Shstrtab,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment {
    pub(crate) p_type: u32,
    pub(crate) p_flags: u32,
    pub(crate) offset: u64,
    pub(crate) vaddr: u64,
    pub(crate) filesz: u64,
    pub(crate) memsz: u64,
    pub(crate) align: u64,
}

pub(crate) enum GotEntry<'data> {
    /// The slot holds the symbol's address.
    Address(u32, &'data Symbol<'data>),
    /// The slot holds the symbol's offset from the thread pointer.
    TpOff(u32, &'data Symbol<'data>),
}

pub(crate) struct Layout<'data> {
    pub(crate) chunks: Vec<OutputChunk<'data>>,
    pub(crate) segments: Vec<Segment>,
    pub(crate) file_size: u64,
    pub(crate) entry: u64,
    pub(crate) tls_end: u64,
    pub(crate) num_symtab_entries: u32,
    pub(crate) first_global_row: u32,
    pub(crate) strtab_size: u32,
    pub(crate) shstrtab: Vec<u8>,
    pub(crate) plt_symbols: Vec<&'data Symbol<'data>>,
    pub(crate) got_entries: Vec<GotEntry<'data>>,
    pub(crate) phdr_index: usize,
    pub(crate) shdr_index: usize,
    pub(crate) symtab_index: usize,
    pub(crate) strtab_index: usize,
    pub(crate) got_index: Option<usize>,
    pub(crate) gotplt_index: Option<usize>,
    pub(crate) plt_index: Option<usize>,
    pub(crate) relplt_index: Option<usize>,
}

impl<'data> Layout<'data> {
    pub(crate) fn chunk_addr(&self, index: Option<usize>) -> u64 {
        index.map_or(0, |i| self.chunks[i].address)
    }

    /// File size occupied by a chunk (zero for NOBITS).
    pub(crate) fn chunk_file_size(chunk: &OutputChunk) -> u64 {
        if chunk.sh_type == object::elf::SHT_NOBITS {
            0
        } else {
            chunk.size
        }
    }
}

/// The synthetic internal file. It owns the layout-defined symbols and, like real files, carries
/// slot counters and symbol table offsets.
pub(crate) struct Prelude<'data> {
    pub(crate) symbols: Vec<PreludeDef<'data>>,
    pub(crate) num_got: AtomicU32,
    pub(crate) num_plt: AtomicU32,
    pub(crate) num_gotplt: AtomicU32,
    pub(crate) num_relplt: AtomicU32,
    pub(crate) got_base: u32,
    pub(crate) plt_base: u32,
    pub(crate) gotplt_base: u32,
    pub(crate) relplt_base: u32,
    pub(crate) symtab_base: u32,
    pub(crate) strtab_base: u32,
    pub(crate) symtab_count: u32,
    pub(crate) strtab_size: u32,
}

pub(crate) struct PreludeDef<'data> {
    pub(crate) symbol: &'data Symbol<'data>,
    pub(crate) placement: SymbolPlacement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolPlacement {
    EhdrStart,
    BssStart,
    End,
    Etext,
    Edata,
    SectionStart(&'static [u8]),
    SectionEnd(&'static [u8]),
    RelaIpltStart,
    RelaIpltEnd,
}

const PRELUDE_SYMBOLS: &[(&[u8], SymbolPlacement)] = &[
    (b"__ehdr_start", SymbolPlacement::EhdrStart),
    (b"__bss_start", SymbolPlacement::BssStart),
    (b"_end", SymbolPlacement::End),
    (b"end", SymbolPlacement::End),
    (b"_etext", SymbolPlacement::Etext),
    (b"etext", SymbolPlacement::Etext),
    (b"_edata", SymbolPlacement::Edata),
    (b"edata", SymbolPlacement::Edata),
    (b"__preinit_array_start", SymbolPlacement::SectionStart(b".preinit_array")),
    (b"__preinit_array_end", SymbolPlacement::SectionEnd(b".preinit_array")),
    (b"__init_array_start", SymbolPlacement::SectionStart(b".init_array")),
    (b"__init_array_end", SymbolPlacement::SectionEnd(b".init_array")),
    (b"__fini_array_start", SymbolPlacement::SectionStart(b".fini_array")),
    (b"__fini_array_end", SymbolPlacement::SectionEnd(b".fini_array")),
    (b"__rela_iplt_start", SymbolPlacement::RelaIpltStart),
    (b"__rela_iplt_end", SymbolPlacement::RelaIpltEnd),
];

/// Interns the layout symbols and installs the prelude as their owner. Real definitions from
/// input files displace these placeholders during resolution.
pub(crate) fn define_prelude<'data>(db: &SymbolDb<'data>) -> Prelude<'data> {
    let symbols = PRELUDE_SYMBOLS
        .iter()
        .map(|&(name, placement)| {
            let symbol = db.intern(SymbolName::prehashed(name));
            let mut res = symbol.lock();
            if res.owner == Owner::None {
                res.owner = Owner::Prelude;
                // Placeholder strength: any real definition from an input displaces us, while
                // priority 0 wins the tie against archive-member placeholders.
                res.strength = SymbolStrength::Placeholder;
                res.priority = PRELUDE_PRIORITY;
            }
            PreludeDef { symbol, placement }
        })
        .collect();

    Prelude {
        symbols,
        num_got: AtomicU32::new(0),
        num_plt: AtomicU32::new(0),
        num_gotplt: AtomicU32::new(0),
        num_relplt: AtomicU32::new(0),
        got_base: 0,
        plt_base: 0,
        gotplt_base: 0,
        relplt_base: 0,
        symtab_base: 0,
        strtab_base: 0,
        symtab_count: 0,
        strtab_size: 0,
    }
}

impl<'data> Prelude<'data> {
    /// The prelude symbols that weren't displaced by a real definition.
    pub(crate) fn owned_symbols(&self) -> impl Iterator<Item = &PreludeDef<'data>> {
        self.symbols
            .iter()
            .filter(|def| def.symbol.lock().owner == Owner::Prelude)
    }
}

/// Maps an input section name to its output section name: well-known prefixes such as
/// `.text.foo` or `.rodata.str1.1` collapse onto their base section.
pub(crate) fn output_section_name(name: &[u8]) -> &[u8] {
    const PREFIXES: &[&[u8]] = &[
        b".text.",
        b".data.rel.ro.",
        b".data.",
        b".rodata.",
        b".bss.rel.ro.",
        b".bss.",
        b".init_array.",
        b".fini_array.",
        b".preinit_array.",
        b".tbss.",
        b".tdata.",
        b".gcc_except_table.",
    ];
    for prefix in PREFIXES {
        if name.starts_with(prefix) {
            return &prefix[..prefix.len() - 1];
        }
    }
    name
}

/// Walks the relocations of every live section, accumulating the NEEDS bits on target symbols
/// and the slot counts on the owning files. The caller whose atomic OR first sets a bit does the
/// accounting, so every slot is counted exactly once.
pub(crate) fn scan_relocations<'data>(
    args: &Args,
    files: &[ObjectFile<'data>],
    prelude: &Prelude<'data>,
) -> Result {
    let _span = tracing::info_span!("Scan relocations").entered();

    files.par_iter().try_for_each(|file| {
        if !file.is_alive() {
            return Ok(());
        }
        scan_file(args, file, files, prelude).with_context(|| file.display_name())
    })
}

fn scan_file<'data>(
    args: &Args,
    file: &ObjectFile<'data>,
    files: &[ObjectFile<'data>],
    prelude: &Prelude<'data>,
) -> Result {
    for slot in &file.sections {
        let SectionSlot::Loaded(sec) = slot else {
            continue;
        };
        for rela in sec.relas {
            let r_type = rela.r_type(LE, false);
            let mut needs = x86_64::relocation_needs(r_type).with_context(|| {
                format!("in section `{}`", String::from_utf8_lossy(sec.name))
            })?;
            // A fully static link has no dynamic slots: every definition is known, so
            // PLT-forming branches bind directly to their targets.
            if args.is_static {
                needs &= !NEEDS_PLT;
            }
            if needs == 0 {
                continue;
            }

            let sym_index = rela.r_sym(LE, false) as usize;
            if sym_index < file.first_global {
                // Local symbols aren't interned, so they have nowhere to carry needs bits. A
                // PLT-forming branch to a local resolves directly; GOT-forming references to
                // locals don't occur in the code this linker accepts.
                if needs & (NEEDS_GOT | NEEDS_GOTTP) != 0 {
                    crate::bail!(
                        "GOT-forming relocation against local symbol in section `{}`",
                        String::from_utf8_lossy(sec.name)
                    );
                }
                continue;
            }

            let Some(&sym) = file.globals.get(sym_index - file.first_global) else {
                crate::bail!("relocation references out-of-range symbol {sym_index}");
            };
            if sym.is_undef_weak() {
                continue;
            }
            let newly_set = sym.acquire_needs(needs);
            if newly_set == 0 {
                continue;
            }

            let owner = sym.lock().owner;
            let (num_got, num_plt, num_gotplt, num_relplt) = match owner {
                Owner::File(id) => {
                    let owner_file = &files[id.as_usize()];
                    (
                        &owner_file.num_got,
                        &owner_file.num_plt,
                        &owner_file.num_gotplt,
                        &owner_file.num_relplt,
                    )
                }
                Owner::Prelude => (
                    &prelude.num_got,
                    &prelude.num_plt,
                    &prelude.num_gotplt,
                    &prelude.num_relplt,
                ),
                // Strong references to unowned symbols are reported later; weak ones were
                // already cleared.
                Owner::None => continue,
            };

            if newly_set & NEEDS_PLT != 0 {
                num_plt.fetch_add(1, Ordering::AcqRel);
                num_gotplt.fetch_add(1, Ordering::AcqRel);
                num_relplt.fetch_add(1, Ordering::AcqRel);
            }
            if newly_set & NEEDS_GOT != 0 {
                num_got.fetch_add(1, Ordering::AcqRel);
            }
            if newly_set & NEEDS_GOTTP != 0 {
                num_got.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    Ok(())
}

/// Zero-size sections (such as .note.GNU-stack) contribute nothing to the output; discarding
/// them up front means no symbol or section header ever points at a pruned output section.
fn discard_empty_sections(files: &mut [ObjectFile<'_>]) {
    files.par_iter_mut().for_each(|file| {
        for slot in &mut file.sections {
            if let SectionSlot::Loaded(sec) = slot
                && sec.size == 0
            {
                *slot = SectionSlot::Discard;
            }
        }
    });
}

/// Which local symbols are carried into the output symbol table.
pub(crate) fn emittable_locals<'file, 'data>(
    file: &'file ObjectFile<'data>,
) -> impl Iterator<Item = &'file LocalSymbol<'data>> {
    file.locals.iter().skip(1).filter(|local| {
        if local.sym_type == object::elf::STT_SECTION || local.name.is_empty() {
            return false;
        }
        local
            .section
            .is_none_or(|section| file.section_is_live(section))
    })
}

/// The live, loaded sections of a file, with their indices. One section symbol is emitted for
/// each of these.
pub(crate) fn live_loaded_sections<'file, 'data>(
    file: &'file ObjectFile<'data>,
) -> impl Iterator<Item = (usize, &'file InputSection<'data>)> {
    file.sections.iter().enumerate().filter_map(|(i, slot)| {
        if let SectionSlot::Loaded(sec) = slot {
            Some((i, sec))
        } else {
            None
        }
    })
}

/// The globals a file contributes to the output symbol table: the defined symbols it owns, in
/// symbol table order.
pub(crate) fn owned_globals<'file, 'data>(
    file: &'file ObjectFile<'data>,
) -> impl Iterator<Item = &'data Symbol<'data>> + 'file {
    let file_id = file.file_id;
    file.globals.iter().copied().filter(move |sym| {
        let res = sym.lock();
        res.owner == Owner::File(file_id) && res.strength.is_defined()
    })
}

fn compute_symbol_tables<'data>(files: &mut [ObjectFile<'data>], prelude: &mut Prelude<'data>) {
    let _span = tracing::info_span!("Compute symbol table sizes").entered();

    files.par_iter_mut().for_each(|file| {
        if !file.is_alive() {
            return;
        }

        let mut count = 0u32;
        let mut strtab = 0u32;
        for local in emittable_locals(file) {
            count += 1;
            strtab += local.name.len() as u32 + 1;
        }
        count += live_loaded_sections(file).count() as u32;
        file.local_symtab_count = count;
        file.local_strtab_size = strtab;

        let mut count = 0u32;
        let mut strtab = 0u32;
        for sym in owned_globals(file) {
            count += 1;
            strtab += sym.name_bytes().len() as u32 + 1;
        }
        file.global_symtab_count = count;
        file.global_strtab_size = strtab;
    });

    let mut count = 0u32;
    let mut strtab = 0u32;
    for def in prelude.owned_symbols() {
        count += 1;
        strtab += def.symbol.name_bytes().len() as u32 + 1;
    }
    prelude.symtab_count = count;
    prelude.strtab_size = strtab;
}

/// Prefix-sums the per-file symbol table contributions into concrete row and byte offsets.
/// Locals precede globals; row 0 is the null entry and strtab byte 0 is the empty string.
fn assign_symbol_table_offsets<'data>(
    files: &mut [ObjectFile<'data>],
    prelude: &mut Prelude<'data>,
) -> (u32, u32, u32) {
    let mut row = 1u32;
    let mut str_offset = 1u32;

    for file in files.iter_mut() {
        file.local_symtab_base = row;
        file.local_strtab_base = str_offset;
        row += file.local_symtab_count;
        str_offset += file.local_strtab_size;
    }

    let first_global_row = row;

    prelude.symtab_base = row;
    prelude.strtab_base = str_offset;
    row += prelude.symtab_count;
    str_offset += prelude.strtab_size;

    for file in files.iter_mut() {
        file.global_symtab_base = row;
        file.global_strtab_base = str_offset;
        row += file.global_symtab_count;
        str_offset += file.global_strtab_size;
    }

    (row, first_global_row, str_offset)
}

/// Prefix-sums the per-file slot counters into base offsets, then assigns each owned symbol its
/// concrete slot offsets and its output symbol table row.
fn assign_slot_offsets<'data>(
    files: &mut [ObjectFile<'data>],
    prelude: &mut Prelude<'data>,
) -> (Vec<&'data Symbol<'data>>, Vec<GotEntry<'data>>) {
    let mut got = 0u32;
    let mut plt = 0u32;
    let mut gotplt = 0u32;
    let mut relplt = 0u32;

    let mut advance = |got_n: u32, plt_n: u32, gotplt_n: u32, relplt_n: u32| {
        let bases = (got, plt, gotplt, relplt);
        got += got_n * elf::GOT_ENTRY_SIZE as u32;
        plt += plt_n * elf::PLT_ENTRY_SIZE as u32;
        gotplt += gotplt_n * elf::GOT_ENTRY_SIZE as u32;
        relplt += relplt_n * elf::RELA_ENTRY_SIZE as u32;
        bases
    };

    (
        prelude.got_base,
        prelude.plt_base,
        prelude.gotplt_base,
        prelude.relplt_base,
    ) = advance(
        prelude.num_got.load(Ordering::Acquire),
        prelude.num_plt.load(Ordering::Acquire),
        prelude.num_gotplt.load(Ordering::Acquire),
        prelude.num_relplt.load(Ordering::Acquire),
    );

    for file in files.iter_mut() {
        (file.got_base, file.plt_base, file.gotplt_base, file.relplt_base) = advance(
            file.num_got.load(Ordering::Acquire),
            file.num_plt.load(Ordering::Acquire),
            file.num_gotplt.load(Ordering::Acquire),
            file.num_relplt.load(Ordering::Acquire),
        );
    }

    let mut plt_symbols = Vec::new();
    let mut got_entries = Vec::new();

    let mut assign = |sym: &'data Symbol<'data>,
                      cursors: &mut (u32, u32, u32, u32),
                      symtab_row: u32| {
        sym.symtab_index.store(symtab_row, Ordering::Release);
        let needs = sym.needs();
        if needs & NEEDS_PLT != 0 {
            sym.plt_offset.store(cursors.1, Ordering::Release);
            sym.gotplt_offset.store(cursors.2, Ordering::Release);
            sym.relplt_offset.store(cursors.3, Ordering::Release);
            cursors.1 += elf::PLT_ENTRY_SIZE as u32;
            cursors.2 += elf::GOT_ENTRY_SIZE as u32;
            cursors.3 += elf::RELA_ENTRY_SIZE as u32;
            plt_symbols.push(sym);
        }
        if needs & NEEDS_GOT != 0 {
            sym.got_offset.store(cursors.0, Ordering::Release);
            got_entries.push(GotEntry::Address(cursors.0, sym));
            cursors.0 += elf::GOT_ENTRY_SIZE as u32;
        }
        if needs & NEEDS_GOTTP != 0 {
            sym.gottp_offset.store(cursors.0, Ordering::Release);
            got_entries.push(GotEntry::TpOff(cursors.0, sym));
            cursors.0 += elf::GOT_ENTRY_SIZE as u32;
        }
    };

    let mut cursors = (
        prelude.got_base,
        prelude.plt_base,
        prelude.gotplt_base,
        prelude.relplt_base,
    );
    let mut row = prelude.symtab_base;
    for def in &prelude.symbols {
        if def.symbol.lock().owner != Owner::Prelude {
            continue;
        }
        assign(def.symbol, &mut cursors, row);
        row += 1;
    }

    for file in files.iter() {
        let mut cursors = (
            file.got_base,
            file.plt_base,
            file.gotplt_base,
            file.relplt_base,
        );
        let mut row = file.global_symtab_base;
        for sym in owned_globals(file) {
            assign(sym, &mut cursors, row);
            row += 1;
        }
    }

    (plt_symbols, got_entries)
}

/// Groups live input sections into output sections keyed by (output name, flags, type),
/// preserving input order within each group, then assigns every member its offset.
fn bin_sections<'data>(files: &mut [ObjectFile<'data>]) -> Vec<OutputChunk<'data>> {
    let _span = tracing::info_span!("Group input sections").entered();

    const FLAG_MASK: u64 = (object::elf::SHF_WRITE
        | object::elf::SHF_ALLOC
        | object::elf::SHF_EXECINSTR
        | object::elf::SHF_TLS) as u64;

    let mut chunks: Vec<OutputChunk> = Vec::new();
    let mut by_key: HashMap<(&[u8], u64, u32), usize> = HashMap::new();

    for file in files.iter() {
        if !file.is_alive() {
            continue;
        }
        let file_id = file.file_id;
        for (index, slot) in file.sections.iter().enumerate() {
            let SectionSlot::Loaded(sec) = slot else {
                continue;
            };
            let name = output_section_name(sec.name);
            let flags = sec.sh_flags & FLAG_MASK;
            let index_in_chunks =
                *by_key.entry((name, flags, sec.sh_type)).or_insert_with(|| {
                    chunks.push(OutputChunk {
                        name,
                        kind: ChunkKind::Section {
                            members: Vec::new(),
                        },
                        sh_type: sec.sh_type,
                        sh_flags: flags,
                        sh_entsize: 0,
                        sh_link: 0,
                        sh_info: 0,
                        alignment: 1,
                        offset: 0,
                        address: 0,
                        size: 0,
                        shndx: 0,
                        starts_load: false,
                        name_offset: 0,
                    });
                    chunks.len() - 1
                });
            let ChunkKind::Section { members } = &mut chunks[index_in_chunks].kind else {
                unreachable!();
            };
            members.push((file_id, object::SectionIndex(index)));
        }
    }

    // Assign each member its offset within the output section and compute sizes.
    for chunk in &mut chunks {
        let ChunkKind::Section { members } = &chunk.kind else {
            unreachable!();
        };
        let mut offset = 0u64;
        let mut alignment = 1u64;
        for &(file_id, section_index) in members {
            let SectionSlot::Loaded(sec) =
                &mut files[file_id.as_usize()].sections[section_index.0]
            else {
                unreachable!();
            };
            offset = align_to(offset, sec.alignment);
            sec.offset = offset;
            offset += sec.size;
            alignment = alignment.max(sec.alignment);
        }
        chunk.size = offset;
        chunk.alignment = alignment;
    }

    chunks.retain(|chunk| chunk.size > 0);
    chunks
}

fn synthetic_chunk<'data>(name: &'data [u8], kind: ChunkKind<'data>) -> OutputChunk<'data> {
    let (sh_type, sh_flags, sh_entsize, alignment): (u32, u32, u64, u64) = match &kind {
        ChunkKind::Ehdr => (object::elf::SHT_NULL, object::elf::SHF_ALLOC, 0, 8),
        ChunkKind::ProgramHeaders => (object::elf::SHT_NULL, object::elf::SHF_ALLOC, 0, 8),
        ChunkKind::SectionHeaders => (object::elf::SHT_NULL, 0, 0, 8),
        ChunkKind::Interp => (object::elf::SHT_PROGBITS, object::elf::SHF_ALLOC, 0, 1),
        ChunkKind::Got | ChunkKind::GotPlt => (
            object::elf::SHT_PROGBITS,
            object::elf::SHF_ALLOC | object::elf::SHF_WRITE,
            elf::GOT_ENTRY_SIZE,
            8,
        ),
        ChunkKind::Plt => (
            object::elf::SHT_PROGBITS,
            object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR,
            elf::PLT_ENTRY_SIZE,
            16,
        ),
        ChunkKind::RelaPlt => (
            object::elf::SHT_RELA,
            object::elf::SHF_ALLOC,
            elf::RELA_ENTRY_SIZE,
            8,
        ),
        ChunkKind::Symtab => (object::elf::SHT_SYMTAB, 0, elf::SYMTAB_ENTRY_SIZE, 8),
        ChunkKind::Strtab | ChunkKind::Shstrtab => (object::elf::SHT_STRTAB, 0, 0, 1),
        ChunkKind::Section { .. } | ChunkKind::Merged(_) => unreachable!(),
    };
    OutputChunk {
        name,
        kind,
        sh_type,
        sh_flags: sh_flags as u64,
        sh_entsize,
        sh_link: 0,
        sh_info: 0,
        alignment,
        offset: 0,
        address: 0,
        size: 0,
        shndx: 0,
        starts_load: false,
        name_offset: 0,
    }
}

/// Rank deciding the canonical chunk order: headers, then executable code, read-only data,
/// read-write data, BSS, and finally the non-allocated metadata.
fn chunk_rank(chunk: &OutputChunk) -> u32 {
    let alloc = chunk.sh_flags & object::elf::SHF_ALLOC as u64 != 0;
    let write = chunk.sh_flags & object::elf::SHF_WRITE as u64 != 0;
    let exec = chunk.sh_flags & object::elf::SHF_EXECINSTR as u64 != 0;
    let tls = chunk.sh_flags & object::elf::SHF_TLS as u64 != 0;
    let nobits = chunk.sh_type == object::elf::SHT_NOBITS;

    match &chunk.kind {
        ChunkKind::Ehdr => 0,
        ChunkKind::ProgramHeaders => 1,
        ChunkKind::Interp => 2,
        ChunkKind::Plt => 10,
        ChunkKind::RelaPlt => 20,
        ChunkKind::Got => 36,
        ChunkKind::GotPlt => 37,
        ChunkKind::Symtab => 60,
        ChunkKind::Strtab => 61,
        ChunkKind::Shstrtab => 62,
        ChunkKind::SectionHeaders => 70,
        ChunkKind::Section { .. } | ChunkKind::Merged(_) => {
            if !alloc {
                50
            } else if exec {
                11
            } else if !write {
                21
            } else if tls && !nobits {
                30
            } else if tls && nobits {
                31
            } else if nobits {
                40
            } else {
                match chunk.sh_type {
                    object::elf::SHT_PREINIT_ARRAY => 32,
                    object::elf::SHT_INIT_ARRAY => 33,
                    object::elf::SHT_FINI_ARRAY => 34,
                    _ => 35,
                }
            }
        }
    }
}

/// Marks the chunks at which a new PT_LOAD starts: the first allocated chunk, then every change
/// of the (write, exec) signature. Returns the number of loads.
fn compute_load_boundaries(chunks: &mut [OutputChunk]) -> usize {
    let mut prev_signature = None;
    let mut num_loads = 0;
    for chunk in chunks {
        if chunk.sh_flags & object::elf::SHF_ALLOC as u64 == 0 {
            continue;
        }
        let signature = chunk.sh_flags
            & (object::elf::SHF_WRITE | object::elf::SHF_EXECINSTR) as u64;
        if prev_signature != Some(signature) {
            chunk.starts_load = true;
            num_loads += 1;
            prev_signature = Some(signature);
        }
    }
    num_loads
}

fn segment_flags(sh_flags: u64) -> u32 {
    let mut flags = object::elf::PF_R;
    if sh_flags & object::elf::SHF_WRITE as u64 != 0 {
        flags |= object::elf::PF_W;
    }
    if sh_flags & object::elf::SHF_EXECINSTR as u64 != 0 {
        flags |= object::elf::PF_X;
    }
    flags
}

pub(crate) fn compute<'data>(
    args: &'data Args,
    files: &mut [ObjectFile<'data>],
    db: &SymbolDb<'data>,
    merged: &MergedSections<'data>,
    prelude: &mut Prelude<'data>,
) -> Result<Layout<'data>> {
    let _span = tracing::info_span!("Layout").entered();

    discard_empty_sections(files);
    compute_symbol_tables(files, prelude);
    let (num_symtab_entries, first_global_row, strtab_size) =
        assign_symbol_table_offsets(files, prelude);
    let (plt_symbols, got_entries) = assign_slot_offsets(files, prelude);

    // Build the chunk list.
    let mut chunks = bin_sections(files);
    for section in merged.sorted() {
        if section.size.load(Ordering::Acquire) == 0 {
            continue;
        }
        chunks.push(OutputChunk {
            name: section.name,
            kind: ChunkKind::Merged(section),
            sh_type: section.sh_type,
            sh_flags: section.sh_flags,
            sh_entsize: 0,
            sh_link: 0,
            sh_info: 0,
            alignment: section.alignment.load(Ordering::Acquire),
            offset: 0,
            address: 0,
            size: section.size.load(Ordering::Acquire),
            shndx: 0,
            starts_load: false,
            name_offset: 0,
        });
    }

    chunks.push(synthetic_chunk(b"", ChunkKind::Ehdr));
    chunks.push(synthetic_chunk(b"", ChunkKind::ProgramHeaders));
    if !args.is_static {
        let mut interp = synthetic_chunk(b".interp", ChunkKind::Interp);
        interp.size = crate::elf_writer::INTERP.len() as u64;
        chunks.push(interp);
    }

    let num_got = files
        .iter()
        .map(|f| f.num_got.load(Ordering::Acquire))
        .sum::<u32>()
        + prelude.num_got.load(Ordering::Acquire);
    let num_plt = files
        .iter()
        .map(|f| f.num_plt.load(Ordering::Acquire))
        .sum::<u32>()
        + prelude.num_plt.load(Ordering::Acquire);

    if num_got > 0 {
        let mut got = synthetic_chunk(b".got", ChunkKind::Got);
        got.size = u64::from(num_got) * elf::GOT_ENTRY_SIZE;
        chunks.push(got);
    }
    if num_plt > 0 {
        let mut plt = synthetic_chunk(b".plt", ChunkKind::Plt);
        plt.size = u64::from(num_plt) * elf::PLT_ENTRY_SIZE;
        chunks.push(plt);
        let mut gotplt = synthetic_chunk(b".got.plt", ChunkKind::GotPlt);
        gotplt.size = u64::from(num_plt) * elf::GOT_ENTRY_SIZE;
        chunks.push(gotplt);
        let mut relplt = synthetic_chunk(b".rela.plt", ChunkKind::RelaPlt);
        relplt.size = u64::from(num_plt) * elf::RELA_ENTRY_SIZE;
        chunks.push(relplt);
    }

    let mut symtab = synthetic_chunk(b".symtab", ChunkKind::Symtab);
    symtab.size = u64::from(num_symtab_entries) * elf::SYMTAB_ENTRY_SIZE;
    symtab.sh_info = first_global_row;
    chunks.push(symtab);
    let mut strtab = synthetic_chunk(b".strtab", ChunkKind::Strtab);
    strtab.size = u64::from(strtab_size);
    chunks.push(strtab);
    chunks.push(synthetic_chunk(b".shstrtab", ChunkKind::Shstrtab));
    chunks.push(synthetic_chunk(b"", ChunkKind::SectionHeaders));

    chunks.sort_by_key(chunk_rank);

    // Section header indices: every chunk except the ELF header and the header tables gets one.
    let mut shndx = 1u32;
    for chunk in &mut chunks {
        if matches!(
            chunk.kind,
            ChunkKind::Ehdr | ChunkKind::ProgramHeaders | ChunkKind::SectionHeaders
        ) {
            continue;
        }
        chunk.shndx = shndx;
        if let ChunkKind::Merged(section) = &chunk.kind {
            section.shndx.store(shndx, Ordering::Release);
        }
        shndx += 1;
    }
    let num_section_headers = shndx;

    // Record the output chunk of every input section, now that chunk positions are final.
    let chunk_of_member: HashMap<(FileId, usize), u32> = chunks
        .iter()
        .enumerate()
        .flat_map(|(chunk_index, chunk)| {
            let members = match &chunk.kind {
                ChunkKind::Section { members } => members.as_slice(),
                _ => &[],
            };
            members
                .iter()
                .map(move |&(file_id, section_index)| ((file_id, section_index.0), chunk_index as u32))
        })
        .collect();
    for file in files.iter_mut() {
        let file_id = file.file_id;
        for (index, slot) in file.sections.iter_mut().enumerate() {
            if let SectionSlot::Loaded(sec) = slot {
                if let Some(&chunk_index) = chunk_of_member.get(&(file_id, index)) {
                    sec.output_chunk = chunk_index;
                }
            }
        }
    }

    // The .shstrtab contents and chunk name offsets.
    let mut shstrtab = vec![0u8];
    for chunk in &mut chunks {
        if chunk.shndx == 0 || chunk.name.is_empty() {
            continue;
        }
        chunk.name_offset = shstrtab.len() as u32;
        shstrtab.extend_from_slice(chunk.name);
        shstrtab.push(0);
    }
    let shstrtab_chunk_index = chunks
        .iter()
        .position(|c| matches!(c.kind, ChunkKind::Shstrtab))
        .unwrap();
    chunks[shstrtab_chunk_index].size = shstrtab.len() as u64;

    // Program header table size depends on the number of segments, which we can count now.
    let num_loads = compute_load_boundaries(&mut chunks);
    let has_tls = chunks
        .iter()
        .any(|c| c.sh_flags & object::elf::SHF_TLS as u64 != 0);
    let interp_index = chunks
        .iter()
        .position(|c| matches!(c.kind, ChunkKind::Interp));
    let num_segments =
        1 + usize::from(interp_index.is_some()) + num_loads + usize::from(has_tls);

    let phdr_index = chunks
        .iter()
        .position(|c| matches!(c.kind, ChunkKind::ProgramHeaders))
        .unwrap();
    chunks[phdr_index].size = num_segments as u64 * elf::PHDR_ENTRY_SIZE;

    let shdr_index = chunks
        .iter()
        .position(|c| matches!(c.kind, ChunkKind::SectionHeaders))
        .unwrap();
    chunks[shdr_index].size = u64::from(num_section_headers) * elf::SHDR_ENTRY_SIZE;

    let ehdr_index = chunks
        .iter()
        .position(|c| matches!(c.kind, ChunkKind::Ehdr))
        .unwrap();
    chunks[ehdr_index].size = elf::EHDR_SIZE;

    // Assign file offsets and virtual addresses.
    let mut offset = 0u64;
    let mut addr = elf::IMAGE_BASE;
    for chunk in &mut chunks {
        let alloc = chunk.sh_flags & object::elf::SHF_ALLOC as u64 != 0;
        if chunk.starts_load {
            offset = align_to(offset, elf::PAGE_SIZE);
            addr = elf::IMAGE_BASE + offset;
        }
        if alloc {
            let nobits = chunk.sh_type == object::elf::SHT_NOBITS;
            let tls = chunk.sh_flags & object::elf::SHF_TLS as u64 != 0;
            addr = align_to(addr, chunk.alignment);
            if nobits {
                chunk.offset = offset;
                chunk.address = addr;
                // TLS NOBITS occupies no address space of its own: its addresses are only ever
                // interpreted relative to the thread pointer, so the next section may overlap.
                if !tls {
                    addr += chunk.size;
                }
            } else {
                offset = align_to(offset, chunk.alignment);
                chunk.offset = offset;
                chunk.address = addr;
                offset += chunk.size;
                addr += chunk.size;
            }
        } else {
            offset = align_to(offset, chunk.alignment);
            chunk.offset = offset;
            chunk.address = 0;
            offset += chunk.size;
        }

        if let ChunkKind::Merged(section) = &chunk.kind {
            section.address.store(chunk.address, Ordering::Release);
        }
    }
    let file_size = offset;

    // Build the program header table.
    let mut segments = Vec::with_capacity(num_segments);
    segments.push(Segment {
        p_type: object::elf::PT_PHDR,
        p_flags: object::elf::PF_R,
        offset: chunks[phdr_index].offset,
        vaddr: chunks[phdr_index].address,
        filesz: chunks[phdr_index].size,
        memsz: chunks[phdr_index].size,
        align: 8,
    });
    if let Some(interp) = interp_index {
        segments.push(Segment {
            p_type: object::elf::PT_INTERP,
            p_flags: object::elf::PF_R,
            offset: chunks[interp].offset,
            vaddr: chunks[interp].address,
            filesz: chunks[interp].size,
            memsz: chunks[interp].size,
            align: 1,
        });
    }
    for (index, chunk) in chunks.iter().enumerate() {
        if !chunk.starts_load {
            continue;
        }
        let mut filesz_end = chunk.offset + Layout::chunk_file_size(chunk);
        let mut memsz_end = chunk.address + chunk.size;
        for later in &chunks[index + 1..] {
            if later.starts_load || later.sh_flags & object::elf::SHF_ALLOC as u64 == 0 {
                break;
            }
            filesz_end = filesz_end.max(later.offset + Layout::chunk_file_size(later));
            memsz_end = memsz_end.max(later.address + later.size);
        }
        segments.push(Segment {
            p_type: object::elf::PT_LOAD,
            p_flags: segment_flags(chunk.sh_flags),
            offset: chunk.offset,
            vaddr: chunk.address,
            filesz: filesz_end - chunk.offset,
            memsz: memsz_end - chunk.address,
            align: elf::PAGE_SIZE,
        });
    }
    let mut tls_end = 0;
    if has_tls {
        let tls_chunks: Vec<&OutputChunk> = chunks
            .iter()
            .filter(|c| c.sh_flags & object::elf::SHF_TLS as u64 != 0)
            .collect();
        let first = tls_chunks.first().unwrap();
        let vaddr = first.address;
        let align = tls_chunks.iter().map(|c| c.alignment).max().unwrap();
        let filesz = tls_chunks
            .iter()
            .filter(|c| c.sh_type != object::elf::SHT_NOBITS)
            .map(|c| c.address + c.size)
            .max()
            .unwrap_or(vaddr)
            - vaddr;
        let memsz = tls_chunks
            .iter()
            .map(|c| c.address + c.size)
            .max()
            .unwrap()
            - vaddr;
        segments.push(Segment {
            p_type: object::elf::PT_TLS,
            p_flags: object::elf::PF_R,
            offset: first.offset,
            vaddr,
            filesz,
            memsz,
            align,
        });
        // On x86-64 the thread pointer sits just past the end of the TLS block; TPOFF values
        // are negative offsets from it.
        tls_end = align_to(vaddr + memsz, align);
    }

    // Fix up header fields that reference other sections by index.
    let symtab_index = chunks
        .iter()
        .position(|c| matches!(c.kind, ChunkKind::Symtab))
        .unwrap();
    let strtab_index = chunks
        .iter()
        .position(|c| matches!(c.kind, ChunkKind::Strtab))
        .unwrap();
    let got_index = chunks.iter().position(|c| matches!(c.kind, ChunkKind::Got));
    let gotplt_index = chunks
        .iter()
        .position(|c| matches!(c.kind, ChunkKind::GotPlt));
    let plt_index = chunks.iter().position(|c| matches!(c.kind, ChunkKind::Plt));
    let relplt_index = chunks
        .iter()
        .position(|c| matches!(c.kind, ChunkKind::RelaPlt));

    chunks[symtab_index].sh_link = chunks[strtab_index].shndx;
    if let Some(relplt) = relplt_index {
        chunks[relplt].sh_link = chunks[symtab_index].shndx;
        if let Some(gotplt) = gotplt_index {
            chunks[relplt].sh_info = chunks[gotplt].shndx;
        }
    }

    let mut layout = Layout {
        chunks,
        segments,
        file_size,
        entry: 0,
        tls_end,
        num_symtab_entries,
        first_global_row,
        strtab_size,
        shstrtab,
        plt_symbols,
        got_entries,
        phdr_index,
        shdr_index,
        symtab_index,
        strtab_index,
        got_index,
        gotplt_index,
        plt_index,
        relplt_index,
    };

    resolve_prelude_symbols(prelude, &layout);
    store_symbol_addresses(files, &layout);
    layout.entry = entry_address(args, db, &layout);

    Ok(layout)
}

/// Computes the address of every synthetic layout symbol that wasn't displaced by a real
/// definition.
fn resolve_prelude_symbols<'data>(prelude: &Prelude<'data>, layout: &Layout<'data>) {
    let alloc_chunks = || {
        layout
            .chunks
            .iter()
            .filter(|c| c.sh_flags & object::elf::SHF_ALLOC as u64 != 0)
    };
    let end_of = |pred: &dyn Fn(&&OutputChunk) -> bool| {
        alloc_chunks()
            .filter(pred)
            .map(|c| c.address + c.size)
            .max()
            .unwrap_or(elf::IMAGE_BASE)
    };
    let section_bounds = |name: &[u8]| {
        layout
            .chunks
            .iter()
            .find(|c| c.name == name && c.sh_flags & object::elf::SHF_ALLOC as u64 != 0)
            .map(|c| (c.address, c.address + c.size))
            .unwrap_or((0, 0))
    };

    let edata = end_of(&|c| c.sh_type != object::elf::SHT_NOBITS);

    for def in prelude.owned_symbols() {
        let address = match def.placement {
            SymbolPlacement::EhdrStart => elf::IMAGE_BASE,
            SymbolPlacement::End => end_of(&|_| true),
            SymbolPlacement::Etext => {
                end_of(&|c| c.sh_flags & object::elf::SHF_EXECINSTR as u64 != 0)
            }
            SymbolPlacement::Edata => edata,
            SymbolPlacement::BssStart => alloc_chunks()
                .find(|c| {
                    c.sh_type == object::elf::SHT_NOBITS
                        && c.sh_flags & object::elf::SHF_TLS as u64 == 0
                })
                .map(|c| c.address)
                .unwrap_or(edata),
            SymbolPlacement::SectionStart(name) => section_bounds(name).0,
            SymbolPlacement::SectionEnd(name) => section_bounds(name).1,
            // We never emit R_X86_64_IRELATIVE relocations, so the range is empty.
            SymbolPlacement::RelaIpltStart | SymbolPlacement::RelaIpltEnd => 0,
        };
        let sym = def.symbol;
        sym.address.store(address, Ordering::Release);
        sym.shndx
            .store(u32::from(object::elf::SHN_ABS), Ordering::Release);
        sym.lock().value = address;
    }
}

/// Computes and caches the final address and output section of every owned global, so that
/// relocation application and symbol table emission don't have to chase sections again.
fn store_symbol_addresses<'data>(files: &[ObjectFile<'data>], layout: &Layout<'data>) {
    let _span = tracing::info_span!("Resolve symbol addresses").entered();

    files.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for sym in owned_globals(file) {
            let res = sym.resolution();
            let (address, shndx) = if let Some(piece) = res.piece {
                (piece.address(), piece.piece.merged.shndx.load(Ordering::Acquire))
            } else if let Some(section_index) = res.section {
                let SectionSlot::Loaded(sec) = &file.sections[section_index.0] else {
                    // Defined in a discarded section (dead COMDAT member); resolves to zero.
                    sym.address.store(0, Ordering::Release);
                    continue;
                };
                let chunk = &layout.chunks[sec.output_chunk as usize];
                (chunk.address + sec.offset + res.value, chunk.shndx)
            } else {
                (res.value, u32::from(object::elf::SHN_ABS))
            };
            sym.address.store(address, Ordering::Release);
            sym.shndx.store(shndx, Ordering::Release);
        }
    });
}

fn entry_address<'a>(args: &'a Args, db: &SymbolDb<'a>, layout: &Layout<'_>) -> u64 {
    if let Some(sym) = db.get(SymbolName::prehashed(args.entry.as_bytes())) {
        if sym.lock().is_defined() {
            return sym.address.load(Ordering::Acquire);
        }
    }
    // Fall back to the start of the first executable section, the same way BFD ld does when the
    // entry symbol is missing.
    let fallback = layout
        .chunks
        .iter()
        .find(|c| c.sh_flags & object::elf::SHF_EXECINSTR as u64 != 0)
        .map_or(elf::IMAGE_BASE, |c| c.address);
    tracing::warn!(
        "cannot find entry symbol `{}`; defaulting to {fallback:#x}",
        args.entry
    );
    fallback
}
