//! Symbol resolution and the phases that feed back into it: the archive liveness walk, COMDAT
//! group deduplication, undefined-weak handling and common-symbol conversion.
//!
//! Resolution is deterministic regardless of thread count: every decision compares a strength
//! tier first and the owning file's priority second, so the winner never depends on the order in
//! which threads arrive at a symbol.

use crate::bail;
use crate::elf;
use crate::elf::LE;
use crate::elf::SymbolStrength;
use crate::error::Result;
use crate::parsing::FileId;
use crate::parsing::InputSection;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::parsing::symbol_section;
use crate::symbol::Owner;
use crate::symbol::Symbol;
use crossbeam_queue::SegQueue;
use object::read::elf::Sym as _;
use rayon::prelude::*;
use std::sync::atomic::Ordering;

/// A pair of strong definitions observed during resolution. Whether it's reported as an error is
/// decided after COMDAT deduplication, since one of the two definitions may be in a discarded
/// group.
struct DuplicateCandidate<'data> {
    symbol: &'data Symbol<'data>,
    first: Definition,
    second: Definition,
}

#[derive(Clone, Copy)]
struct Definition {
    file: FileId,
    section: Option<object::SectionIndex>,
}

pub(crate) struct Outputs<'data> {
    duplicates: SegQueue<DuplicateCandidate<'data>>,
}

impl Outputs<'_> {
    pub(crate) fn new() -> Self {
        Outputs {
            duplicates: SegQueue::new(),
        }
    }
}

/// Runs `maybe_override` for every global of every file. Files that aren't alive (archive
/// members not yet activated) only install placeholders recording which member can provide each
/// name.
pub(crate) fn resolve_symbols<'data>(
    files: &[ObjectFile<'data>],
    outputs: &Outputs<'data>,
) -> Result {
    let _span = tracing::info_span!("Resolve symbols").entered();

    files
        .par_iter()
        .try_for_each(|file| resolve_file(file, outputs))
}

fn resolve_file<'data>(file: &ObjectFile<'data>, outputs: &Outputs<'data>) -> Result {
    let alive = file.is_alive();
    for (esym, sym) in file.global_symbols() {
        maybe_override(sym, file, esym, alive, outputs)?;
    }
    Ok(())
}

/// Applies the resolution rule: a stronger definition displaces a weaker one; within the same
/// strength the lower-priority file wins. Serialised per symbol by the symbol's mutex.
fn maybe_override<'data>(
    sym: &'data Symbol<'data>,
    file: &ObjectFile<'data>,
    esym: &elf::Sym,
    file_is_alive: bool,
    outputs: &Outputs<'data>,
) -> Result {
    let strength = SymbolStrength::of(esym, file_is_alive);
    if strength == SymbolStrength::Undefined {
        if sym.traced {
            tracing::info!(
                "trace-symbol: `{}` referenced by {}",
                sym.name(),
                file.display_name()
            );
        }
        return Ok(());
    }

    let section = symbol_section(esym)?;
    let mut res = sym.lock();

    let takes_over = strength > res.strength
        || (strength == res.strength && file.priority < res.priority);

    if strength == SymbolStrength::Strong && res.strength == SymbolStrength::Strong {
        if let Owner::File(existing) = res.owner {
            outputs.duplicates.push(DuplicateCandidate {
                symbol: sym,
                first: Definition {
                    file: existing,
                    section: res.section,
                },
                second: Definition {
                    file: file.file_id,
                    section,
                },
            });
        }
    }

    if sym.traced {
        tracing::info!(
            "trace-symbol: `{}` defined by {} ({:?}): {}",
            sym.name(),
            file.display_name(),
            strength,
            if takes_over { "selected" } else { "ignored" },
        );
    }

    if !takes_over {
        return Ok(());
    }

    res.owner = Owner::File(file.file_id);
    res.strength = strength;
    res.priority = file.priority;
    res.section = section;
    res.value = esym.st_value(LE);
    res.size = esym.st_size(LE);
    res.visibility = esym.st_visibility();
    res.sym_type = esym.st_type();
    res.undef_weak = false;
    // Definitions inside mergeable sections get their piece reference once those sections have
    // been sliced, after the liveness walk.
    res.piece = None;

    Ok(())
}

/// The fixed-point archive liveness walk. Starting from the files that are alive on entry, any
/// strong undefined reference to a symbol provided by a dead archive member activates that
/// member, whose own references then join the next round.
pub(crate) fn mark_live_archive_members<'data>(
    files: &[ObjectFile<'data>],
    outputs: &Outputs<'data>,
) -> Result {
    let _span = tracing::info_span!("Archive liveness").entered();

    let mut worklist: Vec<&ObjectFile> = files.iter().filter(|f| f.is_alive()).collect();

    while !worklist.is_empty() {
        let activated = SegQueue::new();
        worklist.par_iter().try_for_each(|file| {
            scan_undefined_references(file, files, &activated, outputs)
        })?;
        worklist = std::iter::from_fn(|| activated.pop()).collect();
    }
    Ok(())
}

fn scan_undefined_references<'data, 'files>(
    file: &ObjectFile<'data>,
    files: &'files [ObjectFile<'data>],
    activated: &SegQueue<&'files ObjectFile<'data>>,
    outputs: &Outputs<'data>,
) -> Result {
    for (esym, sym) in file.global_symbols() {
        if !esym.is_undefined(LE) || esym.st_bind() == object::elf::STB_WEAK {
            continue;
        }
        let owner = sym.lock().owner;
        let Owner::File(owner_id) = owner else {
            continue;
        };
        let provider = &files[owner_id.as_usize()];
        if provider.is_alive() || !provider.activate() {
            continue;
        }
        if sym.traced {
            tracing::info!(
                "trace-symbol: `{}` activates archive member {}",
                sym.name(),
                provider.display_name()
            );
        }
        // Re-run resolution for the newly live member: its placeholders become real
        // definitions.
        resolve_file(provider, outputs)?;
        activated.push(provider);
    }
    Ok(())
}

/// Marks symbols that remain without a live definition, but are referenced weakly, as
/// undefined-weak. Relocations against them resolve to zero at write time.
pub(crate) fn assign_undefined_weak<'data>(files: &[ObjectFile<'data>]) {
    let _span = tracing::info_span!("Handle undefined weak symbols").entered();

    files.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for (esym, sym) in file.global_symbols() {
            if !esym.is_undefined(LE) || esym.st_bind() != object::elf::STB_WEAK {
                continue;
            }
            let mut res = sym.lock();
            let has_live_definition = match res.owner {
                Owner::Prelude => true,
                Owner::None => false,
                Owner::File(id) => {
                    res.strength.is_defined() && files[id.as_usize()].is_alive()
                }
            };
            if !has_live_definition {
                res.owner = Owner::None;
                res.strength = SymbolStrength::Undefined;
                res.section = None;
                res.piece = None;
                res.value = 0;
                res.undef_weak = true;
                sym.undef_weak.store(true, Ordering::Release);
            }
        }
    });
}

/// COMDAT deduplication: groups with the same signature keep exactly one copy. Each live file
/// first lodges its claims, then every file discards the member sections of the groups it lost.
pub(crate) fn eliminate_duplicate_comdat_groups(files: &mut [ObjectFile<'_>]) {
    let _span = tracing::info_span!("Eliminate duplicate COMDAT groups").entered();

    files.par_iter().for_each(|file| {
        if !file.is_alive() {
            return;
        }
        for claim in &file.comdat_groups {
            claim
                .group
                .claim(file.priority, file.file_id, claim.descriptor_index);
        }
    });

    files.par_iter_mut().for_each(|file| {
        let file_id = file.file_id;
        let mut dead_members: Vec<object::SectionIndex> = Vec::new();
        for claim in &file.comdat_groups {
            if !claim.group.is_owned_by(file_id, claim.descriptor_index) {
                dead_members.extend_from_slice(&claim.members);
            }
        }
        for member in dead_members {
            if let Some(slot) = file.sections.get_mut(member.0) {
                *slot = SectionSlot::Discard;
            }
        }
    });
}

/// Reports duplicate strong definitions. Candidates whose losing copy sits in a discarded COMDAT
/// group (or in a file that never became live) are not errors.
pub(crate) fn report_duplicate_symbols<'data>(
    files: &[ObjectFile<'data>],
    outputs: &Outputs<'data>,
) -> Result {
    let live = |def: &Definition| {
        let file = &files[def.file.as_usize()];
        file.is_alive()
            && def
                .section
                .map_or(true, |section| file.section_is_live(section))
    };

    while let Some(candidate) = outputs.duplicates.pop() {
        if live(&candidate.first) && live(&candidate.second) {
            bail!(
                "duplicate symbol: `{}` defined by both {} and {}",
                candidate.symbol.name(),
                files[candidate.first.file.as_usize()].display_name(),
                files[candidate.second.file.as_usize()].display_name(),
            );
        }
    }
    Ok(())
}

/// Converts tentative (COMMON) definitions into regular definitions in a synthesized NOBITS
/// section. After this, no common symbols remain.
pub(crate) fn convert_common_symbols(files: &mut [ObjectFile<'_>]) {
    let _span = tracing::info_span!("Convert common symbols").entered();

    files.par_iter_mut().for_each(|file| {
        if !file.has_common || !file.is_alive() {
            return;
        }
        let esyms = file.object.symbols.symbols();
        for index in 0..file.globals.len() {
            let esym = &esyms[file.first_global + index];
            if esym.st_shndx(LE) != object::elf::SHN_COMMON {
                continue;
            }
            let sym = file.globals[index];
            let mut res = sym.lock();
            if res.owner != Owner::File(file.file_id) || res.strength != SymbolStrength::Common {
                continue;
            }

            let section_index = file.sections.len();
            // For common symbols st_value holds the required alignment.
            file.sections.push(SectionSlot::Loaded(InputSection {
                name: b".bss",
                sh_type: object::elf::SHT_NOBITS,
                sh_flags: (object::elf::SHF_ALLOC | object::elf::SHF_WRITE) as u64,
                size: res.size,
                alignment: res.value.max(1),
                entsize: 0,
                data: &[],
                relas: &[],
                rel_pieces: Vec::new(),
                output_chunk: crate::parsing::CHUNK_NONE,
                offset: 0,
            }));

            res.strength = SymbolStrength::Strong;
            res.section = Some(object::SectionIndex(section_index));
            res.value = 0;
        }
    });
}

/// Verifies that every strong reference from a live file has a live definition.
pub(crate) fn check_undefined_symbols(files: &[ObjectFile<'_>]) -> Result {
    let _span = tracing::info_span!("Check undefined symbols").entered();

    files.par_iter().try_for_each(|file| {
        if !file.is_alive() {
            return Ok(());
        }
        for (esym, sym) in file.global_symbols() {
            if !esym.is_undefined(LE) || esym.st_bind() == object::elf::STB_WEAK {
                continue;
            }
            let res = sym.resolution();
            let defined = match res.owner {
                Owner::Prelude => true,
                Owner::None => false,
                Owner::File(id) => {
                    res.strength.is_defined() && files[id.as_usize()].is_alive()
                }
            };
            if !defined {
                bail!(
                    "undefined symbol: `{}` referenced by {}",
                    sym.name(),
                    file.display_name()
                );
            }
        }
        Ok(())
    })
}
