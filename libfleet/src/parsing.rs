//! Parses each input object into our per-file representation: a section array, a local symbol
//! array and references to the interned global symbols. Runs across all input files in parallel.

use crate::args::display_input;
use crate::bail;
use crate::elf;
use crate::elf::LE;
use crate::error::Context as _;
use crate::error::Result;
use crate::input_data::InputBytes;
use crate::input_data::InputData;
use crate::string_merging::MergedSection;
use crate::string_merging::PieceRef;
use crate::string_merging::StringPiece;
use crate::symbol::Symbol;
use crate::symbol::SymbolName;
use crate::symbol_db::ComdatGroup;
use crate::symbol_db::SymbolDb;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;
use rayon::prelude::*;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Identifies an input object by its index in the file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FileId(u32);

impl FileId {
    pub(crate) const NONE: FileId = FileId(u32::MAX);

    pub(crate) fn new(value: u32) -> FileId {
        FileId(value)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Priority of the synthetic internal file that owns layout symbols. Real files start at 1.
pub(crate) const PRELUDE_PRIORITY: u32 = 0;

pub(crate) struct ObjectFile<'data> {
    pub(crate) file_id: FileId,

    /// Deterministic tie-break key: the position at which this object entered the link, starting
    /// at 1. Lower wins.
    pub(crate) priority: u32,

    pub(crate) filename: &'data Path,
    pub(crate) archive_entry: Option<&'data [u8]>,
    pub(crate) in_archive: bool,

    /// Archive members start dead and are activated by the liveness walk.
    pub(crate) is_alive: AtomicBool,

    pub(crate) object: elf::File<'data>,
    pub(crate) sections: Vec<SectionSlot<'data>>,
    pub(crate) locals: Vec<LocalSymbol<'data>>,
    pub(crate) globals: Vec<&'data Symbol<'data>>,
    pub(crate) first_global: usize,
    pub(crate) comdat_groups: Vec<ComdatClaim<'data>>,
    pub(crate) has_common: bool,

    // Numbers of synthetic table slots this file accounts for, accumulated during relocation
    // scanning.
    pub(crate) num_got: AtomicU32,
    pub(crate) num_plt: AtomicU32,
    pub(crate) num_gotplt: AtomicU32,
    pub(crate) num_relplt: AtomicU32,

    // Base offsets within the synthetic output chunks, assigned by prefix sums during layout.
    pub(crate) got_base: u32,
    pub(crate) plt_base: u32,
    pub(crate) gotplt_base: u32,
    pub(crate) relplt_base: u32,

    // Sizes and assigned offsets of this file's .symtab/.strtab contributions.
    pub(crate) local_symtab_count: u32,
    pub(crate) local_strtab_size: u32,
    pub(crate) global_symtab_count: u32,
    pub(crate) global_strtab_size: u32,
    pub(crate) local_symtab_base: u32,
    pub(crate) local_strtab_base: u32,
    pub(crate) global_symtab_base: u32,
    pub(crate) global_strtab_base: u32,
}

pub(crate) enum SectionSlot<'data> {
    /// Not carried into the output: ELF metadata, excluded sections and dead COMDAT members.
    Discard,
    Loaded(InputSection<'data>),
    Merge(MergeSlot<'data>),
}

pub(crate) struct InputSection<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) size: u64,
    pub(crate) alignment: u64,
    pub(crate) entsize: u64,
    pub(crate) data: &'data [u8],
    pub(crate) relas: &'data [elf::Rela],

    /// Relocations rewritten to reference merged-string pieces, keyed by relocation index.
    /// Sorted; looked up by binary search when relocations are applied.
    pub(crate) rel_pieces: Vec<(u32, PieceRef<'data>)>,

    /// Index of the output chunk this section was assigned to, and the offset within it.
    pub(crate) output_chunk: u32,
    pub(crate) offset: u64,
}

pub(crate) struct MergeSlot<'data> {
    pub(crate) merged: &'data MergedSection<'data>,
    /// (start offset within this input section, piece), in input order.
    pub(crate) pieces: Vec<(u64, &'data StringPiece<'data>)>,
}

pub(crate) struct LocalSymbol<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) section: Option<object::SectionIndex>,
    pub(crate) value: u64,
    pub(crate) size: u64,
    pub(crate) sym_type: u8,
    pub(crate) piece: Option<PieceRef<'data>>,
}

pub(crate) struct ComdatClaim<'data> {
    pub(crate) group: &'data ComdatGroup,
    pub(crate) descriptor_index: u32,
    pub(crate) members: Vec<object::SectionIndex>,
}

pub(crate) const CHUNK_NONE: u32 = u32::MAX;

pub(crate) fn parse_input_files<'data>(
    input_data: &'data InputData,
    db: &SymbolDb<'data>,
) -> Result<Vec<ObjectFile<'data>>> {
    let _span = tracing::info_span!("Parse input files").entered();

    let inputs = input_data.objects()?;
    inputs
        .par_iter()
        .enumerate()
        .map(|(index, input)| {
            ObjectFile::parse(input, FileId::new(index as u32), db)
                .with_context(|| format!("while reading `{input}`"))
        })
        .collect()
}

impl<'data> ObjectFile<'data> {
    fn parse(input: &InputBytes<'data>, file_id: FileId, db: &SymbolDb<'data>) -> Result<Self> {
        let object = elf::File::parse(input.data)?;

        let mut file = ObjectFile {
            file_id,
            priority: file_id.0 + 1,
            filename: input.filename,
            archive_entry: input.archive_entry,
            in_archive: input.in_archive,
            is_alive: AtomicBool::new(!input.in_archive),
            object,
            sections: Vec::new(),
            locals: Vec::new(),
            globals: Vec::new(),
            first_global: 0,
            comdat_groups: Vec::new(),
            has_common: false,
            num_got: AtomicU32::new(0),
            num_plt: AtomicU32::new(0),
            num_gotplt: AtomicU32::new(0),
            num_relplt: AtomicU32::new(0),
            got_base: 0,
            plt_base: 0,
            gotplt_base: 0,
            relplt_base: 0,
            local_symtab_count: 0,
            local_strtab_size: 0,
            global_symtab_count: 0,
            global_strtab_size: 0,
            local_symtab_base: 0,
            local_strtab_base: 0,
            global_symtab_base: 0,
            global_strtab_base: 0,
        };

        file.initialize_sections()?;
        file.initialize_symbols(db)?;
        Ok(file)
    }

    fn initialize_sections(&mut self) -> Result {
        let num_sections = self.object.sections.len();
        let mut slots = Vec::with_capacity(num_sections);

        for (section_index, section) in self.object.sections.enumerate() {
            let sh_type = section.sh_type(LE);
            let sh_flags = section.sh_flags(LE);

            match sh_type {
                object::elf::SHT_GROUP => {
                    // Decoded below; the descriptor itself never reaches the output.
                    slots.push(SectionSlot::Discard);
                    continue;
                }
                object::elf::SHT_NULL
                | object::elf::SHT_SYMTAB
                | object::elf::SHT_STRTAB
                | object::elf::SHT_RELA
                | object::elf::SHT_REL => {
                    slots.push(SectionSlot::Discard);
                    continue;
                }
                _ => {}
            }
            if sh_flags & object::elf::SHF_EXCLUDE as u64 != 0 {
                slots.push(SectionSlot::Discard);
                continue;
            }

            let name = self.object.section_name(section)?;
            let data = self.object.section_data(section).with_context(|| {
                format!("invalid data for section `{}`", String::from_utf8_lossy(name))
            })?;

            slots.push(SectionSlot::Loaded(InputSection {
                name,
                sh_type,
                sh_flags,
                size: section.sh_size(LE),
                alignment: section.sh_addralign(LE).max(1),
                entsize: section.sh_entsize(LE),
                data,
                relas: self.object.relocations[section_index.0],
                rel_pieces: Vec::new(),
                output_chunk: CHUNK_NONE,
                offset: 0,
            }));
        }

        self.sections = slots;
        Ok(())
    }

    fn initialize_symbols(&mut self, db: &SymbolDb<'data>) -> Result {
        let object = &self.object;
        let first_global = object.first_global;
        let esyms = object.symbols.symbols();

        let locals = esyms
            .iter()
            .take(first_global)
            .map(|esym| -> Result<LocalSymbol<'data>> {
                let section = symbol_section(esym)?;
                Ok(LocalSymbol {
                    name: object.symbol_name(esym)?,
                    section,
                    value: esym.st_value(LE),
                    size: esym.st_size(LE),
                    sym_type: esym.st_type(),
                    piece: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut has_common = false;
        let globals = esyms
            .iter()
            .skip(first_global)
            .map(|esym| -> Result<&'data Symbol<'data>> {
                let name = object.symbol_name(esym)?;
                if esym.st_shndx(LE) == object::elf::SHN_COMMON {
                    has_common = true;
                }
                Ok(db.intern(SymbolName::prehashed(name)))
            })
            .collect::<Result<Vec<_>>>()?;

        self.first_global = first_global;
        self.locals = locals;
        self.globals = globals;
        self.has_common = has_common;

        self.initialize_comdat_groups(db)
    }

    fn initialize_comdat_groups(&mut self, db: &SymbolDb<'data>) -> Result {
        for (section_index, section) in self.object.sections.enumerate() {
            if section.sh_type(LE) != object::elf::SHT_GROUP {
                continue;
            }
            let Some(descriptor) = self.object.parse_group(section_index, section)? else {
                continue;
            };
            let group = db.comdat_group(crate::hash::PreHashed::from_bytes(descriptor.signature));
            self.comdat_groups.push(ComdatClaim {
                group,
                descriptor_index: descriptor.descriptor_index.0 as u32,
                members: descriptor.members,
            });
        }
        Ok(())
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    /// Attempts to activate this archive member. Returns true for the caller that made the
    /// transition.
    pub(crate) fn activate(&self) -> bool {
        !self.is_alive.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn display_name(&self) -> String {
        display_input(self.filename, self.archive_entry)
    }

    /// The global symbol entries of this file's ELF symbol table, paired with the interned
    /// symbols they refer to.
    pub(crate) fn global_symbols(
        &self,
    ) -> impl Iterator<Item = (&elf::Sym, &'data Symbol<'data>)> + '_ {
        self.object
            .symbols
            .symbols()
            .iter()
            .skip(self.first_global)
            .zip(self.globals.iter().copied())
    }

    pub(crate) fn section_is_live(&self, index: object::SectionIndex) -> bool {
        !matches!(self.sections.get(index.0), None | Some(SectionSlot::Discard))
    }
}

pub(crate) fn symbol_section(esym: &elf::Sym) -> Result<Option<object::SectionIndex>> {
    match esym.st_shndx(LE) {
        object::elf::SHN_UNDEF | object::elf::SHN_ABS | object::elf::SHN_COMMON => Ok(None),
        object::elf::SHN_XINDEX => bail!("SHN_XINDEX symbols are not supported"),
        shndx if shndx >= object::elf::SHN_LORESERVE => {
            bail!("unsupported symbol section index {shndx:#x}")
        }
        shndx => Ok(Some(object::SectionIndex(shndx as usize))),
    }
}
