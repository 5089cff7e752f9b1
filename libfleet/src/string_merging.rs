//! Deduplication of mergeable sections. Input sections flagged SHF_MERGE are split into pieces:
//! at null terminators when SHF_STRINGS is also set, otherwise into sh_entsize slices. Each
//! distinct byte sequence becomes exactly one `StringPiece` in the merged output section that
//! hosts it, interned through a sharded insert-only map so splitting can run across all files
//! concurrently. Offsets within the merged section are assigned later in a deterministic order.

use crate::bail;
use crate::elf::LE;
use crate::error::Context as _;
use crate::error::Result;
use crate::hash::INTERN_SHARDS;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::parsing::MergeSlot;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::parsing::symbol_section;
use crate::symbol::Owner;
use bumpalo_herd::Herd;
use itertools::Itertools as _;
use object::read::elf::Rela as _;
use object::read::elf::Sym as _;
use rayon::prelude::*;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A unique interned mergeable value. The owner key packs (file priority, section index) and is
/// lowered with `fetch_min` on every insertion of the same bytes, so the winning section is
/// deterministic no matter which thread inserted first.
pub(crate) struct StringPiece<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) merged: &'data MergedSection<'data>,
    owner: AtomicU64,
    pub(crate) output_offset: AtomicU64,
}

impl<'data> StringPiece<'data> {
    fn new(data: &'data [u8], merged: &'data MergedSection<'data>, owner_key: u64) -> Self {
        StringPiece {
            data,
            merged,
            owner: AtomicU64::new(owner_key),
            output_offset: AtomicU64::new(0),
        }
    }

    fn claim(&self, owner_key: u64) {
        self.owner.fetch_min(owner_key, Ordering::AcqRel);
    }

    pub(crate) fn owning_priority(&self) -> u32 {
        (self.owner.load(Ordering::Acquire) >> 32) as u32
    }

    /// The piece's final virtual address. Only meaningful once layout has assigned the merged
    /// section's address.
    pub(crate) fn address(&self) -> u64 {
        self.merged.address.load(Ordering::Acquire) + self.output_offset.load(Ordering::Acquire)
    }
}

fn owner_key(priority: u32, section_index: usize) -> u64 {
    (u64::from(priority) << 32) | section_index as u64
}

/// A use-site of a piece: the piece plus the offset of the referenced byte from the start of the
/// piece.
#[derive(Clone, Copy)]
pub(crate) struct PieceRef<'data> {
    pub(crate) piece: &'data StringPiece<'data>,
    pub(crate) offset: u64,
}

impl std::fmt::Debug for PieceRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PieceRef({:?}+{}, from priority {})",
            String::from_utf8_lossy(self.piece.data),
            self.offset,
            self.piece.owning_priority()
        )
    }
}

impl PieceRef<'_> {
    pub(crate) fn address(&self) -> u64 {
        self.piece.address() + self.offset
    }
}

/// A merged output section, interned by (output name, flags, type).
pub(crate) struct MergedSection<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sh_flags: u64,
    pub(crate) sh_type: u32,
    shards: Vec<Mutex<PassThroughHashMap<&'data [u8], &'data StringPiece<'data>>>>,
    pub(crate) alignment: AtomicU64,
    pub(crate) size: AtomicU64,
    pub(crate) address: AtomicU64,
    pub(crate) shndx: AtomicU32,
    /// Pieces in output order. Populated by `assign_offsets`.
    pieces: Mutex<Vec<&'data StringPiece<'data>>>,
}

impl<'data> MergedSection<'data> {
    fn new(name: &'data [u8], sh_flags: u64, sh_type: u32) -> Self {
        MergedSection {
            name,
            sh_flags,
            sh_type,
            shards: (0..INTERN_SHARDS).map(|_| Mutex::default()).collect(),
            alignment: AtomicU64::new(1),
            size: AtomicU64::new(0),
            address: AtomicU64::new(0),
            shndx: AtomicU32::new(0),
            pieces: Mutex::new(Vec::new()),
        }
    }

    fn insert_piece(
        &'data self,
        herd: &'data Herd,
        data: &'data [u8],
        key: u64,
    ) -> &'data StringPiece<'data> {
        let prehashed = PreHashed::from_bytes(data);
        let piece = *self.shards[prehashed.shard()]
            .lock()
            .unwrap()
            .entry(prehashed)
            .or_insert_with(|| herd.get().alloc(StringPiece::new(data, self, key)));
        piece.claim(key);
        piece
    }

    /// Assigns an output offset to every piece. Pieces are ordered by increasing length, then
    /// lexicographically, which is deterministic across runs and keeps the door open for
    /// suffix-sharing later.
    fn assign_offsets(&self) {
        let mut pieces: Vec<&StringPiece> = self
            .shards
            .iter()
            .flat_map(|shard| shard.lock().unwrap().values().copied().collect::<Vec<_>>())
            .collect();
        pieces.sort_unstable_by(|a, b| {
            a.data.len().cmp(&b.data.len()).then_with(|| a.data.cmp(b.data))
        });

        let mut offset = 0;
        for piece in &pieces {
            piece.output_offset.store(offset, Ordering::Release);
            offset += piece.data.len() as u64;
        }
        self.size.store(offset, Ordering::Release);
        *self.pieces.lock().unwrap() = pieces;
    }

    pub(crate) fn pieces(&self) -> std::sync::MutexGuard<'_, Vec<&'data StringPiece<'data>>> {
        self.pieces.lock().unwrap()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct MergedKey<'data> {
    name: &'data [u8],
    sh_flags: u64,
    sh_type: u32,
}

/// Registry of all merged output sections.
pub(crate) struct MergedSections<'data> {
    herd: &'data Herd,
    shards: Vec<Mutex<PassThroughHashMap<MergedKey<'data>, &'data MergedSection<'data>>>>,
    list: Mutex<Vec<&'data MergedSection<'data>>>,
}

impl<'data> MergedSections<'data> {
    pub(crate) fn new(herd: &'data Herd) -> Self {
        MergedSections {
            herd,
            shards: (0..INTERN_SHARDS).map(|_| Mutex::default()).collect(),
            list: Mutex::new(Vec::new()),
        }
    }

    fn get_or_create(
        &self,
        name: &'data [u8],
        sh_flags: u64,
        sh_type: u32,
    ) -> &'data MergedSection<'data> {
        // The output section carries neither of the merge flags: its contents are already
        // deduplicated and its entries don't all share one size.
        let sh_flags = sh_flags & !((object::elf::SHF_MERGE | object::elf::SHF_STRINGS) as u64);
        let key = MergedKey {
            name,
            sh_flags,
            sh_type,
        };
        let prehashed = PreHashed::new(
            key,
            crate::hash::hash_bytes(name) ^ sh_flags.rotate_left(17) ^ u64::from(sh_type),
        );
        let mut shard = self.shards[prehashed.shard()].lock().unwrap();
        *shard.entry(prehashed).or_insert_with(|| {
            let section: &'data MergedSection<'data> = self
                .herd
                .get()
                .alloc(MergedSection::new(name, sh_flags, sh_type));
            self.list.lock().unwrap().push(section);
            section
        })
    }

    /// Returns the merged sections sorted by name, for deterministic layout.
    pub(crate) fn sorted(&self) -> Vec<&'data MergedSection<'data>> {
        self.list
            .lock()
            .unwrap()
            .iter()
            .copied()
            .sorted_unstable_by_key(|m| (m.name, m.sh_flags, m.sh_type))
            .collect()
    }

    pub(crate) fn assign_offsets(&self) {
        let _span = tracing::info_span!("Assign merged string offsets").entered();
        let list = self.list.lock().unwrap().clone();
        list.par_iter().for_each(|merged| merged.assign_offsets());
    }
}

/// Returns whether a section's header marks it as mergeable: SHF_MERGE plus either SHF_STRINGS
/// or a fixed entry size that evenly divides the section.
pub(crate) fn is_mergeable(sh_flags: u64, sh_entsize: u64, sh_size: u64) -> bool {
    if sh_flags & object::elf::SHF_MERGE as u64 == 0 {
        return false;
    }
    if sh_flags & object::elf::SHF_STRINGS as u64 != 0 {
        return true;
    }
    sh_entsize > 0 && sh_size % sh_entsize == 0
}

/// Splits the data of a mergeable section into pieces and interns each of them, returning the
/// (start offset, piece) list in input order.
fn split_section<'data>(
    merged: &'data MergedSection<'data>,
    herd: &'data Herd,
    data: &'data [u8],
    is_strings: bool,
    entsize: u64,
    key: u64,
) -> Result<Vec<(u64, &'data StringPiece<'data>)>> {
    let mut pieces = Vec::new();
    let mut offset = 0u64;
    let mut remaining = data;

    if is_strings {
        while !remaining.is_empty() {
            let len = memchr::memchr(0, remaining)
                .map(|i| i + 1)
                .context("string in merge section is not null-terminated")?;
            let (bytes, rest) = remaining.split_at(len);
            pieces.push((offset, merged.insert_piece(herd, bytes, key)));
            offset += len as u64;
            remaining = rest;
        }
    } else {
        let entsize = entsize as usize;
        if entsize == 0 || data.len() % entsize != 0 {
            bail!("merge section size is not a multiple of sh_entsize");
        }
        while !remaining.is_empty() {
            let (bytes, rest) = remaining.split_at(entsize);
            pieces.push((offset, merged.insert_piece(herd, bytes, key)));
            offset += entsize as u64;
            remaining = rest;
        }
    }

    Ok(pieces)
}

/// Phase entry point: splits every mergeable section of every live file, then rewrites the
/// file's symbols and relocations that point into mergeable sections to reference pieces
/// instead, so later phases never need the raw input offsets. Runs after the archive liveness
/// walk so that members that never joined the link contribute no pieces.
pub(crate) fn split_merge_sections<'data>(
    files: &mut [ObjectFile<'data>],
    merged: &MergedSections<'data>,
    herd: &'data Herd,
) -> Result {
    let _span = tracing::info_span!("Split mergeable sections").entered();

    files.par_iter_mut().try_for_each(|file| {
        if !file.is_alive() {
            return Ok(());
        }
        split_file(file, merged, herd).with_context(|| file.display_name())
    })
}

fn split_file<'data>(
    file: &mut ObjectFile<'data>,
    merged: &MergedSections<'data>,
    herd: &'data Herd,
) -> Result {
    let priority = file.priority;

    for index in 0..file.sections.len() {
        let SectionSlot::Loaded(sec) = &file.sections[index] else {
            continue;
        };
        if !is_mergeable(sec.sh_flags, sec.entsize, sec.size) {
            continue;
        }

        let output_name = crate::layout::output_section_name(sec.name);
        let section = merged.get_or_create(output_name, sec.sh_flags, sec.sh_type);
        section.alignment.fetch_max(sec.alignment, Ordering::AcqRel);

        let is_strings = sec.sh_flags & object::elf::SHF_STRINGS as u64 != 0;
        let pieces = split_section(
            section,
            herd,
            sec.data,
            is_strings,
            sec.entsize,
            owner_key(priority, index),
        )
        .with_context(|| {
            format!("while splitting `{}`", String::from_utf8_lossy(sec.name))
        })?;

        file.sections[index] = SectionSlot::Merge(MergeSlot {
            merged: section,
            pieces,
        });
    }

    bind_local_symbols(file)?;
    bind_global_symbols(file)?;
    rewrite_relocations(file)
}

/// Finds the piece containing `offset` within a merge slot.
pub(crate) fn piece_at<'data>(slot: &MergeSlot<'data>, offset: u64) -> Result<PieceRef<'data>> {
    let index = match slot.pieces.binary_search_by_key(&offset, |(start, _)| *start) {
        Ok(i) => i,
        Err(0) => bail!("offset {offset} precedes the first piece"),
        Err(i) => i - 1,
    };
    let (start, piece) = slot.pieces[index];
    if offset > start + piece.data.len() as u64 {
        bail!("offset {offset} is past the end of its piece");
    }
    Ok(PieceRef {
        piece,
        offset: offset - start,
    })
}

fn bind_local_symbols(file: &mut ObjectFile<'_>) -> Result {
    for index in 0..file.locals.len() {
        let Some(section_index) = file.locals[index].section else {
            continue;
        };
        let SectionSlot::Merge(slot) = &file.sections[section_index.0] else {
            continue;
        };
        let piece = piece_at(slot, file.locals[index].value)
            .with_context(|| format!("local symbol {index} points outside its merge section"))?;
        file.locals[index].piece = Some(piece);
    }
    Ok(())
}

/// A global defined inside a mergeable section is addressed through the piece containing it,
/// the same way locals are.
fn bind_global_symbols(file: &ObjectFile<'_>) -> Result {
    for (esym, sym) in file.global_symbols() {
        if esym.is_undefined(LE) {
            continue;
        }
        let Some(section_index) = symbol_section(esym)? else {
            continue;
        };
        let SectionSlot::Merge(slot) = &file.sections[section_index.0] else {
            continue;
        };
        let mut res = sym.lock();
        if res.owner != Owner::File(file.file_id) || res.section != Some(section_index) {
            continue;
        }
        res.piece = Some(piece_at(slot, res.value).with_context(|| {
            format!("symbol `{}` points outside its merge section", sym.name())
        })?);
    }
    Ok(())
}

/// Rewrites every relocation whose target is a local symbol inside a mergeable section into a
/// piece reference, folding the addend into the lookup so the referenced piece is the one that
/// contains the relocated address.
fn rewrite_relocations(file: &mut ObjectFile<'_>) -> Result {
    let first_global = file.first_global;
    let esyms = file.object.symbols.symbols();

    for index in 0..file.sections.len() {
        let SectionSlot::Loaded(sec) = &file.sections[index] else {
            continue;
        };
        if sec.relas.is_empty() {
            continue;
        }

        let mut rel_pieces = Vec::new();
        for (rela_index, rela) in sec.relas.iter().enumerate() {
            let sym_index = rela.r_sym(LE, false) as usize;
            if sym_index == 0 || sym_index >= first_global {
                continue;
            }
            let Some(target_section) = file.locals[sym_index].section else {
                continue;
            };
            let SectionSlot::Merge(slot) = &file.sections[target_section.0] else {
                continue;
            };
            let target = file.locals[sym_index]
                .value
                .wrapping_add(rela.r_addend(LE) as u64);
            let piece = piece_at(slot, target)
                .with_context(|| format!("relocation {rela_index} targets a bad merge offset"))?;
            rel_pieces.push((rela_index as u32, piece));
        }

        if !rel_pieces.is_empty() {
            let SectionSlot::Loaded(sec) = &mut file.sections[index] else {
                unreachable!();
            };
            sec.rel_pieces = rel_pieces;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mergeable_detection() {
        let merge = object::elf::SHF_MERGE as u64;
        let strings = object::elf::SHF_STRINGS as u64;
        assert!(is_mergeable(merge | strings, 1, 13));
        assert!(is_mergeable(merge, 4, 16));
        assert!(!is_mergeable(merge, 4, 15));
        assert!(!is_mergeable(merge, 0, 16));
        assert!(!is_mergeable(strings, 1, 13));
    }

    #[test]
    fn pieces_are_deduplicated_and_ordered() {
        let herd = Herd::new();
        let merged = MergedSections::new(&herd);
        let section = merged.get_or_create(
            b".rodata",
            (object::elf::SHF_ALLOC | object::elf::SHF_MERGE | object::elf::SHF_STRINGS) as u64,
            object::elf::SHT_PROGBITS,
        );

        let a = split_section(section, &herd, b"hello\0zz\0", true, 1, owner_key(2, 1)).unwrap();
        let b = split_section(section, &herd, b"hello\0a\0", true, 1, owner_key(1, 4)).unwrap();

        // "hello\0" from both inputs is the same piece, owned by the lower priority.
        assert!(std::ptr::eq(a[0].1, b[0].1));
        assert_eq!(a[0].1.owning_priority(), 1);

        section.assign_offsets();
        // Sorted by (length, bytes): "a\0" < "zz\0" < "hello\0".
        let pieces = section.pieces();
        let datas: Vec<&[u8]> = pieces.iter().map(|p| p.data).collect();
        assert_eq!(datas, vec![&b"a\0"[..], b"zz\0", b"hello\0"]);
        let offsets: Vec<u64> = pieces
            .iter()
            .map(|p| p.output_offset.load(Ordering::Relaxed))
            .collect();
        assert_eq!(offsets, vec![0, 2, 5]);
        assert_eq!(section.size.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn unterminated_string_section_is_an_error() {
        let herd = Herd::new();
        let merged = MergedSections::new(&herd);
        let section = merged.get_or_create(b".rodata", 0, object::elf::SHT_PROGBITS);
        assert!(split_section(section, &herd, b"no terminator", true, 1, 0).is_err());
    }
}
