//! Writes the output file. Layout has already fixed every offset, address and table index, so
//! this phase is pure data movement: the output buffer is split into disjoint per-chunk slices
//! which are then filled in parallel, applying relocations as section bytes are copied.

use crate::args::Args;
use crate::bail;
use crate::elf;
use crate::elf::LE;
use crate::error::Context as _;
use crate::error::Result;
use crate::layout::ChunkKind;
use crate::layout::GotEntry;
use crate::layout::Layout;
use crate::layout::OutputChunk;
use crate::layout::Prelude;
use crate::layout::emittable_locals;
use crate::layout::live_loaded_sections;
use crate::layout::owned_globals;
use crate::parsing::LocalSymbol;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::symbol::NEEDS_GOT;
use crate::symbol::NEEDS_GOTTP;
use crate::symbol::Symbol;
use crate::x86_64;
use crate::x86_64::RelocationTarget;
use memmap2::MmapMut;
use object::read::elf::Rela as _;
use rayon::prelude::*;
use std::sync::atomic::Ordering;

pub(crate) const INTERP: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

pub(crate) fn write<'data>(
    args: &Args,
    layout: &Layout<'data>,
    files: &[ObjectFile<'data>],
    prelude: &Prelude<'data>,
) -> Result {
    let _span = tracing::info_span!("Write output file").entered();

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.output)
        .with_context(|| format!("Failed to create output file `{}`", args.output.display()))?;
    file.set_len(layout.file_size)?;
    // Safety: no other process is expected to modify the file while we're writing it.
    let mut buffer = unsafe { MmapMut::map_mut(&file) }
        .with_context(|| format!("Failed to map output file `{}`", args.output.display()))?;

    write_chunks(&mut buffer, layout, files, prelude)?;

    buffer.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&args.output, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Removes `prefix` elements from `data` and returns them.
fn take_prefix_mut<'t>(data: &mut &'t mut [u8], prefix: usize) -> &'t mut [u8] {
    data.split_off_mut(..prefix).unwrap_or_else(|| {
        panic!(
            "attempted to take {prefix} bytes when only {len} available",
            len = data.len()
        )
    })
}

fn write_chunks<'data>(
    buffer: &mut [u8],
    layout: &Layout<'data>,
    files: &[ObjectFile<'data>],
    prelude: &Prelude<'data>,
) -> Result {
    // Chunk offsets ascend in list order, so we can partition the buffer with a single pass.
    // Chunks without file presence (NOBITS) are skipped.
    let mut rest = buffer;
    let mut position = 0u64;
    let mut jobs = Vec::with_capacity(layout.chunks.len());
    for (index, chunk) in layout.chunks.iter().enumerate() {
        let file_size = Layout::chunk_file_size(chunk);
        if file_size == 0 {
            continue;
        }
        take_prefix_mut(&mut rest, (chunk.offset - position) as usize);
        let out = take_prefix_mut(&mut rest, file_size as usize);
        jobs.push((index, out));
        position = chunk.offset + file_size;
    }

    jobs.into_par_iter().try_for_each(|(index, out)| {
        let chunk = &layout.chunks[index];
        write_chunk(chunk, out, layout, files, prelude).with_context(|| {
            format!(
                "while writing section `{}`",
                String::from_utf8_lossy(chunk.name)
            )
        })
    })
}

fn write_chunk<'data>(
    chunk: &OutputChunk<'data>,
    out: &mut [u8],
    layout: &Layout<'data>,
    files: &[ObjectFile<'data>],
    prelude: &Prelude<'data>,
) -> Result {
    match &chunk.kind {
        ChunkKind::Ehdr => write_ehdr(out, layout),
        ChunkKind::ProgramHeaders => write_phdrs(out, layout),
        ChunkKind::SectionHeaders => write_shdrs(out, layout),
        ChunkKind::Interp => {
            out.copy_from_slice(INTERP);
            Ok(())
        }
        ChunkKind::Section { members } => write_section(chunk, members, out, layout, files),
        ChunkKind::Merged(section) => {
            for piece in section.pieces().iter() {
                let offset = piece.output_offset.load(Ordering::Acquire) as usize;
                out[offset..offset + piece.data.len()].copy_from_slice(piece.data);
            }
            Ok(())
        }
        ChunkKind::Got => write_got(out, layout),
        ChunkKind::GotPlt => write_gotplt(out, layout),
        ChunkKind::Plt => write_plt(out, layout),
        ChunkKind::RelaPlt => write_relplt(out, layout),
        ChunkKind::Symtab => write_symtab(out, layout, files, prelude),
        ChunkKind::Strtab => {
            debug_assert_eq!(out.len() as u32, layout.strtab_size);
            write_strtab(out, files, prelude);
            Ok(())
        }
        ChunkKind::Shstrtab => {
            out.copy_from_slice(&layout.shstrtab);
            Ok(())
        }
    }
}

fn write_ehdr(out: &mut [u8], layout: &Layout) -> Result {
    let (ehdr, _) = object::from_bytes_mut::<elf::FileHeader>(out)
        .map_err(|()| anyhow::anyhow!("misaligned ELF header"))?;

    ehdr.e_ident = object::elf::Ident {
        magic: object::elf::ELFMAG,
        class: object::elf::ELFCLASS64,
        data: object::elf::ELFDATA2LSB,
        version: object::elf::EV_CURRENT,
        os_abi: object::elf::ELFOSABI_SYSV,
        abi_version: 0,
        padding: [0; 7],
    };
    ehdr.e_type.set(LE, object::elf::ET_EXEC);
    ehdr.e_machine.set(LE, object::elf::EM_X86_64);
    ehdr.e_version.set(LE, u32::from(object::elf::EV_CURRENT));
    ehdr.e_entry.set(LE, layout.entry);
    ehdr.e_phoff.set(LE, layout.chunks[layout.phdr_index].offset);
    ehdr.e_shoff.set(LE, layout.chunks[layout.shdr_index].offset);
    ehdr.e_flags.set(LE, 0);
    ehdr.e_ehsize.set(LE, elf::EHDR_SIZE as u16);
    ehdr.e_phentsize.set(LE, elf::PHDR_ENTRY_SIZE as u16);
    ehdr.e_phnum.set(LE, layout.segments.len() as u16);
    ehdr.e_shentsize.set(LE, elf::SHDR_ENTRY_SIZE as u16);
    let num_sections = layout.chunks[layout.shdr_index].size / elf::SHDR_ENTRY_SIZE;
    ehdr.e_shnum.set(LE, num_sections as u16);
    let shstrndx = layout
        .chunks
        .iter()
        .find(|c| matches!(c.kind, ChunkKind::Shstrtab))
        .map_or(0, |c| c.shndx);
    ehdr.e_shstrndx.set(LE, shstrndx as u16);
    Ok(())
}

fn write_phdrs(out: &mut [u8], layout: &Layout) -> Result {
    let phdrs = object::slice_from_all_bytes_mut::<elf::ProgramHeader>(out)
        .map_err(|()| anyhow::anyhow!("misaligned program header table"))?;
    for (phdr, segment) in phdrs.iter_mut().zip(&layout.segments) {
        phdr.p_type.set(LE, segment.p_type);
        phdr.p_flags.set(LE, segment.p_flags);
        phdr.p_offset.set(LE, segment.offset);
        phdr.p_vaddr.set(LE, segment.vaddr);
        phdr.p_paddr.set(LE, segment.vaddr);
        phdr.p_filesz.set(LE, segment.filesz);
        phdr.p_memsz.set(LE, segment.memsz);
        phdr.p_align.set(LE, segment.align);
    }
    Ok(())
}

fn write_shdrs(out: &mut [u8], layout: &Layout) -> Result {
    let shdrs = object::slice_from_all_bytes_mut::<elf::SectionHeader>(out)
        .map_err(|()| anyhow::anyhow!("misaligned section header table"))?;
    // Row 0 stays zeroed (SHN_UNDEF).
    for chunk in &layout.chunks {
        if chunk.shndx == 0 {
            continue;
        }
        let shdr = &mut shdrs[chunk.shndx as usize];
        shdr.sh_name.set(LE, chunk.name_offset);
        shdr.sh_type.set(LE, chunk.sh_type);
        shdr.sh_flags.set(LE, chunk.sh_flags);
        shdr.sh_addr.set(LE, chunk.address);
        shdr.sh_offset.set(LE, chunk.offset);
        shdr.sh_size.set(LE, chunk.size);
        shdr.sh_link.set(LE, chunk.sh_link);
        shdr.sh_info.set(LE, chunk.sh_info);
        shdr.sh_addralign.set(LE, chunk.alignment);
        shdr.sh_entsize.set(LE, chunk.sh_entsize);
    }
    Ok(())
}

fn write_section<'data>(
    chunk: &OutputChunk<'data>,
    members: &[(crate::parsing::FileId, object::SectionIndex)],
    out: &mut [u8],
    layout: &Layout<'data>,
    files: &[ObjectFile<'data>],
) -> Result {
    for &(file_id, section_index) in members {
        let file = &files[file_id.as_usize()];
        let SectionSlot::Loaded(sec) = &file.sections[section_index.0] else {
            unreachable!();
        };

        let start = sec.offset as usize;
        out[start..start + sec.data.len()].copy_from_slice(sec.data);

        for (rela_index, rela) in sec.relas.iter().enumerate() {
            let r_type = rela.r_type(LE, false);
            let r_offset = rela.r_offset(LE);
            let place = chunk.address + sec.offset + r_offset;

            let (target, addend) =
                resolve_relocation_target(file, layout, sec, rela_index, rela)?;

            let Some(field) = out.get_mut((sec.offset + r_offset) as usize..) else {
                bail!("relocation offset {r_offset:#x} is outside its section");
            };
            x86_64::apply_relocation(field, r_type, &target, addend, place, layout.tls_end)
                .with_context(|| {
                    format!(
                        "in `{}` section `{}`",
                        file.display_name(),
                        String::from_utf8_lossy(sec.name)
                    )
                })?;
        }
    }
    Ok(())
}

fn resolve_relocation_target<'data>(
    file: &ObjectFile<'data>,
    layout: &Layout<'data>,
    sec: &crate::parsing::InputSection<'data>,
    rela_index: usize,
    rela: &elf::Rela,
) -> Result<(RelocationTarget, i64)> {
    let addend = rela.r_addend(LE);
    let sym_index = rela.r_sym(LE, false) as usize;

    if sym_index >= file.first_global {
        let Some(&sym) = file.globals.get(sym_index - file.first_global) else {
            bail!("relocation references out-of-range symbol {sym_index}");
        };
        return Ok((global_target(sym, layout), addend));
    }

    // Relocations against locals in mergeable sections were rewritten into piece references
    // with the addend already folded in.
    if let Ok(position) = sec
        .rel_pieces
        .binary_search_by_key(&(rela_index as u32), |(index, _)| *index)
    {
        let piece_ref = &sec.rel_pieces[position].1;
        let target = RelocationTarget {
            address: piece_ref.address(),
            ..Default::default()
        };
        return Ok((target, 0));
    }

    let local = &file.locals[sym_index];
    let target = RelocationTarget {
        address: local_address(file, layout, local)?,
        ..Default::default()
    };
    Ok((target, addend))
}

fn global_target<'data>(sym: &Symbol<'data>, layout: &Layout<'data>) -> RelocationTarget {
    let needs = sym.needs();
    RelocationTarget {
        address: sym.address.load(Ordering::Acquire),
        plt_address: sym.needs_plt().then(|| {
            layout.chunk_addr(layout.plt_index) + u64::from(sym.plt_offset.load(Ordering::Acquire))
        }),
        got_address: (needs & NEEDS_GOT != 0).then(|| {
            layout.chunk_addr(layout.got_index) + u64::from(sym.got_offset.load(Ordering::Acquire))
        }),
        gottp_address: (needs & NEEDS_GOTTP != 0).then(|| {
            layout.chunk_addr(layout.got_index)
                + u64::from(sym.gottp_offset.load(Ordering::Acquire))
        }),
        undef_weak: sym.is_undef_weak(),
    }
}

fn local_address<'data>(
    file: &ObjectFile<'data>,
    layout: &Layout<'data>,
    local: &LocalSymbol<'data>,
) -> Result<u64> {
    if let Some(piece) = &local.piece {
        return Ok(piece.address());
    }
    let Some(section_index) = local.section else {
        return Ok(local.value);
    };
    match &file.sections[section_index.0] {
        SectionSlot::Loaded(sec) => {
            let chunk = &layout.chunks[sec.output_chunk as usize];
            Ok(chunk.address + sec.offset + local.value)
        }
        SectionSlot::Discard => Ok(0),
        SectionSlot::Merge(_) => {
            bail!("local symbol in merge section was not rewritten to a piece")
        }
    }
}

fn write_got(out: &mut [u8], layout: &Layout) -> Result {
    for entry in &layout.got_entries {
        let (offset, value) = match entry {
            GotEntry::Address(offset, sym) => (*offset, sym.address.load(Ordering::Acquire)),
            GotEntry::TpOff(offset, sym) => (
                *offset,
                sym.address
                    .load(Ordering::Acquire)
                    .wrapping_sub(layout.tls_end),
            ),
        };
        out[offset as usize..offset as usize + 8].copy_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

/// GOTPLT slots hold the final resolved addresses: everything is bound at link time, so there is
/// no lazy-resolution round trip.
fn write_gotplt(out: &mut [u8], layout: &Layout) -> Result {
    for sym in &layout.plt_symbols {
        let offset = sym.gotplt_offset.load(Ordering::Acquire) as usize;
        let value = sym.address.load(Ordering::Acquire);
        out[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

fn write_plt(out: &mut [u8], layout: &Layout) -> Result {
    let plt_base = layout.chunk_addr(layout.plt_index);
    let gotplt_base = layout.chunk_addr(layout.gotplt_index);
    for sym in &layout.plt_symbols {
        let plt_offset = sym.plt_offset.load(Ordering::Acquire);
        let entry = &mut out[plt_offset as usize..(plt_offset + elf::PLT_ENTRY_SIZE as u32) as usize];
        x86_64::write_plt_entry(
            entry,
            gotplt_base + u64::from(sym.gotplt_offset.load(Ordering::Acquire)),
            plt_base + u64::from(plt_offset),
        )?;
    }
    Ok(())
}

fn write_relplt(out: &mut [u8], layout: &Layout) -> Result {
    let relas = object::slice_from_all_bytes_mut::<elf::Rela>(out)
        .map_err(|()| anyhow::anyhow!("misaligned .rela.plt"))?;
    let gotplt_base = layout.chunk_addr(layout.gotplt_index);
    for (rela, sym) in relas.iter_mut().zip(&layout.plt_symbols) {
        rela.r_offset.set(
            LE,
            gotplt_base + u64::from(sym.gotplt_offset.load(Ordering::Acquire)),
        );
        let info = (u64::from(sym.symtab_index.load(Ordering::Acquire)) << 32)
            | u64::from(object::elf::R_X86_64_JUMP_SLOT);
        rela.r_info.set(LE, info);
        rela.r_addend.set(LE, 0);
    }
    Ok(())
}

fn write_symtab<'data>(
    out: &mut [u8],
    layout: &Layout<'data>,
    files: &[ObjectFile<'data>],
    prelude: &Prelude<'data>,
) -> Result {
    let rows = object::slice_from_all_bytes_mut::<elf::Sym>(out)
        .map_err(|()| anyhow::anyhow!("misaligned .symtab"))?;
    debug_assert_eq!(rows.len() as u32, layout.num_symtab_entries);
    debug_assert_eq!(prelude.symtab_base, layout.first_global_row);
    // Row 0 stays zeroed: the undefined symbol.

    for file in files {
        if !file.is_alive() {
            continue;
        }

        let mut row = file.local_symtab_base as usize;
        let mut name_offset = file.local_strtab_base;
        for local in emittable_locals(file) {
            let entry = &mut rows[row];
            entry.st_name.set(LE, name_offset);
            entry.st_info = (object::elf::STB_LOCAL << 4) | (local.sym_type & 0xf);
            let (address, shndx) = local_symtab_placement(file, layout, local);
            entry.st_shndx.set(LE, shndx);
            entry.st_value.set(LE, address);
            entry.st_size.set(LE, local.size);
            name_offset += local.name.len() as u32 + 1;
            row += 1;
        }
        for (_, sec) in live_loaded_sections(file) {
            let chunk = &layout.chunks[sec.output_chunk as usize];
            let entry = &mut rows[row];
            entry.st_info = object::elf::STT_SECTION;
            entry.st_shndx.set(LE, chunk.shndx as u16);
            entry.st_value.set(LE, chunk.address + sec.offset);
            row += 1;
        }

        let mut row = file.global_symtab_base as usize;
        let mut name_offset = file.global_strtab_base;
        for sym in owned_globals(file) {
            let res = sym.resolution();
            let entry = &mut rows[row];
            entry.st_name.set(LE, name_offset);
            let bind = if res.strength == crate::elf::SymbolStrength::Weak {
                object::elf::STB_WEAK
            } else {
                object::elf::STB_GLOBAL
            };
            entry.st_info = (bind << 4) | (res.sym_type & 0xf);
            entry.st_other = res.visibility;
            entry
                .st_shndx
                .set(LE, sym.shndx.load(Ordering::Acquire) as u16);
            entry.st_value.set(LE, sym.address.load(Ordering::Acquire));
            entry.st_size.set(LE, res.size);
            name_offset += sym.name_bytes().len() as u32 + 1;
            row += 1;
        }
    }

    let mut row = prelude.symtab_base as usize;
    let mut name_offset = prelude.strtab_base;
    for def in prelude.owned_symbols() {
        let sym = def.symbol;
        let entry = &mut rows[row];
        entry.st_name.set(LE, name_offset);
        entry.st_info = object::elf::STB_GLOBAL << 4;
        entry
            .st_shndx
            .set(LE, sym.shndx.load(Ordering::Acquire) as u16);
        entry.st_value.set(LE, sym.address.load(Ordering::Acquire));
        name_offset += sym.name_bytes().len() as u32 + 1;
        row += 1;
    }

    Ok(())
}

fn local_symtab_placement<'data>(
    file: &ObjectFile<'data>,
    layout: &Layout<'data>,
    local: &LocalSymbol<'data>,
) -> (u64, u16) {
    if let Some(piece) = &local.piece {
        return (
            piece.address(),
            piece.piece.merged.shndx.load(Ordering::Acquire) as u16,
        );
    }
    match local.section {
        None => (local.value, object::elf::SHN_ABS),
        Some(section_index) => match &file.sections[section_index.0] {
            SectionSlot::Loaded(sec) => {
                let chunk = &layout.chunks[sec.output_chunk as usize];
                (chunk.address + sec.offset + local.value, chunk.shndx as u16)
            }
            _ => (0, object::elf::SHN_UNDEF),
        },
    }
}

fn write_strtab<'data>(out: &mut [u8], files: &[ObjectFile<'data>], prelude: &Prelude<'data>) {
    // Byte 0 stays zero: the empty name.
    for file in files {
        if !file.is_alive() {
            continue;
        }
        write_names(
            out,
            file.local_strtab_base as usize,
            emittable_locals(file).map(|l| l.name),
        );
        write_names(
            out,
            file.global_strtab_base as usize,
            owned_globals(file).map(|s| s.name_bytes()),
        );
    }
    write_names(
        out,
        prelude.strtab_base as usize,
        prelude.owned_symbols().map(|d| d.symbol.name_bytes()),
    );
}

fn write_names<'a>(out: &mut [u8], mut offset: usize, names: impl Iterator<Item = &'a [u8]>) {
    for name in names {
        out[offset..offset + name.len()].copy_from_slice(name);
        offset += name.len() + 1;
    }
}
