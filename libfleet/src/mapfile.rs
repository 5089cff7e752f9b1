//! Writes a link map to stdout when `--print-map` is supplied: each output section with its
//! address, size and alignment, followed by the input sections placed into it.

use crate::layout::ChunkKind;
use crate::layout::Layout;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;

pub(crate) fn print_map(layout: &Layout<'_>, files: &[ObjectFile<'_>]) {
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    let _ = write_map(&mut out, layout, files);
}

fn write_map(
    out: &mut impl std::io::Write,
    layout: &Layout<'_>,
    files: &[ObjectFile<'_>],
) -> std::io::Result<()> {
    writeln!(out, "{:>16} {:>10} {:>6} name", "address", "size", "align")?;
    for chunk in &layout.chunks {
        if chunk.shndx == 0 {
            continue;
        }
        writeln!(
            out,
            "{:>16x} {:>10x} {:>6} {}",
            chunk.address,
            chunk.size,
            chunk.alignment,
            String::from_utf8_lossy(chunk.name)
        )?;
        let ChunkKind::Section { members } = &chunk.kind else {
            continue;
        };
        for &(file_id, section_index) in members {
            let file = &files[file_id.as_usize()];
            let SectionSlot::Loaded(sec) = &file.sections[section_index.0] else {
                continue;
            };
            writeln!(
                out,
                "{:>16x} {:>10x} {:>6} {:8} {}",
                chunk.address + sec.offset,
                sec.size,
                sec.alignment,
                "",
                file.display_name()
            )?;
        }
    }
    out.flush()
}
