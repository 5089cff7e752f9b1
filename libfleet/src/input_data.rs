//! Code for figuring out what input files we need to read, mapping them into memory and
//! enumerating the objects they contain. Each object that enters the link is assigned a
//! monotonically increasing priority at this point: command-line objects come first, archive
//! members follow in archive order. Lower priorities win resolution ties later on.

use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::args;
use crate::args::Args;
use crate::args::Input;
use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use memmap2::Mmap;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct InputData {
    files: Vec<InputFile>,
}

pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    bytes: Mmap,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    Archive,
}

/// One relocatable object that will take part in the link, either a whole file or an archive
/// member.
pub(crate) struct InputBytes<'data> {
    pub(crate) filename: &'data Path,
    pub(crate) archive_entry: Option<&'data [u8]>,
    pub(crate) data: &'data [u8],
    pub(crate) in_archive: bool,
}

impl FileKind {
    fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            Ok(FileKind::Archive)
        } else if bytes.starts_with(&object::archive::THIN_MAGIC) {
            bail!("thin archives are not supported");
        } else if bytes.starts_with(&object::elf::ELFMAG) {
            Ok(FileKind::ElfObject)
        } else {
            bail!("couldn't identify file type");
        }
    }
}

impl InputData {
    pub(crate) fn from_args(args: &Args) -> Result<InputData> {
        let _span = tracing::info_span!("Open input files").entered();

        let mut files = Vec::with_capacity(args.inputs.len());
        for input in &args.inputs {
            let path = match input {
                Input::File(path) => path.clone(),
                Input::Lib(name) => args::search_for_lib(args, name)?,
            };
            files.push(InputFile::open(&path)?);
        }
        Ok(InputData { files })
    }

    /// Enumerates every object taking part in the link, in priority order.
    pub(crate) fn objects(&self) -> Result<Vec<InputBytes<'_>>> {
        let mut objects = Vec::new();
        for file in &self.files {
            match file.kind {
                FileKind::ElfObject => objects.push(InputBytes {
                    filename: &file.filename,
                    archive_entry: None,
                    data: &file.bytes,
                    in_archive: false,
                }),
                FileKind::Archive => {
                    file.enumerate_members(&mut objects).with_context(|| {
                        format!("while reading `{}`", file.filename.display())
                    })?;
                }
            }
        }
        Ok(objects)
    }
}

impl InputFile {
    fn open(path: &Path) -> Result<InputFile> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;
        // Safety: We rely on our input files not being modified while we're running. This is the
        // same assumption every linker makes; changing an input mid-link gives undefined results
        // regardless.
        let bytes = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to map input file `{}`", path.display()))?;
        let kind = FileKind::identify_bytes(&bytes)
            .with_context(|| format!("while reading `{}`", path.display()))?;
        Ok(InputFile {
            filename: path.to_owned(),
            kind,
            bytes,
        })
    }

    fn enumerate_members<'data>(
        &'data self,
        objects: &mut Vec<InputBytes<'data>>,
    ) -> Result {
        let mut extended_filenames = None;
        for entry in ArchiveIterator::from_archive_bytes(&self.bytes)? {
            match entry? {
                ArchiveEntry::Ignored => {}
                ArchiveEntry::Filenames(f) => extended_filenames = Some(f),
                ArchiveEntry::Regular(member) => {
                    objects.push(InputBytes {
                        filename: &self.filename,
                        archive_entry: Some(member.identifier(extended_filenames)),
                        data: member.data,
                        in_archive: true,
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for InputBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            args::display_input(self.filename, self.archive_entry)
        )
    }
}
