//! Code to read `ar` archives. We don't use the ar crate because it provides access to member
//! data only via the Read trait and we want to borrow the bytes of each member for the lifetime
//! of the link.

use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use bytemuck::Pod;
use bytemuck::Zeroable;

pub(crate) enum ArchiveEntry<'data> {
    /// The archive's own symbol index. We ignore it and use the symbol tables of the individual
    /// members instead.
    Ignored,
    Regular(ArchiveMember<'data>),
    Filenames(ExtendedFilenames<'data>),
}

#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

pub(crate) struct ArchiveMember<'data> {
    ident: &'data str,
    pub(crate) data: &'data [u8],
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct MemberHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const HEADER_SIZE: usize = size_of::<MemberHeader>();

const _ASSERTS: () = {
    assert!(HEADER_SIZE == 60);
};

impl<'data> ArchiveIterator<'data> {
    /// Creates an iterator from the bytes of the whole archive, including the magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        if data.starts_with(&object::archive::THIN_MAGIC) {
            bail!("thin archives are not supported");
        }
        let Some(data) = data.strip_prefix(&object::archive::MAGIC) else {
            bail!("missing archive magic");
        };
        Ok(Self { data })
    }

    fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < HEADER_SIZE {
            bail!("short member header");
        }
        let (header, rest) = self.data.split_at(HEADER_SIZE);
        let header: &MemberHeader = bytemuck::from_bytes(header);

        let size_str = std::str::from_utf8(&header.size)
            .context("member size is invalid UTF-8")?
            .trim_end();
        let size: usize = size_str
            .parse()
            .with_context(|| format!("invalid member size `{size_str}`"))?;
        if rest.len() < size {
            bail!("member size is {size}, but only {} bytes left", rest.len());
        }

        let ident = std::str::from_utf8(&header.ident)
            .context("member identifier is invalid UTF-8")?
            .trim_end();
        let entry = match ident {
            "/" => ArchiveEntry::Ignored,
            "//" => ArchiveEntry::Filenames(ExtendedFilenames { data: &rest[..size] }),
            _ => ArchiveEntry::Regular(ArchiveMember {
                ident,
                data: &rest[..size],
            }),
        };

        // Member data is padded to an even offset.
        let advance = size.next_multiple_of(2).min(rest.len());
        self.data = &rest[advance..];
        Ok(Some(entry))
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl<'data> ArchiveMember<'data> {
    /// Returns the member's filename. Short names are stored inline terminated by '/'; longer
    /// names are offsets into the extended filenames member.
    pub(crate) fn identifier(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> &'data [u8] {
        if let Some(filenames) = extended_filenames {
            if let Some(rest) = self.ident.strip_prefix('/') {
                if let Ok(offset) = rest.trim_end_matches('/').parse::<usize>() {
                    let names = &filenames.data[offset.min(filenames.data.len())..];
                    // Each name in the extended filenames member ends with "/\n".
                    let end = memchr::memchr(b'\n', names).unwrap_or(names.len());
                    return names[..end].strip_suffix(b"/").unwrap_or(&names[..end]);
                }
            }
        }
        self.ident
            .strip_suffix('/')
            .unwrap_or(self.ident)
            .as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&object::archive::MAGIC);
        for (name, data) in members {
            out.extend_from_slice(format!("{name:<16}").as_bytes());
            out.extend_from_slice(format!("{:<12}", 0).as_bytes());
            out.extend_from_slice(format!("{:<6}", 0).as_bytes());
            out.extend_from_slice(format!("{:<6}", 0).as_bytes());
            out.extend_from_slice(format!("{:<8}", "644").as_bytes());
            out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
            out.extend_from_slice(b"`\n");
            out.extend_from_slice(data);
            if data.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn iterates_regular_members() {
        let data = fake_archive(&[("a.o/", b"hello"), ("b.o/", b"world!")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&data)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let names: Vec<&[u8]> = entries
            .iter()
            .filter_map(|e| match e {
                ArchiveEntry::Regular(m) => Some(m.identifier(None)),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec![&b"a.o"[..], b"b.o"]);
    }

    #[test]
    fn skips_symbol_table_and_resolves_long_names() {
        let data = fake_archive(&[
            ("/", b"\0\0\0\0"),
            ("//", b"very_long_member_name.o/\n"),
            ("/0", b"bytes"),
        ]);
        let mut filenames = None;
        let mut members = Vec::new();
        for entry in ArchiveIterator::from_archive_bytes(&data).unwrap() {
            match entry.unwrap() {
                ArchiveEntry::Ignored => {}
                ArchiveEntry::Filenames(f) => filenames = Some(f),
                ArchiveEntry::Regular(m) => members.push(m),
            }
        }
        assert_eq!(members.len(), 1);
        assert_eq!(
            members[0].identifier(filenames),
            b"very_long_member_name.o"
        );
    }

    #[test]
    fn rejects_thin_archives() {
        let mut data = Vec::new();
        data.extend_from_slice(&object::archive::THIN_MAGIC);
        assert!(ArchiveIterator::from_archive_bytes(&data).is_err());
    }
}
