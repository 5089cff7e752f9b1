//! Typed views over the raw bytes of ELF relocatable objects. We work directly with the
//! little-endian structs from the `object` crate rather than its higher level API, since we want
//! zero-copy access to section tables, symbol tables and relocation arrays.

use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type Sym = object::elf::Sym64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;

pub(crate) type SectionTable<'data> = object::read::elf::SectionTable<'data, FileHeader>;
pub(crate) type SymbolTable<'data> = object::read::elf::SymbolTable<'data, FileHeader>;

pub(crate) const LE: LittleEndian = LittleEndian;

pub(crate) const EHDR_SIZE: u64 = size_of::<FileHeader>() as u64;
pub(crate) const PHDR_ENTRY_SIZE: u64 = size_of::<ProgramHeader>() as u64;
pub(crate) const SHDR_ENTRY_SIZE: u64 = size_of::<SectionHeader>() as u64;
pub(crate) const SYMTAB_ENTRY_SIZE: u64 = size_of::<Sym>() as u64;
pub(crate) const RELA_ENTRY_SIZE: u64 = size_of::<Rela>() as u64;

pub(crate) const PLT_ENTRY_SIZE: u64 = 16;
pub(crate) const GOT_ENTRY_SIZE: u64 = 8;
pub(crate) const PAGE_SIZE: u64 = 0x1000;
pub(crate) const IMAGE_BASE: u64 = 0x400_000;

/// A parsed relocatable object. Borrows the (memory mapped) bytes of the input for the lifetime
/// of the link.
#[derive(Debug)]
pub(crate) struct File<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) sections: SectionTable<'data>,
    pub(crate) symbols: SymbolTable<'data>,

    /// Relocations for each section, indexed by the target section (`sh_info` of the SHT_RELA
    /// section). Empty for sections without relocations.
    pub(crate) relocations: Vec<&'data [Rela]>,

    /// Index of the first non-local symbol (`sh_info` of the symbol table).
    pub(crate) first_global: usize,
}

/// Decoded SHT_GROUP descriptor.
pub(crate) struct GroupDescriptor<'data> {
    pub(crate) signature: &'data [u8],
    pub(crate) descriptor_index: object::SectionIndex,
    pub(crate) members: Vec<object::SectionIndex>,
}

impl<'data> File<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<Self> {
        if !data.starts_with(&object::elf::ELFMAG) {
            bail!("not an ELF file (bad magic)");
        }
        if data.len() < size_of::<FileHeader>() {
            bail!("truncated ELF header");
        }
        const EI_CLASS: usize = 4;
        const EI_DATA: usize = 5;
        if data[EI_CLASS] != object::elf::ELFCLASS64 {
            bail!("unsupported ELF class (only 64-bit is supported)");
        }
        if data[EI_DATA] != object::elf::ELFDATA2LSB {
            bail!("unsupported ELF endianness (only little-endian is supported)");
        }

        let header = FileHeader::parse(data).context("invalid ELF header")?;
        let e_machine = header.e_machine(LE);
        if e_machine != object::elf::EM_X86_64 {
            bail!("unsupported ELF machine {e_machine} (only x86-64 is supported)");
        }
        if header.e_type(LE) != object::elf::ET_REL {
            bail!("not a relocatable object file");
        }

        let sections = header
            .sections(LE, data)
            .context("section table is out of range")?;

        let mut symbols = SymbolTable::default();
        let mut relocations: Vec<&'data [Rela]> = vec![&[]; sections.len()];
        let mut first_global = 0;

        for (section_index, section) in sections.enumerate() {
            match section.sh_type(LE) {
                object::elf::SHT_SYMTAB => {
                    symbols = SymbolTable::parse(LE, data, &sections, section_index, section)
                        .context("invalid symbol table")?;
                    first_global = section.sh_info(LE) as usize;
                }
                object::elf::SHT_RELA => {
                    let target = section.sh_info(LE) as usize;
                    if target >= sections.len() {
                        bail!("relocation section targets out-of-range section {target}");
                    }
                    let relas: &'data [Rela] = section
                        .data_as_array(LE, data)
                        .context("invalid relocation table")?;
                    relocations[target] = relas;
                }
                object::elf::SHT_REL => {
                    bail!("REL-format relocations are not supported on x86-64");
                }
                _ => {}
            }
        }

        Ok(Self {
            data,
            sections,
            symbols,
            relocations,
            first_global,
        })
    }

    pub(crate) fn section_name(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        Ok(self.sections.section_name(LE, section)?)
    }

    /// Returns the bytes of a section, or an empty slice for SHT_NOBITS.
    pub(crate) fn section_data(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        if section.sh_type(LE) == object::elf::SHT_NOBITS {
            return Ok(&[]);
        }
        Ok(section.data(LE, self.data)?)
    }

    pub(crate) fn symbol_name(&self, sym: &Sym) -> Result<&'data [u8]> {
        Ok(self.symbols.symbol_name(LE, sym)?)
    }

    /// Decodes an SHT_GROUP section. Returns `None` for groups without the COMDAT flag.
    pub(crate) fn parse_group(
        &self,
        descriptor_index: object::SectionIndex,
        section: &SectionHeader,
    ) -> Result<Option<GroupDescriptor<'data>>> {
        let entries: &[object::U32Bytes<LittleEndian>] = section
            .data_as_array(LE, self.data)
            .context("invalid section group")?;
        let Some((flags, members)) = entries.split_first() else {
            bail!("empty section group");
        };
        if flags.get(LE) & object::elf::GRP_COMDAT == 0 {
            return Ok(None);
        }

        // The group's signature symbol is identified by sh_info; sh_link names the symtab, which
        // for relocatable objects is the one we've already parsed.
        let signature_sym = self
            .symbols
            .symbol(object::SymbolIndex(section.sh_info(LE) as usize))
            .context("invalid section group signature")?;
        let signature = self.symbol_name(signature_sym)?;

        let members = members
            .iter()
            .map(|m| object::SectionIndex(m.get(LE) as usize))
            .collect();

        Ok(Some(GroupDescriptor {
            signature,
            descriptor_index,
            members,
        }))
    }
}

pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value.next_multiple_of(alignment)
}

/// Symbol strength for resolution purposes. The ordering matters: stronger definitions displace
/// weaker ones, and within equal strength the lower-priority file wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SymbolStrength {
    Undefined,
    /// The definition comes from an archive member that hasn't been made live, so it only
    /// records availability: any real definition displaces it.
    Placeholder,
    Weak,
    Common,
    Strong,
}

impl SymbolStrength {
    pub(crate) fn of(sym: &Sym, file_is_alive: bool) -> SymbolStrength {
        if sym.is_undefined(LE) {
            SymbolStrength::Undefined
        } else if !file_is_alive {
            SymbolStrength::Placeholder
        } else if sym.st_bind() == object::elf::STB_WEAK {
            SymbolStrength::Weak
        } else if sym.st_shndx(LE) == object::elf::SHN_COMMON {
            SymbolStrength::Common
        } else {
            SymbolStrength::Strong
        }
    }

    pub(crate) fn is_defined(self) -> bool {
        self > SymbolStrength::Placeholder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let error = File::parse(b"not an elf file").unwrap_err();
        assert!(error.to_string().contains("bad magic"));
    }

    #[test]
    fn rejects_truncated_header() {
        let mut data = [0u8; 20];
        data[..4].copy_from_slice(&object::elf::ELFMAG);
        data[4] = object::elf::ELFCLASS64;
        data[5] = object::elf::ELFDATA2LSB;
        assert!(File::parse(&data).is_err());
    }

    #[test]
    fn strength_ordering() {
        use SymbolStrength as S;
        assert!(S::Strong > S::Common);
        assert!(S::Common > S::Weak);
        assert!(S::Weak > S::Placeholder);
        assert!(S::Placeholder > S::Undefined);
    }
}
