//! End-to-end tests: build small relocatable objects in memory, link them, then pick apart the
//! resulting executable.

use object::write::Object;
use object::write::Relocation;
use object::write::Symbol;
use object::write::SymbolSection;
use object::RelocationFlags;
use object::SectionKind;
use object::SymbolFlags;
use object::SymbolKind;
use object::SymbolScope;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

fn new_object() -> Object<'static> {
    Object::new(
        object::BinaryFormat::Elf,
        object::Architecture::X86_64,
        object::Endianness::Little,
    )
}

fn global(name: &str, value: u64, size: u64, section: object::write::SectionId) -> Symbol {
    Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::None,
    }
}

fn undefined(name: &str) -> Symbol {
    Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    }
}

/// A temp directory for one test's inputs and output.
struct TestDir {
    path: PathBuf,
}

static NEXT_TEST_DIR: AtomicU32 = AtomicU32::new(0);

impl TestDir {
    fn new(name: &str) -> TestDir {
        let unique = NEXT_TEST_DIR.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "fleet-test-{}-{name}-{unique}",
            std::process::id()
        ));
        std::fs::create_dir_all(&path).unwrap();
        TestDir { path }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn output(&self) -> PathBuf {
        self.path.join("a.out")
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

fn link(dir: &TestDir, extra_args: &[&str], inputs: &[&Path]) -> Result<ExecImage, String> {
    let output = dir.output();
    let mut args: Vec<String> = vec!["-o".to_owned(), output.display().to_string()];
    args.extend(extra_args.iter().map(|a| (*a).to_owned()));
    args.extend(inputs.iter().map(|p| p.display().to_string()));

    let args = libfleet::Args::parse(args.iter()).map_err(|e| format!("{e:#}"))?;
    libfleet::link(&args).map_err(|e| format!("{e:#}"))?;
    Ok(ExecImage::parse(std::fs::read(&output).unwrap()))
}

/// Builds a GNU-style `ar` archive from (member name, bytes) pairs. Member names here are short
/// enough for the inline header field.
fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"!<arch>\n");
    for (name, data) in members {
        let ident = format!("{name}/");
        out.extend_from_slice(format!("{ident:<16}").as_bytes());
        out.extend_from_slice(format!("{:<12}", 0).as_bytes());
        out.extend_from_slice(format!("{:<6}", 0).as_bytes());
        out.extend_from_slice(format!("{:<6}", 0).as_bytes());
        out.extend_from_slice(format!("{:<8}", 644).as_bytes());
        out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}

// ---------------------------------------------------------------------------
// A small raw reader for the executables we produce.

#[derive(Debug, Clone)]
struct Section {
    name: String,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    entsize: u64,
}

#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

#[derive(Debug, Clone)]
struct Sym {
    name: String,
    info: u8,
    shndx: u16,
    value: u64,
    size: u64,
}

#[derive(Debug)]
struct ExecImage {
    data: Vec<u8>,
    entry: u64,
    sections: Vec<Section>,
    segments: Vec<ProgramHeader>,
    symbols: Vec<Sym>,
    symtab_info: u32,
}

fn u16_at(d: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(d[off..off + 2].try_into().unwrap())
}
fn u32_at(d: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(d[off..off + 4].try_into().unwrap())
}
fn u64_at(d: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(d[off..off + 8].try_into().unwrap())
}

fn c_str_at(d: &[u8], off: usize) -> String {
    let end = d[off..].iter().position(|&b| b == 0).unwrap() + off;
    String::from_utf8_lossy(&d[off..end]).into_owned()
}

impl ExecImage {
    fn parse(data: Vec<u8>) -> ExecImage {
        assert_eq!(&data[..4], b"\x7fELF");
        assert_eq!(data[4], 2, "not 64-bit");
        assert_eq!(data[5], 1, "not little-endian");
        assert_eq!(u16_at(&data, 0x10), 2, "not ET_EXEC");

        let entry = u64_at(&data, 0x18);
        let phoff = u64_at(&data, 0x20) as usize;
        let shoff = u64_at(&data, 0x28) as usize;
        let phnum = u16_at(&data, 0x38) as usize;
        let shnum = u16_at(&data, 0x3c) as usize;
        let shstrndx = u16_at(&data, 0x3e) as usize;

        let raw_section = |index: usize| -> Section {
            let base = shoff + index * 64;
            Section {
                name: String::new(),
                sh_type: u32_at(&data, base + 4),
                flags: u64_at(&data, base + 8),
                addr: u64_at(&data, base + 16),
                offset: u64_at(&data, base + 24),
                size: u64_at(&data, base + 32),
                link: u32_at(&data, base + 40),
                info: u32_at(&data, base + 44),
                entsize: u64_at(&data, base + 56),
            }
        };

        let shstrtab = raw_section(shstrndx);
        let mut sections = Vec::with_capacity(shnum);
        for index in 0..shnum {
            let mut section = raw_section(index);
            let name_offset = u32_at(&data, shoff + index * 64) as usize;
            section.name = c_str_at(&data, shstrtab.offset as usize + name_offset);
            sections.push(section);
        }

        let mut segments = Vec::with_capacity(phnum);
        for index in 0..phnum {
            let base = phoff + index * 56;
            segments.push(ProgramHeader {
                p_type: u32_at(&data, base),
                flags: u32_at(&data, base + 4),
                offset: u64_at(&data, base + 8),
                vaddr: u64_at(&data, base + 16),
                filesz: u64_at(&data, base + 32),
                memsz: u64_at(&data, base + 40),
            });
        }

        let mut symbols = Vec::new();
        let mut symtab_info = 0;
        if let Some(symtab) = sections.iter().find(|s| s.name == ".symtab") {
            symtab_info = symtab.info;
            let strtab = &sections[symtab.link as usize];
            let count = (symtab.size / 24) as usize;
            for index in 0..count {
                let base = symtab.offset as usize + index * 24;
                let name_offset = u32_at(&data, base) as usize;
                symbols.push(Sym {
                    name: c_str_at(&data, strtab.offset as usize + name_offset),
                    info: data[base + 4],
                    shndx: u16_at(&data, base + 6),
                    value: u64_at(&data, base + 8),
                    size: u64_at(&data, base + 16),
                });
            }
        }

        ExecImage {
            data,
            entry,
            sections,
            segments,
            symbols,
            symtab_info,
        }
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    fn section_data(&self, section: &Section) -> &[u8] {
        &self.data[section.offset as usize..(section.offset + section.size) as usize]
    }

    fn symbol(&self, name: &str) -> Option<&Sym> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Reads bytes at a virtual address by finding the section that contains it.
    fn read_at_addr(&self, addr: u64, len: usize) -> &[u8] {
        let section = self
            .sections
            .iter()
            .find(|s| {
                s.sh_type != 8 // SHT_NOBITS
                    && s.flags & 2 != 0 // SHF_ALLOC
                    && addr >= s.addr
                    && addr + len as u64 <= s.addr + s.size
            })
            .unwrap_or_else(|| panic!("no section contains address {addr:#x}"));
        let offset = (section.offset + (addr - section.addr)) as usize;
        &self.data[offset..offset + len]
    }

    fn check_invariants(&self) {
        // Non-NOBITS sections must not overlap in the file.
        let mut ranges: Vec<(u64, u64, &str)> = self
            .sections
            .iter()
            .filter(|s| s.sh_type != 8 && s.size > 0)
            .map(|s| (s.offset, s.offset + s.size, s.name.as_str()))
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(
                pair[0].1 <= pair[1].0,
                "sections overlap in the file: {pair:?}"
            );
        }

        // Every SHF_ALLOC section must be covered by exactly one PT_LOAD whose permissions
        // include the section's.
        for section in &self.sections {
            if section.flags & 2 == 0 || section.size == 0 {
                continue;
            }
            let covering: Vec<&ProgramHeader> = self
                .segments
                .iter()
                .filter(|p| {
                    p.p_type == 1
                        && section.addr >= p.vaddr
                        && section.addr + section.size <= p.vaddr + p.memsz
                })
                .collect();
            assert_eq!(
                covering.len(),
                1,
                "section {} covered by {} PT_LOADs",
                section.name,
                covering.len()
            );
            let load = covering[0];
            if section.flags & 1 != 0 {
                assert!(load.flags & 2 != 0, "{}: writable section in read-only load", section.name);
            }
            if section.flags & 4 != 0 {
                assert!(load.flags & 1 != 0, "{}: executable section in non-exec load", section.name);
            }
        }

        // PT_LOAD offset and vaddr must be congruent modulo the page size.
        for load in self.segments.iter().filter(|p| p.p_type == 1) {
            assert_eq!(load.offset % 0x1000, load.vaddr % 0x1000);
            assert!(load.filesz <= load.memsz);
        }

        // Locals precede globals in .symtab and sh_info is the first global's index.
        let first_non_local = self
            .symbols
            .iter()
            .position(|s| s.info >> 4 != 0)
            .unwrap_or(self.symbols.len());
        assert_eq!(first_non_local as u32, self.symtab_info);
        for sym in &self.symbols[first_non_local..] {
            assert_ne!(sym.info >> 4, 0, "local symbol after first global");
        }
    }
}

fn is_global_defined(sym: &Sym) -> bool {
    sym.info >> 4 == 1 && sym.shndx != 0
}

// ---------------------------------------------------------------------------
// Scenarios

/// Two objects calling each other directly: everything lands in one .text, no PLT or GOT.
#[test]
fn links_direct_call_between_objects() {
    let mut a = new_object();
    let text = a.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    // main: call f; ret
    a.append_section_data(text, &[0xe8, 0, 0, 0, 0, 0xc3], 16);
    a.add_symbol(global("main", 0, 6, text));
    let f_ref = a.add_symbol(undefined("f"));
    a.add_relocation(
        text,
        Relocation {
            offset: 1,
            symbol: f_ref,
            addend: -4,
            flags: RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_PC32,
            },
        },
    )
    .unwrap();

    let mut b = new_object();
    let text_b = b.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    b.append_section_data(text_b, &[0xc3], 16);
    b.add_symbol(global("f", 0, 1, text_b));

    let dir = TestDir::new("direct-call");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let b_path = dir.write("b.o", &b.write().unwrap());
    let image = link(&dir, &[], &[&a_path, &b_path]).unwrap();
    image.check_invariants();

    assert!(image.section(".plt").is_none());
    assert!(image.section(".got").is_none());
    assert_eq!(
        image
            .sections
            .iter()
            .filter(|s| s.name == ".text")
            .count(),
        1
    );

    let main_sym = image.symbol("main").unwrap();
    let f_sym = image.symbol("f").unwrap();
    assert!(is_global_defined(main_sym));
    assert!(is_global_defined(f_sym));

    // The call displacement must take us from the end of the call instruction to f.
    let disp = i32::from_le_bytes(
        image
            .read_at_addr(main_sym.value + 1, 4)
            .try_into()
            .unwrap(),
    );
    assert_eq!(
        (main_sym.value + 5).wrapping_add(disp as i64 as u64),
        f_sym.value
    );
}

/// An undefined reference pulls a member out of an archive, and a PLT-forming call produces one
/// PLT entry, one .got.plt slot and one .rela.plt entry.
#[test]
fn archive_member_activation_and_plt() {
    let mut a = new_object();
    let text = a.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    a.append_section_data(text, &[0xe8, 0, 0, 0, 0, 0xc3], 16);
    a.add_symbol(global("main", 0, 6, text));
    let printf_ref = a.add_symbol(undefined("printf"));
    a.add_relocation(
        text,
        Relocation {
            offset: 1,
            symbol: printf_ref,
            addend: -4,
            flags: RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_PLT32,
            },
        },
    )
    .unwrap();

    let mut printf_obj = new_object();
    let text_p = printf_obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    printf_obj.append_section_data(text_p, &[0x31, 0xc0, 0xc3], 16);
    printf_obj.add_symbol(global("printf", 0, 3, text_p));

    // An unrelated member that nothing references must stay out of the link.
    let mut unused = new_object();
    let text_u = unused.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    unused.append_section_data(text_u, &[0xcc], 16);
    unused.add_symbol(global("unused_helper", 0, 1, text_u));

    let dir = TestDir::new("archive-plt");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let archive = build_archive(&[
        ("unused.o", &unused.write().unwrap()),
        ("printf.o", &printf_obj.write().unwrap()),
    ]);
    let lib_path = dir.write("libc.a", &archive);
    let image = link(&dir, &[], &[&a_path, &lib_path]).unwrap();
    image.check_invariants();

    let plt = image.section(".plt").unwrap();
    assert_eq!(plt.size, 16);
    let relplt = image.section(".rela.plt").unwrap();
    assert_eq!(relplt.size, 24);
    let gotplt = image.section(".got.plt").unwrap();
    assert_eq!(gotplt.size, 8);

    let printf_sym = image.symbol("printf").unwrap();
    assert!(is_global_defined(printf_sym));
    assert!(image.symbol("unused_helper").is_none());

    // The PLT entry jumps through the .got.plt slot, which holds printf's address.
    let entry = image.read_at_addr(plt.addr, 16);
    assert_eq!(&entry[..2], &[0xff, 0x25]);
    let disp = i32::from_le_bytes(entry[2..6].try_into().unwrap());
    assert_eq!((plt.addr + 6).wrapping_add(disp as i64 as u64), gotplt.addr);
    let slot = u64::from_le_bytes(image.read_at_addr(gotplt.addr, 8).try_into().unwrap());
    assert_eq!(slot, printf_sym.value);

    // The .rela.plt entry is a JUMP_SLOT against printf's symtab row.
    let rela = image.section_data(relplt);
    assert_eq!(u64_at(rela, 0), gotplt.addr);
    assert_eq!(u32_at(rela, 8), 7); // R_X86_64_JUMP_SLOT
    let sym_index = u32_at(rela, 12) as usize;
    assert_eq!(image.symbols[sym_index].name, "printf");
}

/// Identical strings from different objects are stored once, and references resolve to the
/// merged copy.
#[test]
fn merges_duplicate_strings() {
    let build = |other: &[u8]| {
        let mut obj = new_object();
        let strings =
            obj.add_section(Vec::new(), b".rodata.str1.1".to_vec(), SectionKind::ReadOnlyString);
        obj.append_section_data(strings, b"hello\0", 1);
        obj.append_section_data(strings, other, 1);
        let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
        obj.append_section_data(data, &[0u8; 8], 8);
        let section_sym = obj.section_symbol(strings);
        obj.add_relocation(
            data,
            Relocation {
                offset: 0,
                symbol: section_sym,
                addend: 0,
                flags: RelocationFlags::Elf {
                    r_type: object::elf::R_X86_64_64,
                },
            },
        )
        .unwrap();
        // Keep at least one global so the object contributes a symbol.
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xc3], 16);
        obj
    };

    let a = build(b"alpha\0");
    let b = build(b"beta\0");

    let dir = TestDir::new("merge-strings");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let b_path = dir.write("b.o", &b.write().unwrap());
    let image = link(&dir, &[], &[&a_path, &b_path]).unwrap();
    image.check_invariants();

    let rodata = image.section(".rodata").unwrap();
    let bytes = image.section_data(rodata);
    let occurrences = bytes
        .windows(6)
        .filter(|window| *window == b"hello\0")
        .count();
    assert_eq!(occurrences, 1, ".rodata should contain hello exactly once");
    assert!(bytes.windows(6).any(|w| w == b"alpha\0"));
    assert!(bytes.windows(5).any(|w| w == b"beta\0"));

    // Both .data words point at the single merged copy of "hello".
    let data = image.section(".data").unwrap();
    let data_bytes = image.section_data(data);
    let first = u64_at(data_bytes, 0);
    let second = u64_at(data_bytes, 8);
    assert_eq!(first, second);
    assert_eq!(image.read_at_addr(first, 6), b"hello\0");
}

/// A strong definition beats a weak one regardless of command-line order.
#[test]
fn strong_definition_overrides_weak() {
    let make = |value: u32, weak: bool| {
        let mut obj = new_object();
        let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
        obj.append_section_data(data, &value.to_le_bytes(), 4);
        obj.add_symbol(Symbol {
            name: b"x".to_vec(),
            value: 0,
            size: 4,
            kind: SymbolKind::Data,
            scope: SymbolScope::Dynamic,
            weak,
            section: SymbolSection::Section(data),
            flags: SymbolFlags::None,
        });
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xc3], 16);
        obj
    };

    let a = make(1, true);
    let b = make(2, false);

    let dir = TestDir::new("weak-strong");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let b_path = dir.write("b.o", &b.write().unwrap());
    let image = link(&dir, &[], &[&a_path, &b_path]).unwrap();
    image.check_invariants();

    let x = image.symbol("x").unwrap();
    assert!(is_global_defined(x));
    let value = u32::from_le_bytes(image.read_at_addr(x.value, 4).try_into().unwrap());
    assert_eq!(value, 2);
}

/// Of two copies of the same COMDAT group, only the first file's survives.
#[test]
fn deduplicates_comdat_groups() {
    let make = |body: &[u8]| {
        let mut obj = new_object();
        let text = obj.add_section(Vec::new(), b".text._ZN3fooE".to_vec(), SectionKind::Text);
        obj.append_section_data(text, body, 16);
        let sym = obj.add_symbol(global("_ZN3fooE", 0, body.len() as u64, text));
        obj.add_comdat(object::write::Comdat {
            kind: object::ComdatKind::Any,
            symbol: sym,
            sections: vec![text],
        });
        let main_text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(main_text, &[0xc3], 16);
        obj
    };

    let a = make(&[0x90, 0xc3]);
    let b = make(&[0x90, 0x90, 0x90, 0xc3]);

    let dir = TestDir::new("comdat");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let b_path = dir.write("b.o", &b.write().unwrap());
    let image = link(&dir, &[], &[&a_path, &b_path]).unwrap();
    image.check_invariants();

    // Only a.o's two-byte copy made it in; b.o's four-byte copy was discarded.
    let text = image.section(".text").unwrap();
    let foo = image.symbol("_ZN3fooE").unwrap();
    assert!(is_global_defined(foo));
    assert_eq!(foo.size, 2);
    assert_eq!(
        image
            .symbols
            .iter()
            .filter(|s| s.name == "_ZN3fooE")
            .count(),
        1
    );
    let text_bytes = image.section_data(text);
    assert_eq!(image.read_at_addr(foo.value, 2), [0x90, 0xc3]);
    assert!(
        !text_bytes
            .windows(4)
            .any(|w| w == [0x90, 0x90, 0x90, 0xc3]),
        "the losing COMDAT copy leaked into the output"
    );
}

/// A tentative definition becomes a .bss-backed regular definition.
#[test]
fn converts_common_symbols() {
    let mut a = new_object();
    let text = a.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    a.append_section_data(text, &[0xc3], 16);
    a.add_symbol(global("main", 0, 1, text));
    a.add_symbol(Symbol {
        name: b"c".to_vec(),
        value: 4, // alignment, by COMMON convention
        size: 4,
        kind: SymbolKind::Data,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Common,
        flags: SymbolFlags::None,
    });

    let dir = TestDir::new("common");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let image = link(&dir, &[], &[&a_path]).unwrap();
    image.check_invariants();

    let bss = image.section(".bss").unwrap();
    assert_eq!(bss.sh_type, 8); // SHT_NOBITS
    assert!(bss.size >= 4);
    let c = image.symbol("c").unwrap();
    assert!(is_global_defined(c));
    assert!(c.value >= bss.addr && c.value + 4 <= bss.addr + bss.size);
    assert_eq!(c.value % 4, 0);
}

/// References to an undefined weak symbol resolve to zero instead of failing the link.
#[test]
fn undefined_weak_resolves_to_zero() {
    let mut a = new_object();
    let text = a.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    a.append_section_data(text, &[0x48, 0x8b, 0x05, 0, 0, 0, 0, 0xc3], 16);
    a.add_symbol(global("main", 0, 8, text));
    let weak_ref = a.add_symbol(Symbol {
        name: b"optional_hook".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Dynamic,
        weak: true,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    a.add_relocation(
        text,
        Relocation {
            offset: 3,
            symbol: weak_ref,
            addend: -4,
            flags: RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_PC32,
            },
        },
    )
    .unwrap();

    let dir = TestDir::new("undef-weak");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let image = link(&dir, &[], &[&a_path]).unwrap();
    image.check_invariants();

    let main_sym = image.symbol("main").unwrap();
    let field = i32::from_le_bytes(
        image
            .read_at_addr(main_sym.value + 3, 4)
            .try_into()
            .unwrap(),
    );
    assert_eq!(field, 0);
}

/// A strong undefined reference with no provider fails the link.
#[test]
fn unresolved_strong_reference_is_an_error() {
    let mut a = new_object();
    let text = a.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    a.append_section_data(text, &[0xe8, 0, 0, 0, 0], 16);
    a.add_symbol(global("main", 0, 5, text));
    let missing = a.add_symbol(undefined("missing"));
    a.add_relocation(
        text,
        Relocation {
            offset: 1,
            symbol: missing,
            addend: -4,
            flags: RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_PLT32,
            },
        },
    )
    .unwrap();

    let dir = TestDir::new("unresolved");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let error = link(&dir, &[], &[&a_path]).unwrap_err();
    assert!(error.contains("undefined symbol"), "{error}");
    assert!(error.contains("missing"), "{error}");
}

/// Two strong definitions of the same symbol fail the link.
#[test]
fn duplicate_strong_definitions_are_an_error() {
    let make = || {
        let mut obj = new_object();
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xc3], 16);
        obj.add_symbol(global("clash", 0, 1, text));
        obj
    };

    let dir = TestDir::new("duplicate");
    let a_path = dir.write("a.o", &make().write().unwrap());
    let b_path = dir.write("b.o", &make().write().unwrap());
    let error = link(&dir, &[], &[&a_path, &b_path]).unwrap_err();
    assert!(error.contains("duplicate symbol"), "{error}");
}

/// The entry point comes from the entry symbol, and -static suppresses PT_INTERP.
#[test]
fn entry_symbol_and_static_flag() {
    let mut a = new_object();
    let text = a.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    a.append_section_data(text, &[0x0f, 0x05, 0xc3], 16);
    a.add_symbol(global("_start", 2, 1, text));

    let dir = TestDir::new("entry");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let image = link(&dir, &["-static"], &[&a_path]).unwrap();
    image.check_invariants();

    let start = image.symbol("_start").unwrap();
    assert_eq!(image.entry, start.value);
    assert!(image.section(".interp").is_none());
    assert!(image.segments.iter().all(|p| p.p_type != 3)); // no PT_INTERP

    // Without -static, the interpreter request is present.
    let dynamic = link(&dir, &[], &[&a_path]).unwrap();
    let interp = dynamic.section(".interp").unwrap();
    assert_eq!(
        dynamic.section_data(interp),
        b"/lib64/ld-linux-x86-64.so.2\0"
    );
    assert!(dynamic.segments.iter().any(|p| p.p_type == 3));
}

/// Two links of the same inputs produce byte-identical outputs, regardless of how the work was
/// scheduled across threads.
#[test]
fn output_is_deterministic() {
    let mut a = new_object();
    let text = a.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    a.append_section_data(text, &[0xe8, 0, 0, 0, 0, 0xc3], 16);
    a.add_symbol(global("_start", 0, 6, text));
    let f_ref = a.add_symbol(undefined("f"));
    a.add_relocation(
        text,
        Relocation {
            offset: 1,
            symbol: f_ref,
            addend: -4,
            flags: RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_PLT32,
            },
        },
    )
    .unwrap();

    let mut b = new_object();
    let text_b = b.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    b.append_section_data(text_b, &[0xc3], 16);
    b.add_symbol(global("f", 0, 1, text_b));
    let strings =
        b.add_section(Vec::new(), b".rodata.str1.1".to_vec(), SectionKind::ReadOnlyString);
    b.append_section_data(strings, b"one\0two\0three\0", 1);

    let dir = TestDir::new("determinism");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let b_path = dir.write("b.o", &b.write().unwrap());

    link(&dir, &["-static"], &[&a_path, &b_path]).unwrap();
    let first = std::fs::read(dir.output()).unwrap();
    link(&dir, &["-static"], &[&a_path, &b_path]).unwrap();
    let second = std::fs::read(dir.output()).unwrap();
    assert_eq!(first, second);
}

/// The layout symbols are defined and consistent with the image.
#[test]
fn layout_symbols_are_defined() {
    let mut a = new_object();
    let text = a.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    a.append_section_data(text, &[0xc3], 16);
    a.add_symbol(global("_start", 0, 1, text));
    let data = a.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
    a.append_section_data(data, &[1, 2, 3, 4], 4);
    let bss = a.add_section(Vec::new(), b".bss".to_vec(), SectionKind::UninitializedData);
    a.append_section_bss(bss, 16, 8);

    let dir = TestDir::new("layout-symbols");
    let a_path = dir.write("a.o", &a.write().unwrap());
    let image = link(&dir, &["-static"], &[&a_path]).unwrap();
    image.check_invariants();

    let bss_section = image.section(".bss").unwrap();
    let text_section = image.section(".text").unwrap();

    let bss_start = image.symbol("__bss_start").unwrap();
    assert_eq!(bss_start.value, bss_section.addr);

    let etext = image.symbol("_etext").unwrap();
    assert_eq!(etext.value, text_section.addr + text_section.size);

    let end = image.symbol("_end").unwrap();
    assert_eq!(end.value, bss_section.addr + bss_section.size);

    let ehdr_start = image.symbol("__ehdr_start").unwrap();
    assert_eq!(ehdr_start.value, 0x400000);
}
