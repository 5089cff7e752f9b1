//! The process-wide symbol record. One `Symbol` exists per interned global name; files hold
//! non-owning references to it. Resolution state is guarded by a per-symbol mutex, while the
//! "needs" mask and the various assigned offsets are atomics so that relocation scanning and
//! layout can run without taking the lock.

use crate::elf::SymbolStrength;
use crate::hash::PreHashed;
use crate::parsing::FileId;
use crate::string_merging::PieceRef;
use std::fmt::Display;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SymbolName<'data> {
    bytes: &'data [u8],
}

impl<'data> SymbolName<'data> {
    pub(crate) fn new(bytes: &'data [u8]) -> SymbolName<'data> {
        Self { bytes }
    }

    pub(crate) fn prehashed(bytes: &'data [u8]) -> PreHashed<SymbolName<'data>> {
        PreHashed::new(Self::new(bytes), crate::hash::hash_bytes(bytes))
    }

    pub(crate) fn bytes(&self) -> &'data [u8] {
        self.bytes
    }
}

impl Display for SymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&String::from_utf8_lossy(self.bytes), f)
    }
}

/// Which entity currently owns (defines) a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    None,
    /// Owned by the synthetic internal file that defines layout symbols like `__bss_start`.
    Prelude,
    File(FileId),
}

/// The part of a symbol's state that resolution contends for. Guarded by `Symbol::resolution`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Resolution<'data> {
    pub(crate) owner: Owner,
    pub(crate) strength: SymbolStrength,
    /// Priority of the owning file; used for tie-breaks within a strength tier.
    pub(crate) priority: u32,
    pub(crate) section: Option<object::SectionIndex>,
    pub(crate) piece: Option<PieceRef<'data>>,
    pub(crate) value: u64,
    pub(crate) size: u64,
    pub(crate) visibility: u8,
    pub(crate) sym_type: u8,
    pub(crate) undef_weak: bool,
}

impl Resolution<'_> {
    fn unresolved() -> Self {
        Resolution {
            owner: Owner::None,
            strength: SymbolStrength::Undefined,
            priority: u32::MAX,
            section: None,
            piece: None,
            value: 0,
            size: 0,
            visibility: object::elf::STV_DEFAULT,
            sym_type: object::elf::STT_NOTYPE,
            undef_weak: false,
        }
    }

    pub(crate) fn is_defined(&self) -> bool {
        self.strength.is_defined() || self.owner == Owner::Prelude
    }
}

pub(crate) const NEEDS_GOT: u8 = 1;
pub(crate) const NEEDS_GOTTP: u8 = 2;
pub(crate) const NEEDS_PLT: u8 = 4;

/// Marker for "no offset assigned".
pub(crate) const OFFSET_NONE: u32 = u32::MAX;

pub(crate) struct Symbol<'data> {
    name: &'data [u8],

    /// Whether `--trace-symbol` named this symbol. Set when the symbol is interned.
    pub(crate) traced: bool,

    resolution: Mutex<Resolution<'data>>,

    /// Which synthetic table slots this symbol requires, as a mask of the NEEDS_* bits.
    /// OR-only, so referencing files never need the resolution lock.
    needs: AtomicU8,

    // Offsets within the respective output chunks, assigned during layout.
    pub(crate) got_offset: AtomicU32,
    pub(crate) gottp_offset: AtomicU32,
    pub(crate) gotplt_offset: AtomicU32,
    pub(crate) plt_offset: AtomicU32,
    pub(crate) relplt_offset: AtomicU32,

    /// Final virtual address, filled in once layout has assigned section addresses.
    pub(crate) address: AtomicU64,

    /// Output section header index for symbol table emission.
    pub(crate) shndx: AtomicU32,

    /// Row index in the output .symtab, used by .rela.plt entries.
    pub(crate) symtab_index: AtomicU32,

    /// Mirror of `Resolution::undef_weak` that relocation application can read without taking
    /// the resolution lock.
    pub(crate) undef_weak: AtomicBool,
}

impl<'data> Symbol<'data> {
    pub(crate) fn new(name: &'data [u8], traced: bool) -> Self {
        Symbol {
            name,
            traced,
            resolution: Mutex::new(Resolution::unresolved()),
            needs: AtomicU8::new(0),
            got_offset: AtomicU32::new(OFFSET_NONE),
            gottp_offset: AtomicU32::new(OFFSET_NONE),
            gotplt_offset: AtomicU32::new(OFFSET_NONE),
            plt_offset: AtomicU32::new(OFFSET_NONE),
            relplt_offset: AtomicU32::new(OFFSET_NONE),
            address: AtomicU64::new(0),
            shndx: AtomicU32::new(0),
            symtab_index: AtomicU32::new(0),
            undef_weak: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> SymbolName<'data> {
        SymbolName::new(self.name)
    }

    pub(crate) fn name_bytes(&self) -> &'data [u8] {
        self.name
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Resolution<'data>> {
        self.resolution.lock().unwrap()
    }

    pub(crate) fn resolution(&self) -> Resolution<'data> {
        *self.lock()
    }

    /// Sets the supplied needs bits, returning the bits that weren't previously set. The caller
    /// that observes a bit transition from clear to set is responsible for the slot accounting.
    pub(crate) fn acquire_needs(&self, flags: u8) -> u8 {
        let previous = self.needs.fetch_or(flags, Ordering::AcqRel);
        flags & !previous
    }

    pub(crate) fn needs(&self) -> u8 {
        self.needs.load(Ordering::Acquire)
    }

    pub(crate) fn needs_plt(&self) -> bool {
        self.needs() & NEEDS_PLT != 0
    }

    pub(crate) fn is_undef_weak(&self) -> bool {
        self.undef_weak.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.name())
            .field("resolution", &*self.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_bits_are_acquired_once() {
        let sym = Symbol::new(b"f", false);
        assert_eq!(sym.acquire_needs(NEEDS_PLT), NEEDS_PLT);
        assert_eq!(sym.acquire_needs(NEEDS_PLT), 0);
        assert_eq!(sym.acquire_needs(NEEDS_GOT | NEEDS_PLT), NEEDS_GOT);
        assert!(sym.needs_plt());
    }
}
