//! The global symbol and COMDAT-group intern maps. Both are sharded, insert-only maps from a
//! prehashed key to an arena-allocated record, so interning the same key from any thread always
//! yields the same stable reference.

use crate::args::Args;
use crate::hash::INTERN_SHARDS;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::parsing::FileId;
use crate::symbol::Symbol;
use crate::symbol::SymbolName;
use bumpalo_herd::Herd;
use std::sync::Mutex;

pub(crate) struct SymbolDb<'data> {
    pub(crate) args: &'data Args,
    herd: &'data Herd,
    symbol_shards: Vec<Mutex<PassThroughHashMap<SymbolName<'data>, &'data Symbol<'data>>>>,
    comdat_shards: Vec<Mutex<PassThroughHashMap<&'data [u8], &'data ComdatGroup>>>,
}

/// A COMDAT group record, interned by signature. Files with a group of this signature contend
/// for ownership; the claim with the lowest (priority, descriptor section index) wins.
pub(crate) struct ComdatGroup {
    owner: Mutex<ComdatOwner>,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ComdatOwner {
    priority: u32,
    descriptor_index: u32,
    file: FileId,
}

impl ComdatGroup {
    fn unclaimed() -> Self {
        ComdatGroup {
            owner: Mutex::new(ComdatOwner {
                priority: u32::MAX,
                descriptor_index: u32::MAX,
                file: FileId::NONE,
            }),
        }
    }

    pub(crate) fn claim(&self, priority: u32, file: FileId, descriptor_index: u32) {
        let claim = ComdatOwner {
            priority,
            descriptor_index,
            file,
        };
        let mut owner = self.owner.lock().unwrap();
        if claim < *owner {
            *owner = claim;
        }
    }

    pub(crate) fn is_owned_by(&self, file: FileId, descriptor_index: u32) -> bool {
        let owner = self.owner.lock().unwrap();
        owner.file == file && owner.descriptor_index == descriptor_index
    }
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn new(args: &'data Args, herd: &'data Herd) -> Self {
        SymbolDb {
            args,
            herd,
            symbol_shards: (0..INTERN_SHARDS).map(|_| Mutex::default()).collect(),
            comdat_shards: (0..INTERN_SHARDS).map(|_| Mutex::default()).collect(),
        }
    }

    /// Returns the unique `Symbol` for `name`, creating it if necessary.
    pub(crate) fn intern(&self, name: PreHashed<SymbolName<'data>>) -> &'data Symbol<'data> {
        let mut shard = self.symbol_shards[name.shard()].lock().unwrap();
        *shard.entry(name).or_insert_with(|| {
            let traced = self.args.should_trace(name.bytes());
            self.herd.get().alloc(Symbol::new(name.bytes(), traced))
        })
    }

    /// Looks up a symbol without creating it.
    pub(crate) fn get(&self, name: PreHashed<SymbolName<'data>>) -> Option<&'data Symbol<'data>> {
        self.symbol_shards[name.shard()].lock().unwrap().get(&name).copied()
    }

    /// Returns the unique COMDAT group record for `signature`, creating it if necessary.
    pub(crate) fn comdat_group(&self, signature: PreHashed<&'data [u8]>) -> &'data ComdatGroup {
        let mut shard = self.comdat_shards[signature.shard()].lock().unwrap();
        *shard
            .entry(signature)
            .or_insert_with(|| self.herd.get().alloc(ComdatGroup::unclaimed()))
    }

    /// Calls `f` for every interned symbol. Single-threaded; used by diagnostics.
    #[allow(dead_code)]
    pub(crate) fn for_each_symbol(&self, mut f: impl FnMut(&'data Symbol<'data>)) {
        for shard in &self.symbol_shards {
            for sym in shard.lock().unwrap().values() {
                f(sym);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_args() -> Args {
        Args::parse(["a.o"].iter()).unwrap()
    }

    #[test]
    fn interning_is_stable() {
        let args = test_args();
        let herd = Herd::new();
        let db = SymbolDb::new(&args, &herd);
        let a = db.intern(SymbolName::prehashed(b"printf"));
        let b = db.intern(SymbolName::prehashed(b"printf"));
        assert!(std::ptr::eq(a, b));
        let c = db.intern(SymbolName::prehashed(b"puts"));
        assert!(!std::ptr::eq(a, c));
    }

    #[test]
    fn concurrent_interning_yields_one_record() {
        let args = test_args();
        let herd = Herd::new();
        let db = SymbolDb::new(&args, &herd);
        let names: Vec<String> = (0..100).map(|i| format!("sym_{}", i % 10)).collect();
        let symbols: Vec<_> = {
            use rayon::prelude::*;
            names
                .par_iter()
                .map(|name| db.intern(SymbolName::prehashed(name.as_bytes())) as *const _ as usize)
                .collect()
        };
        for (name, sym) in names.iter().zip(&symbols) {
            let again = db.intern(SymbolName::prehashed(name.as_bytes())) as *const _ as usize;
            assert_eq!(*sym, again);
        }
    }

    #[test]
    fn comdat_lowest_claim_wins() {
        let args = test_args();
        let herd = Herd::new();
        let db = SymbolDb::new(&args, &herd);
        let group = db.comdat_group(PreHashed::from_bytes(b"_ZN3fooE"));
        group.claim(7, FileId::new(6), 3);
        group.claim(2, FileId::new(1), 5);
        group.claim(2, FileId::new(1), 9);
        assert!(group.is_owned_by(FileId::new(1), 5));
        assert!(!group.is_owned_by(FileId::new(6), 3));
    }
}
