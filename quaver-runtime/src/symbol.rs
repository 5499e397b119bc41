//! Hash-interned symbol strings.
//!
//! A `Symbol` is the 64-bit XXH3 hash of its bytes; the table owns the one
//! string behind every hash it has ever issued. The table is shared
//! process-wide between compilation pipelines, so interning takes a short
//! exclusive lock on the map.

use std::sync::Mutex;

use rustc_hash::FxHashMap;
use xxhash_rust::xxh3::xxh3_64;

use crate::slot::Slot;

/// An interned symbol, identified by the 64-bit hash of its bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Symbol(u64);

impl Symbol {
    /// The full 64-bit hash.
    #[inline]
    pub fn hash(self) -> u64 {
        self.0
    }

    /// The slot representation, carrying the low 48 bits of the hash.
    #[inline]
    pub fn slot(self) -> Slot {
        Slot::from_symbol_hash(self.0)
    }
}

/// Symbols the compiler looks up on nearly every build, interned once at
/// table construction.
#[derive(Clone, Copy, Debug)]
pub struct WellKnownSymbols {
    pub super_: Symbol,
    pub this: Symbol,
    pub this_method: Symbol,
    pub this_process: Symbol,
    pub this_thread: Symbol,
    pub at: Symbol,
    pub copy_series: Symbol,
}

/// The process-wide symbol table.
pub struct SymbolTable {
    map: Mutex<FxHashMap<u64, String>>,
    well_known: WellKnownSymbols,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut map = FxHashMap::default();
        let mut preload = |name: &str| {
            let hash = xxh3_64(name.as_bytes());
            map.insert(hash, name.to_owned());
            Symbol(hash)
        };
        let well_known = WellKnownSymbols {
            super_: preload("super"),
            this: preload("this"),
            this_method: preload("thisMethod"),
            this_process: preload("thisProcess"),
            this_thread: preload("thisThread"),
            at: preload("at"),
            copy_series: preload("copySeries"),
        };
        Self { map: Mutex::new(map), well_known }
    }

    /// Intern `name`, returning its symbol. Re-interning an existing name
    /// returns the same symbol.
    pub fn intern(&self, name: &str) -> Symbol {
        let hash = xxh3_64(name.as_bytes());
        let mut map = self.map.lock().expect("symbol table lock poisoned");
        match map.get(&hash) {
            // A differing string here is a full 64-bit hash collision.
            Some(existing) => debug_assert_eq!(existing, name, "symbol hash collision"),
            None => {
                map.insert(hash, name.to_owned());
            }
        }
        Symbol(hash)
    }

    /// Look up the string behind a symbol. Returns `None` for a hash this
    /// table never issued.
    pub fn resolve(&self, symbol: Symbol) -> Option<String> {
        let map = self.map.lock().expect("symbol table lock poisoned");
        map.get(&symbol.hash()).cloned()
    }

    /// The preloaded symbols.
    #[inline]
    pub fn well_known(&self) -> &WellKnownSymbols {
        &self.well_known
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
