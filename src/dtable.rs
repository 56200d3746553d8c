/*! Dispatch tables (spec §4.9), grounded on `xdp2_dtable_add_plain` /
`__xdp2_dtable_find_plain` / `xdp2_dtable_add_tern` /
`__xdp2_dtable_find_tern` / `xdp2_dtable_add_lpm` / `__xdp2_dtable_find_lpm`
in `original_source/src/lib/xdp2/dtable.c`.

These are keyed lookups for routing metadata, independent of a parse
node's own `proto_table` (spec §3), which always does exact-match
dispatch internally. The CLI/by-id mutation surface the source also
exposes (`*_by_id`, `*_show_*_cli`) is the out-of-scope "dynamic-table
facility" named in spec §1 and is not implemented here.
*/

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};

use crate::hash::HashKey;

/// A keyed, SipHash-seeded hasher for [`PlainTable`], matching the source's
/// "hashed by a keyed pseudo-random function" (spec §4.9).
#[derive(Default)]
pub struct KeyedHasher(siphasher::sip::SipHasher13);

impl Hasher for KeyedHasher {
    fn finish(&self) -> u64 {
        self.0.finish()
    }
    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes);
    }
}

type KeyedHashMap<K, V> = HashMap<K, V, BuildHasherDefault<KeyedHasher>>;

/// One entry: a byte key and routing target.
#[derive(Debug, Clone)]
struct Entry<T> {
    target: T,
}

/// Exact-match dispatch table, hashed by [`KeyedHasher`] (spec §4.9
/// "plain").
pub struct PlainTable<T> {
    entries: KeyedHashMap<Vec<u8>, Entry<T>>,
    default_target: Option<T>,
}

impl<T> PlainTable<T> {
    /// An empty table with no default target.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: KeyedHashMap::default(),
            default_target: None,
        }
    }

    /// Set the target returned when no key matches.
    #[must_use]
    pub fn with_default(mut self, target: T) -> Self {
        self.default_target = Some(target);
        self
    }

    /// Insert or replace the entry for `key`.
    pub fn insert(&mut self, key: Vec<u8>, target: T) {
        self.entries.insert(key, Entry { target });
    }

    /// Look up `key`, falling back to the default target on miss.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<&T> {
        self.entries
            .get(key)
            .map(|e| &e.target)
            .or(self.default_target.as_ref())
    }
}

impl<T> Default for PlainTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct TernEntry<T> {
    key: Vec<u8>,
    mask: Vec<u8>,
    position: i64,
    target: T,
}

/// Masked ("ternary") dispatch table (spec §4.9). Entries are tried in
/// ascending `position` order; the first whose `(key ^ lookup_key) & mask
/// == 0` wins.
pub struct TernaryTable<T> {
    entries: Vec<TernEntry<T>>,
    default_target: Option<T>,
}

impl<T> TernaryTable<T> {
    /// An empty table with no default target.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            default_target: None,
        }
    }

    /// Set the target returned when no entry matches.
    #[must_use]
    pub fn with_default(mut self, target: T) -> Self {
        self.default_target = Some(target);
        self
    }

    /// Insert an entry at `position`; entries are kept sorted by position
    /// so lookup always evaluates them in the right order.
    pub fn insert(&mut self, key: Vec<u8>, mask: Vec<u8>, position: i64, target: T) {
        let entry = TernEntry {
            key,
            mask,
            position,
            target,
        };
        let idx = self
            .entries
            .partition_point(|e| e.position <= entry.position);
        self.entries.insert(idx, entry);
    }

    /// Find the first matching entry in position order, falling back to
    /// the default target on miss.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<&T> {
        self.entries
            .iter()
            .find(|e| crate::select::compare_tern(key, &e.key, &e.mask))
            .map(|e| &e.target)
            .or(self.default_target.as_ref())
    }
}

impl<T> Default for TernaryTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct LpmEntry<T> {
    key: Vec<u8>,
    prefix_len: usize,
    target: T,
}

/// Longest-prefix-match dispatch table (spec §4.9). Entries are kept
/// sorted by descending `prefix_len`; the first prefix match wins, which
/// is equivalent to the longest match since ties are broken by insertion
/// order.
pub struct LpmTable<T> {
    entries: Vec<LpmEntry<T>>,
    default_target: Option<T>,
}

impl<T> LpmTable<T> {
    /// An empty table with no default target.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            default_target: None,
        }
    }

    /// Set the target returned when no prefix matches.
    #[must_use]
    pub fn with_default(mut self, target: T) -> Self {
        self.default_target = Some(target);
        self
    }

    /// Insert an entry, keeping entries sorted by descending prefix length.
    pub fn insert(&mut self, key: Vec<u8>, prefix_len: usize, target: T) {
        let entry = LpmEntry {
            key,
            prefix_len,
            target,
        };
        let idx = self
            .entries
            .partition_point(|e| e.prefix_len >= entry.prefix_len);
        self.entries.insert(idx, entry);
    }

    /// Find the longest matching prefix, falling back to the default
    /// target on miss.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<&T> {
        self.entries
            .iter()
            .find(|e| crate::select::compare_prefix(key, &e.key, e.prefix_len))
            .map(|e| &e.target)
            .or(self.default_target.as_ref())
    }
}

impl<T> Default for LpmTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Seed the process-wide `KeyedHasher` default key. The source's
/// equivalent is `xdp2_hash_secret_init`; kept here since `PlainTable`'s
/// hashing is the one dtable concern that reuses the hash subsystem.
#[must_use]
pub fn default_hash_key() -> HashKey {
    HashKey::new(0, 0)
}
