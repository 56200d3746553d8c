/*! Flow hash helper (spec §6.1 "Hash helper"), grounded on
`xdp2_hash_secret_init`/`xdp2_print_hash_input` in
`original_source/src/lib/xdp2/parser.c`. The PRF itself is out of scope
(spec §1): this module depends on the `siphasher` crate for the callable
contract rather than reimplementing SipHash.
*/

use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// A SipHash-1-3 key, analogous to `siphash_key_t` in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashKey {
    /// First 64 bits of the SipHash key.
    pub k0: u64,
    /// Second 64 bits of the SipHash key.
    pub k1: u64,
}

impl HashKey {
    /// Build a key from its two 64-bit halves.
    #[must_use]
    pub fn new(k0: u64, k1: u64) -> Self {
        Self { k0, k1 }
    }
}

/// Hash a metadata frame's "hash window" (the contiguous byte range a
/// protocol module designates as the flow 5-tuple, or similar) into a
/// single PRF output (spec §6.1). Callers are responsible for building a
/// window whose address fields are already canonicalized via
/// [`canonicalize_pair`] so forward and reverse flows collide.
#[must_use]
pub fn hash_frame(window: &[u8], key: HashKey) -> u64 {
    print_hash_input(window);
    let mut hasher = SipHasher13::new_with_keys(key.k0, key.k1);
    hasher.write(window);
    hasher.finish()
}

/// Canonicalize a pair of equal-length address fields (e.g. src/dst) into
/// ascending byte order, so hashing a forward and a reverse flow produce
/// the same window. Swaps in place if `a > b` lexicographically.
pub fn canonicalize_pair(a: &mut [u8], b: &mut [u8]) {
    assert_eq!(a.len(), b.len(), "paired address fields must be equal length");
    if a > b {
        for (x, y) in a.iter_mut().zip(b.iter_mut()) {
            std::mem::swap(x, y);
        }
    }
}

/// Debug-only hex dump of the bytes about to be hashed. Kept as ambient
/// logging matching the `XDP2_F_DEBUG`-gated `printf` at the same call
/// site in the source, gated on `trace!` here instead of a runtime flag.
fn print_hash_input(window: &[u8]) {
    if log::log_enabled!(log::Level::Trace) {
        let hex: String = window.iter().map(|b| format!("{b:02x} ")).collect();
        log::trace!("hash input (size {}): {hex}", window.len());
    }
}
