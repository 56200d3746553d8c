/*! Scatter-gather packet buffer manager (spec §4.7), grounded on
`__xdp2_pvbuf_alloc_params` / `___xdp2_pvbuf_prepend_pvbuf` /
`___xdp2_pvbuf_append_pvbuf` / `__xdp2_pvbuf_pop_hdrs` /
`__xdp2_pvbuf_pop_trailers` / `__xdp2_pvbuf_clone` / `__xdp2_pvbuf_checksum` /
`__xdp2_pvbuf_make_iovecs` in `original_source/src/lib/xdp2/pvbuf.c`.

The tagged 64-bit pointer (`xdp2_paddr_t`) becomes the closed [`Paddr`] enum
(Design Note §9). `PBUF` and `PBUF_1REF` collapse into one `Paddr::Pbuf`
variant distinguished by the `one_ref` field rather than two near-duplicate
variants, since a bool captures the distinction the source needed two tags
for. A long address occupies one Rust value instead of two adjacent 64-bit
iovec slots, a split that existed only to fit a 128-bit value into
pointer-width array slots, which a `u128` field doesn't need.

Every reference into a [`PbufSlot`]'s backing storage carries its own
`offset`/`len` window (on the `Paddr`/`IovecEntry` itself) rather than the
slot owning a single shared cursor, so [`PvbufMgr::clone_range`] can hand out
independently-windowed references to the same backing bytes.
*/

use std::sync::Arc;

/// Length value meaning "greater than the encodable maximum, sum the
/// subtree instead" (spec §3 "0 meaning greater than the encodable
/// maximum").
const MAX_ENCODABLE_LEN: usize = u32::MAX as usize;

/// Opaque slot identifier into the pbuf arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PbufId(u32);

/// Opaque slot identifier into the pvbuf arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvbufId(u32);

/// A packet address (spec §3 "PVbuf Data Model"). `Null` is the tagged
/// pointer's zero value (`XDP2_PADDR_NULL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paddr {
    /// No buffer.
    Null,
    /// An index into the pvbuf arena: an array of 2..n iovec-like entries.
    Pvbuf(PvbufId),
    /// A window into a packet-buffer slot. `one_ref` marks a `PBUF_1REF`
    /// paddr (promised to have exactly one logical reference until the
    /// first clone promotes it to a tracked refcount).
    Pbuf {
        /// Arena slot this window refers to.
        id: PbufId,
        /// True if this is a `PBUF_1REF` paddr (single logical reference).
        one_ref: bool,
        /// Byte offset into the slot where this window starts.
        offset: usize,
        /// Window length in bytes.
        len: usize,
    },
    /// Index into one of three externally-managed regions. Out of scope
    /// for this port beyond carrying the tag, the regions themselves are
    /// caller-owned memory this manager never allocates into.
    Short {
        /// Which of the three external regions.
        region: u8,
        /// Index within the region.
        index: u16,
    },
    /// A 128-bit address, immediate in the paddr rather than indexed.
    Long(u128),
}

#[derive(Debug, Clone, Copy)]
enum IovecEntry {
    Empty,
    Pbuf {
        id: PbufId,
        one_ref: bool,
        offset: usize,
        len: usize,
    },
    /// `len == 0` means "unknown, sum from subtree" (spec §3).
    Pvbuf {
        id: PvbufId,
        len: usize,
    },
    Long(u128),
}

fn entry_to_paddr(e: IovecEntry) -> Paddr {
    match e {
        IovecEntry::Empty => Paddr::Null,
        IovecEntry::Pbuf {
            id,
            one_ref,
            offset,
            len,
        } => Paddr::Pbuf {
            id,
            one_ref,
            offset,
            len,
        },
        IovecEntry::Pvbuf { id, .. } => Paddr::Pvbuf(id),
        IovecEntry::Long(v) => Paddr::Long(v),
    }
}

struct PbufSlot {
    data: Vec<u8>,
    refcount: u32,
}

struct PvbufNode {
    iovecs: Vec<IovecEntry>,
}

/// Classifies an allocation request into a power-of-two size bucket,
/// trading off slack against pbuf count via `fact` (spec §4.7 "Allocation").
/// `fact == 0` always prefers the bigger bucket (fewest pbufs, most slack);
/// `fact == 65536` prefers the smaller bucket unless `remaining` fills the
/// bigger one exactly.
fn pick_chunk_size(remaining: usize, fact: u32) -> usize {
    const BASE_SHIFT: u32 = 6; // 64 bytes
    const MAX_SHIFT: u32 = 16; // 65536 bytes
    let ceil_log2 = if remaining <= 1 {
        0
    } else {
        usize::BITS - (remaining - 1).leading_zeros()
    };
    let shift = ceil_log2.clamp(BASE_SHIFT, MAX_SHIFT);
    let bigger = 1usize << shift;
    if shift == BASE_SHIFT {
        return bigger;
    }
    let smaller = 1usize << (shift - 1);
    let limit = ((fact as u64) * (bigger as u64)) >> 16;
    if remaining as u64 > limit {
        bigger
    } else {
        smaller
    }
}

/// The packet buffer manager: an arena of pbuf slots and pvbuf nodes, plus
/// the `fact` slack policy (spec §4.7 "Allocation", §6.4 `pvbuf_init`).
pub struct PvbufMgr {
    pbufs: Vec<Option<PbufSlot>>,
    pbuf_free: Vec<u32>,
    pvbufs: Vec<Option<PvbufNode>>,
    pvbuf_free: Vec<u32>,
    fact: u32,
    iovecs_per_node: usize,
}

impl PvbufMgr {
    /// A manager with the given slack-tolerance `fact` (spec §4.7,
    /// `fact ∈ [0, 65536]`) and the default iovec-array size class.
    #[must_use]
    pub fn new(fact: u32) -> Self {
        Self {
            pbufs: Vec::new(),
            pbuf_free: Vec::new(),
            pvbufs: Vec::new(),
            pvbuf_free: Vec::new(),
            fact,
            iovecs_per_node: 8,
        }
    }

    /// Override the per-pvbuf-node iovec array size (min 2, per spec §3).
    #[must_use]
    pub fn with_iovecs_per_node(mut self, n: usize) -> Self {
        self.iovecs_per_node = n.max(2);
        self
    }

    fn new_pbuf(&mut self, size: usize) -> PbufId {
        let slot = PbufSlot {
            data: vec![0u8; size],
            refcount: 1,
        };
        if let Some(free) = self.pbuf_free.pop() {
            self.pbufs[free as usize] = Some(slot);
            PbufId(free)
        } else {
            self.pbufs.push(Some(slot));
            PbufId((self.pbufs.len() - 1) as u32)
        }
    }

    fn push_pvbuf(&mut self, node: PvbufNode) -> PvbufId {
        if let Some(free) = self.pvbuf_free.pop() {
            self.pvbufs[free as usize] = Some(node);
            PvbufId(free)
        } else {
            self.pvbufs.push(Some(node));
            PvbufId((self.pvbufs.len() - 1) as u32)
        }
    }

    fn alloc_node(&mut self, mut remaining: usize) -> PvbufId {
        let cap = self.iovecs_per_node;
        let mut iovecs = vec![IovecEntry::Empty; cap];
        let mut idx = 0;
        while remaining > 0 {
            if idx == cap - 1 {
                let child = self.alloc_node(remaining);
                let child_len = remaining;
                iovecs[idx] = IovecEntry::Pvbuf {
                    id: child,
                    len: if child_len < MAX_ENCODABLE_LEN {
                        child_len
                    } else {
                        0
                    },
                };
                break;
            }
            let take = pick_chunk_size(remaining, self.fact).min(remaining);
            let id = self.new_pbuf(take);
            iovecs[idx] = IovecEntry::Pbuf {
                id,
                one_ref: true,
                offset: 0,
                len: take,
            };
            remaining -= take;
            idx += 1;
        }
        self.push_pvbuf(PvbufNode { iovecs })
    }

    /// Allocate `size` bytes, possibly as a chain of pbufs across nested
    /// pvbuf nodes (spec §4.7 "Allocation").
    #[must_use]
    pub fn alloc(&mut self, size: usize) -> Paddr {
        if size == 0 {
            let id = self.new_pbuf(0);
            return Paddr::Pbuf {
                id,
                one_ref: true,
                offset: 0,
                len: 0,
            };
        }
        Paddr::Pvbuf(self.alloc_node(size))
    }

    fn decref_pbuf(&mut self, id: PbufId) {
        if let Some(slot) = &mut self.pbufs[id.0 as usize] {
            slot.refcount -= 1;
            if slot.refcount == 0 {
                self.pbufs[id.0 as usize] = None;
                self.pbuf_free.push(id.0);
            }
        }
    }

    fn free_node(&mut self, id: PvbufId) {
        if let Some(node) = self.pvbufs[id.0 as usize].take() {
            for e in node.iovecs {
                match e {
                    IovecEntry::Pbuf { id, .. } => self.decref_pbuf(id),
                    IovecEntry::Pvbuf { id, .. } => self.free_node(id),
                    _ => {}
                }
            }
            self.pvbuf_free.push(id.0);
        }
    }

    /// Release `paddr`. `PVBUF` entries are walked and every leaf
    /// decref'd; `PBUF`/`PBUF_1REF` entries are decref'd directly.
    pub fn free(&mut self, paddr: Paddr) {
        match paddr {
            Paddr::Pbuf { id, .. } => self.decref_pbuf(id),
            Paddr::Pvbuf(id) => self.free_node(id),
            _ => {}
        }
    }

    /// Total logical byte length addressed by `paddr`.
    #[must_use]
    pub fn total_len(&self, paddr: Paddr) -> usize {
        match paddr {
            Paddr::Null => 0,
            Paddr::Pbuf { len, .. } => len,
            Paddr::Long(_) => 16,
            Paddr::Short { .. } => 0,
            Paddr::Pvbuf(id) => self.pvbufs[id.0 as usize]
                .as_ref()
                .map(|n| {
                    n.iovecs
                        .iter()
                        .map(|e| match e {
                            IovecEntry::Empty => 0,
                            IovecEntry::Pbuf { len, .. } => *len,
                            IovecEntry::Pvbuf { id, len } => {
                                if *len > 0 {
                                    *len
                                } else {
                                    self.total_len(Paddr::Pvbuf(*id))
                                }
                            }
                            IovecEntry::Long(_) => 16,
                        })
                        .sum()
                })
                .unwrap_or(0),
        }
    }

    fn paddr_to_entry(&self, p: Paddr) -> IovecEntry {
        match p {
            Paddr::Null | Paddr::Short { .. } => IovecEntry::Empty,
            Paddr::Pbuf {
                id,
                one_ref,
                offset,
                len,
            } => IovecEntry::Pbuf {
                id,
                one_ref,
                offset,
                len,
            },
            Paddr::Pvbuf(id) => {
                let len = self.total_len(Paddr::Pvbuf(id));
                IovecEntry::Pvbuf {
                    id,
                    len: if len < MAX_ENCODABLE_LEN { len } else { 0 },
                }
            }
            Paddr::Long(v) => IovecEntry::Long(v),
        }
    }

    fn entry_for_addend(&self, addend: Paddr, length: usize) -> IovecEntry {
        match addend {
            Paddr::Null | Paddr::Short { .. } => IovecEntry::Empty,
            Paddr::Pbuf { id, one_ref, offset, .. } => IovecEntry::Pbuf {
                id,
                one_ref,
                offset,
                len: length,
            },
            Paddr::Pvbuf(id) => IovecEntry::Pvbuf {
                id,
                len: if length < MAX_ENCODABLE_LEN { length } else { 0 },
            },
            Paddr::Long(v) => IovecEntry::Long(v),
        }
    }

    fn insert_edge(&mut self, host: Paddr, addend: Paddr, length: usize, front: bool) -> Paddr {
        match host {
            Paddr::Pvbuf(id) => {
                let cap = self.pvbufs[id.0 as usize].as_ref().unwrap().iovecs.len();
                let slot_idx = if front { 0 } else { cap - 1 };
                let cur = self.pvbufs[id.0 as usize].as_ref().unwrap().iovecs[slot_idx];
                match cur {
                    IovecEntry::Empty => {
                        let entry = self.entry_for_addend(addend, length);
                        self.pvbufs[id.0 as usize].as_mut().unwrap().iovecs[slot_idx] = entry;
                        host
                    }
                    IovecEntry::Pvbuf { id: child, .. } => {
                        self.insert_edge(Paddr::Pvbuf(child), addend, length, front);
                        let new_len = self.total_len(Paddr::Pvbuf(child));
                        self.pvbufs[id.0 as usize].as_mut().unwrap().iovecs[slot_idx] =
                            IovecEntry::Pvbuf {
                                id: child,
                                len: if new_len < MAX_ENCODABLE_LEN { new_len } else { 0 },
                            };
                        host
                    }
                    _ => {
                        let old_entry = cur;
                        let add_entry = self.entry_for_addend(addend, length);
                        let mut new_iovecs = vec![IovecEntry::Empty; cap];
                        if front {
                            new_iovecs[0] = add_entry;
                            new_iovecs[1] = old_entry;
                        } else {
                            new_iovecs[cap - 2] = old_entry;
                            new_iovecs[cap - 1] = add_entry;
                        }
                        let new_id = self.push_pvbuf(PvbufNode { iovecs: new_iovecs });
                        self.pvbufs[id.0 as usize].as_mut().unwrap().iovecs[slot_idx] =
                            IovecEntry::Pvbuf { id: new_id, len: 0 };
                        host
                    }
                }
            }
            _ => {
                let cap = self.iovecs_per_node;
                let mut iovecs = vec![IovecEntry::Empty; cap];
                let host_entry = self.paddr_to_entry(host);
                let add_entry = self.entry_for_addend(addend, length);
                if front {
                    iovecs[0] = add_entry;
                    iovecs[1] = host_entry;
                } else {
                    iovecs[cap - 2] = host_entry;
                    iovecs[cap - 1] = add_entry;
                }
                Paddr::Pvbuf(self.push_pvbuf(PvbufNode { iovecs }))
            }
        }
    }

    /// Splice `addend` onto the front of `host` (spec §4.7 "Prepend and
    /// append"): an empty front slot, a nested front `PVBUF` to recurse
    /// into, or, failing both, a new wrapping node.
    #[must_use]
    pub fn prepend(&mut self, host: Paddr, addend: Paddr, length: usize) -> Paddr {
        self.insert_edge(host, addend, length, true)
    }

    /// Symmetric to [`Self::prepend`], splicing onto the back.
    #[must_use]
    pub fn append(&mut self, host: Paddr, addend: Paddr, length: usize) -> Paddr {
        self.insert_edge(host, addend, length, false)
    }

    fn maybe_compress(&mut self, id: PvbufId) -> Paddr {
        let non_empty: Vec<IovecEntry> = self.pvbufs[id.0 as usize]
            .as_ref()
            .unwrap()
            .iovecs
            .iter()
            .filter(|e| !matches!(e, IovecEntry::Empty))
            .copied()
            .collect();
        if non_empty.len() == 1 {
            self.pvbufs[id.0 as usize] = None;
            self.pvbuf_free.push(id.0);
            entry_to_paddr(non_empty[0])
        } else {
            Paddr::Pvbuf(id)
        }
    }

    fn pop_front_rec(
        &mut self,
        paddr: Paddr,
        remaining: &mut usize,
        compress: bool,
        copy_out: &mut Option<&mut [u8]>,
        copied: &mut usize,
    ) -> Paddr {
        if *remaining == 0 {
            return paddr;
        }
        match paddr {
            Paddr::Pbuf {
                id,
                one_ref,
                offset,
                len,
            } => {
                let take = (*remaining).min(len);
                if let Some(buf) = copy_out.as_deref_mut()
                    && *copied < buf.len()
                        && let Some(slot) = &self.pbufs[id.0 as usize] {
                            let n = take.min(buf.len() - *copied);
                            buf[*copied..*copied + n].copy_from_slice(&slot.data[offset..offset + n]);
                            *copied += n;
                        }
                *remaining -= take;
                let new_len = len - take;
                if new_len == 0 {
                    self.decref_pbuf(id);
                    Paddr::Null
                } else {
                    Paddr::Pbuf {
                        id,
                        one_ref,
                        offset: offset + take,
                        len: new_len,
                    }
                }
            }
            Paddr::Pvbuf(id) => {
                let cap = self.pvbufs[id.0 as usize].as_ref().unwrap().iovecs.len();
                for idx in 0..cap {
                    if *remaining == 0 {
                        break;
                    }
                    let entry = self.pvbufs[id.0 as usize].as_ref().unwrap().iovecs[idx];
                    let child = match entry {
                        IovecEntry::Empty | IovecEntry::Long(_) => continue,
                        IovecEntry::Pbuf {
                            id,
                            one_ref,
                            offset,
                            len,
                        } => Paddr::Pbuf {
                            id,
                            one_ref,
                            offset,
                            len,
                        },
                        IovecEntry::Pvbuf { id, .. } => Paddr::Pvbuf(id),
                    };
                    let new_child = self.pop_front_rec(child, remaining, compress, copy_out, copied);
                    let new_entry = self.paddr_to_entry(new_child);
                    self.pvbufs[id.0 as usize].as_mut().unwrap().iovecs[idx] = new_entry;
                }
                self.finish_pop(id, compress)
            }
            _ => paddr,
        }
    }

    fn pop_back_rec(
        &mut self,
        paddr: Paddr,
        remaining: &mut usize,
        compress: bool,
        removed: &mut Vec<u8>,
    ) -> Paddr {
        if *remaining == 0 {
            return paddr;
        }
        match paddr {
            Paddr::Pbuf {
                id,
                one_ref,
                offset,
                len,
            } => {
                let take = (*remaining).min(len);
                if let Some(slot) = &self.pbufs[id.0 as usize] {
                    let tail = &slot.data[offset + len - take..offset + len];
                    removed.splice(0..0, tail.iter().copied());
                }
                *remaining -= take;
                let new_len = len - take;
                if new_len == 0 {
                    self.decref_pbuf(id);
                    Paddr::Null
                } else {
                    Paddr::Pbuf {
                        id,
                        one_ref,
                        offset,
                        len: new_len,
                    }
                }
            }
            Paddr::Pvbuf(id) => {
                let cap = self.pvbufs[id.0 as usize].as_ref().unwrap().iovecs.len();
                for idx in (0..cap).rev() {
                    if *remaining == 0 {
                        break;
                    }
                    let entry = self.pvbufs[id.0 as usize].as_ref().unwrap().iovecs[idx];
                    let child = match entry {
                        IovecEntry::Empty | IovecEntry::Long(_) => continue,
                        IovecEntry::Pbuf {
                            id,
                            one_ref,
                            offset,
                            len,
                        } => Paddr::Pbuf {
                            id,
                            one_ref,
                            offset,
                            len,
                        },
                        IovecEntry::Pvbuf { id, .. } => Paddr::Pvbuf(id),
                    };
                    let new_child = self.pop_back_rec(child, remaining, compress, removed);
                    let new_entry = self.paddr_to_entry(new_child);
                    self.pvbufs[id.0 as usize].as_mut().unwrap().iovecs[idx] = new_entry;
                }
                self.finish_pop(id, compress)
            }
            _ => paddr,
        }
    }

    fn finish_pop(&mut self, id: PvbufId, compress: bool) -> Paddr {
        let empty = self.pvbufs[id.0 as usize]
            .as_ref()
            .unwrap()
            .iovecs
            .iter()
            .all(|e| matches!(e, IovecEntry::Empty));
        if empty {
            self.pvbufs[id.0 as usize] = None;
            self.pvbuf_free.push(id.0);
            Paddr::Null
        } else if compress {
            self.maybe_compress(id)
        } else {
            Paddr::Pvbuf(id)
        }
    }

    /// Remove `n` bytes from the front (spec §4.7 "Pop head and pop
    /// tail"). `compress` folds a now-single-entry node up into its lone
    /// child. `copy_out`, if given, receives the removed bytes in logical
    /// (forward) order.
    #[must_use]
    pub fn pop_hdrs(
        &mut self,
        paddr: Paddr,
        n: usize,
        compress: bool,
        mut copy_out: Option<&mut [u8]>,
    ) -> Paddr {
        let mut remaining = n;
        let mut copied = 0usize;
        self.pop_front_rec(paddr, &mut remaining, compress, &mut copy_out, &mut copied)
    }

    /// Symmetric to [`Self::pop_hdrs`], removing from the back.
    #[must_use]
    pub fn pop_trailers(
        &mut self,
        paddr: Paddr,
        n: usize,
        compress: bool,
        copy_out: Option<&mut [u8]>,
    ) -> Paddr {
        let mut remaining = n;
        let mut removed = Vec::new();
        let result = self.pop_back_rec(paddr, &mut remaining, compress, &mut removed);
        if let Some(buf) = copy_out {
            let take = buf.len().min(removed.len());
            buf[..take].copy_from_slice(&removed[..take]);
        }
        result
    }

    fn clone_rec(
        &mut self,
        src: Paddr,
        skip: &mut usize,
        need: &mut usize,
        actual: &mut usize,
        out: &mut Vec<IovecEntry>,
    ) {
        if *need == 0 {
            return;
        }
        match src {
            Paddr::Pbuf {
                id,
                offset,
                len,
                ..
            } => {
                if *skip >= len {
                    *skip -= len;
                    return;
                }
                let eff_offset = offset + *skip;
                let avail = len - *skip;
                let take = avail.min(*need);
                if let Some(slot) = self.pbufs.get_mut(id.0 as usize).and_then(|s| s.as_mut()) {
                    slot.refcount += 1;
                }
                out.push(IovecEntry::Pbuf {
                    id,
                    one_ref: false,
                    offset: eff_offset,
                    len: take,
                });
                *skip = 0;
                *need -= take;
                *actual += take;
            }
            Paddr::Pvbuf(id) => {
                let entries = match &self.pvbufs[id.0 as usize] {
                    Some(n) => n.iovecs.clone(),
                    None => return,
                };
                for e in entries {
                    if *need == 0 {
                        break;
                    }
                    match e {
                        IovecEntry::Empty => {}
                        IovecEntry::Pbuf {
                            id: cid,
                            offset,
                            len,
                            ..
                        } => self.clone_rec(
                            Paddr::Pbuf {
                                id: cid,
                                one_ref: false,
                                offset,
                                len,
                            },
                            skip,
                            need,
                            actual,
                            out,
                        ),
                        IovecEntry::Pvbuf { id: cid, .. } => {
                            self.clone_rec(Paddr::Pvbuf(cid), skip, need, actual, out)
                        }
                        IovecEntry::Long(v) => {
                            if *skip >= 16 {
                                *skip -= 16;
                            } else {
                                let take = (16 - *skip).min(*need);
                                out.push(IovecEntry::Long(v));
                                *need -= take;
                                *actual += take;
                                *skip = 0;
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn wrap_entries(&mut self, mut entries: Vec<IovecEntry>) -> Paddr {
        let cap = self.iovecs_per_node;
        if entries.len() <= cap {
            entries.resize(cap, IovecEntry::Empty);
            return Paddr::Pvbuf(self.push_pvbuf(PvbufNode { iovecs: entries }));
        }
        let rest = entries.split_off(cap - 1);
        let nested = self.wrap_entries(rest);
        let nested_entry = self.paddr_to_entry(nested);
        entries.push(nested_entry);
        entries.resize(cap, IovecEntry::Empty);
        Paddr::Pvbuf(self.push_pvbuf(PvbufNode { iovecs: entries }))
    }

    /// Clone `length` bytes starting at `offset` into `src` into a fresh
    /// reference chain, bumping refcounts on every leaf touched (spec §4.7
    /// "Clone"). Returns the new paddr and the actual length cloned, which
    /// may be less than `length` if `src` is shorter.
    #[must_use]
    pub fn clone_range(&mut self, src: Paddr, offset: usize, length: usize) -> (Paddr, usize) {
        let mut skip = offset;
        let mut need = length;
        let mut actual = 0usize;
        let mut out = Vec::new();
        self.clone_rec(src, &mut skip, &mut need, &mut actual, &mut out);
        if out.is_empty() {
            return (Paddr::Null, 0);
        }
        if out.len() == 1 {
            return (entry_to_paddr(out[0]), actual);
        }
        (self.wrap_entries(out), actual)
    }

    /// Depth-first visit of `paddr`'s leaves, delivering flat byte slices
    /// to `cb` in logical order (spec §4.7 "Iterator"). `cb` returning
    /// `false` aborts early; the return value reports whether the full
    /// traversal completed.
    pub fn iterate(&self, paddr: Paddr, cb: &mut dyn FnMut(&[u8]) -> bool) -> bool {
        match paddr {
            Paddr::Pbuf { id, offset, len, .. } => match &self.pbufs[id.0 as usize] {
                Some(slot) => cb(&slot.data[offset..offset + len]),
                None => true,
            },
            Paddr::Pvbuf(id) => {
                if let Some(node) = &self.pvbufs[id.0 as usize] {
                    for e in &node.iovecs {
                        let cont = match *e {
                            IovecEntry::Empty => true,
                            IovecEntry::Pbuf { id, offset, len, .. } => self.iterate(
                                Paddr::Pbuf {
                                    id,
                                    one_ref: false,
                                    offset,
                                    len,
                                },
                                cb,
                            ),
                            IovecEntry::Pvbuf { id, .. } => self.iterate(Paddr::Pvbuf(id), cb),
                            IovecEntry::Long(v) => cb(&v.to_be_bytes()),
                        };
                        if !cont {
                            return false;
                        }
                    }
                }
                true
            }
            Paddr::Long(v) => cb(&v.to_be_bytes()),
            _ => true,
        }
    }

    fn collect_slices<'a>(&'a self, paddr: Paddr, out: &mut Vec<&'a [u8]>) {
        match paddr {
            Paddr::Pbuf { id, offset, len, .. } => {
                if let Some(slot) = &self.pbufs[id.0 as usize] {
                    out.push(&slot.data[offset..offset + len]);
                }
            }
            Paddr::Pvbuf(id) => {
                if let Some(node) = &self.pvbufs[id.0 as usize] {
                    for e in &node.iovecs {
                        match *e {
                            IovecEntry::Pbuf { id, offset, len, .. } => self.collect_slices(
                                Paddr::Pbuf {
                                    id,
                                    one_ref: false,
                                    offset,
                                    len,
                                },
                                out,
                            ),
                            IovecEntry::Pvbuf { id, .. } => {
                                self.collect_slices(Paddr::Pvbuf(id), out)
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Copy up to `len` bytes starting at `offset` out of `paddr` into
    /// `buf` (spec §4.7 "Derived operations"). Returns the number of bytes
    /// actually copied.
    pub fn copy_to(&self, paddr: Paddr, buf: &mut [u8], offset: usize, len: usize) -> usize {
        let mut skipped = 0usize;
        let mut written = 0usize;
        self.iterate(paddr, &mut |chunk: &[u8]| {
            let mut chunk = chunk;
            if skipped < offset {
                let skip_here = (offset - skipped).min(chunk.len());
                skipped += skip_here;
                chunk = &chunk[skip_here..];
            }
            if !chunk.is_empty() {
                let take = chunk.len().min(len - written);
                buf[written..written + take].copy_from_slice(&chunk[..take]);
                written += take;
            }
            written < len
        });
        written
    }

    fn copy_from_rec(
        &mut self,
        paddr: Paddr,
        buf: &[u8],
        offset: usize,
        len: usize,
        skipped: &mut usize,
        written: &mut usize,
    ) {
        if *written >= len {
            return;
        }
        match paddr {
            Paddr::Pbuf {
                id,
                offset: eoff,
                len: elen,
                ..
            } => {
                let mut local_skip = 0;
                if *skipped < offset {
                    local_skip = (offset - *skipped).min(elen);
                    *skipped += local_skip;
                }
                if local_skip >= elen {
                    return;
                }
                let avail = elen - local_skip;
                let take = avail.min(len - *written);
                if let Some(slot) = self.pbufs[id.0 as usize].as_mut() {
                    let start = eoff + local_skip;
                    slot.data[start..start + take]
                        .copy_from_slice(&buf[*written..*written + take]);
                }
                *written += take;
            }
            Paddr::Pvbuf(id) => {
                let entries = match &self.pvbufs[id.0 as usize] {
                    Some(n) => n.iovecs.clone(),
                    None => return,
                };
                for e in entries {
                    if *written >= len {
                        return;
                    }
                    match e {
                        IovecEntry::Pbuf {
                            id: cid,
                            one_ref,
                            offset: eo,
                            len: el,
                        } => self.copy_from_rec(
                            Paddr::Pbuf {
                                id: cid,
                                one_ref,
                                offset: eo,
                                len: el,
                            },
                            buf,
                            offset,
                            len,
                            skipped,
                            written,
                        ),
                        IovecEntry::Pvbuf { id: cid, .. } => {
                            self.copy_from_rec(Paddr::Pvbuf(cid), buf, offset, len, skipped, written)
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    /// Copy `len` bytes from `buf` into `paddr` starting at `offset`.
    pub fn copy_from(&mut self, paddr: Paddr, buf: &[u8], offset: usize, len: usize) -> usize {
        let mut skipped = 0usize;
        let mut written = 0usize;
        self.copy_from_rec(paddr, buf, offset, len, &mut skipped, &mut written);
        written
    }

    /// Running 16-bit one's-complement sum over `len` bytes starting at
    /// `offset`, carrying an odd trailing byte across iovec boundaries
    /// (spec §4.7 "Derived operations").
    #[must_use]
    pub fn checksum(&self, paddr: Paddr, offset: usize, len: usize) -> u16 {
        let mut sum: u32 = 0;
        let mut carry: Option<u8> = None;
        let mut skipped = 0usize;
        let mut counted = 0usize;
        self.iterate(paddr, &mut |chunk: &[u8]| {
            let mut chunk = chunk;
            if skipped < offset {
                let skip_here = (offset - skipped).min(chunk.len());
                skipped += skip_here;
                chunk = &chunk[skip_here..];
            }
            if chunk.is_empty() {
                return counted < len;
            }
            let take = chunk.len().min(len - counted);
            let mut bytes = &chunk[..take];
            if let Some(b) = carry.take() {
                if !bytes.is_empty() {
                    sum += u16::from_be_bytes([b, bytes[0]]) as u32;
                    bytes = &bytes[1..];
                } else {
                    carry = Some(b);
                }
            }
            let mut i = 0;
            while i + 1 < bytes.len() {
                sum += u16::from_be_bytes([bytes[i], bytes[i + 1]]) as u32;
                i += 2;
            }
            if i < bytes.len() {
                carry = Some(bytes[i]);
            }
            counted += take;
            counted < len
        });
        if let Some(b) = carry {
            sum += (b as u32) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    /// Flatten `paddr` into an ordered list of byte slices (the safe Rust
    /// analogue of a `struct iovec[]`, spec §4.7 "Derived operations").
    /// Returns `None` if flattening would need more than `max` entries.
    #[must_use]
    pub fn make_iovecs(&self, paddr: Paddr, max: usize) -> Option<Vec<&[u8]>> {
        let mut out = Vec::new();
        self.collect_slices(paddr, &mut out);
        if out.len() > max {
            None
        } else {
            Some(out)
        }
    }
}

/// A shared, read-only handle to a [`PvbufMgr`] for consumers that only
/// read packet content (e.g. a pipeline stage reading pvbuf-backed input
/// without mutating the manager).
pub type SharedPvbufMgr = Arc<PvbufMgr>;

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(mgr: &PvbufMgr, paddr: Paddr) -> Vec<u8> {
        let mut out = Vec::new();
        mgr.iterate(paddr, &mut |chunk| {
            out.extend_from_slice(chunk);
            true
        });
        out
    }

    #[test]
    fn alloc_copy_iterate_roundtrip() {
        let mut mgr = PvbufMgr::new(0);
        let p = mgr.alloc(100);
        assert_eq!(mgr.total_len(p), 100);
        let data: Vec<u8> = (0..100).map(|i| i as u8).collect();
        mgr.copy_from(p, &data, 0, 100);
        let mut out = vec![0u8; 100];
        let n = mgr.copy_to(p, &mut out, 0, 100);
        assert_eq!(n, 100);
        assert_eq!(out, data);
        mgr.free(p);
    }

    #[test]
    fn append_concatenates_in_order() {
        let mut mgr = PvbufMgr::new(0);
        let a = mgr.alloc(4);
        mgr.copy_from(a, &[1, 2, 3, 4], 0, 4);
        let b = mgr.alloc(4);
        mgr.copy_from(b, &[5, 6, 7, 8], 0, 4);
        let combined = mgr.append(a, b, 4);
        assert_eq!(collect(&mgr, combined), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        mgr.free(combined);
    }

    #[test]
    fn prepend_puts_addend_first() {
        let mut mgr = PvbufMgr::new(0);
        let a = mgr.alloc(2);
        mgr.copy_from(a, &[3, 4], 0, 2);
        let b = mgr.alloc(2);
        mgr.copy_from(b, &[1, 2], 0, 2);
        let combined = mgr.prepend(a, b, 2);
        assert_eq!(collect(&mgr, combined), vec![1, 2, 3, 4]);
        mgr.free(combined);
    }

    #[test]
    fn pop_hdrs_removes_from_front_and_copies_out() {
        let mut mgr = PvbufMgr::new(0);
        let a = mgr.alloc(4);
        mgr.copy_from(a, &[1, 2, 3, 4], 0, 4);
        let b = mgr.alloc(4);
        mgr.copy_from(b, &[5, 6, 7, 8], 0, 4);
        let combined = mgr.append(a, b, 4);
        let mut popped = vec![0u8; 3];
        let rest = mgr.pop_hdrs(combined, 3, true, Some(&mut popped));
        assert_eq!(popped, vec![1, 2, 3]);
        assert_eq!(collect(&mgr, rest), vec![4, 5, 6, 7, 8]);
        mgr.free(rest);
    }

    #[test]
    fn pop_trailers_removes_from_back_in_logical_order() {
        let mut mgr = PvbufMgr::new(0);
        let a = mgr.alloc(4);
        mgr.copy_from(a, &[1, 2, 3, 4], 0, 4);
        let b = mgr.alloc(4);
        mgr.copy_from(b, &[5, 6, 7, 8], 0, 4);
        let combined = mgr.append(a, b, 4);
        let mut popped = vec![0u8; 3];
        let rest = mgr.pop_trailers(combined, 3, true, Some(&mut popped));
        assert_eq!(popped, vec![6, 7, 8]);
        assert_eq!(collect(&mgr, rest), vec![1, 2, 3, 4, 5]);
        mgr.free(rest);
    }

    #[test]
    fn clone_range_references_subset_without_disturbing_original() {
        let mut mgr = PvbufMgr::new(0);
        let a = mgr.alloc(8);
        mgr.copy_from(a, &[1, 2, 3, 4, 5, 6, 7, 8], 0, 8);
        let (clone, actual) = mgr.clone_range(a, 2, 4);
        assert_eq!(actual, 4);
        assert_eq!(collect(&mgr, clone), vec![3, 4, 5, 6]);
        assert_eq!(collect(&mgr, a), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        mgr.free(a);
        mgr.free(clone);
    }

    #[test]
    fn checksum_matches_manual_fold() {
        let mut mgr = PvbufMgr::new(0);
        let p = mgr.alloc(4);
        mgr.copy_from(p, &[0x00, 0x01, 0x00, 0x02], 0, 4);
        let got = mgr.checksum(p, 0, 4);
        assert_eq!(got, 0x0003);
        mgr.free(p);
    }

    #[test]
    fn checksum_carries_odd_byte_across_iovecs() {
        let mut mgr = PvbufMgr::new(0);
        let a = mgr.alloc(3);
        mgr.copy_from(a, &[0x00, 0x01, 0xff], 0, 3);
        let b = mgr.alloc(1);
        mgr.copy_from(b, &[0x01], 0, 1);
        let combined = mgr.append(a, b, 1);
        // Single contiguous buffer [0,1,0xff,1] would fold the same pairs.
        let got = mgr.checksum(combined, 0, 4);
        assert_eq!(got, 0x0001 + 0xff01);
        mgr.free(combined);
    }

    #[test]
    fn make_iovecs_reports_overflow() {
        let mut mgr = PvbufMgr::new(0).with_iovecs_per_node(4);
        let a = mgr.alloc(4);
        let b = mgr.alloc(4);
        let c = mgr.alloc(4);
        let ab = mgr.append(a, b, 4);
        let abc = mgr.append(ab, c, 4);
        assert!(mgr.make_iovecs(abc, 1).is_none());
        assert_eq!(mgr.make_iovecs(abc, 8).unwrap().len(), 3);
        mgr.free(abc);
    }
}
