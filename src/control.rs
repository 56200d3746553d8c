/*! The control block flowed through every engine call (spec §3 "Control
Block", §6.3).
*/

use crate::node::NodeId;

/// Packet-identifying fields, set once by the caller before `parse()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PktInfo {
    /// Length of the packet in bytes, as handed to `parse()`.
    pub pkt_len: usize,
    /// Caller-supplied sequence number, opaque to the engine.
    pub seqno: u64,
}

/// The current header window. Updated by the engine before every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct HdrInfo {
    /// Offset of the current header from the start of the packet.
    pub hdr_offset: usize,
    /// Length of the current header.
    pub hdr_len: usize,
}

/// Engine-owned bookkeeping. Never written by user ops.
#[derive(Debug, Clone, Default)]
pub struct VarState {
    /// Number of encapsulation boundaries crossed so far.
    pub encaps: u32,
    /// Current TLV nesting depth.
    pub tlv_levels: u32,
    /// Terminal code of the most recently completed `parse()` call.
    pub ret_code: i32,
    /// Id of the last parse node visited.
    pub last_node: Option<NodeId>,
}

/// Per-call scratch available to user ops: small fixed vectors of `keys`
/// (used for `next_proto_keyin` dispatch) and free-form `counters`.
#[derive(Debug, Clone)]
pub struct KeyState {
    /// Keys addressable by `key_sel` on a [`crate::node::ParseNode`].
    pub keys: Vec<i64>,
    /// Scratch counters available to user ops across the whole call.
    pub counters: Vec<i64>,
}

impl KeyState {
    /// Allocate a key/counter scratch area sized per [`crate::parser::ParserConfig`].
    #[must_use]
    pub fn new(num_keys: usize, num_counters: usize) -> Self {
        Self {
            keys: vec![0; num_keys],
            counters: vec![0; num_counters],
        }
    }
}

/// Control block threaded through a single `parse()` invocation (spec §3,
/// §6.3). Owned by the calling thread for the duration of the call.
#[derive(Debug, Clone)]
pub struct ControlBlock {
    /// Packet-level info.
    pub pkt: PktInfo,
    /// Current header window.
    pub hdr: HdrInfo,
    /// Engine-owned state.
    pub var: VarState,
    /// User scratch.
    pub key: KeyState,
}

impl ControlBlock {
    /// Create a fresh control block for a packet of `pkt_len` bytes, with
    /// `num_keys`/`num_counters` scratch slots (from [`crate::parser::ParserConfig`]).
    #[must_use]
    pub fn new(pkt_len: usize, num_keys: usize, num_counters: usize) -> Self {
        Self {
            pkt: PktInfo { pkt_len, seqno: 0 },
            hdr: HdrInfo::default(),
            var: VarState::default(),
            key: KeyState::new(num_keys, num_counters),
        }
    }
}
