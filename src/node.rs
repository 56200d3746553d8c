/*! Parse graph data model (spec §3 "Parse Graph").

A [`ParseNode`] pairs a [`crate::proto::ProtoDef`] contract with the
metadata-extraction ops the engine invokes at that node, plus whatever
dispatch table routes to the next node. TLV/flag-field/array sub-structure
entries get their own lighter node types ([`TlvNode`], [`FlagFieldNode`],
[`ArrNode`]) since they don't need a full next-proto dispatch table of
their own; TLVs route through an optional nested node or overlay table
instead (spec §4.2.1).
*/

use std::collections::HashMap;
use std::sync::Arc;

use crate::control::ControlBlock;
use crate::proto::{ArrayOps, FlagFieldsOps, NodeType, ProtoDef, ProtoDefVariant, TlvsOps};

/// Opaque identifier for a [`ParseNode`], stable for the lifetime of a
/// parse graph. Used in [`crate::control::VarState::last_node`] and in
/// debug traces; graphs assign these at build time in construction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

type ExtractFn<Mm, Fr> = dyn Fn(&[u8], usize, &mut Mm, &mut Fr, &mut ControlBlock) + Send + Sync;
type HandlerFn<Mm, Fr> =
    dyn Fn(&[u8], usize, &mut Mm, &mut Fr, &mut ControlBlock) -> i32 + Send + Sync;

/// Metadata-extraction ops for a single node (spec §3 "extract_metadata /
/// handler / post_handler"). Every field is optional: an absent op is a
/// no-op for `extract_metadata`, and `OKAY` for the two handlers.
pub struct NodeOps<Mm, Fr> {
    /// Copy fields out of the header into `mm`/`frame`. Cannot fail.
    pub extract_metadata: Option<Arc<ExtractFn<Mm, Fr>>>,
    /// Run after metadata extraction, before the sub-structure loop. A
    /// non-`OKAY` return is terminal.
    pub handler: Option<Arc<HandlerFn<Mm, Fr>>>,
    /// Run after the sub-structure loop, before next-proto dispatch.
    pub post_handler: Option<Arc<HandlerFn<Mm, Fr>>>,
}

impl<Mm, Fr> Default for NodeOps<Mm, Fr> {
    fn default() -> Self {
        Self {
            extract_metadata: None,
            handler: None,
            post_handler: None,
        }
    }
}

impl<Mm, Fr> Clone for NodeOps<Mm, Fr> {
    fn clone(&self) -> Self {
        Self {
            extract_metadata: self.extract_metadata.clone(),
            handler: self.handler.clone(),
            post_handler: self.post_handler.clone(),
        }
    }
}

/// Next-protocol dispatch table keyed by an `i32` protocol/type code (spec
/// §3 "proto_table"). Exact-match only; see `dtable` for the richer
/// ternary/LPM lookup flavors available to protocol modules that need them
/// for their own metadata (e.g. routing keys), independent of this table.
pub struct ProtoTable<Mm, Fr> {
    entries: HashMap<i32, Arc<ParseNode<Mm, Fr>>>,
}

impl<Mm, Fr> ProtoTable<Mm, Fr> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the node dispatched to for `key`.
    pub fn insert(&mut self, key: i32, node: Arc<ParseNode<Mm, Fr>>) {
        self.entries.insert(key, node);
    }

    /// Look up the node for `key`.
    #[must_use]
    pub fn lookup(&self, key: i32) -> Option<&Arc<ParseNode<Mm, Fr>>> {
        self.entries.get(&key)
    }

    /// Iterate over every target node, regardless of key; used by the
    /// fast-path validator's graph walk (spec §4.6).
    pub fn values(&self) -> impl Iterator<Item = &Arc<ParseNode<Mm, Fr>>> {
        self.entries.values()
    }
}

impl<Mm, Fr> Default for ProtoTable<Mm, Fr> {
    fn default() -> Self {
        Self::new()
    }
}

/// A TLV entry's own contract (spec §4.2.1). Distinct from the enclosing
/// TLVs header's `tlv_min_len` default; this is the per-entry-type
/// minimum, plus the nested/overlay key ops that belong to this specific
/// TLV type rather than the enclosing block.
type NestedOffsetFn = Arc<dyn Fn(&[u8], usize) -> usize + Send + Sync>;
type OverlayTypeFn = Arc<dyn Fn(&[u8]) -> i32 + Send + Sync>;

#[derive(Clone)]
/// Per-TLV-type overrides layered on top of a [`TlvsOps`](crate::proto::TlvsOps)
/// block (spec §4.2.1 "per-type entry" extension).
pub struct TlvEntryDef {
    /// Minimum length for this specific TLV type; a shorter entry is
    /// treated as unknown (spec §4.2.1 step 1).
    pub min_len: usize,
    /// Offset of a nested TLV block within this entry's value. `None`
    /// means offset 0.
    pub nested_offset: Option<NestedOffsetFn>,
    /// Overlay dispatch key. `None` means the overlay table is keyed by
    /// `tlv_len` itself (spec §4.2.1 step 4).
    pub overlay_type: Option<OverlayTypeFn>,
}

/// Table mapping a TLV type code to the node that handles it (spec §4.2).
pub struct TlvTable<Mm, Fr> {
    entries: HashMap<i32, Arc<TlvNode<Mm, Fr>>>,
}

impl<Mm, Fr> TlvTable<Mm, Fr> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the node dispatched to for `tlv_type`.
    pub fn insert(&mut self, tlv_type: i32, node: Arc<TlvNode<Mm, Fr>>) {
        self.entries.insert(tlv_type, node);
    }

    /// Look up the node for `tlv_type`.
    #[must_use]
    pub fn lookup(&self, tlv_type: i32) -> Option<&Arc<TlvNode<Mm, Fr>>> {
        self.entries.get(&tlv_type)
    }
}

impl<Mm, Fr> Default for TlvTable<Mm, Fr> {
    fn default() -> Self {
        Self::new()
    }
}

/// A single TLV type's handling (spec §3 "TLV Parse Node", §4.2.1). May own
/// a nested TLV sub-graph and/or an overlay table that re-dispatches on a
/// second key without advancing past the entry (goto-like re-entry into
/// step 1, per spec §4.2.1).
pub struct TlvNode<Mm, Fr> {
    /// Name used in debug traces.
    pub name: &'static str,
    /// This entry's own min-length contract, if the TLV loop should check
    /// it independently of the enclosing header's `tlv_min_len` default.
    pub entry_def: Option<TlvEntryDef>,
    /// Metadata-extraction ops run when this entry type is dispatched to.
    pub ops: NodeOps<Mm, Fr>,
    /// A nested TLV block inside this entry's value, reusing the same TLV
    /// sub-loop machinery (spec §4.2.1 "nested TLVs").
    pub nested_node: Option<Arc<ParseNode<Mm, Fr>>>,
    /// Overlay dispatch, keyed by `overlay_type` (spec §4.2.1).
    pub overlay_table: Option<TlvTable<Mm, Fr>>,
    /// Fallback entry for an overlay key with no table match.
    pub overlay_wildcard: Option<Arc<TlvNode<Mm, Fr>>>,
    /// Return code when an overlay key matches neither the table nor the
    /// wildcard.
    pub unknown_overlay_ret: i32,
}

/// Table mapping a flag-fields index to the node that extracts it (spec
/// §4.3). Missing entries are silently skipped; absence of a handler is
/// not an error for flag fields, unlike TLVs and arrays.
pub struct FlagFieldTable<Mm, Fr> {
    entries: HashMap<usize, Arc<FlagFieldNode<Mm, Fr>>>,
}

impl<Mm, Fr> FlagFieldTable<Mm, Fr> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the node dispatched to for flag `index`.
    pub fn insert(&mut self, index: usize, node: Arc<FlagFieldNode<Mm, Fr>>) {
        self.entries.insert(index, node);
    }

    /// Look up the node for flag `index`.
    #[must_use]
    pub fn lookup(&self, index: usize) -> Option<&Arc<FlagFieldNode<Mm, Fr>>> {
        self.entries.get(&index)
    }
}

impl<Mm, Fr> Default for FlagFieldTable<Mm, Fr> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ops for one flag-gated field (spec §4.3). No sub-structure, no handler
/// return value; the spec requires the flag-fields loop to ignore handler
/// return codes, since a field is either present or it isn't.
pub struct FlagFieldNode<Mm, Fr> {
    /// Name used in debug traces.
    pub name: &'static str,
    /// Metadata-extraction ops run when this flag is set.
    pub ops: NodeOps<Mm, Fr>,
}

/// Table mapping an array element type to the node that handles it (spec
/// §4.4).
pub struct ArrayTable<Mm, Fr> {
    entries: HashMap<i32, Arc<ArrNode<Mm, Fr>>>,
}

impl<Mm, Fr> ArrayTable<Mm, Fr> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or replace the node dispatched to for `el_type`.
    pub fn insert(&mut self, el_type: i32, node: Arc<ArrNode<Mm, Fr>>) {
        self.entries.insert(el_type, node);
    }

    /// Look up the node for `el_type`.
    #[must_use]
    pub fn lookup(&self, el_type: i32) -> Option<&Arc<ArrNode<Mm, Fr>>> {
        self.entries.get(&el_type)
    }
}

impl<Mm, Fr> Default for ArrayTable<Mm, Fr> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ops for one array element type (spec §4.4). Fixed stride, no nesting.
pub struct ArrNode<Mm, Fr> {
    /// Name used in debug traces.
    pub name: &'static str,
    /// Metadata-extraction ops run for each element of this type.
    pub ops: NodeOps<Mm, Fr>,
}

/// Node-type-specific sub-structure table, carried by [`ParseNode`] in
/// addition to its always-present `proto_table` (spec §3: "a node variant
/// additionally carries a node-type-specific table").
pub enum NodeKind<Mm, Fr> {
    /// No sub-structure loop; this node only dispatches to a next proto.
    Plain,
    /// TLV sub-loop (spec §4.2).
    Tlvs {
        /// Dispatch by TLV type.
        table: Option<TlvTable<Mm, Fr>>,
        /// Fallback entry for a TLV type with no table match.
        wildcard: Option<Arc<TlvNode<Mm, Fr>>>,
        /// Return code when a TLV type matches neither the table nor the
        /// wildcard.
        unknown_tlv_type_ret: i32,
        /// Per-node override of `ParserConfig::max_tlvs`, if set.
        max_tlvs: Option<usize>,
    },
    /// Flag-fields sub-loop (spec §4.3).
    FlagFields {
        /// Dispatch by flag index.
        table: FlagFieldTable<Mm, Fr>,
    },
    /// Array sub-loop (spec §4.4).
    Array {
        /// Dispatch by array element type.
        table: Option<ArrayTable<Mm, Fr>>,
        /// Fallback entry for an element type with no table match.
        wildcard: Option<Arc<ArrNode<Mm, Fr>>>,
        /// Return code when an element type matches neither the table nor
        /// the wildcard.
        unknown_array_type_ret: i32,
    },
}

impl<Mm, Fr> NodeKind<Mm, Fr> {
    /// The `NodeType` this kind corresponds to.
    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Plain => NodeType::Plain,
            Self::Tlvs { .. } => NodeType::Tlvs,
            Self::FlagFields { .. } => NodeType::FlagFields,
            Self::Array { .. } => NodeType::Array,
        }
    }
}

/// A node in the parse graph (spec §3 "Parse Node"). Generic over the
/// shared encapsulation metadata type `Mm` and the per-frame type `Fr`
/// (Design Note §9: the `void *metadata` callback parameter becomes a
/// concrete type parameter threaded through the engine).
pub struct ParseNode<Mm, Fr> {
    /// Stable identifier assigned at graph-construction time.
    pub id: NodeId,
    /// Name used in debug traces.
    pub name: &'static str,
    /// This node's protocol contract (header length, next-proto key, ...).
    pub proto_def: Arc<ProtoDef>,
    /// Metadata-extraction ops run at this node.
    pub ops: NodeOps<Mm, Fr>,
    /// Dispatch to the next parse node, keyed by `proto_def.next_proto` (or
    /// `next_proto_keyin` when `key_sel` is set).
    pub proto_table: Option<ProtoTable<Mm, Fr>>,
    /// Fallback next node for a protocol key with no table match.
    pub wildcard_node: Option<Arc<ParseNode<Mm, Fr>>>,
    /// Return code when a protocol key matches neither the table nor the
    /// wildcard.
    pub unknown_ret: i32,
    /// Index into `ControlBlock::key::keys` used instead of a header field
    /// when `proto_def.next_proto_keyin` is set.
    pub key_sel: Option<usize>,
    /// If true, a zero-length remaining header at this node is success
    /// (`STOP_OKAY`) rather than `STOP_LENGTH`.
    pub zero_len_ok: bool,
    /// Which sub-structure loop, if any, this node runs.
    pub kind: NodeKind<Mm, Fr>,
}

impl<Mm, Fr> ParseNode<Mm, Fr> {
    /// Build a plain (no sub-structure) node with no dispatch table (a
    /// leaf, until `proto_table`/`wildcard_node` are attached).
    #[must_use]
    pub fn new(id: NodeId, name: &'static str, proto_def: Arc<ProtoDef>) -> Self {
        let variant_matches = matches!(
            (&proto_def.node_type, &proto_def.variant),
            (NodeType::Plain, ProtoDefVariant::Plain)
                | (NodeType::Tlvs, ProtoDefVariant::Tlvs(_))
                | (NodeType::FlagFields, ProtoDefVariant::FlagFields(_))
                | (NodeType::Array, ProtoDefVariant::Array(_))
        );
        assert!(
            variant_matches,
            "proto_def variant must match node_type at construction",
        );
        Self {
            id,
            name,
            proto_def,
            ops: NodeOps::default(),
            proto_table: None,
            wildcard_node: None,
            unknown_ret: crate::error::ReturnCode::STOP_UNKNOWN_PROTO.0,
            key_sel: None,
            zero_len_ok: false,
            kind: NodeKind::Plain,
        }
    }

    /// This node's TLV-header ops, if its `proto_def` is a TLVs variant.
    #[must_use]
    pub fn tlvs_ops(&self) -> Option<&TlvsOps> {
        match &self.proto_def.variant {
            ProtoDefVariant::Tlvs(ops) => Some(ops),
            _ => None,
        }
    }

    /// This node's flag-fields ops, if its `proto_def` is a FlagFields
    /// variant.
    #[must_use]
    pub fn flag_fields_ops(&self) -> Option<&FlagFieldsOps> {
        match &self.proto_def.variant {
            ProtoDefVariant::FlagFields(ops) => Some(ops),
            _ => None,
        }
    }

    /// This node's array ops, if its `proto_def` is an Array variant.
    #[must_use]
    pub fn array_ops(&self) -> Option<&ArrayOps> {
        match &self.proto_def.variant {
            ProtoDefVariant::Array(ops) => Some(ops),
            _ => None,
        }
    }
}
