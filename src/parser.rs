/*! The root of a parse graph and its tunables (spec §3 "Parser", §6.1,
§6.2).
*/

use std::collections::HashMap;
use std::sync::Arc;

use crate::node::ParseNode;

/// Tunables bounding a `parse()` call (spec §6.2 "Config Surface"). These
/// are the caps the engine enforces as it walks the graph; exceeding any of
/// them is a terminal but expected outcome (`STOP_*`), not a panic.
#[derive(Debug, Clone, Copy)]
pub struct ParserConfig {
    /// Max encapsulation boundaries before `STOP_ENCAP_DEPTH`.
    pub max_encaps: u32,
    /// Max parse nodes visited before `STOP_MAX_NODES`.
    pub max_nodes: u32,
    /// Max TLV entries per TLVs node before `STOP_OPTION_LIMIT`, when the
    /// node itself doesn't set a tighter `max_tlvs`.
    pub max_tlvs: usize,
    /// Number of per-frame metadata slots allocated for encapsulation.
    pub max_frames: usize,
    /// Size of the `ControlBlock::key::keys` scratch vector.
    pub num_keys: usize,
    /// Size of the `ControlBlock::key::counters` scratch vector.
    pub num_counters: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_encaps: 4,
            max_nodes: 64,
            max_tlvs: 16,
            max_frames: 4,
            num_keys: 4,
            num_counters: 4,
        }
    }
}

/// A parse graph rooted at `root`, with the config that bounds every
/// `parse()` call through it (spec §3 "Parser"). `okay_node`/`fail_node`
/// are the exit-hook entry points run after the main loop terminates
/// (spec §4.5); `atencap_node` runs once per encapsulation boundary
/// crossed, independent of the terminal outcome.
pub struct Parser<Mm, Fr> {
    /// Entry point of the parse graph.
    pub root: Arc<ParseNode<Mm, Fr>>,
    /// Tunables bounding every `parse()` call through this graph.
    pub config: ParserConfig,
    /// Run once after the main loop reaches a successful terminal code.
    pub okay_node: Option<Arc<ParseNode<Mm, Fr>>>,
    /// Run once after the main loop reaches a failing terminal code.
    pub fail_node: Option<Arc<ParseNode<Mm, Fr>>>,
    /// Run once per encapsulation boundary crossed, regardless of outcome.
    pub atencap_node: Option<Arc<ParseNode<Mm, Fr>>>,
}

impl<Mm, Fr> Parser<Mm, Fr> {
    /// A graph with no exit hooks.
    #[must_use]
    pub fn new(root: Arc<ParseNode<Mm, Fr>>, config: ParserConfig) -> Self {
        Self {
            root,
            config,
            okay_node: None,
            fail_node: None,
            atencap_node: None,
        }
    }

    /// Set the node run after a successful terminal code.
    #[must_use]
    pub fn with_okay_node(mut self, node: Arc<ParseNode<Mm, Fr>>) -> Self {
        self.okay_node = Some(node);
        self
    }

    /// Set the node run after a failing terminal code.
    #[must_use]
    pub fn with_fail_node(mut self, node: Arc<ParseNode<Mm, Fr>>) -> Self {
        self.fail_node = Some(node);
        self
    }

    /// Set the node run at each encapsulation boundary.
    #[must_use]
    pub fn with_atencap_node(mut self, node: Arc<ParseNode<Mm, Fr>>) -> Self {
        self.atencap_node = Some(node);
        self
    }
}

/// The metadata buffer contract (spec §6.2 "Metadata Layout Contract").
///
/// In the source this is a flat byte buffer: `metameta_size` bytes followed
/// by `max_frames` consecutive `frame_size` blocks, addressed by pointer
/// arithmetic. With a typed metadata frame (Design Note §9), the layout
/// collapses to a shared `metameta: Mm` plus a `Vec<Fr>` of per-encap-level
/// frames; the byte sizes the C struct carries become unnecessary, since
/// `Mm`/`Fr`'s own layout is now the source of truth.
pub struct MetadataBuffer<Mm, Fr> {
    /// Shared across every encapsulation level.
    pub metameta: Mm,
    /// One entry per encapsulation level reached, up to `max_frames`.
    pub frames: Vec<Fr>,
    /// Index of the frame currently being written.
    pub current_frame: usize,
}

impl<Mm, Fr: Default> MetadataBuffer<Mm, Fr> {
    /// Zero-equivalent buffer with a single frame, per spec §6.1 ("the
    /// caller zeroes the metadata buffer before the call").
    pub fn new(metameta: Mm) -> Self {
        Self {
            metameta,
            frames: vec![Fr::default()],
            current_frame: 0,
        }
    }

    /// Current frame, mutable. Always valid: `new` seeds frame 0 and
    /// `push_frame` is the only way to add more.
    pub fn frame_mut(&mut self) -> &mut Fr {
        &mut self.frames[self.current_frame]
    }

    /// Add a fresh frame and make it current, if `max_frames` allows it
    /// (spec §4.1 step 7). Returns `false` (no-op) once the cap is hit;
    /// the engine keeps writing into the last frame instead.
    pub fn push_frame(&mut self, max_frames: usize) -> bool {
        if self.frames.len() >= max_frames {
            return false;
        }
        self.frames.push(Fr::default());
        self.current_frame += 1;
        true
    }
}

/// A set of parsers selectable by an `i32` key (e.g. EtherType), for
/// `parse_from_table` (spec §6.1 "Parse-from-table"). Used when a single
/// root node can't cover every top-level protocol a caller wants to parse;
/// callers build one `Parser` per root protocol and register them here
/// instead of building one combined graph.
pub struct ParserTable<Mm, Fr> {
    entries: HashMap<i32, Parser<Mm, Fr>>,
}

impl<Mm, Fr> ParserTable<Mm, Fr> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register `parser` as the one to use for `key`.
    pub fn insert(&mut self, key: i32, parser: Parser<Mm, Fr>) {
        self.entries.insert(key, parser);
    }

    /// The parser registered for `key`, if any.
    #[must_use]
    pub fn lookup(&self, key: i32) -> Option<&Parser<Mm, Fr>> {
        self.entries.get(&key)
    }
}

impl<Mm, Fr> Default for ParserTable<Mm, Fr> {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up the parser registered for `key` and run it over `packet` (spec
/// §6.1 "Parse-from-table"). Returns `STOP_UNKNOWN_PROTO` if no parser is
/// registered for `key`, matching an unknown-protocol outcome from a plain
/// `parse()` call.
pub fn parse_from_table<Mm, Fr: Default>(
    table: &ParserTable<Mm, Fr>,
    key: i32,
    packet: &[u8],
    metadata: &mut MetadataBuffer<Mm, Fr>,
    ctrl: &mut crate::control::ControlBlock,
) -> i32 {
    match table.lookup(key) {
        Some(parser) => crate::engine::parse(parser, packet, metadata, ctrl),
        None => crate::error::ReturnCode::STOP_UNKNOWN_PROTO.0,
    }
}
