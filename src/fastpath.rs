/*! Fast-path interpreter and validator (spec §4.6), grounded on
`__xdp2_parse_fast` / `validate_parse_fast_node` /
`xdp2_parse_validate_fast` in `original_source/src/lib/xdp2/parser.c`.
*/

use std::collections::HashSet;
use std::sync::Arc;

use crate::control::ControlBlock;
use crate::error::ReturnCode;
use crate::flagfields;
use crate::node::{NodeId, NodeKind, ParseNode};
use crate::parser::{MetadataBuffer, Parser};
use crate::proto::NodeType;
use crate::tlv;

/// Cap on distinct nodes visited during validation, matching
/// `NUM_FAST_NODES` in the source, breaks cycles and bounds worst-case
/// validation cost. A graph with more than this many distinct nodes
/// reachable from root fails validation even if acyclic.
pub const MAX_FAST_NODES: usize = 64;

/// Check whether `parser`'s graph may be walked with [`parse_fast`] (spec
/// §4.6). Fails if any exit hook is configured, if `num_counters`/`num_keys`
/// are non-zero, or if the depth-first walk over the graph finds a node
/// with a `post_handler`, a `next_proto_keyin` op, or a TLVS/FLAG_FIELDS
/// node whose `proto_def.node_type` doesn't match.
#[must_use]
pub fn validate_fast<Mm, Fr>(parser: &Parser<Mm, Fr>) -> bool {
    if parser.okay_node.is_some() || parser.fail_node.is_some() || parser.atencap_node.is_some() {
        return false;
    }
    if parser.config.num_counters != 0 || parser.config.num_keys != 0 {
        return false;
    }
    let mut visited = HashSet::new();
    validate_node(&mut visited, &parser.root)
}

fn validate_node<Mm, Fr>(visited: &mut HashSet<NodeId>, node: &Arc<ParseNode<Mm, Fr>>) -> bool {
    if visited.contains(&node.id) {
        return true;
    }
    if visited.len() >= MAX_FAST_NODES {
        return false;
    }
    visited.insert(node.id);

    if node.ops.post_handler.is_some() {
        return false;
    }
    if node.proto_def.next_proto_keyin.is_some() {
        return false;
    }
    match &node.kind {
        NodeKind::Tlvs { .. } if node.proto_def.node_type != NodeType::Tlvs => return false,
        NodeKind::FlagFields { .. } if node.proto_def.node_type != NodeType::FlagFields => {
            return false;
        }
        _ => {}
    }

    if let Some(table) = &node.proto_table {
        for next in table.values() {
            if !validate_node(visited, next) {
                return false;
            }
        }
    }
    if let Some(wildcard) = &node.wildcard_node
        && !validate_node(visited, wildcard) {
            return false;
        }

    true
}

/// Walk `parser` over `packet` using the reduced interpreter (spec §4.6).
/// Implements steps 1–8 of the main loop with no exit-node machinery and
/// no `max_nodes` bookkeeping (the source doesn't track it on this path
/// either; termination is still guaranteed by `max_encaps` and the
/// strictly-decreasing packet length). Array sub-loops are not run on this
/// path, matching the source, which has no `ARRAY` case in either the
/// validator or the fast main loop. A graph relying on array extraction
/// should not be validated as fast-path-eligible in practice, though
/// [`validate_fast`] does not itself reject `ARRAY` nodes (neither does
/// the source).
///
/// Caller must have confirmed [`validate_fast`] first; this function does
/// not re-validate.
pub fn parse_fast<Mm, Fr: Default>(
    parser: &Parser<Mm, Fr>,
    packet: &[u8],
    metadata: &mut MetadataBuffer<Mm, Fr>,
    ctrl: &mut ControlBlock,
) -> i32 {
    let mut parse_node = parser.root.clone();
    let mut offset = 0usize;

    let ret = 'main: loop {
        ctrl.var.last_node = Some(parse_node.id);
        let proto_def = parse_node.proto_def.clone();
        let remaining = packet.len() - offset;
        let mut hlen = proto_def.min_len;
        if remaining < hlen {
            break 'main ReturnCode::STOP_LENGTH.0;
        }
        if proto_def.len.is_some() {
            let computed = proto_def.header_len(&packet[offset..], remaining);
            if remaining < computed.max(0) as usize {
                break 'main ReturnCode::STOP_LENGTH.0;
            }
            hlen = computed as usize;
        }

        ctrl.hdr.hdr_offset = offset;
        ctrl.hdr.hdr_len = hlen;

        let hdr = &packet[offset..offset + hlen];
        let mm = &mut metadata.metameta;
        let cur = metadata.current_frame;
        let frame = &mut metadata.frames[cur];

        if let Some(f) = &parse_node.ops.extract_metadata {
            f(hdr, offset, mm, frame, ctrl);
        }
        if let Some(f) = &parse_node.ops.handler {
            let _ = f(hdr, offset, mm, frame, ctrl);
        }

        match &parse_node.kind {
            NodeKind::Tlvs { .. } => {
                let ret =
                    tlv::run_tlvs(&parse_node, hdr, mm, frame, ctrl, parser.config.max_tlvs);
                if ret != ReturnCode::OKAY.0 {
                    break 'main ret;
                }
            }
            NodeKind::FlagFields { .. } => {
                let ret = flagfields::run_flag_fields(&parse_node, hdr, mm, frame, ctrl);
                if ret != ReturnCode::OKAY.0 {
                    break 'main ret;
                }
            }
            _ => {}
        }

        if proto_def.encap {
            ctrl.var.encaps += 1;
            if ctrl.var.encaps > parser.config.max_encaps {
                break 'main ReturnCode::STOP_ENCAP_DEPTH.0;
            }
            metadata.push_frame(parser.config.max_frames);
        }

        let mut next: Option<Arc<ParseNode<Mm, Fr>>> = None;
        if let Some(table) = &parse_node.proto_table
            && let Some(f) = &proto_def.next_proto {
                let t = f(hdr);
                if t < 0 {
                    break 'main t;
                }
                next = table.lookup(t).cloned();
            }
        let next = match next.or_else(|| parse_node.wildcard_node.clone()) {
            Some(n) => n,
            None => break 'main ReturnCode::STOP_OKAY.0,
        };

        if !proto_def.overlay {
            offset += hlen;
        }
        parse_node = next;
    };

    ctrl.var.ret_code = ret;
    ret
}
