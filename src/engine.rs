/*! Parser engine main loop (spec §4.1), grounded on `__xdp2_parse` in
`original_source/src/lib/xdp2/parser.c`.
*/

use std::sync::Arc;

use crate::array;
use crate::control::ControlBlock;
use crate::error::ReturnCode;
use crate::exitnode;
use crate::flagfields;
use crate::node::{NodeKind, ParseNode};
use crate::parser::{MetadataBuffer, Parser};
use crate::tlv;

/// Run `parser` over `packet`, writing extracted fields into `metadata`
/// and engine-owned bookkeeping into `ctrl` (spec §4.1, §6.1). Returns the
/// terminal [`ReturnCode`] as a raw `i32` (negative values are user-op
/// errors propagated unchanged).
///
/// The caller is expected to have zeroed/defaulted `metadata` before the
/// call, per spec §6.1; [`MetadataBuffer::new`] does this.
pub fn parse<Mm, Fr: Default>(
    parser: &Parser<Mm, Fr>,
    packet: &[u8],
    metadata: &mut MetadataBuffer<Mm, Fr>,
    ctrl: &mut ControlBlock,
) -> i32 {
    let mut parse_node = parser.root.clone();
    let mut offset = 0usize;
    let mut nodes_left = parser.config.max_nodes;

    // Header window of the node the loop is breaking on, for the exit hook.
    let mut exit_offset = 0usize;
    let mut exit_hlen = 0usize;

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
            if remaining < computed.max(0) as usize || computed < 0 {
                break 'main if computed < 0 {
                    computed as i32
                } else {
                    ReturnCode::STOP_LENGTH.0
                };
            }
            let computed = computed as usize;
            if remaining < computed || computed < proto_def.min_len {
                break 'main ReturnCode::STOP_LENGTH.0;
            }
            hlen = computed;
        }

        exit_offset = offset;
        exit_hlen = hlen;

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
            let r = f(hdr, offset, mm, frame, ctrl);
            if r != ReturnCode::OKAY.0 {
                break 'main r;
            }
        }

        let sub_ret = match &parse_node.kind {
            NodeKind::Plain => ReturnCode::OKAY.0,
            NodeKind::Tlvs { .. } => {
                tlv::run_tlvs(&parse_node, hdr, mm, frame, ctrl, parser.config.max_tlvs)
            }
            NodeKind::FlagFields { .. } => {
                flagfields::run_flag_fields(&parse_node, hdr, mm, frame, ctrl)
            }
            NodeKind::Array { .. } => array::run_array(&parse_node, hdr, mm, frame, ctrl),
        };
        if sub_ret != ReturnCode::OKAY.0 {
            break 'main sub_ret;
        }

        if let Some(f) = &parse_node.ops.post_handler {
            let r = f(hdr, offset, mm, frame, ctrl);
            if r != ReturnCode::OKAY.0 {
                break 'main r;
            }
        }

        if parse_node.proto_table.is_none() && parse_node.wildcard_node.is_none() {
            break 'main ReturnCode::STOP_OKAY.0;
        }

        if proto_def.encap {
            if let Some(atencap) = &parser.atencap_node {
                let mm = &mut metadata.metameta;
                let frame = &mut metadata.frames[metadata.current_frame];
                let r = exitnode::run_exit_node(atencap, hdr, offset, mm, frame, ctrl);
                if r != ReturnCode::OKAY.0 {
                    break 'main r;
                }
            }
            ctrl.var.encaps += 1;
            if ctrl.var.encaps > parser.config.max_encaps {
                break 'main ReturnCode::STOP_ENCAP_DEPTH.0;
            }
            metadata.push_frame(parser.config.max_frames);
        }

        let mut next: Option<Arc<ParseNode<Mm, Fr>>> = None;
        if let Some(table) = &parse_node.proto_table {
            let type_key = if let Some(f) = &proto_def.next_proto_keyin {
                let key_idx = parse_node.key_sel.unwrap_or(0);
                let k = ctrl.key.keys.get(key_idx).copied().unwrap_or(0);
                Some(f(hdr, k))
            } else {
                proto_def.next_proto.as_ref().map(|f| f(hdr))
            };
            if let Some(t) = type_key {
                if t < 0 {
                    break 'main t;
                }
                next = table.lookup(t).cloned();
            }
        }
        let next = match next.or_else(|| parse_node.wildcard_node.clone()) {
            Some(n) => n,
            None => break 'main parse_node.unknown_ret,
        };

        if !proto_def.overlay {
            offset += hlen;
        }
        if packet.len() - offset == 0 && next.zero_len_ok {
            break 'main ReturnCode::STOP_OKAY.0;
        }
        if nodes_left == 0 {
            break 'main ReturnCode::STOP_MAX_NODES.0;
        }
        nodes_left -= 1;

        parse_node = next;
    };

    ctrl.var.ret_code = ret;

    let exit_node = if ReturnCode(ret).is_success() {
        parser.okay_node.as_ref()
    } else {
        parser.fail_node.as_ref()
    };
    if let Some(node) = exit_node {
        let exit_hdr_end = (exit_offset + exit_hlen).min(packet.len());
        let exit_hdr = &packet[exit_offset.min(exit_hdr_end)..exit_hdr_end];
        let mm = &mut metadata.metameta;
        let frame = &mut metadata.frames[metadata.current_frame];
        exitnode::run_exit_node(node, exit_hdr, exit_offset, mm, frame, ctrl);
    }

    ret
}
