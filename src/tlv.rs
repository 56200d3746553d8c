/*! TLV sub-loop (spec §4.2, §4.2.1), grounded on
`xdp2_parse_tlvs`/`xdp2_parse_one_tlv` in
`original_source/src/lib/xdp2/parser.c`.
*/

use std::sync::Arc;

use crate::control::ControlBlock;
use crate::error::ReturnCode;
use crate::node::{NodeKind, ParseNode, TlvNode};

/// Run the TLV sub-loop for `parse_node` over `hdr` (spec §4.2). Returns
/// `OKAY` if the node's type/table don't both indicate a TLVs node (a
/// `node_type`/`proto_def.node_type` mismatch is tolerated by simply
/// skipping the sub-loop, spec §4.1 step 4). `default_max_tlvs` is the
/// fallback TLV cap used when the node itself has no `max_tlvs` set.
pub fn run_tlvs<Mm, Fr>(
    parse_node: &ParseNode<Mm, Fr>,
    hdr: &[u8],
    mm: &mut Mm,
    frame: &mut Fr,
    ctrl: &mut ControlBlock,
    default_max_tlvs: usize,
) -> i32 {
    let Some(tlvs_ops) = parse_node.tlvs_ops() else {
        return ReturnCode::OKAY.0;
    };
    let NodeKind::Tlvs {
        table,
        wildcard,
        unknown_tlv_type_ret,
        max_tlvs,
    } = &parse_node.kind
    else {
        return ReturnCode::OKAY.0;
    };

    let start = (tlvs_ops.start_offset)(hdr);
    if start > hdr.len() {
        return ReturnCode::STOP_TLV_LENGTH.0;
    }
    let mut cp = start;
    let mut hlen = hdr.len() - start;
    let mut tlv_cnt: usize = 0;

    while hlen > 0 {
        let byte = hdr[cp];
        if let Some(pad1) = tlvs_ops.pad1
            && byte == pad1 {
                cp += 1;
                hlen -= 1;
                continue;
            }
        if let Some(eol) = tlvs_ops.eol
            && byte == eol {
                break;
            }

        tlv_cnt += 1;
        let max = max_tlvs.unwrap_or(default_max_tlvs);
        if tlv_cnt > max {
            return ReturnCode::STOP_OPTION_LIMIT.0;
        }

        let mut tlv_len = tlvs_ops.tlv_min_len;
        if hlen < tlv_len {
            return ReturnCode::STOP_TLV_LENGTH.0;
        }
        if let Some(len_fn) = &tlvs_ops.tlv_len {
            let raw = len_fn(&hdr[cp..], hlen);
            if raw < 0 {
                return raw as i32;
            }
            tlv_len = raw as usize;
            if tlv_len == 0 || hlen < tlv_len {
                return ReturnCode::STOP_TLV_LENGTH.0;
            }
        }

        let tlv_type = (tlvs_ops.tlv_type)(&hdr[cp..]);
        let found = table.as_ref().and_then(|t| t.lookup(tlv_type));

        match found.or(wildcard.as_ref()) {
            Some(node) => {
                let ret = process_one_tlv(
                    node.clone(),
                    wildcard.as_ref(),
                    *unknown_tlv_type_ret,
                    hdr,
                    cp,
                    tlv_len,
                    mm,
                    frame,
                    ctrl,
                    default_max_tlvs,
                );
                if ret != ReturnCode::OKAY.0 {
                    return ret;
                }
            }
            None => {
                if *unknown_tlv_type_ret != ReturnCode::OKAY.0 {
                    return *unknown_tlv_type_ret;
                }
            }
        }

        cp += tlv_len;
        hlen -= tlv_len;
    }

    ReturnCode::OKAY.0
}

/// Process one TLV entry (spec §4.2.1), including the "treat a too-short
/// entry as unknown" substitution and overlay re-dispatch. Both of those
/// are goto-like re-entries into this same function in the source; modeled
/// here as a loop that swaps `node` and restarts.
#[allow(clippy::too_many_arguments)]
fn process_one_tlv<Mm, Fr>(
    mut node: Arc<TlvNode<Mm, Fr>>,
    wildcard: Option<&Arc<TlvNode<Mm, Fr>>>,
    unknown_tlv_type_ret: i32,
    hdr: &[u8],
    offset: usize,
    tlv_len: usize,
    mm: &mut Mm,
    frame: &mut Fr,
    ctrl: &mut ControlBlock,
    default_max_tlvs: usize,
) -> i32 {
    loop {
        if let Some(entry_def) = &node.entry_def
            && tlv_len < entry_def.min_len {
                match wildcard {
                    Some(w) => {
                        node = w.clone();
                        continue;
                    }
                    None => return unknown_tlv_type_ret,
                }
            }

        let end = (offset + tlv_len).min(hdr.len());
        let value = &hdr[offset..end];

        if let Some(f) = &node.ops.extract_metadata {
            f(value, offset, mm, frame, ctrl);
        }
        if let Some(f) = &node.ops.handler {
            let ret = f(value, offset, mm, frame, ctrl);
            if ret != ReturnCode::OKAY.0 {
                return ret;
            }
        }

        if let Some(nested) = &node.nested_node {
            let nested_offset = node
                .entry_def
                .as_ref()
                .and_then(|d| d.nested_offset.as_ref())
                .map_or(0, |f| f(value, tlv_len));
            ctrl.var.tlv_levels += 1;
            let nested_hdr = if nested_offset <= value.len() {
                &value[nested_offset..]
            } else {
                &value[value.len()..]
            };
            let ret = run_tlvs(nested, nested_hdr, mm, frame, ctrl, default_max_tlvs);
            ctrl.var.tlv_levels -= 1;
            if ret != ReturnCode::OKAY.0 {
                return ret;
            }
        }

        let Some(overlay_table) = &node.overlay_table else {
            return ReturnCode::OKAY.0;
        };

        let overlay_key = node
            .entry_def
            .as_ref()
            .and_then(|d| d.overlay_type.as_ref())
            .map_or(tlv_len as i32, |f| f(value));

        if let Some(next) = overlay_table.lookup(overlay_key) {
            node = next.clone();
            continue;
        }
        if let Some(w) = &node.overlay_wildcard {
            node = w.clone();
            continue;
        }
        return node.unknown_overlay_ret;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::{NodeId, NodeOps};
    use crate::proto::{NodeType, ProtoDef, ProtoDefVariant, TlvsOps};

    fn node() -> ParseNode<(), ()> {
        let def = ProtoDef {
            name: "tlv",
            min_len: 0,
            len: None,
            next_proto: None,
            next_proto_keyin: None,
            overlay: false,
            encap: false,
            node_type: NodeType::Tlvs,
            variant: ProtoDefVariant::Tlvs(TlvsOps {
                start_offset: Arc::new(|_hdr| 0),
                tlv_type: Arc::new(|hdr| hdr[0] as i32),
                tlv_len: Some(Arc::new(|hdr, _hlen| hdr[1] as isize)),
                tlv_min_len: 2,
                pad1: None,
                eol: None,
            }),
        };
        let mut parse_node = ParseNode::new(NodeId(0), "tlv", Arc::new(def));
        parse_node.kind = NodeKind::Tlvs {
            table: None,
            wildcard: Some(Arc::new(TlvNode {
                name: "any",
                entry_def: None,
                ops: NodeOps::default(),
                nested_node: None,
                overlay_table: None,
                overlay_wildcard: None,
                unknown_overlay_ret: 0,
            })),
            unknown_tlv_type_ret: ReturnCode::OKAY.0,
            max_tlvs: None,
        };
        parse_node
    }

    #[test]
    fn within_default_cap_parses_okay() {
        let parse_node = node();
        // Two 2-byte entries (type, len=2).
        let hdr = [1u8, 2, 1, 2];
        let mut ctrl = ControlBlock::new(hdr.len(), 0, 0);
        let ret = run_tlvs(&parse_node, &hdr, &mut (), &mut (), &mut ctrl, 2);
        assert_eq!(ret, ReturnCode::OKAY.0);
    }

    #[test]
    fn node_without_max_tlvs_falls_back_to_config_default() {
        let parse_node = node();
        // Three 2-byte entries, exceeding a default cap of 2.
        let hdr = [1u8, 2, 1, 2, 1, 2];
        let mut ctrl = ControlBlock::new(hdr.len(), 0, 0);
        let ret = run_tlvs(&parse_node, &hdr, &mut (), &mut (), &mut ctrl, 2);
        assert_eq!(ret, ReturnCode::STOP_OPTION_LIMIT.0);
    }
}
