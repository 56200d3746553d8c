/*! Array sub-loop (spec §4.4), grounded on `xdp2_parse_array` in
`original_source/src/lib/xdp2/parser.c`.
*/

use crate::control::ControlBlock;
use crate::error::ReturnCode;
use crate::node::{NodeKind, ParseNode};

/// Run the array sub-loop for `parse_node` over `hdr` (spec §4.4). Like the
/// source, an element handler's return value is not checked (only
/// `el_type` can terminate the loop early, by returning negative).
pub fn run_array<Mm, Fr>(
    parse_node: &ParseNode<Mm, Fr>,
    hdr: &[u8],
    mm: &mut Mm,
    frame: &mut Fr,
    ctrl: &mut ControlBlock,
) -> i32 {
    let Some(arr_ops) = parse_node.array_ops() else {
        return ReturnCode::OKAY.0;
    };
    let NodeKind::Array {
        table,
        wildcard,
        unknown_array_type_ret,
    } = &parse_node.kind
    else {
        return ReturnCode::OKAY.0;
    };

    let start = (arr_ops.start_offset)(hdr);
    if start > hdr.len() {
        return ReturnCode::STOP_LENGTH.0;
    }
    let mut cp = start;
    let mut hlen = hdr.len() - start;

    let num_els = (arr_ops.num_els)(hdr, hlen);
    let mut i = 0;

    while i < num_els && hlen > 0 {
        if hlen < arr_ops.el_length {
            return ReturnCode::STOP_LENGTH.0;
        }

        let el_type = match &arr_ops.el_type {
            Some(f) => {
                let t = f(&hdr[cp..]);
                if t < 0 {
                    return t;
                }
                t
            }
            None => 0,
        };

        let found = table.as_ref().and_then(|t| t.lookup(el_type));
        match found.or(wildcard.as_ref()) {
            Some(node) => {
                let el = &hdr[cp..cp + arr_ops.el_length];
                if let Some(f) = &node.ops.extract_metadata {
                    f(el, cp, mm, frame, ctrl);
                }
                if let Some(f) = &node.ops.handler {
                    let _ = f(el, cp, mm, frame, ctrl);
                }
            }
            None => {
                if *unknown_array_type_ret != ReturnCode::OKAY.0 {
                    return *unknown_array_type_ret;
                }
            }
        }

        cp += arr_ops.el_length;
        hlen -= arr_ops.el_length;
        i += 1;
    }

    if i < num_els {
        return ReturnCode::STOP_LENGTH.0;
    }

    ReturnCode::OKAY.0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::control::ControlBlock;
    use crate::node::{ArrayTable, NodeId};
    use crate::proto::{ArrayOps, NodeType, ProtoDef, ProtoDefVariant};

    fn node(num_els: usize, el_length: usize) -> ParseNode<(), ()> {
        let def = ProtoDef {
            name: "arr",
            min_len: 0,
            len: None,
            next_proto: None,
            next_proto_keyin: None,
            overlay: false,
            encap: false,
            node_type: NodeType::Array,
            variant: ProtoDefVariant::Array(ArrayOps {
                start_offset: Arc::new(|_hdr| 0),
                el_type: None,
                num_els: Arc::new(move |_hdr, _remaining| num_els),
                el_length,
            }),
        };
        let mut parse_node = ParseNode::new(NodeId(0), "arr", Arc::new(def));
        parse_node.kind = NodeKind::Array {
            table: Some(ArrayTable::new()),
            wildcard: None,
            unknown_array_type_ret: ReturnCode::OKAY.0,
        };
        parse_node
    }

    #[test]
    fn full_elements_parse_okay() {
        let parse_node = node(2, 10);
        let hdr = [0u8; 20];
        let mut ctrl = ControlBlock::new(hdr.len(), 0, 0);
        let ret = run_array(&parse_node, &hdr, &mut (), &mut (), &mut ctrl);
        assert_eq!(ret, ReturnCode::OKAY.0);
    }

    #[test]
    fn partial_trailing_element_stops_on_length() {
        // num_els=2, el_length=10, but only 15 bytes available: the second
        // element is short 5 bytes.
        let parse_node = node(2, 10);
        let hdr = [0u8; 15];
        let mut ctrl = ControlBlock::new(hdr.len(), 0, 0);
        let ret = run_array(&parse_node, &hdr, &mut (), &mut (), &mut ctrl);
        assert_eq!(ret, ReturnCode::STOP_LENGTH.0);
    }
}
