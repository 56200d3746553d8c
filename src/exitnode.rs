/*! Exit-node runner (spec §4.5). Used both for the terminal `okay_node`/
`fail_node` hook and the per-encapsulation `atencap_node` hook, same
three-callback order as a regular node, minus any dispatch.
*/

use crate::control::ControlBlock;
use crate::error::ReturnCode;
use crate::node::ParseNode;

/// Run `node`'s `extract_metadata`, `handler`, and `post_handler` over
/// `hdr`, with no sub-structure loop and no dispatch (spec §4.5). Returns
/// the handler's code if non-`OKAY`, else `OKAY`.
pub fn run_exit_node<Mm, Fr>(
    node: &ParseNode<Mm, Fr>,
    hdr: &[u8],
    offset: usize,
    mm: &mut Mm,
    frame: &mut Fr,
    ctrl: &mut ControlBlock,
) -> i32 {
    if let Some(f) = &node.ops.extract_metadata {
        f(hdr, offset, mm, frame, ctrl);
    }
    if let Some(f) = &node.ops.handler {
        let ret = f(hdr, offset, mm, frame, ctrl);
        if ret != ReturnCode::OKAY.0 {
            return ret;
        }
    }
    if let Some(f) = &node.ops.post_handler {
        let ret = f(hdr, offset, mm, frame, ctrl);
        if ret != ReturnCode::OKAY.0 {
            return ret;
        }
    }
    ReturnCode::OKAY.0
}
