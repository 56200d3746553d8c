/*! Flag-field sub-loop (spec §4.3) and the `flag_fields_offset` utility
(spec §2 "Flag-fields utility").
*/

use crate::control::ControlBlock;
use crate::error::ReturnCode;
use crate::node::{NodeKind, ParseNode};
use crate::proto::FlagFieldDesc;

/// Offset of field `i` within the fields block, or `None` if flag bit `i`
/// is clear (spec §4.3). Offset is the sum of the sizes of every preceding
/// *enabled* field. Fields are packed back-to-back in descriptor order,
/// skipping anything whose flag isn't set.
#[must_use]
pub fn flag_fields_offset(i: usize, flags: u32, descriptor: &[FlagFieldDesc]) -> Option<usize> {
    if flags & descriptor[i].mask == 0 {
        return None;
    }
    let mut off = 0;
    for field in &descriptor[..i] {
        if flags & field.mask != 0 {
            off += field.size;
        }
    }
    Some(off)
}

/// Run the flag-fields sub-loop for `parse_node` over `hdr` (spec §4.3).
/// Handler return values are ignored, per spec: a field is either present
/// or it isn't, so nothing here can terminate the call early. The only
/// failure mode is running out of declared header bytes for an enabled
/// field, which the engine's length check on the *next* node will catch;
/// this loop itself always returns `OKAY`.
pub fn run_flag_fields<Mm, Fr>(
    parse_node: &ParseNode<Mm, Fr>,
    hdr: &[u8],
    mm: &mut Mm,
    frame: &mut Fr,
    ctrl: &mut ControlBlock,
) -> i32 {
    let Some(ff_ops) = parse_node.flag_fields_ops() else {
        return ReturnCode::OKAY.0;
    };
    let NodeKind::FlagFields { table } = &parse_node.kind else {
        return ReturnCode::OKAY.0;
    };

    let flags = (ff_ops.get_flags)(hdr);
    let ioff = (ff_ops.start_fields_offset)(hdr);

    for i in 0..ff_ops.fields.len() {
        let Some(off) = flag_fields_offset(i, flags, &ff_ops.fields) else {
            continue;
        };
        let field = &ff_ops.fields[i];
        let start = ioff + off;
        let end = start + field.size;
        if end > hdr.len() {
            break;
        }
        let Some(node) = table.lookup(i) else {
            continue;
        };
        let slice = &hdr[start..end];
        if let Some(f) = &node.ops.extract_metadata {
            f(slice, start, mm, frame, ctrl);
        }
        if let Some(f) = &node.ops.handler {
            let _ = f(slice, start, mm, frame, ctrl);
        }
    }

    ReturnCode::OKAY.0
}
