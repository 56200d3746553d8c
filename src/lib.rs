#![warn(missing_docs)]
/*! A declarative packet-parsing engine.

A caller describes a protocol graph (nodes, protocol definitions, dispatch
tables, and per-node metadata extractors) and the engine walks a packet
header by header, extracting fields into typed metadata frames. Two
adjacent subsystems reuse the same metadata/graph abstractions: a staged
[`pipeline`] for chained byte/packet transformations, and a scatter-gather
packet buffer manager ([`pvbuf`]) that lets parsed packets be built from
non-contiguous memory.

# Architecture overview

A parse graph is a tree of [`node::ParseNode`]s rooted in a [`parser::Parser`].
Each node pairs a [`proto::ProtoDef`] (the contract the engine uses to ask a
protocol module about header length and the next protocol) with the ops
that extract fields into a caller-supplied metadata type. [`engine::parse`]
walks the graph over raw bytes and returns a wire-stable [`error::ReturnCode`].

```text
  [ Ethernet ] --EtherType--> [ IPv4 ] --proto--> [ TCP ]
                                  |
                                  +--proto=17--> [ UDP ]
```

# Example

```
use std::sync::Arc;
use xdp2::control::ControlBlock;
use xdp2::node::{NodeId, ParseNode};
use xdp2::parser::{MetadataBuffer, Parser, ParserConfig};
use xdp2::proto::ProtoDef;

#[derive(Default)]
struct Frame {
    eth_type: u16,
}

let root = Arc::new(ParseNode::<(), Frame>::new(
    NodeId(0),
    "ether",
    Arc::new(ProtoDef::plain("ether", 14)),
));
let parser = Parser::new(root, ParserConfig::default());
let packet = [0u8; 14];
let mut metadata = MetadataBuffer::new(());
let mut ctrl = ControlBlock::new(packet.len(), 0, 0);
let code = xdp2::engine::parse(&parser, &packet, &mut metadata, &mut ctrl);
assert_eq!(code, xdp2::error::ReturnCode::STOP_OKAY.0);
```

## Links

* Upstream specification: the XDP2 declarative parser, PVbuf, and
  accelerator pipeline design this crate implements.
*/

pub mod array;
pub mod control;
pub mod dtable;
pub mod engine;
pub mod error;
pub mod exitnode;
pub mod fastpath;
pub mod flagfields;
pub mod hash;
pub mod node;
pub mod parser;
pub mod pipeline;
pub mod proto;
pub mod pvbuf;
pub mod select;
pub mod tlv;
