//! Property-based checks for spec §8 "Testable Properties", grounded on the
//! same invariants the scenario tests exercise concretely. Uses `proptest`
//! to range over packet shapes instead of fixed examples.

use std::sync::Arc;

use proptest::prelude::*;

use xdp2::control::ControlBlock;
use xdp2::error::ReturnCode;
use xdp2::fastpath;
use xdp2::node::{NodeId, ParseNode, ProtoTable};
use xdp2::parser::{MetadataBuffer, Parser, ParserConfig};
use xdp2::proto::{NodeType, ProtoDef, ProtoDefVariant};
use xdp2::pvbuf::PvbufMgr;

#[derive(Default)]
struct Meta;

#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
struct Frame {
    eth_type: u16,
    ip_proto: u8,
    src_port: u16,
    dst_port: u16,
}

fn be16(hdr: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([hdr[off], hdr[off + 1]])
}

fn next_id() -> NodeId {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    NodeId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// `ether -> ipv4 -> {tcp, udp}`, fast-path-eligible: no post_handler, no
/// `next_proto_keyin`, no counters/keys, no exit hooks.
fn build_fast_eligible_parser() -> Parser<Meta, Frame> {
    let tcp_def = ProtoDef::plain("tcp", 20);
    let mut tcp = ParseNode::new(next_id(), "tcp", Arc::new(tcp_def));
    tcp.ops.extract_metadata = Some(Arc::new(|hdr, _off, _mm, frame: &mut Frame, _ctrl| {
        frame.src_port = be16(hdr, 0);
        frame.dst_port = be16(hdr, 2);
    }));
    let tcp = Arc::new(tcp);

    let udp_def = ProtoDef::plain("udp", 8);
    let mut udp = ParseNode::new(next_id(), "udp", Arc::new(udp_def));
    udp.ops.extract_metadata = Some(Arc::new(|hdr, _off, _mm, frame: &mut Frame, _ctrl| {
        frame.src_port = be16(hdr, 0);
        frame.dst_port = be16(hdr, 2);
    }));
    let udp = Arc::new(udp);

    let ipv4_def = ProtoDef {
        name: "ipv4",
        min_len: 20,
        len: Some(Arc::new(|hdr, _maxlen| ((hdr[0] & 0x0f) as isize) * 4)),
        next_proto: Some(Arc::new(|hdr| hdr[9] as i32)),
        next_proto_keyin: None,
        overlay: false,
        encap: false,
        node_type: NodeType::Plain,
        variant: ProtoDefVariant::Plain,
    };
    let mut ipv4 = ParseNode::new(next_id(), "ipv4", Arc::new(ipv4_def));
    ipv4.ops.extract_metadata = Some(Arc::new(|hdr, _off, _mm, frame: &mut Frame, _ctrl| {
        frame.ip_proto = hdr[9];
    }));
    let mut table = ProtoTable::new();
    table.insert(6, tcp);
    table.insert(17, udp);
    ipv4.proto_table = Some(table);
    let ipv4 = Arc::new(ipv4);

    let ether_def = ProtoDef {
        name: "ether",
        min_len: 14,
        len: None,
        next_proto: Some(Arc::new(|hdr| be16(hdr, 12) as i32)),
        next_proto_keyin: None,
        overlay: false,
        encap: false,
        node_type: NodeType::Plain,
        variant: ProtoDefVariant::Plain,
    };
    let mut ether = ParseNode::new(next_id(), "ether", Arc::new(ether_def));
    ether.ops.extract_metadata = Some(Arc::new(|hdr, _off, _mm, frame: &mut Frame, _ctrl| {
        frame.eth_type = be16(hdr, 12);
    }));
    let mut table = ProtoTable::new();
    table.insert(0x0800, ipv4);
    ether.proto_table = Some(table);

    let config = ParserConfig {
        num_keys: 0,
        num_counters: 0,
        ..ParserConfig::default()
    };
    Parser::new(Arc::new(ether), config)
}

fn eth_ipv4_l4(proto: u8, sport: u16, dport: u16, extra_payload: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; 14];
    pkt[12] = 0x08;
    pkt[13] = 0x00;
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[9] = proto;
    pkt.extend_from_slice(&ip);
    let mut l4 = vec![0u8; if proto == 6 { 20 } else { 8 }];
    l4[0..2].copy_from_slice(&sport.to_be_bytes());
    l4[2..4].copy_from_slice(&dport.to_be_bytes());
    pkt.extend_from_slice(&l4);
    pkt.extend_from_slice(extra_payload);
    pkt
}

proptest! {
    /// Invariant 4: `parse_fast` and `parse`, when both applicable, produce
    /// bit-identical metadata and terminal codes.
    #[test]
    fn parse_and_parse_fast_agree(
        use_tcp in any::<bool>(),
        sport in any::<u16>(),
        dport in any::<u16>(),
        padding in 0usize..16,
    ) {
        let parser = build_fast_eligible_parser();
        prop_assert!(fastpath::validate_fast(&parser));

        let proto = if use_tcp { 6 } else { 17 };
        let pkt = eth_ipv4_l4(proto, sport, dport, &vec![0u8; padding]);

        let mut md_slow = MetadataBuffer::new(Meta);
        let mut ctrl_slow = ControlBlock::new(pkt.len(), 0, 0);
        let code_slow = xdp2::engine::parse(&parser, &pkt, &mut md_slow, &mut ctrl_slow);

        let mut md_fast = MetadataBuffer::new(Meta);
        let mut ctrl_fast = ControlBlock::new(pkt.len(), 0, 0);
        let code_fast = fastpath::parse_fast(&parser, &pkt, &mut md_fast, &mut ctrl_fast);

        prop_assert_eq!(code_slow, code_fast);
        prop_assert_eq!(md_slow.frames[0], md_fast.frames[0]);
    }

    /// Invariant 1 / 2: a well-formed minimal packet always reaches
    /// `STOP_OKAY` (a leaf node's natural success path) and the loop always
    /// terminates, for every packet length/content this test generates.
    #[test]
    fn leaf_success_always_reaches_stop_okay(
        use_tcp in any::<bool>(),
        sport in any::<u16>(),
        dport in any::<u16>(),
    ) {
        let parser = build_fast_eligible_parser();
        let proto = if use_tcp { 6 } else { 17 };
        let pkt = eth_ipv4_l4(proto, sport, dport, &[]);
        let mut metadata = MetadataBuffer::new(Meta);
        let mut ctrl = ControlBlock::new(pkt.len(), 0, 0);
        let code = xdp2::engine::parse(&parser, &pkt, &mut metadata, &mut ctrl);
        prop_assert_eq!(code, ReturnCode::STOP_OKAY.0);
    }

    /// Invariant 5: `clone(src, 0, total_len(src))` yields an iterate-
    /// identical pvbuf to the source.
    #[test]
    fn clone_full_range_is_iterate_identical(bytes in prop::collection::vec(any::<u8>(), 1..64)) {
        let mut mgr = PvbufMgr::new(0);
        let src = mgr.alloc(bytes.len());
        mgr.copy_from(src, &bytes, 0, bytes.len());

        let (clone, actual) = mgr.clone_range(src, 0, bytes.len());
        prop_assert_eq!(actual, bytes.len());

        let mut out = vec![0u8; bytes.len()];
        mgr.copy_to(clone, &mut out, 0, bytes.len());
        prop_assert_eq!(out, bytes);

        mgr.free(src);
        mgr.free(clone);
    }

    /// Invariant 6: `pop_hdrs(p, n)` followed by `prepend(popped)` restores
    /// the original byte sequence.
    #[test]
    fn pop_hdrs_then_prepend_round_trips(
        bytes in prop::collection::vec(any::<u8>(), 1..64),
        n in 0usize..64,
    ) {
        let n = n.min(bytes.len());
        let mut mgr = PvbufMgr::new(0);
        let p = mgr.alloc(bytes.len());
        mgr.copy_from(p, &bytes, 0, bytes.len());

        let mut popped = vec![0u8; n];
        let rest = mgr.pop_hdrs(p, n, true, Some(&mut popped));
        prop_assert_eq!(&popped[..], &bytes[..n]);

        let popped_buf = mgr.alloc(n);
        mgr.copy_from(popped_buf, &popped, 0, n);
        let restored = mgr.prepend(rest, popped_buf, n);

        let mut out = vec![0u8; bytes.len()];
        mgr.copy_to(restored, &mut out, 0, bytes.len());
        prop_assert_eq!(out, bytes);

        mgr.free(restored);
    }

    /// Invariant 7: `checksum(pvbuf)` equals the checksum of the flat bytes
    /// delivered by `iterate` over the same range, folded the same way.
    #[test]
    fn checksum_matches_flat_fold(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut mgr = PvbufMgr::new(0);
        let p = mgr.alloc(bytes.len().max(1));
        if !bytes.is_empty() {
            mgr.copy_from(p, &bytes, 0, bytes.len());
        }

        let got = mgr.checksum(p, 0, bytes.len());

        let mut expected: u32 = 0;
        let mut it = bytes.chunks(2);
        for chunk in &mut it {
            if chunk.len() == 2 {
                expected += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
            } else {
                expected += (chunk[0] as u32) << 8;
            }
        }
        while expected > 0xFFFF {
            expected = (expected & 0xFFFF) + (expected >> 16);
        }
        prop_assert_eq!(got, expected as u16);

        mgr.free(p);
    }
}

/// Invariant 8: `run_dd(identity_pipeline, buf, n, out, n)` produces
/// `out == buf` with `produced == n` (the accelerator pipeline's simplest
/// possible configuration must be a transparent pass-through).
#[test]
fn identity_pipeline_is_transparent() {
    use xdp2::pipeline::{Pipeline, Stage};

    let stages = vec![Stage::identity("a"), Stage::identity("b")];
    let mut pipeline = Pipeline::new(stages);
    let input = (0u8..=255).collect::<Vec<u8>>();
    let mut out = Vec::new();
    let (produced, err) = pipeline.run_d(&input, &mut out);
    assert!(err.is_none());
    assert_eq!(produced, input.len());
    assert_eq!(out, input);
}
