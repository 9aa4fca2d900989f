//! Reception-side behaviour of the physical-standard handlers.

use std::collections::BTreeMap;

use dvbsat::frame::{mark_corrupted, BbFrameBuf, DvbRcsFrameBuf, RealModcodOption};
use dvbsat::standard::{RcsStd, ReceptionStd, S2Std};
use dvbsat::{NetPacket, PktType, BROADCAST_TAL_ID};

fn bbframe(used_modcod: u8, dst: u16) -> Vec<u8> {
    let mut frame = BbFrameBuf::new(1, used_modcod, PktType::Gse);
    frame.add_packet(NetPacket::new(PktType::Gse, 0, dst, 0, vec![0xEE; 64]));
    frame.to_bytes()
}

/// A frame encoded above the receiver's real MODCOD is an emulated
/// physical loss: nothing is delivered, the ACM statistics still move.
#[test]
fn undecodable_modcod_is_dropped() {
    let mut std = S2Std::new(2);

    let burst = std.on_receive_frame(&bbframe(9, 5), Some(5)).unwrap();
    assert!(burst.is_empty());
    assert_eq!(std.received_modcod(), 9);

    // robust enough: delivered
    let burst = std.on_receive_frame(&bbframe(2, 5), Some(5)).unwrap();
    assert_eq!(burst.len(), 1);
}

/// A corrupted frame delivers nothing but still updates `received_modcod`.
#[test]
fn corrupted_frame_updates_stats_only() {
    let mut std = S2Std::new(12);

    let mut bytes = bbframe(9, 5);
    mark_corrupted(&mut bytes);
    let burst = std.on_receive_frame(&bytes, Some(5)).unwrap();
    assert!(burst.is_empty());
    assert_eq!(std.received_modcod(), 9);
    assert_eq!(std.real_modcod(), 12);
}

/// A real-MODCOD option addressed to this terminal raises what it is
/// allowed to decode; the check against the carrying frame itself uses the
/// value from before the update.
#[test]
fn real_modcod_option_updates_receiver() {
    let mut std = S2Std::new(3);

    let mut frame = BbFrameBuf::new(1, 3, PktType::Gse);
    frame.add_option(RealModcodOption {
        tal_id: 5,
        real_modcod: 7,
    });
    frame.add_packet(NetPacket::new(PktType::Gse, 0, 5, 0, vec![0; 10]));
    let burst = std.on_receive_frame(&frame.to_bytes(), Some(5)).unwrap();
    assert_eq!(burst.len(), 1);
    assert_eq!(std.real_modcod(), 7);

    // an option for somebody else changes nothing
    let mut frame = BbFrameBuf::new(1, 3, PktType::Gse);
    frame.add_option(RealModcodOption {
        tal_id: 6,
        real_modcod: 1,
    });
    frame.add_packet(NetPacket::new(PktType::Gse, 0, 5, 0, vec![0; 10]));
    std.on_receive_frame(&frame.to_bytes(), Some(5)).unwrap();
    assert_eq!(std.real_modcod(), 7);
}

/// Unicast filtering keeps a terminal's own traffic and broadcast only.
#[test]
fn reception_filters_by_terminal() {
    let mut std = S2Std::new(12);

    let mut frame = BbFrameBuf::new(1, 3, PktType::Gse);
    frame.add_packet(NetPacket::new(PktType::Gse, 0, 5, 0, vec![1; 8]));
    frame.add_packet(NetPacket::new(PktType::Gse, 0, 6, 0, vec![2; 8]));
    frame.add_packet(NetPacket::new(PktType::Gse, 0, BROADCAST_TAL_ID, 0, vec![3; 8]));

    let burst = std.on_receive_frame(&frame.to_bytes(), Some(5)).unwrap();
    assert_eq!(burst.len(), 2);
    assert!(burst.iter().all(|p| p.dst_tal == 5 || p.dst_tal == BROADCAST_TAL_ID));
}

/// The regenerative switch routes by destination, falling back to the
/// default spot for unknown terminals.
#[test]
fn rcs_switch_lookup() {
    let mut std = RcsStd::new();
    assert_eq!(std.switch_spot(5), None);

    let mut table = BTreeMap::new();
    table.insert(5u16, 2u8);
    std.set_switch(table, 1);
    assert_eq!(std.switch_spot(5), Some(2));
    assert_eq!(std.switch_spot(99), Some(1));
}

#[test]
fn rcs_burst_decodes_and_corrupted_drops() {
    let mut std = RcsStd::new();

    let mut frame = DvbRcsFrameBuf::new(1, PktType::Atm);
    frame.add_packet(NetPacket::new(PktType::Atm, 5, 0, 0, vec![0; 53]));
    frame.add_packet(NetPacket::new(PktType::Atm, 5, 0, 1, vec![1; 53]));
    let bytes = frame.to_bytes();

    let burst = std.on_receive_frame(&bytes, None).unwrap();
    assert_eq!(burst.len(), 2);

    let mut corrupted = bytes.clone();
    mark_corrupted(&mut corrupted);
    let burst = std.on_receive_frame(&corrupted, None).unwrap();
    assert!(burst.is_empty());
}
