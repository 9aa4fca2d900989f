//! Forward and return scheduler behaviour.
//!
//! The forward fixture uses a single MODCOD at spectral efficiency 2.0 on a
//! 4050 kHz carrier, which puts one maximum-size BBFrame at exactly 8 ms of
//! air time against a 20 ms forward tick.

use dvbsat::config::{FifoAccess, FifoConfig};
use dvbsat::fifo::QosFifo;
use dvbsat::fmt::{CodingRate, FmtSimulation, ModcodDefinition, ModcodDefinitionTable, Modulation};
use dvbsat::frame::{BbFrame, DvbRcsFrame};
use dvbsat::fwd_sched::ForwardScheduler;
use dvbsat::ret_sched::{ReturnScheduler, DVB_RCS_SIZE_MAX};
use dvbsat::telemetry::Probes;
use dvbsat::{NetPacket, PktType, TalId};

const BW_KHZ: u32 = 4050;
const FRAME_MS: u64 = 20;
/// 8100 bytes * 8 bits * 1000 / (2.0 * 4050 kHz)
const BBFRAME_US: u64 = 8_000;

fn defs() -> ModcodDefinitionTable {
    ModcodDefinitionTable::new(vec![
        ModcodDefinition {
            id: 2,
            modulation: Modulation::Qpsk,
            coding_rate: CodingRate::Cr1_2,
            spectral_efficiency: 1.0,
            required_es_n0_db: 1.0,
        },
        ModcodDefinition {
            id: 3,
            modulation: Modulation::Qpsk,
            coding_rate: CodingRate::Cr9_10,
            spectral_efficiency: 2.0,
            required_es_n0_db: 5.0,
        },
    ])
    .unwrap()
}

fn fwd_fifos() -> Vec<QosFifo> {
    QosFifo::build_set(&[FifoConfig {
        priority: 0,
        name: "fwd".into(),
        size_pkts: 5000,
        access: FifoAccess::Rbdc,
    }])
}

fn fmt_for(tal: TalId) -> FmtSimulation {
    let mut fmt = FmtSimulation::new(Vec::new(), 3);
    fmt.register(tal, 0).unwrap();
    fmt
}

fn scheduler() -> ForwardScheduler {
    ForwardScheduler::new(1, PktType::Gse, defs(), BW_KHZ, FRAME_MS, Probes::new())
}

/// Payload bytes that fill one BBFrame at MODCOD 3 exactly
/// (8100 - 10 header - 7 record overhead).
const FULL_FRAME_DATA: usize = 8083;

fn gse_pkt(dst: TalId, len: usize) -> NetPacket {
    NetPacket::new(PktType::Gse, 0, dst, 0, vec![0x5A; len])
}

/// Unused sub-frame credit carries into the next tick: one 8 ms frame on a
/// 20 ms tick leaves 12 ms, which buys a second frame the tick after.
#[test]
fn credit_carries_over() {
    let mut sched = scheduler();
    let mut fifos = fwd_fifos();
    let mut fmt = fmt_for(5);

    fifos[0].push_packet(gse_pkt(5, FULL_FRAME_DATA), 0);
    let mut complete = Vec::new();
    sched.schedule(20, &mut fifos, &mut fmt, &mut complete);
    assert_eq!(complete.len(), 1);
    assert_eq!(sched.remaining_credit_us(), FRAME_MS * 1000 - BBFRAME_US);

    fifos[0].push_packet(gse_pkt(5, FULL_FRAME_DATA), 20);
    fifos[0].push_packet(gse_pkt(5, FULL_FRAME_DATA), 20);
    let mut complete = Vec::new();
    sched.schedule(40, &mut fifos, &mut fmt, &mut complete);
    // 20 + 12 carried = 32 ms of credit, two 8 ms frames fit
    assert_eq!(complete.len(), 2);
    assert_eq!(sched.remaining_credit_us(), 16_000);
}

/// The carry is always inside [0, frame duration).
#[test]
fn credit_stays_below_one_tick() {
    let mut sched = scheduler();
    let mut fifos = fwd_fifos();
    let mut fmt = fmt_for(5);

    for tick in 1..=20u64 {
        fifos[0].push_packet(gse_pkt(5, FULL_FRAME_DATA), tick * FRAME_MS);
        let mut complete = Vec::new();
        sched.schedule(tick * FRAME_MS, &mut fifos, &mut fmt, &mut complete);
        assert!(
            sched.remaining_credit_us() < FRAME_MS * 1000,
            "tick {tick}: carry {} us",
            sched.remaining_credit_us()
        );
    }
}

/// When credit runs out the pending packet goes back to the FIFO head and
/// is transmitted on later ticks.
#[test]
fn credit_exhaustion_defers_packets() {
    let mut sched = scheduler();
    let mut fifos = fwd_fifos();
    let mut fmt = fmt_for(5);

    for _ in 0..5 {
        fifos[0].push_packet(gse_pkt(5, FULL_FRAME_DATA), 0);
    }
    let mut total_frames = 0;
    for tick in 1..=3u64 {
        let mut complete = Vec::new();
        sched.schedule(tick * FRAME_MS, &mut fifos, &mut fmt, &mut complete);
        total_frames += complete.len();
        for bytes in &complete {
            let frame = BbFrame::from_bytes(bytes).unwrap();
            assert_eq!(frame.used_modcod(), 3);
            assert_eq!(bytes.len(), 8100);
        }
    }
    assert_eq!(total_frames, 5);
    assert!(fifos[0].fifo.is_empty());
}

/// A packet larger than the BBFrame payload is refragmented: the head
/// fills the frame exactly, the tail rides the next frame.
#[test]
fn refragmentation_splits_to_fit() {
    let mut sched = scheduler();
    let mut fifos = fwd_fifos();
    let mut fmt = fmt_for(5);

    fifos[0].push_packet(gse_pkt(5, 12_000), 0);
    let mut complete = Vec::new();
    sched.schedule(20, &mut fifos, &mut fmt, &mut complete);

    assert_eq!(complete.len(), 2);
    let first = BbFrame::from_bytes(&complete[0]).unwrap();
    let second = BbFrame::from_bytes(&complete[1]).unwrap();
    let head = &first.packets().unwrap()[0];
    let tail = &second.packets().unwrap()[0];
    assert_eq!(head.len(), FULL_FRAME_DATA);
    assert_eq!(tail.len(), 12_000 - FULL_FRAME_DATA);
    assert_eq!(head.dst_tal, 5);
    assert_eq!(tail.dst_tal, 5);
}

/// An unadvertised MODCOD change transmits at the previous MODCOD and
/// carries the new one in a header option, once.
#[test]
fn modcod_change_is_advertised() {
    let mut sched = scheduler();
    let mut fifos = fwd_fifos();
    let mut fmt = FmtSimulation::new(vec![vec![3], vec![2]], 3);
    fmt.register(5, 0).unwrap();

    fmt.go_next_scenario_step();
    assert_eq!(fmt.current_modcod(5), Some(2));
    assert_eq!(fmt.is_advertised(5), Some(false));

    fifos[0].push_packet(gse_pkt(5, 100), 0);
    let mut complete = Vec::new();
    sched.schedule(20, &mut fifos, &mut fmt, &mut complete);

    assert_eq!(complete.len(), 1);
    let frame = BbFrame::from_bytes(&complete[0]).unwrap();
    // still encoded at the previous modcod, with the update option riding
    assert_eq!(frame.used_modcod(), 3);
    let opts: Vec<_> = frame.options().collect();
    assert_eq!(opts.len(), 1);
    assert_eq!(opts[0].tal_id, 5);
    assert_eq!(opts[0].real_modcod, 2);
    assert_eq!(fmt.is_advertised(5), Some(true));

    // once advertised, traffic moves to the new modcod without options
    fifos[0].push_packet(gse_pkt(5, 100), 20);
    let mut complete = Vec::new();
    sched.schedule(40, &mut fifos, &mut fmt, &mut complete);
    let frame = BbFrame::from_bytes(&complete[0]).unwrap();
    assert_eq!(frame.used_modcod(), 2);
    assert_eq!(frame.option_count(), 0);
}

/// Packets for terminals missing from the FMT tables are dropped without
/// burning credit.
#[test]
fn unknown_terminal_packets_are_dropped() {
    let probes = Probes::new();
    let mut sched = ForwardScheduler::new(1, PktType::Gse, defs(), BW_KHZ, FRAME_MS, probes.clone());
    let mut fifos = fwd_fifos();
    let mut fmt = fmt_for(5);

    fifos[0].push_packet(gse_pkt(99, 100), 0);
    let mut complete = Vec::new();
    sched.schedule(20, &mut fifos, &mut fmt, &mut complete);

    assert!(complete.is_empty());
    assert_eq!(probes.counter("fwd.unknown_terminal_drops"), 1);
    assert_eq!(sched.remaining_credit_us(), 0);
}

/*
 * Return link
 */

fn ret_fifos(access: FifoAccess) -> Vec<QosFifo> {
    QosFifo::build_set(&[FifoConfig {
        priority: 0,
        name: "ret".into(),
        size_pkts: 1000,
        access,
    }])
}

fn atm_pkt(qos: u8) -> NetPacket {
    NetPacket::new(PktType::Atm, 5, 0, qos, vec![0xA5; 53])
}

/// The allocation bounds the drain; leftovers wait for the next frame.
#[test]
fn return_schedule_respects_allocation() {
    let mut sched = ReturnScheduler::new(1, PktType::Atm, Probes::new());
    let mut fifos = ret_fifos(FifoAccess::Rbdc);
    for _ in 0..10 {
        fifos[0].push_packet(atm_pkt(0), 0);
    }

    let out = sched.schedule(0, &mut fifos, 6);
    assert_eq!(out.sent_pkts, 6);
    assert_eq!(fifos[0].fifo.len(), 4);
    assert_eq!(out.frames.len(), 1);

    let frame = DvbRcsFrame::from_bytes(&out.frames[0]).unwrap();
    assert_eq!(frame.qty_element(), 6);
    assert_eq!(out.frames[0].len(), DVB_RCS_SIZE_MAX);
}

/// Full frames close and a fresh one opens; every emitted frame has at
/// least one packet.
#[test]
fn return_schedule_packs_multiple_frames() {
    let mut sched = ReturnScheduler::new(1, PktType::Atm, Probes::new());
    let mut fifos = ret_fifos(FifoAccess::Rbdc);
    // 23 records of 60 bytes fit one 1440-byte frame
    for _ in 0..30 {
        fifos[0].push_packet(atm_pkt(0), 0);
    }

    let out = sched.schedule(0, &mut fifos, 30);
    assert_eq!(out.sent_pkts, 30);
    assert_eq!(out.frames.len(), 2);
    let first = DvbRcsFrame::from_bytes(&out.frames[0]).unwrap();
    let second = DvbRcsFrame::from_bytes(&out.frames[1]).unwrap();
    assert_eq!(first.qty_element() + second.qty_element(), 30);
    assert!(first.qty_element() > 0 && second.qty_element() > 0);
}

/// Higher-priority FIFOs drain first under a shared allocation.
#[test]
fn return_schedule_priority_order() {
    let mut sched = ReturnScheduler::new(1, PktType::Atm, Probes::new());
    let mut fifos = QosFifo::build_set(&[
        FifoConfig {
            priority: 1,
            name: "low".into(),
            size_pkts: 100,
            access: FifoAccess::Rbdc,
        },
        FifoConfig {
            priority: 0,
            name: "high".into(),
            size_pkts: 100,
            access: FifoAccess::Rbdc,
        },
    ]);
    // after sorting, index 0 is the high-priority fifo
    fifos[0].push_packet(atm_pkt(7), 0);
    fifos[0].push_packet(atm_pkt(7), 0);
    fifos[1].push_packet(atm_pkt(1), 0);

    let out = sched.schedule(0, &mut fifos, 2);
    assert_eq!(out.sent_pkts, 2);
    let frame = DvbRcsFrame::from_bytes(&out.frames[0]).unwrap();
    for pkt in frame.packets().unwrap() {
        assert_eq!(pkt.qos, 7);
    }
    assert_eq!(fifos[1].fifo.len(), 1);
}

/// VBDC drains are reported so the agent can shrink its outstanding
/// request; Aloha FIFOs never consume DAMA slots.
#[test]
fn return_schedule_accounting() {
    let mut sched = ReturnScheduler::new(1, PktType::Atm, Probes::new());
    let mut fifos = QosFifo::build_set(&[
        FifoConfig {
            priority: 0,
            name: "vbdc".into(),
            size_pkts: 100,
            access: FifoAccess::Vbdc,
        },
        FifoConfig {
            priority: 1,
            name: "ra".into(),
            size_pkts: 100,
            access: FifoAccess::Aloha,
        },
    ]);
    for _ in 0..3 {
        fifos[0].push_packet(atm_pkt(0), 0);
    }
    fifos[1].push_packet(atm_pkt(0), 0);

    let out = sched.schedule(0, &mut fifos, 10);
    assert_eq!(out.sent_pkts, 3);
    assert_eq!(out.vbdc_sent_pkts, 3);
    assert_eq!(fifos[1].fifo.len(), 1);
}
