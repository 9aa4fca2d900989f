//! Satellite payload dispatch: delay emulation, role routing, the
//! regenerative path.

use dvbsat::band::SpotCarriers;
use dvbsat::config::{Config, FifoConfig, FifoAccess};
use dvbsat::frame::{
    mark_corrupted, BbFrame, DvbFrame, DvbRcsFrame, DvbRcsFrameBuf, LogonRequestBuf, MsgType,
    SacBuf, Sof, SofBuf,
};
use dvbsat::runtime::{Channel, ChannelCtx, Event, Message, MessageBody, MsgKind};
use dvbsat::sat::{SatDownward, SatUpward, TIMER_SAT_FWD, TIMER_SAT_SIG};
use dvbsat::telemetry::Probes;
use dvbsat::{NetPacket, PktType, SatelliteType, TimeMs};

fn carriers() -> SpotCarriers {
    SpotCarriers {
        spot_id: 1,
        gw_id: 0,
        sof: 1,
        ctrl_in: 2,
        ctrl_out: 3,
        logon_in: 4,
        logon_out: 5,
        data_in_st: 6,
        data_in_gw: 7,
        data_out_st: 8,
        data_out_gw: 9,
    }
}

fn config() -> Config {
    Config {
        spots: vec![carriers()],
        fifos: vec![FifoConfig {
            priority: 0,
            name: "data".into(),
            size_pkts: 1000,
            access: FifoAccess::Rbdc,
        }],
        sat_delay_ms: 125,
        ..Default::default()
    }
}

fn frame_event(bytes: Vec<u8>) -> Event {
    Event::Message(Message {
        kind: MsgKind::Sig,
        body: MessageBody::Frame(bytes),
    })
}

/// Run one frame through the upward channel and hand whatever it shares to
/// the downward channel.
fn feed(up: &mut SatUpward, down: &mut SatDownward, bytes: Vec<u8>, now: TimeMs) {
    let mut ctx = ChannelCtx::at(now);
    up.on_event(frame_event(bytes), &mut ctx);
    for msg in ctx.take_shared_out() {
        let mut down_ctx = ChannelCtx::at(now);
        down.on_event(Event::Message(msg), &mut down_ctx);
    }
}

fn fire(down: &mut SatDownward, timer: u32, now: TimeMs) -> Vec<(u8, Vec<u8>)> {
    let mut ctx = ChannelCtx::at(now);
    down.on_event(Event::Timer(timer), &mut ctx);
    ctx.take_lower_out()
}

/// A SoF crosses the payload after exactly the propagation delay, on the
/// ctrl-out carrier, and never earlier.
#[test]
fn sof_crosses_after_exact_delay() {
    let cfg = config();
    let probes = Probes::new();
    let mut up = SatUpward::new(&cfg, probes.clone()).unwrap();
    let mut down = SatDownward::new(&cfg, probes).unwrap();

    let sof = SofBuf {
        spot_id: 1,
        carrier_id: 1,
        sfn: 7,
    };
    feed(&mut up, &mut down, sof.to_bytes(), 0);

    // too early: nothing leaves
    assert!(fire(&mut down, TIMER_SAT_SIG, 60).is_empty());

    let out = fire(&mut down, TIMER_SAT_SIG, 125);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, 3);
    let emitted = Sof::from_bytes(&out[0].1).unwrap();
    assert_eq!(emitted.sfn(), 7);
    let hdr = DvbFrame::from_bytes(&out[0].1).unwrap();
    assert_eq!(hdr.carrier_id(), 3);
}

fn burst_bytes(dsts: &[u16]) -> Vec<u8> {
    let mut frame = DvbRcsFrameBuf::new(1, PktType::Atm);
    for dst in dsts {
        frame.add_packet(NetPacket::new(PktType::Atm, 5, *dst, 0, vec![0; 53]));
    }
    frame.carrier_id = 6;
    frame.to_bytes()
}

/// Data waits in the delay FIFO at least `sat_delay_ms`, crosses to the
/// counterpart carrier, and input order survives.
#[test]
fn data_is_delayed_and_rerouted() {
    let cfg = config();
    let probes = Probes::new();
    let mut up = SatUpward::new(&cfg, probes.clone()).unwrap();
    let mut down = SatDownward::new(&cfg, probes).unwrap();

    let first = burst_bytes(&[0]);
    let second = burst_bytes(&[0, 0]);
    feed(&mut up, &mut down, first, 0);
    feed(&mut up, &mut down, second, 1);

    // first forward tick: nothing has aged enough
    assert!(fire(&mut down, TIMER_SAT_FWD, 20).is_empty());
    assert!(fire(&mut down, TIMER_SAT_FWD, 120).is_empty());

    let out = fire(&mut down, TIMER_SAT_FWD, 140);
    assert_eq!(out.len(), 2);
    for (carrier, bytes) in &out {
        assert_eq!(*carrier, 9);
        assert_eq!(DvbFrame::from_bytes(bytes).unwrap().carrier_id(), 9);
    }
    // order preserved across identical tick-outs
    assert_eq!(DvbRcsFrame::from_bytes(&out[0].1).unwrap().qty_element(), 1);
    assert_eq!(DvbRcsFrame::from_bytes(&out[1].1).unwrap().qty_element(), 2);
}

/// Control traffic follows the role table: logon requests to the logon-out
/// carrier, SACs to ctrl-out.
#[test]
fn control_frames_follow_their_roles() {
    let cfg = config();
    let probes = Probes::new();
    let mut up = SatUpward::new(&cfg, probes.clone()).unwrap();
    let mut down = SatDownward::new(&cfg, probes).unwrap();

    let logon = LogonRequestBuf {
        spot_id: 1,
        carrier_id: 4,
        mac: 5,
        cra_kbps: 64,
        max_rbdc_kbps: 256,
        max_vbdc_pkts: 0,
    };
    let sac = SacBuf {
        spot_id: 1,
        carrier_id: 2,
        tal_id: 5,
        entries: vec![],
        cni_q8: 0,
    };
    feed(&mut up, &mut down, logon.to_bytes(), 0);
    feed(&mut up, &mut down, sac.to_bytes(), 0);

    let out = fire(&mut down, TIMER_SAT_FWD, 140);
    let carriers: Vec<u8> = out.iter().map(|(c, _)| *c).collect();
    assert!(carriers.contains(&5), "logon request missing on logon-out");
    assert!(carriers.contains(&3), "sac missing on ctrl-out");
}

#[test]
fn unknown_carrier_is_counted_and_dropped() {
    let cfg = config();
    let probes = Probes::new();
    let mut up = SatUpward::new(&cfg, probes.clone()).unwrap();

    let mut bytes = burst_bytes(&[0]);
    bytes[4] = 77;
    let mut ctx = ChannelCtx::at(0);
    up.on_event(frame_event(bytes), &mut ctx);

    assert!(ctx.take_shared_out().is_empty());
    assert_eq!(probes.counter("sat.unknown_carrier_drops"), 1);
}

/// A transparent payload cannot decode, so a corrupted frame is dead on
/// arrival.
#[test]
fn corrupted_frame_dropped_when_transparent() {
    let cfg = config();
    let probes = Probes::new();
    let mut up = SatUpward::new(&cfg, probes.clone()).unwrap();

    let mut bytes = burst_bytes(&[0]);
    mark_corrupted(&mut bytes);
    let mut ctx = ChannelCtx::at(0);
    up.on_event(frame_event(bytes), &mut ctx);

    assert!(ctx.take_shared_out().is_empty());
    assert_eq!(probes.counter("sat.corrupted_drops"), 1);
}

/// Regenerative path: return bursts are decapsulated; GW-bound packets go
/// up the stack, the rest is rescheduled locally into BBFrames.
#[test]
fn regenerative_payload_reschedules_traffic() {
    let mut cfg = config();
    cfg.satellite_type = SatelliteType::Regenerative;
    let probes = Probes::new();
    let mut up = SatUpward::new(&cfg, probes.clone()).unwrap();
    let mut down = SatDownward::new(&cfg, probes).unwrap();
    up.set_switch([(7u16, 1u8)].into_iter().collect(), 1);
    down.register_terminal(7, 0);

    let bytes = burst_bytes(&[0, 7]);
    let mut ctx = ChannelCtx::at(0);
    up.on_event(frame_event(bytes), &mut ctx);

    // the GW-bound packet leaves toward the upper layer
    let upper = ctx.take_upper_out();
    assert_eq!(upper.len(), 1);
    match &upper[0].body {
        MessageBody::Burst(burst) => {
            assert_eq!(burst.len(), 1);
            assert_eq!(burst[0].dst_tal, 0);
        }
        other => panic!("unexpected upper message {other:?}"),
    }

    // the terminal-bound packet is shared for local rescheduling
    let mut emitted = Vec::new();
    for msg in ctx.take_shared_out() {
        let mut down_ctx = ChannelCtx::at(0);
        down.on_event(Event::Message(msg), &mut down_ctx);
        emitted.extend(down_ctx.take_lower_out());
    }
    assert!(emitted.is_empty());

    let out = fire(&mut down, TIMER_SAT_FWD, 20);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, 8);
    let frame = BbFrame::from_bytes(&out[0].1).unwrap();
    let pkts = frame.packets().unwrap();
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].dst_tal, 7);
    assert_eq!(
        DvbFrame::from_bytes(&out[0].1).unwrap().msg_type(),
        MsgType::BbFrame
    );
}
