//! The satellite payload block.
//!
//! The upward channel receives every frame from the sat-carrier transport,
//! resolves its input carrier and either validates-and-forwards it
//! (transparent) or decapsulates return traffic and routes packets by
//! destination (regenerative). The downward channel owns the per-GW delay
//! FIFOs, drains whatever is due on each forward tick, and on a
//! regenerative payload runs the forward scheduler locally per spot.
//!
//! SoF beacons never sit in a drained-by-timer FIFO: they would pick up a
//! random fraction of the forward tick on top of the propagation delay and
//! superframe synchronisation needs better than that. They go through a
//! dedicated queue timed exactly at `arrival + sat_delay`.

use std::collections::VecDeque;

use crate::band::{CarrierTable, SpotCarriers};
use crate::config::Config;
use crate::fifo::{DvbFifo, QosFifo};
use crate::fmt::FmtSimulation;
use crate::frame::{self, DvbFrame, MsgType, Sac};
use crate::fwd_sched::ForwardScheduler;
use crate::runtime::{Channel, ChannelCtx, Event, Message, MessageBody, MsgKind, TimerId};
use crate::standard::{RcsStd, ReceptionStd};
use crate::telemetry::Probes;
use crate::{CarrierId, CarrierRole, SatelliteType, SpotId, TalId, TimeMs, GW_TAL_ID};

pub const TIMER_SAT_FWD: TimerId = 1;
pub const TIMER_SAT_SIG: TimerId = 2;
pub const TIMER_SAT_SCENARIO: TimerId = 3;

/// Capacity of each per-role delay FIFO, in frames.
const SAT_FIFO_SIZE: usize = 4096;

/// Delay FIFOs of one GW inside one spot.
#[derive(Debug)]
struct SatGw {
    carriers: SpotCarriers,
    logon_fifo: DvbFifo<Vec<u8>>,
    control_fifo: DvbFifo<Vec<u8>>,
    data_out_st_fifo: DvbFifo<Vec<u8>>,
    data_out_gw_fifo: DvbFifo<Vec<u8>>,
}

impl SatGw {
    fn new(carriers: SpotCarriers) -> Self {
        Self {
            carriers,
            logon_fifo: DvbFifo::new("sat.logon", SAT_FIFO_SIZE),
            control_fifo: DvbFifo::new("sat.control", SAT_FIFO_SIZE),
            data_out_st_fifo: DvbFifo::new("sat.data_out_st", SAT_FIFO_SIZE),
            data_out_gw_fifo: DvbFifo::new("sat.data_out_gw", SAT_FIFO_SIZE),
        }
    }

    /// Emit everything due, rewriting each frame onto its output carrier.
    fn send_frames(&mut self, now: TimeMs, ctx: &mut ChannelCtx) {
        let pairs: [(&mut DvbFifo<Vec<u8>>, CarrierId); 4] = [
            (&mut self.logon_fifo, self.carriers.logon_out),
            (&mut self.control_fifo, self.carriers.ctrl_out),
            (&mut self.data_out_st_fifo, self.carriers.data_out_st),
            (&mut self.data_out_gw_fifo, self.carriers.data_out_gw),
        ];
        for (fifo, out_carrier) in pairs {
            while let Some(elem) = fifo.pop_ready(now) {
                let mut bytes = elem.payload;
                frame::set_carrier_id(&mut bytes, out_carrier);
                ctx.send_frame(out_carrier, bytes);
            }
        }
    }
}

/// Regenerative per-spot state: locally scheduled forward link.
#[derive(Debug)]
struct RegenSpot {
    fwd_fifos: Vec<QosFifo>,
    scheduler: ForwardScheduler,
}

#[derive(Debug)]
struct SatSpot {
    spot_id: SpotId,
    gws: Vec<SatGw>,
    regen: Option<RegenSpot>,
}

impl SatSpot {
    fn gw_mut(&mut self, gw_id: TalId) -> Option<&mut SatGw> {
        self.gws.iter_mut().find(|g| g.carriers.gw_id == gw_id)
    }
}

/*
 * Upward channel
 */

pub struct SatUpward {
    satellite_type: SatelliteType,
    with_phy_layer: bool,
    carrier_table: CarrierTable,
    reception: RcsStd,
    probes: Probes,
}

impl SatUpward {
    pub fn new(cfg: &Config, probes: Probes) -> Result<Self, crate::error::ConfigError> {
        let mut reception = RcsStd::new();
        if cfg.satellite_type == SatelliteType::Regenerative {
            // without switching entries every packet stays in its spot
            let default_spot = cfg.spots.first().map(|s| s.spot_id).unwrap_or(0);
            reception.set_switch(Default::default(), default_spot);
        }
        Ok(Self {
            satellite_type: cfg.satellite_type,
            with_phy_layer: cfg.with_phy_layer,
            carrier_table: cfg.carrier_table()?,
            reception,
            probes,
        })
    }

    /// Install the regenerative `tal_id -> spot_id` switch table.
    pub fn set_switch(
        &mut self,
        switch: std::collections::BTreeMap<TalId, SpotId>,
        default_spot: SpotId,
    ) {
        self.reception.set_switch(switch, default_spot);
    }

    fn on_frame(&mut self, bytes: Vec<u8>, ctx: &mut ChannelCtx) -> bool {
        let Ok(hdr) = DvbFrame::from_bytes(&bytes) else {
            log::warn!("sat up: malformed frame, dropped");
            self.probes.incr("sat.malformed_frames");
            return true;
        };
        let Some(entry) = self.carrier_table.resolve(hdr.carrier_id()) else {
            log::warn!("sat up: unknown carrier {}, frame dropped", hdr.carrier_id());
            self.probes.incr("sat.unknown_carrier_drops");
            return true;
        };

        match hdr.msg_type() {
            MsgType::Corrupted if self.satellite_type == SatelliteType::Transparent => {
                // a transparent payload cannot decode, so it cannot use a
                // corrupted frame either
                log::debug!("sat up: corrupted frame dropped");
                self.probes.incr("sat.corrupted_drops");
                return true;
            }
            MsgType::Corrupted | MsgType::DvbBurst
                if self.satellite_type == SatelliteType::Regenerative
                    && entry.role == CarrierRole::DataInSt =>
            {
                return self.regen_burst(bytes, entry.spot_id, ctx);
            }
            MsgType::Sac if self.satellite_type == SatelliteType::Regenerative
                && self.with_phy_layer =>
            {
                if let Ok(sac) = Sac::from_bytes(&bytes) {
                    // let the downward channel refresh its local FMT state
                    ctx.share(Message {
                        kind: MsgKind::Cni,
                        body: MessageBody::Cni {
                            tal_id: sac.tal_id(),
                            cni_db: frame::q8_to_cni(sac.cni_q8()),
                        },
                    });
                }
            }
            _ => {}
        }

        // everything else crosses the payload untouched; the downward
        // channel owns the delay emulation
        self.probes.incr("sat.forwarded_frames");
        ctx.share(Message {
            kind: MsgKind::Sig,
            body: MessageBody::Frame(bytes),
        });
        true
    }

    /// Regenerative handling of a return burst: decapsulate, hand GW-bound
    /// packets to the upper layer, reroute the rest by destination spot.
    fn regen_burst(&mut self, bytes: Vec<u8>, from_spot: SpotId, ctx: &mut ChannelCtx) -> bool {
        let burst = match self.reception.on_receive_frame(&bytes, None) {
            Ok(burst) => burst,
            Err(err) => {
                log::warn!("sat up: undecodable return burst: {err}");
                self.probes.incr("sat.undecodable_bursts");
                return false;
            }
        };
        self.probes.add("sat.l2_from_st_bytes", bytes.len() as u64);

        let mut to_gw = Vec::new();
        let mut per_spot: std::collections::BTreeMap<SpotId, Vec<crate::NetPacket>> =
            Default::default();
        for pkt in burst {
            if pkt.dst_tal == GW_TAL_ID {
                to_gw.push(pkt);
            } else {
                let spot = self
                    .reception
                    .switch_spot(pkt.dst_tal)
                    .unwrap_or(from_spot);
                per_spot.entry(spot).or_default().push(pkt);
            }
        }
        if !to_gw.is_empty() {
            ctx.send_upper(Message {
                kind: MsgKind::EncapBurst,
                body: MessageBody::Burst(to_gw),
            });
        }
        for (spot_id, burst) in per_spot {
            ctx.share(Message {
                kind: MsgKind::EncapBurst,
                body: MessageBody::SpotBurst { spot_id, burst },
            });
        }
        true
    }
}

impl Channel for SatUpward {
    fn on_event(&mut self, event: Event, ctx: &mut ChannelCtx) -> bool {
        match event {
            Event::Message(Message {
                body: MessageBody::Frame(bytes),
                ..
            }) => self.on_frame(bytes, ctx),
            Event::Message(_) => true,
            Event::Timer(id) => {
                log::error!("sat up: unexpected timer {id}");
                false
            }
        }
    }
}

/*
 * Downward channel
 */

pub struct SatDownward {
    satellite_type: SatelliteType,
    sat_delay_ms: TimeMs,
    fwd_frame_duration_ms: TimeMs,
    scenario_refresh_ms: TimeMs,
    carrier_table: CarrierTable,
    spots: Vec<SatSpot>,
    /// Regenerative-only FMT state for the locally scheduled forward link.
    fmt: FmtSimulation,
    fwd_defs: crate::fmt::ModcodDefinitionTable,
    /// Signalling frames waiting out the propagation delay:
    /// `(emit_at, spot, bytes)`.
    sig_queue: VecDeque<(TimeMs, SpotId, Vec<u8>)>,
    down_frame_counter: u64,
    probes: Probes,
}

impl SatDownward {
    pub fn new(cfg: &Config, probes: Probes) -> Result<Self, crate::error::ConfigError> {
        let regen = cfg.satellite_type == SatelliteType::Regenerative;
        let mut spots: Vec<SatSpot> = Vec::new();
        for carriers in &cfg.spots {
            let gw = SatGw::new(*carriers);
            match spots.iter().position(|s| s.spot_id == carriers.spot_id) {
                Some(i) => spots[i].gws.push(gw),
                None => spots.push(SatSpot {
                    spot_id: carriers.spot_id,
                    gws: vec![gw],
                    regen: regen.then(|| RegenSpot {
                        fwd_fifos: QosFifo::build_set(&cfg.fifos),
                        scheduler: ForwardScheduler::new(
                            carriers.spot_id,
                            cfg.fwd_pkt_type,
                            cfg.fwd_modcod_defs.clone(),
                            cfg.fwd_bandwidth_khz,
                            cfg.fwd_down_frame_duration_ms,
                            probes.clone(),
                        ),
                    }),
                }),
            }
        }
        Ok(Self {
            satellite_type: cfg.satellite_type,
            sat_delay_ms: cfg.sat_delay_ms,
            fwd_frame_duration_ms: cfg.fwd_down_frame_duration_ms,
            scenario_refresh_ms: cfg.dvb_scenario_refresh_ms,
            carrier_table: cfg.carrier_table()?,
            spots,
            fmt: FmtSimulation::new(
                cfg.fwd_scenario.clone(),
                cfg.fwd_modcod_defs.highest_id(),
            ),
            fwd_defs: cfg.fwd_modcod_defs.clone(),
            sig_queue: VecDeque::new(),
            down_frame_counter: 0,
            probes,
        })
    }

    /// Events to seed the runtime with at start-up.
    pub fn initial_events(&self) -> Vec<(TimeMs, Event)> {
        let mut events = vec![(self.fwd_frame_duration_ms, Event::Timer(TIMER_SAT_FWD))];
        if self.satellite_type == SatelliteType::Regenerative {
            events.push((self.scenario_refresh_ms, Event::Timer(TIMER_SAT_SCENARIO)));
        }
        events
    }

    /// Register a terminal in the local forward FMT (regenerative only).
    pub fn register_terminal(&mut self, tal_id: TalId, column: usize) {
        if self.satellite_type == SatelliteType::Regenerative {
            let _ = self.fmt.register(tal_id, column);
        }
    }

    fn on_fwd_timer(&mut self, ctx: &mut ChannelCtx) -> bool {
        // re-arm first so that drain time does not stretch the period
        ctx.set_timer(TIMER_SAT_FWD, self.fwd_frame_duration_ms);
        self.down_frame_counter += 1;
        self.probes.put("sat.fwd_frame", self.down_frame_counter);
        let now = ctx.now();

        // due beacons leave before anything the FIFOs release this tick, so
        // an SoF is never overtaken by the TTP of its own superframe
        self.on_sig_timer(ctx);

        for spot in self.spots.iter_mut() {
            for gw in spot.gws.iter_mut() {
                gw.send_frames(now, ctx);
            }
            if let Some(regen) = spot.regen.as_mut() {
                let mut complete = Vec::new();
                regen
                    .scheduler
                    .schedule(now, &mut regen.fwd_fifos, &mut self.fmt, &mut complete);
                for mut frame_bytes in complete {
                    // every GW of the spot shares the forward carrier
                    for gw in spot.gws.iter() {
                        frame::set_carrier_id(&mut frame_bytes, gw.carriers.data_out_st);
                        ctx.send_frame(gw.carriers.data_out_st, frame_bytes.clone());
                    }
                }
            }
        }
        true
    }

    fn on_sig_timer(&mut self, ctx: &mut ChannelCtx) -> bool {
        let now = ctx.now();
        while let Some((emit_at, _, _)) = self.sig_queue.front() {
            if *emit_at > now {
                break;
            }
            let (_, spot_id, bytes) = self.sig_queue.pop_front().unwrap();
            if let Some(spot) = self.spots.iter().find(|s| s.spot_id == spot_id) {
                for gw in &spot.gws {
                    let mut copy = bytes.clone();
                    frame::set_carrier_id(&mut copy, gw.carriers.ctrl_out);
                    ctx.send_frame(gw.carriers.ctrl_out, copy);
                }
            }
        }
        true
    }

    /// Place one forwarded frame into the delay FIFO its role maps to.
    fn dispatch_frame(&mut self, bytes: Vec<u8>, ctx: &mut ChannelCtx) -> bool {
        let now = ctx.now();
        let Ok(hdr) = DvbFrame::from_bytes(&bytes) else {
            self.probes.incr("sat.malformed_frames");
            return true;
        };
        let msg_type = hdr.msg_type();
        let Some(entry) = self.carrier_table.resolve(hdr.carrier_id()) else {
            self.probes.incr("sat.unknown_carrier_drops");
            return true;
        };

        if entry.role == CarrierRole::Sof {
            // exact-delay path, broadcast on every ctrl-out of the spot
            self.sig_queue
                .push_back((now + self.sat_delay_ms, entry.spot_id, bytes));
            ctx.set_timer(TIMER_SAT_SIG, self.sat_delay_ms);
            return true;
        }

        let Some(spot) = self.spots.iter_mut().find(|s| s.spot_id == entry.spot_id) else {
            self.probes.incr("sat.unknown_carrier_drops");
            return true;
        };
        let Some(gw) = spot.gw_mut(entry.gw_id) else {
            self.probes.incr("sat.unknown_carrier_drops");
            return true;
        };

        let fifo = match (entry.role, msg_type) {
            (CarrierRole::LogonIn, MsgType::LogonReq) => &mut gw.logon_fifo,
            (CarrierRole::CtrlIn, _) => &mut gw.control_fifo,
            // return data crosses toward the GW, Slotted-Aloha control
            // turns back toward the terminals
            (CarrierRole::DataInSt, MsgType::SalohaCtrl) => &mut gw.data_out_st_fifo,
            (CarrierRole::DataInSt, _) => &mut gw.data_out_gw_fifo,
            (CarrierRole::DataInGw, _) => &mut gw.data_out_st_fifo,
            (role, t) => {
                log::warn!("sat down: type {t:?} on {role:?} carrier, dropped");
                self.probes.incr("sat.misrouted_drops");
                return true;
            }
        };
        if fifo.push(bytes, now, self.sat_delay_ms).is_err() {
            // over-commit of the emulated link
            self.probes.incr("sat.fifo_drops");
            return false;
        }
        true
    }

    /// Queue a rerouted burst on the regenerative forward path.
    fn dispatch_burst(&mut self, spot_id: SpotId, burst: crate::NetBurst, ctx: &ChannelCtx) -> bool {
        let now = ctx.now();
        let Some(spot) = self.spots.iter_mut().find(|s| s.spot_id == spot_id) else {
            self.probes.incr("sat.unknown_spot_drops");
            return true;
        };
        let Some(regen) = spot.regen.as_mut() else {
            log::error!("sat down: burst for spot {spot_id} on a transparent payload");
            return false;
        };
        for pkt in burst {
            let qos = pkt.qos as usize;
            let idx = if qos < regen.fwd_fifos.len() { qos } else { 0 };
            let Some(qf) = regen.fwd_fifos.get_mut(idx) else {
                continue;
            };
            if !qf.push_packet(pkt, now) {
                self.probes.incr("sat.fwd_fifo_drops");
            }
        }
        true
    }
}

impl Channel for SatDownward {
    fn on_event(&mut self, event: Event, ctx: &mut ChannelCtx) -> bool {
        match event {
            Event::Timer(TIMER_SAT_FWD) => self.on_fwd_timer(ctx),
            Event::Timer(TIMER_SAT_SIG) => self.on_sig_timer(ctx),
            Event::Timer(TIMER_SAT_SCENARIO) => {
                ctx.set_timer(TIMER_SAT_SCENARIO, self.scenario_refresh_ms);
                self.fmt.go_next_scenario_step();
                true
            }
            Event::Timer(id) => {
                log::error!("sat down: unknown timer {id}");
                false
            }
            Event::Message(Message { body, .. }) => match body {
                MessageBody::Frame(bytes) => self.dispatch_frame(bytes, ctx),
                MessageBody::SpotBurst { spot_id, burst } => {
                    self.dispatch_burst(spot_id, burst, ctx)
                }
                MessageBody::Cni { tal_id, cni_db } => {
                    // uplink quality drives the local forward FMT override
                    let defs = self.fwd_defs.clone();
                    self.fmt.set_required_modcod(tal_id, cni_db, &defs);
                    true
                }
                _ => true,
            },
        }
    }
}
