//! The gateway block, running the Network Control Centre.
//!
//! Downward channel: superframe timeline (SoF + DAMA + TTP), forward
//! BBFrame scheduling, logon acceptance, FMT scenario stepping. Upward
//! channel: return-link reception, with control frames (SAC, logon,
//! logoff) relayed to the downward channel over the share queue so that
//! each piece of terminal state keeps a single writer.

use std::collections::BTreeMap;

use crate::band::RateConverter;
use crate::config::Config;
use crate::dama::{DamaController, PepRequest};
use crate::error::ResourceConflict;
use crate::fifo::QosFifo;
use crate::fmt::FmtSimulation;
use crate::frame::{
    self, DvbFrame, LogonRequest, Logoff, LogonResponseBuf, MsgType, Sac, SofBuf,
};
use crate::fwd_sched::ForwardScheduler;
use crate::runtime::{Channel, ChannelCtx, Event, Message, MessageBody, MsgKind, TimerId};
use crate::standard::{PhysicStd, ReceptionStd, RcsStd, S2Std};
use crate::telemetry::Probes;
use crate::{SatelliteType, SpotId, TalId, TimeMs};

pub const TIMER_GW_FRAME: TimerId = 1;
pub const TIMER_GW_FWD: TimerId = 2;
pub const TIMER_GW_SCENARIO: TimerId = 3;

/// Per-spot downward state: one DAMA controller and one forward scheduler
/// per (spot, gw) pair.
struct SpotDown {
    carriers: crate::band::SpotCarriers,
    dama: DamaController,
    fwd_fifos: Vec<QosFifo>,
    fwd_sched: ForwardScheduler,
}

pub struct GwDownward {
    ret_frame_duration_ms: TimeMs,
    fwd_frame_duration_ms: TimeMs,
    scenario_refresh_ms: TimeMs,
    frames_per_superframe: u32,
    with_phy_layer: bool,

    /// Local superframe counter, monotonic for the whole run; only its low
    /// 16 bits go on the wire.
    super_frame_counter: u64,
    fwd_frame_counter: u64,

    spots: Vec<SpotDown>,
    /// Forward-link FMT: scenario playback and advertisement state.
    fwd_fmt: FmtSimulation,
    /// Return-link FMT: feeds the controllers' per-terminal return MODCOD.
    ret_fmt: FmtSimulation,
    ret_defs: crate::fmt::ModcodDefinitionTable,
    /// Spot a logged-on terminal reaches the network through.
    terminal_spot: BTreeMap<TalId, SpotId>,

    probes: Probes,
}

impl GwDownward {
    pub fn new(cfg: &Config, probes: Probes) -> Result<Self, crate::error::ConfigError> {
        cfg.validate()?;
        let sf_duration_ms = cfg.ret_up_frame_duration_ms * cfg.frames_per_superframe as u64;
        let converter = RateConverter::new(cfg.ret_pkt_size(), sf_duration_ms);
        let mut spots = Vec::new();
        for carriers in &cfg.spots {
            let capacity = cfg.ret_capacity_pkts(carriers.spot_id, carriers.gw_id);
            spots.push(SpotDown {
                carriers: *carriers,
                dama: DamaController::new(capacity, converter, cfg.fca_kbps, probes.clone()),
                fwd_fifos: QosFifo::build_set(&cfg.fifos),
                fwd_sched: ForwardScheduler::new(
                    carriers.spot_id,
                    cfg.fwd_pkt_type,
                    cfg.fwd_modcod_defs.clone(),
                    cfg.fwd_bandwidth_khz,
                    cfg.fwd_down_frame_duration_ms,
                    probes.clone(),
                ),
            });
        }
        Ok(Self {
            ret_frame_duration_ms: cfg.ret_up_frame_duration_ms,
            fwd_frame_duration_ms: cfg.fwd_down_frame_duration_ms,
            scenario_refresh_ms: cfg.dvb_scenario_refresh_ms,
            frames_per_superframe: cfg.frames_per_superframe,
            with_phy_layer: cfg.with_phy_layer,
            super_frame_counter: 0,
            fwd_frame_counter: 0,
            spots,
            fwd_fmt: FmtSimulation::new(
                cfg.fwd_scenario.clone(),
                cfg.fwd_modcod_defs.highest_id(),
            ),
            ret_fmt: FmtSimulation::new(
                cfg.ret_scenario.clone(),
                cfg.ret_modcod_defs.highest_id(),
            ),
            ret_defs: cfg.ret_modcod_defs.clone(),
            terminal_spot: BTreeMap::new(),
            probes,
        })
    }

    pub fn initial_events(&self) -> Vec<(TimeMs, Event)> {
        vec![
            (0, Event::Timer(TIMER_GW_FRAME)),
            (self.fwd_frame_duration_ms, Event::Timer(TIMER_GW_FWD)),
            (self.scenario_refresh_ms, Event::Timer(TIMER_GW_SCENARIO)),
        ]
    }

    pub fn super_frame_counter(&self) -> u64 {
        self.super_frame_counter
    }

    pub fn is_terminal_registered(&self, tal_id: TalId) -> bool {
        self.terminal_spot.contains_key(&tal_id)
    }

    /// Column declared for a terminal in the forward FMT, for inspection.
    pub fn fmt_column(&self, tal_id: TalId) -> Option<usize> {
        self.fwd_fmt.column(tal_id)
    }

    /// External policy command (PEP channel).
    pub fn apply_pep_command(&mut self, req: &PepRequest) -> Result<(), ResourceConflict> {
        let Some(spot_id) = self.terminal_spot.get(&req.tal_id).copied() else {
            return Err(ResourceConflict {
                tal_id: req.tal_id,
                requested: 0,
                limit: 0,
                bound: "registration",
            });
        };
        let spot = self
            .spots
            .iter_mut()
            .find(|s| s.carriers.spot_id == spot_id)
            .expect("registered terminal on unknown spot");
        spot.dama.apply_pep_command(req)
    }

    /// Superframe tick: SoF first, then the allocation, then its TTP, on
    /// every spot.
    fn on_frame_timer(&mut self, ctx: &mut ChannelCtx) -> bool {
        ctx.set_timer(TIMER_GW_FRAME, self.ret_frame_duration_ms);
        self.super_frame_counter += 1;
        let sfn_wire = self.super_frame_counter as u16;

        for spot in self.spots.iter_mut() {
            let sof = SofBuf {
                spot_id: spot.carriers.spot_id,
                carrier_id: spot.carriers.sof,
                sfn: sfn_wire,
            };
            ctx.send_frame(spot.carriers.sof, sof.to_bytes());

            let mut ttp = spot.dama.run_on_super_frame_change(sfn_wire);
            ttp.spot_id = spot.carriers.spot_id;
            ttp.carrier_id = spot.carriers.ctrl_in;
            ctx.send_frame(spot.carriers.ctrl_in, ttp.to_bytes());
        }
        self.probes.put("gw.super_frame", self.super_frame_counter);
        true
    }

    /// Forward tick: pack every spot's forward FIFOs into BBFrames and
    /// drain the complete list to the data carrier.
    fn on_fwd_timer(&mut self, ctx: &mut ChannelCtx) -> bool {
        ctx.set_timer(TIMER_GW_FWD, self.fwd_frame_duration_ms);
        self.fwd_frame_counter += 1;
        self.probes.put("gw.fwd_frame", self.fwd_frame_counter);
        let now = ctx.now();

        for spot in self.spots.iter_mut() {
            let mut complete = Vec::new();
            spot.fwd_sched
                .schedule(now, &mut spot.fwd_fifos, &mut self.fwd_fmt, &mut complete);
            for mut bytes in complete {
                frame::set_carrier_id(&mut bytes, spot.carriers.data_in_gw);
                ctx.send_frame(spot.carriers.data_in_gw, bytes);
            }
        }
        true
    }

    fn on_scenario_timer(&mut self, ctx: &mut ChannelCtx) -> bool {
        ctx.set_timer(TIMER_GW_SCENARIO, self.scenario_refresh_ms);
        self.fwd_fmt.go_next_scenario_step();
        self.ret_fmt.go_next_scenario_step();
        // refresh what the controllers believe about each terminal
        for spot in self.spots.iter_mut() {
            let ids: Vec<TalId> = self.ret_fmt.tal_ids().collect();
            for tal_id in ids {
                if let Some(modcod) = self.ret_fmt.current_modcod(tal_id) {
                    spot.dama.update_terminal_modcod(tal_id, modcod);
                }
            }
        }
        true
    }

    fn spot_for_terminal(&mut self, tal_id: TalId) -> Option<&mut SpotDown> {
        let spot_id = self.terminal_spot.get(&tal_id).copied()?;
        self.spots
            .iter_mut()
            .find(|s| s.carriers.spot_id == spot_id)
    }

    fn on_logon_request(&mut self, bytes: &[u8], ctx: &mut ChannelCtx) -> bool {
        let req = match LogonRequest::from_bytes(bytes) {
            Ok(req) => req,
            Err(err) => {
                log::warn!("gw: malformed logon request: {err:?}");
                self.probes.incr("gw.malformed_frames");
                return false;
            }
        };
        let mac = req.mac();
        let hdr = DvbFrame::from_bytes(bytes).unwrap();
        let spot_id = hdr.spot_id();
        let Some(spot) = self
            .spots
            .iter_mut()
            .find(|s| s.carriers.spot_id == spot_id)
        else {
            log::warn!("gw: logon request for unknown spot {spot_id}");
            self.probes.incr("gw.unknown_spot_logons");
            return false;
        };

        // the terminal's scenario column is its id
        let column = mac as usize;
        spot.dama.register_terminal(
            mac,
            req.cra_kbps() as u32,
            req.max_rbdc_kbps() as u32,
            req.max_vbdc_pkts() as u32,
            self.ret_defs.highest_id(),
        );
        if self.fwd_fmt.register(mac, column).is_err() {
            log::warn!("gw: no forward scenario column {column}, terminal {mac} on column 0");
            let _ = self.fwd_fmt.register(mac, 0);
        }
        if self.ret_fmt.register(mac, column).is_err() {
            let _ = self.ret_fmt.register(mac, 0);
        }
        self.terminal_spot.insert(mac, spot_id);

        let resp = LogonResponseBuf {
            spot_id,
            carrier_id: spot.carriers.ctrl_in,
            mac,
            group_id: spot_id,
            logon_id: mac,
        };
        ctx.send_frame(spot.carriers.ctrl_in, resp.to_bytes());
        log::info!("gw: terminal {mac} logged on spot {spot_id}");
        self.probes.incr("gw.logons");
        true
    }

    fn on_logoff(&mut self, bytes: &[u8]) -> bool {
        let Ok(logoff) = Logoff::from_bytes(bytes) else {
            self.probes.incr("gw.malformed_frames");
            return false;
        };
        let mac = logoff.mac();
        if let Some(spot) = self.spot_for_terminal(mac) {
            spot.dama.deregister_terminal(mac);
        }
        self.fwd_fmt.deregister(mac);
        self.ret_fmt.deregister(mac);
        self.terminal_spot.remove(&mac);
        log::info!("gw: terminal {mac} logged off");
        true
    }

    fn on_sac(&mut self, bytes: &[u8]) -> bool {
        let sac = match Sac::from_bytes(bytes) {
            Ok(sac) => sac,
            Err(err) => {
                log::warn!("gw: malformed sac: {err:?}");
                self.probes.incr("gw.malformed_frames");
                return false;
            }
        };
        let tal_id = sac.tal_id();
        if self.with_phy_layer {
            let cni_db = frame::q8_to_cni(sac.cni_q8());
            self.ret_fmt.set_required_modcod(tal_id, cni_db, &self.ret_defs);
        }
        let Some(spot) = self.spot_for_terminal(tal_id) else {
            log::warn!("gw: sac from unregistered terminal {tal_id}, dropped");
            self.probes.incr("gw.unknown_sac_drops");
            return false;
        };
        match spot.dama.here_is_sac(&sac) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("gw: sac refused: {err}");
                self.probes.incr("gw.unknown_sac_drops");
                false
            }
        }
    }

    /// A burst of forward traffic from the upper layer, spread into the
    /// per-QoS FIFOs of each destination's spot.
    fn on_encap_burst(&mut self, burst: crate::NetBurst, now: TimeMs) -> bool {
        let mut ok = true;
        for pkt in burst {
            let Some(spot_id) = self.terminal_spot.get(&pkt.dst_tal).copied().or_else(|| {
                (pkt.dst_tal == crate::BROADCAST_TAL_ID)
                    .then(|| self.spots.first().map(|s| s.carriers.spot_id))
                    .flatten()
            }) else {
                log::debug!("gw: packet for unknown terminal {}, dropped", pkt.dst_tal);
                self.probes.incr("gw.unknown_terminal_drops");
                ok = false;
                continue;
            };
            let Some(spot) = self
                .spots
                .iter_mut()
                .find(|s| s.carriers.spot_id == spot_id)
            else {
                continue;
            };
            let qos = pkt.qos as usize;
            let idx = if qos < spot.fwd_fifos.len() { qos } else { 0 };
            if !spot.fwd_fifos[idx].push_packet(pkt, now) {
                self.probes.incr("gw.fwd_fifo_drops");
                ok = false;
            }
        }
        ok
    }
}

impl Channel for GwDownward {
    fn on_event(&mut self, event: Event, ctx: &mut ChannelCtx) -> bool {
        match event {
            Event::Timer(TIMER_GW_FRAME) => self.on_frame_timer(ctx),
            Event::Timer(TIMER_GW_FWD) => self.on_fwd_timer(ctx),
            Event::Timer(TIMER_GW_SCENARIO) => self.on_scenario_timer(ctx),
            Event::Timer(id) => {
                log::error!("gw down: unknown timer {id}");
                false
            }
            Event::Message(Message { body, .. }) => match body {
                MessageBody::Frame(bytes) => match DvbFrame::from_bytes(&bytes).map(|f| f.msg_type())
                {
                    Ok(MsgType::LogonReq) => self.on_logon_request(&bytes, ctx),
                    Ok(MsgType::Logoff) => self.on_logoff(&bytes),
                    Ok(MsgType::Sac) => self.on_sac(&bytes),
                    Ok(MsgType::Sync) => {
                        self.probes.incr("gw.sync_bursts");
                        true
                    }
                    Ok(other) => {
                        log::debug!("gw down: unexpected shared frame {other:?}, dropped");
                        true
                    }
                    Err(_) => {
                        self.probes.incr("gw.malformed_frames");
                        false
                    }
                },
                MessageBody::Burst(burst) => self.on_encap_burst(burst, ctx.now()),
                _ => true,
            },
        }
    }
}

/*
 * Upward channel
 */

pub struct GwUpward {
    reception: PhysicStd,
    probes: Probes,
}

impl GwUpward {
    pub fn new(cfg: &Config, probes: Probes) -> Self {
        // a transparent satellite relays the terminals' DVB-RCS bursts;
        // a regenerative one re-encodes the traffic into BBFrames
        let reception = match cfg.satellite_type {
            SatelliteType::Transparent => PhysicStd::Rcs(RcsStd::new()),
            SatelliteType::Regenerative => {
                PhysicStd::S2(S2Std::new(cfg.fwd_modcod_defs.highest_id()))
            }
        };
        Self { reception, probes }
    }

    pub fn received_modcod(&self) -> crate::ModcodId {
        self.reception.received_modcod()
    }

    fn on_frame(&mut self, bytes: Vec<u8>, ctx: &mut ChannelCtx) -> bool {
        let Ok(hdr) = DvbFrame::from_bytes(&bytes) else {
            self.probes.incr("gw.malformed_frames");
            return false;
        };
        match hdr.msg_type() {
            MsgType::DvbBurst | MsgType::BbFrame | MsgType::Corrupted => {
                match self.reception.on_receive_frame(&bytes, None) {
                    Ok(burst) => {
                        self.probes.add("gw.l2_from_st_bytes", bytes.len() as u64);
                        if !burst.is_empty() {
                            ctx.send_upper(Message {
                                kind: MsgKind::EncapBurst,
                                body: MessageBody::Burst(burst),
                            });
                        }
                        true
                    }
                    Err(err) => {
                        log::warn!("gw up: reception failed: {err}");
                        self.probes.incr("gw.reception_errors");
                        false
                    }
                }
            }
            // terminal control plane, owned by the downward channel
            MsgType::Sac | MsgType::LogonReq | MsgType::Logoff | MsgType::Sync => {
                ctx.share(Message {
                    kind: MsgKind::Sig,
                    body: MessageBody::Frame(bytes),
                });
                true
            }
            MsgType::SalohaData | MsgType::SalohaCtrl => {
                self.probes.incr("gw.saloha_frames");
                true
            }
            // echoes of our own signalling on the shared ctrl carrier
            MsgType::Sof | MsgType::Ttp | MsgType::LogonResp | MsgType::Cni => true,
        }
    }
}

impl Channel for GwUpward {
    fn on_event(&mut self, event: Event, ctx: &mut ChannelCtx) -> bool {
        match event {
            Event::Message(Message {
                body: MessageBody::Frame(bytes),
                ..
            }) => self.on_frame(bytes, ctx),
            Event::Message(_) => true,
            Event::Timer(id) => {
                log::error!("gw up: unexpected timer {id}");
                false
            }
        }
    }
}
