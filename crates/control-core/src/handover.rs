//! The handover engine.
//!
//! Outbound (we are BS1): the measurement-driven selector picks a
//! neighbor, the peer returns an opaque L3 HandoverCommand which we relay
//! on the FACCH, and silence until T3103 expires means the handset left
//! successfully. Inbound (we are BS2): a peer request reserved a channel
//! and a half-open transaction; the access burst starts the
//! PhysicalInformation loop until LAPDm establishes.

use crate::cause::{L3Cause, RrCause, TermCause};
use crate::channel::L3Channel;
use crate::l3::{L3Frame, L3Message, L3Pd, MeasurementReport, Primitive, Sapi};
use crate::services::Services;
use crate::tran::{CallState, Transaction};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// MTI of the RR HandoverCommand we relay verbatim.
const HANDOVER_COMMAND_MTI: u8 = 0x2B;

/// State a BS2 handover request leaves on the transaction.
#[derive(Debug, Clone, Default)]
pub struct HandoverEntry {
    /// The peer BTS address, for reporting and failure messages.
    pub peer: String,
    /// The handover reference expected in the access bursts.
    pub reference: u32,
    /// The peer's transaction id, echoed back in peering messages.
    pub other_bs_tran_id: u64,
    /// REFER target that moves the SIP dialog.
    pub sip_refer: String,
    /// Hex-encoded L3 HandoverCommand bytes (BS1 side: what we send).
    pub hex_command: String,
}

/// A penalty applied to a neighbor after a failed or refused handover.
#[derive(Debug, Clone, Default)]
pub struct NeighborPenalty {
    pub arfcn: Option<u32>,
    pub bsic: u32,
    pub until: Option<Instant>,
}

impl NeighborPenalty {
    pub fn matches(&self, arfcn: u32, bsic: u32) -> bool {
        self.arfcn == Some(arfcn)
            && self.bsic == bsic
            && self.until.map(|t| Instant::now() < t).unwrap_or(false)
    }
}

/// The selector's verdict for one measurement batch.
#[derive(Debug, Clone)]
pub struct BestNeighbor {
    pub arfcn: u32,
    pub bsic: u32,
    /// Averaged downlink level of the neighbor, dBm.
    pub rxlev: i32,
    pub cause: &'static str,
}

/// What the peer answered to a handover request.
#[derive(Debug, Clone)]
pub struct HandoverOffer {
    pub hex_command: String,
    pub refer_target: String,
    pub reference: u32,
}

/// The BTS-to-BTS peering boundary (small UDP messages in production).
pub trait PeerInterface: Send + Sync {
    /// Ask `peer` to accept the call. Some(offer) when it reserved a
    /// channel and produced a HandoverCommand; None on refusal.
    fn send_handover_request(
        &self,
        peer: &str,
        tran: &Arc<Transaction>,
        cause: &str,
    ) -> Option<HandoverOffer>;

    /// Tell the peer an inbound handover failed on our side.
    fn send_handover_failure(&self, entry: &HandoverEntry, cause: RrCause, holdoff: Duration);

    /// Resolve a neighbor (ARFCN, BSIC) to its peering address.
    fn neighbor_address(&self, arfcn: u32, bsic: u32) -> Option<String>;

    /// Is this peer in a holdoff window after a recent failure?
    fn holding_off(&self, peer: &str) -> bool;
}

/// Exponentially-averaged signal history for one channel, fed by the SACCH
/// measurement reports.
#[derive(Debug, Default)]
pub struct ChannelHistory {
    serving_avg: Option<f32>,
    neighbors: Vec<(u32, u32, f32)>,
    reports: u32,
}

const AVERAGING_GAIN: f32 = 0.25;

impl ChannelHistory {
    pub fn new() -> ChannelHistory {
        ChannelHistory::default()
    }

    /// Fold one report in. Returns false until enough reports accumulate
    /// for the averages to mean anything.
    pub fn add_measurements(&mut self, report: &MeasurementReport) -> bool {
        let serving = self.serving_avg.get_or_insert(report.rxlev_dl as f32);
        *serving += AVERAGING_GAIN * (report.rxlev_dl as f32 - *serving);
        for (arfcn, bsic, rxlev) in &report.neighbors {
            match self
                .neighbors
                .iter_mut()
                .find(|(a, b, _)| a == arfcn && b == bsic)
            {
                Some((_, _, avg)) => *avg += AVERAGING_GAIN * (*rxlev as f32 - *avg),
                None => self.neighbors.push((*arfcn, *bsic, *rxlev as f32)),
            }
        }
        self.reports += 1;
        self.reports >= 4
    }

    pub fn serving_rxlev(&self) -> i32 {
        self.serving_avg.unwrap_or(-110.0) as i32
    }

    /// The strongest neighbor not under penalty.
    pub fn find_best(&self, penalty: &NeighborPenalty) -> Option<BestNeighbor> {
        self.neighbors
            .iter()
            .filter(|(a, b, _)| !penalty.matches(*a, *b))
            .max_by(|x, y| x.2.total_cmp(&y.2))
            .map(|(arfcn, bsic, rxlev)| BestNeighbor {
                arfcn: *arfcn,
                bsic: *bsic,
                rxlev: *rxlev as i32,
                cause: "better-cell",
            })
    }
}

/// Per measurement batch: decide whether to hand the serving call over,
/// and fire the peering request if so. Runs on the SACCH service thread.
pub fn handover_determination(
    svc: &Services,
    report: &MeasurementReport,
    history: &mut ChannelHistory,
    chan: &Arc<L3Channel>,
) {
    if !history.add_measurements(report) {
        return;
    }
    let Some(mmc) = chan.get_context(false) else {
        return;
    };
    let penalty = mmc.handover_penalty();
    let Some(best) = history.find_best(&penalty) else {
        return;
    };
    // The margin rule.
    if best.rxlev - history.serving_rxlev() < svc.config.handover_margin() {
        return;
    }
    let Some(peer) = svc.peering.neighbor_address(best.arfcn, best.bsic) else {
        info!(arfcn = best.arfcn, bsic = best.bsic, "measurement for unknown neighbor");
        return;
    };
    if svc.peering.holding_off(&peer) {
        debug!(peer, "skipping handover due to peer holdoff");
        return;
    }
    let Some(tran) = mmc.voice_tran() else {
        return;
    };
    if tran.gsm_state() != CallState::Active {
        debug!(state = ?tran.gsm_state(), "not handing over a non-active call");
        return;
    }
    // An emergency call with no IMSI cannot be described to the peer; the
    // handover WILL fail, so do not try.
    if tran.subscriber_imsi().is_empty() {
        warn!("cannot hand over a call with a non-IMSI subscriber");
        return;
    }
    // Anti-ping-pong: leave young transactions alone.
    if tran.state_age() < svc.config.handover_holdoff() {
        debug!("transaction too young for handover");
        return;
    }

    info!(peer, rxlev = best.rxlev, "requesting handover");
    match svc.peering.send_handover_request(&peer, &tran, best.cause) {
        Some(offer) => {
            tran.with_inner(|inner| {
                inner.handover = Some(HandoverEntry {
                    peer: peer.clone(),
                    reference: offer.reference,
                    other_bs_tran_id: 0,
                    sip_refer: offer.refer_target.clone(),
                    hex_command: offer.hex_command.clone(),
                });
                // The traffic loop notices this state and runs the
                // outbound transfer.
                inner.set_gsm_state(CallState::HandoverOutbound);
            });
        }
        None => {
            // Refused: penalize this neighbor for a while.
            mmc.set_handover_penalty(NeighborPenalty {
                arfcn: Some(best.arfcn),
                bsic: best.bsic,
                until: Some(Instant::now() + svc.config.handover_failure_holdoff()),
            });
        }
    }
}

/// BS1 leg: deliver the peer's HandoverCommand on the FACCH and wait out
/// T3103. Any uplink frame before it expires means the handset came back
/// and the call stays; silence means it left. True when the call cleared
/// and the channel should be released.
pub fn outbound_handover_transfer(
    svc: &Services,
    tran: &Arc<Transaction>,
    chan: &Arc<L3Channel>,
) -> bool {
    let Some(entry) = tran.handover_entry() else {
        warn!("outbound handover with no handover entry");
        tran.with_inner(|inner| inner.set_gsm_state(CallState::Active));
        return false;
    };
    info!(peer = entry.peer, "sending HandoverCommand");
    // The command is the peer's opaque octets; no TA is included, so the
    // MS uses the non-synchronized default.
    let payload = Bytes::from(entry.hex_command.clone().into_bytes());
    chan.l3send_frame(L3Frame::raw(L3Pd::Rr, HANDOVER_COMMAND_MTI, 0, payload));

    let guard = svc.config.t3103() + Duration::from_secs(1);
    let deadline = Instant::now() + guard;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Some(frame) = chan.recv(remaining) {
            // The handover failed; the handset is still ours.
            info!(%frame, "frame after HandoverCommand, handover failed");
            tran.with_inner(|inner| inner.set_gsm_state(CallState::Active));
            return false;
        }
    }

    // Silence: the MS is on the neighbor now (or gone, same difference).
    svc.counters
        .handovers_out
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    info!("timeout following outbound handover; clearing locally");
    tran.te_cancel(svc, TermCause::local(L3Cause::HandoverOutbound));
    true
}

/// BS2 leg: the first HANDOVER_ACCESS burst arrived on the reserved
/// channel. Check the timing advance, answer with PhysicalInformation
/// until LAPDm establishes, then run the normal in-call machinery.
pub fn process_handover_access(svc: &Services, chan: &Arc<L3Channel>) {
    let Some(tran) = chan.voice_tran() else {
        warn!(chan = %chan.descriptive(), "handover access with no inbound transaction");
        chan.chan_release(
            svc,
            Primitive::HardReleaseRequest,
            TermCause::local(L3Cause::HandoverError),
        );
        return;
    };
    let Some(entry) = tran.handover_entry() else {
        warn!(chan = %chan.descriptive(), "handover access with no inbound handover");
        chan.chan_release(
            svc,
            Primitive::HardReleaseRequest,
            TermCause::local(L3Cause::HandoverError),
        );
        return;
    };

    // Stop L1 from reporting further access bursts and read the phy
    // measurements of the first one.
    let record = chan.l2().handover_record();
    if record.timing_error > svc.config.ta_max() as f32 {
        info!(ta = record.timing_error, "handover failed, timing advance out of range");
        svc.peering.send_handover_failure(
            &entry,
            RrCause::HandoverImpossible,
            svc.config.handover_failure_holdoff(),
        );
        chan.chan_release(
            svc,
            Primitive::HardReleaseRequest,
            TermCause::local(L3Cause::Distance),
        );
        return;
    }
    chan.l2().init_phy(record.rssi, record.timing_error);
    let ta = (record.timing_error + 0.5).clamp(0.0, 62.0) as u8;

    // 04.08 11.1.3: repeat PhysicalInformation up to Ny1 times, T3105
    // apart, until something other than more access bursts arrives.
    let t3105 = svc.config.t3105();
    for _ in 0..svc.config.handover_ny1() {
        // UNIT_DATA: the channel is not established yet.
        chan.l3send_frame(L3Frame {
            primitive: Primitive::UnitData,
            sapi: Sapi::Sapi0,
            body: crate::l3::FrameBody::Message(L3Message::PhysicalInformation {
                timing_advance: ta,
            }),
        });
        let deadline = Instant::now() + t3105;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some(frame) = chan.recv(remaining) else {
                break;
            };
            match frame.primitive {
                // Stragglers from before L1 stopped capturing; flush.
                Primitive::HandoverAccess => continue,
                Primitive::EstablishIndication => {
                    // The handset is here. Hand off to the state machine.
                    info!(chan = %chan.descriptive(), "inbound handover established");
                    tran.lock_and_start(
                        svc,
                        crate::procedures::cc::inbound_handover_machine(),
                        None,
                    );
                    return;
                }
                other => {
                    warn!(?other, "unexpected primitive waiting for handover establish");
                    svc.peering.send_handover_failure(
                        &entry,
                        RrCause::MessageTypeNotCompatibleWithProtocolState,
                        svc.config.handover_failure_holdoff(),
                    );
                    chan.chan_release(
                        svc,
                        Primitive::HardReleaseRequest,
                        TermCause::local(L3Cause::HandoverError),
                    );
                    return;
                }
            }
        }
    }

    info!(chan = %chan.descriptive(), "timed out waiting for handover establish");
    svc.peering.send_handover_failure(
        &entry,
        RrCause::NoActivityOnTheRadio,
        svc.config.handover_failure_holdoff(),
    );
    chan.chan_release(
        svc,
        Primitive::HardReleaseRequest,
        TermCause::local(L3Cause::RadioInterfaceFailure),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_matching_and_expiry() {
        let mut p = NeighborPenalty::default();
        assert!(!p.matches(5, 1));
        p = NeighborPenalty {
            arfcn: Some(5),
            bsic: 1,
            until: Some(Instant::now() + Duration::from_secs(60)),
        };
        assert!(p.matches(5, 1));
        assert!(!p.matches(5, 2));
        p.until = Some(Instant::now() - Duration::from_secs(1));
        assert!(!p.matches(5, 1));
    }

    #[test]
    fn history_picks_strongest_unpenalized() {
        let mut h = ChannelHistory::new();
        let report = MeasurementReport {
            rxlev_dl: -80,
            neighbors: vec![(10, 1, -70), (11, 2, -60)],
        };
        for _ in 0..4 {
            h.add_measurements(&report);
        }
        let best = h.find_best(&NeighborPenalty::default()).unwrap();
        assert_eq!((best.arfcn, best.bsic), (11, 2));
        let penalty = NeighborPenalty {
            arfcn: Some(11),
            bsic: 2,
            until: Some(Instant::now() + Duration::from_secs(60)),
        };
        let second = h.find_best(&penalty).unwrap();
        assert_eq!((second.arfcn, second.bsic), (10, 1));
    }
}
