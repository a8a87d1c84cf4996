//! Channel service loops and uplink frame triage.
//!
//! One thread serves each active dedicated channel. Every pass it looks
//! for, in order: an operator termination request, an uplink frame, dialog
//! events, expired timers, and new work (queued service requests, queued MT
//! transactions, or the empty-channel release). Certain L3 messages are
//! peeled off before per-transaction dispatch because they concern the
//! channel or the MM layer as a whole, not any one transaction.

use crate::cause::{L3Cause, RrCause, TermCause};
use crate::channel::L3Channel;
use crate::l3::{L3Frame, L3Message, Primitive, Sapi};
use crate::mm::MmContext;
use crate::procedures;
use crate::services::Services;
use crate::tran::DispatchOutcome;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// SDCCH poll cadence: an uplink frame returns instantly, so this is the
/// effective latency for SIP events and timers.
const SDCCH_POLL: Duration = Duration::from_millis(100);

/// Messages the channel loop handles before per-transaction dispatch.
/// True when the message was consumed here.
pub fn handle_common_messages(svc: &Services, mmc: &Arc<MmContext>, msg: &L3Message) -> bool {
    match msg {
        L3Message::PagingResponse { mobile_id } => {
            if !svc.mm.page_received(svc, mmc, mobile_id) {
                // Nobody is paging this MS: the SIP side gave up while we
                // were waiting. Nothing more we can do; drop the channel.
                warn!(%mobile_id, "paging response with no MM record");
                let chan = mmc.channel();
                chan.chan_close(
                    svc,
                    RrCause::CallAlreadyCleared,
                    Primitive::ReleaseRequest,
                    TermCause::local(L3Cause::NoPagingResponse),
                );
            }
            true
        }
        L3Message::ApplicationInformation { data } => {
            // RRLP answer; the positioning server is outside this layer.
            debug!(len = data.len(), "ApplicationInformation ignored");
            true
        }
        L3Message::RrStatus { cause } => {
            // 04.08 requires tolerance; log and move on.
            info!(cause, "RR Status from MS");
            true
        }
        L3Message::LocationUpdatingRequest { .. } => {
            procedures::lur::start_lur(svc, mmc, msg);
            true
        }
        L3Message::ImsiDetachIndication { mobile_id } => {
            info!(%mobile_id, "IMSI detach");
            imsi_detach(svc, mmc, mobile_id);
            true
        }
        L3Message::CmServiceRequest { .. } => {
            // Queued for the next new-activity pass so a running MM
            // procedure finishes first.
            mmc.push_service_request(msg.clone());
            true
        }
        _ => false,
    }
}

/// Mark the subscriber detached and drop the channel. Many handsets never
/// wait for the release to complete, so the channel is torn down at once.
fn imsi_detach(svc: &Services, mmc: &Arc<MmContext>, mobile_id: &crate::identity::MobileIdentity) {
    if let crate::identity::MobileIdentity::Imsi(imsi) = mobile_id {
        svc.tmsi.touch(imsi);
    }
    let chan = mmc.channel();
    chan.l3send_msg(
        L3Message::ChannelRelease {
            cause: RrCause::NormalEvent,
        },
        Sapi::Sapi0,
    );
    chan.chan_release(
        svc,
        Primitive::ReleaseRequest,
        TermCause::local(L3Cause::ImsiDetached),
    );
}

/// Apply the outcome of starting a machine outside the service loop: a
/// procedure may ask for the channel to be dropped on its very first
/// transition (congestion, dead dialog).
pub(crate) fn finish_start(svc: &Services, mmc: &Arc<MmContext>, outcome: DispatchOutcome) {
    if let DispatchOutcome::CloseChannel(cause) = outcome {
        mmc.channel()
            .chan_release(svc, Primitive::ReleaseRequest, cause);
    }
}

/// Dispatch a dequeued CMServiceRequest: fan out to the per-service start.
pub fn cm_service_responder(svc: &Services, mmc: &Arc<MmContext>, msg: &L3Message) {
    use crate::l3::CmServiceType::*;
    let L3Message::CmServiceRequest { service, .. } = msg else {
        warn!(%msg, "not a CM service request");
        return;
    };
    info!(service = ?service, "CM service request");
    match service {
        MobileOriginatedCall | EmergencyCall => procedures::cc::start_moc(svc, mmc, msg),
        ShortMessage => procedures::sms::start_mosms(svc, mmc, msg),
        SupplementaryService => procedures::ss::start_mossd(svc, mmc, msg),
    }
}

/// Triage a naked primitive. True when the frame should continue on to the
/// state machines.
fn check_primitive(svc: &Services, chan: &Arc<L3Channel>, frame: &L3Frame) -> bool {
    match frame.primitive {
        // SABM establishment; the MT-SMS machine waits for these.
        Primitive::EstablishIndication | Primitive::EstablishConfirm => true,
        Primitive::Data | Primitive::UnitData => true,
        Primitive::HandoverAccess => {
            warn!(chan = %chan.descriptive(), "HANDOVER_ACCESS on established channel");
            false
        }
        Primitive::MdlErrorIndication => {
            // LAPDm aborted.
            warn!(chan = %chan.descriptive(), sapi = ?frame.sapi, "L2 error indication");
            chan.chan_release(
                svc,
                Primitive::ReleaseRequest,
                TermCause::local(L3Cause::Layer2Error),
            );
            false
        }
        Primitive::ReleaseIndication => {
            // Normal release from the MS side; SAPI 0 takes the channel
            // down, a SAPI 3 release concerns only the SMS link.
            if frame.sapi == Sapi::Sapi0 {
                chan.chan_release(
                    svc,
                    Primitive::ReleaseRequest,
                    TermCause::local(L3Cause::NormalCallClearing),
                );
                false
            } else {
                true
            }
        }
        other => {
            warn!(chan = %chan.descriptive(), ?other, "unhandled primitive");
            chan.chan_release(
                svc,
                Primitive::ReleaseRequest,
                TermCause::local(L3Cause::L3InternalError),
            );
            false
        }
    }
}

/// Handle one uplink frame on a channel.
pub fn handle_frame(svc: &Services, chan: &Arc<L3Channel>, frame: &L3Frame) {
    if !check_primitive(svc, chan, frame) {
        return;
    }
    let Some(mmc) = chan.get_context(true) else {
        return;
    };
    if let Some(msg) = frame.message() {
        debug!(chan = %chan.descriptive(), %msg, "uplink");
        if handle_common_messages(svc, &mmc, msg) {
            return;
        }
    }
    match mmc.dispatch_frame(svc, frame) {
        DispatchOutcome::CloseChannel(cause) => {
            chan.chan_release(svc, Primitive::ReleaseRequest, cause);
        }
        DispatchOutcome::Handled | DispatchOutcome::NotHandled => {}
    }
}

/// One service pass: termination requests, uplink, SIP events, timers, new
/// activity. True if anything happened (the caller loops back immediately).
pub fn service_pass(svc: &Services, chan: &Arc<L3Channel>, delay: Duration) -> bool {
    let Some(mmc) = chan.get_context(true) else {
        return false;
    };

    if mmc.termination_requested.swap(false, Ordering::AcqRel) {
        chan.chan_close(
            svc,
            RrCause::PreemptiveRelease,
            Primitive::ReleaseRequest,
            TermCause::local(L3Cause::OperatorIntervention),
        );
        return true;
    }

    if let Some(frame) = chan.recv(delay) {
        handle_frame(svc, chan, &frame);
        return true;
    }

    let (happened, close) = mmc.check_sip_msgs(svc);
    if let Some(cause) = close {
        chan.chan_release(svc, Primitive::ReleaseRequest, cause);
        return true;
    }
    if happened {
        return true;
    }

    let (happened, close) = mmc.check_timers(svc);
    if let Some(cause) = close {
        chan.chan_release(svc, Primitive::ReleaseRequest, cause);
        return true;
    }
    if happened {
        return true;
    }

    let (happened, close) = mmc.check_new_activity(svc);
    if let Some(cause) = close {
        chan.chan_close(svc, RrCause::NormalEvent, Primitive::ReleaseRequest, cause);
        return true;
    }
    happened
}

/// Service an SDCCH until it is released.
pub fn sdcch_loop(svc: &Services, chan: &Arc<L3Channel>) {
    while chan.running() {
        if chan.radio_failure() {
            // T3109 expired in L2. The MS may still hear us, so a normal
            // release lets LAPDm wind down.
            info!(chan = %chan.descriptive(), "radio link failure, dropping channel");
            chan.chan_release(
                svc,
                Primitive::ReleaseRequest,
                TermCause::local(L3Cause::RadioInterfaceFailure),
            );
            return;
        }
        if service_pass(svc, chan, SDCCH_POLL) {
            svc.radio.reset_watchdog();
        }
    }
}

/// Entry point for a newly-established dedicated channel; returns when the
/// channel is released. The first frame decides between a normal
/// establishment and an inbound handover access.
pub fn dcch_loop(svc: &Services, chan: &Arc<L3Channel>, first: L3Frame) {
    info!(chan = %chan.descriptive(), "DCCH loop open");
    // A reassignment target already carries a context; do not reset state
    // blindly.
    chan.set_state(crate::channel::ChannelState::Established);
    match first.primitive {
        Primitive::EstablishIndication => {}
        Primitive::HandoverAccess => {
            crate::handover::process_handover_access(svc, chan);
            if !chan.running() {
                info!(chan = %chan.descriptive(), "handover access failed, channel closed");
                return;
            }
        }
        other => {
            warn!(chan = %chan.descriptive(), ?other, "unexpected first primitive");
        }
    }
    if chan.is_tchf() {
        crate::bridge::traffic_loop(svc, chan);
    } else {
        sdcch_loop(svc, chan);
    }
    // The loop may have exited because another thread flagged a release
    // (channel reassignment does this); finish the teardown here so the
    // context's use count and the L2 link are settled.
    if chan.get_context(false).is_some() {
        let prim = match chan.state() {
            crate::channel::ChannelState::RequestHardRelease => Primitive::HardReleaseRequest,
            _ => Primitive::ReleaseRequest,
        };
        chan.chan_release(
            svc,
            prim,
            TermCause::local(L3Cause::NoTransactionExpected),
        );
    }
    info!(chan = %chan.descriptive(), "DCCH loop closed");
}
