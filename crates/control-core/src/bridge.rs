//! The in-call media bridge and the TCH service loop.
//!
//! One thread per active TCH pumps uplink vocoder frames to the SIP/RTP
//! side and downlink frames back, flushing backlog to cap latency, while
//! interleaving the signalling checks (FACCH frames, SIP events, timers).
//! The loop also owns the in-call exits: radio failure, operator
//! pre-emption, and the outbound-handover branch.

use crate::cause::{L3Cause, RrCause, TermCause};
use crate::channel::L3Channel;
use crate::l3::Primitive;
use crate::services::Services;
use crate::tran::{CallState, Transaction};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One vocoder frame is 20 ms; the idle poll must not exceed it.
const FRAME_POLL: Duration = Duration::from_millis(20);

/// Roughly one minute of 20 ms frames.
const FRAMES_PER_MINUTE: u64 = 60 * 50;

/// Transfer vocoder data both ways for one pass. Returns the number of
/// payload bytes moved.
pub fn update_call_traffic(svc: &Services, tran: &Arc<Transaction>, chan: &Arc<L3Channel>) -> usize {
    // Neither side is committed until both acked.
    if tran.gsm_state() != CallState::Active {
        return 0;
    }
    let Some(dialog) = tran.dialog() else {
        return 0;
    };
    let mut moved = 0;

    // Uplink: flush the backlog beyond the latency cap, then forward.
    let max_queue = svc.config.max_speech_latency();
    let mut flushed = 0;
    while chan.l2().audio_queue_len() > max_queue {
        if chan.l2().recv_audio().is_none() {
            break;
        }
        flushed += 1;
    }
    if flushed > 0 {
        debug!(flushed, "uplink frames flushed to cap latency");
    }
    if let Some(frame) = chan.l2().recv_audio() {
        moved += frame.size_bytes();
        dialog.tx_audio(frame, flushed);
    }

    // Downlink: one frame from RTP to the vocoder.
    if let Some(frame) = dialog.rx_audio() {
        moved += frame.size_bytes().max(1);
        chan.l2().send_audio(frame);
    }
    moved
}

/// Serve a TCH until the channel is released.
pub fn traffic_loop(svc: &Services, chan: &Arc<L3Channel>) {
    let mut frame_count: u64 = 0;
    let mut alternate: u64 = 0;
    let mut idle_delay = Duration::ZERO;

    while chan.running() {
        if chan.radio_failure() {
            info!(chan = %chan.descriptive(), "radio link failure, dropping call");
            // L2 already waited out its timer; drop hard.
            chan.chan_release(
                svc,
                Primitive::HardReleaseRequest,
                TermCause::local(L3Cause::RadioInterfaceFailure),
            );
            return;
        }

        // The voice transaction appears once the assignment lands; the
        // channel can outlive it while an SMS finishes.
        let tran = chan.voice_tran();
        if let Some(tran) = &tran {
            if tran.is_dead() {
                if let Some(mmc) = chan.get_context(false) {
                    if mmc.is_empty() {
                        chan.chan_close(
                            svc,
                            RrCause::NormalEvent,
                            Primitive::ReleaseRequest,
                            TermCause::local(L3Cause::NoTransactionExpected),
                        );
                        return;
                    }
                }
            } else {
                if let Some(cause) = tran.termination_requested() {
                    // Operator/CLI or admission control freeing the
                    // channel for an emergency call, 04.08 3.4.13.4.1.
                    tran.terminate_hook(svc);
                    chan.chan_close(
                        svc,
                        RrCause::PreemptiveRelease,
                        Primitive::ReleaseRequest,
                        TermCause::local(cause),
                    );
                    return;
                }
                if tran.gsm_state() == CallState::HandoverOutbound {
                    if crate::handover::outbound_handover_transfer(svc, tran, chan) {
                        chan.chan_release(
                            svc,
                            Primitive::HardReleaseRequest,
                            TermCause::local(L3Cause::HandoverOutbound),
                        );
                        return;
                    }
                    continue;
                }
            }
        }

        // Alternate between signalling work and vocoder work so neither
        // starves: the SMS SAPI and the RTP pump share this thread.
        alternate += 1;
        if alternate % 2 == 1 && crate::dispatch::service_pass(svc, chan, idle_delay) {
            svc.radio.reset_watchdog();
            idle_delay = Duration::ZERO;
            continue;
        }
        idle_delay = Duration::ZERO;

        if let Some(tran) = &tran {
            if update_call_traffic(svc, tran, chan) > 0 {
                frame_count += 1;
                if frame_count % FRAMES_PER_MINUTE == 0 {
                    svc.radio.reset_watchdog();
                    svc.counters.call_minutes.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }
        }

        // Nothing moved: back off one frame time so we do not spin.
        idle_delay = FRAME_POLL;
    }
}
