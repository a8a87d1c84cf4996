//! The L3 view of a dedicated radio channel.
//!
//! The physical layer and LAPDm live below the [`L2Channel`] trait: frames
//! come up through a per-channel queue and downlink sends may block for the
//! data link's retry window (seconds on FACCH, tens of seconds on SAPI
//! release). [`L3Channel`] adds the control-layer channel state, the
//! attached [`MmContext`], and the channel-reassignment choreography that
//! moves a live context from an SDCCH to a newly-allocated TCH.

use crate::cause::{RrCause, TermCause};
use crate::l3::{AudioFrame, ChannelType, L3Frame, L3Message, Primitive, Sapi};
use crate::mm::MmContext;
use crate::services::Services;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Physical measurements captured from the first handover access burst.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandoverAccessRecord {
    pub rssi: f32,
    /// Timing error in symbol periods; becomes the timing advance.
    pub timing_error: f32,
}

/// The radio/data-link side of a dedicated channel, owned by the layers
/// below. Sends may block; receives block up to the given timeout.
pub trait L2Channel: Send + Sync {
    fn recv(&self, timeout: Duration) -> Option<L3Frame>;

    /// Send a frame downlink. Blocks while LAPDm retransmits.
    fn send(&self, frame: L3Frame);

    fn chan_type(&self) -> ChannelType;

    /// Has the L2 uplink activity counter expired?
    fn radio_failure(&self) -> bool;

    /// Queued uplink vocoder frames (TCH only).
    fn audio_queue_len(&self) -> usize {
        0
    }

    fn recv_audio(&self) -> Option<AudioFrame> {
        None
    }

    fn send_audio(&self, _frame: AudioFrame) {}

    /// Copy power/timing-advance state from another channel at
    /// reassignment time.
    fn set_phy_from(&self, _other: &dyn L2Channel) {}

    fn init_phy(&self, _rssi: f32, _timing_error: f32) {}

    /// Fetch-and-clear the handover access measurements; also tells L1 to
    /// stop capturing access bursts.
    fn handover_record(&self) -> HandoverAccessRecord {
        HandoverAccessRecord::default()
    }

    /// A short description for the log ("SDCCH/8-3" and the like).
    fn descriptive(&self) -> String;
}

/// RR state of the channel as known to L3. Release is requested by setting
/// a state so the owning service thread performs it; other threads never
/// send on a channel they do not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not assigned to any MS.
    Idle,
    /// Assigned and established.
    Established,
    /// The controlling thread must RELEASE.
    RequestRelease,
    /// The controlling thread must HARDRELEASE.
    RequestHardRelease,
    /// Target of an in-flight reassignment, until established.
    ReassignTarget,
}

/// A dedicated channel as the control layer works with it.
pub struct L3Channel {
    l2: Arc<dyn L2Channel>,
    state: Mutex<ChannelState>,
    context: Mutex<Option<Arc<MmContext>>>,
    next_chan: Mutex<Option<Arc<L3Channel>>>,
}

impl L3Channel {
    pub fn new(l2: Arc<dyn L2Channel>) -> Arc<L3Channel> {
        Arc::new(L3Channel {
            l2,
            state: Mutex::new(ChannelState::Idle),
            context: Mutex::new(None),
            next_chan: Mutex::new(None),
        })
    }

    /// A channel over a null L2, for unit tests that only need identity.
    #[doc(hidden)]
    pub fn for_test() -> Arc<L3Channel> {
        L3Channel::new(Arc::new(NullL2))
    }

    pub fn l2(&self) -> &Arc<dyn L2Channel> {
        &self.l2
    }

    pub fn chan_type(&self) -> ChannelType {
        self.l2.chan_type()
    }

    pub fn is_sdcch(&self) -> bool {
        self.chan_type() == ChannelType::Sdcch
    }

    pub fn is_tchf(&self) -> bool {
        self.chan_type() == ChannelType::TchF
    }

    pub fn descriptive(&self) -> String {
        self.l2.descriptive()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ChannelState) {
        debug!(chan = %self.descriptive(), ?state, "channel state");
        *self.state.lock() = state;
    }

    /// Is the channel still in service? The loops exit when not.
    pub fn running(&self) -> bool {
        matches!(
            self.state(),
            ChannelState::Established | ChannelState::ReassignTarget
        )
    }

    pub fn is_released(&self) -> bool {
        matches!(
            self.state(),
            ChannelState::RequestRelease | ChannelState::RequestHardRelease
        )
    }

    pub fn radio_failure(&self) -> bool {
        self.l2.radio_failure()
    }

    /// The attached context, creating one if requested.
    pub fn get_context(self: &Arc<Self>, create: bool) -> Option<Arc<MmContext>> {
        let mut guard = self.context.lock();
        if guard.is_none() && create {
            *guard = Some(MmContext::new(self));
        }
        guard.clone()
    }

    pub(crate) fn set_context(&self, mmc: Option<Arc<MmContext>>) {
        *self.context.lock() = mmc;
    }

    /// The voice transaction on this channel, if any.
    pub fn voice_tran(self: &Arc<Self>) -> Option<Arc<crate::tran::Transaction>> {
        self.get_context(false)?.voice_tran()
    }

    pub fn recv(&self, timeout: Duration) -> Option<L3Frame> {
        self.l2.recv(timeout)
    }

    pub fn l3send_msg(&self, msg: L3Message, sapi: Sapi) {
        debug!(chan = %self.descriptive(), %msg, ?sapi, "downlink");
        self.l2.send(L3Frame::data_on(msg, sapi));
    }

    pub fn l3send_prim(&self, prim: Primitive, sapi: Sapi) {
        debug!(chan = %self.descriptive(), ?prim, ?sapi, "downlink primitive");
        self.l2.send(L3Frame::primitive(prim, sapi));
    }

    pub fn l3send_frame(&self, frame: L3Frame) {
        debug!(chan = %self.descriptive(), %frame, "downlink frame");
        self.l2.send(frame);
    }

    // --- release --------------------------------------------------------

    /// Send an RR ChannelRelease downlink (link still alive), then release.
    pub fn chan_close(
        self: &Arc<Self>,
        svc: &Services,
        rrcause: RrCause,
        prim: Primitive,
        cause: TermCause,
    ) {
        info!(chan = %self.descriptive(), ?rrcause, %cause, "channel close");
        self.l3send_msg(L3Message::ChannelRelease { cause: rrcause }, Sapi::Sapi0);
        self.chan_release(svc, prim, cause);
    }

    /// Release the channel without a downlink message: tears down every
    /// transaction on the context and returns the channel to the radio
    /// layer. Use RELEASE where possible; HARDRELEASE only when the link
    /// is already gone.
    pub fn chan_release(self: &Arc<Self>, svc: &Services, prim: Primitive, cause: TermCause) {
        let state = match prim {
            Primitive::HardReleaseRequest => ChannelState::RequestHardRelease,
            _ => ChannelState::RequestRelease,
        };
        self.set_state(state);
        // A reassignment target that never completed dies with us.
        if let Some(next) = self.next_chan.lock().take() {
            next.reassign_failure(svc);
        }
        let context = self.context.lock().take();
        if let Some(mmc) = context {
            svc.mm.free_context(svc, &mmc, cause);
        }
        self.l3send_prim(prim, Sapi::Sapi0);
    }

    // --- reassignment ---------------------------------------------------
    //
    // The old channel drives: allocate the TCH, mirror the physical
    // parameters, share the context (use count 2), send the
    // AssignmentCommand, and wait for the MS to establish on the new
    // channel. Completion rewires the context to the new channel; the old
    // one is hard-released after a settle delay so a straggling uplink
    // frame on the old channel does not race the switch.

    /// Allocate the TCH that a reassignment will move to. False on
    /// congestion.
    pub fn reassign_alloc_next_tch(self: &Arc<Self>, svc: &Services) -> bool {
        let Some(tch) = svc.radio.allocate_tch() else {
            info!(chan = %self.descriptive(), "no TCH available");
            return false;
        };
        tch.l2.set_phy_from(self.l2.as_ref());
        *self.next_chan.lock() = Some(tch);
        true
    }

    pub fn next_chan(&self) -> Option<Arc<L3Channel>> {
        self.next_chan.lock().clone()
    }

    /// Begin the move: the target channel adopts the context.
    pub fn reassign_start(self: &Arc<Self>) {
        let Some(next) = self.next_chan() else {
            error!(chan = %self.descriptive(), "reassign_start with no target channel");
            return;
        };
        if next.state() != ChannelState::Idle {
            warn!(next = %next.descriptive(), state = ?next.state(),
                "reassignment target not idle");
        }
        let Some(mmc) = self.get_context_plain() else {
            error!(chan = %self.descriptive(), "reassign_start with no context");
            return;
        };
        mmc.inc_use();
        next.set_context(Some(mmc));
        next.set_state(ChannelState::ReassignTarget);
        info!(from = %self.descriptive(), to = %next.descriptive(), "reassignment started");
    }

    fn get_context_plain(&self) -> Option<Arc<MmContext>> {
        self.context.lock().clone()
    }

    /// The AssignmentComplete arrived on the new channel: rewire the
    /// context and schedule this (old) channel's teardown.
    pub fn reassign_complete(self: &Arc<Self>) -> bool {
        let Some(next) = self.next_chan.lock().take() else {
            error!(chan = %self.descriptive(), "reassignment complete with no target");
            self.set_state(ChannelState::RequestRelease);
            return false;
        };
        let Some(mmc) = self.get_context_plain() else {
            error!(chan = %self.descriptive(), "reassignment complete on dead channel");
            self.set_state(ChannelState::RequestRelease);
            return false;
        };
        next.set_state(ChannelState::Established);
        mmc.set_channel(&next);
        info!(from = %self.descriptive(), to = %next.descriptive(),
            "successful channel reassignment");
        // Let the MS finish switching before the hard release: it may
        // still be emitting frames on the old channel.
        std::thread::sleep(REASSIGN_SETTLE);
        self.set_state(ChannelState::RequestHardRelease);
        true
    }

    /// The move failed: drop the target, keep this channel.
    pub fn reassign_failure(self: &Arc<Self>, svc: &Services) {
        if let Some(next) = self.next_chan.lock().take() {
            next.reassign_failure_target(svc);
        } else {
            // We ARE the target.
            self.reassign_failure_target(svc);
        }
    }

    fn reassign_failure_target(self: &Arc<Self>, svc: &Services) {
        info!(chan = %self.descriptive(), "reassignment target released");
        self.set_state(ChannelState::RequestRelease);
        let context = self.context.lock().take();
        if let Some(mmc) = context {
            // Use count drops back to 1; the surviving channel keeps the
            // context alive.
            svc.mm
                .free_context(svc, &mmc, TermCause::local(crate::cause::L3Cause::ChannelAssignmentFailure));
        }
    }
}

const REASSIGN_SETTLE: Duration = Duration::from_millis(400);

impl std::fmt::Debug for L3Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L3Channel")
            .field("desc", &self.descriptive())
            .field("state", &self.state())
            .finish()
    }
}

/// L2 that goes nowhere; unit-test scaffolding.
#[doc(hidden)]
pub struct NullL2;

impl L2Channel for NullL2 {
    fn recv(&self, _timeout: Duration) -> Option<L3Frame> {
        None
    }

    fn send(&self, _frame: L3Frame) {}

    fn chan_type(&self) -> ChannelType {
        ChannelType::Sdcch
    }

    fn radio_failure(&self) -> bool {
        false
    }

    fn descriptive(&self) -> String {
        "null".to_string()
    }
}
