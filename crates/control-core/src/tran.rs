//! Transactions: one L3 procedure instance per entry.
//!
//! A transaction owns a stack of procedures, a timer set, the L3 transaction
//! identifier, the optional SIP dialog handle, and the subscriber identity.
//! It lives in an MMContext slot (or, for mobile-terminated work, in an
//! MMUser queue while paging) and is destroyed when the last holder lets
//! go. The per-transaction lock serializes `run` invocations; it is never
//! the global MM lock, which must stay free while a procedure blocks in the
//! data link.

use crate::cause::{L3Cause, RrCause, TermCause};
use crate::cdr::CdrRecord;
use crate::channel::L3Channel;
use crate::codec::CodecSet;
use crate::identity::FullMobileId;
use crate::l3::{DispatchKey, L3Frame, L3Message};
use crate::mm::{MmContext, TranSlot};
use crate::procedures::lur::MmSharedData;
use crate::handover::HandoverEntry;
use crate::services::Services;
use crate::sip::{DialogEvent, DialogState, SipDialog};
use crate::sm::{MachineStatus, ProcCtx, ProcInput, Procedure, StackOp};
use crate::timers::{TimerAction, TimerSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Monotonic private transaction id. Zero is reserved for "undefined".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TranId(pub u64);

static NEXT_TRAN_ID: AtomicU64 = AtomicU64::new(1);

/// What kind of procedure this transaction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    MobileOriginatedCall,
    EmergencyCall,
    MobileTerminatedCall,
    MoSms,
    MtSms,
    LocationUpdating,
    SupplementaryService,
    MtSupplementaryService,
    HandoverInbound,
    HandoverOutbound,
    TestCall,
}

impl ServiceType {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceType::MobileOriginatedCall => "MOC",
            ServiceType::EmergencyCall => "Emergency",
            ServiceType::MobileTerminatedCall => "MTC",
            ServiceType::MoSms => "MOSMS",
            ServiceType::MtSms => "MTSMS",
            ServiceType::LocationUpdating => "LUR",
            ServiceType::SupplementaryService => "SS",
            ServiceType::MtSupplementaryService => "MTSS",
            ServiceType::HandoverInbound => "HandoverIn",
            ServiceType::HandoverOutbound => "HandoverOut",
            ServiceType::TestCall => "TestCall",
        }
    }

    pub fn is_voice(&self) -> bool {
        matches!(
            self,
            ServiceType::MobileOriginatedCall
                | ServiceType::EmergencyCall
                | ServiceType::MobileTerminatedCall
                | ServiceType::HandoverInbound
        )
    }
}

/// Call states per GSM 04.08 5 / ITU-T Q.931. The numeric values of the
/// first group match the 10.5.4.6 Call State IE so they can go on the wire
/// directly; the second group is local bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CallState {
    Null = 0,
    MocInitiated = 1,
    Paging = 2,
    MocProceeding = 3,
    MocDelivered = 4,
    CallPresent = 6,
    CallReceived = 7,
    MtcConfirmed = 9,
    Active = 10,
    DisconnectIndication = 12,
    ReleaseRequest = 19,
    ConnectIndication = 28,

    SmsDelivering = 101,
    SmsSubmitting = 102,
    HandoverInbound = 103,
    HandoverProgress = 104,
    HandoverOutbound = 105,
    TranDeleted = 106,
}

impl CallState {
    /// Is a call being cleared (or already cleared)?
    pub fn is_clearing(&self) -> bool {
        matches!(
            self,
            CallState::DisconnectIndication | CallState::ReleaseRequest | CallState::TranDeleted
        )
    }

    pub fn is_in_call(&self) -> bool {
        matches!(self, CallState::Active | CallState::ConnectIndication)
    }
}

pub(crate) struct MachineFrame {
    pub proc: Option<Box<dyn Procedure>>,
    /// Where this procedure resumes when the one it pushed pops.
    pub pop_state: DispatchKey,
}

/// The lock-protected state of a transaction.
pub struct TranInner {
    pub subscriber: FullMobileId,
    pub gsm_state: CallState,
    pub state_changed: Instant,
    /// L3 TI with the direction bit as stored (MO TIs carry bit 3 set).
    pub l3_ti: Option<u8>,
    pub called: Option<String>,
    pub calling: Option<String>,
    pub codecs: CodecSet,
    pub timers: TimerSet,
    pub(crate) machines: Vec<MachineFrame>,
    pub dialog: Option<Arc<dyn SipDialog>>,
    /// Last dialog state folded into the event stream.
    pub last_dialog_state: Option<DialogState>,
    /// Dialog events are not delivered while a channel move is in flight.
    pub sip_suspended: bool,
    pub disposition: Option<TermCause>,
    pub connect_time: Option<SystemTime>,
    /// Scratch state for the mobility-management procedure family.
    pub mm_data: Option<MmSharedData>,
    /// Result slot for a pushed identification sub-procedure.
    pub identify_result: Option<bool>,
    pub handover: Option<HandoverEntry>,
    /// MT-SMS payload (or MO-SMS decoded body, for the CDR).
    pub message_body: String,
    pub content_type: String,
    pub rpdu_ref: u8,
    /// Set by the operator/admission control; polled by the traffic loop.
    pub termination_requested: Option<L3Cause>,
    pub rtp_port: Option<u16>,
}

impl TranInner {
    fn new(subscriber: FullMobileId) -> TranInner {
        TranInner {
            subscriber,
            gsm_state: CallState::Null,
            state_changed: Instant::now(),
            l3_ti: None,
            called: None,
            calling: None,
            codecs: CodecSet::empty(),
            timers: TimerSet::new(),
            machines: Vec::new(),
            dialog: None,
            last_dialog_state: None,
            sip_suspended: false,
            disposition: None,
            connect_time: None,
            mm_data: None,
            identify_result: None,
            handover: None,
            message_body: String::new(),
            content_type: String::new(),
            rpdu_ref: 0,
            termination_requested: None,
            rtp_port: None,
        }
    }

    pub fn set_gsm_state(&mut self, state: CallState) {
        if self.gsm_state != state {
            debug!(from = ?self.gsm_state, to = ?state, "call state");
            self.gsm_state = state;
            self.state_changed = Instant::now();
        }
    }

    /// Compare against a TI from the wire, ignoring the direction bit.
    pub fn match_l3_ti(&self, ti: u8) -> bool {
        match self.l3_ti {
            Some(mine) => mine & 0x7 == ti & 0x7,
            None => false,
        }
    }
}

/// Outcome of driving a transaction with one input.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The input was consumed (possibly ending the transaction).
    Handled,
    /// Nobody could take it.
    NotHandled,
    /// A procedure asked for the whole channel to be dropped; the caller
    /// (the channel service loop) performs the close.
    CloseChannel(TermCause),
}

enum RunOutcome {
    Ok,
    QuitTran(Option<CdrRecord>),
    QuitChannel(TermCause),
}

/// One L3 procedure instance.
pub struct Transaction {
    id: TranId,
    service: ServiceType,
    created: Instant,
    dead: AtomicBool,
    pub(crate) context: Mutex<Weak<MmContext>>,
    inner: Mutex<TranInner>,
}

impl Transaction {
    fn new(service: ServiceType, subscriber: FullMobileId) -> Arc<Transaction> {
        let id = TranId(NEXT_TRAN_ID.fetch_add(1, Ordering::Relaxed));
        debug!(id = id.0, service = service.name(), "transaction created");
        Arc::new(Transaction {
            id,
            service,
            created: Instant::now(),
            dead: AtomicBool::new(false),
            context: Mutex::new(Weak::new()),
            inner: Mutex::new(TranInner::new(subscriber)),
        })
    }

    // --- factories -----------------------------------------------------

    /// MO call (or emergency call), installed in the CS1 slot.
    pub fn new_moc(mmc: &Arc<MmContext>, service: ServiceType) -> Arc<Transaction> {
        let tran = Transaction::new(service, FullMobileId::default());
        mmc.connect_tran(TranSlot::Cs1, &tran);
        tran
    }

    /// MO SMS, installed in MOSMS1 or, if busy, MOSMS2.
    pub fn new_mosms(mmc: &Arc<MmContext>) -> Arc<Transaction> {
        let tran = Transaction::new(ServiceType::MoSms, FullMobileId::default());
        let slot = if mmc.get_tran(TranSlot::MoSms1).is_none() {
            TranSlot::MoSms1
        } else {
            TranSlot::MoSms2
        };
        mmc.connect_tran(slot, &tran);
        tran
    }

    /// MO mobility management (location update), MM slot.
    pub fn new_momm(mmc: &Arc<MmContext>) -> Arc<Transaction> {
        let tran = Transaction::new(ServiceType::LocationUpdating, FullMobileId::default());
        mmc.connect_tran(TranSlot::Mm, &tran);
        tran
    }

    /// MO supplementary-services session, SS slot.
    pub fn new_mossd(mmc: &Arc<MmContext>) -> Arc<Transaction> {
        let tran = Transaction::new(ServiceType::SupplementaryService, FullMobileId::default());
        mmc.connect_tran(TranSlot::Ss, &tran);
        tran
    }

    /// MT call. Not installed anywhere: the caller queues it on the MMUser
    /// until paging succeeds.
    pub fn new_mtc(
        subscriber: FullMobileId,
        dialog: Arc<dyn SipDialog>,
        calling: String,
    ) -> Arc<Transaction> {
        let tran = Transaction::new(ServiceType::MobileTerminatedCall, subscriber);
        {
            let mut inner = tran.inner.lock();
            inner.last_dialog_state = Some(dialog.state());
            inner.dialog = Some(dialog);
            inner.calling = Some(calling);
            inner.gsm_state = CallState::Paging;
        }
        tran
    }

    /// MT SMS. `dialog` is None for locally-originated messages (welcome
    /// SMS).
    pub fn new_mtsms(
        dialog: Option<Arc<dyn SipDialog>>,
        subscriber: FullMobileId,
        calling: String,
        body: String,
        content_type: String,
    ) -> Arc<Transaction> {
        let tran = Transaction::new(ServiceType::MtSms, subscriber);
        {
            let mut inner = tran.inner.lock();
            inner.last_dialog_state = dialog.as_ref().map(|d| d.state());
            inner.dialog = dialog;
            inner.calling = Some(calling);
            inner.message_body = body;
            inner.content_type = content_type;
        }
        tran
    }

    /// MT supplementary services.
    pub fn new_mtss(
        dialog: Arc<dyn SipDialog>,
        subscriber: FullMobileId,
        body: String,
    ) -> Arc<Transaction> {
        let tran = Transaction::new(ServiceType::MtSupplementaryService, subscriber);
        {
            let mut inner = tran.inner.lock();
            inner.last_dialog_state = Some(dialog.state());
            inner.dialog = Some(dialog);
            inner.message_body = body;
        }
        tran
    }

    /// Inbound handover: a half-open voice transaction created from a peer
    /// request, installed on the reserved channel's context by the caller.
    pub fn new_handover(subscriber: FullMobileId, entry: HandoverEntry) -> Arc<Transaction> {
        let tran = Transaction::new(ServiceType::HandoverInbound, subscriber);
        {
            let mut inner = tran.inner.lock();
            inner.handover = Some(entry);
            inner.gsm_state = CallState::HandoverInbound;
        }
        tran
    }

    // --- accessors ------------------------------------------------------

    pub fn id(&self) -> TranId {
        self.id
    }

    pub fn service(&self) -> ServiceType {
        self.service
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// Milliseconds since the last call-state change.
    pub fn state_age(&self) -> std::time::Duration {
        self.inner.lock().state_changed.elapsed()
    }

    pub fn gsm_state(&self) -> CallState {
        self.inner.lock().gsm_state
    }

    pub fn subscriber_imsi(&self) -> String {
        self.inner.lock().subscriber.imsi.clone()
    }

    pub fn subscriber(&self) -> FullMobileId {
        self.inner.lock().subscriber.clone()
    }

    pub fn dialog(&self) -> Option<Arc<dyn SipDialog>> {
        self.inner.lock().dialog.clone()
    }

    pub fn match_l3_ti(&self, ti: u8) -> bool {
        self.inner.lock().match_l3_ti(ti)
    }

    pub fn handover_entry(&self) -> Option<HandoverEntry> {
        self.inner.lock().handover.clone()
    }

    pub fn termination_requested(&self) -> Option<L3Cause> {
        self.inner.lock().termination_requested
    }

    pub fn request_termination(&self, cause: L3Cause) {
        self.inner.lock().termination_requested = Some(cause);
    }

    pub(crate) fn set_context(&self, mmc: Option<&Arc<MmContext>>) {
        *self.context.lock() = match mmc {
            Some(c) => Arc::downgrade(c),
            None => Weak::new(),
        };
    }

    pub fn mm_context(&self) -> Option<Arc<MmContext>> {
        self.context.lock().upgrade()
    }

    /// Lock the inner state for direct inspection (tests, CLI printing).
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut TranInner) -> R) -> R {
        f(&mut self.inner.lock())
    }

    // --- the trampoline -------------------------------------------------

    fn resolve(&self) -> Option<(Arc<MmContext>, Arc<L3Channel>)> {
        let mmc = self.context.lock().upgrade()?;
        let chan = mmc.channel();
        Some((mmc, chan))
    }

    /// Run the machine stack with one input. The inner lock is held by the
    /// caller and stays held throughout.
    fn run_machines(
        self: &Arc<Self>,
        svc: &Services,
        inner: &mut TranInner,
        mmc: &Arc<MmContext>,
        chan: &Arc<L3Channel>,
        key: DispatchKey,
        input: ProcInput<'_>,
    ) -> RunOutcome {
        let mut key = key;
        let mut first = true;
        loop {
            let depth = inner.machines.len();
            let Some(frame) = inner.machines.last_mut() else {
                debug!(tran = self.id.0, "input with no procedure on the stack");
                return RunOutcome::Ok;
            };
            let Some(mut proc) = frame.proc.take() else {
                warn!(tran = self.id.0, "procedure missing from stack frame");
                return RunOutcome::Ok;
            };

            let status = {
                let mut ctx = ProcCtx {
                    svc,
                    tran: self,
                    inner: &mut *inner,
                    mmc,
                    chan,
                    stack_op: None,
                };
                let input = if first { input } else { ProcInput::None };
                crate::sm::log_entry(proc.name(), key, &input);
                let status = proc.run(&mut ctx, key, input);
                let stack_op = ctx.stack_op.take();
                // Put the procedure back before applying stack operations.
                if let Some(frame) = ctx.inner.machines.get_mut(depth - 1) {
                    frame.proc = Some(proc);
                }
                (status, stack_op)
            };
            first = false;

            let (status, stack_op) = status;
            match status {
                MachineStatus::Ok => {
                    match stack_op {
                        Some(StackOp::Push {
                            proc,
                            resume_state,
                            start_state,
                        }) => {
                            if let Some(frame) = inner.machines.last_mut() {
                                frame.pop_state = resume_state;
                            }
                            inner.machines.push(MachineFrame {
                                proc: Some(proc),
                                pop_state: 0,
                            });
                            key = start_state;
                            continue;
                        }
                        Some(StackOp::Replace { proc, start_state }) => {
                            inner.machines.clear();
                            inner.machines.push(MachineFrame {
                                proc: Some(proc),
                                pop_state: 0,
                            });
                            key = start_state;
                            continue;
                        }
                        None => return RunOutcome::Ok,
                    }
                }
                MachineStatus::PopMachine => {
                    inner.machines.pop();
                    match inner.machines.last() {
                        Some(frame) => {
                            key = frame.pop_state;
                            continue;
                        }
                        None => return RunOutcome::Ok,
                    }
                }
                MachineStatus::QuitTran(cause) => {
                    let cdr = if !self.dead.swap(true, Ordering::AcqRel) {
                        Some(self.cancel_with_inner(&mut *inner, svc, cause))
                    } else {
                        None
                    };
                    return RunOutcome::QuitTran(cdr);
                }
                MachineStatus::QuitChannel(cause) => {
                    return RunOutcome::QuitChannel(cause);
                }
                MachineStatus::UnexpectedState => {
                    return RunOutcome::Ok;
                }
            }
        }
    }

    fn finish_run(self: &Arc<Self>, svc: &Services, outcome: RunOutcome) -> DispatchOutcome {
        match outcome {
            RunOutcome::Ok => DispatchOutcome::Handled,
            RunOutcome::QuitTran(cdr) => {
                if let Some(cdr) = cdr {
                    self.finish_cancel(svc, cdr);
                }
                DispatchOutcome::Handled
            }
            RunOutcome::QuitChannel(cause) => DispatchOutcome::CloseChannel(cause),
        }
    }

    /// Install a fresh procedure stack and feed it its starting input.
    pub fn lock_and_start(
        self: &Arc<Self>,
        svc: &Services,
        proc: Box<dyn Procedure>,
        msg: Option<&L3Message>,
    ) -> DispatchOutcome {
        let Some((mmc, chan)) = self.resolve() else {
            warn!(tran = self.id.0, "lock_and_start with no channel context");
            return DispatchOutcome::NotHandled;
        };
        let mut inner = self.inner.lock();
        inner.machines.clear();
        inner.machines.push(MachineFrame {
            proc: Some(proc),
            pop_state: 0,
        });
        let (key, input) = match msg {
            Some(m) => (m.dispatch_key(), ProcInput::Message(m)),
            None => (0, ProcInput::None),
        };
        let outcome = self.run_machines(svc, &mut inner, &mmc, &chan, key, input);
        drop(inner);
        self.finish_run(svc, outcome)
    }

    /// Drive the current procedure with an uplink frame.
    pub fn lock_and_invoke_frame(
        self: &Arc<Self>,
        svc: &Services,
        frame: &L3Frame,
    ) -> DispatchOutcome {
        if self.is_dead() {
            return DispatchOutcome::NotHandled;
        }
        let Some((mmc, chan)) = self.resolve() else {
            return DispatchOutcome::NotHandled;
        };
        let key = if frame.is_data() {
            match (frame.pd(), frame.mti()) {
                (Some(pd), Some(mti)) => crate::l3::l3_case(pd, mti),
                // Unparseable data frame: procedures that care see the raw
                // frame; the rest ignore it.
                _ => return DispatchOutcome::NotHandled,
            }
        } else {
            crate::l3::primitive_case(frame.primitive)
        };
        let mut inner = self.inner.lock();
        let outcome = self.run_machines(svc, &mut inner, &mmc, &chan, key, ProcInput::Frame(frame));
        drop(inner);
        self.finish_run(svc, outcome)
    }

    /// Drive the current procedure with a dialog event.
    pub fn lock_and_invoke_dialog(
        self: &Arc<Self>,
        svc: &Services,
        event: &DialogEvent,
    ) -> DispatchOutcome {
        if self.is_dead() {
            return DispatchOutcome::NotHandled;
        }
        let Some((mmc, chan)) = self.resolve() else {
            return DispatchOutcome::NotHandled;
        };
        let key = crate::sip::dialog_case(event.state);
        let mut inner = self.inner.lock();
        let outcome =
            self.run_machines(svc, &mut inner, &mmc, &chan, key, ProcInput::Dialog(event));
        drop(inner);
        self.finish_run(svc, outcome)
    }

    /// Fold a dialog-state change into the event stream, if one happened.
    /// Returns true if an event was delivered.
    pub fn check_sip(self: &Arc<Self>, svc: &Services) -> (bool, Option<TermCause>) {
        if self.is_dead() {
            return (false, None);
        }
        let event = {
            let mut inner = self.inner.lock();
            if inner.sip_suspended {
                None
            } else if let Some(dialog) = inner.dialog.clone() {
                let state = dialog.state();
                if inner.last_dialog_state == Some(state) {
                    None
                } else {
                    inner.last_dialog_state = Some(state);
                    let (sip_code, reason) =
                        dialog.final_response().unwrap_or((0, String::new()));
                    Some(DialogEvent {
                        state,
                        sip_code,
                        reason,
                    })
                }
            } else {
                None
            }
        };
        match event {
            Some(event) => match self.lock_and_invoke_dialog(svc, &event) {
                DispatchOutcome::CloseChannel(cause) => (true, Some(cause)),
                _ => (true, None),
            },
            None => (false, None),
        }
    }

    /// Fire at most one expired timer. Returns whether anything fired and
    /// an optional channel-close request.
    pub fn check_timers(self: &Arc<Self>, svc: &Services) -> (bool, Option<TermCause>) {
        if self.is_dead() {
            return (false, None);
        }
        let Some((mmc, chan)) = self.resolve() else {
            return (false, None);
        };
        let mut inner = self.inner.lock();
        let Some((id, action)) = inner.timers.take_expired() else {
            return (false, None);
        };
        info!(tran = self.id.0, timer = id.name(), ?action, "timer expired");
        match action {
            TimerAction::State(state) => {
                let outcome =
                    self.run_machines(svc, &mut inner, &mmc, &chan, state, ProcInput::None);
                drop(inner);
                match self.finish_run(svc, outcome) {
                    DispatchOutcome::CloseChannel(cause) => (true, Some(cause)),
                    _ => (true, None),
                }
            }
            TimerAction::AbortTran => {
                let cause = TermCause::local(L3Cause::NoUserResponding);
                // For calls, go through the CC clearing messages so the
                // handset does not show a dropped call.
                if self.service.is_voice() {
                    self.close_call_wire(&mut inner, &chan, &cause, true);
                }
                let cdr = if !self.dead.swap(true, Ordering::AcqRel) {
                    Some(self.cancel_with_inner(&mut inner, svc, cause))
                } else {
                    None
                };
                drop(inner);
                if let Some(cdr) = cdr {
                    self.finish_cancel(svc, cdr);
                }
                (true, None)
            }
            TimerAction::AbortChannel => {
                chan.l3send_msg(
                    L3Message::ChannelRelease {
                        cause: RrCause::TimerExpired,
                    },
                    crate::l3::Sapi::Sapi0,
                );
                drop(inner);
                (true, Some(TermCause::local(L3Cause::NoUserResponding)))
            }
        }
    }

    /// Give the top procedure a chance at cleanup before pre-emption.
    pub fn terminate_hook(self: &Arc<Self>, svc: &Services) {
        let Some((mmc, chan)) = self.resolve() else {
            return;
        };
        let mut inner = self.inner.lock();
        let depth = inner.machines.len();
        if depth == 0 {
            return;
        }
        let Some(mut proc) = inner.machines[depth - 1].proc.take() else {
            return;
        };
        {
            let mut ctx = ProcCtx {
                svc,
                tran: self,
                inner: &mut inner,
                mmc: &mmc,
                chan: &chan,
                stack_op: None,
            };
            proc.handle_termination_request(&mut ctx);
        }
        if let Some(frame) = inner.machines.get_mut(depth - 1) {
            frame.proc = Some(proc);
        }
    }

    // --- cancellation ---------------------------------------------------

    /// Cancel the transaction: end the dialog, stop timers, pop machines,
    /// record the disposition, emit a CDR, and detach from the context.
    /// Idempotent and safe from any thread.
    pub fn te_cancel(self: &Arc<Self>, svc: &Services, cause: TermCause) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        let cdr = {
            let mut inner = self.inner.lock();
            self.cancel_with_inner(&mut inner, svc, cause)
        };
        self.finish_cancel(svc, cdr);
    }

    /// Cancel, additionally sending the appropriate CC clearing message
    /// downlink first (GSM 04.08 5.4).
    pub fn te_close_call_now(self: &Arc<Self>, svc: &Services, cause: TermCause, send_cause: bool) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        let cdr = {
            let mut inner = self.inner.lock();
            if let Some((_, chan)) = self.resolve() {
                self.close_call_wire(&mut inner, &chan, &cause, send_cause);
            }
            self.cancel_with_inner(&mut inner, svc, cause)
        };
        self.finish_cancel(svc, cdr);
    }

    /// Send the CC clearing message matching the current call state.
    fn close_call_wire(
        &self,
        inner: &mut TranInner,
        chan: &Arc<L3Channel>,
        cause: &TermCause,
        send_cause: bool,
    ) {
        let Some(ti) = inner.l3_ti else {
            return;
        };
        let wire_cause = send_cause.then(|| cause.cc_cause());
        let msg = match inner.gsm_state {
            CallState::Active | CallState::ConnectIndication => L3Message::Disconnect {
                ti,
                cause: cause.cc_cause(),
            },
            CallState::DisconnectIndication | CallState::ReleaseRequest => L3Message::Release {
                ti,
                cause: wire_cause,
            },
            CallState::Null | CallState::TranDeleted => return,
            _ => L3Message::ReleaseComplete {
                ti,
                cause: wire_cause,
            },
        };
        chan.l3send_msg(msg, crate::l3::Sapi::Sapi0);
    }

    /// The shared cancellation body. Caller holds the inner lock and has
    /// won the dead flag.
    fn cancel_with_inner(
        &self,
        inner: &mut TranInner,
        svc: &Services,
        cause: TermCause,
    ) -> CdrRecord {
        info!(tran = self.id.0, service = self.service.name(), %cause, "transaction cancelled");
        if let Some(dialog) = inner.dialog.take() {
            if !dialog.is_finished() {
                let header = cause.sip_reason_header();
                match dialog.state() {
                    DialogState::Active => dialog.send_bye(&header),
                    _ => dialog.send_cancel(&header),
                }
            }
        }
        inner.timers.stop_all();
        inner.machines.clear();
        if inner.disposition.is_none() {
            inner.disposition = Some(cause);
        }
        inner.set_gsm_state(CallState::TranDeleted);
        if let Some(port) = inner.rtp_port.take() {
            svc.rtp.release(port);
        }
        self.build_cdr(inner)
    }

    /// Post-unlock cancellation tail: detach from the slot and ship the CDR.
    fn finish_cancel(self: &Arc<Self>, svc: &Services, cdr: CdrRecord) {
        if let Some(mmc) = self.mm_context() {
            mmc.disconnect_tran(self);
        }
        svc.cdr.write(cdr);
    }

    fn build_cdr(&self, inner: &TranInner) -> CdrRecord {
        let connect_time = inner
            .connect_time
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let duration = inner
            .connect_time
            .and_then(|t| t.elapsed().ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mt = matches!(
            self.service,
            ServiceType::MobileTerminatedCall
                | ServiceType::MtSms
                | ServiceType::MtSupplementaryService
        );
        let (to_imsi, from_imsi) = if mt {
            (inner.subscriber.imsi.clone(), String::new())
        } else {
            (String::new(), inner.subscriber.imsi.clone())
        };
        let handover = inner.handover.as_ref();
        CdrRecord {
            logged_at: String::new(),
            kind: self.service.name().to_string(),
            tran_id: self.id.0,
            to_imsi,
            from_imsi,
            to_number: inner.called.clone().unwrap_or_default(),
            from_number: inner.calling.clone().unwrap_or_default(),
            peer: handover.map(|h| h.peer.clone()).unwrap_or_default(),
            connect_time,
            duration,
            message_size: inner.message_body.len(),
            handover_in: self.service == ServiceType::HandoverInbound,
            handover_out: matches!(
                inner.disposition.as_ref().map(|d| d.cause()),
                Some(L3Cause::HandoverOutbound)
            ),
            termination_cause: inner
                .disposition
                .as_ref()
                .map(|d| d.cause().to_string())
                .unwrap_or_default(),
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id.0)
            .field("service", &self.service.name())
            .field("dead", &self.is_dead())
            .finish()
    }
}
