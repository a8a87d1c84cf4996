//! Call control: mobile-originated and mobile-terminated call
//! establishment, the SDCCH-to-TCH reassignment, and the in-call state.
//!
//! GSM 04.08 5.2.1 / 5.2.2 on the radio side, one SIP dialog on the other.
//! The clearing helpers implement network-initiated clearing per 04.08
//! 5.4: go through Disconnect where the handset would otherwise report a
//! network failure, ReleaseComplete when the transaction never got that
//! far.

use crate::cause::{L3Cause, TermCause};
use crate::l3::{
    key, ChannelDescription, CmServiceType, DispatchKey, L3Message, ProgressIndicator,
};
use crate::mm::{MmContext, TranSlot};
use crate::services::Services;
use crate::sip::{dialog_term_cause, key as sipkey, DialogState};
use crate::sm::{MachineStatus, ProcCtx, ProcInput, Procedure};
use crate::timers::{TimerAction, TimerId};
use crate::tran::{CallState, ServiceType, Transaction};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

// Private resume states.
const ST_IDENT_RESULT: DispatchKey = 0x20;
const ST_ASSIGN_SUCCESS: DispatchKey = 0x21;
const ST_ASSIGN_TIMEOUT: DispatchKey = 0x22;
const ST_TRYING_TICK: DispatchKey = 0x23;
const ST_ASSIGNED: DispatchKey = 0x24;

/// Start a mobile-originated call from a dequeued CMServiceRequest.
pub fn start_moc(svc: &Services, mmc: &Arc<MmContext>, msg: &L3Message) {
    if mmc.get_tran(TranSlot::Cs1).is_some() {
        warn!("CM service request for a call while CS1 is busy, rejecting");
        mmc.channel().l3send_msg(
            L3Message::CmServiceReject {
                cause: L3Cause::ServiceOptionNotSupported,
            },
            crate::l3::Sapi::Sapi0,
        );
        return;
    }
    let service = match msg {
        L3Message::CmServiceRequest {
            service: CmServiceType::EmergencyCall,
            ..
        } => ServiceType::EmergencyCall,
        _ => ServiceType::MobileOriginatedCall,
    };
    let tran = Transaction::new_moc(mmc, service);
    let outcome = tran.lock_and_start(svc, Box::new(MocMachine::new()), Some(msg));
    crate::dispatch::finish_start(svc, mmc, outcome);
}

/// Factory for the MT call machine, started when the CS1 slot is filled
/// from the MMUser queue.
pub fn mtc_machine() -> Box<dyn Procedure> {
    Box::new(MtcMachine::new())
}

/// Factory for the inbound-handover continuation, started on LAPDm
/// establishment after the access burst.
pub fn inbound_handover_machine() -> Box<dyn Procedure> {
    Box::new(InboundHandoverMachine::new())
}

// --- shared clearing helpers -------------------------------------------

/// End the SIP dialog now, leaving the GSM side to its own clearing.
fn close_dialog(ctx: &mut ProcCtx<'_>, cause: &TermCause) {
    if let Some(dialog) = ctx.inner.dialog.take() {
        if !dialog.is_finished() {
            let header = cause.sip_reason_header();
            match dialog.state() {
                DialogState::Active => dialog.send_bye(&header),
                _ => dialog.send_cancel(&header),
            }
        }
    }
}

/// Network-initiated clearing, 04.08 5.4: Disconnect from Active and wait
/// for the Release, ReleaseComplete from earlier states.
pub(crate) fn close_call(ctx: &mut ProcCtx<'_>, cause: TermCause) -> MachineStatus {
    info!(%cause, "closing call");
    close_dialog(ctx, &cause);
    if ctx.ti_valid() {
        let ti = ctx.l3_ti();
        match ctx.gsm_state() {
            CallState::Active | CallState::ConnectIndication => {
                ctx.l3sendm(L3Message::Disconnect {
                    ti,
                    cause: cause.cc_cause(),
                });
                ctx.set_gsm_state(CallState::DisconnectIndication);
                ctx.timer_start(TimerId::T308, TimerAction::AbortTran);
                // Wait for the handset's Release / ReleaseComplete.
                ctx.inner.disposition = Some(cause);
                return MachineStatus::Ok;
            }
            CallState::Null | CallState::ReleaseRequest => {}
            _ => {
                ctx.l3sendm(L3Message::ReleaseComplete {
                    ti,
                    cause: Some(cause.cc_cause()),
                });
            }
        }
    }
    ctx.set_gsm_state(CallState::Null);
    MachineStatus::QuitTran(cause)
}

/// The handset sent a Disconnect: answer with Release and wait for the
/// ReleaseComplete.
fn send_release(ctx: &mut ProcCtx<'_>, cause: TermCause, send_cause: bool) -> MachineStatus {
    close_dialog(ctx, &cause);
    if !ctx.ti_valid() {
        return MachineStatus::QuitTran(cause);
    }
    let ti = ctx.l3_ti();
    if ctx.gsm_state().is_clearing() {
        // Already clearing; finish it off.
        ctx.l3sendm(L3Message::ReleaseComplete {
            ti,
            cause: send_cause.then(|| cause.cc_cause()),
        });
        return MachineStatus::QuitTran(cause);
    }
    ctx.l3sendm(L3Message::Release {
        ti,
        // The handset initiated this clearing, so our Release carries no
        // Cause IE (04.08 9.3.18.1.1).
        cause: send_cause.then(|| cause.cc_cause()),
    });
    ctx.set_gsm_state(CallState::ReleaseRequest);
    ctx.timer_start(TimerId::T308, TimerAction::AbortTran);
    ctx.inner.disposition = Some(cause);
    MachineStatus::Ok
}

/// Send ReleaseComplete and end the transaction.
fn send_release_complete(ctx: &mut ProcCtx<'_>, cause: TermCause, send_cause: bool)
    -> MachineStatus {
    close_dialog(ctx, &cause);
    if ctx.ti_valid() {
        let ti = ctx.l3_ti();
        ctx.l3sendm(L3Message::ReleaseComplete {
            ti,
            cause: send_cause.then(|| cause.cc_cause()),
        });
    }
    ctx.set_gsm_state(CallState::Null);
    MachineStatus::QuitTran(cause)
}

/// Messages every CC machine must tolerate in any state, 04.08 5.4.3 and
/// friends. Returns UnexpectedState for anything it does not know either.
pub(crate) fn default_messages(
    name: &'static str,
    ctx: &mut ProcCtx<'_>,
    state: DispatchKey,
    input: ProcInput<'_>,
) -> MachineStatus {
    match state {
        key::CC_HOLD => {
            // No call-hold service here.
            info!("rejecting hold request");
            ctx.l3sendm(L3Message::HoldReject {
                ti: ctx.l3_ti(),
                cause: L3Cause::ServiceOrOptionNotAvailable,
            });
            MachineStatus::Ok
        }
        key::MM_CM_SERVICE_ABORT => {
            // 04.08 4.5.1.7: the MS gave up before setup.
            info!("CM service abort");
            ctx.timer_stop_all();
            close_call(ctx, TermCause::local(L3Cause::CallRejected))
        }
        key::CC_DISCONNECT => {
            // 04.08 5.4.3: be prepared for a Disconnect at any time.
            ctx.timer_stop_all();
            let cause = match input.message() {
                Some(L3Message::Disconnect { cause, .. }) => *cause,
                _ => L3Cause::NormalCallClearing,
            };
            send_release(ctx, TermCause::local(cause), false)
        }
        key::CC_RELEASE => {
            ctx.timer_stop_all();
            let cause = match input.message() {
                Some(L3Message::Release {
                    cause: Some(cause), ..
                }) => *cause,
                _ => L3Cause::NormalCallClearing,
            };
            send_release_complete(ctx, TermCause::local(cause), false)
        }
        key::CC_RELEASE_COMPLETE => {
            // 04.08 5.4.3.3: kill the transaction immediately. If this
            // answers our own Release, keep the disposition we already
            // recorded.
            ctx.timer_stop_all();
            ctx.set_gsm_state(CallState::Null);
            let cause = ctx
                .inner
                .disposition
                .clone()
                .unwrap_or_else(|| TermCause::local(L3Cause::NormalCallClearing));
            MachineStatus::QuitTran(cause)
        }
        key::MM_IMSI_DETACH => {
            info!("IMSI detach during call");
            ctx.timer_stop_all();
            let imsi = ctx.inner.subscriber.imsi.clone();
            if !imsi.is_empty() {
                ctx.svc.tmsi.touch(&imsi);
            }
            ctx.close_channel(
                crate::cause::RrCause::NormalEvent,
                TermCause::local(L3Cause::ImsiDetached),
            )
        }
        key::CC_START_DTMF => {
            let dtmf_key = match input.message() {
                Some(L3Message::StartDtmf { key, .. }) => *key,
                _ => return ctx.unexpected_state(name, state),
            };
            let sent = ctx
                .dialog()
                .map(|d| d.send_info_dtmf(dtmf_key))
                .unwrap_or(false);
            let ti = ctx.l3_ti();
            if sent {
                ctx.l3sendm(L3Message::StartDtmfAck { ti, key: dtmf_key });
            } else {
                ctx.l3sendm(L3Message::StartDtmfReject {
                    ti,
                    cause: L3Cause::ServiceOrOptionNotAvailable,
                });
            }
            MachineStatus::Ok
        }
        key::CC_STOP_DTMF => {
            ctx.l3sendm(L3Message::StopDtmfAck { ti: ctx.l3_ti() });
            MachineStatus::Ok
        }
        key::SS_REGISTER | key::SS_FACILITY | key::SS_RELEASE_COMPLETE => {
            crate::procedures::ss::handle_in_call_ss(ctx, input)
        }
        other => ctx.unexpected_state(name, other),
    }
}

fn is_very_early(ctx: &ProcCtx<'_>) -> bool {
    ctx.chan.is_tchf()
}

// --- MOC ----------------------------------------------------------------

/// Mobile-originated call establishment, GSM 04.08 5.2.1.
pub struct MocMachine;

impl MocMachine {
    pub fn new() -> MocMachine {
        MocMachine
    }

    fn service_accept(&self, ctx: &mut ProcCtx<'_>) -> MachineStatus {
        // Grab the TCH now unless very-early assignment already put us on
        // one.
        if !is_very_early(ctx) && !ctx.chan.reassign_alloc_next_tch(ctx.svc) {
            let cause = TermCause::local(L3Cause::NoChannelAvailable);
            ctx.l3sendm(L3Message::CmServiceReject {
                cause: L3Cause::Congestion,
            });
            return ctx.close_channel(crate::cause::RrCause::NormalEvent, cause);
        }
        info!("sending CMServiceAccept");
        ctx.l3sendm(L3Message::CmServiceAccept);
        // Now waiting for the L3 Setup.
        MachineStatus::Ok
    }

    fn send_cm_service_reject(&self, ctx: &mut ProcCtx<'_>, cause: L3Cause, fatal: bool)
        -> MachineStatus {
        ctx.l3sendm(L3Message::CmServiceReject { cause });
        if fatal {
            ctx.close_channel(crate::cause::RrCause::NormalEvent, TermCause::local(cause))
        } else {
            MachineStatus::QuitTran(TermCause::local(cause))
        }
    }

    /// The Setup establishes the TI correspondence and starts the SIP
    /// dialog.
    fn handle_setup(&self, ctx: &mut ProcCtx<'_>, msg: &L3Message) -> MachineStatus {
        let L3Message::Setup {
            ti, called, codecs, ..
        } = msg
        else {
            return ctx.unexpected_state(self.name(), key::CC_SETUP);
        };
        // 04.07 11.2.3.1.3: the TI came from the MS, store it with the
        // direction bit set; the bit is masked again on comparison.
        ctx.inner.l3_ti = Some(ti | 0x08);
        ctx.inner.codecs = *codecs;
        let Some(called) = called.clone() else {
            // 04.08 5.4.2: no number, no call.
            warn!("MOC setup with no called party number");
            return close_call(ctx, TermCause::local(L3Cause::MissingCalledPartyNumber));
        };
        ctx.inner.called = Some(called.clone());

        let dialog = ctx
            .svc
            .sipif
            .new_moc_dialog(&ctx.inner.subscriber, &called, *codecs);
        let Some(dialog) = dialog else {
            warn!("failed to create SIP dialog, dropping connection");
            return ctx.close_channel(
                crate::cause::RrCause::Unspecified,
                TermCause::local(L3Cause::SipInternalError),
            );
        };
        ctx.set_dialog(dialog);
        info!(called, "sending CallProceeding");
        ctx.l3sendm(L3Message::CallProceeding { ti: ctx.l3_ti() });
        ctx.set_gsm_state(CallState::MocProceeding);
        MachineStatus::Ok
    }
}

impl Procedure for MocMachine {
    fn name(&self) -> &'static str {
        "MocMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            // Start state: the CMServiceRequest itself.
            key::MM_CM_SERVICE_REQUEST => {
                let Some(L3Message::CmServiceRequest { mobile_id, .. }) = input.message() else {
                    return ctx.unexpected_state(self.name(), state);
                };
                // No network-side timer is specified for this phase; T303
                // covers it like the MS side does.
                ctx.timer_start(TimerId::T303, TimerAction::AbortTran);
                ctx.set_gsm_state(CallState::MocInitiated);
                ctx.machine_push(
                    crate::procedures::identify::IdentifyMachine::new(mobile_id.clone()),
                    ST_IDENT_RESULT,
                )
            }

            ST_IDENT_RESULT => {
                if ctx.inner.identify_result.take() == Some(true) {
                    self.service_accept(ctx)
                } else {
                    // Cause 4 sends the MS back to a location update,
                    // which will produce the real reject cause.
                    self.send_cm_service_reject(ctx, L3Cause::ImsiUnknownInVlr, true)
                }
            }

            key::CC_SETUP | key::CC_EMERGENCY_SETUP => {
                ctx.timer_stop(TimerId::T303);
                if ctx.gsm_state() == CallState::MocProceeding {
                    debug!("ignoring duplicate Setup");
                    return MachineStatus::Ok;
                }
                let Some(msg) = input.message() else {
                    return ctx.unexpected_state(self.name(), state);
                };
                let status = self.handle_setup(ctx, msg);
                if !matches!(status, MachineStatus::Ok) {
                    return status;
                }
                ctx.machine_push(Box::new(AssignTchMachine::new()), ST_ASSIGN_SUCCESS)
            }

            ST_ASSIGN_SUCCESS => {
                // Fresh TCH in hand. Dialog messages were discarded while
                // the channel was in flux; re-derive from the dialog
                // state.
                match ctx.dialog() {
                    Some(dialog) => {
                        let st = dialog.state();
                        self.run(ctx, crate::sip::dialog_case(st), ProcInput::None)
                    }
                    None => close_call(ctx, TermCause::local(L3Cause::SipInternalError)),
                }
            }

            sipkey::DIALOG_STARTED => MachineStatus::Ok, // no answer yet

            sipkey::DIALOG_PROCEEDING => {
                ctx.l3sendm(L3Message::Progress { ti: ctx.l3_ti() });
                if ctx.gsm_state() != CallState::MocProceeding {
                    warn!(state = ?ctx.gsm_state(), "SIP progress in unexpected call state");
                }
                MachineStatus::Ok
            }

            sipkey::DIALOG_RINGING => {
                // The Progress IE makes handsets that stay silent on a
                // bare Alerting generate their ringback tone.
                ctx.l3sendm(L3Message::Alerting {
                    ti: ctx.l3_ti(),
                    progress: Some(ProgressIndicator::queuing_user()),
                });
                ctx.set_gsm_state(CallState::MocDelivered);
                MachineStatus::Ok
            }

            sipkey::DIALOG_ACTIVE => {
                // Connected.
                ctx.inner.connect_time = Some(SystemTime::now());
                maybe_cipher(ctx);
                ctx.l3sendm(L3Message::Connect { ti: ctx.l3_ti() });
                ctx.set_gsm_state(CallState::ConnectIndication);
                if let Some(dialog) = ctx.dialog() {
                    dialog.init_rtp();
                    dialog.send_ack();
                }
                // Waiting for the ConnectAcknowledge.
                MachineStatus::Ok
            }

            key::CC_CONNECT_ACK => {
                let Some(dialog) = ctx.dialog() else {
                    return close_call(ctx, TermCause::local(L3Cause::SipInternalError));
                };
                if dialog.is_active() {
                    ctx.set_gsm_state(CallState::Active);
                    ctx.machine_start(Box::new(InCallMachine::new()))
                } else if dialog.is_finished() {
                    // The SIP side hung up under us.
                    let cause = dialog_term_cause(dialog.as_ref());
                    close_call(ctx, cause)
                } else {
                    warn!(state = ?dialog.state(), "ConnectAcknowledge in odd dialog state");
                    ctx.set_gsm_state(CallState::Active);
                    ctx.machine_start(Box::new(InCallMachine::new()))
                }
            }

            // Duplicates after the reassignment; harmless.
            key::RR_ASSIGNMENT_COMPLETE | key::RR_MODE_MODIFY_ACK => {
                debug!("ignoring duplicate assignment acknowledgement");
                MachineStatus::Ok
            }

            sipkey::DIALOG_BYE => close_call(ctx, dialog_cause(ctx)),
            sipkey::DIALOG_FAIL => {
                let cause = dialog_cause(ctx);
                info!(%cause, "SIP dialog failed");
                close_call(ctx, cause)
            }

            other => default_messages(self.name(), ctx, other, input),
        }
    }
}

fn dialog_cause(ctx: &ProcCtx<'_>) -> TermCause {
    match ctx.dialog() {
        Some(d) => dialog_term_cause(d.as_ref()),
        None => TermCause::local(L3Cause::NormalCallClearing),
    }
}

/// Start ciphering at connect time when configured.
fn maybe_cipher(ctx: &mut ProcCtx<'_>) {
    if !ctx.svc.config.cipher_encrypt() {
        return;
    }
    let imsi = ctx.inner.subscriber.imsi.clone();
    match ctx.svc.tmsi.preferred_a5(&imsi) {
        Some(algo) => {
            debug!(?algo, "sending Ciphering Mode Command");
            ctx.l3sendm(L3Message::CipheringModeCommand { algo });
        }
        None => {
            debug!(imsi, "A5/3 and A5/1 not supported: NOT sending Ciphering Mode Command");
        }
    }
}

// --- channel reassignment ----------------------------------------------

/// Replace the SDCCH under a transaction with a newly-allocated TCH
/// without losing the transaction or its dialog.
///
/// SIP processing is suspended for the duration: a dialog answer must not
/// drive GSM messages while the channel is in flux. The pusher re-derives
/// from the dialog state when we pop.
pub struct AssignTchMachine;

impl AssignTchMachine {
    pub fn new() -> AssignTchMachine {
        AssignTchMachine
    }

    fn finish(&self, ctx: &mut ProcCtx<'_>) {
        ctx.inner.sip_suspended = false;
        ctx.timer_stop(TimerId::T3101);
    }
}

impl Procedure for AssignTchMachine {
    fn name(&self) -> &'static str {
        "AssignTchMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            0 => {
                ctx.inner.sip_suspended = true;
                if is_very_early(ctx) {
                    // Already on a TCH: just switch the channel mode.
                    ctx.l3sendm(L3Message::ChannelModeModify { mode_speech: true });
                    ctx.timer_start(TimerId::T3101, TimerAction::State(ST_ASSIGN_TIMEOUT));
                    return MachineStatus::Ok;
                }
                // The TCH was allocated at CMServiceAccept time; if not
                // (MTC path), get one now.
                if ctx.chan.next_chan().is_none()
                    && !ctx.chan.reassign_alloc_next_tch(ctx.svc)
                {
                    self.finish(ctx);
                    return MachineStatus::QuitTran(TermCause::local(
                        L3Cause::NoChannelAvailable,
                    ));
                }
                ctx.chan.reassign_start();
                let Some(next) = ctx.chan.next_chan() else {
                    self.finish(ctx);
                    return MachineStatus::QuitTran(TermCause::local(
                        L3Cause::ChannelAssignmentFailure,
                    ));
                };
                ctx.timer_start(TimerId::T3101, TimerAction::State(ST_ASSIGN_TIMEOUT));
                ctx.l3sendm(L3Message::AssignmentCommand {
                    channel: ChannelDescription {
                        description: next.descriptive(),
                    },
                    mode_speech: true,
                });
                MachineStatus::Ok
            }

            key::RR_MODE_MODIFY_ACK => {
                // Very-early path complete.
                self.finish(ctx);
                MachineStatus::PopMachine
            }

            key::RR_ASSIGNMENT_COMPLETE => {
                // Arrives on the NEW channel; rewire and let the old one
                // go.
                let old = ctx.mmc.channel();
                old.reassign_complete();
                self.finish(ctx);
                MachineStatus::PopMachine
            }

            key::RR_ASSIGNMENT_FAILURE | ST_ASSIGN_TIMEOUT => {
                info!("channel assignment failed");
                let old = ctx.mmc.channel();
                old.reassign_failure(ctx.svc);
                self.finish(ctx);
                MachineStatus::QuitTran(TermCause::local(L3Cause::ChannelAssignmentFailure))
            }

            other => default_messages(self.name(), ctx, other, input),
        }
    }
}

// --- MTC ----------------------------------------------------------------

/// Mobile-terminated call establishment, GSM 04.08 5.2.2. The transaction
/// arrives with its dialog and calling party already attached; paging has
/// succeeded when this starts.
pub struct MtcMachine;

impl MtcMachine {
    pub fn new() -> MtcMachine {
        MtcMachine
    }
}

impl Procedure for MtcMachine {
    fn name(&self) -> &'static str {
        "MtcMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            0 => {
                // Did the SIP side give up while we were paging?
                match ctx.dialog() {
                    None => {
                        return MachineStatus::QuitTran(TermCause::local(
                            L3Cause::SipInternalError,
                        ));
                    }
                    Some(d) if d.is_finished() => {
                        let cause = dialog_term_cause(d.as_ref());
                        return MachineStatus::QuitTran(cause);
                    }
                    Some(_) => {}
                }
                let ti = ctx.mmc.next_ti();
                ctx.inner.l3_ti = Some(ti);
                info!(ti, "MTC setup");
                ctx.l3sendm(L3Message::Setup {
                    ti,
                    called: None,
                    calling: ctx.inner.calling.clone(),
                    codecs: crate::codec::CodecSet::empty(),
                });
                ctx.timer_start(TimerId::T303, TimerAction::AbortTran);
                ctx.set_gsm_state(CallState::CallPresent);
                if let Some(d) = ctx.dialog() {
                    d.send_trying();
                }
                ctx.timer_start_dur(
                    TimerId::TMisc1,
                    Duration::from_secs(1),
                    TimerAction::State(ST_TRYING_TICK),
                );
                MachineStatus::Ok
            }

            // Keep the SIP side warm until the handset confirms.
            ST_TRYING_TICK => {
                if ctx.gsm_state() == CallState::CallPresent {
                    if let Some(d) = ctx.dialog() {
                        d.send_trying();
                    }
                    ctx.timer_start_dur(
                        TimerId::TMisc1,
                        Duration::from_secs(1),
                        TimerAction::State(ST_TRYING_TICK),
                    );
                }
                MachineStatus::Ok
            }

            key::CC_CALL_CONFIRMED => {
                ctx.timer_stop(TimerId::T303);
                ctx.timer_stop(TimerId::TMisc1);
                if let Some(L3Message::CallConfirmed { codecs, .. }) = input.message() {
                    ctx.inner.codecs = *codecs;
                }
                ctx.set_gsm_state(CallState::MtcConfirmed);
                ctx.machine_push(Box::new(AssignTchMachine::new()), ST_ASSIGNED)
            }

            ST_ASSIGNED => MachineStatus::Ok, // now waiting for Alerting

            key::CC_ALERTING => {
                ctx.set_gsm_state(CallState::CallReceived);
                if let Some(d) = ctx.dialog() {
                    d.reply(180, "Ringing");
                }
                ctx.timer_start(TimerId::T301, TimerAction::AbortTran);
                MachineStatus::Ok
            }

            key::CC_CONNECT => {
                ctx.timer_stop(TimerId::T301);
                ctx.set_gsm_state(CallState::ConnectIndication);
                ctx.inner.connect_time = Some(SystemTime::now());
                if let Some(d) = ctx.dialog() {
                    d.reply(200, "OK");
                }
                ctx.timer_start(TimerId::T313, TimerAction::AbortTran);
                MachineStatus::Ok
            }

            sipkey::DIALOG_ACTIVE => {
                // The ACK landed.
                ctx.timer_stop(TimerId::T313);
                ctx.l3sendm(L3Message::ConnectAcknowledge { ti: ctx.l3_ti() });
                ctx.set_gsm_state(CallState::Active);
                ctx.machine_start(Box::new(InCallMachine::new()))
            }

            sipkey::DIALOG_STARTED | sipkey::DIALOG_PROCEEDING | sipkey::DIALOG_RINGING => {
                MachineStatus::Ok
            }

            sipkey::DIALOG_BYE | sipkey::DIALOG_FAIL => {
                // CANCEL during paging or setup.
                ctx.timer_stop_all();
                let cause = match ctx.dialog() {
                    Some(d) => dialog_term_cause(d.as_ref()),
                    None => TermCause::local(L3Cause::CallRejected),
                };
                close_call(ctx, cause)
            }

            other => default_messages(self.name(), ctx, other, input),
        }
    }
}

// --- in-call ------------------------------------------------------------

/// The steady state of a connected call. Media pumping lives in the
/// traffic loop; this machine handles the signalling that can still
/// arrive: DTMF, hold attempts, clearing from either side, in-call SS.
pub struct InCallMachine;

impl InCallMachine {
    pub fn new() -> InCallMachine {
        InCallMachine
    }
}

impl Procedure for InCallMachine {
    fn name(&self) -> &'static str {
        "InCallMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            0 => MachineStatus::Ok,
            sipkey::DIALOG_BYE => close_call(ctx, dialog_cause(ctx)),
            sipkey::DIALOG_FAIL => close_call(ctx, dialog_cause(ctx)),
            // Late duplicates are routine.
            key::CC_CONNECT_ACK | sipkey::DIALOG_ACTIVE => MachineStatus::Ok,
            other => default_messages(self.name(), ctx, other, input),
        }
    }

    fn handle_termination_request(&mut self, ctx: &mut ProcCtx<'_>) {
        // Give the handset a proper clearing sequence before the channel
        // is pre-empted.
        if ctx.ti_valid() {
            ctx.l3sendm(L3Message::Disconnect {
                ti: ctx.l3_ti(),
                cause: L3Cause::PreemptiveRelease.cc_equivalent(),
            });
        }
    }
}

// --- inbound handover ---------------------------------------------------

/// BS2 side of a handover, after the access burst and LAPDm
/// establishment: wait for the HandoverComplete, then the call continues
/// here as a normal in-call transaction.
pub struct InboundHandoverMachine;

impl InboundHandoverMachine {
    pub fn new() -> InboundHandoverMachine {
        InboundHandoverMachine
    }
}

impl Procedure for InboundHandoverMachine {
    fn name(&self) -> &'static str {
        "InboundHandoverMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            0 => {
                ctx.set_gsm_state(CallState::HandoverProgress);
                ctx.timer_start(TimerId::THandoverComplete, TimerAction::AbortChannel);
                MachineStatus::Ok
            }
            key::RR_HANDOVER_COMPLETE => {
                ctx.timer_stop(TimerId::THandoverComplete);
                ctx.svc
                    .counters
                    .handovers_in
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                ctx.inner.connect_time = Some(SystemTime::now());
                ctx.set_gsm_state(CallState::Active);
                info!("inbound handover complete, call is live here");
                ctx.machine_start(Box::new(InCallMachine::new()))
            }
            key::RR_HANDOVER_FAILURE => {
                info!("handset reports handover failure");
                ctx.close_channel(
                    crate::cause::RrCause::NoActivityOnTheRadio,
                    TermCause::local(L3Cause::HandoverError),
                )
            }
            other => default_messages(self.name(), ctx, other, input),
        }
    }
}
