//! Supplementary services (USSD) sessions.
//!
//! One dedicated SS transaction per channel; USSD arriving with a TI that
//! matches a live call is routed to that call's machine instead (in-call
//! USSD). There is no USSD application gateway behind this layer, so MO
//! sessions are answered with a release; MT sessions deliver their payload
//! and report back through the dialog.

use crate::cause::{L3Cause, TermCause};
use crate::l3::{key, DispatchKey, L3Message};
use crate::mm::{MmContext, TranSlot};
use crate::services::Services;
use crate::sm::{MachineStatus, ProcCtx, ProcInput, Procedure};
use crate::timers::{TimerAction, TimerId};
use crate::tran::Transaction;
use std::sync::Arc;
use tracing::{info, warn};

const ST_IDENT_RESULT: DispatchKey = 0x40;

/// Start an MO supplementary-services session from a CMServiceRequest.
pub fn start_mossd(svc: &Services, mmc: &Arc<MmContext>, msg: &L3Message) {
    // During a call, only an SMS submission is accepted as an additional
    // CM service; everything else gets the one reject cause for it.
    if mmc.get_tran(TranSlot::Cs1).is_some() {
        warn!("CM service request for SS during a call, rejecting");
        mmc.channel().l3send_msg(
            L3Message::CmServiceReject {
                cause: L3Cause::ServiceOptionNotSupported,
            },
            crate::l3::Sapi::Sapi0,
        );
        return;
    }
    if mmc.get_tran(TranSlot::Ss).is_some() {
        warn!("CM service request for SS while the SS slot is busy, ignored");
        return;
    }
    let tran = Transaction::new_mossd(mmc);
    let outcome = tran.lock_and_start(svc, Box::new(MoSsMachine::new()), Some(msg));
    crate::dispatch::finish_start(svc, mmc, outcome);
}

/// Factory for the MT SS machine started from the MMUser queue.
pub fn mtss_machine() -> Box<dyn Procedure> {
    Box::new(MtSsMachine)
}

/// USSD inside a call: acknowledged and dropped, since no gateway is
/// attached. The session stays within the call transaction.
pub fn handle_in_call_ss(ctx: &mut ProcCtx<'_>, input: ProcInput<'_>) -> MachineStatus {
    if let Some(msg) = input.message() {
        info!(%msg, "in-call SS message");
        if let L3Message::SsRegister { ti, .. } = msg {
            ctx.l3sendm(L3Message::SsReleaseComplete { ti: *ti });
        }
    }
    MachineStatus::Ok
}

/// MO USSD session.
pub struct MoSsMachine;

impl MoSsMachine {
    pub fn new() -> MoSsMachine {
        MoSsMachine
    }
}

impl Procedure for MoSsMachine {
    fn name(&self) -> &'static str {
        "MoSsMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            key::MM_CM_SERVICE_REQUEST => {
                ctx.timer_start(TimerId::TCancel, TimerAction::AbortTran);
                let Some(L3Message::CmServiceRequest { mobile_id, .. }) = input.message() else {
                    return ctx.unexpected_state(self.name(), state);
                };
                ctx.machine_push(
                    crate::procedures::identify::IdentifyMachine::new(mobile_id.clone()),
                    ST_IDENT_RESULT,
                )
            }

            ST_IDENT_RESULT => {
                if ctx.inner.identify_result.take() != Some(true) {
                    let cause = L3Cause::InvalidMandatoryInformation;
                    ctx.l3sendm(L3Message::CmServiceReject { cause });
                    return MachineStatus::QuitTran(TermCause::local(cause));
                }
                ctx.l3sendm(L3Message::CmServiceAccept);
                MachineStatus::Ok
            }

            key::SS_REGISTER => {
                ctx.timer_stop(TimerId::TCancel);
                let Some(L3Message::SsRegister { ti, ussd }) = input.message() else {
                    return ctx.unexpected_state(self.name(), state);
                };
                ctx.inner.l3_ti = Some(ti | 0x08);
                info!(ussd, "USSD request with no gateway configured");
                ctx.l3sendm(L3Message::SsReleaseComplete { ti: ctx.l3_ti() });
                MachineStatus::QuitTran(TermCause::local(L3Cause::ServiceOrOptionNotAvailable))
            }

            key::SS_RELEASE_COMPLETE => {
                MachineStatus::QuitTran(TermCause::local(L3Cause::NormalCallClearing))
            }

            other => ctx.unexpected_state(self.name(), other),
        }
    }
}

/// MT USSD notification: deliver the payload, wait for the handset's
/// answer, report to the dialog.
pub struct MtSsMachine;

impl Procedure for MtSsMachine {
    fn name(&self) -> &'static str {
        "MtSsMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            0 => {
                if let Some(d) = ctx.dialog() {
                    if d.is_finished() {
                        return MachineStatus::QuitTran(TermCause::local(
                            L3Cause::SipInternalError,
                        ));
                    }
                }
                ctx.timer_start(TimerId::TCancel, TimerAction::AbortTran);
                let ti = ctx.mmc.next_ti();
                ctx.inner.l3_ti = Some(ti);
                let payload = ctx.inner.message_body.clone();
                ctx.l3sendm(L3Message::SsRegister { ti, ussd: payload });
                MachineStatus::Ok
            }

            key::SS_FACILITY | key::SS_RELEASE_COMPLETE => {
                ctx.timer_stop(TimerId::TCancel);
                if let Some(L3Message::SsFacility { payload, .. }) = input.message() {
                    info!(payload, "USSD answer from handset");
                }
                if let Some(d) = ctx.dialog() {
                    d.reply(200, "OK");
                }
                let ti = ctx.l3_ti();
                ctx.l3sendm(L3Message::SsReleaseComplete { ti });
                MachineStatus::QuitTran(TermCause::local(L3Cause::NormalCallClearing))
            }

            other => ctx.unexpected_state(self.name(), other),
        }
    }
}
