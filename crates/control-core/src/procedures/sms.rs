//! Short message transport, GSM 04.11.
//!
//! MO: CP-DATA(RP-DATA) in, CP-ACK out, SIP MESSAGE out, then CP-DATA
//! (RP-ACK or RP-ERROR) down and a final CP-ACK up. MT: establish the SMS
//! SAPI, CP-DATA(RP-DATA) down, CP-ACK / CP-DATA(RP-ACK) up, CP-ACK down,
//! and report the outcome to the SIP side.
//!
//! The SMS SAPI is 3; on a TCH the SAPI 3 link rides the SACCH. At most
//! one MT-SMS runs per handset; extra ones wait on the MMUser queue.

use crate::cause::{L3Cause, TermCause};
use crate::l3::{key, DispatchKey, L3Message, RpMessage, Sapi, Tpdu};
use crate::mm::{MmContext, TranSlot};
use crate::services::Services;
use crate::sip::key as sipkey;
use crate::sm::{MachineStatus, ProcCtx, ProcInput, Procedure};
use crate::timers::{TimerAction, TimerId};
use crate::tran::{CallState, Transaction};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ST_IDENT_RESULT: DispatchKey = 0x30;

/// RP cause "semantically incorrect message".
const RP_CAUSE_SEMANTIC: u8 = 95;
/// RP cause "interworking error, unspecified" (04.11 8.2.5.4 table 8.4).
const RP_CAUSE_INTERWORKING: u8 = 127;

/// The SAPI the SMS transport uses on this channel: SAPI 3, via SACCH when
/// the host channel is a TCH.
fn sms_sapi(ctx: &ProcCtx<'_>) -> Sapi {
    if ctx.chan.is_sdcch() {
        Sapi::Sapi3
    } else {
        Sapi::Sapi3Sacch
    }
}

fn send_sms(ctx: &ProcCtx<'_>, msg: L3Message) {
    let sapi = sms_sapi(ctx);
    ctx.l3sendm_sapi(msg, sapi);
}

/// Start an MO-SMS from a dequeued CMServiceRequest. A second submission
/// may begin before the first one's final ack (04.11 5.4); a third is a
/// misbehaving handset and the oldest one is killed.
pub fn start_mosms(svc: &Services, mmc: &Arc<MmContext>, msg: &L3Message) {
    if let Some(prev) = mmc.get_tran(TranSlot::MoSms1) {
        let prev_waiting = prev.with_inner(|inner| inner.gsm_state == CallState::SmsSubmitting);
        if !prev_waiting {
            warn!("new MO-SMS before the previous one reached its ack phase, ignored");
            return;
        }
        if mmc.get_tran(TranSlot::MoSms2).is_some() {
            warn!("third simultaneous MO-SMS, cancelling the oldest");
            prev.te_cancel(svc, TermCause::local(L3Cause::SmsError));
        }
    }
    let tran = Transaction::new_mosms(mmc);
    let outcome = tran.lock_and_start(svc, Box::new(MoSmsMachine::new()), Some(msg));
    crate::dispatch::finish_start(svc, mmc, outcome);
}

/// Factory used by the MT queue drain and the welcome-message path.
pub fn mtsms_machine() -> Box<dyn Procedure> {
    Box::new(MtSmsMachine::new())
}

/// Mobile-originated short message (GSM 04.11 annex F, case A).
pub struct MoSmsMachine {
    rp_ref: u8,
}

impl MoSmsMachine {
    pub fn new() -> MoSmsMachine {
        MoSmsMachine { rp_ref: 0 }
    }

    /// Turn the RP-DATA into an outbound MESSAGE dialog. False on any
    /// parse or dialog-creation failure.
    fn handle_rpdu(&mut self, ctx: &mut ProcCtx<'_>, rpdu: &RpMessage) -> bool {
        match rpdu {
            RpMessage::Data {
                reference, tpdu, ..
            } => {
                self.rp_ref = *reference;
                let content_type = ctx.svc.config.sms_mime_type();
                let (to_address, body) = match (content_type.as_str(), tpdu) {
                    ("text/plain", Tpdu::Submit { dest, text }) => {
                        (dest.clone(), text.clone())
                    }
                    ("application/vnd.3gpp.sms", tpdu) => {
                        let hex = match tpdu {
                            Tpdu::RawHex(h) => h.clone(),
                            Tpdu::Submit { text, .. } => text.clone(),
                            Tpdu::Deliver { text, .. } => text.clone(),
                        };
                        // The encoded payload expects "smsc" as its
                        // destination.
                        ("smsc".to_string(), hex)
                    }
                    (other, _) => {
                        warn!(content_type = other, "unsupported SMS payload type");
                        return false;
                    }
                };
                ctx.inner.message_body = body.clone();
                ctx.inner.content_type = content_type.clone();
                ctx.inner.called = Some(to_address.clone());
                let dialog = ctx.svc.sipif.new_mosms_dialog(
                    &ctx.inner.subscriber,
                    &to_address,
                    &body,
                    &content_type,
                );
                match dialog {
                    Some(d) => {
                        ctx.set_dialog(d);
                        true
                    }
                    None => false,
                }
            }
            RpMessage::Ack { .. } | RpMessage::Smma { .. } => true,
            RpMessage::Error { .. } => false,
        }
    }
}

impl Procedure for MoSmsMachine {
    fn name(&self) -> &'static str {
        "MoSmsMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            // Start state: the CMServiceRequest.
            key::MM_CM_SERVICE_REQUEST => {
                ctx.timer_start(TimerId::TCancel, TimerAction::AbortTran);
                ctx.set_gsm_state(CallState::SmsSubmitting);
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
                    // The reject goes on the main channel, SAPI 0.
                    ctx.l3sendm(L3Message::CmServiceReject { cause });
                    return MachineStatus::QuitTran(TermCause::local(cause));
                }
                debug!("sending CMServiceAccept");
                // Also SAPI 0: some handsets ignore it on the SMS SAPI.
                ctx.l3sendm(L3Message::CmServiceAccept);
                MachineStatus::Ok
            }

            key::SMS_CP_DATA => {
                ctx.timer_stop(TimerId::TCancel);
                // Wait-for-RP-ACK phase, 04.11 6.2.2.
                ctx.timer_start(TimerId::TR1M, TimerAction::AbortTran);
                let Some(L3Message::CpData { ti, rpdu }) = input.message() else {
                    return ctx.unexpected_state(self.name(), state);
                };
                // The first CP-DATA binds the TI.
                let l3ti = ti | 0x08;
                ctx.inner.l3_ti = Some(l3ti);
                send_sms(ctx, L3Message::CpAck { ti: l3ti });
                let rpdu = rpdu.clone();
                if !self.handle_rpdu(ctx, &rpdu) {
                    info!("sending RPError in CPData");
                    send_sms(
                        ctx,
                        L3Message::CpData {
                            ti: l3ti,
                            rpdu: RpMessage::Error {
                                reference: self.rp_ref,
                                cause: RP_CAUSE_SEMANTIC,
                            },
                        },
                    );
                }
                MachineStatus::Ok
            }

            // The MESSAGE cleared: relay the ack chain down.
            sipkey::DIALOG_BYE => {
                info!("SMS delivered upstream, sending RPAck in CPData");
                send_sms(
                    ctx,
                    L3Message::CpData {
                        ti: ctx.l3_ti(),
                        rpdu: RpMessage::Ack {
                            reference: self.rp_ref,
                        },
                    },
                );
                MachineStatus::Ok
            }

            sipkey::DIALOG_FAIL => {
                info!("sending RPError in CPData");
                send_sms(
                    ctx,
                    L3Message::CpData {
                        ti: ctx.l3_ti(),
                        rpdu: RpMessage::Error {
                            reference: self.rp_ref,
                            cause: RP_CAUSE_INTERWORKING,
                        },
                    },
                );
                MachineStatus::Ok
            }

            key::SMS_CP_ACK => {
                ctx.timer_stop(TimerId::TR1M);
                ctx.svc
                    .counters
                    .sms_mo_complete
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                // The subscriber is identified: attaching here lets any
                // queued MT work start on this same channel.
                let imsi = ctx.inner.subscriber.imsi.clone();
                if !imsi.is_empty() {
                    ctx.svc.mm.attach_by_imsi(ctx.svc, ctx.mmc, &imsi);
                }
                MachineStatus::QuitTran(TermCause::local(L3Cause::SmsSuccess))
            }

            other => ctx.unexpected_state(self.name(), other),
        }
    }
}

/// Mobile-terminated short message.
pub struct MtSmsMachine {
    rp_ref: u8,
}

impl MtSmsMachine {
    pub fn new() -> MtSmsMachine {
        MtSmsMachine { rp_ref: 0 }
    }

    /// Build the RP-DATA for the queued message. None when the content
    /// type is unusable.
    fn build_rp_data(&self, ctx: &ProcCtx<'_>) -> Option<RpMessage> {
        let content_type = &ctx.inner.content_type;
        let smsc = ctx.svc.config.sms_fake_src_smsc();
        let tpdu = if content_type.starts_with("text/plain") {
            Tpdu::Deliver {
                orig: ctx.inner.calling.clone().unwrap_or_default(),
                text: ctx.inner.message_body.clone(),
            }
        } else if content_type.starts_with("application/vnd.3gpp.sms") {
            if !ctx
                .inner
                .message_body
                .chars()
                .all(|c| c.is_ascii_hexdigit())
            {
                warn!("3GPP SMS payload is not hex");
                return None;
            }
            Tpdu::RawHex(ctx.inner.message_body.clone())
        } else {
            warn!(%content_type, "unsupported content type for MT-SMS");
            return None;
        };
        Some(RpMessage::Data {
            reference: self.rp_ref,
            smsc,
            tpdu,
        })
    }

    fn reply_sip(&self, ctx: &ProcCtx<'_>, code: u16, reason: &str) {
        match ctx.dialog() {
            Some(d) => d.reply(code, reason),
            // Welcome messages and CLI-originated SMS have no dialog.
            None => debug!("no dialog for MT-SMS outcome"),
        }
    }
}

impl Procedure for MtSmsMachine {
    fn name(&self) -> &'static str {
        "MtSmsMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            0 => {
                // The SIP side may have died while this waited in the
                // MMUser queue.
                if let Some(d) = ctx.dialog() {
                    if d.is_finished() {
                        return MachineStatus::QuitTran(TermCause::local(L3Cause::SmsTimeout));
                    }
                }
                ctx.timer_start(TimerId::TR2M, TimerAction::AbortTran);
                let ti = ctx.mmc.next_ti();
                ctx.inner.l3_ti = Some(ti);
                ctx.set_gsm_state(CallState::SmsDelivering);
                self.rp_ref = rand::thread_rng().r#gen();
                // Bring up ABM on the SMS SAPI; the ESTABLISH comes back
                // up when LAPDm is ready (immediately if already up).
                let sapi = sms_sapi(ctx);
                ctx.l3sendp(crate::l3::Primitive::EstablishRequest, sapi);
                MachineStatus::Ok
            }

            key::EST_INDICATION | key::EST_CONFIRM => {
                let ti = ctx.l3_ti();
                let Some(rp_data) = self.build_rp_data(ctx) else {
                    send_sms(
                        ctx,
                        L3Message::CpData {
                            ti,
                            rpdu: RpMessage::Error {
                                reference: self.rp_ref,
                                cause: RP_CAUSE_SEMANTIC,
                            },
                        },
                    );
                    self.reply_sip(ctx, 400, "Bad Request");
                    return MachineStatus::QuitTran(TermCause::local(L3Cause::SmsError));
                };
                info!(ti, "delivering MT-SMS");
                send_sms(ctx, L3Message::CpData { ti, rpdu: rp_data });
                MachineStatus::Ok
            }

            // CP-ACK: the handset took the CP-DATA; now waiting for its
            // RP-level answer.
            key::SMS_CP_ACK => MachineStatus::Ok,

            key::SMS_CP_DATA => {
                ctx.timer_stop(TimerId::TR2M);
                let success = matches!(
                    input.message(),
                    Some(L3Message::CpData {
                        rpdu: RpMessage::Ack { .. },
                        ..
                    })
                );
                if !success {
                    warn!("unexpected RPDU in MT-SMS ack phase");
                }
                send_sms(ctx, L3Message::CpAck { ti: ctx.l3_ti() });
                if success {
                    ctx.svc
                        .counters
                        .sms_mt_complete
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    self.reply_sip(ctx, 200, "OK");
                    MachineStatus::QuitTran(TermCause::local(L3Cause::SmsSuccess))
                } else {
                    self.reply_sip(ctx, 400, "Bad Request");
                    MachineStatus::QuitTran(TermCause::local(L3Cause::SmsError))
                }
            }

            key::SMS_CP_ERROR => {
                ctx.timer_stop(TimerId::TR2M);
                self.reply_sip(ctx, 400, "Bad Request");
                MachineStatus::QuitTran(TermCause::local(L3Cause::SmsError))
            }

            other => ctx.unexpected_state(self.name(), other),
        }
    }
}
