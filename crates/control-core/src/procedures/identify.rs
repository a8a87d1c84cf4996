//! Subscriber identification sub-procedure.
//!
//! Used by MO-SMS, MO calls and supplementary services to resolve the
//! mobile identity from the CM service request into an IMSI with a cached
//! authorization verdict. (Location updating identifies inline; it needs
//! finer control over the TMSI states.) The result lands in the
//! transaction's `identify_result` slot and the pusher resumes.

use crate::identity::MobileIdentity;
use crate::l3::{key, DispatchKey, IdentityType, L3Message};
use crate::sm::{MachineStatus, ProcCtx, ProcInput, Procedure};
use crate::timers::{TimerAction, TimerId};
use tracing::{info, warn};

pub struct IdentifyMachine {
    mobile_id: MobileIdentity,
}

impl IdentifyMachine {
    pub fn new(mobile_id: MobileIdentity) -> Box<IdentifyMachine> {
        Box::new(IdentifyMachine { mobile_id })
    }

    fn finish(&self, ctx: &mut ProcCtx<'_>, imsi: Option<String>, authorized: bool)
        -> MachineStatus {
        if let Some(imsi) = imsi {
            ctx.inner.subscriber.imsi = imsi;
        }
        ctx.inner.identify_result = Some(authorized);
        MachineStatus::PopMachine
    }
}

impl Procedure for IdentifyMachine {
    fn name(&self) -> &'static str {
        "IdentifyMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            // Start state: may finish immediately if already identified.
            0 => match self.mobile_id.clone() {
                MobileIdentity::Imsi(imsi) => {
                    let authorized = ctx.svc.tmsi.is_authorized(&imsi);
                    self.finish(ctx, Some(imsi), authorized)
                }
                MobileIdentity::Tmsi(tmsi) => {
                    if let Some(row) = ctx.svc.tmsi.by_tmsi(tmsi) {
                        // Use the authorization cached by the most recent
                        // location update on this BTS.
                        let authorized = row.authorized;
                        return self.finish(ctx, Some(row.imsi), authorized);
                    }
                    self.query_imsi(ctx)
                }
                _ => self.query_imsi(ctx),
            },
            key::MM_IDENTITY_RESPONSE => {
                ctx.timer_stop(TimerId::T3270);
                match input.message() {
                    Some(L3Message::IdentityResponse {
                        mobile_id: MobileIdentity::Imsi(imsi),
                    }) => {
                        let authorized = ctx.svc.tmsi.is_authorized(imsi);
                        self.finish(ctx, Some(imsi.clone()), authorized)
                    }
                    other => {
                        warn!(?other, "requested an IMSI but got something else");
                        self.finish(ctx, None, false)
                    }
                }
            }
            other => ctx.unexpected_state(self.name(), other),
        }
    }
}

impl IdentifyMachine {
    /// No IMSI and no usable TMSI: ask the handset. A compliant MS should
    /// have done a location update first, so this is rare (or the TMSI
    /// table was lost).
    fn query_imsi(&self, ctx: &mut ProcCtx<'_>) -> MachineStatus {
        info!("no IMSI or known TMSI, requesting IMSI");
        ctx.timer_start(TimerId::T3270, TimerAction::AbortChannel);
        ctx.l3sendm(L3Message::IdentityRequest {
            id_type: IdentityType::Imsi,
        });
        MachineStatus::Ok
    }
}
