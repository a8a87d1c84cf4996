//! Location updating: identify, authenticate against the registrar,
//! optionally cipher, optionally reallocate the TMSI, send the welcome
//! message.
//!
//! The procedure is a stack of sub-machines:
//! `LuStart -> (Register) -> LuAuthentication -> (Register) -> LuFinish`,
//! with `LuNetworkFailure` as a dead-end branch. The half-computed state
//! lives in [`MmSharedData`] on the transaction, because it must survive
//! sub-machine transitions: everything is saved up and written to the TMSI
//! table only once the handset authenticates.

use crate::cause::{registrar_reject_cause, L3Cause, RejectCause, TermCause};
use crate::identity::MobileIdentity;
use crate::l3::{key, DispatchKey, IdentityType, L3Message, LocationUpdateType};
use crate::mm::{MmContext, TranSlot};
use crate::services::Services;
use crate::sip::RegisterOutcome;
use crate::sm::{MachineStatus, ProcCtx, ProcInput, Procedure};
use crate::timers::{TimerAction, TimerId};
use crate::tmsi::TmsiRecord;
use crate::tran::Transaction;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the TMSI the handset presented stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmsiStatus {
    /// No TMSI involved.
    None,
    /// The MS sent a TMSI found in the table but not yet authenticated.
    Provisional,
    /// Provisional TMSI that authenticated ok.
    Authenticated,
    /// The MS sent an IMSI that already has a table row without a TMSI.
    NotAssigned,
    /// The TMSI failed authentication (possible collision).
    Failed,
    /// We allocated a fresh TMSI for this MS.
    New,
}

/// Registrar conversation result, kept across sub-machines.
#[derive(Debug, Clone, Default)]
pub struct RegistrationResult {
    pub status: RegStatus,
    pub reject_cause: Option<RejectCause>,
    pub sip_code: u16,
    pub rand: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegStatus {
    #[default]
    Uninitialized,
    Error,
    Challenge,
    Success,
    Fail,
}

impl RegistrationResult {
    pub fn is_success(&self) -> bool {
        self.status == RegStatus::Success
    }
}

/// Shared scratch state for the location-update sub-machines.
#[derive(Debug, Clone, Default)]
pub struct MmSharedData {
    pub lu_type: Option<LocationUpdateType>,
    pub lu_lai: String,
    /// The TMSI the MS sent, kept for reporting even when the LAI is
    /// foreign.
    pub old_tmsi: Option<u32>,
    pub assigned_tmsi: Option<u32>,
    pub tmsi_status: Option<TmsiStatus>,
    /// What identity we last asked the MS for.
    pub query_type: Option<IdentityType>,
    pub registration: RegistrationResult,
    /// We received or queried an IMSI (not registering by TMSI), so the
    /// optional IMEI query also applies.
    pub full_query: bool,
    /// Second overall attempt after a TMSI-collision authentication
    /// failure.
    pub second_attempt: bool,
    pub expecting_tmsi_realloc: bool,
    /// Fields bound for the TMSI table once the MS authenticates.
    pub kc: String,
    pub associated_uri: String,
    pub asserted_identity: String,
}

impl MmSharedData {
    fn tmsi_status(&self) -> TmsiStatus {
        self.tmsi_status.unwrap_or(TmsiStatus::None)
    }

    fn set_tmsi(&mut self, tmsi: u32, status: TmsiStatus) {
        self.assigned_tmsi = Some(tmsi);
        self.tmsi_status = Some(status);
    }

    fn is_imsi_attach(&self) -> bool {
        self.lu_type == Some(LocationUpdateType::ImsiAttach)
    }

    /// Any attach type except periodic updating.
    fn is_initial_attach(&self) -> bool {
        matches!(
            self.lu_type,
            Some(LocationUpdateType::ImsiAttach) | Some(LocationUpdateType::Normal)
        )
    }

    fn needs_tmsi_assignment(&self) -> bool {
        matches!(
            self.tmsi_status(),
            TmsiStatus::New | TmsiStatus::NotAssigned
        )
    }
}

fn ludata<'a>(ctx: &'a mut ProcCtx<'_>) -> &'a mut MmSharedData {
    ctx.inner.mm_data.get_or_insert_with(MmSharedData::default)
}

/// Does open registration apply to this IMSI? Pattern match minus the
/// reject pattern.
fn open_registration(ctx: &ProcCtx<'_>, imsi: &str) -> bool {
    let Some(accept) = ctx.svc.config.open_registration() else {
        debug!("open registration not enabled");
        return false;
    };
    if !accept.is_match(imsi) {
        return false;
    }
    if let Some(reject) = ctx.svc.config.open_registration_reject() {
        if reject.is_match(imsi) {
            debug!(imsi, "open registration denied by reject pattern");
            return false;
        }
    }
    true
}

/// Registrar unreachable: does the configured fail mode let the MS in?
fn fail_open(ctx: &ProcCtx<'_>, imsi: &str) -> bool {
    use crate::config::LurFailMode::*;
    match ctx.svc.config.lur_fail_mode() {
        Fail => false,
        Open => open_registration(ctx, imsi),
        Normal => true,
    }
}

/// Entry point from the channel loop: a LocationUpdatingRequest starts a
/// new MM transaction.
pub fn start_lur(svc: &Services, mmc: &Arc<MmContext>, msg: &L3Message) {
    if mmc.get_tran(TranSlot::Mm).is_some() {
        warn!("LocationUpdatingRequest while an MM procedure is already running, dropped");
        return;
    }
    let tran = Transaction::new_momm(mmc);
    let outcome = tran.lock_and_start(svc, Box::new(LuStart::new()), Some(msg));
    crate::dispatch::finish_start(svc, mmc, outcome);
}

// Private resume states, shared across the LU sub-machines where noted.
const ST_REGISTER1_RESPONSE: DispatchKey = 0x10;
const ST_REGISTER2_RESPONSE: DispatchKey = 0x11;
const ST_SECOND_ATTEMPT: DispatchKey = 0x12;
const ST_SEND_RESPONSE: DispatchKey = 0x13;
const ST_POST_ACCEPT: DispatchKey = 0x14;

/// Initial identification phase.
pub struct LuStart;

impl LuStart {
    pub fn new() -> LuStart {
        LuStart
    }

    /// We have an IMSI; maybe also collect the IMEI before registering.
    fn have_imsi(&self, ctx: &mut ProcCtx<'_>) -> MachineStatus {
        let imsi = ctx.inner.subscriber.imsi.clone();
        let full_query = ludata(ctx).full_query;
        if full_query
            && ctx.svc.config.lur_query_imei()
            && ctx.inner.subscriber.imei.is_empty()
            && ctx
                .svc
                .tmsi
                .get(&imsi)
                .map(|r| r.imei.is_empty())
                .unwrap_or(true)
        {
            ludata(ctx).query_type = Some(IdentityType::Imei);
            ctx.timer_start(TimerId::T3270, TimerAction::AbortChannel);
            ctx.l3sendm(L3Message::IdentityRequest {
                id_type: IdentityType::Imei,
            });
            return MachineStatus::Ok;
        }
        self.have_ids(ctx)
    }

    /// Identification complete: check the auth cache, then register.
    fn have_ids(&self, ctx: &mut ProcCtx<'_>) -> MachineStatus {
        let imsi = ctx.inner.subscriber.imsi.clone();
        // A fresh unauthorized verdict skips the registrar round trip.
        if let Some(reject) = ctx.svc.tmsi.cached_reject(&imsi) {
            info!(imsi, ?reject, "re-registration within auth-cache window, using cached reject");
            let data = ludata(ctx);
            data.registration.status = RegStatus::Fail;
            data.registration.reject_cause = Some(reject);
            return ctx.machine_start(Box::new(LuFinish::new()));
        }
        ctx.machine_push(Box::new(RegisterMachine::new(None)), ST_REGISTER1_RESPONSE)
    }
}

impl Procedure for LuStart {
    fn name(&self) -> &'static str {
        "LuStart"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            // The start state receives the LocationUpdatingRequest itself.
            key::MM_LOCATION_UPDATING_REQUEST => {
                let Some(L3Message::LocationUpdatingRequest {
                    lu_type,
                    lai,
                    mobile_id,
                }) = input.message().cloned()
                else {
                    return ctx.unexpected_state(self.name(), state);
                };
                info!(?lu_type, lai, %mobile_id, "location updating request");
                {
                    let data = ludata(ctx);
                    data.lu_type = Some(lu_type);
                    data.lu_lai = lai.clone();
                }
                match mobile_id {
                    MobileIdentity::Imsi(imsi) => {
                        ctx.inner.subscriber.imsi = imsi;
                        ludata(ctx).full_query = true;
                        self.have_imsi(ctx)
                    }
                    MobileIdentity::Tmsi(tmsi) => {
                        ludata(ctx).old_tmsi = Some(tmsi);
                        let same_lai = lai == ctx.svc.config.lai();
                        if same_lai {
                            if let Some(row) = ctx.svc.tmsi.by_tmsi(tmsi) {
                                ctx.inner.subscriber.imsi = row.imsi.clone();
                                ludata(ctx).set_tmsi(tmsi, TmsiStatus::Provisional);
                                return self.have_imsi(ctx);
                            }
                        }
                        // Unknown (or foreign-area) TMSI: ask for the IMSI.
                        ludata(ctx).full_query = true;
                        self.query_identity(ctx, IdentityType::Imsi)
                    }
                    MobileIdentity::Imei(imei) => {
                        ctx.inner.subscriber.imei = imei;
                        self.query_identity(ctx, IdentityType::Imsi)
                    }
                    MobileIdentity::None => {
                        ludata(ctx).full_query = true;
                        self.query_identity(ctx, IdentityType::Imsi)
                    }
                }
            }

            key::MM_IDENTITY_RESPONSE => {
                let Some(L3Message::IdentityResponse { mobile_id }) = input.message() else {
                    return ctx.unexpected_state(self.name(), state);
                };
                // Only advance when the response matches what we asked
                // for; T3270 keeps running otherwise.
                let expected = ludata(ctx).query_type;
                match (expected, mobile_id) {
                    (Some(IdentityType::Imsi), MobileIdentity::Imsi(imsi)) => {
                        ctx.timer_stop(TimerId::T3270);
                        ctx.inner.subscriber.imsi = imsi.clone();
                        self.have_imsi(ctx)
                    }
                    (Some(IdentityType::Imei), MobileIdentity::Imei(imei)) => {
                        ctx.timer_stop(TimerId::T3270);
                        ctx.inner.subscriber.imei = imei.clone();
                        ctx.svc
                            .tmsi
                            .set_imei(&ctx.inner.subscriber.imsi, imei);
                        self.have_ids(ctx)
                    }
                    _ => {
                        debug!(?expected, %mobile_id, "identity response does not match query");
                        MachineStatus::Ok
                    }
                }
            }

            // TMSI collision recovery: re-identify by IMSI and retry.
            ST_SECOND_ATTEMPT => self.query_identity(ctx, IdentityType::Imsi),

            ST_REGISTER1_RESPONSE => {
                let status = ludata(ctx).registration.status;
                match status {
                    RegStatus::Challenge => ctx.machine_start(Box::new(LuAuthentication::new())),
                    RegStatus::Success | RegStatus::Fail => {
                        ctx.machine_start(Box::new(LuFinish::new()))
                    }
                    _ => ctx.machine_start(Box::new(LuNetworkFailure)),
                }
            }

            other => ctx.unexpected_state(self.name(), other),
        }
    }
}

impl LuStart {
    fn query_identity(&self, ctx: &mut ProcCtx<'_>, id_type: IdentityType) -> MachineStatus {
        ludata(ctx).query_type = Some(id_type);
        ctx.timer_start(TimerId::T3270, TimerAction::AbortChannel);
        ctx.l3sendm(L3Message::IdentityRequest { id_type });
        MachineStatus::Ok
    }
}

/// Reusable sub-machine: one REGISTER toward the registrar, with or
/// without an SRES. The outcome lands in the shared registration result.
pub struct RegisterMachine {
    sres: Option<String>,
}

impl RegisterMachine {
    pub fn new(sres: Option<String>) -> RegisterMachine {
        RegisterMachine { sres }
    }
}

impl Procedure for RegisterMachine {
    fn name(&self) -> &'static str {
        "RegisterMachine"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, _input: ProcInput<'_>)
        -> MachineStatus {
        if state != 0 {
            return ctx.unexpected_state(self.name(), state);
        }
        let imsi = ctx.inner.subscriber.imsi.clone();
        let outcome = ctx.svc.registrar.register(&imsi, self.sres.as_deref());
        debug!(imsi, ?outcome, "registrar answered");
        let unprovisioned = ctx.svc.config.lur_unprovisioned_reject_cause();
        let not_found = ctx.svc.config.lur_404_reject_cause();
        let data = ludata(ctx);
        match outcome {
            RegisterOutcome::Success {
                kc,
                associated_uri,
                asserted_identity,
            } => {
                data.registration.status = RegStatus::Success;
                data.kc = kc;
                data.associated_uri = associated_uri;
                data.asserted_identity = asserted_identity;
            }
            RegisterOutcome::Challenge { rand } => {
                data.registration.status = RegStatus::Challenge;
                data.registration.rand = rand;
            }
            RegisterOutcome::Fail {
                sip_code,
                reject_cause,
            } => {
                data.registration.status = RegStatus::Fail;
                data.registration.sip_code = sip_code;
                // An explicit cause from the registrar's private header
                // overrides the SIP-code mapping.
                data.registration.reject_cause = Some(reject_cause.unwrap_or_else(|| {
                    registrar_reject_cause(sip_code, unprovisioned, not_found)
                }));
            }
            RegisterOutcome::Error => {
                data.registration.status = RegStatus::Error;
            }
        }
        MachineStatus::PopMachine
    }
}

/// Challenge phase: RAND out, SRES back, second REGISTER.
pub struct LuAuthentication;

impl LuAuthentication {
    pub fn new() -> LuAuthentication {
        LuAuthentication
    }
}

impl Procedure for LuAuthentication {
    fn name(&self) -> &'static str {
        "LuAuthentication"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            0 => {
                // 128-bit RAND as 32 hex digits; registrars love dashes.
                let rand: String = ludata(ctx)
                    .registration
                    .rand
                    .chars()
                    .filter(|c| *c != '-')
                    .collect();
                if rand.len() != 32 || !rand.chars().all(|c| c.is_ascii_hexdigit()) {
                    warn!(rand, "malformed RAND from registrar");
                    return ctx.machine_start(Box::new(LuNetworkFailure));
                }
                ctx.timer_start(TimerId::T3260, TimerAction::AbortChannel);
                ctx.l3sendm(L3Message::AuthenticationRequest { rand });
                MachineStatus::Ok
            }

            key::MM_AUTHENTICATION_RESPONSE => {
                let Some(L3Message::AuthenticationResponse { sres }) = input.message() else {
                    return ctx.unexpected_state(self.name(), state);
                };
                ctx.timer_stop(TimerId::T3260);
                ctx.machine_push(
                    Box::new(RegisterMachine::new(Some(sres.clone()))),
                    ST_REGISTER2_RESPONSE,
                )
            }

            ST_REGISTER2_RESPONSE => {
                let (status, tmsi_status, second) = {
                    let data = ludata(ctx);
                    (
                        data.registration.status,
                        data.tmsi_status(),
                        data.second_attempt,
                    )
                };
                match status {
                    RegStatus::Success => {
                        ludata(ctx).tmsi_status = match tmsi_status {
                            TmsiStatus::Provisional => Some(TmsiStatus::Authenticated),
                            other => Some(other),
                        };
                        ctx.machine_start(Box::new(LuFinish::new()))
                    }
                    RegStatus::Fail if !second && tmsi_status == TmsiStatus::Provisional => {
                        // The SRES was wrong for the IMSI the table mapped
                        // this TMSI to: possibly a TMSI collision. Query
                        // the real IMSI and retry once.
                        info!("authentication failed on provisional TMSI, re-identifying");
                        {
                            let data = ludata(ctx);
                            data.second_attempt = true;
                            data.full_query = true;
                            data.tmsi_status = Some(TmsiStatus::Failed);
                            data.assigned_tmsi = None;
                            data.registration = RegistrationResult::default();
                        }
                        ctx.machine_start_at(Box::new(LuStart::new()), ST_SECOND_ATTEMPT)
                    }
                    RegStatus::Fail => ctx.machine_start(Box::new(LuFinish::new())),
                    _ => ctx.machine_start(Box::new(LuNetworkFailure)),
                }
            }

            other => ctx.unexpected_state(self.name(), other),
        }
    }
}

/// Overall authorization verdict computed by LuFinish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LuAuthorization {
    Authorized,
    FailOpen,
    OpenRegistration,
    Unauthorized,
}

/// Final phase: classmark and cipher options, the accept/reject, the TMSI
/// reallocation, and the welcome message.
pub struct LuFinish {
    authorization: Option<LuAuthorization>,
}

impl LuFinish {
    pub fn new() -> LuFinish {
        LuFinish {
            authorization: None,
        }
    }

    fn compute_authorization(&mut self, ctx: &mut ProcCtx<'_>) -> (LuAuthorization, RejectCause) {
        let imsi = ctx.inner.subscriber.imsi.clone();
        let (status, reject) = {
            let data = ludata(ctx);
            (
                data.registration.status,
                data.registration
                    .reject_cause
                    .unwrap_or(L3Cause::NetworkFailure),
            )
        };
        let verdict = match status {
            RegStatus::Success => LuAuthorization::Authorized,
            RegStatus::Error => {
                if fail_open(ctx, &imsi) {
                    LuAuthorization::FailOpen
                } else {
                    LuAuthorization::Unauthorized
                }
            }
            _ => {
                if open_registration(ctx, &imsi) {
                    LuAuthorization::OpenRegistration
                } else {
                    LuAuthorization::Unauthorized
                }
            }
        };
        self.authorization = Some(verdict);
        (verdict, reject)
    }

    /// Start ciphering if configured and possible.
    fn maybe_start_cipher(&self, ctx: &mut ProcCtx<'_>) -> bool {
        if !ctx.svc.config.cipher_encrypt() {
            return false;
        }
        let imsi = ctx.inner.subscriber.imsi.clone();
        let kc = ludata(ctx).kc.clone();
        if kc.is_empty() {
            debug!("no Kc, not sending Ciphering Mode Command");
            return false;
        }
        ctx.svc.tmsi.set_kc(&imsi, &kc);
        match ctx.svc.tmsi.preferred_a5(&imsi) {
            Some(algo) => {
                ctx.l3sendm(L3Message::CipheringModeCommand { algo });
                true
            }
            None => {
                debug!(imsi, "A5/3 and A5/1 not supported: NOT sending Ciphering Mode Command");
                false
            }
        }
    }

    fn send_lu_response(&mut self, ctx: &mut ProcCtx<'_>) -> MachineStatus {
        let verdict = match self.authorization {
            Some(v) => v,
            None => self.compute_authorization(ctx).0,
        };
        let reject = ludata(ctx)
            .registration
            .reject_cause
            .unwrap_or(L3Cause::NetworkFailure);
        let imsi = ctx.inner.subscriber.imsi.clone();

        if verdict == LuAuthorization::Unauthorized {
            info!(imsi, ?reject, "location updating rejected");
            ctx.svc.tmsi.set_authorization(&imsi, false, Some(reject));
            ctx.l3sendm(L3Message::LocationUpdatingReject { cause: reject });
            send_welcome_message(ctx, "FailedRegistration");
            return MachineStatus::QuitTran(TermCause::local(reject));
        }

        // Authorized (or let in by policy): persist what we learned.
        let tmsi_known = ctx.svc.tmsi.get(&imsi).and_then(|r| r.tmsi);
        {
            let data = ludata(ctx);
            if data.tmsi_status.is_none() {
                data.tmsi_status = Some(match tmsi_known {
                    Some(t) => {
                        data.assigned_tmsi = Some(t);
                        TmsiStatus::NotAssigned
                    }
                    None => TmsiStatus::None,
                });
            }
        }
        let mut record = ctx.svc.tmsi.get(&imsi).unwrap_or_else(|| TmsiRecord {
            imsi: imsi.clone(),
            ..Default::default()
        });
        record.lai = ctx.svc.config.lai();
        record.authorized = true;
        record.reject_cause = None;
        record.kc = ludata(ctx).kc.clone();
        record.associated_uri = ludata(ctx).associated_uri.clone();
        record.asserted_identity = ludata(ctx).asserted_identity.clone();
        if !ctx.inner.subscriber.imei.is_empty() {
            record.imei = ctx.inner.subscriber.imei.clone();
        }
        ctx.svc.tmsi.put(record);
        ctx.svc.tmsi.set_authorization(&imsi, true, None);

        // A TMSI is allocated the first time this BTS sees the IMSI, and
        // after a collision recovery (the failed TMSI belongs to someone
        // else).
        let status_now = ludata(ctx).tmsi_status();
        if matches!(status_now, TmsiStatus::None | TmsiStatus::Failed) {
            let fresh = ctx.svc.tmsi.assign_tmsi(&imsi);
            ludata(ctx).set_tmsi(fresh, TmsiStatus::New);
        }
        let needs_assignment = ludata(ctx).needs_tmsi_assignment();

        if ludata(ctx).is_initial_attach() {
            let short_name = ctx.svc.config.short_name();
            if !short_name.is_empty() {
                ctx.l3sendm(L3Message::MmInformation { short_name });
            }
        }

        let new_tmsi = needs_assignment
            .then(|| ludata(ctx).assigned_tmsi)
            .flatten();
        info!(imsi, ?verdict, ?new_tmsi, "location updating accept");
        ctx.l3sendm(L3Message::LocationUpdatingAccept {
            lai: ctx.svc.config.lai(),
            new_tmsi,
        });
        if new_tmsi.is_some() {
            ludata(ctx).expecting_tmsi_realloc = true;
            ctx.timer_start_dur(
                TimerId::TMisc1,
                std::time::Duration::from_secs(5),
                TimerAction::State(ST_POST_ACCEPT),
            );
            MachineStatus::Ok
        } else {
            self.post_accept(ctx)
        }
    }

    fn post_accept(&mut self, ctx: &mut ProcCtx<'_>) -> MachineStatus {
        ctx.timer_stop(TimerId::TMisc1);
        let class = match self.authorization {
            Some(LuAuthorization::OpenRegistration) | Some(LuAuthorization::FailOpen) => {
                "OpenRegistration"
            }
            _ => "NormalRegistration",
        };
        send_welcome_message(ctx, class);
        let imsi = ctx.inner.subscriber.imsi.clone();
        ctx.svc.tmsi.touch(&imsi);
        // The subscriber is identified: attach so queued MT work starts.
        ctx.svc.mm.attach_by_imsi(ctx.svc, ctx.mmc, &imsi);
        MachineStatus::QuitTran(TermCause::local(L3Cause::MmSuccess))
    }
}

impl Procedure for LuFinish {
    fn name(&self) -> &'static str {
        "LuFinish"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus {
        match state {
            0 => {
                let (verdict, _) = self.compute_authorization(ctx);
                // Optional classmark query, only worth it for subscribers
                // we are letting in with ciphering in the picture.
                if verdict != LuAuthorization::Unauthorized
                    && ctx.svc.config.lur_query_classmark()
                {
                    ctx.timer_start_dur(
                        TimerId::TMisc1,
                        std::time::Duration::from_secs(2),
                        TimerAction::State(ST_SEND_RESPONSE),
                    );
                    ctx.l3sendm(L3Message::ClassmarkEnquiry);
                    return MachineStatus::Ok;
                }
                if verdict != LuAuthorization::Unauthorized {
                    self.maybe_start_cipher(ctx);
                }
                self.send_lu_response(ctx)
            }

            key::RR_CLASSMARK_CHANGE => {
                ctx.timer_stop(TimerId::TMisc1);
                if let Some(L3Message::ClassmarkChange { a5_support }) = input.message() {
                    let imsi = ctx.inner.subscriber.imsi.clone();
                    ctx.svc.tmsi.set_classmark(&imsi, *a5_support);
                }
                self.maybe_start_cipher(ctx);
                self.send_lu_response(ctx)
            }

            // Classmark never came; proceed without it.
            ST_SEND_RESPONSE => {
                self.maybe_start_cipher(ctx);
                self.send_lu_response(ctx)
            }

            // Tolerant of ciphering failure: completion is nice, not
            // required.
            key::RR_CIPHERING_MODE_COMPLETE => MachineStatus::Ok,

            key::MM_TMSI_REALLOC_COMPLETE => {
                if ludata(ctx).expecting_tmsi_realloc {
                    ludata(ctx).expecting_tmsi_realloc = false;
                    self.post_accept(ctx)
                } else {
                    ctx.unexpected_state(self.name(), state)
                }
            }

            // TMisc1 expiry: the reallocation complete never arrived.
            // Finish anyway; the assignment is recorded either way.
            ST_POST_ACCEPT => self.post_accept(ctx),

            other => ctx.unexpected_state(self.name(), other),
        }
    }
}

/// Dead-end branch for unusable registrar answers.
pub struct LuNetworkFailure;

impl Procedure for LuNetworkFailure {
    fn name(&self) -> &'static str {
        "LuNetworkFailure"
    }

    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, _input: ProcInput<'_>)
        -> MachineStatus {
        if state != 0 {
            return ctx.unexpected_state(self.name(), state);
        }
        ctx.l3sendm(L3Message::LocationUpdatingReject {
            cause: L3Cause::NetworkFailure,
        });
        MachineStatus::QuitTran(TermCause::local(L3Cause::NetworkFailure))
    }
}

/// Queue the registration message as an MT-SMS on this same channel.
///
/// Known limitation: some handsets reject the first SMS after a location
/// update with "protocol error unspecified"; there is no delivery-failure
/// retry here, the sent flag is recorded immediately.
fn send_welcome_message(ctx: &mut ProcCtx<'_>, class: &str) {
    use crate::config::RegistrationMessageFrequency as Freq;
    let imsi = ctx.inner.subscriber.imsi.clone();
    if imsi.is_empty() {
        return;
    }
    if ctx.svc.tmsi.get(&imsi).map(|r| r.welcome_sent).unwrap_or(0) != 0 {
        return;
    }
    match ctx.svc.config.registration_message_frequency() {
        Freq::Plmn => {
            // Assume some BTS in the PLMN already welcomed the subscriber
            // unless this is a fresh IMSI attach.
            if !ludata(ctx).is_imsi_attach() {
                ctx.svc.tmsi.set_welcome_sent(&imsi, 2);
                return;
            }
        }
        Freq::Normal => {
            if !ludata(ctx).is_initial_attach() {
                ctx.svc.tmsi.set_welcome_sent(&imsi, 2);
                return;
            }
        }
        Freq::First => {}
    }
    let Some((message, short_code)) = ctx.svc.config.welcome_message(class) else {
        return;
    };
    info!(imsi, class, "sending registration message");
    let body = format!("{} IMSI:{}", message, imsi);
    let tran = Transaction::new_mtsms(
        None,
        crate::identity::FullMobileId::from_imsi(imsi.clone()),
        short_code,
        body,
        "text/plain".to_string(),
    );
    // Deliver immediately on this channel rather than paging later: some
    // handsets ignore pages after certain reject causes.
    if ctx.mmc.get_tran(TranSlot::MtSms).is_none() {
        ctx.mmc.connect_tran(TranSlot::MtSms, &tran);
        ctx.svc.tmsi.set_welcome_sent(&imsi, 1);
        // The machine starts when the service loop notices the slot; the
        // MT-SMS establishment runs on the SMS SAPI.
        tran.lock_and_start(ctx.svc, crate::procedures::sms::mtsms_machine(), None);
    } else {
        ctx.svc.mm.add_mt(ctx.svc, tran);
        ctx.svc.tmsi.set_welcome_sent(&imsi, 1);
    }
}
