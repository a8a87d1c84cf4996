//! Termination cause taxonomy.
//!
//! A transaction can be torn down for reasons that live in several distinct
//! GSM cause spaces (CC causes from 04.08 10.5.4.11, MM reject causes from
//! 10.5.3.6, RR causes from 10.5.2.31, BSSMAP causes) plus reasons that
//! exist in none of them, like "the handset never answered the page".
//! [`L3Cause`] unifies them; [`TermCause`] records who ended the transaction
//! and carries the mapping to the SIP side.

use std::fmt;

/// Unified transaction-termination cause space.
///
/// The numeric values of the CC subset match GSM 04.08 10.5.4.11 so they can
/// be placed in a Cause IE directly; local extensions use values above 0x100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum L3Cause {
    // CC causes, GSM 04.08 10.5.4.11.
    UnassignedNumber = 1,
    NoRouteToDestination = 3,
    OperatorDeterminedBarring = 8,
    NormalCallClearing = 16,
    UserBusy = 17,
    NoUserResponding = 18,
    UserAlerting = 19,
    CallRejected = 21,
    NumberChanged = 22,
    DestinationOutOfOrder = 27,
    InvalidNumberFormat = 28,
    NormalUnspecified = 31,
    NoChannelAvailable = 34,
    NetworkOutOfOrder = 38,
    TemporaryFailure = 41,
    SwitchingEquipmentCongestion = 42,
    RequestedChannelNotAvailable = 44,
    ResourceUnavailable = 47,
    ServiceOrOptionNotAvailable = 63,
    ServiceOrOptionNotImplemented = 79,
    InvalidTransactionIdentifier = 81,
    IncompatibleDestination = 88,
    SemanticallyIncorrectMessage = 95,
    InvalidMandatoryInformation = 96,
    MessageTypeNotImplemented = 97,
    MessageTypeNotCompatibleWithProtocolState = 98,
    ProtocolErrorUnspecified = 111,
    InterworkingUnspecified = 127,

    // MM reject causes, GSM 04.08 10.5.3.6 (offset into a private range so
    // the discriminants stay unique; `cc_equivalent` maps them back).
    ImsiUnknownInHlr = 0x202,
    IllegalMs = 0x203,
    ImsiUnknownInVlr = 0x204,
    ImeiNotAccepted = 0x205,
    IllegalMe = 0x206,
    PlmnNotAllowed = 0x20B,
    LocationAreaNotAllowed = 0x20C,
    RoamingNotAllowedInLa = 0x20D,
    NetworkFailure = 0x211,
    Congestion = 0x216,
    ServiceOptionNotSupported = 0x220,
    RequestedServiceOptionNotSubscribed = 0x221,
    ServiceOptionTemporarilyOutOfOrder = 0x222,
    CallCannotBeIdentified = 0x226,

    // Local extensions: causes that exist in no single GSM list.
    NoPagingResponse = 0x301,
    NoTransactionExpected = 0x302,
    OperatorIntervention = 0x303,
    PreemptiveRelease = 0x304,
    RadioInterfaceFailure = 0x305,
    Layer2Error = 0x306,
    L3InternalError = 0x307,
    SipInternalError = 0x308,
    ImsiDetached = 0x309,
    ChannelAssignmentFailure = 0x30A,
    MissingCalledPartyNumber = 0x30B,
    SmsSuccess = 0x30C,
    SmsError = 0x30D,
    SmsTimeout = 0x30E,
    MmSuccess = 0x30F,
    HandoverOutbound = 0x310,
    HandoverError = 0x311,
    Distance = 0x312,
    TimerExpired = 0x313,
}

impl L3Cause {
    /// The nearest CC cause (04.08 10.5.4.11) for putting on the wire in a
    /// Disconnect / Release / ReleaseComplete Cause IE.
    pub fn cc_equivalent(self) -> L3Cause {
        use L3Cause::*;
        match self {
            // CC causes map to themselves.
            c if (c as u32) < 0x100 => c,
            ImsiUnknownInHlr | ImsiUnknownInVlr | IllegalMs | IllegalMe | ImeiNotAccepted => {
                CallRejected
            }
            PlmnNotAllowed | LocationAreaNotAllowed | RoamingNotAllowedInLa => CallRejected,
            NetworkFailure => NetworkOutOfOrder,
            Congestion | NoChannelAvailable => SwitchingEquipmentCongestion,
            ServiceOptionNotSupported | RequestedServiceOptionNotSubscribed => {
                ServiceOrOptionNotAvailable
            }
            ServiceOptionTemporarilyOutOfOrder => TemporaryFailure,
            CallCannotBeIdentified => InvalidTransactionIdentifier,
            NoPagingResponse | NoUserResponding => NoUserResponding,
            NoTransactionExpected | MmSuccess | SmsSuccess => NormalCallClearing,
            OperatorIntervention | PreemptiveRelease => NormalUnspecified,
            RadioInterfaceFailure | Layer2Error | Distance => DestinationOutOfOrder,
            L3InternalError | SipInternalError | SmsError | SmsTimeout | HandoverError
            | TimerExpired => TemporaryFailure,
            ImsiDetached => NormalCallClearing,
            ChannelAssignmentFailure => RequestedChannelNotAvailable,
            MissingCalledPartyNumber => InvalidNumberFormat,
            HandoverOutbound => NormalCallClearing,
            _ => InterworkingUnspecified,
        }
    }

    /// The nearest SIP status code and reason phrase.
    pub fn sip_equivalent(self) -> (u16, &'static str) {
        use L3Cause::*;
        match self {
            NormalCallClearing | NormalUnspecified | MmSuccess | SmsSuccess
            | NoTransactionExpected | ImsiDetached | HandoverOutbound => (200, "OK"),
            UserBusy => (486, "Busy Here"),
            CallRejected => (603, "Decline"),
            UnassignedNumber | NoRouteToDestination | InvalidNumberFormat
            | MissingCalledPartyNumber => (404, "Not Found"),
            // The handset did not answer the page; 504 rather than 480
            // because we do not know whether the user is at this BTS.
            NoPagingResponse => (504, "Server Time-out"),
            NoUserResponding => (480, "Temporarily Unavailable"),
            Congestion | NoChannelAvailable | SwitchingEquipmentCongestion
            | ChannelAssignmentFailure => (503, "Service Unavailable"),
            OperatorIntervention | PreemptiveRelease => (487, "Request Terminated"),
            RadioInterfaceFailure | Layer2Error | Distance => (480, "Temporarily Unavailable"),
            SmsError | SmsTimeout => (400, "Bad Request"),
            _ => (480, "Temporarily Unavailable"),
        }
    }

    /// Is this one of the "successful conclusion" causes?
    pub fn is_success(self) -> bool {
        matches!(
            self,
            L3Cause::MmSuccess
                | L3Cause::SmsSuccess
                | L3Cause::NormalCallClearing
                | L3Cause::HandoverOutbound
        )
    }
}

impl fmt::Display for L3Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// MM reject causes are a subset of [`L3Cause`]; the alias documents intent
/// at call sites that put them in LocationUpdatingReject / CMServiceReject.
pub type RejectCause = L3Cause;

/// RR cause values, GSM 04.08 10.5.2.31. Used when releasing a whole radio
/// channel, as opposed to one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RrCause {
    NormalEvent = 0x00,
    Unspecified = 0x01,
    ChannelUnacceptable = 0x02,
    TimerExpired = 0x03,
    NoActivityOnTheRadio = 0x04,
    PreemptiveRelease = 0x05,
    HandoverImpossible = 0x08,
    ChannelModeUnacceptable = 0x09,
    FrequencyNotImplemented = 0x0A,
    CallAlreadyCleared = 0x41,
    MessageTypeNotCompatibleWithProtocolState = 0x62,
    ProtocolErrorUnspecified = 0x6F,
}

/// Which side of the BTS ended the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// The final disposition of a transaction.
///
/// Carries the unified cause, the side that instigated the teardown, and, if
/// the remote (SIP) side ended it, the SIP status it used. Every client that
/// cancels a transaction must supply one, so the CDR and the messages sent
/// to the handset and the SIP peer all agree.
#[derive(Debug, Clone)]
pub struct TermCause {
    cause: L3Cause,
    instigator: Side,
    sip_code: u16,
    sip_reason: String,
}

impl TermCause {
    /// A termination decided on this BTS. The SIP code is derived.
    pub fn local(cause: L3Cause) -> TermCause {
        TermCause {
            cause,
            instigator: Side::Local,
            sip_code: 0,
            sip_reason: String::new(),
        }
    }

    /// A termination instigated by the SIP peer (BYE, CANCEL, error
    /// response). The SIP code is kept for the CDR but never sent back out.
    pub fn remote(cause: L3Cause, sip_code: u16, sip_reason: impl Into<String>) -> TermCause {
        TermCause {
            cause,
            instigator: Side::Remote,
            sip_code,
            sip_reason: sip_reason.into(),
        }
    }

    pub fn cause(&self) -> L3Cause {
        self.cause
    }

    pub fn instigator(&self) -> Side {
        self.instigator
    }

    /// Nearest CC cause for the Cause IE of a CC clearing message.
    pub fn cc_cause(&self) -> L3Cause {
        self.cause.cc_equivalent()
    }

    /// The SIP status code and reason to use toward the SIP peer.
    pub fn sip_code_and_reason(&self) -> (u16, String) {
        if self.instigator == Side::Remote && self.sip_code != 0 {
            (self.sip_code, self.sip_reason.clone())
        } else {
            let (code, reason) = self.cause.sip_equivalent();
            (code, reason.to_string())
        }
    }

    /// Render a SIP `Reason:` header carrying the GSM cause.
    pub fn sip_reason_header(&self) -> String {
        let (code, reason) = self.sip_code_and_reason();
        format!(
            "Reason: Q.850;cause={};text=\"{}\";sip-code={}",
            self.cause.cc_equivalent() as u32,
            reason,
            code
        )
    }
}

impl fmt::Display for TermCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.instigator, self.cause)
    }
}

/// Map a registrar SIP response code to the MM reject cause sent to the
/// handset. The 401-without-challenge and 404 entries are operator
/// configurable; the caller passes the configured values in.
pub fn registrar_reject_cause(
    sip_code: u16,
    unprovisioned_cause: RejectCause,
    not_found_cause: RejectCause,
) -> RejectCause {
    match sip_code {
        // Unrecoverable errors in a registrar message.
        400 => L3Cause::NetworkFailure,
        // The SIP nomenclature for 401 and 404 is exactly reversed from
        // what the registrar means: 401 without a challenge says the IMSI
        // is not in the database at all.
        401 => unprovisioned_cause,
        403 => L3Cause::LocationAreaNotAllowed,
        404 => not_found_cause,
        424 => L3Cause::RoamingNotAllowedInLa,
        504 => L3Cause::Congestion,
        603 => L3Cause::ImsiUnknownInVlr,
        604 => L3Cause::ImsiUnknownInHlr,
        _ => L3Cause::NetworkFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cc_mapping_is_identity_on_cc_causes() {
        assert_eq!(
            L3Cause::NormalCallClearing.cc_equivalent(),
            L3Cause::NormalCallClearing
        );
        assert_eq!(L3Cause::UserBusy.cc_equivalent(), L3Cause::UserBusy);
    }

    #[test]
    fn local_cause_derives_sip_code() {
        let tc = TermCause::local(L3Cause::NoPagingResponse);
        let (code, _) = tc.sip_code_and_reason();
        assert_eq!(code, 504);
    }

    #[test]
    fn remote_cause_preserves_sip_code() {
        let tc = TermCause::remote(L3Cause::CallRejected, 487, "Request Terminated");
        let (code, reason) = tc.sip_code_and_reason();
        assert_eq!(code, 487);
        assert_eq!(reason, "Request Terminated");
    }

    #[test]
    fn registrar_mapping_table() {
        let unprov = L3Cause::ImsiUnknownInHlr;
        let notfound = L3Cause::IllegalMs;
        assert_eq!(
            registrar_reject_cause(403, unprov, notfound),
            L3Cause::LocationAreaNotAllowed
        );
        assert_eq!(registrar_reject_cause(401, unprov, notfound), unprov);
        assert_eq!(registrar_reject_cause(404, unprov, notfound), notfound);
        assert_eq!(
            registrar_reject_cause(604, unprov, notfound),
            L3Cause::ImsiUnknownInHlr
        );
        assert_eq!(
            registrar_reject_cause(599, unprov, notfound),
            L3Cause::NetworkFailure
        );
    }
}
