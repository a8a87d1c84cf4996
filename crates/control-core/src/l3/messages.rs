//! Decoded Layer 3 messages.
//!
//! One tagged union per the control layer's needs: each variant carries the
//! information elements the procedures consume or emit, nothing more. MTI
//! values are the real GSM 04.08 / 04.11 codes so the dispatch keys and the
//! Call State IE values can go on the wire unchanged.

use super::{l3_case, DispatchKey, L3Pd};
use crate::cause::{L3Cause, RejectCause, RrCause};
use crate::codec::CodecSet;
use crate::identity::MobileIdentity;
use std::fmt;

/// CM service types carried in a CMServiceRequest, GSM 04.08 10.5.3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmServiceType {
    MobileOriginatedCall = 1,
    EmergencyCall = 2,
    ShortMessage = 4,
    SupplementaryService = 8,
}

/// Location updating type, GSM 04.08 10.5.3.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationUpdateType {
    Normal,
    Periodic,
    ImsiAttach,
}

/// Identity type requested in an IdentityRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityType {
    Imsi,
    Imei,
    Tmsi,
}

/// Ciphering algorithms, best-first preference order is A5/3 then A5/1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgo {
    A5_1,
    A5_3,
}

/// SMS transport-layer PDU content. Bit codecs are external; the decoded
/// forms carry what the relay needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tpdu {
    /// MO submit: destination address and decoded text.
    Submit { dest: String, text: String },
    /// MT deliver: originating address and text.
    Deliver { orig: String, text: String },
    /// Pre-encoded 3GPP payload carried as hex (content type
    /// application/vnd.3gpp.sms).
    RawHex(String),
}

/// RP-layer message inside a CP-DATA, GSM 04.11 7.3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpMessage {
    Data {
        reference: u8,
        smsc: String,
        tpdu: Tpdu,
    },
    Ack {
        reference: u8,
    },
    Error {
        reference: u8,
        cause: u8,
    },
    Smma {
        reference: u8,
    },
}

impl RpMessage {
    pub fn reference(&self) -> u8 {
        match self {
            RpMessage::Data { reference, .. }
            | RpMessage::Ack { reference }
            | RpMessage::Error { reference, .. }
            | RpMessage::Smma { reference } => *reference,
        }
    }
}

/// A channel description handed to the MS in an AssignmentCommand. The
/// physical details are owned by the radio layer; we relay its token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescription {
    pub description: String,
}

/// Progress indicator IE (04.08 10.5.4.21), description and location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressIndicator {
    pub progress: u8,
    pub location: u8,
}

impl ProgressIndicator {
    /// "Queuing" / location "User": works around handsets that generate no
    /// ringback tone on a bare Alerting.
    pub fn queuing_user() -> ProgressIndicator {
        ProgressIndicator {
            progress: 0x09,
            location: 0x00,
        }
    }
}

/// A measurement report forwarded from the SACCH service, already folded to
/// the fields the handover selector reads.
#[derive(Debug, Clone, Default)]
pub struct MeasurementReport {
    /// Serving-cell downlink level in dBm.
    pub rxlev_dl: i32,
    /// (ARFCN, BSIC, rxlev-dBm) per reported neighbor.
    pub neighbors: Vec<(u32, u32, i32)>,
}

/// The decoded L3 message union.
#[derive(Debug, Clone)]
pub enum L3Message {
    // --- Mobility Management, PD 0x5 ---
    LocationUpdatingRequest {
        lu_type: LocationUpdateType,
        lai: String,
        mobile_id: MobileIdentity,
    },
    LocationUpdatingAccept {
        lai: String,
        new_tmsi: Option<u32>,
    },
    LocationUpdatingReject {
        cause: RejectCause,
    },
    ImsiDetachIndication {
        mobile_id: MobileIdentity,
    },
    CmServiceRequest {
        service: CmServiceType,
        mobile_id: MobileIdentity,
    },
    CmServiceAccept,
    CmServiceReject {
        cause: RejectCause,
    },
    CmServiceAbort,
    IdentityRequest {
        id_type: IdentityType,
    },
    IdentityResponse {
        mobile_id: MobileIdentity,
    },
    AuthenticationRequest {
        rand: String,
    },
    AuthenticationResponse {
        sres: String,
    },
    TmsiReallocationComplete,
    MmInformation {
        short_name: String,
    },
    MmStatus {
        cause: u8,
    },

    // --- Call Control, PD 0x3 ---
    Setup {
        ti: u8,
        /// Called party, mobile-originated direction.
        called: Option<String>,
        /// Calling party, mobile-terminated direction.
        calling: Option<String>,
        codecs: CodecSet,
    },
    EmergencySetup {
        ti: u8,
    },
    CallProceeding {
        ti: u8,
    },
    Progress {
        ti: u8,
    },
    Alerting {
        ti: u8,
        progress: Option<ProgressIndicator>,
    },
    CallConfirmed {
        ti: u8,
        codecs: CodecSet,
    },
    Connect {
        ti: u8,
    },
    ConnectAcknowledge {
        ti: u8,
    },
    Disconnect {
        ti: u8,
        cause: L3Cause,
    },
    Release {
        ti: u8,
        cause: Option<L3Cause>,
    },
    ReleaseComplete {
        ti: u8,
        cause: Option<L3Cause>,
    },
    Hold {
        ti: u8,
    },
    HoldReject {
        ti: u8,
        cause: L3Cause,
    },
    StartDtmf {
        ti: u8,
        key: char,
    },
    StartDtmfAck {
        ti: u8,
        key: char,
    },
    StartDtmfReject {
        ti: u8,
        cause: L3Cause,
    },
    StopDtmf {
        ti: u8,
    },
    StopDtmfAck {
        ti: u8,
    },

    // --- Radio Resource, PD 0x6 ---
    PagingResponse {
        mobile_id: MobileIdentity,
    },
    AssignmentCommand {
        channel: ChannelDescription,
        mode_speech: bool,
    },
    AssignmentComplete,
    AssignmentFailure {
        cause: RrCause,
    },
    ChannelModeModify {
        mode_speech: bool,
    },
    ChannelModeModifyAcknowledge,
    ChannelRelease {
        cause: RrCause,
    },
    CipheringModeCommand {
        algo: CipherAlgo,
    },
    CipheringModeComplete,
    ClassmarkEnquiry,
    ClassmarkChange {
        /// Supported A5 algorithms as a bitmask: bit0 = A5/1, bit2 = A5/3.
        a5_support: u8,
    },
    RrStatus {
        cause: u8,
    },
    ApplicationInformation {
        data: Vec<u8>,
    },
    PhysicalInformation {
        timing_advance: u8,
    },
    HandoverComplete,
    HandoverFailure {
        cause: RrCause,
    },

    // --- SMS CP layer, PD 0x9 (GSM 04.11) ---
    CpData {
        ti: u8,
        rpdu: RpMessage,
    },
    CpAck {
        ti: u8,
    },
    CpError {
        ti: u8,
        cause: u8,
    },

    // --- Supplementary services, PD 0xB ---
    SsRegister {
        ti: u8,
        ussd: String,
    },
    SsFacility {
        ti: u8,
        payload: String,
    },
    SsReleaseComplete {
        ti: u8,
    },
}

impl L3Message {
    pub fn pd(&self) -> L3Pd {
        use L3Message::*;
        match self {
            LocationUpdatingRequest { .. }
            | LocationUpdatingAccept { .. }
            | LocationUpdatingReject { .. }
            | ImsiDetachIndication { .. }
            | CmServiceRequest { .. }
            | CmServiceAccept
            | CmServiceReject { .. }
            | CmServiceAbort
            | IdentityRequest { .. }
            | IdentityResponse { .. }
            | AuthenticationRequest { .. }
            | AuthenticationResponse { .. }
            | TmsiReallocationComplete
            | MmInformation { .. }
            | MmStatus { .. } => L3Pd::Mm,

            Setup { .. }
            | EmergencySetup { .. }
            | CallProceeding { .. }
            | Progress { .. }
            | Alerting { .. }
            | CallConfirmed { .. }
            | Connect { .. }
            | ConnectAcknowledge { .. }
            | Disconnect { .. }
            | Release { .. }
            | ReleaseComplete { .. }
            | Hold { .. }
            | HoldReject { .. }
            | StartDtmf { .. }
            | StartDtmfAck { .. }
            | StartDtmfReject { .. }
            | StopDtmf { .. }
            | StopDtmfAck { .. } => L3Pd::Cc,

            PagingResponse { .. }
            | AssignmentCommand { .. }
            | AssignmentComplete
            | AssignmentFailure { .. }
            | ChannelModeModify { .. }
            | ChannelModeModifyAcknowledge
            | ChannelRelease { .. }
            | CipheringModeCommand { .. }
            | CipheringModeComplete
            | ClassmarkEnquiry
            | ClassmarkChange { .. }
            | RrStatus { .. }
            | ApplicationInformation { .. }
            | PhysicalInformation { .. }
            | HandoverComplete
            | HandoverFailure { .. } => L3Pd::Rr,

            CpData { .. } | CpAck { .. } | CpError { .. } => L3Pd::Sms,

            SsRegister { .. } | SsFacility { .. } | SsReleaseComplete { .. } => L3Pd::NonCallSs,
        }
    }

    /// Real GSM message type codes (04.08 table 10.1/10.2/10.3, 04.11 8.1).
    pub fn mti(&self) -> u8 {
        use L3Message::*;
        match self {
            // MM
            ImsiDetachIndication { .. } => 0x01,
            LocationUpdatingAccept { .. } => 0x02,
            LocationUpdatingReject { .. } => 0x04,
            LocationUpdatingRequest { .. } => 0x08,
            AuthenticationRequest { .. } => 0x12,
            AuthenticationResponse { .. } => 0x14,
            IdentityRequest { .. } => 0x18,
            IdentityResponse { .. } => 0x19,
            TmsiReallocationComplete => 0x1B,
            CmServiceAccept => 0x21,
            CmServiceReject { .. } => 0x22,
            CmServiceAbort => 0x23,
            CmServiceRequest { .. } => 0x24,
            MmStatus { .. } => 0x31,
            MmInformation { .. } => 0x32,

            // CC
            Alerting { .. } => 0x01,
            CallProceeding { .. } => 0x02,
            Progress { .. } => 0x03,
            Setup { .. } => 0x05,
            Connect { .. } => 0x07,
            CallConfirmed { .. } => 0x08,
            EmergencySetup { .. } => 0x0E,
            ConnectAcknowledge { .. } => 0x0F,
            Hold { .. } => 0x18,
            HoldReject { .. } => 0x1A,
            Disconnect { .. } => 0x25,
            Release { .. } => 0x2D,
            ReleaseComplete { .. } => 0x2A,
            StopDtmf { .. } => 0x31,
            StopDtmfAck { .. } => 0x32,
            StartDtmf { .. } => 0x35,
            StartDtmfAck { .. } => 0x36,
            StartDtmfReject { .. } => 0x37,

            // RR
            ChannelRelease { .. } => 0x0D,
            ChannelModeModify { .. } => 0x10,
            RrStatus { .. } => 0x12,
            ClassmarkEnquiry => 0x13,
            ClassmarkChange { .. } => 0x16,
            ChannelModeModifyAcknowledge => 0x17,
            PagingResponse { .. } => 0x27,
            HandoverFailure { .. } => 0x28,
            AssignmentComplete => 0x29,
            AssignmentCommand { .. } => 0x2E,
            HandoverComplete => 0x2C,
            PhysicalInformation { .. } => 0x2D,
            AssignmentFailure { .. } => 0x2F,
            CipheringModeComplete => 0x32,
            CipheringModeCommand { .. } => 0x35,
            ApplicationInformation { .. } => 0x38,

            // SMS CP
            CpData { .. } => 0x01,
            CpAck { .. } => 0x04,
            CpError { .. } => 0x10,

            // SS
            SsReleaseComplete { .. } => 0x2A,
            SsFacility { .. } => 0x3A,
            SsRegister { .. } => 0x3B,
        }
    }

    /// The TI, for the PDs that carry one.
    pub fn ti(&self) -> Option<u8> {
        use L3Message::*;
        match self {
            Setup { ti, .. }
            | EmergencySetup { ti }
            | CallProceeding { ti }
            | Progress { ti }
            | Alerting { ti, .. }
            | CallConfirmed { ti, .. }
            | Connect { ti }
            | ConnectAcknowledge { ti }
            | Disconnect { ti, .. }
            | Release { ti, .. }
            | ReleaseComplete { ti, .. }
            | Hold { ti }
            | HoldReject { ti, .. }
            | StartDtmf { ti, .. }
            | StartDtmfAck { ti, .. }
            | StartDtmfReject { ti, .. }
            | StopDtmf { ti }
            | StopDtmfAck { ti }
            | CpData { ti, .. }
            | CpAck { ti }
            | CpError { ti, .. }
            | SsRegister { ti, .. }
            | SsFacility { ti, .. }
            | SsReleaseComplete { ti } => Some(*ti),
            _ => None,
        }
    }

    /// The dispatch key for this message.
    pub fn dispatch_key(&self) -> DispatchKey {
        l3_case(self.pd(), self.mti())
    }
}

impl fmt::Display for L3Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The variant name is the message name.
        let name = match self {
            L3Message::LocationUpdatingRequest { .. } => "LocationUpdatingRequest",
            L3Message::LocationUpdatingAccept { .. } => "LocationUpdatingAccept",
            L3Message::LocationUpdatingReject { .. } => "LocationUpdatingReject",
            L3Message::ImsiDetachIndication { .. } => "ImsiDetachIndication",
            L3Message::CmServiceRequest { .. } => "CmServiceRequest",
            L3Message::CmServiceAccept => "CmServiceAccept",
            L3Message::CmServiceReject { .. } => "CmServiceReject",
            L3Message::CmServiceAbort => "CmServiceAbort",
            L3Message::IdentityRequest { .. } => "IdentityRequest",
            L3Message::IdentityResponse { .. } => "IdentityResponse",
            L3Message::AuthenticationRequest { .. } => "AuthenticationRequest",
            L3Message::AuthenticationResponse { .. } => "AuthenticationResponse",
            L3Message::TmsiReallocationComplete => "TmsiReallocationComplete",
            L3Message::MmInformation { .. } => "MmInformation",
            L3Message::MmStatus { .. } => "MmStatus",
            L3Message::Setup { .. } => "Setup",
            L3Message::EmergencySetup { .. } => "EmergencySetup",
            L3Message::CallProceeding { .. } => "CallProceeding",
            L3Message::Progress { .. } => "Progress",
            L3Message::Alerting { .. } => "Alerting",
            L3Message::CallConfirmed { .. } => "CallConfirmed",
            L3Message::Connect { .. } => "Connect",
            L3Message::ConnectAcknowledge { .. } => "ConnectAcknowledge",
            L3Message::Disconnect { .. } => "Disconnect",
            L3Message::Release { .. } => "Release",
            L3Message::ReleaseComplete { .. } => "ReleaseComplete",
            L3Message::Hold { .. } => "Hold",
            L3Message::HoldReject { .. } => "HoldReject",
            L3Message::StartDtmf { .. } => "StartDtmf",
            L3Message::StartDtmfAck { .. } => "StartDtmfAck",
            L3Message::StartDtmfReject { .. } => "StartDtmfReject",
            L3Message::StopDtmf { .. } => "StopDtmf",
            L3Message::StopDtmfAck { .. } => "StopDtmfAck",
            L3Message::PagingResponse { .. } => "PagingResponse",
            L3Message::AssignmentCommand { .. } => "AssignmentCommand",
            L3Message::AssignmentComplete => "AssignmentComplete",
            L3Message::AssignmentFailure { .. } => "AssignmentFailure",
            L3Message::ChannelModeModify { .. } => "ChannelModeModify",
            L3Message::ChannelModeModifyAcknowledge => "ChannelModeModifyAcknowledge",
            L3Message::ChannelRelease { .. } => "ChannelRelease",
            L3Message::CipheringModeCommand { .. } => "CipheringModeCommand",
            L3Message::CipheringModeComplete => "CipheringModeComplete",
            L3Message::ClassmarkEnquiry => "ClassmarkEnquiry",
            L3Message::ClassmarkChange { .. } => "ClassmarkChange",
            L3Message::RrStatus { .. } => "RrStatus",
            L3Message::ApplicationInformation { .. } => "ApplicationInformation",
            L3Message::PhysicalInformation { .. } => "PhysicalInformation",
            L3Message::HandoverComplete => "HandoverComplete",
            L3Message::HandoverFailure { .. } => "HandoverFailure",
            L3Message::CpData { .. } => "CpData",
            L3Message::CpAck { .. } => "CpAck",
            L3Message::CpError { .. } => "CpError",
            L3Message::SsRegister { .. } => "SsRegister",
            L3Message::SsFacility { .. } => "SsFacility",
            L3Message::SsReleaseComplete { .. } => "SsReleaseComplete",
        };
        match self.ti() {
            Some(ti) => write!(f, "{}(ti={})", name, ti),
            None => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mti_values_are_wire_values() {
        assert_eq!(
            L3Message::Setup {
                ti: 0,
                called: None,
                calling: None,
                codecs: CodecSet::empty()
            }
            .mti(),
            0x05
        );
        assert_eq!(L3Message::LocationUpdatingRequest {
            lu_type: LocationUpdateType::Normal,
            lai: String::new(),
            mobile_id: MobileIdentity::None,
        }.mti(), 0x08);
        assert_eq!(L3Message::CpAck { ti: 0 }.mti(), 0x04);
    }

    #[test]
    fn pd_classification() {
        assert_eq!(L3Message::CmServiceAccept.pd(), L3Pd::Mm);
        assert_eq!(L3Message::AssignmentComplete.pd(), L3Pd::Rr);
        assert_eq!(
            L3Message::CpAck { ti: 1 }.pd(),
            L3Pd::Sms
        );
    }
}
