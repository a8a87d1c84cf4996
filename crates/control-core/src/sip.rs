//! The SIP-side boundary.
//!
//! The dialog machinery itself lives in the voice core; the control layer
//! sees a dialog only through the narrow [`SipDialog`] handle and learns of
//! progress by observing its state. The channel service thread merges
//! dialog-state changes into each transaction's event stream once per
//! service pass, so their ordering relative to radio events is eventually
//! consistent and the procedures must not assume a particular interleave.

use crate::cause::{L3Cause, TermCause};
use crate::codec::CodecSet;
use crate::identity::FullMobileId;
use crate::l3::{AudioFrame, DispatchKey};

/// Dialog lifecycle states as the control layer observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DialogState {
    /// INVITE (or MESSAGE) sent, no answer yet.
    Started = 0,
    /// Provisional non-ringing answer.
    Proceeding,
    /// 180 Ringing.
    Ringing,
    /// 2xx answered.
    Active,
    /// Cleared by a BYE (or, for a MESSAGE dialog, a 2xx final).
    Bye,
    /// Failed: error final response, CANCEL, or transport failure.
    Fail,
}

/// Dispatch-key space for dialog states (0x200..).
pub const fn dialog_case(state: DialogState) -> DispatchKey {
    0x200 + state as u32
}

/// Named dialog-state dispatch keys.
pub mod key {
    use super::{dialog_case, DialogState};
    use crate::l3::DispatchKey;

    pub const DIALOG_STARTED: DispatchKey = dialog_case(DialogState::Started);
    pub const DIALOG_PROCEEDING: DispatchKey = dialog_case(DialogState::Proceeding);
    pub const DIALOG_RINGING: DispatchKey = dialog_case(DialogState::Ringing);
    pub const DIALOG_ACTIVE: DispatchKey = dialog_case(DialogState::Active);
    pub const DIALOG_BYE: DispatchKey = dialog_case(DialogState::Bye);
    pub const DIALOG_FAIL: DispatchKey = dialog_case(DialogState::Fail);
}

/// A dialog-state-change event delivered to a procedure.
#[derive(Debug, Clone)]
pub struct DialogEvent {
    pub state: DialogState,
    /// Final-response status code, when one exists.
    pub sip_code: u16,
    pub reason: String,
}

/// Handle to one SIP dialog owned by the voice core.
pub trait SipDialog: Send + Sync {
    fn state(&self) -> DialogState;

    /// The status code + reason of the final response, if any.
    fn final_response(&self) -> Option<(u16, String)>;

    /// Send a response on an incoming (MT) dialog.
    fn reply(&self, code: u16, reason: &str);

    /// 100 Trying refresh while an MT setup is pending.
    fn send_trying(&self);

    fn send_ack(&self);

    fn send_bye(&self, reason_header: &str);

    fn send_cancel(&self, reason_header: &str);

    /// DTMF digit as a SIP INFO with a BCD digit payload. False if the
    /// dialog cannot carry it right now.
    fn send_info_dtmf(&self, key: char) -> bool;

    /// Bind the RTP media path (MOC answer time).
    fn init_rtp(&self);

    /// Uplink vocoder frame toward RTP. `flushed` reports how many stale
    /// frames were dropped ahead of this one.
    fn tx_audio(&self, frame: AudioFrame, flushed: usize);

    /// One downlink vocoder frame from RTP, if available.
    fn rx_audio(&self) -> Option<AudioFrame>;

    fn is_active(&self) -> bool {
        self.state() == DialogState::Active
    }

    fn is_finished(&self) -> bool {
        matches!(self.state(), DialogState::Bye | DialogState::Fail)
    }
}

/// Derive the transaction termination cause from a failed/cleared dialog.
pub fn dialog_term_cause(dialog: &dyn SipDialog) -> TermCause {
    match dialog.final_response() {
        Some((code, reason)) => {
            let cause = match code {
                486 | 600 => L3Cause::UserBusy,
                487 => L3Cause::CallRejected,
                403 | 603 => L3Cause::CallRejected,
                404 | 604 => L3Cause::UnassignedNumber,
                480 | 408 => L3Cause::NoUserResponding,
                503 => L3Cause::SwitchingEquipmentCongestion,
                _ if code >= 300 => L3Cause::InterworkingUnspecified,
                _ => L3Cause::NormalCallClearing,
            };
            TermCause::remote(cause, code, reason)
        }
        None => TermCause::remote(L3Cause::NormalCallClearing, 0, ""),
    }
}

/// Factory for outbound dialogs, implemented by the voice core.
pub trait SipInterface: Send + Sync {
    /// Start an MOC INVITE dialog. None if the dialog cannot be created.
    fn new_moc_dialog(
        &self,
        subscriber: &FullMobileId,
        called: &str,
        codecs: CodecSet,
    ) -> Option<std::sync::Arc<dyn SipDialog>>;

    /// Start an MO-SMS MESSAGE dialog.
    fn new_mosms_dialog(
        &self,
        subscriber: &FullMobileId,
        to_address: &str,
        body: &str,
        content_type: &str,
    ) -> Option<std::sync::Arc<dyn SipDialog>>;
}

/// Outcome of a REGISTER toward the registrar.
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    /// 2xx: authorized, with the cipher key and the asserted identities.
    Success {
        kc: String,
        associated_uri: String,
        asserted_identity: String,
    },
    /// 401 with a challenge RAND (32 hex digits, possibly dashed).
    Challenge { rand: String },
    /// Rejected. If the registrar supplied an explicit cause in its private
    /// header it is carried here and overrides the SIP-code mapping.
    Fail {
        sip_code: u16,
        reject_cause: Option<crate::cause::RejectCause>,
    },
    /// Network failure, timeout, or malformed answer.
    Error,
}

/// The registrar boundary.
pub trait Registrar: Send + Sync {
    /// Fire a REGISTER for the IMSI, with the SRES response when answering
    /// a challenge.
    fn register(&self, imsi: &str, sres: Option<&str>) -> RegisterOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialog_case_space() {
        assert_eq!(dialog_case(DialogState::Started), 0x200);
        assert_eq!(dialog_case(DialogState::Fail), 0x205);
    }
}
