//! Typed view over the control-layer configuration keys.
//!
//! The operator-facing configuration is a flat key/value table
//! ([`ConfigStore`]); this module owns the closed list of keys the control
//! layer consumes and exposes them with types and defaults. Reads go to the
//! live store every time, so operator changes take effect without restart,
//! the same way the rest of the stack treats configuration.

use crate::cause::{L3Cause, RejectCause};
use opencell_infra_common::ConfigStore;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// `Control.LUR.FailMode` — what to do when the registrar is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LurFailMode {
    /// Reject the registration.
    Fail,
    /// Accept if open registration would accept.
    Open,
    /// Accept.
    Normal,
}

/// `Control.LUR.RegistrationMessageFrequency` — when to send the welcome
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMessageFrequency {
    /// Whenever we have no record of having sent one.
    First,
    /// Only on the first attach seen by this BTS.
    Normal,
    /// Only on IMSI attach (assume some BTS in the PLMN sent it otherwise).
    Plmn,
}

/// Typed accessors over the closed configuration key list.
#[derive(Clone)]
pub struct Config {
    store: Arc<ConfigStore>,
}

/// Defaults for every key the control layer reads.
pub fn default_config_store() -> ConfigStore {
    ConfigStore::with_defaults([
        ("Control.VEA", "0"),
        ("GSM.Cipher.Encrypt", "0"),
        ("GSM.Identity.ShortName", ""),
        ("GSM.LAI.MCC", "001"),
        ("GSM.LAI.MNC", "01"),
        ("GSM.LAI.LAC", "1000"),
        ("GSM.Timer.T3103", "5000"),
        ("GSM.Timer.T3113", "10000"),
        ("GSM.Timer.Handover.Holdoff", "10"),
        ("GSM.MS.TA.Max", "62"),
        ("GSM.Handover.Margin", "10"),
        ("GSM.Handover.FailureHoldoff", "20"),
        ("GSM.Handover.Ny1", "50"),
        ("GSM.Timer.T3105", "50"),
        ("GSM.MaxSpeechLatency", "2"),
        ("Control.LUR.QueryIMEI", "0"),
        ("Control.LUR.QueryClassmark", "0"),
        ("Control.LUR.OpenRegistration", ""),
        ("Control.LUR.OpenRegistration.Reject", ""),
        ("Control.LUR.404RejectCause", "0x204"),
        ("Control.LUR.UnprovisionedRejectCause", "0x204"),
        ("Control.LUR.FailMode", "NORMAL"),
        ("Control.LUR.RegistrationMessageFrequency", "FIRST"),
        ("Control.LUR.NormalRegistration.Message", ""),
        ("Control.LUR.NormalRegistration.ShortCode", ""),
        ("Control.LUR.OpenRegistration.Message", ""),
        ("Control.LUR.OpenRegistration.ShortCode", ""),
        ("Control.LUR.FailedRegistration.Message", ""),
        ("Control.LUR.FailedRegistration.ShortCode", ""),
        ("SIP.Proxy.Registration", "127.0.0.1:5064"),
        ("SIP.Realm", ""),
        ("SMS.MIMEType", "text/plain"),
        ("SMS.FakeSrcSMSC", "0000"),
        ("RTP.Start", "16484"),
        ("RTP.Range", "98"),
        ("Control.SMSCB.Table", ""),
    ])
}

impl Config {
    pub fn new(store: Arc<ConfigStore>) -> Config {
        Config { store }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    fn num(&self, key: &str, fallback: i64) -> i64 {
        match self.store.get_num(key) {
            Ok(v) => v,
            Err(_) => {
                // Accept hex for the reject-cause keys.
                let raw = self.store.get_str(key);
                if let Some(hex) = raw.trim().strip_prefix("0x") {
                    if let Ok(v) = i64::from_str_radix(hex, 16) {
                        return v;
                    }
                }
                warn!(key, value = %raw, "bad numeric config value, using default");
                fallback
            }
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.store.get_bool(key).unwrap_or(false)
    }

    /// Very-early assignment: calls start on a TCH, no SDCCH hop.
    pub fn vea(&self) -> bool {
        self.flag("Control.VEA")
    }

    pub fn cipher_encrypt(&self) -> bool {
        self.flag("GSM.Cipher.Encrypt")
    }

    pub fn short_name(&self) -> String {
        self.store.get_str("GSM.Identity.ShortName")
    }

    /// The location area identity as "MCC.MNC.LAC".
    pub fn lai(&self) -> String {
        format!(
            "{}.{}.{}",
            self.store.get_str("GSM.LAI.MCC"),
            self.store.get_str("GSM.LAI.MNC"),
            self.store.get_str("GSM.LAI.LAC")
        )
    }

    pub fn t3103(&self) -> Duration {
        Duration::from_millis(self.num("GSM.Timer.T3103", 5000) as u64)
    }

    pub fn t3113(&self) -> Duration {
        Duration::from_millis(self.num("GSM.Timer.T3113", 10000) as u64)
    }

    pub fn t3105(&self) -> Duration {
        Duration::from_millis(self.num("GSM.Timer.T3105", 50) as u64)
    }

    /// Minimum age of a transaction before it may be handed over, seconds.
    pub fn handover_holdoff(&self) -> Duration {
        Duration::from_secs(self.num("GSM.Timer.Handover.Holdoff", 10) as u64)
    }

    pub fn ta_max(&self) -> u32 {
        self.num("GSM.MS.TA.Max", 62) as u32
    }

    /// Handover margin in dB.
    pub fn handover_margin(&self) -> i32 {
        self.num("GSM.Handover.Margin", 10) as i32
    }

    /// Seconds a failed neighbor is penalized.
    pub fn handover_failure_holdoff(&self) -> Duration {
        Duration::from_secs(self.num("GSM.Handover.FailureHoldoff", 20) as u64)
    }

    /// Max repetitions of PhysicalInformation during inbound handover.
    pub fn handover_ny1(&self) -> u32 {
        self.num("GSM.Handover.Ny1", 50) as u32
    }

    /// Max queued uplink speech frames before older ones are flushed.
    pub fn max_speech_latency(&self) -> usize {
        self.num("GSM.MaxSpeechLatency", 2) as usize
    }

    pub fn lur_query_imei(&self) -> bool {
        self.flag("Control.LUR.QueryIMEI")
    }

    pub fn lur_query_classmark(&self) -> bool {
        self.flag("Control.LUR.QueryClassmark")
    }

    /// The open-registration IMSI pattern, if configured and valid.
    pub fn open_registration(&self) -> Option<Regex> {
        self.pattern("Control.LUR.OpenRegistration")
    }

    /// The open-registration reject pattern, if configured and valid.
    pub fn open_registration_reject(&self) -> Option<Regex> {
        self.pattern("Control.LUR.OpenRegistration.Reject")
    }

    fn pattern(&self, key: &str) -> Option<Regex> {
        let pat = self.store.get_str(key);
        if pat.is_empty() {
            return None;
        }
        match Regex::new(&pat) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(key, pattern = %pat, error = %e, "invalid pattern ignored");
                None
            }
        }
    }

    fn reject_cause(&self, key: &str) -> RejectCause {
        // Operator gives a numeric 10.5.3.6 cause; map the ones we name.
        match self.num(key, 0x204) & 0xFF {
            0x02 => L3Cause::ImsiUnknownInHlr,
            0x03 => L3Cause::IllegalMs,
            0x04 => L3Cause::ImsiUnknownInVlr,
            0x05 => L3Cause::ImeiNotAccepted,
            0x06 => L3Cause::IllegalMe,
            0x0B => L3Cause::PlmnNotAllowed,
            0x0C => L3Cause::LocationAreaNotAllowed,
            0x0D => L3Cause::RoamingNotAllowedInLa,
            0x11 => L3Cause::NetworkFailure,
            0x16 => L3Cause::Congestion,
            0x20 => L3Cause::ServiceOptionNotSupported,
            0x21 => L3Cause::RequestedServiceOptionNotSubscribed,
            0x22 => L3Cause::ServiceOptionTemporarilyOutOfOrder,
            _ => L3Cause::ImsiUnknownInVlr,
        }
    }

    pub fn lur_404_reject_cause(&self) -> RejectCause {
        self.reject_cause("Control.LUR.404RejectCause")
    }

    pub fn lur_unprovisioned_reject_cause(&self) -> RejectCause {
        self.reject_cause("Control.LUR.UnprovisionedRejectCause")
    }

    pub fn lur_fail_mode(&self) -> LurFailMode {
        match self.store.get_str("Control.LUR.FailMode").as_str() {
            "FAIL" => LurFailMode::Fail,
            "OPEN" => LurFailMode::Open,
            _ => LurFailMode::Normal,
        }
    }

    pub fn registration_message_frequency(&self) -> RegistrationMessageFrequency {
        match self
            .store
            .get_str("Control.LUR.RegistrationMessageFrequency")
            .as_str()
        {
            "NORMAL" => RegistrationMessageFrequency::Normal,
            "PLMN" => RegistrationMessageFrequency::Plmn,
            _ => RegistrationMessageFrequency::First,
        }
    }

    /// Welcome message text and short code for a registration outcome
    /// class: "NormalRegistration", "OpenRegistration" or
    /// "FailedRegistration". None unless both are configured non-empty.
    pub fn welcome_message(&self, class: &str) -> Option<(String, String)> {
        let message = self.store.get_str(&format!("Control.LUR.{}.Message", class));
        let short_code = self
            .store
            .get_str(&format!("Control.LUR.{}.ShortCode", class));
        if message.is_empty() || short_code.is_empty() {
            None
        } else {
            Some((message, short_code))
        }
    }

    pub fn sms_mime_type(&self) -> String {
        self.store.get_str("SMS.MIMEType")
    }

    pub fn sms_fake_src_smsc(&self) -> String {
        self.store.get_str("SMS.FakeSrcSMSC")
    }

    pub fn rtp_start(&self) -> u16 {
        self.num("RTP.Start", 16484) as u16
    }

    pub fn rtp_range(&self) -> u16 {
        self.num("RTP.Range", 98) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::new(Arc::new(default_config_store()))
    }

    #[test]
    fn defaults() {
        let c = cfg();
        assert!(!c.vea());
        assert_eq!(c.t3113(), Duration::from_secs(10));
        assert_eq!(c.lur_fail_mode(), LurFailMode::Normal);
        assert_eq!(
            c.registration_message_frequency(),
            RegistrationMessageFrequency::First
        );
        assert_eq!(c.lur_404_reject_cause(), L3Cause::ImsiUnknownInVlr);
    }

    #[test]
    fn hex_reject_cause() {
        let c = cfg();
        c.store().set("Control.LUR.404RejectCause", "0x0C");
        assert_eq!(c.lur_404_reject_cause(), L3Cause::LocationAreaNotAllowed);
    }

    #[test]
    fn open_registration_patterns() {
        let c = cfg();
        assert!(c.open_registration().is_none());
        c.store().set("Control.LUR.OpenRegistration", "^001");
        let re = c.open_registration().unwrap();
        assert!(re.is_match("001010123456789"));
        c.store().set("Control.LUR.OpenRegistration", "([bad");
        assert!(c.open_registration().is_none());
    }

    #[test]
    fn welcome_message_requires_both_keys() {
        let c = cfg();
        assert!(c.welcome_message("OpenRegistration").is_none());
        c.store()
            .set("Control.LUR.OpenRegistration.Message", "Welcome");
        c.store().set("Control.LUR.OpenRegistration.ShortCode", "411");
        let (msg, code) = c.welcome_message("OpenRegistration").unwrap();
        assert_eq!(msg, "Welcome");
        assert_eq!(code, "411");
    }
}
