//! Subscriber identity types.

use std::fmt;

/// An optionally-present TMSI. A TMSI of value zero is legal, so presence
/// is tracked explicitly rather than with a sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tmsi(Option<u32>);

impl Tmsi {
    pub fn none() -> Tmsi {
        Tmsi(None)
    }

    pub fn new(value: u32) -> Tmsi {
        Tmsi(Some(value))
    }

    pub fn valid(&self) -> bool {
        self.0.is_some()
    }

    pub fn value(&self) -> Option<u32> {
        self.0
    }
}

impl From<u32> for Tmsi {
    fn from(value: u32) -> Tmsi {
        Tmsi(Some(value))
    }
}

impl fmt::Display for Tmsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "0x{:x}", v),
            None => write!(f, "(no tmsi)"),
        }
    }
}

/// A mobile identity as carried in an L3 Mobile Identity IE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MobileIdentity {
    Imsi(String),
    Tmsi(u32),
    Imei(String),
    None,
}

impl MobileIdentity {
    pub fn is_imsi(&self) -> bool {
        matches!(self, MobileIdentity::Imsi(_))
    }

    pub fn is_tmsi(&self) -> bool {
        matches!(self, MobileIdentity::Tmsi(_))
    }
}

impl fmt::Display for MobileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MobileIdentity::Imsi(d) => write!(f, "IMSI{}", d),
            MobileIdentity::Tmsi(v) => write!(f, "TMSI0x{:x}", v),
            MobileIdentity::Imei(d) => write!(f, "IMEI{}", d),
            MobileIdentity::None => write!(f, "(no id)"),
        }
    }
}

/// Everything we know about who a subscriber is.
///
/// The IMSI is the canonical key; the TMSI is a per-location-area alias and
/// the IMEI identifies the equipment. Any of the three may be unknown.
#[derive(Debug, Clone, Default)]
pub struct FullMobileId {
    pub imsi: String,
    pub tmsi: Tmsi,
    pub imei: String,
}

impl FullMobileId {
    pub fn from_imsi(imsi: impl Into<String>) -> FullMobileId {
        FullMobileId {
            imsi: imsi.into(),
            ..Default::default()
        }
    }

    /// The best available identity rendered as a SIP username:
    /// "IMSI..." preferred, then "TMSI...", then "IMEI...".
    pub fn username(&self) -> String {
        if !self.imsi.is_empty() {
            format!("IMSI{}", self.imsi)
        } else if let Some(t) = self.tmsi.value() {
            format!("TMSI{:x}", t)
        } else if !self.imei.is_empty() {
            format!("IMEI{}", self.imei)
        } else {
            "(unknown)".to_string()
        }
    }

    /// Merge an identity learned from the handset.
    pub fn absorb(&mut self, id: &MobileIdentity) {
        match id {
            MobileIdentity::Imsi(d) => self.imsi = d.clone(),
            MobileIdentity::Tmsi(v) => self.tmsi = Tmsi::new(*v),
            MobileIdentity::Imei(d) => self.imei = d.clone(),
            MobileIdentity::None => {}
        }
    }
}

impl fmt::Display for FullMobileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.username())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_prefers_imsi() {
        let mut id = FullMobileId::from_imsi("001010123456789");
        id.tmsi = Tmsi::new(0x1234);
        assert_eq!(id.username(), "IMSI001010123456789");
        id.imsi.clear();
        assert_eq!(id.username(), "TMSI1234");
    }

    #[test]
    fn zero_tmsi_is_valid() {
        let t = Tmsi::new(0);
        assert!(t.valid());
        assert_eq!(t.value(), Some(0));
        assert!(!Tmsi::none().valid());
    }
}
