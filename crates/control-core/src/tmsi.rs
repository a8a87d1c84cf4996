//! The TMSI table boundary.
//!
//! The persistent table itself (SQLite in production) is an external
//! collaborator; the control layer consumes it through the record API here.
//! One IMSI owns at most one row; an assigned TMSI maps back to exactly one
//! IMSI.

use crate::cause::RejectCause;
use crate::l3::CipherAlgo;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One subscriber row.
#[derive(Debug, Clone, Default)]
pub struct TmsiRecord {
    pub imsi: String,
    pub tmsi: Option<u32>,
    pub imei: String,
    pub lai: String,
    pub authorized: bool,
    pub reject_cause: Option<RejectCause>,
    pub kc: String,
    /// A5 algorithms the handset supports: bit0 = A5/1, bit2 = A5/3.
    pub a5_support: u8,
    /// 0 = never, 1 = sent by us, 2 = assumed sent elsewhere.
    pub welcome_sent: u8,
    pub associated_uri: String,
    pub asserted_identity: String,
}

/// Record API over the subscriber/TMSI table.
pub trait TmsiStore: Send + Sync {
    /// Get a copy of the row, if the IMSI is known.
    fn get(&self, imsi: &str) -> Option<TmsiRecord>;

    /// Create or update a row. The IMSI in the record is the key.
    fn put(&self, record: TmsiRecord);

    /// Assign (or return the existing) TMSI for the IMSI.
    fn assign_tmsi(&self, imsi: &str) -> u32;

    /// Reverse lookup. Returns the row, so callers get the cached
    /// authorization with the IMSI in one query.
    fn by_tmsi(&self, tmsi: u32) -> Option<TmsiRecord>;

    fn tmsi_for_imsi(&self, imsi: &str) -> Option<u32> {
        self.get(imsi).and_then(|r| r.tmsi)
    }

    fn is_authorized(&self, imsi: &str) -> bool {
        self.get(imsi).map(|r| r.authorized).unwrap_or(false)
    }

    /// A cached, non-expired unauthorized verdict, for skipping a registrar
    /// round trip on re-registration.
    fn cached_reject(&self, imsi: &str) -> Option<RejectCause>;

    /// Record the authorization outcome of a registration.
    fn set_authorization(&self, imsi: &str, authorized: bool, reject: Option<RejectCause>);

    fn set_kc(&self, imsi: &str, kc: &str);

    fn set_imei(&self, imsi: &str, imei: &str);

    fn set_classmark(&self, imsi: &str, a5_support: u8);

    fn set_welcome_sent(&self, imsi: &str, value: u8);

    /// Best cipher supported by both the handset and this BTS: A5/3
    /// preferred over A5/1. None when neither is supported.
    fn preferred_a5(&self, imsi: &str) -> Option<CipherAlgo> {
        let support = self.get(imsi).map(|r| r.a5_support).unwrap_or(0);
        if support & 0b100 != 0 {
            Some(CipherAlgo::A5_3)
        } else if support & 0b001 != 0 {
            Some(CipherAlgo::A5_1)
        } else {
            None
        }
    }

    /// Update the last-accessed stamp.
    fn touch(&self, imsi: &str);

    /// Drop all cached authorization verdicts (pattern config changed).
    fn clear_auth_cache(&self);
}

/// In-memory implementation backing tests and single-process deployments.
pub struct MemoryTmsiStore {
    inner: Mutex<StoreInner>,
    auth_cache_ttl: Duration,
}

struct StoreInner {
    rows: HashMap<String, TmsiRecord>,
    by_tmsi: HashMap<u32, String>,
    auth_stamp: HashMap<String, Instant>,
}

impl MemoryTmsiStore {
    pub fn new() -> MemoryTmsiStore {
        MemoryTmsiStore {
            inner: Mutex::new(StoreInner {
                rows: HashMap::new(),
                by_tmsi: HashMap::new(),
                auth_stamp: HashMap::new(),
            }),
            auth_cache_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_auth_cache_ttl(mut self, ttl: Duration) -> MemoryTmsiStore {
        self.auth_cache_ttl = ttl;
        self
    }
}

impl Default for MemoryTmsiStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TmsiStore for MemoryTmsiStore {
    fn get(&self, imsi: &str) -> Option<TmsiRecord> {
        self.inner.lock().rows.get(imsi).cloned()
    }

    fn put(&self, record: TmsiRecord) {
        let mut inner = self.inner.lock();
        if let Some(tmsi) = record.tmsi {
            inner.by_tmsi.insert(tmsi, record.imsi.clone());
        }
        inner.rows.insert(record.imsi.clone(), record);
    }

    fn assign_tmsi(&self, imsi: &str) -> u32 {
        let mut inner = self.inner.lock();
        if let Some(t) = inner.rows.get(imsi).and_then(|r| r.tmsi) {
            return t;
        }
        let mut rng = rand::thread_rng();
        let tmsi = loop {
            let candidate: u32 = rng.r#gen();
            // Reserved patterns stay out of the pool.
            if candidate != 0 && candidate != u32::MAX && !inner.by_tmsi.contains_key(&candidate) {
                break candidate;
            }
        };
        let row = inner.rows.entry(imsi.to_string()).or_insert_with(|| TmsiRecord {
            imsi: imsi.to_string(),
            ..Default::default()
        });
        row.tmsi = Some(tmsi);
        inner.by_tmsi.insert(tmsi, imsi.to_string());
        tmsi
    }

    fn by_tmsi(&self, tmsi: u32) -> Option<TmsiRecord> {
        let inner = self.inner.lock();
        let imsi = inner.by_tmsi.get(&tmsi)?;
        inner.rows.get(imsi).cloned()
    }

    fn cached_reject(&self, imsi: &str) -> Option<RejectCause> {
        let inner = self.inner.lock();
        let row = inner.rows.get(imsi)?;
        if row.authorized {
            return None;
        }
        let stamp = inner.auth_stamp.get(imsi)?;
        if stamp.elapsed() > self.auth_cache_ttl {
            return None;
        }
        row.reject_cause
    }

    fn set_authorization(&self, imsi: &str, authorized: bool, reject: Option<RejectCause>) {
        let mut inner = self.inner.lock();
        let row = inner.rows.entry(imsi.to_string()).or_insert_with(|| TmsiRecord {
            imsi: imsi.to_string(),
            ..Default::default()
        });
        row.authorized = authorized;
        row.reject_cause = reject;
        inner.auth_stamp.insert(imsi.to_string(), Instant::now());
    }

    fn set_kc(&self, imsi: &str, kc: &str) {
        if let Some(row) = self.inner.lock().rows.get_mut(imsi) {
            row.kc = kc.to_string();
        }
    }

    fn set_imei(&self, imsi: &str, imei: &str) {
        let mut inner = self.inner.lock();
        let row = inner.rows.entry(imsi.to_string()).or_insert_with(|| TmsiRecord {
            imsi: imsi.to_string(),
            ..Default::default()
        });
        row.imei = imei.to_string();
    }

    fn set_classmark(&self, imsi: &str, a5_support: u8) {
        if let Some(row) = self.inner.lock().rows.get_mut(imsi) {
            row.a5_support = a5_support;
        }
    }

    fn set_welcome_sent(&self, imsi: &str, value: u8) {
        if let Some(row) = self.inner.lock().rows.get_mut(imsi) {
            row.welcome_sent = value;
        }
    }

    fn touch(&self, _imsi: &str) {
        // The in-memory store keeps no accessed stamp worth updating.
    }

    fn clear_auth_cache(&self) {
        self.inner.lock().auth_stamp.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::L3Cause;

    #[test]
    fn tmsi_assignment_is_stable_and_reversible() {
        let store = MemoryTmsiStore::new();
        let t1 = store.assign_tmsi("001010000000001");
        let t2 = store.assign_tmsi("001010000000001");
        assert_eq!(t1, t2);
        let row = store.by_tmsi(t1).unwrap();
        assert_eq!(row.imsi, "001010000000001");
    }

    #[test]
    fn one_imsi_per_tmsi() {
        let store = MemoryTmsiStore::new();
        let a = store.assign_tmsi("001010000000001");
        let b = store.assign_tmsi("001010000000002");
        assert_ne!(a, b);
    }

    #[test]
    fn auth_cache_expiry() {
        let store = MemoryTmsiStore::new().with_auth_cache_ttl(Duration::from_secs(0));
        store.set_authorization("imsi1", false, Some(L3Cause::ImsiUnknownInVlr));
        // TTL zero: the verdict is already stale.
        assert!(store.cached_reject("imsi1").is_none());

        let store = MemoryTmsiStore::new();
        store.set_authorization("imsi1", false, Some(L3Cause::ImsiUnknownInVlr));
        assert_eq!(store.cached_reject("imsi1"), Some(L3Cause::ImsiUnknownInVlr));
        store.set_authorization("imsi1", true, None);
        assert!(store.cached_reject("imsi1").is_none());
    }

    #[test]
    fn preferred_a5_ordering() {
        let store = MemoryTmsiStore::new();
        store.set_authorization("i", true, None);
        store.set_classmark("i", 0b101);
        assert_eq!(store.preferred_a5("i"), Some(CipherAlgo::A5_3));
        store.set_classmark("i", 0b001);
        assert_eq!(store.preferred_a5("i"), Some(CipherAlgo::A5_1));
        store.set_classmark("i", 0);
        assert_eq!(store.preferred_a5("i"), None);
    }
}
