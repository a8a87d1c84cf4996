//! The service bundle threaded through the control layer.
//!
//! One [`Services`] value carries the configuration view, the external
//! collaborators (TMSI table, registrar, SIP interface, peering, radio
//! layer) and the process-wide singletons (MM registry, CDR writer, RTP
//! ports, counters). It is cheap to clone; everything inside is shared.

use crate::cdr::CdrSender;
use crate::channel::L3Channel;
use crate::config::Config;
use crate::handover::PeerInterface;
use crate::mm::MmLayer;
use crate::paging::PagingEntry;
use crate::rtp::RtpPorts;
use crate::sip::{Registrar, SipInterface};
use crate::tmsi::TmsiStore;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// The radio layer above L1: channel allocation and paging broadcast.
pub trait RadioLayer: Send + Sync {
    /// Allocate a TCH/FACCH from the pool. None on congestion.
    fn allocate_tch(&self) -> Option<Arc<L3Channel>>;

    /// Hand the current paging list to the CCCH broadcaster.
    fn publish_pages(&self, pages: &[PagingEntry]);

    /// Feed the process watchdog.
    fn reset_watchdog(&self) {}
}

/// Reporting counters. Incremented along the hot paths, read by the CLI.
#[derive(Default)]
pub struct Counters {
    pub call_minutes: AtomicU64,
    pub pages_sent: AtomicU64,
    pub handovers_in: AtomicU64,
    pub handovers_out: AtomicU64,
    pub sms_mo_complete: AtomicU64,
    pub sms_mt_complete: AtomicU64,
}

/// Everything a procedure or service loop may need, in one clonable bag.
#[derive(Clone)]
pub struct Services {
    pub config: Config,
    pub tmsi: Arc<dyn TmsiStore>,
    pub registrar: Arc<dyn Registrar>,
    pub sipif: Arc<dyn SipInterface>,
    pub peering: Arc<dyn PeerInterface>,
    pub radio: Arc<dyn RadioLayer>,
    pub mm: Arc<MmLayer>,
    pub cdr: CdrSender,
    pub rtp: Arc<RtpPorts>,
    pub counters: Arc<Counters>,
}

impl Services {
    /// Assemble the control layer around its collaborators. Called once at
    /// startup (and per-test in the suite).
    pub fn new(
        config: Config,
        tmsi: Arc<dyn TmsiStore>,
        registrar: Arc<dyn Registrar>,
        sipif: Arc<dyn SipInterface>,
        peering: Arc<dyn PeerInterface>,
        radio: Arc<dyn RadioLayer>,
        cdr: CdrSender,
    ) -> Services {
        let rtp = Arc::new(RtpPorts::new(config.rtp_start(), config.rtp_range()));
        Services {
            config,
            tmsi,
            registrar,
            sipif,
            peering,
            radio,
            mm: MmLayer::new(),
            cdr,
            rtp,
            counters: Arc::new(Counters::default()),
        }
    }
}
