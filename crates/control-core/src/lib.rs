/*!
# control-core

The Layer 3 control engine of a GSM base transceiver station: it
terminates the radio-link signalling protocols from handsets, multiplexes
concurrent per-handset transactions onto scarce dedicated channels,
bridges them to an external SIP/RTP voice core, and implements the GSM
04.08 (call control, mobility management, radio resource) and 04.11
(short message) state machines, plus the inter-BTS handover choreography.

The physical layer, LAPDm, the SIP dialog machinery, the registrar, the
persistent TMSI table and the peering transport are all external
collaborators consumed through the traits in [`channel`], [`sip`],
[`tmsi`], [`handover`] and [`services`].

## Shape

- One OS thread serves each active radio channel ([`dispatch::dcch_loop`]).
- A transaction ([`tran::Transaction`]) is one L3 procedure instance; it
  owns a stack of state machines ([`sm::Procedure`]), a timer set, and an
  optional SIP dialog handle.
- An [`mm::MmContext`] holds the up-to-seven concurrent transactions of
  one channel; [`mm::MmUser`] queues mobile-terminated work per IMSI while
  the [`paging::Pager`] looks for the handset.
*/

pub mod bridge;
pub mod cause;
pub mod cdr;
pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod handover;
pub mod identity;
pub mod l3;
pub mod mm;
pub mod paging;
pub mod procedures;
pub mod rtp;
pub mod services;
pub mod sip;
pub mod sm;
pub mod testutil;
pub mod timers;
pub mod tmsi;
pub mod tran;

pub use cause::{L3Cause, RejectCause, RrCause, TermCause};
pub use config::Config;
pub use identity::{FullMobileId, MobileIdentity, Tmsi};
pub use services::Services;
pub use tran::{CallState, ServiceType, Transaction};

use crate::cdr::CdrService;
use crate::paging::Pager;
use std::path::PathBuf;
use tracing::info;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The running control layer: the service bundle plus its worker threads.
pub struct ControlLayer {
    pub services: Services,
    pager: Pager,
    cdr: Option<CdrService>,
}

impl ControlLayer {
    /// Bring the layer up: CDR writer (when a path is configured) and the
    /// paging loop. Channel service threads are spawned by the radio
    /// layer as channels establish.
    pub fn start(mut services: Services, cdr_path: Option<PathBuf>) -> ControlLayer {
        let cdr = cdr_path.map(CdrService::start);
        if let Some(cdr) = &cdr {
            services.cdr = cdr.sender.clone();
        }
        let pager = Pager::start(services.clone(), Pager::DEFAULT_INTERVAL);
        info!("control layer started");
        ControlLayer {
            services,
            pager,
            cdr,
        }
    }

    /// Orderly teardown: stop paging, drain the CDR queue. Channel service
    /// threads must have drained already; they hold their own handles.
    pub fn shutdown(mut self) {
        self.pager.shutdown();
        // Release our own feed handle so the writer sees the queue close.
        self.services.cdr = crate::cdr::CdrSender::disabled();
        if let Some(cdr) = self.cdr {
            cdr.shutdown();
        }
        info!("control layer stopped");
    }
}
