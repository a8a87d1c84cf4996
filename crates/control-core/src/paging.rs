//! The paging loop.
//!
//! A single thread walks the MMUser registry on a fixed cadence, collects
//! one [`PagingEntry`] per unattached user still inside its page window,
//! and hands the list to the radio layer, which broadcasts on the CCCH.
//! New mobile-terminated work signals the thread so a fresh page goes out
//! without waiting for the next tick.

use crate::l3::ChannelType;
use crate::services::Services;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// One entry in the paging list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingEntry {
    /// The channel type the MS should ask for: a TCH when the first queued
    /// item is a voice call under very-early assignment.
    pub channel_type: ChannelType,
    pub imsi: String,
    /// Cached TMSI so the broadcaster can page by TMSI when one exists.
    pub tmsi: Option<u32>,
}

/// Handle to the paging thread.
pub struct Pager {
    stop: Arc<AtomicBool>,
    mm: Arc<crate::mm::MmLayer>,
    handle: Option<JoinHandle<()>>,
}

impl Pager {
    /// Default walk cadence when nothing signals earlier.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

    pub fn start(svc: Services, interval: Duration) -> Pager {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let mm = svc.mm.clone();
        let handle = std::thread::Builder::new()
            .name("pager".into())
            .spawn(move || {
                info!("paging loop started");
                while !stop_flag.load(Ordering::Acquire) {
                    let pages = svc.mm.get_pages(&svc);
                    if !pages.is_empty() {
                        debug!(count = pages.len(), "publishing pages");
                        svc.counters
                            .pages_sent
                            .fetch_add(pages.len() as u64, Ordering::Relaxed);
                        svc.radio.publish_pages(&pages);
                    }
                    svc.mm.wait_page_signal(interval);
                }
                info!("paging loop stopped");
            })
            .expect("spawn pager");
        Pager {
            stop,
            mm,
            handle: Some(handle),
        }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        self.mm.signal_pager();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
