//! The mobility-management layer: MMContext, MMUser and the registry.
//!
//! An [`MmContext`] is the set of transactions running on one radio
//! channel; an [`MmUser`] is the per-IMSI record holding mobile-terminated
//! work waiting for paging. The [`MmLayer`] registry maps IMSI to MMUser
//! under one coarse lock.
//!
//! Locking rules: one coarse structural lock ([`MmLayer`]`::gmm`) serializes
//! every multi-object operation — attaching/detaching an MMUser to a
//! context and moving transactions between contexts on handset
//! reappearance. Single-object state (the registry map, a context's slot
//! array, a user's queues) sits behind its own short-lived mutex and may be
//! read without `gmm`. Lock order is `gmm` first, then any member lock;
//! `gmm` is never held across anything that can emit a downlink message,
//! invoke a procedure, or take a transaction's run lock, because the data
//! link can block for tens of seconds. The drain paths pop work under the
//! queue lock, release it, then start machines.

use crate::cause::{L3Cause, TermCause};
use crate::channel::L3Channel;
use crate::handover::NeighborPenalty;
use crate::identity::{MobileIdentity, Tmsi};
use crate::l3::{ChannelType, L3Frame, L3Message, L3Pd};
use crate::paging::PagingEntry;
use crate::services::Services;
use crate::tran::{DispatchOutcome, Transaction};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// The transactions that may run concurrently on one channel, one slot
/// each. Order matters: the MM slot is drained first, and the SMS scan
/// walks MoSms1..MtSms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TranSlot {
    /// One mobility-management procedure.
    Mm = 0,
    /// Primary CS (voice) transaction.
    Cs1 = 1,
    /// CS transaction on hold.
    CsHold = 2,
    /// Primary MO-SMS.
    MoSms1 = 3,
    /// Follow-on MO-SMS, GSM 04.11 5.4.
    MoSms2 = 4,
    /// The single MT-SMS.
    MtSms = 5,
    /// Dedicated supplementary-services transaction.
    Ss = 6,
}

pub const NUM_SLOTS: usize = 7;

const ALL_SLOTS: [TranSlot; NUM_SLOTS] = [
    TranSlot::Mm,
    TranSlot::Cs1,
    TranSlot::CsHold,
    TranSlot::MoSms1,
    TranSlot::MoSms2,
    TranSlot::MtSms,
    TranSlot::Ss,
];

/// How long an otherwise-empty context stays open before the channel is
/// released: gives the first transaction time to start after ESTABLISH.
const EMPTY_CONTEXT_GRACE: Duration = Duration::from_secs(5);

/// The set of actively running transactions on one logical channel.
pub struct MmContext {
    chan: Mutex<Arc<L3Channel>>,
    /// Normally 1; 2 transiently while an old and a new channel both refer
    /// here during reassignment.
    use_count: Mutex<u32>,
    mmu: Mutex<Option<Arc<MmUser>>>,
    slots: Mutex<[Option<Arc<Transaction>>; NUM_SLOTS]>,
    next_ti: Mutex<u8>,
    service_requests: Mutex<VecDeque<L3Message>>,
    open_time: Instant,
    pub termination_requested: AtomicBool,
    handover_penalty: Mutex<NeighborPenalty>,
}

impl MmContext {
    pub fn new(chan: &Arc<L3Channel>) -> Arc<MmContext> {
        Arc::new(MmContext {
            chan: Mutex::new(chan.clone()),
            use_count: Mutex::new(1),
            mmu: Mutex::new(None),
            slots: Mutex::new(std::array::from_fn(|_| None)),
            next_ti: Mutex::new(rand::thread_rng().gen_range(0..7)),
            service_requests: Mutex::new(VecDeque::new()),
            open_time: Instant::now(),
            termination_requested: AtomicBool::new(false),
            handover_penalty: Mutex::new(NeighborPenalty::default()),
        })
    }

    pub fn channel(&self) -> Arc<L3Channel> {
        self.chan.lock().clone()
    }

    pub fn set_channel(&self, chan: &Arc<L3Channel>) {
        *self.chan.lock() = chan.clone();
    }

    pub fn inc_use(&self) {
        *self.use_count.lock() += 1;
    }

    /// Decrement the channel use count; true when it reached zero and the
    /// context should be freed.
    pub(crate) fn dec_use(&self) -> bool {
        let mut count = self.use_count.lock();
        *count = count.saturating_sub(1);
        *count == 0
    }

    pub fn open_duration(&self) -> Duration {
        self.open_time.elapsed()
    }

    pub fn mmu(&self) -> Option<Arc<MmUser>> {
        self.mmu.lock().clone()
    }

    pub fn handover_penalty(&self) -> NeighborPenalty {
        self.handover_penalty.lock().clone()
    }

    pub fn set_handover_penalty(&self, penalty: NeighborPenalty) {
        *self.handover_penalty.lock() = penalty;
    }

    /// The IMSI if the subscriber has been identified.
    pub fn imsi(&self) -> Option<String> {
        self.mmu().map(|u| u.imsi().to_string())
    }

    // --- transaction slots ---------------------------------------------

    pub fn get_tran(&self, slot: TranSlot) -> Option<Arc<Transaction>> {
        self.slots.lock()[slot as usize].clone()
    }

    pub fn voice_tran(&self) -> Option<Arc<Transaction>> {
        self.get_tran(TranSlot::Cs1)
    }

    /// Install a transaction in a slot and point it back here.
    pub fn connect_tran(self: &Arc<Self>, slot: TranSlot, tran: &Arc<Transaction>) {
        let mut slots = self.slots.lock();
        if let Some(old) = &slots[slot as usize] {
            error!(
                slot = ?slot,
                old = old.id().0,
                new = tran.id().0,
                "slot already occupied, dropping old transaction reference"
            );
        }
        slots[slot as usize] = Some(tran.clone());
        drop(slots);
        tran.set_context(Some(self));
    }

    /// Remove a transaction from whatever slot holds it. Vacating MOSMS1
    /// promotes MOSMS2.
    pub fn disconnect_tran(&self, tran: &Arc<Transaction>) {
        let mut slots = self.slots.lock();
        let mut found = false;
        for slot in ALL_SLOTS {
            let occupied = matches!(&slots[slot as usize], Some(t) if Arc::ptr_eq(t, tran));
            if occupied {
                slots[slot as usize] = None;
                found = true;
                if slot == TranSlot::MoSms1 {
                    if let Some(follow_on) = slots[TranSlot::MoSms2 as usize].take() {
                        slots[TranSlot::MoSms1 as usize] = Some(follow_on);
                    }
                }
                break;
            }
        }
        drop(slots);
        if found {
            tran.set_context(None);
        } else {
            debug!(tran = tran.id().0, "disconnect: not in any slot");
        }
    }

    pub fn is_empty(&self) -> bool {
        let slots_empty = self.slots.lock().iter().all(|s| s.is_none());
        slots_empty && self.mmu().map(|u| u.queues_empty()).unwrap_or(true)
    }

    /// Is a mobility-management procedure running?
    pub fn in_mobility_management(&self) -> bool {
        self.get_tran(TranSlot::Mm).is_some()
    }

    pub fn tran_list(&self) -> Vec<Arc<Transaction>> {
        self.slots.lock().iter().flatten().cloned().collect()
    }

    /// Next network-allocated TI: round-robin 0..6, 7 is reserved.
    pub fn next_ti(&self) -> u8 {
        let mut ti = self.next_ti.lock();
        *ti += 1;
        if *ti >= 7 {
            *ti = 0;
        }
        *ti
    }

    /// Queue a CMServiceRequest for the next new-activity pass.
    pub fn push_service_request(&self, msg: L3Message) {
        self.service_requests.lock().push_back(msg);
    }

    // --- frame routing --------------------------------------------------

    /// Resolve which transaction a frame belongs to, by protocol
    /// discriminator and TI.
    pub fn find_tran(&self, frame: &L3Frame) -> Option<Arc<Transaction>> {
        // Naked primitives go to the MT-SMS machine, the only consumer
        // that waits on SAPI establishment.
        if !frame.is_data() {
            return self.get_tran(TranSlot::MtSms);
        }
        let pd = frame.pd()?;
        let ti = frame.ti().unwrap_or(0);
        match pd {
            L3Pd::Cc => {
                // Setup is special: it is the message that establishes the
                // TI correspondence.
                let is_setup = matches!(
                    frame.message(),
                    Some(L3Message::Setup { .. }) | Some(L3Message::EmergencySetup { .. })
                );
                let cs = self.get_tran(TranSlot::Cs1)?;
                if is_setup || cs.match_l3_ti(ti) {
                    Some(cs)
                } else {
                    None
                }
            }
            L3Pd::Sms => {
                let slots = self.slots.lock();
                for slot in [TranSlot::MoSms1, TranSlot::MoSms2, TranSlot::MtSms] {
                    if let Some(t) = &slots[slot as usize] {
                        if t.match_l3_ti(ti) {
                            return Some(t.clone());
                        }
                    }
                }
                // For MO-SMS the TI is not bound until the first CP-DATA,
                // so fall back to the primary MO-SMS transaction.
                slots[TranSlot::MoSms1 as usize].clone()
            }
            L3Pd::Rr | L3Pd::Mm => {
                let slots = self.slots.lock();
                ALL_SLOTS
                    .iter()
                    .find_map(|s| slots[*s as usize].clone())
            }
            L3Pd::NonCallSs => {
                // TI matching a call means in-call USSD; otherwise the
                // dedicated SS transaction.
                for slot in [TranSlot::Cs1, TranSlot::CsHold] {
                    if let Some(cs) = self.get_tran(slot) {
                        if cs.match_l3_ti(ti) {
                            info!(ti, "SS message matches call transaction");
                            return Some(cs);
                        }
                    }
                }
                self.get_tran(TranSlot::Ss)
            }
        }
    }

    /// Route one uplink frame to its transaction.
    pub fn dispatch_frame(self: &Arc<Self>, svc: &Services, frame: &L3Frame) -> DispatchOutcome {
        let Some(tran) = self.find_tran(frame) else {
            info!(%frame, "no transaction for frame, dropped");
            return DispatchOutcome::NotHandled;
        };
        if tran.is_dead() {
            info!(%frame, tran = tran.id().0, "frame for expired transaction, dropped");
            return DispatchOutcome::NotHandled;
        }
        tran.lock_and_invoke_frame(svc, frame)
    }

    // --- service-loop checks --------------------------------------------

    /// Deliver pending dialog-state changes. True if anything happened.
    pub fn check_sip_msgs(self: &Arc<Self>, svc: &Services) -> (bool, Option<TermCause>) {
        for tran in self.tran_list() {
            let (happened, close) = tran.check_sip(svc);
            if happened || close.is_some() {
                return (happened, close);
            }
        }
        (false, None)
    }

    /// Fire expired timers. True if anything happened.
    pub fn check_timers(self: &Arc<Self>, svc: &Services) -> (bool, Option<TermCause>) {
        for tran in self.tran_list() {
            let (happened, close) = tran.check_timers(svc);
            if happened || close.is_some() {
                return (happened, close);
            }
        }
        (false, None)
    }

    /// Look for new work: a queued CM service request, then queued MT
    /// transactions, then the empty-channel release. Returns whether
    /// anything happened and an optional channel-close cause.
    pub fn check_new_activity(self: &Arc<Self>, svc: &Services) -> (bool, Option<TermCause>) {
        // Nothing else starts while a mobility-management procedure runs.
        if !self.in_mobility_management() {
            if let Some(msg) = self.service_requests.lock().pop_front() {
                crate::dispatch::cm_service_responder(svc, self, &msg);
                return (true, None);
            }
            if let Some(mmu) = self.mmu() {
                if mmu.service_mt_queues(svc, self) {
                    return (true, None);
                }
            }
        }
        // All slots empty and the grace period passed: release the channel.
        if self.is_empty() && self.open_duration() > EMPTY_CONTEXT_GRACE {
            debug!("no transactions expected, closing channel");
            return (true, Some(TermCause::local(L3Cause::NoTransactionExpected)));
        }
        (false, None)
    }

    /// Consistency check after a paging response: these states mean the MS
    /// answered a page while already busy, which is a protocol violation
    /// worth logging.
    pub fn page_received(&self) {
        if let Some(t) = self.get_tran(TranSlot::Cs1) {
            error!(tran = t.id().0, "paging response while voice call active");
        }
        if let Some(t) = self.get_tran(TranSlot::MtSms) {
            error!(tran = t.id().0, "paging response while MT-SMS active");
        }
        // Nothing else to do: the service loop drains the MT queues.
    }

    // --- linking ---------------------------------------------------------

    /// Detach the MMUser, if any. Both back-pointers are cleared. The
    /// caller holds the MM structural lock.
    pub(crate) fn unlink_mmu(&self) {
        if let Some(mmu) = self.mmu.lock().take() {
            mmu.inner.lock().context = Weak::new();
        }
    }

    /// Attach a newly-identified MMUser to this context. If the user was
    /// attached to a different context (the handset reappeared on a new
    /// channel, e.g. a double paging response), its transactions move
    /// here and the old context is left to die with its channel.
    ///
    /// The caller holds the MM structural lock: the check of the user's
    /// current context and the rewrite of both back-pointers must not
    /// interleave with another link or unlink for the same user.
    pub(crate) fn link_mmu(self: &Arc<Self>, mmu: &Arc<MmUser>) {
        let old = mmu.inner.lock().context.upgrade();
        if let Some(old) = &old {
            if Arc::ptr_eq(old, self) {
                return; // already connected
            }
            debug!(imsi = mmu.imsi(), "reconnecting MMUser to a new channel");
            self.move_transactions(old);
            old.unlink_mmu();
        }
        self.unlink_mmu();
        *self.mmu.lock() = Some(mmu.clone());
        mmu.inner.lock().context = Arc::downgrade(self);
    }

    /// Move transactions from an abandoned context into our empty slots.
    /// Collisions keep the newer transaction; the old one dies with its
    /// channel.
    fn move_transactions(self: &Arc<Self>, old: &Arc<MmContext>) {
        for slot in ALL_SLOTS {
            let old_tran = old.get_tran(slot);
            let Some(old_tran) = old_tran else { continue };
            if self.get_tran(slot).is_none() {
                old.disconnect_tran(&old_tran);
                self.connect_tran(slot, &old_tran);
            } else {
                error!(
                    slot = ?slot,
                    old_tran = old_tran.id().0,
                    "handset changed channels with transactions running on both; keeping the newer"
                );
            }
        }
    }

    /// Cancel every transaction here. The context is dead afterwards.
    pub(crate) fn cancel_all(&self, svc: &Services, cause: &TermCause) {
        // Cancelling a primary may promote a secondary into its slot, so
        // sweep until stable.
        for _ in 0..3 {
            let trans = self.tran_list();
            if trans.is_empty() {
                break;
            }
            for tran in trans {
                tran.te_cancel(svc, cause.clone());
            }
        }
    }
}

impl std::fmt::Debug for MmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmContext")
            .field("imsi", &self.imsi())
            .field("open_for", &self.open_duration())
            .finish()
    }
}

/// Per-IMSI record: queued MT work awaiting paging, and the page timer.
pub struct MmUser {
    imsi: String,
    pub(crate) inner: Mutex<MmUserInner>,
}

pub(crate) struct MmUserInner {
    tmsi: Tmsi,
    did_tmsi_check: bool,
    pub(crate) context: Weak<MmContext>,
    mtc_q: VecDeque<Arc<Transaction>>,
    mtsms_q: VecDeque<Arc<Transaction>>,
    mtss_q: VecDeque<Arc<Transaction>>,
    page_expiry: Instant,
}

impl MmUser {
    fn new(imsi: String, page_ttl: Duration) -> Arc<MmUser> {
        Arc::new(MmUser {
            imsi,
            inner: Mutex::new(MmUserInner {
                tmsi: Tmsi::none(),
                did_tmsi_check: false,
                context: Weak::new(),
                mtc_q: VecDeque::new(),
                mtsms_q: VecDeque::new(),
                mtss_q: VecDeque::new(),
                page_expiry: Instant::now() + page_ttl,
            }),
        })
    }

    pub fn imsi(&self) -> &str {
        &self.imsi
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().context.upgrade().is_some()
    }

    pub fn context(&self) -> Option<Arc<MmContext>> {
        self.inner.lock().context.upgrade()
    }

    pub fn queues_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.mtc_q.is_empty() && inner.mtsms_q.is_empty() && inner.mtss_q.is_empty()
    }

    /// The TMSI, looked up in the TMSI table once per MMUser lifetime.
    pub fn tmsi(&self, svc: &Services) -> Tmsi {
        let mut inner = self.inner.lock();
        if !inner.did_tmsi_check {
            inner.did_tmsi_check = true;
            if let Some(t) = svc.tmsi.tmsi_for_imsi(&self.imsi) {
                inner.tmsi = Tmsi::new(t);
            }
        }
        inner.tmsi
    }

    pub(crate) fn page_expired(&self) -> bool {
        Instant::now() >= self.inner.lock().page_expiry
    }

    pub(crate) fn extend_page_expiry(&self, ttl: Duration) {
        self.inner.lock().page_expiry = Instant::now() + ttl;
    }

    /// Queue an MT transaction by its service type.
    pub(crate) fn add_mt(&self, tran: Arc<Transaction>) {
        use crate::tran::ServiceType::*;
        let mut inner = self.inner.lock();
        match tran.service() {
            MobileTerminatedCall => inner.mtc_q.push_back(tran),
            MtSms => inner.mtsms_q.push_back(tran),
            MtSupplementaryService => inner.mtss_q.push_back(tran),
            other => {
                error!(service = other.name(), "not a mobile-terminated service");
            }
        }
    }

    /// The channel type to page for: a TCH if the first queued item is a
    /// voice call and very-early assignment is configured.
    pub fn initial_chan_type(&self, svc: &Services) -> ChannelType {
        let voice_first = !self.inner.lock().mtc_q.is_empty();
        if voice_first && svc.config.vea() {
            ChannelType::TchF
        } else {
            ChannelType::Sdcch
        }
    }

    /// Move one queued MT transaction into a free slot and start its
    /// machine. True if something started.
    pub fn service_mt_queues(&self, svc: &Services, mmc: &Arc<MmContext>) -> bool {
        use crate::procedures;
        // Pop under the queue lock; start machines after releasing it.
        let popped = {
            let mut inner = self.inner.lock();
            if mmc.get_tran(TranSlot::Cs1).is_none() && !inner.mtc_q.is_empty() {
                inner.mtc_q.pop_front().map(|t| (TranSlot::Cs1, t))
            } else if mmc.get_tran(TranSlot::MtSms).is_none() && !inner.mtsms_q.is_empty() {
                inner.mtsms_q.pop_front().map(|t| (TranSlot::MtSms, t))
            } else if mmc.get_tran(TranSlot::Ss).is_none() && !inner.mtss_q.is_empty() {
                inner.mtss_q.pop_front().map(|t| (TranSlot::Ss, t))
            } else {
                None
            }
        };
        let Some((slot, tran)) = popped else {
            return false;
        };
        info!(slot = ?slot, tran = tran.id().0, "starting queued MT transaction");
        mmc.connect_tran(slot, &tran);
        let outcome = match slot {
            TranSlot::Cs1 => tran.lock_and_start(svc, procedures::cc::mtc_machine(), None),
            TranSlot::MtSms => tran.lock_and_start(svc, procedures::sms::mtsms_machine(), None),
            TranSlot::Ss => tran.lock_and_start(svc, procedures::ss::mtss_machine(), None),
            _ => unreachable!(),
        };
        crate::dispatch::finish_start(svc, mmc, outcome);
        true
    }

    /// Cancel everything still queued.
    fn fail_all(&self, svc: &Services, cause: &TermCause) {
        let drained: Vec<Arc<Transaction>> = {
            let mut inner = self.inner.lock();
            let mtc: Vec<Arc<Transaction>> = inner.mtc_q.drain(..).collect();
            let mtsms: Vec<Arc<Transaction>> = inner.mtsms_q.drain(..).collect();
            let mtss: Vec<Arc<Transaction>> = inner.mtss_q.drain(..).collect();
            mtc.into_iter().chain(mtsms).chain(mtss).collect()
        };
        for tran in drained {
            tran.te_cancel(svc, cause.clone());
        }
    }
}

/// The registry: IMSI to MMUser, plus the pager wakeup.
pub struct MmLayer {
    users: Mutex<HashMap<String, Arc<MmUser>>>,
    /// The coarse structural lock. Held across MMUser<->MMContext
    /// attachment, detachment, and cross-context transaction moves, so a
    /// concurrent re-link for the same user (double paging response,
    /// handset reappearing on a new channel) cannot interleave with
    /// another and leave the back-pointers disagreeing. See the module
    /// docs for the ordering rules.
    gmm: Mutex<()>,
    page_mutex: Mutex<bool>,
    page_cv: Condvar,
}

impl MmLayer {
    pub fn new() -> Arc<MmLayer> {
        Arc::new(MmLayer {
            users: Mutex::new(HashMap::new()),
            gmm: Mutex::new(()),
            page_mutex: Mutex::new(false),
            page_cv: Condvar::new(),
        })
    }

    pub fn find_by_imsi(&self, imsi: &str, create: bool, page_ttl: Duration) -> Option<Arc<MmUser>> {
        let mut users = self.users.lock();
        if let Some(u) = users.get(imsi) {
            return Some(u.clone());
        }
        if create {
            let user = MmUser::new(imsi.to_string(), page_ttl);
            users.insert(imsi.to_string(), user.clone());
            debug!(imsi, "new MMUser");
            Some(user)
        } else {
            None
        }
    }

    pub fn find_by_tmsi(&self, svc: &Services, tmsi: u32) -> Option<Arc<MmUser>> {
        let users: Vec<Arc<MmUser>> = self.users.lock().values().cloned().collect();
        users
            .into_iter()
            .find(|u| u.tmsi(svc).value() == Some(tmsi))
    }

    pub fn find_by_mobile_id(&self, svc: &Services, mid: &MobileIdentity) -> Option<Arc<MmUser>> {
        match mid {
            MobileIdentity::Imsi(digits) => {
                self.find_by_imsi(digits, false, Duration::from_secs(0))
            }
            MobileIdentity::Tmsi(value) => self.find_by_tmsi(svc, *value),
            _ => None,
        }
    }

    /// The SIP side has new mobile-terminated work: queue it and wake the
    /// pager.
    pub fn add_mt(&self, svc: &Services, tran: Arc<Transaction>) {
        let imsi = tran.subscriber_imsi();
        let ttl = svc.config.t3113();
        let Some(user) = self.find_by_imsi(&imsi, true, ttl) else {
            return;
        };
        user.extend_page_expiry(ttl);
        user.add_mt(tran);
        // If the handset is already on a channel, the service loop drains
        // the queue; otherwise the pager starts paging.
        self.signal_pager();
    }

    /// A repeated INVITE/MESSAGE while still paging: keep paging.
    pub fn mt_repage(&self, svc: &Services, imsi: &str) {
        match self.find_by_imsi(imsi, false, Duration::from_secs(0)) {
            Some(user) if !user.is_attached() => {
                user.extend_page_expiry(svc.config.t3113());
            }
            Some(_) => {}
            None => debug!(imsi, "repeated MT with no MMUser record"),
        }
    }

    /// A paging response arrived on `mmc`: connect the MMUser. False means
    /// nobody is paging this identity (the caller releases the channel).
    pub fn page_received(&self, svc: &Services, mmc: &Arc<MmContext>, mid: &MobileIdentity) -> bool {
        let Some(user) = self.find_by_mobile_id(svc, mid) else {
            return false;
        };
        info!(imsi = user.imsi(), "paging response");
        {
            let _structural = self.gmm.lock();
            mmc.link_mmu(&user);
        }
        mmc.page_received();
        true
    }

    /// The subscriber has been positively identified on `mmc`: attach.
    pub fn attach_by_imsi(&self, svc: &Services, mmc: &Arc<MmContext>, imsi: &str) {
        let ttl = svc.config.t3113();
        if let Some(user) = self.find_by_imsi(imsi, true, ttl) {
            let _structural = self.gmm.lock();
            mmc.link_mmu(&user);
        }
    }

    /// Operator-initiated teardown. True if the IMSI was known.
    pub fn terminate_by_imsi(&self, svc: &Services, imsi: &str) -> bool {
        let Some(user) = self.find_by_imsi(imsi, false, Duration::from_secs(0)) else {
            return false;
        };
        match user.context() {
            Some(mmc) => {
                // Don't close from here: a close sends a message and would
                // block this thread. Flag it for the channel's own loop.
                mmc.termination_requested.store(true, Ordering::Release);
            }
            None => {
                user.fail_all(svc, &TermCause::local(L3Cause::OperatorIntervention));
                self.users.lock().remove(imsi);
            }
        }
        true
    }

    /// Produce the paging list: every unattached MMUser still within its
    /// page window. Expired users are destroyed here, failing their queued
    /// transactions.
    pub fn get_pages(&self, svc: &Services) -> Vec<PagingEntry> {
        let snapshot: Vec<Arc<MmUser>> = self.users.lock().values().cloned().collect();
        let mut pages = Vec::with_capacity(snapshot.len());
        for user in snapshot {
            if user.is_attached() {
                continue;
            }
            if user.page_expired() {
                info!(imsi = user.imsi(), "page expired");
                self.users.lock().remove(user.imsi());
                user.fail_all(svc, &TermCause::local(L3Cause::NoPagingResponse));
                continue;
            }
            pages.push(PagingEntry {
                channel_type: user.initial_chan_type(svc),
                imsi: user.imsi().to_string(),
                tmsi: user.tmsi(svc).value(),
            });
        }
        pages
    }

    /// Release a channel's context: decrement the use count, and on the
    /// last release unlink the MMUser and cancel everything left.
    pub fn free_context(&self, svc: &Services, mmc: &Arc<MmContext>, cause: TermCause) {
        if !mmc.dec_use() {
            return;
        }
        {
            let _structural = self.gmm.lock();
            let mmu = mmc.mmu();
            mmc.unlink_mmu();
            if let Some(mmu) = mmu {
                // If the MMUser still has queued work, leave it: paging
                // will restart and find the handset again. Destroy it
                // only when empty.
                if mmu.queues_empty() {
                    self.users.lock().remove(mmu.imsi());
                }
            }
        }
        // Cancellation waits on each transaction's run lock and can end
        // SIP dialogs, so it happens outside the structural lock.
        mmc.cancel_all(svc, &cause);
    }

    pub fn signal_pager(&self) {
        let mut flagged = self.page_mutex.lock();
        *flagged = true;
        self.page_cv.notify_all();
    }

    /// Park the pager thread until the next signal or timeout.
    pub fn wait_page_signal(&self, timeout: Duration) {
        let mut flagged = self.page_mutex.lock();
        if !*flagged {
            self.page_cv.wait_for(&mut flagged, timeout);
        }
        *flagged = false;
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    /// Is the single MT-call slot busy for this IMSI (queued or active)?
    pub fn is_busy(&self, imsi: &str) -> bool {
        let Some(user) = self.find_by_imsi(imsi, false, Duration::from_secs(0)) else {
            return false;
        };
        if !user.inner.lock().mtc_q.is_empty() {
            return true;
        }
        match user.context() {
            Some(mmc) => mmc.voice_tran().is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_ti_skips_seven() {
        let chan = crate::channel::L3Channel::for_test();
        let mmc = MmContext::new(&chan);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let ti = mmc.next_ti();
            assert!(ti < 7, "TI 7 is reserved");
            seen.insert(ti);
        }
        assert_eq!(seen.len(), 7);
    }
}
