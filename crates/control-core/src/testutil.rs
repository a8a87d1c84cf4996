//! Test doubles for the external boundaries.
//!
//! The control layer's collaborators (LAPDm channels, SIP dialogs, the
//! registrar, peering, the radio layer) are traits, so the test suite
//! drives the real state machines against the mocks here: frames go in
//! through a [`MockL2`], everything sent downlink is recorded, dialog
//! state is scripted by hand.

use crate::cause::RrCause;
use crate::cdr::CdrSender;
use crate::channel::{HandoverAccessRecord, L2Channel, L3Channel};
use crate::codec::CodecSet;
use crate::config::{default_config_store, Config};
use crate::handover::{HandoverEntry, HandoverOffer, PeerInterface};
use crate::identity::FullMobileId;
use crate::l3::{AudioFrame, ChannelType, L3Frame, L3Message};
use crate::paging::PagingEntry;
use crate::services::{RadioLayer, Services};
use crate::sip::{DialogState, Registrar, RegisterOutcome, SipDialog, SipInterface};
use crate::tmsi::MemoryTmsiStore;
use crate::tran::Transaction;
use crossbeam_channel::{unbounded, Receiver, Sender};
use opencell_infra_common::ConfigStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A scripted LAPDm channel: the test pushes uplink frames, the layer's
/// downlink lands in a list for assertions.
pub struct MockL2 {
    uplink_tx: Sender<L3Frame>,
    uplink_rx: Receiver<L3Frame>,
    downlink: Mutex<Vec<L3Frame>>,
    chan_type: ChannelType,
    radio_failed: AtomicBool,
    audio_up: Mutex<VecDeque<AudioFrame>>,
    audio_down: Mutex<Vec<AudioFrame>>,
    handover_access: Mutex<HandoverAccessRecord>,
    desc: String,
}

impl MockL2 {
    pub fn new(chan_type: ChannelType, desc: impl Into<String>) -> Arc<MockL2> {
        let (uplink_tx, uplink_rx) = unbounded();
        Arc::new(MockL2 {
            uplink_tx,
            uplink_rx,
            downlink: Mutex::new(Vec::new()),
            chan_type,
            radio_failed: AtomicBool::new(false),
            audio_up: Mutex::new(VecDeque::new()),
            audio_down: Mutex::new(Vec::new()),
            handover_access: Mutex::new(HandoverAccessRecord::default()),
            desc: desc.into(),
        })
    }

    /// Push an uplink frame as if the handset had sent it.
    pub fn push_uplink(&self, frame: L3Frame) {
        self.uplink_tx.send(frame).expect("uplink queue");
    }

    pub fn push_uplink_msg(&self, msg: L3Message) {
        self.push_uplink(L3Frame::data(msg));
    }

    /// Everything sent downlink so far.
    pub fn sent(&self) -> Vec<L3Frame> {
        self.downlink.lock().clone()
    }

    /// Drain the downlink record.
    pub fn take_sent(&self) -> Vec<L3Frame> {
        std::mem::take(&mut *self.downlink.lock())
    }

    /// Just the decoded messages sent downlink.
    pub fn sent_messages(&self) -> Vec<L3Message> {
        self.sent()
            .iter()
            .filter_map(|f| f.message().cloned())
            .collect()
    }

    pub fn fail_radio(&self) {
        self.radio_failed.store(true, Ordering::Release);
    }

    pub fn push_uplink_audio(&self, frame: AudioFrame) {
        self.audio_up.lock().push_back(frame);
    }

    pub fn downlink_audio(&self) -> Vec<AudioFrame> {
        self.audio_down.lock().clone()
    }

    pub fn set_handover_access(&self, record: HandoverAccessRecord) {
        *self.handover_access.lock() = record;
    }
}

impl L2Channel for MockL2 {
    fn recv(&self, timeout: Duration) -> Option<L3Frame> {
        self.uplink_rx.recv_timeout(timeout).ok()
    }

    fn send(&self, frame: L3Frame) {
        self.downlink.lock().push(frame);
    }

    fn chan_type(&self) -> ChannelType {
        self.chan_type
    }

    fn radio_failure(&self) -> bool {
        self.radio_failed.load(Ordering::Acquire)
    }

    fn audio_queue_len(&self) -> usize {
        self.audio_up.lock().len()
    }

    fn recv_audio(&self) -> Option<AudioFrame> {
        self.audio_up.lock().pop_front()
    }

    fn send_audio(&self, frame: AudioFrame) {
        self.audio_down.lock().push(frame);
    }

    fn handover_record(&self) -> HandoverAccessRecord {
        *self.handover_access.lock()
    }

    fn descriptive(&self) -> String {
        self.desc.clone()
    }
}

/// A hand-driven SIP dialog: the test moves the state, the layer's calls
/// are recorded.
pub struct MockDialog {
    state: Mutex<DialogState>,
    final_response: Mutex<Option<(u16, String)>>,
    actions: Mutex<Vec<String>>,
    audio_to_ms: Mutex<VecDeque<AudioFrame>>,
    audio_from_ms: Mutex<Vec<AudioFrame>>,
}

impl MockDialog {
    pub fn new() -> Arc<MockDialog> {
        Arc::new(MockDialog {
            state: Mutex::new(DialogState::Started),
            final_response: Mutex::new(None),
            actions: Mutex::new(Vec::new()),
            audio_to_ms: Mutex::new(VecDeque::new()),
            audio_from_ms: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: DialogState) {
        *self.state.lock() = state;
    }

    pub fn set_final_response(&self, code: u16, reason: &str) {
        *self.final_response.lock() = Some((code, reason.to_string()));
    }

    /// The calls made on this dialog, in order ("bye", "ack", "200 OK"...).
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    fn record(&self, action: impl Into<String>) {
        self.actions.lock().push(action.into());
    }

    pub fn queue_downlink_audio(&self, frame: AudioFrame) {
        self.audio_to_ms.lock().push_back(frame);
    }

    pub fn uplink_audio(&self) -> Vec<AudioFrame> {
        self.audio_from_ms.lock().clone()
    }
}

impl SipDialog for MockDialog {
    fn state(&self) -> DialogState {
        *self.state.lock()
    }

    fn final_response(&self) -> Option<(u16, String)> {
        self.final_response.lock().clone()
    }

    fn reply(&self, code: u16, reason: &str) {
        self.record(format!("{} {}", code, reason));
    }

    fn send_trying(&self) {
        self.record("trying");
    }

    fn send_ack(&self) {
        self.record("ack");
    }

    fn send_bye(&self, _reason_header: &str) {
        self.record("bye");
        *self.state.lock() = DialogState::Bye;
    }

    fn send_cancel(&self, _reason_header: &str) {
        self.record("cancel");
        *self.state.lock() = DialogState::Fail;
    }

    fn send_info_dtmf(&self, key: char) -> bool {
        self.record(format!("dtmf {}", key));
        true
    }

    fn init_rtp(&self) {
        self.record("init-rtp");
    }

    fn tx_audio(&self, frame: AudioFrame, _flushed: usize) {
        self.audio_from_ms.lock().push(frame);
    }

    fn rx_audio(&self) -> Option<AudioFrame> {
        self.audio_to_ms.lock().pop_front()
    }
}

/// Records dialog creations; optionally refuses them.
pub struct MockSipInterface {
    pub created: Mutex<Vec<(String, Arc<MockDialog>)>>,
    pub refuse: AtomicBool,
}

impl MockSipInterface {
    pub fn new() -> Arc<MockSipInterface> {
        Arc::new(MockSipInterface {
            created: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
        })
    }

    /// The most recently created dialog.
    pub fn last_dialog(&self) -> Option<Arc<MockDialog>> {
        self.created.lock().last().map(|(_, d)| d.clone())
    }
}

impl SipInterface for MockSipInterface {
    fn new_moc_dialog(
        &self,
        _subscriber: &FullMobileId,
        called: &str,
        _codecs: CodecSet,
    ) -> Option<Arc<dyn SipDialog>> {
        if self.refuse.load(Ordering::Acquire) {
            return None;
        }
        let dialog = MockDialog::new();
        self.created
            .lock()
            .push((format!("INVITE {}", called), dialog.clone()));
        Some(dialog)
    }

    fn new_mosms_dialog(
        &self,
        _subscriber: &FullMobileId,
        to_address: &str,
        body: &str,
        _content_type: &str,
    ) -> Option<Arc<dyn SipDialog>> {
        if self.refuse.load(Ordering::Acquire) {
            return None;
        }
        let dialog = MockDialog::new();
        self.created
            .lock()
            .push((format!("MESSAGE {} {}", to_address, body), dialog.clone()));
        Some(dialog)
    }
}

/// Answers REGISTERs from a script, recording each call.
pub struct ScriptedRegistrar {
    script: Mutex<VecDeque<RegisterOutcome>>,
    pub calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedRegistrar {
    pub fn new() -> Arc<ScriptedRegistrar> {
        Arc::new(ScriptedRegistrar {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, outcome: RegisterOutcome) {
        self.script.lock().push_back(outcome);
    }
}

impl Registrar for ScriptedRegistrar {
    fn register(&self, imsi: &str, sres: Option<&str>) -> RegisterOutcome {
        self.calls
            .lock()
            .push((imsi.to_string(), sres.map(str::to_string)));
        self.script
            .lock()
            .pop_front()
            .unwrap_or(RegisterOutcome::Error)
    }
}

/// Peering double: scripted handover offers, recorded failures.
pub struct MockPeering {
    pub offer: Mutex<Option<HandoverOffer>>,
    pub requests: Mutex<Vec<(String, u64)>>,
    pub failures: Mutex<Vec<(String, RrCause)>>,
    pub neighbors: Mutex<Vec<(u32, u32, String)>>,
    pub holdoffs: Mutex<Vec<String>>,
}

impl MockPeering {
    pub fn new() -> Arc<MockPeering> {
        Arc::new(MockPeering {
            offer: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            neighbors: Mutex::new(Vec::new()),
            holdoffs: Mutex::new(Vec::new()),
        })
    }

    pub fn add_neighbor(&self, arfcn: u32, bsic: u32, addr: &str) {
        self.neighbors.lock().push((arfcn, bsic, addr.to_string()));
    }
}

impl PeerInterface for MockPeering {
    fn send_handover_request(
        &self,
        peer: &str,
        tran: &Arc<Transaction>,
        _cause: &str,
    ) -> Option<HandoverOffer> {
        self.requests.lock().push((peer.to_string(), tran.id().0));
        self.offer.lock().clone()
    }

    fn send_handover_failure(&self, entry: &HandoverEntry, cause: RrCause, _holdoff: Duration) {
        self.failures.lock().push((entry.peer.clone(), cause));
    }

    fn neighbor_address(&self, arfcn: u32, bsic: u32) -> Option<String> {
        self.neighbors
            .lock()
            .iter()
            .find(|(a, b, _)| *a == arfcn && *b == bsic)
            .map(|(_, _, addr)| addr.clone())
    }

    fn holding_off(&self, peer: &str) -> bool {
        self.holdoffs.lock().iter().any(|p| p == peer)
    }
}

/// Radio double: a TCH pool the layer can allocate from, and the
/// published paging lists.
pub struct MockRadio {
    pub tch_pool: Mutex<Vec<Arc<L3Channel>>>,
    pub pages: Mutex<Vec<Vec<PagingEntry>>>,
}

impl MockRadio {
    pub fn new() -> Arc<MockRadio> {
        Arc::new(MockRadio {
            tch_pool: Mutex::new(Vec::new()),
            pages: Mutex::new(Vec::new()),
        })
    }

    /// Seed the pool with a TCH built over a fresh MockL2; returns the L2
    /// for later inspection.
    pub fn add_tch(&self, desc: &str) -> (Arc<MockL2>, Arc<L3Channel>) {
        let l2 = MockL2::new(ChannelType::TchF, desc);
        let chan = L3Channel::new(l2.clone());
        self.tch_pool.lock().push(chan.clone());
        (l2, chan)
    }

    pub fn published_pages(&self) -> Vec<Vec<PagingEntry>> {
        self.pages.lock().clone()
    }
}

impl RadioLayer for MockRadio {
    fn allocate_tch(&self) -> Option<Arc<L3Channel>> {
        self.tch_pool.lock().pop()
    }

    fn publish_pages(&self, pages: &[PagingEntry]) {
        self.pages.lock().push(pages.to_vec());
    }
}

/// Everything a test needs in one place.
pub struct TestHarness {
    pub svc: Services,
    pub store: Arc<ConfigStore>,
    pub tmsi: Arc<MemoryTmsiStore>,
    pub registrar: Arc<ScriptedRegistrar>,
    pub sipif: Arc<MockSipInterface>,
    pub peering: Arc<MockPeering>,
    pub radio: Arc<MockRadio>,
}

impl TestHarness {
    pub fn new() -> TestHarness {
        let store = Arc::new(default_config_store());
        let tmsi = Arc::new(MemoryTmsiStore::new());
        let registrar = ScriptedRegistrar::new();
        let sipif = MockSipInterface::new();
        let peering = MockPeering::new();
        let radio = MockRadio::new();
        let svc = Services::new(
            Config::new(store.clone()),
            tmsi.clone(),
            registrar.clone(),
            sipif.clone(),
            peering.clone(),
            radio.clone(),
            CdrSender::disabled(),
        );
        TestHarness {
            svc,
            store,
            tmsi,
            registrar,
            sipif,
            peering,
            radio,
        }
    }

    /// A fresh established SDCCH with its context created.
    pub fn sdcch(&self) -> (Arc<MockL2>, Arc<L3Channel>) {
        let l2 = MockL2::new(ChannelType::Sdcch, "SDCCH/8-1");
        let chan = L3Channel::new(l2.clone());
        chan.set_state(crate::channel::ChannelState::Established);
        chan.get_context(true);
        (l2, chan)
    }

    /// A fresh established TCH with its context created.
    pub fn tch(&self) -> (Arc<MockL2>, Arc<L3Channel>) {
        let l2 = MockL2::new(ChannelType::TchF, "TCH/F-1");
        let chan = L3Channel::new(l2.clone());
        chan.set_state(crate::channel::ChannelState::Established);
        chan.get_context(true);
        (l2, chan)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
