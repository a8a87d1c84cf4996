//! End-to-end flows through the control layer, driven over the mock
//! boundaries: frames in through a fake LAPDm, dialog states moved by
//! hand, registrar answers scripted.

use opencell_control_core::cause::L3Cause;
use opencell_control_core::channel::ChannelState;
use opencell_control_core::dispatch::{handle_frame, service_pass};
use opencell_control_core::handover::{self, ChannelHistory, HandoverOffer};
use opencell_control_core::identity::{FullMobileId, MobileIdentity};
use opencell_control_core::l3::{
    CmServiceType, L3Frame, L3Message, LocationUpdateType, MeasurementReport, Primitive,
    RpMessage, Sapi, Tpdu,
};
use opencell_control_core::mm::TranSlot;
use opencell_control_core::sip::{DialogState, RegisterOutcome};
use opencell_control_core::testutil::TestHarness;
use opencell_control_core::tmsi::TmsiStore;
use opencell_control_core::tran::{CallState, Transaction};
use std::time::Duration;

const IMSI: &str = "001010123456789";

fn authorize(h: &TestHarness, imsi: &str) {
    h.tmsi.set_authorization(imsi, true, None);
}

fn cm_service_request(service: CmServiceType) -> L3Frame {
    L3Frame::data(L3Message::CmServiceRequest {
        service,
        mobile_id: MobileIdentity::Imsi(IMSI.to_string()),
    })
}

fn drain(h: &TestHarness, chan: &std::sync::Arc<opencell_control_core::channel::L3Channel>) {
    // One pass per pending item; a few passes settle everything queued.
    for _ in 0..4 {
        service_pass(&h.svc, chan, Duration::ZERO);
    }
}

#[test]
fn mo_call_happy_path() {
    let h = TestHarness::new();
    authorize(&h, IMSI);
    let (tch_l2, _tch_chan) = h.radio.add_tch("TCH/F-7");
    let (l2, chan) = h.sdcch();

    // CM service request is queued, then drained into the MOC start.
    handle_frame(&h.svc, &chan, &cm_service_request(CmServiceType::MobileOriginatedCall));
    drain(&h, &chan);
    let sent = l2.sent_messages();
    assert!(
        sent.iter().any(|m| matches!(m, L3Message::CmServiceAccept)),
        "expected CMServiceAccept, got {:?}",
        sent
    );

    // Setup establishes the TI and fires the INVITE.
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::Setup {
            ti: 0,
            called: Some("+15551234".into()),
            calling: None,
            codecs: Default::default(),
        }),
    );
    let sent = l2.sent_messages();
    assert!(
        sent.iter()
            .any(|m| matches!(m, L3Message::CallProceeding { ti: 8 })),
        "CallProceeding with the direction bit set, got {:?}",
        sent
    );
    assert!(sent
        .iter()
        .any(|m| matches!(m, L3Message::AssignmentCommand { .. })));
    let dialog = h.sipif.last_dialog().expect("INVITE dialog created");

    let mmc = chan.get_context(false).unwrap();
    let tran = mmc.voice_tran().expect("CS1 occupied");
    assert_eq!(tran.gsm_state(), CallState::MocProceeding);

    // The MS shows up on the new TCH and completes the assignment.
    let tch_chan = chan.next_chan().expect("reassignment target");
    handle_frame(&h.svc, &tch_chan, &L3Frame::data(L3Message::AssignmentComplete));
    assert_eq!(chan.state(), ChannelState::RequestHardRelease);
    assert!(std::sync::Arc::ptr_eq(&mmc.channel(), &tch_chan));

    // SIP progresses: ringing, then answer.
    dialog.set_state(DialogState::Ringing);
    drain(&h, &tch_chan);
    assert!(tch_l2
        .sent_messages()
        .iter()
        .any(|m| matches!(m, L3Message::Alerting { ti: 8, progress: Some(_) })));
    assert_eq!(tran.gsm_state(), CallState::MocDelivered);

    dialog.set_state(DialogState::Active);
    drain(&h, &tch_chan);
    assert!(tch_l2
        .sent_messages()
        .iter()
        .any(|m| matches!(m, L3Message::Connect { ti: 8 })));
    assert!(dialog.actions().contains(&"ack".to_string()));
    assert!(dialog.actions().contains(&"init-rtp".to_string()));

    handle_frame(
        &h.svc,
        &tch_chan,
        &L3Frame::data(L3Message::ConnectAcknowledge { ti: 0 }),
    );
    assert_eq!(tran.gsm_state(), CallState::Active);

    // Media moves both ways through the bridge.
    tch_l2.push_uplink_audio(opencell_control_core::l3::AudioFrame::new(vec![1u8; 33]));
    dialog.queue_downlink_audio(opencell_control_core::l3::AudioFrame::new(vec![2u8; 33]));
    let moved = opencell_control_core::bridge::update_call_traffic(&h.svc, &tran, &tch_chan);
    assert!(moved > 0);
    assert_eq!(dialog.uplink_audio().len(), 1);
    assert_eq!(tch_l2.downlink_audio().len(), 1);

    // The handset hangs up.
    handle_frame(
        &h.svc,
        &tch_chan,
        &L3Frame::data(L3Message::Disconnect {
            ti: 0,
            cause: L3Cause::NormalCallClearing,
        }),
    );
    assert!(tch_l2
        .sent_messages()
        .iter()
        .any(|m| matches!(m, L3Message::Release { ti: 8, .. })));
    assert!(dialog.actions().contains(&"bye".to_string()));

    handle_frame(
        &h.svc,
        &tch_chan,
        &L3Frame::data(L3Message::ReleaseComplete { ti: 0, cause: None }),
    );
    assert!(tran.is_dead());
    assert!(mmc.voice_tran().is_none(), "CS1 slot vacated");
}

#[test]
fn mt_call_cancelled_before_confirm() {
    let h = TestHarness::new();
    authorize(&h, IMSI);
    h.tmsi.assign_tmsi(IMSI);

    // An MT call arrives from the SIP side and waits on paging.
    let dialog = opencell_control_core::testutil::MockDialog::new();
    let tran = Transaction::new_mtc(
        FullMobileId::from_imsi(IMSI),
        dialog.clone(),
        "+15550001".to_string(),
    );
    h.svc.mm.add_mt(&h.svc, tran.clone());
    let pages = h.svc.mm.get_pages(&h.svc);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].imsi, IMSI);

    // Paging response connects the MMUser to the channel, and the queued
    // MTC starts on the next pass.
    let (l2, chan) = h.sdcch();
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::PagingResponse {
            mobile_id: MobileIdentity::Imsi(IMSI.to_string()),
        }),
    );
    drain(&h, &chan);
    let setup_ti = l2
        .sent_messages()
        .iter()
        .find_map(|m| match m {
            L3Message::Setup { ti, calling, .. } => {
                assert_eq!(calling.as_deref(), Some("+15550001"));
                Some(*ti)
            }
            _ => None,
        })
        .expect("MT Setup sent");
    assert!(setup_ti < 7);
    assert_eq!(tran.gsm_state(), CallState::CallPresent);
    assert!(dialog.actions().contains(&"trying".to_string()));

    // The peer CANCELs before CallConfirmed.
    dialog.set_final_response(487, "Request Terminated");
    dialog.set_state(DialogState::Fail);
    drain(&h, &chan);
    assert!(tran.is_dead());
    let clearing = l2.sent_messages();
    assert!(
        clearing.iter().any(|m| matches!(
            m,
            L3Message::ReleaseComplete {
                cause: Some(L3Cause::CallRejected),
                ..
            }
        )),
        "clearing message carries cause 21, got {:?}",
        clearing
    );
}

#[test]
fn lur_with_tmsi_collision_recovers_once() {
    let h = TestHarness::new();
    let imsi_y = "001010000000001";
    let imsi_y2 = "001010000000002";
    // The table maps TMSI X to Y; the handset actually is Y2.
    h.tmsi.set_authorization(imsi_y, true, None);
    let tmsi_x = h.tmsi.assign_tmsi(imsi_y);

    h.registrar.push(RegisterOutcome::Challenge {
        rand: "00112233-4455-6677-8899-aabbccddeeff".into(),
    });
    h.registrar.push(RegisterOutcome::Fail {
        sip_code: 401,
        reject_cause: None,
    });
    h.registrar.push(RegisterOutcome::Challenge {
        rand: "ffeeddccbbaa99887766554433221100".into(),
    });
    h.registrar.push(RegisterOutcome::Success {
        kc: "0123456789abcdef".into(),
        associated_uri: "sip:y2@net".into(),
        asserted_identity: "sip:+15551000@net".into(),
    });

    let (l2, chan) = h.sdcch();
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::LocationUpdatingRequest {
            lu_type: LocationUpdateType::Normal,
            lai: h.svc.config.lai(),
            mobile_id: MobileIdentity::Tmsi(tmsi_x),
        }),
    );
    // First challenge goes out against Y.
    assert!(l2
        .sent_messages()
        .iter()
        .any(|m| matches!(m, L3Message::AuthenticationRequest { .. })));

    // Wrong SRES (it is Y2's SIM): registration fails, the layer
    // re-identifies by IMSI.
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::AuthenticationResponse {
            sres: "11223344".into(),
        }),
    );
    assert!(l2
        .sent_messages()
        .iter()
        .any(|m| matches!(m, L3Message::IdentityRequest { .. })));

    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::IdentityResponse {
            mobile_id: MobileIdentity::Imsi(imsi_y2.to_string()),
        }),
    );
    // Second challenge, now for Y2.
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::AuthenticationResponse {
            sres: "55667788".into(),
        }),
    );

    // Accept carries a fresh TMSI for Y2.
    let new_tmsi = l2
        .sent_messages()
        .iter()
        .find_map(|m| match m {
            L3Message::LocationUpdatingAccept {
                new_tmsi: Some(t), ..
            } => Some(*t),
            _ => None,
        })
        .expect("accept with TMSI reallocation");
    assert_ne!(new_tmsi, tmsi_x);
    assert_eq!(h.tmsi.by_tmsi(new_tmsi).unwrap().imsi, imsi_y2);

    // The reallocation completes and the MM transaction winds up.
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::TmsiReallocationComplete),
    );
    let mmc = chan.get_context(false).unwrap();
    assert!(mmc.get_tran(TranSlot::Mm).is_none());

    // The registrar saw Y twice (query + challenge answer) then Y2 twice.
    let calls = h.registrar.calls.lock().clone();
    let imsis: Vec<&str> = calls.iter().map(|(i, _)| i.as_str()).collect();
    assert_eq!(imsis, vec![imsi_y, imsi_y, imsi_y2, imsi_y2]);
    assert!(h.tmsi.is_authorized(imsi_y2));
}

#[test]
fn very_early_assignment_skips_reassignment() {
    let h = TestHarness::new();
    authorize(&h, IMSI);
    h.store.set("Control.VEA", "1");
    let (l2, chan) = h.tch();

    handle_frame(&h.svc, &chan, &cm_service_request(CmServiceType::MobileOriginatedCall));
    drain(&h, &chan);
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::Setup {
            ti: 1,
            called: Some("+15551234".into()),
            calling: None,
            codecs: Default::default(),
        }),
    );
    let sent = l2.sent_messages();
    assert!(
        sent.iter()
            .any(|m| matches!(m, L3Message::ChannelModeModify { mode_speech: true })),
        "VEA switches channel mode in place, got {:?}",
        sent
    );
    assert!(
        !sent
            .iter()
            .any(|m| matches!(m, L3Message::AssignmentCommand { .. })),
        "no SDCCH->TCH assignment under VEA"
    );

    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::ChannelModeModifyAcknowledge),
    );
    let dialog = h.sipif.last_dialog().unwrap();
    dialog.set_state(DialogState::Active);
    drain(&h, &chan);
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::ConnectAcknowledge { ti: 1 }),
    );
    let tran = chan.get_context(false).unwrap().voice_tran().unwrap();
    assert_eq!(tran.gsm_state(), CallState::Active);
}

#[test]
fn outbound_handover_clears_on_t3103_silence() {
    let h = TestHarness::new();
    authorize(&h, IMSI);
    h.store.set("Control.VEA", "1");
    h.store.set("GSM.Timer.Handover.Holdoff", "0");
    h.store.set("GSM.Timer.T3103", "50");
    h.peering.add_neighbor(11, 2, "peer-bts");
    *h.peering.offer.lock() = Some(HandoverOffer {
        hex_command: "062b1234".into(),
        refer_target: "sip:call@peer-bts".into(),
        reference: 9,
    });

    // Bring a call to Active the VEA way.
    let (l2, chan) = h.tch();
    handle_frame(&h.svc, &chan, &cm_service_request(CmServiceType::MobileOriginatedCall));
    drain(&h, &chan);
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::Setup {
            ti: 0,
            called: Some("+15551234".into()),
            calling: None,
            codecs: Default::default(),
        }),
    );
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::ChannelModeModifyAcknowledge),
    );
    let dialog = h.sipif.last_dialog().unwrap();
    dialog.set_state(DialogState::Active);
    drain(&h, &chan);
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::ConnectAcknowledge { ti: 0 }),
    );
    let tran = chan.get_context(false).unwrap().voice_tran().unwrap();
    assert_eq!(tran.gsm_state(), CallState::Active);

    // Measurement reports show a much stronger neighbor.
    let mut history = ChannelHistory::new();
    let report = MeasurementReport {
        rxlev_dl: -85,
        neighbors: vec![(11, 2, -60)],
    };
    for _ in 0..6 {
        handover::handover_determination(&h.svc, &report, &mut history, &chan);
    }
    assert_eq!(tran.gsm_state(), CallState::HandoverOutbound);
    assert_eq!(h.peering.requests.lock().len(), 1);

    // The command goes out on the FACCH; no return frames, so after the
    // guard the call is cleared locally with the handover cause.
    let cleared = handover::outbound_handover_transfer(&h.svc, &tran, &chan);
    assert!(cleared);
    assert!(tran.is_dead());
    assert!(l2.sent().iter().any(|f| f.message().is_none() && f.is_data()));
    let disposition = tran.with_inner(|i| i.disposition.clone()).unwrap();
    assert_eq!(disposition.cause(), L3Cause::HandoverOutbound);
}

#[test]
fn lur_open_registration_reject_sends_reject_sms() {
    let h = TestHarness::new();
    let imsi = "001019999999999";
    h.store.set("Control.LUR.OpenRegistration", "^001");
    h.store.set("Control.LUR.OpenRegistration.Reject", "^00101");
    h.store
        .set("Control.LUR.FailedRegistration.Message", "Registration failed.");
    h.store.set("Control.LUR.FailedRegistration.ShortCode", "1000");
    h.registrar.push(RegisterOutcome::Fail {
        sip_code: 404,
        reject_cause: None,
    });

    let (l2, chan) = h.sdcch();
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::LocationUpdatingRequest {
            lu_type: LocationUpdateType::ImsiAttach,
            lai: h.svc.config.lai(),
            mobile_id: MobileIdentity::Imsi(imsi.to_string()),
        }),
    );

    // Rejected despite matching the open pattern: the reject pattern
    // wins, and the table remembers the cause.
    let sent = l2.sent_messages();
    assert!(sent.iter().any(|m| matches!(
        m,
        L3Message::LocationUpdatingReject {
            cause: L3Cause::ImsiUnknownInVlr
        }
    )));
    let row = h.tmsi.get(imsi).unwrap();
    assert!(!row.authorized);
    assert_eq!(row.reject_cause, Some(L3Cause::ImsiUnknownInVlr));

    // The failed-registration message rides an MT-SMS on this channel:
    // SAPI 3 comes up and the deliver goes out.
    assert!(l2
        .sent()
        .iter()
        .any(|f| f.primitive == Primitive::EstablishRequest && f.sapi == Sapi::Sapi3));
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::primitive(Primitive::EstablishIndication, Sapi::Sapi3),
    );
    let deliver = l2.sent_messages().into_iter().find_map(|m| match m {
        L3Message::CpData {
            rpdu: RpMessage::Data { tpdu, .. },
            ..
        } => Some(tpdu),
        _ => None,
    });
    match deliver.expect("welcome SMS delivered") {
        Tpdu::Deliver { orig, text } => {
            assert_eq!(orig, "1000");
            assert!(text.contains("Registration failed."));
            assert!(text.contains(imsi));
        }
        other => panic!("unexpected TPDU {:?}", other),
    }
}

#[test]
fn mo_sms_round_trip() {
    let h = TestHarness::new();
    authorize(&h, IMSI);
    let (l2, chan) = h.sdcch();

    handle_frame(&h.svc, &chan, &cm_service_request(CmServiceType::ShortMessage));
    drain(&h, &chan);
    assert!(l2
        .sent_messages()
        .iter()
        .any(|m| matches!(m, L3Message::CmServiceAccept)));

    // CP-DATA carrying the submit; the layer acks and fires one MESSAGE.
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data_on(
            L3Message::CpData {
                ti: 5,
                rpdu: RpMessage::Data {
                    reference: 42,
                    smsc: "0000".into(),
                    tpdu: Tpdu::Submit {
                        dest: "+15551234".into(),
                        text: "hello from the cell".into(),
                    },
                },
            },
            Sapi::Sapi3,
        ),
    );
    assert!(l2
        .sent()
        .iter()
        .any(|f| matches!(f.message(), Some(L3Message::CpAck { .. })) && f.sapi == Sapi::Sapi3));
    let created = h.sipif.created.lock().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, "MESSAGE +15551234 hello from the cell");

    // 200 on the MESSAGE: exactly one RP-ACK goes downlink.
    let dialog = h.sipif.last_dialog().unwrap();
    dialog.set_state(DialogState::Bye);
    drain(&h, &chan);
    let rp_acks = l2
        .sent_messages()
        .iter()
        .filter(|m| {
            matches!(
                m,
                L3Message::CpData {
                    rpdu: RpMessage::Ack { reference: 42 },
                    ..
                }
            )
        })
        .count();
    assert_eq!(rp_acks, 1);

    // Final CP-ACK ends the transaction with success and attaches the
    // MMUser for any queued MT work.
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data_on(L3Message::CpAck { ti: 5 }, Sapi::Sapi3),
    );
    let mmc = chan.get_context(false).unwrap();
    assert!(mmc.get_tran(TranSlot::MoSms1).is_none());
    assert!(mmc.mmu().is_some(), "MMUser attached after MO-SMS");
}

#[test]
fn in_call_ss_service_request_is_rejected() {
    let h = TestHarness::new();
    authorize(&h, IMSI);
    h.store.set("Control.VEA", "1");

    // Bring a call up the VEA way so CS1 is busy.
    let (l2, chan) = h.tch();
    handle_frame(&h.svc, &chan, &cm_service_request(CmServiceType::MobileOriginatedCall));
    drain(&h, &chan);
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::Setup {
            ti: 0,
            called: Some("+15551234".into()),
            calling: None,
            codecs: Default::default(),
        }),
    );
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::ChannelModeModifyAcknowledge),
    );
    let dialog = h.sipif.last_dialog().unwrap();
    dialog.set_state(DialogState::Active);
    drain(&h, &chan);
    handle_frame(
        &h.svc,
        &chan,
        &L3Frame::data(L3Message::ConnectAcknowledge { ti: 0 }),
    );
    let mmc = chan.get_context(false).unwrap();
    assert_eq!(mmc.voice_tran().unwrap().gsm_state(), CallState::Active);
    l2.take_sent();

    // A supplementary-services request during the call: one reject, no
    // parallel SS transaction.
    handle_frame(
        &h.svc,
        &chan,
        &cm_service_request(CmServiceType::SupplementaryService),
    );
    drain(&h, &chan);
    assert!(l2.sent_messages().iter().any(|m| matches!(
        m,
        L3Message::CmServiceReject {
            cause: L3Cause::ServiceOptionNotSupported
        }
    )));
    assert!(mmc.get_tran(TranSlot::Ss).is_none());
    // A second call attempt gets the same answer.
    l2.take_sent();
    handle_frame(&h.svc, &chan, &cm_service_request(CmServiceType::MobileOriginatedCall));
    drain(&h, &chan);
    assert!(l2.sent_messages().iter().any(|m| matches!(
        m,
        L3Message::CmServiceReject {
            cause: L3Cause::ServiceOptionNotSupported
        }
    )));
}

#[test]
fn te_cancel_is_idempotent_and_detaches() {
    let h = TestHarness::new();
    let (_l2, chan) = h.sdcch();
    let mmc = chan.get_context(false).unwrap();
    let tran = Transaction::new_moc(&mmc, opencell_control_core::tran::ServiceType::MobileOriginatedCall);
    assert!(mmc.voice_tran().is_some());
    // Back-pointer invariant while installed.
    assert!(std::sync::Arc::ptr_eq(
        &tran.mm_context().unwrap(),
        &mmc
    ));

    for _ in 0..3 {
        tran.te_cancel(&h.svc, opencell_control_core::TermCause::local(L3Cause::OperatorIntervention));
    }
    assert!(tran.is_dead());
    assert!(mmc.voice_tran().is_none());
    assert!(tran.mm_context().is_none());
}

#[test]
fn paging_expiry_fails_queued_transactions() {
    let h = TestHarness::new();
    h.store.set("GSM.Timer.T3113", "0");
    let dialog = opencell_control_core::testutil::MockDialog::new();
    let tran = Transaction::new_mtc(
        FullMobileId::from_imsi(IMSI),
        dialog.clone(),
        "+15550001".to_string(),
    );
    h.svc.mm.add_mt(&h.svc, tran.clone());

    // The page window is already over: the user is destroyed and the
    // queued call fails with no-paging-response.
    std::thread::sleep(Duration::from_millis(5));
    let pages = h.svc.mm.get_pages(&h.svc);
    assert!(pages.is_empty());
    assert!(tran.is_dead());
    assert_eq!(
        tran.with_inner(|i| i.disposition.clone()).unwrap().cause(),
        L3Cause::NoPagingResponse
    );
    assert!(dialog.actions().contains(&"cancel".to_string()));
    assert_eq!(h.svc.mm.user_count(), 0);
}

#[test]
fn operator_termination_preempts_channel() {
    let h = TestHarness::new();
    authorize(&h, IMSI);
    let (l2, chan) = h.sdcch();
    let mmc = chan.get_context(false).unwrap();
    h.svc.mm.attach_by_imsi(&h.svc, &mmc, IMSI);

    assert!(h.svc.mm.terminate_by_imsi(&h.svc, IMSI));
    drain(&h, &chan);
    assert!(l2.sent_messages().iter().any(|m| matches!(
        m,
        L3Message::ChannelRelease {
            cause: opencell_control_core::RrCause::PreemptiveRelease
        }
    )));
    assert!(chan.is_released());
}
