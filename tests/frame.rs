//! On-wire encode/decode checks against fixed byte images.

use dvbsat::frame::{
    mark_corrupted, q8_to_cni, BbFrame, BbFrameBuf, CrEntry, CrKind, DvbFrame, DvbRcsFrame,
    DvbRcsFrameBuf, FrameParseError, Logoff, LogoffBuf, LogonRequest, LogonRequestBuf,
    LogonResponse, LogonResponseBuf, MsgType, RealModcodOption, Sac, SacBuf, Sof, SofBuf, Sync,
    SyncBuf, Ttp, TtpBuf, TtpEntry,
};
use dvbsat::{NetPacket, PktType};

/// SoF image:
///
/// 06 | 00 07 | 01 | 07 | 01 02
/// type  len    spot  carrier  sfn
#[test]
fn sof_image() {
    let sof = SofBuf {
        spot_id: 1,
        carrier_id: 7,
        sfn: 0x0102,
    };
    let bytes = sof.to_bytes();
    assert_eq!(hex::encode(&bytes), "06000701070102");

    let v = Sof::from_bytes(&bytes).expect("sof did not parse");
    assert_eq!(v.sfn(), 0x0102);

    let hdr = DvbFrame::from_bytes(&bytes).unwrap();
    assert_eq!(hdr.msg_type(), MsgType::Sof);
    assert_eq!(hdr.spot_id(), 1);
    assert_eq!(hdr.carrier_id(), 7);
}

/// Logon request image for mac=5, cra=64, max_rbdc=256, max_vbdc=0.
#[test]
fn logon_request_image() {
    let req = LogonRequestBuf {
        spot_id: 1,
        carrier_id: 5,
        mac: 5,
        cra_kbps: 64,
        max_rbdc_kbps: 256,
        max_vbdc_pkts: 0,
    };
    let bytes = req.to_bytes();
    assert_eq!(hex::encode(&bytes), "07000d01050005004001000000");

    let v = LogonRequest::from_bytes(&bytes).expect("logon request did not parse");
    assert_eq!(v.mac(), 5);
    assert_eq!(v.cra_kbps(), 64);
    assert_eq!(v.max_rbdc_kbps(), 256);
    assert_eq!(v.max_vbdc_pkts(), 0);
    assert_eq!(v.to_owned(), req);
}

#[test]
fn logon_response_roundtrip() {
    let resp = LogonResponseBuf {
        spot_id: 2,
        carrier_id: 3,
        mac: 21,
        group_id: 2,
        logon_id: 21,
    };
    let bytes = resp.to_bytes();
    assert_eq!(bytes.len(), LogonResponse::LEN);

    let v = LogonResponse::from_bytes(&bytes).unwrap();
    assert_eq!(v.mac(), 21);
    assert_eq!(v.group_id(), 2);
    assert_eq!(v.logon_id(), 21);
}

#[test]
fn logoff_roundtrip() {
    let bytes = LogoffBuf {
        spot_id: 1,
        carrier_id: 2,
        mac: 9,
    }
    .to_bytes();
    assert_eq!(Logoff::from_bytes(&bytes).unwrap().mac(), 9);
}

#[test]
fn sync_roundtrip() {
    let bytes = SyncBuf {
        spot_id: 1,
        carrier_id: 2,
        tal_id: 33,
    }
    .to_bytes();
    assert_eq!(Sync::from_bytes(&bytes).unwrap().tal_id(), 33);
}

/// SAC image: one RBDC entry of 100 kbits/s, flag byte carries the request
/// kind in its two low bits.
///
/// 04 | 00 0d | 01 | 03 | 00 05 | 01 | 00 | 00 64 | 00 00
/// type  len    spot carr  tal     cnt  flag  value   cni
#[test]
fn sac_image() {
    let sac = SacBuf {
        spot_id: 1,
        carrier_id: 3,
        tal_id: 5,
        entries: vec![CrEntry {
            cr_type: CrKind::Rbdc,
            wrap_count: 0,
            value: 100,
        }],
        cni_q8: 0,
    };
    let bytes = sac.to_bytes();
    assert_eq!(hex::encode(&bytes), "04000d01030005010000640000");

    let v = Sac::from_bytes(&bytes).expect("sac did not parse");
    assert_eq!(v.tal_id(), 5);
    assert_eq!(v.request_count(), 1);
    assert_eq!(v.entry(0).cr_type, CrKind::Rbdc);
    assert_eq!(v.entry(0).value, 100);
    assert_eq!(v.to_owned(), sac);
}

#[test]
fn sac_vbdc_flags_and_cni() {
    let sac = SacBuf {
        spot_id: 1,
        carrier_id: 3,
        tal_id: 7,
        entries: vec![
            CrEntry {
                cr_type: CrKind::Vbdc,
                wrap_count: 2,
                value: 40,
            },
            CrEntry {
                cr_type: CrKind::Rbdc,
                wrap_count: 0,
                value: 0,
            },
        ],
        // 6.5 dB in Q8.8
        cni_q8: 6 * 256 + 128,
    };
    let bytes = sac.to_bytes();
    let v = Sac::from_bytes(&bytes).unwrap();

    // Vbdc=1 in bits 0..2, wrap_count=2 in bits 2..8 -> 0b0000_1001
    assert_eq!(bytes[8], 0x09);
    assert_eq!(v.entry(0).wrap_count, 2);
    assert_eq!(v.entries().count(), 2);
    assert!((q8_to_cni(v.cni_q8()) - 6.5).abs() < 1e-9);
}

#[test]
fn ttp_roundtrip_and_lookup() {
    let ttp = TtpBuf {
        spot_id: 1,
        carrier_id: 2,
        sfn: 42,
        entries: vec![
            TtpEntry { tal_id: 5, pkts: 120 },
            TtpEntry { tal_id: 6, pkts: 3 },
        ],
    };
    let bytes = ttp.to_bytes();
    let v = Ttp::from_bytes(&bytes).unwrap();
    assert_eq!(v.sfn(), 42);
    assert_eq!(v.entry_count(), 2);
    assert_eq!(v.allocation_for(5), Some(120));
    assert_eq!(v.allocation_for(6), Some(3));
    assert_eq!(v.allocation_for(7), None);
}

#[test]
fn bbframe_roundtrip_with_option_and_padding() {
    let mut frame = BbFrameBuf::new(1, 9, PktType::Gse);
    frame.add_option(RealModcodOption {
        tal_id: 5,
        real_modcod: 11,
    });
    frame.add_packet(NetPacket::new(PktType::Gse, 0, 5, 1, vec![0xAB; 100]));
    frame.add_packet(NetPacket::new(PktType::Gse, 0, 5, 0, vec![0xCD; 60]));

    let bytes = frame.to_bytes_padded(512);
    assert_eq!(bytes.len(), 512);

    let v = BbFrame::from_bytes(&bytes).unwrap();
    assert_eq!(v.used_modcod(), 9);
    assert_eq!(v.option_count(), 1);
    assert_eq!(v.option(0).tal_id, 5);
    assert_eq!(v.option(0).real_modcod, 11);
    assert_eq!(v.data_length(), 2);

    let pkts = v.packets().unwrap();
    assert_eq!(pkts.len(), 2);
    assert_eq!(pkts[0].dst_tal, 5);
    assert_eq!(pkts[0].qos, 1);
    assert_eq!(pkts[0].data, vec![0xAB; 100]);
    assert_eq!(pkts[1].data.len(), 60);
}

/// A corrupted tag keeps the ACM fields readable but changes the type.
#[test]
fn bbframe_corrupted_tag() {
    let mut frame = BbFrameBuf::new(1, 9, PktType::Gse);
    frame.add_packet(NetPacket::new(PktType::Gse, 0, 5, 0, vec![0; 10]));
    let mut bytes = frame.to_bytes();
    mark_corrupted(&mut bytes);

    assert!(BbFrame::from_bytes(&bytes).is_err());
    let v = BbFrame::from_corrupted(&bytes).unwrap();
    assert_eq!(v.used_modcod(), 9);
}

#[test]
fn dvb_rcs_frame_roundtrip() {
    let mut frame = DvbRcsFrameBuf::new(1, PktType::Atm);
    for i in 0..4u8 {
        frame.add_packet(NetPacket::new(PktType::Atm, 5, 0, 0, vec![i; 53]));
    }
    let bytes = frame.to_bytes_padded(1440);
    assert_eq!(bytes.len(), 1440);

    let v = DvbRcsFrame::from_bytes(&bytes).unwrap();
    assert_eq!(v.qty_element(), 4);
    assert_eq!(v.pkt_type(), PktType::Atm);
    let pkts = v.packets().unwrap();
    assert_eq!(pkts.len(), 4);
    assert_eq!(pkts[3].data, vec![3; 53]);
    assert_eq!(pkts[0].src_tal, 5);
}

#[test]
fn parse_rejects_bad_frames() {
    // too short for any header
    assert!(matches!(
        DvbFrame::from_bytes(&[6, 0]),
        Err(FrameParseError::SmallerThanMinSize { .. })
    ));

    // length field disagrees with the buffer
    let mut bytes = SofBuf {
        spot_id: 1,
        carrier_id: 7,
        sfn: 3,
    }
    .to_bytes();
    bytes.push(0);
    assert!(matches!(
        Sof::from_bytes(&bytes),
        Err(FrameParseError::LengthFieldMismatch { .. })
    ));

    // unknown message type byte
    let mut bytes = SofBuf {
        spot_id: 1,
        carrier_id: 7,
        sfn: 3,
    }
    .to_bytes();
    bytes[0] = 0xEE;
    assert!(matches!(
        DvbFrame::from_bytes(&bytes),
        Err(FrameParseError::UnknownMsgType { msg_type: 0xEE })
    ));

    // a TTP claiming more entries than it carries
    let mut ttp = TtpBuf {
        spot_id: 1,
        carrier_id: 2,
        sfn: 1,
        entries: vec![TtpEntry { tal_id: 5, pkts: 1 }],
    }
    .to_bytes();
    ttp[8] = 9; // entry_count low byte
    assert!(matches!(
        Ttp::from_bytes(&ttp),
        Err(FrameParseError::TruncatedEntries { .. })
    ));
}
