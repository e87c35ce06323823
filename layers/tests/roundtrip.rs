//! End-to-end coding chain tests
//!
//! Loops the downlink encoder output back through the uplink decoder (or a
//! hand-built receiver for the stages only a UE implements) and checks the
//! transport blocks survive the full chain bit-exactly on a perfect
//! channel.

use common::bitvector::DTX_SYMBOL;
use common::{BitVector, SoftVector, Time, TtiCode, CHIPS_PER_FRAME, SLOTS_PER_FRAME};
use layers::fec::coding::CodingKind;
use layers::fec::decoder::{CcTrChDecoder, RxBitsBurst};
use layers::fec::encoder::{CcTrChEncoder, TxBitsBurst, TxSink};
use layers::fec::interleave::{self, INTER2_PERM};
use layers::fec::parity::transport_crc;
use layers::fec::ratematch;
use layers::fec::tfci::encode_tfci;
use layers::fec::viterbi::ViterbiR2O9;
use layers::mac::{CollectingMac, MacTbs, TransportBlock};
use layers::phch::PhCh;
use layers::trch::{
    config_for_one_trch, config_trivial, fec_compute_dl_trch_sizes, fec_compute_ul_trch_sizes,
    TrChConfig,
};
use std::sync::{Arc, Mutex};

/// A sink that just collects the slot bursts.
#[derive(Default)]
struct CollectingSink {
    bursts: Mutex<Vec<TxBitsBurst>>,
}

impl TxSink for CollectingSink {
    fn write_high_side(&self, burst: TxBitsBurst) {
        self.bursts.lock().unwrap().push(burst);
    }
}

fn patterned_tb(len: usize, seed: u64) -> BitVector {
    let mut v = BitVector::new(len);
    let mut x = seed;
    for i in 0..len {
        x = x
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        v.set(i, ((x >> 37) & 1) as u8);
    }
    v
}

/// Perfect-channel soft bits from transmitted symbols; DTX positions were
/// never sent, so the receiver sees them as unknown.
fn soft_from_symbols(bits: &BitVector) -> SoftVector {
    SoftVector::from_vals(
        bits.as_slice()
            .iter()
            .map(|&b| match b {
                DTX_SYMBOL => 0.5,
                b => (b & 1) as f32,
            })
            .collect(),
    )
}

/// Scenario: the 246-bit beacon block through the BCH chain and back.
#[test]
fn bch_beacon_roundtrip() {
    let sink = Arc::new(CollectingSink::default());
    let phch = Arc::new(PhCh::downlink(common::PhChType::Pccpch, 256, 1));
    let info = config_trivial(TtiCode::Tti20ms, 16, 270);
    assert_eq!(info.prog(0, 0).coded_sz, 540);
    let mut encoder = CcTrChEncoder::new(info, phch, sink.clone());
    encoder.open(Time::new(0, 0));

    let tb = patterned_tb(246, 99);
    encoder
        .write_high_side_tb(&TransportBlock::new(tb.clone()))
        .unwrap();

    let bursts = sink.bursts.lock().unwrap();
    assert_eq!(bursts.len(), 2 * SLOTS_PER_FRAME);
    for burst in bursts.iter() {
        assert_eq!(burst.bits.len(), 18);
        assert!(burst.right_justified);
    }

    // A receiver for the same program, per-frame flavoured.
    let (rx_info, _) =
        config_for_one_trch(false, TtiCode::Tti20ms, 16, 270, 246, 1, 1, CodingKind::ConvHalf)
            .unwrap();
    let mut decoder = CcTrChDecoder::new(rx_info);
    let mac = Arc::new(CollectingMac::default());
    decoder.set_upstream(mac.clone());

    for burst in bursts.iter() {
        decoder.write_low_side(&RxBitsBurst {
            sf_log2: 8,
            data: soft_from_symbols(&burst.bits),
            time: burst.time,
            tfci_bits: [0.0, 0.0],
        });
    }
    let received = mac.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1.bits, tb);
}

/// Scenario: a UE-side RACH transmission (SF=256, 20 ms TTI, CRC 16)
/// through the uplink decoder.
#[test]
fn rach_uplink_roundtrip() {
    let mut config = TrChConfig::default();
    config.config_rach_trch(256, TtiCode::Tti20ms, 16, 120);
    let info = fec_compute_ul_trch_sizes(&config.ul, false).unwrap();
    let prog = *info.prog(0, 0);
    assert_eq!(prog.tb_size, 120);

    // UE-side transmit chain per TS 25.212 4.2 figure 1.
    let tb = patterned_tb(120, 7);
    let mut cat = BitVector::new(136);
    tb.copy_to_segment(&mut cat, 0);
    let mut parity = BitVector::new(16);
    transport_crc(&tb, &mut parity);
    parity.copy_to_segment(&mut cat, 120);

    let coder = ViterbiR2O9::default();
    let mut tail = BitVector::new(144);
    cat.copy_to_segment(&mut tail, 0);
    let mut coded = BitVector::new(288);
    coder.encode(&tail, &mut coded);

    // Radio frame equalisation is a no-op (288 = 2 x 144), then first
    // interleaving over the TTI and segmentation into two frames.
    let mut interleaved = BitVector::new(288);
    interleave::interleave(
        coded.as_slice(),
        2,
        interleave::inter1_perm(TtiCode::Tti20ms),
        interleaved.as_mut_slice(),
    );

    let einis = ratematch::compute_ul_eini(144, 150, TtiCode::Tti20ms);
    let tfci_code = encode_tfci(0);

    let mut decoder = CcTrChDecoder::new(info);
    let mac = Arc::new(CollectingMac::default());
    decoder.set_upstream(mac.clone());

    for frame in 0..2 {
        let seg = interleaved.segment(frame * 144, 144);
        let mut matched = BitVector::new(150);
        ratematch::rate_match_auto(seg.as_slice(), matched.as_mut_slice(), einis[frame]).unwrap();
        let mut on_air = BitVector::new(150);
        interleave::interleave(matched.as_slice(), 30, &INTER2_PERM, on_air.as_mut_slice());

        for slot in 0..SLOTS_PER_FRAME {
            let bits = on_air.segment(slot * 10, 10);
            let b0 = (tfci_code >> (2 * slot)) & 1;
            let b1 = (tfci_code >> (2 * slot + 1)) & 1;
            decoder.write_low_side(&RxBitsBurst {
                sf_log2: 8,
                data: soft_from_symbols(&bits),
                time: Time::new(frame as i32, slot),
                tfci_bits: [b0 as f32, b1 as f32],
            });
        }
    }

    let received = mac.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1.bits, tb);
}

/// Scenario: FACH (convolutional 1/2, CRC 12, 10 ms TTI) with a hand-built
/// receiver reversing each stage.
#[test]
fn fach_downlink_recovers_tb() {
    let sink = Arc::new(CollectingSink::default());
    let phch = Arc::new(PhCh::downlink(common::PhChType::Sccpch, 128, 3));
    let rf_size = phch.dl_radio_frame_size();
    let mut config = TrChConfig::default();
    config.config_fach_trch(rf_size, TtiCode::Tti10ms, 12, 0);
    let info = fec_compute_dl_trch_sizes(&config.dl, rf_size).unwrap();
    let tb_size = info.prog(0, 1).tb_size;
    let prog1 = *info.prog(0, 1);

    let mut encoder = CcTrChEncoder::new(info, phch.clone(), sink.clone());
    encoder.open(Time::new(0, 0));

    let tb = patterned_tb(tb_size, 5);
    encoder
        .write_high_side(&MacTbs {
            tfc_index: 1,
            blocks: vec![vec![TransportBlock::new(tb.clone())]],
        })
        .unwrap();

    // Rebuild the radio frame from the slot data fields.
    let bursts = sink.bursts.lock().unwrap();
    assert_eq!(bursts.len(), SLOTS_PER_FRAME);
    let slot_format = phch.dl_slot();
    let mut frame = BitVector::new(rf_size);
    for (s, burst) in bursts.iter().enumerate() {
        // SCCPCH slot: | TFCI | data | pilot |.
        let data = burst
            .bits
            .segment(slot_format.n_tfci, slot_format.n_data1);
        data.copy_to_segment(&mut frame, s * slot_format.n_data1);
        // The TFCI field carries the rotating codeword LSB-first.
        let want = (encode_tfci(1).rotate_right((s * slot_format.n_tfci) as u32)
            & ((1 << slot_format.n_tfci) - 1)) as u64;
        assert_eq!(
            burst.bits.peek_field_reversed(0, slot_format.n_tfci),
            want,
            "slot {}",
            s
        );
    }

    // Receiver: second deinterleave, strip DTX, rate-unmatch, decode.
    let soft_frame = soft_from_symbols(&frame);
    let mut deinterleaved = SoftVector::new(rf_size);
    interleave::deinterleave(
        soft_frame.as_slice(),
        30,
        &INTER2_PERM,
        deinterleaved.as_mut_slice(),
    );
    // This is the largest TF, so the inverse parameters match the
    // stream's own sizes.
    let stripped = deinterleaved.segment(0, prog1.low_side_rm_sz);
    let mut unmatched = SoftVector::new(prog1.high_side_rm_sz);
    ratematch::rate_match_auto(stripped.as_slice(), unmatched.as_mut_slice(), 1).unwrap();

    let ki = prog1.code_block_sz;
    let mut decoder = ViterbiR2O9::default();
    let mut decoded = BitVector::new(ki + 8);
    decoder.decode(&unmatched, &mut decoded);

    let payload = decoded.segment(0, tb_size);
    let got_crc = decoded.segment(tb_size, 12);
    let mut want_crc = BitVector::new(12);
    transport_crc(&payload, &mut want_crc);
    assert_eq!(payload, tb);
    assert_eq!(got_crc, want_crc);
}

/// Extract the data fields from a frame's worth of DPDCH slot bursts.
fn rebuild_dpdch_frame(
    bursts: &[TxBitsBurst],
    slot_format: &layers::phch::SlotFormat,
    rf_size: usize,
) -> BitVector {
    assert_eq!(bursts.len(), SLOTS_PER_FRAME);
    let per_slot = slot_format.n_data1 + slot_format.n_data2;
    let mut frame = BitVector::new(rf_size);
    for (s, burst) in bursts.iter().enumerate() {
        let d1 = burst.bits.segment(0, slot_format.n_data1);
        let d2_start = slot_format.n_data1 + slot_format.n_tpc + slot_format.n_tfci;
        let d2 = burst.bits.segment(d2_start, slot_format.n_data2);
        d1.copy_to_segment(&mut frame, s * per_slot);
        d2.copy_to_segment(&mut frame, s * per_slot + slot_format.n_data1);
    }
    frame
}

/// Scenario: a turbo-coded PS DCH at SF=8 carrying 1..4 transport blocks
/// of 340 bits per TTI. The smaller formats are reversed stage by stage
/// (their downlink rate-matching parameters come from the largest format);
/// the largest format goes straight back through the uplink decoder.
#[test]
fn dch_turbo_multi_tb_roundtrip() {
    use layers::fec::turbo::{turbo_decode, TurboInterleaver, ViterbiTurbo};

    let phch = Arc::new(PhCh::new(common::PhChType::Dpdch, 8, 1, 8, 0x51));
    let rf_size = phch.dl_radio_frame_size();
    let mut config = TrChConfig::default();
    let ok = config.config_dch_ps(
        CHIPS_PER_FRAME / 8,
        rf_size,
        TtiCode::Tti10ms,
        16,
        true,
        340,
        340,
    );
    assert!(ok);
    let info = fec_compute_dl_trch_sizes(&config.dl, rf_size).unwrap();
    let num_tfc = info.num_tfc();
    assert!(num_tfc >= 5, "want at least 4 data TFCs, got {}", num_tfc);
    let slot_format = phch.dl_slot();
    let largest = info.largest_coded_sz(0);

    for tfc in 1..=4usize {
        let prog = *info.prog(0, tfc);
        let sink = Arc::new(CollectingSink::default());
        let mut encoder = CcTrChEncoder::new(info.clone(), phch.clone(), sink.clone());
        encoder.open(Time::new(0, 0));

        let blocks: Vec<TransportBlock> = (0..tfc)
            .map(|n| TransportBlock::new(patterned_tb(340, 1000 + n as u64)))
            .collect();
        encoder
            .write_high_side(&MacTbs {
                tfc_index: tfc,
                blocks: vec![blocks.clone()],
            })
            .unwrap();

        let bursts = sink.bursts.lock().unwrap();
        let frame = rebuild_dpdch_frame(&bursts, slot_format, rf_size);

        // Receiver: second deinterleave, strip the DTX tail, undo the
        // fixed-parameter rate matching, turbo-decode, check CRCs.
        let soft_frame = soft_from_symbols(&frame);
        let mut deinterleaved = SoftVector::new(rf_size);
        interleave::deinterleave(
            soft_frame.as_slice(),
            30,
            &INTER2_PERM,
            deinterleaved.as_mut_slice(),
        );
        let stripped = deinterleaved.segment(0, prog.low_side_rm_sz);
        let (eplus, eminus) = ratematch::compute_eplus_eminus(largest, rf_size);
        let mut unmatched = SoftVector::new(prog.high_side_rm_sz);
        ratematch::rate_match(
            stripped.as_slice(),
            unmatched.as_mut_slice(),
            1,
            eplus + eminus,
            eminus,
        )
        .unwrap();

        let k = prog.code_block_sz;
        let interleaver = TurboInterleaver::new(k);
        let mut turbo = ViterbiTurbo::new();
        let mut decoded = BitVector::new(k);
        turbo_decode(&mut turbo, &unmatched, &mut decoded, &interleaver);

        for (n, block) in blocks.iter().enumerate() {
            let payload = decoded.segment(n * 356, 340);
            let got_crc = decoded.segment(n * 356 + 340, 16);
            let mut want_crc = BitVector::new(16);
            transport_crc(&payload, &mut want_crc);
            assert_eq!(payload, block.bits, "TFC {} block {}", tfc, n);
            assert_eq!(got_crc, want_crc, "TFC {} block {}", tfc, n);
        }
    }

    // The largest format fills the radio frame exactly, so the uplink
    // decoder's own rate dematching reverses it end to end.
    let tfc = num_tfc - 1;
    let sink = Arc::new(CollectingSink::default());
    let mut encoder = CcTrChEncoder::new(info.clone(), phch.clone(), sink.clone());
    encoder.open(Time::new(0, 0));
    let blocks: Vec<TransportBlock> = (0..tfc)
        .map(|n| TransportBlock::new(patterned_tb(340, 2000 + n as u64)))
        .collect();
    encoder
        .write_high_side(&MacTbs {
            tfc_index: tfc,
            blocks: vec![blocks.clone()],
        })
        .unwrap();
    let bursts = sink.bursts.lock().unwrap();
    let frame = rebuild_dpdch_frame(&bursts, slot_format, rf_size);

    let mut decoder = CcTrChDecoder::new(info.clone());
    let mac = Arc::new(CollectingMac::default());
    decoder.set_upstream(mac.clone());
    let per_slot = slot_format.n_data1 + slot_format.n_data2;
    let tfci_code = encode_tfci(tfc);
    for slot in 0..SLOTS_PER_FRAME {
        let bits = frame.segment(slot * per_slot, per_slot);
        decoder.write_low_side(&RxBitsBurst {
            sf_log2: 3,
            data: soft_from_symbols(&bits),
            time: Time::new(0, slot),
            tfci_bits: [
                ((tfci_code >> (2 * slot)) & 1) as f32,
                ((tfci_code >> (2 * slot + 1)) & 1) as f32,
            ],
        });
    }
    let received = mac.received.lock().unwrap();
    assert_eq!(received.len(), tfc);
    for (n, (trch_id, block)) in received.iter().enumerate() {
        assert_eq!(*trch_id, 0);
        assert_eq!(block.bits, blocks[n].bits, "largest TFC block {}", n);
    }
}

/// Code block segmentation with head filler bits survives the round trip:
/// a convolutional DCH at SF=16 whose payload splits into five blocks.
#[test]
fn dch_conv_code_block_segmentation_roundtrip() {
    let phch = Arc::new(PhCh::new(common::PhChType::Dpdch, 16, 1, 16, 0x52));
    let rf_size = phch.dl_radio_frame_size();
    assert_eq!(rf_size, 4320);
    let mut config = TrChConfig::default();
    config.config_dch_ps(
        CHIPS_PER_FRAME / 16,
        rf_size,
        TtiCode::Tti10ms,
        16,
        false,
        0,
        0,
    );
    let info = fec_compute_dl_trch_sizes(&config.dl, rf_size).unwrap();
    let prog = *info.prog(0, 1);
    assert!(prog.fill_bits > 0, "want the filler path, fill = 0");
    assert!(prog.coded_sz > 2 * 504 + 16, "want segmentation");
    let slot_format = phch.dl_slot();

    let sink = Arc::new(CollectingSink::default());
    let mut encoder = CcTrChEncoder::new(info.clone(), phch.clone(), sink.clone());
    encoder.open(Time::new(0, 0));

    let tb = patterned_tb(prog.tb_size, 77);
    encoder
        .write_high_side(&MacTbs {
            tfc_index: 1,
            blocks: vec![vec![TransportBlock::new(tb.clone())]],
        })
        .unwrap();

    let bursts = sink.bursts.lock().unwrap();
    let per_slot = slot_format.n_data1 + slot_format.n_data2;
    let mut frame = BitVector::new(rf_size);
    for (s, burst) in bursts.iter().enumerate() {
        let d1 = burst.bits.segment(0, slot_format.n_data1);
        let d2_start = slot_format.n_data1 + slot_format.n_tpc + slot_format.n_tfci;
        let d2 = burst.bits.segment(d2_start, slot_format.n_data2);
        d1.copy_to_segment(&mut frame, s * per_slot);
        d2.copy_to_segment(&mut frame, s * per_slot + slot_format.n_data1);
    }

    let mut decoder = CcTrChDecoder::new(info.clone());
    let mac = Arc::new(CollectingMac::default());
    decoder.set_upstream(mac.clone());
    let tfci_code = encode_tfci(1);
    for slot in 0..SLOTS_PER_FRAME {
        let bits = frame.segment(slot * per_slot, per_slot);
        decoder.write_low_side(&RxBitsBurst {
            sf_log2: 4,
            data: soft_from_symbols(&bits),
            time: Time::new(0, slot),
            tfci_bits: [
                ((tfci_code >> (2 * slot)) & 1) as f32,
                ((tfci_code >> (2 * slot + 1)) & 1) as f32,
            ],
        });
    }

    let received = mac.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1.bits, tb);
}
