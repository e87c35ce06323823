//! Uplink CCTrCh decoder
//!
//! The inverse of the downlink chain, slot by slot: accumulate a radio
//! frame, detect the TFCI, second-deinterleave, demultiplex the TrChs,
//! undo rate matching per radio frame, reassemble the TTI, first
//! deinterleave, channel-decode with filler-aware code block
//! de-segmentation, check each transport block's CRC and deliver the good
//! ones to MAC.

use crate::fec::coding::{Z_CONVOLUTIONAL, Z_TURBO};
use crate::fec::interleave::{self, INTER2_PERM};
use crate::fec::parity::transport_crc;
use crate::fec::ratematch::{self, rate_match_auto};
use crate::fec::tfci::find_tfci;
use crate::fec::turbo::{turbo_decode, TurboInterleaver, ViterbiTurbo};
use crate::fec::viterbi::ViterbiR2O9;
use crate::mac::{MacEngine, TransportBlock};
use crate::trch::{CcTrChInfo, FecProg, FerEstimator, TfcId, TrChId};
use common::{BitVector, SoftVector, Time, SLOTS_PER_FRAME, UL_RAW_TFCI_BITS};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Soft bits recovered from one uplink slot (or a whole radio frame when
/// the modem despreads frame-wise), with the raw TFCI bits of each slot.
#[derive(Debug, Clone)]
pub struct RxBitsBurst {
    pub sf_log2: usize,
    pub data: SoftVector,
    pub time: Time,
    pub tfci_bits: [f32; 2],
}

enum TrChDecoderKind {
    Conv(ViterbiR2O9),
    Turbo(ViterbiTurbo, TurboInterleaver),
}

/// Per-TrCh, per-TFC decoder: rate dematching state plus the channel
/// decoder locked to this TFC's block size.
struct TrChDecoder {
    kind: TrChDecoderKind,
    einis: [i64; 8],
    /// One radio frame after rate dematching.
    rm_buf: SoftVector,
    /// A full TTI of rate-dematched data.
    tti_buf: SoftVector,
    tti_index: usize,
}

impl TrChDecoder {
    fn new(info: &CcTrChInfo, tcid: TrChId, tfc: TfcId) -> Self {
        let prog = info.prog(tcid, tfc);
        let tprog = info.trch_prog(tcid);
        let nframes = tprog.tti.num_frames();
        let kind = if tprog.coding.is_turbo() {
            TrChDecoderKind::Turbo(
                ViterbiTurbo::new(),
                TurboInterleaver::new(prog.code_block_sz),
            )
        } else {
            TrChDecoderKind::Conv(ViterbiR2O9::default())
        };
        TrChDecoder {
            kind,
            einis: ratematch::compute_ul_eini(prog.high_side_rm_sz, prog.low_side_rm_sz, tprog.tti),
            rm_buf: SoftVector::new(prog.high_side_rm_sz),
            tti_buf: SoftVector::new(prog.high_side_rm_sz * nframes),
            tti_index: 0,
        }
    }

    fn decode_block(&mut self, input: &SoftVector, target: &mut BitVector) {
        match &mut self.kind {
            TrChDecoderKind::Conv(coder) => coder.decode(input, target),
            TrChDecoderKind::Turbo(coder, interleaver) => {
                turbo_decode(coder, input, target, interleaver)
            }
        }
    }

    fn is_turbo(&self) -> bool {
        matches!(self.kind, TrChDecoderKind::Turbo(..))
    }
}

/// The uplink side of one CCTrCh.
pub struct CcTrChDecoder {
    info: CcTrChInfo,
    decoders: Vec<Vec<TrChDecoder>>,
    upstream: Option<Arc<dyn MacEngine>>,
    fer: FerEstimator,
    /// Incoming slot accumulator; the size varies with the uplink SF.
    slot_accumulator: SoftVector,
    raw_tfci: [f32; UL_RAW_TFCI_BITS],
    receive_time: Time,
    slot_size: usize,
    filler: SoftVector,
}

impl CcTrChDecoder {
    pub fn new(info: CcTrChInfo) -> Self {
        let decoders = (0..info.num_trch())
            .map(|tcid| {
                (0..info.num_tfc())
                    .map(|tfc| TrChDecoder::new(&info, tcid, tfc))
                    .collect()
            })
            .collect();
        CcTrChDecoder {
            info,
            decoders,
            upstream: None,
            fer: FerEstimator::default(),
            slot_accumulator: SoftVector::new(0),
            raw_tfci: [0.5; UL_RAW_TFCI_BITS],
            receive_time: Time::new(0, 1),
            slot_size: 0,
            filler: SoftVector::new(0),
        }
    }

    pub fn info(&self) -> &CcTrChInfo {
        &self.info
    }

    /// Connect the upstream MAC. Only called once per channel lifetime.
    pub fn set_upstream(&mut self, mac: Arc<dyn MacEngine>) {
        self.upstream = Some(mac);
    }

    pub fn fer(&self) -> f32 {
        self.fer.fer()
    }

    /// Reset the accumulators for a fresh transaction.
    pub fn open(&mut self) {
        self.receive_time = Time::new(0, 1);
        for row in &mut self.decoders {
            for d in row {
                d.tti_index = 0;
            }
        }
    }

    /// Slot-dithered filler for skipped uplink slots: near-unknown values
    /// so the convolutional decoder can span short gaps.
    fn filler_burst(&mut self, size: usize) -> SoftVector {
        if self.filler.len() != size {
            let mut rng = rand::thread_rng();
            self.filler = SoftVector::from_vals(
                (0..size)
                    .map(|_| 0.5 + 0.0001 * if rng.gen::<bool>() { 1.0 } else { -1.0 })
                    .collect(),
            );
        }
        self.filler.clone()
    }

    /// Accept one received slot. Skipped slots are padded with filler so
    /// the radio frame de-segmentation never desynchronises; a skipped
    /// frame discards the partial accumulation.
    pub fn write_low_side(&mut self, burst: &RxBitsBurst) {
        let garbage_tfci = [0.5f32; 2];
        let received_slot = burst.time.tn();
        if received_slot == 0 {
            // If only the last slot of the previous frame was missed, fill
            // it in and let that frame complete.
            if burst.time.fnr() == (self.receive_time.fnr() + 1) % common::HYPERFRAME
                && self.receive_time.tn() == SLOTS_PER_FRAME - 1
            {
                warn!(time = %burst.time, "skipped 1 slot");
                let filler = self.filler_burst(burst.data.len());
                self.accumulate_slot(&filler, &garbage_tfci);
            }
            self.receive_time = burst.time;
            self.slot_size = burst.data.len();
        }
        if burst.time.fnr() != self.receive_time.fnr() {
            warn!(expected = %self.receive_time, got = %burst.time, "skipped uplink frames");
            self.receive_time = Time::new(0, 1);
            return;
        }
        if burst.data.len() != self.slot_size {
            warn!(
                size = burst.data.len(),
                expected = self.slot_size,
                "uplink slot size changed mid-frame"
            );
            self.receive_time = Time::new(0, 1);
            return;
        }
        if self.receive_time.tn() < received_slot {
            let skipped = received_slot - self.receive_time.tn();
            warn!(skipped, time = %burst.time, "skipped uplink slots");
        }
        while self.receive_time.tn() < received_slot {
            let filler = self.filler_burst(burst.data.len());
            self.accumulate_slot(&filler, &garbage_tfci);
        }
        self.accumulate_slot(&burst.data, &burst.tfci_bits);
    }

    /// Accept a whole radio frame of despread data with the 30 raw TFCI
    /// bits of its slots.
    pub fn write_low_side_frame(&mut self, burst: &RxBitsBurst, tfci: &[f32; UL_RAW_TFCI_BITS]) {
        self.receive_time = burst.time;
        self.slot_size = burst.data.len() / SLOTS_PER_FRAME;
        for slot in 0..SLOTS_PER_FRAME {
            let seg = burst.data.segment(slot * self.slot_size, self.slot_size);
            let tfci_seg = [tfci[slot * 2], tfci[slot * 2 + 1]];
            self.accumulate_slot(&seg, &tfci_seg);
        }
    }

    fn accumulate_slot(&mut self, data: &SoftVector, tfci_bits: &[f32; 2]) {
        let slot_index = self.receive_time.tn();
        let frame_index = self.receive_time.fnr();
        let full_size = data.len() * SLOTS_PER_FRAME;
        if self.slot_accumulator.len() != full_size {
            self.slot_accumulator = SoftVector::new(full_size);
        }
        data.copy_to_segment(&mut self.slot_accumulator, slot_index * data.len());
        self.raw_tfci[2 * slot_index] = tfci_bits[0];
        self.raw_tfci[2 * slot_index + 1] = tfci_bits[1];
        self.receive_time.inc_tn();
        if self.receive_time.tn() != 0 {
            return;
        }

        let tfci = find_tfci(&self.raw_tfci, self.info.num_tfc());
        debug!(tfci, time = %self.receive_time, "radio frame complete");
        let frame = std::mem::replace(&mut self.slot_accumulator, SoftVector::new(0));
        self.second_deinterleave(&frame, tfci, frame_index as usize);
        self.slot_accumulator = frame;
    }

    /// 25.212 4.2.11 inverse. In the uplink it runs before the first
    /// deinterleaving; uplink radio frames are always a multiple of 30.
    fn second_deinterleave(&mut self, frame: &SoftVector, tfci: TfcId, frame_index: usize) {
        let mut deinterleaved = SoftVector::new(frame.len());
        interleave::deinterleave(
            frame.as_slice(),
            30,
            &INTER2_PERM,
            deinterleaved.as_mut_slice(),
        );
        self.demultiplex(&deinterleaved, tfci, frame_index);
    }

    /// 25.212 4.2.8 inverse: slice the radio frame into per-TrCh segments
    /// using the layout of the detected TFC.
    fn demultiplex(&mut self, frame: &SoftVector, tfci: TfcId, frame_index: usize) {
        if tfci >= self.info.num_tfc() {
            warn!(tfci, "TFCI outside the TFCS; dropping radio frame");
            return;
        }
        let mut loc = 0usize;
        for tcid in 0..self.info.num_trch() {
            let prog = *self.info.prog(tcid, tfci);
            let nbits = prog.low_side_rm_sz;
            if nbits == 0 {
                continue;
            }
            let seg = frame.segment(loc, nbits);
            loc += nbits;
            self.rate_dematch(tcid, tfci, &prog, &seg, frame_index);
        }
        if loc != 0 && loc != frame.len() {
            trace!(consumed = loc, frame = frame.len(), "frame larger than TFC layout");
        }
    }

    /// 25.212 4.2.7 inverse, per radio frame with the per-frame e-ini.
    fn rate_dematch(
        &mut self,
        tcid: TrChId,
        tfci: TfcId,
        prog: &FecProg,
        frame: &SoftVector,
        frame_index: usize,
    ) {
        let nframes = self.info.trch_prog(tcid).tti.num_frames();
        let dec = &mut self.decoders[tcid][tfci];
        dec.tti_index = frame_index % nframes;
        if prog.low_side_rm_sz == prog.high_side_rm_sz {
            let copy = frame.clone();
            self.unsegment_radio_frame(tcid, tfci, prog, &copy);
        } else {
            let eini = dec.einis[dec.tti_index];
            let mut rm = std::mem::replace(&mut dec.rm_buf, SoftVector::new(0));
            if rate_match_auto(frame.as_slice(), rm.as_mut_slice(), eini).is_err() {
                warn!(tcid, tfci, "rate dematching failed; dropping frame");
                self.decoders[tcid][tfci].rm_buf = rm;
                return;
            }
            let out = rm.clone();
            self.decoders[tcid][tfci].rm_buf = rm;
            self.unsegment_radio_frame(tcid, tfci, prog, &out);
        }
    }

    /// 25.212 4.2.6 inverse: gather the radio frames of one TTI.
    fn unsegment_radio_frame(
        &mut self,
        tcid: TrChId,
        tfci: TfcId,
        prog: &FecProg,
        frame: &SoftVector,
    ) {
        let nframes = self.info.trch_prog(tcid).tti.num_frames();
        if nframes == 1 {
            self.first_deinterleave(tcid, tfci, prog, frame);
            return;
        }
        let dec = &mut self.decoders[tcid][tfci];
        frame.copy_to_segment(&mut dec.tti_buf, dec.tti_index * frame.len());
        if dec.tti_index < nframes - 1 {
            return;
        }
        dec.tti_index = 0;
        let tti = dec.tti_buf.clone();
        self.first_deinterleave(tcid, tfci, prog, &tti);
    }

    /// 25.212 4.2.5 inverse over the TTI.
    fn first_deinterleave(&mut self, tcid: TrChId, tfci: TfcId, prog: &FecProg, tti: &SoftVector) {
        let tti_code = self.info.trch_prog(tcid).tti;
        let mut out = SoftVector::new(tti.len());
        interleave::deinterleave(
            tti.as_slice(),
            interleave::inter1_columns(tti_code),
            interleave::inter1_perm(tti_code),
            out.as_mut_slice(),
        );
        self.channel_decode(tcid, tfci, prog, &out);
    }

    /// 25.212 4.2.3 inverse with 4.2.2.2 code block de-segmentation; the
    /// filler bits of the first code block are stripped.
    fn channel_decode(&mut self, tcid: TrChId, tfci: TfcId, prog: &FecProg, coded: &SoftVector) {
        let dec = &mut self.decoders[tcid][tfci];
        let is_turbo = dec.is_turbo();
        let zenc = if is_turbo {
            3 * Z_TURBO + 12
        } else {
            2 * Z_CONVOLUTIONAL + 16
        };
        let ci = coded.len().div_ceil(zenc);
        let kienc = coded.len() / ci;
        let ki = if is_turbo {
            (kienc - 12) / 3
        } else {
            kienc / 2 - 8
        };
        let fill = prog.fill_bits;
        debug_assert_eq!(kienc * ci, coded.len());

        let mut decoded = BitVector::new(ci * ki - fill);
        let mut block_out = BitVector::new(if is_turbo { ki } else { ki + 8 });
        for r in 0..ci {
            let segment = coded.segment(r * kienc, kienc);
            dec.decode_block(&segment, &mut block_out);
            if fill > 0 && r == 0 {
                block_out
                    .segment(fill, ki - fill)
                    .copy_to_segment(&mut decoded, 0);
            } else {
                block_out
                    .segment(0, ki)
                    .copy_to_segment(&mut decoded, r * ki - fill);
            }
        }
        self.deconcatenate(tcid, tfci, prog, &decoded);
    }

    /// 25.212 4.2.1/4.2.2.1 inverse: split the transport blocks off, check
    /// each CRC, deliver the good ones. CRC failures only feed the FER
    /// estimator.
    fn deconcatenate(&mut self, tcid: TrChId, _tfci: TfcId, prog: &FecProg, bits: &BitVector) {
        let pb = self.info.trch_prog(tcid).pb;
        let tbpb = prog.tb_size + pb;
        let mut frame_good = true;
        for j in 0..prog.num_tb {
            let payload = bits.segment(j * tbpb, prog.tb_size);
            let got_parity = bits.segment(j * tbpb + prog.tb_size, pb);
            let mut expect_parity = BitVector::new(pb);
            transport_crc(&payload, &mut expect_parity);
            // An all-zero parity word is treated as a dead channel.
            let parity_ok = expect_parity == got_parity && got_parity.sum() != 0;
            debug!(tcid, tb = j, parity_ok, "transport block parity");
            if !parity_ok {
                frame_good = false;
                continue;
            }
            if let Some(mac) = &self.upstream {
                mac.write_low_side_tb(TransportBlock::new(payload), tcid);
            }
        }
        if frame_good {
            self.fer.count_good_frame();
        } else {
            self.fer.count_bad_frame();
        }
    }
}
