//! Downlink CCTrCh encoder
//!
//! The per-TrCh half of TS 25.212 4.2 figure 2 (CRC, concatenation,
//! coding, rate matching, DTX insertion, first interleaving, radio frame
//! segmentation) followed by the combined half (TrCh multiplexing, second
//! interleaving, TFCI insertion and slot assembly). One encoder instance
//! exists per TrCh per Transport Format; they share the multiplexer of the
//! owning CCTrCh.

use crate::fec::coding::CodingKind;
use crate::fec::interleave::{self, INTER2_PERM};
use crate::fec::parity::transport_crc;
use crate::fec::ratematch;
use crate::fec::tfci::tfci_codes;
use crate::fec::turbo::{turbo_encode, TurboInterleaver};
use crate::fec::viterbi::ViterbiR2O9;
use crate::mac::{MacTbs, TransportBlock};
use crate::phch::{dl_pilot_pattern, PhCh};
use crate::trch::{CcTrChInfo, FecProg, TfcId, TrChId};
use crate::LayerError;
use common::bitvector::DTX_SYMBOL;
use common::{BitVector, PhChType, Time, SLOTS_PER_FRAME};
use std::sync::Arc;
use tracing::{debug, trace};

/// One slot's worth of bits bound for the chip-rate modem.
#[derive(Debug, Clone)]
pub struct TxBitsBurst {
    pub bits: BitVector,
    pub sf_log2: usize,
    pub code_index: usize,
    pub time: Time,
    /// Spread at the end of the slot instead of the start (PCCPCH leaves
    /// the first 256 chips to the SCH).
    pub right_justified: bool,
    pub is_dch: bool,
}

/// Downstream of the encoder: the per-ARFCN transmit queue.
pub trait TxSink: Send + Sync {
    fn write_high_side(&self, burst: TxBitsBurst);
}

enum TrChCoder {
    Conv(ViterbiR2O9),
    Turbo(TurboInterleaver),
}

/// Per-TrCh, per-TF encoder with its stage buffers.
struct TrChEncoder {
    coder: TrChCoder,
}

impl TrChEncoder {
    fn new(coding: CodingKind, code_block_sz: usize) -> Self {
        let coder = if coding.is_turbo() {
            TrChCoder::Turbo(TurboInterleaver::new(code_block_sz))
        } else {
            TrChCoder::Conv(ViterbiR2O9::default())
        };
        TrChEncoder { coder }
    }

    /// 25.212 4.2.1 and 4.2.2.1: append the CRC to each block and
    /// concatenate.
    fn crc_and_concatenate(&self, prog: &FecProg, pb: usize, blocks: &[TransportBlock]) -> BitVector {
        assert_eq!(blocks.len(), prog.num_tb);
        let mut cat = BitVector::new(prog.num_tb * (prog.tb_size + pb));
        for (tbn, tb) in blocks.iter().enumerate() {
            assert_eq!(tb.len(), prog.tb_size);
            let start = tbn * (prog.tb_size + pb);
            tb.bits.copy_to_segment(&mut cat, start);
            let mut parity = BitVector::new(pb);
            transport_crc(&tb.bits, &mut parity);
            parity.copy_to_segment(&mut cat, start + prog.tb_size);
        }
        cat
    }

    fn encode_block(&self, input: &BitVector, target: &mut BitVector) {
        match &self.coder {
            TrChCoder::Conv(coder) => coder.encode(input, target),
            TrChCoder::Turbo(interleaver) => turbo_encode(input, target, interleaver),
        }
    }

    /// 25.212 4.2.2.2 and 4.2.3: segment into code blocks (filler at the
    /// head of the first), encode each, concatenate the outputs.
    fn channel_coding(&self, prog: &FecProg, is_turbo: bool, cat: &BitVector) -> BitVector {
        if cat.is_empty() {
            return BitVector::new(0);
        }
        let ki = prog.code_block_sz;
        let ci = prog.coded_sz / if is_turbo { 3 * ki + 12 } else { 2 * ki + 16 };
        let yi = prog.fill_bits;
        let csize = if is_turbo { 3 * ki + 12 } else { 2 * ki + 16 };
        let mut coded = BitVector::new(ci * csize);
        let mut block = BitVector::new(ki + 8);
        for r in 0..ci {
            if yi > 0 && r == 0 {
                block.fill_range(0, yi, 0);
                cat.segment(0, ki - yi).copy_to_segment(&mut block, yi);
            } else {
                cat.segment(r * ki - yi, ki).copy_to_segment(&mut block, 0);
            }
            let mut csegment = BitVector::new(csize);
            if is_turbo {
                let trunc = block.segment(0, ki);
                self.encode_block(&trunc, &mut csegment);
            } else {
                // Eight tail bits flush the memory-9 coder.
                block.fill_range(ki, 8, 0);
                self.encode_block(&block, &mut csegment);
            }
            csegment.copy_to_segment(&mut coded, r * csize);
        }
        coded
    }
}

/// The downlink side of one CCTrCh.
pub struct CcTrChEncoder {
    info: CcTrChInfo,
    phch: Arc<PhCh>,
    sink: Arc<dyn TxSink>,
    /// One encoder per (TrCh, TF); entries are created for every TF the
    /// TFCS can select.
    encoders: Vec<Vec<Option<TrChEncoder>>>,
    /// One radio frame of multiplexed bits per intra-TTI frame.
    multiplexer: Vec<BitVector>,
    next_write_time: Time,
    prev_write_time: Time,
    total_frames: u64,
}

impl CcTrChEncoder {
    pub fn new(info: CcTrChInfo, phch: Arc<PhCh>, sink: Arc<dyn TxSink>) -> Self {
        let mut encoders: Vec<Vec<Option<TrChEncoder>>> = Vec::new();
        for tcid in 0..info.num_trch() {
            let coding = info.trch_prog(tcid).coding;
            let mut row: Vec<Option<TrChEncoder>> = Vec::new();
            for j in 0..info.num_tfc() {
                let prog = info.prog(tcid, j);
                let tfi = prog.tfi;
                while row.len() <= tfi {
                    row.push(None);
                }
                if row[tfi].is_none() {
                    row[tfi] = Some(TrChEncoder::new(coding, prog.code_block_sz));
                }
            }
            encoders.push(row);
        }
        let max_frames = (0..info.num_trch())
            .map(|t| info.num_radio_frames(t))
            .max()
            .unwrap_or(1);
        CcTrChEncoder {
            multiplexer: vec![BitVector::new(0); max_frames],
            info,
            phch,
            sink,
            encoders,
            next_write_time: Time::default(),
            prev_write_time: Time::default(),
            total_frames: 0,
        }
    }

    pub fn info(&self) -> &CcTrChInfo {
        &self.info
    }

    pub fn open(&mut self, now: Time) {
        self.total_frames = 0;
        self.prev_write_time = now;
        self.next_write_time = now;
    }

    pub fn next_write_time(&self) -> Time {
        self.next_write_time
    }

    pub fn prev_write_time(&self) -> Time {
        self.prev_write_time
    }

    /// Simplified downlink entry for single-TB channels (the beacon).
    pub fn write_high_side_tb(&mut self, tb: &TransportBlock) -> Result<(), LayerError> {
        assert!(self.info.is_trivial());
        let tfci = self.info.num_tfc() - 1;
        if let Some(when) = tb.scheduled {
            self.next_write_time = when;
        }
        self.encode_trch(0, tfci, std::slice::from_ref(tb))?;
        self.push_radio_frames(tfci)
    }

    /// Downlink entry from MAC: distribute the blocks of a TBS to the
    /// per-TrCh encoders and transmit the TTI.
    pub fn write_high_side(&mut self, tbs: &MacTbs) -> Result<(), LayerError> {
        let tfci = tbs.tfc_index;
        if tfci >= self.info.num_tfc() {
            return Err(LayerError::UnknownTfci(tfci));
        }
        if let Some(when) = tbs
            .blocks
            .iter()
            .flat_map(|b| b.iter())
            .find_map(|b| b.scheduled)
        {
            self.next_write_time = when;
        }
        for tcid in 0..self.info.num_trch() {
            let prog = *self.info.prog(tcid, tfci);
            let blocks = tbs.blocks.get(tcid).map(|v| v.as_slice()).unwrap_or(&[]);
            assert_eq!(blocks.len(), prog.num_tb, "TBS does not match the TFC");
            if prog.num_tb > 0 {
                self.encode_trch(tcid, tfci, blocks)?;
            } else {
                // No data on this TrCh: its radio frame segment is all DTX.
                self.fill_dtx_segment(tcid, tfci);
            }
        }
        if tfci > 0 {
            self.push_radio_frames(tfci)?;
        }
        Ok(())
    }

    /// The per-TrCh encoder chain down to the multiplexer.
    fn encode_trch(
        &mut self,
        tcid: TrChId,
        tfci: TfcId,
        blocks: &[TransportBlock],
    ) -> Result<(), LayerError> {
        let prog = *self.info.prog(tcid, tfci);
        let pb = self.info.trch_prog(tcid).pb;
        let is_turbo = self.info.trch_prog(tcid).coding.is_turbo();
        let tti = self.info.trch_prog(tcid).tti;

        let encoder = self.encoders[tcid][prog.tfi]
            .as_ref()
            .expect("no encoder for TF");

        let cat = encoder.crc_and_concatenate(&prog, pb, blocks);
        trace!(tcid, tfci, bits = cat.len(), "with parity");
        let coded = encoder.channel_coding(&prog, is_turbo, &cat);
        debug!(tcid, tfci, coded = coded.len(), "channel coded");

        // 25.212 4.2.7: downlink rate matching runs TTI-wide with e-ini 1
        // and parameters fixed by the largest TF.
        assert_eq!(coded.len(), prog.high_side_rm_sz);
        let largest = self.info.largest_coded_sz(tcid);
        let nframes = tti.num_frames();
        let rf_total = prog.rf_segment_size * nframes;
        let (eplus, eminus) =
            ratematch::compute_eplus_eminus(largest, rf_total);
        let mut matched = BitVector::new(prog.low_side_rm_sz);
        ratematch::rate_match(
            coded.as_slice(),
            matched.as_mut_slice(),
            1,
            eplus,
            eminus,
        )?;

        // 25.212 4.2.9.1: pad out to the largest TF with DTX indicators;
        // these travel through both interleavers and are never transmitted.
        let tti_size = prog.rf_segment_size * nframes;
        assert!(matched.len() <= tti_size);
        let mut padded = BitVector::new(tti_size);
        matched.copy_to_segment(&mut padded, 0);
        padded.fill_range(matched.len(), tti_size - matched.len(), DTX_SYMBOL);

        // 25.212 4.2.5: first interleaving over the TTI.
        let mut interleaved = BitVector::new(tti_size);
        interleave::interleave(
            padded.as_slice(),
            interleave::inter1_columns(tti),
            interleave::inter1_perm(tti),
            interleaved.as_mut_slice(),
        );

        // 25.212 4.2.6 and 4.2.8: segment into radio frames and lay each
        // into the multiplexed CCTrCh frame at this TrCh's fixed offset.
        for frame in 0..nframes {
            let seg = interleaved.segment(frame * prog.rf_segment_size, prog.rf_segment_size);
            self.multiplex(&prog, &seg, frame, tfci);
        }
        Ok(())
    }

    fn fill_dtx_segment(&mut self, tcid: TrChId, tfci: TfcId) {
        let prog = *self.info.prog(tcid, tfci);
        let nframes = self.info.trch_prog(tcid).tti.num_frames();
        for frame in 0..nframes {
            self.ensure_multiplexer_frame(frame, tfci);
            self.multiplexer[frame].fill_range(
                prog.rf_segment_offset,
                prog.rf_segment_size,
                DTX_SYMBOL,
            );
        }
    }

    fn ensure_multiplexer_frame(&mut self, frame: usize, tfci: TfcId) {
        let frame_size = self.info.frame_size_layout(tfci);
        if self.multiplexer[frame].len() != frame_size {
            self.multiplexer[frame] = BitVector::new(frame_size);
        }
    }

    fn multiplex(&mut self, prog: &FecProg, seg: &BitVector, frame: usize, tfci: TfcId) {
        assert_eq!(seg.len(), prog.rf_segment_size);
        self.ensure_multiplexer_frame(frame, tfci);
        trace!(
            offset = prog.rf_segment_offset,
            size = prog.rf_segment_size,
            frame,
            "multiplexing TrCh segment"
        );
        seg.copy_to_segment(&mut self.multiplexer[frame], prog.rf_segment_offset);
    }

    fn push_radio_frames(&mut self, tfci: TfcId) -> Result<(), LayerError> {
        let nframes = self.info.num_radio_frames(0);
        for frame in 0..nframes {
            let bits = std::mem::take(&mut self.multiplexer[frame]);
            self.send_frame(&bits, tfci)?;
            self.multiplexer[frame] = bits;
        }
        Ok(())
    }

    /// The combined CCTrCh tail: second interleaving, TFCI coding and slot
    /// assembly for one radio frame.
    fn send_frame(&mut self, frame: &BitVector, tfci: TfcId) -> Result<(), LayerError> {
        // 25.212 4.2.11: exactly 30 columns; pad with a marker when the
        // frame is not a multiple of 30 and strip the markers afterwards.
        const C2: usize = 30;
        const PAD: u8 = 4;
        let hsize = frame.len();
        let rows = hsize.div_ceil(C2);
        let padding = C2 * rows - hsize;
        let mut interleaved = BitVector::new(hsize + padding);
        if padding == 0 {
            interleave::interleave(
                frame.as_slice(),
                C2,
                &INTER2_PERM,
                interleaved.as_mut_slice(),
            );
        } else {
            let mut padded = BitVector::new(hsize + padding);
            frame.copy_to_segment(&mut padded, 0);
            padded.fill_range(hsize, padding, PAD);
            let mut full = BitVector::new(hsize + padding);
            interleave::interleave(padded.as_slice(), C2, &INTER2_PERM, full.as_mut_slice());
            let mut out = 0;
            for i in 0..full.len() {
                if full.symbol(i) != PAD {
                    interleaved.set(out, full.symbol(i));
                    out += 1;
                }
            }
            debug_assert_eq!(out, hsize);
        }
        let u = interleaved.segment(0, hsize);

        // 25.212 4.3.3: the TFCI codeword, pre-encoded at startup.
        let mut tfci_code = tfci_codes()[tfci];

        let ch_type = self.phch.ph_ch_type();
        let data_slot_size = u.len() / SLOTS_PER_FRAME;

        if ch_type == PhChType::Pccpch {
            // The PCCPCH slot is | Tx off | 18 data bits |.
            for s in 0..SLOTS_PER_FRAME {
                let slot_bits = u.segment(s * data_slot_size, data_slot_size);
                self.sink.write_high_side(TxBitsBurst {
                    bits: slot_bits,
                    sf_log2: self.phch.dl_sf_log2(),
                    code_index: self.phch.sp_code(),
                    time: self.next_write_time.slot(s),
                    right_justified: true,
                    is_dch: false,
                });
            }
        } else {
            let dlslot = self.phch.dl_slot();
            let ndata1 = dlslot.n_data1;
            let ndata2 = dlslot.n_data2;
            let ntpc = dlslot.n_tpc;
            let ntfci = dlslot.n_tfci;
            let tfci_mask = (1u32 << ntfci) - 1;
            let npilot = dlslot.n_pilot;
            let pi = dlslot.pilot_index;
            assert_eq!(data_slot_size, ndata1 + ndata2);
            let slot_size = dlslot.bits_per_slot;

            for s in 0..SLOTS_PER_FRAME {
                let data_start = s * data_slot_size;
                let mut slot = BitVector::new(slot_size);
                let mut wp = 0usize;
                match ch_type {
                    PhChType::Sccpch => {
                        // | TFCI | Data | Pilot |
                        slot.write_field_reversed(&mut wp, (tfci_code & tfci_mask) as u64, ntfci);
                        u.segment(data_start, ndata1).copy_to_segment(&mut slot, wp);
                        wp += ndata1;
                        slot.fill_field(wp, dl_pilot_pattern(pi, s) as u64, npilot);
                    }
                    PhChType::Dpdch => {
                        // Release 4: | Data1 | TPC | TFCI | Data2 | Pilot |
                        if ndata1 > 0 {
                            u.segment(data_start, ndata1).copy_to_segment(&mut slot, wp);
                            wp += ndata1;
                        }
                        // Power control is not closed-loop here; hold the
                        // field steady so the UE keeps its level.
                        slot.fill_range(wp, ntpc, 1);
                        wp += ntpc;
                        slot.write_field_reversed(&mut wp, (tfci_code & tfci_mask) as u64, ntfci);
                        if ndata2 > 0 {
                            u.segment(data_start + ndata1, ndata2)
                                .copy_to_segment(&mut slot, wp);
                            wp += ndata2;
                        }
                        slot.fill_field(wp, dl_pilot_pattern(pi, s) as u64, npilot);
                    }
                    _ => unreachable!("not a downlink data channel"),
                }
                // The 32 TFCI code bits go out LSB first and wrap around.
                tfci_code = tfci_code.rotate_right(ntfci as u32);

                self.sink.write_high_side(TxBitsBurst {
                    bits: slot,
                    sf_log2: self.phch.dl_sf_log2(),
                    code_index: self.phch.sp_code(),
                    time: self.next_write_time.slot(s),
                    right_justified: false,
                    is_dch: ch_type == PhChType::Dpdch,
                });
            }
        }
        self.prev_write_time = self.next_write_time;
        self.next_write_time = self.next_write_time.add_frames(1);
        self.total_frames += 1;
        Ok(())
    }
}

impl CcTrChInfo {
    /// The multiplexed frame size, taking downlink DTX into account: in
    /// downlink every TrCh contributes its fixed segment regardless of TFC.
    pub fn frame_size_layout(&self, tfci: TfcId) -> usize {
        (0..self.num_trch())
            .map(|tcid| self.prog(tcid, tfci).rf_segment_size)
            .sum()
    }
}
