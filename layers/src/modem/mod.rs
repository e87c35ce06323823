//! Chip-rate modem
//!
//! Bits to chips and back: downlink slot synthesis (CPICH, SCH, OVSF
//! spreading, complex scrambling) and uplink demodulation (PRACH preamble
//! detection and message decode, DPCCH channel estimation, DPDCH
//! despreading). Timing follows TS 25.211: 2560 chips per slot, 15 slots
//! per frame; the downlink scrambling code's chip 0 falls on the first
//! non-zero chip of the PCCPCH.

pub mod sequences;

use crate::fec::chans::{ActiveDchList, DchFec, RachFec};
use crate::fec::decoder::RxBitsBurst;
use crate::fec::encoder::{TxBitsBurst, TxSink};
use crate::phch::dl_pilot_pattern;
use common::{Clock, SoftVector, Time, CHIPS_PER_FRAME, CHIPS_PER_SLOT, SLOTS_PER_FRAME, UL_RAW_TFCI_BITS};
use num_complex::Complex32;
use sequences::{
    primary_sync_code, secondary_sync_code, DownlinkScramblingCode, OvsfTree,
    UplinkScramblingCode, AICH_SIGNATURES, RACH_SIGNATURES, RACH_SUBCHANNELS, SSC_ALLOCATIONS,
    UL_PILOT_PATTERNS,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

bitflags::bitflags! {
    /// Enabled PRACH preamble signatures.
    #[derive(Debug, Clone, Copy)]
    pub struct SignatureMask: u16 {
        const ALL = 0xffff;
    }
}

bitflags::bitflags! {
    /// Enabled PRACH subchannels (12 defined).
    #[derive(Debug, Clone, Copy)]
    pub struct SubchannelMask: u16 {
        const ALL = 0x0fff;
    }
}

/// Modem tuning parameters.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    /// Primary downlink scrambling code index, 0..511.
    pub dl_scrambling_index: usize,
    /// PRACH scrambling code offset within the primary group.
    pub prach_scrambling_code: u32,
    /// Enabled preamble signatures.
    pub signature_mask: SignatureMask,
    /// Enabled PRACH subchannels.
    pub subchannel_mask: SubchannelMask,
    /// Spreading factor of the PRACH message data part.
    pub prach_sf: usize,
    /// The signature whose channelisation codes the message part uses.
    pub prach_signature: usize,
    /// Extra samples past each slot for delay-spread search.
    pub max_delay_spread: usize,
    /// Preamble peak-to-mean detection threshold.
    pub rach_threshold: f32,
    pub cpich_amplitude: f32,
    pub psch_amplitude: f32,
    pub ssch_amplitude: f32,
    pub ccpch_amplitude: f32,
    pub dch_amplitude: f32,
}

impl Default for ModemConfig {
    fn default() -> Self {
        ModemConfig {
            dl_scrambling_index: 0,
            prach_scrambling_code: 0,
            signature_mask: SignatureMask::from_bits_truncate(1),
            subchannel_mask: SubchannelMask::from_bits_truncate(1),
            prach_sf: 64,
            prach_signature: 0,
            max_delay_spread: 100,
            rach_threshold: 10.0,
            cpich_amplitude: 10.0,
            psch_amplitude: 10.0,
            ssch_amplitude: 10.0,
            ccpch_amplitude: 10.0,
            dch_amplitude: 10.0,
        }
    }
}

/// Outbound transmit queues die when this deep: nothing is draining.
const TX_QUEUE_SANITY: usize = 10_000;
/// In-flight uplink radio slots before receive stalls for the FEC.
const UL_FIFO_DEPTH: usize = 150;
/// Uplink worker pool size.
const DCH_WORKERS: usize = 100;

/// Start of the preamble correlation window within a received slot.
const RACH_PREAMBLE_OFFSET: usize = 256;
/// Preamble correlator length in chips.
const RACH_CORRELATOR_SIZE: usize = 1024;
/// Preamble search width in chips.
const RACH_SEARCH_SIZE: usize = 100;
/// Offset of the uplink pilot template within a slot.
const UL_PILOT_OFFSET: usize = 384;
/// Uplink pilot template length in chips.
const UL_PILOT_TEMPLATE: usize = 256;
/// Nominal uplink DPCH delay: the DPCCH/DPDCH frame starts 1024 chips
/// after the downlink frame timing.
const UL_DPCH_OFFSET: usize = 1024;
/// TOA search half-width around the nominal uplink delay.
const UL_SEARCH_WINDOW: usize = 40;
/// AICH channelisation code index at SF=256.
const AICH_CODE_INDEX: usize = 2;

struct QEntry {
    time: Time,
    seq: u64,
    burst: TxBitsBurst,
}

impl PartialEq for QEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}
impl Eq for QEntry {}
impl PartialOrd for QEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: the heap must pop the earliest time first.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The per-ARFCN slot-priority transmit queue.
pub struct TxBitsQueue {
    heap: Mutex<std::collections::BinaryHeap<QEntry>>,
    seq: AtomicU64,
    underruns: AtomicU64,
}

impl Default for TxBitsQueue {
    fn default() -> Self {
        TxBitsQueue {
            heap: Mutex::new(std::collections::BinaryHeap::new()),
            seq: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }
}

impl TxBitsQueue {
    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Pop a burst strictly older than `target`, if any.
    pub fn pop_stale(&self, target: Time) -> Option<TxBitsBurst> {
        let mut heap = self.heap.lock().unwrap();
        if heap.peek()?.time < target {
            self.underruns.fetch_add(1, Ordering::Relaxed);
            return Some(heap.pop().unwrap().burst);
        }
        None
    }

    /// Pop a burst scheduled exactly at `target`, if any.
    pub fn pop_current(&self, target: Time) -> Option<TxBitsBurst> {
        let mut heap = self.heap.lock().unwrap();
        if heap.peek()?.time == target {
            return Some(heap.pop().unwrap().burst);
        }
        None
    }
}

impl TxSink for TxBitsQueue {
    fn write_high_side(&self, burst: TxBitsBurst) {
        let mut heap = self.heap.lock().unwrap();
        assert!(heap.len() < TX_QUEUE_SANITY, "transmit queue overflow: downstream dead");
        heap.push(QEntry {
            time: burst.time,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            burst,
        });
    }
}

/// One received slot-sized chunk on its way to the uplink workers.
#[derive(Clone)]
pub struct UplinkSlot {
    pub time: Time,
    pub samples: Arc<Vec<Complex32>>,
}

struct RachState {
    /// Conjugated preamble templates per signature.
    preamble_table: Vec<Vec<Complex32>>,
    /// Conjugated scrambled pilot templates per message slot.
    pilot_templates: Vec<Vec<Complex32>>,
    message_pending: bool,
    next_message_start: Time,
    expected_toa: i32,
    /// Descrambled message chips accumulated over a frame.
    frame: Vec<Complex32>,
    tfci_soft: [f32; UL_RAW_TFCI_BITS],
}

struct DpdchState {
    frame_time: Time,
    active: bool,
    best_snr: f32,
    best_toa: i32,
    best_channel: Complex32,
    guess_toa: Option<i32>,
    raw_frame: Vec<Complex32>,
    tfci_soft: [f32; UL_RAW_TFCI_BITS],
    tpc_soft: [f32; UL_RAW_TFCI_BITS],
}

impl DpdchState {
    fn new(time: Time, max_delay: usize) -> Self {
        DpdchState {
            frame_time: time,
            active: false,
            best_snr: -1000.0,
            best_toa: 0,
            best_channel: Complex32::new(1.0, 0.0),
            guess_toa: None,
            raw_frame: vec![Complex32::default(); CHIPS_PER_FRAME + UL_DPCH_OFFSET + max_delay],
            tfci_soft: [0.5; UL_RAW_TFCI_BITS],
            tpc_soft: [0.5; UL_RAW_TFCI_BITS],
        }
    }
}

/// The chip-rate modem of one ARFCN.
pub struct RadioModem {
    config: ModemConfig,
    ovsf: OvsfTree,
    /// Downlink scrambling aligned to FN=0 (index 0 at the first non-zero
    /// PCCPCH chip).
    dl_scramble_i: Vec<i8>,
    dl_scramble_q: Vec<i8>,
    /// Per-slot P-SCH + S-SCH contribution (first 256 chips).
    sch_i: Vec<Vec<f32>>,
    sch_q: Vec<Vec<f32>>,
    /// CPICH contribution for one slot.
    cpich_i: Vec<f32>,
    cpich_q: Vec<f32>,
    pub tx_queue: Arc<TxBitsQueue>,
    pub active_dch: Arc<ActiveDchList>,
    rach_fec: Arc<RachFec>,
    clock: Arc<Clock>,
    last_transmit_time: Mutex<Time>,
    rach: Mutex<RachState>,
    message_scrambling: Arc<UplinkScramblingCode>,
    ul_codes: Mutex<HashMap<u32, Arc<UplinkScramblingCode>>>,
    /// Pilot-match templates keyed by (scrambling code, n_pilot).
    ul_pilots: Mutex<HashMap<(u32, usize), Arc<Vec<Vec<Complex32>>>>>,
    dch_states: Mutex<HashMap<u32, DpdchState>>,
}

/// Template correlation over a search window.
/// corr[t] = sum_k conj(template[k]) * burst[start + t + k].
fn correlate(
    burst: &[Complex32],
    template: &[Complex32],
    start: usize,
    window: usize,
) -> Vec<Complex32> {
    let mut out = Vec::with_capacity(window);
    for t in 0..window {
        let mut acc = Complex32::default();
        let base = start + t;
        if base + template.len() <= burst.len() {
            for (k, &c) in template.iter().enumerate() {
                acc += c.conj() * burst[base + k];
            }
        }
        out.push(acc);
    }
    out
}

/// Peak of a correlation window: (channel estimate, offset, peak-to-mean).
fn peak_detect(corr: &[Complex32]) -> (Complex32, usize, f32) {
    let mut best = 0usize;
    let mut best_pwr = 0.0f32;
    let mut total = 0.0f32;
    for (t, c) in corr.iter().enumerate() {
        let p = c.norm_sqr();
        total += p;
        if p > best_pwr {
            best_pwr = p;
            best = t;
        }
    }
    let mean = (total - best_pwr) / (corr.len().max(2) - 1) as f32;
    let snr = if mean > 0.0 { best_pwr / mean } else { 0.0 };
    (corr[best], best, snr)
}

impl RadioModem {
    pub fn new(
        config: ModemConfig,
        rach_fec: Arc<RachFec>,
        active_dch: Arc<ActiveDchList>,
        clock: Arc<Clock>,
    ) -> Self {
        let ovsf = OvsfTree::new();
        let dl_code = DownlinkScramblingCode::new(16 * config.dl_scrambling_index);
        // TS 25.213 5.2.2: the code group selects the S-SCH sequence.
        let ssch_group = (16 * config.dl_scrambling_index) / 128;

        // P-SCH and S-SCH occupy the first 256 chips of every slot; the
        // -1 coefficient flags the PCCPCH as non-STTD-encoded.
        let a_sttd = -1.0f32;
        let psc = primary_sync_code();
        let mut sch_i = Vec::with_capacity(SLOTS_PER_FRAME);
        let mut sch_q = Vec::with_capacity(SLOTS_PER_FRAME);
        for slot in 0..SLOTS_PER_FRAME {
            let ssc = secondary_sync_code(16 * (SSC_ALLOCATIONS[ssch_group][slot] as usize - 1));
            let mut wi = vec![0.0f32; CHIPS_PER_SLOT];
            let mut wq = vec![0.0f32; CHIPS_PER_SLOT];
            for k in 0..256 {
                let v = config.psch_amplitude * a_sttd * psc[k] as f32
                    + config.ssch_amplitude * a_sttd * ssc[k] as f32;
                wi[k] = v;
                wq[k] = v;
            }
            sch_i.push(wi);
            sch_q.push(wq);
        }

        // CPICH: 20 zero bits per slot at (SF=256, code 0).
        let mut cpich_i = vec![0.0f32; CHIPS_PER_SLOT];
        let mut cpich_q = vec![0.0f32; CHIPS_PER_SLOT];
        {
            let code = ovsf.code(8, 0);
            let bits = common::BitVector::new(20);
            Self::spread_into(
                &bits,
                code,
                &mut cpich_i,
                &mut cpich_q,
                0,
                config.cpich_amplitude,
            );
        }

        // The PRACH message scrambling starts 4096 chips into the long
        // code (the preamble part uses the first 4096).
        let prach_code_index =
            16 * config.dl_scrambling_index as u32 + config.prach_scrambling_code;
        let message_scrambling = Arc::new(UplinkScramblingCode::new(prach_code_index));

        let preamble_table = Self::build_preamble_table(&message_scrambling);
        let pilot_templates =
            Self::build_rach_pilot_templates(&ovsf, &message_scrambling, &config);

        info!(
            dl_scrambling = config.dl_scrambling_index,
            prach_code = prach_code_index,
            ssch_group,
            "radio modem initialised"
        );

        RadioModem {
            dl_scramble_i: dl_code.i_code().to_vec(),
            dl_scramble_q: dl_code.q_code().to_vec(),
            sch_i,
            sch_q,
            cpich_i,
            cpich_q,
            tx_queue: Arc::new(TxBitsQueue::default()),
            active_dch,
            rach_fec,
            clock,
            last_transmit_time: Mutex::new(Time::default()),
            rach: Mutex::new(RachState {
                preamble_table,
                pilot_templates,
                message_pending: false,
                next_message_start: Time::default(),
                expected_toa: 0,
                frame: vec![Complex32::default(); CHIPS_PER_FRAME],
                tfci_soft: [0.5; UL_RAW_TFCI_BITS],
            }),
            message_scrambling,
            ul_codes: Mutex::new(HashMap::new()),
            ul_pilots: Mutex::new(HashMap::new()),
            dch_states: Mutex::new(HashMap::new()),
            config,
            ovsf,
        }
    }

    /// The modulated, scrambled preamble correlation templates.
    fn build_preamble_table(scrambling: &UplinkScramblingCode) -> Vec<Vec<Complex32>> {
        let mut table = Vec::with_capacity(16);
        for &signature in RACH_SIGNATURES.iter() {
            let mut template = Vec::with_capacity(RACH_CORRELATOR_SIZE);
            for i in RACH_PREAMBLE_OFFSET..RACH_PREAMBLE_OFFSET + RACH_CORRELATOR_SIZE {
                // The 16-chip signature repeats over the 4096-chip preamble.
                let sig_chip = if (signature >> (i % 16)) & 1 != 0 { -1.0 } else { 1.0 };
                let scrambled = sig_chip * scrambling.i_code()[i] as f32;
                let arg = std::f32::consts::FRAC_PI_4
                    + std::f32::consts::FRAC_PI_2 * (i % 4) as f32;
                template.push(Complex32::new(scrambled * arg.cos(), scrambled * arg.sin()));
            }
            table.push(template);
        }
        table
    }

    /// Scrambled+spread pilot templates of the RACH message control part,
    /// one per slot.
    fn build_rach_pilot_templates(
        ovsf: &OvsfTree,
        scrambling: &UplinkScramblingCode,
        config: &ModemConfig,
    ) -> Vec<Vec<Complex32>> {
        // Control part: SF=256, code 16*signature + 15.
        let code_index = 16 * config.prach_signature + 15;
        let code = ovsf.code(8, code_index);
        let n_pilot = crate::phch::SLOT_INFO_PRACH_CONTROL[0].n_pilot;
        let mut out = Vec::with_capacity(SLOTS_PER_FRAME);
        for slot in 0..SLOTS_PER_FRAME {
            let pilots = sequences::rach_message_pilots(slot);
            let mut q = vec![0.0f32; n_pilot * 256];
            for bit in 0..n_pilot {
                let sign = if (pilots >> (n_pilot - 1 - bit)) & 1 != 0 { -1.0 } else { 1.0 };
                for (c, &chip) in code.iter().enumerate() {
                    q[bit * 256 + c] = sign * chip as f32;
                }
            }
            // Scramble (I branch is zero) and keep the correlator window.
            let scramble_base = sequences::SCRAMBLING_GUARD + slot * CHIPS_PER_SLOT;
            let mut template = Vec::with_capacity(UL_PILOT_TEMPLATE);
            for k in UL_PILOT_OFFSET..UL_PILOT_OFFSET + UL_PILOT_TEMPLATE {
                let ci = scrambling.i_code()[scramble_base + k] as f32;
                let cq = scrambling.q_code()[scramble_base + k] as f32;
                // (0 + j*q) * (ci + j*cq)
                template.push(Complex32::new(-q[k] * cq, q[k] * ci));
            }
            out.push(template);
        }
        out
    }

    /// Spread a bit vector with an OVSF code, even bits to I and odd bits
    /// to Q, accumulating into the slot waveform. DTX symbols leave their
    /// chips untouched.
    fn spread_into(
        bits: &common::BitVector,
        code: &[i8],
        acc_i: &mut [f32],
        acc_q: &mut [f32],
        start_ix: usize,
        gain: f32,
    ) {
        let code_len = code.len();
        for i in 0..bits.len() {
            let sym = bits.symbol(i);
            if sym == common::bitvector::DTX_SYMBOL {
                continue;
            }
            let acc = if i % 2 == 0 { &mut *acc_i } else { &mut *acc_q };
            let base = start_ix + (i / 2) * code_len;
            if base + code_len > acc.len() {
                break;
            }
            let g = (2.0 * (sym & 1) as f32 - 1.0) * gain;
            for (k, &chip) in code.iter().enumerate() {
                acc[base + k] += g * chip as f32;
            }
        }
    }

    fn ul_code(&self, index: u32) -> Arc<UplinkScramblingCode> {
        let mut cache = self.ul_codes.lock().unwrap();
        cache
            .entry(index)
            .or_insert_with(|| Arc::new(UplinkScramblingCode::new(index)))
            .clone()
    }

    /// Scrambled uplink DPCCH pilot templates, cached per
    /// (scrambling code, pilot count).
    fn ul_pilot_template(&self, scrambling_code: u32, n_pilot: usize) -> Arc<Vec<Vec<Complex32>>> {
        let key = (scrambling_code, n_pilot);
        if let Some(t) = self.ul_pilots.lock().unwrap().get(&key) {
            return t.clone();
        }
        let code = self.ul_code(scrambling_code);
        let ovsf_code = self.ovsf.code(8, 0);
        let mut slots = Vec::with_capacity(SLOTS_PER_FRAME);
        for slot in 0..SLOTS_PER_FRAME {
            let pattern = UL_PILOT_PATTERNS[n_pilot - 3][slot];
            let mut q = vec![0.0f32; n_pilot * 256];
            for bit in 0..n_pilot {
                let sign = if (pattern >> (n_pilot - 1 - bit)) & 1 != 0 { -1.0 } else { 1.0 };
                for (c, &chip) in ovsf_code.iter().enumerate() {
                    q[bit * 256 + c] = sign * chip as f32;
                }
            }
            let base = slot * CHIPS_PER_SLOT;
            let mut template = Vec::with_capacity(UL_PILOT_TEMPLATE);
            for k in UL_PILOT_OFFSET..UL_PILOT_OFFSET + UL_PILOT_TEMPLATE {
                let ci = code.i_code()[base + k] as f32;
                let cq = code.q_code()[base + k] as f32;
                template.push(Complex32::new(-q[k] * cq, q[k] * ci));
            }
            slots.push(template);
        }
        let arc = Arc::new(slots);
        self.ul_pilots.lock().unwrap().insert(key, arc.clone());
        arc
    }

    // ------------------------------------------------------------------
    // Downlink
    // ------------------------------------------------------------------

    /// Synthesise the downlink chips for one slot time. Returns the I/Q
    /// samples and whether any stale burst was dropped.
    pub fn transmit_slot(&self, now: Time) -> (Vec<Complex32>, bool) {
        let slot_ix = now.tn();
        let mut wi = self.cpich_i.clone();
        let mut wq = self.cpich_q.clone();
        let mut underrun = false;

        while let Some(stale) = self.tx_queue.pop_stale(now) {
            warn!(now = %now, burst = %stale.time, "dropping stale downlink burst");
            underrun = true;
        }

        // Channel codes that carried data this slot: their control fields
        // came in with the burst.
        let mut carried: HashMap<(usize, usize), bool> = HashMap::new();
        while let Some(burst) = self.tx_queue.pop_current(now) {
            let sf = 1usize << burst.sf_log2;
            let start_ix = if burst.right_justified {
                CHIPS_PER_SLOT - (burst.bits.len() / 2) * sf
            } else {
                0
            };
            trace!(
                now = %now, sf, code = burst.code_index, len = burst.bits.len(),
                "spreading downlink burst"
            );
            let gain = if burst.is_dch {
                self.config.dch_amplitude
            } else {
                self.config.ccpch_amplitude
            };
            Self::spread_into(
                &burst.bits,
                self.ovsf.code(burst.sf_log2, burst.code_index),
                &mut wi,
                &mut wq,
                start_ix,
                gain,
            );
            carried.insert((sf, burst.code_index), true);
        }

        // Keep every active DCH lit: TPC, TFCI and pilot fields go out even
        // when no data burst was queued, so the UE stays locked.
        {
            let dchs = self.active_dch.read().unwrap();
            for dch in dchs.iter().filter(|d| d.active()) {
                let phch = dch.phch();
                let sf = phch.dl_sf();
                let sf_log2 = phch.dl_sf_log2();
                let code_index = phch.sp_code();
                let slot = phch.dl_slot();
                let code = self.ovsf.code(sf_log2, code_index);

                let mut tpc = common::BitVector::new(slot.n_tpc);
                tpc.fill(1);
                let mut start_ix = sf * (slot.n_data1 / 2);
                Self::spread_into(&tpc, code, &mut wi, &mut wq, start_ix, self.config.dch_amplitude);

                if carried.contains_key(&(sf, code_index)) {
                    continue;
                }
                let mut tfci_bits = common::BitVector::new(slot.n_tfci);
                tfci_bits.fill(0);
                start_ix += sf * (slot.n_tpc / 2);
                Self::spread_into(
                    &tfci_bits, code, &mut wi, &mut wq, start_ix, self.config.dch_amplitude,
                );

                let mut pilot = common::BitVector::new(slot.n_pilot);
                pilot.fill_field(0, dl_pilot_pattern(slot.pilot_index, slot_ix) as u64, slot.n_pilot);
                let pilot_start = sf * (slot.bits_per_slot - slot.n_pilot) / 2;
                Self::spread_into(
                    &pilot, code, &mut wi, &mut wq, pilot_start, self.config.dch_amplitude,
                );
            }
        }

        // Scramble everything but the SCH, which is transmitted unscrambled.
        let base = slot_ix * CHIPS_PER_SLOT;
        let mut out = Vec::with_capacity(CHIPS_PER_SLOT);
        for k in 0..CHIPS_PER_SLOT {
            let ci = self.dl_scramble_i[base + k] as f32;
            let cq = self.dl_scramble_q[base + k] as f32;
            let fi = self.sch_i[slot_ix][k] + wi[k] * ci - wq[k] * cq;
            let fq = self.sch_q[slot_ix][k] + wi[k] * cq + wq[k] * ci;
            out.push(Complex32::new(fi, fq));
        }
        *self.last_transmit_time.lock().unwrap() = now;
        (out, underrun)
    }

    pub fn last_transmit_time(&self) -> Time {
        *self.last_transmit_time.lock().unwrap()
    }

    /// Queue a burst, refusing times already transmitted.
    pub fn add_burst(&self, burst: TxBitsBurst) -> bool {
        if burst.time > self.last_transmit_time() {
            self.tx_queue.write_high_side(burst);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Uplink: PRACH
    // ------------------------------------------------------------------

    fn descramble(
        burst: &[Complex32],
        code: &UplinkScramblingCode,
        code_offset: usize,
        out: &mut [Complex32],
    ) {
        for (k, o) in out.iter_mut().enumerate() {
            let c = Complex32::new(
                code.i_code()[code_offset + k] as f32,
                -(code.q_code()[code_offset + k] as f32),
            );
            *o = burst[k] * c;
        }
    }

    /// Despread one branch: the real result per symbol of `code_len` chips.
    fn despread_branch(burst: &[Complex32], code: &[i8], use_q: bool) -> Vec<f32> {
        let code_len = code.len();
        let symbols = burst.len() / code_len;
        let mut out = Vec::with_capacity(symbols);
        for s in 0..symbols {
            let mut acc = 0.0f32;
            for (k, &chip) in code.iter().enumerate() {
                let sample = burst[s * code_len + k];
                acc += if use_q { sample.im } else { sample.re } * chip as f32;
            }
            out.push(acc);
        }
        out
    }

    /// Access-slot alignment: RACH preambles arrive only on the slots of
    /// an enabled subchannel.
    fn is_access_slot(&self, time: Time) -> bool {
        let set1 = time.fnr() % 2 == 0 && time.tn() % 2 == 0;
        let set2 = time.fnr() % 2 == 1 && time.tn() % 2 == 1;
        if !set1 && !set2 {
            return false;
        }
        for sub in 0..12 {
            if self.config.subchannel_mask.bits() & (1 << sub) == 0 {
                continue;
            }
            let slot = RACH_SUBCHANNELS[sub][(time.fnr() % 8) as usize];
            if slot < 0 {
                continue;
            }
            let access_chip_slot = (slot as usize) * 2;
            if (set1 && access_chip_slot == time.tn())
                || (set2 && access_chip_slot % SLOTS_PER_FRAME == time.tn())
            {
                return true;
            }
        }
        false
    }

    /// Correlate the enabled signatures against a received access slot;
    /// on detection schedule the AICH and arm the message decoder.
    pub fn detect_rach_preamble(&self, slot: &UplinkSlot) -> bool {
        let mut rach = self.rach.lock().unwrap();
        if rach.message_pending {
            return false;
        }
        if !self.is_access_slot(slot.time) {
            return false;
        }
        for sig in 0..16usize {
            if self.config.signature_mask.bits() & (1 << sig) == 0 {
                continue;
            }
            let corr = correlate(
                &slot.samples,
                &rach.preamble_table[sig],
                RACH_PREAMBLE_OFFSET.saturating_sub(RACH_SEARCH_SIZE / 2),
                RACH_SEARCH_SIZE,
            );
            let (_channel, toa, snr) = peak_detect(&corr);
            if snr < self.config.rach_threshold {
                continue;
            }
            let toa = toa as i32 - (RACH_SEARCH_SIZE / 2) as i32;
            info!(signature = sig, snr, toa, time = %slot.time, "RACH preamble detected");

            // TS 25.211 7.3: acknowledge 3 (or 5) access slots later; round
            // up past anything already transmitted.
            let mut aich_time = slot.time;
            let horizon = self.clock.now().add_slots(SLOTS_PER_FRAME + 9);
            while aich_time < horizon {
                aich_time = aich_time.add_slots(SLOTS_PER_FRAME + 9);
            }
            let pattern = AICH_SIGNATURES[sig];
            let mut first = common::BitVector::new(20);
            let mut second = common::BitVector::new(12);
            for b in 0..20 {
                first.set(b, ((pattern >> (31 - b)) & 1) as u8);
            }
            for b in 0..12 {
                second.set(b, ((pattern >> (11 - b)) & 1) as u8);
            }
            self.add_burst(TxBitsBurst {
                bits: first,
                sf_log2: 8,
                code_index: AICH_CODE_INDEX,
                time: aich_time,
                right_justified: false,
                is_dch: false,
            });
            self.add_burst(TxBitsBurst {
                bits: second,
                sf_log2: 8,
                code_index: AICH_CODE_INDEX,
                time: aich_time.add_slots(1),
                right_justified: false,
                is_dch: false,
            });

            rach.next_message_start = aich_time.add_slots(3);
            rach.message_pending = true;
            rach.expected_toa = toa;
            return true;
        }
        false
    }

    /// Decode one slot of a pending RACH message; at the 15th slot the
    /// data part is despread at the TFCI-selected SF and handed to the
    /// RACH FEC.
    pub fn decode_rach_message(&self, slot: &UplinkSlot) -> bool {
        let mut rach = self.rach.lock().unwrap();
        if !rach.message_pending {
            return false;
        }
        if slot.time < rach.next_message_start {
            return false;
        }
        if rach.next_message_start.add_slots(SLOTS_PER_FRAME) <= slot.time {
            rach.message_pending = false;
            return false;
        }
        let slot_ix =
            (slot.time.tn() + SLOTS_PER_FRAME - rach.next_message_start.tn()) % SLOTS_PER_FRAME;

        // Channel/TOA from the Q-branch pilots of the control part.
        let expected = rach.expected_toa;
        let search_base = (UL_PILOT_OFFSET as i32 + expected - (UL_SEARCH_WINDOW / 2) as i32)
            .max(0) as usize;
        let corr = correlate(
            &slot.samples,
            &rach.pilot_templates[slot_ix],
            search_base,
            UL_SEARCH_WINDOW,
        );
        let (mut channel, peak, snr) = peak_detect(&corr);
        let toa = search_base as i32 + peak as i32 - UL_PILOT_OFFSET as i32;
        let ideal = 2.0 * rach.pilot_templates[slot_ix].len() as f32;
        channel /= ideal;
        debug!(slot_ix, snr, toa, "RACH message slot");
        if channel.norm_sqr() == 0.0 {
            channel = Complex32::new(1e6, 1e6);
        }

        // Align, normalise and descramble this slot into the frame buffer.
        let start = toa.max(0) as usize;
        let mut aligned = vec![Complex32::default(); CHIPS_PER_SLOT];
        for (k, a) in aligned.iter_mut().enumerate() {
            if start + k < slot.samples.len() {
                *a = slot.samples[start + k] / channel;
            }
        }
        let code_offset = sequences::SCRAMBLING_GUARD + slot_ix * CHIPS_PER_SLOT;
        let mut descrambled = vec![Complex32::default(); CHIPS_PER_SLOT];
        Self::descramble(&aligned, &self.message_scrambling, code_offset, &mut descrambled);
        rach.frame[slot_ix * CHIPS_PER_SLOT..(slot_ix + 1) * CHIPS_PER_SLOT]
            .copy_from_slice(&descrambled);

        // Control part TFCI bits (symbols 8 and 9 at SF=256).
        let control_code = self.ovsf.code(8, 16 * self.config.prach_signature + 15);
        let control = Self::despread_branch(&descrambled, control_code, true);
        let scale = -0.5 / 256.0;
        rach.tfci_soft[2 * slot_ix] = (scale * control[8] + 0.5).clamp(0.0, 1.0);
        rach.tfci_soft[2 * slot_ix + 1] = (scale * control[9] + 0.5).clamp(0.0, 1.0);

        if slot_ix != SLOTS_PER_FRAME - 1 {
            return true;
        }
        rach.message_pending = false;

        // TFCI selects the data SF: TFCI 0 is the half-rate format.
        let tfci = crate::fec::tfci::find_tfci(&rach.tfci_soft, self.rach_fec.num_tfc());
        let base_sf_log2 = self.config.prach_sf.ilog2() as usize;
        let sf_log2 = base_sf_log2 + usize::from(tfci == 0);
        let base_index = self.config.prach_sf * self.config.prach_signature / 16;
        let code_index = base_index * (1 + usize::from(tfci == 0));
        info!(tfci, sf = 1usize << sf_log2, "RACH message complete");

        let data_code = self.ovsf.code(sf_log2, code_index);
        let data = Self::despread_branch(&rach.frame, data_code, false);
        let bit_scale = -0.5 / (1 << sf_log2) as f32;
        let slot_bits = data.len() / SLOTS_PER_FRAME;
        let start_fn = rach.next_message_start.fnr();
        for j in 0..SLOTS_PER_FRAME {
            let soft = SoftVector::from_vals(
                data[j * slot_bits..(j + 1) * slot_bits]
                    .iter()
                    .map(|&v| (bit_scale * v + 0.5).clamp(0.0, 1.0))
                    .collect(),
            );
            let burst = RxBitsBurst {
                sf_log2,
                data: soft,
                time: Time::new(start_fn, j),
                tfci_bits: [rach.tfci_soft[2 * j], rach.tfci_soft[2 * j + 1]],
            };
            self.rach_fec.write_low_side(&burst);
        }
        true
    }

    // ------------------------------------------------------------------
    // Uplink: DCH
    // ------------------------------------------------------------------

    /// Process one received slot for one active DCH: channel estimation
    /// on the DPCCH pilots, control field extraction and, at frame end,
    /// frame-wise data despreading into the FEC decoder.
    pub fn decode_dch_slot(&self, dch: &Arc<DchFec>, slot: &UplinkSlot) {
        let phch = dch.phch();
        let scrambling_code = phch.sr_code();
        let n_pilot = phch.ul_dpcch().n_pilot;
        let slot_ix = slot.time.tn();

        let mut states = self.dch_states.lock().unwrap();
        let state = states.entry(scrambling_code).or_insert_with(|| {
            DpdchState::new(slot.time, self.config.max_delay_spread)
        });
        if slot_ix == 0 {
            state.frame_time = slot.time;
            state.active = true;
            state.best_snr = -1000.0;
        }
        if !state.active {
            return;
        }

        // Channel and TOA from the DPCCH pilots; narrow the search when a
        // previous frame left a good guess.
        let templates = self.ul_pilot_template(scrambling_code, n_pilot);
        let (base_toa, window) = match state.guess_toa {
            Some(g) => (UL_DPCH_OFFSET as i32 + g, 10),
            None => (UL_DPCH_OFFSET as i32, UL_SEARCH_WINDOW as i32),
        };
        let search_base =
            (base_toa + UL_PILOT_OFFSET as i32 - window / 2).max(0) as usize;
        let corr = correlate(&slot.samples, &templates[slot_ix], search_base, window as usize);
        let (mut channel, peak, snr) = peak_detect(&corr);
        let toa =
            search_base as i32 + peak as i32 - UL_PILOT_OFFSET as i32 - UL_DPCH_OFFSET as i32;
        let ideal = 2.0 * templates[slot_ix].len() as f32;
        channel /= ideal;
        trace!(slot_ix, snr, toa, "DCH slot channel estimate");
        if channel.norm_sqr() == 0.0 {
            channel = Complex32::new(1e6, 1e6);
        }

        // Keep the raw chips for the frame-wise data pass.
        let dst_base = slot_ix * CHIPS_PER_SLOT;
        let copy_len = slot.samples.len().min(state.raw_frame.len() - dst_base);
        state.raw_frame[dst_base..dst_base + copy_len]
            .copy_from_slice(&slot.samples[..copy_len]);

        if state.best_snr < snr {
            state.best_snr = snr;
            state.best_toa = toa;
            state.best_channel = channel;
        }
        state.guess_toa = if snr > 3.0 { Some(toa) } else { None };

        // Control fields from this slot, aligned per the slot estimate.
        let start = (UL_DPCH_OFFSET as i32 + toa).max(0) as usize;
        let mut aligned = vec![Complex32::default(); CHIPS_PER_SLOT];
        for (k, a) in aligned.iter_mut().enumerate() {
            if start + k < slot.samples.len() {
                *a = slot.samples[start + k] / channel;
            }
        }
        let code = self.ul_code(scrambling_code);
        let mut descrambled = vec![Complex32::default(); CHIPS_PER_SLOT];
        Self::descramble(&aligned, &code, slot_ix * CHIPS_PER_SLOT, &mut descrambled);
        let control = Self::despread_branch(&descrambled, self.ovsf.code(8, 0), true);
        // DPCCH slot format 0: | pilot x6 | TFCI x2 | TPC x2 |.
        let scale = -0.5 / (256.0 * 2.0);
        state.tfci_soft[2 * slot_ix] = (scale * control[6] + 0.5).clamp(0.0, 1.0);
        state.tfci_soft[2 * slot_ix + 1] = (scale * control[7] + 0.5).clamp(0.0, 1.0);
        state.tpc_soft[2 * slot_ix] = (scale * control[8] + 0.5).clamp(0.0, 1.0);
        state.tpc_soft[2 * slot_ix + 1] = (scale * control[9] + 0.5).clamp(0.0, 1.0);

        if slot_ix != SLOTS_PER_FRAME - 1 {
            return;
        }

        // Frame complete: detect the TFCI, then despread the data at the
        // TFC's spreading factor.
        let tfci = crate::fec::tfci::find_tfci(&state.tfci_soft, dch.ul_num_tfc());
        debug!(tfci, time = %state.frame_time, fer = dch.fer(), "uplink DCH frame");
        if tfci == 0 {
            return;
        }
        let sf_log2 = dch.ul_sf_log2(tfci);
        // TS 25.213 4.3.1.2.1: a single DPDCH uses code SF/4.
        let code_index = (1usize << sf_log2) / 4;

        let start = (UL_DPCH_OFFSET as i32 + state.best_toa).max(0) as usize;
        let mut frame = vec![Complex32::default(); CHIPS_PER_FRAME];
        for (k, f) in frame.iter_mut().enumerate() {
            if start + k < state.raw_frame.len() {
                *f = state.raw_frame[start + k] / state.best_channel;
            }
        }
        let mut descrambled = vec![Complex32::default(); CHIPS_PER_FRAME];
        Self::descramble(&frame, &code, 0, &mut descrambled);
        let data = Self::despread_branch(&descrambled, self.ovsf.code(sf_log2, code_index), false);
        let bit_scale = -0.5 / ((1 << sf_log2) as f32 * 2.0);
        let soft = SoftVector::from_vals(
            data.iter()
                .map(|&v| (bit_scale * v + 0.5).clamp(0.0, 1.0))
                .collect(),
        );
        let tfci_soft = state.tfci_soft;
        let burst = RxBitsBurst {
            sf_log2,
            data: soft,
            time: Time::new(state.frame_time.fnr(), 0),
            tfci_bits: [tfci_soft[0], tfci_soft[1]],
        };
        drop(states);
        dch.write_low_side_frame(&burst, &tfci_soft);
    }
}

/// Spawn the uplink worker fan-out: one RACH task plus a pool of DCH
/// workers. The returned sender accepts one slot-sized chunk per receive
/// interval; it applies backpressure when the FEC falls behind.
pub fn spawn_uplink_workers(modem: Arc<RadioModem>) -> mpsc::Sender<UplinkSlot> {
    let (slot_tx, mut slot_rx) = mpsc::channel::<UplinkSlot>(UL_FIFO_DEPTH);

    // RACH detection task.
    let (rach_tx, mut rach_rx) = mpsc::channel::<UplinkSlot>(UL_FIFO_DEPTH);
    {
        let modem = modem.clone();
        tokio::spawn(async move {
            while let Some(slot) = rach_rx.recv().await {
                modem.detect_rach_preamble(&slot);
                modem.decode_rach_message(&slot);
            }
            debug!("RACH worker stopped");
        });
    }

    // DCH worker pool.
    let mut dch_txs = Vec::with_capacity(DCH_WORKERS);
    for _ in 0..DCH_WORKERS {
        let (tx, mut rx) = mpsc::channel::<(Arc<DchFec>, UplinkSlot)>(UL_FIFO_DEPTH);
        let modem = modem.clone();
        tokio::spawn(async move {
            while let Some((dch, slot)) = rx.recv().await {
                modem.decode_dch_slot(&dch, &slot);
            }
            debug!("DCH worker stopped");
        });
        dch_txs.push(tx);
    }

    // Dispatcher: every received slot goes to the RACH task and to one
    // worker per active DCH.
    {
        let modem = modem.clone();
        tokio::spawn(async move {
            while let Some(slot) = slot_rx.recv().await {
                if rach_tx.send(slot.clone()).await.is_err() {
                    break;
                }
                let dchs: Vec<Arc<DchFec>> = {
                    let list = modem.active_dch.read().unwrap();
                    list.iter().filter(|d| d.active()).cloned().collect()
                };
                for (i, dch) in dchs.into_iter().enumerate() {
                    let _ = dch_txs[i % DCH_WORKERS].send((dch, slot.clone())).await;
                }
            }
            debug!("uplink dispatcher stopped");
        });
    }
    slot_tx
}
