//! Per-channel FEC objects
//!
//! Thin wrappers binding a physical channel to its encoder and decoder
//! stacks. The common channels (BCH, FACH, RACH) are configured once at
//! startup; DCHs are pre-created at every channel tree position and receive
//! their Layer-1 program when a bearer opens.

use crate::fec::decoder::{CcTrChDecoder, RxBitsBurst};
use crate::fec::encoder::{CcTrChEncoder, TxSink};
use crate::mac::{MacEngine, MacTbs, TransportBlock};
use crate::phch::PhCh;
use crate::trch::{
    config_trivial, fec_compute_dl_trch_sizes, fec_compute_ul_trch_sizes, TrChConfig,
};
use crate::LayerError;
use common::{PhChType, Time, TtiCode, UL_RAW_TFCI_BITS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

/// BCH: downlink only, not configurable, always 20 ms TTI on the PCCPCH.
pub struct BchFec {
    phch: Arc<PhCh>,
    encoder: Mutex<CcTrChEncoder>,
}

impl BchFec {
    pub fn new(sink: Arc<dyn TxSink>) -> Self {
        let phch = Arc::new(PhCh::downlink(PhChType::Pccpch, 256, 1));
        // Radio frame 270 bits; TB 246 + CRC 16 codes to 540.
        let info = config_trivial(TtiCode::Tti20ms, 16, 270);
        let encoder = CcTrChEncoder::new(info, phch.clone(), sink);
        BchFec {
            phch,
            encoder: Mutex::new(encoder),
        }
    }

    pub fn phch(&self) -> &Arc<PhCh> {
        &self.phch
    }

    pub fn tb_size(&self) -> usize {
        self.encoder.lock().unwrap().info().prog(0, 0).tb_size
    }

    pub fn next_write_time(&self) -> Time {
        self.encoder.lock().unwrap().next_write_time()
    }

    pub fn prev_write_time(&self) -> Time {
        self.encoder.lock().unwrap().prev_write_time()
    }

    pub fn open(&self, now: Time) {
        self.encoder.lock().unwrap().open(now);
    }

    pub fn write_high_side(&self, tb: &TransportBlock) -> Result<(), LayerError> {
        self.encoder.lock().unwrap().write_high_side_tb(tb)
    }
}

/// FACH: downlink common data on a SCCPCH.
pub struct FachFec {
    phch: Arc<PhCh>,
    encoder: Mutex<CcTrChEncoder>,
}

impl FachFec {
    pub fn new(
        sf: usize,
        sp_code: usize,
        pb: usize,
        tb_size: usize,
        tti: TtiCode,
        sink: Arc<dyn TxSink>,
    ) -> Result<Self, LayerError> {
        let phch = Arc::new(PhCh::downlink(PhChType::Sccpch, sf, sp_code));
        let mut config = TrChConfig::default();
        config.config_fach_trch(phch.dl_radio_frame_size(), tti, pb, tb_size);
        let info = fec_compute_dl_trch_sizes(&config.dl, phch.dl_radio_frame_size())?;
        let encoder = CcTrChEncoder::new(info, phch.clone(), sink);
        Ok(FachFec {
            phch,
            encoder: Mutex::new(encoder),
        })
    }

    pub fn phch(&self) -> &Arc<PhCh> {
        &self.phch
    }

    pub fn tb_size(&self) -> usize {
        self.encoder.lock().unwrap().info().prog(0, 1).tb_size
    }

    pub fn open(&self, now: Time) {
        self.encoder.lock().unwrap().open(now);
    }

    pub fn write_high_side(&self, tbs: &MacTbs) -> Result<(), LayerError> {
        self.encoder.lock().unwrap().write_high_side(tbs)
    }
}

/// RACH: uplink common access on the PRACH.
pub struct RachFec {
    phch: Arc<PhCh>,
    decoder: Mutex<CcTrChDecoder>,
}

impl RachFec {
    pub fn new(
        sf: usize,
        scrambling_code: u32,
        pb: usize,
        tb_size: usize,
        tti: TtiCode,
    ) -> Result<Self, LayerError> {
        let phch = Arc::new(PhCh::uplink(PhChType::Prach, sf, scrambling_code));
        let mut config = TrChConfig::default();
        config.config_rach_trch(sf, tti, pb, tb_size);
        let info = fec_compute_ul_trch_sizes(&config.ul, false)?;
        Ok(RachFec {
            phch,
            decoder: Mutex::new(CcTrChDecoder::new(info)),
        })
    }

    pub fn phch(&self) -> &Arc<PhCh> {
        &self.phch
    }

    pub fn set_upstream(&self, mac: Arc<dyn MacEngine>) {
        self.decoder.lock().unwrap().set_upstream(mac);
    }

    pub fn num_tfc(&self) -> usize {
        self.decoder.lock().unwrap().info().num_tfc()
    }

    pub fn write_low_side(&self, burst: &RxBitsBurst) {
        self.decoder.lock().unwrap().write_low_side(burst);
    }

    pub fn fer(&self) -> f32 {
        self.decoder.lock().unwrap().fer()
    }
}

struct DchStacks {
    encoder: CcTrChEncoder,
    decoder: CcTrChDecoder,
}

/// A dedicated bidirectional channel. Pre-created for every channel tree
/// position; programmed and opened when a bearer is assigned.
pub struct DchFec {
    phch: Arc<PhCh>,
    stacks: Mutex<Option<DchStacks>>,
    active: AtomicBool,
}

impl DchFec {
    pub fn new(dl_sf: usize, sp_code: usize, ul_sf: usize, sr_code: u32) -> Self {
        DchFec {
            phch: Arc::new(PhCh::new(PhChType::Dpdch, dl_sf, sp_code, ul_sf, sr_code)),
            stacks: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub fn phch(&self) -> &Arc<PhCh> {
        &self.phch
    }

    /// Apply the Layer-1 program derived from the RRC TrCh configuration.
    pub fn fec_config(
        &self,
        config: &TrChConfig,
        sink: Arc<dyn TxSink>,
        mac: Arc<dyn MacEngine>,
    ) -> Result<(), LayerError> {
        let ul_info = fec_compute_ul_trch_sizes(&config.ul, true)?;
        let dl_info = fec_compute_dl_trch_sizes(&config.dl, self.phch.dl_radio_frame_size())?;
        let encoder = CcTrChEncoder::new(dl_info, self.phch.clone(), sink);
        let mut decoder = CcTrChDecoder::new(ul_info);
        decoder.set_upstream(mac);
        *self.stacks.lock().unwrap() = Some(DchStacks { encoder, decoder });
        info!(
            dl_sf = self.phch.dl_sf(),
            code = self.phch.sp_code(),
            "DCH programmed"
        );
        Ok(())
    }

    /// Mark the channel in use; the caller already holds the tree lease.
    pub fn open(&self, now: Time) {
        let mut stacks = self.stacks.lock().unwrap();
        if let Some(s) = stacks.as_mut() {
            s.encoder.open(now);
            s.decoder.open();
        }
        self.active.store(true, Ordering::SeqCst);
    }

    /// Release; the tree lease is returned separately after the cool-off.
    pub fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn write_high_side(&self, tbs: &MacTbs) -> Result<(), LayerError> {
        let mut stacks = self.stacks.lock().unwrap();
        match stacks.as_mut() {
            Some(s) => s.encoder.write_high_side(tbs),
            None => Err(LayerError::InvalidConfiguration(
                "DCH has no Layer-1 program".into(),
            )),
        }
    }

    pub fn write_low_side_frame(&self, burst: &RxBitsBurst, tfci: &[f32; UL_RAW_TFCI_BITS]) {
        if let Some(s) = self.stacks.lock().unwrap().as_mut() {
            s.decoder.write_low_side_frame(burst, tfci);
        }
    }

    pub fn ul_num_tfc(&self) -> usize {
        self.stacks
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.decoder.info().num_tfc())
            .unwrap_or(0)
    }

    /// Uplink SF (log2) the UE uses for a detected TFC.
    pub fn ul_sf_log2(&self, tfci: usize) -> usize {
        self.stacks
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.decoder.info().prog(0, tfci).sf_log2)
            .unwrap_or(8)
    }

    pub fn fer(&self) -> f32 {
        self.stacks
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.decoder.fer())
            .unwrap_or(0.0)
    }
}

/// The currently active DCHs, shared between the transmit and receive
/// paths. Writers (open/close) wait for in-flight readers.
pub type ActiveDchList = RwLock<Vec<Arc<DchFec>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::encoder::TxBitsBurst;
    use crate::mac::CollectingMac;
    use common::{BitVector, CHIPS_PER_FRAME, SLOTS_PER_FRAME};

    #[derive(Default)]
    struct CountingSink {
        bursts: Mutex<Vec<TxBitsBurst>>,
    }

    impl TxSink for CountingSink {
        fn write_high_side(&self, burst: TxBitsBurst) {
            self.bursts.lock().unwrap().push(burst);
        }
    }

    #[test]
    fn test_dch_lifecycle() {
        let dch = DchFec::new(32, 3, 16, 0x4242);
        assert!(!dch.active());
        // Writing before the Layer-1 program is applied is refused.
        let tbs = crate::mac::MacTbs {
            tfc_index: 1,
            blocks: vec![vec![]],
        };
        assert!(dch.write_high_side(&tbs).is_err());

        let mut config = TrChConfig::default();
        config.config_dch_ps(
            CHIPS_PER_FRAME / 16,
            dch.phch().dl_radio_frame_size(),
            TtiCode::Tti10ms,
            16,
            false,
            0,
            0,
        );
        let sink = Arc::new(CountingSink::default());
        let mac = Arc::new(CollectingMac::default());
        dch.fec_config(&config, sink.clone(), mac).unwrap();
        dch.open(Time::new(0, 0));
        assert!(dch.active());
        assert!(dch.ul_num_tfc() >= 2);

        // One TTI of data produces one frame of slot bursts.
        let tb_size = {
            // The PS configuration fills the frame with one maximal block.
            config.dl.tfs(0).tf(1).tb_size
        };
        let tbs = crate::mac::MacTbs {
            tfc_index: 1,
            blocks: vec![vec![TransportBlock::new(BitVector::new(tb_size))]],
        };
        dch.write_high_side(&tbs).unwrap();
        assert_eq!(sink.bursts.lock().unwrap().len(), SLOTS_PER_FRAME);

        dch.close();
        assert!(!dch.active());
    }

    #[test]
    fn test_bch_fixed_program() {
        let sink = Arc::new(CountingSink::default());
        let bch = BchFec::new(sink.clone());
        assert_eq!(bch.tb_size(), 246);
        bch.open(Time::new(10, 0));
        bch.write_high_side(&TransportBlock::new(BitVector::new(246)))
            .unwrap();
        // A 20 ms TTI spans two radio frames of 15 slots.
        assert_eq!(sink.bursts.lock().unwrap().len(), 2 * SLOTS_PER_FRAME);
        assert_eq!(bch.next_write_time(), Time::new(12, 0));
    }
}
