//! Physical channels
//!
//! Slot format tables from 3GPP TS 25.211 and the physical channel
//! descriptor tying a channelisation code, scrambling code and slot format
//! together. The OVSF code tree lives in [`tree`].

pub mod tree;

pub use tree::ChannelTree;

use common::{PhChType, CHIPS_PER_FRAME, SLOTS_PER_FRAME};

/// Field layout of one radio slot.
///
/// Data fields are in table order; unused fields are zero. The pilot index
/// selects the column set of the Npilot pattern table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFormat {
    pub slot_format: usize,
    pub sf: usize,
    pub bits_per_slot: usize,
    pub n_data1: usize,
    pub n_data2: usize,
    pub n_pilot: usize,
    pub pilot_index: usize,
    pub n_tfci: usize,
    pub n_tpc: usize,
}

const fn npilot_index(npilot: usize) -> usize {
    match npilot {
        0 | 2 => 0,
        4 => 1,
        8 => 2,
        16 => 3,
        _ => panic!("invalid pilot count"),
    }
}

const fn dl_dch_format(
    slot_format: usize,
    sf: usize,
    bits_per_slot: usize,
    n_data1: usize,
    n_data2: usize,
    n_tpc: usize,
    n_tfci: usize,
    n_pilot: usize,
) -> SlotFormat {
    assert!(n_data1 + n_data2 + n_tpc + n_tfci + n_pilot == bits_per_slot);
    SlotFormat {
        slot_format,
        sf,
        bits_per_slot,
        n_data1,
        n_data2,
        n_pilot,
        pilot_index: npilot_index(n_pilot),
        n_tfci,
        n_tpc,
    }
}

/// Downlink DPDCH/DPCCH fields, TS 25.211 Table 11 (15-slot formats).
#[rustfmt::skip]
pub static SLOT_INFO_DOWNLINK_DCH: [SlotFormat; 17] = [
    //            fmt   sf  b/slot data1 data2 tpc tfci pilot
    dl_dch_format( 0,  512,   10,    0,    4,  2,   0,   4),
    dl_dch_format( 1,  512,   10,    0,    2,  2,   2,   4),
    dl_dch_format( 2,  256,   20,    2,   14,  2,   0,   2),
    dl_dch_format( 3,  256,   20,    2,   12,  2,   2,   2),
    dl_dch_format( 4,  256,   20,    2,   12,  2,   0,   4),
    dl_dch_format( 5,  256,   20,    2,   10,  2,   2,   4),
    dl_dch_format( 6,  256,   20,    2,    8,  2,   0,   8),
    dl_dch_format( 7,  256,   20,    2,    6,  2,   2,   8),
    dl_dch_format( 8,  128,   40,    6,   28,  2,   0,   4),
    dl_dch_format( 9,  128,   40,    6,   26,  2,   2,   4),
    dl_dch_format(10,  128,   40,    6,   24,  2,   0,   8),
    dl_dch_format(11,  128,   40,    6,   22,  2,   2,   8),
    dl_dch_format(12,   64,   80,   12,   48,  4,   8,   8),
    dl_dch_format(13,   32,  160,   28,  112,  4,   8,   8),
    dl_dch_format(14,   16,  320,   56,  232,  8,   8,  16),
    dl_dch_format(15,    8,  640,  120,  488,  8,   8,  16),
    dl_dch_format(16,    4, 1280,  248, 1000,  8,   8,  16),
];

const fn sccpch_format(
    slot_format: usize,
    sf: usize,
    bits_per_slot: usize,
    n_data: usize,
    n_pilot: usize,
    n_tfci: usize,
) -> SlotFormat {
    assert!(n_data + n_pilot + n_tfci == bits_per_slot);
    SlotFormat {
        slot_format,
        sf,
        bits_per_slot,
        n_data1: n_data,
        n_data2: 0,
        n_pilot,
        pilot_index: npilot_index(n_pilot),
        n_tfci,
        n_tpc: 0,
    }
}

/// Secondary CCPCH fields, TS 25.211 Table 18.
#[rustfmt::skip]
pub static SLOT_INFO_SCCPCH: [SlotFormat; 18] = [
    //            fmt   sf  b/slot data pilot tfci
    sccpch_format( 0,  256,   20,   20,   0,   0),
    sccpch_format( 1,  256,   20,   12,   8,   0),
    sccpch_format( 2,  256,   20,   18,   0,   2),
    sccpch_format( 3,  256,   20,   10,   8,   2),
    sccpch_format( 4,  128,   40,   40,   0,   0),
    sccpch_format( 5,  128,   40,   32,   8,   0),
    sccpch_format( 6,  128,   40,   38,   0,   2),
    sccpch_format( 7,  128,   40,   30,   8,   2),
    sccpch_format( 8,   64,   80,   72,   0,   8),
    sccpch_format( 9,   64,   80,   64,   8,   8),
    sccpch_format(10,   32,  160,  152,   0,   8),
    sccpch_format(11,   32,  160,  144,   8,   8),
    sccpch_format(12,   16,  320,  312,   0,   8),
    sccpch_format(13,   16,  320,  296,  16,   8),
    sccpch_format(14,    8,  640,  632,   0,   8),
    sccpch_format(15,    8,  640,  616,  16,   8),
    sccpch_format(16,    4, 1280, 1272,   0,   8),
    sccpch_format(17,    4, 1280, 1256,  16,   8),
];

const fn ul_data_format(slot_format: usize, sf: usize, bits_per_slot: usize) -> SlotFormat {
    SlotFormat {
        slot_format,
        sf,
        bits_per_slot,
        n_data1: bits_per_slot,
        n_data2: 0,
        n_pilot: 0,
        pilot_index: 0,
        n_tfci: 0,
        n_tpc: 0,
    }
}

const fn ul_control_format(
    slot_format: usize,
    sf: usize,
    bits_per_slot: usize,
    n_pilot: usize,
    n_tpc: usize,
    n_tfci: usize,
    n_fbi: usize,
) -> SlotFormat {
    assert!(n_pilot + n_tpc + n_tfci + n_fbi == bits_per_slot);
    SlotFormat {
        slot_format,
        sf,
        bits_per_slot,
        n_data1: 0,
        n_data2: 0,
        n_pilot,
        pilot_index: 0,
        n_tfci,
        n_tpc,
    }
}

/// Uplink DPDCH fields, TS 25.211 Table 1.
#[rustfmt::skip]
pub static SLOT_INFO_UPLINK_DPDCH: [SlotFormat; 7] = [
    ul_data_format(0, 256,  10),
    ul_data_format(1, 128,  20),
    ul_data_format(2,  64,  40),
    ul_data_format(3,  32,  80),
    ul_data_format(4,  16, 160),
    ul_data_format(5,   8, 320),
    ul_data_format(6,   4, 640),
];

/// Uplink DPCCH fields, TS 25.211 Table 2.
#[rustfmt::skip]
pub static SLOT_INFO_UPLINK_DPCCH: [SlotFormat; 5] = [
    //                fmt   sf  b/slot pilot tpc tfci fbi
    ul_control_format(0,  256,   10,    6,   2,  2,  0),
    ul_control_format(1,  256,   10,    8,   2,  0,  0),
    ul_control_format(2,  256,   10,    5,   2,  2,  1),
    ul_control_format(3,  256,   10,    7,   2,  0,  1),
    ul_control_format(4,  256,   10,    6,   4,  0,  0),
];

/// Random-access message control fields, TS 25.211 Table 7.
pub static SLOT_INFO_PRACH_CONTROL: [SlotFormat; 1] =
    [ul_control_format(0, 256, 10, 8, 0, 2, 0)];

/// Random-access message data fields, TS 25.211 Table 6.
#[rustfmt::skip]
pub static SLOT_INFO_PRACH_DATA: [SlotFormat; 4] = [
    ul_data_format(0, 256, 10),
    ul_data_format(1, 128, 20),
    ul_data_format(2,  64, 40),
    ul_data_format(3,  32, 80),
];

/// The DCH slot format we use at each tree tier (SF 4 .. 256).
const DL_DCH_FORMAT_BY_TIER: [usize; tree::NUM_TIERS] = [16, 15, 14, 13, 12, 11, 7];
/// The SCCPCH slot format we use at each tree tier.
const SCCPCH_FORMAT_BY_TIER: [usize; tree::NUM_TIERS] = [16, 14, 12, 10, 8, 6, 2];

/// The downlink slot format for a channel type at a spreading factor.
pub fn dl_slot_format(ch_type: PhChType, dl_sf: usize) -> Option<&'static SlotFormat> {
    let tier = tree::sf_to_tier(dl_sf)?;
    match ch_type {
        PhChType::Dpdch => Some(&SLOT_INFO_DOWNLINK_DCH[DL_DCH_FORMAT_BY_TIER[tier]]),
        PhChType::Sccpch => Some(&SLOT_INFO_SCCPCH[SCCPCH_FORMAT_BY_TIER[tier]]),
        _ => None,
    }
}

/// Data bits per downlink radio frame for a channel type at an SF.
/// The PCCPCH is special: 18 bits per slot behind the Tx-off SCH gap.
pub fn dl_radio_frame_size(ch_type: PhChType, dl_sf: usize) -> usize {
    if ch_type == PhChType::Pccpch {
        return 270;
    }
    let slot = dl_slot_format(ch_type, dl_sf).expect("no slot format");
    SLOTS_PER_FRAME * (slot.n_data1 + slot.n_data2)
}

/// Downlink DPCCH pilot bit patterns, TS 25.211 Table 12 (and Table 19 for
/// the SCCPCH, which is identical). Only columns 1, 3, 5 and 7 vary; the
/// others are fixed at 11. The pattern for Npilot = 2, 4, 8 or 16 bits is
/// returned as an Npilot-bit word, first pilot bit in the MSB.
pub fn dl_pilot_pattern(pilot_index: usize, slot: usize) -> u16 {
    // Variable columns 1, 3, 5, 7 of the Npilot = 16 table.
    #[rustfmt::skip]
    const COLS: [[u16; SLOTS_PER_FRAME]; 4] = [
        [3, 0, 1, 0, 2, 3, 3, 2, 1, 3, 1, 2, 2, 0, 0],
        [2, 2, 1, 0, 1, 2, 0, 0, 2, 3, 1, 3, 0, 3, 3],
        [3, 3, 2, 1, 3, 1, 2, 2, 0, 0, 3, 0, 1, 0, 2],
        [2, 0, 0, 2, 3, 1, 3, 0, 3, 3, 2, 2, 1, 0, 1],
    ];
    let col1 = COLS[0][slot];
    let col3 = COLS[1][slot];
    let col5 = COLS[2][slot];
    let col7 = COLS[3][slot];
    match pilot_index {
        0 => col1,
        1 => (3 << 2) | col1,
        2 => ((((3 << 2) | col1) << 4) | (3 << 2)) | col3,
        3 => {
            let pat8 = ((((3 << 2) | col1) << 4) | (3 << 2)) | col3;
            (pat8 << 8) | (3 << 6) | (col5 << 4) | (3 << 2) | col7
        }
        _ => panic!("invalid pilot index"),
    }
}

/// A physical channel in the tree: the static chip-rate parameters of one
/// CCTrCh mapping.
#[derive(Debug, Clone)]
pub struct PhCh {
    ph_ch_type: PhChType,
    dl_sf: usize,
    /// Downlink channelisation code, 0 .. SF-1.
    sp_code: usize,
    /// Maximum uplink SF; the actual SF varies per TFC.
    ul_sf: usize,
    /// Uplink scrambling code.
    sr_code: u32,
    dl_slot: Option<&'static SlotFormat>,
    ul_dpcch: Option<&'static SlotFormat>,
}

impl PhCh {
    pub fn new(
        ph_ch_type: PhChType,
        dl_sf: usize,
        sp_code: usize,
        ul_sf: usize,
        sr_code: u32,
    ) -> Self {
        match ph_ch_type {
            PhChType::Dpdch | PhChType::Sccpch => assert!(sp_code < dl_sf),
            // Fixed by TS 25.213 5.2.1.
            PhChType::Pccpch => assert!(dl_sf == 256 && sp_code == 1),
            PhChType::Cpich => assert!(dl_sf == 256 && sp_code == 0),
            PhChType::Prach => assert!(dl_sf == 0 && sp_code == 0),
        }
        // TFCI but no FBI on the uplink DPCCH.
        let ul_dpcch = match ph_ch_type {
            PhChType::Dpdch => Some(&SLOT_INFO_UPLINK_DPCCH[0]),
            _ => None,
        };
        PhCh {
            ph_ch_type,
            dl_sf,
            sp_code,
            ul_sf,
            sr_code,
            dl_slot: dl_slot_format(ph_ch_type, dl_sf),
            ul_dpcch,
        }
    }

    /// A downlink-only common channel.
    pub fn downlink(ph_ch_type: PhChType, dl_sf: usize, sp_code: usize) -> Self {
        PhCh::new(ph_ch_type, dl_sf, sp_code, 0, 0)
    }

    /// An uplink-only channel (PRACH).
    pub fn uplink(ph_ch_type: PhChType, ul_sf: usize, sr_code: u32) -> Self {
        PhCh::new(ph_ch_type, 0, 0, ul_sf, sr_code)
    }

    pub fn ph_ch_type(&self) -> PhChType {
        self.ph_ch_type
    }

    pub fn is_dch(&self) -> bool {
        self.ph_ch_type == PhChType::Dpdch
    }

    pub fn is_rach(&self) -> bool {
        self.ph_ch_type == PhChType::Prach
    }

    pub fn dl_sf(&self) -> usize {
        self.dl_sf
    }

    pub fn dl_sf_log2(&self) -> usize {
        self.dl_sf.ilog2() as usize
    }

    pub fn ul_sf(&self) -> usize {
        self.ul_sf
    }

    pub fn sp_code(&self) -> usize {
        self.sp_code
    }

    pub fn sr_code(&self) -> u32 {
        self.sr_code
    }

    pub fn dl_slot(&self) -> &'static SlotFormat {
        self.dl_slot.expect("downlink slot format on an uplink channel")
    }

    pub fn ul_dpcch(&self) -> &'static SlotFormat {
        self.ul_dpcch.expect("uplink DPCCH format on a common channel")
    }

    /// Data bits per downlink radio frame (multiply by the TTI frames).
    pub fn dl_radio_frame_size(&self) -> usize {
        dl_radio_frame_size(self.ph_ch_type, self.dl_sf)
    }

    /// Maximum data bits per uplink radio frame.
    pub fn ul_radio_frame_size(&self) -> usize {
        CHIPS_PER_FRAME / self.ul_sf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_format_tables_consistent() {
        // Downlink is QPSK: bits/slot x SF = 2 x chips/slot.
        for f in SLOT_INFO_DOWNLINK_DCH.iter().chain(SLOT_INFO_SCCPCH.iter()) {
            assert_eq!(
                f.n_data1 + f.n_data2 + f.n_tpc + f.n_tfci + f.n_pilot,
                f.bits_per_slot
            );
            assert_eq!(f.bits_per_slot * f.sf, 2 * CHIPS_PER_SLOT_CHECK);
        }
        // Uplink branches are BPSK: bits/slot x SF = chips/slot.
        for f in SLOT_INFO_UPLINK_DPDCH
            .iter()
            .chain(SLOT_INFO_UPLINK_DPCCH.iter())
            .chain(SLOT_INFO_PRACH_CONTROL.iter())
            .chain(SLOT_INFO_PRACH_DATA.iter())
        {
            assert_eq!(f.bits_per_slot * f.sf, CHIPS_PER_SLOT_CHECK);
        }
        // The PRACH message control part carries 8 pilots and 2 TFCI bits.
        assert_eq!(SLOT_INFO_PRACH_CONTROL[0].n_pilot, 8);
        assert_eq!(SLOT_INFO_PRACH_CONTROL[0].n_tfci, 2);
    }

    const CHIPS_PER_SLOT_CHECK: usize = common::CHIPS_PER_SLOT;

    #[test]
    fn test_dl_radio_frame_sizes() {
        assert_eq!(dl_radio_frame_size(PhChType::Pccpch, 256), 270);
        // SCCPCH at SF=256 uses format 2: 18 data bits per slot.
        assert_eq!(dl_radio_frame_size(PhChType::Sccpch, 256), 270);
        // DCH at SF=256 uses format 7: 8 data bits per slot.
        assert_eq!(dl_radio_frame_size(PhChType::Dpdch, 256), 120);
    }

    #[test]
    fn test_phch_constraints() {
        let bch = PhCh::downlink(PhChType::Pccpch, 256, 1);
        assert_eq!(bch.dl_radio_frame_size(), 270);
        let dch = PhCh::new(PhChType::Dpdch, 128, 5, 64, 0x1234);
        assert_eq!(dch.dl_slot().n_tfci, 2);
        assert_eq!(dch.ul_dpcch().n_pilot, 6);
        assert_eq!(dch.ul_radio_frame_size(), 600);
    }
}
