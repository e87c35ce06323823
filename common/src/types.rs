//! Common Types for the UMTS NodeB
//!
//! Air-interface constants, channel identifiers and the radio frame/slot
//! timestamp used throughout the Layer-1 stack. Numerology per 3GPP TS 25.211.

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Chips per radio slot at 3.84 Mcps.
pub const CHIPS_PER_SLOT: usize = 2560;
/// Slots per 10 ms radio frame.
pub const SLOTS_PER_FRAME: usize = 15;
/// Chips per radio frame.
pub const CHIPS_PER_FRAME: usize = CHIPS_PER_SLOT * SLOTS_PER_FRAME;
/// Frame numbers wrap at the hyperframe.
pub const HYPERFRAME: i32 = 4096;
/// Duration of one radio frame in microseconds.
pub const FRAME_MICROSECONDS: u32 = 10_000;
/// Raw TFCI bits accumulated per uplink radio frame (2 per slot).
pub const UL_RAW_TFCI_BITS: usize = 2 * SLOTS_PER_FRAME;

/// Physical channel types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhChType {
    /// Common pilot channel, carries sync, not a TrCh.
    Cpich,
    /// Primary common control physical channel, carries the beacon.
    Pccpch,
    /// Secondary CCPCH, carries downlink FACH and PCH.
    Sccpch,
    /// Carries the uplink RACH.
    Prach,
    /// Dedicated physical data channel, bidirectional, carries DCH.
    Dpdch,
}

/// Transport channel types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrChType {
    Bch,
    Pch,
    Rach,
    Fach,
    /// Downlink DCH.
    DlDch,
    /// Uplink DCH.
    UlDch,
}

/// Transmission time interval, encoded as log2 of the frame count.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
pub enum TtiCode {
    Tti10ms = 0,
    Tti20ms = 1,
    Tti40ms = 2,
    Tti80ms = 3,
}

impl TtiCode {
    /// Radio frames per TTI: 1, 2, 4 or 8.
    pub fn num_frames(self) -> usize {
        1 << (self as usize)
    }

    /// TTI duration in milliseconds.
    pub fn millis(self) -> u32 {
        10 * self.num_frames() as u32
    }

    pub fn from_millis(ms: u32) -> Option<Self> {
        match ms {
            10 => Some(TtiCode::Tti10ms),
            20 => Some(TtiCode::Tti20ms),
            40 => Some(TtiCode::Tti40ms),
            80 => Some(TtiCode::Tti80ms),
            _ => None,
        }
    }
}

/// UMTS operating bands, 3GPP TS 25.104.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UmtsBand {
    /// Band V
    Umts850 = 850,
    /// Band VIII
    Umts900 = 900,
    /// Band IV
    Umts1700 = 1700,
    /// Band III
    Umts1800 = 1800,
    /// Band II
    Umts1900 = 1900,
    /// Band I
    Umts2100 = 2100,
}

impl UmtsBand {
    /// Downlink carrier frequency in kHz for a UARFCN in this band,
    /// 3GPP TS 25.104 section 5.
    pub fn channel_freq_khz(self, uarfcn: u32) -> Option<u32> {
        let (lo, hi, offset5) = match self {
            UmtsBand::Umts850 => (4357, 4458, 0),
            UmtsBand::Umts900 => (2937, 3088, 340 * 5),
            UmtsBand::Umts1700 => (1537, 1738, 1805 * 5),
            UmtsBand::Umts1800 => (1162, 1513, 1575 * 5),
            UmtsBand::Umts1900 => (9662, 9938, 0),
            UmtsBand::Umts2100 => (10562, 10838, 0),
        };
        if uarfcn < lo || uarfcn > hi {
            return None;
        }
        Some((uarfcn + offset5) * 1000 / 5)
    }

    /// Duplex offset between downlink and uplink carriers in kHz.
    pub fn uplink_offset_khz(self) -> u32 {
        match self {
            UmtsBand::Umts850 | UmtsBand::Umts900 => 45_000,
            UmtsBand::Umts1700 => 400_000,
            UmtsBand::Umts1800 => 95_000,
            UmtsBand::Umts1900 => 80_000,
            UmtsBand::Umts2100 => 190_000,
        }
    }
}

/// Clock difference within the hyperframe modulus, `v1 - v2`.
pub fn fn_delta(v1: i32, v2: i32) -> i32 {
    const HALF: i32 = HYPERFRAME / 2;
    let mut delta = (v1 - v2) % HYPERFRAME;
    if delta >= HALF {
        delta -= HYPERFRAME;
    } else if delta < -HALF {
        delta += HYPERFRAME;
    }
    delta
}

/// A (frame number, slot) timestamp on the air interface.
///
/// Frame numbers live in [0, 4096) and all arithmetic is modulo the
/// hyperframe. Ordering uses the shortest modular distance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Time {
    fnr: i32,
    tn: u8,
}

impl Time {
    pub fn new(fnr: i32, tn: usize) -> Self {
        debug_assert!(tn < SLOTS_PER_FRAME);
        Time {
            fnr: fnr.rem_euclid(HYPERFRAME),
            tn: tn as u8,
        }
    }

    /// Frame number.
    pub fn fnr(&self) -> i32 {
        self.fnr
    }

    /// Slot number within the frame.
    pub fn tn(&self) -> usize {
        self.tn as usize
    }

    /// Same frame, different slot.
    pub fn slot(&self, tn: usize) -> Time {
        Time::new(self.fnr, tn)
    }

    /// Advance by whole frames.
    pub fn add_frames(&self, frames: i32) -> Time {
        Time::new(self.fnr + frames, self.tn as usize)
    }

    /// Advance by one slot, wrapping into the next frame.
    pub fn inc_tn(&mut self) {
        self.advance_tn(1);
    }

    /// Advance by `step` slots.
    pub fn advance_tn(&mut self, step: usize) {
        let total = self.tn as usize + step;
        self.tn = (total % SLOTS_PER_FRAME) as u8;
        self.fnr = (self.fnr + (total / SLOTS_PER_FRAME) as i32).rem_euclid(HYPERFRAME);
    }

    /// Step back by `step` slots.
    pub fn retreat_tn(&mut self, step: usize) {
        let mut tn = self.tn as i32 - step as i32;
        while tn < 0 {
            tn += SLOTS_PER_FRAME as i32;
            self.fnr = (self.fnr - 1).rem_euclid(HYPERFRAME);
        }
        self.tn = tn as u8;
    }

    /// Advance by `slots` slots, returning the new time.
    pub fn add_slots(&self, slots: usize) -> Time {
        let mut t = *self;
        t.advance_tn(slots);
        t
    }

    /// Frame difference to another time, modulo the hyperframe.
    pub fn delta(&self, other: &Time) -> i32 {
        fn_delta(self.fnr, other.fnr)
    }
}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match fn_delta(self.fnr, other.fnr) {
            0 => self.tn.cmp(&other.tn),
            d if d < 0 => std::cmp::Ordering::Less,
            _ => std::cmp::Ordering::Greater,
        }
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.fnr, self.tn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tti_code() {
        assert_eq!(TtiCode::Tti10ms.num_frames(), 1);
        assert_eq!(TtiCode::Tti80ms.num_frames(), 8);
        assert_eq!(TtiCode::Tti40ms.millis(), 40);
        assert_eq!(TtiCode::from_millis(20), Some(TtiCode::Tti20ms));
        assert_eq!(TtiCode::from_millis(30), None);
    }

    #[test]
    fn test_fn_delta_wrap() {
        assert_eq!(fn_delta(0, 4095), 1);
        assert_eq!(fn_delta(4095, 0), -1);
        assert_eq!(fn_delta(100, 50), 50);
    }

    #[test]
    fn test_time_arithmetic() {
        let mut t = Time::new(4095, 14);
        t.inc_tn();
        assert_eq!(t, Time::new(0, 0));
        t.retreat_tn(1);
        assert_eq!(t, Time::new(4095, 14));

        let t2 = Time::new(10, 3).add_slots(27);
        assert_eq!(t2, Time::new(11, 15 + 3 + 27 - 30));
    }

    #[test]
    fn test_time_ordering_across_wrap() {
        assert!(Time::new(0, 0) > Time::new(4095, 14));
        assert!(Time::new(4000, 0) < Time::new(10, 0));
        assert!(Time::new(5, 3) < Time::new(5, 4));
    }

    #[test]
    fn test_band_frequencies() {
        assert_eq!(UmtsBand::Umts2100.channel_freq_khz(10562), Some(2_112_400));
        assert_eq!(UmtsBand::Umts2100.channel_freq_khz(100), None);
        assert_eq!(UmtsBand::Umts2100.uplink_offset_khz(), 190_000);
    }
}
