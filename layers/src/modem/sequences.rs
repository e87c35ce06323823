//! Chip-rate code sequences
//!
//! OVSF channelisation codes, downlink and uplink scrambling sequences and
//! the synchronisation codes of 3GPP TS 25.213, plus the PRACH signature
//! and access-slot tables of TS 25.211/25.214. Everything here is
//! precomputed at channel setup and indexed at chip rate afterwards.

use common::{CHIPS_PER_FRAME, SLOTS_PER_FRAME};

/// Guard past the frame so slot-aligned reads with a preamble offset never
/// wrap (the RACH message scrambling starts 4096 chips into the code).
pub const SCRAMBLING_GUARD: usize = 4096;

/// The OVSF code tree, TS 25.213 section 4.3.1: all codes for SF 1..256.
pub struct OvsfTree {
    /// codes[sf_log2][index][chip], chips are +-1.
    codes: Vec<Vec<Vec<i8>>>,
}

impl OvsfTree {
    pub fn new() -> Self {
        let mut codes: Vec<Vec<Vec<i8>>> = vec![vec![vec![1i8]]];
        for sf_log2 in 1..=8usize {
            let prev = &codes[sf_log2 - 1];
            let mut tier = Vec::with_capacity(1 << sf_log2);
            for parent in prev {
                let mut even: Vec<i8> = parent.clone();
                even.extend_from_slice(parent);
                let mut odd: Vec<i8> = parent.clone();
                odd.extend(parent.iter().map(|&c| -c));
                tier.push(even);
                tier.push(odd);
            }
            codes.push(tier);
        }
        OvsfTree { codes }
    }

    /// The code c(ch, 2^sf_log2, index).
    pub fn code(&self, sf_log2: usize, index: usize) -> &[i8] {
        &self.codes[sf_log2][index]
    }
}

impl Default for OvsfTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Downlink scrambling sequence, TS 25.213 section 5.2.2: the complex Gold
/// code truncated to one radio frame, chips as +-1 on each branch.
pub struct DownlinkScramblingCode {
    i_code: Vec<i8>,
    q_code: Vec<i8>,
}

impl DownlinkScramblingCode {
    /// `n` is the scrambling code number (16 x primary code index).
    pub fn new(n: usize) -> Self {
        const LEN: usize = (1 << 18) - 1;
        // x: x(i+18) = x(i+7) + x(i), seeded 0..0,1.
        let mut x = vec![0u8; LEN];
        x[0] = 1;
        for i in 0..LEN - 18 {
            x[i + 18] = x[i + 7] ^ x[i];
        }
        // y: all ones seed, y(i+18) = y(i+10) + y(i+7) + y(i+5) + y(i).
        let mut y = vec![0u8; LEN];
        for b in y.iter_mut().take(18) {
            *b = 1;
        }
        for i in 0..LEN - 18 {
            y[i + 18] = y[i + 10] ^ y[i + 7] ^ y[i + 5] ^ y[i];
        }
        let len = CHIPS_PER_FRAME;
        let mut i_code = Vec::with_capacity(len);
        let mut q_code = Vec::with_capacity(len);
        for i in 0..len {
            let zi = x[(i + n) % LEN] ^ y[i];
            let zq = x[(i + n + 131072) % LEN] ^ y[(i + 131072) % LEN];
            i_code.push(1 - 2 * zi as i8);
            q_code.push(1 - 2 * zq as i8);
        }
        DownlinkScramblingCode { i_code, q_code }
    }

    pub fn i_code(&self) -> &[i8] {
        &self.i_code
    }

    pub fn q_code(&self) -> &[i8] {
        &self.q_code
    }
}

/// 25-bit LFSR state for the uplink long codes; bit j is x(i+j).
#[derive(Clone, Copy)]
struct Lfsr25 {
    state: u32,
    taps: fn(u32) -> u32,
}

impl Lfsr25 {
    fn bit(&self) -> u8 {
        (self.state & 1) as u8
    }

    fn step(&mut self) {
        let new = (self.taps)(self.state) & 1;
        self.state = (self.state >> 1) | (new << 24);
    }

    fn advance(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }
}

/// Uplink long scrambling sequence, TS 25.213 section 4.3.2.2, with the
/// HPSK mapping of 4.3.1.1. Chips are +-1 on each branch.
pub struct UplinkScramblingCode {
    i_code: Vec<i8>,
    q_code: Vec<i8>,
}

impl UplinkScramblingCode {
    /// `n` is the 24-bit uplink scrambling code number.
    pub fn new(n: u32) -> Self {
        // The second constituent sequence is the first delayed by
        // 16777232 chips; run a second pair of registers from the jumped
        // state rather than materialising the 2^25-1 chip sequence.
        const DELAY: usize = 16777232;
        let x_taps = |s: u32| (s >> 3) ^ s;
        let y_taps = |s: u32| (s >> 3) ^ (s >> 2) ^ (s >> 1) ^ s;

        let mut x1 = Lfsr25 {
            state: (n & 0x00ff_ffff) | (1 << 24),
            taps: x_taps,
        };
        let mut y1 = Lfsr25 {
            state: 0x01ff_ffff,
            taps: y_taps,
        };
        let mut x2 = x1;
        let mut y2 = y1;
        x2.advance(DELAY);
        y2.advance(DELAY);

        let len = CHIPS_PER_FRAME + SCRAMBLING_GUARD;
        let mut c1 = Vec::with_capacity(len);
        let mut c2 = Vec::with_capacity(len);
        for _ in 0..len {
            c1.push(1 - 2 * ((x1.bit() ^ y1.bit()) as i8));
            c2.push(1 - 2 * ((x2.bit() ^ y2.bit()) as i8));
            x1.step();
            y1.step();
            x2.step();
            y2.step();
        }
        // HPSK: C(i) = c1(i) * (1 + j*(-1)^i * c2(2*floor(i/2))).
        let mut i_code = Vec::with_capacity(len);
        let mut q_code = Vec::with_capacity(len);
        for i in 0..len {
            let sign = if i % 2 == 0 { 1 } else { -1 };
            i_code.push(c1[i]);
            q_code.push(sign * c1[i] * c2[2 * (i / 2)]);
        }
        UplinkScramblingCode { i_code, q_code }
    }

    pub fn i_code(&self) -> &[i8] {
        &self.i_code
    }

    pub fn q_code(&self) -> &[i8] {
        &self.q_code
    }
}

/// The base sequence of the primary synchronisation code.
const PSC_A: [i8; 16] = [1, 1, 1, 1, 1, 1, -1, -1, 1, -1, 1, -1, 1, -1, -1, 1];

/// Primary SCH code, TS 25.213 5.2.3.1: 256 chips, identical on I and Q.
pub fn primary_sync_code() -> [i8; 256] {
    const PATTERN: [i8; 16] = [1, 1, 1, -1, -1, 1, -1, -1, 1, 1, 1, -1, 1, -1, 1, 1];
    let mut out = [0i8; 256];
    for (rep, &p) in PATTERN.iter().enumerate() {
        for (k, &a) in PSC_A.iter().enumerate() {
            out[rep * 16 + k] = p * a;
        }
    }
    out
}

/// Secondary SCH code number `m` (0..255 in steps of 16), TS 25.213
/// 5.2.3.2: the Hadamard row h_m times the z sequence.
pub fn secondary_sync_code(m: usize) -> [i8; 256] {
    let mut b = [0i8; 16];
    b[..8].copy_from_slice(&PSC_A[..8]);
    for k in 8..16 {
        b[k] = -PSC_A[k];
    }
    const Z_PATTERN: [i8; 16] = [1, 1, 1, -1, 1, 1, -1, -1, 1, -1, 1, -1, -1, -1, -1, -1];
    let mut out = [0i8; 256];
    for i in 0..256 {
        let z = Z_PATTERN[i / 16] * b[i % 16];
        let h = if ((m & i).count_ones() & 1) == 0 { 1 } else { -1 };
        out[i] = h * z;
    }
    out
}

/// S-SCH code-number allocation per scrambling code group and slot,
/// TS 25.213 5.2.3.2 table 4 (values are 1-based code numbers).
#[rustfmt::skip]
pub const SSC_ALLOCATIONS: [[u8; SLOTS_PER_FRAME]; 64] = [
    [1,1,2,8,9,10,15,8,10,16,2,7,15,7,16],
    [1,1,5,16,7,3,14,16,3,10,5,12,14,12,10],
    [1,2,1,15,5,5,12,16,6,11,2,16,11,15,12],
    [1,2,3,1,8,6,5,2,5,8,4,4,6,3,7],
    [1,2,16,6,6,11,15,5,12,1,15,12,16,11,2],
    [1,3,4,7,4,1,5,5,3,6,2,8,7,6,8],
    [1,4,11,3,4,10,9,2,11,2,10,12,12,9,3],
    [1,5,6,6,14,9,10,2,13,9,2,5,14,1,13],
    [1,6,10,10,4,11,7,13,16,11,13,6,4,1,16],
    [1,6,13,2,14,2,6,5,5,13,10,9,1,14,10],
    [1,7,8,5,7,2,4,3,8,3,2,6,6,4,5],
    [1,7,10,9,16,7,9,15,1,8,16,8,15,2,2],
    [1,8,12,9,9,4,13,16,5,1,13,5,12,4,8],
    [1,8,14,10,14,1,15,15,8,5,11,4,10,5,4],
    [1,9,2,15,15,16,10,7,8,1,10,8,2,16,9],
    [1,9,15,6,16,2,13,14,10,11,7,4,5,12,3],
    [1,10,9,11,15,7,6,4,16,5,2,12,13,3,14],
    [1,11,14,4,13,2,9,10,12,16,8,5,3,15,6],
    [1,12,12,13,14,7,2,8,14,2,1,13,11,8,11],
    [1,12,15,5,4,14,3,16,7,8,6,2,10,11,13],
    [1,15,4,3,7,6,10,13,12,5,14,16,8,2,11],
    [1,16,3,12,11,9,13,5,8,2,14,7,4,10,15],
    [2,2,5,10,16,11,3,10,11,8,5,13,3,13,8],
    [2,2,12,3,15,5,8,3,5,14,12,9,8,9,14],
    [2,3,6,16,12,16,3,13,13,6,7,9,2,12,7],
    [2,3,8,2,9,15,14,3,14,9,5,5,15,8,12],
    [2,4,7,9,5,4,9,11,2,14,5,14,11,16,16],
    [2,4,13,12,12,7,15,10,5,2,15,5,13,7,4],
    [2,5,9,9,3,12,8,14,15,12,14,5,3,2,15],
    [2,5,11,7,2,11,9,4,16,7,16,9,14,14,4],
    [2,6,2,13,3,3,12,9,7,16,6,9,16,13,12],
    [2,6,9,7,7,16,13,3,12,2,13,12,9,16,6],
    [2,7,12,15,2,12,4,10,13,15,13,4,5,5,10],
    [2,7,14,16,5,9,2,9,16,11,11,5,7,4,14],
    [2,8,5,12,5,2,14,14,8,15,3,9,12,15,9],
    [2,9,13,4,2,13,8,11,6,4,6,8,15,15,11],
    [2,10,3,2,13,16,8,10,8,13,11,11,16,3,5],
    [2,11,15,3,11,6,14,10,15,10,6,7,7,14,3],
    [2,16,4,5,16,14,7,11,4,11,14,9,9,7,5],
    [3,3,4,6,11,12,13,6,12,14,4,5,13,5,14],
    [3,3,6,5,16,9,15,5,9,10,6,4,15,4,10],
    [3,4,5,14,4,6,12,13,5,13,6,11,11,12,14],
    [3,4,9,16,10,4,16,15,3,5,10,5,15,6,6],
    [3,4,16,10,5,10,4,9,9,16,15,6,3,5,15],
    [3,5,12,11,14,5,11,13,3,6,14,6,13,4,4],
    [3,6,4,10,6,5,9,15,4,15,5,16,16,9,10],
    [3,7,8,8,16,11,12,4,15,11,4,7,16,3,15],
    [3,7,16,11,4,15,3,15,11,12,12,4,7,8,16],
    [3,8,7,15,4,8,15,12,3,16,4,16,12,11,11],
    [3,8,15,4,16,4,8,7,7,15,12,11,3,16,12],
    [3,10,10,15,16,5,4,6,16,4,3,15,9,6,9],
    [3,13,11,5,4,12,4,11,6,6,5,3,14,13,12],
    [3,14,7,9,14,10,13,8,7,8,10,4,4,13,9],
    [5,5,8,14,16,13,6,14,13,7,8,15,6,15,7],
    [5,6,11,7,10,8,5,8,7,12,12,10,6,9,11],
    [5,6,13,8,13,5,7,7,6,16,14,15,8,16,15],
    [5,7,9,10,7,11,6,12,9,12,11,8,8,6,10],
    [5,9,6,8,10,9,8,12,5,11,10,11,12,7,7],
    [5,10,10,12,8,11,9,7,8,9,5,12,6,7,6],
    [5,10,12,6,5,12,8,9,7,6,7,8,11,11,9],
    [5,13,15,15,14,8,6,7,16,8,7,13,14,5,16],
    [9,10,13,10,11,15,15,9,16,12,14,13,16,14,11],
    [9,11,12,15,12,9,13,13,11,14,10,16,15,14,16],
    [9,12,10,15,13,14,9,14,15,11,11,13,12,16,10],
];

/// PRACH preamble signatures P0..P15, TS 25.213 4.3.3 (bit = sign flip).
#[rustfmt::skip]
pub const RACH_SIGNATURES: [u16; 16] = [
    0b0000000000000000,
    0b0101010101010101,
    0b0011001100110011,
    0b0110011001100110,
    0b0000111100001111,
    0b0101101001011010,
    0b0011110000111100,
    0b0110100101101001,
    0b0000000011111111,
    0b0101010110101010,
    0b0011001111001100,
    0b0110011010011001,
    0b0000111111110000,
    0b0101101010100101,
    0b0011110011000011,
    0b0110100110010110,
];

/// AICH signature patterns a0..a31 per signature, TS 25.211 5.3.3.7.
#[rustfmt::skip]
pub const AICH_SIGNATURES: [u32; 16] = [
    0b00000000000000000000000000000000,
    0b00110011001100110011001100110011,
    0b00001111000011110000111100001111,
    0b00111100001111000011110000111100,
    0b00000000111111110000000011111111,
    0b00110011110011000011001111001100,
    0b00001111111100000000111111110000,
    0b00111100110000110011110011000011,
    0b00000000000000001111111111111111,
    0b00110011001100111100110011001100,
    0b00001111000011111111000011110000,
    0b00111100001111001100001111000011,
    0b00000000111111111111111100000000,
    0b00110011110011001100110000110011,
    0b00001111111100001111000000001111,
    0b00111100110000111100001100111100,
];

/// Uplink DPCCH pilot patterns for Npilot = 3..8, TS 25.211 5.2.1.1, as
/// Npilot-bit words per slot (first pilot bit in the MSB).
#[rustfmt::skip]
pub const UL_PILOT_PATTERNS: [[u8; SLOTS_PER_FRAME]; 6] = [
    // Npilot = 3
    [0b111, 0b001, 0b011, 0b001, 0b101, 0b111, 0b111, 0b101, 0b011, 0b111, 0b011,
     0b101, 0b101, 0b001, 0b001],
    // Npilot = 4
    [0b1111, 0b1001, 0b1011, 0b1001, 0b1101, 0b1111, 0b1111, 0b1101, 0b1011,
     0b1111, 0b1011, 0b1101, 0b1101, 0b1001, 0b1001],
    // Npilot = 5
    [0b11110, 0b00110, 0b01101, 0b00100, 0b10101, 0b11110, 0b11100, 0b10100,
     0b01110, 0b11111, 0b01101, 0b10111, 0b10100, 0b00111, 0b00111],
    // Npilot = 6
    [0b111110, 0b100110, 0b101101, 0b100100, 0b110101, 0b111110, 0b111100,
     0b110100, 0b101110, 0b111111, 0b101101, 0b110111, 0b110100, 0b100111,
     0b100111],
    // Npilot = 7
    [0b1111101, 0b1001101, 0b1011011, 0b1001001, 0b1101011, 0b1111101,
     0b1111001, 0b1101001, 0b1011101, 0b1111111, 0b1011011, 0b1101111,
     0b1101001, 0b1001111, 0b1001111],
    // Npilot = 8
    [0b11111110, 0b10101110, 0b10111011, 0b10101010, 0b11101011, 0b11111110,
     0b11111010, 0b11101010, 0b10111110, 0b11111111, 0b10111011, 0b11101111,
     0b11101010, 0b10101111, 0b10101111],
];

/// Pilot bits of the RACH message control part (Npilot = 8).
pub fn rach_message_pilots(slot: usize) -> u8 {
    UL_PILOT_PATTERNS[5][slot]
}

/// Access slot availability per RACH subchannel, TS 25.214 6.1.1:
/// `RACH_SUBCHANNELS[subchannel][sfn % 8]` is the access slot, or None.
#[rustfmt::skip]
pub const RACH_SUBCHANNELS: [[i8; 8]; 12] = [
    [ 0, 12, -1,  9,  6, -1,  3, -1],
    [ 1, 13, -1, 10,  7, -1,  4, -1],
    [ 2, 14, -1, 11, -1,  8,  5, -1],
    [ 3, -1,  0, 12, -1,  9,  6, -1],
    [ 4, -1,  1, 13, -1, 10,  7, -1],
    [ 5, -1,  2, 14, -1, 11, -1,  8],
    [ 6, -1,  3, -1,  0, 12, -1,  9],
    [ 7, -1,  4, -1,  1, 13, -1, 10],
    [-1,  8,  5, -1,  2, 14, -1, 11],
    [-1,  9,  6, -1,  3, -1,  0, 12],
    [-1, 10,  7, -1,  4, -1,  1, 13],
    [-1, 11, -1,  8,  5, -1,  2, 14],
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ovsf_orthogonality() {
        let tree = OvsfTree::new();
        for sf_log2 in [2usize, 4, 8] {
            let sf = 1 << sf_log2;
            for a in 0..sf {
                for b in 0..sf {
                    let dot: i32 = tree
                        .code(sf_log2, a)
                        .iter()
                        .zip(tree.code(sf_log2, b))
                        .map(|(&x, &y)| x as i32 * y as i32)
                        .sum();
                    assert_eq!(dot, if a == b { sf as i32 } else { 0 });
                }
            }
        }
    }

    #[test]
    fn test_ovsf_parent_child_relation() {
        let tree = OvsfTree::new();
        // c(2n, 2i) is c(n, i) repeated; c(2n, 2i+1) is it negated in the
        // second half.
        let parent: Vec<i8> = tree.code(3, 5).to_vec();
        let even = tree.code(4, 10);
        let odd = tree.code(4, 11);
        assert_eq!(&even[..8], &parent[..]);
        assert_eq!(&even[8..], &parent[..]);
        assert_eq!(&odd[..8], &parent[..]);
        for k in 0..8 {
            assert_eq!(odd[8 + k], -parent[k]);
        }
    }

    #[test]
    fn test_downlink_code_balanced() {
        let code = DownlinkScramblingCode::new(0);
        assert_eq!(code.i_code().len(), CHIPS_PER_FRAME);
        // A Gold code is nearly balanced over a frame.
        let sum: i32 = code.i_code().iter().map(|&c| c as i32).sum();
        assert!(sum.abs() < 1000, "I branch bias {}", sum);
        // Different code numbers give different sequences.
        let other = DownlinkScramblingCode::new(16);
        assert_ne!(code.i_code()[..64], other.i_code()[..64]);
    }

    #[test]
    fn test_uplink_code_hpsk_structure() {
        let code = UplinkScramblingCode::new(0x1234);
        // Every chip is +-1 on both branches.
        for i in 0..128 {
            assert!(code.i_code()[i] == 1 || code.i_code()[i] == -1);
            assert!(code.q_code()[i] == 1 || code.q_code()[i] == -1);
        }
        // HPSK: consecutive even/odd pairs satisfy
        // q(2k)*i(2k) == -q(2k+1)*i(2k+1).
        for k in 0..64 {
            let a = code.q_code()[2 * k] as i32 * code.i_code()[2 * k] as i32;
            let b = code.q_code()[2 * k + 1] as i32 * code.i_code()[2 * k + 1] as i32;
            assert_eq!(a, -b, "pair {}", k);
        }
    }

    #[test]
    fn test_sync_codes() {
        let psc = primary_sync_code();
        assert_eq!(psc[0], 1);
        assert_eq!(psc.iter().filter(|&&c| c == 1).count() + psc.iter().filter(|&&c| c == -1).count(), 256);
        // Secondary codes for different m are orthogonal by Hadamard rows.
        let s0 = secondary_sync_code(0);
        let s16 = secondary_sync_code(16);
        let dot: i32 = s0.iter().zip(s16.iter()).map(|(&a, &b)| a as i32 * b as i32).sum();
        assert_eq!(dot, 0);
    }

    #[test]
    fn test_tables_shape() {
        assert_eq!(SSC_ALLOCATIONS.len(), 64);
        for row in &SSC_ALLOCATIONS {
            for &v in row {
                assert!((1..=16).contains(&v));
            }
        }
        for row in &RACH_SUBCHANNELS {
            for &v in row {
                assert!(v >= -1 && v < 15);
            }
        }
    }
}
