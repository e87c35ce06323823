//! TFCI coding and detection, 3GPP TS 25.212 section 4.3.3
//!
//! The TFCI (up to 10 bits) is encoded with the (32,10) sub-code of the
//! second-order Reed-Muller code. Codewords for every TFCI value we can
//! carry are precomputed once; uplink detection correlates the 30 soft
//! bits accumulated over a radio frame against each candidate codeword.

use std::sync::OnceLock;

/// Maximum TFCI value carried over the air (8-bit CTFC ceiling).
pub const MAX_TFCI: usize = 256;
/// Raw TFCI bits per uplink radio frame.
pub const UL_TFCI_BITS: usize = 30;

/// Basis sequences Mi,n of the (32,10) code, Table 8.
#[rustfmt::skip]
const REED_MULLER_TABLE: [[u8; 10]; 32] = [
    [1, 0, 0, 0, 0, 1, 0, 0, 0, 0],
    [0, 1, 0, 0, 0, 1, 1, 0, 0, 0],
    [1, 1, 0, 0, 0, 1, 0, 0, 0, 1],
    [0, 0, 1, 0, 0, 1, 1, 0, 1, 1],
    [1, 0, 1, 0, 0, 1, 0, 0, 0, 1],
    [0, 1, 1, 0, 0, 1, 0, 0, 1, 0],
    [1, 1, 1, 0, 0, 1, 0, 1, 0, 0],
    [0, 0, 0, 1, 0, 1, 0, 1, 1, 0],
    [1, 0, 0, 1, 0, 1, 1, 1, 1, 0],
    [0, 1, 0, 1, 0, 1, 1, 0, 1, 1],
    [1, 1, 0, 1, 0, 1, 0, 0, 1, 1],
    [0, 0, 1, 1, 0, 1, 0, 1, 1, 0],
    [1, 0, 1, 1, 0, 1, 0, 1, 0, 1],
    [0, 1, 1, 1, 0, 1, 1, 0, 0, 1],
    [1, 1, 1, 1, 0, 1, 1, 1, 1, 1],
    [1, 0, 0, 0, 1, 1, 1, 1, 0, 0],
    [0, 1, 0, 0, 1, 1, 1, 1, 0, 1],
    [1, 1, 0, 0, 1, 1, 1, 0, 1, 0],
    [0, 0, 1, 0, 1, 1, 0, 1, 1, 1],
    [1, 0, 1, 0, 1, 1, 0, 1, 0, 1],
    [0, 1, 1, 0, 1, 1, 0, 0, 1, 1],
    [1, 1, 1, 0, 1, 1, 0, 1, 1, 1],
    [0, 0, 0, 1, 1, 1, 0, 1, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1, 0, 1],
    [0, 1, 0, 1, 1, 1, 1, 0, 1, 0],
    [1, 1, 0, 1, 1, 1, 1, 0, 0, 1],
    [0, 0, 1, 1, 1, 1, 0, 0, 1, 0],
    [1, 0, 1, 1, 1, 1, 1, 1, 0, 0],
    [0, 1, 1, 1, 1, 1, 1, 1, 1, 0],
    [1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
    [0, 0, 0, 0, 0, 1, 0, 0, 0, 0],
    [0, 0, 0, 0, 1, 1, 1, 0, 0, 0],
];

/// Encode one TFCI value into its 32-bit codeword, b0 in the LSB.
pub fn encode_tfci(tfci: usize) -> u32 {
    debug_assert!(tfci < 1 << 10);
    let mut result = 0u32;
    for (i, row) in REED_MULLER_TABLE.iter().enumerate() {
        let mut bi = 0u32;
        for (n, &m) in row.iter().enumerate() {
            let an = (tfci >> n) as u32 & 1;
            bi += an & u32::from(m);
        }
        result |= (bi & 1) << i;
    }
    result
}

/// Codewords for every TFCI we will ever carry, computed on first use.
pub fn tfci_codes() -> &'static [u32; MAX_TFCI] {
    static CODES: OnceLock<[u32; MAX_TFCI]> = OnceLock::new();
    CODES.get_or_init(|| {
        let mut codes = [0u32; MAX_TFCI];
        for (tfci, c) in codes.iter_mut().enumerate() {
            *c = encode_tfci(tfci);
        }
        codes
    })
}

/// Pick the best-matching TFCI for 30 accumulated soft bits.
///
/// The codeword is transmitted LSB first, two bits per slot; soft values
/// outside [0,1] are clamped. A perfect match scores 30.
pub fn find_tfci(soft_bits: &[f32; UL_TFCI_BITS], num_tfci: usize) -> usize {
    debug_assert!(num_tfci <= MAX_TFCI);
    let codes = tfci_codes();
    let mut best_tfci = 0;
    let mut best_match = 0.0f32;
    for (tfci, &code) in codes.iter().enumerate().take(num_tfci) {
        let mut code = code;
        let mut this_match = 0.0f32;
        for &b in soft_bits.iter() {
            let want = code & 1;
            code >>= 1;
            let have = b.clamp(0.0, 1.0);
            this_match += if want == 1 { have } else { 1.0 - have };
        }
        if this_match > best_match {
            best_match = this_match;
            best_tfci = tfci;
        }
    }
    best_tfci
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hamming(a: u32, b: u32) -> u32 {
        (a ^ b).count_ones()
    }

    #[test]
    fn test_codeword_zero_and_one() {
        assert_eq!(encode_tfci(0), 0);
        // TFCI 1 selects basis row column 0: bit i of the codeword is Mi,0.
        let c1 = encode_tfci(1);
        for (i, row) in REED_MULLER_TABLE.iter().enumerate() {
            assert_eq!((c1 >> i) & 1, u32::from(row[0]));
        }
    }

    #[test]
    fn test_minimum_distance() {
        // The (32,10) code has minimum distance >= 10 over the values we use.
        let codes = tfci_codes();
        for a in 0..64 {
            for b in (a + 1)..64 {
                assert!(
                    hamming(codes[a], codes[b]) >= 10,
                    "d({},{}) = {}",
                    a,
                    b,
                    hamming(codes[a], codes[b])
                );
            }
        }
    }

    #[test]
    fn test_detection_hard_bits() {
        for tfci in 0..8usize {
            let mut code = encode_tfci(tfci);
            let mut soft = [0.0f32; UL_TFCI_BITS];
            for s in soft.iter_mut() {
                *s = (code & 1) as f32;
                code >>= 1;
            }
            assert_eq!(find_tfci(&soft, 8), tfci);
        }
    }

    #[test]
    fn test_detection_survives_two_flips() {
        for tfci in 0..8usize {
            for f1 in 0..UL_TFCI_BITS {
                for f2 in (f1 + 1)..UL_TFCI_BITS {
                    let mut code = encode_tfci(tfci);
                    let mut soft = [0.0f32; UL_TFCI_BITS];
                    for s in soft.iter_mut() {
                        *s = (code & 1) as f32;
                        code >>= 1;
                    }
                    soft[f1] = 1.0 - soft[f1];
                    soft[f2] = 1.0 - soft[f2];
                    assert_eq!(find_tfci(&soft, 8), tfci, "flips {} {}", f1, f2);
                }
            }
        }
    }
}
