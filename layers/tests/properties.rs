//! Property tests for the bit-level primitives
//!
//! Randomised laws over the vector codecs, the interleavers, the rate
//! matching kernel, the TFCI code and the turbo interleaver.

use common::{BitVector, TtiCode};
use layers::fec::interleave;
use layers::fec::parity::transport_crc;
use layers::fec::ratematch;
use layers::fec::tfci::{encode_tfci, tfci_codes};
use layers::fec::turbo::TurboInterleaver;
use proptest::prelude::*;

fn bitvec_strategy(max_len: usize) -> impl Strategy<Value = BitVector> {
    prop::collection::vec(0u8..2, 1..max_len).prop_map(|bits| {
        let mut v = BitVector::new(bits.len());
        for (i, b) in bits.into_iter().enumerate() {
            v.set(i, b);
        }
        v
    })
}

proptest! {
    #[test]
    fn pack_unpack_identity(v in bitvec_strategy(4800)) {
        let packed = v.pack();
        let mut w = BitVector::new(v.len());
        w.unpack(&packed);
        prop_assert_eq!(v, w);
    }

    #[test]
    fn hex_identity(v in bitvec_strategy(4800)) {
        let hex = v.to_hex();
        let mut w = BitVector::new(v.len());
        prop_assert!(w.from_hex(&hex));
        prop_assert_eq!(v, w);
    }

    #[test]
    fn invert_complements_sum(v in bitvec_strategy(4800)) {
        let ones = v.sum();
        let mut w = v.clone();
        w.invert();
        prop_assert_eq!(w.sum(), v.len() - ones);
    }

    #[test]
    fn reverse_is_involution(v in bitvec_strategy(1000)) {
        let mut w = v.clone();
        w.reverse();
        w.reverse();
        prop_assert_eq!(v, w);
    }

    #[test]
    fn crc_detects_single_bit_errors(
        v in bitvec_strategy(500),
        flip in any::<prop::sample::Index>(),
    ) {
        let mut parity = BitVector::new(16);
        transport_crc(&v, &mut parity);
        let mut bad = v.clone();
        let i = flip.index(bad.len());
        bad.set(i, bad.bit(i) ^ 1);
        let mut bad_parity = BitVector::new(16);
        transport_crc(&bad, &mut bad_parity);
        prop_assert_ne!(parity, bad_parity);
    }

    #[test]
    fn first_interleaver_inverts(
        rows in 1usize..200,
        tti in 0usize..4,
    ) {
        let tti = match tti {
            0 => TtiCode::Tti10ms,
            1 => TtiCode::Tti20ms,
            2 => TtiCode::Tti40ms,
            _ => TtiCode::Tti80ms,
        };
        let cols = interleave::inter1_columns(tti);
        let n = rows * cols;
        let input: Vec<u32> = (0..n as u32).collect();
        let mut mid = vec![0u32; n];
        let mut back = vec![0u32; n];
        interleave::interleave(&input, cols, interleave::inter1_perm(tti), &mut mid);
        interleave::deinterleave(&mid, cols, interleave::inter1_perm(tti), &mut back);
        prop_assert_eq!(input, back);
    }

    #[test]
    fn second_interleaver_inverts(rows in 1usize..320) {
        let n = rows * 30;
        let input: Vec<u32> = (0..n as u32).collect();
        let mut mid = vec![0u32; n];
        let mut back = vec![0u32; n];
        interleave::interleave(&input, 30, &interleave::INTER2_PERM, &mut mid);
        interleave::deinterleave(&mid, 30, &interleave::INTER2_PERM, &mut back);
        prop_assert_eq!(input, back);
    }

    #[test]
    fn rate_match_repeat_then_puncture_is_identity(
        insize in 16usize..600,
        extra in 1usize..120,
        v in bitvec_strategy(600),
    ) {
        let insize = insize.min(v.len());
        let input = v.segment(0, insize);
        let outsize = insize + extra;
        let einis = ratematch::compute_ul_eini(insize, outsize, TtiCode::Tti40ms);
        for frame in 0..4 {
            let mut expanded = BitVector::new(outsize);
            ratematch::rate_match_auto(
                input.as_slice(), expanded.as_mut_slice(), einis[frame],
            ).unwrap();
            let mut back = BitVector::new(insize);
            ratematch::rate_match_auto(
                expanded.as_slice(), back.as_mut_slice(), einis[frame],
            ).unwrap();
            prop_assert_eq!(back, input.clone());
        }
    }

    #[test]
    fn tfci_codeword_matches_basis(tfci in 0usize..256) {
        // The precomputed table agrees with a direct evaluation of the
        // basis matrix.
        prop_assert_eq!(tfci_codes()[tfci], encode_tfci(tfci));
    }

    #[test]
    fn turbo_interleaver_is_permutation(k in 40usize..=5114) {
        let il = TurboInterleaver::new(k);
        let mut seen = vec![false; k];
        for &p in il.permutation() {
            prop_assert!(p < k);
            prop_assert!(!seen[p]);
            seen[p] = true;
        }
    }
}
