//! Block interleavers, 3GPP TS 25.212 sections 4.2.5 and 4.2.11
//!
//! Both interleavers write the input row-by-row into a matrix, permute the
//! columns, and read the result column-by-column. The first interleaver
//! spans a TTI with 1, 2, 4 or 8 columns; the second spans one radio frame
//! with exactly 30 columns.

use common::TtiCode;

/// Inter-column permutation patterns for 1st interleaving, Table 4.
pub const INTER1_PERM: [&[usize]; 4] = [
    &[0],
    &[0, 1],
    &[0, 2, 1, 3],
    &[0, 4, 2, 6, 1, 5, 3, 7],
];

/// Inter-column permutation pattern for 2nd interleaving, Table 7.
pub const INTER2_PERM: [usize; 30] = [
    0, 20, 10, 5, 15, 25, 3, 13, 23, 8, 18, 28, 1, 11, 21, 6, 16, 26, 4, 14, 24, 19, 9, 29, 12, 2,
    7, 22, 27, 17,
];

/// Column count of the 1st interleaver for a TTI.
pub fn inter1_columns(tti: TtiCode) -> usize {
    tti.num_frames()
}

/// Column permutation of the 1st interleaver for a TTI.
pub fn inter1_perm(tti: TtiCode) -> &'static [usize] {
    INTER1_PERM[tti as usize]
}

/// Interleave `input` into `output` through a matrix of `columns` columns
/// read out in the order given by `perm`. The length must be a multiple of
/// the column count.
pub fn interleave<T: Copy>(input: &[T], columns: usize, perm: &[usize], output: &mut [T]) {
    debug_assert_eq!(input.len(), output.len());
    debug_assert_eq!(input.len() % columns, 0);
    let rows = input.len() / columns;
    let mut out = 0;
    for &col in &perm[..columns] {
        for row in 0..rows {
            output[out] = input[row * columns + col];
            out += 1;
        }
    }
}

/// Exact inverse of [`interleave`].
pub fn deinterleave<T: Copy>(input: &[T], columns: usize, perm: &[usize], output: &mut [T]) {
    debug_assert_eq!(input.len(), output.len());
    debug_assert_eq!(input.len() % columns, 0);
    let rows = input.len() / columns;
    let mut inp = 0;
    for &col in &perm[..columns] {
        for row in 0..rows {
            output[row * columns + col] = input[inp];
            inp += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inter1_involution_all_ttis() {
        for tti in [
            TtiCode::Tti10ms,
            TtiCode::Tti20ms,
            TtiCode::Tti40ms,
            TtiCode::Tti80ms,
        ] {
            let cols = inter1_columns(tti);
            let n = cols * 17;
            let input: Vec<u32> = (0..n as u32).collect();
            let mut mid = vec![0u32; n];
            let mut back = vec![0u32; n];
            interleave(&input, cols, inter1_perm(tti), &mut mid);
            deinterleave(&mid, cols, inter1_perm(tti), &mut back);
            assert_eq!(input, back, "TTI {:?}", tti);
        }
    }

    #[test]
    fn test_inter2_involution() {
        let n = 150;
        let input: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let mut mid = vec![0.0f32; n];
        let mut back = vec![0.0f32; n];
        interleave(&input, 30, &INTER2_PERM, &mut mid);
        deinterleave(&mid, 30, &INTER2_PERM, &mut back);
        assert_eq!(input, back);
    }

    #[test]
    fn test_inter1_20ms_layout() {
        // Two columns: even-indexed symbols first, then odd-indexed.
        let input = [10, 11, 12, 13, 14, 15];
        let mut out = [0; 6];
        interleave(&input, 2, inter1_perm(TtiCode::Tti20ms), &mut out);
        assert_eq!(out, [10, 12, 14, 11, 13, 15]);
    }
}
