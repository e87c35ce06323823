//! Rate matching, 3GPP TS 25.212 section 4.2.7
//!
//! The kernel walks the input with an error accumulator and punctures or
//! repeats symbols until the output is exactly filled. The same kernel is
//! run in both directions: transmit-side it expands or shrinks the coded
//! block, receive-side it is run with the sizes swapped to undo the
//! repetition (or to approximate punctured symbols by their neighbours).

use crate::LayerError;
use common::TtiCode;
use tracing::error;

/// e-plus and e-minus from the pre and post rate-matching sizes.
pub fn compute_eplus_eminus(nin: usize, nout: usize) -> (i64, i64) {
    let eplus = 2 * nin as i64;
    let eminus = 2 * (nout as i64 - nin as i64).abs();
    (eplus, eminus)
}

/// Puncture or repeat `input` into `output`.
///
/// Terminates having consumed every input symbol and produced every output
/// symbol; anything else is a configuration error.
pub fn rate_match<T: Copy>(
    input: &[T],
    output: &mut [T],
    eini: i64,
    eplus: i64,
    eminus: i64,
) -> Result<(), LayerError> {
    let nin = input.len();
    let nout = output.len();
    if nin == nout {
        output.copy_from_slice(input);
        return Ok(());
    }
    let mut e = eini;
    let mut outp = 0;
    let mut m = 0;
    if nout < nin {
        // Puncture.
        while m < nin && outp < nout {
            e -= eminus;
            if e <= 0 {
                e += eplus;
                m += 1;
                continue; // skip the symbol
            }
            output[outp] = input[m];
            outp += 1;
            m += 1;
        }
    } else {
        // Repeat.
        'outer: while m < nin && outp < nout {
            e -= eminus;
            while e <= 0 {
                if outp >= nout {
                    break 'outer;
                }
                output[outp] = input[m];
                outp += 1;
                e += eplus;
            }
            if outp >= nout {
                break;
            }
            output[outp] = input[m];
            outp += 1;
            m += 1;
        }
    }
    if m != nin || outp != nout {
        error!(nin, nout, m, outp, eini, eplus, eminus, "rate matching mis-calculation");
        return Err(LayerError::ProcessingError(format!(
            "rate match consumed {}/{} in, {}/{} out",
            m, nin, outp, nout
        )));
    }
    Ok(())
}

/// Rate match with e-plus and e-minus derived from this call's own sizes
/// (e-plus = 2 x input size).
///
/// This is the form both uplink directions use: the UE transmits with
/// parameters from its pre-rate-matching size, and because
/// 2 x expanded = 2 x original + e-minus, running the kernel again over
/// the expanded stream with its own sizes punctures exactly the repeated
/// symbols. The downlink transmit side instead fixes the parameters by
/// the largest transport format and uses [`rate_match`] directly.
pub fn rate_match_auto<T: Copy>(
    input: &[T],
    output: &mut [T],
    eini: i64,
) -> Result<(), LayerError> {
    let eplus = 2 * input.len() as i64;
    let eminus = 2 * (output.len() as i64 - input.len() as i64).abs();
    rate_match(input, output, eini, eplus, eminus)
}

fn gcd(x: i64, y: i64) -> i64 {
    if y == 0 {
        x.abs()
    } else {
        gcd(y, x % y)
    }
}

/// Per-radio-frame e-ini for an uplink TrCh, TS 25.212 4.2.7.1.2.1.
///
/// `insize` and `outsize` are the per-radio-frame sizes before and after
/// rate matching. Downlink always uses e-ini = 1.
pub fn compute_ul_eini(insize: usize, outsize: usize, tti: TtiCode) -> [i64; 8] {
    let num_frames = tti.num_frames();
    let mut einis = [0i64; 8];
    if insize == 0 && outsize == 0 {
        return einis;
    }
    let nij = insize as i64;
    let delta_nij = outsize as i64 - insize as i64;

    let mut r = delta_nij % nij;
    while r < 0 {
        r += nij;
    }

    let q: i64 = if r != 0 && 2 * r <= nij {
        (nij as f64 / r as f64).ceil() as i64
    } else {
        (nij as f64 / (r - nij) as f64).ceil() as i64
    };

    // q' differs from q only when q is even, shifted by gcd(|q|, F)/F.
    let qprime: f64 = if q % 2 == 0 {
        let g = gcd(q.abs(), num_frames as i64);
        q as f64 + g as f64 / num_frames as f64
    } else {
        q as f64
    };

    // S[x]: per-column puncturing shift.
    let mut s = [0i64; 8];
    for x in 0..num_frames {
        let tmp = ((x as f64) * qprime).floor().abs() as i64;
        s[(tmp % num_frames as i64) as usize] = tmp / num_frames as i64;
    }

    let perm = super::interleave::inter1_perm(tti);
    let a = 2i64;
    for (ni, eini) in einis.iter_mut().enumerate().take(num_frames) {
        let p1f = perm[ni] as i64;
        *eini = (a * s[p1f as usize] * delta_nij.abs() + 1) % (a * nij);
    }
    einis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_sizes_copy() {
        let input = [1u8, 0, 1, 1];
        let mut output = [9u8; 4];
        rate_match(&input, &mut output, 1, 8, 0).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_repeat_then_puncture_roundtrip() {
        // Expanding then shrinking, each with parameters from its own
        // sizes, restores the original sequence exactly.
        let insize = 150;
        let outsize = 170;
        let input: Vec<u8> = (0..insize).map(|i| ((i * 7) % 2) as u8).collect();
        let einis = compute_ul_eini(insize, outsize, TtiCode::Tti20ms);
        for frame in 0..2 {
            let eini = einis[frame];
            let mut expanded = vec![0u8; outsize];
            rate_match_auto(&input, &mut expanded, eini).unwrap();
            let mut back = vec![0u8; insize];
            rate_match_auto(&expanded, &mut back, eini).unwrap();
            assert_eq!(back, input, "frame {}", frame);
        }
    }

    #[test]
    fn test_fixed_parameter_inverse() {
        // Downlink-style expansion with parameters fixed by a larger
        // format: the inverse adds e-minus onto the transmit e-plus.
        let n_max = 800i64;
        let delta = 60i64;
        let insize = 500usize;
        let input: Vec<u8> = (0..insize).map(|i| ((i * 13) % 2) as u8).collect();
        let (eplus, eminus) = (2 * n_max, 2 * delta);
        let extra = ((delta as f64 * insize as f64) / n_max as f64).ceil() as usize;
        let mut expanded = vec![0u8; insize + extra];
        rate_match(&input, &mut expanded, 1, eplus, eminus).unwrap();
        let mut back = vec![0u8; insize];
        rate_match(&expanded, &mut back, 1, eplus + eminus, eminus).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_eini_identity_for_10ms() {
        // One radio frame per TTI: S[0] = 0, so e-ini = 1.
        let einis = compute_ul_eini(100, 120, TtiCode::Tti10ms);
        assert_eq!(einis[0], 1);
    }

    #[test]
    fn test_eini_two_frames() {
        // Worked example: 150 -> 170 per frame over a 20 ms TTI. The first
        // frame starts at 1, the second is offset by the repetition shift.
        let einis = compute_ul_eini(150, 170, TtiCode::Tti20ms);
        assert_eq!(einis[0], 1);
        assert!(einis[1] > 0 && einis[1] < 2 * 150);
        assert_ne!(einis[0], einis[1]);
    }

    #[test]
    fn test_exact_consumption_checked() {
        let input = [0u8; 10];
        let mut output = [0u8; 14];
        // Deliberately inconsistent parameters must be detected.
        assert!(rate_match(&input, &mut output, 1, 2 * 10, 0).is_err());
    }
}
