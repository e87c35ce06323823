//! Turbo coding, 3GPP TS 25.212 sections 4.2.3.2 and 4.2.3.2.3
//!
//! The rate-1/3 parallel concatenated convolutional code: two memory-3
//! recursive systematic constituent encoders, the second fed through the
//! internal interleaver, each terminated with three trellis steps. The
//! decoder runs one soft-output Viterbi pass per constituent code with a
//! confidence estimate derived from the accumulated path metric.

use common::{BitVector, SoftVector};

/// One step of a constituent RSC encoder. `d` is the shift register,
/// returns the parity output bit.
fn constituent_encoder(d: &mut u32, in_bit: u8) -> u8 {
    let d0 = *d;
    let d1 = *d >> 1;
    let d2 = *d >> 2;
    let next_in = (u32::from(in_bit) ^ d1 ^ d2) & 1;
    let zk = (d2 ^ d0 ^ next_in) & 1;
    *d = (*d << 1) | next_in;
    zk as u8
}

/// One trellis-termination step: the feedback drives the input so the
/// register flushes to zero. Returns (xk, zk).
fn trellis_termination(d: &mut u32) -> (u8, u8) {
    let d0 = *d;
    let d1 = *d >> 1;
    let d2 = *d >> 2;
    let xk = ((d2 ^ d1) & 1) as u8;
    let zk = ((d2 ^ d0) & 1) as u8;
    *d <<= 1;
    (xk, zk)
}

/// The turbo code internal interleaver, TS 25.212 4.2.3.2.3.
///
/// The permutation is involved enough that it is built once per code block
/// size when the channel is configured, then the interleaving just indexes
/// the stored vector.
pub struct TurboInterleaver {
    permutation: Vec<usize>,
}

/// Table 2 prime numbers p with associated primitive root v.
#[rustfmt::skip]
const PV: [(usize, usize); 52] = [
    (7, 3), (11, 2), (13, 2), (17, 3), (19, 2), (23, 5), (29, 2), (31, 3),
    (37, 2), (41, 6), (43, 3), (47, 5), (53, 2), (59, 2), (61, 2), (67, 2),
    (71, 7), (73, 5), (79, 3), (83, 2), (89, 3), (97, 5), (101, 2), (103, 5),
    (107, 2), (109, 6), (113, 3), (127, 3), (131, 2), (137, 3), (139, 2),
    (149, 2), (151, 6), (157, 5), (163, 2), (167, 5), (173, 2), (179, 2),
    (181, 2), (191, 19), (193, 5), (197, 2), (199, 3), (211, 2), (223, 3),
    (227, 2), (229, 6), (233, 3), (239, 7), (241, 7), (251, 6), (257, 3),
];

const IRPP5: [usize; 5] = [4, 3, 2, 1, 0];
const IRPP10: [usize; 10] = [9, 8, 7, 6, 5, 4, 3, 2, 1, 0];
const IRPP20: [usize; 20] = [
    19, 9, 14, 4, 0, 2, 5, 7, 12, 18, 16, 13, 17, 15, 3, 1, 6, 11, 8, 10,
];
const IRPP20A: [usize; 20] = [
    19, 9, 14, 4, 0, 2, 5, 7, 12, 18, 10, 8, 13, 17, 3, 1, 16, 6, 15, 11,
];

fn gcd(x: usize, y: usize) -> usize {
    if x > y {
        if x % y == 0 { y } else { gcd(y, x % y) }
    } else if y % x == 0 {
        x
    } else {
        gcd(x, y % x)
    }
}

impl TurboInterleaver {
    pub fn new(k: usize) -> Self {
        if k == 0 {
            return TurboInterleaver {
                permutation: Vec::new(),
            };
        }
        assert!((40..=5114).contains(&k), "turbo block size {}", k);

        // 4.2.3.2.3.1 step 1: number of rows.
        let r: usize = if k <= 159 {
            5
        } else if k <= 200 {
            10
        } else if k <= 480 {
            20
        } else if k <= 530 {
            10
        } else {
            20
        };

        // Step 2: prime p, primitive root v, number of columns.
        let (p, v, c) = if (481..=530).contains(&k) {
            (53, 2, 53)
        } else {
            let mut sel = (0usize, 0usize);
            for &(p, v) in PV.iter() {
                sel = (p, v);
                if k <= r * (p + 1) {
                    break;
                }
            }
            let (p, v) = sel;
            let c = if k <= r * (p - 1) {
                p - 1
            } else if k <= r * p {
                p
            } else {
                p + 1
            };
            (p, v, c)
        };

        // Step 3: fill the matrix row-major with input indices.
        let mut matrix: Vec<i32> = (0..(r * c) as i32).collect();
        for m in matrix.iter_mut().skip(k) {
            *m = -1;
        }

        // 4.2.3.2.3.2 step 2: base sequence from the primitive root.
        let mut s = vec![0usize; p - 1];
        s[0] = 1;
        for j in 1..=(p - 2) {
            s[j] = (v * s[j - 1]) % p;
        }

        // Step 3: minimal primes q, coprime to p-1, strictly increasing.
        let mut q = vec![0usize; r];
        q[0] = 1;
        let mut pv_iter = PV.iter();
        for i in 1..r {
            loop {
                let &(cand, _) = pv_iter.next().expect("prime table exhausted");
                if cand > 6 && cand > q[i - 1] && gcd(cand, p - 1) == 1 {
                    q[i] = cand;
                    break;
                }
            }
        }

        // Step 4: permute the q into r using the inter-row pattern T.
        let t: &[usize] = if k <= 159 {
            &IRPP5
        } else if k <= 200 {
            &IRPP10
        } else if k <= 480 {
            &IRPP20A
        } else if k <= 530 {
            &IRPP10
        } else if k <= 2280 {
            &IRPP20A
        } else if k <= 2480 {
            &IRPP20
        } else if k <= 3160 {
            &IRPP20A
        } else if k <= 3210 {
            &IRPP20
        } else {
            &IRPP20A
        };
        let mut rr = vec![0usize; r];
        for i in 0..r {
            rr[t[i]] = q[i];
        }

        // Step 5: per-row intra-permutation.
        for i in 0..r {
            let mut u = vec![0usize; c];
            for j in 0..=(p - 2) {
                u[j] = s[(j * rr[i]) % (p - 1)];
            }
            if c == p {
                u[p - 1] = 0;
            } else if c == p + 1 {
                u[p - 1] = 0;
                u[p] = p;
                if k == r * c && i == r - 1 {
                    u.swap(p, 0);
                }
            } else {
                // c == p - 1
                for uj in u.iter_mut().take(p - 1) {
                    *uj -= 1;
                }
            }
            let row: Vec<i32> = (0..c).map(|j| matrix[i * c + u[j]]).collect();
            matrix[i * c..(i + 1) * c].copy_from_slice(&row);
        }

        // Step 6: inter-row permutation combined with the column read-out,
        // skipping the padding cells.
        let mut permutation = Vec::with_capacity(k);
        for col in 0..c {
            for row in 0..r {
                let v = matrix[col + c * t[row]];
                if v >= 0 {
                    permutation.push(v as usize);
                }
            }
        }
        assert_eq!(permutation.len(), k);
        TurboInterleaver { permutation }
    }

    pub fn len(&self) -> usize {
        self.permutation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permutation.is_empty()
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// out[i] = in[perm[i]]
    pub fn interleave(&self, input: &SoftVector, output: &mut SoftVector) {
        debug_assert_eq!(input.len(), self.permutation.len());
        for (i, &p) in self.permutation.iter().enumerate() {
            output.set(i, input.val(p));
        }
    }

    /// out[perm[i]] = in[i]
    pub fn uninterleave(&self, input: &SoftVector, output: &mut SoftVector) {
        debug_assert_eq!(input.len(), self.permutation.len());
        for (i, &p) in self.permutation.iter().enumerate() {
            output.set(p, input.val(i));
        }
    }

    /// out[perm[i]] = hard(in[i])
    pub fn uninterleave_to_bits(&self, input: &SoftVector, output: &mut BitVector) {
        debug_assert_eq!(input.len(), self.permutation.len());
        for (i, &p) in self.permutation.iter().enumerate() {
            output.set(p, input.bit(i));
        }
    }
}

/// Encode `input` (K bits) into `target` (3K + 12 bits): systematic xk,
/// first parity zk, interleaved parity z'k, then 2x3 termination steps.
pub fn turbo_encode(input: &BitVector, target: &mut BitVector, interleaver: &TurboInterleaver) {
    assert_eq!(target.len(), input.len() * 3 + 12);
    let perm = interleaver.permutation();
    let mut ce1 = 0u32;
    let mut ce2 = 0u32;
    let mut out = 0;
    for i in 0..input.len() {
        let in1 = input.bit(i);
        let in2 = input.bit(perm[i]);
        target.set(out, in1);
        target.set(out + 1, constituent_encoder(&mut ce1, in1));
        target.set(out + 2, constituent_encoder(&mut ce2, in2));
        out += 3;
    }
    for ce in [&mut ce1, &mut ce2] {
        for _ in 0..3 {
            let (xk, zk) = trellis_termination(ce);
            target.set(out, xk);
            target.set(out + 1, zk);
            out += 2;
        }
    }
}

#[derive(Clone, Copy, Default)]
struct TCand {
    i_state: u32,
    o_state: u32,
    r_state: u32,
    cost: f32,
}

/// One soft-output pass of the turbo decoder: a rate-1/2 memory-3 Viterbi
/// over a recursive constituent code.
pub struct ViterbiTurbo {
    generator_table: [u8; 2 * Self::I_STATES],
    survivors: [TCand; Self::I_STATES],
    candidates: [TCand; 2 * Self::I_STATES],
}

impl ViterbiTurbo {
    const ORDER: usize = 3;
    const I_STATES: usize = 1 << Self::ORDER;
    const C_MASK: u32 = (2 * Self::I_STATES as u32) - 1;
    pub const DEFERRAL: usize = 6 * Self::ORDER;

    pub fn new() -> Self {
        // generator 0x0b is the parity polynomial over the true register
        // state; the systematic bit is carried separately.
        let mut generator_table = [0u8; 2 * Self::I_STATES];
        for (input, g) in generator_table.iter_mut().enumerate() {
            let sys = (input & 1) as u8;
            let parity = ((input as u32 & 0x0b).count_ones() & 1) as u8;
            *g = (sys << 1) | parity;
        }
        ViterbiTurbo {
            generator_table,
            survivors: [TCand::default(); Self::I_STATES],
            candidates: [TCand::default(); 2 * Self::I_STATES],
        }
    }

    fn initialize_states(&mut self) {
        self.survivors = [TCand::default(); Self::I_STATES];
        self.candidates = [TCand::default(); 2 * Self::I_STATES];
    }

    /// One cycle; `pair` is (xk, zk) soft input.
    fn step(&mut self, pair: (f32, f32)) -> TCand {
        for (i, sp) in self.survivors.iter().enumerate() {
            let i_state0 = sp.i_state << 1;
            let o_shifted = sp.o_state << 2;
            // Feedback from the true register state decides the recursion.
            let d1 = sp.r_state >> 1;
            let d2 = sp.r_state >> 2;
            let fb = (d1 ^ d2) & 1;
            let r_state0 = (sp.r_state << 1) ^ fb;
            for b in 0..2u32 {
                let r_state = r_state0 ^ b;
                self.candidates[2 * i + b as usize] = TCand {
                    cost: sp.cost,
                    o_state: o_shifted
                        | u32::from(self.generator_table[b as usize] & 2)
                        | u32::from(self.generator_table[(r_state & Self::C_MASK) as usize] & 1),
                    i_state: i_state0 | b,
                    r_state,
                };
            }
        }
        let (xk, zk) = pair;
        for cand in self.candidates.iter_mut() {
            cand.cost += if cand.o_state & 1 != 0 { 1.0 - zk } else { zk }
                + if cand.o_state & 2 != 0 { 1.0 - xk } else { xk };
        }
        for i in 0..Self::I_STATES {
            let c0 = &self.candidates[i];
            let c1 = &self.candidates[i + Self::I_STATES];
            self.survivors[i] = if c0.cost < c1.cost { *c0 } else { *c1 };
        }
        let mut min = self.survivors[0];
        for s in &self.survivors[1..] {
            if s.cost < min.cost {
                min = *s;
            }
        }
        min
    }

    /// Decode an (xk, zk) pair stream of length 2K into K soft outputs.
    ///
    /// The deferral queue is flushed from the last best candidate rather
    /// than padded with unknowns, and every output carries the confidence
    /// of the path that produced it.
    pub fn decode_pass(&mut self, input: &SoftVector, target: &mut SoftVector) {
        let k = target.len();
        assert_eq!(input.len(), 2 * k);
        let deferral = Self::DEFERRAL.min(k.saturating_sub(1));
        self.initialize_states();

        let pair = |i: usize| (input.val(2 * i), input.val(2 * i + 1));
        let mut ip = 0usize;
        for _ in 0..deferral {
            self.step(pair(ip));
            ip += 1;
        }
        let mut last = TCand::default();
        let mut confidence = 0.0f32;
        let mut avg_count = ((deferral + 1) * 2) as f32;
        let mut out = 0usize;
        for _ in 0..(k - deferral) {
            last = self.step(pair(ip));
            ip += 1;
            confidence = 1.0 - last.cost / avg_count;
            avg_count += 2.0;
            target.set(
                out,
                if (last.i_state >> deferral) & 1 != 0 {
                    (confidence + 1.0) / 2.0
                } else {
                    (1.0 - confidence) / 2.0
                },
            );
            out += 1;
        }
        // Flush the deferral queue from the final winner.
        for i in (0..deferral).rev() {
            target.set(
                out,
                if (last.i_state >> i) & 1 != 0 {
                    (confidence + 1.0) / 2.0
                } else {
                    (1.0 - confidence) / 2.0
                },
            );
            out += 1;
        }
    }
}

impl Default for ViterbiTurbo {
    fn default() -> Self {
        Self::new()
    }
}

/// Full turbo decode: input is 3K + 12 soft symbols, output K hard bits.
pub fn turbo_decode(
    decoder: &mut ViterbiTurbo,
    input: &SoftVector,
    target: &mut BitVector,
    interleaver: &TurboInterleaver,
) {
    assert_eq!(input.len(), target.len() * 3 + 12);
    let k = target.len();

    // First pass over (xk, zk).
    let mut xkzk = SoftVector::new(2 * k);
    for i in 0..k {
        xkzk.set(2 * i, input.val(3 * i));
        xkzk.set(2 * i + 1, input.val(3 * i + 1));
    }
    let mut t = SoftVector::new(k);
    decoder.decode_pass(&xkzk, &mut t);

    // Second pass over (interleaved first-pass output, z'k).
    let mut ti = SoftVector::new(k);
    interleaver.interleave(&t, &mut ti);
    let mut tizpk = SoftVector::new(2 * k);
    for i in 0..k {
        tizpk.set(2 * i, ti.val(i));
        tizpk.set(2 * i + 1, input.val(3 * i + 2));
    }
    let mut tt = SoftVector::new(k);
    decoder.decode_pass(&tizpk, &mut tt);

    interleaver.uninterleave_to_bits(&tt, target);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaver_is_bijection() {
        for k in [40usize, 159, 160, 200, 320, 481, 530, 600, 2281, 5114] {
            let il = TurboInterleaver::new(k);
            let mut seen = vec![false; k];
            for &p in il.permutation() {
                assert!(p < k && !seen[p], "K={}", k);
                seen[p] = true;
            }
        }
    }

    #[test]
    fn test_interleave_uninterleave() {
        let il = TurboInterleaver::new(40);
        let input = SoftVector::from_vals((0..40).map(|i| i as f32 / 40.0).collect());
        let mut mid = SoftVector::new(40);
        let mut back = SoftVector::new(40);
        il.interleave(&input, &mut mid);
        il.uninterleave(&mid, &mut back);
        assert_eq!(input, back);
    }

    fn roundtrip(k: usize, seed: u64) {
        let il = TurboInterleaver::new(k);
        let mut input = BitVector::new(k);
        let mut x = seed;
        for i in 0..k {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            input.set(i, ((x >> 40) & 1) as u8);
        }
        let mut coded = BitVector::new(3 * k + 12);
        turbo_encode(&input, &mut coded, &il);

        let soft = SoftVector::from_bits(&coded);
        let mut decoded = BitVector::new(k);
        let mut dec = ViterbiTurbo::new();
        turbo_decode(&mut dec, &soft, &mut decoded, &il);
        assert_eq!(decoded, input, "K={}", k);
    }

    #[test]
    fn test_turbo_roundtrip() {
        roundtrip(40, 11);
        roundtrip(356, 5);
    }

    #[test]
    fn test_encoder_termination_flushes() {
        // After three termination steps the register must be zero.
        let mut d = 0u32;
        for b in [1u8, 0, 1, 1, 0, 1, 0, 0] {
            constituent_encoder(&mut d, b);
        }
        for _ in 0..3 {
            trellis_termination(&mut d);
        }
        assert_eq!(d & 0x7, 0);
    }
}
