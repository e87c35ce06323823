//! Rate-1/2 convolutional coders, 3GPP TS 25.212 section 4.2.3.1
//!
//! `ViterbiR2O4` is the memory-4 workhorse coder shared with the GSM
//! lineage of this code base; `ViterbiR2O9` is the memory-9 UMTS coder.
//! Both are soft-input Viterbi decoders over precomputed generator
//! tables. The memory-9 decoder culls survivors with the T-algorithm to
//! keep the 512-state trellis affordable.

use common::{BitVector, SoftVector};

/// Parity of `val & poly`.
fn apply_poly(val: u64, poly: u64) -> u8 {
    ((val & poly).count_ones() & 1) as u8
}

/// Soft-input cost tables: a cheap approximation to the ideal metric.
/// `match_cost[i]` is charged when the candidate agrees with input bit i,
/// `mismatch_cost[i]` when it disagrees.
fn build_cost_tables(input: &SoftVector, padded_len: usize) -> (Vec<f32>, Vec<f32>) {
    let mut match_cost = vec![0.5f32; padded_len];
    let mut mismatch_cost = vec![0.5f32; padded_len];
    for (i, &v) in input.as_slice().iter().enumerate() {
        let mut p = if v > 0.5 { 1.0 - v } else { v };
        let mut ip = 1.0 - p;
        if p < 0.01 {
            p = 0.01;
        }
        if ip < 0.01 {
            ip = 0.01;
        }
        match_cost[i] = 0.25 / ip;
        mismatch_cost[i] = 0.25 / p;
    }
    (match_cost, mismatch_cost)
}

/// Hard-decision history where element i carries all input bits up to i,
/// extended past the end by repeating the final bit.
fn build_history(input: &SoftVector, padded_len: usize) -> Vec<u64> {
    let bits = input.sliced();
    let mut history = vec![0u64; padded_len];
    let mut accum = 0u64;
    for i in 0..bits.len() {
        accum = (accum << 1) | u64::from(bits.bit(i));
        history[i] = accum;
    }
    for h in history.iter_mut().take(padded_len).skip(bits.len()) {
        accum = (accum << 1) | (accum & 0x01);
        *h = accum;
    }
    history
}

#[derive(Clone, Copy, Default)]
struct Cand {
    i_state: u64,
    o_state: u64,
    cost: f32,
}

/// Rate-1/2, memory length 4, generators 0x19 and 0x1b.
pub struct ViterbiR2O4 {
    state_table: [[u8; 2 * Self::I_STATES]; 2],
    generator_table: [u8; 2 * Self::I_STATES],
    survivors: [Cand; Self::I_STATES],
    candidates: [Cand; 2 * Self::I_STATES],
}

impl ViterbiR2O4 {
    const I_RATE: usize = 2;
    const ORDER: usize = 4;
    const I_STATES: usize = 1 << Self::ORDER;
    const C_MASK: u64 = (2 * Self::I_STATES as u64) - 1;
    /// Decision deferral depth.
    pub const DEFERRAL: usize = 6 * Self::ORDER;

    const COEFFS: [u64; 2] = [0x019, 0x01b];

    pub fn new() -> Self {
        let mut v = ViterbiR2O4 {
            state_table: [[0; 2 * Self::I_STATES]; 2],
            generator_table: [0; 2 * Self::I_STATES],
            survivors: [Cand::default(); Self::I_STATES],
            candidates: [Cand::default(); 2 * Self::I_STATES],
        };
        for g in 0..2 {
            for state in 0..Self::I_STATES as u64 {
                let input0 = state << 1;
                v.state_table[g][input0 as usize] = apply_poly(input0, Self::COEFFS[g]);
                v.state_table[g][(input0 | 1) as usize] = apply_poly(input0 | 1, Self::COEFFS[g]);
            }
        }
        for index in 0..2 * Self::I_STATES {
            v.generator_table[index] = (v.state_table[0][index] << 1) | v.state_table[1][index];
        }
        v
    }

    fn initialize_states(&mut self) {
        self.survivors = [Cand::default(); Self::I_STATES];
        self.candidates = [Cand::default(); 2 * Self::I_STATES];
    }

    /// One full Viterbi cycle: branch, metrics, prune, select.
    fn step(&mut self, in_sample: u64, match_cost: &[f32], mismatch_cost: &[f32]) -> Cand {
        // Branch survivors into candidates.
        for (i, sp) in self.survivors.iter().enumerate() {
            let i_state0 = sp.i_state << 1;
            let o_shifted = sp.o_state << Self::I_RATE;
            for b in 0..2u64 {
                let i_state = i_state0 | b;
                self.candidates[2 * i + b as usize] = Cand {
                    cost: sp.cost,
                    o_state: o_shifted
                        | u64::from(self.generator_table[(i_state & Self::C_MASK) as usize]),
                    i_state,
                };
            }
        }
        // Cost metrics: two input bits at a time for a rate-1/2 coder.
        let ctab = [match_cost, mismatch_cost];
        for cand in self.candidates.iter_mut() {
            let mismatched = in_sample ^ cand.o_state;
            cand.cost += ctab[(mismatched & 0x01) as usize][1]
                + ctab[((mismatched >> 1) & 0x01) as usize][0];
        }
        // Prune to one survivor per state suffix. Candidates i and
        // i + I_STATES land on the same suffix, with a 0 and 1 history
        // prefix respectively.
        for i in 0..Self::I_STATES {
            let c0 = &self.candidates[i];
            let c1 = &self.candidates[i + Self::I_STATES];
            self.survivors[i] = if c0.cost < c1.cost { *c0 } else { *c1 };
        }
        // Minimum-cost survivor.
        let mut min = self.survivors[0];
        for s in &self.survivors[1..] {
            if s.cost < min.cost {
                min = *s;
            }
        }
        min
    }

    /// Encode `input` into `target`; `target` must be twice as long.
    pub fn encode(&self, input: &BitVector, target: &mut BitVector) {
        assert_eq!(input.len() * Self::I_RATE, target.len());
        let mut accum = 0u64;
        for i in 0..input.len() {
            accum = (accum << 1) | u64::from(input.bit(i));
            let index = (Self::C_MASK & accum) as usize;
            target.set(2 * i, self.state_table[0][index]);
            target.set(2 * i + 1, self.state_table[1][index]);
        }
    }

    /// Soft-input decode of `input` into `target` hard bits.
    pub fn decode(&mut self, input: &SoftVector, target: &mut BitVector) {
        let sz = input.len();
        let deferral = Self::DEFERRAL;
        let ctsz = sz + deferral * Self::I_RATE;
        assert!(sz <= Self::I_RATE * target.len());

        let history = build_history(input, ctsz);
        let (match_cost, mismatch_cost) = build_cost_tables(input, ctsz);

        self.initialize_states();
        let step = Self::I_RATE;
        let mut ip = step - 1;
        let mut tab = 0;
        let mut o_count = 0;
        let mut out = 0;
        while out < target.len() {
            let min = self.step(
                history[ip],
                &match_cost[tab..tab + step],
                &mismatch_cost[tab..tab + step],
            );
            ip += step;
            tab += step;
            if o_count >= deferral {
                target.set(out, ((min.i_state >> deferral) & 0x01) as u8);
                out += 1;
            }
            o_count += 1;
        }
    }
}

impl Default for ViterbiR2O4 {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate-1/2, memory length 9, generators 0x11d and 0x1af.
///
/// The octal polynomials of TS 25.212 4.2.3.1 are bit-reversed here to fit
/// the shift direction of the state tables. Survivors are culled with the
/// T-algorithm: after pruning, candidates costing more than the minimum
/// plus `delta_t` are dropped.
pub struct ViterbiR2O9 {
    state_table: Vec<[u8; 2]>,
    generator_table: Vec<u8>,
    survivors: Vec<Cand>,
    winners: Vec<Option<Cand>>,
    delta_t: f32,
}

impl ViterbiR2O9 {
    const I_RATE: usize = 2;
    const ORDER: usize = 9;
    const I_STATES: usize = 1 << Self::ORDER;
    const S_MASK: u64 = Self::I_STATES as u64 - 1;
    const C_MASK: u64 = (Self::S_MASK << 1) | 0x01;
    /// Decision deferral depth.
    pub const DEFERRAL: usize = 39;

    const COEFFS: [u64; 2] = [0x11d, 0x1af];

    pub fn new(delta_t: f32) -> Self {
        let mut state_table = vec![[0u8; 2]; 2 * Self::I_STATES];
        for state in 0..Self::I_STATES as u64 {
            for b in 0..2u64 {
                let input = (state << 1) | b;
                for g in 0..2 {
                    state_table[input as usize][g] = apply_poly(input, Self::COEFFS[g]);
                }
            }
        }
        let generator_table = state_table
            .iter()
            .map(|s| (s[0] << 1) | s[1])
            .collect();
        ViterbiR2O9 {
            state_table,
            generator_table,
            survivors: Vec::with_capacity(Self::I_STATES),
            winners: vec![None; Self::I_STATES],
            delta_t,
        }
    }

    pub fn set_delta_t(&mut self, delta_t: f32) {
        self.delta_t = delta_t;
    }

    fn initialize_states(&mut self) {
        self.survivors.clear();
        self.survivors.push(Cand::default());
    }

    fn step(&mut self, in_sample: u64, match_cost: &[f32], mismatch_cost: &[f32]) -> Cand {
        let ctab = [match_cost, mismatch_cost];
        // Branch and score. The winners table keeps the best candidate per
        // state suffix, which is the prune step.
        for w in self.winners.iter_mut() {
            *w = None;
        }
        for sp in self.survivors.drain(..) {
            let i_state0 = sp.i_state << 1;
            let o_shifted = sp.o_state << Self::I_RATE;
            for b in 0..2u64 {
                let i_state = i_state0 | b;
                let o_state = o_shifted
                    | u64::from(self.generator_table[(i_state & Self::C_MASK) as usize]);
                let mismatched = in_sample ^ o_state;
                let cost = sp.cost
                    + ctab[(mismatched & 0x01) as usize][1]
                    + ctab[((mismatched >> 1) & 0x01) as usize][0];
                let suffix = (i_state & Self::S_MASK) as usize;
                match self.winners[suffix] {
                    Some(w) if w.cost <= cost => {}
                    _ => {
                        self.winners[suffix] = Some(Cand {
                            i_state,
                            o_state,
                            cost,
                        })
                    }
                }
            }
        }
        // Minimum-cost winner, then the T-algorithm threshold.
        let mut min: Option<Cand> = None;
        for w in self.winners.iter().flatten() {
            match min {
                Some(m) if m.cost <= w.cost => {}
                _ => min = Some(*w),
            }
        }
        let min = min.expect("viterbi survivor pool empty");
        let threshold = min.cost + self.delta_t;
        for w in self.winners.iter().flatten() {
            if w.cost < threshold {
                self.survivors.push(*w);
            }
        }
        min
    }

    /// Encode `input` into `target`; `target` must be twice as long.
    pub fn encode(&self, input: &BitVector, target: &mut BitVector) {
        assert_eq!(input.len() * Self::I_RATE, target.len());
        let mut accum = 0u64;
        for i in 0..input.len() {
            accum = (accum << 1) | u64::from(input.bit(i));
            let index = (Self::C_MASK & accum) as usize;
            target.set(2 * i, self.state_table[index][0]);
            target.set(2 * i + 1, self.state_table[index][1]);
        }
    }

    /// Soft-input decode of `input` into `target` hard bits.
    pub fn decode(&mut self, input: &SoftVector, target: &mut BitVector) {
        let sz = input.len();
        let deferral = Self::DEFERRAL;
        let ctsz = sz + deferral * Self::I_RATE;
        assert!(sz <= Self::I_RATE * target.len());

        let history = build_history(input, ctsz);
        let (match_cost, mismatch_cost) = build_cost_tables(input, ctsz);

        self.initialize_states();
        let step = Self::I_RATE;
        let mut ip = step - 1;
        let mut tab = 0;
        let mut o_count = 0;
        let mut out = 0;
        while out < target.len() {
            let min = self.step(
                history[ip],
                &match_cost[tab..tab + step],
                &mismatch_cost[tab..tab + step],
            );
            ip += step;
            tab += step;
            if o_count >= deferral {
                target.set(out, ((min.i_state >> deferral) & 0x01) as u8);
                out += 1;
            }
            o_count += 1;
        }
    }
}

impl Default for ViterbiR2O9 {
    fn default() -> Self {
        Self::new(9.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_bits(len: usize, seed: u64) -> BitVector {
        let mut v = BitVector::new(len);
        let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        for i in 0..len {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            v.set(i, ((x >> 33) & 1) as u8);
        }
        v
    }

    /// Encode with tail bits, decode, compare the payload.
    fn roundtrip_o9(payload_len: usize, seed: u64) {
        let coder = ViterbiR2O9::default();
        let mut decoder = ViterbiR2O9::default();

        let mut input = BitVector::new(payload_len + 8);
        random_bits(payload_len, seed).copy_to_segment(&mut input, 0);

        let mut coded = BitVector::new(2 * input.len());
        coder.encode(&input, &mut coded);

        let soft = SoftVector::from_bits(&coded);
        let mut decoded = BitVector::new(input.len());
        decoder.decode(&soft, &mut decoded);
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_o9_roundtrip() {
        roundtrip_o9(120, 1);
        roundtrip_o9(262, 2);
    }

    #[test]
    fn test_o9_roundtrip_with_noise() {
        let coder = ViterbiR2O9::default();
        let mut decoder = ViterbiR2O9::new(12.0);

        let mut input = BitVector::new(108);
        random_bits(100, 7).copy_to_segment(&mut input, 0);
        let mut coded = BitVector::new(2 * input.len());
        coder.encode(&input, &mut coded);

        let mut soft = SoftVector::from_bits(&coded);
        // Soften a few symbols toward unknown; the decoder must still recover.
        for i in [5usize, 40, 90, 150] {
            let v = soft.val(i);
            soft.set(i, if v > 0.5 { 0.6 } else { 0.4 });
        }
        let mut decoded = BitVector::new(input.len());
        decoder.decode(&soft, &mut decoded);
        assert_eq!(decoded, input);
    }

    #[test]
    fn test_o4_roundtrip() {
        let coder = ViterbiR2O4::new();
        let mut decoder = ViterbiR2O4::new();

        let mut input = BitVector::new(78);
        random_bits(74, 3).copy_to_segment(&mut input, 0);
        let mut coded = BitVector::new(2 * input.len());
        coder.encode(&input, &mut coded);

        let soft = SoftVector::from_bits(&coded);
        let mut decoded = BitVector::new(input.len());
        decoder.decode(&soft, &mut decoded);
        assert_eq!(decoded, input);
    }
}
