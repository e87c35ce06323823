//! OVSF channelisation code tree
//!
//! Allocation of downlink channelisation codes over spreading factors
//! 4..256. A code is usable only when nothing in its subtree and nothing on
//! its ancestor chain is reserved or allocated; reservations shadow their
//! ancestors with an `also_reserved` mark so sibling subtrees stay usable.

use crate::LayerError;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Tree tiers for SF = 4, 8, 16, 32, 64, 128, 256.
pub const NUM_TIERS: usize = 7;

/// Tier index for a spreading factor.
pub fn sf_to_tier(sf: usize) -> Option<usize> {
    match sf {
        4 => Some(0),
        8 => Some(1),
        16 => Some(2),
        32 => Some(3),
        64 => Some(4),
        128 => Some(5),
        256 => Some(6),
        _ => None,
    }
}

/// Spreading factor of a tier.
pub fn tier_to_sf(tier: usize) -> usize {
    4 << tier
}

/// Tier giving at least the requested bandwidth in bytes per second.
///
/// The peak-throughput classes quantise to 256K, 128K .. 1K bytes/s which
/// do not quite match the real per-SF rates; the best-effort mapping hands
/// out the nearest class, the guaranteed mapping rounds up.
pub fn bandwidth_to_tier(bytes_per_sec: u32, guaranteed: bool) -> usize {
    let table: [u32; 6] = if guaranteed {
        [120_000, 60_000, 30_000, 15_000, 7_500, 3_750]
    } else {
        [128_000, 64_000, 32_000, 16_000, 8_000, 4_000]
    };
    for (tier, &limit) in table.iter().enumerate() {
        if (guaranteed && bytes_per_sec >= limit) || (!guaranteed && bytes_per_sec > limit) {
            return tier;
        }
    }
    NUM_TIERS - 1
}

struct TreeElt<T> {
    reserved: bool,
    also_reserved: bool,
    allocated: bool,
    payload: Option<Arc<T>>,
}

impl<T> Default for TreeElt<T> {
    fn default() -> Self {
        TreeElt {
            reserved: false,
            also_reserved: false,
            allocated: false,
            payload: None,
        }
    }
}

impl<T> TreeElt<T> {
    fn available(&self, check_only_reserved: bool) -> bool {
        if check_only_reserved {
            return !self.reserved;
        }
        !self.reserved && !self.also_reserved && self.payload.is_some() && !self.allocated
    }

    fn active(&self) -> bool {
        self.reserved || self.payload.is_none() || self.allocated
    }
}

struct TreeState<T> {
    tiers: Vec<Vec<TreeElt<T>>>,
}

/// A lease on one code of the tree, freed through [`ChannelTree::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLease {
    pub sf: usize,
    pub code: usize,
}

/// The channel tree; choosing and freeing codes is atomic.
pub struct ChannelTree<T> {
    state: Mutex<TreeState<T>>,
}

impl<T> Default for ChannelTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ChannelTree<T> {
    pub fn new() -> Self {
        let tiers = (0..NUM_TIERS)
            .map(|t| (0..tier_to_sf(t)).map(|_| TreeElt::default()).collect())
            .collect();
        ChannelTree {
            state: Mutex::new(TreeState { tiers }),
        }
    }

    /// Permanently reserve a code for a non-DCH use. Every ancestor is
    /// shadow-marked; the subtree stays implicitly blocked through the
    /// downward scan. Conflicting reservations are a configuration fault.
    pub fn reserve(&self, sf: usize, code: usize) -> Result<(), LayerError> {
        let tier = sf_to_tier(sf).ok_or(LayerError::InvalidConfiguration(format!(
            "invalid SF {}",
            sf
        )))?;
        let mut state = self.state.lock().unwrap();
        if !Self::is_free_upward(&state, tier, code, true)
            || !Self::is_free_downward(&state, tier, code, 1, true)
        {
            error!(sf, code, "channel reservation conflict");
            return Err(LayerError::ReservationConflict { sf, code });
        }
        state.tiers[tier][code].reserved = true;
        let mut c = code / 2;
        for t in (0..tier).rev() {
            state.tiers[t][c].also_reserved = true;
            c /= 2;
        }
        info!(sf, code, "reserved channel code");
        Ok(())
    }

    /// Is this exact code reserved? Ancestors and the subtree are not
    /// consulted; used to double-check startup reservations.
    pub fn is_reserved(&self, sf: usize, code: usize) -> bool {
        let tier = sf_to_tier(sf).expect("invalid SF");
        self.state.lock().unwrap().tiers[tier][code].reserved
    }

    /// Populate every position with a payload from the factory. Reserve
    /// the fixed CPICH (256,0) and PCCPCH (256,1) codes first.
    pub fn populate(&self, mut factory: impl FnMut(usize, usize) -> Arc<T>) {
        self.reserve(256, 0).expect("CPICH code taken");
        self.reserve(256, 1).expect("PCCPCH code taken");
        let mut state = self.state.lock().unwrap();
        for tier in 0..NUM_TIERS {
            let sf = tier_to_sf(tier);
            for code in 0..sf {
                state.tiers[tier][code].payload = Some(factory(sf, code));
            }
        }
    }

    // Anything allocated or reserved on the ancestor chain?
    fn is_free_upward(
        state: &TreeState<T>,
        tier: usize,
        code: usize,
        _check_only_reserved: bool,
    ) -> bool {
        // An `also_reserved` ancestor still has usable sibling subtrees, so
        // only hard reservations and allocations block from above.
        let mut c = code / 2;
        for t in (0..tier).rev() {
            if state.tiers[t][c].active() {
                return false;
            }
            c /= 2;
        }
        true
    }

    // Is the subtree rooted at (tier, code..code+width) entirely free?
    fn is_free_downward(
        state: &TreeState<T>,
        tier: usize,
        start_code: usize,
        width: usize,
        check_only_reserved: bool,
    ) -> bool {
        if tier >= NUM_TIERS {
            return true;
        }
        for code in start_code..start_code + width {
            if !state.tiers[tier][code].available(check_only_reserved) {
                return false;
            }
        }
        Self::is_free_downward(state, tier + 1, 2 * start_code, 2 * width, check_only_reserved)
    }

    /// Choose a free code at the given tier, marking it allocated before
    /// the lock is released.
    pub fn choose_by_tier(&self, tier: usize) -> Option<(CodeLease, Arc<T>)> {
        let mut state = self.state.lock().unwrap();
        let sf = tier_to_sf(tier);
        for code in 0..sf {
            if Self::is_free_downward(&state, tier, code, 1, false)
                && Self::is_free_upward(&state, tier, code, true)
            {
                let elt = &mut state.tiers[tier][code];
                let payload = elt.payload.clone()?;
                elt.allocated = true;
                return Some((CodeLease { sf, code }, payload));
            }
        }
        None
    }

    /// Choose a code by spreading factor.
    pub fn choose_by_sf(&self, sf: usize) -> Option<(CodeLease, Arc<T>)> {
        self.choose_by_tier(sf_to_tier(sf)?)
    }

    /// Choose a code by requested bandwidth in bytes per second.
    pub fn choose_by_bandwidth(&self, bytes_per_sec: u32) -> Option<(CodeLease, Arc<T>)> {
        self.choose_by_tier(bandwidth_to_tier(bytes_per_sec, true))
    }

    /// Return a leased code to the pool.
    pub fn free(&self, lease: CodeLease) {
        let tier = sf_to_tier(lease.sf).expect("invalid lease");
        let mut state = self.state.lock().unwrap();
        let elt = &mut state.tiers[tier][lease.code];
        debug_assert!(elt.allocated);
        elt.allocated = false;
    }

    /// Payload stored at a position, whether or not it is allocated.
    pub fn payload(&self, sf: usize, code: usize) -> Option<Arc<T>> {
        let tier = sf_to_tier(sf)?;
        self.state.lock().unwrap().tiers[tier][code].payload.clone()
    }

    /// Snapshot of the allocated leases, for status display.
    pub fn allocated(&self) -> Vec<CodeLease> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for tier in 0..NUM_TIERS {
            let sf = tier_to_sf(tier);
            for code in 0..sf {
                if state.tiers[tier][code].allocated {
                    out.push(CodeLease { sf, code });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_tree() -> ChannelTree<usize> {
        let tree = ChannelTree::new();
        tree.populate(|sf, code| Arc::new(sf * 1000 + code));
        tree
    }

    #[test]
    fn test_tier_mapping() {
        assert_eq!(sf_to_tier(4), Some(0));
        assert_eq!(sf_to_tier(256), Some(6));
        assert_eq!(sf_to_tier(512), None);
        assert_eq!(tier_to_sf(3), 32);
    }

    #[test]
    fn test_bandwidth_mapping() {
        assert_eq!(bandwidth_to_tier(240_000, true), 0);
        assert_eq!(bandwidth_to_tier(120_000, true), 0);
        assert_eq!(bandwidth_to_tier(60_000, true), 1);
        assert_eq!(bandwidth_to_tier(1_000, true), NUM_TIERS - 1);
        assert_eq!(bandwidth_to_tier(128_000, false), 1);
        assert_eq!(bandwidth_to_tier(129_000, false), 0);
    }

    #[test]
    fn test_reservation_conflict() {
        let tree = populated_tree();
        // CPICH and PCCPCH are reserved by populate(); re-reserving or
        // reserving an ancestor must fail.
        assert!(tree.reserve(256, 0).is_err());
        assert!(tree.reserve(128, 0).is_err());
        assert!(tree.reserve(256, 4).is_ok());
        assert!(tree.is_reserved(256, 4));
    }

    #[test]
    fn test_allocation_exclusion() {
        let tree = populated_tree();
        // Take all 16 leaves under the SF=16 subtree of code 1.
        let (lease, payload) = tree.choose_by_sf(16).unwrap();
        assert_eq!(*payload, 16_000 + lease.code);
        // Nothing on the ancestor chain is allocatable now.
        let mut code = lease.code;
        for sf in [8usize, 4] {
            code /= 2;
            let before = tree.allocated().len();
            // Allocate everything at this SF; the ancestor code must be skipped.
            let mut got = Vec::new();
            while let Some((l, _)) = tree.choose_by_sf(sf) {
                assert_ne!(l.code, code, "allocated shadowed ancestor at SF {}", sf);
                got.push(l);
            }
            for l in got {
                tree.free(l);
            }
            assert_eq!(tree.allocated().len(), before);
        }
        tree.free(lease);
    }

    #[test]
    fn test_reserved_blocks_subtree_until_freed() {
        let tree = populated_tree();
        // Allocate all SF=256 codes; codes 0 and 1 are reserved so 254 remain.
        let mut leases = Vec::new();
        while let Some((l, _)) = tree.choose_by_sf(256) {
            leases.push(l);
        }
        assert_eq!(leases.len(), 254);
        // Every SF=4 subtree now has allocated leaves.
        assert!(tree.choose_by_sf(4).is_none());
        for l in leases {
            tree.free(l);
        }
        // Codes 0/1 at SF=256 keep their SF=4 ancestor blocked; the other
        // three SF=4 codes are free again.
        let mut sf4 = Vec::new();
        while let Some((l, _)) = tree.choose_by_sf(4) {
            sf4.push(l);
        }
        assert_eq!(sf4.len(), 3);
    }
}
