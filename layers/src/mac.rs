//! MAC-facing interfaces
//!
//! MAC and everything above it are outside this crate; Layer-1 sees MAC as
//! a producer of transport block sets and a consumer of decoded transport
//! blocks.

use crate::trch::{TfcId, TrChId};
use common::{BitVector, Time};

/// One MAC transport block, optionally pinned to a transmit frame.
#[derive(Debug, Clone)]
pub struct TransportBlock {
    pub bits: BitVector,
    /// When set, the encoder transmits the TTI containing this frame
    /// number instead of the next free slot.
    pub scheduled: Option<Time>,
}

impl TransportBlock {
    pub fn new(bits: BitVector) -> Self {
        TransportBlock {
            bits,
            scheduled: None,
        }
    }

    pub fn scheduled_at(bits: BitVector, when: Time) -> Self {
        TransportBlock {
            bits,
            scheduled: Some(when),
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// The MAC-selected TFC together with the blocks for each TrCh this TTI.
/// The block count per TrCh must match the TF the TFC names.
#[derive(Debug, Clone)]
pub struct MacTbs {
    pub tfc_index: TfcId,
    /// Outer index: TrCh (in CCTrCh order); inner: blocks for this TTI.
    pub blocks: Vec<Vec<TransportBlock>>,
}

/// Upward interface: Layer-1 delivers each successfully decoded transport
/// block here. CRC failures never surface.
pub trait MacEngine: Send + Sync {
    fn write_low_side_tb(&self, tb: TransportBlock, trch_id: TrChId);
}

/// A MAC sink that collects delivered blocks; used by the loopback tests.
#[derive(Default)]
pub struct CollectingMac {
    pub received: std::sync::Mutex<Vec<(TrChId, TransportBlock)>>,
}

impl MacEngine for CollectingMac {
    fn write_low_side_tb(&self, tb: TransportBlock, trch_id: TrChId) {
        self.received.lock().unwrap().push((trch_id, tb));
    }
}
