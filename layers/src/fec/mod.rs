//! Transport-channel FEC pipeline
//!
//! Implements the multiplexing and channel coding chain of 3GPP TS 25.212
//! section 4.2: CRC attachment, transport block concatenation and code block
//! segmentation, convolutional and turbo coding, rate matching, interleaving,
//! radio frame segmentation, TrCh multiplexing and TFCI coding, together with
//! the uplink inverse of each stage.

pub mod chans;
pub mod coding;
pub mod decoder;
pub mod encoder;
pub mod interleave;
pub mod parity;
pub mod ratematch;
pub mod tfci;
pub mod turbo;
pub mod viterbi;

pub use decoder::{CcTrChDecoder, RxBitsBurst};
pub use encoder::{CcTrChEncoder, TxBitsBurst};
