//! Layer-1 Stack Library
//!
//! This crate implements the UMTS FDD Layer-1 transport-channel pipeline
//! and chip-rate modem of a NodeB according to 3GPP TS 25.211-25.214 and
//! TS 25.212 Release 4.

pub mod fec;
pub mod mac;
pub mod modem;
pub mod phch;
pub mod trch;

use thiserror::Error;

/// Common errors for the Layer-1 stack.
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Transport format {requested} does not fit: {detail}")]
    TransportFormatTooLarge { requested: usize, detail: String },

    #[error("Channel code (SF={sf}, code={code}) conflicts with an existing reservation")]
    ReservationConflict { sf: usize, code: usize },

    #[error("Unknown TFCI {0}")]
    UnknownTfci(usize),

    #[error("Processing error: {0}")]
    ProcessingError(String),
}
