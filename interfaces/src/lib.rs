//! Transceiver Interfaces Library
//!
//! This crate provides the UDP transport to the radio front-end: the
//! line-oriented control and clock channels and the binary per-slot data
//! channel.

pub mod data;
pub mod transceiver;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message format")]
    InvalidMessage,

    #[error("Control command timed out")]
    Timeout,

    #[error("Command {command} failed with status {status}")]
    CommandFailed { command: String, status: i32 },

    #[error("Transceiver is not responding")]
    Dead,
}
