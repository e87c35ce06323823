//! NodeB configuration
//!
//! TOML configuration file with CLI overrides for the basics. Field names
//! follow the radio-side terminology.

use serde::{Deserialize, Serialize};

/// Top-level NodeB configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeBConfig {
    /// Radio and cell parameters.
    pub radio: RadioConfig,
    /// PRACH parameters.
    #[serde(default)]
    pub prach: PrachConfig,
    /// Transceiver transport addressing.
    #[serde(default)]
    pub transceiver: TransceiverConfig,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RadioConfig {
    /// Operating band in MHz (850, 900, 1700, 1800, 1900, 2100).
    pub band: u32,
    /// Downlink UARFCN.
    pub uarfcn: u32,
    /// Primary downlink scrambling code index, 0..511.
    #[serde(default)]
    pub downlink_scrambling_code: usize,
    /// First uplink scrambling code handed to DCHs.
    #[serde(default = "default_ul_scrambling_base")]
    pub uplink_scrambling_base: u32,
    /// Maximum expected delay spread in chips.
    #[serde(default = "default_max_delay_spread")]
    pub max_delay_spread: usize,
    /// Transmit attenuation in dB.
    #[serde(default)]
    pub tx_atten_db: i64,
    /// Receive gain in dB.
    #[serde(default = "default_rx_gain")]
    pub rx_gain_db: i64,
}

fn default_ul_scrambling_base() -> u32 {
    1
}

fn default_max_delay_spread() -> usize {
    100
}

fn default_rx_gain() -> i64 {
    40
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrachConfig {
    /// Preamble signature in use, 0..15.
    pub signature: usize,
    /// Access subchannel in use, 0..11.
    pub subchannel: usize,
    /// Message-part data spreading factor.
    pub sf: usize,
    /// PRACH scrambling code offset within the primary group.
    pub scrambling_code: u32,
    /// Preamble detection threshold (peak-to-mean).
    pub threshold: f32,
}

impl Default for PrachConfig {
    fn default() -> Self {
        PrachConfig {
            signature: 0,
            subchannel: 0,
            sf: 64,
            scrambling_code: 0,
            threshold: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransceiverConfig {
    /// Transceiver host.
    pub address: String,
    /// Base port; control, clock and data use base, base+1 and base+2.
    pub base_port: u16,
    /// Local bind host.
    pub bind_address: String,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        TransceiverConfig {
            address: "127.0.0.1".into(),
            base_port: 5700,
            bind_address: "0.0.0.0".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Default log filter.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".into(),
        }
    }
}

impl NodeBConfig {
    pub fn from_toml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}
