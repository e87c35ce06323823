//! UMTS NodeB Main Application
//!
//! Brings up the Layer-1 stack against a radio front-end: frame clock,
//! channel tree, common channel FECs, the chip-rate modem and the
//! transceiver transport, plus the beacon service loop.

mod config;

use anyhow::{anyhow, Result};
use clap::Parser;
use common::{BitVector, Clock, Time, TtiCode, UmtsBand};
use config::NodeBConfig;
use interfaces::data::DataLink;
use interfaces::transceiver::TransceiverManager;
use layers::fec::chans::{ActiveDchList, BchFec, DchFec, FachFec, RachFec};
use layers::mac::TransportBlock;
use layers::modem::{
    spawn_uplink_workers, ModemConfig, RadioModem, SignatureMask, SubchannelMask, UplinkSlot,
};
use layers::phch::ChannelTree;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// UMTS NodeB baseband
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "nodeb.toml")]
    config: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Downlink UARFCN override
    #[arg(long)]
    uarfcn: Option<u32>,

    /// Primary downlink scrambling code override
    #[arg(long)]
    scrambling_code: Option<usize>,
}

fn band_from_config(band: u32) -> Result<UmtsBand> {
    Ok(match band {
        850 => UmtsBand::Umts850,
        900 => UmtsBand::Umts900,
        1700 => UmtsBand::Umts1700,
        1800 => UmtsBand::Umts1800,
        1900 => UmtsBand::Umts1900,
        2100 => UmtsBand::Umts2100,
        other => return Err(anyhow!("unsupported band {}", other)),
    })
}

/// Stand-in beacon payload until the RRC SIB scheduler sits on top: the
/// system frame number with fixed filler, fresh each TTI.
fn beacon_block(tb_size: usize, fnr: i32) -> TransportBlock {
    let mut bits = BitVector::new(tb_size);
    let mut wp = 0;
    bits.write_field(&mut wp, (fnr >> 1) as u64, 12);
    TransportBlock::new(bits)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match NodeBConfig::from_toml_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cannot read {}: {}; using defaults", args.config, e);
            toml::from_str("[radio]\nband = 900\nuarfcn = 3011")?
        }
    };

    let level = args.log_level.unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    fmt().with_env_filter(env_filter).with_target(true).init();

    info!("Starting UMTS NodeB");
    let band = band_from_config(config.radio.band)?;
    let uarfcn = args.uarfcn.unwrap_or(config.radio.uarfcn);
    let dl_khz = band
        .channel_freq_khz(uarfcn)
        .ok_or_else(|| anyhow!("UARFCN {} not in band {:?}", uarfcn, band))?;
    let ul_khz = dl_khz - band.uplink_offset_khz();
    let scrambling_code = args
        .scrambling_code
        .unwrap_or(config.radio.downlink_scrambling_code);
    info!(uarfcn, dl_khz, ul_khz, scrambling_code, "cell configuration");

    // Frame clock and transceiver channels.
    let clock = Arc::new(Clock::new(0));
    let bind = &config.transceiver.bind_address;
    let peer = &config.transceiver.address;
    let base = config.transceiver.base_port;
    let trx = Arc::new(
        TransceiverManager::new(
            format!("{}:{}", bind, base + 1).parse()?,
            format!("{}:0", bind).parse()?,
            format!("{}:{}", peer, base).parse()?,
            clock.clone(),
        )
        .await?,
    );
    tokio::spawn(trx.clone().clock_loop());

    // Program the front-end; failures here are startup errors.
    let control = trx.arfcn.clone();
    control.tx_tune(dl_khz as i64).await?;
    control.rx_tune(ul_khz as i64).await?;
    control.set_power(config.radio.tx_atten_db).await?;
    let applied = control.set_rx_gain(config.radio.rx_gain_db).await?;
    control
        .set_max_delay((config.radio.max_delay_spread / 100).max(1) as i64)
        .await?;
    control.power_on().await?;
    info!(rx_gain = applied, "transceiver up");

    // The channel tree: reserve the SCCPCH, then pre-populate DCHs at
    // every free position. CPICH and PCCPCH are reserved by populate().
    let tree = Arc::new(ChannelTree::<DchFec>::new());
    tree.reserve(64, 1)
        .map_err(|e| anyhow!("SCCPCH reservation: {}", e))?;
    let mut ul_code = config.radio.uplink_scrambling_base;
    tree.populate(|sf, code| {
        let ul_sf = if sf == 4 { 4 } else { sf / 2 };
        let dch = Arc::new(DchFec::new(sf, code, ul_sf, ul_code));
        // Stride the scrambling codes so neighbours never collide.
        ul_code = (ul_code + 37841) % (1 << 24);
        dch
    });

    // Common channel FECs and the modem.
    let rach = Arc::new(RachFec::new(
        256,
        16 * scrambling_code as u32 + config.prach.scrambling_code,
        16,
        0,
        TtiCode::Tti20ms,
    )?);
    let active_dch = Arc::new(ActiveDchList::default());
    let modem_config = ModemConfig {
        dl_scrambling_index: scrambling_code,
        prach_scrambling_code: config.prach.scrambling_code,
        signature_mask: SignatureMask::from_bits_truncate(1 << config.prach.signature),
        subchannel_mask: SubchannelMask::from_bits_truncate(1 << config.prach.subchannel),
        prach_sf: config.prach.sf,
        prach_signature: config.prach.signature,
        max_delay_spread: config.radio.max_delay_spread,
        rach_threshold: config.prach.threshold,
        ..ModemConfig::default()
    };
    let modem = Arc::new(RadioModem::new(
        modem_config,
        rach.clone(),
        active_dch.clone(),
        clock.clone(),
    ));
    let bch = Arc::new(BchFec::new(modem.tx_queue.clone()));
    let fach = Arc::new(FachFec::new(
        64,
        1,
        12,
        0,
        TtiCode::Tti10ms,
        modem.tx_queue.clone(),
    )?);
    fach.open(Time::new(clock.fnr() + 2, 0));
    info!(
        bch_tb = bch.tb_size(),
        fach_tb = fach.tb_size(),
        "common channels configured"
    );

    // Data link and the radio I/O loops.
    let data = Arc::new(
        DataLink::new(
            format!("{}:{}", bind, base + 2).parse()?,
            format!("{}:{}", peer, base + 2).parse()?,
            1024 + config.radio.max_delay_spread,
        )
        .await?,
    );

    // Transmit loop: one slot ahead of the frame clock.
    let tx_handle = {
        let modem = modem.clone();
        let clock = clock.clone();
        let data = data.clone();
        let trx = trx.clone();
        tokio::spawn(async move {
            let mut next = clock.now().add_frames(1);
            loop {
                clock.wait(next).await;
                if trx.clock_lost() {
                    // Hold the downlink at the queue boundary; transmission
                    // resumes with the next good indication.
                    warn!("clock lost; pausing downlink");
                    next = clock.now().add_frames(1);
                    continue;
                }
                for tn in 0..common::SLOTS_PER_FRAME {
                    let slot_time = next.slot(tn);
                    let (chips, _underrun) = modem.transmit_slot(slot_time);
                    if let Err(e) = data.send_slot(slot_time, &chips).await {
                        error!(error = %e, "downlink send failed");
                    }
                }
                next = next.add_frames(1);
            }
        })
    };

    // Receive loop feeding the uplink worker pool.
    let uplink = spawn_uplink_workers(modem.clone());
    let rx_handle = {
        let data = data.clone();
        tokio::spawn(async move {
            loop {
                match data.recv_slot().await {
                    Ok((time, samples)) => {
                        let slot = UplinkSlot {
                            time,
                            samples: Arc::new(samples),
                        };
                        if uplink.send(slot).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "uplink receive failed");
                    }
                }
            }
        })
    };

    // Beacon service loop: one transport block per 20 ms TTI.
    let beacon_handle = {
        let bch = bch.clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            bch.open(Time::new(clock.fnr() + 2, 0));
            loop {
                clock.wait(bch.prev_write_time()).await;
                let when = bch.next_write_time();
                let tb = beacon_block(bch.tb_size(), when.fnr());
                if let Err(e) = bch.write_high_side(&tb) {
                    error!(error = %e, "beacon encode failed");
                }
            }
        })
    };

    // Periodic status.
    let stats_handle = {
        let modem = modem.clone();
        let rach = rach.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                info!(
                    tx_queue = modem.tx_queue.len(),
                    underruns = modem.tx_queue.underruns(),
                    rach_fer = rach.fer(),
                    "status"
                );
            }
        })
    };

    info!("NodeB running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    tx_handle.abort();
    rx_handle.abort();
    beacon_handle.abort();
    stats_handle.abort();
    let _ = control.power_off().await;
    Ok(())
}
