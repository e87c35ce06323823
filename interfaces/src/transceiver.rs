//! Transceiver control and clock channels
//!
//! Line-oriented ASCII over UDP: commands are `CMD <NAME> [params]`,
//! answered by `RSP <NAME> <status> [params]` with status 0 meaning OK.
//! The transceiver pushes `IND CLOCK <FN>` on a separate socket at least
//! once a second; missing indications raise the clock-lost flag but never
//! abort.

use crate::InterfaceError;
use common::Clock;
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space1},
    combinator::{map_res, opt},
    sequence::preceded,
    IResult,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Control commands time out after this long.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(6);
/// Clock indications are expected at least this often.
const CLOCK_TIMEOUT: Duration = Duration::from_secs(3);

fn parse_i64(input: &str) -> IResult<&str, i64> {
    map_res(
        nom::combinator::recognize(preceded(opt(tag("-")), digit1)),
        str::parse,
    )(input)
}

/// Parse `RSP <NAME> <status> [param]`.
fn parse_rsp(input: &str) -> IResult<&str, (&str, i64, Option<i64>)> {
    let (input, _) = tag("RSP ")(input)?;
    let (input, name) = take_while1(|c: char| c.is_ascii_alphanumeric())(input)?;
    let (input, _) = space1(input)?;
    let (input, status) = parse_i64(input)?;
    let (input, param) = opt(preceded(space1, parse_i64))(input)?;
    Ok((input, (name, status, param)))
}

/// Parse `IND CLOCK <FN>`.
fn parse_clock_ind(input: &str) -> IResult<&str, u32> {
    let (input, _) = tag("IND CLOCK ")(input)?;
    map_res(digit1, str::parse)(input)
}

/// The control channel of one ARFCN.
pub struct ArfcnManager {
    socket: Mutex<UdpSocket>,
    peer: SocketAddr,
    dead: AtomicBool,
}

impl ArfcnManager {
    pub async fn new(local: SocketAddr, peer: SocketAddr) -> Result<Self, InterfaceError> {
        let socket = UdpSocket::bind(local).await?;
        Ok(ArfcnManager {
            socket: Mutex::new(socket),
            peer,
            dead: AtomicBool::new(false),
        })
    }

    /// The transceiver stopped answering control commands.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// One command/response transaction, retried once on timeout.
    async fn send_command_packet(&self, command: &str) -> Result<String, InterfaceError> {
        if self.is_dead() {
            return Err(InterfaceError::Dead);
        }
        let socket = self.socket.lock().await;
        let mut buf = [0u8; 1024];
        for attempt in 0..2 {
            socket.send_to(command.as_bytes(), self.peer).await?;
            match tokio::time::timeout(CONTROL_TIMEOUT, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    let response = String::from_utf8_lossy(&buf[..len]).into_owned();
                    if !response.starts_with("RSP ") {
                        error!(response, "bad control response");
                        return Err(InterfaceError::InvalidMessage);
                    }
                    return Ok(response);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!(command, attempt, "control command timed out");
                }
            }
        }
        self.dead.store(true, Ordering::SeqCst);
        error!(command, "lost control link to transceiver");
        Err(InterfaceError::Timeout)
    }

    /// Send a command; returns the optional response parameter.
    pub async fn send_command(
        &self,
        name: &str,
        params: &[i64],
    ) -> Result<Option<i64>, InterfaceError> {
        let mut line = format!("CMD {}", name);
        for p in params {
            line.push_str(&format!(" {}", p));
        }
        let response = self.send_command_packet(&line).await?;
        let (_, (rsp_name, status, param)) =
            parse_rsp(&response).map_err(|_| InterfaceError::InvalidMessage)?;
        if rsp_name != name {
            error!(expected = name, got = rsp_name, "response for wrong command");
            return Err(InterfaceError::InvalidMessage);
        }
        if status != 0 {
            return Err(InterfaceError::CommandFailed {
                command: name.into(),
                status: status as i32,
            });
        }
        Ok(param)
    }

    pub async fn power_on(&self) -> Result<(), InterfaceError> {
        self.send_command("POWERON", &[]).await.map(|_| ())
    }

    pub async fn power_off(&self) -> Result<(), InterfaceError> {
        self.send_command("POWEROFF", &[]).await.map(|_| ())
    }

    /// Set transmit attenuation in dB.
    pub async fn set_power(&self, db: i64) -> Result<(), InterfaceError> {
        self.send_command("SETPOWER", &[db]).await.map(|_| ())
    }

    /// Set receive gain; returns the gain actually applied.
    pub async fn set_rx_gain(&self, db: i64) -> Result<i64, InterfaceError> {
        Ok(self
            .send_command("SETRXGAIN", &[db])
            .await?
            .unwrap_or(db))
    }

    /// Set the maximum expected delay spread in kilometres.
    pub async fn set_max_delay(&self, km: i64) -> Result<(), InterfaceError> {
        self.send_command("SETMAXDLY", &[km]).await.map(|_| ())
    }

    pub async fn set_freq_offset(&self, offset: i64) -> Result<(), InterfaceError> {
        self.send_command("SETFREQOFFSET", &[offset]).await.map(|_| ())
    }

    pub async fn tx_tune(&self, khz: i64) -> Result<(), InterfaceError> {
        self.send_command("TXTUNE", &[khz]).await.map(|_| ())
    }

    pub async fn rx_tune(&self, khz: i64) -> Result<(), InterfaceError> {
        self.send_command("RXTUNE", &[khz]).await.map(|_| ())
    }

    pub async fn set_tx_qmc_gain(&self, a: i64, b: i64, phase: i64) -> Result<(), InterfaceError> {
        self.send_command("SETTXQMCGAIN", &[a, b, phase]).await.map(|_| ())
    }

    pub async fn set_tx_qmc_offset(&self, a: i64, b: i64) -> Result<(), InterfaceError> {
        self.send_command("SETTXQMCOFFSET", &[a, b]).await.map(|_| ())
    }

    pub async fn set_rx_qmc_gain(&self, a: i64, b: i64, phase: i64) -> Result<(), InterfaceError> {
        self.send_command("SETRXQMCGAIN", &[a, b, phase]).await.map(|_| ())
    }

    pub async fn set_rx_qmc_offset(&self, a: i64, b: i64) -> Result<(), InterfaceError> {
        self.send_command("SETRXQMCOFFSET", &[a, b]).await.map(|_| ())
    }

    pub async fn noise_level(&self) -> Result<i64, InterfaceError> {
        Ok(self.send_command("NOISELEV", &[]).await?.unwrap_or(0))
    }

    pub async fn temperature(&self) -> Result<i64, InterfaceError> {
        Ok(self.send_command("TEMPERATURE", &[]).await?.unwrap_or(0))
    }

    pub async fn read_tx_power(&self) -> Result<i64, InterfaceError> {
        Ok(self.send_command("READTXPWR", &[]).await?.unwrap_or(0))
    }

    pub async fn read_rx_power_coarse(&self) -> Result<i64, InterfaceError> {
        Ok(self.send_command("READRXPWRCOARSE", &[]).await?.unwrap_or(0))
    }

    pub async fn read_rx_power_fine(&self) -> Result<i64, InterfaceError> {
        Ok(self.send_command("READRXPWRFINE", &[]).await?.unwrap_or(0))
    }
}

/// The transceiver manager: owns the clock channel and the per-ARFCN
/// control managers.
pub struct TransceiverManager {
    pub arfcn: Arc<ArfcnManager>,
    clock_socket: UdpSocket,
    clock: Arc<Clock>,
    have_clock: AtomicBool,
    clock_lost: AtomicBool,
}

impl TransceiverManager {
    pub async fn new(
        clock_local: SocketAddr,
        control_local: SocketAddr,
        control_peer: SocketAddr,
        clock: Arc<Clock>,
    ) -> Result<Self, InterfaceError> {
        let clock_socket = UdpSocket::bind(clock_local).await?;
        let arfcn = Arc::new(ArfcnManager::new(control_local, control_peer).await?);
        Ok(TransceiverManager {
            arfcn,
            clock_socket,
            clock,
            have_clock: AtomicBool::new(false),
            clock_lost: AtomicBool::new(false),
        })
    }

    pub fn have_clock(&self) -> bool {
        self.have_clock.load(Ordering::SeqCst)
    }

    /// No indication within the timeout; downlink should hold at the
    /// queue boundary until the clock returns.
    pub fn clock_lost(&self) -> bool {
        self.clock_lost.load(Ordering::SeqCst)
    }

    /// Service one message on the clock socket.
    pub async fn clock_handler(&self) {
        let mut buf = [0u8; 256];
        match tokio::time::timeout(CLOCK_TIMEOUT, self.clock_socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                let message = String::from_utf8_lossy(&buf[..len]);
                match parse_clock_ind(message.trim_end_matches('\0')) {
                    Ok((_, fnr)) => {
                        debug!(fnr, "clock indication");
                        self.clock.set_fn(fnr);
                        self.have_clock.store(true, Ordering::SeqCst);
                        self.clock_lost.store(false, Ordering::SeqCst);
                    }
                    Err(_) => {
                        error!(%message, "bogus message on clock interface");
                    }
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "read error on clock interface");
            }
            Err(_) => {
                warn!("no clock indication from transceiver");
                self.clock_lost.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Run the clock service loop until cancelled.
    pub async fn clock_loop(self: Arc<Self>) {
        info!("clock service loop started");
        loop {
            self.clock_handler().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rsp() {
        let (_, (name, status, param)) = parse_rsp("RSP SETRXGAIN 0 47").unwrap();
        assert_eq!(name, "SETRXGAIN");
        assert_eq!(status, 0);
        assert_eq!(param, Some(47));

        let (_, (name, status, param)) = parse_rsp("RSP POWERON 0").unwrap();
        assert_eq!(name, "POWERON");
        assert_eq!(status, 0);
        assert_eq!(param, None);

        let (_, (_, status, _)) = parse_rsp("RSP SETPOWER -1").unwrap();
        assert_eq!(status, -1);

        assert!(parse_rsp("CMD POWERON").is_err());
    }

    #[test]
    fn test_parse_clock_ind() {
        let (_, fnr) = parse_clock_ind("IND CLOCK 3041").unwrap();
        assert_eq!(fnr, 3041);
        assert!(parse_clock_ind("IND NOISE 12").is_err());
    }

    #[tokio::test]
    async fn test_command_roundtrip_over_udp() {
        // A fake transceiver answering SETRXGAIN.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let cmd = String::from_utf8_lossy(&buf[..len]).into_owned();
            assert_eq!(cmd, "CMD SETRXGAIN 40");
            server.send_to(b"RSP SETRXGAIN 0 38", from).await.unwrap();
        });

        let mgr = ArfcnManager::new("127.0.0.1:0".parse().unwrap(), server_addr)
            .await
            .unwrap();
        assert_eq!(mgr.set_rx_gain(40).await.unwrap(), 38);
        assert!(!mgr.is_dead());
    }

    #[tokio::test]
    async fn test_clock_indication_updates_clock() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let clock = Arc::new(Clock::new(0));
        // Bind the manager clock socket, then push one indication at it.
        let mgr = TransceiverManager::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
            clock.clone(),
        )
        .await
        .unwrap();
        let clock_addr = mgr.clock_socket.local_addr().unwrap();
        server.send_to(b"IND CLOCK 2000", clock_addr).await.unwrap();
        mgr.clock_handler().await;
        assert!(mgr.have_clock());
        assert!(!mgr.clock_lost());
        let fnr = clock.fnr();
        assert!(common::fn_delta(fnr, 2000).abs() <= 1);
    }
}
