//! Slot data framing
//!
//! One UDP packet per 2560-chip slot in each direction. Downlink packets
//! are 3 header bytes, 2x2560 int8 I/Q samples and a trailing terminator;
//! uplink packets carry the same header followed by the slot plus a guard
//! region for delay-spread search.

use crate::InterfaceError;
use common::{Time, CHIPS_PER_SLOT};
use num_complex::Complex32;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::debug;

/// Serialise a downlink slot: TN, FN (big-endian), interleaved I/Q.
pub fn encode_downlink_slot(time: Time, chips: &[Complex32]) -> Vec<u8> {
    debug_assert_eq!(chips.len(), CHIPS_PER_SLOT);
    let mut buf = Vec::with_capacity(3 + 2 * CHIPS_PER_SLOT + 1);
    buf.push(time.tn() as u8);
    let fnr = time.fnr() as u16;
    buf.push((fnr >> 8) as u8);
    buf.push((fnr & 0xff) as u8);
    for c in chips {
        buf.push(c.re.clamp(-127.0, 127.0) as i8 as u8);
        buf.push(c.im.clamp(-127.0, 127.0) as i8 as u8);
    }
    buf.push(0);
    buf
}

/// Parse an uplink slot packet into its timestamp and complex samples.
/// `guard` is the post-slot search region the front-end appends.
pub fn decode_uplink_slot(packet: &[u8], guard: usize) -> Result<(Time, Vec<Complex32>), InterfaceError> {
    let burst_len = CHIPS_PER_SLOT + guard;
    if packet.len() < 3 + 2 * burst_len {
        return Err(InterfaceError::InvalidMessage);
    }
    let tn = packet[0] as usize;
    if tn >= common::SLOTS_PER_FRAME {
        return Err(InterfaceError::InvalidMessage);
    }
    let fnr = ((packet[1] as i32) << 8) | packet[2] as i32;
    let mut samples = Vec::with_capacity(burst_len);
    let mut rp = 3;
    for _ in 0..burst_len {
        let re = packet[rp] as i8 as f32;
        let im = packet[rp + 1] as i8 as f32;
        samples.push(Complex32::new(re, im));
        rp += 2;
    }
    Ok((Time::new(fnr, tn), samples))
}

/// The per-ARFCN data socket.
pub struct DataLink {
    socket: UdpSocket,
    peer: SocketAddr,
    guard: usize,
}

impl DataLink {
    pub async fn new(
        local: SocketAddr,
        peer: SocketAddr,
        guard: usize,
    ) -> Result<Self, InterfaceError> {
        let socket = UdpSocket::bind(local).await?;
        debug!(%local, %peer, "data link bound");
        Ok(DataLink {
            socket,
            peer,
            guard,
        })
    }

    /// Uplink guard length in samples.
    pub fn guard(&self) -> usize {
        self.guard
    }

    pub async fn send_slot(&self, time: Time, chips: &[Complex32]) -> Result<(), InterfaceError> {
        let packet = encode_downlink_slot(time, chips);
        self.socket.send_to(&packet, self.peer).await?;
        Ok(())
    }

    pub async fn recv_slot(&self) -> Result<(Time, Vec<Complex32>), InterfaceError> {
        let mut buf = vec![0u8; 3 + 2 * (CHIPS_PER_SLOT + self.guard) + 16];
        let (len, _) = self.socket.recv_from(&mut buf).await?;
        decode_uplink_slot(&buf[..len], self.guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downlink_framing() {
        let chips = vec![Complex32::new(1.0, -2.0); CHIPS_PER_SLOT];
        let packet = encode_downlink_slot(Time::new(0x123, 7), &chips);
        assert_eq!(packet.len(), 3 + 2 * CHIPS_PER_SLOT + 1);
        assert_eq!(packet[0], 7);
        assert_eq!(packet[1], 0x01);
        assert_eq!(packet[2], 0x23);
        assert_eq!(packet[3] as i8, 1);
        assert_eq!(packet[4] as i8, -2);
        assert_eq!(*packet.last().unwrap(), 0);
    }

    #[test]
    fn test_uplink_roundtrip() {
        let guard = 64;
        let mut packet = vec![0u8; 3 + 2 * (CHIPS_PER_SLOT + guard)];
        packet[0] = 14;
        packet[1] = 0x0f;
        packet[2] = 0xff;
        packet[3] = (-5i8) as u8;
        packet[4] = 9;
        let (time, samples) = decode_uplink_slot(&packet, guard).unwrap();
        assert_eq!(time, Time::new(0x0fff, 14));
        assert_eq!(samples.len(), CHIPS_PER_SLOT + guard);
        assert_eq!(samples[0], Complex32::new(-5.0, 9.0));
    }

    #[test]
    fn test_uplink_rejects_short_packet() {
        assert!(decode_uplink_slot(&[0u8; 10], 0).is_err());
        let mut bad_tn = vec![0u8; 3 + 2 * CHIPS_PER_SLOT];
        bad_tn[0] = 15;
        assert!(decode_uplink_slot(&bad_tn, 0).is_err());
    }
}
