use std::fmt::Debug;
use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use time::OffsetDateTime;

const NTP_PACKET_LEN: usize = 48;
const NTP_VERSION: u8 = 3;
const MODE_CLIENT: u8 = 3;
const MODE_SERVER: u8 = 4;
const MODE_BROADCAST: u8 = 5;
/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch.
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;
/// Era 0 timestamps with the high bit clear belong to era 1 (after 2036-02-07).
const NTP_ERA_PIVOT: u32 = 0x8000_0000;

/// Source of the wall-clock time stamped onto time-sync records.
pub trait TimeSource: Send + Sync + Debug {
    /// Current wall-clock time according to this source.
    ///
    /// # Errors
    /// Returns an error when the source is unreachable or answers with an unusable time.
    fn now(&self) -> Result<OffsetDateTime>;

    fn describe(&self) -> String;
}

/// Local system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Result<OffsetDateTime> {
        Ok(OffsetDateTime::now_utc())
    }

    fn describe(&self) -> String {
        "system-clock".to_string()
    }
}

/// Always answers with the same instant; used for replays and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource {
    at: OffsetDateTime,
}

impl FixedTimeSource {
    #[must_use]
    pub fn new(at: OffsetDateTime) -> Self {
        Self { at }
    }
}

impl TimeSource for FixedTimeSource {
    fn now(&self) -> Result<OffsetDateTime> {
        Ok(self.at)
    }

    fn describe(&self) -> String {
        format!("fixed:{}", self.at.unix_timestamp())
    }
}

/// Single-shot SNTP client querying one server per call.
#[derive(Debug, Clone)]
pub struct SntpTimeSource {
    server: String,
    timeout: Duration,
}

impl SntpTimeSource {
    #[must_use]
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self { server: server.into(), timeout }
    }

    fn query(&self) -> Result<OffsetDateTime> {
        let addr = self
            .server
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve ntp server {}", self.server))?
            .next()
            .ok_or_else(|| anyhow!("ntp server {} resolved to no addresses", self.server))?;

        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).context("failed to bind ntp client socket")?;
        socket.set_read_timeout(Some(self.timeout)).context("failed to set ntp read timeout")?;
        socket.set_write_timeout(Some(self.timeout)).context("failed to set ntp write timeout")?;
        socket.connect(addr).with_context(|| format!("failed to connect to ntp server {addr}"))?;

        socket
            .send(&encode_request())
            .with_context(|| format!("failed to send ntp request to {addr}"))?;

        let mut buf = [0_u8; NTP_PACKET_LEN * 2];
        let len = socket
            .recv(&mut buf)
            .with_context(|| format!("no ntp response from {addr} within {:?}", self.timeout))?;

        decode_transmit_time(&buf[..len])
    }
}

impl TimeSource for SntpTimeSource {
    fn now(&self) -> Result<OffsetDateTime> {
        self.query()
    }

    fn describe(&self) -> String {
        format!("sntp:{}", self.server)
    }
}

/// Build a client-mode request with every timestamp zeroed.
#[must_use]
pub fn encode_request() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0_u8; NTP_PACKET_LEN];
    packet[0] = (NTP_VERSION << 3) | MODE_CLIENT;
    packet
}

/// Extract the server transmit timestamp from an NTP response packet.
///
/// # Errors
/// Returns an error for short packets, non-server modes, kiss-o'-death replies, and zero
/// transmit timestamps.
pub fn decode_transmit_time(packet: &[u8]) -> Result<OffsetDateTime> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(anyhow!("ntp response too short: {} bytes", packet.len()));
    }

    let mode = packet[0] & 0x07;
    if mode != MODE_SERVER && mode != MODE_BROADCAST {
        return Err(anyhow!("unexpected ntp response mode {mode}"));
    }

    let stratum = packet[1];
    if stratum == 0 {
        let code = String::from_utf8_lossy(&packet[12..16]).into_owned();
        return Err(anyhow!("ntp server sent kiss-o'-death: {code}"));
    }

    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]);
    if seconds == 0 && fraction == 0 {
        return Err(anyhow!("ntp response carries no transmit timestamp"));
    }

    let era_seconds = if seconds < NTP_ERA_PIVOT {
        i64::from(seconds) + (1_i64 << 32)
    } else {
        i64::from(seconds)
    };
    let unix_seconds = era_seconds - NTP_UNIX_OFFSET;
    let nanos = (u64::from(fraction) * 1_000_000_000) >> 32;

    OffsetDateTime::from_unix_timestamp_nanos(
        i128::from(unix_seconds) * 1_000_000_000 + i128::from(nanos),
    )
    .context("ntp transmit timestamp is out of range")
}
