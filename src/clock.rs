//! # Clock Synchronization Module
//!
//! Produces wall-clock millisecond timestamps from a monotonic counter plus a
//! one-shot NTP-derived offset.
//!
//! ## Key Components
//! - `MonotonicClock`: elapsed-time source that never goes backwards
//! - `ClockOffset`: `now_wall_ms() = monotonic_ms() + offset_ms`, offset written once
//! - `NtpClient` / `SntpClient`: single request/response time query
//!
//! ## Timing Model
//! Until the NTP bootstrap succeeds the offset is 0 and timestamps equal the
//! monotonic clock. After success the offset is constant, so stamps stay
//! monotonic while lining up with wall time.

use crate::error::ClockError;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Elapsed-time source used for every sample timestamp.
pub trait MonotonicClock: Send + Sync {
    fn monotonic_ms(&self) -> i64;
}

/// Milliseconds elapsed since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct SystemMonotonic {
    origin: Instant,
}

impl SystemMonotonic {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemMonotonic {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemMonotonic {
    fn monotonic_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

/// Result of a successful NTP transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpTime {
    /// Server time in Unix milliseconds, corrected for round trip
    pub ntp_time_ms: i64,
    /// Monotonic time sampled when the response arrived
    pub local_ref_ms: i64,
}

impl NtpTime {
    pub fn offset_ms(&self) -> i64 {
        self.ntp_time_ms - self.local_ref_ms
    }
}

/// One-shot time query against a network time server.
pub trait NtpClient: Send + Sync {
    fn request_time(
        &self,
        host: &str,
        timeout_ms: u32,
        clock: &dyn MonotonicClock,
    ) -> Result<NtpTime, ClockError>;
}

/// Process-wide wall clock: monotonic baseline plus a write-once offset.
pub struct ClockOffset {
    clock: Arc<dyn MonotonicClock>,
    offset_ms: AtomicI64,
    synchronized: AtomicBool,
    bootstrap_started: AtomicBool,
}

impl ClockOffset {
    pub fn new(clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            clock,
            offset_ms: AtomicI64::new(0),
            synchronized: AtomicBool::new(false),
            bootstrap_started: AtomicBool::new(false),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemMonotonic::new()))
    }

    pub fn monotonic_ms(&self) -> i64 {
        self.clock.monotonic_ms()
    }

    /// Wall-clock milliseconds: `monotonic_ms() + offset`.
    pub fn now_wall_ms(&self) -> i64 {
        self.clock.monotonic_ms() + self.offset_ms.load(Ordering::Acquire)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }

    /// Stores the offset from an NTP answer. Only the first call has an effect.
    pub fn apply(&self, time: NtpTime) -> bool {
        if self
            .synchronized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Clock offset already set, ignoring NTP answer");
            return false;
        }
        self.offset_ms.store(time.offset_ms(), Ordering::Release);
        log::info!(
            "NTP time: {} ref: {} now: {} offset: {}",
            time.ntp_time_ms,
            time.local_ref_ms,
            self.now_wall_ms(),
            time.offset_ms()
        );
        true
    }

    /// Runs the NTP query on a dedicated thread.
    ///
    /// Returns `None` if a bootstrap was already started for this clock or the
    /// thread could not be spawned. Failures leave the offset at 0 and are not
    /// retried.
    pub fn bootstrap(
        self: &Arc<Self>,
        client: Arc<dyn NtpClient>,
        host: String,
        timeout_ms: u32,
    ) -> Option<JoinHandle<()>> {
        if self.bootstrap_started.swap(true, Ordering::AcqRel) {
            return None;
        }

        let offset = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("ntp".to_string())
            .spawn(move || {
                match client.request_time(&host, timeout_ms, offset.clock.as_ref()) {
                    Ok(time) => {
                        offset.apply(time);
                    }
                    Err(e) => {
                        log::warn!("NTP bootstrap against {} failed: {}", host, e);
                    }
                }
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Failed to spawn NTP thread: {}", e);
                None
            }
        }
    }
}

const NTP_PORT: u16 = 123;
const NTP_PACKET_SIZE: usize = 48;
const NTP_MODE_CLIENT: u8 = 3;
const NTP_MODE_SERVER: u8 = 4;
const NTP_MODE_BROADCAST: u8 = 5;
const NTP_VERSION: u8 = 3;
const NTP_LEAP_NOSYNC: u8 = 3;
const NTP_STRATUM_DEATH: u8 = 0;
const NTP_STRATUM_MAX: u8 = 15;

const ORIGINATE_TIME_OFFSET: usize = 24;
const RECEIVE_TIME_OFFSET: usize = 32;
const TRANSMIT_TIME_OFFSET: usize = 40;

// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01 (Unix epoch)
const OFFSET_1900_TO_1970: u64 = 2_208_988_800;

/// Minimal SNTP (RFC 4330) client over UDP.
#[derive(Debug, Default, Clone, Copy)]
pub struct SntpClient;

impl SntpClient {
    pub fn new() -> Self {
        Self
    }

    /// Builds a client-mode request carrying `wall_ms` as transmit timestamp.
    fn encode_request(wall_ms: i64) -> [u8; NTP_PACKET_SIZE] {
        let mut buffer = [0u8; NTP_PACKET_SIZE];
        buffer[0] = NTP_MODE_CLIENT | (NTP_VERSION << 3);
        write_timestamp(&mut buffer, TRANSMIT_TIME_OFFSET, wall_ms);
        buffer
    }

    /// Computes the server time from a response.
    ///
    /// `request_wall_ms` is the wall clock at send time; the tick arguments are
    /// monotonic samples taken around the exchange.
    fn parse_response(
        buffer: &[u8],
        request_wall_ms: i64,
        request_ticks: i64,
        response_ticks: i64,
    ) -> Result<NtpTime, ClockError> {
        if buffer.len() < NTP_PACKET_SIZE {
            return Err(ClockError::InvalidResponse(format!(
                "short packet of {} bytes",
                buffer.len()
            )));
        }

        let leap = (buffer[0] >> 6) & 0x3;
        let mode = buffer[0] & 0x7;
        let stratum = buffer[1];
        if leap == NTP_LEAP_NOSYNC {
            return Err(ClockError::InvalidResponse("unsynchronized server".to_string()));
        }
        if mode != NTP_MODE_SERVER && mode != NTP_MODE_BROADCAST {
            return Err(ClockError::InvalidResponse(format!("untrusted mode {}", mode)));
        }
        if stratum == NTP_STRATUM_DEATH || stratum > NTP_STRATUM_MAX {
            return Err(ClockError::InvalidResponse(format!("untrusted stratum {}", stratum)));
        }

        let transmit_time = read_timestamp(buffer, TRANSMIT_TIME_OFFSET);
        if transmit_time == 0 {
            return Err(ClockError::InvalidResponse("zero transmit time".to_string()));
        }
        let originate_time = read_timestamp(buffer, ORIGINATE_TIME_OFFSET);
        let receive_time = read_timestamp(buffer, RECEIVE_TIME_OFFSET);
        let response_time = request_wall_ms + (response_ticks - request_ticks);

        let clock_offset = ((receive_time - originate_time) + (transmit_time - response_time)) / 2;

        Ok(NtpTime {
            ntp_time_ms: response_time + clock_offset,
            local_ref_ms: response_ticks,
        })
    }
}

impl NtpClient for SntpClient {
    fn request_time(
        &self,
        host: &str,
        timeout_ms: u32,
        clock: &dyn MonotonicClock,
    ) -> Result<NtpTime, ClockError> {
        let address = (host, NTP_PORT)
            .to_socket_addrs()
            .map_err(|_| ClockError::NtpUnavailable(host.to_string()))?
            .next()
            .ok_or_else(|| ClockError::NtpUnavailable(host.to_string()))?;

        let bind_address = if address.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_address)?;
        socket.set_read_timeout(Some(Duration::from_millis(u64::from(timeout_ms.max(1)))))?;

        let request_wall_ms = unix_now_ms();
        let request_ticks = clock.monotonic_ms();
        let request = Self::encode_request(request_wall_ms);
        socket.send_to(&request, address)?;

        let mut response = [0u8; NTP_PACKET_SIZE];
        let (received, _) = socket.recv_from(&mut response)?;
        let response_ticks = clock.monotonic_ms();

        Self::parse_response(&response[..received], request_wall_ms, request_ticks, response_ticks)
    }
}

fn unix_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Reads an NTP timestamp as Unix milliseconds.
fn read_timestamp(buffer: &[u8], offset: usize) -> i64 {
    let seconds = u32::from_be_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ]) as i64;
    let fraction = u32::from_be_bytes([
        buffer[offset + 4],
        buffer[offset + 5],
        buffer[offset + 6],
        buffer[offset + 7],
    ]) as i64;
    if seconds == 0 && fraction == 0 {
        return 0;
    }
    (seconds - OFFSET_1900_TO_1970 as i64) * 1000 + ((fraction * 1000 + (1 << 31)) >> 32)
}

/// Writes Unix milliseconds as an NTP timestamp.
fn write_timestamp(buffer: &mut [u8], offset: usize, wall_ms: i64) {
    let seconds = (wall_ms.div_euclid(1000) as u64 + OFFSET_1900_TO_1970) as u32;
    let milliseconds = wall_ms.rem_euclid(1000) as u64;
    let fraction = ((milliseconds << 32) / 1000) as u32;
    buffer[offset..offset + 4].copy_from_slice(&seconds.to_be_bytes());
    buffer[offset + 4..offset + 8].copy_from_slice(&fraction.to_be_bytes());
}
