//! The NTP buffer, read through one of two views: the client request
//! written before sending, and the server reply parsed after receiving.

use chrono::{DateTime, TimeDelta, Utc};

pub const DATAGRAM_SIZE: usize = 48;
/// Room for replies longer than a datagram, so the socket reports their
/// real length instead of truncating them to 48.
const RECEIVE_CAPACITY: usize = 64;

/// Seconds from 1900-01-01 (NTP era 0) to 1970-01-01.
const NTP_TO_UNIX_SECS: u32 = 2_208_988_800;

/// LI = 3 (unsynchronized), VN = 4, Mode = 3 (client).
const LI_VN_MODE: u8 = 0b1110_0011;
const LEAP_ALARM: u8 = 0b1100_0000;
const POLL_INTERVAL: u8 = 6;
const PRECISION: u8 = 0xEC;
const REFERENCE_ID: [u8; 4] = [49, 0x4E, 49, 52];

const TRANSMIT_SECONDS: usize = 40;

#[derive(Debug, Clone)]
pub struct Datagram {
    bytes: [u8; RECEIVE_CAPACITY],
}

impl Default for Datagram {
    fn default() -> Self {
        Self {
            bytes: [0; RECEIVE_CAPACITY],
        }
    }
}

impl Datagram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites the buffer as a client request.
    pub fn request(&mut self, leap_smear: bool) -> Request<'_> {
        self.bytes = [0; RECEIVE_CAPACITY];
        self.bytes[0] = LI_VN_MODE;
        if !leap_smear {
            self.bytes[0] |= LEAP_ALARM;
        }
        self.bytes[1] = 0; // stratum
        self.bytes[2] = POLL_INTERVAL;
        self.bytes[3] = PRECISION;
        // bytes 4..12: root delay and root dispersion stay zero
        self.bytes[12..16].copy_from_slice(&REFERENCE_ID);
        Request {
            bytes: &self.bytes[..DATAGRAM_SIZE],
        }
    }

    /// Zeroes the buffer and hands it out to receive a reply into.
    ///
    /// The buffer is larger than a datagram; only a receive of exactly
    /// [`DATAGRAM_SIZE`] bytes is a valid reply.
    pub fn reply_buffer(&mut self) -> &mut [u8] {
        self.bytes = [0; RECEIVE_CAPACITY];
        &mut self.bytes
    }

    pub fn response(&self) -> Response<'_> {
        Response {
            bytes: &self.bytes[..DATAGRAM_SIZE],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    bytes: &'a [u8],
}

impl<'a> Request<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Response<'a> {
    bytes: &'a [u8],
}

impl Response<'_> {
    /// Whole seconds of the transmit timestamp, NTP epoch.
    pub fn transmit_seconds(&self) -> u32 {
        u32::from_be_bytes([
            self.bytes[TRANSMIT_SECONDS],
            self.bytes[TRANSMIT_SECONDS + 1],
            self.bytes[TRANSMIT_SECONDS + 2],
            self.bytes[TRANSMIT_SECONDS + 3],
        ])
    }

    /// Transmit timestamp on the Unix epoch. The fraction is dropped.
    ///
    /// `None` when the server left the timestamp zero, as unsynchronized
    /// servers and kiss-o'-death replies do.
    pub fn transmit_time(&self) -> Option<DateTime<Utc>> {
        match self.transmit_seconds() {
            0 => None,
            seconds => Some(unix_time(seconds)),
        }
    }
}

/// Converts NTP seconds to a Unix time.
///
/// The subtraction wraps, so era 1 timestamps (after 2036-02-07) still land
/// in the right place until 2106.
pub fn unix_time(ntp_seconds: u32) -> DateTime<Utc> {
    let secs = ntp_seconds.wrapping_sub(NTP_TO_UNIX_SECS);
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(i64::from(secs))
}
