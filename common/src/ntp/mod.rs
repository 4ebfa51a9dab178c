//! NTP client that corrects the local clock and republishes it to the
//! shared snapshot.

mod datagram;

use std::net::SocketAddr;

use chrono::{DateTime, FixedOffset, Offset, TimeDelta, Utc};
use log::{debug, info, warn};

pub use datagram::{unix_time, Datagram, Request, Response, DATAGRAM_SIZE};

use crate::{
    config::NtpConfig,
    connectivity::{Clock, DatagramSocket, Delay, Link},
    error::SyncError,
    model::SharedState,
};

const REPLY_POLL_MS: u64 = 5;
const REPLY_TIMEOUT_MS: u64 = 2_000;

/// True when `span` has elapsed since `since`, or when `since` was never set.
pub fn is_expired(at: DateTime<Utc>, since: Option<DateTime<Utc>>, span: TimeDelta) -> bool {
    since.map_or(true, |since| at - since >= span)
}

/// Index of the server to use for the given retry count.
pub fn server_index(retry_count: u32, server_count: usize) -> usize {
    retry_count as usize % server_count
}

pub struct NtpClient<C, D> {
    config: NtpConfig,
    zone: FixedOffset,
    state: SharedState,
    clock: C,
    delay: D,
    last_fetch: Option<DateTime<Utc>>,
    last_publish: Option<DateTime<Utc>>,
    datagram: Datagram,
}

impl<C: Clock, D: Delay> NtpClient<C, D> {
    pub fn new(mut config: NtpConfig, state: SharedState, clock: C, delay: D) -> Self {
        config.sanitize();
        let zone = FixedOffset::east_opt(config.utc_offset_secs).unwrap_or_else(|| {
            warn!(
                "UTC offset {}s out of range, publishing UTC",
                config.utc_offset_secs
            );
            Utc.fix()
        });
        Self {
            config,
            zone,
            state,
            clock,
            delay,
            last_fetch: None,
            last_publish: None,
            datagram: Datagram::new(),
        }
    }

    /// Fetches from a server and/or publishes the clock, whichever is due.
    ///
    /// A failed fetch returns before anything is published or recorded.
    pub fn sync<L: Link>(&mut self, link: &mut L) -> Result<(), SyncError> {
        let (fetch_due, publish_due) = self.expirations(self.clock.now());

        // Fetches are rare; between them the local clock keeps time.
        if fetch_due {
            self.fetch(link)?;
        }
        if publish_due {
            self.publish();
        }
        Ok(())
    }

    fn expirations(&self, at: DateTime<Utc>) -> (bool, bool) {
        let fetch_interval = millis(self.config.fetch_interval_ms);
        let publish_interval = millis(self.config.publish_interval_ms);
        (
            is_expired(at, self.last_fetch, fetch_interval),
            is_expired(at, self.last_publish, publish_interval),
        )
    }

    fn fetch<L: Link>(&mut self, link: &mut L) -> Result<(), SyncError> {
        let retry_count = self.state.peek().retry_count;
        let index = server_index(retry_count, self.config.servers.len());
        let host = &self.config.servers[index];

        let ip = link.resolve(host)?;
        let remote = SocketAddr::new(ip, self.config.remote_port);
        debug!("requesting time from `{host}` ({remote})");

        let mut socket = link.open_datagram(self.config.local_port, remote)?;
        let reply = self.request(&mut socket);
        socket.close();
        let server_time = reply?;

        let offset = server_time - self.clock.now();
        self.clock.adjust(offset);
        self.last_fetch = Some(self.clock.now());
        info!(
            "clock corrected by {}ms from `{}`",
            offset.num_milliseconds(),
            self.config.servers[index]
        );
        Ok(())
    }

    fn request<S: DatagramSocket>(&mut self, socket: &mut S) -> Result<DateTime<Utc>, SyncError> {
        socket.send(self.datagram.request(self.config.leap_smear).as_bytes())?;

        let buf = self.datagram.reply_buffer();
        for _ in 0..REPLY_TIMEOUT_MS / REPLY_POLL_MS {
            self.delay.delay_ms(REPLY_POLL_MS);
            match socket.receive(buf)? {
                0 => continue,
                DATAGRAM_SIZE => {
                    return self
                        .datagram
                        .response()
                        .transmit_time()
                        .ok_or(SyncError::NoTimestamp)
                }
                n => return Err(SyncError::UnexpectedSize(n)),
            }
        }
        Err(SyncError::NoResponse)
    }

    fn publish(&mut self) {
        let now = self.clock.now();
        self.last_publish = Some(now);
        let local = now.with_timezone(&self.zone);
        self.state.write(move |s| s.time = Some(local));
    }
}

fn millis(ms: u64) -> TimeDelta {
    TimeDelta::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        collections::VecDeque,
        io::{self, ErrorKind},
        net::{IpAddr, Ipv4Addr},
        rc::Rc,
    };

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{error::ConnectionError, wifi::tests::RecordingDelay};

    struct ManualClock {
        now: DateTime<Utc>,
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.now
        }

        fn adjust(&mut self, offset: TimeDelta) {
            self.now = self.now + offset;
        }
    }

    #[derive(Default)]
    struct Wire {
        opened: Vec<(u16, SocketAddr)>,
        sent: Vec<Vec<u8>>,
        closed: usize,
    }

    struct ScriptedSocket {
        wire: Rc<RefCell<Wire>>,
        replies: VecDeque<io::Result<Vec<u8>>>,
    }

    impl DatagramSocket for ScriptedSocket {
        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.wire.borrow_mut().sent.push(buf.to_vec());
            Ok(buf.len())
        }

        fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.replies.pop_front() {
                None => Ok(0),
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(err)) => Err(err),
            }
        }

        fn close(self) {
            self.wire.borrow_mut().closed += 1;
        }
    }

    #[derive(Default)]
    struct FakeLink {
        wire: Rc<RefCell<Wire>>,
        resolved: Vec<String>,
        offline: bool,
        replies: Vec<io::Result<Vec<u8>>>,
    }

    impl Link for FakeLink {
        type Socket = ScriptedSocket;

        fn resolve(&mut self, host: &str) -> Result<IpAddr, ConnectionError> {
            self.resolved.push(host.to_string());
            if self.offline {
                return Err(ConnectionError::NotConnected);
            }
            Ok(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)))
        }

        fn open_datagram(&mut self, local_port: u16, remote: SocketAddr) -> io::Result<ScriptedSocket> {
            self.wire.borrow_mut().opened.push((local_port, remote));
            Ok(ScriptedSocket {
                wire: self.wire.clone(),
                replies: self.replies.drain(..).collect(),
            })
        }
    }

    fn reply_at(server_time: DateTime<Utc>) -> Vec<u8> {
        let ntp_seconds = (server_time.timestamp() + 2_208_988_800) as u32;
        let mut bytes = vec![0u8; DATAGRAM_SIZE];
        bytes[0] = 0b0010_0100;
        bytes[40..44].copy_from_slice(&ntp_seconds.to_be_bytes());
        bytes
    }

    fn boot_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 5).unwrap()
    }

    fn server_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 18, 30, 0).unwrap()
    }

    fn client(state: &SharedState) -> NtpClient<ManualClock, RecordingDelay> {
        NtpClient::new(
            NtpConfig::default(),
            state.clone(),
            ManualClock { now: boot_time() },
            RecordingDelay::default(),
        )
    }

    #[test]
    fn never_synced_is_always_expired() {
        let now = server_time();
        assert!(is_expired(now, None, TimeDelta::hours(6)));
        assert!(is_expired(now, None, TimeDelta::days(36_500)));
    }

    #[test]
    fn expiration_boundary_is_inclusive() {
        let now = server_time();
        let span = TimeDelta::seconds(1);

        assert!(is_expired(now, Some(now - span), span));
        assert!(!is_expired(now, Some(now - span + TimeDelta::nanoseconds(1)), span));
        assert!(!is_expired(now, Some(now), span));
    }

    #[test]
    fn server_rotation_follows_retry_count() {
        let servers = 3;
        let picked: Vec<usize> = (0..=2 * servers as u32)
            .map(|retry| server_index(retry, servers))
            .collect();

        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn first_sync_fetches_and_publishes_local_time() {
        let state = SharedState::new();
        let mut ntp = client(&state);
        let mut link = FakeLink {
            replies: vec![Ok(reply_at(server_time()))],
            ..FakeLink::default()
        };

        ntp.sync(&mut link).unwrap();

        assert_eq!(link.resolved, vec!["us.pool.ntp.org"]);
        let remote: SocketAddr = "203.0.113.9:123".parse().unwrap();
        let wire = link.wire.borrow();
        assert_eq!(wire.opened, vec![(2390_u16, remote)]);
        assert_eq!(wire.sent.len(), 1);
        assert_eq!(wire.sent[0][..4], [0b1110_0011_u8, 0, 6, 0xEC]);
        assert_eq!(wire.closed, 1);

        assert_eq!(ntp.clock.now(), server_time());
        assert_eq!(ntp.last_fetch, Some(server_time()));
        assert_eq!(ntp.delay.delays, vec![5]);

        let (changed, snapshot) = state.read();
        let published = snapshot.time.unwrap();
        assert!(changed);
        assert_eq!(published, server_time());
        assert_eq!(published.offset().local_minus_utc(), -6 * 3_600);
        assert_eq!(published.to_rfc3339(), "2024-03-09T12:30:00-06:00");
    }

    #[test]
    fn publishes_once_per_interval_without_refetching() {
        let state = SharedState::new();
        let mut ntp = client(&state);
        let mut link = FakeLink {
            replies: vec![Ok(reply_at(server_time()))],
            ..FakeLink::default()
        };
        ntp.sync(&mut link).unwrap();
        state.read();

        ntp.clock.now = server_time() + TimeDelta::milliseconds(999);
        ntp.sync(&mut link).unwrap();
        assert!(!state.read().0);

        ntp.clock.now = server_time() + TimeDelta::seconds(1);
        ntp.sync(&mut link).unwrap();
        let (changed, snapshot) = state.read();
        assert!(changed);
        assert_eq!(snapshot.time.unwrap(), server_time() + TimeDelta::seconds(1));

        assert_eq!(link.resolved.len(), 1);
    }

    #[test]
    fn refetches_after_fetch_interval() {
        let state = SharedState::new();
        let mut ntp = client(&state);
        let mut link = FakeLink {
            replies: vec![Ok(reply_at(server_time()))],
            ..FakeLink::default()
        };
        ntp.sync(&mut link).unwrap();

        let later = server_time() + TimeDelta::hours(6);
        ntp.clock.now = later - TimeDelta::seconds(3);
        link.replies = vec![Ok(reply_at(later))];
        ntp.sync(&mut link).unwrap();

        assert_eq!(link.resolved.len(), 1);

        ntp.clock.now = later + TimeDelta::seconds(4);
        link.replies = vec![Ok(reply_at(later + TimeDelta::seconds(1)))];
        ntp.sync(&mut link).unwrap();

        assert_eq!(link.resolved.len(), 2);
        assert_eq!(ntp.clock.now(), later + TimeDelta::seconds(1));
    }

    #[test]
    fn retry_count_selects_next_server() {
        let state = SharedState::new();
        state.modify(|s| s.retry_count = 3);
        let mut ntp = client(&state);
        let mut link = FakeLink {
            replies: vec![Ok(reply_at(server_time()))],
            ..FakeLink::default()
        };

        ntp.sync(&mut link).unwrap();

        assert_eq!(link.resolved, vec!["time.google.com"]);
    }

    #[test]
    fn resolution_failure_commits_nothing() {
        let state = SharedState::new();
        let mut ntp = client(&state);
        let mut link = FakeLink {
            offline: true,
            ..FakeLink::default()
        };

        let err = ntp.sync(&mut link).unwrap_err();

        assert!(matches!(
            err,
            SyncError::Connection(ConnectionError::NotConnected)
        ));
        assert_eq!(ntp.last_fetch, None);
        assert_eq!(ntp.clock.now(), boot_time());
        assert!(link.wire.borrow().opened.is_empty());
        assert!(!state.read().0);
    }

    #[test]
    fn silent_server_times_out_after_two_seconds() {
        let state = SharedState::new();
        let mut ntp = client(&state);
        let mut link = FakeLink::default();

        let err = ntp.sync(&mut link).unwrap_err();

        assert!(matches!(err, SyncError::NoResponse));
        assert_eq!(ntp.delay.delays.len(), 400);
        assert!(ntp.delay.delays.iter().all(|&ms| ms == 5));
        assert_eq!(link.wire.borrow().closed, 1);
        assert!(!state.read().0);
    }

    #[test]
    fn short_reply_is_rejected() {
        let state = SharedState::new();
        let mut ntp = client(&state);
        let mut link = FakeLink {
            replies: vec![Ok(vec![0u8; 47])],
            ..FakeLink::default()
        };

        let err = ntp.sync(&mut link).unwrap_err();

        assert!(matches!(err, SyncError::UnexpectedSize(47)));
        assert_eq!(ntp.last_fetch, None);
    }

    #[test]
    fn oversized_reply_is_rejected() {
        let state = SharedState::new();
        let mut ntp = client(&state);
        let mut reply = reply_at(server_time());
        reply.resize(60, 0);
        let mut link = FakeLink {
            replies: vec![Ok(reply)],
            ..FakeLink::default()
        };

        let err = ntp.sync(&mut link).unwrap_err();

        assert!(matches!(err, SyncError::UnexpectedSize(60)));
        assert_eq!(ntp.clock.now(), boot_time());
        assert!(!state.read().0);
    }

    #[test]
    fn zero_transmit_timestamp_leaves_clock_alone() {
        let state = SharedState::new();
        let mut ntp = client(&state);
        let mut link = FakeLink {
            replies: vec![Ok(vec![0u8; DATAGRAM_SIZE])],
            ..FakeLink::default()
        };

        let err = ntp.sync(&mut link).unwrap_err();

        assert!(matches!(err, SyncError::NoTimestamp));
        assert_eq!(ntp.clock.now(), boot_time());
        assert_eq!(ntp.last_fetch, None);
        assert!(!state.read().0);
    }

    #[test]
    fn read_error_is_surfaced_immediately() {
        let state = SharedState::new();
        let mut ntp = client(&state);
        let mut link = FakeLink {
            replies: vec![Err(io::Error::new(ErrorKind::ConnectionRefused, "refused"))],
            ..FakeLink::default()
        };

        let err = ntp.sync(&mut link).unwrap_err();

        assert!(matches!(err, SyncError::Io(ref e) if e.kind() == ErrorKind::ConnectionRefused));
        assert_eq!(ntp.delay.delays, vec![5]);
        assert_eq!(link.wire.borrow().closed, 1);
    }

    #[test]
    fn out_of_range_offset_publishes_utc() {
        let state = SharedState::new();
        let config = NtpConfig {
            utc_offset_secs: 90_000,
            ..NtpConfig::default()
        };
        let ntp = NtpClient::new(
            config,
            state,
            ManualClock { now: boot_time() },
            RecordingDelay::default(),
        );

        assert_eq!(ntp.zone.local_minus_utc(), 0);
    }
}
