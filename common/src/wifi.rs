use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use log::{debug, info};

use crate::{
    connectivity::{Delay, Link, Radio},
    error::ConnectionError,
    model::{AccessPoint, SharedState},
};

const BACKOFF_BASE_MS: u64 = 125;
const BACKOFF_MAX_ATTEMPTS: u32 = 8;

/// Polls `ready` up to eight times, sleeping 125 ms after the first failed
/// poll and doubling the sleep after each one after that.
///
/// Returns whether `ready` ever reported success.
pub fn wait_with_backoff<D, F>(delay: &mut D, mut ready: F) -> bool
where
    D: Delay + ?Sized,
    F: FnMut() -> bool,
{
    let mut timeout_ms = BACKOFF_BASE_MS;
    for attempt in 1..=BACKOFF_MAX_ATTEMPTS {
        if ready() {
            return true;
        }
        debug!("not ready after poll {attempt}/{BACKOFF_MAX_ATTEMPTS}, waiting {timeout_ms}ms");
        delay.delay_ms(timeout_ms);
        timeout_ms <<= 1;
    }
    false
}

/// Brings the radio up against one access point at a time.
pub struct NetworkConnector<R, D> {
    radio: R,
    delay: D,
    state: SharedState,
}

impl<R: Radio, D: Delay> NetworkConnector<R, D> {
    pub fn new(radio: R, delay: D, state: SharedState) -> Self {
        Self {
            radio,
            delay,
            state,
        }
    }

    /// Associates with `ap` and waits for the link and a DHCP lease.
    ///
    /// Blocks for at most one backoff budget per wait. On success the access
    /// point and address are written to the shared snapshot.
    pub fn connect(&mut self, ap: &AccessPoint) -> Result<(), ConnectionError> {
        info!("connecting to `{}`", ap.ssid);
        self.radio.associate(ap)?;

        let radio = &mut self.radio;
        if !wait_with_backoff(&mut self.delay, || radio.is_link_up()) {
            return Err(ConnectionError::NoLink);
        }

        let mut leased = None;
        let radio = &mut self.radio;
        let granted = wait_with_backoff(&mut self.delay, || {
            leased = radio.leased_address();
            leased.is_some()
        });
        let address = match leased {
            Some(address) if granted => address,
            _ => return Err(ConnectionError::NoAddress),
        };

        info!("connected to `{}` with address {address}", ap.ssid);
        let ap = ap.clone();
        self.state.write(move |s| {
            s.access_point = Some(ap);
            s.address = Some(address);
        });
        Ok(())
    }

    fn current_address(&mut self) -> Option<Ipv4Addr> {
        if self.radio.is_link_up() {
            self.radio.leased_address()
        } else {
            None
        }
    }
}

impl<R: Radio, D: Delay> Link for NetworkConnector<R, D> {
    type Socket = R::Socket;

    fn resolve(&mut self, host: &str) -> Result<IpAddr, ConnectionError> {
        if self.current_address().is_none() {
            return Err(ConnectionError::NotConnected);
        }
        self.radio.lookup(host)
    }

    fn open_datagram(&mut self, local_port: u16, remote: SocketAddr) -> io::Result<Self::Socket> {
        self.radio.open_datagram(local_port, remote)
    }
}
