//! Narrow capabilities the core needs from the platform: a WiFi radio, a
//! datagram socket, a blocking delay and a wall clock.
//!
//! The std-backed implementations here work on any target with `std::net`
//! sockets, which includes ESP-IDF through lwIP.

use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;

use crate::{error::ConnectionError, model::AccessPoint};

/// A connected, non-blocking datagram association.
pub trait DatagramSocket {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
    /// Polls for one datagram. `Ok(0)` means nothing has arrived yet.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn close(self);
}

/// The radio driver, reduced to what the connector and NTP client use.
pub trait Radio {
    type Socket: DatagramSocket;

    /// Starts associating with `ap`. Does not wait for the link.
    fn associate(&mut self, ap: &AccessPoint) -> Result<(), ConnectionError>;
    fn is_link_up(&mut self) -> bool;
    /// The leased address, once DHCP has granted one.
    fn leased_address(&mut self) -> Option<Ipv4Addr>;
    fn lookup(&mut self, host: &str) -> Result<IpAddr, ConnectionError>;
    fn open_datagram(&mut self, local_port: u16, remote: SocketAddr) -> io::Result<Self::Socket>;
}

/// Name resolution and sockets over an established link.
pub trait Link {
    type Socket: DatagramSocket;

    fn resolve(&mut self, host: &str) -> Result<IpAddr, ConnectionError>;
    fn open_datagram(&mut self, local_port: u16, remote: SocketAddr) -> io::Result<Self::Socket>;
}

pub trait Delay {
    fn delay_ms(&mut self, ms: u64);
}

/// Wall clock that can be stepped by a measured offset.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn adjust(&mut self, offset: TimeDelta);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// System time corrected by an accumulated offset.
///
/// The process never writes the OS clock; it keeps the correction to itself.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: TimeDelta,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            offset: TimeDelta::zero(),
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    fn adjust(&mut self, offset: TimeDelta) {
        self.offset = self.offset + offset;
    }
}

#[derive(Debug)]
pub struct UdpDatagram {
    socket: UdpSocket,
}

impl UdpDatagram {
    pub fn open(local_port: u16, remote: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port))?;
        socket.connect(remote)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl DatagramSocket for UdpDatagram {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn close(self) {
        drop(self.socket);
    }
}

/// Resolves `host` through the platform resolver, preferring IPv4.
pub fn lookup_host(host: &str) -> Result<IpAddr, ConnectionError> {
    let resolve_error = || ConnectionError::Resolve {
        host: host.to_string(),
    };
    let addrs: Vec<SocketAddr> = (host, 0)
        .to_socket_addrs()
        .map_err(|err| {
            debug!("lookup of `{host}` failed: {err}");
            resolve_error()
        })?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(SocketAddr::ip)
        .ok_or_else(resolve_error)
}
