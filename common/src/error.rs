use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to access point")]
    NoLink,
    #[error("could not obtain IP address from access point")]
    NoAddress,
    #[error("not connected to access point")]
    NotConnected,
    #[error("failed to resolve host `{host}`")]
    Resolve { host: String },
    #[error("wifi driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("received unexpected NTP datagram size ({0} bytes)")]
    UnexpectedSize(usize),
    #[error("NTP reply carried no transmit timestamp")]
    NoTimestamp,
    #[error("timeout waiting for NTP datagram reply")]
    NoResponse,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("NTP socket error: {0}")]
    Io(#[from] io::Error),
}
