pub mod config;
pub mod connectivity;
pub mod controller;
pub mod error;
pub mod model;
pub mod ntp;
pub mod view;
pub mod wifi;

pub use config::{NetworkConfig, NtpConfig, RuntimeConfig};
pub use connectivity::{
    lookup_host, Clock, DatagramSocket, Delay, Link, Radio, SystemClock, ThreadDelay, UdpDatagram,
};
pub use controller::{Action, Controller, Event, Station, WifiStation};
pub use error::{ConnectionError, SyncError};
pub use model::{AccessPoint, SharedState, Snapshot, Status};
pub use ntp::NtpClient;
pub use view::{Frame, Renderer};
pub use wifi::NetworkConnector;
