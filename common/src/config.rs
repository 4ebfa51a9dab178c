use serde::{Deserialize, Serialize};

use crate::model::AccessPoint;

pub const DEFAULT_SERVERS: [&str; 2] = ["us.pool.ntp.org", "time.google.com"];
pub const DEFAULT_REMOTE_PORT: u16 = 123;
pub const DEFAULT_LOCAL_PORT: u16 = 2390;
pub const DEFAULT_UTC_OFFSET_SECS: i32 = -6 * 60 * 60;
pub const DEFAULT_FETCH_INTERVAL_MS: u64 = 6 * 60 * 60 * 1_000;
pub const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 1_000;
// Only Google's servers smear leap seconds.
pub const DEFAULT_LEAP_SMEAR: bool = false;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NtpConfig {
    pub servers: Vec<String>,
    pub remote_port: u16,
    pub local_port: u16,
    pub utc_offset_secs: i32,
    /// How often to correct the clock against a server.
    pub fetch_interval_ms: u64,
    /// How often to copy the corrected clock into the snapshot.
    pub publish_interval_ms: u64,
    pub leap_smear: bool,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_SERVERS.iter().map(|s| s.to_string()).collect(),
            remote_port: DEFAULT_REMOTE_PORT,
            local_port: DEFAULT_LOCAL_PORT,
            utc_offset_secs: DEFAULT_UTC_OFFSET_SECS,
            fetch_interval_ms: DEFAULT_FETCH_INTERVAL_MS,
            publish_interval_ms: DEFAULT_PUBLISH_INTERVAL_MS,
            leap_smear: DEFAULT_LEAP_SMEAR,
        }
    }
}

impl NtpConfig {
    /// Restores defaults for anything left unset.
    ///
    /// The leap-smear flag describes the default servers, so it is reset
    /// together with them.
    pub fn sanitize(&mut self) {
        self.servers.retain(|server| !server.trim().is_empty());
        if self.servers.is_empty() {
            self.servers = DEFAULT_SERVERS.iter().map(|s| s.to_string()).collect();
            self.leap_smear = DEFAULT_LEAP_SMEAR;
        }
        if self.remote_port == 0 {
            self.remote_port = DEFAULT_REMOTE_PORT;
        }
        if self.local_port == 0 {
            self.local_port = DEFAULT_LOCAL_PORT;
        }
        if self.utc_offset_secs == 0 {
            self.utc_offset_secs = DEFAULT_UTC_OFFSET_SECS;
        }
        if self.fetch_interval_ms == 0 {
            self.fetch_interval_ms = DEFAULT_FETCH_INTERVAL_MS;
        }
        if self.publish_interval_ms == 0 {
            self.publish_interval_ms = DEFAULT_PUBLISH_INTERVAL_MS;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Candidates in order of preference.
    pub access_points: Vec<AccessPoint>,
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.access_points.retain(|ap| !ap.ssid.is_empty());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    pub ntp: NtpConfig,
    pub tick_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            ntp: NtpConfig::default(),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.network.sanitize();
        self.ntp.sanitize();
        if self.tick_interval_ms == 0 {
            self.tick_interval_ms = DEFAULT_TICK_INTERVAL_MS;
        }
    }
}
