use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    thread,
};

use anyhow::Context;
use tracing::{debug, info, warn};

use weatherhub_common::{
    lookup_host, AccessPoint, ConnectionError, Controller, Frame, NetworkConnector, NtpClient,
    Radio, Renderer, RuntimeConfig, SharedState, Snapshot, SystemClock, ThreadDelay, UdpDatagram,
    WifiStation,
};

const DEFAULT_CONFIG_PATH: &str = "weatherhub.json";
// Connecting a UDP socket sends nothing; it only asks the OS for a route.
const ROUTE_PROBE: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 0, 2, 1), 9);

/// Stands in for the WiFi coprocessor on a machine the OS already networks.
#[derive(Debug, Default)]
struct HostRadio {
    joined: Option<String>,
}

impl Radio for HostRadio {
    type Socket = UdpDatagram;

    fn associate(&mut self, ap: &AccessPoint) -> Result<(), ConnectionError> {
        debug!("host link is managed by the OS; joining `{}` is a no-op", ap.ssid);
        self.joined = Some(ap.ssid.clone());
        Ok(())
    }

    fn is_link_up(&mut self) -> bool {
        self.joined.is_some()
    }

    fn leased_address(&mut self) -> Option<Ipv4Addr> {
        match route_address() {
            Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => Some(ip),
            Ok(_) => None,
            Err(err) => {
                debug!("no route to the internet: {err}");
                None
            }
        }
    }

    fn lookup(&mut self, host: &str) -> Result<IpAddr, ConnectionError> {
        lookup_host(host)
    }

    fn open_datagram(&mut self, local_port: u16, remote: SocketAddr) -> io::Result<UdpDatagram> {
        UdpDatagram::open(local_port, remote)
    }
}

fn route_address() -> io::Result<IpAddr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(ROUTE_PROBE)?;
    Ok(probe.local_addr()?.ip())
}

/// Logs each frame in place of the LED matrix.
struct LogRenderer;

impl Renderer for LogRenderer {
    fn render(&mut self, snapshot: &Snapshot) {
        let frame = Frame::from_snapshot(snapshot);
        info!(status = snapshot.status.as_str(), "{}", frame.summary());
        match serde_json::to_string(&frame) {
            Ok(json) => debug!("frame {json}"),
            Err(err) => warn!("frame serialization failed: {err}"),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = std::env::var("WEATHERHUB_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut runtime = load_runtime_config(&path).unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    if let Ok(ssid) = std::env::var("WIFI_SSID") {
        let pass = std::env::var("WIFI_PASS").unwrap_or_default();
        runtime
            .network
            .access_points
            .insert(0, AccessPoint::new(ssid, pass));
    }
    runtime.sanitize();

    info!(
        "config loaded: {} access points, servers {:?}, utc offset {}s",
        runtime.network.access_points.len(),
        runtime.ntp.servers,
        runtime.ntp.utc_offset_secs,
    );

    let state = SharedState::new();
    let network = NetworkConnector::new(HostRadio::default(), ThreadDelay, state.clone());
    let ntp = NtpClient::new(
        runtime.ntp.clone(),
        state.clone(),
        SystemClock::new(),
        ThreadDelay,
    );
    let controller = Controller::new(
        WifiStation::new(network, ntp),
        LogRenderer,
        ThreadDelay,
        state,
        runtime.network.access_points,
        runtime.tick_interval_ms,
    );

    thread::Builder::new()
        .name("control-loop".into())
        .spawn(move || controller.run())
        .context("failed to spawn control loop")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    Ok(())
}

fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("no config at {}, using defaults", path.display());
            return Ok(RuntimeConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
