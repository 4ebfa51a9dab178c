use core::convert::TryInto;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use anyhow::Context;
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop, hal::prelude::Peripherals, log::EspLogger,
    nvs::EspDefaultNvsPartition, sys::EspError, wifi::EspWifi,
};
use log::{debug, info, warn};

use weatherhub_common::{
    lookup_host, AccessPoint, ConnectionError, Controller, Delay, Frame, NetworkConnector,
    NtpClient, Radio, Renderer, RuntimeConfig, SharedState, Snapshot, SystemClock, UdpDatagram,
    WifiStation,
};

const CONTROL_LOOP_STACK_SIZE: usize = 16 * 1024;

/// The station interface of the on-board WiFi driver.
struct EspRadio {
    wifi: EspWifi<'static>,
}

impl Radio for EspRadio {
    type Socket = UdpDatagram;

    fn associate(&mut self, ap: &AccessPoint) -> Result<(), ConnectionError> {
        let auth_method = if ap.passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let client = ClientConfiguration {
            ssid: ap
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| ConnectionError::Driver(format!("ssid `{}` too long", ap.ssid)))?,
            password: ap
                .passphrase
                .as_str()
                .try_into()
                .map_err(|_| ConnectionError::Driver("passphrase too long".into()))?,
            auth_method,
            ..Default::default()
        };

        if self.wifi.is_started().map_err(driver)? {
            if let Err(err) = self.wifi.disconnect() {
                debug!("disconnect before joining `{}` failed: {err}", ap.ssid);
            }
        }
        self.wifi
            .set_configuration(&Configuration::Client(client))
            .map_err(driver)?;
        if !self.wifi.is_started().map_err(driver)? {
            self.wifi.start().map_err(driver)?;
        }
        info!("joining `{}`", ap.ssid);
        self.wifi.connect().map_err(driver)
    }

    fn is_link_up(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn leased_address(&mut self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    fn lookup(&mut self, host: &str) -> Result<IpAddr, ConnectionError> {
        lookup_host(host)
    }

    fn open_datagram(&mut self, local_port: u16, remote: SocketAddr) -> io::Result<UdpDatagram> {
        UdpDatagram::open(local_port, remote)
    }
}

fn driver(err: EspError) -> ConnectionError {
    ConnectionError::Driver(err.to_string())
}

/// Yields to the scheduler instead of spinning.
struct RtosDelay;

impl Delay for RtosDelay {
    fn delay_ms(&mut self, ms: u64) {
        FreeRtos::delay_ms(u32::try_from(ms).unwrap_or(u32::MAX));
    }
}

struct LogRenderer;

impl Renderer for LogRenderer {
    fn render(&mut self, snapshot: &Snapshot) {
        info!(
            "[{}] {}",
            snapshot.status.as_str(),
            Frame::from_snapshot(snapshot).summary()
        );
    }
}

/// Credentials baked in at build time, if any.
fn builtin_config() -> RuntimeConfig {
    let mut runtime = RuntimeConfig::default();
    if let Some(ssid) = option_env!("WIFI_SSID") {
        let pass = option_env!("WIFI_PASS").unwrap_or_default();
        runtime
            .network
            .access_points
            .push(AccessPoint::new(ssid, pass));
    }
    runtime.sanitize();
    runtime
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let runtime = builtin_config();
    if runtime.network.access_points.is_empty() {
        warn!("built without WIFI_SSID; the clock will wait in CONNECTING");
    }
    info!(
        "config: {} access points, servers {:?}, utc offset {}s",
        runtime.network.access_points.len(),
        runtime.ntp.servers,
        runtime.ntp.utc_offset_secs,
    );

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))
        .context("failed to initialize wifi driver")?;

    let state = SharedState::new();
    let network = NetworkConnector::new(EspRadio { wifi }, RtosDelay, state.clone());
    let ntp = NtpClient::new(
        runtime.ntp.clone(),
        state.clone(),
        SystemClock::new(),
        RtosDelay,
    );
    let controller = Controller::new(
        WifiStation::new(network, ntp),
        LogRenderer,
        RtosDelay,
        state,
        runtime.network.access_points,
        runtime.tick_interval_ms,
    );

    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(CONTROL_LOOP_STACK_SIZE)
        .spawn(move || controller.run())
        .context("failed to spawn control loop")?;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
