use log::{info, warn};

use crate::{
    connectivity::{Clock, Delay, Radio},
    error::{ConnectionError, SyncError},
    model::{AccessPoint, SharedState, Status},
    ntp::NtpClient,
    view::Renderer,
    wifi::NetworkConnector,
};

/// Whether the tick's read found the snapshot changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Entered,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Nothing,
    Transition(Status),
    /// Try each access point in order until one connects.
    ConnectAny,
    /// Reset the retry count, then sync.
    StartSync,
    /// Bump the retry count, then sync.
    RetrySync,
    /// Sync, demoting on failure.
    KeepSync,
}

/// The state machine table: what to do in `status` on `event`.
pub fn plan(status: Status, event: Event) -> Action {
    match (status, event) {
        (Status::Idle | Status::Disconnected, Event::Entered) => {
            Action::Transition(Status::Connecting)
        }
        (Status::Connecting, Event::Entered) => Action::ConnectAny,
        (Status::Unsynchronized, Event::Entered) => Action::StartSync,
        (Status::Unsynchronized, Event::Unchanged) => Action::RetrySync,
        (Status::Synchronized, _) => Action::KeepSync,
        (Status::Idle | Status::Disconnected | Status::Connecting, Event::Unchanged) => {
            Action::Nothing
        }
    }
}

/// Operations the controller drives.
#[cfg_attr(test, mockall::automock)]
pub trait Station {
    fn connect(&mut self, ap: &AccessPoint) -> Result<(), ConnectionError>;
    fn sync(&mut self) -> Result<(), SyncError>;
}

/// A network connector and NTP client sharing one radio.
pub struct WifiStation<R, C, D> {
    network: NetworkConnector<R, D>,
    ntp: NtpClient<C, D>,
}

impl<R, C, D> WifiStation<R, C, D> {
    pub fn new(network: NetworkConnector<R, D>, ntp: NtpClient<C, D>) -> Self {
        Self { network, ntp }
    }
}

impl<R: Radio, C: Clock, D: Delay> Station for WifiStation<R, C, D> {
    fn connect(&mut self, ap: &AccessPoint) -> Result<(), ConnectionError> {
        self.network.connect(ap)
    }

    fn sync(&mut self) -> Result<(), SyncError> {
        self.ntp.sync(&mut self.network)
    }
}

pub struct Controller<S, V, D> {
    station: S,
    renderer: V,
    delay: D,
    state: SharedState,
    access_points: Vec<AccessPoint>,
    tick_interval_ms: u64,
}

impl<S: Station, V: Renderer, D: Delay> Controller<S, V, D> {
    pub fn new(
        station: S,
        renderer: V,
        delay: D,
        state: SharedState,
        access_points: Vec<AccessPoint>,
        tick_interval_ms: u64,
    ) -> Self {
        Self {
            station,
            renderer,
            delay,
            state,
            access_points,
            tick_interval_ms,
        }
    }

    /// Puts the machine in its initial state, skipping `Idle`.
    pub fn start(&self) {
        if self.access_points.is_empty() {
            warn!("no access points configured");
        }
        self.state.write(|s| s.status = Status::Disconnected);
    }

    /// Runs the loop forever, one tick per interval.
    pub fn run(mut self) -> ! {
        self.start();
        loop {
            self.tick();
            self.delay.delay_ms(self.tick_interval_ms);
        }
    }

    /// One iteration: redraw and enter on change, otherwise idle.
    pub fn tick(&mut self) {
        let (changed, snapshot) = self.state.read();
        let event = if changed {
            self.renderer.render(&snapshot);
            Event::Entered
        } else {
            Event::Unchanged
        };
        self.perform(plan(snapshot.status, event));
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::Nothing => {}
            Action::Transition(status) => self.transition(status),
            Action::ConnectAny => self.connect_any(),
            Action::StartSync => {
                self.state.modify(|s| s.retry_count = 0);
                self.sync_or_stay();
            }
            Action::RetrySync => {
                self.state
                    .modify(|s| s.retry_count = s.retry_count.saturating_add(1));
                self.sync_or_stay();
            }
            Action::KeepSync => {
                if let Err(err) = self.station.sync() {
                    warn!("time sync lost: {err}");
                    self.transition(Status::Unsynchronized);
                }
            }
        }
    }

    fn transition(&self, status: Status) {
        info!("entering {}", status.as_str());
        self.state.write(move |s| s.status = status);
    }

    fn connect_any(&mut self) {
        if self.access_points.is_empty() {
            return;
        }
        for ap in &self.access_points {
            match self.station.connect(ap) {
                Ok(()) => {
                    self.transition(Status::Unsynchronized);
                    return;
                }
                Err(err) => warn!("{}: {err}", ap.ssid),
            }
        }
        warn!(
            "none of {} access points reachable, retrying",
            self.access_points.len()
        );
        // Re-enter Connecting so the next tick walks the list again.
        self.transition(Status::Connecting);
    }

    fn sync_or_stay(&mut self) {
        match self.station.sync() {
            Ok(()) => self.transition(Status::Synchronized),
            Err(err) => warn!("time sync failed: {err}"),
        }
    }
}
