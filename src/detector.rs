//! Venue detection orchestrator.
//!
//! [`VenueDetector`] ties the three sensors together. Geofence transitions
//! from the [`RegionMonitor`] drive a per-venue state machine
//! (`outside -> inside -> outside`); entering a venue starts the proximity
//! strategy it needs (dedicated beacon ranging, or the one shared broadcast
//! scan) and exiting stops it again. Beacon and broadcast readings are
//! attributed to inside venues and forwarded as [`VenueEvent`]s on one
//! output sequence.
//!
//! All session state is owned by the [`run`](VenueDetector::run) worker,
//! which the host spawns once. [`start`](VenueDetector::start) and
//! [`stop`](VenueDetector::stop) are commands to that worker; the query
//! methods read a snapshot it publishes after every change.

use core::cell::RefCell;

use embassy_futures::select::{select, select3, select4, Either, Either3, Either4};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::with_timeout;
use heapless::Vec;

use crate::config::{
    DetectorConfig, EVENT_CAPACITY, MAX_MONITORED_REGIONS, TRANSITION_HEADROOM,
};
use crate::frame::BroadcastReading;
use crate::platform::{BeaconPlatform, LocationPlatform, RadioPlatform};
use crate::ranger::{BeaconRanger, BeaconReading};
use crate::region::{RegionEvent, RegionMonitor, Transition};
use crate::scanner::BroadcastScanner;
use crate::stream::{Dropped, LiveChannel, LiveStream};
use crate::venue::{BeaconIdentity, MonitoredVenue, Venue, VenueEvent, VenueId};

pub type VenueEvents<'a> = LiveStream<'a, VenueEvent, EVENT_CAPACITY>;

pub type VenueIds = Vec<VenueId, MAX_MONITORED_REGIONS>;

// ── Session state ───────────────────────────────────────────────────

/// How proximity is detected while inside a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Ranging(BeaconIdentity),
    Broadcast,
}

/// Venue map and inside set of one detection session.
#[derive(Default)]
struct DetectorState {
    venues: Vec<MonitoredVenue, MAX_MONITORED_REGIONS>,
    inside: VenueIds,
}

impl DetectorState {
    /// Derive monitored venues in input order. Duplicate ids keep the
    /// first entry; anything past the region ceiling is ignored.
    fn new(venues: &[Venue], max_radius: f64) -> Self {
        let mut state = Self::default();
        for venue in venues {
            if state.venue(&venue.id).is_some() {
                log::warn!("Duplicate venue '{}' ignored", venue.id);
                continue;
            }
            if state.venues.push(MonitoredVenue::new(venue, max_radius)).is_err() {
                break;
            }
        }
        state
    }

    fn venue(&self, id: &str) -> Option<&MonitoredVenue> {
        self.venues.iter().find(|v| v.id().as_str() == id)
    }

    fn is_inside(&self, id: &str) -> bool {
        self.inside.iter().any(|v| v.as_str() == id)
    }

    /// Mark `id` inside. `None` when it is unknown or already inside.
    fn enter(&mut self, id: &VenueId) -> Option<Strategy> {
        if self.is_inside(id) {
            return None;
        }
        let strategy = strategy_for(self.venue(id)?);
        self.inside.push(id.clone()).ok()?;
        Some(strategy)
    }

    /// Mark `id` outside. `None` when it was not inside.
    fn exit(&mut self, id: &str) -> Option<Strategy> {
        let i = self.inside.iter().position(|v| v.as_str() == id)?;
        self.inside.remove(i);
        self.venue(id).map(strategy_for)
    }

    /// Whether any inside venue still relies on the shared broadcast scan.
    fn needs_broadcast_scan(&self) -> bool {
        self.broadcast_venues_inside().next().is_some()
    }

    fn broadcast_venues_inside(&self) -> impl Iterator<Item = &VenueId> + '_ {
        self.inside
            .iter()
            .filter(move |id| self.venue(id).is_some_and(MonitoredVenue::uses_broadcast))
    }

    /// The inside venue whose declared beacon identity covers `reading`.
    fn venue_for_beacon(&self, reading: &BeaconReading) -> Option<&VenueId> {
        self.inside.iter().find(|id| {
            self.venue(id)
                .and_then(|v| v.beacon)
                .is_some_and(|b| b.matches(&reading.uuid, reading.major))
        })
    }
}

fn strategy_for(venue: &MonitoredVenue) -> Strategy {
    match venue.beacon {
        Some(identity) => Strategy::Ranging(identity),
        None => Strategy::Broadcast,
    }
}

/// What the query methods see.
struct Snapshot {
    running: bool,
    inside: VenueIds,
    monitored: usize,
}

impl Snapshot {
    const fn new() -> Self {
        Self {
            running: false,
            inside: Vec::new(),
            monitored: 0,
        }
    }
}

enum Command {
    Start(Vec<Venue, MAX_MONITORED_REGIONS>),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Stopped,
    Disconnected,
}

// ── Detector ────────────────────────────────────────────────────────

pub struct VenueDetector<'a, L, B, R> {
    monitor: &'a RegionMonitor<L>,
    ranger: &'a BeaconRanger<B>,
    scanner: &'a BroadcastScanner<R>,
    config: DetectorConfig,
    commands: Channel<CriticalSectionRawMutex, Command, 2>,
    /// Acknowledges a stop command once teardown is complete.
    stopped: Signal<CriticalSectionRawMutex, ()>,
    snapshot: Mutex<CriticalSectionRawMutex, RefCell<Snapshot>>,
    output: LiveChannel<VenueEvent, EVENT_CAPACITY>,
}

impl<'a, L, B, R> VenueDetector<'a, L, B, R>
where
    L: LocationPlatform,
    B: BeaconPlatform,
    R: RadioPlatform,
{
    pub fn new(
        monitor: &'a RegionMonitor<L>,
        ranger: &'a BeaconRanger<B>,
        scanner: &'a BroadcastScanner<R>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            monitor,
            ranger,
            scanner,
            config,
            commands: Channel::new(),
            stopped: Signal::new(),
            snapshot: Mutex::new(RefCell::new(Snapshot::new())),
            output: LiveChannel::new(),
        }
    }

    /// Start detecting `venues` and return the event sequence.
    ///
    /// Only the first [`MAX_MONITORED_REGIONS`] venues are monitored. On a
    /// running detector this returns a handle on the existing sequence and
    /// registers nothing.
    pub async fn start(&self, venues: &[Venue]) -> VenueEvents<'_> {
        let already = self.snapshot.lock(|s| {
            let mut s = s.borrow_mut();
            core::mem::replace(&mut s.running, true)
        });
        if already {
            log::warn!("Venue detection already running");
            return self.output.attach();
        }

        let events = self.output.open();
        if venues.len() > MAX_MONITORED_REGIONS {
            log::warn!(
                "{} venues given, monitoring the first {}",
                venues.len(),
                MAX_MONITORED_REGIONS
            );
        }
        let batch: Vec<Venue, MAX_MONITORED_REGIONS> =
            venues.iter().take(MAX_MONITORED_REGIONS).cloned().collect();
        self.commands.send(Command::Start(batch)).await;
        events
    }

    /// Stop detection and wait until every sensor is torn down. No-op
    /// when not running.
    pub async fn stop(&self) {
        if !self.is_running() {
            log::debug!("Venue detection not running, stop ignored");
            return;
        }
        self.stopped.reset();
        self.commands.send(Command::Stop).await;
        self.stopped.wait().await;
    }

    pub fn is_running(&self) -> bool {
        self.snapshot.lock(|s| s.borrow().running)
    }

    pub fn inside_venues(&self) -> VenueIds {
        self.snapshot.lock(|s| s.borrow().inside.clone())
    }

    /// Venues in the current session's venue map.
    pub fn monitored_count(&self) -> usize {
        self.snapshot.lock(|s| s.borrow().monitored)
    }

    // ── Worker ──────────────────────────────────────────────────────

    /// The detector's worker. Spawn once; never returns.
    pub async fn run(&self) -> ! {
        loop {
            match self.commands.receive().await {
                Command::Start(venues) => {
                    let end = self.session(&venues).await;
                    self.teardown();
                    if end == End::Stopped {
                        self.stopped.signal(());
                    }
                }
                Command::Stop => self.stopped.signal(()),
            }
        }
    }

    async fn session(&self, venues: &[Venue]) -> End {
        // Sources first, so nothing reported during registration is lost.
        let mut regions = Some(self.monitor.events());
        let mut beacons = Some(self.ranger.readings());
        let mut frames = Some(self.scanner.readings());

        let mut state = DetectorState::new(venues, self.monitor.maximum_region_radius());
        self.publish(&state);

        match select3(
            self.register(&state),
            self.stop_requested(),
            self.output.disconnected(),
        )
        .await
        {
            Either3::First(()) => {}
            Either3::Second(()) => return End::Stopped,
            Either3::Third(()) => {
                log::info!("Event consumer gone during registration");
                return End::Disconnected;
            }
        }

        loop {
            let next = select4(
                self.stop_requested(),
                self.output.disconnected(),
                next_item(&mut regions),
                select(next_item(&mut beacons), next_item(&mut frames)),
            )
            .await;

            match next {
                Either4::First(()) => return End::Stopped,
                Either4::Second(()) => {
                    log::info!("Event consumer gone, stopping venue detection");
                    return End::Disconnected;
                }
                Either4::Third(event) => self.on_region_event(&mut state, event).await,
                Either4::Fourth(Either::First(reading)) => self.on_beacon(&state, reading),
                Either4::Fourth(Either::Second(reading)) => self.on_frame(&state, reading),
            }
        }
    }

    /// Register every venue in order. Failures leave that venue
    /// unmonitored and do not stop the others.
    async fn register(&self, state: &DetectorState) {
        for venue in &state.venues {
            if let Err(e) = self.monitor.start_monitoring(venue).await {
                log::warn!("Venue {} not monitored: {}", venue.id(), e);
            }
        }
        self.monitor.start_significant_changes();
        log::info!(
            "Venue detection running: {}/{} regions monitored",
            self.monitor.monitored_count(),
            state.venues.len()
        );
    }

    async fn stop_requested(&self) {
        loop {
            match self.commands.receive().await {
                Command::Stop => return,
                Command::Start(_) => log::warn!("Start during an active session ignored"),
            }
        }
    }

    fn teardown(&self) {
        self.monitor.stop_all();
        self.monitor.stop_significant_changes();
        self.ranger.stop_all();
        self.scanner.stop_scanning();
        self.output.close();
        self.snapshot.lock(|s| *s.borrow_mut() = Snapshot::new());
        log::info!("Venue detection stopped");
    }

    // ── Event handling ──────────────────────────────────────────────

    async fn on_region_event(&self, state: &mut DetectorState, event: RegionEvent) {
        let RegionEvent {
            transition,
            venue_id,
            ts,
        } = event;

        match transition {
            Transition::Entered => {
                let Some(strategy) = state.enter(&venue_id) else {
                    log::debug!("Entry into {} ignored (already inside or unknown)", venue_id);
                    return;
                };
                self.publish(state);
                self.emit(VenueEvent::Entered {
                    venue_id: venue_id.clone(),
                    ts,
                });

                match strategy {
                    Strategy::Ranging(identity) => {
                        if let Err(e) = self.ranger.start_ranging(&identity, &venue_id) {
                            log::warn!("No beacon detection for {}: {}", venue_id, e);
                        }
                    }
                    Strategy::Broadcast => self.ensure_broadcast_scan().await,
                }
            }
            Transition::Exited => {
                let Some(strategy) = state.exit(&venue_id) else {
                    log::debug!("Exit from {} ignored (not inside)", venue_id);
                    return;
                };
                self.publish(state);
                self.emit(VenueEvent::Exited {
                    venue_id: venue_id.clone(),
                    ts,
                });

                match strategy {
                    Strategy::Ranging(_) => self.ranger.stop_ranging(&venue_id),
                    Strategy::Broadcast if !state.needs_broadcast_scan() => {
                        self.scanner.stop_scanning();
                    }
                    Strategy::Broadcast => {}
                }
            }
        }
    }

    async fn ensure_broadcast_scan(&self) {
        if self.scanner.is_scanning() {
            return;
        }
        let start = self
            .scanner
            .start_scanning(self.config.namespace_filter.as_slice());
        match with_timeout(self.config.radio_power_timeout, start).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Broadcast scan unavailable: {}", e),
            Err(_) => log::warn!(
                "Radio power state not reported within {} ms",
                self.config.radio_power_timeout.as_millis()
            ),
        }
    }

    fn on_beacon(&self, state: &DetectorState, reading: BeaconReading) {
        if let Some(venue_id) = state.venue_for_beacon(&reading) {
            self.emit(VenueEvent::BeaconDetected {
                venue_id: venue_id.clone(),
                reading,
            });
        }
    }

    /// Broadcast frames carry no venue address: every inside beacon-less
    /// venue gets a copy.
    fn on_frame(&self, state: &DetectorState, reading: BroadcastReading) {
        for venue_id in state.broadcast_venues_inside() {
            self.emit(VenueEvent::BleFrameDetected {
                venue_id: venue_id.clone(),
                reading: reading.clone(),
            });
        }
    }

    /// Readings stay clear of the transition headroom; a transition is
    /// only lost once the whole buffer is full.
    fn emit(&self, event: VenueEvent) {
        let transition = matches!(
            event,
            VenueEvent::Entered { .. } | VenueEvent::Exited { .. }
        );
        if transition {
            if let Err(Dropped::Full) = self.output.try_push(event) {
                log::error!("Venue transition dropped: consumer behind");
            }
        } else if let Err(Dropped::Full) =
            self.output.try_push_keeping(event, TRANSITION_HEADROOM)
        {
            log::warn!("Venue reading dropped: consumer behind");
        }
    }

    fn publish(&self, state: &DetectorState) {
        self.snapshot.lock(|s| {
            let mut s = s.borrow_mut();
            s.inside = state.inside.clone();
            s.monitored = state.venues.len();
        });
    }
}

/// Next item of `source`. Once the source ends this never resolves.
async fn next_item<T, const N: usize>(source: &mut Option<LiveStream<'_, T, N>>) -> T {
    if let Some(stream) = source {
        if let Some(item) = stream.next().await {
            return item;
        }
        *source = None;
        log::debug!("Detector source closed");
    }
    core::future::pending().await
}
