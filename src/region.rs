//! Region monitoring: permission escalation, one-shot location fixes and
//! geofence transitions under the platform's region ceiling.
//!
//! Every suspension here waits on a platform callback. Callbacks are plain
//! synchronous methods (`on_*`) that update state under the monitor's lock
//! and release the matching waiter; they are safe to call from any thread
//! and tolerate arriving after teardown.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};
use heapless::Vec;

use crate::config::{
    DEFAULT_LOCATION_TIMEOUT, DEFAULT_REGION_START_TIMEOUT, MAX_MONITORED_REGIONS,
    REGION_EVENT_CAPACITY,
};
use crate::error::Error;
use crate::platform::{AuthorizationStatus, LocationPlatform, RegionState};
use crate::stream::{Dropped, LiveChannel, LiveStream};
use crate::venue::{Coordinate, MonitoredVenue, VenueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Entered,
    Exited,
}

/// A geofence boundary crossing (or initial containment) for one venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionEvent {
    pub transition: Transition,
    pub venue_id: VenueId,
    /// Milliseconds since boot.
    pub ts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub coordinate: Coordinate,
    /// Meters.
    pub horizontal_accuracy: f64,
    pub ts: u64,
}

pub type RegionEvents<'a> = LiveStream<'a, RegionEvent, REGION_EVENT_CAPACITY>;

#[derive(Default)]
struct MonitorState {
    monitored: Vec<VenueId, MAX_MONITORED_REGIONS>,
    /// Region whose start confirmation is being awaited.
    pending_start: Option<VenueId>,
    permission_pending: bool,
    location_pending: bool,
    significant_changes: bool,
}

type SharedState = Mutex<CriticalSectionRawMutex, RefCell<MonitorState>>;

/// Clears a pending-request flag when the request future completes or is
/// dropped.
struct PendingGuard<'a> {
    state: &'a SharedState,
    clear: fn(&mut MonitorState),
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.state.lock(|s| (self.clear)(&mut s.borrow_mut()));
    }
}

/// A region start awaiting confirmation. Dropped while the region is still
/// pending (timeout or cancelled caller), it withdraws the region from the
/// platform.
struct PendingStart<'a, P: LocationPlatform> {
    monitor: &'a RegionMonitor<P>,
    id: VenueId,
}

impl<P: LocationPlatform> Drop for PendingStart<'_, P> {
    fn drop(&mut self) {
        let withdraw = self.monitor.state.lock(|s| {
            let mut s = s.borrow_mut();
            let pending = s.pending_start.as_ref() == Some(&self.id);
            if pending {
                s.pending_start = None;
            }
            pending
        });
        if withdraw {
            self.monitor.platform.stop_monitoring(&self.id);
            log::debug!("Withdrew unconfirmed region {}", self.id);
        }
    }
}

pub struct RegionMonitor<P> {
    platform: P,
    start_timeout: Option<Duration>,
    state: SharedState,
    authorization: Signal<CriticalSectionRawMutex, AuthorizationStatus>,
    location: Signal<CriticalSectionRawMutex, Result<LocationFix, Error>>,
    started: Signal<CriticalSectionRawMutex, (VenueId, Result<(), Error>)>,
    events: LiveChannel<RegionEvent, REGION_EVENT_CAPACITY>,
}

impl<P: LocationPlatform> RegionMonitor<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            start_timeout: Some(DEFAULT_REGION_START_TIMEOUT),
            state: Mutex::new(RefCell::new(MonitorState::default())),
            authorization: Signal::new(),
            location: Signal::new(),
            started: Signal::new(),
            events: LiveChannel::new(),
        }
    }

    /// Bound on the wait for a region-start confirmation. `None` waits
    /// for the platform indefinitely.
    pub fn with_start_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.start_timeout = timeout;
        self
    }

    // ── Permission ──────────────────────────────────────────────────

    /// Escalate location permission by one step.
    ///
    /// Not determined: ask for foreground access. Foreground granted: ask
    /// for background access. Any other status is returned as is. When a
    /// prompt is issued this waits for the permission-change callback.
    pub async fn request_permission(&self) -> Result<AuthorizationStatus, Error> {
        let _guard = self.acquire(
            |s| &mut s.permission_pending,
            |s| s.permission_pending = false,
        )?;

        let status = self.platform.authorization_status();
        match status {
            AuthorizationStatus::NotDetermined => {
                log::info!("Requesting foreground location permission");
                self.authorization.reset();
                self.platform.request_when_in_use_authorization();
            }
            AuthorizationStatus::AuthorizedWhenInUse => {
                log::info!("Escalating to background location permission");
                self.authorization.reset();
                self.platform.request_always_authorization();
            }
            other => return Ok(other),
        }

        let status = self.authorization.wait().await;
        log::info!("Location permission now {:?}", status);
        Ok(status)
    }

    // ── One-shot location ───────────────────────────────────────────

    /// One-shot fix with the default 10 s timeout.
    pub async fn current_location(&self) -> Result<LocationFix, Error> {
        self.current_location_within(DEFAULT_LOCATION_TIMEOUT).await
    }

    /// One-shot fix. Only one fetch may be outstanding: a second call
    /// fails with [`Error::RequestPending`] and leaves the first intact.
    pub async fn current_location_within(&self, timeout: Duration) -> Result<LocationFix, Error> {
        self.check_authorization()?;
        let _guard = self.acquire(
            |s| &mut s.location_pending,
            |s| s.location_pending = false,
        )?;

        self.location.reset();
        self.platform.request_location();

        match with_timeout(timeout, self.location.wait()).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("Location fix timed out after {} ms", timeout.as_millis());
                Err(Error::Timeout)
            }
        }
    }

    // ── Region monitoring ───────────────────────────────────────────

    /// Register `venue`'s region and wait for the platform to confirm.
    ///
    /// On confirmation the region's current containment is queried so a
    /// user already inside gets an `Entered` without crossing a boundary.
    pub async fn start_monitoring(&self, venue: &MonitoredVenue) -> Result<(), Error> {
        self.check_authorization()?;
        let id = venue.id().clone();

        enum Reserve {
            Reserved,
            Already,
            Full,
            Busy,
        }

        let reserve = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.monitored.contains(&id) {
                Reserve::Already
            } else if s.monitored.len() >= MAX_MONITORED_REGIONS {
                Reserve::Full
            } else if s.pending_start.is_some() {
                Reserve::Busy
            } else {
                s.pending_start = Some(id.clone());
                Reserve::Reserved
            }
        });

        match reserve {
            Reserve::Reserved => {}
            Reserve::Already => return Ok(()),
            Reserve::Full => {
                log::warn!("Region limit reached, not monitoring {}", id);
                return Err(Error::RegionLimitExceeded {
                    max: MAX_MONITORED_REGIONS,
                });
            }
            Reserve::Busy => return Err(Error::RequestPending),
        }
        let _pending = PendingStart {
            monitor: self,
            id: id.clone(),
        };

        self.started.reset();
        self.platform.start_monitoring(&venue.region);

        let outcome = match self.start_timeout {
            Some(timeout) => match with_timeout(timeout, self.start_confirmation(&id)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::warn!("No start confirmation for region {}, withdrawing", id);
                    Err(Error::Timeout)
                }
            },
            None => self.start_confirmation(&id).await,
        };
        outcome?;

        let added = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.pending_start = None;
            s.monitored.push(id.clone()).is_ok()
        });
        if !added {
            // The slot was checked at reservation; only a concurrent
            // registration through another path could take it.
            self.platform.stop_monitoring(&id);
            return Err(Error::RegionLimitExceeded {
                max: MAX_MONITORED_REGIONS,
            });
        }

        log::info!(
            "Monitoring region {} (r={} m)",
            id,
            venue.region.radius
        );
        self.platform.request_state(&id);
        Ok(())
    }

    async fn start_confirmation(&self, id: &VenueId) -> Result<(), Error> {
        loop {
            let (confirmed, outcome) = self.started.wait().await;
            if confirmed == *id {
                return outcome;
            }
        }
    }

    /// Stop monitoring `venue_id`. A registration still awaiting its
    /// confirmation is withdrawn and fails with
    /// [`Error::RegionMonitoringFailed`].
    pub fn stop_monitoring(&self, venue_id: &str) {
        enum Removed {
            Active,
            Pending(VenueId),
            Unknown,
        }

        let removed = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if let Some(i) = s.monitored.iter().position(|m| m.as_str() == venue_id) {
                s.monitored.swap_remove(i);
                return Removed::Active;
            }
            if s.pending_start.as_ref().is_some_and(|p| p.as_str() == venue_id) {
                if let Some(id) = s.pending_start.take() {
                    return Removed::Pending(id);
                }
            }
            Removed::Unknown
        });

        match removed {
            Removed::Active => {
                self.platform.stop_monitoring(venue_id);
                log::info!("Stopped monitoring region {}", venue_id);
            }
            Removed::Pending(id) => {
                self.platform.stop_monitoring(&id);
                log::info!("Withdrew region {} before confirmation", id);
                self.started
                    .signal((id.clone(), Err(Error::RegionMonitoringFailed(id))));
            }
            Removed::Unknown => {}
        }
    }

    /// Stop every region, including one still awaiting confirmation.
    pub fn stop_all(&self) {
        let (monitored, pending) = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            (core::mem::take(&mut s.monitored), s.pending_start.take())
        });

        for id in &monitored {
            self.platform.stop_monitoring(id);
        }
        if let Some(id) = pending {
            self.platform.stop_monitoring(&id);
            self.started
                .signal((id.clone(), Err(Error::RegionMonitoringFailed(id))));
        }
        if !monitored.is_empty() {
            log::info!("Stopped monitoring {} regions", monitored.len());
        }
    }

    pub fn is_monitoring(&self, venue_id: &str) -> bool {
        self.state
            .lock(|s| s.borrow().monitored.iter().any(|m| m.as_str() == venue_id))
    }

    pub fn monitored_count(&self) -> usize {
        self.state.lock(|s| s.borrow().monitored.len())
    }

    pub fn maximum_region_radius(&self) -> f64 {
        self.platform.maximum_region_radius()
    }

    // ── Significant-change mode ─────────────────────────────────────

    /// Low-power movement monitoring. Produces no events; it keeps the
    /// process eligible for background wake-ups.
    pub fn start_significant_changes(&self) {
        let start = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            !core::mem::replace(&mut s.significant_changes, true)
        });
        if start {
            self.platform.start_significant_location_changes();
            log::debug!("Significant-change monitoring on");
        }
    }

    pub fn stop_significant_changes(&self) {
        let stop = self
            .state
            .lock(|s| core::mem::replace(&mut s.borrow_mut().significant_changes, false));
        if stop {
            self.platform.stop_significant_location_changes();
            log::debug!("Significant-change monitoring off");
        }
    }

    /// Open the transition sequence, closing any previous consumer.
    pub fn events(&self) -> RegionEvents<'_> {
        self.events.open()
    }

    // ── Platform callbacks ──────────────────────────────────────────

    pub fn on_authorization_changed(&self, status: AuthorizationStatus) {
        let waiting = self.state.lock(|s| s.borrow().permission_pending);
        if waiting {
            self.authorization.signal(status);
        }
        log::debug!("Authorization changed: {:?}", status);
    }

    pub fn on_location(&self, coordinate: Coordinate, horizontal_accuracy: f64) {
        if self.state.lock(|s| s.borrow().location_pending) {
            self.location.signal(Ok(LocationFix {
                coordinate,
                horizontal_accuracy,
                ts: crate::timestamp_ms(),
            }));
        }
    }

    pub fn on_location_failed(&self) {
        if self.state.lock(|s| s.borrow().location_pending) {
            self.location.signal(Err(Error::LocationUnavailable));
        }
    }

    pub fn on_monitoring_started(&self, venue_id: &str) {
        let pending = self.state.lock(|s| {
            s.borrow()
                .pending_start
                .clone()
                .filter(|p| p.as_str() == venue_id)
        });
        if let Some(id) = pending {
            self.started.signal((id, Ok(())));
        }
    }

    /// Monitoring failed for `venue_id` (`None` when the platform does not
    /// say which region). Fails a pending registration, or drops an
    /// already monitored region without retrying it.
    pub fn on_monitoring_failed(&self, venue_id: Option<&str>) {
        enum Failure {
            Pending(VenueId),
            Active(VenueId),
            Unknown,
        }

        let failure = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let pending_matches = match (&s.pending_start, venue_id) {
                (Some(p), Some(id)) => p.as_str() == id,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if pending_matches {
                if let Some(p) = s.pending_start.take() {
                    return Failure::Pending(p);
                }
            }
            if let Some(id) = venue_id {
                if let Some(i) = s.monitored.iter().position(|m| m.as_str() == id) {
                    return Failure::Active(s.monitored.swap_remove(i));
                }
            }
            Failure::Unknown
        });

        match failure {
            Failure::Pending(id) => {
                log::warn!("Region monitoring failed to start for {}", id);
                self.started
                    .signal((id.clone(), Err(Error::RegionMonitoringFailed(id))));
            }
            Failure::Active(id) => {
                log::error!("Region monitoring failed for {}, region dropped", id);
            }
            Failure::Unknown => {
                log::debug!("Monitoring failure for unknown region {:?}", venue_id);
            }
        }
    }

    pub fn on_region_entered(&self, venue_id: &str) {
        self.emit(Transition::Entered, venue_id);
    }

    pub fn on_region_exited(&self, venue_id: &str) {
        self.emit(Transition::Exited, venue_id);
    }

    /// Answer to a state query. Only containment produces an event:
    /// leaving is reported through `on_region_exited`.
    pub fn on_region_state(&self, venue_id: &str, state: RegionState) {
        if state == RegionState::Inside {
            self.emit(Transition::Entered, venue_id);
        }
    }

    fn emit(&self, transition: Transition, venue_id: &str) {
        if !self.is_monitoring(venue_id) {
            log::debug!("{:?} for unmonitored region {} ignored", transition, venue_id);
            return;
        }
        let Ok(venue_id) = VenueId::try_from(venue_id) else {
            return;
        };
        let event = RegionEvent {
            transition,
            venue_id,
            ts: crate::timestamp_ms(),
        };
        if let Err(Dropped::Full) = self.events.try_push(event) {
            log::warn!("Region event dropped: consumer behind");
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn check_authorization(&self) -> Result<(), Error> {
        match self.platform.authorization_status() {
            AuthorizationStatus::Denied => Err(Error::PermissionDenied),
            AuthorizationStatus::Restricted => Err(Error::PermissionRestricted),
            _ => Ok(()),
        }
    }

    fn acquire(
        &self,
        flag: fn(&mut MonitorState) -> &mut bool,
        clear: fn(&mut MonitorState),
    ) -> Result<PendingGuard<'_>, Error> {
        let acquired = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let pending = flag(&mut s);
            !core::mem::replace(pending, true)
        });
        if !acquired {
            return Err(Error::RequestPending);
        }
        Ok(PendingGuard {
            state: &self.state,
            clear,
        })
    }
}
