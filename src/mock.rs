//! Recording platform doubles for unit tests.

use std::sync::Mutex;
use std::vec::Vec;

use crate::platform::{AuthorizationStatus, BeaconPlatform, LocationPlatform, RadioPlatform};
use crate::venue::{BeaconIdentity, CircularRegion, VenueId};

/// Yield to the other joined futures until `cond` holds.
pub async fn until(cond: impl Fn() -> bool) {
    while !cond() {
        embassy_futures::yield_now().await;
    }
}

fn id(s: &str) -> VenueId {
    VenueId::try_from(s).unwrap()
}

// ── Location ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum LocationCall {
    RequestWhenInUse,
    RequestAlways,
    RequestLocation,
    StartMonitoring(VenueId),
    StopMonitoring(VenueId),
    RequestState(VenueId),
    StartSignificantChanges,
    StopSignificantChanges,
}

pub struct MockLocation {
    status: Mutex<AuthorizationStatus>,
    max_radius: f64,
    calls: Mutex<Vec<LocationCall>>,
}

impl MockLocation {
    pub fn new(status: AuthorizationStatus) -> Self {
        Self {
            status: Mutex::new(status),
            max_radius: 1_000.0,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn authorized() -> Self {
        Self::new(AuthorizationStatus::Authorized)
    }

    pub fn calls(&self) -> Vec<LocationCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called(&self, call: &LocationCall) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    pub fn count(&self, call: &LocationCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    /// Regions registered, in order.
    pub fn started_regions(&self) -> Vec<VenueId> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                LocationCall::StartMonitoring(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count_starts(&self) -> usize {
        self.started_regions().len()
    }

    fn record(&self, call: LocationCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl LocationPlatform for MockLocation {
    fn authorization_status(&self) -> AuthorizationStatus {
        *self.status.lock().unwrap()
    }
    fn request_when_in_use_authorization(&self) {
        self.record(LocationCall::RequestWhenInUse);
    }
    fn request_always_authorization(&self) {
        self.record(LocationCall::RequestAlways);
    }
    fn request_location(&self) {
        self.record(LocationCall::RequestLocation);
    }
    fn maximum_region_radius(&self) -> f64 {
        self.max_radius
    }
    fn start_monitoring(&self, region: &CircularRegion) {
        self.record(LocationCall::StartMonitoring(region.identifier.clone()));
    }
    fn stop_monitoring(&self, identifier: &str) {
        self.record(LocationCall::StopMonitoring(id(identifier)));
    }
    fn request_state(&self, identifier: &str) {
        self.record(LocationCall::RequestState(id(identifier)));
    }
    fn start_significant_location_changes(&self) {
        self.record(LocationCall::StartSignificantChanges);
    }
    fn stop_significant_location_changes(&self) {
        self.record(LocationCall::StopSignificantChanges);
    }
}

// ── Beacons ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BeaconCall {
    Start(BeaconIdentity),
    Stop(BeaconIdentity),
}

pub struct MockBeacons {
    available: bool,
    calls: Mutex<Vec<BeaconCall>>,
}

impl MockBeacons {
    pub fn available() -> Self {
        Self {
            available: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<BeaconCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: BeaconCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }
}

impl BeaconPlatform for MockBeacons {
    fn is_ranging_available(&self) -> bool {
        self.available
    }
    fn start_ranging(&self, identity: &BeaconIdentity) {
        self.calls.lock().unwrap().push(BeaconCall::Start(*identity));
    }
    fn stop_ranging(&self, identity: &BeaconIdentity) {
        self.calls.lock().unwrap().push(BeaconCall::Stop(*identity));
    }
}

// ── Radio ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCall {
    Activate,
    StartScan(u16),
    StopScan,
}

pub struct MockRadio {
    calls: Mutex<Vec<RadioCall>>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called(&self, call: RadioCall) -> bool {
        self.calls.lock().unwrap().contains(&call)
    }

    pub fn count(&self, call: RadioCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }
}

impl RadioPlatform for MockRadio {
    fn activate(&self) {
        self.calls.lock().unwrap().push(RadioCall::Activate);
    }
    fn start_scan(&self, service_uuid: u16) {
        self.calls.lock().unwrap().push(RadioCall::StartScan(service_uuid));
    }
    fn stop_scan(&self) {
        self.calls.lock().unwrap().push(RadioCall::StopScan);
    }
}
