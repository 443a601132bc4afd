//! Platform capability ports.
//!
//! Each component drives the hardware through one of these traits and is
//! fed back through its own `on_*` callback methods. Adapters (mobile OS
//! bindings, a trouble-host BLE stack on firmware, a simulator) implement
//! the traits and call the callbacks from whatever thread their platform
//! uses. Trait methods must not block.

use uuid::Uuid;

use crate::ranger::Proximity;
use crate::venue::{BeaconIdentity, CircularRegion};

/// Location permission level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    NotDetermined,
    Restricted,
    Denied,
    /// Foreground only. Region wake-ups need [`Authorized`](Self::Authorized).
    AuthorizedWhenInUse,
    /// Foreground and background.
    Authorized,
}

/// Containment answer to a region state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Inside,
    Outside,
    Unknown,
}

/// Bluetooth radio power state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    /// `Unknown` and `Resetting` are transient; every other state is final
    /// until the next callback.
    pub fn is_settled(self) -> bool {
        !matches!(self, RadioState::Unknown | RadioState::Resetting)
    }
}

/// One beacon as reported by a ranging callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangedBeacon {
    pub uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    pub proximity: Proximity,
    /// Accuracy estimate in meters, negative when unknown.
    pub accuracy: f64,
    pub rssi: i8,
}

/// Permission service plus location service.
pub trait LocationPlatform {
    fn authorization_status(&self) -> AuthorizationStatus;
    fn request_when_in_use_authorization(&self);
    fn request_always_authorization(&self);

    /// One-shot fix; answered by `on_location` / `on_location_failed`.
    fn request_location(&self);

    /// Largest region radius the platform will monitor, meters.
    fn maximum_region_radius(&self) -> f64;
    fn start_monitoring(&self, region: &CircularRegion);
    fn stop_monitoring(&self, identifier: &str);
    /// Answered by `on_region_state`.
    fn request_state(&self, identifier: &str);

    fn start_significant_location_changes(&self);
    fn stop_significant_location_changes(&self);
}

/// Beacon ranging service.
pub trait BeaconPlatform {
    fn is_ranging_available(&self) -> bool;
    fn start_ranging(&self, identity: &BeaconIdentity);
    fn stop_ranging(&self, identity: &BeaconIdentity);
}

/// Passive BLE scanning service.
pub trait RadioPlatform {
    /// Bring up the radio manager; the platform answers with a power-state
    /// callback.
    fn activate(&self);
    /// Scan for advertisements carrying the given 16-bit service UUID.
    fn start_scan(&self, service_uuid: u16);
    fn stop_scan(&self);
}

impl<T: LocationPlatform + ?Sized> LocationPlatform for &T {
    fn authorization_status(&self) -> AuthorizationStatus {
        (**self).authorization_status()
    }
    fn request_when_in_use_authorization(&self) {
        (**self).request_when_in_use_authorization()
    }
    fn request_always_authorization(&self) {
        (**self).request_always_authorization()
    }
    fn request_location(&self) {
        (**self).request_location()
    }
    fn maximum_region_radius(&self) -> f64 {
        (**self).maximum_region_radius()
    }
    fn start_monitoring(&self, region: &CircularRegion) {
        (**self).start_monitoring(region)
    }
    fn stop_monitoring(&self, identifier: &str) {
        (**self).stop_monitoring(identifier)
    }
    fn request_state(&self, identifier: &str) {
        (**self).request_state(identifier)
    }
    fn start_significant_location_changes(&self) {
        (**self).start_significant_location_changes()
    }
    fn stop_significant_location_changes(&self) {
        (**self).stop_significant_location_changes()
    }
}

impl<T: BeaconPlatform + ?Sized> BeaconPlatform for &T {
    fn is_ranging_available(&self) -> bool {
        (**self).is_ranging_available()
    }
    fn start_ranging(&self, identity: &BeaconIdentity) {
        (**self).start_ranging(identity)
    }
    fn stop_ranging(&self, identity: &BeaconIdentity) {
        (**self).stop_ranging(identity)
    }
}

impl<T: RadioPlatform + ?Sized> RadioPlatform for &T {
    fn activate(&self) {
        (**self).activate()
    }
    fn start_scan(&self, service_uuid: u16) {
        (**self).start_scan(service_uuid)
    }
    fn stop_scan(&self) {
        (**self).stop_scan()
    }
}
