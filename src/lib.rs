//! VenueSense library: portable venue proximity detection engine.
//!
//! Detects when a user enters a known venue and then confirms proximity
//! at short range. Coarse detection uses geofences around each venue;
//! once inside, a venue with a declared beacon identity is ranged, and
//! beacon-less venues share one passive broadcast scan whose frames are
//! decoded here.
//!
//! The crate has no platform dependencies. Location, beacon ranging and
//! the bluetooth radio are reached through the port traits in
//! [`platform`]; platform glue (mobile OS bindings, a firmware BLE stack,
//! a simulator) implements them and feeds results back through each
//! component's `on_*` callbacks. Everything is `no_std` with
//! fixed-capacity `heapless` collections.
//!
//! Components, bottom up:
//! - [`frame`]: broadcast UID frame codec and distance estimate.
//! - [`scanner`]: the shared broadcast scan.
//! - [`ranger`]: per-venue beacon ranging.
//! - [`region`]: permissions, one-shot location and geofences.
//! - [`detector`]: the orchestrator producing [`VenueEvent`]s.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod platform;
pub mod ranger;
pub mod region;
pub mod scanner;
pub mod stream;
pub mod venue;

#[cfg(test)]
mod mock;

pub use config::{parse_catalog, Catalog, DetectorConfig};
pub use detector::{VenueDetector, VenueEvents};
pub use error::Error;
pub use frame::BroadcastReading;
pub use ranger::{BeaconRanger, BeaconReading, Proximity};
pub use region::{LocationFix, RegionEvent, RegionMonitor, Transition};
pub use scanner::BroadcastScanner;
pub use stream::LiveStream;
pub use venue::{BeaconIdentity, Venue, VenueEvent, VenueId};

/// Milliseconds since boot, the timestamp carried by readings and events.
pub(crate) fn timestamp_ms() -> u64 {
    embassy_time::Instant::now().as_millis()
}
