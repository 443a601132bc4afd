//! Beacon ranging.
//!
//! Active ranging against known beacon identities, keyed by venue so
//! distinct venues range independently. Venues that share an identity
//! share the hardware session: it stops only when the last of them stops.
//!
//! Ranging callbacks feed the live sequence returned by [`BeaconRanger::readings`].

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::LinearMap;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{MAX_MONITORED_REGIONS, READING_CAPACITY};
use crate::error::Error;
use crate::platform::{BeaconPlatform, RangedBeacon};
use crate::stream::{Dropped, LiveChannel, LiveStream};
use crate::venue::{BeaconIdentity, VenueId};

/// Coarse proximity bucket reported by the ranging service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Proximity {
    Immediate,
    Near,
    Far,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeaconReading {
    pub uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    pub proximity: Proximity,
    /// Meters, negative when unknown.
    pub accuracy: f64,
    pub rssi: i8,
    /// Milliseconds since boot when ranged.
    pub ts: u64,
}

impl BeaconReading {
    fn from_ranged(beacon: &RangedBeacon, ts: u64) -> Self {
        Self {
            uuid: beacon.uuid,
            major: beacon.major,
            minor: beacon.minor,
            proximity: beacon.proximity,
            accuracy: beacon.accuracy,
            rssi: beacon.rssi,
            ts,
        }
    }
}

pub type BeaconReadings<'a> = LiveStream<'a, BeaconReading, READING_CAPACITY>;

type Constraints = LinearMap<VenueId, BeaconIdentity, MAX_MONITORED_REGIONS>;

pub struct BeaconRanger<P> {
    platform: P,
    constraints: Mutex<CriticalSectionRawMutex, RefCell<Constraints>>,
    readings: LiveChannel<BeaconReading, READING_CAPACITY>,
}

impl<P: BeaconPlatform> BeaconRanger<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            constraints: Mutex::new(RefCell::new(LinearMap::new())),
            readings: LiveChannel::new(),
        }
    }

    /// Start ranging `identity` on behalf of `venue_id`. Idempotent per venue.
    pub fn start_ranging(&self, identity: &BeaconIdentity, venue_id: &VenueId) -> Result<(), Error> {
        if !self.platform.is_ranging_available() {
            log::warn!("Beacon ranging unavailable, venue {} not ranged", venue_id);
            return Err(Error::BeaconRangingUnavailable);
        }

        enum Outcome {
            Already,
            Joined,
            Started,
            Full,
        }

        let outcome = self.constraints.lock(|c| {
            let mut c = c.borrow_mut();
            if c.contains_key(venue_id) {
                return Outcome::Already;
            }
            let shared = c.values().any(|existing| existing == identity);
            match c.insert(venue_id.clone(), *identity) {
                Ok(_) if shared => Outcome::Joined,
                Ok(_) => Outcome::Started,
                Err(_) => Outcome::Full,
            }
        });

        match outcome {
            Outcome::Already => Ok(()),
            Outcome::Joined => {
                log::debug!("Venue {} joins ranging of {}", venue_id, identity.uuid);
                Ok(())
            }
            Outcome::Started => {
                self.platform.start_ranging(identity);
                log::info!("Ranging {} for venue {}", identity.uuid, venue_id);
                Ok(())
            }
            Outcome::Full => Err(Error::RegionLimitExceeded {
                max: MAX_MONITORED_REGIONS,
            }),
        }
    }

    /// Stop ranging for `venue_id`. Unknown venues are ignored.
    pub fn stop_ranging(&self, venue_id: &str) {
        let released = self.constraints.lock(|c| {
            let mut c = c.borrow_mut();
            let key = VenueId::try_from(venue_id).ok()?;
            let identity = c.remove(&key)?;
            let still_needed = c.values().any(|other| *other == identity);
            (!still_needed).then_some(identity)
        });

        if let Some(identity) = released {
            self.platform.stop_ranging(&identity);
            log::info!("Stopped ranging {} (venue {})", identity.uuid, venue_id);
        }
    }

    pub fn stop_all(&self) {
        let drained = self.constraints.lock(|c| {
            let mut c = c.borrow_mut();
            let mut unique: heapless::Vec<BeaconIdentity, MAX_MONITORED_REGIONS> = heapless::Vec::new();
            for identity in c.values() {
                if !unique.contains(identity) {
                    let _ = unique.push(*identity);
                }
            }
            c.clear();
            unique
        });

        for identity in &drained {
            self.platform.stop_ranging(identity);
        }
        if !drained.is_empty() {
            log::info!("Stopped all beacon ranging ({} identities)", drained.len());
        }
    }

    pub fn is_ranging(&self, venue_id: &str) -> bool {
        self.constraints.lock(|c| c.borrow().keys().any(|k| k.as_str() == venue_id))
    }

    pub fn ranged_venue_count(&self) -> usize {
        self.constraints.lock(|c| c.borrow().len())
    }

    /// Open the reading sequence, closing any previous consumer.
    pub fn readings(&self) -> BeaconReadings<'_> {
        self.readings.open()
    }

    // ── Platform callbacks ──────────────────────────────────────────

    /// Ranging callback. Beacons outside every active constraint (e.g.
    /// reported after teardown) are dropped.
    pub fn on_ranged_beacons(&self, beacons: &[RangedBeacon]) {
        let ts = crate::timestamp_ms();
        for beacon in beacons {
            let wanted = self.constraints.lock(|c| {
                c.borrow()
                    .values()
                    .any(|identity| identity.matches(&beacon.uuid, beacon.major))
            });
            if !wanted {
                continue;
            }
            if let Err(Dropped::Full) = self.readings.try_push(BeaconReading::from_ranged(beacon, ts)) {
                log::warn!("Beacon reading dropped: consumer behind");
            }
        }
    }

    /// Ranging failed for `identity`. Every venue ranging it is released;
    /// nothing is retried.
    pub fn on_ranging_failed(&self, identity: &BeaconIdentity) {
        let removed = self.constraints.lock(|c| {
            let mut c = c.borrow_mut();
            let before = c.len();
            let keys: heapless::Vec<VenueId, MAX_MONITORED_REGIONS> = c
                .iter()
                .filter(|(_, v)| *v == identity)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                c.remove(key);
            }
            before - c.len()
        });
        log::error!(
            "Ranging failed for {} ({} venues released)",
            identity.uuid,
            removed
        );
    }
}
