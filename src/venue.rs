//! Venue data model and the consumer-facing event type.

use heapless::String;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::BroadcastReading;
use crate::ranger::BeaconReading;

/// Maximum length of a venue identifier (region identifier on the platform).
pub const VENUE_ID_LEN: usize = 48;

pub type VenueId = String<VENUE_ID_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Short-range beacon identity a venue is equipped with. `major: None`
/// ranges every major under the proximity UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconIdentity {
    pub uuid: Uuid,
    #[serde(default)]
    pub major: Option<u16>,
}

impl BeaconIdentity {
    pub fn matches(&self, uuid: &Uuid, major: u16) -> bool {
        self.uuid == *uuid && self.major.map_or(true, |m| m == major)
    }
}

/// A venue as handed over by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: VenueId,
    pub latitude: f64,
    pub longitude: f64,
    /// Geofence radius in meters.
    pub radius: f64,
    #[serde(default)]
    pub beacon: Option<BeaconIdentity>,
}

impl Venue {
    /// Coordinates on the globe and a positive radius.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.radius > 0.0
            && !self.id.is_empty()
    }

    pub fn center(&self) -> Coordinate {
        Coordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Circular geofence registered with the location platform.
#[derive(Debug, Clone, PartialEq)]
pub struct CircularRegion {
    pub identifier: VenueId,
    pub center: Coordinate,
    pub radius: f64,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
}

/// A venue under active monitoring, with its derived region.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredVenue {
    pub venue: Venue,
    pub region: CircularRegion,
    pub beacon: Option<BeaconIdentity>,
}

impl MonitoredVenue {
    /// Derive the monitored form of `venue`. The radius is clamped to
    /// `max_radius` when the platform reports a positive maximum.
    pub fn new(venue: &Venue, max_radius: f64) -> Self {
        let mut radius = venue.radius.max(0.0);
        if max_radius > 0.0 {
            radius = radius.min(max_radius);
        }
        Self {
            venue: venue.clone(),
            region: CircularRegion {
                identifier: venue.id.clone(),
                center: venue.center(),
                radius,
                notify_on_entry: true,
                notify_on_exit: true,
            },
            beacon: venue.beacon,
        }
    }

    pub fn id(&self) -> &VenueId {
        &self.venue.id
    }

    /// Beacon-less venues rely on the shared broadcast scan.
    pub fn uses_broadcast(&self) -> bool {
        self.beacon.is_none()
    }
}

/// Everything the detector reports downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum VenueEvent {
    #[serde(rename = "entered")]
    Entered { venue_id: VenueId, ts: u64 },
    #[serde(rename = "exited")]
    Exited { venue_id: VenueId, ts: u64 },
    #[serde(rename = "beacon")]
    BeaconDetected {
        venue_id: VenueId,
        reading: BeaconReading,
    },
    #[serde(rename = "ble_frame")]
    BleFrameDetected {
        venue_id: VenueId,
        reading: BroadcastReading,
    },
}

impl VenueEvent {
    pub fn venue_id(&self) -> &VenueId {
        match self {
            VenueEvent::Entered { venue_id, .. }
            | VenueEvent::Exited { venue_id, .. }
            | VenueEvent::BeaconDetected { venue_id, .. }
            | VenueEvent::BleFrameDetected { venue_id, .. } => venue_id,
        }
    }

    /// Serialize as one NDJSON line into `buf`. Returns the written length,
    /// `None` if the buffer is too small.
    pub fn to_ndjson(&self, buf: &mut [u8]) -> Option<usize> {
        let len = serde_json_core::to_slice(self, buf).ok()?;
        if len < buf.len() {
            buf[len] = b'\n';
            Some(len + 1)
        } else {
            Some(len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue(radius: f64) -> Venue {
        Venue {
            id: VenueId::try_from("arena").unwrap(),
            latitude: 40.4406,
            longitude: -79.9959,
            radius,
            beacon: None,
        }
    }

    #[test]
    fn radius_clamped_to_platform_maximum() {
        let mv = MonitoredVenue::new(&venue(5_000.0), 1_000.0);
        assert_eq!(mv.region.radius, 1_000.0);
        assert_eq!(mv.region.identifier.as_str(), "arena");
        assert!(mv.region.notify_on_entry && mv.region.notify_on_exit);
    }

    #[test]
    fn radius_kept_when_platform_reports_no_maximum() {
        let mv = MonitoredVenue::new(&venue(250.0), -1.0);
        assert_eq!(mv.region.radius, 250.0);
    }

    #[test]
    fn beacon_identity_major_is_optional() {
        let uuid = Uuid::from_u128(0xE2C56DB5_DFFB_48D2_B060_D0F5A71096E0);
        let any_major = BeaconIdentity { uuid, major: None };
        let one_major = BeaconIdentity {
            uuid,
            major: Some(7),
        };
        assert!(any_major.matches(&uuid, 3));
        assert!(one_major.matches(&uuid, 7));
        assert!(!one_major.matches(&uuid, 3));
        assert!(!any_major.matches(&Uuid::nil(), 3));
    }

    #[test]
    fn venue_validation() {
        assert!(venue(100.0).is_valid());
        assert!(!venue(0.0).is_valid());
        let mut v = venue(100.0);
        v.latitude = 91.0;
        assert!(!v.is_valid());
    }

    #[test]
    fn serialize_entered_event() {
        let event = VenueEvent::Entered {
            venue_id: VenueId::try_from("arena").unwrap(),
            ts: 1200,
        };
        let mut buf = [0u8; 128];
        let len = serde_json_core::to_slice(&event, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len]).unwrap();
        assert!(json.contains(r#""type":"entered""#));
        assert!(json.contains(r#""venue_id":"arena""#));
        assert!(json.contains(r#""ts":1200"#));
    }

    #[test]
    fn frame_event_as_ndjson_line() {
        let event = VenueEvent::BleFrameDetected {
            venue_id: VenueId::try_from("plaza").unwrap(),
            reading: BroadcastReading {
                namespace: "00010203040506070809".try_into().unwrap(),
                instance: "0a0b0c0d0e0f".try_into().unwrap(),
                rssi: -70,
                tx_power: -59,
                ts: 5,
            },
        };
        let mut buf = [0u8; 256];
        let len = event.to_ndjson(&mut buf).unwrap();
        assert_eq!(buf[len - 1], b'\n');
        let line = core::str::from_utf8(&buf[..len - 1]).unwrap();
        assert!(line.starts_with(r#"{"type":"ble_frame","venue_id":"plaza""#));
        assert!(line.contains(r#""namespace":"00010203040506070809""#));

        assert_eq!(event.to_ndjson(&mut [0u8; 8]), None);
    }
}
