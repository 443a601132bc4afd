//! Limits, runtime configuration and venue catalog loading.

use embassy_time::Duration;
use heapless::Vec;

use crate::error::Error;
use crate::frame::NamespaceHex;
use crate::venue::Venue;

/// Platform ceiling on simultaneously monitored regions.
pub const MAX_MONITORED_REGIONS: usize = 20;

/// Maximum namespaces in the broadcast scan filter.
pub const MAX_NAMESPACE_FILTER: usize = 8;

/// Maximum venues accepted from one catalog document.
pub const MAX_CATALOG_VENUES: usize = 32;

/// Buffer depth of the beacon and broadcast reading sequences.
pub const READING_CAPACITY: usize = 16;

/// Buffer depth of the region transition sequence. Holds one initial
/// state answer per region without a consumer keeping up.
pub const REGION_EVENT_CAPACITY: usize = 32;

/// Buffer depth of the detector's output sequence.
pub const EVENT_CAPACITY: usize = 64;

/// Output slots readings never take, so entries and exits get through a
/// consumer that has fallen behind on readings.
pub const TRANSITION_HEADROOM: usize = MAX_MONITORED_REGIONS;

pub const DEFAULT_LOCATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REGION_START_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RADIO_POWER_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime detector configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// How long a broadcast scan start may wait for the radio to report
    /// its power state.
    pub radio_power_timeout: Duration,
    /// Broadcast namespaces to accept (lowercase hex). Empty accepts all.
    pub namespace_filter: Vec<NamespaceHex, MAX_NAMESPACE_FILTER>,
}

impl DetectorConfig {
    pub const fn new() -> Self {
        Self {
            radio_power_timeout: DEFAULT_RADIO_POWER_TIMEOUT,
            namespace_filter: Vec::new(),
        }
    }

    /// Restrict the broadcast scan to `namespace` (hex, any case).
    /// Ignored once the filter is full or when the value is not a
    /// 10-byte hex id.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        if namespace.len() != 20 || !namespace.bytes().all(|b| b.is_ascii_hexdigit()) {
            log::warn!("Ignoring malformed namespace filter '{}'", namespace);
            return self;
        }
        let mut hex = NamespaceHex::new();
        for c in namespace.chars() {
            let _ = hex.push(c.to_ascii_lowercase());
        }
        if self.namespace_filter.push(hex).is_err() {
            log::warn!("Namespace filter full, ignoring {}", namespace);
        }
        self
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub type Catalog = Vec<Venue, MAX_CATALOG_VENUES>;

/// Parse a JSON array of venues.
///
/// Venues with out-of-range coordinates or a non-positive radius are
/// skipped with a warning; order is preserved.
pub fn parse_catalog(json: &[u8]) -> Result<Catalog, Error> {
    let (parsed, _) = serde_json_core::from_slice::<Catalog>(json).map_err(|e| {
        log::error!("Venue catalog parse failed: {:?}", e);
        Error::InvalidCatalog
    })?;

    let mut catalog = Catalog::new();
    for venue in parsed {
        if venue.is_valid() {
            let _ = catalog.push(venue);
        } else {
            log::warn!("Skipping invalid venue '{}'", venue.id);
        }
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.radio_power_timeout, DEFAULT_RADIO_POWER_TIMEOUT);
        assert!(config.namespace_filter.is_empty());
        assert_eq!(DEFAULT_LOCATION_TIMEOUT, Duration::from_secs(10));
    }

    #[test]
    fn namespace_filter_normalized() {
        let config = DetectorConfig::new()
            .with_namespace("EDD1EBEAC04E5DEFA017")
            .with_namespace("not-hex")
            .with_namespace("0001");
        assert_eq!(config.namespace_filter.len(), 1);
        assert_eq!(config.namespace_filter[0].as_str(), "edd1ebeac04e5defa017");
    }

    #[test]
    fn parse_catalog_with_and_without_beacons() {
        let json = br#"[
            {"id":"stadium","latitude":40.4468,"longitude":-80.0158,"radius":300.0,
             "beacon":{"uuid":"e2c56db5-dffb-48d2-b060-d0f5a71096e0","major":100}},
            {"id":"fan-zone","latitude":40.4470,"longitude":-80.0100,"radius":120.0}
        ]"#;
        let catalog = parse_catalog(json).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].id.as_str(), "stadium");
        let beacon = catalog[0].beacon.unwrap();
        assert_eq!(beacon.major, Some(100));
        assert_eq!(
            beacon.uuid,
            uuid::Uuid::from_u128(0xE2C56DB5_DFFB_48D2_B060_D0F5A71096E0)
        );
        assert!(catalog[1].beacon.is_none());
    }

    #[test]
    fn parse_catalog_skips_invalid_venues() {
        let json = br#"[
            {"id":"ok","latitude":10.0,"longitude":10.0,"radius":50.0},
            {"id":"bad-lat","latitude":123.0,"longitude":10.0,"radius":50.0},
            {"id":"bad-radius","latitude":10.0,"longitude":10.0,"radius":0.0}
        ]"#;
        let catalog = parse_catalog(json).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].id.as_str(), "ok");
    }

    #[test]
    fn parse_catalog_rejects_malformed_json() {
        assert_eq!(parse_catalog(b"[{\"id\":"), Err(Error::InvalidCatalog));
        assert_eq!(parse_catalog(b"{}"), Err(Error::InvalidCatalog));
    }
}
