//! Error taxonomy for the proximity subsystem.
//!
//! Malformed broadcast frames, unknown region ids and callbacks that arrive
//! after teardown are not errors: they are dropped where they are seen.

use thiserror::Error;

use crate::venue::VenueId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location permission restricted")]
    PermissionRestricted,

    #[error("location fix unavailable")]
    LocationUnavailable,

    #[error("timed out waiting for the platform")]
    Timeout,

    #[error("region monitoring failed for {0}")]
    RegionMonitoringFailed(VenueId),

    #[error("region limit exceeded (max {max})")]
    RegionLimitExceeded { max: usize },

    #[error("beacon ranging unavailable on this device")]
    BeaconRangingUnavailable,

    #[error("bluetooth radio powered off or unsupported")]
    RadioUnavailable,

    #[error("bluetooth access not authorized")]
    RadioUnauthorized,

    /// A one-shot request of the same kind is still outstanding.
    #[error("another request is already pending")]
    RequestPending,

    #[error("venue catalog is not valid JSON")]
    InvalidCatalog,
}
