//! Broadcast frame codec.
//!
//! Decodes the UID frame of the short-range broadcast format carried as
//! 16-bit-UUID service data (service `0xFEAA`):
//!
//! ```text
//! [0]      frame type, 0x00 = UID
//! [1]      calibrated TX power at 0 m, signed dBm
//! [2..12]  namespace id (10 bytes)
//! [12..18] instance id (6 bytes)
//! [18..]   reserved, ignored
//! ```
//!
//! Anything else (TLM/URL/EID frames, truncated payloads) decodes to `None`.
//! Those are routine background traffic, not errors.

use core::fmt::Write;

use heapless::String;
use serde::Serialize;

/// 16-bit service UUID the broadcast frames are advertised under.
pub const BROADCAST_SERVICE_UUID: u16 = 0xFEAA;

/// Frame type byte of a UID frame.
pub const UID_FRAME_TYPE: u8 = 0x00;

/// Minimum length of a UID frame (reserved trailer optional).
pub const UID_FRAME_LEN: usize = 18;

const NAMESPACE_LEN: usize = 10;
const INSTANCE_LEN: usize = 6;

/// Lowercase hex namespace id (10 bytes).
pub type NamespaceHex = String<{ NAMESPACE_LEN * 2 }>;

/// Lowercase hex instance id (6 bytes).
pub type InstanceHex = String<{ INSTANCE_LEN * 2 }>;

/// A decoded UID frame plus the signal strength it was received at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastReading {
    pub namespace: NamespaceHex,
    pub instance: InstanceHex,
    pub rssi: i8,
    pub tx_power: i8,
    /// Milliseconds since boot when received.
    pub ts: u64,
}

impl BroadcastReading {
    /// Estimated distance in meters, `-1.0` when unknown.
    pub fn estimated_distance(&self) -> f64 {
        estimated_distance(self.tx_power, self.rssi)
    }
}

/// Log-distance path loss estimate: `10^((txPower - rssi) / 20)`.
///
/// Returns `-1.0` when either value is zero (platforms report 0 for
/// "no measurement").
pub fn estimated_distance(tx_power: i8, rssi: i8) -> f64 {
    if tx_power == 0 || rssi == 0 {
        return -1.0;
    }
    let exponent = (tx_power as f64 - rssi as f64) / 20.0;
    libm::pow(10.0, exponent)
}

/// Decode a UID frame. `None` for any other frame type or a short payload.
pub fn decode(frame: &[u8], rssi: i8) -> Option<BroadcastReading> {
    if frame.len() < UID_FRAME_LEN || frame[0] != UID_FRAME_TYPE {
        return None;
    }

    let tx_power = frame[1] as i8;
    let namespace = hex_string(&frame[2..2 + NAMESPACE_LEN])?;
    let instance = hex_string(&frame[2 + NAMESPACE_LEN..UID_FRAME_LEN])?;

    Some(BroadcastReading {
        namespace,
        instance,
        rssi,
        tx_power,
        ts: crate::timestamp_ms(),
    })
}

fn hex_string<const N: usize>(bytes: &[u8]) -> Option<String<N>> {
    let mut out = String::new();
    for b in bytes {
        write!(out, "{:02x}", b).ok()?;
    }
    Some(out)
}

/// Find the service data for `uuid16` in raw advertisement data.
///
/// AD structure format: [length] [type] [data...]
/// Type 0x16 = Service Data, 16-bit UUID (first 2 data bytes, little-endian).
/// Returns the payload following the UUID.
pub fn service_data(ad_data: &[u8], uuid16: u16) -> Option<&[u8]> {
    let mut pos = 0;
    while pos < ad_data.len() {
        let len = ad_data[pos] as usize;
        if len == 0 || pos + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[pos + 1];
        let data = &ad_data[pos + 2..pos + 1 + len];

        if ad_type == 0x16 && data.len() >= 2 && u16::from_le_bytes([data[0], data[1]]) == uuid16 {
            return Some(&data[2..]);
        }

        pos += 1 + len;
    }
    None
}
