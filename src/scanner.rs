//! Passive broadcast scanning.
//!
//! One physical radio, one active scan with one combined namespace filter.
//! Advertisements arrive through [`BroadcastScanner::on_advertisement`]
//! (raw AD structures) or [`BroadcastScanner::on_service_data`] (payload
//! already extracted by the platform), are decoded by the frame codec and
//! pushed to the reading sequence.
//!
//! Power-state callbacks and explicit start/stop go through the same state
//! lock, so a radio switching off mid-scan and a stop request never race.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use heapless::Vec;

use crate::config::{MAX_NAMESPACE_FILTER, READING_CAPACITY};
use crate::error::Error;
use crate::frame::{self, BroadcastReading, NamespaceHex, BROADCAST_SERVICE_UUID};
use crate::platform::{RadioPlatform, RadioState};
use crate::stream::{Dropped, LiveChannel, LiveStream};

pub type BroadcastReadings<'a> = LiveStream<'a, BroadcastReading, READING_CAPACITY>;

struct ScannerState {
    power: RadioState,
    /// The radio manager has been brought up once.
    activated: bool,
    scanning: bool,
    /// Empty accepts every namespace.
    filter: Vec<NamespaceHex, MAX_NAMESPACE_FILTER>,
}

impl ScannerState {
    const fn new() -> Self {
        Self {
            power: RadioState::Unknown,
            activated: false,
            scanning: false,
            filter: Vec::new(),
        }
    }

    fn accepts(&self, namespace: &str) -> bool {
        self.filter.is_empty() || self.filter.iter().any(|n| n.eq_ignore_ascii_case(namespace))
    }
}

pub struct BroadcastScanner<P> {
    platform: P,
    state: Mutex<CriticalSectionRawMutex, RefCell<ScannerState>>,
    power: Signal<CriticalSectionRawMutex, RadioState>,
    readings: LiveChannel<BroadcastReading, READING_CAPACITY>,
}

impl<P: RadioPlatform> BroadcastScanner<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            state: Mutex::new(RefCell::new(ScannerState::new())),
            power: Signal::new(),
            readings: LiveChannel::new(),
        }
    }

    /// Start scanning, accepting only `namespace_filter` (hex, any case)
    /// when non-empty.
    ///
    /// The first call brings the radio up and waits for its power state.
    /// Calling again while scanning replaces the filter.
    pub async fn start_scanning<S: AsRef<str>>(&self, namespace_filter: &[S]) -> Result<(), Error> {
        match self.settled_power().await {
            RadioState::PoweredOn => {}
            RadioState::Unauthorized => {
                log::warn!("Broadcast scan refused: bluetooth not authorized");
                return Err(Error::RadioUnauthorized);
            }
            other => {
                log::warn!("Broadcast scan refused: radio {:?}", other);
                return Err(Error::RadioUnavailable);
            }
        }

        let mut filter: Vec<NamespaceHex, MAX_NAMESPACE_FILTER> = Vec::new();
        for namespace in namespace_filter {
            let namespace = namespace.as_ref();
            let kept = NamespaceHex::try_from(namespace)
                .ok()
                .is_some_and(|hex| filter.push(hex).is_ok());
            if !kept {
                log::warn!("Namespace filter entry '{}' dropped", namespace);
            }
        }

        let already = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.filter = filter;
            core::mem::replace(&mut s.scanning, true)
        });

        if already {
            log::debug!("Broadcast scan already running, filter updated");
        } else {
            self.platform.start_scan(BROADCAST_SERVICE_UUID);
            log::info!("Broadcast scan started");
        }
        Ok(())
    }

    /// Current power state, bringing the radio up and waiting for its
    /// first report when it is not known yet.
    async fn settled_power(&self) -> RadioState {
        self.power.reset();
        let (power, activate) = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let activate = !s.power.is_settled() && !s.activated;
            if activate {
                s.activated = true;
            }
            (s.power, activate)
        });
        if power.is_settled() {
            return power;
        }
        if activate {
            self.platform.activate();
        }
        loop {
            let power = self.power.wait().await;
            if power.is_settled() {
                return power;
            }
        }
    }

    /// Idempotent.
    pub fn stop_scanning(&self) {
        let was_scanning = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.filter.clear();
            core::mem::replace(&mut s.scanning, false)
        });
        if was_scanning {
            self.platform.stop_scan();
            log::info!("Broadcast scan stopped");
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock(|s| s.borrow().scanning)
    }

    pub fn power_state(&self) -> RadioState {
        self.state.lock(|s| s.borrow().power)
    }

    /// Open the reading sequence, closing any previous consumer.
    pub fn readings(&self) -> BroadcastReadings<'_> {
        self.readings.open()
    }

    // ── Platform callbacks ──────────────────────────────────────────

    /// Radio power changed. Losing power while scanning halts the scan;
    /// it is not restarted automatically.
    pub fn on_power_state(&self, power: RadioState) {
        let halted = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.power = power;
            if s.scanning && power != RadioState::PoweredOn && power.is_settled() {
                s.scanning = false;
                true
            } else {
                false
            }
        });
        if halted {
            log::warn!("Radio went {:?} while scanning, scan halted", power);
        } else {
            log::debug!("Radio power state {:?}", power);
        }
        self.power.signal(power);
    }

    /// Raw advertisement data (AD structures).
    pub fn on_advertisement(&self, ad_data: &[u8], rssi: i8) {
        if let Some(payload) = frame::service_data(ad_data, BROADCAST_SERVICE_UUID) {
            self.on_service_data(payload, rssi);
        }
    }

    /// Service data of the broadcast service UUID.
    pub fn on_service_data(&self, payload: &[u8], rssi: i8) {
        let Some(reading) = frame::decode(payload, rssi) else {
            return;
        };
        let wanted = self.state.lock(|s| {
            let s = s.borrow();
            s.scanning && s.accepts(&reading.namespace)
        });
        if !wanted {
            return;
        }
        if let Err(Dropped::Full) = self.readings.try_push(reading) {
            log::warn!("Broadcast reading dropped: consumer behind");
        }
    }
}
