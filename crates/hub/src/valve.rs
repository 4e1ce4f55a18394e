//! Valve actuators. The `gpio` feature gates the real rppal relay board;
//! without it, a mock board keeps per-valve state in memory and logs changes.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Opens and closes physical valves, addressed by the zone's actuator ref.
#[async_trait]
pub trait ValveActuator: Send + Sync {
    /// Drive the valve. Returns `false` when the command was not accepted.
    async fn set(&self, actuator: &str, on: bool) -> bool;

    /// Close every valve this actuator knows about.
    async fn all_off(&self) {}
}

pub(crate) fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Parse a board actuator ref as a BCM pin number (2..=27).
pub fn parse_pin(actuator: &str) -> Option<u8> {
    actuator
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|p| (2..=27).contains(p))
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct ValveBoard {
    pins: Mutex<HashMap<String, OutputPin>>, // actuator ref -> GPIO pin
    active_low: bool,                        // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub fn new(actuators: &[String], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for actuator in actuators {
            let pin_num = parse_pin(actuator)
                .ok_or_else(|| anyhow::anyhow!("actuator '{actuator}' is not a valid GPIO pin"))?;
            let mut pin = gpio.get(pin_num)?.into_output();

            // Fail-safe: every relay starts OFF
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(actuator.clone(), pin);
        }

        info!(valves = pins.len(), active_low, "gpio valve board initialised");
        Ok(Self {
            pins: Mutex::new(pins),
            active_low,
        })
    }

    fn drive(&self, actuator: &str, on: bool) -> bool {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pin) = pins.get_mut(actuator) else {
            warn!(actuator, "unknown valve");
            return false;
        };
        // active-low: LOW = ON; active-high: HIGH = ON
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(actuator, state = on_off(on), "valve set");
        true
    }

    fn refs(&self) -> Vec<String> {
        let pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        pins.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Mock valve board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct ValveBoard {
    valves: Mutex<HashMap<String, bool>>, // actuator ref -> on/off
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub fn new(actuators: &[String], _active_low: bool) -> Result<Self> {
        let valves: HashMap<String, bool> =
            actuators.iter().map(|a| (a.clone(), false)).collect();
        info!(valves = valves.len(), "mock valve board initialised (no hardware)");
        Ok(Self {
            valves: Mutex::new(valves),
        })
    }

    fn drive(&self, actuator: &str, on: bool) -> bool {
        let mut valves = self.valves.lock().unwrap_or_else(|e| e.into_inner());
        match valves.get_mut(actuator) {
            Some(state) => {
                *state = on;
                info!(actuator, state = on_off(on), "[mock] valve set");
                true
            }
            None => {
                warn!(actuator, "[mock] unknown valve");
                false
            }
        }
    }

    fn refs(&self) -> Vec<String> {
        let valves = self.valves.lock().unwrap_or_else(|e| e.into_inner());
        valves.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn is_on(&self, actuator: &str) -> Option<bool> {
        let valves = self.valves.lock().unwrap_or_else(|e| e.into_inner());
        valves.get(actuator).copied()
    }
}

#[async_trait]
impl ValveActuator for ValveBoard {
    async fn set(&self, actuator: &str, on: bool) -> bool {
        self.drive(actuator, on)
    }

    async fn all_off(&self) {
        for actuator in self.refs() {
            self.drive(&actuator, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
