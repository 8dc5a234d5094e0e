//! Action handlers driving physical outputs.
//!
//! A `VirtualDevice` translates `SetBinaryState` requests into `on()` /
//! `off()` calls on its handler. Handlers report `Ok(true)` when the
//! action took effect; `Ok(false)` and `Err` both make the device stay
//! silent on the wire.
//!
//! Handlers run on the event-loop thread. A pulsed handler blocks the
//! whole loop for its dwell; that stall is the mutual-exclusion
//! guarantee that at most one actuation is ever in flight.

use serde::Deserialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

/// Failure inside a handler or its pin bank.
#[derive(Debug)]
pub enum ActionError {
    /// The bank refused the pin number.
    UnknownPin(u8),
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::UnknownPin(pin) => write!(f, "unknown output pin {pin}"),
        }
    }
}

impl std::error::Error for ActionError {}

/// Switch actuation capability.
///
/// `Ok(true)` = action performed, answer the client. `Ok(false)` = no-op
/// (already in the requested state, or the variant rejects the verb).
/// `Err` = the output could not be driven. There is no retry anywhere.
pub trait ActionHandler {
    fn on(&mut self) -> Result<bool, ActionError>;
    fn off(&mut self) -> Result<bool, ActionError>;
}

/// Boolean output levels addressed by pin number.
///
/// The physical implementation (GPIO character device, relay board,
/// whatever) lives outside this crate behind this trait; `SoftBank` is
/// the in-process stand-in.
pub trait PinBank {
    fn set(&mut self, pin: u8, level: bool) -> Result<(), ActionError>;
    fn read(&self, pin: u8) -> Result<bool, ActionError>;
}

/// Handlers on one event-loop thread share the bank without locking.
pub type SharedBank = Rc<RefCell<dyn PinBank>>;

/// Lines a bank exposes; BCM-numbered headers fit well inside this.
const BANK_LINES: u8 = 64;

/// In-process pin bank: one latch per line, rest level low.
///
/// Dropping the bank releases every claimed pin back to low, so a fatal
/// exit never leaves an output driven.
#[derive(Default)]
pub struct SoftBank {
    levels: BTreeMap<u8, bool>,
}

impl SoftBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBank {
        Rc::new(RefCell::new(Self::new()))
    }
}

impl PinBank for SoftBank {
    fn set(&mut self, pin: u8, level: bool) -> Result<(), ActionError> {
        if pin >= BANK_LINES {
            return Err(ActionError::UnknownPin(pin));
        }
        self.levels.insert(pin, level);
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<bool, ActionError> {
        if pin >= BANK_LINES {
            return Err(ActionError::UnknownPin(pin));
        }
        Ok(self.levels.get(&pin).copied().unwrap_or(false))
    }
}

impl Drop for SoftBank {
    fn drop(&mut self) {
        for level in self.levels.values_mut() {
            *level = false;
        }
    }
}

/// Declarative handler selection from the config file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerSpec {
    /// Latching output: on drives high, off drives low.
    Level { pin: u8 },
    /// Momentary output: drive high, hold, release.
    Pulse {
        pin: u8,
        #[serde(default = "default_dwell_ms")]
        dwell_ms: u64,
    },
    /// Press the off button of every listed output.
    GroupOff {
        pins: Vec<u8>,
        #[serde(default = "default_dwell_ms")]
        dwell_ms: u64,
    },
    /// One-way reset: on pulses every listed output, off does nothing.
    GroupReset {
        pins: Vec<u8>,
        #[serde(default = "default_dwell_ms")]
        dwell_ms: u64,
    },
}

fn default_dwell_ms() -> u64 {
    2000
}

/// Build the concrete handler for a config entry.
///
/// `None` yields the fail-closed default: `on()` always reports failure,
/// `off()` always reports success.
pub fn build_handler(spec: Option<&HandlerSpec>, bank: &SharedBank) -> Box<dyn ActionHandler> {
    match spec {
        None => Box::new(DefaultHandler),
        Some(HandlerSpec::Level { pin }) => Box::new(LevelSwitch {
            pin: *pin,
            bank: Rc::clone(bank),
        }),
        Some(HandlerSpec::Pulse { pin, dwell_ms }) => Box::new(PulseSwitch {
            pin: *pin,
            dwell: Duration::from_millis(*dwell_ms),
            bank: Rc::clone(bank),
        }),
        Some(HandlerSpec::GroupOff { pins, dwell_ms }) => Box::new(GroupOff {
            pins: pins.clone(),
            dwell: Duration::from_millis(*dwell_ms),
            bank: Rc::clone(bank),
        }),
        Some(HandlerSpec::GroupReset { pins, dwell_ms }) => Box::new(GroupReset {
            pins: pins.clone(),
            dwell: Duration::from_millis(*dwell_ms),
            bank: Rc::clone(bank),
        }),
    }
}

/// Fail-closed default when no handler is configured.
pub struct DefaultHandler;

impl ActionHandler for DefaultHandler {
    fn on(&mut self) -> Result<bool, ActionError> {
        Ok(false)
    }

    fn off(&mut self) -> Result<bool, ActionError> {
        Ok(true)
    }
}

/// Latching switch: reports success only on a real level transition.
pub struct LevelSwitch {
    pin: u8,
    bank: SharedBank,
}

impl ActionHandler for LevelSwitch {
    fn on(&mut self) -> Result<bool, ActionError> {
        let mut bank = self.bank.borrow_mut();
        if bank.read(self.pin)? {
            return Ok(false);
        }
        bank.set(self.pin, true)?;
        Ok(true)
    }

    fn off(&mut self) -> Result<bool, ActionError> {
        let mut bank = self.bank.borrow_mut();
        if !bank.read(self.pin)? {
            return Ok(false);
        }
        bank.set(self.pin, false)?;
        Ok(true)
    }
}

/// Momentary switch: every call performs the full pulse, repeats are
/// never suppressed. The dwell sleep blocks the event loop.
pub struct PulseSwitch {
    pin: u8,
    dwell: Duration,
    bank: SharedBank,
}

impl PulseSwitch {
    fn pulse(&mut self) -> Result<bool, ActionError> {
        pulse_pin(&self.bank, self.pin, self.dwell)?;
        Ok(true)
    }
}

impl ActionHandler for PulseSwitch {
    fn on(&mut self) -> Result<bool, ActionError> {
        self.pulse()
    }

    fn off(&mut self) -> Result<bool, ActionError> {
        self.pulse()
    }
}

fn pulse_pin(bank: &SharedBank, pin: u8, dwell: Duration) -> Result<(), ActionError> {
    bank.borrow_mut().set(pin, true)?;
    if !dwell.is_zero() {
        thread::sleep(dwell);
    }
    bank.borrow_mut().set(pin, false)?;
    Ok(())
}

/// Pulses every listed pin regardless of verb; used as a master-off.
pub struct GroupOff {
    pins: Vec<u8>,
    dwell: Duration,
    bank: SharedBank,
}

impl GroupOff {
    fn pulse_all(&mut self) -> Result<bool, ActionError> {
        for &pin in &self.pins {
            pulse_pin(&self.bank, pin, self.dwell)?;
        }
        Ok(true)
    }
}

impl ActionHandler for GroupOff {
    fn on(&mut self) -> Result<bool, ActionError> {
        self.pulse_all()
    }

    fn off(&mut self) -> Result<bool, ActionError> {
        self.pulse_all()
    }
}

/// One-way reset: `on()` pulses every pin, `off()` acknowledges without
/// touching anything.
pub struct GroupReset {
    pins: Vec<u8>,
    dwell: Duration,
    bank: SharedBank,
}

impl ActionHandler for GroupReset {
    fn on(&mut self) -> Result<bool, ActionError> {
        for &pin in &self.pins {
            pulse_pin(&self.bank, pin, self.dwell)?;
        }
        Ok(true)
    }

    fn off(&mut self) -> Result<bool, ActionError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bank that records every level change for assertions.
    struct RecordingBank {
        inner: SoftBank,
        log: Vec<(u8, bool)>,
    }

    impl RecordingBank {
        fn shared() -> Rc<RefCell<RecordingBank>> {
            Rc::new(RefCell::new(RecordingBank {
                inner: SoftBank::new(),
                log: Vec::new(),
            }))
        }
    }

    impl PinBank for RecordingBank {
        fn set(&mut self, pin: u8, level: bool) -> Result<(), ActionError> {
            self.log.push((pin, level));
            self.inner.set(pin, level)
        }

        fn read(&self, pin: u8) -> Result<bool, ActionError> {
            self.inner.read(pin)
        }
    }

    #[test]
    fn test_default_handler_fails_closed() {
        let mut handler = DefaultHandler;
        assert!(!handler.on().unwrap());
        assert!(handler.off().unwrap());
    }

    #[test]
    fn test_level_switch_reports_transitions_only() {
        let bank = SoftBank::shared();
        let mut switch = LevelSwitch {
            pin: 14,
            bank: Rc::clone(&bank),
        };

        assert!(switch.on().unwrap());
        assert!(bank.borrow().read(14).unwrap());
        // Already high: no transition, no success.
        assert!(!switch.on().unwrap());

        assert!(switch.off().unwrap());
        assert!(!bank.borrow().read(14).unwrap());
        assert!(!switch.off().unwrap());
    }

    #[test]
    fn test_pulse_switch_repeats_are_not_suppressed() {
        let recording = RecordingBank::shared();
        let bank: SharedBank = recording.clone();
        let mut switch = PulseSwitch {
            pin: 14,
            dwell: Duration::from_millis(1),
            bank,
        };

        assert!(switch.on().unwrap());
        assert!(switch.on().unwrap());

        let log = recording.borrow().log.clone();
        assert_eq!(log, vec![(14, true), (14, false), (14, true), (14, false)]);
        // Rest level restored after every pulse.
        assert!(!recording.borrow().read(14).unwrap());
    }

    #[test]
    fn test_pulse_switch_off_also_pulses() {
        let recording = RecordingBank::shared();
        let bank: SharedBank = recording.clone();
        let mut switch = PulseSwitch {
            pin: 7,
            dwell: Duration::ZERO,
            bank,
        };

        assert!(switch.off().unwrap());
        assert_eq!(recording.borrow().log, vec![(7, true), (7, false)]);
    }

    #[test]
    fn test_group_off_pulses_every_pin() {
        let recording = RecordingBank::shared();
        let bank: SharedBank = recording.clone();
        let mut group = GroupOff {
            pins: vec![14, 15, 18],
            dwell: Duration::ZERO,
            bank,
        };

        assert!(group.off().unwrap());
        let log = recording.borrow().log.clone();
        assert_eq!(
            log,
            vec![
                (14, true),
                (14, false),
                (15, true),
                (15, false),
                (18, true),
                (18, false)
            ]
        );
    }

    #[test]
    fn test_group_reset_off_is_a_no_op() {
        let recording = RecordingBank::shared();
        let bank: SharedBank = recording.clone();
        let mut reset = GroupReset {
            pins: vec![14, 15],
            dwell: Duration::ZERO,
            bank,
        };

        assert!(reset.off().unwrap());
        assert!(recording.borrow().log.is_empty());

        assert!(reset.on().unwrap());
        assert_eq!(recording.borrow().log.len(), 4);
    }

    #[test]
    fn test_unknown_pin_is_an_error() {
        let mut bank = SoftBank::new();
        assert!(matches!(bank.set(99, true), Err(ActionError::UnknownPin(99))));
        assert!(bank.read(99).is_err());

        // A mis-wired handler surfaces the error instead of success.
        let shared = SoftBank::shared();
        let mut switch = LevelSwitch {
            pin: 99,
            bank: shared,
        };
        assert!(switch.on().is_err());
    }

    #[test]
    fn test_handler_spec_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            handler: HandlerSpec,
        }

        let spec: Wrapper =
            toml::from_str("handler = { type = \"pulse\", pin = 14, dwell_ms = 500 }").unwrap();
        assert_eq!(
            spec.handler,
            HandlerSpec::Pulse {
                pin: 14,
                dwell_ms: 500
            }
        );

        let spec: Wrapper = toml::from_str("handler = { type = \"pulse\", pin = 3 }").unwrap();
        assert_eq!(
            spec.handler,
            HandlerSpec::Pulse {
                pin: 3,
                dwell_ms: 2000
            }
        );

        let spec: Wrapper =
            toml::from_str("handler = { type = \"group_off\", pins = [14, 15] }").unwrap();
        assert_eq!(
            spec.handler,
            HandlerSpec::GroupOff {
                pins: vec![14, 15],
                dwell_ms: 2000
            }
        );
    }
}
