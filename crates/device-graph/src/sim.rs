use crate::devices::{DigitalInput, DigitalOutput, EdgeCallback, PwmOutput};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Highest BCM line exposed on the Raspberry Pi header.
pub const MAX_BCM_PIN: u8 = 27;

/// Reject pin numbers with no GPIO line behind them.
pub fn check_line(pin: u8) -> anyhow::Result<u8> {
    anyhow::ensure!(
        pin <= MAX_BCM_PIN,
        "GPIO{} is not a header line (0..={})",
        pin,
        MAX_BCM_PIN
    );
    Ok(pin)
}

/// In-process digital output. Each instance is independent.
pub struct SimOutputPin {
    pin: u8,
    value: AtomicBool,
}

impl SimOutputPin {
    pub fn new(pin: u8, initial: bool) -> Self {
        Self {
            pin,
            value: AtomicBool::new(initial),
        }
    }

    fn store(&self, on: bool) {
        let before = self.value.swap(on, Ordering::SeqCst);
        debug!(pin = self.pin, before, after = on, "sim output changed");
    }
}

impl DigitalOutput for SimOutputPin {
    fn pin(&self) -> u8 {
        self.pin
    }

    fn on(&self) {
        self.store(true);
    }

    fn off(&self) {
        self.store(false);
    }

    fn is_on(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SimOutputPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimOutputPin(pin={}, value={})", self.pin, u8::from(self.is_on()))
    }
}

/// In-process digital input. The line level is driven with [`SimInputPin::set_active`].
pub struct SimInputPin {
    pin: u8,
    active: AtomicBool,
    activated: Mutex<Option<EdgeCallback>>,
    deactivated: Mutex<Option<EdgeCallback>>,
}

impl SimInputPin {
    pub fn new(pin: u8, active: bool) -> Self {
        Self {
            pin,
            active: AtomicBool::new(active),
            activated: Mutex::new(None),
            deactivated: Mutex::new(None),
        }
    }

    /// Change the simulated line level, firing the matching edge callback on a change.
    pub fn set_active(&self, active: bool) {
        let before = self.active.swap(active, Ordering::SeqCst);
        debug!(pin = self.pin, before, after = active, "sim input changed");
        if before == active {
            return;
        }
        let callback = if active {
            self.activated.lock().clone()
        } else {
            self.deactivated.lock().clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn toggle(&self) {
        self.set_active(!self.is_active());
    }
}

impl DigitalInput for SimInputPin {
    fn pin(&self) -> u8 {
        self.pin
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn when_activated(&self, callback: EdgeCallback) {
        *self.activated.lock() = Some(callback);
    }

    fn when_deactivated(&self, callback: EdgeCallback) {
        *self.deactivated.lock() = Some(callback);
    }
}

impl fmt::Debug for SimInputPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SimInputPin(pin={}, is_active={})",
            self.pin,
            self.is_active()
        )
    }
}

/// In-process PWM channel. The duty cycle is stored as `f32` bits.
pub struct SimPwmPin {
    pin: u8,
    duty: AtomicU32,
}

impl SimPwmPin {
    pub fn new(pin: u8, initial: f32) -> Self {
        Self {
            pin,
            duty: AtomicU32::new(initial.clamp(0.0, 1.0).to_bits()),
        }
    }
}

impl PwmOutput for SimPwmPin {
    fn pin(&self) -> u8 {
        self.pin
    }

    fn value(&self) -> f32 {
        f32::from_bits(self.duty.load(Ordering::SeqCst))
    }

    fn set_value(&self, duty: f32) {
        let duty = if duty.is_nan() { 0.0 } else { duty.clamp(0.0, 1.0) };
        let before = f32::from_bits(self.duty.swap(duty.to_bits(), Ordering::SeqCst));
        debug!(pin = self.pin, before, after = duty, "sim pwm changed");
    }
}

impl fmt::Debug for SimPwmPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimPwmPin(pin={}, value={})", self.pin, self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_output_toggle() {
        let pin = SimOutputPin::new(7, false);
        pin.toggle();
        assert!(pin.is_on());
        pin.set(false);
        assert!(!pin.is_on());
        assert_eq!(format!("{pin:?}"), "SimOutputPin(pin=7, value=0)");
    }

    #[test]
    fn test_input_fires_edge_callbacks() {
        let pin = SimInputPin::new(5, false);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        pin.when_activated(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        pin.set_active(true);
        pin.set_active(true);
        pin.toggle();
        pin.toggle();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(pin.is_active());
    }

    #[test]
    fn test_check_line_bounds() {
        assert_eq!(check_line(27).unwrap(), 27);
        let err = check_line(28).unwrap_err();
        assert!(err.to_string().contains("GPIO28"));
    }

    #[test]
    fn test_pwm_clamps_duty() {
        let pin = SimPwmPin::new(18, 0.25);
        assert_eq!(pin.value(), 0.25);
        pin.set_value(1.7);
        assert_eq!(pin.value(), 1.0);
        pin.set_value(f32::NAN);
        assert!(!pin.is_active());
    }
}
