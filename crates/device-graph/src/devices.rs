//! Interfaces the stock contexts view their devices through.
//!
//! Real GPIO drivers live outside this crate; anything implementing these traits can be
//! registered. The `sim` feature provides in-process implementations.

use crate::context::Device;
use std::sync::Arc;

/// Callback fired on an input edge.
pub type EdgeCallback = Arc<dyn Fn() + Send + Sync>;

/// A digital output line (valve solenoid, compressor relay, direction pin).
pub trait DigitalOutput: Device {
    fn pin(&self) -> u8;
    fn on(&self);
    fn off(&self);
    fn is_on(&self) -> bool;

    fn set(&self, on: bool) {
        if on {
            self.on()
        } else {
            self.off()
        }
    }

    fn toggle(&self) {
        self.set(!self.is_on())
    }
}

/// A digital input line (pressure switch, limit switch).
pub trait DigitalInput: Device {
    fn pin(&self) -> u8;
    fn is_active(&self) -> bool;
    fn when_activated(&self, callback: EdgeCallback);
    fn when_deactivated(&self, callback: EdgeCallback);
}

/// A PWM output channel. Duty cycle is in `0.0..=1.0`.
pub trait PwmOutput: Device {
    fn pin(&self) -> u8;
    fn value(&self) -> f32;
    fn set_value(&self, duty: f32);

    fn off(&self) {
        self.set_value(0.0)
    }

    fn is_active(&self) -> bool {
        self.value() > 0.0
    }
}
