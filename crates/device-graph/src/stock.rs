//! Standard contexts for the pneumatic arm: generic pins, the roles they are claimed under, and
//! the composite muscles and motors built on top of them.
//!
//! Contexts and masks are created first; pin parsers are bound afterwards by whichever backend
//! is in use (see [`StockContexts::bind_simulated`]) and reach the masks through parser
//! propagation.

use crate::context::Context;
use crate::devices::{DigitalInput, DigitalOutput, PwmOutput};
use crate::error::Result;
use crate::handle::Handle;
use crate::hydrate::Hydrator;
use crate::registry::Registry;
use crate::types::Fragment;
use std::sync::Arc;
use tracing::{info, warn};

pub const OUTPUT_PIN: &str = "output_pin";
pub const INPUT_PIN: &str = "input_pin";
pub const PWM_PIN: &str = "pwm_pin";
pub const VALVE: &str = "valve";
pub const COMPRESSOR: &str = "compressor";
pub const PRESSURE: &str = "pressure";
pub const DIRECTION_PIN: &str = "direction_pin";
pub const SPEED_PIN: &str = "speed_pin";
pub const MUSCLE: &str = "muscle";
pub const MOTOR: &str = "motor";

pub type OutputHandle = Handle<Arc<dyn DigitalOutput>>;
pub type InputHandle = Handle<Arc<dyn DigitalInput>>;
pub type PwmHandle = Handle<Arc<dyn PwmOutput>>;

/// Pneumatic muscle: a valve that inflates it and a pressure switch guarding the supply.
#[derive(Debug, Clone)]
pub struct Muscle {
    pub identifier: String,
    pub pressure: InputHandle,
    pub valve: OutputHandle,
}

impl Muscle {
    pub fn build(registry: &Registry, fragment: &Fragment, identifier: &str) -> Result<Self> {
        let pressure = registry.context::<dyn DigitalInput>(PRESSURE)?;
        let valves = registry.context::<dyn DigitalOutput>(VALVE)?;
        let mut h = Hydrator::new(registry, MUSCLE, fragment, identifier)?;
        h.allow(&["pressure", "valve"])?;
        let muscle = Muscle {
            identifier: h.identifier().to_string(),
            pressure: h.reference("pressure", &pressure)?,
            valve: h.reference("valve", &valves)?,
        };
        h.finish()?;
        Ok(muscle)
    }
}

/// DC motor driven by a PWM speed pin and an optional direction pin.
#[derive(Debug, Clone)]
pub struct Motor {
    pub identifier: String,
    pub speed: PwmHandle,
    pub direction: Option<OutputHandle>,
    pub reversed: bool,
}

impl Motor {
    pub fn build(registry: &Registry, fragment: &Fragment, identifier: &str) -> Result<Self> {
        let speed_pins = registry.context::<dyn PwmOutput>(SPEED_PIN)?;
        let direction_pins = registry.context::<dyn DigitalOutput>(DIRECTION_PIN)?;
        let mut h = Hydrator::new(registry, MOTOR, fragment, identifier)?;
        h.allow(&["speed", "direction", "reversed"])?;
        let motor = Motor {
            identifier: h.identifier().to_string(),
            speed: h.reference("speed", &speed_pins)?,
            direction: h.optional_reference("direction", &direction_pins)?,
            reversed: h.value_or_default("reversed")?,
        };
        h.finish()?;
        Ok(motor)
    }
}

/// Handles to every stock context of one registry.
#[derive(Debug, Clone)]
pub struct StockContexts {
    pub output_pins: Context<dyn DigitalOutput>,
    pub input_pins: Context<dyn DigitalInput>,
    pub pwm_pins: Context<dyn PwmOutput>,
    pub valves: Context<dyn DigitalOutput>,
    pub compressors: Context<dyn DigitalOutput>,
    pub pressure: Context<dyn DigitalInput>,
    pub direction_pins: Context<dyn DigitalOutput>,
    pub speed_pins: Context<dyn PwmOutput>,
    pub muscles: Context<Muscle>,
    pub motors: Context<Motor>,
}

impl StockContexts {
    /// Create the stock contexts. Generic pin contexts are left without a parser.
    pub fn install(registry: &Registry) -> Result<Self> {
        let output_pins = registry.create_context::<dyn DigitalOutput>(OUTPUT_PIN)?;
        let input_pins = registry.create_context::<dyn DigitalInput>(INPUT_PIN)?;
        let pwm_pins = registry.create_context::<dyn PwmOutput>(PWM_PIN)?;
        let valves = registry.create_masked_context(&output_pins, VALVE)?;
        let compressors = registry.create_masked_context(&output_pins, COMPRESSOR)?;
        let direction_pins = registry.create_masked_context(&output_pins, DIRECTION_PIN)?;
        let pressure = registry.create_masked_context(&input_pins, PRESSURE)?;
        let speed_pins = registry.create_masked_context(&pwm_pins, SPEED_PIN)?;
        let muscles = registry.create_context_with(MUSCLE, |registry, fragment, identifier| {
            Muscle::build(registry, fragment, identifier).map(Arc::new)
        })?;
        let motors = registry.create_context_with(MOTOR, |registry, fragment, identifier| {
            Motor::build(registry, fragment, identifier).map(Arc::new)
        })?;

        output_pins.on_teardown(|ctx| {
            for (_, pin) in ctx.stored() {
                pin.off();
            }
        });
        pwm_pins.on_teardown(|ctx| {
            for (_, pin) in ctx.stored() {
                pin.off();
            }
        });

        Ok(Self {
            output_pins,
            input_pins,
            pwm_pins,
            valves,
            compressors,
            pressure,
            direction_pins,
            speed_pins,
            muscles,
            motors,
        })
    }

    /// Create the stock contexts with in-process simulated pins.
    #[cfg(feature = "sim")]
    pub fn install_simulated(registry: &Registry) -> Result<Self> {
        let stock = Self::install(registry)?;
        stock.bind_simulated();
        Ok(stock)
    }

    #[cfg(feature = "sim")]
    pub fn bind_simulated(&self) {
        use crate::sim::{check_line, SimInputPin, SimOutputPin, SimPwmPin};
        use crate::types::{decode, PinConfig};

        self.output_pins.bind_parser(|_, fragment, identifier| {
            let cfg: PinConfig = decode(OUTPUT_PIN, identifier, fragment)?;
            let pin: Arc<dyn DigitalOutput> =
                Arc::new(SimOutputPin::new(check_line(cfg.pin())?, cfg.initial() > 0.0));
            Ok(pin)
        });
        self.input_pins.bind_parser(|_, fragment, identifier| {
            let cfg: PinConfig = decode(INPUT_PIN, identifier, fragment)?;
            let pin: Arc<dyn DigitalInput> =
                Arc::new(SimInputPin::new(check_line(cfg.pin())?, cfg.initial() > 0.0));
            Ok(pin)
        });
        self.pwm_pins.bind_parser(|_, fragment, identifier| {
            let cfg: PinConfig = decode(PWM_PIN, identifier, fragment)?;
            let line = check_line(cfg.pin())?;
            let pin: Arc<dyn PwmOutput> = Arc::new(SimPwmPin::new(line, cfg.initial()));
            Ok(pin)
        });
        info!("bound simulated pin parsers");
    }
}

pub fn turn_on(
    outputs: &Context<dyn DigitalOutput>,
    output: impl Into<OutputHandle>,
) -> Result<()> {
    outputs.act(output, |pin| pin.on())
}

pub fn turn_off(
    outputs: &Context<dyn DigitalOutput>,
    output: impl Into<OutputHandle>,
) -> Result<()> {
    outputs.act(output, |pin| pin.off())
}

pub fn toggle(outputs: &Context<dyn DigitalOutput>, output: impl Into<OutputHandle>) -> Result<()> {
    outputs.act(output, |pin| pin.toggle())
}

pub fn get_state(
    outputs: &Context<dyn DigitalOutput>,
    output: impl Into<OutputHandle>,
) -> Result<bool> {
    outputs.act(output, |pin| pin.is_on())
}

pub fn is_pressure_ok(
    pressure: &Context<dyn DigitalInput>,
    sensor: impl Into<InputHandle>,
) -> Result<bool> {
    pressure.act(sensor, |pin| pin.is_active())
}

/// Open the muscle's valve if the supply pressure is up. Returns whether it contracted.
pub fn contract(stock: &StockContexts, muscle: impl Into<Handle<Arc<Muscle>>>) -> Result<bool> {
    let muscle = stock.muscles.resolve(&muscle.into())?;
    info!(muscle = %muscle.identifier, "contracting muscle");
    if !is_pressure_ok(&stock.pressure, &muscle.pressure)? {
        warn!(muscle = %muscle.identifier, "pressure check failed, cannot contract muscle");
        return Ok(false);
    }
    turn_on(&stock.valves, &muscle.valve)?;
    Ok(true)
}

/// Close the muscle's valve. Returns false when it was already relaxed.
pub fn relax(stock: &StockContexts, muscle: impl Into<Handle<Arc<Muscle>>>) -> Result<bool> {
    let muscle = stock.muscles.resolve(&muscle.into())?;
    info!(muscle = %muscle.identifier, "relaxing muscle");
    if !get_state(&stock.valves, &muscle.valve)? {
        warn!(muscle = %muscle.identifier, "valve already closed, muscle is relaxed");
        return Ok(false);
    }
    turn_off(&stock.valves, &muscle.valve)?;
    Ok(true)
}

pub fn toggle_muscle(
    stock: &StockContexts,
    muscle: impl Into<Handle<Arc<Muscle>>>,
) -> Result<bool> {
    let muscle = stock.muscles.resolve(&muscle.into())?;
    if get_state(&stock.valves, &muscle.valve)? {
        relax(stock, &muscle)
    } else {
        contract(stock, &muscle)
    }
}

/// Drive the motor at `speed` in `-1.0..=1.0`; the sign selects the direction.
/// Returns the duty cycle applied to the speed pin.
pub fn set_speed(
    stock: &StockContexts,
    motor: impl Into<Handle<Arc<Motor>>>,
    speed: f32,
) -> Result<f32> {
    let motor = stock.motors.resolve(&motor.into())?;
    if let Some(direction) = &motor.direction {
        let forward = (speed >= 0.0) != motor.reversed;
        stock.direction_pins.act(direction, |pin| pin.set(forward))?;
    }
    stock.speed_pins.act(&motor.speed, |pin| {
        pin.set_value(speed.abs());
        pin.value()
    })
}

/// Point the motor forward or backward. Returns false for motors without a direction pin.
pub fn set_direction(
    stock: &StockContexts,
    motor: impl Into<Handle<Arc<Motor>>>,
    forward: bool,
) -> Result<bool> {
    let motor = stock.motors.resolve(&motor.into())?;
    let Some(direction) = &motor.direction else {
        warn!(motor = %motor.identifier, "motor has no direction pin");
        return Ok(false);
    };
    stock
        .direction_pins
        .act(direction, |pin| pin.set(forward != motor.reversed))?;
    Ok(true)
}

pub fn stop(stock: &StockContexts, motor: impl Into<Handle<Arc<Motor>>>) -> Result<f32> {
    let motor = stock.motors.resolve(&motor.into())?;
    stock.speed_pins.act(&motor.speed, |pin| {
        pin.off();
        pin.value()
    })
}
