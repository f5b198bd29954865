//! # Controller port devices
//!
//! PS1 pads sit on a serial link: the console clocks one byte out while the
//! pad clocks one byte in, and the pad pulls /ACK low when it has more to
//! say. Everything a pad does is therefore a byte-granular state machine -
//! see [`analog`] for the dual-mode (digital/analog) DualShock-class pad.

pub mod analog;

use serde::{Deserialize, Serialize};

pub use analog::AnalogController;

/// Button bit positions in the pad's report (active low: a set bit means
/// released). `Analog` is the toggle button under the sticks; it has no bit
/// in the report and is handled out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Button {
    Select = 0,
    L3 = 1,
    R3 = 2,
    Start = 3,
    Up = 4,
    Right = 5,
    Down = 6,
    Left = 7,
    L2 = 8,
    R2 = 9,
    L1 = 10,
    R1 = 11,
    Triangle = 12,
    Circle = 13,
    Cross = 14,
    Square = 15,
    Analog = 16,
}

/// Analog stick axes, in report order. `0x80` is center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    LeftX = 0,
    LeftY = 1,
    RightX = 2,
    RightY = 3,
}

/// The slice of host settings an analog controller consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Force the pad into analog mode when the console resets. Off by
    /// default; some games refuse to boot with an analog pad.
    pub force_analog_on_reset: bool,
    /// Drive the d-pad bits from the left stick while in digital mode.
    pub analog_dpad_in_digital_mode: bool,
    /// Axis scaling factor, clamped to 0.01..=1.50 on load.
    pub axis_scale: f32,
    /// Added to the raw motor value before the strength curve.
    pub vibration_bias: u8,
    /// Game-database override: ignore `force_analog_on_reset` and tell the
    /// user why.
    pub disable_analog_mode_forcing: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            force_analog_on_reset: false,
            analog_dpad_in_digital_mode: false,
            axis_scale: 1.00,
            vibration_bias: 8,
            disable_analog_mode_forcing: false,
        }
    }
}
