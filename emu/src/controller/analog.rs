//! The dual-mode (digital/analog) pad with rumble.
//!
//! Every [`transfer`](AnalogController::transfer) exchanges one byte each way
//! and advances one step through the reply sequence of the current command;
//! commands are only recognized from [`TransferState::Idle`]. The first two
//! reply bytes of every command are the pad ID, byte-swapped (LSB first):
//! `0x5A41` digital, `0x5A73` analog, `0x5AF3` while in configuration mode.
//!
//! Rumble rides piggyback on the poll command: once command `0x4D` has
//! assigned motors to poll-byte positions, the *inputs* of those positions
//! drive the motors while the pad clocks out its button and axis data.

use std::sync::Arc;

use logger::log;
use serde::{Deserialize, Serialize};

use crate::controller::{Axis, Button, ControllerSettings};
use crate::host::MessageSink;
use crate::savestate::StateWrapper;

pub const NUM_MOTORS: usize = 2;

const LARGE_MOTOR: usize = 0;
const SMALL_MOTOR: usize = 1;

/// Where the serial state machine currently sits. Every terminal state
/// transitions back to `Idle` with `ack == false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Idle = 0,
    GetStateIdMsb = 1,
    GetStateButtonsLsb = 2,
    GetStateButtonsMsb = 3,
    GetStateRightAxisX = 4,
    GetStateRightAxisY = 5,
    GetStateLeftAxisX = 6,
    GetStateLeftAxisY = 7,
    ConfigModeIdMsb = 8,
    ConfigModeSetMode = 9,
    SetAnalogModeIdMsb = 10,
    SetAnalogModeVal = 11,
    SetAnalogModeSel = 12,
    GetAnalogModeIdMsb = 13,
    GetAnalogMode1 = 14,
    GetAnalogMode2 = 15,
    GetAnalogMode3 = 16,
    GetAnalogMode4 = 17,
    GetAnalogMode5 = 18,
    GetAnalogMode6 = 19,
    Command46IdMsb = 20,
    Command461 = 21,
    Command462 = 22,
    Command463 = 23,
    Command464 = 24,
    Command465 = 25,
    Command466 = 26,
    Command47IdMsb = 27,
    Command471 = 28,
    Command472 = 29,
    Command473 = 30,
    Command474 = 31,
    Command475 = 32,
    Command476 = 33,
    Command4CIdMsb = 34,
    Command4CMode = 35,
    Command4C1 = 36,
    Command4C2 = 37,
    Command4C3 = 38,
    Command4C4 = 39,
    Command4C5 = 40,
    UnlockRumbleIdMsb = 41,
    GetSetRumble1 = 42,
    GetSetRumble2 = 43,
    GetSetRumble3 = 44,
    GetSetRumble4 = 45,
    GetSetRumble5 = 46,
    GetSetRumble6 = 47,
    Pad6Bytes = 48,
    Pad5Bytes = 49,
    Pad4Bytes = 50,
    Pad3Bytes = 51,
    Pad2Bytes = 52,
    Pad1Byte = 53,
}

impl TryFrom<u8> for TransferState {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(Self::Idle),
            1 => Ok(Self::GetStateIdMsb),
            2 => Ok(Self::GetStateButtonsLsb),
            3 => Ok(Self::GetStateButtonsMsb),
            4 => Ok(Self::GetStateRightAxisX),
            5 => Ok(Self::GetStateRightAxisY),
            6 => Ok(Self::GetStateLeftAxisX),
            7 => Ok(Self::GetStateLeftAxisY),
            8 => Ok(Self::ConfigModeIdMsb),
            9 => Ok(Self::ConfigModeSetMode),
            10 => Ok(Self::SetAnalogModeIdMsb),
            11 => Ok(Self::SetAnalogModeVal),
            12 => Ok(Self::SetAnalogModeSel),
            13 => Ok(Self::GetAnalogModeIdMsb),
            14 => Ok(Self::GetAnalogMode1),
            15 => Ok(Self::GetAnalogMode2),
            16 => Ok(Self::GetAnalogMode3),
            17 => Ok(Self::GetAnalogMode4),
            18 => Ok(Self::GetAnalogMode5),
            19 => Ok(Self::GetAnalogMode6),
            20 => Ok(Self::Command46IdMsb),
            21 => Ok(Self::Command461),
            22 => Ok(Self::Command462),
            23 => Ok(Self::Command463),
            24 => Ok(Self::Command464),
            25 => Ok(Self::Command465),
            26 => Ok(Self::Command466),
            27 => Ok(Self::Command47IdMsb),
            28 => Ok(Self::Command471),
            29 => Ok(Self::Command472),
            30 => Ok(Self::Command473),
            31 => Ok(Self::Command474),
            32 => Ok(Self::Command475),
            33 => Ok(Self::Command476),
            34 => Ok(Self::Command4CIdMsb),
            35 => Ok(Self::Command4CMode),
            36 => Ok(Self::Command4C1),
            37 => Ok(Self::Command4C2),
            38 => Ok(Self::Command4C3),
            39 => Ok(Self::Command4C4),
            40 => Ok(Self::Command4C5),
            41 => Ok(Self::UnlockRumbleIdMsb),
            42 => Ok(Self::GetSetRumble1),
            43 => Ok(Self::GetSetRumble2),
            44 => Ok(Self::GetSetRumble3),
            45 => Ok(Self::GetSetRumble4),
            46 => Ok(Self::GetSetRumble5),
            47 => Ok(Self::GetSetRumble6),
            48 => Ok(Self::Pad6Bytes),
            49 => Ok(Self::Pad5Bytes),
            50 => Ok(Self::Pad4Bytes),
            51 => Ok(Self::Pad3Bytes),
            52 => Ok(Self::Pad2Bytes),
            53 => Ok(Self::Pad1Byte),
            _ => Err(format!("Unexpected value for TransferState: {n}")),
        }
    }
}

pub struct AnalogController {
    index: u32,
    sink: Arc<dyn MessageSink>,

    state: TransferState,

    analog_mode: bool,
    analog_locked: bool,
    configuration_mode: bool,
    analog_toggle_queued: bool,

    rumble_unlocked: bool,
    /// Pre-DualShock rumble: one poll input byte drives the small motor
    /// on/off. Latched by the first poll byte, consumed by the second.
    legacy_rumble_unlocked: bool,

    /// Active low: a set bit means released.
    button_state: u16,
    axis_state: [u8; 4],
    motor_state: [u8; NUM_MOTORS],

    rumble_config: [u8; 6],
    large_motor_index: i32,
    small_motor_index: i32,

    command_param: u8,

    force_analog_on_reset: bool,
    analog_dpad_in_digital_mode: bool,
    axis_scale: f32,
    vibration_bias: u8,
    disable_analog_mode_forcing: bool,
}

impl AnalogController {
    pub fn new(index: u32, sink: Arc<dyn MessageSink>) -> Self {
        let mut controller = Self {
            index,
            sink,
            state: TransferState::Idle,
            analog_mode: false,
            analog_locked: false,
            configuration_mode: false,
            analog_toggle_queued: false,
            rumble_unlocked: false,
            legacy_rumble_unlocked: false,
            button_state: 0xFFFF,
            axis_state: [0x80; 4],
            motor_state: [0; NUM_MOTORS],
            rumble_config: [0xFF; 6],
            large_motor_index: -1,
            small_motor_index: -1,
            command_param: 0,
            force_analog_on_reset: false,
            analog_dpad_in_digital_mode: false,
            axis_scale: 1.00,
            vibration_bias: 8,
            disable_analog_mode_forcing: false,
        };
        controller.reset();
        controller
    }

    pub fn load_settings(&mut self, settings: &ControllerSettings) {
        self.force_analog_on_reset = settings.force_analog_on_reset;
        self.analog_dpad_in_digital_mode = settings.analog_dpad_in_digital_mode;
        self.axis_scale = settings.axis_scale.abs().clamp(0.01, 1.50);
        self.vibration_bias = settings.vibration_bias;
        self.disable_analog_mode_forcing = settings.disable_analog_mode_forcing;
    }

    pub fn reset(&mut self) {
        self.state = TransferState::Idle;
        self.analog_mode = false;
        self.configuration_mode = false;
        self.command_param = 0;
        self.motor_state.fill(0);

        self.reset_rumble_config();

        if self.force_analog_on_reset {
            if self.disable_analog_mode_forcing {
                self.sink.post_message(
                    "Analog mode forcing is disabled by game settings. \
                     Controller will start in digital mode."
                        .into(),
                );
            } else {
                self.set_analog_mode(true);
            }
        }
    }

    pub fn do_state(&mut self, sw: &mut StateWrapper, apply_input_state: bool) -> bool {
        let old_analog_mode = self.analog_mode;

        sw.do_value(&mut self.analog_mode);
        sw.do_value(&mut self.rumble_unlocked);
        sw.do_value_ex(&mut self.legacy_rumble_unlocked, 44, false);
        sw.do_value(&mut self.configuration_mode);
        sw.do_value(&mut self.command_param);

        let mut button_state = self.button_state;
        sw.do_value_ex(&mut button_state, 44, 0xFFFF);
        if apply_input_state {
            self.button_state = button_state;
        }

        let mut state = self.state as u8;
        sw.do_value(&mut state);
        if sw.is_reading() {
            match TransferState::try_from(state) {
                Ok(state) => self.state = state,
                Err(_) => return false,
            }
        }

        sw.do_bytes_ex(&mut self.rumble_config, 45, &[0xFF; 6]);
        sw.do_value_ex(&mut self.large_motor_index, 45, -1);
        sw.do_value_ex(&mut self.small_motor_index, 45, -1);
        sw.do_value_ex(&mut self.analog_toggle_queued, 45, false);

        let mut motor_state = self.motor_state;
        sw.do_bytes(&mut motor_state);

        if sw.is_reading() {
            for (motor, value) in motor_state.into_iter().enumerate() {
                self.set_motor_state(motor, value);
            }

            if old_analog_mode != self.analog_mode {
                self.sink.post_message(format!(
                    "Controller {} switched to {} mode.",
                    self.index + 1,
                    if self.analog_mode { "analog" } else { "digital" }
                ));
            }
        }

        !sw.has_error()
    }

    pub fn set_button_state(&mut self, button: Button, pressed: bool) {
        if button == Button::Analog {
            // analog toggle; applied between frames
            if pressed {
                self.analog_toggle_queued = true;
            }

            return;
        }

        if pressed {
            self.button_state &= !(1_u16 << (button as u8));
        } else {
            self.button_state |= 1_u16 << (button as u8);
        }
    }

    pub fn set_axis_state(&mut self, axis: Axis, value: f32) {
        // -1..1 -> 0..255
        let scaled_value = (value * self.axis_scale).clamp(-1.0, 1.0);
        let u8_value = (((scaled_value + 1.0) / 2.0) * 255.0).clamp(0.0, 255.0) as u8;

        self.set_axis_state_raw(axis, u8_value);
    }

    pub fn set_axis_state_raw(&mut self, axis: Axis, value: u8) {
        self.axis_state[axis as usize] = value;
    }

    /// The report mask with bits flipped to active high, for host-side
    /// display.
    #[must_use]
    pub fn button_state_bits(&self) -> u32 {
        u32::from(self.button_state ^ 0xFFFF)
    }

    /// Rumble amplitude in 0..=1, conditioned through the cubic curve of the
    /// Pokopom XInput adapter. The small motor is on/off, so it reports a
    /// single fixed intensity.
    #[must_use]
    pub fn vibration_motor_strength(&self, motor: usize) -> f32 {
        if self.motor_state[motor] == 0 {
            return 0.0;
        }

        let x = f64::from(
            (u32::from(self.motor_state[motor]) + u32::from(self.vibration_bias)).min(255),
        );
        let strength = 0.006_474_549_734_772_402 * x.powi(3) - 1.258_165_252_213_538 * x.powi(2)
            + 156.824_542_810_876_92 * x
            + 3.637_978_807_091_713e-11;

        (strength / 65535.0) as f32
    }

    #[must_use]
    pub fn motor_state(&self, motor: usize) -> u8 {
        self.motor_state[motor]
    }

    /// Frame boundary: the console deasserted select. Applies a queued
    /// analog toggle and returns the state machine to idle.
    pub fn reset_transfer_state(&mut self) {
        if self.analog_toggle_queued {
            if self.analog_locked {
                self.sink.post_message(format!(
                    "Controller {} is locked to {} mode by the game.",
                    self.index + 1,
                    if self.analog_mode { "analog" } else { "digital" }
                ));
            } else {
                self.set_analog_mode(!self.analog_mode);

                // manually toggling the mode resets and disables the rumble
                // configuration
                self.reset_rumble_config();
            }

            self.analog_toggle_queued = false;
        }

        self.state = TransferState::Idle;
    }

    /// The 16-bit pad ID; the serial protocol sends it LSB first.
    #[must_use]
    pub fn id(&self) -> u16 {
        const DIGITAL_MODE_ID: u16 = 0x5A41;
        const ANALOG_MODE_ID: u16 = 0x5A73;
        const CONFIG_MODE_ID: u16 = 0x5AF3;

        if self.configuration_mode {
            return CONFIG_MODE_ID;
        }

        if self.analog_mode {
            ANALOG_MODE_ID
        } else {
            DIGITAL_MODE_ID
        }
    }

    fn set_analog_mode(&mut self, enabled: bool) {
        if self.analog_mode == enabled {
            return;
        }

        let message = format!(
            "Controller {} switched to {} mode.",
            self.index + 1,
            if enabled { "analog" } else { "digital" }
        );
        log(&message);
        self.sink.post_message(message);

        self.analog_mode = enabled;
    }

    fn set_motor_state(&mut self, motor: usize, value: u8) {
        self.motor_state[motor] = value;
    }

    /// Mask applied to the first button byte when the left stick stands in
    /// for the d-pad in digital mode.
    fn extra_button_mask_lsb(&self) -> u8 {
        if !self.analog_dpad_in_digital_mode || self.analog_mode || self.configuration_mode {
            return 0xFF;
        }

        const NEG_THRESHOLD: u8 = (128.0 - 127.0 * 0.5) as u8;
        const POS_THRESHOLD: u8 = (128.0 + 127.0 * 0.5) as u8;

        let left = self.axis_state[Axis::LeftX as usize] <= NEG_THRESHOLD;
        let right = self.axis_state[Axis::LeftX as usize] >= POS_THRESHOLD;
        let up = self.axis_state[Axis::LeftY as usize] <= NEG_THRESHOLD;
        let down = self.axis_state[Axis::LeftY as usize] >= POS_THRESHOLD;

        !((u8::from(left) << (Button::Left as u8))
            | (u8::from(right) << (Button::Right as u8))
            | (u8::from(up) << (Button::Up as u8))
            | (u8::from(down) << (Button::Down as u8)))
    }

    fn reset_rumble_config(&mut self) {
        self.legacy_rumble_unlocked = false;

        self.rumble_unlocked = false;
        self.rumble_config.fill(0xFF);

        self.large_motor_index = -1;
        self.small_motor_index = -1;

        self.set_motor_state(LARGE_MOTOR, 0);
        self.set_motor_state(SMALL_MOTOR, 0);
    }

    /// Drives the motor that command 0x4D bound to poll-byte `index`, if any.
    fn set_motor_state_for_config_index(&mut self, index: i32, value: u8) {
        if self.small_motor_index == index {
            self.set_motor_state(SMALL_MOTOR, if value & 0x01 != 0 { 255 } else { 0 });
        } else if self.large_motor_index == index {
            self.set_motor_state(LARGE_MOTOR, value);
        }
    }

    fn fixed_reply(&mut self, reply: u8, ack: bool, next_state: TransferState) -> (u8, bool) {
        self.state = next_state;
        (reply, ack)
    }

    fn id_msb_reply(&mut self, next_state: TransferState) -> (u8, bool) {
        self.state = next_state;
        ((self.id() >> 8) as u8, true)
    }

    /// Positional swap with the rumble table: reply with the old slot value,
    /// store the new one, and record motor assignments.
    fn rumble_config_reply(
        &mut self,
        index: usize,
        data_in: u8,
        ack: bool,
        next_state: TransferState,
    ) -> (u8, bool) {
        let previous = self.rumble_config[index];
        self.rumble_config[index] = data_in;

        if data_in == 0x00 {
            self.small_motor_index = index as i32;
        } else if data_in == 0x01 {
            self.large_motor_index = index as i32;
        }

        self.state = next_state;
        (previous, ack)
    }

    /// One full-duplex byte exchange; `ack` is the SIO "more to come" line.
    pub fn transfer(&mut self, data_in: u8) -> (u8, bool) {
        use TransferState as S;

        let old_state = self.state;

        let (data_out, ack) = match self.state {
            S::Idle => match data_in {
                0x42 => {
                    self.state = S::GetStateIdMsb;
                    ((self.id() & 0xFF) as u8, true)
                }

                0x43 => {
                    self.state = S::ConfigModeIdMsb;
                    ((self.id() & 0xFF) as u8, true)
                }

                0x44 if self.configuration_mode => {
                    self.state = S::SetAnalogModeIdMsb;
                    ((self.id() & 0xFF) as u8, true)
                }

                0x45 if self.configuration_mode => {
                    self.state = S::GetAnalogModeIdMsb;
                    ((self.id() & 0xFF) as u8, true)
                }

                0x46 if self.configuration_mode => {
                    self.state = S::Command46IdMsb;
                    ((self.id() & 0xFF) as u8, true)
                }

                0x47 if self.configuration_mode => {
                    self.state = S::Command47IdMsb;
                    ((self.id() & 0xFF) as u8, true)
                }

                0x4C if self.configuration_mode => {
                    self.state = S::Command4CIdMsb;
                    ((self.id() & 0xFF) as u8, true)
                }

                0x4D if self.configuration_mode => {
                    self.rumble_unlocked = true;
                    self.large_motor_index = -1;
                    self.small_motor_index = -1;
                    self.state = S::UnlockRumbleIdMsb;
                    ((self.id() & 0xFF) as u8, true)
                }

                _ => {
                    // ack when sent 0x01, ignore everything else
                    tracing::debug!("data_in = 0x{data_in:02X}");
                    (0xFF, data_in == 0x01)
                }
            },

            S::GetStateIdMsb => self.id_msb_reply(S::GetStateButtonsLsb),

            S::GetStateButtonsLsb => {
                if self.rumble_unlocked {
                    self.set_motor_state_for_config_index(0, data_in);
                } else if (0x40..=0x7F).contains(&data_in) {
                    self.legacy_rumble_unlocked = true;
                } else {
                    self.set_motor_state(SMALL_MOTOR, 0);
                }

                self.state = S::GetStateButtonsMsb;
                ((self.button_state & 0xFF) as u8 & self.extra_button_mask_lsb(), true)
            }

            S::GetStateButtonsMsb => {
                if self.rumble_unlocked {
                    self.set_motor_state_for_config_index(1, data_in);
                } else if self.legacy_rumble_unlocked {
                    self.set_motor_state(SMALL_MOTOR, if data_in & 0x01 != 0 { 255 } else { 0 });
                    self.legacy_rumble_unlocked = false;
                }

                let more = self.analog_mode || self.configuration_mode;
                self.state = if more { S::GetStateRightAxisX } else { S::Idle };
                ((self.button_state >> 8) as u8, more)
            }

            S::GetStateRightAxisX => {
                if self.rumble_unlocked {
                    self.set_motor_state_for_config_index(2, data_in);
                }

                self.state = S::GetStateRightAxisY;
                (self.axis_state[Axis::RightX as usize], true)
            }

            S::GetStateRightAxisY => {
                if self.rumble_unlocked {
                    self.set_motor_state_for_config_index(3, data_in);
                }

                self.state = S::GetStateLeftAxisX;
                (self.axis_state[Axis::RightY as usize], true)
            }

            S::GetStateLeftAxisX => {
                if self.rumble_unlocked {
                    self.set_motor_state_for_config_index(4, data_in);
                }

                self.state = S::GetStateLeftAxisY;
                (self.axis_state[Axis::LeftX as usize], true)
            }

            S::GetStateLeftAxisY => {
                if self.rumble_unlocked {
                    self.set_motor_state_for_config_index(5, data_in);
                }

                self.state = S::Idle;
                (self.axis_state[Axis::LeftY as usize], false)
            }

            S::ConfigModeIdMsb => self.id_msb_reply(S::ConfigModeSetMode),

            S::ConfigModeSetMode => {
                // 0x43 issued from within config mode replies with zeros
                tracing::debug!(
                    "0x{data_in:02X}({}) config mode",
                    if data_in == 1 { "enter" } else { "leave" }
                );
                let prev_configuration_mode = self.configuration_mode;
                self.configuration_mode = data_in == 1;

                self.state = if prev_configuration_mode {
                    S::Pad5Bytes
                } else {
                    S::GetStateButtonsMsb
                };
                let reply = if prev_configuration_mode {
                    0x00
                } else {
                    (self.button_state & 0xFF) as u8
                };
                (reply, true)
            }

            S::SetAnalogModeIdMsb => self.id_msb_reply(S::SetAnalogModeVal),

            S::SetAnalogModeVal => {
                tracing::debug!("analog mode val 0x{data_in:02X}");
                if data_in == 0x00 || data_in == 0x01 {
                    self.set_analog_mode(data_in == 0x01);
                }

                self.fixed_reply(0x00, true, S::SetAnalogModeSel)
            }

            S::SetAnalogModeSel => {
                tracing::debug!("analog mode lock 0x{data_in:02X}");
                if data_in == 0x02 || data_in == 0x03 {
                    self.analog_locked = data_in == 0x03;
                }

                self.fixed_reply(0x00, true, S::Pad4Bytes)
            }

            S::GetAnalogModeIdMsb => self.id_msb_reply(S::GetAnalogMode1),
            S::GetAnalogMode1 => self.fixed_reply(0x01, true, S::GetAnalogMode2),
            S::GetAnalogMode2 => self.fixed_reply(0x02, true, S::GetAnalogMode3),
            S::GetAnalogMode3 => {
                let analog = u8::from(self.analog_mode);
                self.fixed_reply(analog, true, S::GetAnalogMode4)
            }
            S::GetAnalogMode4 => self.fixed_reply(0x02, true, S::GetAnalogMode5),
            S::GetAnalogMode5 => self.fixed_reply(0x01, true, S::GetAnalogMode6),
            S::GetAnalogMode6 => self.fixed_reply(0x00, false, S::Idle),

            S::Command46IdMsb => self.id_msb_reply(S::Command461),

            S::Command461 => {
                tracing::debug!("command 46 param 0x{data_in:02X}");
                self.command_param = data_in;
                self.fixed_reply(0x00, true, S::Command462)
            }

            S::Command462 => self.fixed_reply(0x00, true, S::Command463),
            S::Command463 => self.fixed_reply(0x01, true, S::Command464),
            S::Command464 => {
                let reply = if self.command_param == 1 { 1 } else { 2 };
                self.fixed_reply(reply, true, S::Command465)
            }
            S::Command465 => {
                let reply = if self.command_param == 1 { 1 } else { 0 };
                self.fixed_reply(reply, true, S::Command466)
            }
            S::Command466 => {
                let reply = if self.command_param == 1 { 0x14 } else { 0x0A };
                self.fixed_reply(reply, false, S::Idle)
            }

            S::Command47IdMsb => self.id_msb_reply(S::Command471),
            S::Command471 => self.fixed_reply(0x00, true, S::Command472),
            S::Command472 => self.fixed_reply(0x00, true, S::Command473),
            S::Command473 => self.fixed_reply(0x02, true, S::Command474),
            S::Command474 => self.fixed_reply(0x00, true, S::Command475),
            S::Command475 => self.fixed_reply(0x01, true, S::Command476),
            S::Command476 => self.fixed_reply(0x00, false, S::Idle),

            S::Command4CIdMsb => self.id_msb_reply(S::Command4CMode),

            S::Command4CMode => {
                self.command_param = data_in;
                self.fixed_reply(0x00, true, S::Command4C1)
            }

            S::Command4C1 => self.fixed_reply(0x00, true, S::Command4C2),
            S::Command4C2 => self.fixed_reply(0x00, true, S::Command4C3),

            S::Command4C3 => {
                // Ape Escape probes with both 0x00 and 0x01 on startup and
                // checks for the matching reply.
                let reply = match self.command_param {
                    0x00 => 0x04,
                    0x01 => 0x07,
                    _ => 0x00,
                };
                self.fixed_reply(reply, true, S::Command4C4)
            }

            S::Command4C4 => self.fixed_reply(0x00, true, S::Command4C5),
            S::Command4C5 => self.fixed_reply(0x00, false, S::Idle),

            S::UnlockRumbleIdMsb => self.id_msb_reply(S::GetSetRumble1),
            S::GetSetRumble1 => self.rumble_config_reply(0, data_in, true, S::GetSetRumble2),
            S::GetSetRumble2 => self.rumble_config_reply(1, data_in, true, S::GetSetRumble3),
            S::GetSetRumble3 => self.rumble_config_reply(2, data_in, true, S::GetSetRumble4),
            S::GetSetRumble4 => self.rumble_config_reply(3, data_in, true, S::GetSetRumble5),
            S::GetSetRumble5 => self.rumble_config_reply(4, data_in, true, S::GetSetRumble6),

            S::GetSetRumble6 => {
                let reply = self.rumble_config_reply(5, data_in, false, S::Idle);

                if self.large_motor_index == -1 {
                    self.set_motor_state(LARGE_MOTOR, 0);
                }

                if self.small_motor_index == -1 {
                    self.set_motor_state(SMALL_MOTOR, 0);
                }

                if self.large_motor_index == -1 && self.small_motor_index == -1 {
                    self.rumble_unlocked = false;
                }

                // Unknown if slots holding bytes other than 0x00/0x01 force
                // themselves back to 0xFF. Also unknown under what
                // circumstances rumble re-locks and legacy rumble re-enables,
                // if that is even possible (all 0xFFs?).

                reply
            }

            S::Pad6Bytes => self.fixed_reply(0x00, true, S::Pad5Bytes),
            S::Pad5Bytes => self.fixed_reply(0x00, true, S::Pad4Bytes),
            S::Pad4Bytes => self.fixed_reply(0x00, true, S::Pad3Bytes),
            S::Pad3Bytes => self.fixed_reply(0x00, true, S::Pad2Bytes),
            S::Pad2Bytes => self.fixed_reply(0x00, true, S::Pad1Byte),
            S::Pad1Byte => self.fixed_reply(0x00, false, S::Idle),
        };

        tracing::debug!(
            "Transfer, old_state={old_state:?}, new_state={:?}, \
             data_in=0x{data_in:02X}, data_out=0x{data_out:02X}, ack={ack}",
            self.state
        );

        (data_out, ack)
    }
}
