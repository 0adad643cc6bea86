//! Opcodes and fixed-width payloads of the 3pi serial slave protocol.
//!
//! Every request starts with a single opcode byte. Replies carry no framing or
//! length prefix: the size is fixed per opcode and known in advance, see
//! [`Opcode::reply_len`]. Multi-byte values are little-endian and unsigned.

use core::{fmt, ops::Index};

use super::{InvalidCommand, MalformedKind};

/// Number of reflectance sensors under the robot.
pub const N_LINE_SENSORS: usize = 5;
pub const SIGNATURE_LEN: usize = 6;
pub const BATTERY_LEN: usize = 2;
pub const SENSOR_FRAME_LEN: usize = 2 * N_LINE_SENSORS;
pub const CALIBRATION_LEN: usize = 1;
/// Longest string the LCD print command accepts.
pub const MAX_PRINT_LEN: usize = 8;
/// Motor payload at full speed.
pub const MOTOR_FULL_SCALE: u8 = 0x7F;

/// One protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Signature = 0x81,
    RawSensors = 0x86,
    CalibratedSensors = 0x87,
    BatteryMillivolts = 0xB1,
    ClearDisplay = 0xB7,
    Print = 0xB8,
    AutoCalibrate = 0xBA,
    M1Forward = 0xC1,
    M1Backward = 0xC2,
    M2Forward = 0xC5,
    M2Backward = 0xC6,
}

impl Opcode {
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// Bytes the board sends back for this opcode.
    pub const fn reply_len(self) -> usize {
        match self {
            Opcode::Signature => SIGNATURE_LEN,
            Opcode::RawSensors | Opcode::CalibratedSensors => SENSOR_FRAME_LEN,
            Opcode::BatteryMillivolts => BATTERY_LEN,
            Opcode::AutoCalibrate => CALIBRATION_LEN,
            Opcode::ClearDisplay
            | Opcode::Print
            | Opcode::M1Forward
            | Opcode::M1Backward
            | Opcode::M2Forward
            | Opcode::M2Backward => 0,
        }
    }

    pub const fn is_motor(self) -> bool {
        matches!(
            self,
            Opcode::M1Forward | Opcode::M1Backward | Opcode::M2Forward | Opcode::M2Backward
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x81 => Opcode::Signature,
            0x86 => Opcode::RawSensors,
            0x87 => Opcode::CalibratedSensors,
            0xB1 => Opcode::BatteryMillivolts,
            0xB7 => Opcode::ClearDisplay,
            0xB8 => Opcode::Print,
            0xBA => Opcode::AutoCalibrate,
            0xC1 => Opcode::M1Forward,
            0xC2 => Opcode::M1Backward,
            0xC5 => Opcode::M2Forward,
            0xC6 => Opcode::M2Backward,
            other => return Err(other),
        })
    }
}

/// Firmware identification string, e.g. `3pi1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    pub fn decode(bytes: &[u8; SIGNATURE_LEN]) -> Result<Self, MalformedKind> {
        if !bytes.is_ascii() {
            return Err(MalformedKind::NotAscii);
        }
        Ok(Self(*bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Checked ASCII on decode.
        core::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for Signature {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Battery reading as reported by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryVoltage {
    pub millivolts: u16,
}

impl BatteryVoltage {
    pub fn decode(bytes: &[u8; BATTERY_LEN]) -> Self {
        Self {
            millivolts: u16::from_le_bytes(*bytes),
        }
    }

    pub fn volts(&self) -> f32 {
        f32::from(self.millivolts) / 1000.0
    }
}

/// One reading of all line sensors, left to right.
///
/// Calibrated frames are nominally in `[0, 1000]` and raw frames in
/// `[0, 2000]`, but decoding keeps whatever the board sent so that out of range
/// values reach the calibration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorFrame([u16; N_LINE_SENSORS]);

impl SensorFrame {
    pub const fn new(values: [u16; N_LINE_SENSORS]) -> Self {
        Self(values)
    }

    pub fn decode(bytes: &[u8; SENSOR_FRAME_LEN]) -> Self {
        let mut values = [0u16; N_LINE_SENSORS];
        for (value, pair) in values.iter_mut().zip(bytes.chunks_exact(2)) {
            *value = u16::from_le_bytes([pair[0], pair[1]]);
        }
        Self(values)
    }

    pub fn encode(&self) -> [u8; SENSOR_FRAME_LEN] {
        let mut bytes = [0u8; SENSOR_FRAME_LEN];
        for (pair, value) in bytes.chunks_exact_mut(2).zip(self.0) {
            pair.copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    pub fn values(&self) -> &[u16; N_LINE_SENSORS] {
        &self.0
    }

    pub fn min(&self) -> u16 {
        self.0.iter().copied().min().unwrap_or(0)
    }

    pub fn max(&self) -> u16 {
        self.0.iter().copied().max().unwrap_or(0)
    }

    pub fn leftmost(&self) -> u16 {
        self.0[0]
    }

    pub fn rightmost(&self) -> u16 {
        self.0[N_LINE_SENSORS - 1]
    }
}

impl Index<usize> for SensorFrame {
    type Output = u16;

    fn index(
        &self,
        index: usize,
    ) -> &u16 {
        &self.0[index]
    }
}

impl From<[u16; N_LINE_SENSORS]> for SensorFrame {
    fn from(values: [u16; N_LINE_SENSORS]) -> Self {
        Self(values)
    }
}

/// Drive motor. Motor 1 on the board is the left wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

/// A speed request for one motor, `speed` in `[-1.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorCommand {
    pub side: Side,
    pub speed: f32,
}

impl MotorCommand {
    /// Build a command, clamping the speed to `[-1.0, 1.0]`. Non-finite speeds become zero.
    pub fn new(
        side: Side,
        speed: f32,
    ) -> Self {
        let speed = if speed.is_finite() { speed.clamp(-1.0, 1.0) } else { 0.0 };
        Self { side, speed }
    }

    pub fn stop(side: Side) -> Self {
        Self { side, speed: 0.0 }
    }

    /// Positive speed drives forward; zero and negative select the backward opcode.
    pub fn opcode(&self) -> Opcode {
        match (self.side, self.speed > 0.0) {
            (Side::Left, true) => Opcode::M1Forward,
            (Side::Left, false) => Opcode::M1Backward,
            (Side::Right, true) => Opcode::M2Forward,
            (Side::Right, false) => Opcode::M2Backward,
        }
    }

    /// `round(0x7F * |speed|)`, clamped to `[0, 127]`.
    pub fn payload(&self) -> u8 {
        let magnitude = libm::fabsf(self.speed).min(1.0);
        let scaled = libm::roundf(f32::from(MOTOR_FULL_SCALE) * magnitude);
        scaled.clamp(0.0, f32::from(MOTOR_FULL_SCALE)) as u8
    }

    pub fn encode(&self) -> [u8; 2] {
        [self.opcode().byte(), self.payload()]
    }

    /// Interpret a motor opcode and payload as the board would apply them.
    pub fn from_wire(
        opcode: Opcode,
        payload: u8,
    ) -> Option<Self> {
        let (side, sign) = match opcode {
            Opcode::M1Forward => (Side::Left, 1.0),
            Opcode::M1Backward => (Side::Left, -1.0),
            Opcode::M2Forward => (Side::Right, 1.0),
            Opcode::M2Backward => (Side::Right, -1.0),
            _ => return None,
        };
        let magnitude = f32::from(payload.min(MOTOR_FULL_SCALE)) / f32::from(MOTOR_FULL_SCALE);
        Some(Self::new(side, sign * magnitude))
    }
}

/// An LCD print request: opcode, length, then up to eight ASCII characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintCommand {
    buf: [u8; 2 + MAX_PRINT_LEN],
    len: usize,
}

impl PrintCommand {
    pub fn new(text: &str) -> Result<Self, InvalidCommand> {
        let bytes = text.as_bytes();
        if !bytes.is_ascii() {
            return Err(InvalidCommand::NotAscii);
        }
        if bytes.len() > MAX_PRINT_LEN {
            return Err(InvalidCommand::TextTooLong { len: bytes.len() });
        }
        let mut buf = [0u8; 2 + MAX_PRINT_LEN];
        buf[0] = Opcode::Print.byte();
        buf[1] = bytes.len() as u8;
        buf[2..2 + bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            buf,
            len: 2 + bytes.len(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
