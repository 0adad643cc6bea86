//! In-memory stand-ins for the serial link: a virtual clock, a delay that
//! advances it, a scripted byte stream and a simulated 3pi serial slave.
//!
//! Everything runs on virtual time, so a one-second calibration costs nothing
//! on the host and clock wraparound can be staged at will.

use alloc::{collections::VecDeque, rc::Rc, string::String, vec::Vec};
use core::{cell::Cell, convert::Infallible};

use embedded_hal::delay::DelayNs;

use super::{ByteStream, Clock};
use crate::utils::protocol::codec::{
    MotorCommand, Opcode, SensorFrame, Side, MAX_PRINT_LEN, N_LINE_SENSORS,
};

/// Shared virtual millisecond counter. Clones observe the same time.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Rc<Cell<u32>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(ms: u32) -> Self {
        Self {
            now: Rc::new(Cell::new(ms)),
        }
    }

    /// Move time forward, wrapping at `u32::MAX` like the real counter.
    pub fn advance(
        &self,
        ms: u32,
    ) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    /// A delay that advances this clock by however long it is asked to sleep.
    pub fn delay(&self) -> SimDelay {
        SimDelay {
            clock: self.clone(),
            carry_ns: 0,
            sleeps: 0,
            slept_ms: 0,
        }
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }
}

/// Delay that returns immediately after advancing its [`SimClock`].
#[derive(Debug)]
pub struct SimDelay {
    clock: SimClock,
    carry_ns: u32,
    sleeps: u32,
    slept_ms: u64,
}

impl SimDelay {
    /// Number of sleep calls made so far.
    pub fn sleeps(&self) -> u32 {
        self.sleeps
    }

    /// Total whole milliseconds slept.
    pub fn slept_ms(&self) -> u64 {
        self.slept_ms
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(
        &mut self,
        ns: u32,
    ) {
        self.sleeps += 1;
        let total = u64::from(self.carry_ns) + u64::from(ns);
        let ms = (total / 1_000_000) as u32;
        self.carry_ns = (total % 1_000_000) as u32;
        self.slept_ms += u64::from(ms);
        self.clock.advance(ms);
    }

    fn delay_ms(
        &mut self,
        ms: u32,
    ) {
        self.sleeps += 1;
        self.slept_ms += u64::from(ms);
        self.clock.advance(ms);
    }
}

/// `true` once `now` has reached `at`, tolerating one wrap of the counter.
fn reached(
    now: u32,
    at: u32,
) -> bool {
    now.wrapping_sub(at) as i32 >= 0
}

/// Byte stream whose inbound bytes become visible at scripted clock times.
///
/// Outbound bytes are recorded for inspection.
#[derive(Debug)]
pub struct ScriptedStream<C> {
    clock: C,
    inbound: VecDeque<(u32, u8)>,
    written: Vec<u8>,
    flushes: usize,
}

impl<C: Clock> ScriptedStream<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            inbound: VecDeque::new(),
            written: Vec::new(),
            flushes: 0,
        }
    }

    /// Make `bytes` readable from clock time `at_ms` onward.
    pub fn push_at(
        &mut self,
        at_ms: u32,
        bytes: &[u8],
    ) {
        self.inbound.extend(bytes.iter().map(|&b| (at_ms, b)));
    }

    /// Make `bytes` readable immediately.
    pub fn push_now(
        &mut self,
        bytes: &[u8],
    ) {
        let now = self.clock.now_ms();
        self.push_at(now, bytes);
    }

    /// Bytes still queued, including ones not yet visible.
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    /// Everything written by the host so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<C> embedded_io::ErrorType for ScriptedStream<C> {
    type Error = Infallible;
}

impl<C: Clock> embedded_io::Read for ScriptedStream<C> {
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> Result<usize, Self::Error> {
        let now = self.clock.now_ms();
        let mut count = 0;
        while count < buf.len() {
            match self.inbound.front() {
                Some(&(at, byte)) if reached(now, at) => {
                    buf[count] = byte;
                    self.inbound.pop_front();
                    count += 1;
                }
                _ => break,
            }
        }
        Ok(count)
    }
}

impl<C: Clock> embedded_io::Write for ScriptedStream<C> {
    fn write(
        &mut self,
        buf: &[u8],
    ) -> Result<usize, Self::Error> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.flushes += 1;
        Ok(())
    }
}

impl<C: Clock> ByteStream for ScriptedStream<C> {
    fn available(&mut self) -> usize {
        let now = self.clock.now_ms();
        self.inbound
            .iter()
            .take_while(|&&(at, _)| reached(now, at))
            .count()
    }
}

/// Simulated 3pi running the serial slave program.
///
/// Commands written by the host are parsed as they arrive and answered after
/// a processing latency plus the wire time at the configured baud rate.
pub struct SimBoard<C> {
    link: ScriptedStream<C>,
    baud_rate: u32,
    latency_ms: u32,
    calibration_ms: u32,
    responsive: bool,
    command: Vec<u8>,
    signature: [u8; 6],
    battery_mv: u16,
    frames: VecDeque<SensorFrame>,
    idle_frame: SensorFrame,
    calibration_status: u8,
    calibrations: u32,
    sensor_reads: u32,
    motors: [MotorCommand; 2],
    motor_log: Vec<MotorCommand>,
    lcd: String,
}

impl<C: Clock> SimBoard<C> {
    pub fn new(
        clock: C,
        baud_rate: u32,
    ) -> Self {
        Self {
            link: ScriptedStream::new(clock),
            baud_rate,
            latency_ms: 0,
            calibration_ms: 1_000,
            responsive: true,
            command: Vec::new(),
            signature: *b"3pi1.1",
            battery_mv: 4_800,
            frames: VecDeque::new(),
            idle_frame: SensorFrame::new([0, 0, 1_000, 0, 0]),
            calibration_status: b'c',
            calibrations: 0,
            sensor_reads: 0,
            motors: [MotorCommand::stop(Side::Left), MotorCommand::stop(Side::Right)],
            motor_log: Vec::new(),
            lcd: String::new(),
        }
    }

    /// Extra processing time before every reply.
    pub fn with_latency(
        mut self,
        ms: u32,
    ) -> Self {
        self.latency_ms = ms;
        self
    }

    /// How long the board spends in auto-calibration before answering.
    pub fn with_calibration_time(
        mut self,
        ms: u32,
    ) -> Self {
        self.calibration_ms = ms;
        self
    }

    /// A mute board accepts commands but never answers (powered off, wrong port).
    pub fn set_responsive(
        &mut self,
        responsive: bool,
    ) {
        self.responsive = responsive;
    }

    pub fn set_battery_mv(
        &mut self,
        millivolts: u16,
    ) {
        self.battery_mv = millivolts;
    }

    pub fn set_signature(
        &mut self,
        signature: [u8; 6],
    ) {
        self.signature = signature;
    }

    pub fn set_calibration_status(
        &mut self,
        status: u8,
    ) {
        self.calibration_status = status;
    }

    /// Frames served by successive sensor reads. When the queue runs dry the
    /// idle frame is served.
    pub fn queue_frames<I>(
        &mut self,
        frames: I,
    ) where
        I: IntoIterator<Item = SensorFrame>,
    {
        self.frames.extend(frames);
    }

    pub fn set_idle_frame(
        &mut self,
        frame: SensorFrame,
    ) {
        self.idle_frame = frame;
    }

    /// Push bytes the host did not ask for, as a late reply would.
    pub fn inject_noise(
        &mut self,
        bytes: &[u8],
    ) {
        self.link.push_now(bytes);
    }

    pub fn calibrations(&self) -> u32 {
        self.calibrations
    }

    pub fn sensor_reads(&self) -> u32 {
        self.sensor_reads
    }

    /// Last command applied to the given side.
    pub fn motor(
        &self,
        side: Side,
    ) -> MotorCommand {
        self.motors[side.index()]
    }

    pub fn motor_log(&self) -> &[MotorCommand] {
        &self.motor_log
    }

    pub fn lcd(&self) -> &str {
        &self.lcd
    }

    /// Raw bytes the host has written.
    pub fn written(&self) -> &[u8] {
        self.link.written()
    }

    /// Number of times the host flushed its outbound bytes.
    pub fn flushes(&self) -> usize {
        self.link.flushes()
    }

    fn wire_ms(
        &self,
        bytes: usize,
    ) -> u32 {
        // 8N1 framing: ten bit times per byte.
        let bits = bytes as u64 * 10 * 1_000;
        let baud = u64::from(self.baud_rate.max(1));
        bits.div_ceil(baud) as u32
    }

    fn reply(
        &mut self,
        extra_ms: u32,
        bytes: &[u8],
    ) {
        if !self.responsive {
            return;
        }
        let at = self
            .link
            .clock()
            .now_ms()
            .wrapping_add(self.latency_ms)
            .wrapping_add(extra_ms)
            .wrapping_add(self.wire_ms(bytes.len()));
        self.link.push_at(at, bytes);
    }

    fn next_frame(&mut self) -> SensorFrame {
        self.sensor_reads += 1;
        self.frames.pop_front().unwrap_or(self.idle_frame)
    }

    /// Bytes a complete command needs, or `None` while the length is unknown.
    fn command_len(
        opcode: Opcode,
        received: &[u8],
    ) -> Option<usize> {
        match opcode {
            Opcode::Print => received
                .get(1)
                .map(|&n| 2 + usize::from(n).min(MAX_PRINT_LEN)),
            op if op.is_motor() => Some(2),
            _ => Some(1),
        }
    }

    fn feed(
        &mut self,
        byte: u8,
    ) {
        if self.command.is_empty() && Opcode::try_from(byte).is_err() {
            tracing::debug!(byte, "sim board ignoring unknown opcode");
            return;
        }
        self.command.push(byte);

        let Ok(opcode) = Opcode::try_from(self.command[0]) else {
            self.command.clear();
            return;
        };
        match Self::command_len(opcode, &self.command) {
            Some(len) if self.command.len() >= len => {
                let command = core::mem::take(&mut self.command);
                self.execute(opcode, &command);
            }
            _ => {}
        }
    }

    fn execute(
        &mut self,
        opcode: Opcode,
        command: &[u8],
    ) {
        match opcode {
            Opcode::Signature => {
                let signature = self.signature;
                self.reply(0, &signature);
            }
            Opcode::BatteryMillivolts => {
                let bytes = self.battery_mv.to_le_bytes();
                self.reply(0, &bytes);
            }
            Opcode::CalibratedSensors => {
                let bytes = self.next_frame().encode();
                self.reply(0, &bytes);
            }
            Opcode::RawSensors => {
                let calibrated = self.next_frame();
                let mut raw = [0u16; N_LINE_SENSORS];
                for (out, value) in raw.iter_mut().zip(calibrated.values()) {
                    *out = value.saturating_mul(2);
                }
                let bytes = SensorFrame::new(raw).encode();
                self.reply(0, &bytes);
            }
            Opcode::AutoCalibrate => {
                self.calibrations += 1;
                let status = self.calibration_status;
                let ms = self.calibration_ms;
                self.reply(ms, &[status]);
            }
            Opcode::ClearDisplay => self.lcd.clear(),
            Opcode::Print => {
                for &b in &command[2..] {
                    self.lcd.push(char::from(b));
                }
            }
            motor => {
                if let Some(applied) = MotorCommand::from_wire(motor, command[1]) {
                    self.motors[applied.side.index()] = applied;
                    self.motor_log.push(applied);
                }
            }
        }
    }
}

impl<C> embedded_io::ErrorType for SimBoard<C> {
    type Error = Infallible;
}

impl<C: Clock> embedded_io::Read for SimBoard<C> {
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> Result<usize, Self::Error> {
        self.link.read(buf)
    }
}

impl<C: Clock> embedded_io::Write for SimBoard<C> {
    fn write(
        &mut self,
        buf: &[u8],
    ) -> Result<usize, Self::Error> {
        self.link.write(buf)?;
        for &byte in buf {
            self.feed(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.link.flush()
    }
}

impl<C: Clock> ByteStream for SimBoard<C> {
    fn available(&mut self) -> usize {
        self.link.available()
    }
}
