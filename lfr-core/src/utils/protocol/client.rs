//! Request/reply client for the 3pi serial slave.
//!
//! The link carries exactly one outstanding request. Every exchange starts by
//! discarding whatever is still buffered inbound, so a reply that arrives
//! after its request timed out is absorbed by the next call instead of being
//! decoded as the answer to it.

use embedded_hal::{delay::DelayNs, digital::OutputPin};
use embedded_io::ReadExactError;

use super::{
    codec::{
        BatteryVoltage, MotorCommand, Opcode, PrintCommand, SensorFrame, Signature,
        BATTERY_LEN, CALIBRATION_LEN, SENSOR_FRAME_LEN, SIGNATURE_LEN,
    },
    MalformedKind, ProtocolError,
};
use crate::utils::{
    config::SerialConfig,
    serial::{wait_for_bytes, ByteStream, Clock},
};

/// Where the most recent exchange ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Sent(Opcode),
    AwaitingReply(Opcode),
    Decoded(Opcode),
    TimedOut(Opcode),
    Rejected(Opcode),
}

pub type Result<T, S> = core::result::Result<T, ProtocolError<<S as embedded_io::ErrorType>::Error>>;

/// Protocol driver owning the link, a clock and a delay.
pub struct ProtocolClient<S, C, D> {
    stream: S,
    clock: C,
    delay: D,
    config: SerialConfig,
    state: ExchangeState,
}

impl<S, C, D> ProtocolClient<S, C, D>
where
    S: ByteStream,
    C: Clock,
    D: DelayNs,
{
    pub fn new(
        stream: S,
        clock: C,
        delay: D,
        config: SerialConfig,
    ) -> Self {
        tracing::info!(baud = config.baud_rate, "protocol client ready");
        Self {
            stream,
            clock,
            delay,
            config,
            state: ExchangeState::Idle,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Block for `ms` milliseconds on the client's delay.
    pub fn pause_ms(
        &mut self,
        ms: u32,
    ) {
        self.delay.delay_ms(ms);
    }

    /// Pulse the board's reset line: low for the hold time, then high and wait
    /// for the board to boot. Must precede the first signature request.
    pub fn reset_board<P: OutputPin>(
        &mut self,
        reset: &mut P,
    ) -> core::result::Result<(), P::Error> {
        tracing::info!("resetting board");
        reset.set_low()?;
        self.delay.delay_ms(self.config.reset_hold_ms);
        reset.set_high()?;
        self.delay.delay_ms(self.config.reset_settle_ms);
        self.state = ExchangeState::Idle;
        Ok(())
    }

    /// Read the firmware signature.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn request_signature(&mut self) -> Result<Signature, S> {
        let timeout = self.config.signature_timeout_ms;
        let signature = self.exchange::<SIGNATURE_LEN, _>(Opcode::Signature, timeout, Signature::decode)?;
        tracing::info!(%signature, "board signature");
        Ok(signature)
    }

    /// Read the battery voltage.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn request_battery(&mut self) -> Result<BatteryVoltage, S> {
        let timeout = self.config.battery_timeout_ms;
        self.exchange::<BATTERY_LEN, _>(Opcode::BatteryMillivolts, timeout, |b| {
            Ok(BatteryVoltage::decode(b))
        })
    }

    /// Read the five calibrated line sensors.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn request_sensors(&mut self) -> Result<SensorFrame, S> {
        let timeout = self.config.sensors_timeout_ms;
        self.exchange::<SENSOR_FRAME_LEN, _>(Opcode::CalibratedSensors, timeout, |b| {
            Ok(SensorFrame::decode(b))
        })
    }

    /// Read the five line sensors before calibration is applied.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn request_raw_sensors(&mut self) -> Result<SensorFrame, S> {
        let timeout = self.config.sensors_timeout_ms;
        self.exchange::<SENSOR_FRAME_LEN, _>(Opcode::RawSensors, timeout, |b| {
            Ok(SensorFrame::decode(b))
        })
    }

    /// Run the board's auto-calibration and return its status byte.
    ///
    /// The board rotates in place for about a second while it samples the
    /// floor, so this is by far the longest exchange. The status is a signed
    /// char on the board: negative means the calibration failed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn request_calibration(&mut self) -> Result<u8, S> {
        let timeout = self.config.calibration_timeout_ms;
        let status = self.exchange::<CALIBRATION_LEN, _>(Opcode::AutoCalibrate, timeout, |b| Ok(b[0]))?;
        if (status as i8) < 0 {
            tracing::warn!(status, "board reported failed auto-calibration");
            self.state = ExchangeState::Rejected(Opcode::AutoCalibrate);
            return Err(ProtocolError::CalibrationFailed { status });
        }
        Ok(status)
    }

    /// Set one motor. Write-only: the board does not acknowledge.
    pub fn send_motor_command(
        &mut self,
        command: MotorCommand,
    ) -> Result<(), S> {
        let frame = command.encode();
        tracing::debug!(side = ?command.side, speed = command.speed, payload = frame[1], "motor");
        self.send(command.opcode(), &frame)?;
        self.state = ExchangeState::Decoded(command.opcode());
        Ok(())
    }

    /// Clear the board's LCD.
    pub fn clear_display(&mut self) -> Result<(), S> {
        self.send(Opcode::ClearDisplay, &[Opcode::ClearDisplay.byte()])?;
        self.state = ExchangeState::Decoded(Opcode::ClearDisplay);
        Ok(())
    }

    /// Print up to eight ASCII characters at the LCD cursor.
    pub fn print(
        &mut self,
        text: &str,
    ) -> Result<(), S> {
        let command = PrintCommand::new(text)?;
        self.send(Opcode::Print, command.as_bytes())?;
        self.state = ExchangeState::Decoded(Opcode::Print);
        Ok(())
    }

    fn send(
        &mut self,
        opcode: Opcode,
        frame: &[u8],
    ) -> Result<(), S> {
        let stale = self.stream.clear_buffer().map_err(ProtocolError::Io)?;
        if stale > 0 {
            tracing::warn!(stale, ?opcode, "discarded stale bytes before request");
        }
        self.stream.write_all(frame).map_err(ProtocolError::Io)?;
        self.stream.flush().map_err(ProtocolError::Io)?;
        self.state = ExchangeState::Sent(opcode);
        Ok(())
    }

    /// Send a bare opcode, wait for its `N`-byte reply and decode it.
    fn exchange<const N: usize, T>(
        &mut self,
        opcode: Opcode,
        timeout_ms: u32,
        decode: impl FnOnce(&[u8; N]) -> core::result::Result<T, MalformedKind>,
    ) -> Result<T, S> {
        debug_assert_eq!(N, opcode.reply_len());
        self.send(opcode, &[opcode.byte()])?;
        self.state = ExchangeState::AwaitingReply(opcode);

        if wait_for_bytes(
            &mut self.stream,
            &self.clock,
            &mut self.delay,
            N,
            timeout_ms,
            self.config.poll_interval_ms,
        )
        .is_err()
        {
            self.state = ExchangeState::TimedOut(opcode);
            return Err(ProtocolError::Timeout { opcode });
        }

        let mut reply = [0u8; N];
        let decoded = match self.stream.read_exact(&mut reply) {
            Ok(()) => decode(&reply),
            Err(ReadExactError::UnexpectedEof) => Err(MalformedKind::Short),
            Err(ReadExactError::Other(err)) => {
                self.state = ExchangeState::Rejected(opcode);
                return Err(ProtocolError::Io(err));
            }
        };

        match decoded {
            Ok(value) => {
                tracing::debug!(?opcode, ?reply, "reply");
                self.state = ExchangeState::Decoded(opcode);
                Ok(value)
            }
            Err(kind) => {
                tracing::error!(?opcode, ?kind, ?reply, "malformed reply");
                self.state = ExchangeState::Rejected(opcode);
                Err(ProtocolError::MalformedReply { opcode, kind })
            }
        }
    }
}
