//! Module Exports
//!
//! Control layers built on top of the protocol client.
//!
//! - `calibration`: decides when the line sensors need re-calibrating
//! - `motors`: last-commanded speeds and the smooth stop ramp
//! - `steering`: edge-sensor steering, headlight and obstacle decisions

pub mod calibration;
pub mod motors;
pub mod steering;

use embedded_hal::{delay::DelayNs, digital::OutputPin};

pub use calibration::{CalibrationOutcome, CalibrationPolicy, CalibrationState, FrameFault, Trigger};
pub use motors::{MotorState, StopRamp};
pub use steering::{DriveAction, Steering};

use crate::utils::{
    config::RobotConfig,
    protocol::{BatteryVoltage, ProtocolClient, ProtocolError, Side, Signature},
    serial::{ByteStream, Clock},
};

/// Errors raised while bringing the board up.
#[derive(Debug)]
pub enum ConnectError<E, P> {
    /// Driving the reset line failed.
    Reset(P),
    Protocol(ProtocolError<E>),
    /// The board never answered within the allowed attempts.
    Unreachable { attempts: u32 },
}

/// Why the drive loop stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Obstacle,
    Junction,
}

/// Readings from sensors that are not on the serial board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorInputs {
    /// Ultrasonic range in cm, `None` without an echo.
    pub distance_cm: Option<u32>,
    /// Ambient light level from the analog input.
    pub light: u16,
}

/// What one drive step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub action: Option<DriveAction>,
    pub headlights: bool,
    pub calibration: Option<CalibrationOutcome>,
    pub halted: Option<HaltReason>,
}

/// Owns the protocol client and all per-run control state.
pub struct DriveController<S, C, D> {
    client: ProtocolClient<S, C, D>,
    policy: CalibrationPolicy,
    calibration: CalibrationState,
    motors: MotorState,
    ramp: StopRamp,
    steering: Steering,
    config: RobotConfig,
    halted: Option<HaltReason>,
}

impl<S, C, D> DriveController<S, C, D>
where
    S: ByteStream,
    C: Clock,
    D: DelayNs,
{
    pub fn new(
        stream: S,
        clock: C,
        delay: D,
        config: RobotConfig,
    ) -> Self {
        DriveController {
            client: ProtocolClient::new(stream, clock, delay, config.serial),
            policy: CalibrationPolicy::new(config.calibration),
            calibration: CalibrationState::default(),
            motors: MotorState::default(),
            ramp: StopRamp::new(config.ramp),
            steering: Steering::new(config.drive),
            config,
            halted: None,
        }
    }

    pub fn client(&self) -> &ProtocolClient<S, C, D> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut ProtocolClient<S, C, D> {
        &mut self.client
    }

    pub fn calibration(&self) -> &CalibrationState {
        &self.calibration
    }

    pub fn motors(&self) -> &MotorState {
        &self.motors
    }

    pub fn halted(&self) -> Option<HaltReason> {
        self.halted
    }

    /// Clear a halt so the drive loop runs again.
    pub fn resume(&mut self) {
        self.halted = None;
    }

    /// Reset the board and wait until it answers with its signature.
    ///
    /// Timeouts are retried after the connect retry delay, forever when
    /// `max_attempts` is `None`. Other protocol errors are returned at once.
    pub fn connect<P: OutputPin>(
        &mut self,
        reset: &mut P,
        max_attempts: Option<u32>,
    ) -> Result<Signature, ConnectError<S::Error, P::Error>> {
        self.client.reset_board(reset).map_err(ConnectError::Reset)?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.client.request_signature() {
                Ok(signature) => {
                    tracing::info!(%signature, attempts, "board connected");
                    return Ok(signature);
                }
                Err(err) if err.is_timeout() => {
                    tracing::warn!(attempts, "no signature from board, is it switched on?");
                    if max_attempts.is_some_and(|max| attempts >= max) {
                        return Err(ConnectError::Unreachable { attempts });
                    }
                    self.client.pause_ms(self.config.drive.connect_retry_ms);
                }
                Err(err) => return Err(ConnectError::Protocol(err)),
            }
        }
    }

    /// Warm up the sensors with a few reads, then force a calibration.
    pub fn prime_sensors(&mut self) -> Result<u8, ProtocolError<S::Error>> {
        for _ in 0..self.config.drive.priming_reads {
            if let Err(err) = self.client.request_sensors() {
                tracing::warn!(%err, "priming read failed");
            }
        }
        self.policy
            .calibrate(&mut self.calibration, &mut self.client, Trigger::Forced)
    }

    pub fn battery(&mut self) -> Result<BatteryVoltage, ProtocolError<S::Error>> {
        let battery = self.client.request_battery()?;
        tracing::info!(volts = battery.volts(), "battery");
        Ok(battery)
    }

    /// Command both wheels and remember the speeds.
    pub fn drive(
        &mut self,
        left: f32,
        right: f32,
    ) -> Result<(), ProtocolError<S::Error>> {
        self.motors.drive(&mut self.client, Side::Left, left)?;
        self.motors.drive(&mut self.client, Side::Right, right)
    }

    /// Ramp both wheels down to a standstill.
    pub fn stop_smooth(&mut self) -> Result<usize, ProtocolError<S::Error>> {
        self.ramp.run(&mut self.client, &mut self.motors)
    }

    /// One pass of the drive loop.
    ///
    /// A halted controller only reports the headlight state. A sensor read
    /// timeout is returned to the caller, which is expected to try again.
    pub fn step(
        &mut self,
        inputs: SensorInputs,
    ) -> Result<StepReport, ProtocolError<S::Error>> {
        let headlights = self.steering.headlights(inputs.light);
        let mut report = StepReport {
            action: None,
            headlights,
            calibration: None,
            halted: self.halted,
        };
        if self.halted.is_some() {
            return Ok(report);
        }

        if self.steering.obstacle(inputs.distance_cm) {
            tracing::warn!(distance_cm = ?inputs.distance_cm, "obstacle ahead, stopping");
            self.stop_smooth()?;
            self.halted = Some(HaltReason::Obstacle);
            report.halted = self.halted;
            return Ok(report);
        }

        let frame = self.client.request_sensors()?;
        let outcome =
            self.policy
                .evaluate_frame(&mut self.calibration, &mut self.client, &frame, false)?;
        report.calibration = Some(outcome);

        let action = self.steering.decide(&frame);
        let (left, right) = action.speeds(&self.config.drive);
        self.drive(left, right)?;
        report.action = Some(action);

        if action == DriveAction::Junction {
            tracing::info!("junction reached, halting");
            self.halted = Some(HaltReason::Junction);
            report.halted = self.halted;
        }

        self.client.pause_ms(self.config.drive.step_interval_ms);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use embedded_hal_mock::eh1::digital::{Mock as PinMock, State, Transaction};

    use super::*;
    use crate::utils::{
        protocol::{Opcode, SensorFrame},
        serial::mock::{SimBoard, SimClock, SimDelay},
    };

    type Controller = DriveController<SimBoard<SimClock>, SimClock, SimDelay>;

    fn controller() -> (SimClock, Controller) {
        let clock = SimClock::new();
        let config = RobotConfig::default();
        let board = SimBoard::new(clock.clone(), config.serial.baud_rate);
        (clock.clone(), DriveController::new(board, clock.clone(), clock.delay(), config))
    }

    fn reset_pin() -> PinMock {
        PinMock::new(&[Transaction::set(State::Low), Transaction::set(State::High)])
    }

    #[test]
    fn connect_retries_until_board_answers() {
        let (clock, mut ctrl) = controller();
        ctrl.client_mut().stream_mut().set_responsive(false);
        let mut pin = reset_pin();

        let err = ctrl.connect(&mut pin, Some(3)).unwrap_err();
        assert!(matches!(err, ConnectError::Unreachable { attempts: 3 }));
        // Reset, then three 2 ms budgets and two retry pauses.
        assert_eq!(clock.now_ms(), 110 + 3 * 3 + 2 * 2_000);
        pin.done();

        ctrl.client_mut().stream_mut().set_responsive(true);
        let mut pin = reset_pin();
        let sig = ctrl.connect(&mut pin, None).unwrap();
        assert_eq!(sig.as_str(), "3pi1.1");
        pin.done();
    }

    #[test]
    fn priming_reads_then_calibrates() {
        let (_clock, mut ctrl) = controller();
        assert_eq!(ctrl.prime_sensors().unwrap(), b'c');
        assert_eq!(ctrl.client().stream().sensor_reads(), 10);
        assert_eq!(ctrl.calibration().calibrations_performed, 1);
    }

    #[test]
    fn step_follows_the_line() {
        let (_clock, mut ctrl) = controller();
        ctrl.client_mut().stream_mut().queue_frames([
            SensorFrame::new([0, 0, 1_000, 0, 0]),
            SensorFrame::new([900, 200, 0, 0, 0]),
            SensorFrame::new([0, 0, 0, 300, 950]),
        ]);
        let inputs = SensorInputs {
            distance_cm: Some(40),
            light: 700,
        };

        let report = ctrl.step(inputs).unwrap();
        assert_eq!(report.action, Some(DriveAction::Forward));
        assert!(report.headlights);
        assert_eq!(ctrl.client().stream().motor(Side::Left).payload(), 19);

        assert_eq!(ctrl.step(inputs).unwrap().action, Some(DriveAction::TurnLeft));
        assert_eq!(ctrl.motors().speeds(), (0.0, 0.45));
        assert_eq!(ctrl.client().stream().motor(Side::Right).payload(), 57);

        assert_eq!(ctrl.step(inputs).unwrap().action, Some(DriveAction::TurnRight));
        assert_eq!(ctrl.motors().speeds(), (0.45, 0.0));
        assert_eq!(ctrl.halted(), None);
    }

    #[test]
    fn junction_halts() {
        let (_clock, mut ctrl) = controller();
        ctrl.client_mut()
            .stream_mut()
            .queue_frames([SensorFrame::new([800, 900, 900, 900, 800])]);

        let report = ctrl.step(SensorInputs::default()).unwrap();
        assert_eq!(report.action, Some(DriveAction::Junction));
        assert_eq!(report.halted, Some(HaltReason::Junction));
        assert!(ctrl.motors().is_stopped());

        let reads = ctrl.client().stream().sensor_reads();
        let report = ctrl.step(SensorInputs::default()).unwrap();
        assert_eq!(report.action, None);
        assert_eq!(ctrl.client().stream().sensor_reads(), reads);

        ctrl.resume();
        ctrl.client_mut()
            .stream_mut()
            .set_idle_frame(SensorFrame::new([0, 0, 100, 400, 900]));
        assert_eq!(ctrl.step(SensorInputs::default()).unwrap().action, Some(DriveAction::TurnRight));
    }

    #[test]
    fn obstacle_ramps_down_and_halts() {
        let (_clock, mut ctrl) = controller();
        ctrl.drive(0.45, 0.45).unwrap();

        let report = ctrl
            .step(SensorInputs {
                distance_cm: Some(4),
                light: 0,
            })
            .unwrap();
        assert_eq!(report.halted, Some(HaltReason::Obstacle));
        assert!(!report.headlights);
        assert!(ctrl.motors().is_stopped());
        assert_eq!(ctrl.client().stream().sensor_reads(), 0);
        assert_eq!(ctrl.client().stream().motor(Side::Right).payload(), 0);
    }

    #[test]
    fn faulty_frames_trigger_calibration_in_the_loop() {
        let (_clock, mut ctrl) = controller();
        ctrl.prime_sensors().unwrap();
        ctrl.client_mut()
            .stream_mut()
            .queue_frames([SensorFrame::new([0; 5]); 6]);

        let mut calibrated = 0;
        for _ in 0..6 {
            let report = ctrl.step(SensorInputs::default()).unwrap();
            if report.calibration.is_some_and(|c| c.calibrated()) {
                calibrated += 1;
            }
        }
        assert_eq!(calibrated, 1);
        assert_eq!(ctrl.calibration().calibrations_performed, 2);
        assert_eq!(ctrl.client().stream().calibrations(), 2);
    }

    #[test]
    fn sensor_timeout_surfaces_to_caller() {
        let (_clock, mut ctrl) = controller();
        ctrl.client_mut().stream_mut().set_responsive(false);
        let err = ctrl.step(SensorInputs::default()).unwrap_err();
        assert_eq!(err, ProtocolError::Timeout { opcode: Opcode::CalibratedSensors });
        assert_eq!(ctrl.calibration().total_reads, 0);
    }
}
