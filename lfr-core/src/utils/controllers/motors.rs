//! Drive motor bookkeeping and the smooth stop ramp.

use embedded_hal::delay::DelayNs;

use crate::utils::{
    config::RampConfig,
    protocol::{MotorCommand, ProtocolClient, ProtocolError, Side},
    serial::{ByteStream, Clock},
};

/// Slack for float drift when stepping toward zero.
const ZERO_EPSILON: f32 = 1e-6;

/// Last speed commanded on each side.
///
/// The board is write-only for motors, so this is the only record of what the
/// wheels are doing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotorState {
    speeds: [f32; 2],
}

impl MotorState {
    pub fn speed(
        &self,
        side: Side,
    ) -> f32 {
        self.speeds[side.index()]
    }

    pub fn speeds(&self) -> (f32, f32) {
        (self.speeds[0], self.speeds[1])
    }

    pub fn is_stopped(&self) -> bool {
        self.speeds.iter().all(|&s| s == 0.0)
    }

    /// Command one side and record the speed that was actually sent.
    pub fn drive<S, C, D>(
        &mut self,
        client: &mut ProtocolClient<S, C, D>,
        side: Side,
        speed: f32,
    ) -> Result<(), ProtocolError<S::Error>>
    where
        S: ByteStream,
        C: Clock,
        D: DelayNs,
    {
        let command = MotorCommand::new(side, speed);
        client.send_motor_command(command)?;
        self.speeds[side.index()] = command.speed;
        Ok(())
    }
}

/// Linear ramp-down of both motors to a standstill.
///
/// One [`advance`](StopRamp::advance) is one step of the ramp, so a caller can
/// stop stepping at any point and the state stays consistent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopRamp {
    step: f32,
    interval_ms: u32,
}

impl StopRamp {
    /// A non-positive or non-finite step stops in a single step.
    pub fn new(config: RampConfig) -> Self {
        let step = if config.step.is_finite() && config.step > 0.0 {
            config.step
        } else {
            1.0
        };
        Self {
            step,
            interval_ms: config.interval_ms,
        }
    }

    pub fn step(&self) -> f32 {
        self.step
    }

    /// Upper bound on the number of steps from any speed in `[-1.0, 1.0]`.
    pub fn max_steps(&self) -> usize {
        libm::ceilf(1.0 / self.step) as usize + 1
    }

    /// Move both sides one step toward zero and return the new speeds, or
    /// `None` once both are already stopped.
    pub fn advance(
        &self,
        state: &mut MotorState,
    ) -> Option<(f32, f32)> {
        if state.is_stopped() {
            return None;
        }
        for speed in state.speeds.iter_mut() {
            *speed = toward_zero(*speed, self.step);
        }
        Some(state.speeds())
    }

    /// Ramp both motors down to zero, re-sending both commands after every
    /// step and pausing the ramp interval in between. Returns the number of
    /// steps taken.
    pub fn run<S, C, D>(
        &self,
        client: &mut ProtocolClient<S, C, D>,
        state: &mut MotorState,
    ) -> Result<usize, ProtocolError<S::Error>>
    where
        S: ByteStream,
        C: Clock,
        D: DelayNs,
    {
        let mut steps = 0;
        while let Some((left, right)) = self.advance(state) {
            client.send_motor_command(MotorCommand::new(Side::Left, left))?;
            client.send_motor_command(MotorCommand::new(Side::Right, right))?;
            client.pause_ms(self.interval_ms);
            steps += 1;
        }
        tracing::debug!(steps, "motors ramped to a stop");
        Ok(steps)
    }
}

fn toward_zero(
    speed: f32,
    step: f32,
) -> f32 {
    let magnitude = libm::fabsf(speed);
    if magnitude <= step + ZERO_EPSILON {
        0.0
    } else {
        libm::copysignf(magnitude - step, speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{
        config::SerialConfig,
        serial::mock::{SimBoard, SimClock},
    };

    fn ramp() -> StopRamp {
        StopRamp::new(RampConfig::default())
    }

    #[test]
    fn advance_steps_toward_zero() {
        let r = ramp();
        let mut state = MotorState { speeds: [0.2, -0.12] };

        let (l, r1) = r.advance(&mut state).unwrap();
        assert!((l - 0.15).abs() < 1e-6);
        assert!((r1 + 0.07).abs() < 1e-6);

        let (_, r2) = r.advance(&mut state).unwrap();
        assert!((r2 + 0.02).abs() < 1e-6);
        let (_, r3) = r.advance(&mut state).unwrap();
        assert_eq!(r3, 0.0);
        assert_eq!(r.advance(&mut state), Some((0.0, 0.0)));
        assert!(state.is_stopped());
        assert_eq!(r.advance(&mut state), None);
    }

    #[test]
    fn advance_is_bounded() {
        let r = ramp();
        for start in [1.0f32, -1.0, 0.999, 0.45, 0.05, 0.0001] {
            let mut state = MotorState { speeds: [start, -start] };
            let mut steps = 0;
            while r.advance(&mut state).is_some() {
                steps += 1;
                assert!(steps <= r.max_steps());
            }
            assert_eq!(state.speeds(), (0.0, 0.0));
        }
    }

    #[test]
    fn bad_step_stops_at_once() {
        let r = StopRamp::new(RampConfig {
            step: 0.0,
            interval_ms: 35,
        });
        let mut state = MotorState { speeds: [0.7, 0.3] };
        assert_eq!(r.advance(&mut state), Some((0.0, 0.0)));
        assert_eq!(r.advance(&mut state), None);
    }

    #[test]
    fn run_resends_both_sides_each_step() {
        let clock = SimClock::new();
        let config = SerialConfig::default();
        let board = SimBoard::new(clock.clone(), config.baud_rate);
        let mut client = ProtocolClient::new(board, clock.clone(), clock.delay(), config);
        let mut state = MotorState::default();
        state.drive(&mut client, Side::Left, 0.2).unwrap();
        state.drive(&mut client, Side::Right, 0.2).unwrap();

        let steps = ramp().run(&mut client, &mut state).unwrap();
        assert_eq!(steps, 4);
        assert_eq!(clock.now_ms(), 4 * 35);

        let log = client.stream().motor_log();
        // Two initial commands plus two per step.
        assert_eq!(log.len(), 2 + 2 * 4);
        let payloads: Vec<u8> = log[2..].iter().step_by(2).map(|c| c.payload()).collect();
        assert_eq!(payloads, vec![19, 13, 6, 0]);
        assert_eq!(client.stream().motor(Side::Left).payload(), 0);
        assert_eq!(client.stream().motor(Side::Right).payload(), 0);
        assert!(state.is_stopped());
    }

    #[test]
    fn run_on_stopped_motors_sends_nothing() {
        let clock = SimClock::new();
        let config = SerialConfig::default();
        let board = SimBoard::new(clock.clone(), config.baud_rate);
        let mut client = ProtocolClient::new(board, clock.clone(), clock.delay(), config);
        let mut state = MotorState::default();
        assert_eq!(ramp().run(&mut client, &mut state).unwrap(), 0);
        assert!(client.stream().written().is_empty());
    }
}
