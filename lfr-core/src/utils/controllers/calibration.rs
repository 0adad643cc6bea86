//! Line-sensor auto-calibration policy.
//!
//! The board maps raw reflectance readings into `[0, 1000]` using per-sensor
//! bounds it learns during auto-calibration. When those bounds go stale
//! (lighting changes, the robot was lifted, the first calibration happened off
//! the track) the calibrated frames drift out of range or flatten out. The
//! policy watches every frame, counts the bad ones and asks the board to
//! re-calibrate once the count says the bounds can no longer be trusted.

use embedded_hal::delay::DelayNs;

use crate::utils::{
    config::CalibrationConfig,
    protocol::{ProtocolClient, ProtocolError, SensorFrame},
    serial::{ByteStream, Clock},
};

/// Why a frame was judged to come from stale calibration bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFault {
    /// A reading is above the calibrated range.
    OutOfRange { max: u16 },
    /// Every reading sits at the bottom of the range.
    Flat,
    /// Every reading sits at the top of the range.
    Saturated,
}

/// What caused a calibration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Forced,
    /// A faulty frame before the board was ever calibrated through the policy.
    FirstError,
    /// More faulty frames than the threshold since the last calibration.
    Streak,
}

/// Counters owned by the caller and updated by [`CalibrationPolicy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalibrationState {
    pub total_reads: u32,
    /// Faulty frames since the last successful calibration.
    pub error_streak: u32,
    pub calibrations_performed: u32,
}

/// Result of feeding one frame to the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// No calibration was needed.
    Kept { fault: Option<FrameFault> },
    /// The board re-calibrated and answered with `status`.
    Calibrated {
        trigger: Trigger,
        status: u8,
        fault: Option<FrameFault>,
    },
}

impl CalibrationOutcome {
    pub fn calibrated(&self) -> bool {
        matches!(self, CalibrationOutcome::Calibrated { .. })
    }

    pub fn fault(&self) -> Option<FrameFault> {
        match *self {
            CalibrationOutcome::Kept { fault } | CalibrationOutcome::Calibrated { fault, .. } => fault,
        }
    }
}

pub struct CalibrationPolicy {
    config: CalibrationConfig,
}

impl CalibrationPolicy {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Judge a frame against the calibrated range.
    pub fn classify(
        &self,
        frame: &SensorFrame,
    ) -> Option<FrameFault> {
        let (min, max) = (frame.min(), frame.max());
        if max > self.config.max_value {
            Some(FrameFault::OutOfRange { max })
        } else if max == self.config.min_value {
            Some(FrameFault::Flat)
        } else if min == self.config.max_value {
            Some(FrameFault::Saturated)
        } else {
            None
        }
    }

    /// Count a frame and return its fault, if any.
    pub fn observe(
        &self,
        state: &mut CalibrationState,
        frame: &SensorFrame,
    ) -> Option<FrameFault> {
        let fault = self.classify(frame);
        if fault.is_some() {
            state.error_streak += 1;
        }
        state.total_reads += 1;
        fault
    }

    /// Decide whether the counters (already updated for the current frame) call for calibration.
    pub fn trigger(
        &self,
        state: &CalibrationState,
        force: bool,
    ) -> Option<Trigger> {
        if force {
            Some(Trigger::Forced)
        } else if state.calibrations_performed == 0 && state.error_streak > 0 {
            Some(Trigger::FirstError)
        } else if state.error_streak > self.config.error_threshold {
            Some(Trigger::Streak)
        } else {
            None
        }
    }

    /// Feed one frame; re-calibrate through `client` if the rules say so.
    ///
    /// On a timeout the error is returned and the calibration counters are left
    /// alone, so the next frame meets the same trigger and retries.
    pub fn evaluate_frame<S, C, D>(
        &self,
        state: &mut CalibrationState,
        client: &mut ProtocolClient<S, C, D>,
        frame: &SensorFrame,
        force: bool,
    ) -> Result<CalibrationOutcome, ProtocolError<S::Error>>
    where
        S: ByteStream,
        C: Clock,
        D: DelayNs,
    {
        let fault = self.observe(state, frame);
        if let Some(fault) = fault {
            tracing::warn!(?fault, streak = state.error_streak, ?frame, "sensor frame out of calibration");
        }

        match self.trigger(state, force) {
            Some(trigger) => {
                let status = self.calibrate(state, client, trigger)?;
                Ok(CalibrationOutcome::Calibrated {
                    trigger,
                    status,
                    fault,
                })
            }
            None => Ok(CalibrationOutcome::Kept { fault }),
        }
    }

    /// Run auto-calibration now and update the counters on success.
    pub fn calibrate<S, C, D>(
        &self,
        state: &mut CalibrationState,
        client: &mut ProtocolClient<S, C, D>,
        trigger: Trigger,
    ) -> Result<u8, ProtocolError<S::Error>>
    where
        S: ByteStream,
        C: Clock,
        D: DelayNs,
    {
        tracing::info!(?trigger, streak = state.error_streak, "initiating auto-calibration");
        // Give whoever placed the robot time to let go before it starts spinning.
        client.pause_ms(self.config.settle_ms);

        let status = client.request_calibration().inspect_err(|err| {
            tracing::warn!(%err, "auto-calibration failed");
        })?;
        state.calibrations_performed += 1;
        state.error_streak = 0;
        tracing::info!(status, count = state.calibrations_performed, "auto-calibration done");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{
        config::SerialConfig,
        protocol::Opcode,
        serial::mock::{SimBoard, SimClock, SimDelay},
    };

    type Client = ProtocolClient<SimBoard<SimClock>, SimClock, SimDelay>;

    fn client() -> (SimClock, Client) {
        let clock = SimClock::new();
        let config = SerialConfig::default();
        let board = SimBoard::new(clock.clone(), config.baud_rate);
        (clock.clone(), ProtocolClient::new(board, clock.clone(), clock.delay(), config))
    }

    fn policy() -> CalibrationPolicy {
        CalibrationPolicy::new(CalibrationConfig::default())
    }

    const GOOD: SensorFrame = SensorFrame::new([0, 120, 980, 300, 0]);
    const FLAT: SensorFrame = SensorFrame::new([0; 5]);
    const SATURATED: SensorFrame = SensorFrame::new([1_000; 5]);

    #[test]
    fn classify_bounds() {
        let p = policy();
        assert_eq!(p.classify(&GOOD), None);
        assert_eq!(p.classify(&FLAT), Some(FrameFault::Flat));
        assert_eq!(p.classify(&SATURATED), Some(FrameFault::Saturated));
        assert_eq!(
            p.classify(&SensorFrame::new([0, 1_001, 3, 4, 5])),
            Some(FrameFault::OutOfRange { max: 1_001 })
        );
        // Touching either end on some sensors is normal.
        assert_eq!(p.classify(&SensorFrame::new([0, 1_000, 1_000, 1_000, 1_000])), None);
        assert_eq!(p.classify(&SensorFrame::new([1, 0, 0, 0, 0])), None);
    }

    #[test]
    fn first_flat_frame_calibrates_and_resets_streak() {
        let (_clock, mut client) = client();
        let p = policy();
        let mut state = CalibrationState::default();

        let outcome = p.evaluate_frame(&mut state, &mut client, &FLAT, false).unwrap();
        assert_eq!(
            outcome,
            CalibrationOutcome::Calibrated {
                trigger: Trigger::FirstError,
                status: b'c',
                fault: Some(FrameFault::Flat),
            }
        );
        assert_eq!(
            state,
            CalibrationState {
                total_reads: 1,
                error_streak: 0,
                calibrations_performed: 1
            }
        );
        assert_eq!(client.stream().calibrations(), 1);
    }

    #[test]
    fn good_frames_never_calibrate() {
        let (_clock, mut client) = client();
        let p = policy();
        let mut state = CalibrationState::default();
        for _ in 0..50 {
            let outcome = p.evaluate_frame(&mut state, &mut client, &GOOD, false).unwrap();
            assert_eq!(outcome, CalibrationOutcome::Kept { fault: None });
        }
        assert_eq!(state.total_reads, 50);
        assert_eq!(client.stream().calibrations(), 0);
    }

    #[test]
    fn streak_triggers_on_sixth_faulty_frame() {
        let (_clock, mut client) = client();
        let p = policy();
        let mut state = CalibrationState {
            calibrations_performed: 1,
            ..Default::default()
        };

        let triggered: Vec<usize> = (1..=12)
            .filter(|_| {
                p.evaluate_frame(&mut state, &mut client, &SATURATED, false)
                    .unwrap()
                    .calibrated()
            })
            .collect();
        assert_eq!(triggered, vec![6, 12]);
        assert_eq!(state.calibrations_performed, 3);
        assert_eq!(state.error_streak, 0);
    }

    #[test]
    fn streak_is_not_reset_by_good_frames() {
        let (_clock, mut client) = client();
        let p = policy();
        let mut state = CalibrationState {
            calibrations_performed: 1,
            ..Default::default()
        };
        let script = [FLAT, GOOD, FLAT, GOOD, FLAT, FLAT, GOOD, FLAT, GOOD, FLAT];
        let mut calibrated_at = None;
        for (i, frame) in script.iter().enumerate() {
            if p.evaluate_frame(&mut state, &mut client, frame, false).unwrap().calibrated() {
                calibrated_at = Some(i);
            }
        }
        // Sixth faulty frame is index 9.
        assert_eq!(calibrated_at, Some(9));
    }

    #[test]
    fn forced_calibration_ignores_frame() {
        let (clock, mut client) = client();
        let p = policy();
        let mut state = CalibrationState::default();
        let outcome = p.evaluate_frame(&mut state, &mut client, &GOOD, true).unwrap();
        assert!(matches!(
            outcome,
            CalibrationOutcome::Calibrated { trigger: Trigger::Forced, fault: None, .. }
        ));
        // Settle pause plus roughly a second of board-side calibration.
        assert!(clock.now_ms() >= 2_000);
    }

    #[test]
    fn timeout_leaves_counters_for_retry() {
        let (_clock, mut client) = client();
        let p = policy();
        let mut state = CalibrationState::default();
        client.stream_mut().set_responsive(false);

        let err = p.evaluate_frame(&mut state, &mut client, &FLAT, false).unwrap_err();
        assert_eq!(err, ProtocolError::Timeout { opcode: Opcode::AutoCalibrate });
        assert_eq!(
            state,
            CalibrationState {
                total_reads: 1,
                error_streak: 1,
                calibrations_performed: 0
            }
        );

        // Same trigger on the next frame, this time answered.
        client.stream_mut().set_responsive(true);
        let outcome = p.evaluate_frame(&mut state, &mut client, &GOOD, false).unwrap();
        assert!(matches!(
            outcome,
            CalibrationOutcome::Calibrated { trigger: Trigger::FirstError, fault: None, .. }
        ));
        assert_eq!(state.error_streak, 0);
        assert_eq!(state.calibrations_performed, 1);
    }

    #[test]
    fn failed_calibration_status_leaves_counters_for_retry() {
        let (_clock, mut client) = client();
        let p = policy();
        let mut state = CalibrationState::default();
        client.stream_mut().set_calibration_status(0xFF);

        let err = p.evaluate_frame(&mut state, &mut client, &FLAT, false).unwrap_err();
        assert_eq!(err, ProtocolError::CalibrationFailed { status: 0xFF });
        assert_eq!(
            state,
            CalibrationState {
                total_reads: 1,
                error_streak: 1,
                calibrations_performed: 0
            }
        );

        client.stream_mut().set_calibration_status(b'c');
        let outcome = p.evaluate_frame(&mut state, &mut client, &GOOD, false).unwrap();
        assert!(matches!(
            outcome,
            CalibrationOutcome::Calibrated { trigger: Trigger::FirstError, status: b'c', .. }
        ));
        assert_eq!(state.calibrations_performed, 1);
        assert_eq!(client.stream().calibrations(), 2);
    }
}
