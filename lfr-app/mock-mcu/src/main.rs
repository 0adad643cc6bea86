use std::{error::Error, path::PathBuf};

use clap::Parser;
use embedded_hal::delay::DelayNs;
use embedded_hal_mock::eh1::digital::{Mock as PinMock, State as PinState, Transaction as PinTrans};
use lfr_core::utils::{
    DriveController, RobotConfig,
    controllers::{HaltReason, SensorInputs},
    protocol::{SensorFrame, Side},
    serial::{
        Clock, EmbassyClock,
        mock::{SimBoard, SimClock},
    },
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// JSON file overriding the default tunables
    #[clap(long)]
    config: Option<PathBuf>,
    /// Print the effective configuration as JSON and exit
    #[clap(long)]
    print_config: bool,
    /// Number of drive steps to simulate
    #[clap(long, default_value_t = 120)]
    steps: u32,
    /// Run on the wall clock instead of virtual time
    #[clap(long)]
    realtime: bool,
    /// Simulated battery level in millivolts
    #[clap(long, default_value_t = 4_800)]
    battery_mv: u16,
    /// Step at which an obstacle appears 3 cm in front of the robot
    #[clap(long)]
    obstacle_at: Option<u32>,
    /// Extra board processing latency in milliseconds
    #[clap(long, default_value_t = 0)]
    latency_ms: u32,
}

/// Calibrated frames for a short course: straight, a left bend, a stretch
/// where the robot is lifted off the floor, a right bend, then the end-of-course bar.
fn course(steps: u32) -> Vec<SensorFrame> {
    (0..steps.saturating_sub(1))
        .map(|i| match i % 40 {
            0..=9 => SensorFrame::new([0, 80, 1_000, 90, 0]),
            10..=13 => SensorFrame::new([820, 640, 120, 0, 0]),
            14..=21 => SensorFrame::new([0; 5]),
            22..=25 => SensorFrame::new([0, 0, 150, 600, 870]),
            _ => SensorFrame::new([10, 300, 960, 280, 12]),
        })
        .chain(std::iter::once(SensorFrame::new([900, 950, 980, 940, 910])))
        .collect()
}

/// Ambient light drifting through the headlight threshold.
fn light_at(step: u32) -> u16 {
    (300 + (step * 37) % 500) as u16
}

fn run<C, D>(
    clock: C,
    delay: D,
    config: RobotConfig,
    opts: &Opts,
) -> Result<(), Box<dyn Error>>
where
    C: Clock + Clone,
    D: DelayNs,
{
    let mut board = SimBoard::new(clock.clone(), config.serial.baud_rate).with_latency(opts.latency_ms);
    board.set_battery_mv(opts.battery_mv);
    let mut ctrl = DriveController::new(board, clock, delay, config);

    let mut reset = PinMock::new(&[PinTrans::set(PinState::Low), PinTrans::set(PinState::High)]);
    let signature = ctrl
        .connect(&mut reset, Some(5))
        .map_err(|e| format!("board did not come up: {e:?}"))?;
    reset.done();
    info!(%signature, "connected");

    match ctrl.battery() {
        Ok(battery) => info!(volts = battery.volts(), "battery level"),
        Err(e) => warn!(%e, "battery read failed"),
    }
    ctrl.client_mut().clear_display()?;
    ctrl.client_mut().print(signature.as_str())?;

    ctrl.prime_sensors()?;
    ctrl.client_mut().stream_mut().queue_frames(course(opts.steps));

    for step in 0..opts.steps {
        let inputs = SensorInputs {
            distance_cm: match opts.obstacle_at {
                Some(at) if step >= at => Some(3),
                _ => Some(80),
            },
            light: light_at(step),
        };
        match ctrl.step(inputs) {
            Ok(report) => {
                info!(
                    step,
                    action = ?report.action,
                    headlights = report.headlights,
                    calibration = ?report.calibration,
                    "drive step"
                );
                if let Some(reason) = report.halted {
                    match reason {
                        HaltReason::Obstacle => warn!(step, "halted in front of an obstacle"),
                        HaltReason::Junction => info!(step, "end of course"),
                    }
                    break;
                }
            }
            Err(e) if e.is_timeout() => warn!(step, %e, "sensor read timed out, retrying"),
            Err(e) => {
                error!(step, %e, "protocol failure");
                return Err(e.to_string().into());
            }
        }
    }

    let board = ctrl.client().stream();
    info!(
        state = ?ctrl.calibration(),
        board_calibrations = board.calibrations(),
        motor_commands = board.motor_log().len(),
        left = ?board.motor(Side::Left),
        right = ?board.motor(Side::Right),
        lcd = board.lcd(),
        "run finished"
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => RobotConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => RobotConfig::default(),
    };
    if opts.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if opts.realtime {
        info!("running on the wall clock");
        run(EmbassyClock, embassy_time::Delay, config, &opts)
    } else {
        let clock = SimClock::new();
        let delay = clock.delay();
        run(clock, delay, config, &opts)
    }
}
