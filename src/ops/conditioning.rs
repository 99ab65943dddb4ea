//! Conditioning sweep: reciprocate an axis between limits to run in new
//! motors, recovering automatically from stalls and tracking aborts.
//!
//! The sweep reacts to the controller's reported operation:
//!
//! - `Idle`: the leg finished; flip direction, re-issue the speed commands
//!   when they differ per direction (or on the first pass), move to the new
//!   limit. A stall is considered overcome only once the axis is travelling
//!   the other way and has moved a minimum distance away from where it
//!   stalled.
//! - `STALL ABORT`: count it; give up once both directions have stalled or
//!   the counter reaches its limit, otherwise reset and continue (the next
//!   idle leg reverses direction).
//! - `TRACKING ABORT`: nudge the axis back and forth in progressively larger
//!   steps; resume the interrupted leg on success, give up on failure.
//! - any other abort (except the benign `NOT ABORTED`): stop for safety.

use std::time::Duration;

use log::{info, warn};

use crate::client::DriveController;
use crate::error::{AbortKind, DriveError, DriveResult};
use crate::ops::CancelToken;
use crate::poller::Poller;
use crate::protocol::MotionStatus;

/// Minimum distance an axis must move away from a stall position before the
/// stall is considered overcome, in encoder steps.
pub const STALL_CLEAR_MIN_STEPS: i64 = 100;

/// Which limit the axis is travelling towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Heading for the negative (lower) limit.
    ToNegative,
    /// Heading for the positive (upper) limit.
    ToPositive,
}

impl Direction {
    /// The other direction.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::ToNegative => Direction::ToPositive,
            Direction::ToPositive => Direction::ToNegative,
        }
    }

    /// Sign of travel along the encoder axis.
    fn sign(&self) -> i64 {
        match self {
            Direction::ToNegative => -1,
            Direction::ToPositive => 1,
        }
    }
}

/// Configuration of one sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// The axis to condition.
    pub axis: u8,
    /// Lower end of the travel, encoder steps. Only meaningful on an axis
    /// that has been datumed.
    pub negative_limit: i64,
    /// Upper end of the travel, encoder steps.
    pub positive_limit: i64,
    /// Creep speed used on legs heading for the negative limit.
    pub creep_speed_negative: i64,
    /// Creep speed used on legs heading for the positive limit.
    pub creep_speed_positive: i64,
    /// Slew speed used on legs heading for the negative limit.
    pub slew_speed_negative: i64,
    /// Slew speed used on legs heading for the positive limit.
    pub slew_speed_positive: i64,
    /// Consecutive stalls tolerated before giving up.
    pub stall_limit: u32,
    /// Nudge rounds attempted after a tracking abort.
    pub tracking_limit: u32,
    /// Size of the first tracking nudge, encoder steps.
    pub tracking_initial_steps: i64,
    /// Pause between status polls.
    pub poll_interval: Duration,
}

impl SweepConfig {
    /// A sweep with the usual recovery limits.
    pub fn new(axis: u8, negative_limit: i64, positive_limit: i64) -> Self {
        Self {
            axis,
            negative_limit,
            positive_limit,
            creep_speed_negative: 50,
            creep_speed_positive: 50,
            slew_speed_negative: 200,
            slew_speed_positive: 200,
            stall_limit: 3,
            tracking_limit: 3,
            tracking_initial_steps: 1000,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Same creep and slew speed in both directions.
    pub fn with_speeds(mut self, creep: i64, slew: i64) -> Self {
        self.creep_speed_negative = creep;
        self.creep_speed_positive = creep;
        self.slew_speed_negative = slew;
        self.slew_speed_positive = slew;
        self
    }

    fn limit(&self, direction: Direction) -> i64 {
        match direction {
            Direction::ToNegative => self.negative_limit,
            Direction::ToPositive => self.positive_limit,
        }
    }

    fn creep(&self, direction: Direction) -> i64 {
        match direction {
            Direction::ToNegative => self.creep_speed_negative,
            Direction::ToPositive => self.creep_speed_positive,
        }
    }

    fn slew(&self, direction: Direction) -> i64 {
        match direction {
            Direction::ToNegative => self.slew_speed_negative,
            Direction::ToPositive => self.slew_speed_positive,
        }
    }

    fn speeds_differ(&self) -> bool {
        self.creep_speed_negative != self.creep_speed_positive
            || self.slew_speed_negative != self.slew_speed_positive
    }
}

/// Has a recorded stall been overcome?
///
/// Only when the axis is now travelling the other way and has moved more
/// than [`STALL_CLEAR_MIN_STEPS`] away from the stall position in the
/// direction of travel.
pub fn stall_overcome(
    travelling: Direction,
    stall_direction: Direction,
    position: i64,
    stall_position: i64,
) -> bool {
    if travelling == stall_direction {
        return false;
    }
    let delta = position - stall_position;
    delta.signum() == travelling.sign() && delta.abs() > STALL_CLEAR_MIN_STEPS
}

/// Run the sweep until cancelled or a recovery limit is hit. Pauses the
/// poller for the duration.
pub async fn run(
    client: &DriveController,
    poller: &Poller,
    config: SweepConfig,
    cancel: &CancelToken,
) -> DriveResult<()> {
    poller.pause();
    let result = sweep(client, &config, cancel).await;
    poller.resume();
    result
}

async fn sweep(
    client: &DriveController,
    config: &SweepConfig,
    cancel: &CancelToken,
) -> DriveResult<()> {
    let axis = config.axis;
    client.reset_axis(axis).await?;

    let mut travelling = Direction::ToNegative;
    let mut next = Direction::ToNegative;
    let mut first_pass = true;
    let mut stall_count: u32 = 0;
    let mut stall_direction: Option<Direction> = None;
    let mut stall_position: i64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(DriveError::Cancelled);
        }

        let status = match client.query_status(axis).await {
            Ok(status) => status,
            Err(e) if e.is_no_response() => MotionStatus::Unknown,
            Err(e) => return Err(e),
        };
        let position = client.poll_axis(axis).await.unwrap_or_else(|_| {
            client.axes().position(axis)
        });
        info!("{axis}: {position}, {}", status.as_str());

        match status {
            MotionStatus::Idle => {
                // End of a leg: set up the next one.
                if config.speeds_differ() || first_pass {
                    client.set_creep_speed(axis, config.creep(next)).await?;
                    client.set_slew_speed(axis, config.slew(next)).await?;
                }
                first_pass = false;

                client.move_absolute(axis, config.limit(next)).await?;
                travelling = next;
                next = next.opposite();

                if let Some(direction) = stall_direction {
                    if stall_overcome(travelling, direction, position, stall_position) {
                        info!("{axis}: overcame a stall, clearing the counter");
                        stall_count = 0;
                        stall_direction = None;
                    }
                }
            }
            MotionStatus::Aborted(AbortKind::Stall) => {
                if let Some(direction) = stall_direction {
                    if direction != travelling {
                        warn!("{axis}: stalling in both directions, a human needs to look at this");
                        return Err(DriveError::ResourceExhausted(format!(
                            "axis {axis} stalled in both directions"
                        )));
                    }
                }
                stall_count += 1;
                if stall_count >= config.stall_limit {
                    warn!("{axis}: stall limit reached, a human needs to look at this");
                    return Err(DriveError::ResourceExhausted(format!(
                        "axis {axis} hit the stall limit ({})",
                        config.stall_limit
                    )));
                }
                info!("{axis}: STALL ABORT at {position}, resetting and turning around");
                stall_direction = Some(travelling);
                stall_position = position;
                client.reset_axis(axis).await?;
            }
            MotionStatus::Aborted(AbortKind::Tracking) => {
                info!("{axis}: TRACKING ABORT, trying to nudge free");
                recover_tracking(client, config, travelling, cancel).await?;
                info!("{axis}: resuming after tracking abort");
                client.move_absolute(axis, config.limit(travelling)).await?;
            }
            MotionStatus::Aborted(kind) => {
                warn!("{axis}: motors aborted ({kind}). Stopping for safety");
                return Err(DriveError::MotionAborted { axis, kind });
            }
            // Still moving, benign reset reply, or nothing parseable: wait.
            MotionStatus::Moving | MotionStatus::NotAborted | MotionStatus::Unknown => {}
        }

        if !cancel.sleep(config.poll_interval).await {
            return Err(DriveError::Cancelled);
        }
    }
}

/// Nudge the axis back and forth in progressively larger steps until it
/// moves freely again.
async fn recover_tracking(
    client: &DriveController,
    config: &SweepConfig,
    travelling: Direction,
    cancel: &CancelToken,
) -> DriveResult<()> {
    let axis = config.axis;
    for round in 0..config.tracking_limit {
        client.reset_axis(axis).await?;

        let back = (2 * round as i64 + 1) * config.tracking_initial_steps;
        let step = back * travelling.opposite().sign();
        client.move_relative(axis, step).await?;
        if wait_until_settled(client, config, cancel).await?.is_fault() {
            warn!("{axis}: stalls in both directions during tracking recovery");
            return Err(DriveError::ResourceExhausted(format!(
                "axis {axis} cannot be nudged free in either direction"
            )));
        }

        let forward = (2 * round as i64 + 2) * config.tracking_initial_steps;
        let step = forward * travelling.sign();
        client.move_relative(axis, step).await?;
        if !wait_until_settled(client, config, cancel).await?.is_fault() {
            info!("{axis}: tracking abort fix worked");
            return Ok(());
        }
        // Aborted again; reset and try a larger nudge.
    }
    warn!("{axis}: couldn't fix the tracking abort, human intervention needed");
    Err(DriveError::ResourceExhausted(format!(
        "axis {axis} hit the tracking recovery limit ({})",
        config.tracking_limit
    )))
}

/// Poll until the axis reports idle or an abort.
async fn wait_until_settled(
    client: &DriveController,
    config: &SweepConfig,
    cancel: &CancelToken,
) -> DriveResult<MotionStatus> {
    loop {
        let position = client.poll_axis(config.axis).await.unwrap_or_else(|_| {
            client.axes().position(config.axis)
        });
        let status = match client.query_status(config.axis).await {
            Ok(status) => status,
            Err(e) if e.is_no_response() => MotionStatus::Unknown,
            Err(e) => return Err(e),
        };
        info!("{}: {position}, {}", config.axis, status.as_str());
        if status == MotionStatus::Idle || status.is_fault() {
            return Ok(status);
        }
        if !cancel.sleep(Duration::from_millis(500)).await {
            return Err(DriveError::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_overcome_requires_opposite_direction() {
        // Stalled while heading positive at 5000; still heading positive.
        assert!(!stall_overcome(
            Direction::ToPositive,
            Direction::ToPositive,
            5200,
            5000
        ));
    }

    #[test]
    fn test_stall_overcome_requires_minimum_travel() {
        // Heading negative after stalling positive, but only 50 steps away.
        assert!(!stall_overcome(
            Direction::ToNegative,
            Direction::ToPositive,
            4950,
            5000
        ));
        // 150 steps away in the direction of travel clears it.
        assert!(stall_overcome(
            Direction::ToNegative,
            Direction::ToPositive,
            4850,
            5000
        ));
    }

    #[test]
    fn test_stall_overcome_requires_expected_direction() {
        // Travelling negative but somehow past the stall on the positive
        // side: not overcome.
        assert!(!stall_overcome(
            Direction::ToNegative,
            Direction::ToPositive,
            5200,
            5000
        ));
        // Mirror case: stalled heading negative, now heading positive.
        assert!(stall_overcome(
            Direction::ToPositive,
            Direction::ToNegative,
            -1800,
            -2000
        ));
        assert!(!stall_overcome(
            Direction::ToPositive,
            Direction::ToNegative,
            -2200,
            -2000
        ));
    }

    #[test]
    fn test_direction_helpers() {
        assert_eq!(Direction::ToNegative.opposite(), Direction::ToPositive);
        assert_eq!(Direction::ToNegative.sign(), -1);
        assert_eq!(Direction::ToPositive.sign(), 1);
    }

    #[test]
    fn test_sweep_config_speed_selection() {
        let mut config = SweepConfig::new(5, -13500, 16700).with_speeds(50, 200);
        assert!(!config.speeds_differ());
        config.slew_speed_negative = 150;
        assert!(config.speeds_differ());
        assert_eq!(config.limit(Direction::ToNegative), -13500);
        assert_eq!(config.limit(Direction::ToPositive), 16700);
        assert_eq!(config.slew(Direction::ToNegative), 150);
        assert_eq!(config.slew(Direction::ToPositive), 200);
        assert_eq!(config.creep(Direction::ToPositive), 50);
    }
}
