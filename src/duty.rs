//! Duty-cycle governor.
//!
//! The piezo motors must not run for more than a fraction of any rolling time
//! window, or they overheat. For each governed axis a window of timestamped
//! moving/idle transitions is kept; a background task evaluates the moving
//! time over the window every ~10 ms and pauses the axis when the budget is
//! exceeded, resuming (and re-issuing the requested move) once the moving
//! average has fallen a hysteresis margin below the budget.
//!
//! Budgets come from the manufacturer's load table for the HR4 motors,
//! indexed by the measured motor force and the environment. The maximum speed
//! the motor box will command is 10 mm/s, so the velocity dependence of the
//! table collapses and force alone selects the row. Forces above the table
//! or an unknown environment select a "no motion allowed" entry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::client::DriveController;

/// Governor evaluation tick.
pub const TICK: Duration = Duration::from_millis(10);

/// The moving average must fall this far below the budget before a paused
/// axis resumes.
pub const RESUME_HYSTERESIS: f64 = 1.0;

/// A duty-cycle budget: allowed moving time over a rolling window, seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DutyParams {
    /// Moving time allowed within one window, seconds.
    pub time_allowed_on: f64,
    /// Length of the rolling window, seconds. May be infinite.
    pub window: f64,
}

impl DutyParams {
    /// The "no motion allowed" entry: zero budget over an unbounded window.
    pub fn prohibitive() -> Self {
        Self {
            time_allowed_on: 0.0,
            window: f64::INFINITY,
        }
    }
}

/// HR4 load table: (maximum force, air budget, vacuum budget). A negative
/// budget means the motor may run indefinitely at that load.
const HR4_TABLE: [(f64, (f64, f64), (f64, f64)); 7] = [
    (1.7, (-1.0, -1.0), (-1.0, -1.0)),
    (5.0, (-1.0, -1.0), (184.0, 418.2)),
    (7.6, (-1.0, -1.0), (107.0, 411.5)),
    (9.7, (-1.0, -1.0), (72.0, 423.5)),
    (11.5, (87.0, 111.5), (55.0, 423.1)),
    (13.7, (62.0, 110.7), (39.0, 433.3)),
    (14.5, (56.0, 112.0), (35.0, 437.5)),
];

/// Select the duty budget for a motor force and environment.
///
/// `None` means the motor may run without a governor at this load. Unknown
/// environments and forces above the table select the prohibitive entry.
pub fn params_for(force: f64, environment: &str) -> Option<DutyParams> {
    let pick = |budget: (f64, f64)| -> Option<DutyParams> {
        if budget.0 < 0.0 || budget.1 < 0.0 {
            None
        } else {
            Some(DutyParams {
                time_allowed_on: budget.0,
                window: budget.1,
            })
        }
    };
    match environment {
        "air" | "vacuum" => {
            for (fmax, air, vacuum) in HR4_TABLE {
                if force <= fmax {
                    let budget = if environment == "air" { air } else { vacuum };
                    return pick(budget);
                }
            }
            warn!("force {force} exceeds the load table. Motion will be prevented");
            Some(DutyParams::prohibitive())
        }
        other => {
            warn!("{other:?} is not a known environment (air or vacuum). Motion will be prevented");
            Some(DutyParams::prohibitive())
        }
    }
}

struct WindowState {
    /// One entry per change of the moving flag: (when, what it changed to).
    transitions: VecDeque<(Instant, bool)>,
    moving_now: bool,
    /// State of the axis just before the oldest retained transition.
    was_moving_at_window_start: bool,
    /// Whether a movement is currently wanted (used to decide whether resume
    /// should re-issue anything).
    movement_requested: bool,
}

/// A per-axis sliding window of motion transitions.
pub struct DutyWindow {
    params: DutyParams,
    state: Mutex<WindowState>,
}

impl DutyWindow {
    /// An empty window with the given budget.
    pub fn new(params: DutyParams) -> Self {
        Self {
            params,
            state: Mutex::new(WindowState {
                transitions: VecDeque::new(),
                moving_now: false,
                was_moving_at_window_start: false,
                movement_requested: false,
            }),
        }
    }

    /// The budget this window is evaluated against.
    pub fn params(&self) -> DutyParams {
        self.params
    }

    /// Record that the axis started moving. No-op if it already was: there is
    /// exactly one transition record per change of the flag.
    pub fn note_moving(&self, now: Instant) {
        let mut state = self.lock();
        if !state.moving_now {
            state.moving_now = true;
            state.transitions.push_back((now, true));
        }
    }

    /// Record that the axis stopped moving.
    pub fn note_idle(&self, now: Instant) {
        let mut state = self.lock();
        if state.moving_now {
            state.moving_now = false;
            state.transitions.push_back((now, false));
        }
    }

    /// Record whether a movement is currently wanted on this axis.
    pub fn set_requested(&self, requested: bool) {
        self.lock().movement_requested = requested;
    }

    /// Whether a movement is currently wanted on this axis.
    pub fn is_requested(&self) -> bool {
        self.lock().movement_requested
    }

    /// The moving time over the window ending at `now`, in seconds. Discards
    /// transitions older than the window. Always within `[0, window]`.
    pub fn moving_average(&self, now: Instant) -> f64 {
        let mut state = self.lock();
        let window = self.params.window;

        while let Some(&(when, value)) = state.transitions.front() {
            if now.duration_since(when).as_secs_f64() > window {
                state.was_moving_at_window_start = value;
                state.transitions.pop_front();
            } else {
                break;
            }
        }

        let mav = if state.transitions.is_empty() {
            if state.was_moving_at_window_start && state.moving_now {
                window
            } else {
                0.0
            }
        } else {
            let mut on_time = 0.0;
            for pair in state.transitions.iter().zip(state.transitions.iter().skip(1)) {
                let (&(start, value), &(end, _)) = pair;
                if value {
                    on_time += end.duration_since(start).as_secs_f64();
                }
            }
            if let Some(&(last, true)) = state.transitions.back() {
                on_time += now.duration_since(last).as_secs_f64();
            }
            if state.was_moving_at_window_start {
                if let Some(&(first, _)) = state.transitions.front() {
                    on_time += window - now.duration_since(first).as_secs_f64();
                }
            }
            on_time
        };
        mav.clamp(0.0, window)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Background task governing one axis.
pub struct DutyGovernor {
    axis: u8,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl DutyGovernor {
    /// Spawn the governor. The window must already be registered with the
    /// client so that command acceptance feeds transitions into it.
    pub fn spawn(axis: u8, window: Arc<DutyWindow>, client: Arc<DriveController>) -> Self {
        let stop = Arc::new(Notify::new());
        let stop_task = stop.clone();
        let task = tokio::spawn(async move {
            let allowed = window.params().time_allowed_on;
            let mut resting = false;
            loop {
                let mav = window.moving_average(Instant::now());

                if mav >= allowed && !resting {
                    resting = true;
                    info!("axis {axis}: duty-cycle threshold exceeded. Pausing motor");
                    client.governor_stop(axis).await;
                }

                // Unpausing needs the average strictly below the budget.
                if resting && mav <= allowed - RESUME_HYSTERESIS {
                    resting = false;
                    if window.is_requested() {
                        info!("axis {axis}: duty-cycle rest over. Resuming movement");
                        client.governor_resume(axis).await;
                    } else {
                        info!("axis {axis}: duty-cycle rest over, but nothing to resume");
                        client.release_pause(axis);
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(TICK) => {}
                    _ = stop_task.notified() => break,
                }
            }
        });
        Self { axis, stop, task }
    }

    /// The axis this governor watches.
    pub fn axis(&self) -> u8 {
        self.axis
    }

    /// Stop the governor task and wait for it to finish.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_selects_by_force() {
        // Force class E in vacuum: 55 s allowed in a 423.1 s window.
        let params = params_for(11.0, "vacuum").unwrap();
        assert_eq!(params.time_allowed_on, 55.0);
        assert_eq!(params.window, 423.1);

        // The same force in air has a different budget.
        let params = params_for(11.0, "air").unwrap();
        assert_eq!(params.time_allowed_on, 87.0);

        // Light loads run unlimited.
        assert!(params_for(1.0, "vacuum").is_none());
        assert!(params_for(4.0, "air").is_none());
    }

    #[test]
    fn test_table_fallbacks_prohibit_motion() {
        let params = params_for(20.0, "vacuum").unwrap();
        assert_eq!(params.time_allowed_on, 0.0);
        assert!(params.window.is_infinite());

        let params = params_for(5.0, "underwater").unwrap();
        assert_eq!(params, DutyParams::prohibitive());
    }

    #[test]
    fn test_single_transition_per_flag_change() {
        let window = DutyWindow::new(DutyParams {
            time_allowed_on: 1.0,
            window: 10.0,
        });
        let t0 = Instant::now();
        window.note_moving(t0);
        window.note_moving(t0 + Duration::from_millis(10));
        window.note_idle(t0 + Duration::from_millis(20));
        window.note_idle(t0 + Duration::from_millis(30));
        assert_eq!(window.lock().transitions.len(), 2);
    }

    #[test]
    fn test_moving_average_sums_on_intervals() {
        let window = DutyWindow::new(DutyParams {
            time_allowed_on: 5.0,
            window: 100.0,
        });
        let t0 = Instant::now();
        window.note_moving(t0);
        window.note_idle(t0 + Duration::from_secs(3));
        window.note_moving(t0 + Duration::from_secs(10));
        window.note_idle(t0 + Duration::from_secs(12));
        let mav = window.moving_average(t0 + Duration::from_secs(20));
        assert!((mav - 5.0).abs() < 1e-6, "mav = {mav}");
    }

    #[test]
    fn test_moving_average_open_interval_counts_to_now() {
        let window = DutyWindow::new(DutyParams {
            time_allowed_on: 5.0,
            window: 100.0,
        });
        let t0 = Instant::now();
        window.note_moving(t0);
        let mav = window.moving_average(t0 + Duration::from_secs(4));
        assert!((mav - 4.0).abs() < 1e-6, "mav = {mav}");
    }

    #[test]
    fn test_moving_average_trims_old_transitions() {
        let window = DutyWindow::new(DutyParams {
            time_allowed_on: 5.0,
            window: 10.0,
        });
        let t0 = Instant::now();
        window.note_moving(t0);
        window.note_idle(t0 + Duration::from_secs(4));
        // 20 s later both transitions are older than the window and the
        // motor is idle: nothing on.
        let mav = window.moving_average(t0 + Duration::from_secs(20));
        assert!(mav.abs() < 1e-6, "mav = {mav}");
        assert!(window.lock().transitions.is_empty());
    }

    #[test]
    fn test_moving_average_carries_in_from_before_window() {
        let window = DutyWindow::new(DutyParams {
            time_allowed_on: 5.0,
            window: 10.0,
        });
        let t0 = Instant::now();
        // Started moving at t0, stopped at t0+8. Evaluate at t0+12: the start
        // transition (age 12) has left the 10 s window, so the first 2 s of
        // window are carried in as "on"; plus the retained on-time up to the
        // stop at t0+8 gives 8 - 2 = 6 inside the window.
        window.note_moving(t0);
        window.note_idle(t0 + Duration::from_secs(8));
        let mav = window.moving_average(t0 + Duration::from_secs(12));
        assert!((mav - 6.0).abs() < 1e-6, "mav = {mav}");
    }

    #[test]
    fn test_continuous_motion_saturates_at_window() {
        let window = DutyWindow::new(DutyParams {
            time_allowed_on: 5.0,
            window: 10.0,
        });
        let t0 = Instant::now();
        window.note_moving(t0);
        let mav = window.moving_average(t0 + Duration::from_secs(30));
        assert!((mav - 10.0).abs() < 1e-6, "mav = {mav}");
    }

    #[test]
    fn test_prohibitive_budget_pauses_immediately_once_moving() {
        let window = DutyWindow::new(DutyParams::prohibitive());
        let t0 = Instant::now();
        assert!(window.moving_average(t0) >= 0.0);
        window.note_moving(t0);
        let mav = window.moving_average(t0 + Duration::from_millis(10));
        assert!(mav >= window.params().time_allowed_on);
    }
}
