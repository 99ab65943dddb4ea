//! In-process simulation of the motor controller.
//!
//! `SimTransport` implements the same byte-channel contract as the real
//! device, so the rest of the system cannot tell them apart. Each simulated
//! axis runs a deterministic stepwise motion model on a shared ~100 ms tick:
//! if the target differs from the current encoder and the axis is not
//! aborted, it steps toward the target by `slew_speed × tick`, snapping to
//! the target (and reporting idle) when it would overshoot. Abort latches
//! the target to the current position; reset clears only if aborted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::DriveResult;
use crate::link::{Transport, SIMULATOR_PORT};

/// Simulation tick length.
pub const TIME_STEP: Duration = Duration::from_millis(100);

/// Default encoder seed used when none is supplied, one value per axis.
pub const DEFAULT_SEED: [i64; 7] = [19459, -40120, 12246, -12587, 0, 2066, 14926];

const SIM_READ_DEADLINE: Duration = Duration::from_millis(100);

static SIM_COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)([a-z]{2})(-?\d*)\r$").unwrap_or_else(|e| panic!("sim command regex: {e}"))
});

/// One simulated motor.
struct MotorSim {
    axis: u8,
    encoder: f64,
    target: f64,
    creep_speed: i64,
    slew_speed: i64,
    aborted: bool,
    status: String,
}

impl MotorSim {
    fn new(axis: u8) -> Self {
        Self {
            axis,
            encoder: 0.0,
            target: 0.0,
            creep_speed: 100,
            slew_speed: 2000,
            aborted: false,
            status: "STATUS".to_string(),
        }
    }

    fn step(&mut self, dt: f64) {
        if self.target != self.encoder && !self.aborted {
            let direction = if self.target < self.encoder { -1.0 } else { 1.0 };
            let distance = direction * dt * self.slew_speed as f64;
            if (self.encoder - self.target).abs() < distance.abs() {
                self.encoder = self.target;
                self.status = "Idle (TO BE CHECKED)".to_string();
            } else {
                self.encoder += distance;
            }
        }
        if self.aborted {
            self.target = self.encoder;
        }
    }

    fn move_to(&mut self, target: i64) {
        self.target = target as f64;
        self.status = format!("{:02}:! MOVING TO {target}", self.axis);
    }

    fn set_position(&mut self, encoder: i64) {
        self.encoder = encoder as f64;
        self.target = encoder as f64;
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.status = format!("{:02}:! COMMAND ABORT", self.axis);
    }

    fn reset(&mut self) {
        if self.aborted {
            self.status = format!("{:02}: RESET", self.axis);
        } else {
            self.status = format!("{:02}:! NOT ABORTED", self.axis);
        }
        self.aborted = false;
    }
}

/// Drop-in replacement for the serial transport, backed by simulated motors.
pub struct SimTransport {
    motors: Arc<Mutex<Vec<MotorSim>>>,
    outbox: VecDeque<String>,
    open: bool,
    tick_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl SimTransport {
    /// Simulator with the default encoder seed.
    pub fn new() -> Self {
        Self::with_initial_positions(&DEFAULT_SEED)
    }

    /// Simulator with explicit initial encoder positions, one per axis.
    pub fn with_initial_positions(seed: &[i64]) -> Self {
        let motors = seed
            .iter()
            .enumerate()
            .map(|(index, &encoder)| {
                let mut motor = MotorSim::new(index as u8 + 1);
                motor.set_position(encoder);
                motor
            })
            .collect();
        Self {
            motors: Arc::new(Mutex::new(motors)),
            outbox: VecDeque::new(),
            open: false,
            tick_task: None,
            shutdown_tx: None,
        }
    }

    /// Process one command line and return the reply lines to queue.
    fn process_command(&self, input: &str) -> Vec<String> {
        let Some(caps) = SIM_COMMAND_RE.captures(input) else {
            return vec![format!(
                "{input}00:! UNKNOWN COMMAND RECEIVED BY SIMULATION!\r\n"
            )];
        };
        let axis: usize = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let verb = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let arg: Option<i64> = caps.get(3).and_then(|m| m.as_str().parse().ok());

        let mut motors = self.motors.lock().unwrap_or_else(|e| e.into_inner());
        let Some(motor) = axis.checked_sub(1).and_then(|i| motors.get_mut(i)) else {
            return vec![format!(
                "{input}00:! UNKNOWN COMMAND RECEIVED BY SIMULATION!\r\n"
            )];
        };

        let body = match (verb, arg) {
            ("oa", _) => {
                let encoder = motor.encoder as i64;
                format!("{:02}:{:<12}", motor.axis, encoder)
            }
            ("ma", Some(target)) => {
                let body = motor.status.clone();
                if !motor.aborted {
                    motor.move_to(target);
                }
                body
            }
            ("mr", Some(delta)) => {
                let body = motor.status.clone();
                if !motor.aborted {
                    let target = motor.encoder as i64 + delta;
                    motor.move_to(target);
                }
                body
            }
            ("ap", Some(position)) => {
                motor.set_position(position);
                format!("{:02}:! OK", motor.axis)
            }
            ("ab", _) => {
                motor.abort();
                motor.status.clone()
            }
            ("rs", _) => {
                motor.reset();
                motor.status.clone()
            }
            ("co", _) => {
                // The real box answers co with the current operation, not the
                // last command's reply.
                let text = if motor.aborted {
                    motor
                        .status
                        .split_once(':')
                        .map(|(_, tail)| tail.trim().to_string())
                        .unwrap_or_else(|| motor.status.clone())
                } else if motor.target != motor.encoder {
                    format!("! MOVING TO {}", motor.target as i64)
                } else {
                    "Idle".to_string()
                };
                format!("{:02}:{}", motor.axis, text)
            }
            ("qa", _) => {
                let mut lines = vec![
                    format!(
                        "{input}{:02}Mclennan Digiloop Motor Controller V1.04   Servo mode\r\n",
                        motor.axis
                    ),
                    format!("Input command: {}qa\r\n", motor.axis),
                    format!(
                        "Address = {}                          Privilege level = 8\r\n",
                        motor.axis
                    ),
                    format!("Mode = {}\r\n", motor.status),
                    format!(
                        "Slew speed = {}                     Limit decel = 20000000\r\n",
                        motor.slew_speed
                    ),
                    "Acceleration = 1000                  Deceleration = 1500\r\n".to_string(),
                    format!(
                        "Creep speed = {}                    Creep steps = 0\r\n",
                        motor.creep_speed
                    ),
                    "Settling time = 100                  Backoff steps = 0\r\n".to_string(),
                    "Tracking = 4000                      Timeout = 8000\r\n".to_string(),
                    "Lower soft limit = -113933           Upper soft limit = 10000000\r\n"
                        .to_string(),
                    "Gearbox ratio =     1/1              Encoder ratio = -1/1\r\n".to_string(),
                    format!(
                        "Command pos = {0}                      Actual pos = {0}\r\n",
                        motor.encoder as i64
                    ),
                    "Valid sequences: none (Autoexec disabled)\r\n".to_string(),
                    "Read port: 00000000                  Last write: 00000000\r\n".to_string(),
                ];
                // Empty line tells the client the block is over.
                lines.push(String::new());
                return lines;
            }
            _ => format!(
                "{:02}:! UNKNOWN COMMAND RECEIVED BY SIMULATION!",
                motor.axis
            ),
        };
        vec![format!("{input}{body}\r\n")]
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn open(&mut self) -> DriveResult<()> {
        if self.open {
            return Ok(());
        }
        self.open = true;
        let motors = self.motors.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.tick_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TIME_STEP);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut motors = motors.lock().unwrap_or_else(|e| e.into_inner());
                        for motor in motors.iter_mut() {
                            motor.step(TIME_STEP.as_secs_f64());
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        }));
        debug!("simulated motor box started");
        Ok(())
    }

    async fn close(&mut self) -> DriveResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.tick_task.take() {
            let _ = task.await;
        }
        self.outbox.clear();
        debug!("simulated motor box stopped");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn port_name(&self) -> &str {
        SIMULATOR_PORT
    }

    async fn write(&mut self, bytes: &[u8]) -> DriveResult<()> {
        let input = String::from_utf8_lossy(bytes).into_owned();
        if input.is_empty() {
            return Ok(());
        }
        let replies = self.process_command(&input);
        self.outbox.extend(replies);
        Ok(())
    }

    async fn read_line(&mut self) -> DriveResult<String> {
        if let Some(line) = self.outbox.pop_front() {
            return Ok(line);
        }
        // Model the port's (short) read deadline.
        tokio::time::sleep(SIM_READ_DEADLINE).await;
        Ok(self.outbox.pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> SimTransport {
        SimTransport::new()
    }

    #[test]
    fn test_oa_reply_format() {
        let transport = sim();
        let replies = transport.process_command("3oa\r");
        assert_eq!(replies, vec!["3oa\r03:12246       \r\n".to_string()]);
    }

    #[test]
    fn test_unknown_command_echoed() {
        let transport = sim();
        let replies = transport.process_command("3zz\r");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains("UNKNOWN COMMAND RECEIVED BY SIMULATION"));
    }

    #[test]
    fn test_axis_out_of_range_is_unknown() {
        let transport = sim();
        let replies = transport.process_command("9oa\r");
        assert!(replies[0].contains("UNKNOWN COMMAND"));
    }

    #[test]
    fn test_abort_latches_and_reset_clears() {
        let transport = sim();
        let replies = transport.process_command("2ab\r");
        assert!(replies[0].contains("COMMAND ABORT"));
        // Movement refused while aborted: status echoed, target unchanged.
        let _ = transport.process_command("2ma0\r");
        {
            let motors = transport.motors.lock().unwrap();
            assert_eq!(motors[1].target, motors[1].encoder);
        }
        let replies = transport.process_command("2rs\r");
        assert!(replies[0].contains("RESET"));
        // Second reset while not aborted reports NOT ABORTED.
        let replies = transport.process_command("2rs\r");
        assert!(replies[0].contains("NOT ABORTED"));
    }

    #[test]
    fn test_ap_sets_position() {
        let transport = sim();
        let _ = transport.process_command("1ap5000\r");
        let replies = transport.process_command("1oa\r");
        assert!(replies[0].starts_with("1oa\r01:5000"));
    }

    #[test]
    fn test_qa_block_ends_with_empty_line() {
        let transport = sim();
        let replies = transport.process_command("4qa\r");
        assert!(replies.len() > 2);
        assert!(replies[0].contains("Mclennan"));
        assert_eq!(replies.last(), Some(&String::new()));
    }

    #[test]
    fn test_motor_steps_toward_target_and_snaps() {
        let mut motor = MotorSim::new(1);
        motor.set_position(0);
        motor.move_to(500);
        motor.step(0.1); // 200 steps per tick at slew 2000
        assert_eq!(motor.encoder as i64, 200);
        motor.step(0.1);
        motor.step(0.1);
        // Would overshoot: snaps to target and reports idle.
        assert_eq!(motor.encoder as i64, 500);
        assert!(motor.status.starts_with("Idle"));
    }

    #[test]
    fn test_aborted_motor_does_not_move() {
        let mut motor = MotorSim::new(1);
        motor.set_position(0);
        motor.move_to(1000);
        motor.abort();
        motor.step(0.1);
        assert_eq!(motor.encoder as i64, 0);
        assert_eq!(motor.target as i64, 0);
    }

    #[tokio::test]
    async fn test_transport_round_trip() {
        let mut transport = sim();
        transport.open().await.unwrap();
        transport.write(b"3oa\r").await.unwrap();
        let line = transport.read_line().await.unwrap();
        assert!(line.starts_with("3oa\r03:12246"));
        assert!(line.ends_with("\r\n"));
        transport.close().await.unwrap();
    }
}
