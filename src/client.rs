//! The controller client: the single consumer of the serial link.
//!
//! Every command for the motor box goes through [`DriveController::execute`]
//! or [`DriveController::execute_batch`]. Both validate before transmission:
//! an undecodable command, an axis outside the table, a disabled axis (for
//! anything outside the always-permitted set) or a paused axis (for movement
//! verbs) is rejected without touching the link. Successful `oa` parses are
//! the only thing that updates an axis's last-known position, and each one
//! is forwarded to the telemetry hook.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{info, warn};

use crate::axis::{AxisBank, Snapshot};
use crate::duty::DutyWindow;
use crate::error::{DriveError, DriveResult, RejectReason};
use crate::link::{RawReply, SerialLink};
use crate::protocol::{self, Command, MotionStatus, Reply};
use crate::telemetry::TelemetrySink;

/// The drive system's interface to the motor box.
pub struct DriveController {
    link: SerialLink,
    axes: AxisBank,
    /// Gate on the datum search; set during experiments so that an accidental
    /// datum press cannot re-zero an axis.
    experimental_mode: bool,
    telemetry: Option<TelemetrySink>,
    duty_windows: Mutex<HashMap<u8, Arc<DutyWindow>>>,
    selected_element: Mutex<Option<String>>,
}

impl DriveController {
    /// Build the client over an open (or openable) link. `experimental_mode`
    /// locks the datum search; `telemetry` is `None` when nothing should be
    /// pushed (the simulator, or no credentials).
    pub fn new(
        link: SerialLink,
        axes: AxisBank,
        experimental_mode: bool,
        telemetry: Option<TelemetrySink>,
    ) -> Self {
        Self {
            link,
            axes,
            experimental_mode,
            telemetry,
            duty_windows: Mutex::new(HashMap::new()),
            selected_element: Mutex::new(None),
        }
    }

    /// The per-axis state table.
    pub fn axes(&self) -> &AxisBank {
        &self.axes
    }

    /// The serial link this client owns.
    pub fn link(&self) -> &SerialLink {
        &self.link
    }

    /// True while the serial port is open.
    pub async fn is_connected(&self) -> bool {
        self.link.is_open().await
    }

    /// Register the duty-cycle window observing an axis's motion transitions.
    pub fn register_duty_window(&self, axis: u8, window: Arc<DutyWindow>) {
        self.duty_windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(axis, window);
    }

    fn duty_window(&self, axis: u8) -> Option<Arc<DutyWindow>> {
        self.duty_windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&axis)
            .cloned()
    }

    /// The element currently selected to sit in the beam, if any.
    pub fn selected_element(&self) -> Option<String> {
        self.selected_element
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record which element is meant to sit in the beam.
    pub fn set_selected_element(&self, id: Option<String>) {
        *self
            .selected_element
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = id;
    }

    /// Check a command against the axis table and the disable/pause policy.
    /// Rejection happens here, before any bytes are written.
    pub fn validate(&self, cmd: &Command) -> DriveResult<()> {
        let reject = |reason: RejectReason| {
            Err(DriveError::CommandRejected {
                command: cmd.wire(),
                reason,
            })
        };
        if !self.axes.contains(cmd.axis) {
            return reject(RejectReason::AxisOutOfRange);
        }
        if !self.axes.is_enabled(cmd.axis) && !cmd.is_always_permitted() {
            return reject(RejectReason::AxisDisabled);
        }
        if self.axes.is_paused(cmd.axis) && cmd.is_movement() {
            return reject(RejectReason::AxisPaused);
        }
        Ok(())
    }

    /// Validate a command string as the interactive collaborators submit it.
    pub fn validate_str(&self, text: &str) -> DriveResult<Command> {
        let Some(cmd) = Command::parse(text) else {
            return Err(DriveError::CommandRejected {
                command: text.to_string(),
                reason: RejectReason::Undecodable,
            });
        };
        self.validate(&cmd)?;
        Ok(cmd)
    }

    /// Send one command and parse its reply. Timeouts and malformed replies
    /// come back as their own error kinds for the caller to retry or drop.
    pub async fn execute(&self, cmd: &Command) -> DriveResult<Reply> {
        self.validate(cmd)?;
        let raw = self.link.request(&cmd.wire()).await?;
        self.digest(cmd, raw).await
    }

    /// Send a command string submitted by an interactive collaborator.
    pub async fn execute_str(&self, text: &str) -> DriveResult<Reply> {
        let cmd = self.validate_str(text)?;
        self.execute(&cmd).await
    }

    /// Send several commands under one continuous link acquisition, in the
    /// order given. Commands failing validation are logged and skipped; the
    /// rest still go out.
    pub async fn execute_batch(&self, cmds: &[Command]) -> DriveResult<Vec<DriveResult<Reply>>> {
        let mut accepted = Vec::new();
        for cmd in cmds {
            match self.validate(cmd) {
                Ok(()) => accepted.push(cmd.clone()),
                Err(e) => warn!("{e}"),
            }
        }
        let wires: Vec<String> = accepted.iter().map(Command::wire).collect();
        let raws = self.link.request_batch(&wires).await?;
        let mut replies = Vec::with_capacity(raws.len());
        for (cmd, raw) in accepted.iter().zip(raws) {
            replies.push(self.digest(cmd, raw).await);
        }
        Ok(replies)
    }

    /// Parse a raw reply and update axis state from whatever it reveals.
    async fn digest(&self, cmd: &Command, raw: RawReply) -> DriveResult<Reply> {
        let reply = match protocol::parse_reply(&raw.first, raw.rest) {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_no_response() && cmd.is_movement() {
                    // Movement replies echo free-form status text that does
                    // not always parse; the command has still been accepted.
                    self.note_movement_accepted(cmd);
                }
                return Err(e);
            }
        };

        if let Reply::Line { body, .. } = &reply {
            if body.contains("Sequence") {
                // A sequence listing follows; drain it so the next command
                // does not read stale lines.
                let lines = self.link.drain_lines().await?;
                for line in lines {
                    info!("{}", line.trim_end());
                }
            }
        }

        match cmd.verb.as_str() {
            "oa" => {
                if let Reply::Line { axis, body } = &reply {
                    if self.axes.contains(*axis) {
                        match body.trim().parse::<i64>() {
                            Ok(position) => {
                                self.axes.set_position(*axis, position);
                                self.publish_position(*axis, position);
                            }
                            Err(_) => self.axes.mark_stale(*axis),
                        }
                    }
                }
            }
            "co" | "ab" | "rs" => {
                if let Some(status) = reply.motion_status() {
                    if status != MotionStatus::Unknown {
                        self.note_motion(cmd.axis, status);
                    }
                }
            }
            verb if protocol::MOVEMENT_VERBS.contains(&verb) => {
                match reply.motion_status() {
                    Some(status) if status.is_fault() => {
                        self.note_motion(cmd.axis, status);
                    }
                    _ => self.note_movement_accepted(cmd),
                }
            }
            _ => {}
        }
        Ok(reply)
    }

    /// Record an accepted movement command: the axis is now moving and this
    /// is the outstanding request a duty-cycle resume would re-issue.
    fn note_movement_accepted(&self, cmd: &Command) {
        self.axes.with(cmd.axis, |cell| {
            cell.motion = MotionStatus::Moving;
            cell.requested = Some(cmd.clone());
        });
        if let Some(window) = self.duty_window(cmd.axis) {
            window.set_requested(true);
            window.note_moving(Instant::now());
        }
    }

    /// Record a reported motion state and feed the transition to the axis's
    /// duty window, if it has one.
    fn note_motion(&self, axis: u8, status: MotionStatus) {
        let previous = self.axes.set_motion(axis, status);
        let was_moving = previous == MotionStatus::Moving;
        let is_moving = status == MotionStatus::Moving;
        if was_moving == is_moving {
            return;
        }
        if let Some(window) = self.duty_window(axis) {
            let now = Instant::now();
            if is_moving {
                window.note_moving(now);
            } else {
                window.note_idle(now);
            }
        }
    }

    fn publish_position(&self, axis: u8, position: i64) {
        if let Some(sink) = &self.telemetry {
            if let Some(info) = self.axes.info(axis) {
                if let Some(name) = info.telemetry_name {
                    sink.publish(axis, name, position);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Named moves
    // ------------------------------------------------------------------

    /// Move an axis to an absolute encoder position.
    pub async fn move_absolute(&self, axis: u8, encoder: i64) -> DriveResult<()> {
        let cmd = Command::with_arg(axis, "ma", encoder);
        self.run_movement(cmd).await
    }

    /// Move an axis by a number of encoder steps.
    pub async fn move_relative(&self, axis: u8, steps: i64) -> DriveResult<()> {
        info!("Moving {steps} on axis {axis}");
        let cmd = Command::with_arg(axis, "mr", steps);
        self.run_movement(cmd).await
    }

    async fn run_movement(&self, cmd: Command) -> DriveResult<()> {
        match self.execute(&cmd).await {
            Ok(reply) => {
                if let Some(status) = reply.motion_status() {
                    if let Some(kind) = status.abort_kind() {
                        return Err(DriveError::MotionAborted {
                            axis: cmd.axis,
                            kind,
                        });
                    }
                }
                Ok(())
            }
            // The box often answers movement commands with free-form status
            // text; no reply does not mean no movement.
            Err(e) if e.is_no_response() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drive an element into the beam: move the axes its coordinates map to
    /// and record it as the selected element. One-dimensional elements only
    /// move their horizontal axis.
    pub async fn move_to_element(
        &self,
        registry: &crate::elements::ElementRegistry,
        id: &crate::elements::ElementId,
    ) -> DriveResult<()> {
        let id_text = id.to_string();
        let (horizontal, vertical) = registry.coords(&id_text);
        let (horz_axis, vert_axis) = crate::elements::target_axes(id);
        info!(
            "moving {} ({}) into the beam",
            registry.label(&id_text),
            id_text
        );
        self.move_absolute(horz_axis, horizontal).await?;
        if let Some(vert_axis) = vert_axis {
            self.move_absolute(vert_axis, vertical).await?;
        }
        self.set_selected_element(Some(id_text));
        Ok(())
    }

    /// Set the creep (final approach) speed of an axis.
    pub async fn set_creep_speed(&self, axis: u8, speed: i64) -> DriveResult<()> {
        self.execute(&Command::with_arg(axis, "sc", speed)).await?;
        Ok(())
    }

    /// Set the slew (normal travel) speed of an axis.
    pub async fn set_slew_speed(&self, axis: u8, speed: i64) -> DriveResult<()> {
        self.execute(&Command::with_arg(axis, "sv", speed)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Abort / reset
    // ------------------------------------------------------------------

    /// Abort one axis and clear its outstanding movement request.
    pub async fn abort_axis(&self, axis: u8) -> DriveResult<()> {
        self.clear_request(axis);
        let result = self.execute(&Command::bare(axis, "ab")).await;
        self.settle_after_stop(axis);
        result.map(|_| ())
    }

    /// Reset one axis.
    pub async fn reset_axis(&self, axis: u8) -> DriveResult<()> {
        self.execute(&Command::bare(axis, "rs")).await.map(|_| ())
    }

    /// Abort every axis, in ascending order, under one link acquisition.
    pub async fn abort_all(&self) -> DriveResult<()> {
        info!("Abort command on all axes");
        let cmds: Vec<Command> = self
            .axes
            .numbers()
            .map(|axis| Command::bare(axis, "ab"))
            .collect();
        for axis in self.axes.numbers() {
            self.clear_request(axis);
        }
        self.execute_batch(&cmds).await?;
        for axis in self.axes.numbers() {
            self.settle_after_stop(axis);
        }
        Ok(())
    }

    /// Reset every axis, in ascending order, under one link acquisition.
    pub async fn reset_all(&self) -> DriveResult<()> {
        info!("Reset command on all axes");
        let cmds: Vec<Command> = self
            .axes
            .numbers()
            .map(|axis| Command::bare(axis, "rs"))
            .collect();
        self.execute_batch(&cmds).await?;
        Ok(())
    }

    fn clear_request(&self, axis: u8) {
        self.axes.with(axis, |cell| cell.requested = None);
        if let Some(window) = self.duty_window(axis) {
            window.set_requested(false);
        }
    }

    fn settle_after_stop(&self, axis: u8) {
        if let Some(window) = self.duty_window(axis) {
            window.note_idle(Instant::now());
        }
    }

    // ------------------------------------------------------------------
    // Position polling
    // ------------------------------------------------------------------

    /// Read one axis's encoder position.
    pub async fn poll_axis(&self, axis: u8) -> DriveResult<i64> {
        let reply = self.execute(&Command::bare(axis, "oa")).await?;
        let body = reply.body().unwrap_or_default();
        body.parse::<i64>()
            .map_err(|_| DriveError::ProtocolMalformed(body.to_string()))
    }

    /// Poll the given axes (all of them when `None`), update last-known
    /// positions, and return the snapshot. Disabled axes are skipped and
    /// stay stale.
    pub async fn poll_positions(&self, selected: Option<&[u8]>) -> Snapshot {
        let axes: Vec<u8> = match selected {
            Some(listed) => listed.to_vec(),
            None => self.axes.numbers().collect(),
        };
        let mut attempted = Vec::new();
        for axis in axes {
            if !self.axes.contains(axis) || !self.axes.is_enabled(axis) {
                continue;
            }
            // Re-check the connection each time in case someone pulls the
            // plug partway through a pass.
            if !self.link.is_open().await {
                break;
            }
            attempted.push(axis);
            if self.poll_axis(axis).await.is_err() {
                self.axes.mark_stale(axis);
            }
        }
        let snapshot = self.axes.snapshot();
        self.warn_unreadable(&attempted, &snapshot);
        snapshot
    }

    /// Warn about polled axes whose read failed.
    fn warn_unreadable(&self, attempted: &[u8], snapshot: &Snapshot) {
        let unreadable: Vec<String> = attempted
            .iter()
            .filter_map(|&axis| {
                let fresh = snapshot.fresh[axis as usize - 1];
                if !fresh {
                    Some(axis.to_string())
                } else {
                    None
                }
            })
            .collect();
        match unreadable.len() {
            0 => {}
            1 => warn!("Could not read position of axis {}", unreadable[0]),
            n => warn!(
                "Could not read positions of axes {}, and {}",
                unreadable[..n - 1].join(", "),
                unreadable[n - 1]
            ),
        }
    }

    /// Query the current operation of an axis.
    pub async fn query_status(&self, axis: u8) -> DriveResult<MotionStatus> {
        let reply = self.execute(&Command::bare(axis, "co")).await?;
        Ok(reply.motion_status().unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Datum search
    // ------------------------------------------------------------------

    /// Home an axis to its datum using the controller's built-in search.
    ///
    /// Disabled wholesale while `ExperimentalMode` is set: a datum search
    /// during data-taking would silently re-zero the coordinate system.
    pub async fn datum_search(&self, axis: u8) -> DriveResult<()> {
        if self.experimental_mode {
            warn!(
                "DATUM DISABLED. datum_search() does nothing while the \
                 \"ExperimentalMode\" option is set"
            );
            return Ok(());
        }

        info!("Datum search on axis {axis}");
        let sequence = [
            Command::with_raw_arg(axis, "dm", protocol::DATUM_MODE),
            Command::bare(axis, "hd"),
            Command::bare(axis, "co"),
        ];
        for cmd in &sequence {
            match self.execute(cmd).await {
                Ok(reply) => {
                    if let Reply::Line { axis, body } = &reply {
                        info!("{axis} : {}", body.trim());
                    }
                    if let Some(kind) = reply.motion_status().and_then(|s| s.abort_kind()) {
                        return Err(DriveError::MotionAborted { axis: cmd.axis, kind });
                    }
                }
                Err(e) if e.is_no_response() => warn!("{e}"),
                Err(e) => return Err(e),
            }
        }
        self.poll_axis(axis).await.map(|position| {
            info!("axis {axis} position after datum search: {position}");
        })
    }

    // ------------------------------------------------------------------
    // Duty-cycle governor hooks
    // ------------------------------------------------------------------

    /// Latch the paused flag and stop the axis. The flag is set before the
    /// stop goes out, so no movement command can slip through after it.
    pub async fn governor_stop(&self, axis: u8) {
        self.axes.with(axis, |cell| cell.paused = true);
        if let Err(e) = self.execute(&Command::bare(axis, "ab")).await {
            if !e.is_no_response() {
                warn!("duty-cycle stop on axis {axis} failed: {e}");
            }
        }
        self.settle_after_stop(axis);
    }

    /// Clear the paused flag and re-issue the outstanding movement request,
    /// if there is one.
    pub async fn governor_resume(&self, axis: u8) {
        let requested = self.axes.with(axis, |cell| {
            cell.paused = false;
            cell.requested.clone()
        });
        if let Some(cmd) = requested {
            // The box needs a reset after the abort that paused it.
            if let Err(e) = self.reset_axis(axis).await {
                if !e.is_no_response() {
                    warn!("duty-cycle reset on axis {axis} failed: {e}");
                    return;
                }
            }
            match self.execute(&cmd).await {
                Ok(_) | Err(DriveError::LinkTimeout) | Err(DriveError::ProtocolMalformed(_)) => {}
                Err(e) => warn!("duty-cycle resume on axis {axis} failed: {e}"),
            }
        }
    }

    /// Clear the paused flag without resuming anything.
    pub fn release_pause(&self, axis: u8) {
        self.axes.with(axis, |cell| cell.paused = false);
    }

    /// Shut down the telemetry sink, draining queued samples.
    pub async fn shutdown_telemetry(&mut self) {
        if let Some(sink) = self.telemetry.take() {
            sink.shutdown().await;
        }
    }
}
