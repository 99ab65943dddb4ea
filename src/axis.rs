//! Motor axis table and shared per-axis state.
//!
//! The controller drives up to seven independent axes. Each axis carries a
//! mnemonic used throughout the crate, a human-readable label, and the name
//! under which its encoder position is published to telemetry. Runtime state
//! (last-known position, enabled/paused flags, motion state) lives behind a
//! lightweight per-axis mutex; multi-axis reads take the locks in ascending
//! axis order.

use std::sync::Mutex;
use std::time::Instant;

use crate::error::{DriveError, DriveResult};
use crate::protocol::{Command, MotionStatus};

/// Number of motor axes on the controller.
pub const DEFAULT_AXIS_COUNT: usize = 7;

/// Encoder steps per millimetre of travel.
pub const MM_TO_STEP: f64 = 200.0;

/// Millimetres per encoder step.
pub const STEP_TO_MM: f64 = 1.0 / MM_TO_STEP;

/// Target ladder horizontal axis.
pub const LADDER_HORZ_AXIS: u8 = 3;

/// Target ladder vertical axis.
pub const LADDER_VERT_AXIS: u8 = 5;

/// Diagnostic detector (Faraday cup / zero degree) axis.
pub const DETECTOR_AXIS: u8 = 4;

/// Beam blocker horizontal axis.
pub const BLOCKER_HORZ_AXIS: u8 = 6;

/// Beam blocker vertical axis.
pub const BLOCKER_VERT_AXIS: u8 = 7;

/// Static description of one motor axis.
#[derive(Debug, Clone, Copy)]
pub struct AxisInfo {
    /// Short mnemonic, e.g. `TLH`.
    pub mnemonic: &'static str,
    /// Human-readable label.
    pub label: &'static str,
    /// Series name for the telemetry push, if this axis is published.
    pub telemetry_name: Option<&'static str>,
}

/// The standard axis table for the positioner.
///
/// Index 0 is axis 1. Mnemonics must be unique; [`AxisBank::new`] checks this.
pub fn default_axis_table() -> Vec<AxisInfo> {
    vec![
        AxisInfo {
            mnemonic: "TaC",
            label: "Target carriage",
            telemetry_name: Some("Trolley"),
        },
        AxisInfo {
            mnemonic: "SiA",
            label: "Si array",
            telemetry_name: Some("Array"),
        },
        AxisInfo {
            mnemonic: "TLH",
            label: "Target ladder (H)",
            telemetry_name: Some("TargetH"),
        },
        AxisInfo {
            mnemonic: "Det",
            label: "FC/ZD",
            telemetry_name: Some("FC"),
        },
        AxisInfo {
            mnemonic: "TLV",
            label: "Target ladder (V)",
            telemetry_name: Some("TargetV"),
        },
        AxisInfo {
            mnemonic: "BBH",
            label: "Beam blocker (H)",
            telemetry_name: Some("BlockerH"),
        },
        AxisInfo {
            mnemonic: "BBV",
            label: "Beam blocker (V)",
            telemetry_name: Some("BlockerV"),
        },
    ]
}

/// Mutable state of one axis.
#[derive(Debug, Clone)]
pub struct AxisCell {
    /// Last-known encoder position in steps. Updated only by successful
    /// parses of the controller's `oa` reply.
    pub position: i64,
    /// Whether the most recent poll of this axis returned a parseable value.
    pub fresh: bool,
    /// Movement commands for a disabled axis are rejected before transmission.
    pub enabled: bool,
    /// Set by the duty-cycle governor; movement commands are rejected while
    /// the pause holds.
    pub paused: bool,
    /// Motion state as last reported by the controller.
    pub motion: MotionStatus,
    /// The last accepted movement command, re-issued by the governor when a
    /// duty-cycle pause lifts and movement is still requested.
    pub requested: Option<Command>,
}

impl Default for AxisCell {
    fn default() -> Self {
        Self {
            position: 0,
            fresh: false,
            enabled: true,
            paused: false,
            motion: MotionStatus::Unknown,
            requested: None,
        }
    }
}

/// An ordered set of axis positions captured by one polling pass.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Encoder positions, index 0 = axis 1. Stale axes carry their previous
    /// value.
    pub positions: Vec<i64>,
    /// Per-axis freshness flag for this pass.
    pub fresh: Vec<bool>,
    /// Monotonic sample time.
    pub taken_at: Instant,
}

/// The per-axis state table shared between the client, the poller and the
/// duty-cycle governors.
#[derive(Debug)]
pub struct AxisBank {
    info: Vec<AxisInfo>,
    cells: Vec<Mutex<AxisCell>>,
}

impl AxisBank {
    /// Build the bank from an axis table, marking `disabled` axes.
    ///
    /// Fails if two axes share a mnemonic or a disabled axis number is out of
    /// range.
    pub fn new(info: Vec<AxisInfo>, disabled: &[u8]) -> DriveResult<Self> {
        for (i, a) in info.iter().enumerate() {
            for b in &info[i + 1..] {
                if a.mnemonic == b.mnemonic {
                    return Err(DriveError::Config(format!(
                        "duplicate axis mnemonic {:?} in axis table",
                        a.mnemonic
                    )));
                }
            }
        }
        let cells: Vec<Mutex<AxisCell>> = (0..info.len())
            .map(|_| Mutex::new(AxisCell::default()))
            .collect();
        let bank = Self { info, cells };
        for &axis in disabled {
            if !bank.contains(axis) {
                return Err(DriveError::Config(format!(
                    "disabled axis {axis} is outside 1..={}",
                    bank.count()
                )));
            }
            bank.with(axis, |cell| cell.enabled = false);
        }
        Ok(bank)
    }

    /// Number of axes.
    pub fn count(&self) -> usize {
        self.cells.len()
    }

    /// True if `axis` is a valid 1-based axis number.
    pub fn contains(&self, axis: u8) -> bool {
        axis >= 1 && (axis as usize) <= self.cells.len()
    }

    /// Static info for a valid axis number.
    pub fn info(&self, axis: u8) -> Option<&AxisInfo> {
        self.info.get(axis as usize - 1)
    }

    /// Run `f` with the state cell of `axis` locked. The axis number must be
    /// valid; use [`contains`](Self::contains) first for unchecked input.
    pub fn with<R>(&self, axis: u8, f: impl FnOnce(&mut AxisCell) -> R) -> R {
        let mut guard = self.cells[axis as usize - 1]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Whether movement commands for this axis are accepted at all.
    pub fn is_enabled(&self, axis: u8) -> bool {
        self.with(axis, |cell| cell.enabled)
    }

    /// Whether the duty-cycle governor is holding this axis.
    pub fn is_paused(&self, axis: u8) -> bool {
        self.with(axis, |cell| cell.paused)
    }

    /// Last-known encoder position of an axis.
    pub fn position(&self, axis: u8) -> i64 {
        self.with(axis, |cell| cell.position)
    }

    /// Record a successfully parsed encoder position.
    pub fn set_position(&self, axis: u8, position: i64) {
        self.with(axis, |cell| {
            cell.position = position;
            cell.fresh = true;
        });
    }

    /// Mark an axis as unreadable for the current polling pass.
    pub fn mark_stale(&self, axis: u8) {
        self.with(axis, |cell| cell.fresh = false);
    }

    /// Update the motion state; returns the previous state.
    pub fn set_motion(&self, axis: u8, motion: MotionStatus) -> MotionStatus {
        self.with(axis, |cell| std::mem::replace(&mut cell.motion, motion))
    }

    /// Axis numbers in ascending order.
    pub fn numbers(&self) -> std::ops::RangeInclusive<u8> {
        1..=self.cells.len() as u8
    }

    /// Capture all axis positions and freshness flags, locking in ascending
    /// axis order.
    pub fn snapshot(&self) -> Snapshot {
        let mut positions = Vec::with_capacity(self.cells.len());
        let mut fresh = Vec::with_capacity(self.cells.len());
        for cell in &self.cells {
            let guard = cell.lock().unwrap_or_else(|e| e.into_inner());
            positions.push(guard.position);
            fresh.push(guard.fresh);
        }
        Snapshot {
            positions,
            fresh,
            taken_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_has_seven_axes() {
        let bank = AxisBank::new(default_axis_table(), &[]).unwrap();
        assert_eq!(bank.count(), DEFAULT_AXIS_COUNT);
        assert!(bank.contains(1));
        assert!(bank.contains(7));
        assert!(!bank.contains(0));
        assert!(!bank.contains(8));
        assert_eq!(bank.info(3).unwrap().mnemonic, "TLH");
    }

    #[test]
    fn test_duplicate_mnemonic_rejected() {
        let mut table = default_axis_table();
        table[6].mnemonic = "TaC";
        let err = AxisBank::new(table, &[]).unwrap_err();
        assert!(err.to_string().contains("duplicate axis mnemonic"));
    }

    #[test]
    fn test_disabled_axes_applied() {
        let bank = AxisBank::new(default_axis_table(), &[4]).unwrap();
        assert!(!bank.is_enabled(4));
        assert!(bank.is_enabled(3));
    }

    #[test]
    fn test_disabled_axis_out_of_range() {
        assert!(AxisBank::new(default_axis_table(), &[9]).is_err());
    }

    #[test]
    fn test_position_update_sets_fresh() {
        let bank = AxisBank::new(default_axis_table(), &[]).unwrap();
        bank.set_position(3, 12246);
        let snap = bank.snapshot();
        assert_eq!(snap.positions[2], 12246);
        assert!(snap.fresh[2]);
        bank.mark_stale(3);
        let snap = bank.snapshot();
        assert_eq!(snap.positions[2], 12246);
        assert!(!snap.fresh[2]);
    }

    #[test]
    fn test_snapshot_length_matches_axis_count() {
        let bank = AxisBank::new(default_axis_table(), &[]).unwrap();
        let snap = bank.snapshot();
        assert_eq!(snap.positions.len(), DEFAULT_AXIS_COUNT);
        assert_eq!(snap.fresh.len(), DEFAULT_AXIS_COUNT);
    }
}
