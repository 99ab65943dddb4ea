//! Slit scan: step a slit across the beam, dwelling at each position.
//!
//! A horizontal scan drives the target-ladder horizontal axis across the
//! vertical slit; a vertical scan drives the vertical axis across the
//! horizontal slit. The orthogonal axis is parked at the slit's recorded
//! coordinate first. Positions are spaced linearly from `centre − offset` to
//! `centre + offset`, both ends included.

use std::path::Path;

use log::{info, warn};

use crate::axis::{LADDER_HORZ_AXIS, LADDER_VERT_AXIS, MM_TO_STEP, STEP_TO_MM};
use crate::client::DriveController;
use crate::elements::{ElementRegistry, ReservedElement};
use crate::error::{DriveError, DriveResult};
use crate::ops::CancelToken;
use crate::poller::Poller;

use std::time::Duration;

/// Scan parameters, read from the slit-scan parameter file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlitScanParams {
    /// Half-range of the scan either side of the slit centre, mm.
    pub offset_mm: f64,
    /// Spacing between visited positions, mm.
    pub step_mm: f64,
    /// Dwell at each position, seconds.
    pub dwell_s: f64,
}

impl Default for SlitScanParams {
    fn default() -> Self {
        Self {
            offset_mm: 6.0,
            step_mm: 0.1,
            dwell_s: 0.5,
        }
    }
}

/// Which way the slit is scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Move the horizontal axis across the vertical slit.
    Horizontal,
    /// Move the vertical axis across the horizontal slit.
    Vertical,
}

/// Read the slit-scan parameter file (same `key: value` grammar as the
/// options file, keys `OFFSET_IN_MM`, `STEP_SIZE_IN_MM`,
/// `WAIT_TIME_IN_SECONDS`). A missing file or key falls back to the default
/// with a warning.
pub fn read_parameter_file(path: Option<&Path>) -> SlitScanParams {
    let mut params = SlitScanParams::default();
    let Some(path) = path else {
        warn!("no slit scan parameter file configured. Using defaults");
        return params;
    };
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => {
            warn!(
                "cannot find slit scan parameters in file {:?}. Using defaults",
                path.display()
            );
            return params;
        }
    };

    let mut seen = [false; 3];
    for (index, line) in contents.lines().enumerate() {
        let line_number = index + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.matches(':').count() != 1 {
            warn!("SLIT SCAN OPTION ERROR: line {line_number} does not contain a valid option -> [{line}]");
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if let Some((before, _)) = value.split_once('#') {
            value = before.trim();
        }
        let slot = match key {
            "OFFSET_IN_MM" => 0,
            "STEP_SIZE_IN_MM" => 1,
            "WAIT_TIME_IN_SECONDS" => 2,
            _ => {
                warn!("SLIT SCAN OPTION ERROR: key {key} unknown");
                continue;
            }
        };
        let Ok(parsed) = value.parse::<f64>() else {
            warn!("SLIT SCAN OPTION: could not convert {value:?} to a number. Using the default for {key}");
            continue;
        };
        if seen[slot] {
            warn!("SLIT SCAN OPTION WARNING: option already set for {key}. Overwriting...");
        }
        seen[slot] = true;
        match slot {
            0 => params.offset_mm = parsed,
            1 => params.step_mm = parsed,
            _ => params.dwell_s = parsed,
        }
    }
    for (slot, name) in ["OFFSET_IN_MM", "STEP_SIZE_IN_MM", "WAIT_TIME_IN_SECONDS"]
        .iter()
        .enumerate()
    {
        if !seen[slot] {
            warn!("SLIT SCAN OPTION WARNING: option not set for {name}. Using default...");
        }
    }
    params
}

/// The encoder positions a scan visits, linearly spaced between
/// `centre − offset` and `centre + offset` inclusive.
pub fn scan_positions(centre: i64, offset_mm: f64, step_mm: f64) -> Vec<i64> {
    let start = centre as f64 - offset_mm * MM_TO_STEP;
    let end = centre as f64 + offset_mm * MM_TO_STEP;
    let step = step_mm * MM_TO_STEP;
    if step <= 0.0 || start == end {
        return vec![centre];
    }
    let count = ((start - end).abs() / step) as usize + 1;
    if count < 2 {
        return vec![start.round() as i64, end.round() as i64];
    }
    (0..count)
        .map(|i| (start + (end - start) * i as f64 / (count - 1) as f64).round() as i64)
        .collect()
}

fn offset_string(current: i64, slit: i64) -> String {
    if current == slit {
        return String::new();
    }
    let sign = if current > slit { "+" } else { "-" };
    let mm = (current - slit).abs() as f64 * STEP_TO_MM;
    format!("{sign} {mm:.2} mm")
}

/// Run a slit scan. Pauses the poller for the duration, owns the two
/// target-ladder axes, and restores the poller whatever the outcome.
pub async fn run(
    client: &DriveController,
    poller: &Poller,
    elements: &ElementRegistry,
    direction: ScanDirection,
    params: SlitScanParams,
    cancel: &CancelToken,
) -> DriveResult<()> {
    if !client.axes().is_enabled(LADDER_HORZ_AXIS) || !client.axes().is_enabled(LADDER_VERT_AXIS) {
        return Err(DriveError::Operation(
            "cannot slit scan when one or both target-ladder axes are disabled".to_string(),
        ));
    }

    // The poller reads every axis once a second; we want the two ladder
    // axes to ourselves at a faster cadence.
    poller.pause();
    let result = scan(client, elements, direction, params, cancel).await;
    poller.resume();
    result
}

async fn scan(
    client: &DriveController,
    elements: &ElementRegistry,
    direction: ScanDirection,
    params: SlitScanParams,
    cancel: &CancelToken,
) -> DriveResult<()> {
    client.abort_all().await?;
    info!("Reset target-ladder axes");
    client.reset_axis(LADDER_HORZ_AXIS).await?;
    client.reset_axis(LADDER_VERT_AXIS).await?;

    let (slit, move_axis, hold_axis) = match direction {
        ScanDirection::Horizontal => (
            ReservedElement::VertSlit,
            LADDER_HORZ_AXIS,
            LADDER_VERT_AXIS,
        ),
        ScanDirection::Vertical => (
            ReservedElement::HorzSlit,
            LADDER_VERT_AXIS,
            LADDER_HORZ_AXIS,
        ),
    };
    client.set_selected_element(Some(slit.id().to_string()));

    let (horizontal, vertical) = elements.coords(slit.id());
    let (centre, hold_target) = match direction {
        ScanDirection::Horizontal => (horizontal, vertical),
        ScanDirection::Vertical => (vertical, horizontal),
    };
    let positions = scan_positions(centre, params.offset_mm, params.step_mm);

    // Park the orthogonal axis, then move to the first scan position.
    client.move_absolute(hold_axis, hold_target).await?;
    client.move_absolute(move_axis, positions[0]).await?;

    info!("===== PREPARING TO SCAN SLITS... ====");
    let mut attempts = 0;
    loop {
        client.poll_positions(Some(&[move_axis, hold_axis])).await;
        let here = client.axes().position(move_axis);
        let held = client.axes().position(hold_axis);
        if here == positions[0] && held == hold_target {
            break;
        }
        attempts += 1;
        if attempts % 10 == 0 {
            info!("Still moving to the starting position for the slit scan...");
        }
        if attempts >= 50 {
            warn!("======= SLIT SCANNING FAILED ========");
            return Err(DriveError::Operation(
                "timeout: the target ladder will not reach the scan starting position \
                 (did you abort a motor?)"
                    .to_string(),
            ));
        }
        if !cancel.sleep(Duration::from_millis(200)).await {
            return Err(DriveError::Cancelled);
        }
    }

    info!("===== SLIT SCANNING IN PROGRESS =====");
    let slit_label = elements.label(slit.id());
    for &target in &positions {
        if cancel.is_cancelled() {
            return Err(DriveError::Cancelled);
        }
        client.move_absolute(move_axis, target).await?;

        let mut tries = 0;
        loop {
            client.poll_positions(Some(&[move_axis, hold_axis])).await;
            let here = client.axes().position(move_axis);
            let held = client.axes().position(hold_axis);
            if here == target && held == hold_target {
                break;
            }
            if !cancel.sleep(Duration::from_millis(100)).await {
                return Err(DriveError::Cancelled);
            }
            tries += 1;
            if tries % 5 == 0 {
                // Nudge the controller again in case the first command was
                // swallowed.
                info!(
                    "Trying to move to {slit_label} {}",
                    offset_string(target, centre)
                );
                client.move_absolute(move_axis, target).await?;
            }
            if tries > 50 {
                warn!("======= SLIT SCANNING FAILED ========");
                return Err(DriveError::Operation(
                    "cannot complete slit scan as nothing is moving (did you abort a motor?)"
                        .to_string(),
                ));
            }
        }

        info!("Moved to {slit_label} {}", offset_string(target, centre));
        if !cancel.sleep(Duration::from_secs_f64(params.dwell_s)).await {
            return Err(DriveError::Cancelled);
        }
    }

    info!("====== SLIT SCANNING COMPLETE =======");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_scan_positions_inclusive_linspace() {
        // 6 mm offset at 200 steps/mm is 1200 steps; 0.1 mm pitch is 20
        // steps: 121 positions from -1200 to +1200.
        let positions = scan_positions(0, 6.0, 0.1);
        assert_eq!(positions.len(), 121);
        assert_eq!(positions[0], -1200);
        assert_eq!(positions[1], -1180);
        assert_eq!(positions[60], 0);
        assert_eq!(positions[119], 1180);
        assert_eq!(positions[120], 1200);
    }

    #[test]
    fn test_scan_positions_offset_centre() {
        let positions = scan_positions(500, 0.1, 0.1);
        assert_eq!(positions, vec![480, 500, 520]);
    }

    #[test]
    fn test_scan_positions_degenerate() {
        assert_eq!(scan_positions(42, 0.0, 0.1), vec![42]);
        assert_eq!(scan_positions(42, 1.0, 0.0), vec![42]);
    }

    #[test]
    fn test_offset_string() {
        assert_eq!(offset_string(1200, 1200), "");
        assert_eq!(offset_string(1220, 1200), "+ 0.10 mm");
        assert_eq!(offset_string(1000, 1200), "- 1.00 mm");
    }

    #[test]
    fn test_parameter_file_defaults_when_missing() {
        let params = read_parameter_file(Some(Path::new("/nonexistent/scan.txt")));
        assert_eq!(params, SlitScanParams::default());
        let params = read_parameter_file(None);
        assert_eq!(params.offset_mm, 6.0);
    }

    #[test]
    fn test_parameter_file_parsing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# scan setup").unwrap();
        writeln!(file, "OFFSET_IN_MM: 2.5").unwrap();
        writeln!(file, "STEP_SIZE_IN_MM: 0.2 # coarse").unwrap();
        writeln!(file, "WAIT_TIME_IN_SECONDS: 1.5").unwrap();
        writeln!(file, "MYSTERY_KEY: 9").unwrap();
        let params = read_parameter_file(Some(file.path()));
        assert_eq!(params.offset_mm, 2.5);
        assert_eq!(params.step_mm, 0.2);
        assert_eq!(params.dwell_s, 1.5);
    }
}
