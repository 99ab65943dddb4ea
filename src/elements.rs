//! In-beam element identifiers and the element registry.
//!
//! An element is a named physical thing in the beamline (a target frame on
//! the ladder, a slit, an aperture, a beam-blocker head, a beam monitor or
//! the alpha source) with a pair of target encoder coordinates (horizontal,
//! vertical). Element IDs are either 2-D ladder positions
//! `<frame>.<x>.<y>` or one of a fixed set of reserved symbolic names.
//!
//! The registry is loaded from two plain-text files (an `ID: LABEL` map and
//! an `ID H V` coordinate map) and is immutable afterwards. Lookups are
//! total: an unmapped ID labels as itself and sits at (0, 0).

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{DriveError, DriveResult};

static LADDER_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)\.(\d+)\.(\d+)$").unwrap_or_else(|e| panic!("ladder id regex: {e}"))
});

/// Reserved symbolic element IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedElement {
    /// The 3 mm aperture on the target ladder.
    SmallAperture,
    /// The 10 mm aperture on the target ladder.
    LargeAperture,
    /// The horizontal slit.
    HorzSlit,
    /// The vertical slit.
    VertSlit,
    /// The alpha calibration source.
    AlphaSource,
    /// The 6 mm beam-blocker head.
    BlockerSmall,
    /// The 10 mm beam-blocker head.
    BlockerMedium,
    /// The 20 mm beam-blocker head.
    BlockerLarge,
    /// The blocker-out position.
    BlockerClear,
    /// The Faraday cup.
    MonitorFaradayCup,
    /// The mid-track beam-monitoring position.
    MonitorMiddle,
    /// The zero-degree detector position.
    MonitorZeroDegree,
}

impl ReservedElement {
    /// All reserved IDs, in their documented order.
    pub const ALL: [ReservedElement; 12] = [
        ReservedElement::SmallAperture,
        ReservedElement::LargeAperture,
        ReservedElement::HorzSlit,
        ReservedElement::VertSlit,
        ReservedElement::AlphaSource,
        ReservedElement::BlockerSmall,
        ReservedElement::BlockerMedium,
        ReservedElement::BlockerLarge,
        ReservedElement::BlockerClear,
        ReservedElement::MonitorFaradayCup,
        ReservedElement::MonitorMiddle,
        ReservedElement::MonitorZeroDegree,
    ];

    /// The reserved IDs that sit on the target ladder.
    pub const LADDER: [ReservedElement; 5] = [
        ReservedElement::SmallAperture,
        ReservedElement::LargeAperture,
        ReservedElement::HorzSlit,
        ReservedElement::VertSlit,
        ReservedElement::AlphaSource,
    ];

    /// The ID string used in map files.
    pub fn id(&self) -> &'static str {
        match self {
            ReservedElement::SmallAperture => "small_aperture",
            ReservedElement::LargeAperture => "large_aperture",
            ReservedElement::HorzSlit => "horz_slit",
            ReservedElement::VertSlit => "vert_slit",
            ReservedElement::AlphaSource => "alpha",
            ReservedElement::BlockerSmall => "bb.small",
            ReservedElement::BlockerMedium => "bb.medium",
            ReservedElement::BlockerLarge => "bb.large",
            ReservedElement::BlockerClear => "bb.clear",
            ReservedElement::MonitorFaradayCup => "bm.fc",
            ReservedElement::MonitorMiddle => "bm.mid",
            ReservedElement::MonitorZeroDegree => "bm.zd",
        }
    }

    /// The documented default label.
    pub fn default_label(&self) -> &'static str {
        match self {
            ReservedElement::SmallAperture => "3 mm aperture",
            ReservedElement::LargeAperture => "10 mm aperture",
            ReservedElement::HorzSlit => "Horizontal slit",
            ReservedElement::VertSlit => "Vertical slit",
            ReservedElement::AlphaSource => "\u{03b1}",
            ReservedElement::BlockerSmall => "BB: 6 mm",
            ReservedElement::BlockerMedium => "BB: 10 mm",
            ReservedElement::BlockerLarge => "BB: 20 mm",
            ReservedElement::BlockerClear => "No BB",
            ReservedElement::MonitorFaradayCup => "Faraday cup",
            ReservedElement::MonitorMiddle => "Middle",
            ReservedElement::MonitorZeroDegree => "Zero degree",
        }
    }

    fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.id() == id)
    }
}

/// A validated element identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementId {
    /// A 2-D target ladder position `<frame>.<x>.<y>`.
    Ladder {
        /// Frame number, counted from 0.
        frame: u32,
        /// Column within the frame, counted from the left.
        x: u32,
        /// Row within the frame, counted from the top.
        y: u32,
    },
    /// One of the reserved symbolic IDs.
    Reserved(ReservedElement),
}

impl FromStr for ElementId {
    type Err = DriveError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if let Some(caps) = LADDER_ID_RE.captures(text) {
            let parse = |i: usize| -> Option<u32> { caps.get(i)?.as_str().parse().ok() };
            if let (Some(frame), Some(x), Some(y)) = (parse(1), parse(2), parse(3)) {
                return Ok(ElementId::Ladder { frame, x, y });
            }
        }
        if let Some(reserved) = ReservedElement::from_id(text) {
            return Ok(ElementId::Reserved(reserved));
        }
        Err(DriveError::Config(format!("unrecognised element ID {text:?}")))
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementId::Ladder { frame, x, y } => write!(f, "{frame}.{x}.{y}"),
            ElementId::Reserved(reserved) => write!(f, "{}", reserved.id()),
        }
    }
}

/// Which axes an element's (horizontal, vertical) coordinates drive.
///
/// Ladder positions and the ladder-mounted optics live on target-ladder
/// axes 3 and 5; beam-blocker heads on axes 6 and 7; the beam-monitoring
/// positions are one-dimensional on the detector axis 4, with the vertical
/// coordinate carried as a nominal value only.
pub fn target_axes(id: &ElementId) -> (u8, Option<u8>) {
    use crate::axis::{
        BLOCKER_HORZ_AXIS, BLOCKER_VERT_AXIS, DETECTOR_AXIS, LADDER_HORZ_AXIS, LADDER_VERT_AXIS,
    };
    match id {
        ElementId::Ladder { .. } => (LADDER_HORZ_AXIS, Some(LADDER_VERT_AXIS)),
        ElementId::Reserved(reserved) => match reserved {
            ReservedElement::BlockerSmall
            | ReservedElement::BlockerMedium
            | ReservedElement::BlockerLarge
            | ReservedElement::BlockerClear => (BLOCKER_HORZ_AXIS, Some(BLOCKER_VERT_AXIS)),
            ReservedElement::MonitorFaradayCup
            | ReservedElement::MonitorMiddle
            | ReservedElement::MonitorZeroDegree => (DETECTOR_AXIS, None),
            _ => (LADDER_HORZ_AXIS, Some(LADDER_VERT_AXIS)),
        },
    }
}

/// Mapping from element IDs to labels and target encoder coordinates.
pub struct ElementRegistry {
    labels: HashMap<String, String>,
    coords: HashMap<String, (i64, i64)>,
}

impl ElementRegistry {
    /// Registry with every reserved ID at (0, 0) and no labels loaded yet.
    pub fn new() -> Self {
        let mut coords = HashMap::new();
        for reserved in ReservedElement::ALL {
            coords.insert(reserved.id().to_string(), (0, 0));
        }
        Self {
            labels: HashMap::new(),
            coords,
        }
    }

    /// Load the `ID: LABEL` map. Unknown IDs are warned about and skipped;
    /// duplicates overwrite with a warning; reserved IDs left unassigned get
    /// their documented default label afterwards.
    pub fn load_labels(&mut self, path: &Path) -> DriveResult<()> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(
                    "couldn't open label map {}: {e}. Using default labels",
                    path.display()
                );
                self.apply_default_labels();
                return Ok(());
            }
        };

        for (index, line) in contents.lines().enumerate() {
            let line_number = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                warn!("ID-label map: line {line_number} ignored as no key-value pair found: {line:?}");
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            if key.parse::<ElementId>().is_err() {
                warn!("ID-label map: unrecognised key in line {line_number}: {key:?}");
                continue;
            }
            if let Some(previous) = self.labels.get(key) {
                warn!(
                    "ID-label map: overwriting previous definition of {key:?} from {previous:?} to {value:?}"
                );
            }
            self.labels.insert(key.to_string(), value.to_string());
        }
        self.apply_default_labels();
        Ok(())
    }

    fn apply_default_labels(&mut self) {
        for reserved in ReservedElement::ALL {
            self.labels
                .entry(reserved.id().to_string())
                .or_insert_with(|| reserved.default_label().to_string());
        }
    }

    /// Load the `ID H V` encoder coordinate map. Lines with non-integer
    /// fields are skipped with a diagnostic; an unreadable file is an error,
    /// because without it no element can be trusted to move anywhere.
    pub fn load_coordinates(&mut self, path: &Path) -> DriveResult<()> {
        let contents = fs::read_to_string(path).map_err(|e| {
            DriveError::Config(format!(
                "couldn't open element coordinate map {}: {e}",
                path.display()
            ))
        })?;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                warn!("coordinate map: skipping line {line:?} (need ID, H and V)");
                continue;
            }
            let Ok(horizontal) = fields[1].parse::<i64>() else {
                warn!("could not convert first value to integer in line {line:?}. Skipping");
                continue;
            };
            let Ok(vertical) = fields[2].parse::<i64>() else {
                warn!("could not convert second value to integer in line {line:?}. Skipping");
                continue;
            };
            self.coords
                .insert(fields[0].to_string(), (horizontal, vertical));
        }
        Ok(())
    }

    /// The label for an ID; an unmapped ID labels as itself.
    pub fn label(&self, id: &str) -> String {
        self.labels
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    /// The (horizontal, vertical) encoder coordinates for an ID; (0, 0) when
    /// unmapped.
    pub fn coords(&self, id: &str) -> (i64, i64) {
        self.coords.get(id).copied().unwrap_or((0, 0))
    }
}

impl Default for ElementRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_ladder_id_round_trip() {
        let id: ElementId = "2.0.3".parse().unwrap();
        assert_eq!(id, ElementId::Ladder { frame: 2, x: 0, y: 3 });
        assert_eq!(id.to_string(), "2.0.3");
    }

    #[test]
    fn test_reserved_id_round_trip() {
        for reserved in ReservedElement::ALL {
            let id: ElementId = reserved.id().parse().unwrap();
            assert_eq!(id, ElementId::Reserved(reserved));
            assert_eq!(id.to_string(), reserved.id());
        }
    }

    #[test]
    fn test_id_grammar_is_exact() {
        assert!("1.2".parse::<ElementId>().is_err());
        assert!("1.2.3.4".parse::<ElementId>().is_err());
        assert!("1.2.x".parse::<ElementId>().is_err());
        assert!("-1.2.3".parse::<ElementId>().is_err());
        assert!(" 1.2.3".parse::<ElementId>().is_err());
        assert!("bb.tiny".parse::<ElementId>().is_err());
    }

    #[test]
    fn test_registry_is_total() {
        let registry = ElementRegistry::new();
        assert_eq!(registry.coords("never.heard.of"), (0, 0));
        assert_eq!(registry.label("never.heard.of"), "never.heard.of");
        assert_eq!(registry.coords("vert_slit"), (0, 0));
    }

    #[test]
    fn test_label_loading_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# labels").unwrap();
        writeln!(file, "0.0.0: Empty frame").unwrap();
        writeln!(file, "vert_slit: 1 mm slit").unwrap();
        writeln!(file, "not_an_id: Mystery").unwrap();
        writeln!(file, "0.0.0: CD2 target").unwrap();

        let mut registry = ElementRegistry::new();
        registry.load_labels(file.path()).unwrap();

        // Duplicate overwrote with a warning.
        assert_eq!(registry.label("0.0.0"), "CD2 target");
        // File label beats the default.
        assert_eq!(registry.label("vert_slit"), "1 mm slit");
        // Unknown key skipped.
        assert_eq!(registry.label("not_an_id"), "not_an_id");
        // Unassigned reserved IDs got their documented defaults.
        assert_eq!(registry.label("horz_slit"), "Horizontal slit");
        assert_eq!(registry.label("bm.fc"), "Faraday cup");
    }

    #[test]
    fn test_missing_label_file_uses_defaults() {
        let mut registry = ElementRegistry::new();
        registry
            .load_labels(Path::new("/nonexistent/label/map.txt"))
            .unwrap();
        assert_eq!(registry.label("bb.clear"), "No BB");
    }

    #[test]
    fn test_coordinate_loading() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# coordinates").unwrap();
        writeln!(file, "vert_slit 1200 -350").unwrap();
        writeln!(file, "1.0.0 800 200").unwrap();
        writeln!(file, "bb.small fifty -90").unwrap();
        writeln!(file, "bb.medium 50 ninety").unwrap();

        let mut registry = ElementRegistry::new();
        registry.load_coordinates(file.path()).unwrap();

        assert_eq!(registry.coords("vert_slit"), (1200, -350));
        assert_eq!(registry.coords("1.0.0"), (800, 200));
        // Non-integer fields abort the line, leaving the seeded default.
        assert_eq!(registry.coords("bb.small"), (0, 0));
        assert_eq!(registry.coords("bb.medium"), (0, 0));
    }

    #[test]
    fn test_target_axes_per_element_family() {
        let ladder: ElementId = "1.2.0".parse().unwrap();
        assert_eq!(target_axes(&ladder), (3, Some(5)));
        let slit: ElementId = "vert_slit".parse().unwrap();
        assert_eq!(target_axes(&slit), (3, Some(5)));
        let blocker: ElementId = "bb.medium".parse().unwrap();
        assert_eq!(target_axes(&blocker), (6, Some(7)));
        let monitor: ElementId = "bm.zd".parse().unwrap();
        assert_eq!(target_axes(&monitor), (4, None));
    }

    #[test]
    fn test_missing_coordinate_file_is_fatal() {
        let mut registry = ElementRegistry::new();
        assert!(registry
            .load_coordinates(Path::new("/nonexistent/dist/map.txt"))
            .is_err());
    }
}
