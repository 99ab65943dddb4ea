//! Typed options store.
//!
//! Every option the drive system understands is declared once in
//! [`OptionsStore::new`] with its file keyword, default value, validator,
//! required flag and error message. Values come from an options file of
//! `key: value` lines (`#` starts a comment, inline comments are honoured,
//! exactly one colon per non-comment line) and from a small named subset of
//! command-line arguments that override the file. Unknown keys are reported
//! and skipped; required keys left unset abort initialisation with their
//! recorded error messages.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use log::{error, info, warn};

use crate::error::{DriveError, DriveResult};

/// Recoil-detection setup selected for the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoilMode {
    /// No recoil detector in use.
    #[default]
    None,
    /// Silicon recoil detector.
    Silicon,
    /// Gas recoil detector.
    Gas,
}

impl RecoilMode {
    fn from_choice(choice: &str) -> Self {
        match choice {
            "silicon" | "si" => RecoilMode::Silicon,
            "gas" => RecoilMode::Gas,
            _ => RecoilMode::None,
        }
    }
}

/// A validated option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// A signed integer.
    Int(i64),
    /// A floating-point number.
    Float(f64),
    /// A boolean.
    Bool(bool),
    /// Free text, typically a path.
    Str(String),
    /// A comma-separated list of integers.
    IntList(Vec<i64>),
    /// A member of a small closed set, lowercased.
    Choice(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Int(v) => write!(f, "{v}"),
            OptionValue::Float(v) => write!(f, "{v}"),
            OptionValue::Bool(v) => write!(f, "{v}"),
            OptionValue::Str(v) => write!(f, "{v}"),
            OptionValue::IntList(v) => {
                let text: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "{}", text.join(","))
            }
            OptionValue::Choice(v) => write!(f, "{v}"),
        }
    }
}

/// How a raw string becomes a typed value.
#[derive(Debug, Clone)]
pub enum Validator {
    /// Integer, optionally bounded (inclusive).
    Int { min: Option<i64>, max: Option<i64> },
    /// Float, optionally bounded (inclusive).
    Float { min: Option<f64>, max: Option<f64> },
    /// Case-insensitive `true|false|1|0`.
    Bool,
    /// Any string.
    Str,
    /// Comma-separated list of integers; empty input is an empty list.
    IntList,
    /// One of a small closed set of lowercase choices.
    Enumerated(&'static [&'static str]),
}

impl Validator {
    /// Validate `raw`, returning the typed value or a description of the
    /// failure.
    pub fn validate(&self, raw: &str) -> Result<OptionValue, String> {
        match self {
            Validator::Int { min, max } => {
                let value: i64 = raw
                    .parse()
                    .map_err(|_| format!("cannot parse {raw:?} as an integer"))?;
                if let Some(min) = min {
                    if value < *min {
                        return Err(format!("value {value} too small (minimum {min})"));
                    }
                }
                if let Some(max) = max {
                    if value > *max {
                        return Err(format!("value {value} too large (maximum {max})"));
                    }
                }
                Ok(OptionValue::Int(value))
            }
            Validator::Float { min, max } => {
                let value: f64 = raw
                    .parse()
                    .map_err(|_| format!("cannot parse {raw:?} as a number"))?;
                if let Some(min) = min {
                    if value < *min {
                        return Err(format!("value {value} too small (minimum {min})"));
                    }
                }
                if let Some(max) = max {
                    if value > *max {
                        return Err(format!("value {value} too large (maximum {max})"));
                    }
                }
                Ok(OptionValue::Float(value))
            }
            Validator::Bool => match raw.to_lowercase().as_str() {
                "true" | "1" => Ok(OptionValue::Bool(true)),
                "false" | "0" => Ok(OptionValue::Bool(false)),
                _ => Err(format!("cannot parse {raw:?} as a bool")),
            },
            Validator::Str => Ok(OptionValue::Str(raw.to_string())),
            Validator::IntList => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Ok(OptionValue::IntList(Vec::new()));
                }
                let mut values = Vec::new();
                for part in trimmed.split(',') {
                    let part = part.trim();
                    let value: i64 = part
                        .parse()
                        .map_err(|_| format!("cannot parse list element {part:?} as an integer"))?;
                    values.push(value);
                }
                Ok(OptionValue::IntList(values))
            }
            Validator::Enumerated(choices) => {
                let lowered = raw.to_lowercase();
                if choices.contains(&lowered.as_str()) {
                    Ok(OptionValue::Choice(lowered))
                } else {
                    Err(format!(
                        "{raw:?} is not one of {}",
                        choices.join("|")
                    ))
                }
            }
        }
    }
}

/// Declaration of one option.
#[derive(Debug, Clone)]
pub struct OptionDef {
    /// Name used to look the option up in code, and the file keyword when the
    /// option is file-settable.
    pub name: &'static str,
    /// Whether the option may appear in the options file. Command-line-only
    /// options (serial port, options-file path, ...) are not file-settable.
    pub in_file: bool,
    /// How raw text becomes this option's typed value.
    pub validator: Validator,
    /// A required option left unset after loading aborts initialisation.
    pub required: bool,
    /// Message shown when a required option is missing.
    pub error_message: &'static str,
}

struct Entry {
    def: OptionDef,
    value: Option<OptionValue>,
    set_from_file: bool,
}

/// The validated, typed configuration table. Immutable after the initial
/// parse pass; construct it once at startup.
pub struct OptionsStore {
    entries: HashMap<&'static str, Entry>,
    order: Vec<&'static str>,
}

fn def(
    name: &'static str,
    validator: Validator,
) -> OptionDef {
    OptionDef {
        name,
        in_file: true,
        validator,
        required: false,
        error_message: "",
    }
}

fn required_def(
    name: &'static str,
    validator: Validator,
    error_message: &'static str,
) -> OptionDef {
    OptionDef {
        name,
        in_file: true,
        validator,
        required: true,
        error_message,
    }
}

fn cli_def(name: &'static str, validator: Validator) -> OptionDef {
    OptionDef {
        name,
        in_file: false,
        validator,
        required: false,
        error_message: "",
    }
}

impl OptionsStore {
    /// Declare every option with its default.
    pub fn new() -> Self {
        let mut store = Self {
            entries: HashMap::new(),
            order: Vec::new(),
        };

        let unbounded_int = Validator::Int {
            min: None,
            max: None,
        };
        let unbounded_float = Validator::Float {
            min: None,
            max: None,
        };
        let non_negative_float = Validator::Float {
            min: Some(0.0),
            max: None,
        };

        store.declare(def("SilencerLength", non_negative_float.clone()), None);
        store.declare(def("ExperimentalMode", Validator::Bool), Some(OptionValue::Bool(true)));
        store.declare(def("TelemetryAuthentication", Validator::Str), None);
        store.declare(
            def(
                "TargetLadderDimension",
                Validator::Int {
                    min: Some(1),
                    max: Some(2),
                },
            ),
            Some(OptionValue::Int(2)),
        );
        store.declare(def("BeamBlockerEnabled", Validator::Bool), Some(OptionValue::Bool(true)));
        store.declare(def("DisabledAxes", Validator::IntList), Some(OptionValue::IntList(Vec::new())));
        store.declare(
            def("2DLadderLabelMapPath", Validator::Str),
            Some(OptionValue::Str("id_label_map.txt".to_string())),
        );
        store.declare(
            def("2DLadderEncoderPositionMapPath", Validator::Str),
            Some(OptionValue::Str("id_dist_map.txt".to_string())),
        );
        store.declare(
            required_def(
                "ArrayTipToTargetLadderDistanceAtSpecifiedEncoderPositions",
                non_negative_float,
                "Distance between array tip and target ladder MUST be supplied",
            ),
            None,
        );
        store.declare(
            required_def(
                "EncoderAxis1",
                unbounded_int.clone(),
                "Encoder position for axis one MUST be supplied",
            ),
            None,
        );
        store.declare(
            required_def(
                "EncoderAxis2",
                unbounded_int.clone(),
                "Encoder position for axis two MUST be supplied",
            ),
            None,
        );
        store.declare(
            required_def(
                "TargetLadderAxis3ReferencePoint",
                unbounded_float.clone(),
                "Reference point for axis three MUST be supplied",
            ),
            None,
        );
        store.declare(
            required_def(
                "TargetLadderAxis5ReferencePoint",
                unbounded_float.clone(),
                "Reference point for axis five MUST be supplied",
            ),
            None,
        );
        store.declare(def("TargetLadderReferencePointID", Validator::Str), None);
        store.declare(def("BeamBlockerAxis6ReferencePoint", unbounded_float.clone()), None);
        store.declare(def("BeamBlockerAxis7ReferencePoint", unbounded_float), None);
        store.declare(def("BeamBlockerReferencePointID", Validator::Str), None);
        store.declare(
            def("RecoilMode", Validator::Enumerated(&["none", "silicon", "si", "gas"])),
            Some(OptionValue::Choice("none".to_string())),
        );
        store.declare(def("SlitScanParameterFile", Validator::Str), None);
        store.declare(def("DutyCycleAxes", Validator::IntList), Some(OptionValue::IntList(Vec::new())));
        store.declare(def("MotorForce", unbounded_int), None);
        store.declare(
            def("Environment", Validator::Enumerated(&["air", "vacuum"])),
            Some(OptionValue::Choice("vacuum".to_string())),
        );

        // Command-line arguments; these override file values and are not
        // recognised as file keywords.
        store.declare(
            cli_def("SerialPort", Validator::Str),
            Some(OptionValue::Str(crate::link::DEFAULT_SERIAL_PORT.to_string())),
        );
        store.declare(
            cli_def("OptionsFile", Validator::Str),
            Some(OptionValue::Str("options.txt".to_string())),
        );
        store.declare(cli_def("DarkMode", Validator::Bool), Some(OptionValue::Bool(false)));
        store.declare(cli_def("MonitorResources", Validator::Bool), Some(OptionValue::Bool(false)));
        store.declare(cli_def("NoGUI", Validator::Bool), Some(OptionValue::Bool(false)));

        store
    }

    fn declare(&mut self, def: OptionDef, default: Option<OptionValue>) {
        self.order.push(def.name);
        self.entries.insert(
            def.name,
            Entry {
                def,
                value: default,
                set_from_file: false,
            },
        );
    }

    /// Validate and store a value for a known option.
    pub fn set(&mut self, name: &str, raw: &str) -> DriveResult<()> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| DriveError::Config(format!("unknown option {name:?}")))?;
        let value = entry
            .def
            .validator
            .validate(raw)
            .map_err(|e| DriveError::Config(format!("option {name}: {e}")))?;
        entry.value = Some(value);
        Ok(())
    }

    /// Store an already-typed value, bypassing string validation. Used for
    /// command-line flags that clap has already parsed.
    pub fn set_value(&mut self, name: &str, value: OptionValue) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.value = Some(value);
        }
    }

    /// Load the options file. Recoverable line problems are logged and
    /// skipped; an unreadable file is a hard configuration error.
    pub fn load_file(&mut self, path: &Path) -> DriveResult<()> {
        let contents = fs::read_to_string(path).map_err(|e| {
            DriveError::Config(format!("cannot read options file {}: {e}", path.display()))
        })?;

        for (index, line) in contents.lines().enumerate() {
            let line_number = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.matches(':').count() != 1 {
                error!("OPTION ERROR: line {line_number} does not contain a valid option -> [{line}]");
                continue;
            }
            let (key, value) = match line.split_once(':') {
                Some(pair) => pair,
                None => continue,
            };
            let key = key.trim();
            let mut value = value.trim();
            if key.is_empty() {
                error!("OPTION ERROR: line {line_number} does not contain a valid key -> [{line}]");
                continue;
            }
            if value.is_empty() {
                error!("OPTION ERROR: line {line_number} does not contain a valid value -> [{line}]");
                continue;
            }
            if let Some((before, _)) = value.split_once('#') {
                value = before.trim();
            }

            let known = self
                .entries
                .get(key)
                .map(|entry| entry.def.in_file)
                .unwrap_or(false);
            if !known {
                error!("OPTION ERROR: key {key:?} is unknown. Ignoring...");
                continue;
            }
            if let Some(entry) = self.entries.get(key) {
                if entry.set_from_file {
                    warn!("option already set for {key}. Overwriting...");
                }
            }
            match self.set(key, value) {
                Ok(()) => {
                    if let Some(entry) = self.entries.get_mut(key) {
                        entry.set_from_file = true;
                    }
                }
                Err(e) => error!("OPTION ERROR: line {line_number}: {e}"),
            }
        }
        Ok(())
    }

    /// Fail with the recorded error messages if any required option is still
    /// unset.
    pub fn ensure_required(&self) -> DriveResult<()> {
        let mut message = String::new();
        for name in &self.order {
            if let Some(entry) = self.entries.get(name) {
                if entry.def.required && entry.value.is_none() {
                    message.push_str("   * ");
                    message.push_str(entry.def.error_message);
                    message.push('\n');
                }
            }
        }
        if message.is_empty() {
            Ok(())
        } else {
            Err(DriveError::Config(format!(
                "required options missing:\n{message}"
            )))
        }
    }

    /// The current value of an option, if set.
    pub fn value(&self, name: &str) -> Option<&OptionValue> {
        self.entries.get(name).and_then(|entry| entry.value.as_ref())
    }

    /// A boolean option, `None` when unset or of another type.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.value(name) {
            Some(OptionValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// An integer option, `None` when unset or of another type.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.value(name) {
            Some(OptionValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// A numeric option as a float; integer values widen.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.value(name) {
            Some(OptionValue::Float(v)) => Some(*v),
            Some(OptionValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// A string or enumerated-choice option.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.value(name) {
            Some(OptionValue::Str(v)) => Some(v.as_str()),
            Some(OptionValue::Choice(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// An integer-list option; unset reads as the empty list.
    pub fn get_int_list(&self, name: &str) -> Vec<i64> {
        match self.value(name) {
            Some(OptionValue::IntList(v)) => v.clone(),
            _ => Vec::new(),
        }
    }

    /// The configured recoil-detection mode.
    pub fn get_recoil_mode(&self) -> RecoilMode {
        self.get_str("RecoilMode")
            .map(RecoilMode::from_choice)
            .unwrap_or_default()
    }

    /// Log the whole table, one option per line.
    pub fn log_all(&self) {
        for name in &self.order {
            if let Some(entry) = self.entries.get(name) {
                match &entry.value {
                    Some(value) => info!("{name:<58} : {value}"),
                    None => info!("{name:<58} : <unset>"),
                }
            }
        }
    }
}

impl Default for OptionsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn store_with_required_set() -> OptionsStore {
        let mut store = OptionsStore::new();
        store.set("ArrayTipToTargetLadderDistanceAtSpecifiedEncoderPositions", "100.0").unwrap();
        store.set("EncoderAxis1", "19459").unwrap();
        store.set("EncoderAxis2", "-40120").unwrap();
        store.set("TargetLadderAxis3ReferencePoint", "0.0").unwrap();
        store.set("TargetLadderAxis5ReferencePoint", "0.0").unwrap();
        store
    }

    #[test]
    fn test_defaults() {
        let store = OptionsStore::new();
        assert_eq!(store.get_bool("ExperimentalMode"), Some(true));
        assert_eq!(store.get_i64("TargetLadderDimension"), Some(2));
        assert!(store.get_int_list("DisabledAxes").is_empty());
        assert_eq!(store.get_str("SerialPort"), Some("/dev/ttyS0"));
        assert_eq!(store.get_recoil_mode(), RecoilMode::None);
    }

    #[test]
    fn test_numeric_validator_rejects_out_of_range() {
        let mut store = OptionsStore::new();
        assert!(store.set("TargetLadderDimension", "3").is_err());
        assert!(store.set("TargetLadderDimension", "0").is_err());
        assert!(store.set("SilencerLength", "-1.0").is_err());
        assert!(store.set("TargetLadderDimension", "1").is_ok());
    }

    #[test]
    fn test_bool_validator() {
        let validator = Validator::Bool;
        assert_eq!(validator.validate("True"), Ok(OptionValue::Bool(true)));
        assert_eq!(validator.validate("1"), Ok(OptionValue::Bool(true)));
        assert_eq!(validator.validate("FALSE"), Ok(OptionValue::Bool(false)));
        assert_eq!(validator.validate("0"), Ok(OptionValue::Bool(false)));
        assert!(validator.validate("yes").is_err());
    }

    #[test]
    fn test_int_list_validator() {
        let validator = Validator::IntList;
        assert_eq!(
            validator.validate("4, 6,7"),
            Ok(OptionValue::IntList(vec![4, 6, 7]))
        );
        assert_eq!(validator.validate(""), Ok(OptionValue::IntList(vec![])));
        assert!(validator.validate("4,x").is_err());
    }

    #[test]
    fn test_enumerated_validator() {
        let validator = Validator::Enumerated(&["air", "vacuum"]);
        assert_eq!(
            validator.validate("Vacuum"),
            Ok(OptionValue::Choice("vacuum".to_string()))
        );
        assert!(validator.validate("water").is_err());
    }

    #[test]
    fn test_load_file_with_comments_and_duplicates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# options for the bench setup").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "DisabledAxes: 4").unwrap();
        writeln!(file, "ExperimentalMode: false # safe on the bench").unwrap();
        writeln!(file, "DisabledAxes: 4,6").unwrap();
        writeln!(file, "NotAnOption: 12").unwrap();
        writeln!(file, "EncoderAxis1: 19459").unwrap();

        let mut store = OptionsStore::new();
        store.load_file(file.path()).unwrap();
        // Duplicate overwrites with a warning.
        assert_eq!(store.get_int_list("DisabledAxes"), vec![4, 6]);
        // Inline comment stripped.
        assert_eq!(store.get_bool("ExperimentalMode"), Some(false));
        assert_eq!(store.get_i64("EncoderAxis1"), Some(19459));
        // Unknown key skipped without state change.
        assert!(store.value("NotAnOption").is_none());
    }

    #[test]
    fn test_cli_only_options_not_file_settable() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "SerialPort: /dev/ttyUSB9").unwrap();
        let mut store = OptionsStore::new();
        store.load_file(file.path()).unwrap();
        assert_eq!(store.get_str("SerialPort"), Some("/dev/ttyS0"));
    }

    #[test]
    fn test_missing_required_option_aborts() {
        let store = OptionsStore::new();
        let err = store.ensure_required().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Distance between array tip and target ladder"));
        assert!(text.contains("Encoder position for axis one"));
    }

    #[test]
    fn test_all_required_set_passes() {
        let store = store_with_required_set();
        store.ensure_required().unwrap();
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "TooMany: colons: here").unwrap();
        writeln!(file, ": novalue").unwrap();
        writeln!(file, "EncoderAxis2:").unwrap();
        let mut store = OptionsStore::new();
        store.load_file(file.path()).unwrap();
        assert!(store.value("EncoderAxis2").is_none());
    }
}
