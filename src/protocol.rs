//! Wire grammar for the Mclennan motor controller.
//!
//! Commands are ASCII: `<axis><verb><arg>\r`, with a two-letter lowercase verb
//! and an optional signed integer argument. Ordinary replies echo the command
//! and answer with `\r<axis>:<body>\r\n`; the `qa` verb answers with a
//! multi-line banner starting `\r<axis>Mclennan` and terminated by an empty
//! line. All matchers are compiled once and shared; the same patterns are
//! needed by the client, the link, and the simulator.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AbortKind, DriveError, DriveResult};

/// Datum mode byte sent before a datum search (`dm` command), eight ASCII
/// `0`/`1` characters `abcdefgh`:
///
/// - `a`: 0 = encoder index input polarity is normal
/// - `b`: 0 = datum point is captured only once (i.e. after `hd`)
/// - `c`: 1 = datum position is set to home position after the search
/// - `d`: 0 = automatic direction search disabled
/// - `e`: 0 = automatic opposite limit search disabled
/// - `f`–`h`: reserved for future use, left at 0
pub const DATUM_MODE: &str = "00101000";

/// Verbs that cause movement on a motor axis.
pub const MOVEMENT_VERBS: [&str; 5] = ["ma", "mr", "cv", "hd", "md"];

/// Verbs accepted even on a disabled axis.
pub const ALWAYS_PERMITTED_VERBS: [&str; 4] = ["co", "oa", "qa", "ab"];

static COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)([a-z]{2})(-?\d*)\r?$").unwrap_or_else(|e| panic!("command regex: {e}"))
});

static WIRE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+[a-z]{2}-?\d*\r$").unwrap_or_else(|e| panic!("wire regex: {e}"))
});

static REPLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.*\r(\d+):(.*)\r\n$").unwrap_or_else(|e| panic!("reply regex: {e}"))
});

static BANNER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^.*\r(\d*)Mclennan").unwrap_or_else(|e| panic!("banner regex: {e}"))
});

/// A single command for the motor controller.
///
/// The argument is stored as the raw digit string so that fixed-width values
/// such as the datum mode byte survive a construct/deconstruct round trip
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Axis number, 1-based.
    pub axis: u8,
    /// Two-letter lowercase verb.
    pub verb: String,
    arg: String,
}

impl Command {
    /// Command with no argument, e.g. `3oa`.
    pub fn bare(axis: u8, verb: &str) -> Self {
        Self {
            axis,
            verb: verb.to_string(),
            arg: String::new(),
        }
    }

    /// Command with a signed integer argument, e.g. `3ma-1200`.
    pub fn with_arg(axis: u8, verb: &str, value: i64) -> Self {
        Self {
            axis,
            verb: verb.to_string(),
            arg: value.to_string(),
        }
    }

    /// Command with a verbatim argument string, e.g. the datum mode byte
    /// `2dm00101000` whose leading zeros are significant.
    pub fn with_raw_arg(axis: u8, verb: &str, raw: impl Into<String>) -> Self {
        Self {
            axis,
            verb: verb.to_string(),
            arg: raw.into(),
        }
    }

    /// The argument as a signed integer, if present.
    pub fn arg(&self) -> Option<i64> {
        if self.arg.is_empty() {
            None
        } else {
            self.arg.parse().ok()
        }
    }

    /// The argument exactly as it will appear on the wire.
    pub fn raw_arg(&self) -> &str {
        &self.arg
    }

    /// Canonical wire form `<axis><verb><arg>\r`.
    pub fn wire(&self) -> String {
        format!("{}{}{}\r", self.axis, self.verb, self.arg)
    }

    /// Deconstruct a command string (with or without the trailing `\r`).
    /// Returns `None` if the text does not follow the command grammar.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = COMMAND_RE.captures(text)?;
        let axis: u8 = caps.get(1)?.as_str().parse().ok()?;
        Some(Self {
            axis,
            verb: caps.get(2)?.as_str().to_string(),
            arg: caps.get(3)?.as_str().to_string(),
        })
    }

    /// True if this verb causes movement on the axis.
    pub fn is_movement(&self) -> bool {
        MOVEMENT_VERBS.contains(&self.verb.as_str())
    }

    /// True if this verb is accepted even when the axis is disabled.
    pub fn is_always_permitted(&self) -> bool {
        ALWAYS_PERMITTED_VERBS.contains(&self.verb.as_str())
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.axis, self.verb, self.arg)
    }
}

/// True if `wire` matches the canonical command pattern exactly.
pub fn is_canonical_wire(wire: &str) -> bool {
    WIRE_RE.is_match(wire)
}

/// True if the first reply line opens a multi-line banner.
pub fn is_banner(line: &str) -> bool {
    BANNER_RE.is_match(line)
}

/// A parsed reply from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Ordinary reply `\r<axis>:<body>\r\n`. The body is kept verbatim,
    /// trailing padding included.
    Line {
        /// Axis number the controller answered for.
        axis: u8,
        /// Verbatim reply body.
        body: String,
    },
    /// Multi-line banner from `qa`. The axis digits may be absent.
    Banner {
        /// Axis number, when the banner carried one.
        axis: Option<u8>,
        /// Every banner line, first line included.
        lines: Vec<String>,
    },
}

impl Reply {
    /// The body of an ordinary reply, trimmed.
    pub fn body(&self) -> Option<&str> {
        match self {
            Reply::Line { body, .. } => Some(body.trim()),
            Reply::Banner { .. } => None,
        }
    }

    /// Motion status parsed from the reply body, if this is an ordinary reply.
    pub fn motion_status(&self) -> Option<MotionStatus> {
        self.body().map(MotionStatus::parse)
    }
}

/// Classify a raw reply. An empty first line means the read deadline expired
/// with no reply; a non-empty line matching neither pattern is malformed.
pub fn parse_reply(first: &str, rest: Vec<String>) -> DriveResult<Reply> {
    if first.is_empty() {
        return Err(DriveError::LinkTimeout);
    }
    if let Some(caps) = REPLY_RE.captures(first) {
        let axis = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| DriveError::ProtocolMalformed(first.to_string()))?;
        let body = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
        return Ok(Reply::Line { axis, body });
    }
    if let Some(caps) = BANNER_RE.captures(first) {
        let axis = caps.get(1).and_then(|m| m.as_str().parse().ok());
        let mut lines = vec![first.to_string()];
        lines.extend(rest);
        return Ok(Reply::Banner { axis, lines });
    }
    Err(DriveError::ProtocolMalformed(first.to_string()))
}

/// Motion state of an axis as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionStatus {
    /// At rest, ready for commands.
    Idle,
    /// Travelling towards a target.
    Moving,
    /// Reset issued while nothing was aborted; benign.
    NotAborted,
    /// Aborted, with the reported subclass.
    Aborted(AbortKind),
    /// Anything the status grammar does not cover.
    #[default]
    Unknown,
}

impl MotionStatus {
    /// Parse a status body such as `Idle`, `! STALL ABORT` or
    /// `! MOVING TO 12000`.
    pub fn parse(body: &str) -> Self {
        let body = body.trim();
        if body.contains("ABORT") {
            if body.contains("NOT ABORTED") {
                return MotionStatus::NotAborted;
            }
            if body.contains("STALL") {
                return MotionStatus::Aborted(AbortKind::Stall);
            }
            if body.contains("TRACKING") {
                return MotionStatus::Aborted(AbortKind::Tracking);
            }
            if body.contains("ENCODER") {
                return MotionStatus::Aborted(AbortKind::Encoder);
            }
            if body.contains("COMMAND") {
                return MotionStatus::Aborted(AbortKind::Command);
            }
            return MotionStatus::Aborted(AbortKind::Unknown);
        }
        if body.starts_with("Idle") {
            return MotionStatus::Idle;
        }
        if body.contains("MOVING") {
            return MotionStatus::Moving;
        }
        MotionStatus::Unknown
    }

    /// True for any abort other than the benign `NOT ABORTED`.
    pub fn is_fault(&self) -> bool {
        matches!(self, MotionStatus::Aborted(_))
    }

    /// The abort subclass, if this is a fault.
    pub fn abort_kind(&self) -> Option<AbortKind> {
        match self {
            MotionStatus::Aborted(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Short display name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionStatus::Idle => "Idle",
            MotionStatus::Moving => "Moving",
            MotionStatus::NotAborted => "NotAborted",
            MotionStatus::Aborted(AbortKind::Stall) => "StallAborted",
            MotionStatus::Aborted(AbortKind::Tracking) => "TrackingAborted",
            MotionStatus::Aborted(AbortKind::Encoder) => "EncoderAborted",
            MotionStatus::Aborted(AbortKind::Command) => "CommandAborted",
            MotionStatus::Aborted(AbortKind::Unknown) => "Aborted",
            MotionStatus::Unknown => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construct_deconstruct_round_trip() {
        let cmd = Command::with_arg(3, "ma", -1200);
        let back = Command::parse(&cmd.wire()).unwrap();
        assert_eq!(back.axis, 3);
        assert_eq!(back.verb, "ma");
        assert_eq!(back.arg(), Some(-1200));

        let bare = Command::bare(7, "oa");
        let back = Command::parse(&bare.wire()).unwrap();
        assert_eq!((back.axis, back.verb.as_str(), back.arg()), (7, "oa", None));
    }

    #[test]
    fn test_datum_mode_arg_survives_round_trip() {
        let cmd = Command::with_raw_arg(2, "dm", DATUM_MODE);
        assert_eq!(cmd.wire(), "2dm00101000\r");
        let back = Command::parse(&cmd.wire()).unwrap();
        assert_eq!(back.raw_arg(), DATUM_MODE);
    }

    #[test]
    fn test_wire_form_is_canonical() {
        for cmd in [
            Command::bare(1, "ab"),
            Command::with_arg(4, "mr", 100),
            Command::with_arg(3, "ma", -12587),
            Command::with_raw_arg(2, "dm", DATUM_MODE),
        ] {
            assert!(is_canonical_wire(&cmd.wire()), "{:?}", cmd.wire());
        }
        assert!(!is_canonical_wire("3oa"));
        assert!(!is_canonical_wire("oa3\r"));
        assert!(!is_canonical_wire("3OA\r"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Command::parse("nonsense").is_none());
        assert!(Command::parse("ma3").is_none());
        assert!(Command::parse("").is_none());
    }

    #[test]
    fn test_parse_ordinary_reply() {
        let reply = parse_reply("3oa\r03:12246        \r\n", vec![]).unwrap();
        match reply {
            Reply::Line { axis, ref body } => {
                assert_eq!(axis, 3);
                assert_eq!(body.trim(), "12246");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_reply_without_echo_prefix() {
        let reply = parse_reply("\r03:12246\r\n", vec![]).unwrap();
        assert_eq!(reply.body(), Some("12246"));
    }

    #[test]
    fn test_short_reply_is_malformed_not_parsed() {
        // One byte short of the canonical pattern: missing the final \n.
        let err = parse_reply("3oa\r03:12246\r", vec![]).unwrap_err();
        assert!(matches!(err, DriveError::ProtocolMalformed(_)));
    }

    #[test]
    fn test_empty_reply_is_timeout() {
        let err = parse_reply("", vec![]).unwrap_err();
        assert!(matches!(err, DriveError::LinkTimeout));
    }

    #[test]
    fn test_banner_reply() {
        let first = "03qa\r03Mclennan Digiloop Motor Controller V1.04   Servo mode\r\n";
        assert!(is_banner(first));
        let reply = parse_reply(
            first,
            vec!["Input command: 3qa\r\n".to_string()],
        )
        .unwrap();
        match reply {
            Reply::Banner { axis, lines } => {
                assert_eq!(axis, Some(3));
                assert_eq!(lines.len(), 2);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(MotionStatus::parse("Idle"), MotionStatus::Idle);
        assert_eq!(
            MotionStatus::parse("Idle (TO BE CHECKED)"),
            MotionStatus::Idle
        );
        assert_eq!(
            MotionStatus::parse("! STALL ABORT"),
            MotionStatus::Aborted(AbortKind::Stall)
        );
        assert_eq!(
            MotionStatus::parse("! TRACKING ABORT"),
            MotionStatus::Aborted(AbortKind::Tracking)
        );
        assert_eq!(
            MotionStatus::parse("! ENCODER ABORT"),
            MotionStatus::Aborted(AbortKind::Encoder)
        );
        assert_eq!(
            MotionStatus::parse("! COMMAND ABORT"),
            MotionStatus::Aborted(AbortKind::Command)
        );
        assert_eq!(MotionStatus::parse("! NOT ABORTED"), MotionStatus::NotAborted);
        assert_eq!(
            MotionStatus::parse("! MOVING TO 12000"),
            MotionStatus::Moving
        );
        assert_eq!(MotionStatus::parse("gibberish"), MotionStatus::Unknown);
        assert!(MotionStatus::parse("! WEIRD ABORT").is_fault());
        assert!(!MotionStatus::parse("! NOT ABORTED").is_fault());
    }

    #[test]
    fn test_movement_and_permitted_sets() {
        for verb in MOVEMENT_VERBS {
            assert!(Command::bare(1, verb).is_movement());
        }
        for verb in ALWAYS_PERMITTED_VERBS {
            assert!(Command::bare(1, verb).is_always_permitted());
        }
        assert!(!Command::bare(1, "oa").is_movement());
        assert!(!Command::bare(1, "ma").is_always_permitted());
    }
}
