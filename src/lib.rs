//! Core library for the solenoid drive system.
//!
//! This crate is the sole authority over the serial line to the motor
//! controller that positions everything inside the experiment's
//! superconducting solenoid: the two carriages, the two-axis target ladder,
//! the two-axis beam blocker and the diagnostic detector axis.
//!
//! The pieces, leaves first:
//!
//! - [`lock`]: at most one process on the host may claim the line.
//! - [`options`]: the validated, typed configuration table.
//! - [`elements`]: named in-beam elements and their encoder coordinates.
//! - [`link`]: the single-owner byte channel (real port or simulator).
//! - [`protocol`]: the ASCII command/reply grammar.
//! - [`client`]: command policy, response parsing, polling, datum search.
//! - [`poller`]: the background task publishing position snapshots.
//! - [`duty`]: the per-axis duty-cycle governor.
//! - [`ops`]: slit scan and conditioning sweep.
//! - [`sim`]: a drop-in simulation of the motor box for offline use.

pub mod axis;
pub mod client;
pub mod duty;
pub mod elements;
pub mod error;
pub mod link;
pub mod lock;
pub mod options;
pub mod ops;
pub mod poller;
pub mod protocol;
pub mod sim;
pub mod telemetry;

pub use axis::{AxisBank, Snapshot};
pub use client::DriveController;
pub use error::{AbortKind, DriveError, DriveResult, RejectReason};
pub use link::{SerialLink, Transport};
pub use options::OptionsStore;
pub use poller::Poller;
