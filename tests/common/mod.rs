//! Shared helpers for the integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use solenoid_drive::axis::{default_axis_table, AxisBank};
use solenoid_drive::client::DriveController;
use solenoid_drive::error::DriveResult;
use solenoid_drive::link::{SerialLink, Transport};

/// A transport that records every write and replies from a script, so tests
/// can assert exactly which bytes would have reached the motor box.
pub struct RecordingTransport {
    writes: Arc<Mutex<Vec<String>>>,
    replies: Arc<Mutex<VecDeque<String>>>,
    open: bool,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn open(&mut self) -> DriveResult<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> DriveResult<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn port_name(&self) -> &str {
        "recording"
    }

    async fn write(&mut self, bytes: &[u8]) -> DriveResult<()> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(String::from_utf8_lossy(bytes).into_owned());
        Ok(())
    }

    async fn read_line(&mut self) -> DriveResult<String> {
        Ok(self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_default())
    }
}

/// Controller wired to a [`RecordingTransport`], plus handles to its write
/// log and scripted reply queue.
pub struct Harness {
    pub client: Arc<DriveController>,
    pub writes: Arc<Mutex<Vec<String>>>,
    pub replies: Arc<Mutex<VecDeque<String>>>,
}

impl Harness {
    /// Build with the given disabled axes and `ExperimentalMode` flag.
    pub fn new(disabled: &[u8], experimental_mode: bool) -> Self {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(VecDeque::new()));
        let transport = RecordingTransport {
            writes: writes.clone(),
            replies: replies.clone(),
            open: true,
        };
        let link = SerialLink::new(Box::new(transport));
        let axes = AxisBank::new(default_axis_table(), disabled).expect("axis bank");
        let client = Arc::new(DriveController::new(
            link,
            axes,
            experimental_mode,
            None,
        ));
        Self {
            client,
            writes,
            replies,
        }
    }

    /// Queue one scripted reply line.
    pub fn push_reply(&self, line: &str) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(line.to_string());
    }

    /// The writes recorded so far.
    pub fn written(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
