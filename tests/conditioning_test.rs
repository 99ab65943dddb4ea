//! Conditioning sweep smoke test against the simulator: the axis
//! reciprocates between its limits until cancelled, and the poller comes
//! back afterwards.

use std::sync::Arc;
use std::time::Duration;

use solenoid_drive::axis::{default_axis_table, AxisBank};
use solenoid_drive::client::DriveController;
use solenoid_drive::error::DriveError;
use solenoid_drive::link::SerialLink;
use solenoid_drive::ops::conditioning::{self, SweepConfig};
use solenoid_drive::ops::CancelToken;
use solenoid_drive::poller::Poller;
use solenoid_drive::sim::SimTransport;

#[tokio::test]
async fn test_sweep_reciprocates_until_cancelled() {
    let link = SerialLink::new(Box::new(SimTransport::with_initial_positions(&[0; 7])));
    link.open().await.expect("open simulator");
    let axes = AxisBank::new(default_axis_table(), &[]).expect("axis bank");
    let client = Arc::new(DriveController::new(link, axes, false, None));
    let poller = Poller::spawn(client.clone(), Duration::from_secs(60));

    let mut config = SweepConfig::new(5, -400, 400).with_speeds(50, 200);
    config.poll_interval = Duration::from_millis(200);

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        canceller.cancel();
    });

    let err = conditioning::run(&client, &poller, config, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DriveError::Cancelled), "{err}");

    // The sweep was actually driving the axis: its last polled position is
    // somewhere on the commanded track.
    let position = client.axes().position(5);
    assert!(
        (-400..=400).contains(&position),
        "position {position} outside the sweep range"
    );
    assert!(!poller.is_paused());
    poller.shutdown().await;
}
