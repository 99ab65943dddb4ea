//! Encoder-position push to the experiment's time-series database.
//!
//! Positions are published as influx line-protocol payloads,
//! `encoder,axis=<n>,name=<name> value=<int>`, POSTed with basic auth to the
//! configured endpoint. Publishing is fire-and-forget through a channel into
//! a dedicated sink task; a failed POST is logged and dropped, never fatal.
//! When the serial port is the simulator the sink is simply not constructed,
//! so nothing is pushed.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Endpoint and credentials for the telemetry push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryAuth {
    /// Basic-auth user name.
    pub username: String,
    /// Basic-auth password.
    pub password: String,
    /// Full write URL of the time-series database.
    pub url: String,
}

/// Parse the authentication file: one `key -> value` per line, needing
/// `username`, `password` and `url`. Duplicate keys are warned about and
/// ignored. Returns `None` (push disabled) unless all three are present.
pub fn read_auth_file(path: &Path) -> Option<TelemetryAuth> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => {
            warn!("could not open telemetry authentication file. Will not push encoder positions");
            return None;
        }
    };

    let mut username = None;
    let mut password = None;
    let mut url = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.matches("->").count() != 1 {
            continue;
        }
        let Some((key, value)) = line.split_once("->") else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().to_string();
        let slot = match key {
            "username" => &mut username,
            "password" => &mut password,
            "url" => &mut url,
            _ => {
                warn!("could not parse telemetry authentication line {line:?}");
                continue;
            }
        };
        if slot.is_some() {
            warn!("ignoring duplicate telemetry {key}...");
            continue;
        }
        *slot = Some(value);
    }

    match (username, password, url) {
        (Some(username), Some(password), Some(url)) => Some(TelemetryAuth {
            username,
            password,
            url,
        }),
        _ => {
            warn!("telemetry authentication incomplete. Will not push encoder positions");
            None
        }
    }
}

/// Format the line-protocol payload for one axis sample. Spaces in the series
/// name are not valid in line protocol and are replaced by underscores.
pub fn payload(axis: u8, name: &str, value: i64) -> String {
    format!(
        "encoder,axis={axis},name={} value={value}",
        name.replace(' ', "_")
    )
}

struct Sample {
    axis: u8,
    name: String,
    value: i64,
}

/// Handle to the telemetry sink task.
pub struct TelemetrySink {
    tx: mpsc::UnboundedSender<Sample>,
    task: JoinHandle<()>,
}

impl TelemetrySink {
    /// Spawn the sink. The certificate check is disabled because the endpoint
    /// sits behind the lab's self-signed proxy.
    pub fn spawn(auth: TelemetryAuth) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Sample>();
        let task = tokio::spawn(async move {
            let client = match reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()
            {
                Ok(client) => client,
                Err(e) => {
                    warn!("could not build telemetry HTTP client: {e}");
                    return;
                }
            };
            while let Some(sample) = rx.recv().await {
                let body = payload(sample.axis, &sample.name, sample.value);
                let result = client
                    .post(&auth.url)
                    .basic_auth(&auth.username, Some(&auth.password))
                    .body(body)
                    .send()
                    .await;
                match result {
                    Ok(response) => debug!("telemetry push: {}", response.status()),
                    Err(e) => warn!("telemetry push failed: {e}"),
                }
            }
        });
        Self { tx, task }
    }

    /// Queue one sample; never blocks and never fails the caller.
    pub fn publish(&self, axis: u8, name: &str, value: i64) {
        let _ = self.tx.send(Sample {
            axis,
            name: name.to_string(),
            value,
        });
    }

    /// Stop the sink after draining queued samples.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_payload_format() {
        assert_eq!(
            payload(3, "TargetH", 12246),
            "encoder,axis=3,name=TargetH value=12246"
        );
        assert_eq!(
            payload(1, "Target carriage", -5),
            "encoder,axis=1,name=Target_carriage value=-5"
        );
    }

    #[test]
    fn test_auth_file_complete() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "username -> monitor").unwrap();
        writeln!(file, "password -> hunter2").unwrap();
        writeln!(file, "url -> https://db.example:8080/write?db=positions").unwrap();
        let auth = read_auth_file(file.path()).unwrap();
        assert_eq!(auth.username, "monitor");
        assert_eq!(auth.password, "hunter2");
        assert!(auth.url.starts_with("https://"));
    }

    #[test]
    fn test_auth_file_duplicates_ignored() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "username -> first").unwrap();
        writeln!(file, "username -> second").unwrap();
        writeln!(file, "password -> p").unwrap();
        writeln!(file, "url -> u").unwrap();
        let auth = read_auth_file(file.path()).unwrap();
        assert_eq!(auth.username, "first");
    }

    #[test]
    fn test_auth_file_incomplete_disables_push() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "username -> monitor").unwrap();
        assert!(read_auth_file(file.path()).is_none());
    }

    #[test]
    fn test_auth_file_missing_disables_push() {
        assert!(read_auth_file(Path::new("/nonexistent/auth.txt")).is_none());
    }
}
