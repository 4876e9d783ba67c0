//! Snapshot publishing sinks.
//!
//! A failed publish is reported to the caller, which logs it; it never
//! turns a cycle into a failure.

use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use diematic_common::{Format, encode};
use thiserror::Error;
use tracing::{debug, warn};
use zenoh::Session;

use crate::config::InfluxConfig;
use crate::decode::Value;
use crate::snapshot::Snapshot;

/// Errors that can occur while publishing a snapshot.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("InfluxDB rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to publish to {key}: {message}")]
    Zenoh { key: String, message: String },
}

/// Destination for snapshots.
pub trait SnapshotSink {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Publish one snapshot.
    fn publish(&self, snapshot: &Snapshot) -> impl Future<Output = Result<(), PublishError>> + Send;
}

/// The sinks selectable from configuration.
#[derive(Debug)]
pub enum Sink {
    /// Discard snapshots (they are still logged by the poller).
    None,
    Influx(InfluxSink),
    Zenoh(ZenohSink),
}

impl SnapshotSink for Sink {
    fn name(&self) -> &'static str {
        match self {
            Sink::None => "none",
            Sink::Influx(sink) => sink.name(),
            Sink::Zenoh(sink) => sink.name(),
        }
    }

    async fn publish(&self, snapshot: &Snapshot) -> Result<(), PublishError> {
        match self {
            Sink::None => Ok(()),
            Sink::Influx(sink) => sink.publish(snapshot).await,
            Sink::Zenoh(sink) => sink.publish(snapshot).await,
        }
    }
}

/// Writes snapshots to InfluxDB 1.x over HTTP using line protocol.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: reqwest::Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.write_url(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }
}

impl SnapshotSink for InfluxSink {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    async fn publish(&self, snapshot: &Snapshot) -> Result<(), PublishError> {
        let Some(body) = line_protocol(snapshot) else {
            warn!(
                measurement = %snapshot.measurement,
                "Snapshot has no known value, skipping InfluxDB write"
            );
            return Ok(());
        };

        let mut request = self
            .client
            .post(&self.url)
            .query(&[("db", self.database.as_str()), ("precision", "ms")])
            .body(body);

        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(url = %self.url, database = %self.database, "Snapshot written to InfluxDB");
        Ok(())
    }
}

/// Render a snapshot as one InfluxDB line, millisecond precision.
///
/// Unknown values are omitted. Returns `None` when no field is known, since
/// a line needs at least one field.
pub fn line_protocol(snapshot: &Snapshot) -> Option<String> {
    let mut line = escape(&snapshot.measurement, &[',', ' ']);

    for (key, value) in &snapshot.tags {
        if value.is_empty() {
            continue;
        }
        let _ = write!(
            line,
            ",{}={}",
            escape(key, &[',', '=', ' ']),
            escape(value, &[',', '=', ' '])
        );
    }

    let mut separator = ' ';
    for (name, value) in snapshot.fields.iter() {
        let Some(value) = value else { continue };
        line.push(separator);
        separator = ',';
        let _ = match value {
            Value::Integer(n) => write!(line, "{}={}i", name, n),
            Value::Bit(b) => write!(line, "{}={}i", name, b),
            Value::Float(v) => write!(line, "{}={}", name, v),
        };
    }

    if separator == ' ' {
        return None;
    }

    let _ = write!(line, " {}", snapshot.timestamp);
    Some(line)
}

fn escape(text: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\\' || special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Publishes snapshots as a single record on a Zenoh key.
#[derive(Debug, Clone)]
pub struct ZenohSink {
    session: Arc<Session>,
    key: String,
    format: Format,
}

impl ZenohSink {
    pub fn new(session: Arc<Session>, key_prefix: &str, measurement: &str, format: Format) -> Self {
        Self {
            session,
            key: build_key_expr(key_prefix, measurement),
            format,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl SnapshotSink for ZenohSink {
    fn name(&self) -> &'static str {
        "zenoh"
    }

    async fn publish(&self, snapshot: &Snapshot) -> Result<(), PublishError> {
        let payload = encode(snapshot, self.format)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        self.session
            .put(&self.key, payload)
            .await
            .map_err(|e| PublishError::Zenoh {
                key: self.key.clone(),
                message: e.to_string(),
            })?;

        debug!("Published snapshot to '{}'", self.key);
        Ok(())
    }
}

/// Key expression for a measurement's snapshots.
pub fn build_key_expr(prefix: &str, measurement: &str) -> String {
    format!("{}/{}/snapshot", prefix.trim_end_matches('/'), measurement)
}
