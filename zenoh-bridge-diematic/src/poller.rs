//! Acquisition cycle: connect, read blocks, disconnect, decode, publish.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::acquisition::{Acquisition, AcquisitionPlan};
use crate::config::ModbusConfig;
use crate::decode::decode;
use crate::schema::Schema;
use crate::sink::SnapshotSink;
use crate::snapshot::{Snapshot, SnapshotAssembler};
use crate::transport::{RegisterReader, RtuTransport};

/// Polls the boiler controller and hands snapshots to a sink.
pub struct Poller<S> {
    schema: Arc<Schema>,
    plan: AcquisitionPlan,
    modbus: ModbusConfig,
    assembler: SnapshotAssembler,
    sink: S,
}

impl<S: SnapshotSink> Poller<S> {
    /// Create a poller for the configured link and blocks.
    pub fn new(
        schema: Arc<Schema>,
        modbus: ModbusConfig,
        assembler: SnapshotAssembler,
        sink: S,
    ) -> Self {
        let plan = AcquisitionPlan::new(&schema, modbus.blocks.clone(), modbus.retries);

        Self {
            schema,
            plan,
            modbus,
            assembler,
            sink,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn plan(&self) -> &AcquisitionPlan {
        &self.plan
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Poll every `interval` until the future is dropped.
    pub async fn run(&self, interval: Duration) {
        info!(
            "Starting Diematic poller on {} (interval: {}s)",
            self.modbus.device.as_deref().unwrap_or("<unset>"),
            interval.as_secs()
        );

        loop {
            let snapshot = self.poll_once().await;
            debug!(
                "Cycle done: {}/{} values known",
                snapshot.fields.known_count(),
                snapshot.fields.len()
            );

            tokio::time::sleep(interval).await;
        }
    }

    /// Run one cycle on the serial link.
    ///
    /// If the port cannot be opened every value is unknown; the snapshot is
    /// still assembled and published.
    pub async fn poll_once(&self) -> Snapshot {
        match RtuTransport::connect(&self.modbus) {
            Ok(transport) => self.cycle(transport).await,
            Err(e) => {
                error!("Failed to open Modbus link: {}", e);
                let timestamp = chrono::Utc::now().timestamp_millis();
                self.finish(self.plan.unread(), timestamp).await
            }
        }
    }

    /// Run one cycle on an already open connection, which is consumed and
    /// disconnected before decoding.
    pub async fn cycle<R: RegisterReader>(&self, mut reader: R) -> Snapshot {
        let acquisition = self.plan.acquire(&mut reader).await;
        let timestamp = chrono::Utc::now().timestamp_millis();

        if let Err(e) = reader.disconnect().await {
            warn!("Failed to close Modbus link: {}", e);
        }
        drop(reader);

        self.finish(acquisition, timestamp).await
    }

    async fn finish(&self, acquisition: Acquisition, timestamp: i64) -> Snapshot {
        if !acquisition.is_complete() {
            let failed: Vec<String> = acquisition
                .failed_blocks()
                .map(|b| b.to_string())
                .collect();
            warn!(blocks = ?failed, "Partial acquisition, affected values are unknown");
        }
        trace!("Raw registers:\n{}", acquisition.registers.dump());

        let values = decode(&self.schema, &acquisition.registers);
        let snapshot = self.assembler.assemble(values, timestamp);
        info!("Snapshot:\n{}", snapshot.dump());

        self.publish(&snapshot).await;
        snapshot
    }

    async fn publish(&self, snapshot: &Snapshot) {
        if let Err(e) = self.sink.publish(snapshot).await {
            let payload = serde_json::to_string(snapshot)
                .unwrap_or_else(|e| format!("<unserializable snapshot: {}>", e));
            error!(
                sink = self.sink.name(),
                payload = %payload,
                "Failed to publish snapshot: {}",
                e
            );
        }
    }
}
