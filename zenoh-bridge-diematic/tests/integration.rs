//! End-to-end cycles against a simulated controller.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use zenoh_bridge_diematic::acquisition::Block;
use zenoh_bridge_diematic::config::{DiematicBridgeConfig, ModbusConfig};
use zenoh_bridge_diematic::decode::{Value, decode};
use zenoh_bridge_diematic::poller::Poller;
use zenoh_bridge_diematic::registers::RawRegisterArray;
use zenoh_bridge_diematic::schema::{RegisterEntry, Schema, SchemaError};
use zenoh_bridge_diematic::sink::{PublishError, SnapshotSink};
use zenoh_bridge_diematic::snapshot::{Snapshot, SnapshotAssembler};
use zenoh_bridge_diematic::transport::{RegisterReader, TransportError};

/// Controller with a register map; blocks starting at `dead` never answer.
struct SimulatedController {
    registers: HashMap<u16, u16>,
    dead: Vec<u16>,
    reads: Arc<Mutex<Vec<u16>>>,
    disconnected: Arc<Mutex<bool>>,
}

impl SimulatedController {
    fn new(registers: &[(u16, u16)]) -> Self {
        Self {
            registers: registers.iter().copied().collect(),
            dead: Vec::new(),
            reads: Arc::default(),
            disconnected: Arc::default(),
        }
    }

    fn with_dead_block(mut self, start: u16) -> Self {
        self.dead.push(start);
        self
    }
}

impl RegisterReader for SimulatedController {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.reads.lock().unwrap().push(address);
        if self.dead.contains(&address) {
            return Err(TransportError::Timeout(std::time::Duration::from_millis(10)));
        }
        Ok((address..address + count)
            .map(|a| self.registers.get(&a).copied().unwrap_or(0))
            .collect())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        *self.disconnected.lock().unwrap() = true;
        Ok(())
    }
}

/// Keeps every published snapshot; optionally fails each publish.
#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<Snapshot>>,
    fail: bool,
}

impl SnapshotSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn publish(&self, snapshot: &Snapshot) -> Result<(), PublishError> {
        self.published.lock().unwrap().push(snapshot.clone());
        if self.fail {
            return Err(PublishError::Rejected {
                status: 500,
                body: "database unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn boiler_schema() -> Schema {
    Schema::load(&[
        RegisterEntry::new(601, "ext_temperature", "DiematicOneDecimal"),
        RegisterEntry::new(602, "", "raw"),
        RegisterEntry::new(603, "mode_a", "raw"),
        RegisterEntry::bits(617, &["burner", "pump_a", "pump_b"]),
        RegisterEntry::new(701, "water_pressure", "signed_decimal:1"),
        RegisterEntry::new(706, "boiler_temperature", "signed_decimal:1"),
    ])
    .unwrap()
}

fn poller(sink: RecordingSink) -> Poller<RecordingSink> {
    let modbus = ModbusConfig {
        device: Some("/dev/null".to_string()),
        blocks: vec![Block::new(600, 21), Block::new(700, 7)],
        retries: 3,
        ..ModbusConfig::default()
    };
    let assembler = SnapshotAssembler::new(
        "diematic",
        BTreeMap::from([("host".to_string(), "boiler-room".to_string())]),
    );
    Poller::new(Arc::new(boiler_schema()), modbus, assembler, sink)
}

fn controller() -> SimulatedController {
    SimulatedController::new(&[
        (601, 0x8032),
        (602, 0x1234),
        (603, 8),
        (617, 0b101),
        (701, 15),
        (706, 0xFFFF),
    ])
}

#[tokio::test]
async fn test_full_cycle() {
    let poller = poller(RecordingSink::default());
    let reader = controller();
    let disconnected = reader.disconnected.clone();

    let snapshot = poller.cycle(reader).await;

    assert!(*disconnected.lock().unwrap());
    assert_eq!(snapshot.measurement, "diematic");
    assert_eq!(
        snapshot.fields.names().collect::<Vec<_>>(),
        [
            "ext_temperature",
            "mode_a",
            "burner",
            "pump_a",
            "pump_b",
            "water_pressure",
            "boiler_temperature"
        ]
    );
    assert_eq!(
        snapshot.fields.get("ext_temperature"),
        Some(Some(Value::Float(-5.0)))
    );
    assert_eq!(snapshot.fields.get("mode_a"), Some(Some(Value::Integer(8))));
    assert_eq!(snapshot.fields.get("burner"), Some(Some(Value::Bit(1))));
    assert_eq!(snapshot.fields.get("pump_a"), Some(Some(Value::Bit(0))));
    assert_eq!(snapshot.fields.get("pump_b"), Some(Some(Value::Bit(1))));
    assert_eq!(
        snapshot.fields.get("water_pressure"),
        Some(Some(Value::Float(1.5)))
    );
    assert_eq!(snapshot.fields.get("boiler_temperature"), Some(None));

    let published = poller.sink().published.lock().unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0], snapshot);
}

#[tokio::test]
async fn test_unreadable_block_leaves_its_values_unknown() {
    let poller = poller(RecordingSink::default());
    let reader = controller().with_dead_block(700);
    let reads = reader.reads.clone();
    let disconnected = reader.disconnected.clone();

    let snapshot = poller.cycle(reader).await;

    // One read for the first block, three attempts for the dead one.
    assert_eq!(*reads.lock().unwrap(), vec![600, 700, 700, 700]);
    assert!(*disconnected.lock().unwrap());
    assert_eq!(
        snapshot.fields.get("ext_temperature"),
        Some(Some(Value::Float(-5.0)))
    );
    assert_eq!(snapshot.fields.get("water_pressure"), Some(None));
    assert_eq!(snapshot.fields.get("boiler_temperature"), Some(None));
    assert_eq!(poller.sink().published.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_silent_controller_is_still_disconnected() {
    let poller = poller(RecordingSink::default());
    let reader = controller().with_dead_block(600).with_dead_block(700);
    let reads = reader.reads.clone();
    let disconnected = reader.disconnected.clone();

    let snapshot = poller.cycle(reader).await;

    assert_eq!(reads.lock().unwrap().len(), 6);
    assert!(*disconnected.lock().unwrap());
    assert_eq!(snapshot.fields.len(), 7);
    assert_eq!(snapshot.fields.known_count(), 0);
    assert_eq!(snapshot.fields.get("ext_temperature"), Some(None));
    assert_eq!(poller.sink().published.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_publish_failure_still_yields_snapshot() {
    let poller = poller(RecordingSink {
        fail: true,
        ..RecordingSink::default()
    });

    let snapshot = poller.cycle(controller()).await;

    assert_eq!(snapshot.fields.known_count(), 6);
    assert_eq!(poller.sink().published.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_consecutive_cycles_are_independent() {
    let poller = poller(RecordingSink::default());

    let first = poller.cycle(controller()).await;
    let second = poller.cycle(controller().with_dead_block(600)).await;

    assert_eq!(first.fields.get("mode_a"), Some(Some(Value::Integer(8))));
    assert_eq!(second.fields.get("mode_a"), Some(None));
    assert_eq!(
        second.fields.get("water_pressure"),
        Some(Some(Value::Float(1.5)))
    );
    assert!(second.timestamp >= first.timestamp);
}

#[test]
fn test_config_to_snapshot_record() {
    let config = DiematicBridgeConfig::parse(
        r#"{
            modbus: { device: "/dev/ttyUSB0" },
            registers: [
                { id: 601, name: "ext_temperature", type: "DiematicOneDecimal" },
                { id: "", name: "reserved" },
                { id: 617, name: "flags", type: "bits", bits: ["burner", "pump_a"] },
            ],
            publish: { measurement: "boiler", tags: { host: "boiler-room" } },
        }"#,
    )
    .unwrap();

    let schema = config.schema().unwrap();
    assert_eq!(schema.output_names(), ["ext_temperature", "reserved", "burner", "pump_a"]);
    assert_eq!(schema.max_register_id(), Some(617));

    let mut registers = RawRegisterArray::new(schema.register_span());
    registers.fill(601, &[0x012C]);
    registers.fill(617, &[0b01]);

    let assembler = SnapshotAssembler::new(
        config.publish.measurement.clone(),
        config.publish.resolved_tags(),
    );
    let snapshot = assembler.assemble(decode(&schema, &registers), 1_700_000_000_000);

    assert_eq!(
        serde_json::to_value(&snapshot).unwrap(),
        serde_json::json!({
            "measurement": "boiler",
            "tags": { "host": "boiler-room" },
            "timestamp": 1_700_000_000_000i64,
            "fields": {
                "ext_temperature": 30.0,
                "reserved": null,
                "burner": 1,
                "pump_a": 0
            }
        })
    );
}

#[test]
fn test_schema_rejections() {
    let duplicate = Schema::load(&[
        RegisterEntry::new(1, "a", "raw"),
        RegisterEntry::bits(2, &["a"]),
    ]);
    assert!(matches!(duplicate, Err(SchemaError::DuplicateName { .. })));

    let no_bits = Schema::from_json5(r#"[{ id: 3, name: "flags", type: "bits", bits: [] }]"#);
    assert!(matches!(no_bits, Err(SchemaError::EmptyBits { .. })));

    let bad_kind = Schema::from_json5(r#"[{ id: 3, name: "x", type: "float32" }]"#);
    assert!(matches!(bad_kind, Err(SchemaError::UnknownType { .. })));
}
