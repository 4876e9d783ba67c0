//! Zenoh bridge for De Dietrich Diematic boiler controllers.
//!
//! The bridge reads fixed blocks of holding registers over Modbus RTU,
//! decodes them through a configurable register schema and publishes one
//! timestamped snapshot per cycle.
//!
//! # Pipeline
//!
//! ```text
//! transport -> acquisition -> registers -> decode -> snapshot -> sink
//! ```
//!
//! # Key Expressions
//!
//! With the Zenoh backend each snapshot is a single record on:
//!
//! ```text
//! <key_prefix>/<measurement>/snapshot
//! ```

pub mod acquisition;
pub mod config;
pub mod decode;
pub mod poller;
pub mod registers;
pub mod schema;
pub mod sink;
pub mod snapshot;
pub mod transport;
