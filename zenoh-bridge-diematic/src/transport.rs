//! Register transport: the "read N registers at address A" capability.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_modbus::client::{Client, Context, Reader};
use tokio_modbus::prelude::*;
use tracing::debug;

use crate::config::ModbusConfig;

/// Error type for a single transport operation. Always recoverable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Exception: {0}")]
    Exception(String),
    #[error("Read timed out after {0:?}")]
    Timeout(Duration),
    #[error("Expected {expected} registers, got {actual}")]
    Length { expected: u16, actual: usize },
}

/// Holding register access on one open connection.
pub trait RegisterReader {
    /// Read `count` holding registers starting at `address`.
    fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, TransportError>> + Send;

    /// Release the connection.
    fn disconnect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Modbus RTU connection over a serial port.
pub struct RtuTransport {
    ctx: Context,
    timeout: Duration,
}

impl RtuTransport {
    /// Open the configured serial port and attach to the controller's unit id.
    pub fn connect(config: &ModbusConfig) -> Result<Self, TransportError> {
        let port = config
            .device
            .as_deref()
            .ok_or_else(|| TransportError::Connection("Modbus device not set".to_string()))?;

        let parity = match config.parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };

        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let builder = tokio_serial::new(port, config.baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits);

        let serial = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| TransportError::Connection(format!("Serial open failed: {}", e)))?;

        debug!(
            "Opened {} at {} baud (unit {})",
            port, config.baud_rate, config.unit
        );

        Ok(Self {
            ctx: rtu::attach_slave(serial, Slave(config.unit)),
            timeout: config.timeout(),
        })
    }
}

impl RegisterReader for RtuTransport {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        tokio::time::timeout(self.timeout, self.ctx.read_holding_registers(address, count))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .map_err(|e| TransportError::Read(e.to_string()))?
            .map_err(|e| TransportError::Exception(format!("{:?}", e)))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.ctx
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }
}
