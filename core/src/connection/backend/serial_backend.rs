/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serialport::{SerialPort, SerialPortType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::connection::port::{
    ConnectionType,
    DeviceAddress,
    MTKPort,
    PortKind,
    connection_type_for,
};
use crate::error::{Error, Result, TransportError};

pub const DEFAULT_BAUDRATE: u32 = 115_200;

pub struct SerialMTKPort {
    path: String,
    stream: Option<SerialStream>,
    baudrate: u32,
    connection_type: ConnectionType,
}

impl fmt::Debug for SerialMTKPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialMTKPort")
            .field("path", &self.path)
            .field("baudrate", &self.baudrate)
            .field("connection_type", &self.connection_type)
            .field("is_open", &self.stream.is_some())
            .finish()
    }
}

impl SerialMTKPort {
    pub fn new(path: &str, connection_type: ConnectionType) -> Self {
        Self {
            path: path.to_string(),
            stream: None,
            baudrate: DEFAULT_BAUDRATE,
            connection_type,
        }
    }

    pub fn detect() -> Result<Vec<DeviceAddress>> {
        let mut found = Vec::new();

        for port in serialport::available_ports()? {
            let SerialPortType::UsbPort(info) = &port.port_type else {
                continue;
            };

            if let Some(connection_type) = connection_type_for(info.vid, info.pid) {
                debug!("Detected {:04X}:{:04X} device at {}", info.vid, info.pid, port.port_name);
                found.push(DeviceAddress {
                    location: port.port_name.clone(),
                    kind: PortKind::Serial,
                    vid: info.vid,
                    pid: info.pid,
                    connection_type,
                });
            }
        }

        Ok(found)
    }

    fn stream(&mut self) -> Result<&mut SerialStream> {
        self.stream.as_mut().ok_or_else(|| Error::io("Serial port is not open"))
    }
}

#[async_trait]
impl MTKPort for SerialMTKPort {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = tokio_serial::new(&self.path, self.baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(500))
            .open_native_async()
            .map_err(|e| Error::conn(format!("Failed to open {}: {}", self.path, e)))?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.stream()?.write(buf).await?;
        Ok(n)
    }

    async fn read(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize> {
        let stream = self.stream()?;

        match timeout(wait, stream.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                Err(TransportError::Overflow.into())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::ReadTimeout { expected: buf.len(), got: 0 }.into()),
        }
    }

    async fn pending(&mut self) -> Result<usize> {
        let n = self.stream()?.bytes_to_read()?;
        Ok(n as usize)
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream()?.flush().await?;
        Ok(())
    }

    async fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        self.stream()?.set_baud_rate(baudrate)?;
        self.baudrate = baudrate;
        debug!("Serial line rate set to {}", baudrate);
        Ok(())
    }

    async fn ctrl_out(&mut self, _: u8, _: u8, _: u16, _: u16, _: &[u8]) -> Result<()> {
        Err(Error::io("Control transfers are not available on serial ports"))
    }

    async fn ctrl_in(&mut self, _: u8, _: u8, _: u16, _: u16, _: usize) -> Result<Vec<u8>> {
        Err(Error::io("Control transfers are not available on serial ports"))
    }

    fn get_connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    fn get_baudrate(&self) -> u32 {
        self.baudrate
    }

    fn get_port_name(&self) -> String {
        self.path.clone()
    }

    fn is_serial(&self) -> bool {
        true
    }
}
