/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

use log::{debug, warn};

use crate::connection::port::{ConnectionType, MTKPort};
use crate::error::{Error, Result, TransportError};
use crate::utilities::CancelToken;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Size of a single write. Larger buffers are split.
    pub chunk_size: usize,
    /// How many times a chunk write is attempted before giving up.
    pub write_attempts: u32,
    /// How many per-attempt timeouts a read tolerates before returning what it has.
    pub read_attempts: u32,
    pub read_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            chunk_size: 512,
            write_attempts: 3,
            read_attempts: 10,
            read_timeout: Duration::from_millis(500),
        }
    }
}

/// Raw byte stream over a detected port.
///
/// Transient failures are retried here, so that the link protocol above only sees
/// errors once the local retry budget is gone.
#[derive(Debug)]
pub struct Channel {
    port: Box<dyn MTKPort>,
    config: ChannelConfig,
    cancel: CancelToken,
}

impl Channel {
    pub fn new(port: Box<dyn MTKPort>) -> Self {
        Channel { port, config: ChannelConfig::default(), cancel: CancelToken::new() }
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn port(&mut self) -> &mut dyn MTKPort {
        self.port.as_mut()
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.port.get_connection_type()
    }

    pub fn is_serial(&self) -> bool {
        self.port.is_serial()
    }

    pub async fn open(&mut self) -> Result<()> {
        self.port.open().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.port.close().await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.port.flush().await
    }

    /// Writes `data` in `chunk_size` pieces.
    /// An empty buffer is sent as a zero-length write, retried once.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return self.write_empty().await;
        }

        debug!("[TX] {} bytes: {:02X?}", data.len(), &data[..data.len().min(16)]);

        let chunk_size = self.config.chunk_size.max(1);
        for chunk in data.chunks(chunk_size) {
            self.write_chunk(chunk).await?;
        }

        self.port.flush().await
    }

    async fn write_empty(&mut self) -> Result<()> {
        for attempt in 1..=2 {
            match self.port.write(&[]).await {
                Ok(_) => return Ok(()),
                Err(e) => debug!("Empty write failed (attempt {}): {}", attempt, e),
            }
        }

        Err(TransportError::WriteFailed { attempts: 2 }.into())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let mut pos = 0;
        let mut failures = 0;

        while pos < chunk.len() {
            self.cancel.check()?;

            match self.port.write(&chunk[pos..]).await {
                Ok(0) => {
                    failures += 1;
                    debug!("Port accepted 0 bytes");
                }
                Ok(n) => pos += n,
                Err(e) => {
                    failures += 1;
                    debug!("Chunk write failed ({}/{}): {}", failures, self.config.write_attempts, e);
                }
            }

            if failures >= self.config.write_attempts {
                warn!("Giving up on write after {} attempts", failures);
                return Err(TransportError::WriteFailed { attempts: failures }.into());
            }
        }

        Ok(())
    }

    /// Reads up to `length` bytes, or whatever is buffered when `length` is `None`.
    ///
    /// Timeouts are not errors: after `read_attempts` of them the bytes collected so far
    /// are returned, which may be fewer than requested or none at all.
    pub async fn read(&mut self, length: Option<usize>, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let length = match length {
            Some(len) => len,
            None => self.port.pending().await?,
        };

        if length == 0 {
            return Ok(Vec::new());
        }

        let timeout = timeout.unwrap_or(self.config.read_timeout);
        let mut buf = vec![0u8; length];
        let mut got = 0;
        let mut attempts = 0;

        while got < length {
            self.cancel.check()?;

            match self.port.read(&mut buf[got..], timeout).await {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(Error::Transport(TransportError::ReadTimeout { .. })) => {
                    attempts += 1;
                    debug!("Read timed out ({}/{})", attempts, self.config.read_attempts);
                    if attempts >= self.config.read_attempts {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        buf.truncate(got);
        debug!("[RX] {} bytes: {:02X?}", got, &buf[..got.min(16)]);
        Ok(buf)
    }

    /// Like [`Channel::read`] but a short result is a `ReadTimeout`.
    pub async fn read_exact(&mut self, length: usize) -> Result<Vec<u8>> {
        let data = self.read(Some(length), None).await?;
        if data.len() != length {
            return Err(TransportError::ReadTimeout { expected: length, got: data.len() }.into());
        }
        Ok(data)
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1).await?[0])
    }

    pub async fn read_u16_be(&mut self) -> Result<u16> {
        let b = self.read_exact(2).await?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub async fn read_u16_le(&mut self) -> Result<u16> {
        let b = self.read_exact(2).await?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub async fn read_u32_be(&mut self) -> Result<u32> {
        let b = self.read_exact(4).await?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub async fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        self.port.set_baudrate(baudrate).await
    }

    pub fn baudrate(&self) -> u32 {
        self.port.get_baudrate()
    }

    pub async fn ctrl_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
    ) -> Result<Vec<u8>> {
        self.port.ctrl_in(request_type, request, value, index, len).await
    }

    pub async fn ctrl_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<()> {
        self.port.ctrl_out(request_type, request, value, index, data).await
    }
}
