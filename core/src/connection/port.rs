/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionType {
    Brom,
    Preloader,
    Da,
}

pub const MTK_VID: u16 = 0x0E8D;
pub const BROM_PID: u16 = 0x0003;

/// Accepted (vendor, product) pairs.
/// Only the first one is used on the exploit path, the rest are post-exploit/preloader modes.
pub const KNOWN_PORTS: &[(u16, u16, ConnectionType)] = &[
    (MTK_VID, BROM_PID, ConnectionType::Brom),
    (MTK_VID, 0x2000, ConnectionType::Preloader),
    (MTK_VID, 0x6000, ConnectionType::Preloader),
    (0x1004, 0x6000, ConnectionType::Preloader), // LG
    (0x22D9, 0x0006, ConnectionType::Preloader), // OPPO
    (MTK_VID, 0x2001, ConnectionType::Da),
];

pub fn connection_type_for(vid: u16, pid: u16) -> Option<ConnectionType> {
    KNOWN_PORTS.iter().find(|(v, p, _)| *v == vid && *p == pid).map(|(_, _, ct)| *ct)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortKind {
    Usb,
    Serial,
}

/// A device visible on the host.
///
/// Ordering is by location first, so that the same physical topology
/// always yields the same candidate order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress {
    pub location: String,
    pub kind: PortKind,
    pub vid: u16,
    pub pid: u16,
    pub connection_type: ConnectionType,
}

#[async_trait]
pub trait MTKPort: Send + Debug {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;

    /// Writes as much of `buf` as the port accepts in one go and returns the count.
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Reads up to `buf.len()` bytes.
    /// Returns `TransportError::ReadTimeout` when nothing arrived within `timeout`.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Number of bytes that can be read without blocking.
    async fn pending(&mut self) -> Result<usize>;

    /// Drains OS output buffers.
    async fn flush(&mut self) -> Result<()>;

    async fn set_baudrate(&mut self, baudrate: u32) -> Result<()>;

    async fn ctrl_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<()>;

    async fn ctrl_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
    ) -> Result<Vec<u8>>;

    fn get_connection_type(&self) -> ConnectionType;
    fn get_baudrate(&self) -> u32;
    fn get_port_name(&self) -> String;

    fn is_serial(&self) -> bool {
        false
    }
}

/// Enumerates every supported device currently visible, sorted ascending.
pub async fn detect() -> Vec<DeviceAddress> {
    let mut found = Vec::new();

    #[cfg(feature = "nusb")]
    match crate::connection::backend::UsbMTKPort::detect().await {
        Ok(mut usb) => found.append(&mut usb),
        Err(e) => debug!("USB enumeration failed: {}", e),
    }

    #[cfg(feature = "serial")]
    match crate::connection::backend::SerialMTKPort::detect() {
        Ok(mut serial) => found.append(&mut serial),
        Err(e) => debug!("Serial enumeration failed: {}", e),
    }

    found.sort();
    found.dedup();
    debug!("Detected {} candidate device(s): {:?}", found.len(), found);
    found
}

/// Opens a port for a previously detected address.
pub async fn open_address(address: &DeviceAddress) -> Result<Box<dyn MTKPort>> {
    match address.kind {
        #[cfg(feature = "nusb")]
        PortKind::Usb => {
            let port = crate::connection::backend::UsbMTKPort::from_address(address).await?;
            Ok(Box::new(port))
        }
        #[cfg(feature = "serial")]
        PortKind::Serial => {
            let port = crate::connection::backend::SerialMTKPort::new(
                &address.location,
                address.connection_type,
            );
            Ok(Box::new(port))
        }
        #[allow(unreachable_patterns)]
        _ => Err(crate::error::Error::conn(format!(
            "No backend compiled in for {:?} ports",
            address.kind
        ))),
    }
}

/// Returns the first supported port, if any.
pub async fn find_mtk_port() -> Option<Box<dyn MTKPort>> {
    let first = detect().await.into_iter().next()?;
    match open_address(&first).await {
        Ok(port) => Some(port),
        Err(e) => {
            debug!("Failed to open {}: {}", first.location, e);
            None
        }
    }
}
